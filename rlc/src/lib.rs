//! Radio Link Control (RLC) Layer Library
//!
//! Implements the LTE RLC layer according to 3GPP TS 36.322: header codec,
//! sequence number arithmetic, the transparent, unacknowledged and
//! acknowledged mode engines, their timers, and a per-logical-channel
//! manager that serializes access to each engine instance.

pub mod am;
pub mod config;
pub mod entity;
pub mod header;
pub mod manager;
pub mod segment;
pub mod sn;
pub mod stats;
pub mod timer;
pub mod tm;
pub mod um;

pub use am::RlcAm;
pub use config::RlcConfig;
pub use entity::{EntityState, RlcEntity};
pub use header::{AmdPduHeader, FramingInfo, StatusPdu, UmdPduHeader};
pub use manager::{ChannelUpper, Rlc, RlcIndication, RlcUpperInterface};
pub use sn::SnSpace;
pub use stats::RlcStats;
pub use timer::{RlcTimer, TimerExpiry, TimerId, TimerRequest, TimerService};
pub use tm::RlcTm;
pub use um::RlcUm;

use common::{BufferError, Lcid};
use thiserror::Error;

/// RLC errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RlcError {
    #[error("Malformed PDU: {0}")]
    MalformedPdu(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Unknown bearer {0}")]
    UnknownBearer(Lcid),

    #[error("Bearer {0} already exists")]
    BearerExists(Lcid),

    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),
}
