//! RLC Bearer Configuration
//!
//! Parameters delivered by RRC at bearer setup and reconfiguration
//! (3GPP TS 36.322 section 7 and TS 36.331 RLC-Config).

use crate::RlcError;
use common::{RlcMode, SnFieldLength};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// RLC layer configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RlcConfig {
    /// Operating mode
    pub mode: RlcMode,
    /// SN field length in bits (AM requires 10)
    #[serde(default = "default_sn_field_length")]
    pub sn_field_length: SnFieldLength,
    /// Window size; half the SN space when absent
    #[serde(default)]
    pub window_size: Option<u16>,
    /// t-Reordering in ms
    #[serde(default = "default_t_reordering")]
    pub t_reordering_ms: u32,
    /// t-PollRetransmit in ms
    #[serde(default = "default_t_poll_retx")]
    pub t_poll_retx_ms: u32,
    /// Poll PDU trigger threshold, 0 for infinity
    #[serde(default = "default_poll_pdu")]
    pub poll_pdu: u32,
    /// Poll byte trigger threshold in bytes, 0 for infinity
    #[serde(default = "default_poll_byte")]
    pub poll_byte: u32,
    /// Retransmissions allowed per PDU before radio link failure
    #[serde(default = "default_max_retx_thresh")]
    pub max_retx_thresh: u32,
    /// t-StatusProhibit in ms, 0 disables it
    #[serde(default)]
    pub t_status_prohibit_ms: u32,
}

fn default_sn_field_length() -> SnFieldLength {
    SnFieldLength::Bits10
}

fn default_t_reordering() -> u32 {
    35
}

fn default_t_poll_retx() -> u32 {
    45
}

fn default_poll_pdu() -> u32 {
    4
}

fn default_poll_byte() -> u32 {
    25_000
}

fn default_max_retx_thresh() -> u32 {
    4
}

impl RlcConfig {
    /// Transparent mode bearer
    pub fn tm() -> Self {
        Self {
            mode: RlcMode::Tm,
            ..Self::am()
        }
    }

    /// Unacknowledged mode bearer with default timers
    pub fn um(sn_field_length: SnFieldLength) -> Self {
        Self {
            mode: RlcMode::Um,
            sn_field_length,
            ..Self::am()
        }
    }

    /// Acknowledged mode bearer with default timers and thresholds
    pub fn am() -> Self {
        Self {
            mode: RlcMode::Am,
            sn_field_length: default_sn_field_length(),
            window_size: None,
            t_reordering_ms: default_t_reordering(),
            t_poll_retx_ms: default_t_poll_retx(),
            poll_pdu: default_poll_pdu(),
            poll_byte: default_poll_byte(),
            max_retx_thresh: default_max_retx_thresh(),
            t_status_prohibit_ms: 0,
        }
    }

    /// Effective window size
    pub fn window(&self) -> u16 {
        self.window_size
            .unwrap_or_else(|| self.sn_field_length.default_window())
    }

    /// t-Reordering
    pub fn t_reordering(&self) -> Duration {
        Duration::from_millis(self.t_reordering_ms as u64)
    }

    /// t-PollRetransmit
    pub fn t_poll_retx(&self) -> Duration {
        Duration::from_millis(self.t_poll_retx_ms as u64)
    }

    /// t-StatusProhibit
    pub fn t_status_prohibit(&self) -> Duration {
        Duration::from_millis(self.t_status_prohibit_ms as u64)
    }

    /// Validate the combination of parameters
    pub fn validate(&self) -> Result<(), RlcError> {
        if self.mode == RlcMode::Tm {
            return Ok(());
        }

        if self.mode == RlcMode::Am && self.sn_field_length != SnFieldLength::Bits10 {
            return Err(RlcError::InvalidConfiguration(format!(
                "AM requires a 10-bit SN, got {} bits",
                self.sn_field_length.bits()
            )));
        }

        let window = self.window();
        let max_window = self.sn_field_length.modulus() / 2;
        if window == 0 || window > max_window {
            return Err(RlcError::InvalidConfiguration(format!(
                "window size {} outside 1..={} for a {}-bit SN",
                window,
                max_window,
                self.sn_field_length.bits()
            )));
        }

        if self.mode == RlcMode::Am {
            if self.max_retx_thresh == 0 {
                return Err(RlcError::InvalidConfiguration(
                    "max_retx_thresh must be at least 1".to_string(),
                ));
            }
            if self.t_poll_retx_ms == 0 {
                return Err(RlcError::InvalidConfiguration(
                    "t_poll_retx_ms must be non-zero".to_string(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for RlcConfig {
    fn default() -> Self {
        Self::am()
    }
}
