//! RLC Entity
//!
//! Closed set of RLC modes behind one capability surface, so a logical
//! channel can be driven without knowing which mode it was configured in.

use crate::am::RlcAm;
use crate::config::RlcConfig;
use crate::stats::RlcStats;
use crate::timer::{TimerId, TimerSender};
use crate::tm::RlcTm;
use crate::um::RlcUm;
use crate::RlcError;
use bytes::Bytes;
use common::{Lcid, RlcMode};

/// Lifecycle of an RLC entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Created, not configured yet
    Idle,
    /// Configured, no traffic yet
    Configured,
    /// Carrying traffic
    Active,
    /// AM only: maximum retransmissions reached, waiting for reset
    LinkFailed,
}

/// An RLC entity in one of the three modes
#[derive(Debug)]
pub enum RlcEntity {
    Tm(RlcTm),
    Um(RlcUm),
    Am(RlcAm),
}

impl RlcEntity {
    /// Create an unconfigured entity of the given mode
    pub fn new(lcid: Lcid, mode: RlcMode) -> Self {
        match mode {
            RlcMode::Tm => RlcEntity::Tm(RlcTm::new(lcid)),
            RlcMode::Um => RlcEntity::Um(RlcUm::new(lcid)),
            RlcMode::Am => RlcEntity::Am(RlcAm::new(lcid)),
        }
    }

    /// Operating mode
    pub fn mode(&self) -> RlcMode {
        match self {
            RlcEntity::Tm(_) => RlcMode::Tm,
            RlcEntity::Um(_) => RlcMode::Um,
            RlcEntity::Am(_) => RlcMode::Am,
        }
    }

    /// Lifecycle state
    pub fn state(&self) -> EntityState {
        match self {
            RlcEntity::Tm(tm) => tm.state(),
            RlcEntity::Um(um) => um.state(),
            RlcEntity::Am(am) => am.state(),
        }
    }

    /// Counters
    pub fn stats(&self) -> RlcStats {
        match self {
            RlcEntity::Tm(tm) => tm.stats(),
            RlcEntity::Um(um) => um.stats(),
            RlcEntity::Am(am) => am.stats(),
        }
    }

    /// Route timer requests to a timer service
    pub fn attach_timers(&mut self, requests: TimerSender) {
        match self {
            RlcEntity::Tm(_) => {}
            RlcEntity::Um(um) => um.attach_timers(requests),
            RlcEntity::Am(am) => am.attach_timers(requests),
        }
    }

    /// Apply an RRC configuration of the same mode
    pub fn configure(&mut self, config: &RlcConfig) -> Result<(), RlcError> {
        match self {
            RlcEntity::Tm(tm) => tm.configure(config),
            RlcEntity::Um(um) => um.configure(config),
            RlcEntity::Am(am) => am.configure(config),
        }
    }

    /// Re-establish the entity
    pub fn reset(&mut self) {
        match self {
            RlcEntity::Tm(tm) => tm.reset(),
            RlcEntity::Um(um) => um.reset(),
            RlcEntity::Am(am) => am.reset(),
        }
    }

    /// Queue an SDU for transmission
    pub fn write_sdu(&mut self, sdu: Bytes) {
        match self {
            RlcEntity::Tm(tm) => tm.write_sdu(sdu),
            RlcEntity::Um(um) => um.write_sdu(sdu),
            RlcEntity::Am(am) => am.write_sdu(sdu),
        }
    }

    /// Drain reassembled SDUs
    pub fn read_sdu(&mut self) -> Vec<Bytes> {
        match self {
            RlcEntity::Tm(tm) => tm.read_sdu(),
            RlcEntity::Um(um) => um.read_sdu(),
            RlcEntity::Am(am) => am.read_sdu(),
        }
    }

    /// Bytes the scheduler should grant to empty the entity
    pub fn get_buffer_state(&self) -> u32 {
        match self {
            RlcEntity::Tm(tm) => tm.get_buffer_state(),
            RlcEntity::Um(um) => um.get_buffer_state(),
            RlcEntity::Am(am) => am.get_buffer_state(),
        }
    }

    /// Build one PDU into `payload`
    pub fn read_pdu(&mut self, payload: &mut [u8]) -> usize {
        match self {
            RlcEntity::Tm(tm) => tm.read_pdu(payload),
            RlcEntity::Um(um) => um.read_pdu(payload),
            RlcEntity::Am(am) => am.read_pdu(payload),
        }
    }

    /// Handle a received PDU
    pub fn write_pdu(&mut self, pdu: &[u8]) {
        match self {
            RlcEntity::Tm(tm) => tm.write_pdu(pdu),
            RlcEntity::Um(um) => um.write_pdu(pdu),
            RlcEntity::Am(am) => am.write_pdu(pdu),
        }
    }

    /// Handle a timer expiry
    pub fn timer_expired(&mut self, timer: TimerId, generation: u64) {
        match self {
            RlcEntity::Tm(_) => {}
            RlcEntity::Um(um) => um.timer_expired(timer, generation),
            RlcEntity::Am(am) => am.timer_expired(timer, generation),
        }
    }

    /// Take the pending radio link failure indication, if any
    pub fn take_radio_link_failure(&mut self) -> bool {
        match self {
            RlcEntity::Am(am) => am.take_radio_link_failure(),
            _ => false,
        }
    }
}
