//! Transparent Mode (TM) Engine
//!
//! No header, no sequence numbers and no segmentation: each SDU is sent as
//! one PDU once a grant large enough for it arrives, and each received PDU is
//! delivered as one SDU.

use crate::config::RlcConfig;
use crate::entity::EntityState;
use crate::stats::RlcStats;
use crate::RlcError;
use bytes::Bytes;
use common::{bytes_to_hex_truncated, Lcid, RlcMode};
use std::collections::VecDeque;
use tracing::{debug, info, trace, warn};

/// TM entity
#[derive(Debug)]
pub struct RlcTm {
    lcid: Lcid,
    state: EntityState,
    tx_sdus: VecDeque<Bytes>,
    rx_sdus: VecDeque<Bytes>,
    stats: RlcStats,
}

impl RlcTm {
    /// Create an unconfigured TM entity
    pub fn new(lcid: Lcid) -> Self {
        Self {
            lcid,
            state: EntityState::Idle,
            tx_sdus: VecDeque::new(),
            rx_sdus: VecDeque::new(),
            stats: RlcStats::default(),
        }
    }

    /// Apply an RRC configuration
    pub fn configure(&mut self, config: &RlcConfig) -> Result<(), RlcError> {
        if config.mode != RlcMode::Tm {
            return Err(RlcError::InvalidConfiguration(format!(
                "{} mode configuration applied to a TM entity",
                config.mode
            )));
        }
        if self.state == EntityState::Idle {
            self.state = EntityState::Configured;
        }
        info!("{} configured in TM mode", self.lcid);
        Ok(())
    }

    /// Discard everything buffered
    pub fn reset(&mut self) {
        self.tx_sdus.clear();
        self.rx_sdus.clear();
        if self.state == EntityState::Active {
            self.state = EntityState::Configured;
        }
    }

    /// Lifecycle state
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Counters
    pub fn stats(&self) -> RlcStats {
        self.stats
    }

    /// Queue an SDU for transmission
    pub fn write_sdu(&mut self, sdu: Bytes) {
        if sdu.is_empty() {
            warn!("{} dropping empty SDU", self.lcid);
            return;
        }
        self.stats.tx_sdus += 1;
        self.stats.tx_sdu_bytes += sdu.len() as u64;
        self.tx_sdus.push_back(sdu);
    }

    /// Drain every received SDU
    pub fn read_sdu(&mut self) -> Vec<Bytes> {
        self.rx_sdus.drain(..).collect()
    }

    /// Size of the SDU at the head of the queue
    pub fn get_buffer_state(&self) -> u32 {
        self.tx_sdus.front().map_or(0, |sdu| sdu.len() as u32)
    }

    /// Copy the head SDU into `payload` if it fits whole
    pub fn read_pdu(&mut self, payload: &mut [u8]) -> usize {
        if self.state == EntityState::Idle {
            return 0;
        }
        let Some(len) = self.tx_sdus.front().map(Bytes::len) else {
            return 0;
        };
        if len > payload.len() {
            debug!("{} TM SDU of {} bytes does not fit {} byte grant", self.lcid, len, payload.len());
            return 0;
        }
        let Some(sdu) = self.tx_sdus.pop_front() else {
            return 0;
        };
        payload[..len].copy_from_slice(&sdu);
        self.state = EntityState::Active;
        self.stats.tx_pdus += 1;
        self.stats.tx_pdu_bytes += len as u64;
        len
    }

    /// Deliver a received PDU as an SDU
    pub fn write_pdu(&mut self, pdu: &[u8]) {
        if self.state == EntityState::Idle || pdu.is_empty() {
            return;
        }
        trace!("{} Rx TM PDU: {}", self.lcid, bytes_to_hex_truncated(pdu, 32));
        self.state = EntityState::Active;
        self.stats.rx_pdus += 1;
        self.stats.rx_pdu_bytes += pdu.len() as u64;
        self.stats.rx_sdus += 1;
        self.stats.rx_sdu_bytes += pdu.len() as u64;
        self.rx_sdus.push_back(Bytes::copy_from_slice(pdu));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transparent_pass_through() {
        let mut tm = RlcTm::new(Lcid(0));
        tm.configure(&RlcConfig::tm()).unwrap();
        tm.write_sdu(Bytes::from_static(b"system information"));
        assert_eq!(tm.get_buffer_state(), 18);

        let mut small = [0u8; 10];
        assert_eq!(tm.read_pdu(&mut small), 0);

        let mut grant = [0u8; 64];
        let n = tm.read_pdu(&mut grant);
        assert_eq!(&grant[..n], b"system information");

        tm.write_pdu(b"ccch");
        assert_eq!(tm.read_sdu(), vec![Bytes::from_static(b"ccch")]);
    }
}
