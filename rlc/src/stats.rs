//! RLC Statistics
//!
//! Per-instance counters. Engines are always accessed under their instance
//! lock, so plain integers suffice.

use serde::Serialize;
use std::ops::AddAssign;

/// Counters kept by each RLC engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RlcStats {
    /// SDUs accepted from the upper layer
    pub tx_sdus: u64,
    /// SDU bytes accepted from the upper layer
    pub tx_sdu_bytes: u64,
    /// Data PDUs built, first transmissions only
    pub tx_pdus: u64,
    /// Bytes handed to the lower layer, all PDU types
    pub tx_pdu_bytes: u64,
    /// Data PDU retransmissions
    pub tx_retx_pdus: u64,
    /// Status PDUs sent
    pub tx_status_pdus: u64,
    /// PDUs received from the lower layer
    pub rx_pdus: u64,
    /// PDU bytes received from the lower layer
    pub rx_pdu_bytes: u64,
    /// Status PDUs received
    pub rx_status_pdus: u64,
    /// SDUs reassembled for the upper layer
    pub rx_sdus: u64,
    /// SDU bytes reassembled for the upper layer
    pub rx_sdu_bytes: u64,
    /// Received PDUs discarded as outside the window
    pub rx_discarded_out_of_window: u64,
    /// Received PDUs discarded as duplicates
    pub rx_discarded_duplicate: u64,
    /// Received PDUs discarded as undecodable
    pub rx_discarded_malformed: u64,
    /// Sequence numbers given up as lost on t-Reordering expiry
    pub rx_lost_pdus: u64,
}

impl AddAssign for RlcStats {
    fn add_assign(&mut self, other: Self) {
        self.tx_sdus += other.tx_sdus;
        self.tx_sdu_bytes += other.tx_sdu_bytes;
        self.tx_pdus += other.tx_pdus;
        self.tx_pdu_bytes += other.tx_pdu_bytes;
        self.tx_retx_pdus += other.tx_retx_pdus;
        self.tx_status_pdus += other.tx_status_pdus;
        self.rx_pdus += other.rx_pdus;
        self.rx_pdu_bytes += other.rx_pdu_bytes;
        self.rx_status_pdus += other.rx_status_pdus;
        self.rx_sdus += other.rx_sdus;
        self.rx_sdu_bytes += other.rx_sdu_bytes;
        self.rx_discarded_out_of_window += other.rx_discarded_out_of_window;
        self.rx_discarded_duplicate += other.rx_discarded_duplicate;
        self.rx_discarded_malformed += other.rx_discarded_malformed;
        self.rx_lost_pdus += other.rx_lost_pdus;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate() {
        let mut total = RlcStats::default();
        total += RlcStats { tx_sdus: 2, rx_lost_pdus: 1, ..Default::default() };
        total += RlcStats { tx_sdus: 3, ..Default::default() };
        assert_eq!(total.tx_sdus, 5);
        assert_eq!(total.rx_lost_pdus, 1);
    }
}
