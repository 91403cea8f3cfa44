//! Unacknowledged Mode (UM) Engine
//!
//! Implements the UM entity of 3GPP TS 36.322 section 5.1.2: segmentation
//! and concatenation on transmit, reordering, duplicate detection and
//! reassembly on receive, with a single t-Reordering timer.

use crate::config::RlcConfig;
use crate::entity::EntityState;
use crate::header::{um_packed_length, FramingInfo, UmdPduHeader};
use crate::segment::SduQueue;
use crate::sn::SnSpace;
use crate::stats::RlcStats;
use crate::timer::{RlcTimer, TimerId, TimerSender};
use crate::RlcError;
use bytes::{Bytes, BytesMut};
use common::{bytes_to_hex_truncated, Lcid, PduBuffer, RlcMode, SnFieldLength};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, trace, warn};

/// A received UMD PDU with its header stripped from the buffer view
#[derive(Debug)]
struct UmdRxPdu {
    header: UmdPduHeader,
    payload: PduBuffer,
}

/// Receive-side reassembly shared by the UM and AM engines
#[derive(Debug, Default)]
pub(crate) struct Reassembler {
    /// SDU under reassembly; `None` until a segment that starts an SDU arrives
    partial: Option<BytesMut>,
    /// Reassembled SDUs awaiting the upper layer
    delivered: VecDeque<Bytes>,
}

impl Reassembler {
    /// Feed the data field of one in-sequence PDU. Segments are sliced out
    /// of the frozen payload; only SDUs spanning PDUs are copied.
    pub(crate) fn push_pdu(
        &mut self,
        lcid: Lcid,
        sn: u16,
        fi: FramingInfo,
        li: &[u16],
        payload: PduBuffer,
        stats: &mut RlcStats,
    ) {
        let mut payload = payload.freeze();
        let n_segments = li.len() + 1;
        for i in 0..n_segments {
            let segment = if i < li.len() {
                let len = li[i] as usize;
                if len > payload.len() {
                    warn!("{} SN {} length indicator {} overruns {} remaining bytes",
                          lcid, sn, len, payload.len());
                    self.partial = None;
                    return;
                }
                payload.split_to(len)
            } else {
                std::mem::take(&mut payload)
            };

            let starts_sdu = i > 0 || fi.start_aligned();
            let ends_sdu = i + 1 < n_segments || fi.end_aligned();

            if starts_sdu {
                if let Some(stale) = self.partial.take() {
                    debug!("{} discarding incomplete SDU of {} bytes", lcid, stale.len());
                }
                if ends_sdu {
                    self.deliver(segment, stats);
                    continue;
                }
                self.partial = Some(BytesMut::with_capacity(segment.len()));
            }

            match self.partial.as_mut() {
                Some(sdu) => sdu.extend_from_slice(&segment),
                None => {
                    debug!("{} SN {} dropping {} byte segment of an SDU whose head was lost",
                           lcid, sn, segment.len());
                    continue;
                }
            }

            if ends_sdu {
                if let Some(sdu) = self.partial.take() {
                    self.deliver(sdu.freeze(), stats);
                }
            }
        }
    }

    fn deliver(&mut self, sdu: Bytes, stats: &mut RlcStats) {
        stats.rx_sdus += 1;
        stats.rx_sdu_bytes += sdu.len() as u64;
        self.delivered.push_back(sdu);
    }

    /// Forget the SDU under reassembly after a PDU was lost
    pub(crate) fn discard_partial(&mut self) {
        self.partial = None;
    }

    /// Drain every reassembled SDU
    pub(crate) fn drain(&mut self) -> Vec<Bytes> {
        self.delivered.drain(..).collect()
    }

    /// Number of SDUs ready for the upper layer
    pub(crate) fn ready(&self) -> usize {
        self.delivered.len()
    }

    pub(crate) fn clear(&mut self) {
        self.partial = None;
        self.delivered.clear();
    }
}

/// UM entity
#[derive(Debug)]
pub struct RlcUm {
    lcid: Lcid,
    state: EntityState,
    sn_size: SnFieldLength,
    space: SnSpace,

    // TX
    tx_sdus: SduQueue,
    /// VT(US): SN to assign to the next UMD PDU
    vt_us: u16,

    // RX
    rx_window: HashMap<u16, UmdRxPdu>,
    reassembler: Reassembler,
    /// VR(UR): earliest SN still considered for reordering
    vr_ur: u16,
    /// VR(UX): SN following the PDU that triggered t-Reordering
    vr_ux: u16,
    /// VR(UH): SN following the highest received SN
    vr_uh: u16,
    reordering_timer: RlcTimer,

    stats: RlcStats,
}

impl RlcUm {
    /// Create an unconfigured UM entity
    pub fn new(lcid: Lcid) -> Self {
        let sn_size = SnFieldLength::Bits10;
        Self {
            lcid,
            state: EntityState::Idle,
            sn_size,
            space: SnSpace::new(sn_size, sn_size.default_window()),
            tx_sdus: SduQueue::new(),
            vt_us: 0,
            rx_window: HashMap::new(),
            reassembler: Reassembler::default(),
            vr_ur: 0,
            vr_ux: 0,
            vr_uh: 0,
            reordering_timer: RlcTimer::new(lcid, TimerId::Reordering),
            stats: RlcStats::default(),
        }
    }

    /// Route timer requests to a timer service
    pub fn attach_timers(&mut self, requests: TimerSender) {
        self.reordering_timer.attach(requests);
    }

    /// Apply an RRC configuration. On error the entity is left untouched.
    pub fn configure(&mut self, config: &RlcConfig) -> Result<(), RlcError> {
        if config.mode != RlcMode::Um {
            return Err(RlcError::InvalidConfiguration(format!(
                "{} mode configuration applied to a UM entity",
                config.mode
            )));
        }
        config.validate()?;

        let space = SnSpace::new(config.sn_field_length, config.window());
        if self.state != EntityState::Idle && space != self.space {
            debug!("{} SN space changed, resetting state variables", self.lcid);
            self.reset_state();
        }
        self.sn_size = config.sn_field_length;
        self.space = space;
        self.reordering_timer.set_duration(config.t_reordering());
        if self.state == EntityState::Idle {
            self.state = EntityState::Configured;
        }

        info!("{} configured in UM mode: t_reordering={} ms, sn_field_length={} bits, window={}",
              self.lcid, config.t_reordering_ms, self.sn_size.bits(), self.space.window());
        Ok(())
    }

    /// Re-establish the entity, discarding every buffered SDU and PDU
    pub fn reset(&mut self) {
        info!("{} UM entity re-established", self.lcid);
        self.reset_state();
        if self.state == EntityState::Active {
            self.state = EntityState::Configured;
        }
    }

    fn reset_state(&mut self) {
        self.tx_sdus.clear();
        self.vt_us = 0;
        self.rx_window.clear();
        self.reassembler.clear();
        self.vr_ur = 0;
        self.vr_ux = 0;
        self.vr_uh = 0;
        self.reordering_timer.stop();
    }

    /// Logical channel
    pub fn lcid(&self) -> Lcid {
        self.lcid
    }

    /// Lifecycle state
    pub fn state(&self) -> EntityState {
        self.state
    }

    /// Counters
    pub fn stats(&self) -> RlcStats {
        self.stats
    }

    /// Whether t-Reordering is armed
    pub fn reordering_timer_running(&self) -> bool {
        self.reordering_timer.is_running()
    }

    /// Generation of the armed t-Reordering
    pub fn reordering_timer_generation(&self) -> u64 {
        self.reordering_timer.generation()
    }

    /// Number of PDUs held in the receive window
    pub fn rx_window_len(&self) -> usize {
        self.rx_window.len()
    }

    /*************************************************************************
     * Upper layer interface
     ************************************************************************/

    /// Queue an SDU for transmission
    pub fn write_sdu(&mut self, sdu: Bytes) {
        if sdu.is_empty() {
            warn!("{} dropping empty SDU", self.lcid);
            return;
        }
        trace!("{} Tx SDU: {}", self.lcid, bytes_to_hex_truncated(&sdu, 32));
        self.stats.tx_sdus += 1;
        self.stats.tx_sdu_bytes += sdu.len() as u64;
        self.tx_sdus.push(sdu);
    }

    /// Drain every reassembled SDU
    pub fn read_sdu(&mut self) -> Vec<Bytes> {
        self.reassembler.drain()
    }

    /// Number of reassembled SDUs waiting to be read
    pub fn sdus_ready(&self) -> usize {
        self.reassembler.ready()
    }

    /*************************************************************************
     * Lower layer interface
     ************************************************************************/

    /// Bytes needed to empty the transmit queue
    pub fn get_buffer_state(&self) -> u32 {
        self.tx_sdus.buffer_state(self.sn_size.fixed_header_len())
    }

    /// Build one UMD PDU into `payload`, returning its length
    pub fn read_pdu(&mut self, payload: &mut [u8]) -> usize {
        if self.state == EntityState::Idle {
            return 0;
        }
        debug!("{} MAC opportunity - {} bytes", self.lcid, payload.len());

        if self.tx_sdus.is_empty() {
            debug!("{} no data available to be sent", self.lcid);
            return 0;
        }

        let sn_size = self.sn_size;
        let head_len = um_packed_length(sn_size, 0);
        let Some(mut segments) = self.tx_sdus.build(payload.len(), |n| um_packed_length(sn_size, n)) else {
            warn!("{} cannot build a PDU - {} bytes available, {} bytes required for header",
                  self.lcid, payload.len(), head_len);
            return 0;
        };

        let header = UmdPduHeader {
            fi: segments.fi,
            sn: self.vt_us,
            sn_size,
            li: segments.li,
        };
        if let Err(e) = header.write(&mut segments.pdu) {
            warn!("{} failed to write UMD header: {}", self.lcid, e);
            return 0;
        }
        self.vt_us = self.space.inc(self.vt_us);
        self.state = EntityState::Active;

        let pdu = segments.pdu.as_slice();
        payload[..pdu.len()].copy_from_slice(pdu);
        self.stats.tx_pdus += 1;
        self.stats.tx_pdu_bytes += pdu.len() as u64;
        debug!("{} Tx UMD PDU SN {} ({} bytes, {} LIs, FI {:?})",
               self.lcid, header.sn, pdu.len(), header.li.len(), header.fi);
        self.debug_state();
        pdu.len()
    }

    /// Handle a received UMD PDU
    pub fn write_pdu(&mut self, pdu: &[u8]) {
        if self.state == EntityState::Idle {
            debug!("{} not configured, discarding {} byte PDU", self.lcid, pdu.len());
            return;
        }
        self.state = EntityState::Active;
        self.stats.rx_pdus += 1;
        self.stats.rx_pdu_bytes += pdu.len() as u64;

        let (header, header_len) = match UmdPduHeader::read(pdu, self.sn_size) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("{} discarding PDU: {}", self.lcid, e);
                self.stats.rx_discarded_malformed += 1;
                return;
            }
        };
        let sn = header.sn;
        trace!("{} Rx data PDU SN {}: {}", self.lcid, sn, bytes_to_hex_truncated(pdu, 32));

        let window_base = self.space.sub(self.vr_uh, self.space.window());
        if self.space.in_range(sn, window_base, self.vr_ur) {
            debug!("{} SN {} outside rx window [{}:{}] - discarding",
                   self.lcid, sn, self.vr_ur, self.vr_uh);
            self.stats.rx_discarded_out_of_window += 1;
            return;
        }
        if self.rx_window.contains_key(&sn) {
            debug!("{} discarding duplicate SN {}", self.lcid, sn);
            self.stats.rx_discarded_duplicate += 1;
            return;
        }

        let mut payload = PduBuffer::from_slice(pdu);
        if let Err(e) = payload.advance(header_len) {
            debug!("{} discarding PDU: {}", self.lcid, e);
            self.stats.rx_discarded_malformed += 1;
            return;
        }
        self.rx_window.insert(sn, UmdRxPdu { header, payload });

        if !self.inside_reordering_window(sn) {
            self.vr_uh = self.space.inc(sn);
        }

        self.reassemble_rx_sdus();

        if self.reordering_timer.is_running() {
            let base = self.reordering_base();
            if self.space.le(self.vr_ux, self.vr_ur, base)
                || (!self.inside_reordering_window(self.vr_ux) && self.vr_ux != self.vr_uh)
            {
                self.reordering_timer.stop();
            }
        }
        if !self.reordering_timer.is_running() {
            let base = self.reordering_base();
            if self.space.lt(self.vr_ur, self.vr_uh, base) {
                self.reordering_timer.start();
                self.vr_ux = self.vr_uh;
            }
        }

        self.debug_state();
    }

    /*************************************************************************
     * Timer interface
     ************************************************************************/

    /// Handle a timer expiry posted by the timer service
    pub fn timer_expired(&mut self, timer: TimerId, generation: u64) {
        if timer != TimerId::Reordering || !self.reordering_timer.expire(generation) {
            return;
        }

        debug!("{} reordering timeout expiry - updating VR(UR)", self.lcid);

        // Everything before VR(UX) that is still missing is lost
        self.reassembler.discard_partial();
        while self.vr_ur != self.vr_ux {
            self.take_rx_pdu(self.vr_ur);
            self.vr_ur = self.space.inc(self.vr_ur);
        }
        while self.rx_window.contains_key(&self.vr_ur) {
            self.take_rx_pdu(self.vr_ur);
            self.vr_ur = self.space.inc(self.vr_ur);
        }

        let base = self.reordering_base();
        if self.space.lt(self.vr_ur, self.vr_uh, base) {
            self.reordering_timer.start();
            self.vr_ux = self.vr_uh;
        }

        self.debug_state();
    }

    /*************************************************************************
     * Helpers
     ************************************************************************/

    fn reordering_base(&self) -> u16 {
        self.space.sub(self.vr_uh, self.space.window())
    }

    /// `VR(UH) - window <= sn < VR(UH)`
    fn inside_reordering_window(&self, sn: u16) -> bool {
        self.space.in_range(sn, self.reordering_base(), self.vr_uh)
    }

    /// Reassemble the PDU at `sn` if present, otherwise declare it lost
    fn take_rx_pdu(&mut self, sn: u16) {
        match self.rx_window.remove(&sn) {
            Some(pdu) => {
                let UmdRxPdu { header, payload } = pdu;
                self.reassembler
                    .push_pdu(self.lcid, sn, header.fi, &header.li, payload, &mut self.stats);
            }
            None => {
                debug!("{} SN {} lost", self.lcid, sn);
                self.stats.rx_lost_pdus += 1;
                self.reassembler.discard_partial();
            }
        }
    }

    fn reassemble_rx_sdus(&mut self) {
        // Catch up with the lower edge of the reordering window
        while self.vr_ur != self.vr_uh && !self.inside_reordering_window(self.vr_ur) {
            self.take_rx_pdu(self.vr_ur);
            self.vr_ur = self.space.inc(self.vr_ur);
        }

        // Then advance VR(UR) up to the first SN not yet received
        while self.rx_window.contains_key(&self.vr_ur) {
            self.take_rx_pdu(self.vr_ur);
            self.vr_ur = self.space.inc(self.vr_ur);
        }
    }

    fn debug_state(&self) {
        debug!("{} vt_us = {}, vr_ur = {}, vr_ux = {}, vr_uh = {}",
               self.lcid, self.vt_us, self.vr_ur, self.vr_ux, self.vr_uh);
    }
}
