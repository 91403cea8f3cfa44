//! Acknowledged Mode (AM) Engine
//!
//! Implements the AM entity of 3GPP TS 36.322 section 5.1.3 with whole-PDU
//! ARQ. The transmit side keeps every sent AMD PDU until a STATUS PDU
//! acknowledges it, retransmits negatively acknowledged PDUs and polls the
//! peer for status. The receive side reorders, reassembles and reports the
//! missing sequence numbers.
//!
//! Timers: t-PollRetransmit (transmit), t-Reordering and t-StatusProhibit
//! (receive).

use crate::config::RlcConfig;
use crate::entity::EntityState;
use crate::header::{am_packed_length, is_control_pdu, AmdPduHeader, StatusPdu, AMD_FIXED_HEADER_LEN};
use crate::segment::SduQueue;
use crate::sn::SnSpace;
use crate::stats::RlcStats;
use crate::timer::{RlcTimer, TimerId, TimerSender};
use crate::um::Reassembler;
use crate::RlcError;
use bytes::Bytes;
use common::{bytes_to_hex_truncated, Lcid, PduBuffer, RlcMode, SnFieldLength, PDU_HEADROOM};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, error, info, trace, warn};

/// A sent AMD PDU kept until acknowledged
#[derive(Debug)]
struct AmdTxPdu {
    header: AmdPduHeader,
    /// Data field, header excluded
    payload: Bytes,
    retx_count: u32,
}

/// A received AMD PDU with its header stripped from the buffer view
#[derive(Debug)]
struct AmdRxPdu {
    header: AmdPduHeader,
    payload: PduBuffer,
}

/// AM entity
#[derive(Debug)]
pub struct RlcAm {
    lcid: Lcid,
    state: EntityState,
    space: SnSpace,

    // Configuration
    poll_pdu: u32,
    poll_byte: u32,
    max_retx_thresh: u32,

    // TX
    tx_sdus: SduQueue,
    tx_window: HashMap<u16, AmdTxPdu>,
    retx_queue: VecDeque<u16>,
    /// VT(A): oldest SN not yet acknowledged, lower edge of the tx window
    vt_a: u16,
    /// VT(S): SN to assign to the next new AMD PDU
    vt_s: u16,
    /// POLL_SN: VT(S) - 1 when the last poll was sent
    poll_sn: u16,
    pdu_without_poll: u32,
    byte_without_poll: u32,
    /// Set on t-PollRetransmit expiry, cleared by the next poll
    poll_owed: bool,
    /// Radio link failure raised but not yet taken by the owner
    link_failure: bool,
    poll_retx_timer: RlcTimer,

    // RX
    rx_window: HashMap<u16, AmdRxPdu>,
    reassembler: Reassembler,
    /// VR(R): earliest SN not yet received in sequence, lower edge of the rx window
    vr_r: u16,
    /// VR(X): SN following the PDU that triggered t-Reordering
    vr_x: u16,
    /// VR(MS): highest value usable as ACK_SN
    vr_ms: u16,
    /// VR(H): SN following the highest received SN
    vr_h: u16,
    do_status: bool,
    /// Send the next status even while t-StatusProhibit runs
    status_override: bool,
    reordering_timer: RlcTimer,
    status_prohibit_timer: RlcTimer,

    stats: RlcStats,
}

impl RlcAm {
    /// Create an unconfigured AM entity
    pub fn new(lcid: Lcid) -> Self {
        let sn_size = SnFieldLength::Bits10;
        let defaults = RlcConfig::am();
        Self {
            lcid,
            state: EntityState::Idle,
            space: SnSpace::new(sn_size, sn_size.default_window()),
            poll_pdu: defaults.poll_pdu,
            poll_byte: defaults.poll_byte,
            max_retx_thresh: defaults.max_retx_thresh,
            tx_sdus: SduQueue::new(),
            tx_window: HashMap::new(),
            retx_queue: VecDeque::new(),
            vt_a: 0,
            vt_s: 0,
            poll_sn: 0,
            pdu_without_poll: 0,
            byte_without_poll: 0,
            poll_owed: false,
            link_failure: false,
            poll_retx_timer: RlcTimer::new(lcid, TimerId::PollRetransmit),
            rx_window: HashMap::new(),
            reassembler: Reassembler::default(),
            vr_r: 0,
            vr_x: 0,
            vr_ms: 0,
            vr_h: 0,
            do_status: false,
            status_override: false,
            reordering_timer: RlcTimer::new(lcid, TimerId::Reordering),
            status_prohibit_timer: RlcTimer::new(lcid, TimerId::StatusProhibit),
            stats: RlcStats::default(),
        }
    }

    /// Route timer requests to a timer service
    pub fn attach_timers(&mut self, requests: TimerSender) {
        self.poll_retx_timer.attach(requests.clone());
        self.reordering_timer.attach(requests.clone());
        self.status_prohibit_timer.attach(requests);
    }

    /// Apply an RRC configuration. On error the entity is left untouched.
    pub fn configure(&mut self, config: &RlcConfig) -> Result<(), RlcError> {
        if config.mode != RlcMode::Am {
            return Err(RlcError::InvalidConfiguration(format!(
                "{} mode configuration applied to an AM entity",
                config.mode
            )));
        }
        config.validate()?;

        let space = SnSpace::new(config.sn_field_length, config.window());
        if self.state == EntityState::LinkFailed || (self.state != EntityState::Idle && space != self.space) {
            debug!("{} resetting state variables on reconfiguration", self.lcid);
            self.reset_state();
        }
        self.space = space;
        self.poll_pdu = config.poll_pdu;
        self.poll_byte = config.poll_byte;
        self.max_retx_thresh = config.max_retx_thresh;
        self.poll_retx_timer.set_duration(config.t_poll_retx());
        self.reordering_timer.set_duration(config.t_reordering());
        self.status_prohibit_timer.set_duration(config.t_status_prohibit());
        if matches!(self.state, EntityState::Idle | EntityState::LinkFailed) {
            self.state = EntityState::Configured;
        }

        info!("{} configured in AM mode: t_poll_retx={} ms, poll_pdu={}, poll_byte={}, max_retx_thresh={}, \
               t_reordering={} ms, t_status_prohibit={} ms, window={}",
              self.lcid, config.t_poll_retx_ms, self.poll_pdu, self.poll_byte, self.max_retx_thresh,
              config.t_reordering_ms, config.t_status_prohibit_ms, self.space.window());
        Ok(())
    }

    /// Re-establish the entity, discarding every buffered SDU and PDU and
    /// leaving the link failure state
    pub fn reset(&mut self) {
        info!("{} AM entity re-established", self.lcid);
        self.reset_state();
        if matches!(self.state, EntityState::Active | EntityState::LinkFailed) {
            self.state = EntityState::Configured;
        }
    }

    fn reset_state(&mut self) {
        self.tx_sdus.clear();
        self.tx_window.clear();
        self.retx_queue.clear();
        self.vt_a = 0;
        self.vt_s = 0;
        self.poll_sn = 0;
        self.pdu_without_poll = 0;
        self.byte_without_poll = 0;
        self.poll_owed = false;
        self.link_failure = false;
        self.poll_retx_timer.stop();

        self.rx_window.clear();
        self.reassembler.clear();
        self.vr_r = 0;
        self.vr_x = 0;
        self.vr_ms = 0;
        self.vr_h = 0;
        self.do_status = false;
        self.status_override = false;
        self.reordering_timer.stop();
        self.status_prohibit_timer.stop();
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

    /// VT(A)
    pub fn vt_a(&self) -> u16 {
        self.vt_a
    }

    /// VT(S)
    pub fn vt_s(&self) -> u16 {
        self.vt_s
    }

    /// VR(R)
    pub fn vr_r(&self) -> u16 {
        self.vr_r
    }

    /// VR(MS)
    pub fn vr_ms(&self) -> u16 {
        self.vr_ms
    }

    /// VR(H)
    pub fn vr_h(&self) -> u16 {
        self.vr_h
    }

    /// Sent PDUs not yet acknowledged
    pub fn unacked_pdus(&self) -> usize {
        self.tx_window.len()
    }

    /// PDUs waiting for retransmission
    pub fn retx_queue_len(&self) -> usize {
        self.retx_queue.len()
    }

    /// Whether the given timer is armed
    pub fn timer_running(&self, timer: TimerId) -> bool {
        self.timer(timer).is_running()
    }

    /// Generation of the given timer
    pub fn timer_generation(&self, timer: TimerId) -> u64 {
        self.timer(timer).generation()
    }

    fn timer(&self, timer: TimerId) -> &RlcTimer {
        match timer {
            TimerId::Reordering => &self.reordering_timer,
            TimerId::PollRetransmit => &self.poll_retx_timer,
            TimerId::StatusProhibit => &self.status_prohibit_timer,
        }
    }

    /// Take the radio link failure indication. Returns true once per failure.
    pub fn take_radio_link_failure(&mut self) -> bool {
        std::mem::take(&mut self.link_failure)
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

    /// Bytes needed for the pending status report, the retransmission queue
    /// and the new data queue
    pub fn get_buffer_state(&self) -> u32 {
        if matches!(self.state, EntityState::Idle | EntityState::LinkFailed) {
            return 0;
        }
        let mut n_bytes = 0usize;
        if self.status_ready() {
            n_bytes += self.prepare_status(usize::MAX).packed_len();
        }
        n_bytes += self
            .retx_queue
            .iter()
            .filter_map(|sn| self.tx_window.get(sn))
            .map(|pdu| pdu.header.packed_len() + pdu.payload.len())
            .sum::<usize>();
        n_bytes as u32 + self.tx_sdus.buffer_state(AMD_FIXED_HEADER_LEN)
    }

    /// Build one PDU into `payload`: a status report first, then a
    /// retransmission, then new data. Returns its length.
    pub fn read_pdu(&mut self, payload: &mut [u8]) -> usize {
        match self.state {
            EntityState::Idle => return 0,
            EntityState::LinkFailed => {
                debug!("{} radio link failed, not transmitting", self.lcid);
                return 0;
            }
            _ => {}
        }
        debug!("{} MAC opportunity - {} bytes", self.lcid, payload.len());

        if self.status_ready() {
            let n = self.build_status_pdu(payload);
            if n > 0 {
                return n;
            }
        }
        if !self.retx_queue.is_empty() {
            return self.build_retx_pdu(payload);
        }
        self.build_data_pdu(payload)
    }

    /// Handle a received AMD or STATUS PDU
    pub fn write_pdu(&mut self, pdu: &[u8]) {
        if self.state == EntityState::Idle {
            debug!("{} not configured, discarding {} byte PDU", self.lcid, pdu.len());
            return;
        }
        self.mark_active();
        self.stats.rx_pdus += 1;
        self.stats.rx_pdu_bytes += pdu.len() as u64;

        if pdu.is_empty() {
            debug!("{} discarding empty PDU", self.lcid);
            self.stats.rx_discarded_malformed += 1;
            return;
        }
        if is_control_pdu(pdu) {
            self.handle_control_pdu(pdu);
        } else {
            self.handle_data_pdu(pdu);
        }
        self.debug_state();
    }

    /*************************************************************************
     * Timer interface
     ************************************************************************/

    /// Handle a timer expiry posted by the timer service
    pub fn timer_expired(&mut self, timer: TimerId, generation: u64) {
        match timer {
            TimerId::Reordering => {
                if self.reordering_timer.expire(generation) {
                    self.reordering_expired();
                }
            }
            TimerId::PollRetransmit => {
                if self.poll_retx_timer.expire(generation) {
                    self.poll_retx_expired();
                }
            }
            TimerId::StatusProhibit => {
                if self.status_prohibit_timer.expire(generation) && self.do_status {
                    debug!("{} status prohibit expired, releasing deferred status", self.lcid);
                }
            }
        }
    }

    fn reordering_expired(&mut self) {
        debug!("{} reordering timeout expiry - updating VR(MS)", self.lcid);

        let mut sn = self.vr_x;
        while self.rx_window.contains_key(&sn) {
            sn = self.space.inc(sn);
        }
        self.vr_ms = sn;

        if self.space.lt(self.vr_ms, self.vr_h, self.vr_r) {
            self.reordering_timer.start();
            self.vr_x = self.vr_h;
        }
        self.do_status = true;
        self.debug_state();
    }

    fn poll_retx_expired(&mut self) {
        debug!("{} poll retransmission timeout - VT(A) = {}, VT(S) = {}", self.lcid, self.vt_a, self.vt_s);

        self.do_status = true;
        self.status_override = true;
        self.poll_owed = true;

        if self.retx_queue.is_empty() && (self.tx_sdus.is_empty() || self.window_stalled()) {
            let last = self.space.sub(self.vt_s, 1);
            let space = self.space;
            let candidate = if self.tx_window.contains_key(&last) {
                Some(last)
            } else {
                space.range(self.vt_a, self.vt_s).find(|sn| self.tx_window.contains_key(sn))
            };
            if let Some(sn) = candidate {
                debug!("{} scheduling SN {} for retransmission to carry the poll", self.lcid, sn);
                self.retx_queue.push_back(sn);
            }
        }
    }

    /*************************************************************************
     * Transmit helpers
     ************************************************************************/

    fn status_ready(&self) -> bool {
        self.do_status && (!self.status_prohibit_timer.is_running() || self.status_override)
    }

    fn window_stalled(&self) -> bool {
        self.space.distance(self.vt_s, self.vt_a) >= self.space.window()
    }

    fn poll_required(&self) -> bool {
        self.poll_owed
            || (self.poll_pdu > 0 && self.pdu_without_poll >= self.poll_pdu)
            || (self.poll_byte > 0 && self.byte_without_poll >= self.poll_byte)
            || (self.tx_sdus.is_empty() && self.retx_queue.is_empty())
            || self.window_stalled()
    }

    fn set_poll(&mut self) {
        self.pdu_without_poll = 0;
        self.byte_without_poll = 0;
        self.poll_sn = self.space.sub(self.vt_s, 1);
        self.poll_owed = false;
        self.poll_retx_timer.start();
    }

    fn mark_active(&mut self) {
        if self.state == EntityState::Configured {
            self.state = EntityState::Active;
        }
    }

    /// Status report for the current receive state, with as many NACKs as
    /// fit in `max_len` bytes. ACK_SN stops at the first NACK left out.
    fn prepare_status(&self, max_len: usize) -> StatusPdu {
        let mut status = StatusPdu {
            ack_sn: self.vr_ms,
            nack_sn: Vec::new(),
        };
        for sn in self.space.range(self.vr_r, self.vr_ms) {
            if self.rx_window.contains_key(&sn) {
                continue;
            }
            if StatusPdu::packed_length(status.nack_sn.len() + 1) > max_len {
                status.ack_sn = sn;
                break;
            }
            status.nack_sn.push(sn);
        }
        status
    }

    fn build_status_pdu(&mut self, payload: &mut [u8]) -> usize {
        if payload.len() < StatusPdu::packed_length(0) {
            debug!("{} {} bytes too small for a status PDU", self.lcid, payload.len());
            return 0;
        }
        let status = self.prepare_status(payload.len());
        let len = match status.write(payload) {
            Ok(len) => len,
            Err(e) => {
                warn!("{} failed to write status PDU: {}", self.lcid, e);
                return 0;
            }
        };
        debug!("{} Tx status PDU - {}", self.lcid, status);

        self.do_status = false;
        self.status_override = false;
        if !self.status_prohibit_timer.duration().is_zero() {
            self.status_prohibit_timer.start();
        }
        self.mark_active();
        self.stats.tx_status_pdus += 1;
        self.stats.tx_pdu_bytes += len as u64;
        len
    }

    fn build_retx_pdu(&mut self, payload: &mut [u8]) -> usize {
        let Some(&sn) = self.retx_queue.front() else {
            return 0;
        };
        let Some(pdu) = self.tx_window.get(&sn) else {
            warn!("{} SN {} queued for retransmission but no longer held", self.lcid, sn);
            self.retx_queue.pop_front();
            return 0;
        };

        if pdu.retx_count >= self.max_retx_thresh {
            error!("{} SN {} reached max_retx_thresh ({}) - radio link failure",
                   self.lcid, sn, self.max_retx_thresh);
            self.retx_queue.pop_front();
            self.tx_window.remove(&sn);
            self.poll_retx_timer.stop();
            self.link_failure = true;
            self.state = EntityState::LinkFailed;
            return 0;
        }

        let needed = pdu.header.packed_len() + pdu.payload.len();
        if needed > payload.len() {
            debug!("{} retransmission of SN {} needs {} bytes, {} available",
                   self.lcid, sn, needed, payload.len());
            return 0;
        }
        let mut header = pdu.header.clone();
        let data = pdu.payload.clone();

        self.retx_queue.pop_front();
        header.poll = self.poll_required();
        let mut buf = PduBuffer::with_headroom(PDU_HEADROOM, data.len());
        buf.extend_from_slice(&data);
        if let Err(e) = header.write(&mut buf) {
            warn!("{} failed to write AMD header for SN {}: {}", self.lcid, sn, e);
            self.retx_queue.push_front(sn);
            return 0;
        }
        if header.poll {
            self.set_poll();
        }
        let retx_count = match self.tx_window.get_mut(&sn) {
            Some(pdu) => {
                pdu.retx_count += 1;
                pdu.retx_count
            }
            None => 0,
        };

        let out = buf.as_slice();
        payload[..out.len()].copy_from_slice(out);
        self.stats.tx_retx_pdus += 1;
        self.stats.tx_pdu_bytes += out.len() as u64;
        debug!("{} Retx AMD PDU SN {} ({} bytes, retx {}, poll {})",
               self.lcid, sn, out.len(), retx_count, header.poll);
        out.len()
    }

    fn build_data_pdu(&mut self, payload: &mut [u8]) -> usize {
        if self.tx_sdus.is_empty() {
            debug!("{} no data available to be sent", self.lcid);
            return 0;
        }
        if self.window_stalled() {
            debug!("{} tx window full - VT(A) = {}, VT(S) = {}", self.lcid, self.vt_a, self.vt_s);
            return 0;
        }

        let Some(mut segments) = self.tx_sdus.build(payload.len(), am_packed_length) else {
            warn!("{} cannot build a PDU - {} bytes available, {} bytes required for header",
                  self.lcid, payload.len(), am_packed_length(0));
            return 0;
        };
        let data = Bytes::copy_from_slice(segments.pdu.as_slice());

        let sn = self.vt_s;
        self.vt_s = self.space.inc(self.vt_s);
        self.pdu_without_poll += 1;
        self.byte_without_poll = self.byte_without_poll.saturating_add(data.len() as u32);

        let mut header = AmdPduHeader {
            poll: false,
            fi: segments.fi,
            sn,
            li: segments.li,
        };
        header.poll = self.poll_required();
        if let Err(e) = header.write(&mut segments.pdu) {
            warn!("{} failed to write AMD header for SN {}: {}", self.lcid, sn, e);
            return 0;
        }
        if header.poll {
            self.set_poll();
        }

        let out = segments.pdu.as_slice();
        payload[..out.len()].copy_from_slice(out);
        self.mark_active();
        self.stats.tx_pdus += 1;
        self.stats.tx_pdu_bytes += out.len() as u64;
        debug!("{} Tx AMD PDU SN {} ({} bytes, {} LIs, FI {:?}, poll {})",
               self.lcid, sn, out.len(), header.li.len(), header.fi, header.poll);
        let len = out.len();

        self.tx_window.insert(sn, AmdTxPdu {
            header,
            payload: data,
            retx_count: 0,
        });
        self.debug_state();
        len
    }

    /*************************************************************************
     * Receive helpers
     ************************************************************************/

    fn handle_control_pdu(&mut self, pdu: &[u8]) {
        let status = match StatusPdu::read(pdu) {
            Ok(status) => status,
            Err(e) => {
                debug!("{} discarding control PDU: {}", self.lcid, e);
                self.stats.rx_discarded_malformed += 1;
                return;
            }
        };
        self.stats.rx_status_pdus += 1;
        debug!("{} Rx status PDU - {}", self.lcid, status);

        let acked = self.space.distance(status.ack_sn, self.vt_a);
        let outstanding = self.space.distance(self.vt_s, self.vt_a);
        if acked == 0 || acked > outstanding {
            debug!("{} ACK_SN {} outside ({}:{}] - ignoring status", self.lcid, status.ack_sn, self.vt_a, self.vt_s);
            return;
        }

        let old_vt_a = self.vt_a;
        let space = self.space;
        let mut lowest_held = None;
        for sn in space.range(old_vt_a, status.ack_sn) {
            if status.has_nack(sn) {
                if self.tx_window.contains_key(&sn) && !self.retx_queue.contains(&sn) {
                    self.retx_queue.push_back(sn);
                }
            } else if self.tx_window.remove(&sn).is_some() {
                self.retx_queue.retain(|&queued| queued != sn);
            }
            if lowest_held.is_none() && self.tx_window.contains_key(&sn) {
                lowest_held = Some(sn);
            }
        }
        self.vt_a = lowest_held.unwrap_or(status.ack_sn);

        if self.poll_retx_timer.is_running()
            && (self.vt_a == self.vt_s || space.in_range(self.poll_sn, old_vt_a, status.ack_sn))
        {
            self.poll_retx_timer.stop();
        }
    }

    fn handle_data_pdu(&mut self, pdu: &[u8]) {
        let (header, header_len) = match AmdPduHeader::read(pdu) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!("{} discarding PDU: {}", self.lcid, e);
                self.stats.rx_discarded_malformed += 1;
                return;
            }
        };
        let sn = header.sn;
        let poll = header.poll;
        trace!("{} Rx data PDU SN {}: {}", self.lcid, sn, bytes_to_hex_truncated(pdu, 32));

        if !self.space.in_window(sn, self.vr_r) {
            debug!("{} SN {} outside rx window [{}:{}] - discarding",
                   self.lcid, sn, self.vr_r, self.vr_mr());
            self.stats.rx_discarded_out_of_window += 1;
            self.do_status |= poll;
            return;
        }
        if self.rx_window.contains_key(&sn) {
            debug!("{} discarding duplicate SN {}", self.lcid, sn);
            self.stats.rx_discarded_duplicate += 1;
            self.do_status |= poll;
            return;
        }

        let mut payload = PduBuffer::from_slice(pdu);
        if let Err(e) = payload.advance(header_len) {
            debug!("{} discarding PDU: {}", self.lcid, e);
            self.stats.rx_discarded_malformed += 1;
            return;
        }
        self.rx_window.insert(sn, AmdRxPdu { header, payload });

        if !self.space.lt(sn, self.vr_h, self.vr_r) {
            self.vr_h = self.space.inc(sn);
        }
        if sn == self.vr_ms {
            while self.rx_window.contains_key(&self.vr_ms) {
                self.vr_ms = self.space.inc(self.vr_ms);
            }
        }
        if sn == self.vr_r {
            self.reassemble_rx_sdus();
        }

        if self.reordering_timer.is_running() {
            let vr_mr = self.vr_mr();
            if self.vr_x == self.vr_r || (!self.space.in_window(self.vr_x, self.vr_r) && self.vr_x != vr_mr) {
                self.reordering_timer.stop();
            }
        }
        if !self.reordering_timer.is_running() && self.vr_h != self.vr_r {
            self.reordering_timer.start();
            self.vr_x = self.vr_h;
        }

        if poll {
            debug!("{} poll received on SN {}", self.lcid, sn);
            self.do_status = true;
        }
    }

    /// Hand every in-sequence PDU from VR(R) on to reassembly
    fn reassemble_rx_sdus(&mut self) {
        while let Some(pdu) = self.rx_window.remove(&self.vr_r) {
            let AmdRxPdu { header, payload } = pdu;
            self.reassembler
                .push_pdu(self.lcid, self.vr_r, header.fi, &header.li, payload, &mut self.stats);
            self.vr_r = self.space.inc(self.vr_r);
        }
    }

    fn vr_mr(&self) -> u16 {
        self.space.add(self.vr_r, self.space.window())
    }

    fn debug_state(&self) {
        debug!("{} vt_a = {}, vt_s = {}, poll_sn = {}, vr_r = {}, vr_x = {}, vr_ms = {}, vr_h = {}",
               self.lcid, self.vt_a, self.vt_s, self.poll_sn, self.vr_r, self.vr_x, self.vr_ms, self.vr_h);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn am_pair(config: &RlcConfig) -> (RlcAm, RlcAm) {
        let mut tx = RlcAm::new(Lcid(3));
        let mut rx = RlcAm::new(Lcid(3));
        tx.configure(config).unwrap();
        rx.configure(config).unwrap();
        (tx, rx)
    }

    fn pull(am: &mut RlcAm, capacity: usize) -> Vec<u8> {
        let mut buf = vec![0u8; capacity];
        let n = am.read_pdu(&mut buf);
        buf.truncate(n);
        buf
    }

    fn fire(am: &mut RlcAm, timer: TimerId) -> bool {
        if !am.timer_running(timer) {
            return false;
        }
        let generation = am.timer_generation(timer);
        am.timer_expired(timer, generation);
        true
    }

    fn fire_all(am: &mut RlcAm) {
        for timer in [TimerId::Reordering, TimerId::PollRetransmit, TimerId::StatusProhibit] {
            fire(am, timer);
        }
    }

    fn data_header(pdu: &[u8]) -> Option<AmdPduHeader> {
        if pdu.is_empty() || is_control_pdu(pdu) {
            return None;
        }
        AmdPduHeader::read(pdu).ok().map(|(header, _)| header)
    }

    fn status_bytes(status: &StatusPdu) -> Vec<u8> {
        let mut buf = vec![0u8; status.packed_len()];
        status.write(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_configure_rejects_5bit_sn() {
        let mut am = RlcAm::new(Lcid(3));
        let config = RlcConfig {
            sn_field_length: SnFieldLength::Bits5,
            ..RlcConfig::am()
        };
        assert!(am.configure(&config).is_err());
        assert_eq!(am.state(), EntityState::Idle);
    }

    #[test]
    fn test_in_order_transfer_acknowledged() {
        let (mut tx, mut rx) = am_pair(&RlcConfig::am());
        let sdus: Vec<Bytes> = (0..5u8).map(|i| Bytes::from(vec![i; 40])).collect();
        for sdu in &sdus {
            tx.write_sdu(sdu.clone());
        }
        loop {
            let pdu = pull(&mut tx, 100);
            if pdu.is_empty() {
                break;
            }
            rx.write_pdu(&pdu);
        }
        assert_eq!(rx.read_sdu(), sdus);
        assert!(tx.timer_running(TimerId::PollRetransmit));

        // The last PDU carried a poll
        let status = pull(&mut rx, 100);
        assert!(is_control_pdu(&status));
        tx.write_pdu(&status);
        assert_eq!(tx.vt_a(), tx.vt_s());
        assert_eq!(tx.unacked_pdus(), 0);
        assert!(!tx.timer_running(TimerId::PollRetransmit));
        assert_eq!(tx.get_buffer_state(), 0);
    }

    #[test]
    fn test_nack_triggers_retransmission() {
        let (mut tx, mut rx) = am_pair(&RlcConfig::am());
        let sdus: Vec<Bytes> = (0..3u8).map(|i| Bytes::from(vec![i; 20])).collect();
        for sdu in &sdus {
            tx.write_sdu(sdu.clone());
        }
        let pdus: Vec<Vec<u8>> = (0..3).map(|_| pull(&mut tx, 22)).collect();
        assert!(data_header(&pdus[2]).unwrap().poll);

        rx.write_pdu(&pdus[0]);
        rx.write_pdu(&pdus[2]);
        assert!(rx.timer_running(TimerId::Reordering));

        // Poll answered before the gap is confirmed: only SN 0 acknowledged
        let first = StatusPdu::read(&pull(&mut rx, 100)).unwrap();
        assert_eq!(first, StatusPdu { ack_sn: 1, nack_sn: vec![] });
        tx.write_pdu(&status_bytes(&first));
        assert_eq!(tx.vt_a(), 1);
        assert!(tx.timer_running(TimerId::PollRetransmit));

        assert!(fire(&mut rx, TimerId::Reordering));
        let second = StatusPdu::read(&pull(&mut rx, 100)).unwrap();
        assert_eq!(second, StatusPdu { ack_sn: 3, nack_sn: vec![1] });
        tx.write_pdu(&status_bytes(&second));
        assert_eq!(tx.retx_queue_len(), 1);
        assert_eq!(tx.unacked_pdus(), 1);
        assert!(!tx.timer_running(TimerId::PollRetransmit));

        let retx = pull(&mut tx, 100);
        let header = data_header(&retx).unwrap();
        assert_eq!(header.sn, 1);
        assert!(header.poll);
        assert_eq!(tx.stats().tx_retx_pdus, 1);

        rx.write_pdu(&retx);
        assert_eq!(rx.read_sdu(), sdus);
        assert_eq!(rx.vr_r(), 3);

        tx.write_pdu(&pull(&mut rx, 100));
        assert_eq!(tx.vt_a(), 3);
        assert_eq!(tx.unacked_pdus(), 0);
        assert!(!tx.timer_running(TimerId::PollRetransmit));
    }

    #[test]
    fn test_random_loss_converges() {
        let mut rng = StdRng::seed_from_u64(7);
        let config = RlcConfig {
            max_retx_thresh: 64,
            t_status_prohibit_ms: 10,
            ..RlcConfig::am()
        };
        let (mut tx, mut rx) = am_pair(&config);
        let sdus: Vec<Bytes> = (0..60usize)
            .map(|i| {
                let len = rng.gen_range(1..400usize);
                Bytes::from((0..len).map(|j| (i * 7 + j) as u8).collect::<Vec<u8>>())
            })
            .collect();
        for sdu in &sdus {
            tx.write_sdu(sdu.clone());
        }

        let mut delivered = Vec::new();
        for round in 0..5000 {
            let pdu = pull(&mut tx, 150);
            if !pdu.is_empty() && !rng.gen_bool(0.2) {
                rx.write_pdu(&pdu);
            }
            let pdu = pull(&mut rx, 150);
            if !pdu.is_empty() && !rng.gen_bool(0.2) {
                tx.write_pdu(&pdu);
            }
            delivered.extend(rx.read_sdu());
            if round % 8 == 7 {
                fire_all(&mut tx);
                fire_all(&mut rx);
            }
            if delivered.len() == sdus.len() && tx.vt_a() == tx.vt_s() {
                break;
            }
        }

        assert_eq!(delivered, sdus);
        assert_eq!(tx.vt_a(), tx.vt_s());
        assert_eq!(tx.unacked_pdus(), 0);
        assert_eq!(tx.state(), EntityState::Active);
        assert!(!tx.take_radio_link_failure());
    }

    #[test]
    fn test_sn_wraparound_with_reordering_and_loss() {
        let mut rng = StdRng::seed_from_u64(23);
        let config = RlcConfig {
            window_size: Some(64),
            max_retx_thresh: 256,
            ..RlcConfig::am()
        };
        let (mut tx, mut rx) = am_pair(&config);
        // One SDU per PDU, well past the 1024 SN space
        let sdus: Vec<Bytes> = (0..1500u16)
            .map(|i| {
                let mut sdu = i.to_be_bytes().to_vec();
                sdu.extend((0..18u8).map(|j| j ^ i as u8));
                Bytes::from(sdu)
            })
            .collect();
        for sdu in &sdus {
            tx.write_sdu(sdu.clone());
        }

        let mut delivered = Vec::new();
        let mut held: Option<Vec<u8>> = None;
        for round in 0..100_000 {
            let pdu = pull(&mut tx, 22);
            let late = held.take();
            if !pdu.is_empty() && !rng.gen_bool(0.1) {
                if late.is_none() && rng.gen_bool(0.2) {
                    held = Some(pdu);
                } else {
                    rx.write_pdu(&pdu);
                }
            }
            if let Some(late) = late {
                rx.write_pdu(&late);
            }

            let status = pull(&mut rx, 64);
            if !status.is_empty() && !rng.gen_bool(0.1) {
                tx.write_pdu(&status);
            }
            delivered.extend(rx.read_sdu());
            if round % 8 == 7 {
                fire_all(&mut tx);
                fire_all(&mut rx);
            }
            if delivered.len() == sdus.len() && tx.vt_a() == tx.vt_s() {
                break;
            }
        }

        assert_eq!(delivered.len(), sdus.len());
        assert!(delivered == sdus);
        assert_eq!(tx.stats().tx_pdus, 1500);
        assert_eq!(tx.vt_s(), 1500 % 1024);
        assert_eq!(tx.vt_a(), tx.vt_s());
        assert_eq!(rx.vr_r(), tx.vt_s());
        assert_eq!(tx.unacked_pdus(), 0);
        assert!(!tx.take_radio_link_failure());
    }

    #[test]
    fn test_max_retx_raises_link_failure_once() {
        let config = RlcConfig {
            max_retx_thresh: 4,
            ..RlcConfig::am()
        };
        let (mut tx, mut rx) = am_pair(&config);
        for i in 0..10u8 {
            tx.write_sdu(Bytes::from(vec![i; 20]));
        }

        let mut sn7_transmissions = 0;
        let mut failures = 0;
        for round in 0..400 {
            let pdu = pull(&mut tx, 22);
            match data_header(&pdu) {
                Some(header) if header.sn == 7 => sn7_transmissions += 1,
                _ if !pdu.is_empty() => rx.write_pdu(&pdu),
                _ => {}
            }
            let status = pull(&mut rx, 64);
            if !status.is_empty() {
                tx.write_pdu(&status);
            }
            if tx.take_radio_link_failure() {
                failures += 1;
            }
            if round % 4 == 3 {
                fire_all(&mut tx);
                fire_all(&mut rx);
            }
        }

        // One first transmission plus max_retx_thresh retransmissions
        assert_eq!(sn7_transmissions, 5);
        assert_eq!(failures, 1);
        assert_eq!(tx.state(), EntityState::LinkFailed);
        assert_eq!(pull(&mut tx, 100).len(), 0);
        assert_eq!(tx.get_buffer_state(), 0);
        // SDUs after the lost one stay blocked behind the gap
        assert_eq!(rx.read_sdu().len(), 7);

        tx.reset();
        assert_eq!(tx.state(), EntityState::Configured);
        tx.write_sdu(Bytes::from_static(b"again"));
        assert!(!pull(&mut tx, 100).is_empty());
    }

    #[test]
    fn test_window_never_exceeded() {
        let config = RlcConfig {
            window_size: Some(8),
            poll_pdu: 0,
            poll_byte: 0,
            ..RlcConfig::am()
        };
        let (mut tx, _) = am_pair(&config);
        for i in 0..20u8 {
            tx.write_sdu(Bytes::from(vec![i; 10]));
        }

        let mut headers = Vec::new();
        loop {
            let pdu = pull(&mut tx, 12);
            if pdu.is_empty() {
                break;
            }
            headers.push(data_header(&pdu).unwrap());
        }
        assert_eq!(headers.iter().map(|h| h.sn).collect::<Vec<_>>(), (0..8).collect::<Vec<u16>>());
        // Only the PDU that fills the window polls
        assert_eq!(headers.iter().filter(|h| h.poll).count(), 1);
        assert!(headers[7].poll);
        assert_eq!(tx.vt_s(), 8);

        tx.write_pdu(&status_bytes(&StatusPdu { ack_sn: 4, nack_sn: vec![] }));
        assert_eq!(tx.vt_a(), 4);
        let mut more = Vec::new();
        loop {
            let pdu = pull(&mut tx, 12);
            if pdu.is_empty() {
                break;
            }
            more.push(data_header(&pdu).unwrap().sn);
        }
        assert_eq!(more, vec![8, 9, 10, 11]);
    }

    #[test]
    fn test_status_outside_window_ignored() {
        let (mut tx, _) = am_pair(&RlcConfig::am());
        tx.write_sdu(Bytes::from(vec![1u8; 10]));
        tx.write_sdu(Bytes::from(vec![2u8; 10]));
        pull(&mut tx, 12);
        pull(&mut tx, 12);

        tx.write_pdu(&status_bytes(&StatusPdu { ack_sn: 5, nack_sn: vec![] }));
        assert_eq!(tx.vt_a(), 0);
        assert_eq!(tx.unacked_pdus(), 2);
        tx.write_pdu(&status_bytes(&StatusPdu { ack_sn: 0, nack_sn: vec![] }));
        assert_eq!(tx.unacked_pdus(), 2);
        assert_eq!(tx.stats().rx_status_pdus, 2);
    }

    #[test]
    fn test_duplicate_pdu_idempotent() {
        let (mut tx, mut rx) = am_pair(&RlcConfig::am());
        tx.write_sdu(Bytes::from_static(b"first"));
        tx.write_sdu(Bytes::from_static(b"second"));
        let p0 = pull(&mut tx, 7);
        let p1 = pull(&mut tx, 8);

        rx.write_pdu(&p1);
        rx.write_pdu(&p1);
        assert_eq!(rx.stats().rx_discarded_duplicate, 1);
        rx.write_pdu(&p0);
        rx.write_pdu(&p0);
        assert_eq!(rx.stats().rx_discarded_out_of_window, 1);
        assert_eq!(rx.read_sdu(), vec![Bytes::from_static(b"first"), Bytes::from_static(b"second")]);
    }

    #[test]
    fn test_status_prohibit_defers_report() {
        let config = RlcConfig {
            poll_pdu: 1,
            t_status_prohibit_ms: 50,
            ..RlcConfig::am()
        };
        let (mut tx, mut rx) = am_pair(&config);
        tx.write_sdu(Bytes::from(vec![1u8; 10]));
        tx.write_sdu(Bytes::from(vec![2u8; 10]));
        let p0 = pull(&mut tx, 12);
        let p1 = pull(&mut tx, 12);

        rx.write_pdu(&p0);
        assert!(is_control_pdu(&pull(&mut rx, 10)));
        assert!(rx.timer_running(TimerId::StatusProhibit));

        rx.write_pdu(&p1);
        assert_eq!(rx.get_buffer_state(), 0);
        assert!(pull(&mut rx, 10).is_empty());

        assert!(fire(&mut rx, TimerId::StatusProhibit));
        assert_eq!(rx.get_buffer_state(), 2);
        let status = StatusPdu::read(&pull(&mut rx, 10)).unwrap();
        assert_eq!(status.ack_sn, 2);
    }

    #[test]
    fn test_poll_thresholds() {
        let by_pdu = RlcConfig {
            poll_pdu: 4,
            poll_byte: 0,
            ..RlcConfig::am()
        };
        let by_byte = RlcConfig {
            poll_pdu: 0,
            poll_byte: 25,
            ..RlcConfig::am()
        };
        for (config, expected) in [(by_pdu, vec![3u16, 7, 9]), (by_byte, vec![2, 5, 8, 9])] {
            let (mut tx, _) = am_pair(&config);
            for i in 0..10u8 {
                tx.write_sdu(Bytes::from(vec![i; 10]));
            }
            let polled: Vec<u16> = (0..10)
                .filter_map(|_| data_header(&pull(&mut tx, 12)))
                .filter(|h| h.poll)
                .map(|h| h.sn)
                .collect();
            assert_eq!(polled, expected);
        }
    }

    #[test]
    fn test_status_truncated_to_grant() {
        let (mut tx, mut rx) = am_pair(&RlcConfig::am());
        for i in 0..7u8 {
            tx.write_sdu(Bytes::from(vec![i; 10]));
        }
        for sn in 0..7 {
            let pdu = pull(&mut tx, 12);
            if sn % 2 == 0 {
                rx.write_pdu(&pdu);
            }
        }
        // First expiry confirms the gap at SN 3, the restarted timer the rest
        assert!(fire(&mut rx, TimerId::Reordering));
        assert_eq!(rx.vr_ms(), 3);
        assert!(fire(&mut rx, TimerId::Reordering));
        assert_eq!(rx.vr_ms(), 7);
        assert!(!rx.timer_running(TimerId::Reordering));

        // Four bytes carry a single NACK, so ACK_SN stops at the next gap
        let status = StatusPdu::read(&pull(&mut rx, 4)).unwrap();
        assert_eq!(status, StatusPdu { ack_sn: 3, nack_sn: vec![1] });
    }

    #[test]
    fn test_buffer_state_includes_retransmissions() {
        let (mut tx, _) = am_pair(&RlcConfig::am());
        tx.write_sdu(Bytes::from(vec![1u8; 20]));
        assert_eq!(tx.get_buffer_state(), 22);
        pull(&mut tx, 100);
        assert_eq!(tx.get_buffer_state(), 0);

        tx.write_pdu(&status_bytes(&StatusPdu { ack_sn: 1, nack_sn: vec![0] }));
        assert_eq!(tx.retx_queue_len(), 1);
        assert_eq!(tx.get_buffer_state(), 22);

        // Too small for the retransmission
        assert_eq!(pull(&mut tx, 21).len(), 0);
        assert_eq!(pull(&mut tx, 22).len(), 22);
    }
}
