//! SDU Segmentation and Concatenation
//!
//! Transmit-side SDU queue shared by the UM and AM engines. Fills a PDU
//! payload from the partially sent SDU and then whole queued SDUs, recording a
//! length indicator at every SDU boundary inside the payload.

use crate::header::{FramingInfo, MAX_LI_COUNT, MAX_LI_VALUE};
use bytes::Bytes;
use common::{PduBuffer, PDU_HEADROOM};
use std::collections::VecDeque;

/// Payload and framing of one data PDU, header not yet written
#[derive(Debug)]
pub struct Segments {
    /// Payload with headroom reserved for the header
    pub pdu: PduBuffer,
    /// Framing info for the header
    pub fi: FramingInfo,
    /// Length indicators for the header
    pub li: Vec<u16>,
}

/// FIFO of upper-layer SDUs plus the one SDU whose tail is still unsent
#[derive(Debug, Default)]
pub struct SduQueue {
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    partial: Option<Bytes>,
}

impl SduQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an SDU
    pub fn push(&mut self, sdu: Bytes) {
        self.queued_bytes += sdu.len();
        self.queue.push_back(sdu);
    }

    /// Whether there is nothing left to send
    pub fn is_empty(&self) -> bool {
        self.partial.is_none() && self.queue.is_empty()
    }

    /// SDUs waiting, the partially sent one included
    pub fn n_sdus(&self) -> usize {
        self.queue.len() + usize::from(self.partial.is_some())
    }

    /// Unsent SDU bytes, the partial tail included
    pub fn n_bytes(&self) -> usize {
        self.queued_bytes + self.partial.as_ref().map_or(0, |p| p.len())
    }

    /// Bytes needed to send everything queued: payload, the LI estimate
    /// `ceil(1.5 * boundaries + 0.5)` and the fixed header
    pub fn buffer_state(&self, fixed_header_len: usize) -> u32 {
        let n_sdus = self.n_sdus();
        let mut n_bytes = self.n_bytes();
        if n_sdus > 1 {
            n_bytes += (3 * (n_sdus - 1) + 2) / 2;
        }
        if n_bytes > 0 {
            n_bytes += fixed_header_len;
        }
        n_bytes as u32
    }

    /// Drop every queued SDU
    pub fn clear(&mut self) {
        self.queue.clear();
        self.queued_bytes = 0;
        self.partial = None;
    }

    /// Fill a PDU of at most `capacity` bytes, where `header_len(n)` gives the
    /// header size for `n` length indicators. Returns `None` when nothing is
    /// queued or the header alone would use the whole budget.
    pub fn build(&mut self, capacity: usize, header_len: impl Fn(usize) -> usize) -> Option<Segments> {
        if self.is_empty() || capacity <= header_len(0) {
            return None;
        }

        let mut pdu = PduBuffer::with_headroom(PDU_HEADROOM, capacity);
        let mut fi = FramingInfo::empty();
        let mut li = Vec::new();
        let mut last_len = 0usize;

        if let Some(mut partial) = self.partial.take() {
            let room = capacity - header_len(0);
            let to_move = room.min(partial.len());
            pdu.extend_from_slice(&partial.split_to(to_move));
            last_len = to_move;
            fi |= FramingInfo::NOT_START_ALIGNED;
            if !partial.is_empty() {
                self.partial = Some(partial);
            }
        }

        while self.partial.is_none() {
            let Some(front_len) = self.queue.front().map(Bytes::len) else {
                break;
            };
            let n_li = if last_len > 0 { li.len() + 1 } else { li.len() };
            if last_len > MAX_LI_VALUE || n_li > MAX_LI_COUNT {
                break;
            }
            let head = header_len(n_li);
            if capacity <= head + pdu.len() {
                break;
            }
            if last_len > 0 {
                li.push(last_len as u16);
            }

            let mut sdu = match self.queue.pop_front() {
                Some(sdu) => sdu,
                None => break,
            };
            self.queued_bytes -= front_len;
            let room = capacity - head - pdu.len();
            let to_move = room.min(sdu.len());
            pdu.extend_from_slice(&sdu.split_to(to_move));
            last_len = to_move;
            if !sdu.is_empty() {
                self.partial = Some(sdu);
            }
        }

        if self.partial.is_some() {
            fi |= FramingInfo::NOT_END_ALIGNED;
        }

        Some(Segments { pdu, fi, li })
    }
}
