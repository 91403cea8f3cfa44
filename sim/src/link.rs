//! Loopback Link
//!
//! Two RLC stacks, each with its own timer service, joined by a lossy
//! channel. Every TTI each bearer gets one grant per direction; the uplink
//! carries the offered SDUs, the downlink carries status reports.

use crate::config::{ChannelConfig, SimConfig};
use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use common::{Lcid, RlcMode};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rlc::{ChannelUpper, Rlc, RlcIndication, RlcStats, TimerExpiry, TimerService};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Channel dropping each PDU with a fixed probability
pub struct LossyChannel {
    rng: StdRng,
    loss_rate: f64,
    passed: u64,
    dropped: u64,
}

impl LossyChannel {
    pub fn new(loss_rate: f64, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            loss_rate,
            passed: 0,
            dropped: 0,
        }
    }

    /// Whether the next PDU gets through
    pub fn pass(&mut self) -> bool {
        if self.loss_rate > 0.0 && self.rng.gen_bool(self.loss_rate) {
            self.dropped += 1;
            false
        } else {
            self.passed += 1;
            true
        }
    }
}

/// Per-bearer results
#[derive(Debug, Clone, Serialize)]
pub struct BearerReport {
    pub lcid: u8,
    pub mode: RlcMode,
    pub sdus_offered: u32,
    pub sdus_delivered: u64,
    pub sdus_corrupted: u64,
    pub in_order: bool,
    pub radio_link_failure: bool,
    /// Counters of the sending end
    pub ue: RlcStats,
    /// Counters of the receiving end
    pub enb: RlcStats,
}

/// Results of a run
#[derive(Debug, Clone, Serialize)]
pub struct SimReport {
    pub ttis: u64,
    pub uplink_dropped: u64,
    pub downlink_dropped: u64,
    pub bearers: Vec<BearerReport>,
}

#[derive(Debug)]
struct Delivery {
    delivered: u64,
    corrupted: u64,
    last_tag: Option<u32>,
    in_order: bool,
    radio_link_failure: bool,
}

impl Default for Delivery {
    fn default() -> Self {
        Self {
            delivered: 0,
            corrupted: 0,
            last_tag: None,
            in_order: true,
            radio_link_failure: false,
        }
    }
}

type Stack = (Rlc, mpsc::UnboundedReceiver<TimerExpiry>, mpsc::UnboundedReceiver<RlcIndication>);

/// One end of the link: manager, its timer expiries and its indications
fn stack(config: &SimConfig) -> Result<Stack> {
    let (expiry_tx, expiries) = mpsc::unbounded_channel();
    let (service, timers) = TimerService::new(expiry_tx);
    tokio::spawn(service.run());

    let (upper, indications) = ChannelUpper::new();
    let rlc = Rlc::with_upper(Arc::new(upper)).with_timers(timers);
    for bearer in &config.bearers {
        rlc.add_bearer(bearer.lcid()?, &bearer.rlc)?;
    }
    Ok((rlc, expiries, indications))
}

/// SDU number `tag` of `size` bytes, tag first
fn make_sdu(tag: u32, size: usize) -> Bytes {
    let mut sdu = BytesMut::with_capacity(size);
    sdu.put_u32(tag);
    sdu.extend((4..size).map(|i| (tag as usize + i) as u8));
    sdu.freeze()
}

fn sdu_tag(sdu: &[u8], size: usize) -> Option<u32> {
    if sdu.len() != size || size < 4 {
        return None;
    }
    let tag = u32::from_be_bytes([sdu[0], sdu[1], sdu[2], sdu[3]]);
    (make_sdu(tag, size) == sdu).then_some(tag)
}

/// Move at most one PDU from `from` to `to`. Returns whether one was sent.
fn transmit(from: &Rlc, to: &Rlc, lcid: Lcid, buf: &mut [u8], channel: &mut LossyChannel) -> Result<bool> {
    if from.get_buffer_state(lcid)? == 0 {
        return Ok(false);
    }
    let n = from.read_pdu(lcid, buf)?;
    if n == 0 {
        return Ok(false);
    }
    if channel.pass() {
        to.write_pdu(lcid, &buf[..n])?;
    } else {
        debug!("{} dropped {} byte PDU", lcid, n);
    }
    Ok(true)
}

fn record(indications: &mut mpsc::UnboundedReceiver<RlcIndication>,
          deliveries: &mut HashMap<Lcid, Delivery>,
          sdu_size: usize) {
    while let Ok(indication) = indications.try_recv() {
        match indication {
            RlcIndication::Sdu { lcid, sdu } => {
                let delivery = deliveries.entry(lcid).or_default();
                delivery.delivered += 1;
                match sdu_tag(&sdu, sdu_size) {
                    Some(tag) => {
                        if delivery.last_tag.is_some_and(|last| tag <= last) {
                            warn!("{} SDU {} delivered out of order", lcid, tag);
                            delivery.in_order = false;
                        }
                        delivery.last_tag = Some(tag);
                    }
                    None => {
                        warn!("{} corrupted SDU of {} bytes", lcid, sdu.len());
                        delivery.corrupted += 1;
                    }
                }
            }
            RlcIndication::RadioLinkFailure { lcid } => {
                warn!("{} radio link failure indicated", lcid);
                deliveries.entry(lcid).or_default().radio_link_failure = true;
            }
        }
    }
}

/// Run the loopback until the channel has been quiet for
/// `quiet_ttis` TTIs or `max_ttis` is reached
pub async fn run(config: &SimConfig) -> Result<SimReport> {
    config.validate()?;
    let ChannelConfig { loss_rate, tti_ms, grant_bytes, seed, quiet_ttis, max_ttis } = config.channel;
    let sdu_size = config.traffic.sdu_size;

    let (ue, mut ue_expiries, mut ue_indications) = stack(config)?;
    let (enb, mut enb_expiries, mut enb_indications) = stack(config)?;
    let mut lcids = Vec::with_capacity(config.bearers.len());
    for bearer in &config.bearers {
        lcids.push(bearer.lcid()?);
    }

    for &lcid in &lcids {
        for tag in 0..config.traffic.sdu_count {
            ue.write_sdu(lcid, make_sdu(tag, sdu_size))?;
        }
    }
    info!("Offered {} SDUs of {} bytes on {} bearers", config.traffic.sdu_count, sdu_size, lcids.len());

    let mut uplink = LossyChannel::new(loss_rate, seed);
    let mut downlink = LossyChannel::new(loss_rate, seed.wrapping_add(1));
    let mut deliveries: HashMap<Lcid, Delivery> = HashMap::new();
    let mut buf = vec![0u8; grant_bytes];

    let mut tti = tokio::time::interval(Duration::from_millis(tti_ms));
    let mut stats_interval = tokio::time::interval(Duration::from_secs(1));
    let mut ttis = 0u64;
    let mut quiet = 0u64;

    loop {
        tokio::select! {
            _ = tti.tick() => {
                ttis += 1;
                let mut active = false;
                for &lcid in &lcids {
                    active |= transmit(&ue, &enb, lcid, &mut buf, &mut uplink)?;
                    active |= transmit(&enb, &ue, lcid, &mut buf, &mut downlink)?;
                }
                quiet = if active { 0 } else { quiet + 1 };
                if quiet >= quiet_ttis || ttis >= max_ttis {
                    break;
                }
            }
            Some(expiry) = ue_expiries.recv() => ue.timer_expired(expiry),
            Some(expiry) = enb_expiries.recv() => enb.timer_expired(expiry),
            _ = stats_interval.tick() => {
                let stats = enb.total_stats();
                info!("TTI {}: {} SDUs delivered, {} PDUs dropped, {} retransmissions",
                      ttis, stats.rx_sdus, uplink.dropped + downlink.dropped, ue.total_stats().tx_retx_pdus);
            }
        }
        record(&mut enb_indications, &mut deliveries, sdu_size);
        record(&mut ue_indications, &mut deliveries, sdu_size);
    }

    if ttis >= max_ttis {
        warn!("Stopped after {} TTIs with traffic still flowing", ttis);
    }
    info!("Finished after {} TTIs, uplink {}/{} PDUs lost, downlink {}/{} PDUs lost",
          ttis, uplink.dropped, uplink.dropped + uplink.passed, downlink.dropped, downlink.dropped + downlink.passed);

    let mut bearers = Vec::with_capacity(lcids.len());
    for &lcid in &lcids {
        let delivery = deliveries.remove(&lcid).unwrap_or_default();
        bearers.push(BearerReport {
            lcid: lcid.value(),
            mode: ue.mode(lcid)?,
            sdus_offered: config.traffic.sdu_count,
            sdus_delivered: delivery.delivered,
            sdus_corrupted: delivery.corrupted,
            in_order: delivery.in_order,
            radio_link_failure: delivery.radio_link_failure,
            ue: ue.stats(lcid)?,
            enb: enb.stats(lcid)?,
        });
    }

    Ok(SimReport {
        ttis,
        uplink_dropped: uplink.dropped,
        downlink_dropped: downlink.dropped,
        bearers,
    })
}
