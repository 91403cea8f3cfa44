//! RLC Layer Manager
//!
//! Owns one [`RlcEntity`] per logical channel and serializes every entry
//! point on a per-entity lock. Different logical channels never contend with
//! each other; the map itself is only write-locked to add or remove bearers.
//!
//! Reassembled SDUs and radio link failures are pushed to the upper layer
//! through [`RlcUpperInterface`] after the entity lock has been released, so
//! an upper layer may call straight back into the manager.

use crate::config::RlcConfig;
use crate::entity::{EntityState, RlcEntity};
use crate::stats::RlcStats;
use crate::timer::{TimerExpiry, TimerSender};
use crate::RlcError;
use bytes::Bytes;
use common::{Lcid, RlcMode};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Interface towards the layer above RLC (PDCP and RRC)
pub trait RlcUpperInterface: Send + Sync {
    /// A complete SDU was reassembled on `lcid`
    fn deliver_sdu(&self, lcid: Lcid, sdu: Bytes);

    /// Maximum retransmissions were reached on `lcid`
    fn radio_link_failure(&self, lcid: Lcid);
}

/// Indication posted by [`ChannelUpper`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RlcIndication {
    /// Reassembled SDU
    Sdu { lcid: Lcid, sdu: Bytes },
    /// Radio link failure
    RadioLinkFailure { lcid: Lcid },
}

/// Upper interface that forwards every indication into an mpsc channel
pub struct ChannelUpper {
    tx: mpsc::UnboundedSender<RlcIndication>,
}

impl ChannelUpper {
    /// Create the adapter and the receiver the upper layer drains
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RlcIndication>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn post(&self, indication: RlcIndication) {
        if self.tx.send(indication).is_err() {
            debug!("Upper layer receiver dropped, discarding indication");
        }
    }
}

impl RlcUpperInterface for ChannelUpper {
    fn deliver_sdu(&self, lcid: Lcid, sdu: Bytes) {
        self.post(RlcIndication::Sdu { lcid, sdu });
    }

    fn radio_link_failure(&self, lcid: Lcid) {
        self.post(RlcIndication::RadioLinkFailure { lcid });
    }
}

/// Indications collected under the entity lock, delivered after it
#[derive(Default)]
struct Pending {
    sdus: Vec<Bytes>,
    link_failure: bool,
}

/// RLC layer: the set of RLC entities of one UE
pub struct Rlc {
    entities: RwLock<HashMap<Lcid, Arc<Mutex<RlcEntity>>>>,
    upper: Option<Arc<dyn RlcUpperInterface>>,
    timers: Option<TimerSender>,
}

impl Default for Rlc {
    fn default() -> Self {
        Self::new()
    }
}

impl Rlc {
    /// Create a manager whose SDUs are pulled with [`Rlc::read_sdus`]
    pub fn new() -> Self {
        Self {
            entities: RwLock::new(HashMap::new()),
            upper: None,
            timers: None,
        }
    }

    /// Create a manager pushing SDUs and failures to `upper`
    pub fn with_upper(upper: Arc<dyn RlcUpperInterface>) -> Self {
        Self {
            upper: Some(upper),
            ..Self::new()
        }
    }

    /// Route timer requests of every entity created from now on to a
    /// timer service
    pub fn with_timers(mut self, timers: TimerSender) -> Self {
        self.timers = Some(timers);
        self
    }

    fn create_entity(&self, lcid: Lcid, config: &RlcConfig) -> Result<RlcEntity, RlcError> {
        let mut entity = RlcEntity::new(lcid, config.mode);
        if let Some(timers) = &self.timers {
            entity.attach_timers(timers.clone());
        }
        entity.configure(config)?;
        Ok(entity)
    }

    /// Add a bearer that must not exist yet
    pub fn add_bearer(&self, lcid: Lcid, config: &RlcConfig) -> Result<(), RlcError> {
        if self.entities.read().contains_key(&lcid) {
            return Err(RlcError::BearerExists(lcid));
        }
        let entity = self.create_entity(lcid, config)?;

        let mut entities = self.entities.write();
        if entities.contains_key(&lcid) {
            return Err(RlcError::BearerExists(lcid));
        }
        entities.insert(lcid, Arc::new(Mutex::new(entity)));
        info!("Added {} bearer {}", config.mode, lcid);
        Ok(())
    }

    /// Configure a bearer, creating it if needed. A change of mode replaces
    /// the entity. On error any existing entity is left untouched.
    pub fn configure(&self, lcid: Lcid, config: &RlcConfig) -> Result<(), RlcError> {
        let existing = self.entities.read().get(&lcid).cloned();
        if let Some(entity) = existing {
            let mut entity = entity.lock();
            if entity.mode() == config.mode {
                return entity.configure(config);
            }
            info!("{} changing mode {} -> {}", lcid, entity.mode(), config.mode);
        }

        let entity = self.create_entity(lcid, config)?;
        self.entities.write().insert(lcid, Arc::new(Mutex::new(entity)));
        Ok(())
    }

    /// Remove a bearer, discarding its buffers
    pub fn remove_bearer(&self, lcid: Lcid) -> Result<(), RlcError> {
        match self.entities.write().remove(&lcid) {
            Some(_) => {
                info!("Removed bearer {}", lcid);
                Ok(())
            }
            None => Err(RlcError::UnknownBearer(lcid)),
        }
    }

    /// Re-establish one bearer
    pub fn reset(&self, lcid: Lcid) -> Result<(), RlcError> {
        self.entity(lcid)?.lock().reset();
        Ok(())
    }

    /// Re-establish every bearer
    pub fn reset_all(&self) {
        for entity in self.snapshot() {
            entity.lock().reset();
        }
    }

    /// Configured logical channels in ascending order
    pub fn bearers(&self) -> Vec<Lcid> {
        let mut lcids: Vec<Lcid> = self.entities.read().keys().copied().collect();
        lcids.sort();
        lcids
    }

    /// Mode of a bearer
    pub fn mode(&self, lcid: Lcid) -> Result<RlcMode, RlcError> {
        Ok(self.entity(lcid)?.lock().mode())
    }

    /// Lifecycle state of a bearer
    pub fn state(&self, lcid: Lcid) -> Result<EntityState, RlcError> {
        Ok(self.entity(lcid)?.lock().state())
    }

    /// Counters of a bearer
    pub fn stats(&self, lcid: Lcid) -> Result<RlcStats, RlcError> {
        Ok(self.entity(lcid)?.lock().stats())
    }

    /// Counters summed over every bearer
    pub fn total_stats(&self) -> RlcStats {
        let mut total = RlcStats::default();
        for entity in self.snapshot() {
            total += entity.lock().stats();
        }
        total
    }

    /*************************************************************************
     * Upper layer interface
     ************************************************************************/

    /// Queue an SDU for transmission
    pub fn write_sdu(&self, lcid: Lcid, sdu: Bytes) -> Result<(), RlcError> {
        self.with_entity(lcid, |entity| entity.write_sdu(sdu))
    }

    /// Drain reassembled SDUs when no upper interface is attached
    pub fn read_sdus(&self, lcid: Lcid) -> Result<Vec<Bytes>, RlcError> {
        Ok(self.entity(lcid)?.lock().read_sdu())
    }

    /// Take a pending radio link failure when no upper interface is
    /// attached. Returns true once per failure.
    pub fn take_radio_link_failure(&self, lcid: Lcid) -> Result<bool, RlcError> {
        let failed = self.entity(lcid)?.lock().take_radio_link_failure();
        if failed {
            error!("{} radio link failure", lcid);
        }
        Ok(failed)
    }

    /*************************************************************************
     * Lower layer interface
     ************************************************************************/

    /// Bytes the scheduler should grant to empty the bearer
    pub fn get_buffer_state(&self, lcid: Lcid) -> Result<u32, RlcError> {
        Ok(self.entity(lcid)?.lock().get_buffer_state())
    }

    /// Build one PDU for a transmission opportunity of `payload.len()` bytes
    pub fn read_pdu(&self, lcid: Lcid, payload: &mut [u8]) -> Result<usize, RlcError> {
        self.with_entity(lcid, |entity| entity.read_pdu(payload))
    }

    /// Handle a PDU received on `lcid`
    pub fn write_pdu(&self, lcid: Lcid, pdu: &[u8]) -> Result<(), RlcError> {
        self.with_entity(lcid, |entity| entity.write_pdu(pdu))
    }

    /*************************************************************************
     * Timer interface
     ************************************************************************/

    /// Feed an expiry posted by the timer service
    pub fn timer_expired(&self, expiry: TimerExpiry) {
        let result = self.with_entity(expiry.lcid, |entity| {
            entity.timer_expired(expiry.timer, expiry.generation)
        });
        if result.is_err() {
            debug!("{} removed, ignoring {:?} expiry", expiry.lcid, expiry.timer);
        }
    }

    /*************************************************************************
     * Helpers
     ************************************************************************/

    fn entity(&self, lcid: Lcid) -> Result<Arc<Mutex<RlcEntity>>, RlcError> {
        self.entities
            .read()
            .get(&lcid)
            .cloned()
            .ok_or(RlcError::UnknownBearer(lcid))
    }

    fn snapshot(&self) -> Vec<Arc<Mutex<RlcEntity>>> {
        self.entities.read().values().cloned().collect()
    }

    /// Run `f` under the entity lock, then deliver what it produced
    fn with_entity<T>(&self, lcid: Lcid, f: impl FnOnce(&mut RlcEntity) -> T) -> Result<T, RlcError> {
        let entity = self.entity(lcid)?;
        let (result, pending) = {
            let mut entity = entity.lock();
            let result = f(&mut entity);
            // Pull mode leaves both for the owner to take
            let mut pending = Pending::default();
            if self.upper.is_some() {
                pending.link_failure = entity.take_radio_link_failure();
                pending.sdus = entity.read_sdu();
            }
            (result, pending)
        };
        self.notify(lcid, pending);
        Ok(result)
    }

    fn notify(&self, lcid: Lcid, pending: Pending) {
        let Some(upper) = &self.upper else {
            return;
        };
        for sdu in pending.sdus {
            upper.deliver_sdu(lcid, sdu);
        }
        if pending.link_failure {
            error!("{} radio link failure", lcid);
            upper.radio_link_failure(lcid);
        }
    }
}
