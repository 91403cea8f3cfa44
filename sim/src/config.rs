//! Simulation Configuration
//!
//! YAML or TOML description of a loopback run: the bearers to set up on both
//! ends, the lossy channel between them and the traffic offered on the
//! uplink.

use anyhow::{anyhow, bail, Result};
use common::{Lcid, RlcMode, SnFieldLength};
use rlc::RlcConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level simulation configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SimConfig {
    /// Bearers configured identically on both ends
    #[serde(default = "default_bearers")]
    pub bearers: Vec<BearerConfig>,
    /// Channel model
    #[serde(default)]
    pub channel: ChannelConfig,
    /// Offered traffic
    #[serde(default)]
    pub traffic: TrafficConfig,
}

/// One logical channel
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BearerConfig {
    /// Logical channel identity
    pub lcid: u8,
    /// RLC parameters
    pub rlc: RlcConfig,
}

/// Lossy channel between the two stacks
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChannelConfig {
    /// Probability of losing a PDU, each direction
    #[serde(default = "default_loss_rate")]
    pub loss_rate: f64,
    /// Transmission time interval in ms
    #[serde(default = "default_tti_ms")]
    pub tti_ms: u64,
    /// Grant per bearer, direction and TTI in bytes
    #[serde(default = "default_grant_bytes")]
    pub grant_bytes: usize,
    /// Seed of the loss pattern
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Stop after this many TTIs without any PDU on the channel
    #[serde(default = "default_quiet_ttis")]
    pub quiet_ttis: u64,
    /// Hard limit on the run length in TTIs
    #[serde(default = "default_max_ttis")]
    pub max_ttis: u64,
}

/// Uplink traffic per bearer
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TrafficConfig {
    /// SDUs queued on every bearer at start
    #[serde(default = "default_sdu_count")]
    pub sdu_count: u32,
    /// SDU size in bytes
    #[serde(default = "default_sdu_size")]
    pub sdu_size: usize,
}

fn default_bearers() -> Vec<BearerConfig> {
    vec![
        BearerConfig {
            lcid: 3,
            rlc: RlcConfig::am(),
        },
        BearerConfig {
            lcid: 4,
            rlc: RlcConfig::um(SnFieldLength::Bits10),
        },
    ]
}

fn default_loss_rate() -> f64 {
    0.1
}

fn default_tti_ms() -> u64 {
    1
}

fn default_grant_bytes() -> usize {
    150
}

fn default_seed() -> u64 {
    1
}

fn default_quiet_ttis() -> u64 {
    500
}

fn default_max_ttis() -> u64 {
    60_000
}

fn default_sdu_count() -> u32 {
    100
}

fn default_sdu_size() -> usize {
    500
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            loss_rate: default_loss_rate(),
            tti_ms: default_tti_ms(),
            grant_bytes: default_grant_bytes(),
            seed: default_seed(),
            quiet_ttis: default_quiet_ttis(),
            max_ttis: default_max_ttis(),
        }
    }
}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            sdu_count: default_sdu_count(),
            sdu_size: default_sdu_size(),
        }
    }
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            bearers: default_bearers(),
            channel: ChannelConfig::default(),
            traffic: TrafficConfig::default(),
        }
    }
}

impl BearerConfig {
    /// Validated logical channel identity
    pub fn lcid(&self) -> Result<Lcid> {
        Lcid::new(self.lcid).ok_or_else(|| anyhow!("Invalid LCID: {}", self.lcid))
    }
}

impl SimConfig {
    /// Load a configuration file, YAML or TOML by extension
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml(&contents)?,
            _ => Self::from_yaml(&contents)?,
        };
        Ok(config)
    }

    /// Parse a YAML configuration
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: SimConfig = serde_yaml::from_str(contents)?;
        Ok(config)
    }

    /// Parse a TOML configuration
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: SimConfig = toml::from_str(contents)?;
        Ok(config)
    }

    /// Check the run can make progress
    pub fn validate(&self) -> Result<()> {
        if self.bearers.is_empty() {
            bail!("No bearers configured");
        }
        let mut seen = Vec::new();
        for bearer in &self.bearers {
            let lcid = bearer.lcid()?;
            if seen.contains(&lcid) {
                bail!("Duplicate bearer {}", lcid);
            }
            seen.push(lcid);
            bearer.rlc.validate()?;
            if bearer.rlc.mode == RlcMode::Tm && self.traffic.sdu_size > self.channel.grant_bytes {
                bail!("TM bearer {} cannot carry {} byte SDUs in {} byte grants",
                      lcid, self.traffic.sdu_size, self.channel.grant_bytes);
            }
        }
        if !(0.0..1.0).contains(&self.channel.loss_rate) {
            bail!("Loss rate {} outside [0, 1)", self.channel.loss_rate);
        }
        if self.channel.tti_ms == 0 {
            bail!("TTI must be at least 1 ms");
        }
        // Room for a header with a few length indicators plus data
        if self.channel.grant_bytes < 8 {
            bail!("Grant of {} bytes too small", self.channel.grant_bytes);
        }
        if self.traffic.sdu_size < 4 {
            bail!("SDU size must be at least 4 bytes to carry a sequence tag");
        }
        Ok(())
    }
}
