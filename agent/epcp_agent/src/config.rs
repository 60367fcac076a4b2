// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Agent configuration file.
//!
//! JSON describing the function tree and mailbox sizing:
//!
//! ```json
//! {
//!   "mailbox": { "region_size": 32768 },
//!   "pems": [
//!     {
//!       "idx": 0,
//!       "pfs": [
//!         {
//!           "idx": 0,
//!           "pkind": 57,
//!           "heartbeat": { "interval_ms": 1000, "miss_count": 20 },
//!           "iface": { "mtu": 1500, "mac": "02:00:00:00:00:01" },
//!           "vfs": [ { "idx": 0, "iface": { "mac": "02:00:00:00:01:00" } } ]
//!         }
//!       ]
//!     }
//!   ]
//! }
//! ```

use anyhow::Context;
use ctrlnet::hierarchy::HeartbeatParams;
use ctrlnet::hierarchy::HierarchyConfig;
use ctrlnet::hierarchy::IfaceConfig;
use ctrlnet::hierarchy::PemDef;
use ctrlnet::hierarchy::PfDef;
use ctrlnet::hierarchy::VfDef;
use ctrlnet_defs::net::LinkState;
use macaddr::MacAddr6;
use serde::Deserialize;
use std::path::Path;

/// Default shared region size, one 32 KiB BAR slot.
pub const DEFAULT_REGION_SIZE: usize = 32 * 1024;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    #[serde(default)]
    pub mailbox: MailboxConfig,
    pub pems: Vec<PemConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MailboxConfig {
    #[serde(default = "default_region_size")]
    pub region_size: usize,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            region_size: DEFAULT_REGION_SIZE,
        }
    }
}

fn default_region_size() -> usize {
    DEFAULT_REGION_SIZE
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PemConfig {
    pub idx: u8,
    pub pfs: Vec<PfConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PfConfig {
    pub idx: u16,
    #[serde(default)]
    pub plugin: bool,
    #[serde(default)]
    pub pkind: u16,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub iface: IfaceDef,
    #[serde(default)]
    pub vfs: Vec<VfConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VfConfig {
    pub idx: u16,
    #[serde(default)]
    pub plugin: bool,
    #[serde(default)]
    pub pkind: u16,
    #[serde(default)]
    pub iface: IfaceDef,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeartbeatConfig {
    pub interval_ms: u32,
    pub miss_count: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        let params = HeartbeatParams::default();
        Self {
            interval_ms: params.interval_ms,
            miss_count: params.miss_count,
        }
    }
}

#[derive(Debug, Copy, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateDef {
    Down,
    Up,
}

impl From<StateDef> for LinkState {
    fn from(value: StateDef) -> Self {
        match value {
            StateDef::Down => LinkState::DOWN,
            StateDef::Up => LinkState::UP,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IfaceDef {
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    #[serde(default = "nil_mac", deserialize_with = "de_mac")]
    pub mac: MacAddr6,
    #[serde(default = "down")]
    pub link_state: StateDef,
    #[serde(default = "down")]
    pub rx_state: StateDef,
    #[serde(default)]
    pub autoneg: bool,
    #[serde(default)]
    pub pause_mode: bool,
    #[serde(default)]
    pub speed: u32,
    #[serde(default)]
    pub supported_modes: u64,
    #[serde(default)]
    pub advertised_modes: u64,
}

fn default_mtu() -> u16 {
    1500
}

fn nil_mac() -> MacAddr6 {
    MacAddr6::nil()
}

fn down() -> StateDef {
    StateDef::Down
}

impl Default for IfaceDef {
    fn default() -> Self {
        Self {
            mtu: default_mtu(),
            mac: MacAddr6::nil(),
            link_state: StateDef::Down,
            rx_state: StateDef::Down,
            autoneg: false,
            pause_mode: false,
            speed: 0,
            supported_modes: 0,
            advertised_modes: 0,
        }
    }
}

fn de_mac<'de, D>(deserializer: D) -> Result<MacAddr6, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    raw.parse().map_err(serde::de::Error::custom)
}

impl From<&IfaceDef> for IfaceConfig {
    fn from(def: &IfaceDef) -> Self {
        IfaceConfig {
            mtu: def.mtu,
            mac_addr: def.mac.into_array(),
            link_state: def.link_state.into(),
            rx_state: def.rx_state.into(),
            autoneg: def.autoneg as u8,
            pause_mode: def.pause_mode as u8,
            speed: def.speed,
            supported_modes: def.supported_modes,
            advertised_modes: def.advertised_modes,
        }
    }
}

impl AgentConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Lowers the file form into the hierarchy's startup definition.
    pub fn hierarchy(&self) -> HierarchyConfig {
        HierarchyConfig {
            pems: self
                .pems
                .iter()
                .map(|pem| PemDef {
                    idx: pem.idx,
                    pfs: pem
                        .pfs
                        .iter()
                        .map(|pf| PfDef {
                            idx: pf.idx,
                            iface: (&pf.iface).into(),
                            plugin: pf.plugin,
                            pkind: pf.pkind,
                            heartbeat: HeartbeatParams {
                                interval_ms: pf.heartbeat.interval_ms,
                                miss_count: pf.heartbeat.miss_count,
                            },
                            vfs: pf
                                .vfs
                                .iter()
                                .map(|vf| VfDef {
                                    idx: vf.idx,
                                    iface: (&vf.iface).into(),
                                    plugin: vf.plugin,
                                    pkind: vf.pkind,
                                })
                                .collect(),
                        })
                        .collect(),
                })
                .collect(),
        }
    }
}
