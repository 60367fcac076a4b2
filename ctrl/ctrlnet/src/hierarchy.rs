// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The canonical PEM → PF → VF function tree.
//!
//! A fixed-capacity arena built once from configuration. Entries carry a
//! valid flag and are tombstoned rather than removed; indices are never
//! reused during a run. Lookups return `None` for out-of-range indices and
//! tombstoned entries alike, which callers surface to the host as
//! `INVALID_PARAM`.

use crate::backend::Backend;
use crate::backend::DeviceError;
use crate::backend::NetDevice;
use crate::backend::NetDeviceProvider;
use ctrlnet_defs::net::FnAddr;
use ctrlnet_defs::net::LinkInfo;
use ctrlnet_defs::net::LinkState;
use std::sync::Arc;
use thiserror::Error;

pub const MAX_PEM: usize = 8;
pub const MAX_PF: usize = 16;
pub const MAX_VF: usize = 64;

/// Heartbeat interval bounds, milliseconds.
pub const MIN_HB_INTERVAL_MS: u32 = 1000;
pub const MAX_HB_INTERVAL_MS: u32 = 15000;
pub const DEFAULT_HB_INTERVAL_MS: u32 = MIN_HB_INTERVAL_MS;
pub const DEFAULT_HB_MISS_COUNT: u32 = 20;

#[derive(Debug, Error)]
pub enum HierarchyError {
    #[error("{what} index {idx} out of range (max {max})")]
    IndexOutOfRange {
        what: &'static str,
        idx: usize,
        max: usize,
    },
    #[error("duplicate {what} index {idx}")]
    DuplicateIndex { what: &'static str, idx: usize },
}

/// Network interface configuration, the unit reloaded on every reset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfaceConfig {
    pub mtu: u16,
    pub mac_addr: [u8; 6],
    pub link_state: LinkState,
    pub rx_state: LinkState,
    pub autoneg: u8,
    pub pause_mode: u8,
    pub speed: u32,
    pub supported_modes: u64,
    pub advertised_modes: u64,
}

impl IfaceConfig {
    pub fn link_info(&self) -> LinkInfo {
        LinkInfo {
            autoneg: self.autoneg,
            pause: self.pause_mode,
            reserved: 0,
            speed: self.speed,
            supported_modes: self.supported_modes,
            advertised_modes: self.advertised_modes,
        }
    }

    /// Applies the host-writable link parameters.
    pub fn apply_link_info(&mut self, info: &LinkInfo) {
        self.autoneg = info.autoneg;
        self.pause_mode = info.pause;
        self.speed = info.speed;
        self.advertised_modes = info.advertised_modes;
    }
}

/// Per-PF heartbeat parameters advertised to the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeartbeatParams {
    pub interval_ms: u32,
    pub miss_count: u32,
}

impl Default for HeartbeatParams {
    fn default() -> Self {
        Self {
            interval_ms: DEFAULT_HB_INTERVAL_MS,
            miss_count: DEFAULT_HB_MISS_COUNT,
        }
    }
}

impl HeartbeatParams {
    /// Clamps the interval into the supported range.
    pub fn clamped(self) -> Self {
        Self {
            interval_ms: self
                .interval_ms
                .clamp(MIN_HB_INTERVAL_MS, MAX_HB_INTERVAL_MS),
            miss_count: self.miss_count,
        }
    }
}

/// Startup definition of one VF.
#[derive(Debug, Clone)]
pub struct VfDef {
    pub idx: u16,
    pub iface: IfaceConfig,
    /// Bound to a data-plane device rather than stub-answered.
    pub plugin: bool,
    pub pkind: u16,
}

/// Startup definition of one PF.
#[derive(Debug, Clone)]
pub struct PfDef {
    pub idx: u16,
    pub iface: IfaceConfig,
    pub plugin: bool,
    pub pkind: u16,
    pub heartbeat: HeartbeatParams,
    pub vfs: Vec<VfDef>,
}

/// Startup definition of one PEM.
#[derive(Debug, Clone)]
pub struct PemDef {
    pub idx: u8,
    pub pfs: Vec<PfDef>,
}

/// Whole-tree startup configuration, retained for reset reloads.
#[derive(Debug, Clone, Default)]
pub struct HierarchyConfig {
    pub pems: Vec<PemDef>,
}

pub struct Vf {
    pub idx: u16,
    pub host_if_id: u16,
    pub pkind: u16,
    valid: bool,
    defaults: IfaceConfig,
    pub backend: Backend,
}

pub struct Pf {
    pub idx: u16,
    pub host_if_id: u16,
    pub pkind: u16,
    pub heartbeat: HeartbeatParams,
    valid: bool,
    defaults: IfaceConfig,
    pub backend: Backend,
    vfs: Vec<Option<Vf>>,
}

pub struct Pem {
    pub idx: u8,
    in_reset: bool,
    pfs: Vec<Option<Pf>>,
}

/// The function arena.
pub struct FunctionHierarchy {
    pems: Vec<Option<Pem>>,
}

fn make_backend(
    provider: &dyn NetDeviceProvider,
    pem: u8,
    pf: u16,
    vf: Option<u16>,
    plugin: bool,
    iface: &IfaceConfig,
) -> Backend {
    if plugin {
        match provider.device(pem, pf, vf) {
            Some(dev) => match Backend::nic(dev, iface) {
                Ok(b) => return b,
                Err(err) => {
                    tracing::warn!(pem, pf, vf, %err, "device bind failed, using stub");
                }
            },
            None => {
                tracing::warn!(pem, pf, vf, "no device for plugin function, using stub");
            }
        }
    }
    Backend::stub(iface.clone())
}

impl Vf {
    fn reset(&mut self) -> Result<(), DeviceError> {
        self.backend.reset(&self.defaults)
    }
}

impl Pf {
    pub fn vf(&self, idx: u16) -> Option<&Vf> {
        self.vfs
            .get(idx as usize)?
            .as_ref()
            .filter(|vf| vf.valid)
    }

    pub fn vf_mut(&mut self, idx: u16) -> Option<&mut Vf> {
        self.vfs
            .get_mut(idx as usize)?
            .as_mut()
            .filter(|vf| vf.valid)
    }

    pub fn valid_vfs(&self) -> impl Iterator<Item = &Vf> {
        self.vfs.iter().flatten().filter(|vf| vf.valid)
    }

    fn valid_vfs_mut(&mut self) -> impl Iterator<Item = &mut Vf> {
        self.vfs.iter_mut().flatten().filter(|vf| vf.valid)
    }

    /// Reloads this PF and all its VFs from configured defaults.
    fn reset(&mut self) -> Result<(), DeviceError> {
        self.backend.reset(&self.defaults)?;
        for vf in self.valid_vfs_mut() {
            vf.reset()?;
        }
        Ok(())
    }
}

impl FunctionHierarchy {
    /// Builds the arena from `cfg`, choosing backends via `provider`.
    pub fn new(
        cfg: &HierarchyConfig,
        provider: &dyn NetDeviceProvider,
    ) -> Result<Self, HierarchyError> {
        let mut pems: Vec<Option<Pem>> = (0..MAX_PEM).map(|_| None).collect();
        for pem_def in &cfg.pems {
            let pem_idx = pem_def.idx as usize;
            if pem_idx >= MAX_PEM {
                return Err(HierarchyError::IndexOutOfRange {
                    what: "pem",
                    idx: pem_idx,
                    max: MAX_PEM - 1,
                });
            }
            if pems[pem_idx].is_some() {
                return Err(HierarchyError::DuplicateIndex {
                    what: "pem",
                    idx: pem_idx,
                });
            }

            let mut pfs: Vec<Option<Pf>> = (0..MAX_PF).map(|_| None).collect();
            for pf_def in &pem_def.pfs {
                let pf_idx = pf_def.idx as usize;
                if pf_idx >= MAX_PF {
                    return Err(HierarchyError::IndexOutOfRange {
                        what: "pf",
                        idx: pf_idx,
                        max: MAX_PF - 1,
                    });
                }
                if pfs[pf_idx].is_some() {
                    return Err(HierarchyError::DuplicateIndex {
                        what: "pf",
                        idx: pf_idx,
                    });
                }

                let mut vfs: Vec<Option<Vf>> = (0..MAX_VF).map(|_| None).collect();
                for vf_def in &pf_def.vfs {
                    let vf_idx = vf_def.idx as usize;
                    if vf_idx >= MAX_VF {
                        return Err(HierarchyError::IndexOutOfRange {
                            what: "vf",
                            idx: vf_idx,
                            max: MAX_VF - 1,
                        });
                    }
                    if vfs[vf_idx].is_some() {
                        return Err(HierarchyError::DuplicateIndex {
                            what: "vf",
                            idx: vf_idx,
                        });
                    }
                    vfs[vf_idx] = Some(Vf {
                        idx: vf_def.idx,
                        host_if_id: 0,
                        pkind: vf_def.pkind,
                        valid: true,
                        defaults: vf_def.iface.clone(),
                        backend: make_backend(
                            provider,
                            pem_def.idx,
                            pf_def.idx,
                            Some(vf_def.idx),
                            vf_def.plugin,
                            &vf_def.iface,
                        ),
                    });
                }

                pfs[pf_idx] = Some(Pf {
                    idx: pf_def.idx,
                    host_if_id: 0,
                    pkind: pf_def.pkind,
                    heartbeat: pf_def.heartbeat.clamped(),
                    valid: true,
                    defaults: pf_def.iface.clone(),
                    backend: make_backend(
                        provider,
                        pem_def.idx,
                        pf_def.idx,
                        None,
                        pf_def.plugin,
                        &pf_def.iface,
                    ),
                    vfs,
                });
            }

            pems[pem_idx] = Some(Pem {
                idx: pem_def.idx,
                in_reset: false,
                pfs,
            });
        }
        Ok(Self { pems })
    }

    pub fn pem(&self, pem: u8) -> Option<&Pem> {
        self.pems.get(pem as usize)?.as_ref()
    }

    fn pem_mut(&mut self, pem: u8) -> Option<&mut Pem> {
        self.pems.get_mut(pem as usize)?.as_mut()
    }

    pub fn pf(&self, pem: u8, pf: u16) -> Option<&Pf> {
        self.pem(pem)?
            .pfs
            .get(pf as usize)?
            .as_ref()
            .filter(|p| p.valid)
    }

    pub fn pf_mut(&mut self, pem: u8, pf: u16) -> Option<&mut Pf> {
        self.pem_mut(pem)?
            .pfs
            .get_mut(pf as usize)?
            .as_mut()
            .filter(|p| p.valid)
    }

    /// Resolves the backend a message addresses, or `None` for any unknown
    /// or tombstoned receiver.
    pub fn backend_mut(&mut self, addr: FnAddr) -> Option<&mut Backend> {
        let pf = self.pf_mut(addr.pem, addr.pf)?;
        match addr.vf {
            None => Some(&mut pf.backend),
            Some(vf) => Some(&mut pf.vf_mut(vf)?.backend),
        }
    }

    /// Rebinds a function to a data-plane device, or back to the stub when
    /// `dev` is `None`. The current MAC address is carried across the swap;
    /// everything else starts from the configured defaults.
    pub fn set_port(
        &mut self,
        addr: FnAddr,
        dev: Option<Arc<dyn NetDevice>>,
    ) -> Result<(), DeviceError> {
        let Some(pf) = self.pf_mut(addr.pem, addr.pf) else {
            return Err(DeviceError::Unsupported);
        };
        let (defaults, backend) = match addr.vf {
            None => (&pf.defaults, &mut pf.backend),
            Some(vf) => {
                let Some(vf) = pf
                    .vfs
                    .get_mut(vf as usize)
                    .and_then(|v| v.as_mut())
                    .filter(|v| v.valid)
                else {
                    return Err(DeviceError::Unsupported);
                };
                (&vf.defaults, &mut vf.backend)
            }
        };
        let mut iface = defaults.clone();
        iface.mac_addr = backend.mac()?;
        *backend = match dev {
            Some(dev) => Backend::nic(dev, &iface)?,
            None => Backend::stub(iface),
        };
        tracing::info!(?addr, kind = backend.kind(), "port mapping changed");
        Ok(())
    }

    /// Records which host interface is speaking for this function.
    pub fn set_host_if(&mut self, addr: FnAddr, sender: u16) {
        if let Some(pf) = self.pf_mut(addr.pem, addr.pf) {
            match addr.vf {
                None => pf.host_if_id = sender,
                Some(vf) => {
                    if let Some(vf) = pf.vf_mut(vf) {
                        vf.host_if_id = sender;
                    }
                }
            }
        }
    }

    /// `(pkind, heartbeat)` for GET_INFO; VFs advertise no heartbeat.
    pub fn fn_info(&self, addr: FnAddr) -> Option<(u16, HeartbeatParams)> {
        let pf = self.pf(addr.pem, addr.pf)?;
        match addr.vf {
            None => Some((pf.pkind, pf.heartbeat)),
            Some(vf) => {
                let vf = pf.vf(vf)?;
                Some((
                    vf.pkind,
                    HeartbeatParams {
                        interval_ms: 0,
                        miss_count: 0,
                    },
                ))
            }
        }
    }

    /// All valid PFs, in index order.
    pub fn valid_pfs(&self) -> impl Iterator<Item = (u8, &Pf)> {
        self.pems
            .iter()
            .flatten()
            .flat_map(|pem| pem.pfs.iter().flatten().map(|pf| (pem.idx, pf)))
            .filter(|(_, pf)| pf.valid)
    }

    pub fn pem_in_reset(&self, pem: u8) -> bool {
        self.pem(pem).is_some_and(|p| p.in_reset)
    }

    pub fn set_pem_in_reset(&mut self, pem: u8, in_reset: bool) {
        if let Some(p) = self.pem_mut(pem) {
            p.in_reset = in_reset;
        }
    }

    /// Reloads every function under `pem` from configured defaults.
    pub fn reset_pem(&mut self, pem: u8) -> Result<(), PemResetError> {
        let Some(p) = self.pem_mut(pem) else {
            return Ok(());
        };
        for pf in p.pfs.iter_mut().flatten().filter(|pf| pf.valid) {
            pf.reset().map_err(|source| PemResetError {
                pem,
                pf: pf.idx,
                source,
            })?;
            pf.host_if_id = 0;
        }
        Ok(())
    }

    /// Reloads one PF (and its VFs) from configured defaults.
    pub fn reset_pf(&mut self, pem: u8, pf: u16) -> Result<(), PemResetError> {
        if let Some(p) = self.pf_mut(pem, pf) {
            p.reset().map_err(|source| PemResetError { pem, pf, source })?;
        }
        Ok(())
    }

    /// Reloads one VF from configured defaults.
    pub fn reset_vf(&mut self, pem: u8, pf: u16, vf: u16) -> Result<(), PemResetError> {
        if let Some(p) = self.pf_mut(pem, pf) {
            if let Some(v) = p.vf_mut(vf) {
                return v.reset().map_err(|source| PemResetError { pem, pf, source });
            }
        }
        Ok(())
    }
}

/// A reset reload that could not complete; the affected PEM stays quiesced.
#[derive(Debug, Error)]
#[error("reset reload failed for pem {pem} pf {pf}: {source}")]
pub struct PemResetError {
    pub pem: u8,
    pub pf: u16,
    #[source]
    pub source: DeviceError,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::backend::NoDevices;
    use ctrlnet_defs::net::NetCmd;

    pub(crate) fn small_config() -> HierarchyConfig {
        let iface = |last: u8| IfaceConfig {
            mtu: 1500,
            mac_addr: [2, 0, 0, 0, 0, last],
            ..IfaceConfig::default()
        };
        HierarchyConfig {
            pems: vec![PemDef {
                idx: 0,
                pfs: vec![
                    PfDef {
                        idx: 0,
                        iface: iface(1),
                        plugin: false,
                        pkind: 57,
                        heartbeat: HeartbeatParams {
                            interval_ms: 1000,
                            miss_count: 20,
                        },
                        vfs: vec![
                            VfDef {
                                idx: 0,
                                iface: iface(2),
                                plugin: false,
                                pkind: 57,
                            },
                            VfDef {
                                idx: 3,
                                iface: iface(3),
                                plugin: false,
                                pkind: 57,
                            },
                        ],
                    },
                    PfDef {
                        idx: 2,
                        iface: iface(4),
                        plugin: false,
                        pkind: 58,
                        heartbeat: HeartbeatParams {
                            interval_ms: 100, // below the floor, gets clamped
                            miss_count: 5,
                        },
                        vfs: vec![],
                    },
                ],
            }],
        }
    }

    #[test]
    fn lookup_respects_sparse_indices() {
        let h = FunctionHierarchy::new(&small_config(), &NoDevices).unwrap();
        assert!(h.pf(0, 0).is_some());
        assert!(h.pf(0, 1).is_none());
        assert!(h.pf(0, 2).is_some());
        assert!(h.pf(1, 0).is_none());
        assert!(h.pf(0, 0).unwrap().vf(0).is_some());
        assert!(h.pf(0, 0).unwrap().vf(1).is_none());
        assert!(h.pf(0, 0).unwrap().vf(3).is_some());
        // far out of range
        assert!(h.pf(0, 999).is_none());
        assert!(h.pf(0, 0).unwrap().vf(999).is_none());
    }

    #[test]
    fn heartbeat_interval_clamped() {
        let h = FunctionHierarchy::new(&small_config(), &NoDevices).unwrap();
        assert_eq!(h.pf(0, 2).unwrap().heartbeat.interval_ms, MIN_HB_INTERVAL_MS);
        assert_eq!(h.pf(0, 0).unwrap().heartbeat.interval_ms, 1000);
    }

    #[test]
    fn duplicate_and_out_of_range_rejected() {
        let mut cfg = small_config();
        cfg.pems[0].pfs.push(PfDef {
            idx: 0,
            iface: IfaceConfig::default(),
            plugin: false,
            pkind: 0,
            heartbeat: HeartbeatParams::default(),
            vfs: vec![],
        });
        assert!(matches!(
            FunctionHierarchy::new(&cfg, &NoDevices),
            Err(HierarchyError::DuplicateIndex { what: "pf", .. })
        ));

        let mut cfg = small_config();
        cfg.pems[0].pfs[0].vfs[0].idx = MAX_VF as u16;
        assert!(matches!(
            FunctionHierarchy::new(&cfg, &NoDevices),
            Err(HierarchyError::IndexOutOfRange { what: "vf", .. })
        ));
    }

    #[test]
    fn backend_resolution_by_addr() {
        let mut h = FunctionHierarchy::new(&small_config(), &NoDevices).unwrap();
        assert!(h.backend_mut(FnAddr::pf(0, 0)).is_some());
        assert!(h.backend_mut(FnAddr::vf(0, 0, 3)).is_some());
        assert!(h.backend_mut(FnAddr::vf(0, 0, 2)).is_none());
        assert!(h.backend_mut(FnAddr::pf(7, 0)).is_none());

        // header-decoded addressing takes the same path
        let hdr = FnAddr::vf(0, 0, 0).hdr(NetCmd::MTU);
        assert!(h.backend_mut(FnAddr::from(hdr)).is_some());
    }

    #[test]
    fn set_port_swaps_backend_and_keeps_mac() {
        use crate::backend::tests::MockDevice;

        let mut h = FunctionHierarchy::new(&small_config(), &NoDevices).unwrap();
        h.backend_mut(FnAddr::pf(0, 0))
            .unwrap()
            .set_mac([4, 4, 4, 4, 4, 4])
            .unwrap();

        let dev = Arc::new(MockDevice::default());
        h.set_port(FnAddr::pf(0, 0), Some(dev.clone())).unwrap();
        assert_eq!(h.backend_mut(FnAddr::pf(0, 0)).unwrap().kind(), "nic");
        // the runtime mac followed the function onto the device
        assert_eq!(dev.state.lock().unwrap().mac, [4, 4, 4, 4, 4, 4]);

        h.set_port(FnAddr::pf(0, 0), None).unwrap();
        let b = h.backend_mut(FnAddr::pf(0, 0)).unwrap();
        assert_eq!(b.kind(), "stub");
        assert_eq!(b.mac().unwrap(), [4, 4, 4, 4, 4, 4]);

        assert!(h.set_port(FnAddr::pf(0, 9), None).is_err());
    }

    #[test]
    fn reset_pem_reloads_pf_and_vfs() {
        let mut h = FunctionHierarchy::new(&small_config(), &NoDevices).unwrap();
        h.backend_mut(FnAddr::pf(0, 0)).unwrap().set_mtu(9000).unwrap();
        h.backend_mut(FnAddr::vf(0, 0, 3))
            .unwrap()
            .set_mac([0xff; 6])
            .unwrap();
        h.set_host_if(FnAddr::pf(0, 0), 11);

        h.reset_pem(0).unwrap();
        assert_eq!(h.backend_mut(FnAddr::pf(0, 0)).unwrap().mtu().unwrap(), 1500);
        assert_eq!(
            h.backend_mut(FnAddr::vf(0, 0, 3)).unwrap().mac().unwrap(),
            [2, 0, 0, 0, 0, 3]
        );
        assert_eq!(h.pf(0, 0).unwrap().host_if_id, 0);
    }
}
