// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-function configuration backends.
//!
//! Every PF and VF answers get/set requests through a [`Backend`]: either a
//! [`StubFn`] holding the configuration in process (functions not bound to
//! a real device) or a [`NicFn`] forwarding to a [`NetDevice`] handle.

use crate::hierarchy::IfaceConfig;
use ctrlnet_defs::net::IfStats;
use ctrlnet_defs::net::LinkInfo;
use ctrlnet_defs::net::LinkState;
use std::sync::Arc;
use thiserror::Error;

/// Failure from the underlying device; surfaced to the host as
/// `GENERIC_FAIL`.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("operation not supported by device")]
    Unsupported,
    #[error("device i/o failed: {0}")]
    Io(String),
}

/// A real network device a function can be bound to.
///
/// This is the seam to the platform's device layer (the data-plane plugin);
/// the control plane only translates field names in both directions.
pub trait NetDevice: Send + Sync {
    fn mtu(&self) -> Result<u16, DeviceError>;
    fn set_mtu(&self, mtu: u16) -> Result<(), DeviceError>;
    fn mac(&self) -> Result<[u8; 6], DeviceError>;
    fn set_mac(&self, addr: [u8; 6]) -> Result<(), DeviceError>;
    fn link_state(&self) -> Result<LinkState, DeviceError>;
    fn set_link_state(&self, state: LinkState) -> Result<(), DeviceError>;
    fn rx_state(&self) -> Result<LinkState, DeviceError>;
    fn set_rx_state(&self, state: LinkState) -> Result<(), DeviceError>;
    fn link_info(&self) -> Result<LinkInfo, DeviceError>;
    fn set_link_info(&self, info: &LinkInfo) -> Result<(), DeviceError>;
    fn stats(&self) -> Result<IfStats, DeviceError>;
}

/// In-process backend; state lives here and nowhere else.
#[derive(Debug, Clone)]
pub struct StubFn {
    iface: IfaceConfig,
    stats: IfStats,
}

/// Device-bound backend.
#[derive(Clone)]
pub struct NicFn {
    dev: Arc<dyn NetDevice>,
}

/// The backend variants a function dispatches through.
#[derive(Clone)]
pub enum Backend {
    Stub(StubFn),
    Nic(NicFn),
}

impl Backend {
    pub fn stub(iface: IfaceConfig) -> Self {
        Self::Stub(StubFn {
            iface,
            stats: IfStats::default(),
        })
    }

    /// Binds `dev` and pushes the configured identity (MAC, MTU) down to it.
    pub fn nic(dev: Arc<dyn NetDevice>, iface: &IfaceConfig) -> Result<Self, DeviceError> {
        dev.set_mac(iface.mac_addr)?;
        dev.set_mtu(iface.mtu)?;
        Ok(Self::Nic(NicFn { dev }))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Backend::Stub(_) => "stub",
            Backend::Nic(_) => "nic",
        }
    }

    pub fn mtu(&self) -> Result<u16, DeviceError> {
        match self {
            Backend::Stub(s) => Ok(s.iface.mtu),
            Backend::Nic(n) => n.dev.mtu(),
        }
    }

    pub fn set_mtu(&mut self, mtu: u16) -> Result<(), DeviceError> {
        match self {
            Backend::Stub(s) => {
                s.iface.mtu = mtu;
                Ok(())
            }
            Backend::Nic(n) => n.dev.set_mtu(mtu),
        }
    }

    pub fn mac(&self) -> Result<[u8; 6], DeviceError> {
        match self {
            Backend::Stub(s) => Ok(s.iface.mac_addr),
            Backend::Nic(n) => n.dev.mac(),
        }
    }

    pub fn set_mac(&mut self, addr: [u8; 6]) -> Result<(), DeviceError> {
        match self {
            Backend::Stub(s) => {
                s.iface.mac_addr = addr;
                Ok(())
            }
            Backend::Nic(n) => n.dev.set_mac(addr),
        }
    }

    pub fn link_state(&self) -> Result<LinkState, DeviceError> {
        match self {
            Backend::Stub(s) => Ok(s.iface.link_state),
            Backend::Nic(n) => n.dev.link_state(),
        }
    }

    pub fn set_link_state(&mut self, state: LinkState) -> Result<(), DeviceError> {
        match self {
            Backend::Stub(s) => {
                s.iface.link_state = state;
                Ok(())
            }
            Backend::Nic(n) => n.dev.set_link_state(state),
        }
    }

    pub fn rx_state(&self) -> Result<LinkState, DeviceError> {
        match self {
            Backend::Stub(s) => Ok(s.iface.rx_state),
            Backend::Nic(n) => n.dev.rx_state(),
        }
    }

    pub fn set_rx_state(&mut self, state: LinkState) -> Result<(), DeviceError> {
        match self {
            Backend::Stub(s) => {
                s.iface.rx_state = state;
                Ok(())
            }
            Backend::Nic(n) => n.dev.set_rx_state(state),
        }
    }

    pub fn link_info(&self) -> Result<LinkInfo, DeviceError> {
        match self {
            Backend::Stub(s) => Ok(s.iface.link_info()),
            Backend::Nic(n) => n.dev.link_info(),
        }
    }

    /// Applies the writable link parameters; `supported_modes` stays as the
    /// function reported it.
    pub fn set_link_info(&mut self, info: &LinkInfo) -> Result<(), DeviceError> {
        match self {
            Backend::Stub(s) => {
                s.iface.apply_link_info(info);
                Ok(())
            }
            Backend::Nic(n) => n.dev.set_link_info(info),
        }
    }

    pub fn stats(&self) -> Result<IfStats, DeviceError> {
        match self {
            Backend::Stub(s) => Ok(s.stats),
            Backend::Nic(n) => n.dev.stats(),
        }
    }

    /// Reinitializes the function to its configured defaults.
    pub fn reset(&mut self, defaults: &IfaceConfig) -> Result<(), DeviceError> {
        match self {
            Backend::Stub(s) => {
                s.iface = defaults.clone();
                s.stats = IfStats::default();
                Ok(())
            }
            Backend::Nic(n) => {
                n.dev.set_mac(defaults.mac_addr)?;
                n.dev.set_mtu(defaults.mtu)?;
                n.dev.set_link_info(&defaults.link_info())
            }
        }
    }
}

/// Resolves device handles for plugin-controlled functions at startup and
/// on port remapping.
pub trait NetDeviceProvider {
    fn device(
        &self,
        pem: u8,
        pf: u16,
        vf: Option<u16>,
    ) -> Option<Arc<dyn NetDevice>>;
}

/// Provider with no devices; every function falls back to a stub backend.
pub struct NoDevices;

impl NetDeviceProvider for NoDevices {
    fn device(&self, _pem: u8, _pf: u16, _vf: Option<u16>) -> Option<Arc<dyn NetDevice>> {
        None
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;
    use std::sync::atomic::Ordering::Relaxed;

    /// Records every set and answers gets from plain fields. Flipping
    /// `fail_sets` makes every subsequent mutation fail.
    #[derive(Default)]
    pub(crate) struct MockDevice {
        pub state: Mutex<MockState>,
        pub fail_sets: AtomicBool,
    }

    #[derive(Default)]
    pub(crate) struct MockState {
        pub mtu: u16,
        pub mac: [u8; 6],
        pub link: LinkState,
        pub rx: LinkState,
        pub info: LinkInfo,
        pub sets: usize,
    }

    impl MockDevice {
        fn check(&self) -> Result<(), DeviceError> {
            if self.fail_sets.load(Relaxed) {
                return Err(DeviceError::Io("register write failed".into()));
            }
            Ok(())
        }
    }

    /// Hands the same device to every plugin-controlled function.
    pub(crate) struct OneDevice(pub Arc<MockDevice>);

    impl NetDeviceProvider for OneDevice {
        fn device(&self, _pem: u8, _pf: u16, _vf: Option<u16>) -> Option<Arc<dyn NetDevice>> {
            Some(self.0.clone())
        }
    }

    impl NetDevice for MockDevice {
        fn mtu(&self) -> Result<u16, DeviceError> {
            Ok(self.state.lock().unwrap().mtu)
        }

        fn set_mtu(&self, mtu: u16) -> Result<(), DeviceError> {
            self.check()?;
            let mut s = self.state.lock().unwrap();
            s.mtu = mtu;
            s.sets += 1;
            Ok(())
        }

        fn mac(&self) -> Result<[u8; 6], DeviceError> {
            Ok(self.state.lock().unwrap().mac)
        }

        fn set_mac(&self, addr: [u8; 6]) -> Result<(), DeviceError> {
            self.check()?;
            let mut s = self.state.lock().unwrap();
            s.mac = addr;
            s.sets += 1;
            Ok(())
        }

        fn link_state(&self) -> Result<LinkState, DeviceError> {
            Ok(self.state.lock().unwrap().link)
        }

        fn set_link_state(&self, state: LinkState) -> Result<(), DeviceError> {
            self.state.lock().unwrap().link = state;
            Ok(())
        }

        fn rx_state(&self) -> Result<LinkState, DeviceError> {
            Ok(self.state.lock().unwrap().rx)
        }

        fn set_rx_state(&self, state: LinkState) -> Result<(), DeviceError> {
            self.state.lock().unwrap().rx = state;
            Ok(())
        }

        fn link_info(&self) -> Result<LinkInfo, DeviceError> {
            Ok(self.state.lock().unwrap().info)
        }

        fn set_link_info(&self, info: &LinkInfo) -> Result<(), DeviceError> {
            self.state.lock().unwrap().info = *info;
            Ok(())
        }

        fn stats(&self) -> Result<IfStats, DeviceError> {
            Ok(IfStats {
                rx_pkts: 42,
                ..IfStats::default()
            })
        }
    }

    fn iface() -> IfaceConfig {
        IfaceConfig {
            mtu: 1500,
            mac_addr: [2, 0, 0, 0, 0, 1],
            ..IfaceConfig::default()
        }
    }

    #[test]
    fn stub_round_trips_state() {
        let mut b = Backend::stub(iface());
        assert_eq!(b.mtu().unwrap(), 1500);
        b.set_mtu(9000).unwrap();
        assert_eq!(b.mtu().unwrap(), 9000);

        b.set_link_state(LinkState::UP).unwrap();
        assert_eq!(b.link_state().unwrap(), LinkState::UP);
        // rx state is independent
        assert_eq!(b.rx_state().unwrap(), LinkState::DOWN);
    }

    #[test]
    fn stub_reset_restores_defaults() {
        let mut b = Backend::stub(iface());
        b.set_mtu(600).unwrap();
        b.set_mac([0xff; 6]).unwrap();
        b.reset(&iface()).unwrap();
        assert_eq!(b.mtu().unwrap(), 1500);
        assert_eq!(b.mac().unwrap(), [2, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn nic_forwards_to_device() {
        let dev = Arc::new(MockDevice::default());
        let mut b = Backend::nic(dev.clone(), &iface()).unwrap();
        // binding pushed the configured identity down
        assert_eq!(dev.state.lock().unwrap().mac, [2, 0, 0, 0, 0, 1]);
        assert_eq!(dev.state.lock().unwrap().mtu, 1500);

        b.set_mtu(4000).unwrap();
        assert_eq!(dev.state.lock().unwrap().mtu, 4000);
        assert_eq!(b.mtu().unwrap(), 4000);
        assert_eq!(b.stats().unwrap().rx_pkts, 42);
    }

    #[test]
    fn supported_modes_not_writable_on_stub() {
        let mut b = Backend::stub(IfaceConfig {
            supported_modes: 0xf,
            ..IfaceConfig::default()
        });
        b.set_link_info(&LinkInfo {
            supported_modes: 0xffff,
            advertised_modes: 0x3,
            speed: 25_000,
            ..LinkInfo::default()
        })
        .unwrap();
        let info = b.link_info().unwrap();
        assert_eq!(info.supported_modes, 0xf);
        assert_eq!(info.advertised_modes, 0x3);
        assert_eq!(info.speed, 25_000);
    }
}
