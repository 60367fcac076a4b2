// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control-net protocol: routing header, commands, and payload layouts.
//!
//! Every control message's payload starts with one [`NetHdr`] word naming
//! the addressed function and the command; command-specific data follows as
//! word-aligned structs. Responses echo the request header with the reply
//! code filled in.

use crate::mbox::WORD_BYTES;
use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Control-net command.
///
/// One command space for both directions: the host issues everything up to
/// `GET_INFO`; `LINK_STATUS` doubles as the target's link-change
/// notification, and `HEARTBEAT` is target-to-host only.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct NetCmd(pub u8);

impl NetCmd {
    pub const INVALID: Self = Self(0);
    pub const MTU: Self = Self(1);
    pub const MAC: Self = Self(2);
    pub const GET_IF_STATS: Self = Self(3);
    pub const LINK_STATUS: Self = Self(4);
    pub const RX_STATE: Self = Self(5);
    pub const LINK_INFO: Self = Self(6);
    pub const GET_INFO: Self = Self(7);
    pub const HEARTBEAT: Self = Self(8);

    const fn from_bits(value: u8) -> Self {
        Self(value)
    }

    const fn into_bits(self) -> u8 {
        self.0
    }
}

impl std::fmt::Debug for NetCmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match *self {
            Self::INVALID => "INVALID",
            Self::MTU => "MTU",
            Self::MAC => "MAC",
            Self::GET_IF_STATS => "GET_IF_STATS",
            Self::LINK_STATUS => "LINK_STATUS",
            Self::RX_STATE => "RX_STATE",
            Self::LINK_INFO => "LINK_INFO",
            Self::GET_INFO => "GET_INFO",
            Self::HEARTBEAT => "HEARTBEAT",
            Self(other) => return write!(f, "UNKNOWN({other:#x})"),
        };
        f.write_str(name)
    }
}

/// Reply code carried in response headers.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct NetReply(pub u8);

impl NetReply {
    pub const OK: Self = Self(0);
    pub const GENERIC_FAIL: Self = Self(1);
    pub const INVALID_PARAM: Self = Self(2);

    const fn from_bits(value: u8) -> Self {
        Self(value)
    }

    const fn into_bits(self) -> u8 {
        self.0
    }
}

impl std::fmt::Debug for NetReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::OK => f.write_str("OK"),
            Self::GENERIC_FAIL => f.write_str("GENERIC_FAIL"),
            Self::INVALID_PARAM => f.write_str("INVALID_PARAM"),
            Self(other) => write!(f, "UNKNOWN({other:#x})"),
        }
    }
}

/// Routing + command header, the first payload word of every message.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, FromBytes, KnownLayout, PartialEq, Eq)]
pub struct NetHdr {
    /// PCIe MAC domain index.
    #[bits(4)]
    pub pem_idx: u8,
    /// Physical function index within the domain.
    #[bits(9)]
    pub pf_idx: u16,
    #[bits(2)]
    _reserved: u8,
    /// Set when the message addresses a VF under the PF.
    pub is_vf: bool,
    /// Virtual function index, meaningful only when `is_vf` is set.
    #[bits(16)]
    pub vf_idx: u16,
    #[bits(8)]
    pub cmd: NetCmd,
    /// Zero on requests.
    #[bits(8)]
    pub reply: NetReply,
    /// Sender's interface id; echoed back so the host can route replies.
    #[bits(16)]
    pub sender: u16,
}

impl NetHdr {
    /// Builds a response header for `req` with the given reply code.
    pub fn to_reply(&self, reply: NetReply) -> Self {
        self.with_reply(reply)
    }
}

/// Fully decoded function address.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct FnAddr {
    pub pem: u8,
    pub pf: u16,
    /// `None` addresses the PF itself.
    pub vf: Option<u16>,
}

impl FnAddr {
    pub const fn pf(pem: u8, pf: u16) -> Self {
        Self { pem, pf, vf: None }
    }

    pub const fn vf(pem: u8, pf: u16, vf: u16) -> Self {
        Self {
            pem,
            pf,
            vf: Some(vf),
        }
    }

    /// Seeds a request/notification header addressed at this function.
    pub fn hdr(&self, cmd: NetCmd) -> NetHdr {
        NetHdr::new()
            .with_pem_idx(self.pem)
            .with_pf_idx(self.pf)
            .with_is_vf(self.vf.is_some())
            .with_vf_idx(self.vf.unwrap_or(0))
            .with_cmd(cmd)
    }
}

impl From<NetHdr> for FnAddr {
    fn from(hdr: NetHdr) -> Self {
        Self {
            pem: hdr.pem_idx(),
            pf: hdr.pf_idx(),
            vf: hdr.is_vf().then(|| hdr.vf_idx()),
        }
    }
}

/// Get/set discriminator inside request payloads.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, FromBytes, KnownLayout)]
#[repr(transparent)]
pub struct CmdDir(pub u16);

impl CmdDir {
    pub const GET: Self = Self(0);
    pub const SET: Self = Self(1);
}

/// Link / receive state value.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, FromBytes, KnownLayout)]
#[repr(transparent)]
pub struct LinkState(pub u16);

impl LinkState {
    pub const DOWN: Self = Self(0);
    pub const UP: Self = Self(1);
}

/// Get/set MTU request.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct MtuReq {
    pub dir: CmdDir,
    pub val: u16,
    pub reserved: u32,
}

/// Get MTU response.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct MtuResp {
    pub val: u16,
    pub reserved: [u16; 3],
}

/// Get/set MAC address request.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct MacReq {
    pub dir: CmdDir,
    pub addr: [u8; 6],
}

/// Get MAC address response.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct MacResp {
    pub addr: [u8; 6],
    pub reserved: u16,
}

/// Interface statistics request: the target copies an [`IfStats`] block to
/// `offset` within the shared region.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct IfStatsReq {
    pub offset: u32,
    pub reserved: u32,
}

/// Interface statistics response, echoing the copy-out offset.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct IfStatsResp {
    pub offset: u32,
    pub reserved: u32,
}

/// Get/set link-state or rx-state request.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct StateReq {
    pub dir: CmdDir,
    pub state: LinkState,
    pub reserved: u32,
}

/// Get state response; also the payload of link-change notifications.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct StateResp {
    pub state: LinkState,
    pub reserved: [u16; 3],
}

/// Link parameters.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct LinkInfo {
    /// Autonegotiation enabled.
    pub autoneg: u8,
    /// Pause frames enabled.
    pub pause: u8,
    pub reserved: u16,
    /// Negotiated link speed in Mbps.
    pub speed: u32,
    /// Bitmap of supported link modes. Read-only to the host.
    pub supported_modes: u64,
    /// Bitmap of advertised link modes.
    pub advertised_modes: u64,
}

/// Get/set link info request.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct LinkInfoReq {
    pub dir: CmdDir,
    pub reserved: [u16; 3],
    pub info: LinkInfo,
}

/// Function info response. VFs report zero heartbeat parameters.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct GetInfoResp {
    /// Packet-kind tag the data plane stamps on this function's traffic.
    pub pkind: u16,
    pub reserved: u16,
    pub hb_interval_ms: u32,
    pub hb_miss_count: u32,
    pub reserved2: u32,
}

/// Interface counters copied into the shared region on `GET_IF_STATS`.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct IfStats {
    pub rx_pkts: u64,
    pub rx_octets: u64,
    pub rx_err_pkts: u64,
    pub rx_dropped_pkts: u64,
    pub tx_pkts: u64,
    pub tx_octets: u64,
    pub tx_err_pkts: u64,
    pub tx_dropped_pkts: u64,
}

// Every payload is a whole number of ring words.
const_assert_eq!(size_of::<NetHdr>(), WORD_BYTES);
const_assert_eq!(size_of::<MtuReq>(), WORD_BYTES);
const_assert_eq!(size_of::<MtuResp>(), WORD_BYTES);
const_assert_eq!(size_of::<MacReq>(), WORD_BYTES);
const_assert_eq!(size_of::<MacResp>(), WORD_BYTES);
const_assert_eq!(size_of::<IfStatsReq>(), WORD_BYTES);
const_assert_eq!(size_of::<IfStatsResp>(), WORD_BYTES);
const_assert_eq!(size_of::<StateReq>(), WORD_BYTES);
const_assert_eq!(size_of::<StateResp>(), WORD_BYTES);
const_assert_eq!(size_of::<LinkInfo>(), 3 * WORD_BYTES);
const_assert_eq!(size_of::<LinkInfoReq>(), 4 * WORD_BYTES);
const_assert_eq!(size_of::<GetInfoResp>(), 2 * WORD_BYTES);
const_assert_eq!(size_of::<IfStats>(), 8 * WORD_BYTES);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hdr_round_trip() {
        let hdr = FnAddr::vf(2, 5, 17).hdr(NetCmd::MTU).with_sender(0x42);
        assert_eq!(hdr.pem_idx(), 2);
        assert_eq!(hdr.pf_idx(), 5);
        assert!(hdr.is_vf());
        assert_eq!(hdr.vf_idx(), 17);
        assert_eq!(hdr.cmd(), NetCmd::MTU);
        assert_eq!(hdr.reply(), NetReply(0));
        assert_eq!(hdr.sender(), 0x42);

        assert_eq!(FnAddr::from(hdr), FnAddr::vf(2, 5, 17));
        let addr = FnAddr::from(FnAddr::pf(0, 3).hdr(NetCmd::MAC));
        assert_eq!(addr.vf, None);
    }

    #[test]
    fn reply_echoes_request_routing() {
        let req = FnAddr::pf(1, 0).hdr(NetCmd::LINK_STATUS).with_sender(9);
        let resp = req.to_reply(NetReply::INVALID_PARAM);
        assert_eq!(resp.cmd(), NetCmd::LINK_STATUS);
        assert_eq!(resp.sender(), 9);
        assert_eq!(resp.reply(), NetReply::INVALID_PARAM);
        assert_eq!(FnAddr::from(resp), FnAddr::pf(1, 0));
    }
}
