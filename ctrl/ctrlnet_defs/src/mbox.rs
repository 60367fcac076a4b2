// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared-memory control block and message framing for the control mailbox.
//!
//! Region layout (all offsets from the region base):
//!
//! ```text
//! 0x00  magic            u64
//! 0x08  region_size      u32
//! 0x0c  (pad)            u32
//! 0x10  host_status      u64   written only by the host
//! 0x18  target_status    u64   written only by the target
//! 0x20  host_version     u64
//! 0x28  target_version   u64
//! 0x30  (reserved)       ..0x40
//! 0x40  h2t queue info   QueueInfo
//! 0x50  t2h queue info   QueueInfo
//! 0x60  h2t ring bytes, then t2h ring bytes
//! ```
//!
//! Each ring's producer index is written only by its sending side and the
//! consumer index only by its receiving side, so no cross-side lock exists
//! anywhere in the protocol.

use bitfield_struct::bitfield;
use static_assertions::const_assert_eq;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Sentinel proving the control block has been initialized.
pub const MBOX_MAGIC: u64 = 0xcafe_f00d_1fac_ade0;

/// Ring payloads are carried in 8-byte words.
pub const WORD_BYTES: usize = 8;

/// Size of the on-wire message header.
pub const HEADER_BYTES: usize = size_of::<MsgHeader>();

/// Control block offsets.
pub mod layout {
    pub const MAGIC: usize = 0x00;
    pub const REGION_SIZE: usize = 0x08;
    pub const HOST_STATUS: usize = 0x10;
    pub const TARGET_STATUS: usize = 0x18;
    pub const HOST_VERSION: usize = 0x20;
    pub const TARGET_VERSION: usize = 0x28;
    pub const H2T_QUEUE: usize = 0x40;
    pub const T2H_QUEUE: usize = 0x50;
    /// First ring byte; everything past this is split between the rings.
    pub const RINGS: usize = 0x60;
}

/// Per-side lifecycle status, stored as a u64 in the control block.
///
/// Unknown values can appear while the peer is mid-write or after a reset,
/// so this is an open set rather than a Rust enum.
#[derive(Copy, Clone, PartialEq, Eq, IntoBytes, Immutable, FromBytes, KnownLayout)]
#[repr(transparent)]
pub struct MbxStatus(pub u64);

impl MbxStatus {
    pub const INVALID: Self = Self(0);
    pub const INIT: Self = Self(1);
    pub const READY: Self = Self(2);
    pub const UNINIT: Self = Self(3);
}

impl std::fmt::Debug for MbxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::INVALID => f.write_str("INVALID"),
            Self::INIT => f.write_str("INIT"),
            Self::READY => f.write_str("READY"),
            Self::UNINIT => f.write_str("UNINIT"),
            Self(other) => write!(f, "UNKNOWN({other:#x})"),
        }
    }
}

/// Producer/consumer block for one ring direction.
///
/// Indices are byte offsets into the ring, always `< capacity`.
#[repr(C)]
#[derive(Copy, Clone, Debug, IntoBytes, Immutable, FromBytes, KnownLayout)]
pub struct QueueInfo {
    pub producer: u32,
    pub consumer: u32,
    pub capacity: u32,
    pub reserved: u32,
}

const_assert_eq!(size_of::<QueueInfo>(), 16);

/// One 64-bit message header word: `flags:32 | size_words:32`.
///
/// `size_words` counts payload words and excludes the header itself. The
/// producer index is advanced past header and payload in one publication,
/// so a reader never observes the header without its payload.
#[bitfield(u64)]
#[derive(IntoBytes, Immutable, FromBytes, KnownLayout, PartialEq, Eq)]
pub struct MsgHeader {
    /// Message is a request and expects a response.
    pub request: bool,
    /// Message answers an earlier request.
    pub response: bool,
    /// Fire-and-forget notification.
    pub notify: bool,
    #[bits(29)]
    _reserved: u32,
    /// Payload length in 8-byte words.
    #[bits(32)]
    pub size_words: u32,
}

impl MsgHeader {
    /// Payload length in bytes.
    pub fn size_bytes(&self) -> usize {
        self.size_words() as usize * WORD_BYTES
    }
}

/// Packs a control-plane version as `major.minor.variant`.
pub const fn make_version(major: u8, minor: u8, variant: u8) -> u64 {
    ((major as u64) << 16) | ((minor as u64) << 8) | variant as u64
}

/// Version this implementation advertises in the control block.
pub const VERSION_CURRENT: u64 = make_version(1, 0, 0);
