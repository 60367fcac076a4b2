// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Capability traits for the shared BAR region and the interrupt doorbell.
//!
//! The control mailbox only needs bounded byte access to a memory region
//! that another PCIe agent may be writing concurrently, plus a way to nudge
//! the peer. How that region gets mapped (BAR windows, IOMMU, /dev/mem) is
//! a platform concern and lives behind [`BarMemory`]; tests and loopback
//! mode use the in-process [`SharedBuffer`] implementation.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU8;
use std::sync::atomic::Ordering::Acquire;
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::Ordering::Release;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Access outside the region or with broken alignment.
#[derive(Debug, Error)]
pub enum BarMemoryError {
    #[error("access at {offset:#x}+{len:#x} out of bounds (region {region:#x})")]
    OutOfBounds {
        offset: usize,
        len: usize,
        region: usize,
    },
    #[error("access at {offset:#x} not aligned to {align}")]
    Unaligned { offset: usize, align: usize },
}

/// A byte-addressable shared memory region.
///
/// Both peers may access the region concurrently. Plain byte accessors make
/// no atomicity promise; the `u32`/`u64` accessors are single-copy atomic
/// with release/acquire ordering, which is what index publication in the
/// ring protocol relies on.
pub trait BarMemory: Send + Sync {
    /// Total region size in bytes.
    fn len(&self) -> usize;

    fn read_at(&self, offset: usize, data: &mut [u8]) -> Result<(), BarMemoryError>;

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), BarMemoryError>;

    /// Reads a naturally aligned u32 with acquire ordering.
    fn read_u32(&self, offset: usize) -> Result<u32, BarMemoryError>;

    /// Writes a naturally aligned u32 with release ordering.
    fn write_u32(&self, offset: usize, value: u32) -> Result<(), BarMemoryError>;

    /// Reads a naturally aligned u64 with acquire ordering.
    fn read_u64(&self, offset: usize) -> Result<u64, BarMemoryError>;

    /// Writes a naturally aligned u64 with release ordering.
    fn write_u64(&self, offset: usize, value: u64) -> Result<(), BarMemoryError>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Typed helpers layered over the raw byte accessors.
pub trait BarMemoryExt: BarMemory {
    /// Reads a `T` from `offset`.
    fn read_obj<T: FromBytes + IntoBytes + Immutable + KnownLayout>(
        &self,
        offset: usize,
    ) -> Result<T, BarMemoryError> {
        let mut value = T::new_zeroed();
        self.read_at(offset, value.as_mut_bytes())?;
        Ok(value)
    }

    /// Writes a `T` at `offset`.
    fn write_obj<T: IntoBytes + Immutable + KnownLayout>(
        &self,
        offset: usize,
        value: &T,
    ) -> Result<(), BarMemoryError> {
        self.write_at(offset, value.as_bytes())
    }
}

impl<M: BarMemory + ?Sized> BarMemoryExt for M {}

/// Interrupt lines the endpoint can raise towards the host.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DoorbellLine {
    /// New mailbox content is available.
    Mbox,
    /// Liveness heartbeat.
    Heartbeat,
}

/// An interface to signal the peer after publishing work.
pub trait Doorbell: Send + Sync {
    fn ring(&self, line: DoorbellLine);
}

/// A doorbell that drops every signal, for configurations polled without
/// interrupts.
pub struct NullDoorbell;

impl Doorbell for NullDoorbell {
    fn ring(&self, _line: DoorbellLine) {}
}

/// A latching in-process doorbell. The receiving side polls and clears it.
#[derive(Default)]
pub struct LatchDoorbell {
    mbox: AtomicBool,
    heartbeat: AtomicBool,
}

impl LatchDoorbell {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Clears and returns the pending state of `line`.
    pub fn take(&self, line: DoorbellLine) -> bool {
        match line {
            DoorbellLine::Mbox => self.mbox.swap(false, Acquire),
            DoorbellLine::Heartbeat => self.heartbeat.swap(false, Acquire),
        }
    }
}

impl Doorbell for LatchDoorbell {
    fn ring(&self, line: DoorbellLine) {
        match line {
            DoorbellLine::Mbox => self.mbox.store(true, Release),
            DoorbellLine::Heartbeat => self.heartbeat.store(true, Release),
        }
    }
}

/// Heap-backed [`BarMemory`] shared between cloned handles.
///
/// Stands in for a mapped BAR window when both "sides" live in one process:
/// the loopback agent mode and every transport test run the host and target
/// halves against clones of the same buffer.
#[derive(Clone)]
pub struct SharedBuffer {
    mem: Arc<[AtomicU8]>,
}

impl SharedBuffer {
    /// Allocates a zeroed region of `len` bytes.
    pub fn new(len: usize) -> Self {
        let mem = (0..len).map(|_| AtomicU8::new(0)).collect::<Vec<_>>();
        Self { mem: mem.into() }
    }

    fn check(&self, offset: usize, len: usize) -> Result<(), BarMemoryError> {
        if self.mem.len() < offset || self.mem.len() - offset < len {
            return Err(BarMemoryError::OutOfBounds {
                offset,
                len,
                region: self.mem.len(),
            });
        }
        Ok(())
    }

    fn check_aligned(&self, offset: usize, len: usize) -> Result<(), BarMemoryError> {
        self.check(offset, len)?;
        if offset % len != 0 {
            return Err(BarMemoryError::Unaligned { offset, align: len });
        }
        Ok(())
    }
}

impl BarMemory for SharedBuffer {
    fn len(&self) -> usize {
        self.mem.len()
    }

    fn read_at(&self, offset: usize, data: &mut [u8]) -> Result<(), BarMemoryError> {
        self.check(offset, data.len())?;
        for (i, b) in data.iter_mut().enumerate() {
            *b = self.mem[offset + i].load(Relaxed);
        }
        Ok(())
    }

    fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), BarMemoryError> {
        self.check(offset, data.len())?;
        for (i, b) in data.iter().enumerate() {
            self.mem[offset + i].store(*b, Relaxed);
        }
        Ok(())
    }

    fn read_u32(&self, offset: usize) -> Result<u32, BarMemoryError> {
        self.check_aligned(offset, 4)?;
        let mut bytes = [0; 4];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.mem[offset + i].load(Acquire);
        }
        Ok(u32::from_le_bytes(bytes))
    }

    fn write_u32(&self, offset: usize, value: u32) -> Result<(), BarMemoryError> {
        self.check_aligned(offset, 4)?;
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.mem[offset + i].store(*b, Release);
        }
        Ok(())
    }

    fn read_u64(&self, offset: usize) -> Result<u64, BarMemoryError> {
        self.check_aligned(offset, 8)?;
        let mut bytes = [0; 8];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = self.mem[offset + i].load(Acquire);
        }
        Ok(u64::from_le_bytes(bytes))
    }

    fn write_u64(&self, offset: usize, value: u64) -> Result<(), BarMemoryError> {
        self.check_aligned(offset, 8)?;
        for (i, b) in value.to_le_bytes().iter().enumerate() {
            self.mem[offset + i].store(*b, Release);
        }
        Ok(())
    }
}
