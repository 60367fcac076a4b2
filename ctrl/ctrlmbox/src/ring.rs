// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Single-direction circular byte buffer living in shared memory.
//!
//! The queue itself holds no data; it is a window description (info block
//! offset, ring base, capacity) over a [`BarMemory`] region. Indices are
//! byte offsets in `[0, capacity)`. One byte of capacity is never used so
//! that `producer == consumer` always means empty.

use barmem::BarMemory;
use barmem::BarMemoryError;
use barmem::BarMemoryExt;
use ctrlnet_defs::mbox::QueueInfo;

/// Field offsets inside a [`QueueInfo`] block.
const PRODUCER: usize = 0;
const CONSUMER: usize = 4;

#[derive(Debug, Copy, Clone)]
pub struct RingQueue {
    /// Offset of this ring's [`QueueInfo`] block.
    info: usize,
    /// Offset of the first ring byte.
    base: usize,
    capacity: u32,
}

impl RingQueue {
    pub(crate) fn new(info: usize, base: usize, capacity: u32) -> Self {
        Self {
            info,
            base,
            capacity,
        }
    }

    pub(crate) fn write_info(
        mem: &dyn BarMemory,
        offset: usize,
        info: &QueueInfo,
    ) -> Result<(), BarMemoryError> {
        mem.write_obj(offset, info)
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Largest encoded message the ring can hold at all.
    pub fn max_message_bytes(&self) -> usize {
        self.capacity as usize - 1
    }

    pub fn producer(&self, mem: &dyn BarMemory) -> Result<usize, BarMemoryError> {
        Ok(mem.read_u32(self.info + PRODUCER)? as usize % self.capacity as usize)
    }

    pub fn consumer(&self, mem: &dyn BarMemory) -> Result<usize, BarMemoryError> {
        Ok(mem.read_u32(self.info + CONSUMER)? as usize % self.capacity as usize)
    }

    pub(crate) fn set_producer(
        &self,
        mem: &dyn BarMemory,
        value: usize,
    ) -> Result<(), BarMemoryError> {
        mem.write_u32(self.info + PRODUCER, value as u32)
    }

    pub(crate) fn set_consumer(
        &self,
        mem: &dyn BarMemory,
        value: usize,
    ) -> Result<(), BarMemoryError> {
        mem.write_u32(self.info + CONSUMER, value as u32)
    }

    /// Bytes currently published but not yet consumed.
    pub fn occupied(&self, producer: usize, consumer: usize) -> usize {
        (producer + self.capacity as usize - consumer) % self.capacity as usize
    }

    /// Bytes available to the producer.
    pub fn free(&self, producer: usize, consumer: usize) -> usize {
        self.max_message_bytes() - self.occupied(producer, consumer)
    }

    /// Advances an index by `n` bytes, wrapping at capacity.
    pub fn advance(&self, index: usize, n: usize) -> usize {
        (index + n) % self.capacity as usize
    }

    /// Writes `data` starting at ring offset `index`, wrapping past the
    /// physical end of the ring. The caller has already checked space.
    pub(crate) fn write_at(
        &self,
        mem: &dyn BarMemory,
        index: usize,
        data: &[u8],
    ) -> Result<(), BarMemoryError> {
        let tail = (self.capacity as usize - index).min(data.len());
        mem.write_at(self.base + index, &data[..tail])?;
        if tail < data.len() {
            mem.write_at(self.base, &data[tail..])?;
        }
        Ok(())
    }

    /// Reads `data.len()` bytes starting at ring offset `index`, wrapping
    /// past the physical end of the ring.
    pub(crate) fn read_at(
        &self,
        mem: &dyn BarMemory,
        index: usize,
        data: &mut [u8],
    ) -> Result<(), BarMemoryError> {
        let tail = (self.capacity as usize - index).min(data.len());
        mem.read_at(self.base + index, &mut data[..tail])?;
        let len = data.len();
        if tail < len {
            mem.read_at(self.base, &mut data[tail..len])?;
        }
        Ok(())
    }
}
