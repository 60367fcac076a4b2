// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire-format definitions shared by both ends of the control mailbox.
//!
//! Everything in this crate describes bytes in the shared BAR region. Types
//! are `#[repr(C)]`, little-endian on the wire, and carry zerocopy derives so
//! they can be read from and written to the ring without hand decoding.

pub mod mbox;
pub mod net;
