// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Control plane for PCIe endpoint network functions.
//!
//! Owns the PEM → PF → VF hierarchy, answers the host's configuration
//! requests arriving over the control mailbox, emits per-PF heartbeats, and
//! recovers function state across PCIe resets.

pub mod backend;
pub mod channel;
pub mod heartbeat;
pub mod hierarchy;
pub mod perst;
