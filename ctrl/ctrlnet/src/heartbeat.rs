// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-PF liveness heartbeats.
//!
//! The scheduler is clock-free: the poll loop reports elapsed time into
//! [`HeartbeatScheduler::tick`], which makes the cadence exact under test
//! and immune to signal-delivery jitter. Heartbeats are fire-and-forget
//! notifications; a full ring costs one beat, never a stall.

use crate::hierarchy::FunctionHierarchy;
use barmem::DoorbellLine;
use ctrlmbox::Message;
use ctrlmbox::SyncTransport;
use ctrlnet_defs::net::FnAddr;
use ctrlnet_defs::net::NetCmd;
use zerocopy::IntoBytes;

struct PfHeartbeat {
    addr: FnAddr,
    interval_ms: u32,
    ticks_remaining: i64,
}

/// Emits a heartbeat notification per PF every `interval_ms`.
pub struct HeartbeatScheduler {
    pfs: Vec<PfHeartbeat>,
}

impl HeartbeatScheduler {
    /// Arms one timer per valid PF from its configured interval.
    pub fn new(hier: &FunctionHierarchy) -> Self {
        let pfs = hier
            .valid_pfs()
            .map(|(pem, pf)| PfHeartbeat {
                addr: FnAddr::pf(pem, pf.idx),
                interval_ms: pf.heartbeat.interval_ms,
                ticks_remaining: pf.heartbeat.interval_ms as i64,
            })
            .collect();
        Self { pfs }
    }

    /// Advances all timers by `elapsed_ms`, emitting due heartbeats.
    ///
    /// PFs whose PEM is mid-reset are frozen: their timers neither run nor
    /// emit until recovery completes. Returns the number of notifications
    /// sent.
    pub fn tick(
        &mut self,
        elapsed_ms: u64,
        transport: &SyncTransport,
        hier: &FunctionHierarchy,
    ) -> usize {
        let mut emitted = 0;
        for pf in &mut self.pfs {
            if hier.pem_in_reset(pf.addr.pem) {
                continue;
            }
            let Some(node) = hier.pf(pf.addr.pem, pf.addr.pf) else {
                continue;
            };
            pf.ticks_remaining -= elapsed_ms as i64;
            if pf.ticks_remaining > 0 {
                continue;
            }
            pf.ticks_remaining = pf.interval_ms as i64;

            let hdr = pf
                .addr
                .hdr(NetCmd::HEARTBEAT)
                .with_sender(node.host_if_id);
            let beat = Message::notify(&[hdr.as_bytes()]);
            match transport.send(&[beat]) {
                Ok(1) => {
                    transport.ring(DoorbellLine::Heartbeat);
                    emitted += 1;
                    tracing::trace!(pem = pf.addr.pem, pf = pf.addr.pf, "heartbeat");
                }
                Ok(_) => {
                    tracing::debug!(pem = pf.addr.pem, pf = pf.addr.pf, "heartbeat dropped, ring full");
                }
                Err(err) => {
                    tracing::trace!(pem = pf.addr.pem, pf = pf.addr.pf, %err, "heartbeat not sent");
                }
            }
        }
        emitted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NoDevices;
    use crate::hierarchy::tests::small_config;
    use barmem::LatchDoorbell;
    use barmem::NullDoorbell;
    use barmem::SharedBuffer;
    use ctrlmbox::MailboxTransport;
    use ctrlmbox::MsgKind;
    use ctrlmbox::Side;
    use ctrlnet_defs::net::NetHdr;
    use std::sync::Arc;
    use zerocopy::FromBytes;

    fn setup(doorbell: Arc<LatchDoorbell>) -> (MailboxTransport, SyncTransport, FunctionHierarchy) {
        let mem = SharedBuffer::new(8192);
        let target =
            MailboxTransport::init(Arc::new(mem.clone()), doorbell, Side::Target).unwrap();
        let host =
            MailboxTransport::attach(Arc::new(mem), Arc::new(NullDoorbell), Side::Host).unwrap();
        let hier = FunctionHierarchy::new(&small_config(), &NoDevices).unwrap();
        (host, SyncTransport::new(target), hier)
    }

    #[test]
    fn exact_cadence_under_deterministic_clock() {
        let db = LatchDoorbell::new();
        let (mut host, target, hier) = setup(db.clone());
        let mut sched = HeartbeatScheduler::new(&hier);

        // both PFs have a 1000 ms interval (pf 2's was clamped up to 1000):
        // 30 ticks of 100 ms emit exactly 3 beats each, never more or fewer.
        let mut emitted = 0;
        for _ in 0..30 {
            emitted += sched.tick(100, &target, &hier);
        }
        assert_eq!(emitted, 6);
        assert!(db.take(DoorbellLine::Heartbeat));

        let beats = host.recv(usize::MAX).unwrap();
        assert_eq!(beats.len(), 6);
        for beat in &beats {
            assert_eq!(beat.kind, MsgKind::Notify);
            let (hdr, _) = NetHdr::read_from_prefix(&beat.data).unwrap();
            assert_eq!(hdr.cmd(), NetCmd::HEARTBEAT);
            assert_eq!(hdr.pem_idx(), 0);
            assert!(hdr.pf_idx() == 0 || hdr.pf_idx() == 2);
        }
    }

    #[test]
    fn reset_freezes_heartbeats() {
        let (mut host, target, mut hier) = setup(LatchDoorbell::new());
        let mut sched = HeartbeatScheduler::new(&hier);

        hier.set_pem_in_reset(0, true);
        for _ in 0..50 {
            assert_eq!(sched.tick(100, &target, &hier), 0);
        }
        assert!(host.recv(usize::MAX).unwrap().is_empty());

        // timers resume where they stopped, they do not fire a burst
        hier.set_pem_in_reset(0, false);
        assert_eq!(sched.tick(100, &target, &hier), 0);
        let mut emitted = 0;
        for _ in 0..9 {
            emitted += sched.tick(100, &target, &hier);
        }
        assert_eq!(emitted, 2);
    }

    #[test]
    fn oversize_tick_emits_single_beat() {
        let (_host, target, hier) = setup(LatchDoorbell::new());
        let mut sched = HeartbeatScheduler::new(&hier);
        // a long stall still produces one beat per PF, not a backlog
        assert_eq!(sched.tick(10_000, &target, &hier), 2);
        assert_eq!(sched.tick(100, &target, &hier), 0);
    }
}
