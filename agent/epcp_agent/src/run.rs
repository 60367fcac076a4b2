// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The agent poll loop.
//!
//! Single-threaded and cooperative: one iteration drains inbound control
//! requests, applies pending reset events, advances heartbeat timers by the
//! measured elapsed time, and sleeps for the poll interval. Nothing in the
//! loop blocks on the peer.

use crate::config::AgentConfig;
use anyhow::Context;
use barmem::SharedBuffer;
use ctrlmbox::MailboxTransport;
use ctrlmbox::Side;
use ctrlmbox::SyncTransport;
use ctrlnet::backend::NoDevices;
use ctrlnet::channel;
use ctrlnet::channel::ControlChannel;
use ctrlnet::heartbeat::HeartbeatScheduler;
use ctrlnet::hierarchy::FunctionHierarchy;
use ctrlnet::perst::CtrlEvent;
use ctrlnet::perst::DataPlaneHooks;
use ctrlnet::perst::NullHooks;
use ctrlnet::perst::PerstRecoveryCoordinator;
use ctrlnet_defs::net::FnAddr;
use ctrlnet_defs::net::LinkState;
use signal_hook::consts::SIGINT;
use signal_hook::consts::SIGTERM;
use signal_hook::consts::SIGUSR1;
use signal_hook::consts::SIGUSR2;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering::Relaxed;
use std::time::Duration;
use std::time::Instant;

pub struct RunOptions {
    pub poll_interval: Duration,
    /// Run a simulated host peer in-process instead of waiting for one.
    pub loopback: bool,
}

/// The target-side control plane, assembled and ready to poll.
pub struct Agent {
    transport: SyncTransport,
    hier: FunctionHierarchy,
    channel: ControlChannel,
    heartbeat: HeartbeatScheduler,
    coordinator: PerstRecoveryCoordinator,
}

impl Agent {
    /// Builds the function tree and initializes the mailbox over `mem`.
    pub fn new(cfg: &AgentConfig, mem: SharedBuffer) -> anyhow::Result<Self> {
        let hier = FunctionHierarchy::new(&cfg.hierarchy(), &NoDevices)
            .context("building function hierarchy")?;
        let transport = MailboxTransport::init(
            Arc::new(mem),
            Arc::new(barmem::NullDoorbell),
            Side::Target,
        )
        .context("initializing mailbox")?;
        let transport = SyncTransport::new(transport);
        let heartbeat = HeartbeatScheduler::new(&hier);
        Ok(Self {
            transport,
            hier,
            channel: ControlChannel::new(),
            heartbeat,
            coordinator: PerstRecoveryCoordinator::new(),
        })
    }

    /// One cooperative poll step; returns the number of requests served.
    pub fn poll(&mut self, elapsed_ms: u64) -> usize {
        let handled = self.channel.process(&self.transport, &mut self.hier);
        self.heartbeat.tick(elapsed_ms, &self.transport, &self.hier);
        handled
    }

    pub fn handle_event(
        &mut self,
        event: CtrlEvent,
        hooks: &mut dyn DataPlaneHooks,
    ) -> Result<(), ctrlnet::perst::PerstError> {
        self.coordinator.handle_event(event, &mut self.hier, hooks)
    }

    /// Flips the link state of the first valid PF and notifies the host.
    /// Wired to SIGUSR1 as a diagnostics aid.
    pub fn toggle_first_link(&mut self) {
        let Some((pem, pf)) = self
            .hier
            .valid_pfs()
            .map(|(pem, pf)| (pem, pf.idx))
            .next()
        else {
            tracing::warn!("no active interfaces to toggle");
            return;
        };
        let addr = FnAddr::pf(pem, pf);
        let host_if_id = self.hier.pf(pem, pf).map(|p| p.host_if_id).unwrap_or(0);
        let Some(backend) = self.hier.backend_mut(addr) else {
            return;
        };
        let next = match backend.link_state() {
            Ok(LinkState::UP) => LinkState::DOWN,
            Ok(_) => LinkState::UP,
            Err(err) => {
                tracing::warn!(%err, "link state read failed");
                return;
            }
        };
        if let Err(err) = backend.set_link_state(next) {
            tracing::warn!(%err, "link toggle failed");
            return;
        }
        tracing::info!(pem, pf, state = ?next, "toggling link");
        if let Err(err) = channel::notify_link_state(&self.transport, addr, host_if_id, next) {
            tracing::warn!(%err, "link notification not sent");
        }
    }

    pub fn shutdown(&mut self) {
        self.coordinator.uninit();
        self.transport.uninit();
    }
}

fn flag(signal: i32) -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal, flag.clone())
        .with_context(|| format!("registering signal {signal}"))?;
    Ok(flag)
}

/// Runs the agent until SIGINT/SIGTERM.
pub fn run(cfg: &AgentConfig, opts: &RunOptions) -> anyhow::Result<()> {
    let mem = SharedBuffer::new(cfg.mailbox.region_size);
    let mut agent = Agent::new(cfg, mem.clone())?;

    let stop = flag(SIGINT)?;
    let term = flag(SIGTERM)?;
    let toggle = flag(SIGUSR1)?;
    let fake_perst = flag(SIGUSR2)?;

    let sim = opts.loopback.then(|| host_sim::spawn(mem));

    tracing::info!("waiting for host");
    while !agent.transport.peer_ready() {
        if stop.load(Relaxed) || term.load(Relaxed) {
            agent.shutdown();
            return Ok(());
        }
        std::thread::sleep(opts.poll_interval);
    }
    tracing::info!("host ready, serving");

    let mut hooks = NullHooks;
    let mut last = Instant::now();
    while !(stop.load(Relaxed) || term.load(Relaxed)) {
        if toggle.swap(false, Relaxed) {
            agent.toggle_first_link();
        }
        if fake_perst.swap(false, Relaxed) {
            // Diagnostics path: simulate a PERST of pem 0.
            if let Err(err) = agent.handle_event(CtrlEvent::Perst { pem: 0 }, &mut hooks) {
                tracing::error!(%err, "perst recovery failed");
            }
        }

        let elapsed = last.elapsed().as_millis() as u64;
        last = Instant::now();
        agent.poll(elapsed);
        std::thread::sleep(opts.poll_interval);
    }

    tracing::info!("shutting down");
    agent.shutdown();
    if let Some(sim) = sim {
        let _ = sim.join();
    }
    Ok(())
}

/// A stand-in host peer for `--loopback` runs: attaches to the shared
/// region, exercises a few commands against PF 0/0, then listens for
/// heartbeats.
mod host_sim {
    use barmem::NullDoorbell;
    use barmem::SharedBuffer;
    use ctrlmbox::MailboxTransport;
    use ctrlmbox::Message;
    use ctrlmbox::MsgKind;
    use ctrlmbox::Side;
    use ctrlnet_defs::net::CmdDir;
    use ctrlnet_defs::net::FnAddr;
    use ctrlnet_defs::net::MtuReq;
    use ctrlnet_defs::net::MtuResp;
    use ctrlnet_defs::net::NetCmd;
    use ctrlnet_defs::net::NetHdr;
    use std::sync::Arc;
    use std::thread::JoinHandle;
    use std::time::Duration;
    use zerocopy::FromBytes;
    use zerocopy::IntoBytes;

    pub(super) fn spawn(mem: SharedBuffer) -> JoinHandle<()> {
        std::thread::spawn(move || {
            if let Err(err) = run(mem) {
                tracing::warn!(%err, "host sim stopped");
            }
        })
    }

    fn run(mem: SharedBuffer) -> anyhow::Result<()> {
        let mut host =
            MailboxTransport::attach(Arc::new(mem), Arc::new(NullDoorbell), Side::Host)?;

        let hdr = FnAddr::pf(0, 0).hdr(NetCmd::MTU).with_sender(1);
        let set = MtuReq {
            dir: CmdDir::SET,
            val: 1500,
            reserved: 0,
        };
        host.send(&[Message::request(&[hdr.as_bytes(), set.as_bytes()])])?;
        let get = MtuReq {
            dir: CmdDir::GET,
            val: 0,
            reserved: 0,
        };
        host.send(&[Message::request(&[hdr.as_bytes(), get.as_bytes()])])?;

        // collect the two responses plus a couple of heartbeats
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let mut responses = 0;
        let mut beats = 0;
        while std::time::Instant::now() < deadline && (responses < 2 || beats < 2) {
            for msg in host.recv(8)? {
                let Ok((hdr, rest)) = NetHdr::read_from_prefix(&msg.data) else {
                    continue;
                };
                match msg.kind {
                    MsgKind::Response => {
                        responses += 1;
                        if let Ok((mtu, _)) = MtuResp::read_from_prefix(rest) {
                            tracing::info!(reply = ?hdr.reply(), val = mtu.val, "host sim: response");
                        } else {
                            tracing::info!(reply = ?hdr.reply(), "host sim: response");
                        }
                    }
                    MsgKind::Notify if hdr.cmd() == NetCmd::HEARTBEAT => {
                        beats += 1;
                        tracing::info!(pf = hdr.pf_idx(), "host sim: heartbeat");
                    }
                    _ => {}
                }
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        tracing::info!(responses, beats, "host sim: done");
        Ok(())
    }
}
