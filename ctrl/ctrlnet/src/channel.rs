// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Inbound request dispatch.
//!
//! One [`ControlChannel::process`] call drains a bounded batch of mailbox
//! requests: decode the routing header, resolve the addressed function,
//! invoke its backend, and send the fixed-size response. Protocol-level
//! failures become wire reply codes for the peer; they are never errors
//! locally.

use crate::hierarchy::FunctionHierarchy;
use barmem::BarMemoryExt;
use ctrlmbox::Message;
use ctrlmbox::MsgKind;
use ctrlmbox::SyncTransport;
use ctrlnet_defs::net::CmdDir;
use ctrlnet_defs::net::FnAddr;
use ctrlnet_defs::net::GetInfoResp;
use ctrlnet_defs::net::IfStatsReq;
use ctrlnet_defs::net::IfStatsResp;
use ctrlnet_defs::net::LinkInfoReq;
use ctrlnet_defs::net::LinkState;
use ctrlnet_defs::net::MacReq;
use ctrlnet_defs::net::MacResp;
use ctrlnet_defs::net::MtuReq;
use ctrlnet_defs::net::MtuResp;
use ctrlnet_defs::net::NetCmd;
use ctrlnet_defs::net::NetHdr;
use ctrlnet_defs::net::NetReply;
use ctrlnet_defs::net::StateReq;
use ctrlnet_defs::net::StateResp;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Requests drained per poll step.
const RX_BATCH: usize = 6;

type Response = (NetReply, Vec<u8>);

fn ok<T: IntoBytes + Immutable + KnownLayout>(payload: &T) -> Response {
    (NetReply::OK, payload.as_bytes().to_vec())
}

fn ok_empty() -> Response {
    (NetReply::OK, Vec::new())
}

fn invalid_param() -> Response {
    (NetReply::INVALID_PARAM, Vec::new())
}

fn generic_fail() -> Response {
    (NetReply::GENERIC_FAIL, Vec::new())
}

/// Dispatches mailbox requests to function backends.
pub struct ControlChannel {
    batch: usize,
}

impl Default for ControlChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl ControlChannel {
    pub fn new() -> Self {
        Self { batch: RX_BATCH }
    }

    /// Drains up to one batch of inbound messages, answering each request.
    /// Returns the number of requests dispatched.
    pub fn process(&self, transport: &SyncTransport, hier: &mut FunctionHierarchy) -> usize {
        let msgs = match transport.recv(self.batch) {
            Ok(msgs) => msgs,
            Err(err) => {
                tracing::trace!(%err, "mailbox not pollable");
                return 0;
            }
        };
        let mut handled = 0;
        for msg in msgs {
            if self.handle(transport, hier, &msg) {
                handled += 1;
            }
        }
        handled
    }

    fn handle(
        &self,
        transport: &SyncTransport,
        hier: &mut FunctionHierarchy,
        msg: &Message,
    ) -> bool {
        if msg.kind != MsgKind::Request {
            tracing::trace!(kind = ?msg.kind, "ignoring non-request message");
            return false;
        }
        let Ok((hdr, payload)) = NetHdr::read_from_prefix(&msg.data) else {
            tracing::warn!(len = msg.data.len(), "runt request dropped");
            return false;
        };
        let addr = FnAddr::from(hdr);

        if hier.pem_in_reset(addr.pem) {
            // Dropped, not failed: the host retries after reset recovery.
            tracing::debug!(pem = addr.pem, "request during pem reset dropped");
            return false;
        }

        hier.set_host_if(addr, hdr.sender());
        let (reply, data) = match hdr.cmd() {
            NetCmd::MTU => mtu(hier, addr, payload),
            NetCmd::MAC => mac(hier, addr, payload),
            NetCmd::GET_IF_STATS => if_stats(hier, transport, addr, payload),
            NetCmd::LINK_STATUS => state(hier, addr, payload, false),
            NetCmd::RX_STATE => state(hier, addr, payload, true),
            NetCmd::LINK_INFO => link_info(hier, addr, payload),
            NetCmd::GET_INFO => get_info(hier, addr),
            cmd => {
                tracing::debug!(?cmd, ?addr, "unhandled command");
                invalid_param()
            }
        };

        let resp = Message::response(&[hdr.to_reply(reply).as_bytes(), &data]);
        match transport.send(std::slice::from_ref(&resp)) {
            Ok(1) => {}
            Ok(_) => tracing::warn!(?addr, "response dropped, ring full"),
            Err(err) => tracing::warn!(?addr, %err, "response send failed"),
        }
        true
    }
}

fn mtu(hier: &mut FunctionHierarchy, addr: FnAddr, payload: &[u8]) -> Response {
    let Some(backend) = hier.backend_mut(addr) else {
        tracing::debug!(?addr, "request for invalid interface");
        return invalid_param();
    };
    let Ok((req, _)) = MtuReq::read_from_prefix(payload) else {
        return invalid_param();
    };
    if req.dir == CmdDir::GET {
        match backend.mtu() {
            Ok(val) => {
                tracing::debug!(?addr, val, "get mtu");
                ok(&MtuResp {
                    val,
                    ..Default::default()
                })
            }
            Err(err) => {
                tracing::error!(?addr, %err, "get mtu failed");
                generic_fail()
            }
        }
    } else {
        match backend.set_mtu(req.val) {
            Ok(()) => {
                tracing::debug!(?addr, val = req.val, "set mtu");
                ok_empty()
            }
            Err(err) => {
                tracing::error!(?addr, %err, "set mtu failed");
                generic_fail()
            }
        }
    }
}

fn mac(hier: &mut FunctionHierarchy, addr: FnAddr, payload: &[u8]) -> Response {
    let Some(backend) = hier.backend_mut(addr) else {
        tracing::debug!(?addr, "request for invalid interface");
        return invalid_param();
    };
    let Ok((req, _)) = MacReq::read_from_prefix(payload) else {
        return invalid_param();
    };
    if req.dir == CmdDir::GET {
        match backend.mac() {
            Ok(mac) => {
                tracing::debug!(?addr, ?mac, "get mac");
                ok(&MacResp {
                    addr: mac,
                    reserved: 0,
                })
            }
            Err(err) => {
                tracing::error!(?addr, %err, "get mac failed");
                generic_fail()
            }
        }
    } else {
        match backend.set_mac(req.addr) {
            Ok(()) => {
                tracing::debug!(?addr, mac = ?req.addr, "set mac");
                ok_empty()
            }
            Err(err) => {
                tracing::error!(?addr, %err, "set mac failed");
                generic_fail()
            }
        }
    }
}

fn state(hier: &mut FunctionHierarchy, addr: FnAddr, payload: &[u8], rx: bool) -> Response {
    let Some(backend) = hier.backend_mut(addr) else {
        tracing::debug!(?addr, "request for invalid interface");
        return invalid_param();
    };
    let Ok((req, _)) = StateReq::read_from_prefix(payload) else {
        return invalid_param();
    };
    if req.dir == CmdDir::GET {
        let got = if rx {
            backend.rx_state()
        } else {
            backend.link_state()
        };
        match got {
            Ok(state) => {
                tracing::debug!(?addr, rx, ?state, "get state");
                ok(&StateResp {
                    state,
                    ..Default::default()
                })
            }
            Err(err) => {
                tracing::error!(?addr, rx, %err, "get state failed");
                generic_fail()
            }
        }
    } else {
        let set = if rx {
            backend.set_rx_state(req.state)
        } else {
            backend.set_link_state(req.state)
        };
        match set {
            Ok(()) => {
                tracing::debug!(?addr, rx, state = ?req.state, "set state");
                ok_empty()
            }
            Err(err) => {
                tracing::error!(?addr, rx, %err, "set state failed");
                generic_fail()
            }
        }
    }
}

fn link_info(hier: &mut FunctionHierarchy, addr: FnAddr, payload: &[u8]) -> Response {
    let Some(backend) = hier.backend_mut(addr) else {
        tracing::debug!(?addr, "request for invalid interface");
        return invalid_param();
    };
    let Ok((req, _)) = LinkInfoReq::read_from_prefix(payload) else {
        return invalid_param();
    };
    if req.dir == CmdDir::GET {
        match backend.link_info() {
            Ok(info) => {
                tracing::debug!(?addr, "get link info");
                ok(&info)
            }
            Err(err) => {
                tracing::error!(?addr, %err, "get link info failed");
                generic_fail()
            }
        }
    } else {
        match backend.set_link_info(&req.info) {
            Ok(()) => {
                tracing::debug!(?addr, speed = req.info.speed, "set link info");
                ok_empty()
            }
            Err(err) => {
                tracing::error!(?addr, %err, "set link info failed");
                generic_fail()
            }
        }
    }
}

fn if_stats(
    hier: &mut FunctionHierarchy,
    transport: &SyncTransport,
    addr: FnAddr,
    payload: &[u8],
) -> Response {
    let Some(backend) = hier.backend_mut(addr) else {
        tracing::debug!(?addr, "request for invalid interface");
        return invalid_param();
    };
    let Ok((req, _)) = IfStatsReq::read_from_prefix(payload) else {
        return invalid_param();
    };
    if req.offset == 0 {
        tracing::debug!(?addr, "get if stats with null offset");
        return invalid_param();
    }
    let stats = match backend.stats() {
        Ok(stats) => stats,
        Err(err) => {
            tracing::error!(?addr, %err, "get if stats failed");
            return generic_fail();
        }
    };
    // The host owns the offset; it allocates the copy-out window from its
    // half of the region. Only the bounds are ours to enforce.
    if let Err(err) = transport.region().write_obj(req.offset as usize, &stats) {
        tracing::debug!(?addr, offset = req.offset, %err, "stats copy-out rejected");
        return invalid_param();
    }
    tracing::debug!(?addr, offset = req.offset, "get if stats");
    ok(&IfStatsResp {
        offset: req.offset,
        reserved: 0,
    })
}

fn get_info(hier: &mut FunctionHierarchy, addr: FnAddr) -> Response {
    let Some((pkind, hb)) = hier.fn_info(addr) else {
        tracing::debug!(?addr, "request for invalid interface");
        return invalid_param();
    };
    tracing::debug!(?addr, pkind, "get info");
    ok(&GetInfoResp {
        pkind,
        reserved: 0,
        hb_interval_ms: hb.interval_ms,
        hb_miss_count: hb.miss_count,
        reserved2: 0,
    })
}

/// Sends a target-initiated link state change notification for `addr`.
pub fn notify_link_state(
    transport: &SyncTransport,
    addr: FnAddr,
    host_if_id: u16,
    state: LinkState,
) -> Result<(), ctrlmbox::MboxError> {
    let hdr = addr.hdr(NetCmd::LINK_STATUS).with_sender(host_if_id);
    let payload = StateResp {
        state,
        ..Default::default()
    };
    let msg = Message::notify(&[hdr.as_bytes(), payload.as_bytes()]);
    transport.send(&[msg])?;
    tracing::info!(?addr, ?state, "link state notification");
    Ok(())
}
