// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! End-to-end control-plane scenarios over an in-process shared buffer:
//! a simulated host driver on one side, the agent's poll loop on the other.

use barmem::NullDoorbell;
use barmem::SharedBuffer;
use ctrlmbox::MailboxTransport;
use ctrlmbox::Message;
use ctrlmbox::MsgKind;
use ctrlmbox::Side;
use ctrlnet::perst::CtrlEvent;
use ctrlnet::perst::NullHooks;
use ctrlnet_defs::net::CmdDir;
use ctrlnet_defs::net::FnAddr;
use ctrlnet_defs::net::MtuReq;
use ctrlnet_defs::net::MtuResp;
use ctrlnet_defs::net::NetCmd;
use ctrlnet_defs::net::NetHdr;
use ctrlnet_defs::net::NetReply;
use epcp_agent::config::AgentConfig;
use epcp_agent::run::Agent;
use std::sync::Arc;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;

const CONFIG: &str = r#"
{
  "mailbox": { "region_size": 16384 },
  "pems": [
    {
      "idx": 0,
      "pfs": [
        {
          "idx": 0,
          "pkind": 57,
          "heartbeat": { "interval_ms": 1000, "miss_count": 20 },
          "iface": { "mtu": 1400, "mac": "02:00:00:00:00:01" },
          "vfs": [ { "idx": 0, "iface": { "mac": "02:00:00:00:01:00" } } ]
        }
      ]
    }
  ]
}
"#;

struct HostSim {
    transport: MailboxTransport,
}

impl HostSim {
    /// Issues one request and polls the agent until the response arrives.
    fn transact(&mut self, agent: &mut Agent, hdr: NetHdr, payload: &[u8]) -> (NetHdr, Vec<u8>) {
        let req = Message::request(&[hdr.as_bytes(), payload]);
        assert_eq!(self.transport.send(&[req]).unwrap(), 1);
        agent.poll(0);
        let resp = self
            .recv_one(MsgKind::Response)
            .expect("agent answered the request");
        let (hdr, rest) = NetHdr::read_from_prefix(&resp).unwrap();
        (hdr, rest.to_vec())
    }

    fn recv_one(&mut self, kind: MsgKind) -> Option<Vec<u8>> {
        self.transport
            .recv(16)
            .unwrap()
            .into_iter()
            .find(|msg| msg.kind == kind)
            .map(|msg| msg.data)
    }
}

fn setup() -> (HostSim, Agent) {
    let cfg = AgentConfig::parse(CONFIG).unwrap();
    let mem = SharedBuffer::new(cfg.mailbox.region_size);
    let agent = Agent::new(&cfg, mem.clone()).unwrap();
    let transport =
        MailboxTransport::attach(Arc::new(mem), Arc::new(NullDoorbell), Side::Host).unwrap();
    (HostSim { transport }, agent)
}

fn mtu_req(dir: CmdDir, val: u16) -> MtuReq {
    MtuReq {
        dir,
        val,
        reserved: 0,
    }
}

#[test]
fn mtu_set_then_get_round_trip() {
    let (mut host, mut agent) = setup();
    let hdr = FnAddr::pf(0, 0).hdr(NetCmd::MTU).with_sender(1);

    let (rhdr, data) = host.transact(&mut agent, hdr, mtu_req(CmdDir::SET, 1500).as_bytes());
    assert_eq!(rhdr.reply(), NetReply::OK);
    assert!(data.is_empty());

    let (rhdr, data) = host.transact(&mut agent, hdr, mtu_req(CmdDir::GET, 0).as_bytes());
    assert_eq!(rhdr.reply(), NetReply::OK);
    let (resp, _) = MtuResp::read_from_prefix(&data).unwrap();
    assert_eq!(resp.val, 1500);
}

#[test]
fn misaddressed_pf_gets_invalid_param() {
    let (mut host, mut agent) = setup();
    // only pf 0 exists under pem 0
    let hdr = FnAddr::pf(0, 7).hdr(NetCmd::MTU).with_sender(1);
    let (rhdr, data) = host.transact(&mut agent, hdr, mtu_req(CmdDir::GET, 0).as_bytes());
    assert_eq!(rhdr.reply(), NetReply::INVALID_PARAM);
    assert!(data.is_empty());
}

#[test]
fn heartbeats_arrive_on_schedule() {
    let (mut host, mut agent) = setup();

    // 1000 ms interval at 100 ms granularity: 30 polls emit exactly 3 beats
    for _ in 0..30 {
        agent.poll(100);
    }
    let beats: Vec<_> = host
        .transport
        .recv(64)
        .unwrap()
        .into_iter()
        .filter(|m| m.kind == MsgKind::Notify)
        .map(|m| NetHdr::read_from_prefix(&m.data).unwrap().0)
        .filter(|h| h.cmd() == NetCmd::HEARTBEAT)
        .collect();
    assert_eq!(beats.len(), 3);
    assert!(beats.iter().all(|h| FnAddr::from(*h) == FnAddr::pf(0, 0)));
}

#[test]
fn perst_recovery_restores_configured_state() {
    let (mut host, mut agent) = setup();
    let hdr = FnAddr::pf(0, 0).hdr(NetCmd::MTU).with_sender(1);

    let (rhdr, _) = host.transact(&mut agent, hdr, mtu_req(CmdDir::SET, 9000).as_bytes());
    assert_eq!(rhdr.reply(), NetReply::OK);

    agent
        .handle_event(CtrlEvent::Perst { pem: 0 }, &mut NullHooks)
        .unwrap();

    let (rhdr, data) = host.transact(&mut agent, hdr, mtu_req(CmdDir::GET, 0).as_bytes());
    assert_eq!(rhdr.reply(), NetReply::OK);
    let (resp, _) = MtuResp::read_from_prefix(&data).unwrap();
    assert_eq!(resp.val, 1400, "mtu reloaded from configuration");
}
