use std::sync::Arc;
use std::time::Duration;

use matches::assert_matches;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use hci_transport::hci::*;
use hci_transport::host::{self, Channel, MemChannel, TaskQueue};

const LE_LINK: u16 = 0x0040;

/// Simulated controller that completes every command, loops ACL data packets
/// back to the host, and reports their completion.
async fn controller(cmd: MemChannel, acl: MemChannel) {
    let (cmd_ready, acl_ready) = (cmd.watch().unwrap(), acl.watch().unwrap());
    let mut buf = [0; 1024];
    loop {
        while cmd.read(&mut buf).is_ok() {
            let opcode = u16::from_le_bytes([buf[0], buf[1]]);
            for evt in respond(opcode) {
                cmd.send(evt).unwrap();
            }
        }
        while let Ok(n) = acl.read(&mut buf) {
            let [lo, hi] = [buf[0], buf[1] & 0x0F];
            acl.send(&buf[..n]).unwrap();
            let nocp = [u8::from(EventCode::NumberOfCompletedPackets), 5, 1, lo, hi, 1, 0];
            cmd.send(nocp).unwrap();
        }
        tokio::select! {
            _ = cmd_ready.notified() => {}
            _ = acl_ready.notified() => {}
        }
    }
}

fn respond(opcode: u16) -> Vec<Vec<u8>> {
    let [lo, hi] = opcode.to_le_bytes();
    let cc = |params: &[u8]| {
        let mut v = vec![u8::from(EventCode::CommandComplete), 3 + params.len() as u8, 1, lo, hi];
        v.extend_from_slice(params);
        v
    };
    match Opcode::from(opcode) {
        Opcode::RESET => vec![cc(&[0])],
        Opcode::READ_BUFFER_SIZE => vec![cc(&[0, 27, 0, 64, 2, 0, 0, 0])],
        Opcode::LE_READ_BUFFER_SIZE => vec![cc(&[0, 251, 0, 3])],
        Opcode::LE_CREATE_CONNECTION => {
            let [h0, h1] = LE_LINK.to_le_bytes();
            let cs = vec![u8::from(EventCode::CommandStatus), 4, 0, 1, lo, hi];
            let mut done = vec![u8::from(EventCode::LeMetaEvent), 19];
            done.extend_from_slice(&[u8::from(SubeventCode::ConnectionComplete), 0, h0, h1, 0, 0]);
            done.extend_from_slice(&[1, 2, 3, 4, 5, 6, 0x18, 0, 0, 0, 0x48, 0, 0]);
            vec![cs, done]
        }
        _ => vec![cc(&[u8::from(Status::UnknownCommand)])],
    }
}

struct Stack {
    acl: AclDataChannel,
    cmd: CommandChannel,
}

async fn init() -> Stack {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_test_writer()
        .try_init();
    let (cmd_host, cmd_ctl) = host::pair();
    let (acl_host, acl_ctl) = host::pair();
    tokio::spawn(controller(cmd_ctl, acl_ctl));
    let d = TaskQueue::spawn();
    let cmd = CommandChannel::new(cmd_host, d.clone(), CommandConfig::default());
    cmd.initialize().unwrap();
    cmd.reset().await.unwrap();
    let bredr = cmd.read_buffer_size().await.unwrap();
    let le = cmd.le_read_buffer_size().await.unwrap();
    let events = Arc::new(cmd.commands());
    let acl = AclDataChannel::new(acl_host, events, bredr, le, d, AclConfig::default());
    acl.initialize().unwrap();
    Stack { acl, cmd }
}

#[tokio::test]
async fn buffer_size() {
    let s = init().await;
    assert_eq!(s.acl.buffer_info(), BufferInfo::new(27, 2));
    assert_eq!(s.acl.le_buffer_info(), BufferInfo::new(251, 3));
    assert_eq!(s.cmd.allowed_command_packets(), 1);
}

#[tokio::test]
async fn command_failure() {
    let s = init().await;
    let evt = (s.cmd.exec(CommandPacket::new(Opcode::READ_BD_ADDR), EventCode::CommandComplete))
        .await
        .unwrap();
    assert_eq!(evt.status(), Status::UnknownCommand);
    assert_matches!(
        evt.cmd_ok(),
        Err(Error::CommandFailed {
            opcode: Opcode::READ_BD_ADDR,
            status: Status::UnknownCommand
        })
    );
}

#[tokio::test]
async fn le_connection() {
    let s = init().await;
    let (tx, rx) = oneshot::channel();
    let cmd = CommandPacket::with_params(Opcode::LE_CREATE_CONNECTION, |p| {
        p.u16(0x0060_u16).u16(0x0030_u16);
    });
    let sub = SubeventCode::ConnectionComplete;
    (s.cmd.send_le_async_command(cmd, sub, move |_, r| {
        let _ = tx.send(r);
    }))
    .unwrap();
    let evt = timeout(Duration::from_secs(5), rx).await.unwrap().unwrap().unwrap();
    assert_eq!(evt.typ(), EventType::Le(sub));
    assert_eq!(evt.status(), Status::Success);
    let mut p = evt.unpack();
    assert_eq!(p.u8(), 0);
    assert_eq!(p.u16(), LE_LINK);
}

#[tokio::test]
async fn acl_loopback() {
    let s = init().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    s.acl.set_data_rx_handler(move |pkt| {
        let _ = tx.send(pkt.payload()[0]);
    });
    let hdl = ConnHandle::new(LE_LINK).unwrap();
    s.acl.register_link(hdl, LinkType::Le);
    for v in 0..10 {
        let pkt = AclPacket::new(hdl, BoundaryFlag::FirstNonFlushable, &[v, 0xAA]);
        s.acl.send_packet(pkt, 0x0004, Priority::Low).unwrap();
    }
    let mut got = Vec::new();
    while got.len() < 10 {
        let v = timeout(Duration::from_secs(5), rx.recv()).await.unwrap();
        got.push(v.unwrap());
    }
    assert_eq!(got, (0..10).collect::<Vec<u8>>());
    timeout(Duration::from_secs(5), async {
        while s.acl.pending_packets(hdl) > 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(s.acl.queued_packets(), 0);
    s.acl.unregister_link(hdl);
}

#[tokio::test]
async fn shut_down() {
    let s = init().await;
    s.acl.shut_down();
    s.cmd.shut_down();
    let r = s.cmd.exec(CommandPacket::new(Opcode::RESET), EventCode::CommandComplete).await;
    assert_matches!(r, Err(Error::NotInitialized));
    assert!(!s.acl.is_initialized());
}
