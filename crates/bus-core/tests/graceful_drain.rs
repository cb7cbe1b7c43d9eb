//! Scenario 6 from SPEC_FULL §8.4: draining a controller node stops new
//! accepts immediately while an already-open session is allowed to run to
//! CLOSED on its own.

use std::{
    io::{Read, Write},
    net::{Shutdown, TcpListener, TcpStream},
    sync::mpsc,
    thread,
    time::Duration,
};

use bus_core::{
    Connector, DuplexMode, Header, Interface, MsgFlags, MsgOp, Controller, ThreadedResolver, Transport,
    bind_listener, envelope::HEADER_SIZE,
};

/// A backend that understands the framed wire protocol well enough to echo
/// one request and then close out its half on STOP, standing in for a real
/// controller backend without pulling in the whole connector for it.
fn run_framed_echo_backend(listener: TcpListener) {
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        loop {
            let mut header_buf = [0u8; HEADER_SIZE];
            if stream.read_exact(&mut header_buf).is_err() {
                break;
            }
            let header = Header::from_bytes(&header_buf).unwrap();
            let mut payload = vec![0u8; header.payload_len()];
            if !payload.is_empty() {
                stream.read_exact(&mut payload).unwrap();
            }
            let op = MsgOp::from_u8(header.op).unwrap_or(MsgOp::Data);
            let reply = if op == MsgOp::Stop {
                Header::new(header.eid, 0, MsgOp::Stop, MsgFlags::empty())
            } else {
                Header::new(header.eid, payload.len(), MsgOp::Data, MsgFlags::empty())
            };
            stream.write_all(&reply.to_bytes()).unwrap();
            if !payload.is_empty() && op != MsgOp::Stop {
                stream.write_all(&payload).unwrap();
            }
            if op == MsgOp::Stop {
                break;
            }
        }
    });
}

#[test]
fn drain_blocks_new_accepts_but_finishes_open_sessions() {
    let backend_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let backend_addr = backend_listener.local_addr().unwrap();
    run_framed_echo_backend(backend_listener);

    let north_addr = "127.0.0.1:24794";
    let mut connector = Connector::<Controller>::new(
        DuplexMode::Half,
        vec![Interface::new(format!("tcp://{north_addr}"), Transport::Tcp)],
        vec![Interface::new(format!("tcp://{backend_addr}"), Transport::Tcp)],
        Box::new(ThreadedResolver::spawn()),
    )
    .unwrap();
    let (listener, _transport) = bind_listener(&format!("tcp://{north_addr}")).unwrap();
    connector.listen(0, listener).unwrap();

    enum Cmd {
        Drain,
    }
    let (cmd_tx, cmd_rx) = mpsc::channel::<Cmd>();
    let (status_tx, status_rx) = mpsc::channel::<(bool, bool)>();
    thread::spawn(move || {
        loop {
            connector.tick().unwrap();
            if matches!(cmd_rx.try_recv(), Ok(Cmd::Drain)) {
                connector.drain();
            }
            let _ = status_tx.send((connector.is_draining(), connector.is_idle()));
        }
    });

    thread::sleep(Duration::from_millis(200));

    let mut client1 = TcpStream::connect(north_addr).unwrap();
    client1.write_all(b"ping").unwrap();
    let mut reply = [0u8; 4];
    client1.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");

    cmd_tx.send(Cmd::Drain).unwrap();
    // Let the drain flag land before a second client tries to connect.
    thread::sleep(Duration::from_millis(100));

    let mut client2 = TcpStream::connect(north_addr).unwrap();
    client2.set_read_timeout(Some(Duration::from_millis(200))).unwrap();
    client2.write_all(b"ignored").unwrap();
    let mut buf = [0u8; 1];
    let never_accepted = client2.read(&mut buf).is_err();
    assert!(never_accepted, "a node that is draining must not accept new connections");

    client1.shutdown(Shutdown::Write).unwrap();

    let mut saw_drain_and_idle = false;
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while std::time::Instant::now() < deadline {
        if let Ok((draining, idle)) = status_rx.recv_timeout(Duration::from_millis(100)) {
            if draining && idle {
                saw_drain_and_idle = true;
                break;
            }
        }
    }
    assert!(saw_drain_and_idle, "the open session should run to CLOSED and leave the node idle while draining");
}
