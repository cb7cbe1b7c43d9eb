//! Scenario 1 from SPEC_FULL §8.4: a client talks the framed protocol to a
//! segment node, whose raw south side is a bare echo backend. Exercises
//! session origination on the first envelope, raw→envelope wrapping of the
//! backend's reply, and the STOP/half-close path down to a tombstoned,
//! completed session.

use std::{
    io::{Read, Write},
    net::TcpStream,
    sync::mpsc,
    thread,
    time::Duration,
};

use bus_core::{
    Connector, DuplexMode, Header, Interface, MsgFlags, MsgOp, Segment, ThreadedResolver, Transport, Uuid,
    bind_listener, envelope::HEADER_SIZE,
};

fn read_envelope(stream: &mut TcpStream) -> (Header, Vec<u8>) {
    let mut header_buf = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header_buf).unwrap();
    let header = Header::from_bytes(&header_buf).unwrap();
    let mut payload = vec![0u8; header.payload_len()];
    if !payload.is_empty() {
        stream.read_exact(&mut payload).unwrap();
    }
    (header, payload)
}

#[test]
fn echo_via_segment() {
    let echo_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let echo_addr = echo_listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = echo_listener.accept().unwrap();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => stream.write_all(&buf[..n]).unwrap(),
            }
        }
        let _ = stream.shutdown(std::net::Shutdown::Write);
    });

    let north_addr = "127.0.0.1:24793";
    let mut connector = Connector::<Segment>::new(
        DuplexMode::Half,
        vec![Interface::new(format!("tcp://{north_addr}"), Transport::Tcp)],
        vec![Interface::new(format!("tcp://{echo_addr}"), Transport::Tcp)],
        Box::new(ThreadedResolver::spawn()),
    )
    .unwrap();
    let (listener, _transport) = bind_listener(&format!("tcp://{north_addr}")).unwrap();
    connector.listen(0, listener).unwrap();

    let (idle_tx, idle_rx) = mpsc::sync_channel::<()>(1);
    thread::spawn(move || {
        loop {
            connector.tick().unwrap();
            if connector.is_idle() {
                let _ = idle_tx.try_send(());
            }
        }
    });

    // Give the resolver time to resolve the backend address before the
    // first envelope arrives and needs a live south stream.
    thread::sleep(Duration::from_millis(200));

    let mut client = TcpStream::connect(north_addr).unwrap();
    let uuid = Uuid::new_v4();
    let request = Header::new(uuid, 5, MsgOp::Data, MsgFlags::INIT);
    client.write_all(&request.to_bytes()).unwrap();
    client.write_all(b"hello").unwrap();

    let (_header, payload) = read_envelope(&mut client);
    assert_eq!(payload, b"hello");

    let stop = Header::new(uuid, 0, MsgOp::Stop, MsgFlags::empty());
    client.write_all(&stop.to_bytes()).unwrap();

    let (header, payload) = read_envelope(&mut client);
    assert_eq!(header.op, MsgOp::Stop as u8);
    assert!(payload.is_empty());

    idle_rx.recv_timeout(Duration::from_secs(2)).expect("session should close and the connector go idle");
}
