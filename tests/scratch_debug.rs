use std::net::{TcpListener, TcpStream};
use std::thread;
use fleetsync::protocol::{MsgType, Transport};

fn socket_pair() -> (Transport, Transport) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (Transport::new(client).unwrap(), Transport::new(server).unwrap())
}

#[test]
fn discard_small_compressed_after_plain_auth() {
    let (mut a, mut b) = socket_pair();
    a.send(MsgType::AuthReq, b"hello-auth-req").unwrap();
    let (_, _) = b.read_frame().unwrap();
    b.send(MsgType::AuthResp, b"ok").unwrap();
    let (_, _) = a.read_frame().unwrap();

    a.enable_compression().unwrap();
    b.enable_compression().unwrap();

    let handle = thread::spawn(move || {
        a.send(MsgType::FileList, b"{\"checksum\":true}").unwrap();
        eprintln!("client: sent small FileList req");
    });

    eprintln!("server: about to read header");
    let (msg, len) = b.read_header().unwrap();
    eprintln!("server: got header {:?} len {}", msg, len);
    eprintln!("server: about to discard payload");
    b.discard_payload(len).unwrap();
    eprintln!("server: discarded payload");
    handle.join().unwrap();
}
