#![cfg(all(unix, feature = "integration"))]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::Duration;

use workspaced::config::model::PortsConfig;
use workspaced::orchestrator::ports::PortAllocator;

use crate::common::*;

/// Accept one connection and echo back what it sends.
fn echo_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    std::thread::spawn(move || {
        for mut stream in listener.incoming().flatten() {
            let mut buf = [0u8; 64];
            if let Ok(n) = stream.read(&mut buf) {
                let _ = stream.write_all(&buf[..n]);
            }
        }
    });
    port
}

#[tokio::test]
async fn socat_relays_external_port_to_workspace() {
    let internal = echo_server();
    let allocator = PortAllocator::new(PortsConfig {
        base: free_port(),
        window: 100,
        ..Default::default()
    });

    let external = allocator.allocate(1, internal).await.unwrap();
    assert!(
        wait_for_port(external, Duration::from_secs(10)).await,
        "socat should listen on {external}"
    );

    let mut stream = TcpStream::connect(("127.0.0.1", external)).unwrap();
    stream.write_all(b"ping").unwrap();
    let mut reply = [0u8; 4];
    stream.read_exact(&mut reply).unwrap();
    assert_eq!(&reply, b"ping");

    allocator.release(1).await;
    drop(stream);
}
