//! Loopback peers standing in for the remote end of a data connection

use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Listen on loopback and collect everything the first client sends
pub async fn spawn_sink() -> (SocketAddr, JoinHandle<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sink");
    let addr = listener.local_addr().expect("sink address");
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.expect("read");
        received
    });
    (addr, task)
}

/// Listen on loopback and send `data` to the first client, then close
pub async fn spawn_source(data: Vec<u8>) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind source");
    let addr = listener.local_addr().expect("source address");
    let task = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        stream.write_all(&data).await.expect("write");
        stream.shutdown().await.expect("shutdown");
    });
    (addr, task)
}

/// Connect to an active mode listener and send `data`
pub fn connect_and_send(port: u16, data: Vec<u8>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        stream.write_all(&data).await.expect("write");
        stream.shutdown().await.expect("shutdown");
    })
}

/// Connect to an active mode listener and collect what it sends
pub fn connect_and_receive(port: u16) -> JoinHandle<Vec<u8>> {
    tokio::spawn(async move {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.expect("connect");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).await.expect("read");
        received
    })
}

/// Port encoded in a PORT command argument `h1,h2,h3,h4,p1,p2`
pub fn port_from_argument(argument: &str) -> u16 {
    let parts: Vec<u16> = argument
        .split(',')
        .map(|part| part.parse().expect("numeric PORT field"))
        .collect();
    parts[4] * 256 + parts[5]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_from_argument() {
        assert_eq!(port_from_argument("127,0,0,1,195,80"), 50000);
        assert_eq!(port_from_argument("10,0,0,2,0,21"), 21);
    }
}
