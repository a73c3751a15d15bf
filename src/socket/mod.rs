//! Pooled socket objects and the OS sockets behind them
//!
//! OS sockets are built here the same way for every transport: create the
//! raw handle, hand it to its owning std type, apply [`SocketOptions`], then
//! bind/listen/connect and convert to the `mio` type the pollers watch.

pub mod stream;
pub mod tcp;
pub mod udp;

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use mio::net::{TcpListener, TcpStream, UdpSocket as MioUdpSocket};

use crate::config::{apply_socket_options, SocketOptions};
use crate::raw::{self as r, AsOs, SockOpt};

pub use self::tcp::TcpSocket;
pub use self::udp::UdpSocket;

/// Lifecycle of a pooled socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SocketState {
    /// Allocated but not (yet) backed by a working OS socket.
    #[default]
    Invalid,
    Listening,
    Connecting,
    Established,
}

/// Seconds the kernel may hold a connection before reporting it to a
/// defer-accept listener.
const DEFER_ACCEPT_SECS: i32 = 5;

/// Creates a non-blocking TCP listener bound to `addr`.
pub fn bind_listener(addr: SocketAddr, opts: &SocketOptions, send_buf: usize, recv_buf: usize) -> io::Result<TcpListener> {
    let domain = r::Domain::of(&addr);
    // SAFETY: the descriptor was just created and is owned by nothing else.
    let sock: std::net::TcpListener = unsafe { r::adopt(r::open(domain, r::Type::Stream)?) };
    sock.set_nonblocking(true)?;
    r::set(sock.os(), SockOpt::ReuseAddr(true))?;
    r::set(sock.os(), SockOpt::LingerOff)?;
    apply_socket_options(sock.os(), domain, r::Type::Stream, opts, send_buf, recv_buf)?;
    if opts.defer_accept {
        r::set(sock.os(), SockOpt::DeferAccept(DEFER_ACCEPT_SECS))?;
    }
    r::bind(sock.os(), &r::SockAddr::new(addr))?;
    r::listen(sock.os(), opts.tcp_backlog)?;
    Ok(TcpListener::from_std(sock))
}

/// Starts a non-blocking connect to `addr`. The stream becomes writable once
/// the connect finished, successfully or not.
pub fn start_connect(addr: SocketAddr, opts: &SocketOptions, send_buf: usize, recv_buf: usize) -> io::Result<TcpStream> {
    let domain = r::Domain::of(&addr);
    // SAFETY: as in `bind_listener`.
    let sock: std::net::TcpStream = unsafe { r::adopt(r::open(domain, r::Type::Stream)?) };
    sock.set_nonblocking(true)?;
    apply_socket_options(sock.os(), domain, r::Type::Stream, opts, send_buf, recv_buf)?;
    r::set(sock.os(), SockOpt::NoDelay(true))?;
    r::connect(sock.os(), &r::SockAddr::new(addr))?;
    Ok(TcpStream::from_std(sock))
}

/// Creates a non-blocking UDP socket bound to `addr`.
pub fn bind_datagram(addr: SocketAddr, opts: &SocketOptions, send_buf: usize, recv_buf: usize) -> io::Result<MioUdpSocket> {
    let domain = r::Domain::of(&addr);
    // SAFETY: as in `bind_listener`.
    let sock: std::net::UdpSocket = unsafe { r::adopt(r::open(domain, r::Type::Dgram)?) };
    sock.set_nonblocking(true)?;
    apply_socket_options(sock.os(), domain, r::Type::Dgram, opts, send_buf, recv_buf)?;
    r::bind(sock.os(), &r::SockAddr::new(addr))?;
    Ok(MioUdpSocket::from_std(sock))
}

/// Creates a UDP socket on an ephemeral local port, connected to `peer`.
pub fn connect_datagram(peer: SocketAddr, opts: &SocketOptions, send_buf: usize, recv_buf: usize) -> io::Result<MioUdpSocket> {
    let local = match peer {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
    };
    // an ephemeral port shared through SO_REUSEPORT would steal traffic
    let opts = SocketOptions { reuse_port: false, ..opts.clone() };
    let sock = bind_datagram(local, &opts, send_buf, recv_buf)?;
    sock.connect(peer)?;
    Ok(sock)
}

#[inline]
pub(crate) fn is_would_block(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::time::{Duration, Instant};

    fn opts() -> SocketOptions {
        SocketOptions { reuse_port: false, ..SocketOptions::default() }
    }

    #[test]
    fn test_listener_accepts_blocking_client() {
        let listener = bind_listener("127.0.0.1:0".parse().unwrap(), &opts(), 64 * 1024, 64 * 1024).unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = std::net::TcpStream::connect(addr).unwrap();
        client.write_all(b"hi").unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        let (mut stream, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(e) if is_would_block(&e) && Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("accept failed: {}", e),
            }
        };
        let mut buf = [0u8; 2];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match stream.read_exact(&mut buf) {
                Ok(()) => break,
                Err(e) if is_would_block(&e) && Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("read failed: {}", e),
            }
        }
        assert_eq!(&buf, b"hi");
    }

    #[test]
    fn test_connect_refused_surfaces() {
        // grab a free port, then close it so nothing listens there
        let port = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        match start_connect(addr, &opts(), 4096, 4096) {
            Err(_) => {}
            Ok(stream) => {
                let deadline = Instant::now() + Duration::from_secs(2);
                loop {
                    if let Ok(Some(_)) | Err(_) = stream.take_error() {
                        break;
                    }
                    assert!(Instant::now() < deadline, "connect never failed");
                    std::thread::sleep(Duration::from_millis(5));
                }
            }
        }
    }

    #[test]
    fn test_datagram_pair() {
        let server = bind_datagram("127.0.0.1:0".parse().unwrap(), &opts(), 4096, 4096).unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = connect_datagram(server_addr, &opts(), 4096, 4096).unwrap();
        client.send(b"dgram").unwrap();

        let mut buf = [0u8; 16];
        let deadline = Instant::now() + Duration::from_secs(2);
        let (n, from) = loop {
            match server.recv_from(&mut buf) {
                Ok(pair) => break pair,
                Err(e) if is_would_block(&e) && Instant::now() < deadline => std::thread::sleep(Duration::from_millis(5)),
                Err(e) => panic!("recv failed: {}", e),
            }
        };
        assert_eq!(&buf[..n], b"dgram");
        assert_eq!(from, client.local_addr().unwrap());
    }
}
