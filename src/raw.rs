//! Low-level socket operations and platform abstractions
//!
//! Sockets are created here as raw descriptors so that options which must be
//! set before `bind`/`connect` (buffer sizes, reuse flags, defer-accept) can be
//! applied, then handed to the std types, which own and close them.
//!
//! Unix uses the POSIX calls through `libc`; Windows uses WinSock2 through
//! `windows-sys`, with WSA initialised on first use.
//!
//! # Safety
//!
//! [`adopt`] assumes sole ownership of the handle it is given. Callers wrap a
//! handle in its owning std type right after [`open`] so that every error path
//! closes it.

use std::io;
use std::net::SocketAddr;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Domain {
    Ipv4,
    Ipv6,
}

impl Domain {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => Domain::Ipv4,
            SocketAddr::V6(_) => Domain::Ipv6,
        }
    }
}

/// Stream sockets speak TCP, datagram sockets UDP.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Type {
    Stream,
    Dgram,
}

/// An option and the value to set it to.
///
/// Options the platform lacks are accepted and ignored by [`set`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SockOpt {
    RecvBuffer(i32),
    SendBuffer(i32),
    ReuseAddr(bool),
    ReusePort(bool),
    /// `IP_TOS` on IPv4 sockets, `IPV6_TCLASS` on IPv6 ones.
    TrafficClass(Domain, i32),
    V6Only(bool),
    HopLimit(i32),
    NoDelay(bool),
    /// Linux only.
    QuickAck(bool),
    /// Busy-poll budget in microseconds. Linux only.
    BusyPoll(u32),
    /// Wake the listener only once the peer has sent data, waiting at most
    /// this many seconds. Linux only.
    DeferAccept(i32),
    /// Close discards unsent data at once instead of lingering.
    LingerOff,
}

fn flag(on: bool) -> i32 {
    i32::from(on)
}

/// Access to the raw handle of an owned socket type.
pub trait AsOs {
    fn os(&self) -> OsSocket;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

        pub type OsSocket = RawFd;

        impl<T: AsRawFd> AsOs for T {
            fn os(&self) -> OsSocket {
                self.as_raw_fd()
            }
        }

        #[cfg(any(target_os = "linux", target_os = "android"))]
        mod linux {
            pub const TCP_DEFER_ACCEPT: i32 = 9;
            pub const TCP_QUICKACK: i32 = 12;
            pub const SO_BUSY_POLL: i32 = 46;
        }

        /// A socket address in the layout the kernel expects.
        #[derive(Debug, Clone, Copy)]
        pub enum SockAddr {
            V4(libc::sockaddr_in),
            V6(libc::sockaddr_in6),
        }

        impl SockAddr {
            pub fn new(addr: SocketAddr) -> Self {
                match addr {
                    SocketAddr::V4(a) => {
                        // SAFETY: sockaddr_in is plain data; all-zero is a valid value.
                        let mut s: libc::sockaddr_in = unsafe { std::mem::zeroed() };
                        s.sin_family = libc::AF_INET as libc::sa_family_t;
                        s.sin_port = a.port().to_be();
                        // octets are already in network order
                        s.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) };
                        SockAddr::V4(s)
                    }
                    SocketAddr::V6(a) => {
                        // SAFETY: as above.
                        let mut s: libc::sockaddr_in6 = unsafe { std::mem::zeroed() };
                        s.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                        s.sin6_port = a.port().to_be();
                        s.sin6_flowinfo = a.flowinfo();
                        s.sin6_scope_id = a.scope_id();
                        s.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
                        SockAddr::V6(s)
                    }
                }
            }

            fn as_ptr(&self) -> *const libc::sockaddr {
                match self {
                    SockAddr::V4(s) => (s as *const libc::sockaddr_in).cast(),
                    SockAddr::V6(s) => (s as *const libc::sockaddr_in6).cast(),
                }
            }

            fn len(&self) -> libc::socklen_t {
                let n = match self {
                    SockAddr::V4(_) => std::mem::size_of::<libc::sockaddr_in>(),
                    SockAddr::V6(_) => std::mem::size_of::<libc::sockaddr_in6>(),
                };
                n as libc::socklen_t
            }
        }

        /// Creates a close-on-exec socket.
        pub fn open(domain: Domain, ty: Type) -> io::Result<OsSocket> {
            let family = match domain {
                Domain::Ipv4 => libc::AF_INET,
                Domain::Ipv6 => libc::AF_INET6,
            };
            let (kind, proto) = match ty {
                Type::Stream => (libc::SOCK_STREAM, libc::IPPROTO_TCP),
                Type::Dgram => (libc::SOCK_DGRAM, libc::IPPROTO_UDP),
            };
            #[cfg(any(target_os = "linux", target_os = "android"))]
            // SAFETY: plain syscall; the result is checked below.
            let fd = unsafe { libc::socket(family, kind | libc::SOCK_CLOEXEC, proto) };
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            // SAFETY: plain syscalls on the descriptor just created.
            let fd = unsafe {
                let fd = libc::socket(family, kind, proto);
                if fd >= 0 {
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
                fd
            };
            if fd < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(fd)
        }

        /// Wraps a raw descriptor in its owning type.
        ///
        /// # Safety
        /// `os` must be an open socket of the kind `T` expects, owned by no one else.
        pub unsafe fn adopt<T: FromRawFd>(os: OsSocket) -> T {
            unsafe { T::from_raw_fd(os) }
        }

        pub fn bind(os: OsSocket, sa: &SockAddr) -> io::Result<()> {
            // SAFETY: `sa` is a valid sockaddr of `sa.len()` bytes.
            cvt(unsafe { libc::bind(os, sa.as_ptr(), sa.len()) })
        }

        /// Starts a connect on a non-blocking socket. `Ok(())` covers both an
        /// immediate success and a connect still in progress.
        pub fn connect(os: OsSocket, sa: &SockAddr) -> io::Result<()> {
            // SAFETY: as in `bind`.
            match cvt(unsafe { libc::connect(os, sa.as_ptr(), sa.len()) }) {
                Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(()),
                other => other,
            }
        }

        pub fn listen(os: OsSocket, backlog: i32) -> io::Result<()> {
            // SAFETY: plain syscall.
            cvt(unsafe { libc::listen(os, backlog) })
        }

        pub fn set(os: OsSocket, opt: SockOpt) -> io::Result<()> {
            if opt == SockOpt::LingerOff {
                let l = libc::linger { l_onoff: 0, l_linger: 0 };
                return setsockopt(os, libc::SOL_SOCKET, libc::SO_LINGER, &l);
            }
            match int_opt(opt) {
                Some((level, name, value)) => setsockopt(os, level, name, &(value as libc::c_int)),
                None => Ok(()),
            }
        }

        /// `(level, name, value)` of an integer option, `None` where unsupported.
        fn int_opt(opt: SockOpt) -> Option<(i32, i32, i32)> {
            use libc::{IPPROTO_IP, IPPROTO_IPV6, IPPROTO_TCP, SOL_SOCKET};
            Some(match opt {
                SockOpt::RecvBuffer(n) => (SOL_SOCKET, libc::SO_RCVBUF, n),
                SockOpt::SendBuffer(n) => (SOL_SOCKET, libc::SO_SNDBUF, n),
                SockOpt::ReuseAddr(on) => (SOL_SOCKET, libc::SO_REUSEADDR, flag(on)),
                SockOpt::ReusePort(on) => (SOL_SOCKET, libc::SO_REUSEPORT, flag(on)),
                SockOpt::TrafficClass(Domain::Ipv4, tos) => (IPPROTO_IP, libc::IP_TOS, tos),
                SockOpt::TrafficClass(Domain::Ipv6, tc) => (IPPROTO_IPV6, libc::IPV6_TCLASS, tc),
                SockOpt::V6Only(on) => (IPPROTO_IPV6, libc::IPV6_V6ONLY, flag(on)),
                SockOpt::HopLimit(hops) => (IPPROTO_IPV6, libc::IPV6_UNICAST_HOPS, hops),
                SockOpt::NoDelay(on) => (IPPROTO_TCP, libc::TCP_NODELAY, flag(on)),
                #[cfg(any(target_os = "linux", target_os = "android"))]
                SockOpt::QuickAck(on) => (IPPROTO_TCP, linux::TCP_QUICKACK, flag(on)),
                #[cfg(any(target_os = "linux", target_os = "android"))]
                SockOpt::BusyPoll(us) => (SOL_SOCKET, linux::SO_BUSY_POLL, us.min(i32::MAX as u32) as i32),
                #[cfg(any(target_os = "linux", target_os = "android"))]
                SockOpt::DeferAccept(secs) => (IPPROTO_TCP, linux::TCP_DEFER_ACCEPT, secs),
                #[cfg(not(any(target_os = "linux", target_os = "android")))]
                SockOpt::QuickAck(_) | SockOpt::BusyPoll(_) | SockOpt::DeferAccept(_) => return None,
                SockOpt::LingerOff => return None,
            })
        }

        fn setsockopt<T>(os: OsSocket, level: i32, name: i32, value: &T) -> io::Result<()> {
            let len = std::mem::size_of::<T>() as libc::socklen_t;
            // SAFETY: `value` is a live `T` and `len` is its size.
            cvt(unsafe { libc::setsockopt(os, level, name, (value as *const T).cast(), len) })
        }

        fn cvt(rc: libc::c_int) -> io::Result<()> {
            if rc != 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(())
            }
        }
    } else {
        use std::os::windows::io::{AsRawSocket, FromRawSocket, RawSocket};
        use std::sync::Once;

        use windows_sys::Win32::Networking::WinSock as ws;

        pub type OsSocket = RawSocket;

        impl<T: AsRawSocket> AsOs for T {
            fn os(&self) -> OsSocket {
                self.as_raw_socket()
            }
        }

        static WSA_INIT: Once = Once::new();

        fn ensure_wsa() {
            WSA_INIT.call_once(|| {
                // SAFETY: WSADATA is plain data filled in by the call.
                let mut data: ws::WSADATA = unsafe { std::mem::zeroed() };
                // version 2.2
                let rc = unsafe { ws::WSAStartup(0x202, &mut data) };
                if rc != 0 {
                    log::error!("WSAStartup failed: {}", rc);
                }
            });
        }

        fn last_error() -> io::Error {
            // SAFETY: reads thread-local error state.
            io::Error::from_raw_os_error(unsafe { ws::WSAGetLastError() })
        }

        fn cvt(rc: i32) -> io::Result<()> {
            if rc != 0 {
                Err(last_error())
            } else {
                Ok(())
            }
        }

        #[derive(Clone, Copy)]
        pub enum SockAddr {
            V4(ws::SOCKADDR_IN),
            V6(ws::SOCKADDR_IN6),
        }

        impl SockAddr {
            pub fn new(addr: SocketAddr) -> Self {
                match addr {
                    SocketAddr::V4(a) => {
                        // SAFETY: plain data; all-zero is a valid value.
                        let mut s: ws::SOCKADDR_IN = unsafe { std::mem::zeroed() };
                        s.sin_family = ws::AF_INET;
                        s.sin_port = a.port().to_be();
                        s.sin_addr = ws::IN_ADDR {
                            S_un: ws::IN_ADDR_0 { S_addr: u32::from_ne_bytes(a.ip().octets()) },
                        };
                        SockAddr::V4(s)
                    }
                    SocketAddr::V6(a) => {
                        // SAFETY: as above.
                        let mut s: ws::SOCKADDR_IN6 = unsafe { std::mem::zeroed() };
                        s.sin6_family = ws::AF_INET6;
                        s.sin6_port = a.port().to_be();
                        s.sin6_flowinfo = a.flowinfo();
                        s.Anonymous.sin6_scope_id = a.scope_id();
                        s.sin6_addr = ws::IN6_ADDR { u: ws::IN6_ADDR_0 { Byte: a.ip().octets() } };
                        SockAddr::V6(s)
                    }
                }
            }

            fn as_ptr(&self) -> *const ws::SOCKADDR {
                match self {
                    SockAddr::V4(s) => (s as *const ws::SOCKADDR_IN).cast(),
                    SockAddr::V6(s) => (s as *const ws::SOCKADDR_IN6).cast(),
                }
            }

            fn len(&self) -> i32 {
                let n = match self {
                    SockAddr::V4(_) => std::mem::size_of::<ws::SOCKADDR_IN>(),
                    SockAddr::V6(_) => std::mem::size_of::<ws::SOCKADDR_IN6>(),
                };
                n as i32
            }
        }

        /// Creates an overlapped, non-inheritable socket.
        pub fn open(domain: Domain, ty: Type) -> io::Result<OsSocket> {
            ensure_wsa();
            let family = match domain {
                Domain::Ipv4 => ws::AF_INET,
                Domain::Ipv6 => ws::AF_INET6,
            } as i32;
            let kind = match ty {
                Type::Stream => ws::SOCK_STREAM,
                Type::Dgram => ws::SOCK_DGRAM,
            };
            let flags = ws::WSA_FLAG_OVERLAPPED | ws::WSA_FLAG_NO_HANDLE_INHERIT;
            // SAFETY: no protocol info is passed; the result is checked below.
            let s = unsafe { ws::WSASocketW(family, kind, 0, std::ptr::null_mut(), 0, flags) };
            if s == ws::INVALID_SOCKET {
                return Err(last_error());
            }
            Ok(s as OsSocket)
        }

        /// Wraps a raw socket in its owning type.
        ///
        /// # Safety
        /// `os` must be an open socket of the kind `T` expects, owned by no one else.
        pub unsafe fn adopt<T: FromRawSocket>(os: OsSocket) -> T {
            unsafe { T::from_raw_socket(os) }
        }

        pub fn bind(os: OsSocket, sa: &SockAddr) -> io::Result<()> {
            // SAFETY: `sa` is a valid sockaddr of `sa.len()` bytes.
            cvt(unsafe { ws::bind(os as usize, sa.as_ptr(), sa.len()) })
        }

        /// Starts a connect on a non-blocking socket. `Ok(())` covers both an
        /// immediate success and a connect still in progress.
        pub fn connect(os: OsSocket, sa: &SockAddr) -> io::Result<()> {
            // SAFETY: as in `bind`.
            match cvt(unsafe { ws::connect(os as usize, sa.as_ptr(), sa.len()) }) {
                Err(e) if e.raw_os_error() == Some(ws::WSAEWOULDBLOCK) => Ok(()),
                other => other,
            }
        }

        pub fn listen(os: OsSocket, backlog: i32) -> io::Result<()> {
            // SAFETY: plain call.
            cvt(unsafe { ws::listen(os as usize, backlog) })
        }

        pub fn set(os: OsSocket, opt: SockOpt) -> io::Result<()> {
            if opt == SockOpt::LingerOff {
                let l = ws::LINGER { l_onoff: 0, l_linger: 0 };
                return setsockopt(os, ws::SOL_SOCKET, ws::SO_LINGER, &l);
            }
            match int_opt(opt) {
                Some((level, name, value)) => setsockopt(os, level, name, &value),
                None => Ok(()),
            }
        }

        /// SO_REUSEADDR would let other processes steal the port here, so it
        /// is treated as unsupported along with the Linux-only options.
        fn int_opt(opt: SockOpt) -> Option<(i32, i32, i32)> {
            use ws::{IPPROTO_IP, IPPROTO_IPV6, IPPROTO_TCP, SOL_SOCKET};
            Some(match opt {
                SockOpt::RecvBuffer(n) => (SOL_SOCKET, ws::SO_RCVBUF, n),
                SockOpt::SendBuffer(n) => (SOL_SOCKET, ws::SO_SNDBUF, n),
                SockOpt::TrafficClass(Domain::Ipv4, tos) => (IPPROTO_IP, ws::IP_TOS, tos),
                SockOpt::TrafficClass(Domain::Ipv6, tc) => (IPPROTO_IPV6, ws::IPV6_TCLASS, tc),
                SockOpt::V6Only(on) => (IPPROTO_IPV6, ws::IPV6_V6ONLY, flag(on)),
                SockOpt::HopLimit(hops) => (IPPROTO_IPV6, ws::IPV6_UNICAST_HOPS, hops),
                SockOpt::NoDelay(on) => (IPPROTO_TCP, ws::TCP_NODELAY, flag(on)),
                SockOpt::ReuseAddr(_)
                | SockOpt::ReusePort(_)
                | SockOpt::QuickAck(_)
                | SockOpt::BusyPoll(_)
                | SockOpt::DeferAccept(_)
                | SockOpt::LingerOff => return None,
            })
        }

        fn setsockopt<T>(os: OsSocket, level: i32, name: i32, value: &T) -> io::Result<()> {
            let len = std::mem::size_of::<T>() as i32;
            // SAFETY: `value` is a live `T` and `len` is its size.
            cvt(unsafe { ws::setsockopt(os as usize, level, name, (value as *const T).cast(), len) })
        }
    }
}
