use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd};

use anyhow::{Context, Result};
use nix::sys::socket::{
    bind, listen, setsockopt, socket, sockopt, AddressFamily, InetAddr, SockAddr, SockFlag,
    SockType,
};

use crate::config::Config;

/// Length of the queue of pending connections.
pub const BACKLOG: usize = libc::SOMAXCONN as usize;

/// Resolve the address to bind to. `None` binds every interface.
pub fn resolve(hostname: Option<&str>, port: u16) -> Result<SocketAddrV4> {
    let hostname = match hostname {
        Some(hostname) => hostname,
        None => return Ok(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
    };
    (hostname, port)
        .to_socket_addrs()
        .with_context(|| format!("failed to resolve {}", hostname))?
        .find_map(|addr| match addr {
            SocketAddr::V4(addr) => Some(addr),
            SocketAddr::V6(_) => None,
        })
        .with_context(|| format!("no IPv4 address found for {}", hostname))
}

/// Initialize the non-blocking listening socket. This is the socket that we accept connections
/// from. The server can't run without it, so every failure here is fatal.
pub fn create_listener(config: &Config) -> Result<TcpListener> {
    let socket_addr = resolve(config.hostname.as_deref(), config.port)?;

    let fd = socket(
        AddressFamily::Inet,
        SockType::Stream,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
        None,
    )
    .context("failed to create listening socket")?;
    // Owns the descriptor from here on, so it is closed if anything below fails.
    let listener = unsafe { TcpListener::from_raw_fd(fd) };

    setsockopt(listener.as_raw_fd(), sockopt::ReuseAddr, &true)
        .context("failed to set SO_REUSEADDR")?;
    let addr = SockAddr::new_inet(InetAddr::from_std(&SocketAddr::V4(socket_addr)));
    bind(listener.as_raw_fd(), &addr)
        .with_context(|| format!("failed to bind listening socket to {}", socket_addr))?;
    listen(listener.as_raw_fd(), BACKLOG)
        .with_context(|| format!("failed to listen on {}", socket_addr))?;
    Ok(listener)
}
