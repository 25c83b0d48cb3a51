//! Readiness multiplexer over epoll(7).

use std::convert::TryFrom;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::epoll::{
    epoll_create1, epoll_ctl, epoll_wait, EpollCreateFlags, EpollEvent, EpollFlags, EpollOp,
};
use nix::unistd::close;

/// Maximum events returned per call to epoll_wait(2).
pub const MAX_EVENTS: usize = 10;

/// Identifies one registration. Connection tokens are never reused, so an event can't be
/// mistaken for a later connection that happens to get the same descriptor number.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct Token(pub u64);

/// Token of the listening socket.
pub const LISTENER: Token = Token(0);

/// Which events a descriptor is watched for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Interest {
    /// Listening socket, level-triggered so a backlog is drained one accept per wakeup.
    Accept,
    /// Waiting for the request line.
    Read,
    /// Waiting for room to continue sending the response.
    Write,
}

impl Interest {
    fn flags(self) -> EpollFlags {
        // Each connection notification is handled once, so connections are edge-triggered and
        // always watch for hangups and errors.
        let hangup = EpollFlags::EPOLLET | EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLERR;
        match self {
            Self::Accept => EpollFlags::EPOLLIN,
            Self::Read => EpollFlags::EPOLLIN | hangup,
            Self::Write => EpollFlags::EPOLLOUT | hangup,
        }
    }
}

/// One ready descriptor.
#[derive(Clone, Copy, Debug)]
pub struct Event {
    pub token: Token,
    pub readiness: EpollFlags,
}

impl Event {
    pub fn is_readable(&self) -> bool {
        self.readiness.contains(EpollFlags::EPOLLIN)
    }
    pub fn is_writable(&self) -> bool {
        self.readiness.contains(EpollFlags::EPOLLOUT)
    }
    /// The peer shut down its side, or the connection is gone entirely.
    pub fn is_hangup(&self) -> bool {
        self.readiness
            .intersects(EpollFlags::EPOLLRDHUP | EpollFlags::EPOLLHUP)
    }
    /// Both directions are gone.
    pub fn is_closed(&self) -> bool {
        self.readiness.contains(EpollFlags::EPOLLHUP)
    }
    pub fn is_error(&self) -> bool {
        self.readiness.contains(EpollFlags::EPOLLERR)
    }
}

/// A bounded batch of ready events filled by `Poller::wait`.
pub struct Events {
    buf: Vec<EpollEvent>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![EpollEvent::empty(); capacity],
            len: 0,
        }
    }
    pub fn len(&self) -> usize {
        self.len
    }
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        self.buf[..self.len].iter().map(|event| Event {
            token: Token(event.data()),
            readiness: event.events(),
        })
    }
}

impl Default for Events {
    fn default() -> Self {
        Self::with_capacity(MAX_EVENTS)
    }
}

#[derive(Debug)]
pub struct Poller {
    epfd: RawFd,
}

impl Poller {
    pub fn new() -> nix::Result<Self> {
        let epfd = epoll_create1(EpollCreateFlags::EPOLL_CLOEXEC)?;
        Ok(Self { epfd })
    }

    /// Watch `fd` for `interest`. Registering a descriptor twice updates its interest.
    pub fn register(&self, fd: RawFd, token: Token, interest: Interest) -> nix::Result<()> {
        let mut event = EpollEvent::new(interest.flags(), token.0);
        match epoll_ctl(self.epfd, EpollOp::EpollCtlAdd, fd, &mut event) {
            Err(nix::Error::Sys(Errno::EEXIST)) => self.reregister(fd, token, interest),
            result => result,
        }
    }

    pub fn reregister(&self, fd: RawFd, token: Token, interest: Interest) -> nix::Result<()> {
        let mut event = EpollEvent::new(interest.flags(), token.0);
        epoll_ctl(self.epfd, EpollOp::EpollCtlMod, fd, &mut event)
    }

    /// Stop watching `fd`. Does nothing if it isn't registered.
    pub fn deregister(&self, fd: RawFd) -> nix::Result<()> {
        match epoll_ctl(self.epfd, EpollOp::EpollCtlDel, fd, None::<&mut EpollEvent>) {
            Err(nix::Error::Sys(Errno::ENOENT)) => Ok(()),
            result => result,
        }
    }

    /// Block until at least one registered descriptor is ready, or `timeout` elapses.
    /// `None` waits forever.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> nix::Result<usize> {
        let timeout_ms = timeout
            .map(|timeout| isize::try_from(timeout.as_millis()).unwrap_or(isize::MAX))
            .unwrap_or(-1);
        events.len = 0;
        events.len = epoll_wait(self.epfd, &mut events.buf, timeout_ms)?;
        Ok(events.len)
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        close(self.epfd).ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::os::unix::io::AsRawFd;

    fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn interest_flags() {
        assert_eq!(Interest::Accept.flags(), EpollFlags::EPOLLIN);
        assert!(Interest::Read.flags().contains(EpollFlags::EPOLLIN | EpollFlags::EPOLLET));
        assert!(Interest::Write.flags().contains(EpollFlags::EPOLLOUT | EpollFlags::EPOLLRDHUP));
        assert!(!Interest::Read.flags().contains(EpollFlags::EPOLLOUT));
    }

    #[test]
    fn wait_times_out_without_events() {
        let poller = Poller::new().unwrap();
        let mut events = Events::default();
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
        assert!(events.is_empty());
    }

    #[test]
    fn readable_event_carries_token() {
        let (mut client, server) = pair();
        let poller = Poller::new().unwrap();
        poller
            .register(server.as_raw_fd(), Token(7), Interest::Read)
            .unwrap();
        client.write_all(b"GET / HTTP/1.1\r\n").unwrap();

        let mut events = Events::default();
        poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        let event = events.iter().next().expect("no event");
        assert_eq!(event.token, Token(7));
        assert!(event.is_readable());
        assert!(!event.is_error());
    }

    #[test]
    fn register_twice_updates_interest() {
        let (_client, server) = pair();
        let poller = Poller::new().unwrap();
        poller
            .register(server.as_raw_fd(), Token(1), Interest::Read)
            .unwrap();
        poller
            .register(server.as_raw_fd(), Token(2), Interest::Write)
            .unwrap();

        // an idle socket is immediately writable
        let mut events = Events::default();
        poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        let event = events.iter().next().expect("no event");
        assert_eq!(event.token, Token(2));
        assert!(event.is_writable());
    }

    #[test]
    fn deregister_is_a_noop_when_unregistered() {
        let (_client, server) = pair();
        let poller = Poller::new().unwrap();
        poller.deregister(server.as_raw_fd()).unwrap();
        poller
            .register(server.as_raw_fd(), Token(1), Interest::Write)
            .unwrap();
        poller.deregister(server.as_raw_fd()).unwrap();
        poller.deregister(server.as_raw_fd()).unwrap();

        let mut events = Events::default();
        let n = poller
            .wait(&mut events, Some(Duration::from_millis(10)))
            .unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn peer_close_reports_hangup() {
        let (client, server) = pair();
        let poller = Poller::new().unwrap();
        poller
            .register(server.as_raw_fd(), Token(3), Interest::Read)
            .unwrap();
        drop(client);

        let mut events = Events::default();
        poller
            .wait(&mut events, Some(Duration::from_secs(5)))
            .unwrap();
        assert!(events.iter().next().expect("no event").is_hangup());
    }
}
