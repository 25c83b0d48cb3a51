//! Connection table and lifecycle engine: one epoll loop multiplexing the listening socket and
//! every accepted connection.

use std::cmp::min;
use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

use anyhow::{Context, Result};
use nix::errno::Errno;
use nix::sys::socket;

use crate::config::Config;
use crate::log::{ClfDate, LogEncoded, LogSink};
use crate::poller::{Event, Events, Interest, Poller, Token, LISTENER, MAX_EVENTS};
use crate::request::{has_request_line, parse_request_line};
use crate::response::{send_bad_request, Progress, Response};

/// Size of the request buffer. A request line must arrive within this many bytes.
pub const REQUEST_BUFFER_SIZE: usize = 1024;
/// How long accepting stays paused after running out of descriptors when no connection is open
/// to free one.
pub const ACCEPT_RETRY: Duration = Duration::from_millis(100);

static RUNNING: AtomicBool = AtomicBool::new(true);

pub extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

pub fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

#[derive(Debug, Default)]
pub struct ServerStats {
    pub num_connections: u64,
    pub num_requests: u64,
    pub total_in: u64,
    pub total_out: u64,
}

impl ServerStats {
    fn log(&self, log_sink: &mut LogSink) -> Result<()> {
        let rusage = getrusage().context("failed to get resource usage")?;
        log_sink.info(&format!(
            "CPU time used: {}.{:02} user, {}.{:02} system",
            rusage.ru_utime.tv_sec,
            rusage.ru_utime.tv_usec / 10000,
            rusage.ru_stime.tv_sec,
            rusage.ru_stime.tv_usec / 10000,
        ));
        log_sink.info(&format!(
            "Connections: {}, requests: {}",
            self.num_connections, self.num_requests
        ));
        log_sink.info(&format!(
            "Bytes: {} in, {} out",
            self.total_in, self.total_out
        ));
        Ok(())
    }
}

/// Safe wrapper for `libc::getrusage`.
fn getrusage() -> io::Result<libc::rusage> {
    let mut rusage = MaybeUninit::<libc::rusage>::zeroed();
    if unsafe { libc::getrusage(libc::RUSAGE_SELF, rusage.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { rusage.assume_init() })
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ConnectionState {
    /// Waiting for the request line.
    Accepted,
    /// Request line parsed, response in progress.
    RequestReceived,
    ResponseSent,
    Failed,
}

/// What the engine should do with a connection after handling an event.
#[derive(Debug, PartialEq)]
enum Step {
    Wait,
    /// The connection's interest changed and must be re-registered.
    Rearm,
    /// The connection reached `ResponseSent` or `Failed`.
    Close,
}

struct Connection {
    socket: TcpStream,
    peer: SocketAddr,
    interest: Interest,
    state: ConnectionState,
    last_active: Instant,
    request: Vec<u8>,
    /// Method, URI and version as they should appear in the access log.
    request_line: Option<String>,
    http_code: u16,
    response: Option<Response>,
}

impl Connection {
    fn new(now: Instant, socket: TcpStream, peer: SocketAddr) -> Self {
        Self {
            socket,
            peer,
            interest: Interest::Read,
            state: ConnectionState::Accepted,
            last_active: now,
            request: Vec::with_capacity(REQUEST_BUFFER_SIZE),
            request_line: None,
            http_code: 0,
            response: None,
        }
    }

    fn handle_event(
        &mut self,
        event: &Event,
        index_path: &Path,
        now: Instant,
        stats: &mut ServerStats,
    ) -> Result<Step> {
        if event.is_error() {
            let error = self.socket.take_error().ok().flatten();
            return Err(match error {
                Some(e) => anyhow::Error::new(e).context("socket error"),
                None => anyhow::anyhow!("socket error"),
            });
        }
        match self.state {
            ConnectionState::Accepted => self.recv_request(event, index_path, now, stats),
            ConnectionState::RequestReceived => {
                if event.is_closed() {
                    return Err(anyhow::anyhow!("connection closed before response was sent"));
                }
                if event.is_writable() {
                    self.last_active = now;
                    return self.send_response(stats);
                }
                Ok(Step::Wait)
            }
            ConnectionState::ResponseSent | ConnectionState::Failed => Ok(Step::Close),
        }
    }

    /// Read one chunk of the request. Once the request line is in, start sending the response.
    fn recv_request(
        &mut self,
        event: &Event,
        index_path: &Path,
        now: Instant,
        stats: &mut ServerStats,
    ) -> Result<Step> {
        let mut buf = [0; REQUEST_BUFFER_SIZE];
        let room = REQUEST_BUFFER_SIZE - self.request.len();
        let recvd = match socket::recv(
            self.socket.as_raw_fd(),
            &mut buf[..room],
            socket::MsgFlags::empty(),
        ) {
            Ok(recvd) if recvd > 0 => recvd,
            Ok(_) if !self.request.is_empty() => {
                // half-closed after part of the request line
                return Ok(self.reject(stats));
            }
            Ok(_) => {
                // closure by peer
                self.state = ConnectionState::Failed;
                return Ok(Step::Close);
            }
            Err(nix::Error::Sys(Errno::EAGAIN)) if !event.is_hangup() => {
                // would block
                return Ok(Step::Wait);
            }
            Err(nix::Error::Sys(Errno::EAGAIN)) if !self.request.is_empty() => {
                return Ok(self.reject(stats));
            }
            Err(nix::Error::Sys(Errno::EAGAIN)) => {
                self.state = ConnectionState::Failed;
                return Ok(Step::Close);
            }
            Err(e) => return Err(e).context("recv() failed"),
        };
        self.last_active = now;
        self.request.extend_from_slice(&buf[..recvd]);
        stats.total_in += recvd as u64;

        if !has_request_line(&self.request) {
            // A full buffer or a half-closed peer means the line will never be completed. Edge
            // triggering won't report the hangup again, so give up now.
            if self.request.len() < REQUEST_BUFFER_SIZE && !event.is_hangup() {
                return Ok(Step::Wait);
            }
            return Ok(self.reject(stats));
        }

        stats.num_requests += 1;
        match parse_request_line(&self.request) {
            Ok(line) => {
                self.request_line = Some(format!(
                    "{} {} {}",
                    LogEncoded(line.method),
                    LogEncoded(line.uri),
                    LogEncoded(line.version)
                ));
            }
            Err(_) => return Ok(self.reject(stats)),
        }
        self.request = Vec::new();
        self.state = ConnectionState::RequestReceived;
        self.response = Some(Response::open(index_path)?);
        self.http_code = 200;

        // Try to send straight away rather than waiting for another epoll_wait() round.
        self.send_response(stats)
    }

    fn send_response(&mut self, stats: &mut ServerStats) -> Result<Step> {
        let response = match self.response.as_mut() {
            Some(response) => response,
            None => return Err(anyhow::anyhow!("no response to send")),
        };
        match response.send(self.socket.as_raw_fd(), stats)? {
            Progress::Complete => {
                self.state = ConnectionState::ResponseSent;
                Ok(Step::Close)
            }
            Progress::Blocked if self.interest == Interest::Write => Ok(Step::Wait),
            Progress::Blocked => {
                self.interest = Interest::Write;
                Ok(Step::Rearm)
            }
        }
    }

    /// Reply 400 to a malformed request line. Never sends a 200.
    fn reject(&mut self, stats: &mut ServerStats) -> Step {
        if let Ok(line) = std::str::from_utf8(&self.request) {
            self.request_line = Some(LogEncoded(line.trim_end().as_bytes()).to_string());
        }
        send_bad_request(self.socket.as_raw_fd(), stats);
        self.http_code = 400;
        self.state = ConnectionState::Failed;
        Step::Close
    }

    fn total_sent(&self) -> u64 {
        self.response.as_ref().map(Response::sent).unwrap_or(0)
    }
}

pub struct Server {
    config: Config,
    listener: TcpListener,
    poller: Poller,
    connections: HashMap<Token, Connection>,
    next_token: u64,
    /// Out of descriptors since this instant: the listener is deregistered until a connection
    /// closes, or until `ACCEPT_RETRY` passes with no connections open.
    files_exhausted: Option<Instant>,
    log_sink: LogSink,
    stats: ServerStats,
}

impl Server {
    /// Create the poller and start watching the listening socket.
    pub fn new(config: Config, listener: TcpListener, log_sink: LogSink) -> Result<Self> {
        let poller = Poller::new().context("failed to create epoll instance")?;
        poller
            .register(listener.as_raw_fd(), LISTENER, Interest::Accept)
            .context("failed to register listening socket")?;
        Ok(Self {
            config,
            listener,
            poller,
            connections: HashMap::new(),
            next_token: LISTENER.0 + 1,
            files_exhausted: None,
            log_sink,
            stats: ServerStats::default(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Number of open connections.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    /// Serve until SIGINT or SIGTERM.
    pub fn serve(&mut self) -> Result<()> {
        let hostname = self.config.hostname.as_deref().unwrap_or("*");
        let message = match self.local_addr() {
            Ok(addr) => format!(
                "listening on: http://{}/ ({}), pid {}",
                addr,
                hostname,
                std::process::id()
            ),
            Err(_) => format!("listening on {}, pid {}", hostname, std::process::id()),
        };
        self.log_sink.info(&message);

        while is_running() {
            if let Err(e) = self.poll(self.next_wait()) {
                self.log_sink.error(&format!("{:#}", e));
                return Err(e);
            }
        }

        let now = SystemTime::now();
        let tokens: Vec<Token> = self.connections.keys().copied().collect();
        for token in tokens {
            self.close_connection(token, now);
        }
        self.stats.log(&mut self.log_sink)
    }

    /// How long `serve` may block in one wait. `None` blocks until something is ready.
    pub fn next_wait(&self) -> Option<Duration> {
        // Only wake up for idle eviction while there is something to evict.
        let idle = self.config.timeout.filter(|_| !self.connections.is_empty());
        match self.files_exhausted {
            Some(_) => Some(idle.map_or(ACCEPT_RETRY, |idle| min(idle, ACCEPT_RETRY))),
            None => idle,
        }
    }

    /// Wait for readiness once and handle the whole batch. Only failures that make the server
    /// unusable are returned; per-connection failures close that connection.
    pub fn poll(&mut self, wait: Option<Duration>) -> Result<()> {
        let mut events = Events::with_capacity(MAX_EVENTS);
        match self.poller.wait(&mut events, wait) {
            Ok(_) => {}
            Err(nix::Error::Sys(Errno::EINTR)) => return Ok(()), // interrupted by signal
            Err(e) => return Err(e).context("epoll_wait() failed"),
        }

        let now = Instant::now();
        for event in events.iter() {
            if event.token == LISTENER {
                self.accept_connection(now);
            } else {
                self.handle_connection_event(&event, now);
            }
        }

        self.evict_idle(now);

        // Nothing will close to give a descriptor back, so try again after a while.
        if let Some(since) = self.files_exhausted {
            if self.connections.is_empty() && now.saturating_duration_since(since) >= ACCEPT_RETRY
            {
                self.resume_accepting();
            }
        }
        Ok(())
    }

    /// Accept one connection from the listener and add it to the connection table.
    fn accept_connection(&mut self, now: Instant) {
        let (stream, peer) = match self.listener.accept() {
            Ok((stream, peer)) => (stream, peer),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    self.pause_accepting(now);
                }
                self.log_sink.warn(&format!("accept() failed: {}", e));
                return;
            }
        };

        if let Err(e) = stream.set_nonblocking(true) {
            self.log_sink
                .warn(&format!("failed to make connection from {} non-blocking: {}", peer, e));
            return;
        }

        let token = Token(self.next_token);
        self.next_token += 1;
        if let Err(e) = self
            .poller
            .register(stream.as_raw_fd(), token, Interest::Read)
        {
            self.log_sink
                .warn(&format!("failed to register connection from {}: {}", peer, e));
            return;
        }

        self.stats.num_connections += 1;
        self.connections
            .insert(token, Connection::new(now, stream, peer));
    }

    fn handle_connection_event(&mut self, event: &Event, now: Instant) {
        let index_path = self.config.index_path();
        let conn = match self.connections.get_mut(&event.token) {
            Some(conn) => conn,
            None => return, // closed earlier in this batch
        };

        match conn.handle_event(event, &index_path, now, &mut self.stats) {
            Ok(Step::Wait) => {}
            Ok(Step::Rearm) => {
                if let Err(e) =
                    self.poller
                        .reregister(conn.socket.as_raw_fd(), event.token, conn.interest)
                {
                    let message = format!("failed to re-register {}: {}", conn.peer, e);
                    conn.state = ConnectionState::Failed;
                    self.log_sink.warn(&message);
                    self.close_connection(event.token, SystemTime::now());
                }
            }
            Ok(Step::Close) => self.close_connection(event.token, SystemTime::now()),
            Err(e) => {
                let message = format!("{}: {:#}", conn.peer, e);
                conn.state = ConnectionState::Failed;
                self.log_sink.warn(&message);
                self.close_connection(event.token, SystemTime::now());
            }
        }
    }

    /// If a connection has been idle for more than the configured timeout, close it.
    fn evict_idle(&mut self, now: Instant) {
        let timeout = match self.config.timeout {
            Some(timeout) => timeout,
            None => return,
        };
        let idle: Vec<Token> = self
            .connections
            .iter()
            .filter(|(_, conn)| now.saturating_duration_since(conn.last_active) >= timeout)
            .map(|(&token, _)| token)
            .collect();
        for token in idle {
            if let Some(conn) = self.connections.get_mut(&token) {
                conn.state = ConnectionState::Failed;
            }
            self.close_connection(token, SystemTime::now());
        }
    }

    /// Remove a connection from the table, deregister it, log it and close its socket. Taking
    /// the connection out of the table is the only way to reach its socket, so this happens at
    /// most once per connection.
    fn close_connection(&mut self, token: Token, now: SystemTime) {
        let conn = match self.connections.remove(&token) {
            Some(conn) => conn,
            None => return,
        };
        if let Err(e) = self.poller.deregister(conn.socket.as_raw_fd()) {
            self.log_sink
                .warn(&format!("failed to deregister {}: {}", conn.peer, e));
        }
        self.log_connection(&conn, now);
        drop(conn);

        // Try to resume accepting if we ran out of sockets.
        if self.files_exhausted.is_some() {
            self.resume_accepting();
        }
    }

    /// Stop watching the listener while the process is out of descriptors.
    fn pause_accepting(&mut self, now: Instant) {
        self.files_exhausted = Some(now);
        if let Err(e) = self.poller.deregister(self.listener.as_raw_fd()) {
            self.log_sink
                .warn(&format!("failed to pause listening socket: {}", e));
        }
    }

    fn resume_accepting(&mut self) {
        match self
            .poller
            .register(self.listener.as_raw_fd(), LISTENER, Interest::Accept)
        {
            Ok(()) => self.files_exhausted = None,
            Err(e) => self
                .log_sink
                .warn(&format!("failed to resume listening socket: {}", e)),
        }
    }

    /// Add a connection's details to the access log.
    fn log_connection(&mut self, conn: &Connection, now: SystemTime) {
        if conn.http_code == 0 {
            return; // invalid - died in request
        }
        let request_line = match &conn.request_line {
            Some(request_line) => request_line,
            None => return,
        };
        let message = format!(
            "{} - - {} \"{}\" {} {}",
            conn.peer.ip(),
            ClfDate(now),
            request_line,
            conn.http_code,
            conn.total_sent(),
        );
        self.log_sink.info(&message);
    }
}
