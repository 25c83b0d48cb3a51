use std::cmp::min;
use std::convert::TryFrom;
use std::fs::File;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::sys::socket;

use crate::server::ServerStats;

/// Sent ahead of the file for every well-formed request, whatever its method or URI.
pub const RESPONSE_HEADER: &str = "HTTP/1.1 200 OK\r\n\
    Connection: close\r\n\
    Content-Type: text/html\r\n\
    \r\n";

/// Reply to a request line the server couldn't understand.
pub const BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\n\
    Connection: close\r\n\
    Content-Type: text/html\r\n\
    \r\n\
    <html><head><title>400 Bad Request</title></head><body>\n\
    <h1>Bad Request</h1>\n\
    You sent a request that the server couldn't understand.\n\
    </body></html>\n";

const SENDFILE_SIZE_LIMIT: usize = 1 << 20;

#[derive(Debug, PartialEq)]
pub enum Progress {
    /// Header and file were sent in full.
    Complete,
    /// The socket buffer is full. Resume once the socket is writable again.
    Blocked,
}

/// The fixed header followed by the contents of one file.
#[derive(Debug)]
pub struct Response {
    file: File,
    header_sent: usize,
    length: u64,
    sent: u64,
}

impl Response {
    /// Open the file to send. Its size is fixed here, from fstat.
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let metadata = file
            .metadata()
            .with_context(|| format!("fstat() failed for {}", path.display()))?;
        if !metadata.is_file() {
            return Err(anyhow!("{} is not a regular file", path.display()));
        }
        Ok(Self {
            file,
            header_sent: 0,
            length: metadata.len(),
            sent: 0,
        })
    }

    /// Size of the file, as reported when it was opened.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Bytes of the file sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Send as much of the response as the socket accepts without blocking.
    pub fn send(&mut self, socket: RawFd, stats: &mut ServerStats) -> Result<Progress> {
        let header = RESPONSE_HEADER.as_bytes();
        while self.header_sent < header.len() {
            let sent = match socket::send(
                socket,
                &header[self.header_sent..],
                no_signal(),
            ) {
                Ok(sent) if sent > 0 => sent,
                Ok(_) => return Err(anyhow!("connection closed while sending header")),
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(Progress::Blocked),
                Err(e) => return Err(e).context("failed to send header"),
            };
            self.header_sent += sent;
            stats.total_out += sent as u64;
        }

        while self.sent < self.length {
            let mut offset = libc::off64_t::try_from(self.sent).context("file too large")?;
            // `u64` may be wider than `usize`, so saturate when casting.
            let count = usize::try_from(self.length - self.sent).unwrap_or(usize::MAX);
            let count = min(count, SENDFILE_SIZE_LIMIT); // Limit size per syscall.
            let sent = match sendfile64(socket, self.file.as_raw_fd(), Some(&mut offset), count) {
                Ok(sent) if sent > 0 => sent,
                Ok(_) => {
                    return Err(anyhow!(
                        "file shrank to {} bytes while sending {}",
                        self.sent,
                        self.length
                    ))
                }
                Err(nix::Error::Sys(Errno::EAGAIN)) => return Ok(Progress::Blocked),
                Err(e) => return Err(e).context("sendfile() failed"),
            };
            self.sent += sent as u64;
            stats.total_out += sent as u64;
        }
        Ok(Progress::Complete)
    }
}

/// `MSG_NOSIGNAL`, which nix doesn't name. A peer that went away is reported as EPIPE.
fn no_signal() -> socket::MsgFlags {
    socket::MsgFlags::from_bits_truncate(libc::MSG_NOSIGNAL)
}

/// Safe wrapper for `libc::sendfile64`.
fn sendfile64(
    out_fd: RawFd,
    in_fd: RawFd,
    offset: Option<&mut libc::off64_t>,
    count: usize,
) -> nix::Result<usize> {
    let offset = offset
        .map(|offset| offset as *mut _)
        .unwrap_or(std::ptr::null_mut());
    let ret = unsafe { libc::sendfile64(out_fd, in_fd, offset, count) };
    Errno::result(ret).map(|r| r as usize)
}

/// Best-effort 400 reply. The connection is closed right after, so a short write is not retried.
pub fn send_bad_request(socket: RawFd, stats: &mut ServerStats) {
    if let Ok(sent) = socket::send(
        socket,
        BAD_REQUEST.as_bytes(),
        no_signal(),
    ) {
        stats.total_out += sent as u64;
    }
}
