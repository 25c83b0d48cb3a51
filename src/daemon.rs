use std::convert::TryFrom;
use std::fs::OpenOptions;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::{IntoRawFd, RawFd};

use anyhow::{anyhow, Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};
use nix::sys::stat::{umask, Mode};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup2, fork, pipe, read, setsid, write, ForkResult};

const PATH_DEVNULL: &str = "/dev/null";
const DAEMON_UMASK: u32 = 0o027;
// Highest descriptor swept when RLIMIT_NOFILE is unlimited. Linux's default fs.nr_open.
const UNLIMITED_SWEEP: RawFd = 1 << 20;

/// Detaches the process from its controlling terminal. `start` forks; the original process stays
/// in `start` until the daemon calls `finish` (or dies), so startup errors still reach the
/// terminal and the exit status.
pub struct Daemonize {
    lifeline_read: RawFd,
    lifeline_write: RawFd,
    fd_null: RawFd,
}

impl Daemonize {
    /// Close inherited descriptors except `keep`, then double fork into a new session.
    pub fn start(keep: &[RawFd]) -> Result<Self> {
        close_inherited_descriptors(keep).context("failed to close inherited descriptors")?;
        umask(Mode::from_bits_truncate(DAEMON_UMASK));

        // create lifeline pipe
        let (lifeline_read, lifeline_write) = pipe().context("failed to create pipe")?;

        // populate fd_null
        let fd_null = OpenOptions::new()
            .read(true)
            .write(true)
            .open(PATH_DEVNULL)
            .with_context(|| format!("failed to open {}", PATH_DEVNULL))?
            .into_raw_fd();

        if let ForkResult::Parent { child } = unsafe { fork() }.context("failed to fork process")? {
            // wait for the daemon
            if let Err(e) = close(lifeline_write) {
                eprintln!("warning: failed to close lifeline in parent: {}", e);
            }
            let mut buf = [0; 1];
            match read(lifeline_read, &mut buf) {
                Ok(1) => std::process::exit(0),
                Ok(_) => {}
                Err(e) => eprintln!("warning: failed read lifeline in parent: {}", e),
            }
            // the daemon died before it was ready
            match waitpid(child, Some(WaitPidFlag::WNOHANG))
                .with_context(|| format!("failed to wait for process {}", child))?
            {
                WaitStatus::Exited(_, status) if status != 0 => std::process::exit(status),
                _ => std::process::exit(1),
            }
        }

        setsid().context("failed to create session")?;
        unsafe { signal(Signal::SIGHUP, SigHandler::SigIgn) }
            .context("failed to ignore SIGHUP")?;

        // The session leader exits so the daemon can never reacquire a controlling terminal.
        if let ForkResult::Parent { .. } = unsafe { fork() }.context("failed to fork process")? {
            unsafe { libc::_exit(0) };
        }

        Ok(Self {
            lifeline_read,
            lifeline_write,
            fd_null,
        })
    }

    /// Tell the original process that startup succeeded and detach standard streams.
    pub fn finish(self) -> Result<()> {
        if let Err(e) = close(self.lifeline_read) {
            eprintln!(
                "warning: failed to close read end of lifeline in child: {}",
                e
            );
        }
        write(self.lifeline_write, &[1]).context("failed to signal readiness")?;
        if let Err(e) = close(self.lifeline_write) {
            eprintln!("warning: failed to cut the lifeline: {}", e);
        }

        // close all our std fds
        if let Err(e) = dup2(self.fd_null, libc::STDIN_FILENO) {
            eprintln!("warning: failed to close stdin: {}", e);
        }
        if let Err(e) = dup2(self.fd_null, libc::STDOUT_FILENO) {
            eprintln!("warning: failed to close stdout: {}", e);
        }
        if let Err(e) = dup2(self.fd_null, libc::STDERR_FILENO) {
            eprintln!("warning: failed to close stderr: {}", e);
        }
        if self.fd_null > 2 {
            close(self.fd_null).ok();
        }
        Ok(())
    }
}

/// Safe wrapper for `libc::getrlimit(RLIMIT_NOFILE)`.
fn max_open_files() -> io::Result<libc::rlim_t> {
    let mut rlimit = MaybeUninit::<libc::rlimit>::zeroed();
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, rlimit.as_mut_ptr()) } == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { rlimit.assume_init() }.rlim_cur)
}

/// Exclusive upper bound of the descriptor sweep for a RLIMIT_NOFILE soft limit.
fn sweep_limit(limit: libc::rlim_t) -> RawFd {
    if limit == libc::RLIM_INFINITY {
        return UNLIMITED_SWEEP;
    }
    RawFd::try_from(limit).unwrap_or(RawFd::MAX)
}

/// Close every descriptor above standard error that isn't in `keep`.
fn close_inherited_descriptors(keep: &[RawFd]) -> Result<()> {
    let limit = sweep_limit(max_open_files()?);
    if limit <= libc::STDERR_FILENO {
        return Err(anyhow!("descriptor limit {} is too low", limit));
    }
    for fd in (libc::STDERR_FILENO + 1)..limit {
        if !keep.contains(&fd) {
            // most of these aren't open
            close(fd).ok();
        }
    }
    Ok(())
}
