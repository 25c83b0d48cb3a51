use std::os::unix::io::AsRawFd;

use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

use serverd::config::{parse_args, usage, Command};
use serverd::daemon::Daemonize;
use serverd::listener::create_listener;
use serverd::log::LogSink;
use serverd::server::{stop_running, Server};

const COPYRIGHT: &str = "copyright (c) 2021 Tom Dryer";

fn main() -> Result<()> {
    let mut args = std::env::args();
    let name = args
        .next()
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());

    let config = match parse_args(args)? {
        Command::Help => {
            usage(&name);
            return Ok(());
        }
        Command::Version => {
            println!(
                "{}/{}, {}.",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
                COPYRIGHT,
            );
            return Ok(());
        }
        Command::Run(config) => config,
    };

    println!(
        "{}/{}, {}.",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        COPYRIGHT,
    );

    let listener = create_listener(&config)?;

    let daemonize = config
        .daemon
        .then(|| Daemonize::start(&[listener.as_raw_fd()]).context("failed to daemonize"))
        .transpose()?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let log_sink = LogSink::open(&config.log)?;
    let mut server = Server::new(config, listener, log_sink)?;

    daemonize
        .map(|daemonize| daemonize.finish().context("failed to daemonize"))
        .transpose()?;

    server.serve()
}
