use std::fs::read_to_string;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_DOCROOT: &str = ".";
/// The only file the server ever sends, relative to the document root.
pub const INDEX_NAME: &str = "index.html";
/// Hostname value that requests a wildcard bind.
pub const WILDCARD_HOSTNAME: &str = "*";

/// Where diagnostics and the access log go.
#[derive(Debug, Clone, PartialEq)]
pub enum LogTarget {
    Stdout,
    Syslog,
    File(PathBuf),
}

/// Immutable server configuration, built once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `None` binds every interface.
    pub hostname: Option<String>,
    pub port: u16,
    pub docroot: PathBuf,
    /// Idle connections are evicted after this long. `None` never evicts.
    pub timeout: Option<Duration>,
    pub daemon: bool,
    pub log: LogTarget,
}

impl Config {
    /// Path of the file served to every request.
    pub fn index_path(&self) -> PathBuf {
        self.docroot.join(INDEX_NAME)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            hostname: None,
            port: DEFAULT_PORT,
            docroot: PathBuf::from(DEFAULT_DOCROOT),
            timeout: None,
            daemon: false,
            log: LogTarget::Stdout,
        }
    }
}

/// What the command line asks the process to do.
#[derive(Debug, PartialEq)]
pub enum Command {
    Run(Config),
    Help,
    Version,
}

/// Options that may come from the configuration file.
#[derive(Debug, Default, PartialEq)]
pub struct FileOptions {
    pub hostname: Option<String>,
    pub port: Option<String>,
    pub docroot: Option<PathBuf>,
}

/// Options given on the command line. Unset fields fall back to the configuration file.
#[derive(Debug, Default)]
struct CommandLine {
    hostname: Option<String>,
    port: Option<String>,
    docroot: Option<PathBuf>,
    configuration_filename: Option<PathBuf>,
    timeout: Option<Duration>,
    daemon: bool,
    log: Option<LogTarget>,
}

/// Parse command line arguments, not including the program name.
///
/// Values given on the command line take precedence over values from the configuration file.
pub fn parse_args<I>(args: I) -> Result<Command>
where
    I: IntoIterator<Item = String>,
{
    let mut cli = CommandLine::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(Command::Help),
            "--version" => return Ok(Command::Version),
            "-H" | "--hostname" => {
                cli.hostname = Some(args.next().with_context(|| missing(&arg, "hostname"))?);
            }
            "-p" | "--port" => {
                cli.port = Some(args.next().with_context(|| missing(&arg, "port"))?);
            }
            "-f" | "--configuration-filename" => {
                let filename = args.next().with_context(|| missing(&arg, "filename"))?;
                cli.configuration_filename = Some(PathBuf::from(filename));
            }
            "-r" | "--docroot" => {
                let docroot = args.next().with_context(|| missing(&arg, "directory"))?;
                cli.docroot = Some(PathBuf::from(docroot));
            }
            "-t" | "--timeout" => {
                let number = args.next().with_context(|| missing(&arg, "number"))?;
                let timeout_secs = number
                    .parse::<u64>()
                    .with_context(|| format!("timeout number {} is invalid", number))?;
                cli.timeout = match timeout_secs {
                    0 => None,
                    timeout_secs => Some(Duration::from_secs(timeout_secs)),
                };
            }
            "-d" | "--daemon" => cli.daemon = true,
            "--log" => {
                let filename = args.next().with_context(|| missing(&arg, "filename"))?;
                cli.log = Some(LogTarget::File(PathBuf::from(filename)));
            }
            "--syslog" => cli.log = Some(LogTarget::Syslog),
            _ => return Err(anyhow!("unknown argument `{}'", arg)),
        }
    }

    let file = match &cli.configuration_filename {
        Some(filename) => read_configuration_file(filename)?,
        None => FileOptions::default(),
    };

    let mut config = Config {
        timeout: cli.timeout,
        daemon: cli.daemon,
        ..Default::default()
    };
    if let Some(hostname) = cli.hostname.or(file.hostname) {
        config.hostname = match hostname.as_str() {
            WILDCARD_HOSTNAME => None,
            _ => Some(hostname),
        };
    }
    if let Some(port) = cli.port.or(file.port) {
        config.port = port
            .parse()
            .with_context(|| format!("port number {} is invalid", port))?;
    }
    if let Some(docroot) = cli.docroot.or(file.docroot) {
        config.docroot = docroot;
    }
    config.log = match cli.log {
        Some(log) => log,
        None if config.daemon => LogTarget::Syslog,
        None => LogTarget::Stdout,
    };
    Ok(Command::Run(config))
}

fn missing(flag: &str, what: &str) -> String {
    format!("missing {} after {}", what, flag)
}

/// Read and parse a configuration file.
pub fn read_configuration_file(filename: &Path) -> Result<FileOptions> {
    let text = read_to_string(filename)
        .with_context(|| format!("failed to read {}", filename.display()))?;
    parse_configuration(&text, filename)
}

/// Parse the `option=value` configuration format. `#` starts a comment and blank lines are
/// skipped. Later lines override earlier ones.
pub fn parse_configuration(text: &str, filename: &Path) -> Result<FileOptions> {
    let mut options = FileOptions::default();
    for (index, line) in text.lines().enumerate() {
        let line = match line.find('#') {
            Some(comment) => &line[..comment],
            None => line,
        }
        .trim();
        if line.is_empty() {
            continue;
        }

        let location = format!("{}:{}", filename.display(), index + 1);
        let (option, value) = match line.split_once('=') {
            Some((option, value)) => (option.trim(), value.trim()),
            None => (line, ""),
        };
        if value.is_empty() {
            return Err(anyhow!("{}: option `{}' has no value", location, option));
        }
        match option {
            "hostname" => options.hostname = Some(value.to_string()),
            "port" => options.port = Some(value.to_string()),
            "docroot" => options.docroot = Some(PathBuf::from(value)),
            _ => return Err(anyhow!("{}: unknown option `{}'", location, option)),
        }
    }
    Ok(options)
}

/// Print usage information.
pub fn usage(argv0: &str) {
    print!(
        "usage:\t{} [flags]\n\n\
        flags:\t-H, --hostname name (default: all interfaces)\n\
        \t\tAddress to bind the listening socket to. `*' means all.\n\n\
        \t-p, --port number (default: {})\n\
        \t\tSpecifies which port to listen on for connections.\n\
        \t\tPass 0 to let the system choose any free port for you.\n\n\
        \t-f, --configuration-filename filename (default: none)\n\
        \t\tReads hostname, port and docroot from an option=value file.\n\
        \t\tCommand line flags take precedence over the file.\n\n\
        \t-r, --docroot directory (default: {})\n\
        \t\tDirectory holding the {} that every request receives.\n\n\
        \t-t, --timeout secs (default: 0)\n\
        \t\tIf a connection is idle for more than this many seconds,\n\
        \t\tit will be closed. Set to zero to disable timeouts.\n\n\
        \t-d, --daemon (default: don't daemonize)\n\
        \t\tDetach from the controlling terminal and run in the background.\n\
        \t\tDiagnostics go to syslog unless --log is given.\n\n\
        \t--log filename (default: stdout)\n\
        \t\tSpecifies which file to append diagnostics and the request log to.\n\n\
        \t--syslog\n\
        \t\tUse syslog for diagnostics and the request log.\n\n\
        \t-h, --help\n\
        \t\tDisplay this help and exit.\n\n\
        \t--version\n\
        \t\tDisplay version information and exit.\n\n",
        argv0, DEFAULT_PORT, DEFAULT_DOCROOT, INDEX_NAME,
    );
}
