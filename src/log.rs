use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::time::SystemTime;

use anyhow::{Context, Result};
use chrono::{DateTime, Local};

use crate::config::LogTarget;

const SYSLOG_IDENT: &[u8] = b"serverd\0";

/// Where to put diagnostics and the access log.
#[derive(Debug)]
pub enum LogSink {
    Stdout,
    Syslog,
    File(BufWriter<File>),
}

impl LogSink {
    /// Open the sink a configuration asks for.
    pub fn open(target: &LogTarget) -> Result<Self> {
        Ok(match target {
            LogTarget::Stdout => Self::Stdout,
            LogTarget::Syslog => {
                // The ident must outlive every later syslog() call.
                unsafe {
                    libc::openlog(
                        SYSLOG_IDENT.as_ptr() as *const libc::c_char,
                        libc::LOG_PID,
                        libc::LOG_DAEMON,
                    )
                };
                Self::Syslog
            }
            LogTarget::File(filename) => Self::File(BufWriter::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(filename)
                    .with_context(|| format!("failed to open log file {}", filename.display()))?,
            )),
        })
    }

    /// Log an informational message, such as an access log line.
    pub fn info(&mut self, message: &str) {
        if let Err(e) = self.log(libc::LOG_INFO, message) {
            eprintln!("warning: failed to write log message: {}", e);
        }
    }

    /// Log a problem that does not stop the server.
    pub fn warn(&mut self, message: &str) {
        if let Err(e) = self.log(libc::LOG_WARNING, &format!("warning: {}", message)) {
            eprintln!("warning: failed to write log message: {}", e);
        }
    }

    /// Log an error that is about to terminate the server.
    pub fn error(&mut self, message: &str) {
        if let Err(e) = self.log(libc::LOG_ERR, &format!("error: {}", message)) {
            eprintln!("warning: failed to write log message: {}", e);
        }
    }

    fn log(&mut self, priority: libc::c_int, message: &str) -> std::io::Result<()> {
        match self {
            Self::Stdout if priority == libc::LOG_INFO => {
                println!("{}", message);
            }
            Self::Stdout => {
                eprintln!("{}", message);
            }
            Self::Syslog => {
                let message = CString::new(message)?;
                unsafe {
                    libc::syslog(
                        priority,
                        b"%s\0".as_ptr() as *const libc::c_char,
                        message.as_ptr(),
                    )
                };
            }
            Self::File(file) => {
                writeln!(file, "{}", message)?;
                file.flush()?;
            }
        }
        Ok(())
    }
}

impl Default for LogSink {
    fn default() -> Self {
        Self::Stdout
    }
}

/// Common Log Format (CLF) formatted date in local timezone.
pub struct ClfDate(pub SystemTime);

impl std::fmt::Display for ClfDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let datetime = DateTime::<Local>::from(self.0);
        write!(f, "{}", datetime.format("[%d/%b/%Y:%H:%M:%S %z]"))
    }
}

/// Encode bytes for logging. Logs should not contain control characters, non-ASCII bytes or
/// double quotes.
pub struct LogEncoded<'a>(pub &'a [u8]);

impl<'a> std::fmt::Display for LogEncoded<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for &b in self.0 {
            if !b.is_ascii() || b.is_ascii_control() || b == b'"' {
                write!(f, "%{:02X}", b)?;
            } else {
                write!(f, "{}", b as char)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::io::Read;
    use std::time::Duration;

    use tempfile::NamedTempFile;

    #[test]
    fn log_encoded_works() {
        assert_eq!(
            LogEncoded("some\"log\tcrab\u{1F980}".as_bytes()).to_string(),
            "some%22log%09crab%F0%9F%A6%80"
        );
        assert_eq!(LogEncoded(b"GET\r\n\xff").to_string(), "GET%0D%0A%FF");
    }

    #[test]
    fn clf_date_works() {
        // contains system's local timezone
        assert!(
            ClfDate(SystemTime::UNIX_EPOCH + Duration::from_secs(1620965123))
                .to_string()
                .contains("May/2021")
        );
    }

    #[test]
    fn file_sink_appends_lines() {
        let file = NamedTempFile::new().unwrap();
        let mut sink = LogSink::open(&LogTarget::File(file.path().to_path_buf())).unwrap();
        sink.info("first");
        sink.warn("second");
        sink.error("third");
        let mut contents = String::new();
        File::open(file.path())
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents, "first\nwarning: second\nerror: third\n");
    }

    #[test]
    fn unopenable_log_file_is_an_error() {
        assert!(LogSink::open(&LogTarget::File("/nonexistent/dir/serverd.log".into())).is_err());
    }
}
