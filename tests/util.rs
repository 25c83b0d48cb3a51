#![allow(dead_code)]

use std::fs::File;
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Output, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

pub const SERVERD: &str = env!("CARGO_BIN_EXE_serverd");

pub fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("127.0.0.1", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

pub fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("127.0.0.1", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

/// Run serverd to completion, for flags that make it exit straight away.
pub fn run(args: &[&str]) -> Output {
    Command::new(SERVERD)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .expect("failed to run serverd")
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

pub struct Server {
    child: ScopedChild,
    port: u16,
    root: TempDir,
}
impl Server {
    pub fn with_args(args: &[&str]) -> Self {
        Self::with_root(tempdir().expect("failed to create tempdir"), args)
    }
    /// Serve an `index.html` holding `contents`.
    pub fn with_index(contents: &[u8]) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        File::create(root.path().join("index.html"))
            .and_then(|mut file| file.write_all(contents))
            .expect("failed to write index.html");
        Self::with_root(root, &[])
    }
    /// Serve from `root`, passed as `--docroot`.
    pub fn with_root(root: TempDir, args: &[&str]) -> Self {
        let docroot = root
            .path()
            .to_str()
            .expect("path is not valid UTF-8")
            .to_string();
        let mut all_args = vec!["--docroot", &docroot];
        all_args.extend_from_slice(args);
        Self::spawn(root, &all_args)
    }
    /// Start serverd on a free loopback port. `root` only has to outlive the server.
    pub fn spawn(root: TempDir, args: &[&str]) -> Self {
        // Get an unused port. Assumes the port won't be reused before we start serverd.
        let port = get_unused_port().expect("failed to get unused port");

        let child = Command::new(SERVERD)
            .args(args)
            .args(&["--port", &format!("{}", port), "--hostname", "127.0.0.1"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn serverd")
            .into();

        // Create server early so it will be killed if it fails to start.
        let server = Self {
            child,
            port,
            root,
        };

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to serverd");

        server
    }
    pub fn port(&self) -> u16 {
        self.port
    }
    pub fn root(&self) -> &Path {
        self.root.path()
    }
    pub fn create_file(&self, name: &str) -> File {
        File::create(self.root().join(name)).expect("failed to create file")
    }
    pub fn stream(&self) -> TcpStream {
        connect(self.port)
    }
    pub fn send(&self, request: &[u8]) -> io::Result<Vec<u8>> {
        send(self.port, request)
    }
    pub fn get(&self, path: &str) -> Vec<u8> {
        self.send(format!("GET {} HTTP/1.1\r\n\r\n", path).as_bytes())
            .expect("failed to read response")
    }
    /// Return true while the server process is still running.
    pub fn is_alive(&mut self) -> bool {
        matches!(self.child.0.try_wait(), Ok(None))
    }
}

pub fn connect(port: u16) -> TcpStream {
    let stream = TcpStream::connect(("127.0.0.1", port)).expect("failed to connect to serverd");
    // Set timeouts to prevent tests from hanging
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
        .set_write_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream
}

/// Send `request` in one write and read everything until the server closes the connection.
pub fn send(port: u16, request: &[u8]) -> io::Result<Vec<u8>> {
    let mut stream = connect(port);
    stream.write_all(request)?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    Ok(response)
}

/// Split a response into its header block and body.
pub fn split(response: &[u8]) -> (&str, &[u8]) {
    let end = response
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("response has no header block")
        + 4;
    let header = std::str::from_utf8(&response[..end]).expect("header is not valid UTF-8");
    (header, &response[end..])
}
