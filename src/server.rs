//! Launcher for the isolated HTTP server process. The server runs as a child
//! process (`rig_server`); the only synchronization with it is a two-message
//! handshake: one readiness banner carrying the bound port on its stdout, and
//! one terminate token written to its stdin.

use std::io::{BufRead, BufReader, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};

use tempfile::TempDir;
use thiserror::Error;
use tracing::{info, warn};

/// Stdout line prefix the server prints once its listener is bound, before it
/// accepts any connection.
pub const READY_BANNER: &str = "RIG_SERVER_READY ";

/// The single stdin line that ends the server's service loop.
pub const TERMINATE_TOKEN: &str = "TERMINATE";

pub const SERVER_BINARY: &str = "rig_server";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("build output directory {0} does not exist")]
    MissingArtifact(PathBuf),
    #[error("server binary not found at {0}; build it first")]
    BinaryNotFound(PathBuf),
    #[error("failed to spawn {SERVER_BINARY}: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("server exited before reporting its port")]
    EarlyExit,
    #[error("malformed readiness banner: {0}")]
    Handshake(String),
    #[error("server handshake io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Owned handle to a running server process. The temp directory backing the
/// log file lives as long as the handle, so the server is always joined
/// before its log directory disappears.
#[derive(Debug)]
pub struct ServerHandle {
    hostname: String,
    port: u16,
    log_path: PathBuf,
    child: Child,
    _temp_dir: TempDir,
    stopped: bool,
}

impl ServerHandle {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.hostname, self.port)
    }

    /// Path of the per-run server log. Written exclusively by the server
    /// process; gone once the handle is dropped.
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    /// Sends the terminate token and joins the server process. Idempotent.
    /// The child is reaped on every path, including a failed token write to a
    /// process that already died.
    pub fn stop(&mut self) -> Result<(), ServerError> {
        if self.stopped {
            return Ok(());
        }
        if let Some(mut stdin) = self.child.stdin.take() {
            if let Err(err) = writeln!(stdin, "{TERMINATE_TOKEN}") {
                let _ = self.child.kill();
                let _ = self.child.wait();
                self.stopped = true;
                return Err(err.into());
            }
        }
        let status = self.child.wait()?;
        self.stopped = true;
        info!(target: "server", port = self.port, %status, "web server stopped");
        Ok(())
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.stopped {
            warn!(target: "server", port = self.port, "killing web server that was never stopped");
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

/// Spawns a web server process serving `build_root`, with `/test/`-prefixed
/// request paths resolved against `test_root` instead. Blocks until the child
/// reports its OS-assigned port.
pub fn spawn_web_server(build_root: &Path, test_root: &Path) -> Result<ServerHandle, ServerError> {
    if !build_root.is_dir() {
        return Err(ServerError::MissingArtifact(build_root.to_path_buf()));
    }

    let temp_dir = tempfile::tempdir()?;
    let log_path = temp_dir.path().join("http-server.log");

    let binary = server_binary()?;
    let mut child = Command::new(&binary)
        .env("RIG_ROOT", build_root)
        .env("RIG_TEST_ROOT", test_root)
        .env("RIG_BIND", "0.0.0.0:0")
        .env("RIG_LOG", &log_path)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(ServerError::Spawn)?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ServerError::Handshake("server stdout unavailable".into()))?;
    let port = match read_port_banner(BufReader::new(stdout)) {
        Ok(port) => port,
        Err(err) => {
            let _ = child.kill();
            let _ = child.wait();
            return Err(err);
        }
    };

    let hostname = "127.0.0.1".to_string();
    info!(
        target: "server",
        url = %format!("http://{hostname}:{port}"),
        log = %log_path.display(),
        "web server ready"
    );

    Ok(ServerHandle {
        hostname,
        port,
        log_path,
        child,
        _temp_dir: temp_dir,
        stopped: false,
    })
}

/// Reads stdout lines until the readiness banner shows up. Anything the child
/// prints before it is forwarded to stderr for diagnosis.
fn read_port_banner(mut reader: impl BufRead) -> Result<u16, ServerError> {
    let mut line = String::new();
    loop {
        line.clear();
        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            return Err(ServerError::EarlyExit);
        }
        let trimmed = line.trim();
        if let Some(addr) = trimmed.strip_prefix(READY_BANNER) {
            let addr: SocketAddr = addr
                .trim()
                .parse()
                .map_err(|_| ServerError::Handshake(addr.to_string()))?;
            return Ok(addr.port());
        }
        if !trimmed.is_empty() {
            eprintln!("{SERVER_BINARY}: {trimmed}");
        }
    }
}

/// Locates the `rig_server` binary. `RIG_SERVER_BIN` overrides; otherwise the
/// binary is expected next to the current executable's build output, which is
/// where cargo puts it for integration tests.
fn server_binary() -> Result<PathBuf, ServerError> {
    if let Ok(path) = std::env::var("RIG_SERVER_BIN") {
        return Ok(PathBuf::from(path));
    }
    let mut path = std::env::current_exe()?;
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push(format!("{SERVER_BINARY}{}", std::env::consts::EXE_SUFFIX));
    if path.exists() {
        Ok(path)
    } else {
        Err(ServerError::BinaryNotFound(path))
    }
}
