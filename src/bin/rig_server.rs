//! The isolated HTTP server process behind `spawn_web_server`. Serves a build
//! output tree, rewrites `/test/`-prefixed paths to a separate test-asset
//! root, executes `.cgi` scripts under that prefix, and shuts down when the
//! launcher writes the terminate token to its stdin. Run by hand it simply
//! serves forever.

use std::io::BufRead;
use std::net::SocketAddr;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, StatusCode, Uri},
    response::{IntoResponse, Response},
    Router,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{info, warn};

use browser_rig::server::{READY_BANNER, TERMINATE_TOKEN};

/// Request paths under this prefix resolve against the test-asset root.
const TEST_PREFIX: &str = "/test/";
const CGI_EXTENSION: &str = ".cgi";

struct ServerConfig {
    bind_addr: SocketAddr,
    root: PathBuf,
    test_root: PathBuf,
    log_path: Option<PathBuf>,
}

impl ServerConfig {
    fn from_env() -> Result<Self> {
        let bind_addr = std::env::var("RIG_BIND")
            .unwrap_or_else(|_| "0.0.0.0:0".into())
            .parse::<SocketAddr>()
            .context("parse RIG_BIND")?;
        let root = std::env::var("RIG_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));
        let test_root = std::env::var("RIG_TEST_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|_| root.clone());
        Ok(Self {
            bind_addr,
            root,
            test_root,
            log_path: std::env::var("RIG_LOG").ok().map(PathBuf::from),
        })
    }
}

struct ServeState {
    root: PathBuf,
    test_root: PathBuf,
}

fn main() -> Result<()> {
    let config = ServerConfig::from_env()?;
    setup_tracing(config.log_path.as_deref())?;

    if !config.root.is_dir() {
        return Err(anyhow!(
            "serving root {} does not exist",
            config.root.display()
        ));
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("rig_server runtime")?;
    runtime.block_on(run(config))
}

async fn run(config: ServerConfig) -> Result<()> {
    let listener = TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    let addr = listener.local_addr().context("listener address")?;

    // The port handshake: exactly one banner, flushed before the first accept.
    // The launcher blocks on this line, so it can never connect too early.
    println!("{READY_BANNER}{addr}");
    use std::io::Write;
    std::io::stdout().flush().context("flush readiness banner")?;

    let state = Arc::new(ServeState {
        root: config.root,
        test_root: config.test_root,
    });
    let app = Router::new().fallback(serve_path).with_state(state);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    spawn_terminate_watcher(shutdown_tx);

    info!(target: "rig_server", %addr, "serving");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    })
    .await
    .context("server error")?;

    info!(target: "rig_server", "terminate token received, stopping");
    Ok(())
}

/// Watches stdin for the terminate token on a plain thread; the serve loop
/// only sees the oneshot. Stdin EOF without a token leaves the server running,
/// which is what keeps the standalone mode alive.
fn spawn_terminate_watcher(shutdown_tx: oneshot::Sender<()>) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(line) if line.trim() == TERMINATE_TOKEN => {
                    let _ = shutdown_tx.send(());
                    return;
                }
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        // Stdin ended without a token. Dropping the sender would resolve the
        // receiver and stop the serve loop, so keep the channel open forever.
        std::mem::forget(shutdown_tx);
    });
}

fn setup_tracing(log_path: Option<&Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log_path {
        Some(path) => {
            let file = std::fs::File::create(path)
                .with_context(|| format!("create log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .with_target(false)
                .init();
        }
        None => {
            // Standalone mode; stdout stays reserved for the banner.
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(false)
                .init();
        }
    }
    Ok(())
}

async fn serve_path(
    State(state): State<Arc<ServeState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    uri: Uri,
) -> Response {
    let path = uri.path().to_string();
    info!(target: "rig_server", client = %peer, path = %path, "request");

    match respond(&state, &path).await {
        Ok(response) => response,
        Err(err) => {
            warn!(target: "rig_server", client = %peer, path = %path, error = %err, "request failed");
            (StatusCode::NOT_FOUND, format!("{path}: not found\n")).into_response()
        }
    }
}

async fn respond(state: &ServeState, path: &str) -> Result<Response> {
    let (root, relative) = match path.strip_prefix(TEST_PREFIX) {
        Some(rest) => (&state.test_root, rest),
        None => (&state.root, path.trim_start_matches('/')),
    };
    let relative = sanitize(relative)?;
    let full = root.join(&relative);

    if path.starts_with(TEST_PREFIX) && path.ends_with(CGI_EXTENSION) {
        return run_cgi(&full).await;
    }

    let bytes = tokio::fs::read(&full)
        .await
        .with_context(|| format!("read {}", full.display()))?;
    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, extension_mime(&full))
        .body(Body::from(bytes))
        .context("build file response")?)
}

/// Rejects traversal components so request paths stay inside their root.
fn sanitize(relative: &str) -> Result<PathBuf> {
    let path = Path::new(relative);
    for component in path.components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            _ => return Err(anyhow!("rejected path component in {relative}")),
        }
    }
    Ok(path.to_path_buf())
}

/// Runs a CGI script and turns its output into a response: the header block
/// (up to the first blank line) supplies Status and Content-Type, everything
/// after it is the body.
async fn run_cgi(script: &Path) -> Result<Response> {
    let output = tokio::process::Command::new(script)
        .output()
        .await
        .with_context(|| format!("execute CGI script {}", script.display()))?;
    if !output.status.success() {
        return Err(anyhow!(
            "CGI script {} failed with {}: {}",
            script.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr)
        ));
    }

    let (headers, body) = split_cgi_output(&output.stdout)?;
    let mut status = StatusCode::OK;
    let mut content_type = "text/html".to_string();
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("status") {
            let code = value.split_whitespace().next().unwrap_or(&value);
            status = code.parse().context("parse CGI Status header")?;
        } else if name.eq_ignore_ascii_case("content-type") {
            content_type = value;
        }
    }

    Ok(Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .context("build CGI response")?)
}

fn split_cgi_output(stdout: &[u8]) -> Result<(Vec<(String, String)>, Vec<u8>)> {
    let (header_block, body) = match find_blank_line(stdout) {
        Some((end, skip)) => (&stdout[..end], stdout[end + skip..].to_vec()),
        None => return Err(anyhow!("CGI output has no header block")),
    };
    let mut headers = Vec::new();
    for line in String::from_utf8_lossy(header_block).lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| anyhow!("malformed CGI header line: {line}"))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }
    Ok((headers, body))
}

fn find_blank_line(bytes: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = bytes.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    bytes
        .windows(2)
        .position(|w| w == b"\n\n")
        .map(|pos| (pos, 2))
}

/// Extension map for the served tree. The binary module format the runtime
/// fetches must be declared explicitly; servers do not know it by default.
fn extension_mime(path: &Path) -> &'static str {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("js") | Some("mjs") => "application/javascript",
        Some("css") => "text/css",
        Some("json") | Some("map") => "application/json",
        Some("wasm") => "application/wasm",
        Some("txt") => "text/plain",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("data") => "application/octet-stream",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cgi_output_splits_headers_from_body() {
        let raw = b"Content-Type: text/plain\n\nHELLO\n";
        let (headers, body) = split_cgi_output(raw).expect("valid CGI output");
        assert_eq!(headers, vec![("Content-Type".into(), "text/plain".into())]);
        assert_eq!(body, b"HELLO\n");
    }

    #[test]
    fn cgi_output_accepts_crlf_header_blocks() {
        let raw = b"Status: 201 Created\r\nContent-Type: text/plain\r\n\r\nbody";
        let (headers, body) = split_cgi_output(raw).expect("valid CGI output");
        assert_eq!(headers.len(), 2);
        assert_eq!(body, b"body");
    }

    #[test]
    fn cgi_output_without_header_block_is_rejected() {
        assert!(split_cgi_output(b"no headers at all").is_err());
    }

    #[test]
    fn wasm_modules_get_their_mime_type() {
        assert_eq!(extension_mime(Path::new("a/b/module.wasm")), "application/wasm");
        assert_eq!(extension_mime(Path::new("test.html")), "text/html");
        assert_eq!(extension_mime(Path::new("unknown.bin")), "application/octet-stream");
    }

    #[test]
    fn traversal_components_are_rejected() {
        assert!(sanitize("../secrets").is_err());
        assert!(sanitize("ok/nested/file.txt").is_ok());
    }
}
