//! Minimal W3C WebDriver client used to drive headless browser sessions.
//! Only the handful of endpoints the harness needs are implemented; tests can
//! point it at an in-process mock server via [`Driver::attach`].

use std::net::TcpListener;
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use reqwest::blocking::Client;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use crate::wait::{wait_until, WaitError};

/// How long to wait for a freshly spawned driver binary to accept commands.
const DRIVER_STARTUP_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverKind {
    Firefox,
    Chrome,
}

impl DriverKind {
    pub fn name(self) -> &'static str {
        match self {
            DriverKind::Firefox => "firefox",
            DriverKind::Chrome => "chrome",
        }
    }

    pub fn driver_binary(self) -> &'static str {
        match self {
            DriverKind::Firefox => "geckodriver",
            DriverKind::Chrome => "chromedriver",
        }
    }

    /// Browser console logs are only retrievable through chromedriver;
    /// geckodriver does not expose them over the wire protocol.
    pub fn supports_console_log(self) -> bool {
        matches!(self, DriverKind::Chrome)
    }

    fn capabilities(self) -> Value {
        match self {
            DriverKind::Firefox => json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "firefox",
                        "moz:firefoxOptions": { "args": ["-headless"] }
                    }
                }
            }),
            DriverKind::Chrome => json!({
                "capabilities": {
                    "alwaysMatch": {
                        "browserName": "chrome",
                        "goog:chromeOptions": {
                            "args": ["--headless=new", "--no-sandbox", "--disable-dev-shm-usage"]
                        }
                    }
                }
            }),
        }
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Serialize)]
struct NavigatePayload<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct ExecutePayload<'a> {
    script: &'a str,
    args: Vec<Value>,
}

#[derive(Serialize)]
struct LogPayload<'a> {
    #[serde(rename = "type")]
    log_type: &'a str,
}

#[derive(Serialize)]
struct SwitchWindowPayload<'a> {
    handle: &'a str,
}

#[derive(Debug, Error)]
pub enum WebDriverError {
    #[error("failed to launch {binary}: {source}")]
    Launch {
        binary: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{binary} did not accept connections within {timeout:?}")]
    DriverStartup {
        binary: &'static str,
        timeout: Duration,
    },
    #[error("webdriver transport error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid webdriver url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("webdriver {error}: {message}")]
    Protocol {
        error: String,
        message: String,
        stacktrace: Option<String>,
    },
    #[error("malformed webdriver response: {0}")]
    MalformedResponse(String),
}

/// Owned handle to one browser-driver process plus the session created on it.
/// Dropping the handle kills the driver process, which in turn tears down the
/// browser it launched.
#[derive(Debug)]
pub struct Driver {
    kind: DriverKind,
    client: Client,
    base_url: Url,
    session_id: Option<String>,
    child: Option<Child>,
}

impl Driver {
    /// Spawns the driver binary for `kind` on a free port and opens a headless
    /// browser session on it.
    pub fn launch(kind: DriverKind) -> Result<Self, WebDriverError> {
        let binary = kind.driver_binary();
        let port = free_port().map_err(|source| WebDriverError::Launch { binary, source })?;
        let child = Command::new(binary)
            .arg(format!("--port={port}"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|source| WebDriverError::Launch { binary, source })?;

        let mut driver = Self::new(kind, format!("http://127.0.0.1:{port}/"), Some(child))?;
        driver.wait_for_driver()?;
        driver.new_session()?;
        Ok(driver)
    }

    /// Connects to an already-running driver at `base_url` and opens a session.
    /// No process is spawned; used by tests against a mock driver server.
    pub fn attach(kind: DriverKind, base_url: impl AsRef<str>) -> Result<Self, WebDriverError> {
        let mut driver = Self::new(kind, base_url.as_ref(), None)?;
        driver.new_session()?;
        Ok(driver)
    }

    fn new(
        kind: DriverKind,
        base_url: impl AsRef<str>,
        child: Option<Child>,
    ) -> Result<Self, WebDriverError> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let mut base = base_url.as_ref().to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            kind,
            client,
            base_url: Url::parse(&base)?,
            session_id: None,
            child,
        })
    }

    pub fn kind(&self) -> DriverKind {
        self.kind
    }

    fn wait_for_driver(&self) -> Result<(), WebDriverError> {
        let status_url = self.endpoint("status")?;
        let result = wait_until(
            || -> Result<bool, WebDriverError> {
                Ok(self.client.get(status_url.clone()).send().is_ok())
            },
            DRIVER_STARTUP_TIMEOUT,
        );
        match result {
            Ok(()) => Ok(()),
            Err(WaitError::Timeout(timeout)) => Err(WebDriverError::DriverStartup {
                binary: self.kind.driver_binary(),
                timeout,
            }),
            Err(WaitError::Probe(err)) => Err(err),
        }
    }

    fn new_session(&mut self) -> Result<(), WebDriverError> {
        let value = self.command(
            reqwest::Method::POST,
            "session",
            Some(&self.kind.capabilities()),
        )?;
        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                WebDriverError::MalformedResponse(format!("missing sessionId in {value}"))
            })?;
        debug!(target: "webdriver", browser = %self.kind, session = session_id, "session created");
        self.session_id = Some(session_id.to_string());
        Ok(())
    }

    /// Navigates the browser to `url`.
    pub fn navigate(&self, url: &str) -> Result<(), WebDriverError> {
        self.session_command(reqwest::Method::POST, "url", Some(&NavigatePayload { url }))?;
        Ok(())
    }

    /// The URL currently loaded in the focused window.
    pub fn current_url(&self) -> Result<String, WebDriverError> {
        let value = self.session_command::<Value>(reqwest::Method::GET, "url", None)?;
        match value {
            Value::String(url) => Ok(url),
            other => Err(WebDriverError::MalformedResponse(format!(
                "expected url string, got {other}"
            ))),
        }
    }

    /// Handles of every window the session has open, including popups the
    /// page spawned.
    pub fn window_handles(&self) -> Result<Vec<String>, WebDriverError> {
        let value =
            self.session_command::<Value>(reqwest::Method::GET, "window/handles", None)?;
        match value {
            Value::Array(entries) => entries
                .into_iter()
                .map(|entry| match entry {
                    Value::String(handle) => Ok(handle),
                    other => Err(WebDriverError::MalformedResponse(format!(
                        "expected window handle string, got {other}"
                    ))),
                })
                .collect(),
            other => Err(WebDriverError::MalformedResponse(format!(
                "expected window handle array, got {other}"
            ))),
        }
    }

    /// Moves the session's focus to the window with `handle`.
    pub fn switch_window(&self, handle: &str) -> Result<(), WebDriverError> {
        self.session_command(
            reqwest::Method::POST,
            "window",
            Some(&SwitchWindowPayload { handle }),
        )?;
        Ok(())
    }

    /// Runs `script` in the browser's native scripting context and returns the
    /// value it produced.
    pub fn execute_sync(&self, script: &str) -> Result<Value, WebDriverError> {
        self.session_command(
            reqwest::Method::POST,
            "execute/sync",
            Some(&ExecutePayload {
                script,
                args: Vec::new(),
            }),
        )
    }

    /// Fetches the browser-native console log, or `None` where the driver does
    /// not support retrieving it.
    pub fn console_log(&self) -> Result<Option<Vec<Value>>, WebDriverError> {
        if !self.kind.supports_console_log() {
            return Ok(None);
        }
        let value = self.session_command(
            reqwest::Method::POST,
            "log",
            Some(&LogPayload { log_type: "browser" }),
        )?;
        match value {
            Value::Array(entries) => Ok(Some(entries)),
            other => Err(WebDriverError::MalformedResponse(format!(
                "expected log array, got {other}"
            ))),
        }
    }

    /// Ends the session and kills the driver process. Idempotent; the browser
    /// process goes away with its driver.
    pub fn quit(&mut self) {
        if let Some(session_id) = self.session_id.take() {
            let path = format!("session/{session_id}");
            if let Err(err) = self.command::<Value>(reqwest::Method::DELETE, &path, None) {
                warn!(target: "webdriver", browser = %self.kind, error = %err, "session delete failed");
            }
        }
        if let Some(mut child) = self.child.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }

    fn session_command<B: Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Value, WebDriverError> {
        let session_id = self
            .session_id
            .as_deref()
            .ok_or_else(|| WebDriverError::MalformedResponse("no active webdriver session".into()))?;
        let full = format!("session/{session_id}/{path}");
        self.command(method, &full, body)
    }

    fn command<B: Serialize>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Value, WebDriverError> {
        let url = self.endpoint(path)?;
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send()?;
        let status = response.status();
        let payload: Value = response.json()?;
        let value = payload.get("value").cloned().ok_or_else(|| {
            WebDriverError::MalformedResponse(format!("missing value envelope in {payload}"))
        })?;

        // Error responses carry {"value": {"error", "message", "stacktrace"}}.
        if !status.is_success() {
            let error = value
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("unknown error")
                .to_string();
            let message = value
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let stacktrace = value
                .get("stacktrace")
                .and_then(Value::as_str)
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            return Err(WebDriverError::Protocol {
                error,
                message,
                stacktrace,
            });
        }
        Ok(value)
    }

    fn endpoint(&self, path: &str) -> Result<Url, WebDriverError> {
        Ok(self.base_url.join(path)?)
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.quit();
    }
}

/// Asks the OS for a currently free port. The listener is dropped before the
/// driver binary binds the port, so the driver can lose a race for it; session
/// construction then fails fast rather than hanging.
fn free_port() -> std::io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}
