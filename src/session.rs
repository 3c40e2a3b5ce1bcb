//! Synchronous wrapper around one headless browser session. Turns the guest
//! runtime's asynchronous load/execute lifecycle into blocking calls with
//! timeouts, log capture and structured failures.

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::wait::{wait_until, WaitError};
use crate::webdriver::{Driver, DriverKind, WebDriverError};

/// Page served from the build root that boots the guest runtime.
pub const ENTRY_PAGE: &str = "test.html";

/// Deadline for runtime initialization and package loads.
pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("build artifact {0} does not exist")]
    MissingArtifact(PathBuf),
    #[error("{what} did not complete within {timeout:?}")]
    StartupTimeout {
        what: &'static str,
        timeout: Duration,
    },
    #[error("guest runtime error: {0}")]
    GuestRuntime(String),
    #[error(transparent)]
    Driver(#[from] WebDriverError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub kind: DriverKind,
    pub hostname: String,
    pub port: u16,
    pub build_root: PathBuf,
    pub startup_timeout: Duration,
}

impl SessionConfig {
    pub fn new(kind: DriverKind, hostname: impl Into<String>, port: u16, build_root: impl Into<PathBuf>) -> Self {
        Self {
            kind,
            hostname: hostname.into(),
            port,
            build_root: build_root.into(),
            startup_timeout: STARTUP_TIMEOUT,
        }
    }

    fn entry_url(&self) -> String {
        format!("http://{}:{}/{ENTRY_PAGE}", self.hostname, self.port)
    }
}

#[derive(Debug)]
pub struct Session {
    driver: Driver,
    startup_timeout: Duration,
    closed: bool,
}

impl Session {
    /// Launches a headless browser, navigates to the entry page and blocks
    /// until the guest runtime reports full initialization.
    ///
    /// The entry page is checked on disk first: the HTTP layer cannot
    /// distinguish a missing artifact from any other 404, so a missing build
    /// tree fails here, before any connection is attempted.
    pub fn connect(config: &SessionConfig) -> Result<Self, SessionError> {
        let entry = config.build_root.join(ENTRY_PAGE);
        if !entry.exists() {
            return Err(SessionError::MissingArtifact(entry));
        }
        let driver = Driver::launch(config.kind)?;
        Self::attach(driver, &config.entry_url(), config.startup_timeout)
    }

    /// Navigates an already-open driver session to `entry_url` and waits for
    /// readiness. [`Session::connect`] is built on this; tests use it directly
    /// with a mock driver.
    pub fn attach(
        driver: Driver,
        entry_url: &str,
        startup_timeout: Duration,
    ) -> Result<Self, SessionError> {
        driver.navigate(entry_url)?;
        let session = Self {
            driver,
            startup_timeout,
            closed: false,
        };
        session.wait_for_readiness()?;
        info!(target: "session", browser = %session.kind(), url = entry_url, "guest runtime ready");
        Ok(session)
    }

    pub fn kind(&self) -> DriverKind {
        self.driver.kind()
    }

    /// Executes `code` in the guest runtime and returns the value of its final
    /// expression, converted to the native representation.
    pub fn run(&self, code: &str) -> Result<Value, SessionError> {
        let code = dedent(code);
        let quoted = Value::String(code).to_string();
        match self.run_native(&format!("return vm.evaluate({quoted});")) {
            Err(SessionError::Driver(WebDriverError::Protocol {
                error,
                message,
                stacktrace,
            })) if error == "javascript error" => {
                // The wrapper in run_native already logged the full stack on
                // the browser side; carry the classification back too.
                let mut detail = message;
                if let Some(stack) = stacktrace {
                    detail.push('\n');
                    detail.push_str(&stack);
                }
                Err(SessionError::GuestRuntime(detail))
            }
            other => other,
        }
    }

    /// Executes `code` directly in the browser's native scripting context.
    ///
    /// The code is wrapped in a try/catch that logs the full error stack
    /// before re-raising; the driver protocol truncates it otherwise.
    pub fn run_native(&self, code: &str) -> Result<Value, SessionError> {
        let code = dedent(code);
        let wrapped = format!(
            "Error.stackTraceLimit = Infinity;\n\
             try {{ {code} }}\n\
             catch (error) {{ console.log(error.stack); throw error; }}"
        );
        Ok(self.driver.execute_sync(&wrapped)?)
    }

    /// Kicks off an asynchronous package load in the guest runtime and blocks
    /// until its completion flag is set.
    pub fn load_packages(&self, names: &[&str]) -> Result<(), SessionError> {
        let list = serde_json::to_string(names)
            .map_err(|err| SessionError::GuestRuntime(err.to_string()))?;
        self.run_native(&format!(
            "window.done = false;\n\
             vm.loadPackages({list}).finally(function() {{ window.done = true; }});"
        ))?;
        self.wait_until_packages_loaded()
    }

    pub fn wait_until_packages_loaded(&self) -> Result<(), SessionError> {
        let result = wait_until(
            || -> Result<bool, WebDriverError> {
                let value = self.driver.execute_sync("return window.done === true;")?;
                Ok(value.as_bool().unwrap_or(false))
            },
            self.startup_timeout,
        );
        match result {
            Ok(()) => Ok(()),
            Err(WaitError::Timeout(timeout)) => {
                self.dump_console_logs();
                if let Ok(logs) = self.logs() {
                    warn!(target: "session", browser = %self.kind(), %logs, "harness log buffer at timeout");
                }
                Err(SessionError::StartupTimeout {
                    what: "package load",
                    timeout,
                })
            }
            Err(WaitError::Probe(err)) => Err(err.into()),
        }
    }

    /// The URL of every window the session has open, main window first.
    /// Focus returns to the main window afterwards so later scripts run there.
    pub fn urls(&self) -> Result<Vec<String>, SessionError> {
        let handles = self.driver.window_handles()?;
        let mut urls = Vec::with_capacity(handles.len());
        for handle in &handles {
            self.driver.switch_window(handle)?;
            urls.push(self.driver.current_url()?);
        }
        if let Some(main) = handles.first() {
            self.driver.switch_window(main)?;
        }
        Ok(urls)
    }

    /// The accumulated harness log buffer, newline-joined.
    pub fn logs(&self) -> Result<String, SessionError> {
        let value = self.driver.execute_sync("return window.logs;")?;
        let lines = match value {
            Value::Array(entries) => entries
                .into_iter()
                .map(|entry| match entry {
                    Value::String(line) => line,
                    other => other.to_string(),
                })
                .collect::<Vec<_>>(),
            _ => Vec::new(),
        };
        Ok(lines.join("\n"))
    }

    pub fn clean_logs(&self) -> Result<(), SessionError> {
        self.driver.execute_sync("window.logs = [];")?;
        Ok(())
    }

    /// Closes the driver, which also kills the underlying browser process.
    /// Safe to call more than once.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.driver.quit();
        }
    }

    fn wait_for_readiness(&self) -> Result<(), SessionError> {
        let result = wait_until(
            || -> Result<bool, WebDriverError> {
                let value = self
                    .driver
                    .execute_sync("return !!(window.vm && window.vm.evaluate);")?;
                Ok(value.as_bool().unwrap_or(false))
            },
            self.startup_timeout,
        );
        match result {
            Ok(()) => Ok(()),
            Err(WaitError::Timeout(timeout)) => {
                self.dump_console_logs();
                Err(SessionError::StartupTimeout {
                    what: "guest runtime initialization",
                    timeout,
                })
            }
            Err(WaitError::Probe(err)) => Err(err.into()),
        }
    }

    fn dump_console_logs(&self) {
        match self.driver.console_log() {
            Ok(Some(entries)) => {
                warn!(target: "session", browser = %self.kind(), "browser console log follows");
                for entry in entries {
                    warn!(target: "session", "{entry}");
                }
            }
            Ok(None) => {
                warn!(
                    target: "session",
                    browser = %self.kind(),
                    "browser console logs are not retrievable for this driver"
                );
            }
            Err(err) => {
                warn!(target: "session", browser = %self.kind(), error = %err, "console log retrieval failed");
            }
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

/// Strips the common indentation from code written as an indented multi-line
/// string literal. Only applies when the code starts with a line break, so
/// single-line snippets pass through untouched.
fn dedent(code: &str) -> String {
    if !code.starts_with('\n') {
        return code.to_string();
    }
    let indent = code
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut dedented = code
        .lines()
        .map(|line| line.get(indent..).unwrap_or(line.trim_start()))
        .collect::<Vec<_>>()
        .join("\n");
    // lines() swallows a trailing line break; keep the code byte-faithful.
    if code.ends_with('\n') {
        dedented.push('\n');
    }
    dedented
}
