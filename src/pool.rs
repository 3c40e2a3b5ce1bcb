//! Session and server lifetime management. One pool per test run: the main
//! web server is started once, browser sessions are handed out either fresh
//! per test or cached per kind, and everything is torn down in order at the
//! end regardless of how the tests went.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::server::{spawn_web_server, ServerHandle};
use crate::session::{Session, SessionConfig, SessionError};
use crate::webdriver::DriverKind;

pub struct SessionPool {
    build_root: PathBuf,
    test_root: PathBuf,
    server: ServerHandle,
    secondary: Option<ServerHandle>,
    cached: HashMap<DriverKind, Session>,
}

impl SessionPool {
    /// Starts the main web server for the run.
    pub fn start(build_root: impl Into<PathBuf>, test_root: impl Into<PathBuf>) -> Result<Self> {
        let build_root = build_root.into();
        let test_root = test_root.into();
        let server =
            spawn_web_server(&build_root, &test_root).context("start main web server")?;
        Ok(Self {
            build_root,
            test_root,
            server,
            secondary: None,
            cached: HashMap::new(),
        })
    }

    pub fn server(&self) -> &ServerHandle {
        &self.server
    }

    pub fn build_root(&self) -> &Path {
        &self.build_root
    }

    /// Second server instance for tests that need two origins. Started on
    /// first use, torn down with the pool.
    pub fn secondary(&mut self) -> Result<&ServerHandle> {
        if self.secondary.is_none() {
            let server = spawn_web_server(&self.build_root, &self.test_root)
                .context("start secondary web server")?;
            self.secondary = Some(server);
        }
        Ok(self.secondary.as_ref().expect("secondary server just started"))
    }

    fn config_for(&self, kind: DriverKind) -> SessionConfig {
        SessionConfig::new(
            kind,
            self.server.hostname(),
            self.server.port(),
            &self.build_root,
        )
    }

    /// A fresh browser session, isolated to one test. The caller owns it and
    /// its teardown.
    pub fn standalone(&self, kind: DriverKind) -> Result<Session, SessionError> {
        Session::connect(&self.config_for(kind))
    }

    /// The cached session for `kind`, created on first use and reused across
    /// tests in a group. Only the log buffer is reset between handouts; guest
    /// runtime state persists, so tests in cached mode must not assume a
    /// pristine guest environment.
    pub fn cached(&mut self, kind: DriverKind) -> Result<&mut Session, SessionError> {
        let config = self.config_for(kind);
        let session = match self.cached.entry(kind) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                info!(target: "pool", browser = %kind, "creating cached session");
                entry.insert(Session::connect(&config)?)
            }
        };
        session.clean_logs()?;
        Ok(session)
    }

    /// Orderly teardown: sessions first, then servers. Runs from Drop too,
    /// with errors logged instead of propagated.
    pub fn shutdown(mut self) -> Result<()> {
        for (kind, mut session) in self.cached.drain() {
            info!(target: "pool", browser = %kind, "closing cached session");
            session.close();
        }
        if let Some(mut server) = self.secondary.take() {
            server.stop().context("stop secondary web server")?;
        }
        self.server.stop().context("stop main web server")?;
        Ok(())
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        // Sessions close through their own Drop.
        self.cached.clear();
        if let Some(server) = self.secondary.as_mut() {
            if let Err(err) = server.stop() {
                warn!(target: "pool", error = %err, "secondary server shutdown failed");
            }
        }
        if let Err(err) = self.server.stop() {
            warn!(target: "pool", error = %err, "web server shutdown failed");
        }
    }
}
