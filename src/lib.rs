// Library exports for the harness

pub mod manifest;
pub mod pool;
pub mod server;
pub mod session;
pub mod wait;
pub mod webdriver;

// Re-export commonly used types for tests
pub use manifest::{load_manifest, selected, TestCase};
pub use pool::SessionPool;
pub use server::{spawn_web_server, ServerError, ServerHandle};
pub use session::{Session, SessionConfig, SessionError};
pub use wait::{wait_until, WaitError};
pub use webdriver::{Driver, DriverKind, WebDriverError};
