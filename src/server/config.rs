//! Server configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;

/// Options recognised by [`Server`](super::Server).
///
/// Every field has a default, so a partial document deserializes:
///
/// ```
/// use std::time::Duration;
/// use wicket::Config;
///
/// let config = Config::new(8080)
///     .address("127.0.0.1")
///     .workers(4)
///     .timeout_content(Duration::from_secs(30));
/// assert_eq!(config.timeout_request, Duration::from_secs(5));
/// assert_eq!(config.max_request_size, usize::MAX);
/// ```
///
/// Durations are whole seconds when (de)serialized. A zero duration
/// disables that stage's deadline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Port to listen on. `0` lets the OS pick one; see
    /// [`Server::bind`](super::Server::bind).
    pub port: u16,

    /// IPv4 or IPv6 address to bind. Empty means every IPv4 interface.
    pub address: String,

    /// Worker threads of the internal runtime. Ignored when
    /// [`runtime`](Self::runtime) is set.
    pub workers: usize,

    /// Deadline for reading a request header block, TLS handshake included.
    #[serde(with = "seconds")]
    pub timeout_request: Duration,

    /// Deadline for reading a body and for sending a response.
    #[serde(with = "seconds")]
    pub timeout_content: Duration,

    /// Maximum number of bytes buffered for a single request.
    pub max_request_size: usize,

    /// Sets `SO_REUSEADDR` on the listening socket.
    pub reuse_address: bool,

    /// Externally owned runtime to serve on instead of an internal one.
    #[serde(skip)]
    pub runtime: Option<Handle>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 80,
            address: String::new(),
            workers: 1,
            timeout_request: Duration::from_secs(5),
            timeout_content: Duration::from_secs(300),
            max_request_size: usize::MAX,
            reuse_address: false,
            runtime: None,
        }
    }
}

impl Config {
    /// Default configuration listening on `port`.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn timeout_request(mut self, timeout: Duration) -> Self {
        self.timeout_request = timeout;
        self
    }

    #[must_use]
    pub fn timeout_content(mut self, timeout: Duration) -> Self {
        self.timeout_content = timeout;
        self
    }

    #[must_use]
    pub fn max_request_size(mut self, bytes: usize) -> Self {
        self.max_request_size = bytes;
        self
    }

    #[must_use]
    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// Serve on an existing runtime. [`Server::start`](super::Server::start)
    /// then returns as soon as the listener is accepting.
    #[must_use]
    pub fn runtime(mut self, handle: Handle) -> Self {
        self.runtime = Some(handle);
        self
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}
