use crate::extension::ExtensionFactory;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Outgoing messages longer than this are split into continuation frames.
pub const DEFAULT_FRAGMENT_SIZE: usize = 64 * 1024;
/// 4 MiB of payload plus 11 bytes of frame overhead.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024 + 11;
pub const DEFAULT_MAX_PENDING_WRITE_BYTES: usize = 16 * 1024 * 1024;
pub const DEFAULT_MAX_HANDSHAKE_LEN: usize = 8 * 1024;
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// Limits and behavior shared by both sides of a connection.
#[derive(Debug, Clone)]
pub struct Config {
    max_message_size: usize,
    max_frame_size: Option<usize>,
    fragment_size: usize,
    idle_timeout: Option<Duration>,
    close_timeout: Duration,
    auto_pong: bool,
    partial_messages: bool,
    max_pending_write_bytes: usize,
    max_handshake_len: usize,
    handshake_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            max_frame_size: None,
            fragment_size: DEFAULT_FRAGMENT_SIZE,
            idle_timeout: None,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            auto_pong: true,
            partial_messages: false,
            max_pending_write_bytes: DEFAULT_MAX_PENDING_WRITE_BYTES,
            max_handshake_len: DEFAULT_MAX_HANDSHAKE_LEN,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }
}

impl Config {
    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Largest single frame accepted. Defaults to the message limit.
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size.unwrap_or(self.max_message_size)
    }

    pub fn fragment_size(&self) -> usize {
        self.fragment_size
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn close_timeout(&self) -> Duration {
        self.close_timeout
    }

    pub fn auto_pong(&self) -> bool {
        self.auto_pong
    }

    pub fn partial_messages(&self) -> bool {
        self.partial_messages
    }

    pub fn max_pending_write_bytes(&self) -> usize {
        self.max_pending_write_bytes
    }

    pub fn max_handshake_len(&self) -> usize {
        self.max_handshake_len
    }

    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    pub fn set_max_message_size(&mut self, max_message_size: usize) {
        self.max_message_size = max_message_size;
    }

    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = Some(max_frame_size);
    }

    /// # Panics
    ///
    /// If `fragment_size` is zero.
    pub fn set_fragment_size(&mut self, fragment_size: usize) {
        assert!(fragment_size > 0, "fragment size must be greater than zero");
        self.fragment_size = fragment_size;
    }

    pub fn set_idle_timeout(&mut self, idle_timeout: Option<Duration>) {
        self.idle_timeout = idle_timeout;
    }

    pub fn set_close_timeout(&mut self, close_timeout: Duration) {
        self.close_timeout = close_timeout;
    }

    pub fn set_auto_pong(&mut self, auto_pong: bool) {
        self.auto_pong = auto_pong;
    }

    pub fn set_partial_messages(&mut self, partial_messages: bool) {
        self.partial_messages = partial_messages;
    }

    pub fn set_max_pending_write_bytes(&mut self, max_pending_write_bytes: usize) {
        self.max_pending_write_bytes = max_pending_write_bytes;
    }

    pub fn set_max_handshake_len(&mut self, max_handshake_len: usize) {
        self.max_handshake_len = max_handshake_len;
    }

    pub fn set_handshake_timeout(&mut self, handshake_timeout: Duration) {
        self.handshake_timeout = handshake_timeout;
    }
}

/// What a server endpoint supports, in preference order.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    pub config: Config,
    pub subprotocols: Vec<String>,
    pub extensions: Vec<ExtensionFactory>,
    /// Fail the handshake when no offered subprotocol is supported.
    pub require_subprotocol: bool,
    /// Sessions past this many are closed with 1013 right after the upgrade.
    pub max_sessions: Option<usize>,
    /// Shared by every clone of this config.
    pub(crate) sessions: Arc<AtomicUsize>,
}

impl ServerConfig {
    pub fn new(config: Config) -> Self {
        ServerConfig {
            config,
            ..ServerConfig::default()
        }
    }

    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocols.push(subprotocol.into());
        self
    }

    pub fn with_extension(mut self, extension: ExtensionFactory) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn require_subprotocol(mut self, require: bool) -> Self {
        self.require_subprotocol = require;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = Some(max_sessions);
        self
    }

    /// Sessions accepted with this config that have not closed yet.
    pub fn open_sessions(&self) -> usize {
        self.sessions.load(Ordering::Acquire)
    }
}

/// What a client offers, in preference order.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    pub config: Config,
    pub subprotocols: Vec<String>,
    pub extensions: Vec<ExtensionFactory>,
    pub origin: Option<String>,
    /// Extra request headers, sent after the upgrade headers.
    pub headers: Vec<(String, String)>,
}

impl ClientConfig {
    pub fn new(config: Config) -> Self {
        ClientConfig {
            config,
            ..ClientConfig::default()
        }
    }

    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocols.push(subprotocol.into());
        self
    }

    pub fn with_extension(mut self, extension: ExtensionFactory) -> Self {
        self.extensions.push(extension);
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}
