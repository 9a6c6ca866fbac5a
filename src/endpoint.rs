//! Application callbacks.

use crate::{CloseReason, Error, Fragment, Message, Session};
use bytes::Bytes;

pub type EndpointError = Box<dyn std::error::Error + Send + Sync>;

/// Receives the events of one or more connections.
///
/// Every callback runs on the task driving the connection, never concurrently
/// for the same connection. A callback that returns an error is reported to
/// [`Endpoint::on_error`] and otherwise ignored; the connection stays up.
pub trait Endpoint: Send + Sync {
    fn on_open(&self, _session: &Session) -> Result<(), EndpointError> {
        Ok(())
    }

    fn on_message(&self, _session: &Session, _message: Message) -> Result<(), EndpointError> {
        Ok(())
    }

    /// Only called when partial messages are enabled in the [`Config`](crate::Config).
    fn on_fragment(&self, _session: &Session, _fragment: Fragment) -> Result<(), EndpointError> {
        Ok(())
    }

    /// Called after the automatic pong, if that is enabled, has been queued.
    fn on_ping(&self, _session: &Session, _data: Bytes) -> Result<(), EndpointError> {
        Ok(())
    }

    fn on_pong(&self, _session: &Session, _data: Bytes) -> Result<(), EndpointError> {
        Ok(())
    }

    /// Called exactly once per opened connection.
    fn on_close(&self, _session: &Session, _reason: &CloseReason) {}

    fn on_error(&self, _session: &Session, _error: &Error) {}
}
