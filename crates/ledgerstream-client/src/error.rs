//! Client error types.

use thiserror::Error;

use ledgerstream_core::EventError;

use crate::client::ConnectionState;

/// Error returned by a connect hook.
pub type HookError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the event client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The client was closed; it accepts no further work.
    #[error("event client is closed")]
    Closed,

    /// Connect was attempted from a state other than disconnected.
    #[error("unable to connect event client since client is [{0}], expecting [Disconnected]")]
    InvalidState(ConnectionState),

    /// The client was constructed without block-event permission.
    #[error("block events are not permitted")]
    BlockEventsNotPermitted,

    /// The connect retry budget ran out.
    #[error("maximum connect attempts exceeded")]
    AttemptsExceeded,

    /// The after-connect hook failed; the client disconnected again.
    #[error("error invoking afterConnect handler: {0}")]
    AfterConnect(HookError),

    /// An error propagated from the dispatcher.
    #[error(transparent)]
    Dispatcher(#[from] EventError),
}
