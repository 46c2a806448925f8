//! Core error types.
//!
//! One unified hierarchy for dispatcher, registration, and transport
//! failures. Registration and connect errors travel back to the caller over
//! the event's reply channel; delivery failures (slow subscribers) and
//! protocol anomalies (out-of-order blocks, undecodable envelopes) are logged
//! and never surfaced.

use thiserror::Error;

use crate::dispatcher::DispatcherState;

/// Errors that can occur in the event dispatch core.
#[derive(Debug, Error)]
pub enum EventError {
    /// The dispatcher was started more than once.
    #[error("cannot start dispatcher since it is not in its initial state")]
    NotInInitialState,

    /// An event was submitted while the dispatcher was not running.
    #[error("dispatcher not started - current state [{0}]")]
    NotStarted(DispatcherState),

    /// The dispatcher inbox or a reply channel closed mid-operation.
    #[error("dispatcher event queue is closed")]
    ChannelClosed,

    /// A transaction-status registration already exists for the tx id.
    #[error("registration already exists for transaction [{0}]")]
    DuplicateTxRegistration(String),

    /// A chaincode registration already exists for the compound key.
    #[error("registration already exists for chaincode [{chaincode_id}] and event filter [{event_filter}]")]
    DuplicateChaincodeRegistration {
        /// The chaincode id of the rejected registration.
        chaincode_id: String,
        /// The event-name filter of the rejected registration.
        event_filter: String,
    },

    /// A chaincode event-name filter failed to compile.
    #[error("error compiling regular expression for event filter [{event_filter}]: {source}")]
    InvalidEventFilter {
        /// The filter expression that failed to compile.
        event_filter: String,
        /// The underlying regex compile error.
        #[source]
        source: regex::Error,
    },

    /// An unregister request carried a handle with no matching entry.
    #[error("the provided registration is invalid")]
    InvalidRegistration,

    /// A block arrived with a number at or below the last observed one.
    #[error("expecting a block number greater than {last} but received block number {received}")]
    OutOfOrderBlock {
        /// The last block number the dispatcher observed.
        last: u64,
        /// The number of the offending block.
        received: u64,
    },

    /// The transport adapter failed to connect or disconnect.
    #[error("transport error: {0}")]
    Transport(String),
}
