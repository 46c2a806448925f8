//! Events delivered to subscribers.
//!
//! Block-shaped payloads are shared as [`Arc`]s so fan-out to many
//! subscribers never copies the block itself.

use std::sync::Arc;

use crate::block::{Block, FilteredBlock, TxValidationCode};

/// A raw block delivered to a block subscriber.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    /// The accepted block.
    pub block: Arc<Block>,
}

/// A filtered block delivered to a filtered-block subscriber.
#[derive(Debug, Clone)]
pub struct FilteredBlockEvent {
    /// The filtered block.
    pub filtered_block: Arc<FilteredBlock>,
}

/// Commit status of a single transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxStatusEvent {
    /// The transaction id the subscriber registered for.
    pub tx_id: String,
    /// The transaction's validation outcome.
    pub validation_code: TxValidationCode,
}

/// An application event emitted by a valid transaction's chaincode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChaincodeEvent {
    /// Id of the emitting chaincode.
    pub chaincode_id: String,
    /// The event name that matched the subscriber's filter.
    pub event_name: String,
    /// Transaction that produced the event.
    pub tx_id: String,
}

/// A transition of the upstream connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionEvent {
    /// `true` when the connection was established, `false` when it was lost.
    pub connected: bool,
    /// The transport's description of the failure, for disconnections.
    pub error: Option<String>,
}

impl ConnectionEvent {
    /// A successful connection transition.
    #[must_use]
    pub fn connected() -> Self {
        Self {
            connected: true,
            error: None,
        }
    }

    /// A lost-connection transition.
    #[must_use]
    pub fn disconnected(error: impl Into<String>) -> Self {
        Self {
            connected: false,
            error: Some(error.into()),
        }
    }
}
