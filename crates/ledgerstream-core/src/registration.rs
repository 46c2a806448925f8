//! Subscription registrations and their opaque handles.
//!
//! A subscriber receives a [`Registration`] handle when the dispatcher
//! accepts its request. The handle identifies the entry for a later
//! unregister; the delivery channel and any filters live in the internal
//! record, which only the dispatch loop touches.

use std::fmt;
use std::sync::Arc;

use regex::Regex;
use tokio::sync::mpsc;

use crate::block::Block;
use crate::event::{BlockEvent, ChaincodeEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent};

// ---------------------------------------------------------------------------
// Handles
// ---------------------------------------------------------------------------

/// Unique registration identifier, assigned by the dispatch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RegistrationId(pub u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg-{}", self.0)
    }
}

/// The subscription kind a [`Registration`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationKind {
    /// Raw block subscription.
    Block,
    /// Filtered-block subscription.
    FilteredBlock,
    /// Per-transaction status subscription.
    TxStatus,
    /// Chaincode application-event subscription.
    Chaincode,
    /// Connection-transition subscription.
    Connection,
}

/// Opaque handle to an active subscription.
///
/// Returned by the register operations; pass it back to unregister. The
/// handle stays valid until the matching unregister or until the dispatcher
/// stops, whichever comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registration {
    id: RegistrationId,
    kind: RegistrationKind,
}

impl Registration {
    pub(crate) fn new(id: RegistrationId, kind: RegistrationKind) -> Self {
        Self { id, kind }
    }

    /// Returns the registration id.
    #[must_use]
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    /// Returns the subscription kind.
    #[must_use]
    pub fn kind(&self) -> RegistrationKind {
        self.kind
    }
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

/// Predicate applied to raw blocks before delivery to a block subscriber.
pub type BlockFilter = Arc<dyn Fn(&Block) -> bool + Send + Sync>;

/// A filter accepting every block; the default for block subscriptions.
#[must_use]
pub fn accept_all_blocks() -> BlockFilter {
    Arc::new(|_| true)
}

// ---------------------------------------------------------------------------
// Internal records (dispatch-loop confined)
// ---------------------------------------------------------------------------

pub(crate) struct BlockRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) filter: BlockFilter,
    pub(crate) sender: mpsc::Sender<BlockEvent>,
}

pub(crate) struct FilteredBlockRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) sender: mpsc::Sender<FilteredBlockEvent>,
}

pub(crate) struct TxStatusRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) tx_id: String,
    pub(crate) sender: mpsc::Sender<TxStatusEvent>,
}

pub(crate) struct ChaincodeRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) chaincode_id: String,
    pub(crate) event_filter: String,
    pub(crate) event_regex: Regex,
    pub(crate) sender: mpsc::Sender<ChaincodeEvent>,
}

pub(crate) struct ConnectionRegistration {
    pub(crate) id: RegistrationId,
    pub(crate) sender: mpsc::Sender<ConnectionEvent>,
}

/// Compound lookup key for chaincode registrations.
pub(crate) fn chaincode_key(chaincode_id: &str, event_filter: &str) -> String {
    format!("{chaincode_id}/{event_filter}")
}
