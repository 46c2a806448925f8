//! Testing utilities for the event core.
//!
//! Provides a scriptable mock transport and builders for blocks, envelopes,
//! and filtered blocks, used by this crate's tests and by client
//! implementations layered on top of it.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::block::{
    Block, BlockData, BlockHeader, BlockMetadata, BlockMetadataIndex, ChaincodeEventData,
    ChannelHeader, Envelope, FilteredBlock, FilteredTransaction, HeaderType, Transaction,
    TransactionAction, TxValidationCode,
};
use crate::error::EventError;
use crate::transport::{EventSink, TransportAdapter};

// ---------------------------------------------------------------------------
// MockTransport
// ---------------------------------------------------------------------------

/// Scriptable in-memory transport adapter.
///
/// Connect outcomes are consumed from a script queue; once the queue is
/// empty, connects succeed unless [`MockTransport::fail_connects`] was set.
/// The sink captured on the last successful connect is exposed so tests can
/// inject blocks and stream failures.
///
/// Clones share state, so a test can keep one clone for assertions while the
/// dispatcher owns another.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    inner: Arc<MockTransportInner>,
}

#[derive(Debug, Default)]
struct MockTransportInner {
    connects: AtomicU64,
    disconnects: AtomicU64,
    scripted: Mutex<VecDeque<Result<(), String>>>,
    connect_error: Mutex<Option<String>>,
    sink: Mutex<Option<EventSink>>,
}

impl MockTransport {
    /// Creates a mock transport whose connects succeed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns how many times `connect` was called.
    #[must_use]
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::Relaxed)
    }

    /// Returns how many times `disconnect` was called.
    #[must_use]
    pub fn disconnect_count(&self) -> u64 {
        self.inner.disconnects.load(Ordering::Relaxed)
    }

    /// Queues the outcome for the next unscripted connect.
    pub fn script_connect(&self, result: Result<(), &str>) {
        self.inner
            .scripted
            .lock()
            .push_back(result.map_err(String::from));
    }

    /// Makes every connect after the scripted ones fail with `message`.
    pub fn fail_connects(&self, message: &str) {
        *self.inner.connect_error.lock() = Some(message.to_string());
    }

    /// Returns the sink captured on the last successful connect.
    #[must_use]
    pub fn sink(&self) -> Option<EventSink> {
        self.inner.sink.lock().clone()
    }
}

#[async_trait]
impl TransportAdapter for MockTransport {
    async fn connect(&mut self, events: EventSink) -> Result<(), EventError> {
        self.inner.connects.fetch_add(1, Ordering::Relaxed);
        let outcome = self
            .inner
            .scripted
            .lock()
            .pop_front()
            .unwrap_or_else(|| match &*self.inner.connect_error.lock() {
                Some(message) => Err(message.clone()),
                None => Ok(()),
            });
        match outcome {
            Ok(()) => {
                *self.inner.sink.lock() = Some(events);
                Ok(())
            }
            Err(message) => Err(EventError::Transport(message)),
        }
    }

    async fn disconnect(&mut self) -> Result<(), EventError> {
        self.inner.disconnects.fetch_add(1, Ordering::Relaxed);
        *self.inner.sink.lock() = None;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Block builders
// ---------------------------------------------------------------------------

/// Serializes an endorser-transaction envelope, optionally carrying a
/// chaincode event.
#[must_use]
pub fn endorser_envelope(
    channel_id: &str,
    tx_id: &str,
    event: Option<ChaincodeEventData>,
) -> Vec<u8> {
    Envelope {
        channel_header: ChannelHeader {
            header_type: HeaderType::EndorserTransaction,
            channel_id: channel_id.to_string(),
            tx_id: tx_id.to_string(),
        },
        transaction: Some(Transaction {
            actions: vec![TransactionAction {
                chaincode_event: event,
            }],
        }),
    }
    .encode()
}

/// Serializes a plain message envelope (no transaction payload).
#[must_use]
pub fn message_envelope(channel_id: &str, tx_id: &str) -> Vec<u8> {
    Envelope {
        channel_header: ChannelHeader {
            header_type: HeaderType::Message,
            channel_id: channel_id.to_string(),
            tx_id: tx_id.to_string(),
        },
        transaction: None,
    }
    .encode()
}

/// Builds a block with the given envelopes and one validation flag per
/// envelope.
#[must_use]
pub fn block_with_envelopes(
    number: u64,
    envelopes: Vec<Vec<u8>>,
    flags: &[TxValidationCode],
) -> Block {
    let mut metadata = vec![Vec::new(); 4];
    metadata[BlockMetadataIndex::TransactionsFilter.index()] =
        flags.iter().map(|code| *code as u8).collect();

    Block {
        header: BlockHeader {
            number,
            previous_hash: vec![0; 32],
            data_hash: vec![0; 32],
        },
        data: BlockData { data: envelopes },
        metadata: BlockMetadata { metadata },
    }
}

/// Builds a filtered block from `(tx_id, validation_code)` pairs.
#[must_use]
pub fn filtered_block(
    channel_id: &str,
    number: u64,
    transactions: Vec<(&str, TxValidationCode)>,
) -> FilteredBlock {
    FilteredBlock {
        channel_id: channel_id.to_string(),
        number,
        filtered_transactions: transactions
            .into_iter()
            .map(|(tx_id, validation_code)| FilteredTransaction {
                tx_id: tx_id.to_string(),
                tx_type: HeaderType::EndorserTransaction,
                validation_code,
                transaction_actions: Vec::new(),
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_transport_scripting() {
        let transport = MockTransport::new();
        transport.script_connect(Err("first attempt fails"));

        let mut adapter = transport.clone();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let sink = EventSink::new(tx);

        assert!(adapter.connect(sink.clone()).await.is_err());
        assert!(transport.sink().is_none());

        assert!(adapter.connect(sink).await.is_ok());
        assert!(transport.sink().is_some());
        assert_eq!(transport.connect_count(), 2);

        adapter.disconnect().await.unwrap();
        assert!(transport.sink().is_none());
        assert_eq!(transport.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_transport_fail_connects() {
        let transport = MockTransport::new();
        transport.script_connect(Ok(()));
        transport.fail_connects("peer gone");

        let mut adapter = transport.clone();
        let (tx, _rx) = tokio::sync::mpsc::channel(1);
        let sink = EventSink::new(tx);

        assert!(adapter.connect(sink.clone()).await.is_ok());
        assert!(adapter.connect(sink.clone()).await.is_err());
        assert!(adapter.connect(sink).await.is_err());
    }

    #[test]
    fn test_block_builder_flags() {
        let block = block_with_envelopes(
            5,
            vec![endorser_envelope("ch", "tx1", None)],
            &[TxValidationCode::MvccReadConflict],
        );
        assert_eq!(block.header.number, 5);
        assert_eq!(block.transaction_filter(), &[7]);
    }
}
