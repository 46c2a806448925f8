//! Ledger block model and the block → filtered-block derivation.
//!
//! A [`Block`] is the raw ledger unit: a numbered header, an ordered list of
//! serialized envelopes, and metadata carrying one validation-code byte per
//! envelope. A [`FilteredBlock`] is its summary form: transaction ids, types,
//! validation codes, and (for valid endorser transactions) embedded chaincode
//! events.
//!
//! Envelopes are opaque byte strings on the block; [`Block::to_filtered`]
//! decodes each one and skips those that fail to decode, so a partially
//! corrupt block still yields a summary of its readable transactions.

use serde::{Deserialize, Serialize};
use tracing::warn;

// ---------------------------------------------------------------------------
// Raw block
// ---------------------------------------------------------------------------

/// A raw ledger block as delivered by the upstream event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    /// Block header with the monotonic block number.
    pub header: BlockHeader,
    /// Ordered, opaque transaction envelopes.
    pub data: BlockData,
    /// Block metadata, including per-transaction validation flags.
    pub metadata: BlockMetadata,
}

impl Block {
    /// Returns the per-transaction validation flags, one byte per envelope.
    ///
    /// Returns an empty slice when the metadata entry is absent.
    #[must_use]
    pub fn transaction_filter(&self) -> &[u8] {
        self.metadata
            .metadata
            .get(BlockMetadataIndex::TransactionsFilter.index())
            .map_or(&[], Vec::as_slice)
    }

    /// Derives the summary form of this block.
    ///
    /// Each envelope that decodes successfully contributes one
    /// [`FilteredTransaction`]; envelopes that fail to decode are logged and
    /// skipped. The filtered block inherits the channel id of the last
    /// successfully decoded envelope and this block's number.
    #[must_use]
    pub fn to_filtered(&self) -> FilteredBlock {
        let flags = self.transaction_filter();
        let mut channel_id = String::new();
        let mut filtered_transactions = Vec::new();

        for (i, data) in self.data.data.iter().enumerate() {
            let envelope = match Envelope::decode(data) {
                Ok(envelope) => envelope,
                Err(err) => {
                    warn!("error extracting envelope from block: {err}");
                    continue;
                }
            };
            let validation_code = flags
                .get(i)
                .copied()
                .map_or(TxValidationCode::InvalidOtherReason, TxValidationCode::from_u8);

            channel_id.clone_from(&envelope.channel_header.channel_id);
            filtered_transactions.push(envelope.into_filtered(validation_code));
        }

        FilteredBlock {
            channel_id,
            number: self.header.number,
            filtered_transactions,
        }
    }
}

/// Header of a raw [`Block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Position of the block in the ledger. Strictly increasing per stream.
    pub number: u64,
    /// Hash of the previous block header.
    pub previous_hash: Vec<u8>,
    /// Hash over this block's data.
    pub data_hash: Vec<u8>,
}

/// The ordered envelope payloads of a [`Block`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockData {
    /// Serialized envelopes, one per transaction.
    pub data: Vec<Vec<u8>>,
}

/// Metadata entries of a [`Block`], indexed by [`BlockMetadataIndex`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlockMetadata {
    /// Raw metadata entries.
    pub metadata: Vec<Vec<u8>>,
}

/// Well-known positions in [`BlockMetadata::metadata`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMetadataIndex {
    /// Consenter signatures over the block.
    Signatures,
    /// Pointer to the last configuration block.
    LastConfig,
    /// One validation-code byte per transaction.
    TransactionsFilter,
    /// Metadata reserved for the ordering service.
    OrdererMetadata,
}

impl BlockMetadataIndex {
    /// Returns the slot of this entry in the metadata array.
    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            BlockMetadataIndex::Signatures => 0,
            BlockMetadataIndex::LastConfig => 1,
            BlockMetadataIndex::TransactionsFilter => 2,
            BlockMetadataIndex::OrdererMetadata => 3,
        }
    }
}

// ---------------------------------------------------------------------------
// Validation codes and header types
// ---------------------------------------------------------------------------

/// Outcome of transaction validation, one code per committed transaction.
///
/// Only [`TxValidationCode::Valid`] transactions have their chaincode events
/// published to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxValidationCode {
    /// The transaction committed successfully.
    Valid = 0,
    /// The envelope was empty.
    NilEnvelope = 1,
    /// The envelope payload could not be read.
    BadPayload = 2,
    /// The common header was malformed.
    BadCommonHeader = 3,
    /// One or more endorsements failed signature verification.
    InvalidEndorsement = 4,
    /// A transaction with the same id was already committed.
    DuplicateTxId = 5,
    /// The endorsement policy was not satisfied.
    EndorsementPolicyFailure = 6,
    /// A concurrent transaction invalidated this transaction's read set.
    MvccReadConflict = 7,
    /// A range read was invalidated by a concurrent write.
    PhantomReadConflict = 8,
    /// The target chaincode was expired at commit time.
    ExpiredChaincode = 9,
    /// Catch-all for validation failures without a dedicated code.
    InvalidOtherReason = 255,
}

impl TxValidationCode {
    /// Maps a raw validation flag byte to a code.
    ///
    /// Unknown bytes map to [`TxValidationCode::InvalidOtherReason`].
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TxValidationCode::Valid,
            1 => TxValidationCode::NilEnvelope,
            2 => TxValidationCode::BadPayload,
            3 => TxValidationCode::BadCommonHeader,
            4 => TxValidationCode::InvalidEndorsement,
            5 => TxValidationCode::DuplicateTxId,
            6 => TxValidationCode::EndorsementPolicyFailure,
            7 => TxValidationCode::MvccReadConflict,
            8 => TxValidationCode::PhantomReadConflict,
            9 => TxValidationCode::ExpiredChaincode,
            _ => TxValidationCode::InvalidOtherReason,
        }
    }
}

/// Kind of payload an envelope carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeaderType {
    /// An opaque, application-defined message.
    Message,
    /// A channel configuration.
    Config,
    /// A proposed configuration change.
    ConfigUpdate,
    /// A transaction endorsed by peers. Only this kind carries chaincode
    /// events.
    EndorserTransaction,
}

// ---------------------------------------------------------------------------
// Envelope wire model
// ---------------------------------------------------------------------------

/// A decoded transaction envelope.
///
/// The serialized form is what [`BlockData::data`] entries contain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Routing header identifying the channel and transaction.
    pub channel_header: ChannelHeader,
    /// The endorsed transaction, present for
    /// [`HeaderType::EndorserTransaction`] envelopes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<Transaction>,
}

impl Envelope {
    /// Decodes an envelope from its serialized form.
    ///
    /// # Errors
    ///
    /// Returns the underlying decode error when the bytes are not a valid
    /// envelope.
    pub fn decode(data: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(data)
    }

    /// Serializes the envelope.
    ///
    /// # Panics
    ///
    /// Panics if serialization fails, which cannot happen for this type.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap()
    }

    /// Collapses the envelope into its filtered-transaction summary.
    fn into_filtered(self, validation_code: TxValidationCode) -> FilteredTransaction {
        let mut transaction_actions = Vec::new();
        if self.channel_header.header_type == HeaderType::EndorserTransaction {
            if let Some(tx) = self.transaction {
                // The summary keeps at most the first action's event.
                if let Some(event) = tx.actions.into_iter().next().and_then(|a| a.chaincode_event)
                {
                    transaction_actions.push(FilteredChaincodeAction {
                        chaincode_event: event,
                    });
                }
            }
        }
        FilteredTransaction {
            tx_id: self.channel_header.tx_id,
            tx_type: self.channel_header.header_type,
            validation_code,
            transaction_actions,
        }
    }
}

/// Routing header of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHeader {
    /// Payload kind.
    pub header_type: HeaderType,
    /// Channel the envelope belongs to.
    pub channel_id: String,
    /// Transaction id.
    pub tx_id: String,
}

/// An endorsed transaction carried by an envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// The transaction's actions, in proposal order.
    pub actions: Vec<TransactionAction>,
}

/// A single action within a [`Transaction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionAction {
    /// Chaincode event emitted by this action, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chaincode_event: Option<ChaincodeEventData>,
}

/// An application event emitted by on-ledger code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChaincodeEventData {
    /// Id of the emitting chaincode.
    pub chaincode_id: String,
    /// Application-chosen event name.
    pub event_name: String,
    /// Transaction that produced the event.
    pub tx_id: String,
    /// Opaque event payload.
    #[serde(default)]
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// Filtered block
// ---------------------------------------------------------------------------

/// Summary form of a [`Block`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredBlock {
    /// Channel the block belongs to.
    pub channel_id: String,
    /// The block number.
    pub number: u64,
    /// One entry per decoded transaction.
    pub filtered_transactions: Vec<FilteredTransaction>,
}

/// Summary of one transaction within a [`FilteredBlock`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredTransaction {
    /// Transaction id.
    pub tx_id: String,
    /// Envelope kind of the original transaction.
    pub tx_type: HeaderType,
    /// Validation outcome.
    pub validation_code: TxValidationCode,
    /// Chaincode actions that emitted events.
    pub transaction_actions: Vec<FilteredChaincodeAction>,
}

/// A chaincode action retained in the summary because it emitted an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilteredChaincodeAction {
    /// The emitted event.
    pub chaincode_event: ChaincodeEventData,
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{block_with_envelopes, endorser_envelope, message_envelope};

    #[test]
    fn test_validation_code_from_u8() {
        assert_eq!(TxValidationCode::from_u8(0), TxValidationCode::Valid);
        assert_eq!(TxValidationCode::from_u8(4), TxValidationCode::InvalidEndorsement);
        assert_eq!(TxValidationCode::from_u8(200), TxValidationCode::InvalidOtherReason);
        assert_eq!(TxValidationCode::from_u8(255), TxValidationCode::InvalidOtherReason);
    }

    #[test]
    fn test_envelope_round_trip() {
        let envelope = Envelope {
            channel_header: ChannelHeader {
                header_type: HeaderType::EndorserTransaction,
                channel_id: "orders".into(),
                tx_id: "tx1".into(),
            },
            transaction: Some(Transaction {
                actions: vec![TransactionAction {
                    chaincode_event: Some(ChaincodeEventData {
                        chaincode_id: "marbles".into(),
                        event_name: "transfer".into(),
                        tx_id: "tx1".into(),
                        payload: vec![1, 2, 3],
                    }),
                }],
            }),
        };

        let decoded = Envelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_envelope_decode_garbage() {
        assert!(Envelope::decode(b"not an envelope").is_err());
    }

    #[test]
    fn test_to_filtered_number_and_entry_count() {
        let block = block_with_envelopes(
            7,
            vec![
                endorser_envelope("orders", "tx1", None),
                endorser_envelope("orders", "tx2", None),
            ],
            &[TxValidationCode::Valid, TxValidationCode::MvccReadConflict],
        );

        let filtered = block.to_filtered();
        assert_eq!(filtered.number, 7);
        assert_eq!(filtered.channel_id, "orders");
        assert_eq!(filtered.filtered_transactions.len(), 2);
        assert_eq!(filtered.filtered_transactions[0].tx_id, "tx1");
        assert_eq!(
            filtered.filtered_transactions[0].validation_code,
            TxValidationCode::Valid
        );
        assert_eq!(
            filtered.filtered_transactions[1].validation_code,
            TxValidationCode::MvccReadConflict
        );
    }

    #[test]
    fn test_to_filtered_skips_undecodable_envelopes() {
        let mut block = block_with_envelopes(
            3,
            vec![endorser_envelope("orders", "tx1", None)],
            &[TxValidationCode::Valid, TxValidationCode::Valid],
        );
        // Corrupt envelope in the middle; the valid one after it still counts.
        block.data.data.insert(0, b"garbage".to_vec());

        let filtered = block.to_filtered();
        assert_eq!(filtered.filtered_transactions.len(), 1);
        assert_eq!(filtered.filtered_transactions[0].tx_id, "tx1");
        // Flag index follows the envelope position, not the decode order.
        assert_eq!(
            filtered.filtered_transactions[0].validation_code,
            TxValidationCode::Valid
        );
    }

    #[test]
    fn test_to_filtered_channel_id_from_last_decoded() {
        let block = block_with_envelopes(
            9,
            vec![
                endorser_envelope("first", "tx1", None),
                endorser_envelope("second", "tx2", None),
            ],
            &[TxValidationCode::Valid, TxValidationCode::Valid],
        );
        assert_eq!(block.to_filtered().channel_id, "second");
    }

    #[test]
    fn test_to_filtered_attaches_chaincode_event() {
        let event = ChaincodeEventData {
            chaincode_id: "marbles".into(),
            event_name: "transfer".into(),
            tx_id: "tx1".into(),
            payload: Vec::new(),
        };
        let block = block_with_envelopes(
            1,
            vec![endorser_envelope("orders", "tx1", Some(event.clone()))],
            &[TxValidationCode::Valid],
        );

        let filtered = block.to_filtered();
        let actions = &filtered.filtered_transactions[0].transaction_actions;
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].chaincode_event, event);
    }

    #[test]
    fn test_to_filtered_non_endorser_has_no_actions() {
        let block = block_with_envelopes(
            1,
            vec![message_envelope("orders", "tx1")],
            &[TxValidationCode::Valid],
        );

        let filtered = block.to_filtered();
        assert_eq!(filtered.filtered_transactions[0].tx_type, HeaderType::Message);
        assert!(filtered.filtered_transactions[0].transaction_actions.is_empty());
    }

    #[test]
    fn test_to_filtered_missing_flags_fall_back_to_invalid() {
        let mut block = block_with_envelopes(
            1,
            vec![endorser_envelope("orders", "tx1", None)],
            &[TxValidationCode::Valid],
        );
        block.metadata.metadata.clear();

        let filtered = block.to_filtered();
        assert_eq!(
            filtered.filtered_transactions[0].validation_code,
            TxValidationCode::InvalidOtherReason
        );
    }
}
