//! Transport adapter contract.
//!
//! The dispatcher never speaks a wire protocol itself. A [`TransportAdapter`]
//! owns the upstream event stream: `connect` establishes it and `disconnect`
//! tears it down. While connected, the adapter pushes decoded blocks into the
//! dispatcher through the [`EventSink`] it received, preserving upstream
//! order. A stream failure after a successful connect is reported through
//! [`EventSink::disconnected`], which feeds the connection-event path.
//!
//! The sink is a narrow surface over the dispatcher inbox: an adapter can
//! produce data events and report stream loss, nothing else.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::block::{Block, FilteredBlock};
use crate::dispatcher::Event;
use crate::error::EventError;

/// Connection to an upstream ledger event stream.
///
/// `connect` must return once the stream is established; the producer that
/// feeds the sink belongs on its own task. Pushing into the sink from inside
/// `connect` can deadlock: the dispatcher is blocked on `connect` and cannot
/// drain its inbox.
#[async_trait]
pub trait TransportAdapter: Send + Sync {
    /// Establishes the upstream stream and hands it the event sink.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Transport`] when the stream cannot be
    /// established.
    async fn connect(&mut self, events: EventSink) -> Result<(), EventError>;

    /// Tears down the upstream stream.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::Transport`] when teardown fails.
    async fn disconnect(&mut self) -> Result<(), EventError>;
}

/// Producer surface handed to a [`TransportAdapter`] on connect.
#[derive(Debug, Clone)]
pub struct EventSink {
    inbox: mpsc::Sender<Event>,
}

impl EventSink {
    pub(crate) fn new(inbox: mpsc::Sender<Event>) -> Self {
        Self { inbox }
    }

    /// Pushes a raw block into the dispatcher.
    ///
    /// Suspends while the dispatcher inbox is full, which carries upstream
    /// back-pressure into the transport.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ChannelClosed`] once the dispatcher has stopped.
    pub async fn block(&self, block: Block) -> Result<(), EventError> {
        self.inbox
            .send(Event::Block { block })
            .await
            .map_err(|_| EventError::ChannelClosed)
    }

    /// Pushes a filtered block into the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ChannelClosed`] once the dispatcher has stopped.
    pub async fn filtered_block(&self, filtered_block: FilteredBlock) -> Result<(), EventError> {
        self.inbox
            .send(Event::FilteredBlock { filtered_block })
            .await
            .map_err(|_| EventError::ChannelClosed)
    }

    /// Reports that the upstream stream was lost.
    ///
    /// Connection-event subscribers observe this as a disconnection; with
    /// reconnection enabled, the client's monitor reacts to it.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::ChannelClosed`] once the dispatcher has stopped.
    pub async fn disconnected(&self, error: impl Into<String> + Send) -> Result<(), EventError> {
        self.inbox
            .send(Event::Disconnected {
                error: error.into(),
            })
            .await
            .map_err(|_| EventError::ChannelClosed)
    }
}
