//! Event Dispatcher — the single-consumer pump behind every subscription.
//!
//! All events, whether control requests originating from the client or data
//! events originating from the upstream stream, flow through one bounded
//! inbox and are handled by a single task:
//!
//! ```text
//! Transport adapter ──┐                       ┌──send──► block subscribers
//! (blocks, stream     │    ┌──────────────┐   ├──send──► filtered-block subscribers
//!  loss)              ├──► │ Dispatch loop│──►├──send──► tx-status subscribers
//! Client ─────────────┘    │ (one task)   │   ├──send──► chaincode subscribers
//! (connect, register,      └──────────────┘   └──send──► connection subscribers
//!  unregister, stop)
//! ```
//!
//! Processing events strictly in arrival order means the registration tables
//! need no locks: every read and write happens on the loop. It also gives a
//! total order over observed events; what each subscriber sees is a
//! subsequence of that order, thinned only by its own delivery policy.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::block::{Block, ChaincodeEventData, FilteredBlock, FilteredTransaction, TxValidationCode};
use crate::error::EventError;
use crate::event::{
    BlockEvent, ChaincodeEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent,
};
use crate::registration::{
    accept_all_blocks, chaincode_key, BlockFilter, BlockRegistration, ChaincodeRegistration,
    ConnectionRegistration, FilteredBlockRegistration, Registration, RegistrationId,
    RegistrationKind, TxStatusRegistration,
};
use crate::transport::{EventSink, TransportAdapter};

/// Sentinel stored in the last-block slot until a block is observed.
const NO_BLOCK_OBSERVED: u64 = u64::MAX;

// ---------------------------------------------------------------------------
// DispatcherState
// ---------------------------------------------------------------------------

/// Lifecycle state of the dispatcher. Transitions are monotone and one-way.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DispatcherState {
    /// Created but not yet started.
    Initial = 0,
    /// The dispatch loop is running.
    Started = 1,
    /// Stopped; all registrations have been released.
    Stopped = 2,
}

impl DispatcherState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => DispatcherState::Initial,
            1 => DispatcherState::Started,
            _ => DispatcherState::Stopped,
        }
    }
}

impl fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DispatcherState::Initial => "Initial",
            DispatcherState::Started => "Started",
            DispatcherState::Stopped => "Stopped",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// DeliveryPolicy
// ---------------------------------------------------------------------------

/// What the dispatch loop does when a subscriber's channel is full.
///
/// Whatever the policy, events delivered to one subscriber arrive in
/// processing order; the policy only decides whether slow subscribers drop
/// events or stall the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPolicy {
    /// Attempt a single non-blocking send; on a full channel, drop the event
    /// for that subscriber and log a warning.
    DropWhenFull,
    /// Wait until the subscriber accepts. One stalled subscriber stalls the
    /// whole dispatch loop, and through it the transport; use only where
    /// that back-pressure is wanted.
    Block,
    /// Wait up to the given duration, then drop for that subscriber and log
    /// a warning.
    Timeout(Duration),
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        DeliveryPolicy::Timeout(Duration::from_millis(500))
    }
}

// ---------------------------------------------------------------------------
// DispatcherConfig
// ---------------------------------------------------------------------------

/// Configuration for the [`Dispatcher`].
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Capacity of the inbox and of every subscriber channel.
    pub event_buffer_size: usize,
    /// Per-subscriber delivery policy.
    pub delivery_policy: DeliveryPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 100,
            delivery_policy: DeliveryPolicy::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Event
// ---------------------------------------------------------------------------

/// An event accepted by the dispatcher inbox.
///
/// Control events carry a reply channel where the outcome is surfaced
/// synchronously to the submitter; data events carry no reply, their effects
/// are the deliveries they cause.
pub enum Event {
    /// Establish the upstream stream through the transport adapter.
    Connect {
        /// Receives the adapter's connect outcome.
        reply: oneshot::Sender<Result<(), EventError>>,
    },
    /// Tear down the upstream stream.
    Disconnect {
        /// Receives the adapter's disconnect outcome.
        reply: oneshot::Sender<Result<(), EventError>>,
    },
    /// The connection was established; notify connection subscribers.
    Connected,
    /// The upstream stream was lost; notify connection subscribers.
    Disconnected {
        /// Transport description of the failure.
        error: String,
    },
    /// Add a raw-block subscription.
    RegisterBlock {
        /// Predicate deciding which blocks this subscriber receives.
        filter: BlockFilter,
        /// Delivery channel for accepted blocks.
        sender: mpsc::Sender<BlockEvent>,
        /// Receives the handle, or the rejection.
        reply: oneshot::Sender<Result<Registration, EventError>>,
    },
    /// Add a filtered-block subscription.
    RegisterFilteredBlock {
        /// Delivery channel for filtered blocks.
        sender: mpsc::Sender<FilteredBlockEvent>,
        /// Receives the handle, or the rejection.
        reply: oneshot::Sender<Result<Registration, EventError>>,
    },
    /// Add a transaction-status subscription for one tx id.
    RegisterTxStatus {
        /// The transaction id to watch.
        tx_id: String,
        /// Delivery channel for the status event.
        sender: mpsc::Sender<TxStatusEvent>,
        /// Receives the handle, or the rejection.
        reply: oneshot::Sender<Result<Registration, EventError>>,
    },
    /// Add a chaincode application-event subscription.
    RegisterChaincode {
        /// The chaincode id to match exactly.
        chaincode_id: String,
        /// Event-name filter, compiled as a regular expression.
        event_filter: String,
        /// Delivery channel for matching events.
        sender: mpsc::Sender<ChaincodeEvent>,
        /// Receives the handle, or the rejection.
        reply: oneshot::Sender<Result<Registration, EventError>>,
    },
    /// Add a connection-transition subscription.
    RegisterConnection {
        /// Delivery channel for connection events.
        sender: mpsc::Sender<ConnectionEvent>,
        /// Receives the handle, or the rejection.
        reply: oneshot::Sender<Result<Registration, EventError>>,
    },
    /// Remove a subscription and close its channel. Unknown handles are
    /// logged, not surfaced.
    Unregister {
        /// Handle returned by the matching register operation.
        registration: Registration,
    },
    /// Stop the dispatcher and release every registration.
    Stop {
        /// Receives the stop acknowledgement.
        reply: oneshot::Sender<Result<(), EventError>>,
    },
    /// A raw block from the upstream stream.
    Block {
        /// The block, in upstream order.
        block: Block,
    },
    /// A filtered block from the upstream stream.
    FilteredBlock {
        /// The filtered block, in upstream order.
        filtered_block: FilteredBlock,
    },
}

impl Event {
    /// Returns a short name for logging.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Event::Connect { .. } => "connect",
            Event::Disconnect { .. } => "disconnect",
            Event::Connected => "connected",
            Event::Disconnected { .. } => "disconnected",
            Event::RegisterBlock { .. } => "register-block",
            Event::RegisterFilteredBlock { .. } => "register-filtered-block",
            Event::RegisterTxStatus { .. } => "register-tx-status",
            Event::RegisterChaincode { .. } => "register-chaincode",
            Event::RegisterConnection { .. } => "register-connection",
            Event::Unregister { .. } => "unregister",
            Event::Stop { .. } => "stop",
            Event::Block { .. } => "block",
            Event::FilteredBlock { .. } => "filtered-block",
        }
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

/// State shared between the dispatch loop and handles: the lifecycle word
/// and the last observed block number. Everything else is loop-confined.
#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    last_block_num: AtomicU64,
    buffer_size: usize,
}

impl Shared {
    fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, current: DispatcherState, new: DispatcherState) -> bool {
        self.state
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn last_block_num(&self) -> Option<u64> {
        match self.last_block_num.load(Ordering::Acquire) {
            NO_BLOCK_OBSERVED => None,
            number => Some(number),
        }
    }
}

// ---------------------------------------------------------------------------
// Dispatcher
// ---------------------------------------------------------------------------

/// The event dispatcher.
///
/// Create it cold with [`Dispatcher::new`], start it once with
/// [`Dispatcher::start`], and interact with it through a
/// [`DispatcherHandle`]. Stopping is itself an event: submit [`Event::Stop`]
/// (or call [`DispatcherHandle::stop`]) and await the reply.
pub struct Dispatcher {
    shared: Arc<Shared>,
    policy: DeliveryPolicy,
    inbox_tx: mpsc::Sender<Event>,
    inbox_rx: Option<mpsc::Receiver<Event>>,
    transport: Option<Box<dyn TransportAdapter>>,
}

impl Dispatcher {
    /// Creates a new dispatcher over the given transport.
    #[must_use]
    pub fn new(config: DispatcherConfig, transport: Box<dyn TransportAdapter>) -> Self {
        let (inbox_tx, inbox_rx) = mpsc::channel(config.event_buffer_size);
        Self {
            shared: Arc::new(Shared {
                state: AtomicU8::new(DispatcherState::Initial as u8),
                last_block_num: AtomicU64::new(NO_BLOCK_OBSERVED),
                buffer_size: config.event_buffer_size,
            }),
            policy: config.delivery_policy,
            inbox_tx,
            inbox_rx: Some(inbox_rx),
            transport: Some(transport),
        }
    }

    /// Returns a handle for submitting events and managing registrations.
    #[must_use]
    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shared: Arc::clone(&self.shared),
            inbox: self.inbox_tx.clone(),
        }
    }

    /// Starts the dispatch loop on a new task.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotInInitialState`] if the dispatcher was
    /// already started or stopped.
    pub fn start(&mut self) -> Result<(), EventError> {
        if !self
            .shared
            .set_state(DispatcherState::Initial, DispatcherState::Started)
        {
            return Err(EventError::NotInInitialState);
        }
        // The CAS above passes exactly once, so both slots are still filled.
        let (Some(inbox), Some(transport)) = (self.inbox_rx.take(), self.transport.take()) else {
            return Err(EventError::NotInInitialState);
        };

        let dispatch = DispatchLoop {
            shared: Arc::clone(&self.shared),
            policy: self.policy,
            inbox_tx: self.inbox_tx.clone(),
            transport,
            next_id: 1,
            block_regs: Vec::new(),
            filtered_block_regs: Vec::new(),
            tx_regs: HashMap::new(),
            chaincode_regs: HashMap::new(),
            connection_regs: Vec::new(),
        };
        tokio::spawn(dispatch.run(inbox));
        Ok(())
    }

    /// Returns the current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.shared.state()
    }

    /// Returns the number of the last block an event was accepted for, or
    /// `None` when no block has been observed yet.
    #[must_use]
    pub fn last_block_num(&self) -> Option<u64> {
        self.shared.last_block_num()
    }
}

// ---------------------------------------------------------------------------
// DispatcherHandle
// ---------------------------------------------------------------------------

/// Cheap, cloneable handle to a [`Dispatcher`].
///
/// The register methods create the subscriber channel at the dispatcher's
/// configured capacity, submit the registration, and await the reply.
#[derive(Debug, Clone)]
pub struct DispatcherHandle {
    shared: Arc<Shared>,
    inbox: mpsc::Sender<Event>,
}

impl DispatcherHandle {
    /// Returns the dispatcher's lifecycle state.
    #[must_use]
    pub fn state(&self) -> DispatcherState {
        self.shared.state()
    }

    /// Returns the number of the last block an event was accepted for.
    #[must_use]
    pub fn last_block_num(&self) -> Option<u64> {
        self.shared.last_block_num()
    }

    /// Submits an event, suspending while the inbox is full.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn submit(&self, event: Event) -> Result<(), EventError> {
        let state = self.shared.state();
        if state != DispatcherState::Started {
            return Err(EventError::NotStarted(state));
        }
        self.inbox
            .send(event)
            .await
            .map_err(|_| EventError::ChannelClosed)
    }

    /// Registers for raw block events.
    ///
    /// Blocks are delivered when `filter` accepts them; `None` accepts every
    /// block.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn register_block_event(
        &self,
        filter: Option<BlockFilter>,
    ) -> Result<(Registration, mpsc::Receiver<BlockEvent>), EventError> {
        let (sender, receiver) = mpsc::channel(self.shared.buffer_size);
        let (reply, response) = oneshot::channel();
        self.submit(Event::RegisterBlock {
            filter: filter.unwrap_or_else(accept_all_blocks),
            sender,
            reply,
        })
        .await?;
        let registration = response.await.map_err(|_| EventError::ChannelClosed)??;
        Ok((registration, receiver))
    }

    /// Registers for filtered block events.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn register_filtered_block_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<FilteredBlockEvent>), EventError> {
        let (sender, receiver) = mpsc::channel(self.shared.buffer_size);
        let (reply, response) = oneshot::channel();
        self.submit(Event::RegisterFilteredBlock { sender, reply })
            .await?;
        let registration = response.await.map_err(|_| EventError::ChannelClosed)??;
        Ok((registration, receiver))
    }

    /// Registers for the commit status of one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::DuplicateTxRegistration`] when a registration
    /// for the tx id already exists, and [`EventError::NotStarted`] unless
    /// the dispatcher is running.
    pub async fn register_tx_status_event(
        &self,
        tx_id: impl Into<String> + Send,
    ) -> Result<(Registration, mpsc::Receiver<TxStatusEvent>), EventError> {
        let (sender, receiver) = mpsc::channel(self.shared.buffer_size);
        let (reply, response) = oneshot::channel();
        self.submit(Event::RegisterTxStatus {
            tx_id: tx_id.into(),
            sender,
            reply,
        })
        .await?;
        let registration = response.await.map_err(|_| EventError::ChannelClosed)??;
        Ok((registration, receiver))
    }

    /// Registers for chaincode events whose name matches `event_filter`.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::InvalidEventFilter`] when the filter does not
    /// compile, [`EventError::DuplicateChaincodeRegistration`] when the
    /// chaincode/filter pair is already registered, and
    /// [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn register_chaincode_event(
        &self,
        chaincode_id: impl Into<String> + Send,
        event_filter: impl Into<String> + Send,
    ) -> Result<(Registration, mpsc::Receiver<ChaincodeEvent>), EventError> {
        let (sender, receiver) = mpsc::channel(self.shared.buffer_size);
        let (reply, response) = oneshot::channel();
        self.submit(Event::RegisterChaincode {
            chaincode_id: chaincode_id.into(),
            event_filter: event_filter.into(),
            sender,
            reply,
        })
        .await?;
        let registration = response.await.map_err(|_| EventError::ChannelClosed)??;
        Ok((registration, receiver))
    }

    /// Registers for connection transitions.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn register_connection_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<ConnectionEvent>), EventError> {
        let (sender, receiver) = mpsc::channel(self.shared.buffer_size);
        let (reply, response) = oneshot::channel();
        self.submit(Event::RegisterConnection { sender, reply })
            .await?;
        let registration = response.await.map_err(|_| EventError::ChannelClosed)??;
        Ok((registration, receiver))
    }

    /// Removes a subscription; its channel closes once the loop processes
    /// the removal.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn unregister(&self, registration: Registration) -> Result<(), EventError> {
        self.submit(Event::Unregister { registration }).await
    }

    /// Establishes the upstream stream and awaits the outcome.
    ///
    /// # Errors
    ///
    /// Returns the transport's connect error, or
    /// [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn connect(&self) -> Result<(), EventError> {
        let (reply, response) = oneshot::channel();
        self.submit(Event::Connect { reply }).await?;
        response.await.map_err(|_| EventError::ChannelClosed)?
    }

    /// Tears down the upstream stream and awaits the outcome.
    ///
    /// # Errors
    ///
    /// Returns the transport's disconnect error, or
    /// [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn disconnect(&self) -> Result<(), EventError> {
        let (reply, response) = oneshot::channel();
        self.submit(Event::Disconnect { reply }).await?;
        response.await.map_err(|_| EventError::ChannelClosed)?
    }

    /// Stops the dispatcher, closing every subscriber channel.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotStarted`] unless the dispatcher is running.
    pub async fn stop(&self) -> Result<(), EventError> {
        let (reply, response) = oneshot::channel();
        self.submit(Event::Stop { reply }).await?;
        response.await.map_err(|_| EventError::ChannelClosed)?
    }
}

// ---------------------------------------------------------------------------
// Dispatch loop
// ---------------------------------------------------------------------------

/// The loop-confined half of the dispatcher: registration tables, the id
/// counter, and the transport. No other task touches these.
struct DispatchLoop {
    shared: Arc<Shared>,
    policy: DeliveryPolicy,
    inbox_tx: mpsc::Sender<Event>,
    transport: Box<dyn TransportAdapter>,
    next_id: u64,
    block_regs: Vec<BlockRegistration>,
    filtered_block_regs: Vec<FilteredBlockRegistration>,
    tx_regs: HashMap<String, TxStatusRegistration>,
    chaincode_regs: HashMap<String, ChaincodeRegistration>,
    connection_regs: Vec<ConnectionRegistration>,
}

impl DispatchLoop {
    async fn run(mut self, mut inbox: mpsc::Receiver<Event>) {
        while let Some(event) = inbox.recv().await {
            debug!("received event [{}]", event.name());
            self.handle_event(event).await;
            if self.shared.state() == DispatcherState::Stopped {
                break;
            }
        }
        debug!("exiting event dispatcher");
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Connect { reply } => {
                let sink = EventSink::new(self.inbox_tx.clone());
                let _ = reply.send(self.transport.connect(sink).await);
            }
            Event::Disconnect { reply } => {
                let _ = reply.send(self.transport.disconnect().await);
            }
            Event::Connected => {
                self.publish_connection_event(ConnectionEvent::connected())
                    .await;
            }
            Event::Disconnected { error } => {
                self.publish_connection_event(ConnectionEvent::disconnected(error))
                    .await;
            }
            Event::RegisterBlock {
                filter,
                sender,
                reply,
            } => self.handle_register_block(filter, sender, reply),
            Event::RegisterFilteredBlock { sender, reply } => {
                self.handle_register_filtered_block(sender, reply);
            }
            Event::RegisterTxStatus {
                tx_id,
                sender,
                reply,
            } => self.handle_register_tx_status(tx_id, sender, reply),
            Event::RegisterChaincode {
                chaincode_id,
                event_filter,
                sender,
                reply,
            } => self.handle_register_chaincode(chaincode_id, event_filter, sender, reply),
            Event::RegisterConnection { sender, reply } => {
                self.handle_register_connection(sender, reply);
            }
            Event::Unregister { registration } => self.handle_unregister(registration),
            Event::Stop { reply } => self.handle_stop(reply),
            Event::Block { block } => self.handle_block(block).await,
            Event::FilteredBlock { filtered_block } => {
                self.handle_filtered_block(filtered_block).await;
            }
        }
    }

    fn next_registration(&mut self, kind: RegistrationKind) -> Registration {
        let id = RegistrationId(self.next_id);
        self.next_id += 1;
        Registration::new(id, kind)
    }

    // -- register handlers --

    fn handle_register_block(
        &mut self,
        filter: BlockFilter,
        sender: mpsc::Sender<BlockEvent>,
        reply: oneshot::Sender<Result<Registration, EventError>>,
    ) {
        let registration = self.next_registration(RegistrationKind::Block);
        self.block_regs.push(BlockRegistration {
            id: registration.id(),
            filter,
            sender,
        });
        let _ = reply.send(Ok(registration));
    }

    fn handle_register_filtered_block(
        &mut self,
        sender: mpsc::Sender<FilteredBlockEvent>,
        reply: oneshot::Sender<Result<Registration, EventError>>,
    ) {
        let registration = self.next_registration(RegistrationKind::FilteredBlock);
        self.filtered_block_regs.push(FilteredBlockRegistration {
            id: registration.id(),
            sender,
        });
        let _ = reply.send(Ok(registration));
    }

    fn handle_register_tx_status(
        &mut self,
        tx_id: String,
        sender: mpsc::Sender<TxStatusEvent>,
        reply: oneshot::Sender<Result<Registration, EventError>>,
    ) {
        if self.tx_regs.contains_key(&tx_id) {
            let _ = reply.send(Err(EventError::DuplicateTxRegistration(tx_id)));
            return;
        }
        let registration = self.next_registration(RegistrationKind::TxStatus);
        self.tx_regs.insert(
            tx_id.clone(),
            TxStatusRegistration {
                id: registration.id(),
                tx_id,
                sender,
            },
        );
        let _ = reply.send(Ok(registration));
    }

    fn handle_register_chaincode(
        &mut self,
        chaincode_id: String,
        event_filter: String,
        sender: mpsc::Sender<ChaincodeEvent>,
        reply: oneshot::Sender<Result<Registration, EventError>>,
    ) {
        let key = chaincode_key(&chaincode_id, &event_filter);
        if self.chaincode_regs.contains_key(&key) {
            let _ = reply.send(Err(EventError::DuplicateChaincodeRegistration {
                chaincode_id,
                event_filter,
            }));
            return;
        }
        let event_regex = match Regex::new(&event_filter) {
            Ok(regex) => regex,
            Err(source) => {
                let _ = reply.send(Err(EventError::InvalidEventFilter {
                    event_filter,
                    source,
                }));
                return;
            }
        };
        let registration = self.next_registration(RegistrationKind::Chaincode);
        self.chaincode_regs.insert(
            key,
            ChaincodeRegistration {
                id: registration.id(),
                chaincode_id,
                event_filter,
                event_regex,
                sender,
            },
        );
        let _ = reply.send(Ok(registration));
    }

    fn handle_register_connection(
        &mut self,
        sender: mpsc::Sender<ConnectionEvent>,
        reply: oneshot::Sender<Result<Registration, EventError>>,
    ) {
        let registration = self.next_registration(RegistrationKind::Connection);
        self.connection_regs.push(ConnectionRegistration {
            id: registration.id(),
            sender,
        });
        let _ = reply.send(Ok(registration));
    }

    // -- unregister / stop --

    fn handle_unregister(&mut self, registration: Registration) {
        let id = registration.id();
        let result = match registration.kind() {
            RegistrationKind::Block => remove_by_id(&mut self.block_regs, |r| r.id == id),
            RegistrationKind::FilteredBlock => {
                remove_by_id(&mut self.filtered_block_regs, |r| r.id == id)
            }
            RegistrationKind::TxStatus => {
                let key = self
                    .tx_regs
                    .iter()
                    .find(|(_, r)| r.id == id)
                    .map(|(k, _)| k.clone());
                match key {
                    Some(key) => {
                        let removed = self.tx_regs.remove(&key);
                        if let Some(reg) = removed {
                            debug!("unregistering tx status event for tx id [{}]", reg.tx_id);
                        }
                        Ok(())
                    }
                    None => Err(EventError::InvalidRegistration),
                }
            }
            RegistrationKind::Chaincode => {
                let key = self
                    .chaincode_regs
                    .iter()
                    .find(|(_, r)| r.id == id)
                    .map(|(k, _)| k.clone());
                match key {
                    Some(key) => {
                        if let Some(reg) = self.chaincode_regs.remove(&key) {
                            debug!(
                                "unregistering chaincode event for chaincode [{}] and event filter [{}]",
                                reg.chaincode_id, reg.event_filter
                            );
                        }
                        Ok(())
                    }
                    None => Err(EventError::InvalidRegistration),
                }
            }
            RegistrationKind::Connection => {
                remove_by_id(&mut self.connection_regs, |r| r.id == id)
            }
        };
        if let Err(err) = result {
            warn!("error in unregister of {}: {err}", registration.id());
        }
    }

    fn handle_stop(&mut self, reply: oneshot::Sender<Result<(), EventError>>) {
        debug!("stopping dispatcher");
        if !self
            .shared
            .set_state(DispatcherState::Started, DispatcherState::Stopped)
        {
            warn!("cannot stop event dispatcher since it is already stopped");
            let _ = reply.send(Ok(()));
            return;
        }
        // Dropping the table entries drops the only senders, which closes
        // every subscriber channel.
        debug!(
            "releasing registrations: {} block, {} filtered-block, {} tx-status, {} chaincode, {} connection",
            self.block_regs.len(),
            self.filtered_block_regs.len(),
            self.tx_regs.len(),
            self.chaincode_regs.len(),
            self.connection_regs.len()
        );
        self.block_regs.clear();
        self.filtered_block_regs.clear();
        self.tx_regs.clear();
        self.chaincode_regs.clear();
        self.connection_regs.clear();
        let _ = reply.send(Ok(()));
    }

    // -- data handlers --

    fn update_last_block_num(&self, number: u64) -> Result<(), EventError> {
        // The upstream stream delivers in order; a regression is a protocol
        // error, not a retryable condition.
        let last = self.shared.last_block_num.load(Ordering::Acquire);
        if last == NO_BLOCK_OBSERVED || number > last {
            self.shared
                .last_block_num
                .store(number, Ordering::Release);
            return Ok(());
        }
        Err(EventError::OutOfOrderBlock {
            last,
            received: number,
        })
    }

    async fn handle_block(&mut self, block: Block) {
        debug!("handling block event - block #{}", block.header.number);
        if let Err(err) = self.update_last_block_num(block.header.number) {
            error!("{err}");
            return;
        }

        let filtered = block.to_filtered();
        let block = Arc::new(block);
        for reg in &self.block_regs {
            if !(reg.filter)(&block) {
                debug!(
                    "not sending block event for block #{} since it was filtered out",
                    block.header.number
                );
                continue;
            }
            self.deliver(
                &reg.sender,
                BlockEvent {
                    block: Arc::clone(&block),
                },
                "block",
            )
            .await;
        }

        self.publish_filtered_block_events(filtered).await;
    }

    async fn handle_filtered_block(&mut self, filtered_block: FilteredBlock) {
        debug!(
            "handling filtered block event - block #{}",
            filtered_block.number
        );
        if let Err(err) = self.update_last_block_num(filtered_block.number) {
            error!("{err}");
            return;
        }
        self.publish_filtered_block_events(filtered_block).await;
    }

    async fn publish_filtered_block_events(&self, filtered_block: FilteredBlock) {
        let filtered_block = Arc::new(filtered_block);
        for reg in &self.filtered_block_regs {
            self.deliver(
                &reg.sender,
                FilteredBlockEvent {
                    filtered_block: Arc::clone(&filtered_block),
                },
                "filtered block",
            )
            .await;
        }

        for tx in &filtered_block.filtered_transactions {
            self.publish_tx_status_event(tx).await;

            // Chaincode events are only published for committed transactions.
            if tx.validation_code == TxValidationCode::Valid {
                for action in &tx.transaction_actions {
                    self.publish_chaincode_events(&action.chaincode_event).await;
                }
            }
        }
    }

    async fn publish_tx_status_event(&self, tx: &FilteredTransaction) {
        if let Some(reg) = self.tx_regs.get(&tx.tx_id) {
            debug!("sending tx status event for tx id [{}]", tx.tx_id);
            self.deliver(
                &reg.sender,
                TxStatusEvent {
                    tx_id: tx.tx_id.clone(),
                    validation_code: tx.validation_code,
                },
                "tx status",
            )
            .await;
        }
    }

    async fn publish_chaincode_events(&self, event: &ChaincodeEventData) {
        for reg in self.chaincode_regs.values() {
            if reg.chaincode_id == event.chaincode_id
                && reg.event_regex.is_match(&event.event_name)
            {
                self.deliver(
                    &reg.sender,
                    ChaincodeEvent {
                        chaincode_id: event.chaincode_id.clone(),
                        event_name: event.event_name.clone(),
                        tx_id: event.tx_id.clone(),
                    },
                    "chaincode",
                )
                .await;
            }
        }
    }

    async fn publish_connection_event(&self, event: ConnectionEvent) {
        for reg in &self.connection_regs {
            self.deliver(&reg.sender, event.clone(), "connection").await;
        }
    }

    // -- delivery --

    async fn deliver<T: Send>(&self, sender: &mpsc::Sender<T>, event: T, label: &str) {
        match self.policy {
            DeliveryPolicy::DropWhenFull => {
                if sender.try_send(event).is_err() {
                    warn!("unable to send to {label} event channel");
                }
            }
            DeliveryPolicy::Block => {
                if sender.send(event).await.is_err() {
                    warn!("unable to send to {label} event channel");
                }
            }
            DeliveryPolicy::Timeout(duration) => {
                match tokio::time::timeout(duration, sender.send(event)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(_)) => warn!("unable to send to {label} event channel"),
                    Err(_) => warn!("timed out sending {label} event"),
                }
            }
        }
    }
}

fn remove_by_id<T>(regs: &mut Vec<T>, matches: impl Fn(&T) -> bool) -> Result<(), EventError> {
    match regs.iter().position(matches) {
        Some(index) => {
            // Registration order is not observable, so O(1) removal is fine.
            regs.swap_remove(index);
            Ok(())
        }
        None => Err(EventError::InvalidRegistration),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
