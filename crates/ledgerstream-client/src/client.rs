//! The event client: connection lifecycle over a running dispatcher.
//!
//! The client owns no subscription state — every registration proxies
//! through the dispatcher — but it owns the connection: a lock-free state
//! machine (`Disconnected → Connecting → Connected`, atomic compare-and-swap
//! transitions), a once-only monitor task watching the connection feed, and
//! the reconnect policy applied when the feed reports a lost stream.
//!
//! The client is cheaply cloneable; the monitor and reconnect tasks each
//! hold a clone.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use ledgerstream_core::event::{
    BlockEvent, ChaincodeEvent, ConnectionEvent, FilteredBlockEvent, TxStatusEvent,
};
use ledgerstream_core::registration::{BlockFilter, Registration};
use ledgerstream_core::{Dispatcher, DispatcherHandle, Event};

use crate::config::ClientParams;
use crate::error::{ClientError, HookError};

/// Callback invoked around connection transitions.
///
/// The after-connect hook runs once the transport is up but before the
/// client reports `Connected`; a failure there backs the connection out.
/// The before-reconnect hook runs ahead of every reconnect cycle; a failure
/// there aborts the cycle.
pub type ConnectHook = Arc<dyn Fn() -> Result<(), HookError> + Send + Sync>;

// ---------------------------------------------------------------------------
// ConnectionState
// ---------------------------------------------------------------------------

/// State of the client's connection to the event source.
///
/// Valid transitions pass through `Connecting`; the only direct jump to
/// `Disconnected` is the reset performed while closing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    /// Not connected to the event source.
    Disconnected = 0,
    /// A connection attempt is in progress.
    Connecting = 1,
    /// Connected to the event source.
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// EventClient
// ---------------------------------------------------------------------------

/// Client for a remote ledger event source.
///
/// Connects through the dispatcher's transport, monitors the connection, and
/// reconnects on failure subject to [`ClientParams`]. Exposes the
/// subscription API and is safe to use from any task.
#[derive(Clone)]
pub struct EventClient {
    inner: Arc<Inner>,
}

struct Inner {
    dispatcher: DispatcherHandle,
    params: ClientParams,
    permit_block_events: bool,
    connection_state: AtomicU8,
    stopped: AtomicBool,
    monitor_started: AtomicBool,
    after_connect: Mutex<Option<ConnectHook>>,
    before_reconnect: Mutex<Option<ConnectHook>>,
    connection_events: Mutex<Option<mpsc::Sender<ConnectionEvent>>>,
}

impl EventClient {
    /// Creates a client over the given dispatcher and starts the dispatcher.
    ///
    /// `permit_block_events` gates [`EventClient::register_block_event`];
    /// clients fed from a filtered stream are created with it off.
    ///
    /// # Errors
    ///
    /// Returns [`EventError::NotInInitialState`](ledgerstream_core::EventError::NotInInitialState)
    /// if the dispatcher was already started.
    pub fn new(
        permit_block_events: bool,
        mut dispatcher: Dispatcher,
        params: ClientParams,
    ) -> Result<Self, ClientError> {
        dispatcher.start()?;
        Ok(Self {
            inner: Arc::new(Inner {
                dispatcher: dispatcher.handle(),
                params,
                permit_block_events,
                connection_state: AtomicU8::new(ConnectionState::Disconnected as u8),
                stopped: AtomicBool::new(false),
                monitor_started: AtomicBool::new(false),
                after_connect: Mutex::new(None),
                before_reconnect: Mutex::new(None),
                connection_events: Mutex::new(None),
            }),
        })
    }

    // -- state --

    /// Returns the connection state.
    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.inner.connection_state.load(Ordering::Acquire))
    }

    /// Returns `true` once the client has been closed.
    #[must_use]
    pub fn stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// Returns the number of the last block observed by the dispatcher.
    #[must_use]
    pub fn last_block_num(&self) -> Option<u64> {
        self.inner.dispatcher.last_block_num()
    }

    fn transition(&self, current: ConnectionState, new: ConnectionState) -> bool {
        self.inner
            .connection_state
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn force_state(&self, new: ConnectionState) {
        self.inner
            .connection_state
            .store(new as u8, Ordering::Release);
    }

    // -- hooks and external feed --

    /// Registers a callback invoked after each successful transport connect,
    /// before the client reports `Connected`.
    pub fn set_after_connect_handler(
        &self,
        handler: impl Fn() -> Result<(), HookError> + Send + Sync + 'static,
    ) {
        *self.inner.after_connect.lock() = Some(Arc::new(handler));
    }

    /// Registers a callback invoked before each reconnect cycle.
    pub fn set_before_reconnect_handler(
        &self,
        handler: impl Fn() -> Result<(), HookError> + Send + Sync + 'static,
    ) {
        *self.inner.before_reconnect.lock() = Some(Arc::new(handler));
    }

    /// Attaches a channel that receives every connection transition the
    /// monitor observes. The channel is closed when the client closes.
    pub fn set_connection_event_channel(&self, sender: mpsc::Sender<ConnectionEvent>) {
        *self.inner.connection_events.lock() = Some(sender);
    }

    // -- connect / close --

    /// Connects to the event source.
    ///
    /// With `max_connect_attempts == 1` this is a single attempt; otherwise
    /// attempts are repeated up to the bound (`0` = unbounded), spaced at
    /// least one second apart.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] after close,
    /// [`ClientError::InvalidState`] when not disconnected,
    /// [`ClientError::AttemptsExceeded`] when the retry budget runs out, and
    /// any transport or hook failure from the final attempt.
    pub async fn connect(&self) -> Result<(), ClientError> {
        if self.inner.params.max_connect_attempts == 1 {
            self.connect_once().await
        } else {
            self.connect_with_retry(
                self.inner.params.max_connect_attempts,
                self.inner.params.time_between_connect_attempts,
            )
            .await
        }
    }

    /// Closes the client: disconnects, stops the dispatcher (closing every
    /// subscriber channel), and resets the connection state.
    ///
    /// Closing twice is a no-op.
    pub async fn close(&self) {
        debug!("attempting to close event client");
        if self
            .inner
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("client already stopped");
            return;
        }

        // Dropping the sender closes the external subscriber's channel.
        self.inner.connection_events.lock().take();

        debug!("sending disconnect request");
        let (reply, response) = oneshot::channel();
        if self
            .inner
            .dispatcher
            .submit(Event::Disconnect { reply })
            .await
            .is_ok()
        {
            match response.await {
                Ok(Err(err)) => warn!("disconnect request failed: {err}"),
                _ => debug!("disconnect request acknowledged"),
            }
        }

        debug!("stopping dispatcher");
        if let Err(err) = self.inner.dispatcher.stop().await {
            warn!("error stopping dispatcher: {err}");
        }

        self.force_state(ConnectionState::Disconnected);
        debug!("event client is stopped");
    }

    fn connect_once(&self) -> Pin<Box<dyn Future<Output = Result<(), ClientError>> + Send + '_>> {
        Box::pin(self.connect_once_inner())
    }

    async fn connect_once_inner(&self) -> Result<(), ClientError> {
        if self.stopped() {
            return Err(ClientError::Closed);
        }
        if !self.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(ClientError::InvalidState(self.connection_state()));
        }

        debug!("submitting connection request");
        if let Err(err) = self.inner.dispatcher.connect().await {
            debug!("connection request failed: {err}");
            self.force_state(ConnectionState::Disconnected);
            return Err(err.into());
        }

        // First successful connect only: install the internal connection
        // feed and the monitor task.
        if self
            .inner
            .monitor_started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            match self.inner.dispatcher.register_connection_event().await {
                Ok((_registration, events)) => {
                    let client = self.clone();
                    tokio::spawn(async move { client.monitor_connection(events).await });
                }
                Err(err) => {
                    error!("error registering for connection events: {err}");
                    self.close().await;
                    return Err(err.into());
                }
            }
        }

        let hook = self.inner.after_connect.lock().clone();
        if let Some(hook) = hook {
            if let Err(hook_err) = hook() {
                warn!("error invoking afterConnect handler: {hook_err}, disconnecting");
                let (reply, response) = oneshot::channel();
                if self
                    .inner
                    .dispatcher
                    .submit(Event::Disconnect { reply })
                    .await
                    .is_ok()
                {
                    match tokio::time::timeout(self.inner.params.response_timeout, response).await
                    {
                        Ok(Ok(Err(err))) => warn!("disconnect request failed: {err}"),
                        Ok(_) => debug!("disconnect request acknowledged"),
                        Err(_) => warn!("timed out waiting for disconnect response"),
                    }
                }
                self.transition(ConnectionState::Connecting, ConnectionState::Disconnected);
                return Err(ClientError::AfterConnect(hook_err));
            }
        }

        self.transition(ConnectionState::Connecting, ConnectionState::Connected);

        debug!("submitting connected event");
        let _ = self.inner.dispatcher.submit(Event::Connected).await;
        Ok(())
    }

    async fn connect_with_retry(
        &self,
        max_attempts: u32,
        time_between: Duration,
    ) -> Result<(), ClientError> {
        if self.stopped() {
            return Err(ClientError::Closed);
        }
        // Attempts are never spaced closer than a second.
        let time_between = time_between.max(Duration::from_secs(1));

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            debug!("connect attempt #{attempts}");
            match self.connect_once().await {
                Ok(()) => {
                    debug!("connect succeeded");
                    return Ok(());
                }
                Err(ClientError::Closed) => return Err(ClientError::Closed),
                Err(err) => {
                    warn!("connection attempt failed: {err}");
                    if max_attempts > 0 && attempts >= max_attempts {
                        warn!("maximum connect attempts exceeded");
                        return Err(ClientError::AttemptsExceeded);
                    }
                    tokio::time::sleep(time_between).await;
                }
            }
        }
    }

    // -- monitor / reconnect --

    async fn monitor_connection(self, mut events: mpsc::Receiver<ConnectionEvent>) {
        debug!("monitoring connection");
        while let Some(event) = events.recv().await {
            if self.stopped() {
                debug!("event client has been stopped");
                break;
            }

            let forward = self.inner.connection_events.lock().clone();
            if let Some(subscriber) = forward {
                debug!("forwarding connection event to subscriber");
                let _ = subscriber.send(event.clone()).await;
            }

            if event.connected {
                debug!("event client has connected");
            } else if self.inner.params.reconnect {
                warn!(
                    "event client has disconnected: {}",
                    event.error.as_deref().unwrap_or("unknown")
                );
                if self.transition(ConnectionState::Connected, ConnectionState::Disconnected) {
                    warn!("attempting to reconnect");
                    let client = self.clone();
                    tokio::spawn(async move { client.reconnect().await });
                } else if self
                    .transition(ConnectionState::Connecting, ConnectionState::Disconnected)
                {
                    debug!("reconnect already in progress");
                }
            } else {
                debug!("event client has disconnected, terminating");
                let client = self.clone();
                tokio::spawn(async move { client.close().await });
                break;
            }
        }
        debug!("exiting connection monitor");
    }

    async fn reconnect(self) {
        debug!(
            "waiting {:?} before attempting to reconnect event client",
            self.inner.params.reconnect_initial_delay
        );
        tokio::time::sleep(self.inner.params.reconnect_initial_delay).await;

        let hook = self.inner.before_reconnect.lock().clone();
        if let Some(hook) = hook {
            if let Err(err) = hook() {
                error!("error invoking beforeReconnect handler: {err}");
                return;
            }
        }

        if let Err(err) = self
            .connect_with_retry(
                self.inner.params.max_reconnect_attempts,
                self.inner.params.time_between_connect_attempts,
            )
            .await
        {
            warn!("could not reconnect event client: {err}, closing");
            self.close().await;
        }
    }

    // -- subscriptions --

    /// Registers for raw block events.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::BlockEventsNotPermitted`] when the client was
    /// created without block-event permission, and [`ClientError::Closed`]
    /// after close.
    pub async fn register_block_event(
        &self,
        filter: Option<BlockFilter>,
    ) -> Result<(Registration, mpsc::Receiver<BlockEvent>), ClientError> {
        if !self.inner.permit_block_events {
            return Err(ClientError::BlockEventsNotPermitted);
        }
        self.ensure_open()?;
        Ok(self.inner.dispatcher.register_block_event(filter).await?)
    }

    /// Registers for filtered block events.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] after close.
    pub async fn register_filtered_block_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<FilteredBlockEvent>), ClientError> {
        self.ensure_open()?;
        Ok(self.inner.dispatcher.register_filtered_block_event().await?)
    }

    /// Registers for the commit status of one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] after close and the dispatcher's
    /// rejection for duplicate tx ids.
    pub async fn register_tx_status_event(
        &self,
        tx_id: impl Into<String> + Send,
    ) -> Result<(Registration, mpsc::Receiver<TxStatusEvent>), ClientError> {
        self.ensure_open()?;
        Ok(self.inner.dispatcher.register_tx_status_event(tx_id).await?)
    }

    /// Registers for chaincode events matching an event-name filter.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] after close and the dispatcher's
    /// rejection for bad filters or duplicate keys.
    pub async fn register_chaincode_event(
        &self,
        chaincode_id: impl Into<String> + Send,
        event_filter: impl Into<String> + Send,
    ) -> Result<(Registration, mpsc::Receiver<ChaincodeEvent>), ClientError> {
        self.ensure_open()?;
        Ok(self
            .inner
            .dispatcher
            .register_chaincode_event(chaincode_id, event_filter)
            .await?)
    }

    /// Registers for connection transitions.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Closed`] after close.
    pub async fn register_connection_event(
        &self,
    ) -> Result<(Registration, mpsc::Receiver<ConnectionEvent>), ClientError> {
        self.ensure_open()?;
        Ok(self.inner.dispatcher.register_connection_event().await?)
    }

    /// Removes a subscription; its channel closes once the dispatcher
    /// processes the removal.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Dispatcher`] when the dispatcher is no longer
    /// running.
    pub async fn unregister(&self, registration: Registration) -> Result<(), ClientError> {
        Ok(self.inner.dispatcher.unregister(registration).await?)
    }

    fn ensure_open(&self) -> Result<(), ClientError> {
        if self.stopped() {
            return Err(ClientError::Closed);
        }
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use ledgerstream_core::testing::MockTransport;
    use ledgerstream_core::{DispatcherConfig, EventError};

    const RECV_TIMEOUT: Duration = Duration::from_secs(5);

    fn new_client(permit_block_events: bool, params: ClientParams) -> (EventClient, MockTransport) {
        let transport = MockTransport::new();
        let dispatcher = Dispatcher::new(DispatcherConfig::default(), Box::new(transport.clone()));
        let client = EventClient::new(permit_block_events, dispatcher, params).unwrap();
        (client, transport)
    }

    async fn recv<T>(rx: &mut mpsc::Receiver<T>) -> T {
        tokio::time::timeout(RECV_TIMEOUT, rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed")
    }

    // -- connect tests --

    #[tokio::test]
    async fn test_connect_transitions_to_connected() {
        let (client, transport) = new_client(true, ClientParams::default());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        client.connect().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
        assert_eq!(transport.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (client, _transport) = new_client(true, ClientParams::default());
        client.connect().await.unwrap();

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidState(ConnectionState::Connected)));
    }

    #[tokio::test]
    async fn test_connect_after_close_fails() {
        let (client, _transport) = new_client(true, ClientParams::default());
        client.close().await;
        assert!(matches!(client.connect().await, Err(ClientError::Closed)));
    }

    #[tokio::test]
    async fn test_connect_failure_resets_state() {
        let (client, transport) = new_client(true, ClientParams::default());
        transport.script_connect(Err("peer unreachable"));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Dispatcher(EventError::Transport(_))
        ));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        // A later attempt can still go through.
        client.connect().await.unwrap();
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_with_retry_succeeds_after_failure() {
        let params = ClientParams {
            max_connect_attempts: 3,
            time_between_connect_attempts: Duration::from_millis(1),
            ..ClientParams::default()
        };
        let (client, transport) = new_client(true, params);
        transport.script_connect(Err("peer unreachable"));

        client.connect().await.unwrap();
        // One failed attempt, then success; the sub-second spacing was
        // clamped up to a full second in between.
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_connect_retry_budget_exhausted() {
        let params = ClientParams {
            max_connect_attempts: 2,
            ..ClientParams::default()
        };
        let (client, transport) = new_client(true, params);
        transport.fail_connects("peer unreachable");

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::AttemptsExceeded));
        assert_eq!(transport.connect_count(), 2);
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    // -- hook tests --

    #[tokio::test]
    async fn test_after_connect_hook_runs_before_connected() {
        let (client, _transport) = new_client(true, ClientParams::default());

        let calls = Arc::new(AtomicUsize::new(0));
        let hook_calls = Arc::clone(&calls);
        client.set_after_connect_handler(move || {
            hook_calls.fetch_add(1, Ordering::Relaxed);
            Ok(())
        });

        client.connect().await.unwrap();
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(client.connection_state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_after_connect_hook_failure_disconnects() {
        let (client, transport) = new_client(true, ClientParams::default());
        client.set_after_connect_handler(|| Err("seek request failed".into()));

        let err = client.connect().await.unwrap_err();
        assert!(matches!(err, ClientError::AfterConnect(_)));
        assert!(err.to_string().contains("seek request failed"));
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
        assert_eq!(transport.disconnect_count(), 1);
        assert!(!client.stopped());
    }

    // -- permission tests --

    #[tokio::test]
    async fn test_block_events_not_permitted() {
        let (client, _transport) = new_client(false, ClientParams::default());
        client.connect().await.unwrap();

        let err = client.register_block_event(None).await.unwrap_err();
        assert!(matches!(err, ClientError::BlockEventsNotPermitted));

        // Filtered subscriptions are unaffected by the block permission.
        assert!(client.register_filtered_block_event().await.is_ok());
    }

    // -- close tests --

    #[tokio::test]
    async fn test_close_is_idempotent_and_closes_subscriptions() {
        let (client, _transport) = new_client(true, ClientParams::default());
        client.connect().await.unwrap();

        let (_reg, mut rx) = client.register_filtered_block_event().await.unwrap();

        client.close().await;
        assert!(client.stopped());
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);

        let closed = tokio::time::timeout(RECV_TIMEOUT, rx.recv()).await.unwrap();
        assert!(closed.is_none());

        // Second close observes the stopped flag and does nothing.
        client.close().await;
        assert!(client.stopped());
    }

    #[tokio::test]
    async fn test_register_after_close_fails() {
        let (client, _transport) = new_client(true, ClientParams::default());
        client.close().await;

        assert!(matches!(
            client.register_filtered_block_event().await,
            Err(ClientError::Closed)
        ));
        assert!(matches!(
            client.register_tx_status_event("tx1").await,
            Err(ClientError::Closed)
        ));
    }

    // -- connection feed tests --

    #[tokio::test]
    async fn test_connection_event_subscribers_observe_connect() {
        let (client, _transport) = new_client(true, ClientParams::default());
        let (_reg, mut rx) = client.register_connection_event().await.unwrap();

        client.connect().await.unwrap();

        let event = recv(&mut rx).await;
        assert!(event.connected);
        assert!(event.error.is_none());
    }

    #[tokio::test]
    async fn test_external_connection_event_channel_forwarded() {
        let (client, _transport) = new_client(true, ClientParams::default());

        let (tx, mut rx) = mpsc::channel(10);
        client.set_connection_event_channel(tx);

        client.connect().await.unwrap();

        let event = recv(&mut rx).await;
        assert!(event.connected);
    }
}
