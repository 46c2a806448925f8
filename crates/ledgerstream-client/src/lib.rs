//! # `ledgerstream` Client
//!
//! The connection-owning half of the `ledgerstream` event client. Wraps a
//! [`ledgerstream_core::Dispatcher`] with:
//!
//! - **Connection state machine**: Lock-free `Disconnected → Connecting →
//!   Connected` transitions via atomic compare-and-swap
//! - **Retry**: Bounded or unbounded connect attempts with a minimum spacing
//!   of one second
//! - **Monitor task**: A single long-lived task watching the connection feed
//!   and driving reconnection
//! - **Hooks**: User callbacks after connect and before reconnect
//!
//! Subscription requests (blocks, filtered blocks, transaction statuses,
//! chaincode events, connection transitions) proxy through the dispatcher
//! and refuse new work once the client is closed.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod error;

pub use client::{ConnectHook, ConnectionState, EventClient};
pub use config::ClientParams;
pub use error::{ClientError, HookError};
