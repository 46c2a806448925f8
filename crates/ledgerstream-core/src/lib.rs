//! # `ledgerstream` Core
//!
//! The event-dispatch core of the `ledgerstream` client, delivering ledger
//! events (blocks, filtered blocks, transaction statuses, and chaincode
//! events) to in-process subscribers over typed channels.
//!
//! This crate provides:
//! - **Dispatcher**: Single-consumer event pump that owns all subscription
//!   state and all fan-out decisions
//! - **Ledger model**: Blocks, filtered blocks, and the block → filtered-block
//!   derivation
//! - **Registrations**: Opaque subscription handles with per-subscriber
//!   delivery channels
//! - **Transport contract**: The narrow adapter interface through which a
//!   concrete stream implementation feeds the dispatcher
//!
//! ## Design Principles
//!
//! 1. **No locks on subscription state** - All registration tables are
//!    confined to the dispatch loop
//! 2. **Total event order** - Events are processed in the order they are
//!    accepted into the inbox
//! 3. **Slow subscribers never corrupt order** - Per-subscriber delivery
//!    policy drops, it never reorders

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod block;
pub mod dispatcher;
pub mod error;
pub mod event;
pub mod registration;
pub mod testing;
pub mod transport;

pub use dispatcher::{
    DeliveryPolicy, Dispatcher, DispatcherConfig, DispatcherHandle, DispatcherState, Event,
};
pub use error::EventError;
