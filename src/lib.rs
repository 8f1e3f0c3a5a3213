//! im-relay：1对1私信的实时投递核心
//! im-relay: the real-time delivery core for 1:1 private messaging
//!
//! The crate keeps authoritative message storage behind the [`repo`] traits
//! and layers everything latency-sensitive on a fast key-value store:
//! presence, per-recipient offline queues, conversation caches and unread
//! counters. Live connections enter through the [`ws`] edge and are tracked
//! by the [`server::ConnectionRegistry`].

pub mod config;
pub mod domain;
pub mod error;
pub mod repo;
pub mod server;
pub mod service;
pub mod store;
pub mod tasks;
pub mod ws;

pub use error::RelayError;
pub use server::{ConnHandle, ConnectionRegistry, DeliveryOutcome, RelayContext};
