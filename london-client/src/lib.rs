//! # london-client
//!
//! Client library for BSS London DSPs.
//!
//! This crate provides:
//! - Pooled TCP connections with idle eviction and reuse pacing
//! - A transaction coordinator with per-step deadlines and cancellation
//! - A high-level [`Dsp`] handle for mute, volume and polarity
//! - YAML/environment configuration

pub mod config;
pub mod connection;
pub mod context;
pub mod dsp;
pub mod error;
pub mod pool;
pub mod transaction;

#[cfg(test)]
pub(crate) mod mock;

pub use config::{Config, ConfigError};
pub use connection::{DeviceConnection, TcpConnection};
pub use context::{Context, Interrupt};
pub use dsp::Dsp;
pub use error::{ClientError, Step};
pub use pool::{ConnectionPool, PoolOptions, PooledConnection, TcpPool};
pub use transaction::{Transaction, TransactionConfig, TransactionState};

pub use tokio_util::sync::CancellationToken;
