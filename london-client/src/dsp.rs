//! High-level DSP API.

use crate::config::Config;
use crate::context::Context;
use crate::error::ClientError;
use crate::pool::{ConnectionPool, PoolOptions, TcpPool};
use crate::transaction::{self, TransactionConfig};
use london_protocol::{
    parse_mute, parse_polarity, parse_volume, switch_payload, volume_payload, Block, Command,
    ProtocolError, StateVariable, Units, DEFAULT_PORT, DEVICE_VOLUME_OFFSET,
    MIN_SUBSCRIBE_INTERVAL, PAYLOAD_LEN,
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

/// Appends `port` to `address` unless it already names one.
pub fn with_default_port(address: &str, port: u16) -> String {
    if address.parse::<SocketAddr>().is_ok() {
        return address.to_string();
    }

    let bare = address.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
        return SocketAddr::new(ip, port).to_string();
    }

    match address.rsplit_once(':') {
        Some((host, p)) if !host.contains(':') && p.parse::<u16>().is_ok() => address.to_string(),
        _ => format!("{}:{}", address, port),
    }
}

/// Handle to a single BSS London DSP.
///
/// The handle owns its pool; clones share it. Every operation checks a
/// connection out for the length of one transaction only.
pub struct Dsp<P: ConnectionPool = TcpPool> {
    address: String,
    pool: Arc<P>,
    transaction: TransactionConfig,
    subscribe_interval: u32,
    volume_offset: i32,
}

impl<P: ConnectionPool> Clone for Dsp<P> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            pool: self.pool.clone(),
            transaction: self.transaction,
            subscribe_interval: self.subscribe_interval,
            volume_offset: self.volume_offset,
        }
    }
}

impl<P: ConnectionPool> std::fmt::Debug for Dsp<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dsp")
            .field("address", &self.address)
            .field("transaction", &self.transaction)
            .field("subscribe_interval", &self.subscribe_interval)
            .field("volume_offset", &self.volume_offset)
            .finish_non_exhaustive()
    }
}

impl Dsp<TcpPool> {
    /// Creates a handle for the device at `address`, using port 1023 if none is given.
    pub fn new(address: &str) -> Self {
        let address = with_default_port(address, DEFAULT_PORT);
        let pool = TcpPool::new(PoolOptions::new(address.clone()));
        Self::with_pool(address, Arc::new(pool))
    }

    /// Creates a handle from a validated configuration.
    pub fn from_config(config: &Config) -> Result<Self, ClientError> {
        config
            .validate()
            .map_err(|e| ClientError::Config(e.to_string()))?;

        let pool = TcpPool::new(config.pool_options());
        Ok(Self::with_pool(config.device_addr(), Arc::new(pool))
            .with_transaction_config(config.transaction_config())
            .with_subscribe_interval(config.protocol.subscribe_interval_ms)
            .with_volume_offset(config.protocol.volume_offset))
    }
}

impl<P: ConnectionPool> Dsp<P> {
    /// Creates a handle that checks connections out of `pool`.
    pub fn with_pool(address: impl Into<String>, pool: Arc<P>) -> Self {
        Self {
            address: address.into(),
            pool,
            transaction: TransactionConfig::default(),
            subscribe_interval: MIN_SUBSCRIBE_INTERVAL,
            volume_offset: DEVICE_VOLUME_OFFSET,
        }
    }

    pub fn with_transaction_config(mut self, config: TransactionConfig) -> Self {
        self.transaction = config;
        self
    }

    /// Sets the interval requested by subscribe commands. Values below
    /// 50ms make every read fail with `InvalidArgument`.
    pub fn with_subscribe_interval(mut self, interval_ms: u32) -> Self {
        self.subscribe_interval = interval_ms;
        self
    }

    /// Sets the correction added to decoded volume levels.
    pub fn with_volume_offset(mut self, offset: i32) -> Self {
        self.volume_offset = offset;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn pool(&self) -> &Arc<P> {
        &self.pool
    }

    pub fn transaction_config(&self) -> &TransactionConfig {
        &self.transaction
    }

    // =========================================================================
    // Mute
    // =========================================================================

    /// Returns whether `block` is muted.
    pub async fn get_mute(&self, ctx: &Context, block: &str) -> Result<bool, ClientError> {
        let state = self
            .get_state(ctx, Units::Absolute, StateVariable::Mute, block)
            .await?;
        let muted = parse_mute(&state)?;
        tracing::info!("{} mute on {} is {}", self.address, block, muted);
        Ok(muted)
    }

    /// Mutes or unmutes `block`.
    pub async fn set_mute(&self, ctx: &Context, block: &str, muted: bool) -> Result<(), ClientError> {
        self.set_state(ctx, Units::Absolute, StateVariable::Mute, block, switch_payload(muted))
            .await?;
        tracing::info!("{} mute on {} set to {}", self.address, block, muted);
        Ok(())
    }

    // =========================================================================
    // Volume
    // =========================================================================

    /// Returns the gain of `block` as a percentage.
    pub async fn get_volume(&self, ctx: &Context, block: &str) -> Result<u8, ClientError> {
        let state = self
            .get_state(ctx, Units::Percent, StateVariable::Gain, block)
            .await?;
        let level = parse_volume(&state, self.volume_offset)?;
        tracing::info!("{} volume on {} is {}", self.address, block, level);
        Ok(level)
    }

    /// Sets the gain of `block` as a percentage (0-100).
    pub async fn set_volume(&self, ctx: &Context, block: &str, level: u8) -> Result<(), ClientError> {
        let payload = volume_payload(level)?;
        self.set_state(ctx, Units::Percent, StateVariable::Gain, block, payload)
            .await?;
        tracing::info!("{} volume on {} set to {}", self.address, block, level);
        Ok(())
    }

    // =========================================================================
    // Polarity
    // =========================================================================

    /// Returns whether the polarity of `block` is inverted.
    pub async fn get_polarity(&self, ctx: &Context, block: &str) -> Result<bool, ClientError> {
        let state = self
            .get_state(ctx, Units::Absolute, StateVariable::Polarity, block)
            .await?;
        let inverted = parse_polarity(&state)?;
        tracing::info!("{} polarity on {} is {}", self.address, block, inverted);
        Ok(inverted)
    }

    /// Inverts or restores the polarity of `block`.
    pub async fn set_polarity(
        &self,
        ctx: &Context,
        block: &str,
        inverted: bool,
    ) -> Result<(), ClientError> {
        self.set_state(
            ctx,
            Units::Absolute,
            StateVariable::Polarity,
            block,
            switch_payload(inverted),
        )
        .await?;
        tracing::info!("{} polarity on {} set to {}", self.address, block, inverted);
        Ok(())
    }

    // =========================================================================
    // Raw state access
    // =========================================================================

    /// Reads a state variable and returns its raw 4-byte value.
    pub async fn get_state(
        &self,
        ctx: &Context,
        units: Units,
        state: StateVariable,
        block: &str,
    ) -> Result<[u8; PAYLOAD_LEN], ClientError> {
        let block: Block = block.parse()?;
        let subscribe = Command::subscribe(units, state, block, self.subscribe_interval)?.encode()?;
        let unsubscribe = Command::unsubscribe(units, state, block).encode()?;

        let payload = transaction::read(
            self.pool.as_ref(),
            self.transaction,
            ctx,
            &subscribe,
            &unsubscribe,
        )
        .await?;

        let value = payload
            .len()
            .checked_sub(PAYLOAD_LEN)
            .and_then(|start| <[u8; PAYLOAD_LEN]>::try_from(&payload[start..]).ok())
            .ok_or_else(|| {
                ProtocolError::InvalidResponse(format!(
                    "{} response from {} has {} bytes, expected at least {}",
                    state,
                    block,
                    payload.len(),
                    PAYLOAD_LEN
                ))
            })?;
        Ok(value)
    }

    /// Writes a raw 4-byte value to a state variable.
    pub async fn set_state(
        &self,
        ctx: &Context,
        units: Units,
        state: StateVariable,
        block: &str,
        value: [u8; PAYLOAD_LEN],
    ) -> Result<(), ClientError> {
        let block: Block = block.parse()?;
        let command = Command::set(units, state, block, value).encode()?;

        transaction::write(self.pool.as_ref(), self.transaction, ctx, &command).await
    }
}
