//! Publishes `compute.instance.exists.verified.old` events for verified
//! exists records through a pooled broker channel.

use std::collections::BTreeSet;

use exists_verifier_core::ExistsRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::debug;
use uuid::Uuid;

mod http;

pub use http::{BrokerSettings, HttpChannel, HttpTransport};

pub const VERIFIED_EVENT_TYPE: &str = "compute.instance.exists.verified.old";

#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("stored raw message is malformed: {0}")]
    RawMessage(#[from] serde_json::Error),
    #[error("stored raw message has no message_id")]
    MissingMessageId,
    #[error("broker transport error: {0}")]
    Transport(String),
    #[error("invalid broker address: {0}")]
    BrokerAddress(String),
    #[error("broker rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    Topic,
}

impl ExchangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl Exchange {
    #[must_use]
    pub fn topic(name: &str, durable: bool) -> Self {
        Self { name: name.to_string(), kind: ExchangeKind::Topic, durable }
    }
}

/// A broker connection able to hand out publishing channels.
pub trait Transport: Send + Sync {
    type Channel: Channel;

    /// # Errors
    /// Returns a [`NotifyError`] when the broker cannot be reached.
    fn open_channel(&self) -> Result<Self::Channel, NotifyError>;
}

pub trait Channel: Send {
    /// Declare `exchange`; declaring an existing exchange with the same
    /// settings must succeed.
    ///
    /// # Errors
    /// Returns a [`NotifyError`] when the broker refuses the declaration.
    fn declare_exchange(&mut self, exchange: &Exchange) -> Result<(), NotifyError>;

    /// # Errors
    /// Returns a [`NotifyError`] when the message cannot be published.
    fn publish(
        &mut self,
        exchange: &Exchange,
        routing_key: &str,
        body: &Value,
    ) -> Result<(), NotifyError>;
}

/// Reusable channels over one transport, plus the set of exchanges already
/// declared through it.
pub struct ProducerPool<T: Transport> {
    transport: T,
    idle: Mutex<Vec<T::Channel>>,
    declared: Mutex<BTreeSet<String>>,
}

impl<T: Transport> ProducerPool<T> {
    #[must_use]
    pub fn new(transport: T) -> Self {
        Self { transport, idle: Mutex::new(Vec::new()), declared: Mutex::new(BTreeSet::new()) }
    }

    /// Borrow an idle channel, opening a new one when none is free. The
    /// channel goes back to the pool when the guard drops.
    ///
    /// # Errors
    /// Returns a [`NotifyError`] when a new channel cannot be opened.
    pub fn acquire(&self) -> Result<PooledProducer<'_, T>, NotifyError> {
        let idle = self.idle.lock().pop();
        let channel = match idle {
            Some(channel) => channel,
            None => self.transport.open_channel()?,
        };
        Ok(PooledProducer { pool: self, channel: Some(channel), poisoned: false })
    }

    #[cfg(test)]
    fn idle_channels(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A channel on loan from a [`ProducerPool`]. Channels that saw an error are
/// discarded instead of being returned.
pub struct PooledProducer<'a, T: Transport> {
    pool: &'a ProducerPool<T>,
    channel: Option<T::Channel>,
    poisoned: bool,
}

impl<T: Transport> PooledProducer<'_, T> {
    /// Declare `exchange` unless this pool already declared it.
    ///
    /// # Errors
    /// Returns a [`NotifyError`] when the declaration fails.
    pub fn maybe_declare(&mut self, exchange: &Exchange) -> Result<(), NotifyError> {
        if self.pool.declared.lock().contains(&exchange.name) {
            return Ok(());
        }
        let result = match self.channel.as_mut() {
            Some(channel) => channel.declare_exchange(exchange),
            None => Err(NotifyError::Transport("producer channel already released".to_string())),
        };
        match result {
            Ok(()) => {
                self.pool.declared.lock().insert(exchange.name.clone());
                Ok(())
            }
            Err(err) => {
                self.poisoned = true;
                Err(err)
            }
        }
    }

    /// # Errors
    /// Returns a [`NotifyError`] when the publish fails.
    pub fn publish(
        &mut self,
        exchange: &Exchange,
        routing_key: &str,
        body: &Value,
    ) -> Result<(), NotifyError> {
        let result = match self.channel.as_mut() {
            Some(channel) => channel.publish(exchange, routing_key, body),
            None => Err(NotifyError::Transport("producer channel already released".to_string())),
        };
        if result.is_err() {
            self.poisoned = true;
            // The broker may have dropped the exchange along with the channel.
            self.pool.declared.lock().remove(&exchange.name);
        }
        result
    }
}

impl<T: Transport> Drop for PooledProducer<'_, T> {
    fn drop(&mut self) {
        if self.poisoned {
            return;
        }
        if let Some(channel) = self.channel.take() {
            self.pool.idle.lock().push(channel);
        }
    }
}

/// Build the verified event for a record whose originating message had
/// `original_message_id`. Every call mints a new `message_id`.
#[must_use]
pub fn verified_message(original_message_id: &str) -> Value {
    json!({
        "event_type": VERIFIED_EVENT_TYPE,
        "message_id": Uuid::new_v4().to_string(),
        "original_message_id": original_message_id,
    })
}

/// Announce that `exist` was verified, once per routing key.
///
/// `routing_keys` defaults to the routing key the original message arrived
/// on. Returns the number of messages published.
///
/// # Errors
/// Returns a [`NotifyError`] when the stored raw message cannot be decoded or
/// any declare or publish fails; keys after the failing one are not sent.
pub fn send_verified_notification<T: Transport>(
    exist: &ExistsRecord,
    exchange: &Exchange,
    producers: &ProducerPool<T>,
    routing_keys: Option<&[String]>,
) -> Result<usize, NotifyError> {
    let raw = exist.raw_message()?;
    let original_message_id = raw.message_id().ok_or(NotifyError::MissingMessageId)?;

    let default_keys = [raw.routing_key.clone()];
    let routing_keys = routing_keys.unwrap_or(&default_keys);

    for routing_key in routing_keys {
        let mut producer = producers.acquire()?;
        producer.maybe_declare(exchange)?;
        let message = verified_message(original_message_id);
        producer.publish(exchange, routing_key, &message)?;
        debug!(
            exists_id = exist.id,
            routing_key = %routing_key,
            message_id = message["message_id"].as_str(),
            "published verified notification"
        );
    }
    Ok(routing_keys.len())
}
