//! Variables proxied from another engine's socket server.
//!
//! The remote side speaks a line protocol (see [`SocketServer`](crate::server::SocketServer)):
//!
//! ```text
//! -> power settable?      <- power settable | power read-only
//! -> power ?              <- power 1.25
//! -> power 2.0            <- power 2.0
//! ```
//!
//! Any response starting with `Error` fails validation and is retried through the
//! channel's policy like any other bad response.

use super::{coerce, Affine};
use crate::adapters::{ChannelHandle, Validator};
use crate::core::{Value, ValueKind};
use crate::error::{AppResult, DaqError};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Proxy for a variable named `alias` on another engine.
#[derive(Debug)]
pub struct Remote {
    name: String,
    alias: String,
    channel: ChannelHandle,
    kind: Option<ValueKind>,
    transform: Affine,
    settable: AtomicBool,
    cache: RwLock<Option<Value>>,
}

impl Remote {
    pub fn new(name: impl Into<String>, alias: impl Into<String>, channel: ChannelHandle) -> Self {
        Self {
            name: name.into(),
            alias: alias.into(),
            channel,
            kind: None,
            transform: Affine::default(),
            settable: AtomicBool::new(false),
            cache: RwLock::new(None),
        }
    }

    pub fn with_kind(mut self, kind: ValueKind) -> Self {
        self.kind = Some(kind);
        self
    }

    pub fn with_transform(mut self, transform: Affine) -> Self {
        self.transform = transform;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    /// Known only after [`connect`](Self::connect); false until then.
    pub fn is_settable(&self) -> bool {
        self.settable.load(Ordering::SeqCst)
    }

    pub fn cached(&self) -> Option<Value> {
        self.cache.read().clone()
    }

    fn reply_validator(&self) -> Validator {
        let prefix = format!("{} ", self.alias);
        Arc::new(move |response: &str| {
            !response.starts_with("Error") && response.starts_with(&prefix)
        })
    }

    fn payload<'a>(&self, response: &'a str) -> &'a str {
        response[self.alias.len()..].trim()
    }

    /// Opens the channel and asks the remote whether the variable accepts writes.
    pub async fn connect(&self) -> AppResult<()> {
        self.channel.connect().await?;
        let response = self
            .channel
            .query(&format!("{} settable?", self.alias), Some(self.reply_validator()))
            .await?;
        let settable = match self.payload(&response) {
            "settable" => true,
            "read-only" => false,
            other => {
                return Err(DaqError::Validation {
                    channel: self.channel.name().to_string(),
                    response: other.to_string(),
                })
            }
        };
        self.settable.store(settable, Ordering::SeqCst);
        info!(variable = %self.name, alias = %self.alias, settable, "Remote connected");
        Ok(())
    }

    fn accept(&self, response: &str) -> AppResult<Value> {
        let raw = coerce(Value::recast(self.payload(response))?, self.kind)?;
        let value = self.transform.to_physical(raw)?;
        *self.cache.write() = Some(value.clone());
        Ok(value)
    }

    pub async fn get(&self) -> AppResult<Value> {
        let response = self
            .channel
            .query(&format!("{} ?", self.alias), Some(self.reply_validator()))
            .await?;
        self.accept(&response)
    }

    /// Sends `value` and caches the value the remote reports as accepted.
    pub async fn set(&self, value: Value) -> AppResult<Value> {
        if !self.is_settable() {
            return Err(DaqError::NotSettable(self.name.clone()));
        }
        let raw = self.transform.to_raw(coerce(value, self.kind)?)?;
        let response = self
            .channel
            .query(&format!("{} {}", self.alias, raw), Some(self.reply_validator()))
            .await?;
        let accepted = self.accept(&response)?;
        debug!(variable = %self.name, value = %accepted, "Remote set");
        Ok(accepted)
    }
}
