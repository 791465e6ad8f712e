//! Generic instruments described by command templates.
//!
//! An [`Instrument`] is a named collection of knob and meter channels reachable through
//! one [`ChannelHandle`]. Each knob is described by a set template such as
//! `"VOLT {value}"` (formatted with `strfmt`) and an optional read-back query; each meter
//! by a query such as `"MEAS:CURR?"`. No instrument-specific protocol lives here.
//!
//! Presets are applied by [`Instrument::connect`], postsets by
//! [`Instrument::disconnect`].

use crate::adapters::{ChannelHandle, Validator};
use crate::core::Value;
use crate::error::{AppResult, DaqError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
struct KnobCommands {
    set: String,
    get: Option<String>,
}

#[derive(Clone)]
struct MeterCommand {
    query: String,
    validator: Option<Validator>,
}

/// Builder for [`Instrument`]
pub struct InstrumentBuilder {
    name: String,
    channel: ChannelHandle,
    knobs: HashMap<String, KnobCommands>,
    meters: HashMap<String, MeterCommand>,
    presets: Vec<(String, Value)>,
    postsets: Vec<(String, Value)>,
}

impl InstrumentBuilder {
    /// Declare a knob; `set` must contain a `{value}` placeholder.
    pub fn knob(mut self, name: &str, set: &str, get: Option<&str>) -> Self {
        self.knobs.insert(
            name.to_string(),
            KnobCommands {
                set: set.to_string(),
                get: get.map(str::to_string),
            },
        );
        self
    }

    pub fn meter(mut self, name: &str, query: &str) -> Self {
        self.meters.insert(
            name.to_string(),
            MeterCommand {
                query: query.to_string(),
                validator: None,
            },
        );
        self
    }

    /// Declare a meter whose responses must pass `validator`.
    pub fn meter_with_validator(mut self, name: &str, query: &str, validator: Validator) -> Self {
        self.meters.insert(
            name.to_string(),
            MeterCommand {
                query: query.to_string(),
                validator: Some(validator),
            },
        );
        self
    }

    pub fn preset(mut self, knob: &str, value: impl Into<Value>) -> Self {
        self.presets.push((knob.to_string(), value.into()));
        self
    }

    pub fn postset(mut self, knob: &str, value: impl Into<Value>) -> Self {
        self.postsets.push((knob.to_string(), value.into()));
        self
    }

    pub fn build(self) -> AppResult<Arc<Instrument>> {
        for (knob, commands) in &self.knobs {
            if !commands.set.contains("{value}") {
                return Err(DaqError::Configuration(format!(
                    "instrument '{}': set command for knob '{}' has no {{value}} placeholder",
                    self.name, knob
                )));
            }
        }
        for (knob, _) in self.presets.iter().chain(self.postsets.iter()) {
            if !self.knobs.contains_key(knob) {
                return Err(DaqError::Configuration(format!(
                    "instrument '{}': preset/postset for unknown knob '{}'",
                    self.name, knob
                )));
            }
        }

        Ok(Arc::new(Instrument {
            name: self.name,
            channel: self.channel,
            knobs: self.knobs,
            meters: self.meters,
            presets: self.presets,
            postsets: self.postsets,
            applied_presets: Mutex::new(HashMap::new()),
        }))
    }
}

/// A named set of knob and meter channels on one communication channel.
pub struct Instrument {
    name: String,
    channel: ChannelHandle,
    knobs: HashMap<String, KnobCommands>,
    meters: HashMap<String, MeterCommand>,
    presets: Vec<(String, Value)>,
    postsets: Vec<(String, Value)>,
    applied_presets: Mutex<HashMap<String, Value>>,
}

impl std::fmt::Debug for Instrument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instrument")
            .field("name", &self.name)
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}

impl Instrument {
    pub fn builder(name: impl Into<String>, channel: ChannelHandle) -> InstrumentBuilder {
        InstrumentBuilder {
            name: name.into(),
            channel,
            knobs: HashMap::new(),
            meters: HashMap::new(),
            presets: Vec::new(),
            postsets: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn channel(&self) -> &ChannelHandle {
        &self.channel
    }

    pub fn has_knob(&self, knob: &str) -> bool {
        self.knobs.contains_key(knob)
    }

    pub fn has_meter(&self, meter: &str) -> bool {
        self.meters.contains_key(meter)
    }

    fn knob_commands(&self, knob: &str) -> AppResult<&KnobCommands> {
        self.knobs.get(knob).ok_or_else(|| {
            DaqError::Configuration(format!("instrument '{}' has no knob '{}'", self.name, knob))
        })
    }

    /// Formats and sends the set command for `knob`.
    pub async fn set_knob(&self, knob: &str, raw: &Value) -> AppResult<()> {
        let commands = self.knob_commands(knob)?;
        let mut vars = HashMap::new();
        vars.insert("value".to_string(), raw.to_string());
        let command = strfmt::strfmt(&commands.set, &vars).map_err(|e| {
            DaqError::Configuration(format!(
                "instrument '{}': bad template {:?}: {}",
                self.name, commands.set, e
            ))
        })?;
        debug!(instrument = %self.name, knob, command = %command, "Setting knob");
        self.channel.write(&command).await
    }

    /// Reads a knob's current setting if the knob declares a read-back query.
    pub async fn read_knob(&self, knob: &str) -> AppResult<Option<Value>> {
        match &self.knob_commands(knob)?.get {
            Some(query) => {
                let response = self.channel.query(query, None).await?;
                Value::recast(&response).map(Some)
            }
            None => Ok(None),
        }
    }

    /// Issues the meter's query and recasts the response.
    pub async fn measure(&self, meter: &str) -> AppResult<Value> {
        let command = self.meters.get(meter).ok_or_else(|| {
            DaqError::Configuration(format!("instrument '{}' has no meter '{}'", self.name, meter))
        })?;
        let response = self
            .channel
            .query(&command.query, command.validator.clone())
            .await?;
        Value::recast(&response)
    }

    /// Opens the channel and applies presets in declaration order.
    pub async fn connect(&self) -> AppResult<()> {
        self.channel.connect().await?;
        for (knob, value) in &self.presets {
            self.set_knob(knob, value).await?;
            self.applied_presets.lock().insert(knob.clone(), value.clone());
        }
        info!(instrument = %self.name, presets = self.presets.len(), "Instrument connected");
        Ok(())
    }

    /// The preset value applied to `knob` on connect, if any.
    pub fn preset_for(&self, knob: &str) -> Option<Value> {
        self.applied_presets.lock().get(knob).cloned()
    }

    /// Applies postsets and closes the channel. Postset failures are collected.
    pub async fn disconnect(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        for (knob, value) in &self.postsets {
            if let Err(err) = self.set_knob(knob, value).await {
                warn!(instrument = %self.name, knob = %knob, error = %err, "Postset failed");
                errors.push(err);
            }
        }
        self.channel.shutdown().await?;
        info!(instrument = %self.name, "Instrument disconnected");

        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }
}
