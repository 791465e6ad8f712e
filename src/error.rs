//! Custom error types for the engine.
//!
//! This module defines the primary error type, `DaqError`, shared by every layer of the
//! experiment engine. Using the `thiserror` crate, it provides a centralized and consistent
//! way to report failures, from instrument communication problems to malformed experiment
//! definitions.
//!
//! ## Error Hierarchy
//!
//! - **`Communication`**: the adapter layer exhausted both its retry and reconnect budgets
//!   for one operation on a channel. Isolated to the affected variable for that iteration
//!   unless the scheduler is configured to treat it as fatal.
//! - **`Validation`**: a validator rejected a raw response. Inside the adapter layer this is
//!   a retryable failure and normally never escapes it.
//! - **`NotSettable`**: `set()` was called on a read-only variable.
//! - **`Expression`**: undefined symbol, non-finite result or a dependency cycle.
//! - **`Type`**: a raw value could not be recast into one of the canonical kinds.
//! - **`Optimizer`**: a minimize/maximize routine read a non-finite objective.
//! - **`AlarmCondition`**: an alarm references a variable with no current value.
//! - **`NoValue`**: a variable was read before it ever held a value.
//! - **`Controlled`**: an outside `set()` targeted a knob currently driven by a routine.
//! - **`Configuration`**: build-time rejection of an experiment definition (duplicate names,
//!   unknown targets, malformed tables).
//! - **`Config`**, **`Io`**, **`Csv`**: wrapped errors from `figment`, `std::io` and `csv`.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types with `?`.

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the engine reports.
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[cfg(feature = "storage_csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(
        "Communication with '{channel}' failed after {attempts} attempts and {reconnects} reconnects: {last}"
    )]
    Communication {
        channel: String,
        attempts: u32,
        reconnects: u32,
        last: String,
    },

    #[error("Invalid response from '{channel}': {response:?}")]
    Validation { channel: String, response: String },

    #[error("Variable '{0}' is not settable")]
    NotSettable(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Type error: {0}")]
    Type(String),

    #[error("Optimizer error in routine '{routine}': {reason}")]
    Optimizer { routine: String, reason: String },

    #[error("Alarm '{alarm}' condition error: {reason}")]
    AlarmCondition { alarm: String, reason: String },

    #[error("Variable '{0}' has no value yet")]
    NoValue(String),

    #[error("Variable '{variable}' is controlled by routine '{routine}'")]
    Controlled { variable: String, routine: String },

    #[error("Worker task failed: {0}")]
    Task(String),

    #[error("Channel '{0}' is closed")]
    ChannelClosed(String),

    #[error("Serial support not enabled. Rebuild with --features instrument_serial")]
    SerialFeatureDisabled,

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

impl From<figment::Error> for DaqError {
    fn from(err: figment::Error) -> Self {
        DaqError::Config(Box::new(err))
    }
}

impl DaqError {
    /// Whether this error came out of the adapter layer after all retries were spent.
    pub fn is_communication(&self) -> bool {
        matches!(self, DaqError::Communication { .. } | DaqError::ChannelClosed(_))
    }
}
