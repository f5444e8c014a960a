//! Error taxonomy for the POS core.
//!
//! Validation and shift state-machine errors are surfaced to the operator
//! immediately. Remote errors are caught at the sync-cycle level and only
//! show up in [`crate::sync::SyncReport`]. Migration errors abort store open.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, PosError>;

#[derive(Debug, Error)]
pub enum PosError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    State(#[from] ShiftStateError),

    #[error("migration v{version} failed: {reason}")]
    Migration { version: i32, reason: String },

    #[error("{entity} not found: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("local store error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("local store lock poisoned")]
    Poisoned,
}

impl PosError {
    pub fn not_found(entity: &'static str, key: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            key: key.into(),
        }
    }

    /// Errors the operator caused and can fix; never retried.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::State(_) | Self::NotFound { .. }
        )
    }
}

impl<T> From<std::sync::PoisonError<T>> for PosError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        Self::Poisoned
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("item code must not be empty")]
    EmptyCode,

    #[error("item code '{code}' exceeds {max} characters")]
    CodeTooLong { code: String, max: usize },

    #[error("item code '{0}' already exists")]
    DuplicateCode(String),

    #[error("invalid quantity {quantity} for {field}")]
    InvalidQuantity { field: String, quantity: i64 },

    #[error("invalid amount {amount} for {field}")]
    InvalidAmount { field: String, amount: i64 },

    #[error("insufficient stock for {code} size {size}: requested {requested}, available {available}")]
    InsufficientStock {
        code: String,
        size: String,
        requested: i64,
        available: i64,
    },

    #[error("purchase date is outside the {days}-day return window")]
    ReturnWindowExpired { days: i64 },

    #[error("purchase date is in the future")]
    PurchaseDateInFuture,

    #[error("cart is empty")]
    EmptyCart,

    #[error("{field} is too large")]
    Overflow { field: String },

    #[error("{0} records are immutable; issue a compensating return instead")]
    Immutable(&'static str),

    #[error("unknown {field} value '{value}'")]
    UnknownValue { field: &'static str, value: String },

    #[error("missing required field {0}")]
    MissingField(&'static str),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShiftStateError {
    #[error("a shift is already open on terminal {terminal_id} ({shift_id})")]
    AlreadyOpen {
        terminal_id: String,
        shift_id: String,
    },

    #[error("no open shift on terminal {0}")]
    NoneOpen(String),

    #[error("shift {0} is already closed")]
    AlreadyClosed(String),
}

/// Failures talking to the remote store. Always transient from the point of
/// view of the sync engine: the cycle logs them and retries later.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("remote not configured: {0}")]
    NotConfigured(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("could not decode remote payload: {0}")]
    Decode(String),

    #[error("subscription failed: {0}")]
    Subscription(String),
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RemoteError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Subscription(err.to_string())
    }
}
