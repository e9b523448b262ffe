//! Error taxonomy for lifecycle operations
//!
//! Validation, authorization and state errors are deterministic and never
//! retried. Store errors are classified by [`LeadError::is_transient`]; the
//! transient ones are retried by [`crate::retry::RetryPolicy`] and surface as
//! [`LeadError::Unavailable`] once the budget is spent.

use diesel::result::{DatabaseErrorKind, Error as DieselError};

#[derive(Debug, thiserror::Error)]
pub enum LeadError {
    /// Bad input shape, caller's fault
    #[error("{0}")]
    Validation(String),

    /// Role or ownership guard failed
    #[error("{0}")]
    Forbidden(String),

    /// Referenced lead/user/stage absent or soft-deleted
    #[error("{0} not found")]
    NotFound(String),

    /// Event not legal from the lead's current status
    #[error("{0}")]
    InvalidState(String),

    /// Transient contention outlasted the retry budget
    #[error("the system is busy right now, please try again (gave up after {attempts} attempts)")]
    Unavailable { attempts: u32 },

    #[error("store error: {0}")]
    Store(#[from] DieselError),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("attachment storage error: {0}")]
    Blob(#[from] crate::blob::BlobError),
}

pub type Result<T> = std::result::Result<T, LeadError>;

impl LeadError {
    pub fn not_found(what: impl Into<String>) -> Self {
        LeadError::NotFound(what.into())
    }

    /// Lock/serialization failures worth retrying
    pub fn is_transient(&self) -> bool {
        match self {
            LeadError::Store(e) => is_transient_store_error(e),
            LeadError::Pool(_) => true,
            _ => false,
        }
    }

    /// Short machine-readable tag for API clients
    pub fn kind(&self) -> &'static str {
        match self {
            LeadError::Validation(_) => "validation",
            LeadError::Forbidden(_) => "forbidden",
            LeadError::NotFound(_) => "not_found",
            LeadError::InvalidState(_) => "invalid_state",
            LeadError::Unavailable { .. } => "unavailable",
            LeadError::Store(_) | LeadError::Pool(_) | LeadError::Blob(_) => "internal",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            LeadError::Validation(_) => 400,
            LeadError::Forbidden(_) => 403,
            LeadError::NotFound(_) => 404,
            LeadError::InvalidState(_) => 409,
            LeadError::Unavailable { .. } => 503,
            LeadError::Store(_) | LeadError::Pool(_) | LeadError::Blob(_) => 500,
        }
    }

    /// Message safe to show an end user
    pub fn user_message(&self) -> String {
        match self {
            LeadError::Validation(msg) => msg.clone(),
            LeadError::Forbidden(msg) => format!("Permission denied: {}", msg),
            LeadError::NotFound(what) => format!("{} not found.", capitalize(what)),
            LeadError::InvalidState(msg) => format!("Not allowed right now: {}", msg),
            LeadError::Unavailable { .. } => {
                "The system is busy handling other changes. Please try again.".to_string()
            }
            LeadError::Blob(_) => "The attachment could not be stored.".to_string(),
            LeadError::Store(_) | LeadError::Pool(_) => {
                "An unexpected error occurred.".to_string()
            }
        }
    }
}

fn is_transient_store_error(e: &DieselError) -> bool {
    match e {
        DieselError::DatabaseError(DatabaseErrorKind::SerializationFailure, _) => true,
        DieselError::DatabaseError(_, info) => {
            let msg = info.message().to_ascii_lowercase();
            msg.contains("database is locked")
                || msg.contains("database table is locked")
                || msg.contains("deadlock")
                || msg.contains("busy")
        }
        _ => false,
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

impl From<diesel::r2d2::PoolError> for LeadError {
    fn from(e: diesel::r2d2::PoolError) -> Self {
        LeadError::Pool(e.to_string())
    }
}
