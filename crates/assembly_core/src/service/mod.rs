//! Core use-case services.
//!
//! # Responsibility
//! - Orchestrate repository calls into use-case level APIs.
//! - Validate requests before any write and map store failures into one
//!   error taxonomy.
//! - Emit change signals after commits.
//!
//! # Invariants
//! - `ServiceError::Validation` is always raised before the store is written.
//! - Services never retry; callers decide.

use crate::clock::{Clock, SystemClock};
use crate::config::CoreConfig;
use crate::notify::{ChangeNotifier, NoopNotifier, StateChange};
use crate::repo::RepoError;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use uuid::Uuid;

pub mod proxy_service;
pub mod quorum_service;
pub mod reconcile_service;
pub mod report_service;
pub mod verification_service;
pub mod vote_service;

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Error taxonomy shared by every service.
#[derive(Debug)]
pub enum ServiceError {
    /// Request rejected before touching the store.
    Validation(String),
    /// Lost a race or hit a uniqueness constraint.
    Conflict(String),
    /// Referenced entity is absent (or not in the required state).
    NotFound { entity: &'static str, id: Uuid },
    /// An external collaborator (code issuer) failed.
    Collaborator(String),
    /// The entity store failed; nothing can be assumed about the write.
    StoreUnavailable(RepoError),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(message) => write!(f, "validation failed: {message}"),
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Collaborator(message) => write!(f, "collaborator failed: {message}"),
            Self::StoreUnavailable(err) => write!(f, "store unavailable: {err}"),
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::StoreUnavailable(err) => Some(err),
            _ => None,
        }
    }
}

impl From<RepoError> for ServiceError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::NotFound { entity, id } => Self::NotFound { entity, id },
            RepoError::Conflict(message) => Self::Conflict(message),
            RepoError::Validation(err) => Self::Validation(err.to_string()),
            other => Self::StoreUnavailable(other),
        }
    }
}

impl ServiceError {
    /// Short tag used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation",
            Self::Conflict(_) => "conflict",
            Self::NotFound { .. } => "not_found",
            Self::Collaborator(_) => "collaborator",
            Self::StoreUnavailable(_) => "store_unavailable",
        }
    }
}

/// Configuration and collaborator seams shared by services.
#[derive(Clone)]
pub struct ServiceContext {
    pub config: CoreConfig,
    pub clock: Arc<dyn Clock>,
    pub notifier: Arc<dyn ChangeNotifier>,
}

impl ServiceContext {
    /// Wall clock and no change listener.
    pub fn new(config: CoreConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            notifier: Arc::new(NoopNotifier),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn ChangeNotifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub(crate) fn notify(&self, change: StateChange) {
        self.notifier.state_changed(change);
    }
}

impl Default for ServiceContext {
    fn default() -> Self {
        Self::new(CoreConfig::default())
    }
}

pub(crate) fn duration_ms(duration: std::time::Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
