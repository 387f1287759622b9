//! Core domain logic for assembly proxy rights, quorum and vote tabulation.
//! This crate is the single source of truth for business invariants.

pub mod clock;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod notify;
pub mod repo;
pub mod service;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, CoreConfig, LoggingConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status};
pub use model::assembly::{Assembly, AttendanceRecord, Member, Unit};
pub use model::holder::{Representative, RightsHolder};
pub use model::proxy::{DelegationState, DelegationType, Evidence, Proxy, ProxyStatus};
pub use model::vote::{Ballot, Vote, VoteOption, VoteStatus};
pub use notify::{ChangeNotifier, NoopNotifier, StateChange};
pub use repo::{RepoError, RepoResult, SqliteStore};
pub use service::proxy_service::{DelegationOutcome, ProxyService};
pub use service::quorum_service::{compute_quorum, QuorumService, QuorumSnapshot, QuorumStatus};
pub use service::reconcile_service::{ReconcileService, SweepReport};
pub use service::report_service::ReportService;
pub use service::verification_service::{ChallengeTicket, CodeIssuer, VerificationService};
pub use service::vote_service::{tabulate_ballots, VoteService, VoteTally};
pub use service::{ServiceContext, ServiceError, ServiceResult};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
