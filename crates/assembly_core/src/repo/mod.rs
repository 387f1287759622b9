//! Repository layer abstractions and the SQLite entity store.
//!
//! # Responsibility
//! - Define use-case oriented data access contracts.
//! - Isolate SQLite query details from service orchestration.
//! - Turn store-level uniqueness races into semantic `Conflict` errors.
//!
//! # Invariants
//! - Multi-row delegation writes run inside one `BEGIN IMMEDIATE` transaction.
//! - Read paths reject invalid persisted state instead of masking it.
//! - `SqliteStore` only wraps connections migrated to the latest schema.

use crate::db::migrations::{current_user_version, latest_version};
use crate::db::DbError;
use crate::model::holder::{Representative, RightsHolder};
use crate::model::ModelValidationError;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::error::Error;
use std::fmt::{Display, Formatter};
use uuid::Uuid;

pub mod proxy_repo;
pub mod unit_repo;
pub mod verification_repo;
pub mod vote_repo;

pub type RepoResult<T> = Result<T, RepoError>;

/// Repository error shared by all entity store operations.
#[derive(Debug)]
pub enum RepoError {
    /// Transport/engine failure; callers must not assume any write happened.
    Db(DbError),
    /// Referenced row does not exist (or not in the required state).
    NotFound { entity: &'static str, id: Uuid },
    /// A uniqueness or expected-state check lost a race.
    Conflict(String),
    /// Connection schema is not at the expected migrated version.
    UninitializedConnection {
        expected_version: u32,
        actual_version: u32,
    },
    /// Value rejected by model validation before persistence.
    Validation(ModelValidationError),
    /// Persisted data cannot be converted to a valid model.
    InvalidData(String),
}

impl Display for RepoError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::NotFound { entity, id } => write!(f, "{entity} not found: {id}"),
            Self::Conflict(message) => write!(f, "conflict: {message}"),
            Self::UninitializedConnection {
                expected_version,
                actual_version,
            } => write!(
                f,
                "entity store requires schema version {expected_version}, got {actual_version}"
            ),
            Self::Validation(err) => write!(f, "{err}"),
            Self::InvalidData(message) => write!(f, "invalid persisted data: {message}"),
        }
    }
}

impl Error for RepoError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<DbError> for RepoError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for RepoError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<ModelValidationError> for RepoError {
    fn from(value: ModelValidationError) -> Self {
        Self::Validation(value)
    }
}

/// SQLite-backed entity store implementing every repository trait.
///
/// Borrowing the connection keeps one store per caller; concurrent callers
/// open their own connections to the same database file.
#[derive(Clone, Copy)]
pub struct SqliteStore<'conn> {
    conn: &'conn Connection,
}

impl<'conn> SqliteStore<'conn> {
    /// Wraps a connection returned by `open_db`/`open_db_in_memory`.
    pub fn try_new(conn: &'conn Connection) -> RepoResult<Self> {
        let actual_version = current_user_version(conn)?;
        let expected_version = latest_version();
        if actual_version != expected_version {
            return Err(RepoError::UninitializedConnection {
                expected_version,
                actual_version,
            });
        }
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &'conn Connection {
        self.conn
    }

    /// Starts a write transaction that takes the database write lock up front.
    pub(crate) fn immediate_tx(&self) -> RepoResult<Transaction<'conn>> {
        Ok(Transaction::new_unchecked(
            self.conn,
            TransactionBehavior::Immediate,
        )?)
    }
}

/// Returns true for UNIQUE / PRIMARY KEY constraint failures.
pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    match err {
        rusqlite::Error::SqliteFailure(inner, _) => {
            inner.code == rusqlite::ErrorCode::ConstraintViolation
                && (inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                    || inner.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        }
        _ => false,
    }
}

pub(crate) fn parse_uuid(value: &str, column: &str) -> RepoResult<Uuid> {
    Uuid::parse_str(value)
        .map_err(|_| RepoError::InvalidData(format!("invalid uuid value `{value}` in {column}")))
}

fn parse_optional_uuid(value: Option<String>, column: &str) -> RepoResult<Option<Uuid>> {
    value.map(|text| parse_uuid(&text, column)).transpose()
}

/// Column image of a `RightsHolder` (`holder_kind`, member, name, document).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct HolderColumns {
    pub kind: &'static str,
    pub member: Option<String>,
    pub name: Option<String>,
    pub document: Option<String>,
}

impl HolderColumns {
    pub fn from_holder(holder: &RightsHolder) -> Self {
        match holder {
            RightsHolder::Principal { member } => Self {
                kind: "principal",
                member: Some(member.to_string()),
                name: None,
                document: None,
            },
            RightsHolder::Representative { representative } => {
                Self::from_representative(representative)
            }
        }
    }

    pub fn from_representative(representative: &Representative) -> Self {
        match representative {
            Representative::Internal { member } => Self {
                kind: "internal",
                member: Some(member.to_string()),
                name: None,
                document: None,
            },
            Representative::External {
                name,
                document_number,
            } => Self {
                kind: "external",
                member: None,
                name: Some(name.clone()),
                document: Some(document_number.clone()),
            },
        }
    }

    /// Decodes holder columns read from `table`.
    pub fn into_holder(
        kind: &str,
        member: Option<String>,
        name: Option<String>,
        document: Option<String>,
        table: &str,
    ) -> RepoResult<RightsHolder> {
        if kind == "principal" {
            let member = parse_optional_uuid(member, table)?.ok_or_else(|| {
                RepoError::InvalidData(format!("principal holder without member in {table}"))
            })?;
            return Ok(RightsHolder::principal(member));
        }
        let representative = Self::into_representative(kind, member, name, document, table)?;
        Ok(RightsHolder::delegated(representative))
    }

    /// Decodes representative columns (`internal` / `external` only).
    pub fn into_representative(
        kind: &str,
        member: Option<String>,
        name: Option<String>,
        document: Option<String>,
        table: &str,
    ) -> RepoResult<Representative> {
        match kind {
            "internal" => {
                let member = parse_optional_uuid(member, table)?.ok_or_else(|| {
                    RepoError::InvalidData(format!("internal representative without member in {table}"))
                })?;
                Ok(Representative::Internal { member })
            }
            "external" => match (name, document) {
                (Some(name), Some(document_number)) => Ok(Representative::External {
                    name,
                    document_number,
                }),
                _ => Err(RepoError::InvalidData(format!(
                    "external representative without name/document in {table}"
                ))),
            },
            other => Err(RepoError::InvalidData(format!(
                "invalid holder kind `{other}` in {table}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::HolderColumns;
    use crate::model::holder::{Representative, RightsHolder};
    use uuid::Uuid;

    #[test]
    fn holder_columns_decode_what_they_encode() {
        let member = Uuid::new_v4();
        let holders = [
            RightsHolder::principal(member),
            RightsHolder::delegated(Representative::Internal { member }),
            RightsHolder::delegated(Representative::External {
                name: "Ana".to_string(),
                document_number: "123456".to_string(),
            }),
        ];
        for holder in holders {
            let cols = HolderColumns::from_holder(&holder);
            let decoded =
                HolderColumns::into_holder(cols.kind, cols.member, cols.name, cols.document, "units")
                    .unwrap();
            assert_eq!(decoded, holder);
        }
    }

    #[test]
    fn unknown_holder_kind_is_invalid_data() {
        let err = HolderColumns::into_holder("ghost", None, None, None, "units").unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }
}
