//! One-time code challenge persistence.
//!
//! # Invariants
//! - Creating a challenge supersedes every other open challenge of the same
//!   principal in the same transaction.
//! - A challenge is verified at most once and consumed at most once
//!   (consumption happens in `ProxyRepository::register_delegation`).

use crate::model::proxy::VerificationChallenge;
use crate::model::{ChallengeId, MemberId};
use crate::repo::{parse_uuid, RepoError, RepoResult, SqliteStore};
use rusqlite::{params, Row};

const CHALLENGE_SELECT_SQL: &str = "SELECT
    uuid,
    principal_uuid,
    code_hash,
    issued_at,
    expires_at,
    failed_attempts,
    verified_at,
    consumed_at,
    superseded
FROM verification_challenges";

/// Repository interface for verification challenges.
pub trait VerificationRepository {
    fn create_challenge(&self, challenge: &VerificationChallenge) -> RepoResult<()>;
    fn get_challenge(&self, id: ChallengeId) -> RepoResult<Option<VerificationChallenge>>;
    /// Newest challenge that is neither superseded nor consumed.
    fn latest_open_challenge(&self, principal: MemberId)
        -> RepoResult<Option<VerificationChallenge>>;
    /// Increments the failure counter and returns the new value.
    fn record_failed_attempt(&self, id: ChallengeId) -> RepoResult<u32>;
    /// Marks an open, unverified challenge as verified.
    fn mark_verified(&self, id: ChallengeId, at_ms: i64) -> RepoResult<()>;
}

impl VerificationRepository for SqliteStore<'_> {
    fn create_challenge(&self, challenge: &VerificationChallenge) -> RepoResult<()> {
        let tx = self.immediate_tx()?;
        tx.execute(
            "UPDATE verification_challenges
             SET superseded = 1
             WHERE principal_uuid = ?1
               AND superseded = 0
               AND consumed_at IS NULL;",
            [challenge.principal.to_string()],
        )?;
        tx.execute(
            "INSERT INTO verification_challenges (
                uuid,
                principal_uuid,
                code_hash,
                issued_at,
                expires_at,
                failed_attempts,
                verified_at,
                consumed_at,
                superseded
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
            params![
                challenge.uuid.to_string(),
                challenge.principal.to_string(),
                challenge.code_hash.as_str(),
                challenge.issued_at,
                challenge.expires_at,
                challenge.failed_attempts,
                challenge.verified_at,
                challenge.consumed_at,
                i64::from(challenge.superseded),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn get_challenge(&self, id: ChallengeId) -> RepoResult<Option<VerificationChallenge>> {
        let mut stmt = self
            .connection()
            .prepare(&format!("{CHALLENGE_SELECT_SQL} WHERE uuid = ?1;"))?;
        let mut rows = stmt.query([id.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_challenge_row(row)?));
        }
        Ok(None)
    }

    fn latest_open_challenge(
        &self,
        principal: MemberId,
    ) -> RepoResult<Option<VerificationChallenge>> {
        let mut stmt = self.connection().prepare(&format!(
            "{CHALLENGE_SELECT_SQL}
             WHERE principal_uuid = ?1
               AND superseded = 0
               AND consumed_at IS NULL
             ORDER BY issued_at DESC, uuid ASC
             LIMIT 1;"
        ))?;
        let mut rows = stmt.query([principal.to_string()])?;
        if let Some(row) = rows.next()? {
            return Ok(Some(parse_challenge_row(row)?));
        }
        Ok(None)
    }

    fn record_failed_attempt(&self, id: ChallengeId) -> RepoResult<u32> {
        let changed = self.connection().execute(
            "UPDATE verification_challenges
             SET failed_attempts = failed_attempts + 1
             WHERE uuid = ?1;",
            [id.to_string()],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound {
                entity: "verification challenge",
                id,
            });
        }
        let attempts: u32 = self.connection().query_row(
            "SELECT failed_attempts FROM verification_challenges WHERE uuid = ?1;",
            [id.to_string()],
            |row| row.get(0),
        )?;
        Ok(attempts)
    }

    fn mark_verified(&self, id: ChallengeId, at_ms: i64) -> RepoResult<()> {
        let changed = self.connection().execute(
            "UPDATE verification_challenges
             SET verified_at = ?2
             WHERE uuid = ?1
               AND verified_at IS NULL
               AND consumed_at IS NULL
               AND superseded = 0;",
            params![id.to_string(), at_ms],
        )?;
        if changed == 0 {
            return Err(RepoError::Conflict(format!(
                "verification challenge {id} is no longer open"
            )));
        }
        Ok(())
    }
}

fn parse_challenge_row(row: &Row<'_>) -> RepoResult<VerificationChallenge> {
    let uuid_text: String = row.get("uuid")?;
    let principal_text: String = row.get("principal_uuid")?;
    let superseded = match row.get::<_, i64>("superseded")? {
        0 => false,
        1 => true,
        other => {
            return Err(RepoError::InvalidData(format!(
                "invalid superseded value `{other}` in verification_challenges.superseded"
            )));
        }
    };

    Ok(VerificationChallenge {
        uuid: parse_uuid(&uuid_text, "verification_challenges.uuid")?,
        principal: parse_uuid(&principal_text, "verification_challenges.principal_uuid")?,
        code_hash: row.get("code_hash")?,
        issued_at: row.get("issued_at")?,
        expires_at: row.get("expires_at")?,
        failed_attempts: row.get("failed_attempts")?,
        verified_at: row.get("verified_at")?,
        consumed_at: row.get("consumed_at")?,
        superseded,
    })
}
