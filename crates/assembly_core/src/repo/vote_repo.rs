//! Vote, option and ballot persistence.
//!
//! # Invariants
//! - A vote and its options are written in one transaction.
//! - Options are read back in declared order.
//! - Ballot uniqueness per (vote, unit) is the table constraint; losing that
//!   race surfaces as `Conflict`.

use crate::model::vote::{Ballot, Vote, VoteOption, VoteStatus};
use crate::model::{AssemblyId, VoteId};
use crate::repo::{is_unique_violation, parse_uuid, HolderColumns, RepoError, RepoResult, SqliteStore};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

/// Repository interface for votes and ballots.
pub trait VoteRepository {
    fn create_vote(&self, vote: &Vote) -> RepoResult<()>;
    fn get_vote(&self, id: VoteId) -> RepoResult<Option<Vote>>;
    /// Lists votes of one assembly, newest first.
    fn list_votes(&self, assembly: AssemblyId) -> RepoResult<Vec<Vote>>;
    fn update_vote_status(
        &self,
        id: VoteId,
        status: VoteStatus,
        expected: VoteStatus,
    ) -> RepoResult<()>;
    fn list_ballots(&self, vote: VoteId) -> RepoResult<Vec<Ballot>>;
    fn create_ballot(&self, ballot: &Ballot) -> RepoResult<()>;
}

impl VoteRepository for SqliteStore<'_> {
    fn create_vote(&self, vote: &Vote) -> RepoResult<()> {
        let tx = rusqlite::Transaction::new_unchecked(
            self.connection(),
            TransactionBehavior::Deferred,
        )?;
        tx.execute(
            "INSERT INTO votes (uuid, assembly_uuid, title, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5);",
            params![
                vote.uuid.to_string(),
                vote.assembly.to_string(),
                vote.title.as_str(),
                vote.status.as_str(),
                vote.created_at,
            ],
        )?;
        for option in &vote.options {
            tx.execute(
                "INSERT INTO vote_options (uuid, vote_uuid, position, label)
                 VALUES (?1, ?2, ?3, ?4);",
                params![
                    option.uuid.to_string(),
                    vote.uuid.to_string(),
                    option.position,
                    option.label.as_str(),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn get_vote(&self, id: VoteId) -> RepoResult<Option<Vote>> {
        let row = self
            .connection()
            .query_row(
                "SELECT uuid, assembly_uuid, title, status, created_at
                 FROM votes
                 WHERE uuid = ?1;",
                [id.to_string()],
                read_vote_columns,
            )
            .optional()?;
        row.map(|columns| build_vote(self.connection(), columns))
            .transpose()
    }

    fn list_votes(&self, assembly: AssemblyId) -> RepoResult<Vec<Vote>> {
        let mut stmt = self.connection().prepare(
            "SELECT uuid, assembly_uuid, title, status, created_at
             FROM votes
             WHERE assembly_uuid = ?1
             ORDER BY created_at DESC, uuid ASC;",
        )?;
        let columns = stmt
            .query_map([assembly.to_string()], read_vote_columns)?
            .collect::<Result<Vec<_>, _>>()?;
        columns
            .into_iter()
            .map(|columns| build_vote(self.connection(), columns))
            .collect()
    }

    fn update_vote_status(
        &self,
        id: VoteId,
        status: VoteStatus,
        expected: VoteStatus,
    ) -> RepoResult<()> {
        let changed = self.connection().execute(
            "UPDATE votes SET status = ?2 WHERE uuid = ?1 AND status = ?3;",
            params![id.to_string(), status.as_str(), expected.as_str()],
        )?;
        if changed == 0 {
            if self.get_vote(id)?.is_none() {
                return Err(RepoError::NotFound { entity: "vote", id });
            }
            return Err(RepoError::Conflict(format!(
                "vote {id} is not {}",
                expected.as_str()
            )));
        }
        Ok(())
    }

    fn list_ballots(&self, vote: VoteId) -> RepoResult<Vec<Ballot>> {
        let mut stmt = self.connection().prepare(
            "SELECT
                uuid,
                vote_uuid,
                option_uuid,
                unit_uuid,
                weight,
                holder_kind,
                holder_member_uuid,
                holder_name,
                holder_document,
                cast_at
             FROM ballots
             WHERE vote_uuid = ?1
             ORDER BY cast_at ASC, uuid ASC;",
        )?;
        let mut rows = stmt.query([vote.to_string()])?;
        let mut ballots = Vec::new();
        while let Some(row) = rows.next()? {
            let uuid_text: String = row.get("uuid")?;
            let vote_text: String = row.get("vote_uuid")?;
            let option_text: String = row.get("option_uuid")?;
            let unit_text: String = row.get("unit_uuid")?;
            let holder_kind: String = row.get("holder_kind")?;
            ballots.push(Ballot {
                uuid: parse_uuid(&uuid_text, "ballots.uuid")?,
                vote: parse_uuid(&vote_text, "ballots.vote_uuid")?,
                option: parse_uuid(&option_text, "ballots.option_uuid")?,
                unit: parse_uuid(&unit_text, "ballots.unit_uuid")?,
                weight: row.get("weight")?,
                cast_by: HolderColumns::into_holder(
                    &holder_kind,
                    row.get("holder_member_uuid")?,
                    row.get("holder_name")?,
                    row.get("holder_document")?,
                    "ballots",
                )?,
                cast_at: row.get("cast_at")?,
            });
        }
        Ok(ballots)
    }

    fn create_ballot(&self, ballot: &Ballot) -> RepoResult<()> {
        let holder = HolderColumns::from_holder(&ballot.cast_by);
        let result = self.connection().execute(
            "INSERT INTO ballots (
                uuid,
                vote_uuid,
                option_uuid,
                unit_uuid,
                weight,
                holder_kind,
                holder_member_uuid,
                holder_name,
                holder_document,
                cast_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
            params![
                ballot.uuid.to_string(),
                ballot.vote.to_string(),
                ballot.option.to_string(),
                ballot.unit.to_string(),
                ballot.weight,
                holder.kind,
                holder.member,
                holder.name,
                holder.document,
                ballot.cast_at,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RepoError::Conflict(format!(
                "unit {} already cast a ballot in vote {}",
                ballot.unit, ballot.vote
            ))),
            Err(err) => Err(err.into()),
        }
    }
}

type VoteColumns = (String, String, String, String, i64);

fn read_vote_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<VoteColumns> {
    Ok((
        row.get("uuid")?,
        row.get("assembly_uuid")?,
        row.get("title")?,
        row.get("status")?,
        row.get("created_at")?,
    ))
}

fn build_vote(conn: &Connection, columns: VoteColumns) -> RepoResult<Vote> {
    let (uuid_text, assembly_text, title, status_text, created_at) = columns;
    let uuid = parse_uuid(&uuid_text, "votes.uuid")?;
    let status = VoteStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid vote status `{status_text}` in votes.status"))
    })?;

    let mut stmt = conn.prepare(
        "SELECT uuid, position, label
         FROM vote_options
         WHERE vote_uuid = ?1
         ORDER BY position ASC;",
    )?;
    let mut rows = stmt.query([uuid_text.as_str()])?;
    let mut options = Vec::new();
    while let Some(row) = rows.next()? {
        let option_text: String = row.get("uuid")?;
        options.push(VoteOption {
            uuid: parse_uuid(&option_text, "vote_options.uuid")?,
            vote: uuid,
            position: row.get("position")?,
            label: row.get("label")?,
        });
    }

    Ok(Vote {
        uuid,
        assembly: parse_uuid(&assembly_text, "votes.assembly_uuid")?,
        title,
        status,
        options,
        created_at,
    })
}
