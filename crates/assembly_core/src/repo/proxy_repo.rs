//! Proxy persistence and transactional rights transfer.
//!
//! # Responsibility
//! - Store delegation records and their status transitions.
//! - Apply a delegation (proxy row + every affected unit row) atomically.
//! - Find the traces interrupted registrations leave behind.
//!
//! # Invariants
//! - `register_delegation`, `approve_delegation` and `revoke_delegation` run
//!   in one `BEGIN IMMEDIATE` transaction each; either every row changes or
//!   none does.
//! - The single-approved-proxy check runs inside that transaction and is
//!   backed by the `idx_proxies_single_active` partial unique index.
//! - Only units owned by the proxy principal are ever transferred or
//!   reverted.

use crate::model::assembly::Unit;
use crate::model::holder::Representative;
use crate::model::proxy::{DelegationType, Proxy, ProxyStatus, VerificationMethod};
use crate::model::{AssemblyId, ChallengeId, MemberId, ProxyId, UnitId};
use crate::repo::unit_repo::{parse_unit_row, UNIT_SELECT_SQL};
use crate::repo::{is_unique_violation, parse_uuid, HolderColumns, RepoError, RepoResult, SqliteStore};
use log::warn;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};

const PROXY_SELECT_SQL: &str = "SELECT
    uuid,
    principal_uuid,
    rep_kind,
    rep_member_uuid,
    rep_name,
    rep_document,
    kind,
    status,
    evidence_ref,
    verification_method,
    created_at,
    updated_at
FROM proxies";

/// Query options for listing proxies.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyListQuery {
    /// Keep proxies whose principal owns at least one unit of this assembly.
    pub assembly: Option<AssemblyId>,
    pub principal: Option<MemberId>,
    pub status: Option<ProxyStatus>,
}

/// Repository interface for proxies.
pub trait ProxyRepository {
    fn get_proxy(&self, id: ProxyId) -> RepoResult<Option<Proxy>>;
    /// Returns the approved proxy of a principal, if any.
    fn find_active_proxy(&self, principal: MemberId) -> RepoResult<Option<Proxy>>;
    /// Returns the newest pending proxy of a principal, if any.
    fn find_pending_proxy(&self, principal: MemberId) -> RepoResult<Option<Proxy>>;
    /// Lists proxies, newest first.
    fn list_proxies(&self, query: &ProxyListQuery) -> RepoResult<Vec<Proxy>>;
    /// Inserts one proxy row without touching units.
    ///
    /// Returns `Conflict` when the row would be a second approved proxy.
    fn create_proxy(&self, proxy: &Proxy) -> RepoResult<()>;
    /// Conditional status change (`expected` must match the stored status).
    fn update_proxy_status(
        &self,
        id: ProxyId,
        status: ProxyStatus,
        expected: ProxyStatus,
        at_ms: i64,
    ) -> RepoResult<()>;
    /// Hard delete of an approved proxy that still has no evidence. Returns
    /// `false` when the row is gone or no longer in that state.
    fn delete_unevidenced_proxy(&self, id: ProxyId) -> RepoResult<bool>;
    /// Inserts an approved proxy, consumes its verification challenge and
    /// moves every unit the principal owns to the representative, including
    /// units still held by a representative no approved proxy backs.
    fn register_delegation(
        &self,
        proxy: &Proxy,
        challenge: Option<ChallengeId>,
    ) -> RepoResult<Vec<UnitId>>;
    /// Moves a pending proxy to approved and transfers unit rights.
    fn approve_delegation(&self, id: ProxyId, at_ms: i64) -> RepoResult<(Proxy, Vec<UnitId>)>;
    /// Moves an approved proxy to revoked and hands unit rights back.
    fn revoke_delegation(&self, id: ProxyId, at_ms: i64) -> RepoResult<(Proxy, Vec<UnitId>)>;
    /// Approved proxies without evidence created strictly before the cutoff.
    fn list_unevidenced_approved(&self, created_before: i64) -> RepoResult<Vec<Proxy>>;
    /// Units held by a representative while their owner has no approved proxy.
    fn list_orphaned_units(&self) -> RepoResult<Vec<Unit>>;
}

impl ProxyRepository for SqliteStore<'_> {
    fn get_proxy(&self, id: ProxyId) -> RepoResult<Option<Proxy>> {
        load_proxy(self.connection(), id)
    }

    fn find_active_proxy(&self, principal: MemberId) -> RepoResult<Option<Proxy>> {
        find_by_status(self.connection(), principal, ProxyStatus::Approved)
    }

    fn find_pending_proxy(&self, principal: MemberId) -> RepoResult<Option<Proxy>> {
        find_by_status(self.connection(), principal, ProxyStatus::Pending)
    }

    fn list_proxies(&self, query: &ProxyListQuery) -> RepoResult<Vec<Proxy>> {
        let mut sql = format!("{PROXY_SELECT_SQL} WHERE 1 = 1");
        let mut bind_values: Vec<Value> = Vec::new();

        if let Some(assembly) = query.assembly {
            sql.push_str(
                " AND EXISTS (
                    SELECT 1
                    FROM units u
                    WHERE u.owner_uuid = proxies.principal_uuid
                      AND u.assembly_uuid = ?
                )",
            );
            bind_values.push(Value::Text(assembly.to_string()));
        }
        if let Some(principal) = query.principal {
            sql.push_str(" AND principal_uuid = ?");
            bind_values.push(Value::Text(principal.to_string()));
        }
        if let Some(status) = query.status {
            sql.push_str(" AND status = ?");
            bind_values.push(Value::Text(status.as_str().to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC, uuid ASC");

        let mut stmt = self.connection().prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(bind_values))?;
        let mut proxies = Vec::new();
        while let Some(row) = rows.next()? {
            proxies.push(parse_proxy_row(row)?);
        }
        Ok(proxies)
    }

    fn create_proxy(&self, proxy: &Proxy) -> RepoResult<()> {
        insert_proxy(self.connection(), proxy)
    }

    fn update_proxy_status(
        &self,
        id: ProxyId,
        status: ProxyStatus,
        expected: ProxyStatus,
        at_ms: i64,
    ) -> RepoResult<()> {
        set_status(self.connection(), id, status, expected, at_ms)
    }

    fn delete_unevidenced_proxy(&self, id: ProxyId) -> RepoResult<bool> {
        let deleted = self.connection().execute(
            "DELETE FROM proxies
             WHERE uuid = ?1
               AND status = 'approved'
               AND (evidence_ref IS NULL OR trim(evidence_ref) = '');",
            [id.to_string()],
        )?;
        Ok(deleted == 1)
    }

    fn register_delegation(
        &self,
        proxy: &Proxy,
        challenge: Option<ChallengeId>,
    ) -> RepoResult<Vec<UnitId>> {
        if proxy.status != ProxyStatus::Approved {
            return Err(RepoError::InvalidData(format!(
                "register_delegation expects an approved proxy, got {}",
                proxy.status.as_str()
            )));
        }

        let tx = self.immediate_tx()?;
        ensure_no_active_proxy(&tx, proxy.principal)?;

        if let Some(challenge) = challenge {
            let consumed = tx.execute(
                "UPDATE verification_challenges
                 SET consumed_at = ?3
                 WHERE uuid = ?1
                   AND principal_uuid = ?2
                   AND verified_at IS NOT NULL
                   AND consumed_at IS NULL
                   AND superseded = 0;",
                params![
                    challenge.to_string(),
                    proxy.principal.to_string(),
                    proxy.created_at
                ],
            )?;
            if consumed == 0 {
                return Err(RepoError::Conflict(format!(
                    "verification challenge {challenge} is not verified or was already used"
                )));
            }
        }

        insert_proxy(&tx, proxy)?;
        let units = transfer_units(&tx, proxy.principal, &proxy.representative)?;
        tx.commit()?;
        Ok(units)
    }

    fn approve_delegation(&self, id: ProxyId, at_ms: i64) -> RepoResult<(Proxy, Vec<UnitId>)> {
        let tx = self.immediate_tx()?;
        let mut proxy = load_proxy(&tx, id)?
            .filter(|proxy| proxy.status == ProxyStatus::Pending)
            .ok_or(RepoError::NotFound {
                entity: "pending proxy",
                id,
            })?;

        ensure_no_active_proxy(&tx, proxy.principal)?;
        set_status(&tx, id, ProxyStatus::Approved, ProxyStatus::Pending, at_ms)?;
        let units = transfer_units(&tx, proxy.principal, &proxy.representative)?;
        tx.commit()?;

        proxy.status = ProxyStatus::Approved;
        proxy.updated_at = at_ms;
        Ok((proxy, units))
    }

    fn revoke_delegation(&self, id: ProxyId, at_ms: i64) -> RepoResult<(Proxy, Vec<UnitId>)> {
        let tx = self.immediate_tx()?;
        let mut proxy = load_proxy(&tx, id)?
            .filter(|proxy| proxy.status == ProxyStatus::Approved)
            .ok_or(RepoError::NotFound {
                entity: "approved proxy",
                id,
            })?;

        set_status(&tx, id, ProxyStatus::Revoked, ProxyStatus::Approved, at_ms)?;
        let units = revert_units(&tx, proxy.principal, &proxy.representative)?;
        tx.commit()?;

        proxy.status = ProxyStatus::Revoked;
        proxy.updated_at = at_ms;
        Ok((proxy, units))
    }

    fn list_unevidenced_approved(&self, created_before: i64) -> RepoResult<Vec<Proxy>> {
        let mut stmt = self.connection().prepare(&format!(
            "{PROXY_SELECT_SQL}
             WHERE status = 'approved'
               AND (evidence_ref IS NULL OR trim(evidence_ref) = '')
               AND created_at < ?1
             ORDER BY created_at ASC, uuid ASC;"
        ))?;
        let mut rows = stmt.query([created_before])?;
        let mut proxies = Vec::new();
        while let Some(row) = rows.next()? {
            proxies.push(parse_proxy_row(row)?);
        }
        Ok(proxies)
    }

    fn list_orphaned_units(&self) -> RepoResult<Vec<Unit>> {
        let mut stmt = self.connection().prepare(&format!(
            "{UNIT_SELECT_SQL}
             WHERE holder_kind <> 'principal'
               AND NOT EXISTS (
                   SELECT 1
                   FROM proxies p
                   WHERE p.principal_uuid = units.owner_uuid
                     AND p.status = 'approved'
               )
             ORDER BY assembly_uuid ASC, number ASC;"
        ))?;
        let mut rows = stmt.query([])?;
        let mut units = Vec::new();
        while let Some(row) = rows.next()? {
            units.push(parse_unit_row(row)?);
        }
        Ok(units)
    }
}

fn find_by_status(
    conn: &Connection,
    principal: MemberId,
    status: ProxyStatus,
) -> RepoResult<Option<Proxy>> {
    let mut stmt = conn.prepare(&format!(
        "{PROXY_SELECT_SQL}
         WHERE principal_uuid = ?1 AND status = ?2
         ORDER BY created_at DESC, uuid ASC
         LIMIT 1;"
    ))?;
    let mut rows = stmt.query(params![principal.to_string(), status.as_str()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_proxy_row(row)?));
    }
    Ok(None)
}

fn load_proxy(conn: &Connection, id: ProxyId) -> RepoResult<Option<Proxy>> {
    let mut stmt = conn.prepare(&format!("{PROXY_SELECT_SQL} WHERE uuid = ?1;"))?;
    let mut rows = stmt.query([id.to_string()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_proxy_row(row)?));
    }
    Ok(None)
}

fn ensure_no_active_proxy(conn: &Connection, principal: MemberId) -> RepoResult<()> {
    let active: Option<String> = conn
        .query_row(
            "SELECT uuid FROM proxies WHERE principal_uuid = ?1 AND status = 'approved';",
            [principal.to_string()],
            |row| row.get(0),
        )
        .optional()?;
    match active {
        Some(existing) => Err(RepoError::Conflict(format!(
            "principal {principal} already has approved proxy {existing}"
        ))),
        None => Ok(()),
    }
}

fn insert_proxy(conn: &Connection, proxy: &Proxy) -> RepoResult<()> {
    proxy.representative.validate()?;
    let rep = HolderColumns::from_representative(&proxy.representative);
    let result = conn.execute(
        "INSERT INTO proxies (
            uuid,
            principal_uuid,
            rep_kind,
            rep_member_uuid,
            rep_name,
            rep_document,
            kind,
            status,
            evidence_ref,
            verification_method,
            created_at,
            updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12);",
        params![
            proxy.uuid.to_string(),
            proxy.principal.to_string(),
            rep.kind,
            rep.member,
            rep.name,
            rep.document,
            proxy.kind.as_str(),
            proxy.status.as_str(),
            proxy.evidence_ref.as_deref(),
            proxy.verification_method.map(VerificationMethod::as_str),
            proxy.created_at,
            proxy.updated_at,
        ],
    );
    match result {
        Ok(_) => Ok(()),
        Err(err) if is_unique_violation(&err) => Err(RepoError::Conflict(format!(
            "principal {} already has an approved proxy",
            proxy.principal
        ))),
        Err(err) => Err(err.into()),
    }
}

fn set_status(
    conn: &Connection,
    id: ProxyId,
    status: ProxyStatus,
    expected: ProxyStatus,
    at_ms: i64,
) -> RepoResult<()> {
    let result = conn.execute(
        "UPDATE proxies
         SET status = ?2, updated_at = ?4
         WHERE uuid = ?1 AND status = ?3;",
        params![id.to_string(), status.as_str(), expected.as_str(), at_ms],
    );
    let changed = match result {
        Ok(changed) => changed,
        Err(err) if is_unique_violation(&err) => {
            return Err(RepoError::Conflict(format!(
                "proxy {id} cannot become a second approved proxy"
            )));
        }
        Err(err) => return Err(err.into()),
    };

    if changed == 0 {
        return match load_proxy(conn, id)? {
            None => Err(RepoError::NotFound { entity: "proxy", id }),
            Some(current) => Err(RepoError::Conflict(format!(
                "proxy {id} is {}, expected {}",
                current.status.as_str(),
                expected.as_str()
            ))),
        };
    }
    Ok(())
}

/// Moves every unit the principal owns to the representative.
///
/// Callers have already checked, inside the same transaction, that the
/// principal has no other approved proxy, so any unit not held by the
/// principal is an orphan left behind by an interrupted write and is taken
/// over as well.
fn transfer_units(
    conn: &Connection,
    principal: MemberId,
    representative: &Representative,
) -> RepoResult<Vec<UnitId>> {
    let units = select_unit_ids(
        conn,
        "SELECT uuid FROM units
         WHERE owner_uuid = ?1
         ORDER BY number ASC;",
        &principal.to_string(),
    )?;
    if units.is_empty() {
        return Err(RepoError::Conflict(format!(
            "principal {principal} owns no units to delegate"
        )));
    }

    let stale: i64 = conn.query_row(
        "SELECT COUNT(*) FROM units WHERE owner_uuid = ?1 AND holder_kind <> 'principal';",
        [principal.to_string()],
        |row| row.get(0),
    )?;
    if stale > 0 {
        warn!(
            "event=proxy_transfer_units module=repo status=orphan_takeover principal={} units={}",
            principal, stale
        );
    }

    let rep = HolderColumns::from_representative(representative);
    conn.execute(
        "UPDATE units
         SET
            holder_kind = ?2,
            holder_member_uuid = ?3,
            holder_name = ?4,
            holder_document = ?5
         WHERE owner_uuid = ?1;",
        params![principal.to_string(), rep.kind, rep.member, rep.name, rep.document],
    )?;
    Ok(units)
}

fn revert_units(
    conn: &Connection,
    principal: MemberId,
    representative: &Representative,
) -> RepoResult<Vec<UnitId>> {
    let rep = HolderColumns::from_representative(representative);
    let mut stmt = conn.prepare(
        "SELECT uuid FROM units
         WHERE owner_uuid = ?1
           AND holder_kind = ?2
           AND holder_member_uuid IS ?3
           AND holder_name IS ?4
           AND holder_document IS ?5
         ORDER BY number ASC;",
    )?;
    let mut rows = stmt.query(params![
        principal.to_string(),
        rep.kind,
        rep.member,
        rep.name,
        rep.document
    ])?;
    let mut units = Vec::new();
    while let Some(row) = rows.next()? {
        let text: String = row.get(0)?;
        units.push(parse_uuid(&text, "units.uuid")?);
    }

    let reverted = conn.execute(
        "UPDATE units
         SET
            holder_kind = 'principal',
            holder_member_uuid = owner_uuid,
            holder_name = NULL,
            holder_document = NULL
         WHERE owner_uuid = ?1
           AND holder_kind = ?2
           AND holder_member_uuid IS ?3
           AND holder_name IS ?4
           AND holder_document IS ?5;",
        params![principal.to_string(), rep.kind, rep.member, rep.name, rep.document],
    )?;
    if reverted != units.len() {
        warn!(
            "event=proxy_revert_units module=repo status=mismatch selected={} updated={}",
            units.len(),
            reverted
        );
    }
    Ok(units)
}

fn select_unit_ids(conn: &Connection, sql: &str, key: &str) -> RepoResult<Vec<UnitId>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([key])?;
    let mut ids = Vec::new();
    while let Some(row) = rows.next()? {
        let text: String = row.get(0)?;
        ids.push(parse_uuid(&text, "units.uuid")?);
    }
    Ok(ids)
}

fn parse_proxy_row(row: &Row<'_>) -> RepoResult<Proxy> {
    let uuid_text: String = row.get("uuid")?;
    let principal_text: String = row.get("principal_uuid")?;
    let rep_kind: String = row.get("rep_kind")?;

    let kind_text: String = row.get("kind")?;
    let kind = DelegationType::parse(&kind_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid delegation type `{kind_text}` in proxies.kind"))
    })?;

    let status_text: String = row.get("status")?;
    let status = ProxyStatus::parse(&status_text).ok_or_else(|| {
        RepoError::InvalidData(format!("invalid proxy status `{status_text}` in proxies.status"))
    })?;

    let verification_method = match row.get::<_, Option<String>>("verification_method")? {
        Some(value) => Some(VerificationMethod::parse(&value).ok_or_else(|| {
            RepoError::InvalidData(format!(
                "invalid verification method `{value}` in proxies.verification_method"
            ))
        })?),
        None => None,
    };

    Ok(Proxy {
        uuid: parse_uuid(&uuid_text, "proxies.uuid")?,
        principal: parse_uuid(&principal_text, "proxies.principal_uuid")?,
        representative: HolderColumns::into_representative(
            &rep_kind,
            row.get("rep_member_uuid")?,
            row.get("rep_name")?,
            row.get("rep_document")?,
            "proxies",
        )?,
        kind,
        status,
        evidence_ref: row.get("evidence_ref")?,
        verification_method,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}
