//! Assembly, member, unit and attendance persistence.
//!
//! # Responsibility
//! - Store the entities quorum and vote weighting read.
//! - Provide the conditional rights-holder update used by reconciliation.
//!
//! # Invariants
//! - `update_unit_rights_holder` only writes when the stored holder equals
//!   the caller's expected holder.
//! - `append_attendance` never creates a second row for the same unit.

use crate::model::assembly::{validate_coefficient, Assembly, AttendanceRecord, Member, Unit};
use crate::model::holder::RightsHolder;
use crate::model::{AssemblyId, MemberId, UnitId};
use crate::repo::{is_unique_violation, parse_uuid, HolderColumns, RepoError, RepoResult, SqliteStore};
use rusqlite::{params, Connection, OptionalExtension, Row};

pub(crate) const UNIT_SELECT_SQL: &str = "SELECT
    uuid,
    assembly_uuid,
    number,
    coefficient,
    owner_uuid,
    holder_kind,
    holder_member_uuid,
    holder_name,
    holder_document
FROM units";

/// Repository interface for assemblies, members, units and attendance.
pub trait UnitRepository {
    fn create_assembly(&self, assembly: &Assembly) -> RepoResult<()>;
    fn get_assembly(&self, id: AssemblyId) -> RepoResult<Option<Assembly>>;
    fn create_member(&self, member: &Member) -> RepoResult<()>;
    fn get_member(&self, id: MemberId) -> RepoResult<Option<Member>>;
    fn create_unit(&self, unit: &Unit) -> RepoResult<()>;
    fn get_unit(&self, id: UnitId) -> RepoResult<Option<Unit>>;
    /// Lists all units of one assembly ordered by display number.
    fn list_units(&self, assembly: AssemblyId) -> RepoResult<Vec<Unit>>;
    /// Lists every unit owned by one member across assemblies.
    fn list_units_owned_by(&self, owner: MemberId) -> RepoResult<Vec<Unit>>;
    /// Replaces the holder when the stored one equals `expected`.
    ///
    /// Returns `Conflict` when the stored holder differs.
    fn update_unit_rights_holder(
        &self,
        unit: UnitId,
        expected: &RightsHolder,
        holder: &RightsHolder,
    ) -> RepoResult<()>;
    /// Edits a unit weight. Already cast ballots keep their recorded weight.
    fn set_unit_coefficient(&self, unit: UnitId, coefficient: f64) -> RepoResult<()>;
    /// Lists attendance rows of one assembly, newest first.
    fn list_attendance(&self, assembly: AssemblyId) -> RepoResult<Vec<AttendanceRecord>>;
    /// Records a check-in. Returns `false` when the unit was already present.
    fn append_attendance(&self, unit: UnitId, at_ms: i64) -> RepoResult<bool>;
}

impl UnitRepository for SqliteStore<'_> {
    fn create_assembly(&self, assembly: &Assembly) -> RepoResult<()> {
        self.connection().execute(
            "INSERT INTO assemblies (uuid, name, created_at) VALUES (?1, ?2, ?3);",
            params![
                assembly.uuid.to_string(),
                assembly.name.as_str(),
                assembly.created_at
            ],
        )?;
        Ok(())
    }

    fn get_assembly(&self, id: AssemblyId) -> RepoResult<Option<Assembly>> {
        let row = self
            .connection()
            .query_row(
                "SELECT uuid, name, created_at FROM assemblies WHERE uuid = ?1;",
                [id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>("uuid")?,
                        row.get::<_, String>("name")?,
                        row.get::<_, i64>("created_at")?,
                    ))
                },
            )
            .optional()?;

        row.map(|(uuid, name, created_at)| {
            Ok(Assembly {
                uuid: parse_uuid(&uuid, "assemblies.uuid")?,
                name,
                created_at,
            })
        })
        .transpose()
    }

    fn create_member(&self, member: &Member) -> RepoResult<()> {
        let result = self.connection().execute(
            "INSERT INTO members (uuid, full_name, document_number) VALUES (?1, ?2, ?3);",
            params![
                member.uuid.to_string(),
                member.full_name.as_str(),
                member.document_number.as_str()
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RepoError::Conflict(format!(
                "member with document number {} already registered",
                member.document_number
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn get_member(&self, id: MemberId) -> RepoResult<Option<Member>> {
        load_member(self.connection(), id)
    }

    fn create_unit(&self, unit: &Unit) -> RepoResult<()> {
        unit.validate()?;
        let holder = HolderColumns::from_holder(&unit.rights_holder);
        let result = self.connection().execute(
            "INSERT INTO units (
                uuid,
                assembly_uuid,
                number,
                coefficient,
                owner_uuid,
                holder_kind,
                holder_member_uuid,
                holder_name,
                holder_document
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9);",
            params![
                unit.uuid.to_string(),
                unit.assembly.to_string(),
                unit.number.trim(),
                unit.coefficient,
                unit.owner.to_string(),
                holder.kind,
                holder.member,
                holder.name,
                holder.document,
            ],
        );
        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => Err(RepoError::Conflict(format!(
                "unit number {} already exists in assembly {}",
                unit.number.trim(),
                unit.assembly
            ))),
            Err(err) => Err(err.into()),
        }
    }

    fn get_unit(&self, id: UnitId) -> RepoResult<Option<Unit>> {
        load_unit(self.connection(), id)
    }

    fn list_units(&self, assembly: AssemblyId) -> RepoResult<Vec<Unit>> {
        query_units(
            self.connection(),
            &format!("{UNIT_SELECT_SQL} WHERE assembly_uuid = ?1 ORDER BY number ASC, uuid ASC;"),
            &assembly.to_string(),
        )
    }

    fn list_units_owned_by(&self, owner: MemberId) -> RepoResult<Vec<Unit>> {
        query_units(
            self.connection(),
            &format!("{UNIT_SELECT_SQL} WHERE owner_uuid = ?1 ORDER BY number ASC, uuid ASC;"),
            &owner.to_string(),
        )
    }

    fn update_unit_rights_holder(
        &self,
        unit: UnitId,
        expected: &RightsHolder,
        holder: &RightsHolder,
    ) -> RepoResult<()> {
        let expected_cols = HolderColumns::from_holder(expected);
        let new_cols = HolderColumns::from_holder(holder);
        let changed = self.connection().execute(
            "UPDATE units
             SET
                holder_kind = ?2,
                holder_member_uuid = ?3,
                holder_name = ?4,
                holder_document = ?5
             WHERE uuid = ?1
               AND holder_kind = ?6
               AND holder_member_uuid IS ?7
               AND holder_name IS ?8
               AND holder_document IS ?9;",
            params![
                unit.to_string(),
                new_cols.kind,
                new_cols.member,
                new_cols.name,
                new_cols.document,
                expected_cols.kind,
                expected_cols.member,
                expected_cols.name,
                expected_cols.document,
            ],
        )?;

        if changed == 0 {
            if load_unit(self.connection(), unit)?.is_none() {
                return Err(RepoError::NotFound { entity: "unit", id: unit });
            }
            return Err(RepoError::Conflict(format!(
                "unit {unit} rights holder changed concurrently"
            )));
        }
        Ok(())
    }

    fn set_unit_coefficient(&self, unit: UnitId, coefficient: f64) -> RepoResult<()> {
        validate_coefficient(coefficient)?;
        let changed = self.connection().execute(
            "UPDATE units SET coefficient = ?2 WHERE uuid = ?1;",
            params![unit.to_string(), coefficient],
        )?;
        if changed == 0 {
            return Err(RepoError::NotFound { entity: "unit", id: unit });
        }
        Ok(())
    }

    fn list_attendance(&self, assembly: AssemblyId) -> RepoResult<Vec<AttendanceRecord>> {
        let mut stmt = self.connection().prepare(
            "SELECT a.unit_uuid, a.checked_in_at
             FROM attendance a
             INNER JOIN units u ON u.uuid = a.unit_uuid
             WHERE u.assembly_uuid = ?1
             ORDER BY a.checked_in_at DESC, a.unit_uuid ASC;",
        )?;
        let mut rows = stmt.query([assembly.to_string()])?;
        let mut records = Vec::new();
        while let Some(row) = rows.next()? {
            let unit_text: String = row.get("unit_uuid")?;
            records.push(AttendanceRecord {
                unit: parse_uuid(&unit_text, "attendance.unit_uuid")?,
                checked_in_at: row.get("checked_in_at")?,
            });
        }
        Ok(records)
    }

    fn append_attendance(&self, unit: UnitId, at_ms: i64) -> RepoResult<bool> {
        if load_unit(self.connection(), unit)?.is_none() {
            return Err(RepoError::NotFound { entity: "unit", id: unit });
        }
        let inserted = self.connection().execute(
            "INSERT OR IGNORE INTO attendance (unit_uuid, checked_in_at) VALUES (?1, ?2);",
            params![unit.to_string(), at_ms],
        )?;
        Ok(inserted == 1)
    }
}

pub(crate) fn load_member(conn: &Connection, id: MemberId) -> RepoResult<Option<Member>> {
    let row = conn
        .query_row(
            "SELECT uuid, full_name, document_number FROM members WHERE uuid = ?1;",
            [id.to_string()],
            |row| {
                Ok((
                    row.get::<_, String>("uuid")?,
                    row.get::<_, String>("full_name")?,
                    row.get::<_, String>("document_number")?,
                ))
            },
        )
        .optional()?;

    row.map(|(uuid, full_name, document_number)| {
        Ok(Member {
            uuid: parse_uuid(&uuid, "members.uuid")?,
            full_name,
            document_number,
        })
    })
    .transpose()
}

pub(crate) fn load_unit(conn: &Connection, id: UnitId) -> RepoResult<Option<Unit>> {
    let mut stmt = conn.prepare(&format!("{UNIT_SELECT_SQL} WHERE uuid = ?1;"))?;
    let mut rows = stmt.query([id.to_string()])?;
    if let Some(row) = rows.next()? {
        return Ok(Some(parse_unit_row(row)?));
    }
    Ok(None)
}

pub(crate) fn query_units(conn: &Connection, sql: &str, key: &str) -> RepoResult<Vec<Unit>> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows = stmt.query([key])?;
    let mut units = Vec::new();
    while let Some(row) = rows.next()? {
        units.push(parse_unit_row(row)?);
    }
    Ok(units)
}

pub(crate) fn parse_unit_row(row: &Row<'_>) -> RepoResult<Unit> {
    let uuid_text: String = row.get("uuid")?;
    let assembly_text: String = row.get("assembly_uuid")?;
    let owner_text: String = row.get("owner_uuid")?;
    let holder_kind: String = row.get("holder_kind")?;

    let unit = Unit {
        uuid: parse_uuid(&uuid_text, "units.uuid")?,
        assembly: parse_uuid(&assembly_text, "units.assembly_uuid")?,
        number: row.get("number")?,
        coefficient: row.get("coefficient")?,
        owner: parse_uuid(&owner_text, "units.owner_uuid")?,
        rights_holder: HolderColumns::into_holder(
            &holder_kind,
            row.get("holder_member_uuid")?,
            row.get("holder_name")?,
            row.get("holder_document")?,
            "units",
        )?,
    };
    unit.validate().map_err(|err| {
        RepoError::InvalidData(format!("unit {} failed validation: {err}", unit.uuid))
    })?;
    Ok(unit)
}
