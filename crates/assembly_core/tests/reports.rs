use assembly_core::db::open_db_in_memory;
use assembly_core::repo::unit_repo::UnitRepository;
use assembly_core::{
    Assembly, DelegationType, Evidence, ManualClock, Member, ProxyService, QuorumService,
    ReportService, Representative, ServiceContext, ServiceError, SqliteStore, Unit, VoteService,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const START_MS: i64 = 1_700_000_000_000;

struct Fixture {
    clock: Arc<ManualClock>,
    ctx: ServiceContext,
    assembly: Assembly,
    ana: Member,
    unit_101: Unit,
    unit_102: Unit,
    unit_201: Unit,
}

/// Ana delegates both units to an external representative; Luis holds his own.
fn fixture(store: &SqliteStore<'_>) -> Fixture {
    let clock = Arc::new(ManualClock::new(START_MS));
    let ctx = ServiceContext::default().with_clock(clock.clone());

    let assembly = Assembly::new("Conjunto Los Pinos", START_MS);
    store.create_assembly(&assembly).unwrap();
    let ana = Member::new("Ana Gómez", "1001").unwrap();
    let luis = Member::new("Luis Pardo", "1002").unwrap();
    store.create_member(&ana).unwrap();
    store.create_member(&luis).unwrap();

    let unit_101 = Unit::new(assembly.uuid, "101", 0.2, ana.uuid);
    let unit_102 = Unit::new(assembly.uuid, "102", 0.1, ana.uuid);
    let unit_201 = Unit::new(assembly.uuid, "201", 0.7, luis.uuid);
    for unit in [&unit_101, &unit_102, &unit_201] {
        store.create_unit(unit).unwrap();
    }

    ProxyService::new(*store, ctx.clone())
        .register(
            ana.uuid,
            Representative::external("Eva Ríos", "52.345.678").unwrap(),
            DelegationType::SignedDocumentGeneric,
            Evidence::Document {
                locator: "uploads/poder-ana.pdf".to_string(),
            },
        )
        .unwrap();

    Fixture {
        clock,
        ctx,
        assembly,
        ana,
        unit_101,
        unit_102,
        unit_201,
    }
}

#[test]
fn attendance_lists_newest_check_in_first_with_current_holder() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let f = fixture(&store);
    let quorum = QuorumService::new(store, f.ctx.clone());

    quorum.check_in(f.unit_101.uuid).unwrap();
    f.clock.advance(Duration::from_secs(1));
    quorum.check_in(f.unit_201.uuid).unwrap();

    let report = ReportService::new(store).attendance(f.assembly.uuid).unwrap();
    let numbers: Vec<&str> = report.rows.iter().map(|row| row.unit_number.as_str()).collect();
    assert_eq!(numbers, ["201", "101"]);
    assert_eq!(report.rows[0].representative_name, "Luis Pardo");
    assert_eq!(report.rows[0].check_in_at, START_MS + 1_000);
    assert_eq!(report.rows[1].representative_name, "Eva Ríos");
    assert!((report.total_coefficient - 0.9).abs() < 1e-9);
}

#[test]
fn absence_lists_units_never_checked_in() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let f = fixture(&store);
    QuorumService::new(store, f.ctx.clone())
        .check_in(f.unit_201.uuid)
        .unwrap();

    let report = ReportService::new(store).absence(f.assembly.uuid).unwrap();
    let units: Vec<Uuid> = report.rows.iter().map(|row| row.unit).collect();
    assert_eq!(units.len(), 2);
    assert!(units.contains(&f.unit_101.uuid));
    assert!(units.contains(&f.unit_102.uuid));
    assert!(report
        .rows
        .iter()
        .all(|row| row.representative_name == "Eva Ríos"));
    assert!((report.total_coefficient - 0.3).abs() < 1e-9);
}

#[test]
fn proxy_report_has_one_row_per_delegated_unit() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let f = fixture(&store);

    let rows = ReportService::new(store).proxies(f.assembly.uuid).unwrap();
    assert_eq!(rows.len(), 2);
    assert!(rows.iter().all(|row| row.principal_name == f.ana.full_name));

    let json = serde_json::to_value(&rows).unwrap();
    let first = &json[0];
    assert_eq!(first["kind"], "signed_document_generic");
    assert_eq!(first["status"], "APPROVED");
    assert_eq!(first["principal_doc"], "1001");
    assert_eq!(first["representative_name"], "Eva Ríos");
    assert_eq!(first["representative_doc"], "52345678");
    assert_eq!(first["created_at"], json!(START_MS));
    assert!(rows.iter().all(|row| row.unit != f.unit_201.uuid));
}

#[test]
fn vote_report_serializes_weighted_tallies_newest_first() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let f = fixture(&store);
    let votes = VoteService::new(store, f.ctx.clone());

    let budget = votes
        .create_vote(
            f.assembly.uuid,
            "Presupuesto 2027",
            &["Sí".to_string(), "No".to_string()],
        )
        .unwrap();
    f.clock.advance(Duration::from_secs(60));
    let board = votes
        .create_vote(
            f.assembly.uuid,
            "Consejo de administración",
            &["Lista A".to_string(), "Lista B".to_string()],
        )
        .unwrap();

    votes
        .cast(budget.uuid, f.unit_101.uuid, budget.options[0].uuid)
        .unwrap();
    votes
        .cast(budget.uuid, f.unit_201.uuid, budget.options[1].uuid)
        .unwrap();
    votes.close_vote(budget.uuid).unwrap();

    let tallies = ReportService::new(store).votes(f.assembly.uuid).unwrap();
    assert_eq!(tallies.len(), 2);
    assert_eq!(tallies[0].vote_id, board.uuid);
    assert_eq!(tallies[0].total_ballots, 0);

    let json: Value = serde_json::to_value(&tallies[1]).unwrap();
    assert_eq!(json["title"], "Presupuesto 2027");
    assert_eq!(json["status"], "CLOSED");
    assert_eq!(json["total_ballots"], 2);
    assert_eq!(json["results"][0]["label"], "Sí");
    assert_eq!(json["results"][0]["count"], 1);
    let yes = json["results"][0]["percentage"].as_f64().unwrap();
    let no = json["results"][1]["percentage"].as_f64().unwrap();
    assert!((yes - 22.222_222_222).abs() < 1e-6, "yes={yes}");
    assert!((no - 77.777_777_777).abs() < 1e-6, "no={no}");
}

#[test]
fn reports_for_unknown_assembly_are_not_found() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    fixture(&store);
    let reports = ReportService::new(store);
    let missing = Uuid::new_v4();

    assert!(matches!(
        reports.attendance(missing),
        Err(ServiceError::NotFound { entity: "assembly", .. })
    ));
    assert!(matches!(
        reports.absence(missing),
        Err(ServiceError::NotFound { entity: "assembly", .. })
    ));
    assert!(matches!(
        reports.votes(missing),
        Err(ServiceError::NotFound { entity: "assembly", .. })
    ));
    assert!(matches!(
        reports.proxies(missing),
        Err(ServiceError::NotFound { entity: "assembly", .. })
    ));

    let other = Assembly::new("Torre Sur", START_MS);
    store.create_assembly(&other).unwrap();
    let empty = reports.proxies(other.uuid).unwrap();
    assert!(empty.is_empty());
}
