use assembly_core::db::{open_db, open_db_in_memory};
use assembly_core::repo::proxy_repo::ProxyRepository;
use assembly_core::repo::unit_repo::UnitRepository;
use assembly_core::{
    Assembly, DelegationType, Evidence, ManualClock, Member, Proxy, ProxyService, ProxyStatus,
    ReconcileService, Representative, RightsHolder, ServiceContext, SqliteStore, Unit,
};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;
use uuid::Uuid;

const START_MS: i64 = 1_700_000_000_000;
const TEN_MINUTES_MS: i64 = 600_000;

struct Building {
    ana: Member,
    luis: Member,
    ana_units: Vec<Unit>,
    luis_unit: Unit,
}

fn building(store: &SqliteStore<'_>) -> Building {
    let assembly = Assembly::new("Torre Norte", START_MS);
    store.create_assembly(&assembly).unwrap();
    let ana = Member::new("Ana Gómez", "1001").unwrap();
    let luis = Member::new("Luis Pardo", "1002").unwrap();
    store.create_member(&ana).unwrap();
    store.create_member(&luis).unwrap();

    let ana_units = vec![
        Unit::new(assembly.uuid, "101", 0.25, ana.uuid),
        Unit::new(assembly.uuid, "102", 0.25, ana.uuid),
    ];
    for unit in &ana_units {
        store.create_unit(unit).unwrap();
    }
    let luis_unit = Unit::new(assembly.uuid, "201", 0.5, luis.uuid);
    store.create_unit(&luis_unit).unwrap();

    Building {
        ana,
        luis,
        ana_units,
        luis_unit,
    }
}

/// Leaves the trace of a registration whose evidence step never completed.
fn broken_proxy(
    store: &SqliteStore<'_>,
    principal: &Member,
    representative: Representative,
    units: &[Unit],
    created_at: i64,
) -> Proxy {
    let proxy = Proxy::new(
        principal.uuid,
        representative.clone(),
        DelegationType::SignedDigital,
        ProxyStatus::Approved,
        None,
        created_at,
    );
    store.create_proxy(&proxy).unwrap();
    for unit in units {
        store
            .update_unit_rights_holder(
                unit.uuid,
                &RightsHolder::principal(principal.uuid),
                &RightsHolder::delegated(representative.clone()),
            )
            .unwrap();
    }
    proxy
}

fn context() -> ServiceContext {
    ServiceContext::default().with_clock(Arc::new(ManualClock::new(START_MS)))
}

fn holder_of(store: &SqliteStore<'_>, unit: &Unit) -> RightsHolder {
    store.get_unit(unit.uuid).unwrap().unwrap().rights_holder
}

#[test]
fn broken_proxy_is_repaired_and_sweep_is_idempotent() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let b = building(&store);
    let proxy = broken_proxy(
        &store,
        &b.ana,
        Representative::Internal { member: b.luis.uuid },
        &b.ana_units,
        START_MS - TEN_MINUTES_MS,
    );

    let sweeper = ReconcileService::new(store, context());
    let report = sweeper.sweep().unwrap();
    assert_eq!(report.repaired.len(), 2);
    assert!(report.repaired.iter().all(|repair| repair.proxy == Some(proxy.uuid)));
    assert_eq!(report.deleted_proxies, vec![proxy.uuid]);
    assert!(report.failed.is_empty());
    assert!(!report.has_failures());

    for unit in &b.ana_units {
        assert_eq!(holder_of(&store, unit), RightsHolder::principal(b.ana.uuid));
    }
    assert!(store.get_proxy(proxy.uuid).unwrap().is_none());

    let again = sweeper.sweep().unwrap();
    assert!(again.is_clean(), "second sweep changed state: {again:?}");
}

#[test]
fn proxies_inside_the_grace_window_are_left_alone() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let b = building(&store);
    let proxy = broken_proxy(
        &store,
        &b.ana,
        Representative::Internal { member: b.luis.uuid },
        &b.ana_units,
        START_MS - 30_000,
    );

    let clock = Arc::new(ManualClock::new(START_MS));
    let sweeper = ReconcileService::new(
        store,
        ServiceContext::default().with_clock(clock.clone()),
    );
    assert!(sweeper.sweep().unwrap().is_clean());
    assert!(store.get_proxy(proxy.uuid).unwrap().is_some());

    clock.advance(Duration::from_secs(120));
    let report = sweeper.sweep().unwrap();
    assert_eq!(report.deleted_proxies, vec![proxy.uuid]);
}

#[test]
fn valid_delegations_of_other_principals_are_untouched() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let b = building(&store);

    let external = Representative::external("Eva Ríos", "52.345.678").unwrap();
    let valid = ProxyService::new(store, context())
        .register(
            b.luis.uuid,
            external.clone(),
            DelegationType::UploadedDocument,
            Evidence::Document {
                locator: "uploads/luis.pdf".to_string(),
            },
        )
        .unwrap();
    broken_proxy(
        &store,
        &b.ana,
        external.clone(),
        &b.ana_units,
        START_MS - TEN_MINUTES_MS,
    );

    let mut ctx = context();
    ctx.clock = Arc::new(ManualClock::new(START_MS + TEN_MINUTES_MS));
    let report = ReconcileService::new(store, ctx).sweep().unwrap();
    assert_eq!(report.repaired.len(), 2);

    assert_eq!(holder_of(&store, &b.luis_unit), RightsHolder::delegated(external));
    assert_eq!(
        store.get_proxy(valid.proxy.uuid).unwrap().unwrap().status,
        ProxyStatus::Approved
    );
}

#[test]
fn proxy_without_transferred_units_is_still_removed() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let b = building(&store);
    let proxy = broken_proxy(
        &store,
        &b.ana,
        Representative::Internal { member: b.luis.uuid },
        &[],
        START_MS - TEN_MINUTES_MS,
    );

    let report = ReconcileService::new(store, context()).sweep().unwrap();
    assert!(report.repaired.is_empty());
    assert_eq!(report.deleted_proxies, vec![proxy.uuid]);
}

#[test]
fn orphaned_units_return_to_their_owner() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let b = building(&store);
    let representative = Representative::Internal { member: b.luis.uuid };
    store
        .update_unit_rights_holder(
            b.ana_units[0].uuid,
            &RightsHolder::principal(b.ana.uuid),
            &RightsHolder::delegated(representative),
        )
        .unwrap();

    let report = ReconcileService::new(store, context()).sweep().unwrap();
    assert_eq!(report.repaired.len(), 1);
    assert_eq!(report.repaired[0].unit, b.ana_units[0].uuid);
    assert_eq!(report.repaired[0].proxy, None);
    assert_eq!(
        holder_of(&store, &b.ana_units[0]),
        RightsHolder::principal(b.ana.uuid)
    );
}

#[test]
fn failed_repair_retains_proxy_for_the_next_sweep() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let b = building(&store);
    let proxy = broken_proxy(
        &store,
        &b.ana,
        Representative::Internal { member: b.luis.uuid },
        &b.ana_units,
        START_MS - TEN_MINUTES_MS,
    );

    conn.execute_batch(&format!(
        "CREATE TRIGGER block_unit BEFORE UPDATE ON units
         WHEN OLD.uuid = '{}'
         BEGIN
             SELECT RAISE(ABORT, 'unit locked');
         END;",
        b.ana_units[1].uuid
    ))
    .unwrap();

    let sweeper = ReconcileService::new(store, context());
    let report = sweeper.sweep().unwrap();
    assert_eq!(report.repaired.len(), 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].unit, b.ana_units[1].uuid);
    assert_eq!(report.retained_proxies, vec![proxy.uuid]);
    assert!(report.deleted_proxies.is_empty());
    assert!(report.has_failures());
    assert!(store.get_proxy(proxy.uuid).unwrap().is_some());

    conn.execute_batch("DROP TRIGGER block_unit;").unwrap();
    let retry = sweeper.sweep().unwrap();
    assert_eq!(retry.repaired.len(), 1);
    assert_eq!(retry.repaired[0].unit, b.ana_units[1].uuid);
    assert_eq!(retry.deleted_proxies, vec![proxy.uuid]);
    assert!(!retry.has_failures());
}

#[test]
fn sweep_never_deletes_a_proxy_revoked_after_the_scan() {
    let conn = open_db_in_memory().unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();
    let b = building(&store);
    let proxy = broken_proxy(
        &store,
        &b.ana,
        Representative::Internal { member: b.luis.uuid },
        &b.ana_units,
        START_MS - TEN_MINUTES_MS,
    );

    store.revoke_delegation(proxy.uuid, START_MS).unwrap();
    assert!(!store.delete_unevidenced_proxy(proxy.uuid).unwrap());
    let kept = store.get_proxy(proxy.uuid).unwrap().unwrap();
    assert_eq!(kept.status, ProxyStatus::Revoked);

    let valid = ProxyService::new(store, context())
        .register(
            b.luis.uuid,
            Representative::Internal { member: b.ana.uuid },
            DelegationType::UploadedDocument,
            Evidence::Document {
                locator: "uploads/luis.pdf".to_string(),
            },
        )
        .unwrap();
    assert!(!store.delete_unevidenced_proxy(valid.proxy.uuid).unwrap());
    assert!(store.get_proxy(valid.proxy.uuid).unwrap().is_some());
}

#[test]
fn concurrent_sweeps_repair_each_unit_once_and_spare_live_registrations() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("assembly.db");
    let conn = open_db(&path).unwrap();
    let store = SqliteStore::try_new(&conn).unwrap();

    let assembly = Assembly::new("Torre Central", START_MS);
    store.create_assembly(&assembly).unwrap();
    let stale = Representative::external("Eva Ríos", "52.345.678").unwrap();

    let mut broken = HashSet::new();
    let mut broken_units = HashSet::new();
    for idx in 0..6 {
        let owner = Member::new(format!("Owner {idx}"), &format!("300{idx}")).unwrap();
        store.create_member(&owner).unwrap();
        let units: Vec<Unit> = (0..2)
            .map(|n| Unit::new(assembly.uuid, format!("{idx}0{n}"), 0.05, owner.uuid))
            .collect();
        for unit in &units {
            store.create_unit(unit).unwrap();
            broken_units.insert(unit.uuid);
        }
        let proxy = broken_proxy(&store, &owner, stale.clone(), &units, START_MS - TEN_MINUTES_MS);
        broken.insert(proxy.uuid);
    }

    let marta = Member::new("Marta Ruiz", "4001").unwrap();
    let delegate = Member::new("Delegate", "4002").unwrap();
    store.create_member(&marta).unwrap();
    store.create_member(&delegate).unwrap();
    let marta_unit = Unit::new(assembly.uuid, "900", 0.4, marta.uuid);
    store.create_unit(&marta_unit).unwrap();

    let barrier = Arc::new(Barrier::new(3));
    let sweeps: Vec<_> = (0..2)
        .map(|_| {
            let path = path.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                let conn = open_db(&path).unwrap();
                let store = SqliteStore::try_new(&conn).unwrap();
                let sweeper = ReconcileService::new(store, context());
                barrier.wait();
                sweeper.sweep().unwrap()
            })
        })
        .collect();
    let register = {
        let path = path.clone();
        let barrier = barrier.clone();
        let principal = marta.uuid;
        let representative = delegate.uuid;
        thread::spawn(move || {
            let conn = open_db(&path).unwrap();
            let store = SqliteStore::try_new(&conn).unwrap();
            let service = ProxyService::new(store, context());
            barrier.wait();
            service
                .register(
                    principal,
                    Representative::Internal {
                        member: representative,
                    },
                    DelegationType::UploadedDocument,
                    Evidence::Document {
                        locator: "uploads/marta.pdf".to_string(),
                    },
                )
                .unwrap()
        })
    };

    let reports: Vec<_> = sweeps.into_iter().map(|h| h.join().unwrap()).collect();
    let live = register.join().unwrap();

    let mut deleted = Vec::new();
    let mut repaired = Vec::new();
    for report in &reports {
        assert!(!report.has_failures(), "{report:?}");
        deleted.extend(report.deleted_proxies.iter().copied());
        repaired.extend(report.repaired.iter().map(|repair| repair.unit));
    }

    let deleted_set: HashSet<Uuid> = deleted.iter().copied().collect();
    assert_eq!(deleted.len(), deleted_set.len(), "a proxy was deleted twice");
    assert_eq!(deleted_set, broken);

    let repaired_set: HashSet<Uuid> = repaired.iter().copied().collect();
    assert_eq!(repaired.len(), repaired_set.len(), "a unit was repaired twice");
    assert_eq!(repaired_set, broken_units);
    for (idx, report) in reports.iter().enumerate() {
        let other = &reports[1 - idx];
        for unit in &report.skipped {
            assert!(other.repaired.iter().any(|repair| repair.unit == *unit));
        }
    }

    let store = SqliteStore::try_new(&conn).unwrap();
    assert_eq!(
        store.get_proxy(live.proxy.uuid).unwrap().unwrap().status,
        ProxyStatus::Approved
    );
    assert_eq!(
        holder_of(&store, &marta_unit),
        RightsHolder::delegated(Representative::Internal {
            member: delegate.uuid
        })
    );
    assert!(reports
        .iter()
        .all(|report| report.repaired.iter().all(|repair| repair.unit != marta_unit.uuid)));
}
