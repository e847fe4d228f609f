use airsub_core::db::open_db_in_memory;
use airsub_core::{
    CellError, CellId, CellValidator, ManualClock, Owner, QueryContext, QuotaPolicy, RepoError,
    ServiceError, SqliteSubscriptionRepository, Subscription, SubscriptionService,
};
use rusqlite::Connection;
use std::sync::Arc;

const NOW_MS: i64 = 1_700_000_000_000;
const HOUR_MS: i64 = 3_600_000;

struct AnyCell;

impl CellValidator for AnyCell {
    fn validate_cell(&self, _cell: CellId) -> Result<(), CellError> {
        Ok(())
    }
}

fn service(
    conn: &Connection,
    max_per_cell: u32,
) -> SubscriptionService<SqliteSubscriptionRepository<'_>> {
    let repo = SqliteSubscriptionRepository::try_new(conn)
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(NOW_MS)))
        .with_cell_validator(Arc::new(AnyCell));
    SubscriptionService::with_quota(
        repo,
        QuotaPolicy {
            max_subscriptions_per_cell: max_per_cell,
        },
    )
}

fn active_sub(owner: &str, raw_cells: &[u64]) -> Subscription {
    Subscription::new(
        owner,
        "https://example.com/foo",
        raw_cells.iter().copied().map(CellId::new).collect(),
    )
    .with_window(Some(NOW_MS), Some(NOW_MS + HOUR_MS))
}

#[test]
fn create_enforces_per_cell_quota() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, 2);
    let ctx = QueryContext::background();

    service
        .create_subscription(&ctx, &active_sub("uss1", &[1, 2]))
        .unwrap();
    service
        .create_subscription(&ctx, &active_sub("uss1", &[2]))
        .unwrap();

    let err = service
        .create_subscription(&ctx, &active_sub("uss1", &[2, 3]))
        .unwrap_err();
    match err {
        ServiceError::QuotaExceeded {
            owner,
            limit,
            current,
        } => {
            assert_eq!(owner, Owner::new("uss1"));
            assert_eq!(limit, 2);
            assert_eq!(current, 2);
        }
        other => panic!("unexpected error: {other}"),
    }

    // Other cells and other owners are unaffected.
    service
        .create_subscription(&ctx, &active_sub("uss1", &[3]))
        .unwrap();
    service
        .create_subscription(&ctx, &active_sub("uss2", &[2]))
        .unwrap();
}

#[test]
fn default_quota_allows_ten_per_cell() {
    let conn = open_db_in_memory().unwrap();
    let repo = SqliteSubscriptionRepository::try_new(&conn)
        .unwrap()
        .with_clock(Arc::new(ManualClock::new(NOW_MS)))
        .with_cell_validator(Arc::new(AnyCell));
    let service = SubscriptionService::new(repo);
    let ctx = QueryContext::background();

    for _ in 0..10 {
        service
            .create_subscription(&ctx, &active_sub("uss1", &[5]))
            .unwrap();
    }
    assert!(matches!(
        service.create_subscription(&ctx, &active_sub("uss1", &[5])),
        Err(ServiceError::QuotaExceeded { current: 10, .. })
    ));
}

#[test]
fn put_routes_by_version() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, 10);
    let ctx = QueryContext::background();

    let created = service
        .put_subscription(&ctx, &active_sub("uss1", &[1]))
        .unwrap();
    assert!(created.is_persisted());

    let mut edit = created.clone();
    edit.url = "https://example.com/bar".to_string();
    let updated = service.put_subscription(&ctx, &edit).unwrap();
    assert_eq!(updated.url, "https://example.com/bar");
    assert_ne!(updated.version, created.version);

    let err = service.put_subscription(&ctx, &edit).unwrap_err();
    assert!(matches!(
        err,
        ServiceError::Repo(RepoError::VersionConflict { .. })
    ));
}

#[test]
fn notify_cells_advances_and_returns_touched_subscriptions() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, 10);
    let ctx = QueryContext::background();

    let near = service
        .create_subscription(&ctx, &active_sub("uss1", &[1, 2]))
        .unwrap();
    let far = service
        .create_subscription(&ctx, &active_sub("uss2", &[9]))
        .unwrap();

    let notified = service
        .notify_cells(&ctx, &[CellId::new(2), CellId::new(3)])
        .unwrap();
    assert_eq!(notified.len(), 1);
    assert_eq!(notified[0].id, near.id);
    assert_eq!(notified[0].notification_index, 1);

    assert_eq!(
        service
            .get_subscription(&ctx, far.id)
            .unwrap()
            .notification_index,
        0
    );
}

#[test]
fn search_and_delete_delegate_to_repository() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn, 10);
    let ctx = QueryContext::background();
    let owner = Owner::new("uss1");

    let mine = service
        .create_subscription(&ctx, &active_sub("uss1", &[4]))
        .unwrap();
    service
        .create_subscription(&ctx, &active_sub("uss2", &[4]))
        .unwrap();

    let cells = [CellId::new(4)];
    assert_eq!(
        service.search_subscriptions(&ctx, &cells, None).unwrap().len(),
        2
    );
    assert_eq!(
        service
            .search_subscriptions(&ctx, &cells, Some(&owner))
            .unwrap(),
        vec![mine.clone()]
    );

    let deleted = service.delete_subscription(&ctx, &mine).unwrap();
    assert_eq!(deleted.id, mine.id);
    assert!(matches!(
        service.get_subscription(&ctx, mine.id),
        Err(ServiceError::Repo(RepoError::NotFound(_)))
    ));
    assert!(matches!(
        service.search_subscriptions(&ctx, &[], None),
        Err(ServiceError::Repo(RepoError::BadRequest(_)))
    ));
}
