//! Behaviour every `TaskStore` must share, checked against both
//! implementations.

use chrono::{DateTime, Duration, TimeZone, Utc};
use rstest::rstest;
use std::collections::HashSet;
use std::sync::Arc;

use courier_core::impls::{InMemoryTaskStore, SqliteTaskStore};
use courier_core::ports::{EligibleQuery, FixedClock};
use courier_core::{NewTask, TaskId, TaskRecord, TaskStore, TaskType};
use ulid::Ulid;

type StoreFactory = fn(FixedClock) -> Arc<dyn TaskStore>;

fn memory(clock: FixedClock) -> Arc<dyn TaskStore> {
    Arc::new(InMemoryTaskStore::with_clock(Arc::new(clock)))
}

fn sqlite(clock: FixedClock) -> Arc<dyn TaskStore> {
    Arc::new(
        SqliteTaskStore::open_in_memory()
            .unwrap()
            .with_clock(Arc::new(clock)),
    )
}

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
}

fn task(task_type: &str, n: u32) -> NewTask {
    NewTask::new(TaskType::new(task_type), serde_json::json!({ "n": n }))
}

fn ns(records: &[TaskRecord]) -> Vec<u64> {
    records
        .iter()
        .map(|r| r.payload["n"].as_u64().unwrap())
        .collect()
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn unset_wait_until_first_then_oldest(#[case] make: StoreFactory) {
    let clock = FixedClock::new(t0());
    let store = make(clock.clone());
    let c1 = t0();
    let c2 = t0() + Duration::milliseconds(1);
    let c3 = t0() + Duration::milliseconds(2);

    clock.set(c2);
    store.insert(task("a", 2)).await.unwrap();
    clock.set(c1);
    store.insert(task("a", 1)).await.unwrap();
    clock.set(c3);
    store.insert(task("a", 3).wait_until(c1)).await.unwrap();

    let rows = store
        .query_eligible(&EligibleQuery::new(c3, 10))
        .await
        .unwrap();
    assert_eq!(ns(&rows), vec![1, 2, 3]);
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn due_tasks_ordered_by_wait_until(#[case] make: StoreFactory) {
    let clock = FixedClock::new(t0());
    let store = make(clock.clone());

    store
        .insert(task("a", 30).wait_until(t0() + Duration::seconds(30)))
        .await
        .unwrap();
    clock.advance(Duration::milliseconds(1));
    store
        .insert(task("a", 10).wait_until(t0() + Duration::seconds(10)))
        .await
        .unwrap();
    clock.advance(Duration::milliseconds(1));
    store
        .insert(task("a", 20).wait_until(t0() + Duration::seconds(20)))
        .await
        .unwrap();

    let rows = store
        .query_eligible(&EligibleQuery::new(t0() + Duration::seconds(60), 10))
        .await
        .unwrap();
    assert_eq!(ns(&rows), vec![10, 20, 30]);
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn future_tasks_are_not_eligible(#[case] make: StoreFactory) {
    let store = make(FixedClock::new(t0()));
    let due = t0() + Duration::seconds(10);
    store.insert(task("a", 1).wait_until(due)).await.unwrap();

    let before = store
        .query_eligible(&EligibleQuery::new(due - Duration::milliseconds(1), 10))
        .await
        .unwrap();
    let at = store
        .query_eligible(&EligibleQuery::new(due, 10))
        .await
        .unwrap();

    assert!(before.is_empty());
    assert_eq!(ns(&at), vec![1]);
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn excluded_types_and_ids_are_skipped(#[case] make: StoreFactory) {
    let clock = FixedClock::new(t0());
    let store = make(clock.clone());
    let mut ids = Vec::new();
    for (n, ty) in [(1, "a"), (2, "b"), (3, "a"), (4, "c")] {
        ids.push(store.insert(task(ty, n)).await.unwrap().id);
        clock.advance(Duration::milliseconds(1));
    }

    let mut query = EligibleQuery::new(t0() + Duration::seconds(1), 10);
    query.exclude_types.insert(TaskType::new("b"));
    query.exclude_ids.insert(ids[0]);
    let rows = store.query_eligible(&query).await.unwrap();

    assert_eq!(ns(&rows), vec![3, 4]);
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn large_exclusion_sets_are_accepted(#[case] make: StoreFactory) {
    let clock = FixedClock::new(t0());
    let store = make(clock.clone());
    let claimed = store.insert(task("a", 1)).await.unwrap();
    clock.advance(Duration::milliseconds(1));
    store.insert(task("b", 2)).await.unwrap();

    let mut query = EligibleQuery::new(t0() + Duration::seconds(1), 10);
    query.exclude_ids = (0..40_000).map(|_| TaskId::from_ulid(Ulid::new())).collect();
    query.exclude_ids.insert(claimed.id);
    query.exclude_types = (0..40_000).map(|n| TaskType::new(format!("t{n}"))).collect();
    let rows = store.query_eligible(&query).await.unwrap();

    assert_eq!(ns(&rows), vec![2]);
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn limit_caps_the_page(#[case] make: StoreFactory) {
    let clock = FixedClock::new(t0());
    let store = make(clock.clone());
    for n in 0..5 {
        store.insert(task("a", n)).await.unwrap();
        clock.advance(Duration::milliseconds(1));
    }

    let rows = store
        .query_eligible(&EligibleQuery::new(t0() + Duration::seconds(1), 3))
        .await
        .unwrap();
    assert_eq!(ns(&rows), vec![0, 1, 2]);
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn delete_is_idempotent(#[case] make: StoreFactory) {
    let store = make(FixedClock::new(t0()));
    let gone = store.insert(task("a", 1)).await.unwrap();
    let kept = store.insert(task("a", 2)).await.unwrap();

    let ids = HashSet::from([gone.id]);
    store.delete_by_ids(&ids).await.unwrap();
    store.delete_by_ids(&ids).await.unwrap();
    store.delete_by_ids(&HashSet::new()).await.unwrap();

    assert_eq!(store.count_pending().await.unwrap(), 1);
    let rows = store
        .query_eligible(&EligibleQuery::new(t0(), 10))
        .await
        .unwrap();
    assert_eq!(rows, vec![kept]);
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn followups_replace_completed_tasks(#[case] make: StoreFactory) {
    let store = make(FixedClock::new(t0()));
    let parent = store.insert(task("fanout", 0)).await.unwrap();
    let bystander = store.insert(task("other", 9)).await.unwrap();

    let inserted = store
        .complete_with_followups(
            &HashSet::from([parent.id]),
            vec![task("email", 1), task("push", 2)],
        )
        .await
        .unwrap();

    assert_eq!(inserted.len(), 2);
    let rows = store
        .query_eligible(&EligibleQuery::new(t0(), 10))
        .await
        .unwrap();
    let ids: HashSet<_> = rows.iter().map(|r| r.id).collect();
    assert!(!ids.contains(&parent.id));
    assert!(ids.contains(&bystander.id));
    assert!(inserted.iter().all(|r| ids.contains(&r.id)));
    assert_eq!(store.count_pending().await.unwrap(), 3);
}

#[rstest]
#[case::memory(memory as StoreFactory)]
#[case::sqlite(sqlite as StoreFactory)]
#[tokio::test]
async fn inserted_record_matches_stored_row(#[case] make: StoreFactory) {
    let store = make(FixedClock::new(t0()));
    let record = store
        .insert(task("a", 7).wait_until(t0() - Duration::seconds(1)))
        .await
        .unwrap();

    assert_eq!(record.created, t0());
    let rows = store
        .query_eligible(&EligibleQuery::new(t0(), 10))
        .await
        .unwrap();
    assert_eq!(rows, vec![record]);
}
