use chrono::Utc;
use fieldsync_storage::{StorageError, SyncStore};
use fieldsync_types::{
    ChecklistUpdate, Conflict, ConflictType, Job, JobId, JobStatus, OperationPayload,
    OperationStatus, Resolution, StartReport,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn setup() -> (SyncStore, Job) {
    let store = SyncStore::open_in_memory().unwrap();
    let job = Job::new(JobId::new()).started(Utc::now());
    store.upsert_job(&job).unwrap();
    (store, job)
}

fn conflict(job: &Job, kind: ConflictType) -> Conflict {
    Conflict::new(
        job.id,
        kind,
        json!({ "status": "in_progress" }),
        json!({ "status": "cancelled" }),
    )
}

#[test]
fn insert_and_load_roundtrip() {
    let (store, job) = setup();
    let c = conflict(&job, ConflictType::Cancellation).with_reason("not found remotely");
    store.insert_conflict(&c).unwrap();

    let loaded = store.get_conflict(&c.id).unwrap().unwrap();
    assert_eq!(loaded, c);
    assert!(store.has_unresolved_conflict(&job.id).unwrap());
    assert_eq!(store.unresolved_conflicts().unwrap().len(), 1);
}

#[test]
fn local_wins_only_marks_the_conflict() {
    let (store, job) = setup();
    let c = conflict(&job, ConflictType::DataMismatch);
    store.insert_conflict(&c).unwrap();
    store
        .enqueue(
            &job.id,
            OperationPayload::Checklist(ChecklistUpdate {
                item_id: "oven".into(),
                completed: true,
                updated_at: Utc::now(),
            }),
        )
        .unwrap();

    assert_eq!(store.settle_conflict(&c.id, Resolution::LocalWins).unwrap(), 0);

    let loaded = store.get_conflict(&c.id).unwrap().unwrap();
    assert!(loaded.resolved);
    assert_eq!(loaded.resolution, Some(Resolution::LocalWins));
    assert!(loaded.resolved_at.is_some());
    assert!(store.get_job(&job.id).unwrap().unwrap().requires_sync);
    assert!(!store.has_unresolved_conflict(&job.id).unwrap());
}

#[test]
fn resolution_is_immutable() {
    let (store, job) = setup();
    let c = conflict(&job, ConflictType::MultiCleaner);
    store.insert_conflict(&c).unwrap();
    store.settle_conflict(&c.id, Resolution::Merged).unwrap();

    let err = store.settle_conflict(&c.id, Resolution::ServerWins).unwrap_err();
    assert!(matches!(err, StorageError::ConflictResolved(id) if id == c.id));
    let loaded = store.get_conflict(&c.id).unwrap().unwrap();
    assert_eq!(loaded.resolution, Some(Resolution::Merged));
}

#[test]
fn server_wins_on_cancellation_locks_and_discards() {
    let (store, job) = setup();
    let start = store
        .enqueue(
            &job.id,
            OperationPayload::Start(StartReport {
                started_at: Utc::now(),
                worker_id: None,
            }),
        )
        .unwrap();
    store.mark_completed(&start.id).unwrap();
    let pending = store
        .enqueue(
            &job.id,
            OperationPayload::Checklist(ChecklistUpdate {
                item_id: "oven".into(),
                completed: true,
                updated_at: Utc::now(),
            }),
        )
        .unwrap();

    let c = conflict(&job, ConflictType::Cancellation);
    store.insert_conflict(&c).unwrap();
    assert_eq!(store.settle_conflict(&c.id, Resolution::ServerWins).unwrap(), 1);

    let job = store.get_job(&job.id).unwrap().unwrap();
    assert!(!job.requires_sync);
    assert!(job.locked);
    assert!(job.needs_refresh);
    assert_eq!(job.status, JobStatus::Cancelled);

    // Soft-deleted: the record remains but the queue no longer offers it.
    let discarded = store.get_operation(&pending.id).unwrap().unwrap();
    assert_eq!(discarded.status, OperationStatus::Pending);
    assert!(store.sync_candidates(5).unwrap().is_empty());
    assert_eq!(store.operations_for_job(&job.id).unwrap().len(), 1);
}

#[test]
fn server_wins_on_data_mismatch_keeps_status() {
    let (store, job) = setup();
    store
        .enqueue(
            &job.id,
            OperationPayload::Checklist(ChecklistUpdate {
                item_id: "oven".into(),
                completed: true,
                updated_at: Utc::now(),
            }),
        )
        .unwrap();
    let c = conflict(&job, ConflictType::DataMismatch);
    store.insert_conflict(&c).unwrap();
    assert_eq!(store.settle_conflict(&c.id, Resolution::ServerWins).unwrap(), 1);

    let job = store.get_job(&job.id).unwrap().unwrap();
    assert_eq!(job.status, JobStatus::InProgress);
    assert!(!job.locked);
    assert!(!job.requires_sync);
    assert!(job.needs_refresh);
    assert!(store.sync_candidates(5).unwrap().is_empty());
}

#[test]
fn settle_unknown_conflict_is_not_found() {
    let store = SyncStore::open_in_memory().unwrap();
    let c = Conflict::new(JobId::new(), ConflictType::Cancellation, json!({}), json!(null));
    assert!(matches!(
        store.settle_conflict(&c.id, Resolution::LocalWins),
        Err(StorageError::NotFound(_))
    ));
}

#[test]
fn conflicts_for_job_lists_history() {
    let (store, job) = setup();
    let first = conflict(&job, ConflictType::MultiCleaner);
    let second = conflict(&job, ConflictType::DataMismatch);
    store.insert_conflict(&first).unwrap();
    store.insert_conflict(&second).unwrap();
    store.settle_conflict(&first.id, Resolution::Merged).unwrap();

    let all = store.conflicts_for_job(&job.id).unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(store.unresolved_conflicts().unwrap()[0].id, second.id);
}

// ── Record and settle in one step ──

#[test]
fn record_conflict_with_resolution_settles_atomically() {
    let (store, job) = setup();
    store
        .enqueue(
            &job.id,
            OperationPayload::Start(StartReport {
                started_at: Utc::now(),
                worker_id: Some("ana".into()),
            }),
        )
        .unwrap();

    let c = conflict(&job, ConflictType::DataMismatch);
    let discarded = store.record_conflict(&c, Some(Resolution::ServerWins)).unwrap();
    assert_eq!(discarded, 1);

    let stored = store.get_conflict(&c.id).unwrap().unwrap();
    assert!(stored.resolved);
    assert_eq!(stored.resolution, Some(Resolution::ServerWins));
    assert!(stored.resolved_at.is_some());
    assert!(!store.has_unresolved_conflict(&job.id).unwrap());
    assert!(store.sync_candidates(5).unwrap().is_empty());
}

#[test]
fn record_conflict_without_resolution_stays_open() {
    let (store, job) = setup();
    let c = conflict(&job, ConflictType::MultiCleaner);
    assert_eq!(store.record_conflict(&c, None).unwrap(), 0);
    assert!(store.has_unresolved_conflict(&job.id).unwrap());
}
