use futures::StreamExt;
use reliefsync_core::{
    Facility, FacilityDraft, FacilityPatch, FieldValue, Filter, OperationId, Record, Row, RowId,
    Table,
};
use reliefsync_engine::{ConnectionState, ReconcileOutcome, SkipReason};
use reliefsync_harness::{TestAdapter, TestBackend, fixtures};
use reliefsync_storage::{ErrorKind, RemoteStore, SubscriptionState};
use tokio::sync::mpsc;

async fn scoped_client(
    label: &str,
) -> Result<(TestBackend, TestAdapter, OperationId), Box<dyn std::error::Error>> {
    let backend = TestBackend::with_legacy(fixtures::hurricane_response())?;
    backend.migrator().migrate().await.into_result()?;
    let adapter = backend.client(label, None).await?;
    let op = adapter.operations().first().map(|o| o.id).ok_or("no operation")?;
    adapter.set_current_operation(op).await?;
    Ok((backend, adapter, op))
}

fn foreign_facility(op: OperationId, name: &str) -> Row {
    Row::new()
        .with("operation_id", FieldValue::Ref(op.into()))
        .with("name", name)
}

fn skipped(outcomes: &[ReconcileOutcome], id: RowId, reason: SkipReason) -> bool {
    outcomes.iter().any(|o| {
        matches!(o, ReconcileOutcome::Skipped { id: Some(got), reason: r, .. } if *got == id && *r == reason)
    })
}

// ============================================================================
// Echo suppression
// ============================================================================

#[tokio::test]
async fn echo_of_local_create_changes_nothing() -> Result<(), Box<dyn std::error::Error>> {
    let (_backend, ui, _) = scoped_client("ui").await?;
    let created = ui.create_facility(FacilityDraft::named("Shelter A")).await?;
    let before = ui.facilities();

    let outcomes = ui.process_pending_events();
    assert!(skipped(&outcomes, created.id.into(), SkipReason::Echo));
    assert!(outcomes.iter().all(|o| !o.changed_mirror()));
    assert_eq!(ui.facilities(), before);
    assert_eq!(ui.facilities().len(), 4);
    Ok(())
}

#[tokio::test]
async fn echo_before_confirmation_is_applied_once() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, _) = scoped_client("ui").await?;
    backend.remote.hold();

    let (created, (seen, count_before_confirm)) = tokio::join!(
        ui.create_facility(FacilityDraft::named("Shelter A")),
        async {
            backend.remote.until_waiting(1).await;
            let seen = ui.process_pending_events();
            let count = ui.facilities().len();
            backend.remote.release();
            (seen, count)
        }
    );
    let created = created?;

    assert!(matches!(
        seen.as_slice(),
        [ReconcileOutcome::Inserted { table: Table::Facilities, .. }]
    ));
    assert_eq!(count_before_confirm, 4);
    assert_eq!(ui.facilities().len(), 4);
    assert_eq!(ui.facility(created.id), Some(created));
    assert!(ui.process_pending_events().is_empty());
    Ok(())
}

#[tokio::test]
async fn foreign_update_is_merged() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, op) = scoped_client("ui").await?;
    let field = backend.client("field-team", Some(op)).await?;
    let target = ui.facilities()[0].clone();

    field
        .update_facility(target.id, FacilityPatch::status("at capacity"))
        .await?;
    let outcomes = ui.process_pending_events();
    assert_eq!(
        outcomes,
        vec![ReconcileOutcome::Merged {
            table: Table::Facilities,
            id: target.id.into(),
            fields: vec!["status".to_string()],
        }]
    );
    let seen = ui.facility(target.id).ok_or("facility vanished")?;
    assert_eq!(seen.status.as_deref(), Some("at capacity"));
    assert_eq!(seen.name, target.name);
    Ok(())
}

#[tokio::test]
async fn stale_mirror_update_keeps_concurrent_remote_change() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, op) = scoped_client("ui").await?;
    let field = backend.client("field-team", Some(op)).await?;
    let target = ui.facilities()[0].clone();

    field.update_facility(target.id, FacilityPatch::status("full")).await?;
    // ui has not seen the status change when it renames.
    let renamed = ui
        .update_facility(target.id, FacilityPatch::renamed("Central High Annex"))
        .await?;
    assert_eq!(renamed.status.as_deref(), Some("full"));

    let rows = backend.store().read(Table::Facilities, &Filter::all()).await?;
    let row = rows
        .iter()
        .find(|r| r.id == Some(target.id.into()))
        .ok_or("facility missing remotely")?;
    let remote = Facility::from_row(row)?;
    assert_eq!(remote.status.as_deref(), Some("full"));
    assert_eq!(remote.name, "Central High Annex");

    ui.process_pending_events();
    assert_eq!(ui.facility(target.id), Some(remote));
    Ok(())
}

#[tokio::test]
async fn foreign_records_appear_through_streams() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, op) = scoped_client("ui").await?;
    backend
        .store()
        .write(Table::Facilities, foreign_facility(op, "Mobile Kitchen 4"))
        .await?;
    backend
        .store()
        .write(Table::Operations, Row::new().with("name", "Winter Storm"))
        .await?;

    let outcomes = ui.process_pending_events();
    assert_eq!(outcomes.iter().filter(|o| o.changed_mirror()).count(), 2);
    assert!(ui.facilities().iter().any(|f| f.name == "Mobile Kitchen 4"));
    assert_eq!(ui.operations().len(), 2);
    Ok(())
}

// ============================================================================
// Delete wins
// ============================================================================

#[tokio::test]
async fn remote_delete_beats_in_flight_update() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, _) = scoped_client("ui").await?;
    let target = ui.facilities()[0].clone();
    backend.remote.hold();

    let (updated, deleted) = tokio::join!(
        ui.update_facility(target.id, FacilityPatch::status("closing")),
        async {
            backend.remote.until_waiting(1).await;
            let deleted = backend
                .store()
                .delete(Table::Facilities, target.id.into())
                .await;
            ui.process_pending_events();
            backend.remote.release();
            deleted
        }
    );

    assert!(deleted?);
    // The gateway accepted the update before the delete; its late
    // confirmation must not bring the facility back.
    assert_eq!(updated?.status.as_deref(), Some("closing"));
    assert_eq!(ui.facility(target.id), None);
    assert!(ui.process_pending_events().iter().all(|o| !o.changed_mirror()));
    assert_eq!(ui.facilities().len(), 2);
    assert_eq!(backend.count(Table::Facilities)?, 2);
    Ok(())
}

#[tokio::test]
async fn update_after_remote_delete_is_rejected() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, _) = scoped_client("ui").await?;
    let target = ui.facilities()[0].clone();
    backend
        .store()
        .delete(Table::Facilities, target.id.into())
        .await?;

    // The mirror has not seen the delete yet, so the call reaches the gateway.
    let err = ui
        .update_facility(target.id, FacilityPatch::status("closing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert_eq!(backend.count(Table::Facilities)?, 2);

    let outcomes = ui.process_pending_events();
    assert!(outcomes.contains(&ReconcileOutcome::Removed {
        table: Table::Facilities,
        id: target.id.into(),
    }));
    assert_eq!(ui.facility(target.id), None);
    Ok(())
}

#[tokio::test]
async fn local_delete_echo_is_harmless() -> Result<(), Box<dyn std::error::Error>> {
    let (_backend, ui, _) = scoped_client("ui").await?;
    let target = ui.facilities()[0].clone();
    assert!(ui.delete_facility(target.id).await?);

    let outcomes = ui.process_pending_events();
    assert!(outcomes.iter().all(|o| !o.changed_mirror()));
    assert_eq!(ui.facilities().len(), 2);
    Ok(())
}

// ============================================================================
// Teardown
// ============================================================================

#[tokio::test]
async fn rescoping_drops_events_of_the_old_stream() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, hurricane) = scoped_client("ui").await?;
    let flood = ui.create_operation("Spring Flood").await?;
    backend
        .store()
        .write(Table::Facilities, foreign_facility(hurricane, "Late Shelter"))
        .await?;

    ui.set_current_operation(flood.id).await?;
    let outcomes = ui.process_pending_events();
    assert!(
        outcomes
            .iter()
            .any(|o| matches!(o, ReconcileOutcome::Dropped { .. }))
    );
    assert!(ui.facilities().is_empty());
    Ok(())
}

#[tokio::test]
async fn shutdown_is_deterministic_and_idempotent() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, op) = scoped_client("ui").await?;
    backend
        .store()
        .write(Table::Facilities, foreign_facility(op, "Queued Shelter"))
        .await?;

    ui.shutdown().await;
    ui.shutdown().await;
    assert!(ui.active_streams().is_empty());
    assert_eq!(backend.store().subscriber_count(), 0);

    let outcomes = ui.process_pending_events();
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], ReconcileOutcome::Dropped { .. }));
    assert!(ui.facilities().iter().all(|f| f.name != "Queued Shelter"));
    Ok(())
}

#[tokio::test]
async fn raw_subscription_unsubscribes_once() -> Result<(), Box<dyn std::error::Error>> {
    let backend = TestBackend::new()?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sub = backend
        .store()
        .subscribe(Table::Operations, reliefsync_core::Filter::all(), tx)
        .await?;
    assert_eq!(sub.key().to_string(), "operations:*");

    sub.unsubscribe();
    sub.unsubscribe();
    assert_eq!(sub.state(), SubscriptionState::Unsubscribed);
    backend
        .store()
        .write(Table::Operations, Row::new().with("name", "Drill"))
        .await?;
    assert!(rx.try_recv().is_err());
    Ok(())
}

#[tokio::test]
async fn outage_ends_every_stream() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, _) = scoped_client("ui").await?;
    backend.store().set_reachable(false);

    let outcomes = ui.process_pending_events();
    let failures: Vec<_> = outcomes
        .iter()
        .filter_map(|o| match o {
            ReconcileOutcome::StreamFailed { error, .. } => Some(error.kind),
            _ => None,
        })
        .collect();
    assert_eq!(failures, vec![ErrorKind::Connection, ErrorKind::Connection]);
    assert!(ui.active_streams().is_empty());
    assert_eq!(ui.connection_state(), ConnectionState::Disconnected);
    Ok(())
}

// ============================================================================
// Awaiting events
// ============================================================================

#[tokio::test]
async fn next_event_waits_for_a_delivery() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, op) = scoped_client("ui").await?;

    let (outcome, written) = tokio::join!(ui.next_event(), async {
        tokio::task::yield_now().await;
        backend
            .store()
            .write(Table::Facilities, foreign_facility(op, "Staging Area"))
            .await
    });
    let written = written?;
    assert_eq!(
        outcome,
        Some(ReconcileOutcome::Inserted {
            table: Table::Facilities,
            id: written.require_id()?,
        })
    );
    Ok(())
}

#[tokio::test]
async fn outcomes_stream_yields_in_arrival_order() -> Result<(), Box<dyn std::error::Error>> {
    let (backend, ui, op) = scoped_client("ui").await?;
    let first = backend
        .store()
        .write(Table::Facilities, foreign_facility(op, "Point of Distribution 1"))
        .await?;
    let mut renamed = first.clone();
    renamed.set("name", "POD 1");
    backend.store().write(Table::Facilities, renamed).await?;

    let outcomes: Vec<ReconcileOutcome> = ui.outcomes().take(2).collect().await;
    let id = first.require_id()?;
    assert_eq!(
        outcomes,
        vec![
            ReconcileOutcome::Inserted {
                table: Table::Facilities,
                id
            },
            ReconcileOutcome::Merged {
                table: Table::Facilities,
                id,
                fields: vec!["name".to_string()],
            },
        ]
    );
    Ok(())
}
