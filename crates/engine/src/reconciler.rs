use std::collections::BTreeMap;

use parking_lot::Mutex;
use tracing::{debug, trace, warn};

use reliefsync_core::{ClientId, Record, RowId, Table};
use reliefsync_storage::{
    ChangeEvent, ChangeKind, Delivery, StreamError, StreamKey, Subscription, SubscriptionId,
};

use crate::mirror::{CacheEntry, Collection, Mirror};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Own write the mirror already reflects.
    Echo,
    /// Not newer than the mirrored version.
    Stale,
    /// Row was deleted; remote deletion wins.
    Tombstoned,
    /// Row belongs to another operation.
    OutOfScope,
    /// Table is not mirrored.
    Unmirrored,
    Malformed,
}

/// What happened to one delivered event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Inserted { table: Table, id: RowId },
    Merged { table: Table, id: RowId, fields: Vec<String> },
    Removed { table: Table, id: RowId },
    Skipped { table: Table, id: Option<RowId>, reason: SkipReason },
    /// Delivery for a stream that was already torn down.
    Dropped { subscription: SubscriptionId },
    StreamFailed { stream: StreamKey, error: StreamError },
}

impl ReconcileOutcome {
    pub fn changed_mirror(&self) -> bool {
        matches!(
            self,
            Self::Inserted { .. } | Self::Merged { .. } | Self::Removed { .. }
        )
    }
}

/// Live streams of one adapter plus the rules for folding their events into
/// the mirror.
pub struct Reconciler {
    origin: ClientId,
    streams: Mutex<BTreeMap<SubscriptionId, Subscription>>,
}

impl Reconciler {
    pub fn new(origin: ClientId) -> Self {
        Self {
            origin,
            streams: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn origin(&self) -> ClientId {
        self.origin
    }

    pub fn track(&self, subscription: Subscription) -> SubscriptionId {
        let id = subscription.id();
        self.streams.lock().insert(id, subscription);
        id
    }

    /// Tear a stream down. Deliveries still queued for it are dropped when
    /// they arrive. Releasing twice is a no-op.
    pub fn release(&self, id: SubscriptionId) -> bool {
        let removed = self.streams.lock().remove(&id);
        match removed {
            Some(subscription) => {
                subscription.unsubscribe();
                true
            }
            None => false,
        }
    }

    pub fn release_all(&self) {
        let streams = std::mem::take(&mut *self.streams.lock());
        for subscription in streams.into_values() {
            subscription.unsubscribe();
        }
    }

    pub fn active_streams(&self) -> Vec<StreamKey> {
        self.streams
            .lock()
            .values()
            .map(|s| s.key().clone())
            .collect()
    }

    pub fn handle(&self, mirror: &mut Mirror, delivery: Delivery) -> ReconcileOutcome {
        let key = match self.streams.lock().get(&delivery.subscription) {
            Some(sub) => sub.key().clone(),
            None => {
                trace!(subscription = %delivery.subscription, "dropping late delivery");
                return ReconcileOutcome::Dropped {
                    subscription: delivery.subscription,
                };
            }
        };
        match delivery.event {
            Ok(event) => self.apply(mirror, &event),
            Err(error) => {
                warn!(stream = %key, error = %error, "stream ended");
                self.release(delivery.subscription);
                ReconcileOutcome::StreamFailed { stream: key, error }
            }
        }
    }

    pub fn apply(&self, mirror: &mut Mirror, event: &ChangeEvent) -> ReconcileOutcome {
        let outcome = match event.table {
            Table::Operations => reconcile(
                &mut mirror.operations,
                self.origin,
                event,
                true,
            ),
            Table::Facilities => {
                let in_scope = event.new.as_ref().is_some_and(|row| mirror.in_scope(row));
                reconcile(
                    &mut mirror.facilities,
                    self.origin,
                    event,
                    in_scope,
                )
            }
            table => ReconcileOutcome::Skipped {
                table,
                id: event.row_id(),
                reason: SkipReason::Unmirrored,
            },
        };
        debug!(
            table = %event.table,
            kind = event.kind.as_str(),
            version = event.version,
            outcome = ?outcome,
            "change reconciled"
        );
        outcome
    }
}

fn reconcile<T: Record + Clone>(
    entries: &mut Collection<T>,
    origin: ClientId,
    event: &ChangeEvent,
    in_scope: bool,
) -> ReconcileOutcome {
    let table = event.table;
    let skip = |id, reason| ReconcileOutcome::Skipped { table, id, reason };
    let Some(id) = event.row_id() else {
        return skip(None, SkipReason::Malformed);
    };

    if event.kind == ChangeKind::Delete {
        return match entries.tombstone(id) {
            Some(_) => ReconcileOutcome::Removed { table, id },
            None => skip(Some(id), SkipReason::Stale),
        };
    }

    let Some(row) = event.new.as_ref() else {
        return skip(Some(id), SkipReason::Malformed);
    };
    if entries.is_tombstoned(id) {
        return skip(Some(id), SkipReason::Tombstoned);
    }
    if !in_scope {
        // An update can move a row out of the watched scope.
        return match entries.remove(id) {
            Some(_) => ReconcileOutcome::Removed { table, id },
            None => skip(Some(id), SkipReason::OutOfScope),
        };
    }

    let own = row.meta.stamp.filter(|s| s.origin == origin);
    let Some(entry) = entries.get_mut(id) else {
        let local_revision = own.map_or(0, |s| s.revision);
        return match CacheEntry::from_row(row.clone(), local_revision) {
            Ok(entry) => {
                entries.insert(entry);
                ReconcileOutcome::Inserted { table, id }
            }
            Err(e) => {
                warn!(%table, row = %id, error = %e, "unreadable row in change event");
                skip(Some(id), SkipReason::Malformed)
            }
        };
    };

    if let Some(stamp) = own
        && (stamp.revision < entry.local_revision || event.version <= entry.version)
    {
        return skip(Some(id), SkipReason::Echo);
    }
    if event.version <= entry.version {
        return skip(Some(id), SkipReason::Stale);
    }

    let fields: Vec<String> = row
        .fields
        .iter()
        .filter(|(key, value)| entry.row.get(key) != Some(*value))
        .map(|(key, _)| key.clone())
        .collect();
    let mut merged = entry.row.clone();
    for key in &fields {
        if let Some(value) = row.get(key) {
            merged.set(key, value.clone());
        }
    }
    merged.meta = row.meta.clone();
    if let Err(e) = entry.reflect(merged) {
        warn!(%table, row = %id, error = %e, "unreadable row in change event");
        return skip(Some(id), SkipReason::Malformed);
    }
    if let Some(stamp) = own {
        entry.local_revision = entry.local_revision.max(stamp.revision);
    }
    ReconcileOutcome::Merged { table, id, fields }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reliefsync_core::{FacilityDraft, FieldValue, OperationId, Row, WriteStamp};

    struct Fixture {
        mirror: Mirror,
        reconciler: Reconciler,
        op: OperationId,
    }

    impl Fixture {
        fn new() -> Self {
            let mut mirror = Mirror::new();
            let op = OperationId::new();
            mirror.current_operation = Some(op);
            Self {
                mirror,
                reconciler: Reconciler::new(ClientId::new()),
                op,
            }
        }

        fn facility(&self, name: &str, version: i64, stamp: Option<WriteStamp>) -> Row {
            let mut row = FacilityDraft::named(name).to_row(self.op);
            row.id = Some(RowId::new());
            row.set("created_at", FieldValue::Timestamp(1));
            row.meta.version = version;
            row.meta.stamp = stamp;
            row
        }

        fn own(&self, revision: u64) -> Option<WriteStamp> {
            Some(WriteStamp {
                origin: self.reconciler.origin(),
                revision,
            })
        }

        fn event(kind: ChangeKind, new: Option<Row>, old: Option<Row>) -> ChangeEvent {
            let version = new.as_ref().or(old.as_ref()).map_or(0, |r| r.meta.version);
            ChangeEvent {
                table: Table::Facilities,
                kind,
                new,
                old,
                version,
            }
        }

        fn apply(&mut self, event: ChangeEvent) -> ReconcileOutcome {
            self.reconciler.apply(&mut self.mirror, &event)
        }
    }

    #[test]
    fn own_echo_after_confirmation_is_skipped() -> Result<(), Box<dyn std::error::Error>> {
        let mut fx = Fixture::new();
        let row = fx.facility("Shelter A", 3, fx.own(1));
        fx.mirror.confirm_facility(row.clone(), 1)?;

        let outcome = fx.apply(Fixture::event(ChangeKind::Insert, Some(row), None));
        assert!(matches!(outcome, ReconcileOutcome::Skipped { reason: SkipReason::Echo, .. }));
        assert_eq!(fx.mirror.facilities().len(), 1);
        Ok(())
    }

    #[test]
    fn older_own_echo_does_not_undo_newer_local_write() -> Result<(), Box<dyn std::error::Error>> {
        let mut fx = Fixture::new();
        let created = fx.facility("Shelter A", 3, fx.own(1));
        let mut renamed = created.clone();
        renamed.set("name", "Shelter A (annex)");
        renamed.meta.version = 4;
        renamed.meta.stamp = fx.own(2);
        fx.mirror.confirm_facility(renamed.clone(), 2)?;

        // Echo of the create arrives late and carries an older revision.
        let mut stale = created;
        stale.meta.version = 5;
        let outcome = fx.apply(Fixture::event(ChangeKind::Update, Some(stale), None));
        assert!(matches!(outcome, ReconcileOutcome::Skipped { reason: SkipReason::Echo, .. }));
        let id = renamed.require_id()?.into();
        assert_eq!(
            fx.mirror.facility(id).map(|f| f.name),
            Some("Shelter A (annex)".to_string())
        );
        Ok(())
    }

    #[test]
    fn foreign_update_merges_only_changed_fields() -> Result<(), Box<dyn std::error::Error>> {
        let mut fx = Fixture::new();
        let row = fx.facility("Shelter A", 2, None);
        fx.mirror.confirm_facility(row.clone(), 0)?;

        let mut remote = row.clone();
        remote.set("status", "full");
        remote.meta.version = 7;
        remote.meta.stamp = Some(WriteStamp {
            origin: ClientId::new(),
            revision: 40,
        });
        let outcome = fx.apply(Fixture::event(ChangeKind::Update, Some(remote), Some(row.clone())));
        assert_eq!(
            outcome,
            ReconcileOutcome::Merged {
                table: Table::Facilities,
                id: row.require_id()?,
                fields: vec!["status".to_string()],
            }
        );
        let entry = fx
            .mirror
            .facility_entry(row.require_id()?.into())
            .ok_or("entry missing")?;
        assert_eq!(entry.version, 7);
        assert_eq!(entry.record.status.as_deref(), Some("full"));
        Ok(())
    }

    #[test]
    fn stale_foreign_update_is_ignored() -> Result<(), Box<dyn std::error::Error>> {
        let mut fx = Fixture::new();
        let row = fx.facility("Shelter A", 9, None);
        fx.mirror.confirm_facility(row.clone(), 0)?;
        let mut old = row.clone();
        old.set("status", "closed");
        old.meta.version = 8;
        let outcome = fx.apply(Fixture::event(ChangeKind::Update, Some(old), None));
        assert!(matches!(outcome, ReconcileOutcome::Skipped { reason: SkipReason::Stale, .. }));
        Ok(())
    }

    #[test]
    fn delete_wins_over_later_inserts() {
        let mut fx = Fixture::new();
        let row = fx.facility("Shelter A", 2, None);
        fx.apply(Fixture::event(ChangeKind::Insert, Some(row.clone()), None));
        assert_eq!(fx.mirror.facilities().len(), 1);

        let mut gone = row.clone();
        gone.meta.version = 3;
        let outcome = fx.apply(Fixture::event(ChangeKind::Delete, None, Some(gone)));
        assert!(matches!(outcome, ReconcileOutcome::Removed { .. }));

        let mut late = row;
        late.meta.version = 4;
        let outcome = fx.apply(Fixture::event(ChangeKind::Update, Some(late), None));
        assert!(matches!(
            outcome,
            ReconcileOutcome::Skipped { reason: SkipReason::Tombstoned, .. }
        ));
        assert!(fx.mirror.facilities().is_empty());
    }

    #[test]
    fn rows_of_other_operations_stay_out() {
        let mut fx = Fixture::new();
        let mut row = fx.facility("Elsewhere", 2, None);
        row.set("operation_id", FieldValue::Ref(RowId::new()));
        let outcome = fx.apply(Fixture::event(ChangeKind::Insert, Some(row), None));
        assert!(matches!(
            outcome,
            ReconcileOutcome::Skipped { reason: SkipReason::OutOfScope, .. }
        ));
        assert!(fx.mirror.facilities().is_empty());
    }
}
