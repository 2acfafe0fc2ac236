//! Divergence detection and field-level merge.
//!
//! Everything here is pure: the resolver reads a local change, the remote
//! record and the entity policy, and returns the merged record plus what is
//! still left to push. Storage and transport are the caller's business.

use std::collections::BTreeSet;

use super::policy::{EntityPolicy, FieldPolicy};
use super::report::{FieldResolution, ResolutionReport, Strategy, Winner};
use crate::models::{
    changed_fields, ActorId, FieldMap, Operation, OperationId, OperationKind, Record, Version,
};

/// A local change as seen by the resolver
#[derive(Debug, Clone, PartialEq)]
pub struct LocalChange {
    pub operation_id: Option<OperationId>,
    pub kind: OperationKind,
    pub base_version: Version,
    pub base_snapshot: FieldMap,
    pub delta: FieldMap,
    pub updated_by: ActorId,
}

impl LocalChange {
    pub fn from_operation(operation: &Operation) -> Self {
        Self {
            operation_id: Some(operation.operation_id),
            kind: operation.kind,
            base_version: operation.base_version,
            base_snapshot: operation.base_snapshot.clone(),
            delta: operation.payload_delta.clone(),
            updated_by: operation.updated_by.clone(),
        }
    }

    /// Fold the open operations of one entity, oldest first, into one change.
    ///
    /// The base comes from the oldest operation; later deltas override earlier
    /// ones field by field.
    pub fn aggregate(operations: &[Operation]) -> Option<Self> {
        let (first, rest) = operations.split_first()?;
        let mut change = Self::from_operation(first);
        for operation in rest {
            for (field, value) in &operation.payload_delta {
                change.delta.insert(field.clone(), value.clone());
            }
            change.updated_by = operation.updated_by.clone();
            change.kind = match (change.kind, operation.kind) {
                (_, OperationKind::Delete) | (OperationKind::Delete, _) => OperationKind::Delete,
                (OperationKind::Create, _) => OperationKind::Create,
                (OperationKind::StatusTransition, OperationKind::StatusTransition) => {
                    OperationKind::StatusTransition
                }
                _ => OperationKind::Update,
            };
        }
        Some(change)
    }
}

/// Local intent still to be sent after a resolution
#[derive(Debug, Clone, PartialEq)]
pub struct Residual {
    pub kind: OperationKind,
    pub delta: FieldMap,
}

/// Result of [`resolve`]
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// False when the remote record had not moved past the local base
    pub conflict: bool,
    pub merged: Record,
    /// `None` when nothing of the local change survives or needs sending
    pub residual: Option<Residual>,
    pub report: ResolutionReport,
}

/// Settle a local change against the remote copy of the same record.
pub fn resolve(local: &LocalChange, remote: &Record, policy: &EntityPolicy) -> Resolution {
    if remote.deleted {
        return remote_tombstone(local, remote);
    }
    if remote.version <= local.base_version {
        return unopposed(local, remote);
    }
    if local.kind == OperationKind::Delete {
        return local_tombstone(local, remote);
    }

    let merged_version = local.base_version.max(remote.version).next();
    let remote_changed: BTreeSet<String> = changed_fields(&local.base_snapshot, &remote.payload)
        .into_iter()
        .collect();

    let mut merged = remote.clone();
    let mut residual = FieldMap::new();
    let mut fields = Vec::with_capacity(local.delta.len());

    for (field, local_value) in &local.delta {
        let remote_value = remote.payload.get(field);

        let (strategy, winner, needs_review) = if !remote_changed.contains(field) {
            (Strategy::AutoMerged, Winner::Local, false)
        } else if remote_value == Some(local_value) {
            (Strategy::Converged, Winner::Remote, false)
        } else {
            match policy.field(field) {
                FieldPolicy::Status { order } => {
                    match (order.rank(local_value), remote_value.and_then(|v| order.rank(v))) {
                        (Some(local_rank), Some(remote_rank)) => {
                            let winner = if local_rank > remote_rank {
                                Winner::Local
                            } else {
                                Winner::Remote
                            };
                            (Strategy::StatusOrder, winner, false)
                        }
                        // Malformed status: fall back to LWW and ask a person
                        _ => (Strategy::LastWriterWins, lww_winner(local, remote), true),
                    }
                }
                FieldPolicy::Monetary => (Strategy::ManualReview, Winner::Remote, true),
                FieldPolicy::LastWriterWins => {
                    (Strategy::LastWriterWins, lww_winner(local, remote), false)
                }
            }
        };

        if winner == Winner::Local {
            residual.insert(field.clone(), local_value.clone());
            merged.payload.insert(field.clone(), local_value.clone());
        }
        fields.push(FieldResolution {
            field: field.clone(),
            strategy,
            winner,
            local_value: Some(local_value.clone()),
            remote_value: remote_value.cloned(),
            needs_review,
        });
    }

    let report = ResolutionReport {
        key: remote.key.clone(),
        operation_id: local.operation_id,
        base_version: local.base_version,
        remote_version: remote.version,
        merged_version,
        fields,
    };

    let residual = (!residual.is_empty()).then(|| Residual {
        kind: match local.kind {
            // The record exists remotely, so a create can only land as an update
            OperationKind::Create => OperationKind::Update,
            kind => kind,
        },
        delta: residual,
    });

    merged.version = merged_version;
    if residual.is_some() {
        merged.updated_by = local.updated_by.clone();
    }
    merged.dirty = residual.is_some();
    merged.conflict_resolved = remote.conflict_resolved && !report.needs_review();
    merged.updated_at = chrono::Utc::now().timestamp_millis();

    Resolution {
        conflict: true,
        merged,
        residual,
        report,
    }
}

/// Local intent counts as `base_version + 1`; ties go to the greater actor id
fn lww_winner(local: &LocalChange, remote: &Record) -> Winner {
    let local_version = local.base_version.next();
    match local_version.cmp(&remote.version) {
        std::cmp::Ordering::Greater => Winner::Local,
        std::cmp::Ordering::Less => Winner::Remote,
        std::cmp::Ordering::Equal if local.updated_by > remote.updated_by => Winner::Local,
        std::cmp::Ordering::Equal => Winner::Remote,
    }
}

fn unopposed(local: &LocalChange, remote: &Record) -> Resolution {
    let mut merged = remote.clone();
    if local.kind == OperationKind::Delete {
        merged.deleted = true;
    }
    merged.apply_delta(&local.delta);
    merged.version = local.base_version.max(remote.version);
    merged.updated_by = local.updated_by.clone();
    merged.dirty = true;
    merged.updated_at = chrono::Utc::now().timestamp_millis();

    let fields = local
        .delta
        .iter()
        .map(|(field, value)| FieldResolution {
            field: field.clone(),
            strategy: Strategy::AutoMerged,
            winner: Winner::Local,
            local_value: Some(value.clone()),
            remote_value: remote.payload.get(field).cloned(),
            needs_review: false,
        })
        .collect();

    let kind = match local.kind {
        OperationKind::Create if !remote.version.is_provisional() => OperationKind::Update,
        kind => kind,
    };

    Resolution {
        conflict: false,
        report: ResolutionReport {
            key: remote.key.clone(),
            operation_id: local.operation_id,
            base_version: local.base_version,
            remote_version: remote.version,
            merged_version: merged.version,
            fields,
        },
        merged,
        residual: Some(Residual {
            kind,
            delta: local.delta.clone(),
        }),
    }
}

fn remote_tombstone(local: &LocalChange, remote: &Record) -> Resolution {
    let merged_version = if remote.version > local.base_version {
        local.base_version.max(remote.version).next()
    } else {
        remote.version
    };
    let converged = local.kind == OperationKind::Delete;

    let mut merged = remote.clone();
    merged.version = merged_version;
    merged.dirty = false;
    merged.updated_at = chrono::Utc::now().timestamp_millis();

    let fields = local
        .delta
        .iter()
        .map(|(field, value)| FieldResolution {
            field: field.clone(),
            strategy: if converged {
                Strategy::Converged
            } else {
                Strategy::Tombstone
            },
            winner: Winner::Remote,
            local_value: Some(value.clone()),
            remote_value: remote.payload.get(field).cloned(),
            needs_review: false,
        })
        .collect();

    Resolution {
        conflict: remote.version > local.base_version,
        report: ResolutionReport {
            key: remote.key.clone(),
            operation_id: local.operation_id,
            base_version: local.base_version,
            remote_version: remote.version,
            merged_version,
            fields,
        },
        merged,
        residual: None,
    }
}

fn local_tombstone(local: &LocalChange, remote: &Record) -> Resolution {
    let merged_version = local.base_version.max(remote.version).next();

    let mut merged = remote.clone().into_tombstone();
    merged.version = merged_version;
    merged.updated_by = local.updated_by.clone();
    merged.dirty = true;
    merged.updated_at = chrono::Utc::now().timestamp_millis();

    let fields = changed_fields(&local.base_snapshot, &remote.payload)
        .into_iter()
        .map(|field| FieldResolution {
            local_value: local.base_snapshot.get(&field).cloned(),
            remote_value: remote.payload.get(&field).cloned(),
            field,
            strategy: Strategy::Tombstone,
            winner: Winner::Local,
            needs_review: false,
        })
        .collect();

    Resolution {
        conflict: true,
        report: ResolutionReport {
            key: remote.key.clone(),
            operation_id: local.operation_id,
            base_version: local.base_version,
            remote_version: remote.version,
            merged_version,
            fields,
        },
        merged,
        residual: Some(Residual {
            kind: OperationKind::Delete,
            delta: local.delta.clone(),
        }),
    }
}

/// Remove from `delta` every field the resolution gave to the remote side
pub fn strip_lost_fields(delta: &FieldMap, report: &ResolutionReport) -> FieldMap {
    let lost: BTreeSet<&str> = report.lost_fields().collect();
    let converged: BTreeSet<&str> = report
        .fields
        .iter()
        .filter(|field| field.strategy == Strategy::Converged)
        .map(|field| field.field.as_str())
        .collect();
    delta
        .iter()
        .filter(|(field, _)| !lost.contains(field.as_str()) && !converged.contains(field.as_str()))
        .map(|(field, value)| (field.clone(), value.clone()))
        .collect::<FieldMap>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::PolicyRegistry;
    use crate::models::{RecordKey, TenantId};
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    fn fields(pairs: &[(&str, Value)]) -> FieldMap {
        pairs
            .iter()
            .map(|(field, value)| ((*field).to_string(), value.clone()))
            .collect()
    }

    fn order_key() -> RecordKey {
        RecordKey::new(TenantId::new("bistro").unwrap(), "order", "order_42").unwrap()
    }

    fn remote(version: i64, by: &str, payload: FieldMap) -> Record {
        Record::new(order_key(), Version(version), ActorId::new(by).unwrap(), payload)
    }

    fn change(kind: OperationKind, base: i64, snapshot: FieldMap, delta: FieldMap) -> LocalChange {
        LocalChange {
            operation_id: None,
            kind,
            base_version: Version(base),
            base_snapshot: snapshot,
            delta,
            updated_by: ActorId::new("pos-a").unwrap(),
        }
    }

    fn order_policy() -> EntityPolicy {
        PolicyRegistry::restaurant_defaults()
            .policy_for("order")
            .clone()
    }

    #[test]
    fn remote_not_ahead_is_not_a_conflict() {
        let base = fields(&[("status", json!("ready"))]);
        let local = change(
            OperationKind::StatusTransition,
            5,
            base.clone(),
            fields(&[("status", json!("picked_up"))]),
        );
        let resolution = resolve(&local, &remote(5, "pos-b", base), &order_policy());

        assert!(!resolution.conflict);
        assert_eq!(resolution.merged.payload["status"], json!("picked_up"));
        assert_eq!(
            resolution.residual.unwrap().delta,
            fields(&[("status", json!("picked_up"))])
        );
    }

    #[test]
    fn later_remote_status_dominates_local_transition() {
        let base = fields(&[("status", json!("ready"))]);
        let local = change(
            OperationKind::StatusTransition,
            5,
            base,
            fields(&[("status", json!("picked_up"))]),
        );
        let server = remote(6, "pos-b", fields(&[("status", json!("delivered"))]));

        let resolution = resolve(&local, &server, &order_policy());

        assert!(resolution.conflict);
        assert_eq!(resolution.merged.payload["status"], json!("delivered"));
        assert_eq!(resolution.merged.version, Version(7));
        assert!(resolution.residual.is_none());
        assert!(!resolution.report.needs_review());
        let dominated: Vec<_> = resolution.report.dominated_transitions().collect();
        assert_eq!(dominated.len(), 1);
        assert_eq!(dominated[0].local_value, Some(json!("picked_up")));
    }

    #[test]
    fn later_local_status_wins_regardless_of_version() {
        let base = fields(&[("status", json!("ready"))]);
        let local = change(
            OperationKind::StatusTransition,
            5,
            base,
            fields(&[("status", json!("delivered"))]),
        );
        let server = remote(9, "pos-z", fields(&[("status", json!("picked_up"))]));

        let resolution = resolve(&local, &server, &order_policy());

        assert_eq!(resolution.merged.payload["status"], json!("delivered"));
        assert_eq!(resolution.merged.version, Version(10));
        let residual = resolution.residual.unwrap();
        assert_eq!(residual.kind, OperationKind::StatusTransition);
        assert_eq!(residual.delta, fields(&[("status", json!("delivered"))]));
    }

    #[test]
    fn disjoint_edits_merge_automatically() {
        let base = fields(&[("notes", json!("")), ("table", json!(4))]);
        let local = change(
            OperationKind::Update,
            3,
            base,
            fields(&[("notes", json!("no onions"))]),
        );
        let server = remote(4, "pos-b", fields(&[("notes", json!("")), ("table", json!(7))]));

        let resolution = resolve(&local, &server, &order_policy());

        assert_eq!(
            resolution.merged.payload,
            fields(&[("notes", json!("no onions")), ("table", json!(7))])
        );
        assert_eq!(resolution.merged.version, Version(5));
        assert_eq!(resolution.report.fields[0].strategy, Strategy::AutoMerged);
        assert!(resolution.residual.is_some());
    }

    #[test]
    fn differing_cash_amounts_are_flagged_not_chosen() {
        let base = fields(&[("cash_amount", json!(0))]);
        let local = change(
            OperationKind::Update,
            1,
            base,
            fields(&[("cash_amount", json!(20))]),
        );
        let server = remote(2, "pos-b", fields(&[("cash_amount", json!(25))]));

        let resolution = resolve(&local, &server, &order_policy());

        assert!(!resolution.merged.conflict_resolved);
        assert_eq!(resolution.merged.payload["cash_amount"], json!(25));
        assert!(resolution.residual.is_none());
        let items: Vec<_> = resolution.report.review_items().collect();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].strategy, Strategy::ManualReview);
        assert_eq!(items[0].local_value, Some(json!(20)));
        assert_eq!(items[0].remote_value, Some(json!(25)));
    }

    #[test]
    fn lww_tie_is_broken_by_actor() {
        let base = fields(&[("notes", json!("a"))]);
        let server = remote(6, "pos-b", fields(&[("notes", json!("from b"))]));

        let mut local = change(
            OperationKind::Update,
            5,
            base,
            fields(&[("notes", json!("from c"))]),
        );
        local.updated_by = ActorId::new("pos-c").unwrap();
        let resolution = resolve(&local, &server, &order_policy());
        assert_eq!(resolution.merged.payload["notes"], json!("from c"));

        local.updated_by = ActorId::new("pos-a").unwrap();
        let resolution = resolve(&local, &server, &order_policy());
        assert_eq!(resolution.merged.payload["notes"], json!("from b"));
    }

    #[test]
    fn lww_higher_remote_version_wins() {
        let base = fields(&[("notes", json!("a"))]);
        let local = change(
            OperationKind::Update,
            2,
            base,
            fields(&[("notes", json!("local"))]),
        );
        let server = remote(5, "pos-a", fields(&[("notes", json!("remote"))]));

        let resolution = resolve(&local, &server, &order_policy());
        assert_eq!(resolution.merged.payload["notes"], json!("remote"));
        assert!(resolution.residual.is_none());
    }

    #[test]
    fn malformed_status_degrades_to_lww_with_review() {
        let base = fields(&[("status", json!("ready"))]);
        let local = change(
            OperationKind::StatusTransition,
            5,
            base,
            fields(&[("status", json!(7))]),
        );
        let server = remote(6, "pos-b", fields(&[("status", json!("delivered"))]));

        let resolution = resolve(&local, &server, &order_policy());

        assert_eq!(resolution.report.fields[0].strategy, Strategy::LastWriterWins);
        assert!(resolution.report.needs_review());
        assert!(!resolution.merged.conflict_resolved);
    }

    #[test]
    fn remote_tombstone_beats_local_edits() {
        let base = fields(&[("notes", json!(""))]);
        let local = change(OperationKind::Update, 3, base, fields(&[("notes", json!("x"))]));
        let server = remote(4, "pos-b", fields(&[("notes", json!(""))])).into_tombstone();

        let resolution = resolve(&local, &server, &order_policy());

        assert!(resolution.merged.deleted);
        assert!(resolution.residual.is_none());
        assert_eq!(resolution.report.fields[0].strategy, Strategy::Tombstone);
    }

    #[test]
    fn local_delete_beats_remote_edits() {
        let base = fields(&[("notes", json!(""))]);
        let local = change(OperationKind::Delete, 3, base, FieldMap::new());
        let server = remote(4, "pos-b", fields(&[("notes", json!("edited"))]));

        let resolution = resolve(&local, &server, &order_policy());

        assert!(resolution.merged.deleted);
        assert_eq!(resolution.merged.version, Version(5));
        assert_eq!(resolution.residual.unwrap().kind, OperationKind::Delete);
    }

    #[test]
    fn concurrent_create_lands_as_update() {
        let local = change(
            OperationKind::Create,
            0,
            FieldMap::new(),
            fields(&[("table", json!(3)), ("notes", json!("window"))]),
        );
        let server = remote(1, "pos-b", fields(&[("table", json!(3))]));

        let resolution = resolve(&local, &server, &order_policy());
        let residual = resolution.residual.unwrap();
        assert_eq!(residual.kind, OperationKind::Update);
        assert_eq!(residual.delta, fields(&[("notes", json!("window"))]));
    }

    #[test]
    fn aggregate_folds_deltas_in_order() {
        let key = order_key();
        let actor = ActorId::new("pos-a").unwrap();
        let first = Operation::new(
            key.clone(),
            OperationKind::StatusTransition,
            fields(&[("status", json!("ready"))]),
            Version(5),
            fields(&[("status", json!("preparing"))]),
            actor.clone(),
        );
        let second = Operation::new(
            key,
            OperationKind::Update,
            fields(&[("status", json!("picked_up")), ("notes", json!("x"))]),
            Version(5),
            FieldMap::new(),
            actor,
        );

        let change = LocalChange::aggregate(&[first.clone(), second]).unwrap();
        assert_eq!(change.kind, OperationKind::Update);
        assert_eq!(change.base_version, Version(5));
        assert_eq!(change.base_snapshot, first.base_snapshot);
        assert_eq!(
            change.delta,
            fields(&[("notes", json!("x")), ("status", json!("picked_up"))])
        );
        assert!(LocalChange::aggregate(&[]).is_none());
    }

    #[test]
    fn strip_lost_fields_keeps_surviving_intent() {
        let base = fields(&[("status", json!("ready")), ("notes", json!(""))]);
        let local = change(
            OperationKind::Update,
            5,
            base,
            fields(&[("status", json!("picked_up")), ("notes", json!("x"))]),
        );
        let server = remote(
            6,
            "pos-b",
            fields(&[("status", json!("delivered")), ("notes", json!(""))]),
        );

        let resolution = resolve(&local, &server, &order_policy());
        let kept = strip_lost_fields(&local.delta, &resolution.report);
        assert_eq!(kept, fields(&[("notes", json!("x"))]));
    }
}
