//! Advisory downtime estimate for a changeset

use crate::snapshot::diff::{ChangeOperation, ObjectKind, SchemaChange};

const TABLE_CREATE_SECONDS: f64 = 1.0;
const TABLE_DELETE_SECONDS: f64 = 2.0;
const COLUMN_SECONDS: f64 = 0.5;
const INDEX_SECONDS: f64 = 5.0;
const POLICY_SECONDS: f64 = 0.5;

pub struct DowntimeEstimator;

impl DowntimeEstimator {
    /// Summed per-change cost, rounded up to whole seconds
    pub fn estimate(changes: &[SchemaChange]) -> u64 {
        let total: f64 = changes.iter().map(Self::cost).sum();
        total.ceil() as u64
    }

    fn cost(change: &SchemaChange) -> f64 {
        match (change.kind, change.operation) {
            (ObjectKind::Table, ChangeOperation::Delete) => TABLE_DELETE_SECONDS,
            (ObjectKind::Table, _) => TABLE_CREATE_SECONDS,
            (ObjectKind::Column, _) => COLUMN_SECONDS,
            (ObjectKind::Index, _) => INDEX_SECONDS,
            (ObjectKind::Policy, _) => POLICY_SECONDS,
        }
    }
}
