//! Row-level set reconciliation.
//!
//! Both sides of a round hold rows of the same key interval, sorted by
//! key. A merge-join over the two lists yields the symmetric difference of
//! the `(key, hash)` sets, split by the direction each row must travel.

use std::cmp::Ordering;

use reef_net::RowDigest;
use reef_types::RowKey;

use crate::row::RepairRow;

/// What a round must move.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffPlan {
    /// Keys whose local version the peer lacks: sent master to follower.
    pub push: Vec<RowKey>,
    /// Keys whose peer version we lack: sent follower to master.
    pub pull: Vec<RowKey>,
}

impl DiffPlan {
    /// Whether both sides already agree.
    pub fn is_empty(&self) -> bool {
        self.push.is_empty() && self.pull.is_empty()
    }
}

/// Reconcile local rows against peer digests (`HashOnly`).
///
/// On a hash mismatch only timestamps are known, so the later write
/// travels; on a timestamp tie both directions are exchanged and each side
/// reconciles on apply.
pub fn plan_from_digests(local: &[RepairRow], remote: &[RowDigest]) -> DiffPlan {
    merge_join(
        local,
        remote,
        |d| &d.key,
        |d| d.hash,
        |l, r| l.entry.mutation.timestamp.cmp(&r.timestamp),
    )
}

/// Reconcile local rows against full peer rows (`FullRow`).
///
/// Mismatches are settled with the full reconciliation order.
pub fn plan_from_rows(local: &[RepairRow], remote: &[RepairRow]) -> DiffPlan {
    merge_join(
        local,
        remote,
        RepairRow::key,
        |r| r.hash,
        |l, r| l.entry.mutation.compare_version(&r.entry.mutation),
    )
}

fn merge_join<R>(
    local: &[RepairRow],
    remote: &[R],
    key_of: impl Fn(&R) -> &RowKey,
    hash_of: impl Fn(&R) -> u64,
    newer: impl Fn(&RepairRow, &R) -> Ordering,
) -> DiffPlan {
    let mut plan = DiffPlan::default();
    let (mut i, mut j) = (0, 0);

    while i < local.len() && j < remote.len() {
        let l = &local[i];
        let r = &remote[j];
        match l.key().cmp(key_of(r)) {
            Ordering::Less => {
                plan.push.push(l.key().clone());
                i += 1;
            }
            Ordering::Greater => {
                plan.pull.push(key_of(r).clone());
                j += 1;
            }
            Ordering::Equal => {
                if l.hash != hash_of(r) {
                    match newer(l, r) {
                        Ordering::Greater => plan.push.push(l.key().clone()),
                        Ordering::Less => plan.pull.push(l.key().clone()),
                        Ordering::Equal => {
                            plan.push.push(l.key().clone());
                            plan.pull.push(l.key().clone());
                        }
                    }
                }
                i += 1;
                j += 1;
            }
        }
    }
    plan.push.extend(local[i..].iter().map(|l| l.key().clone()));
    plan.pull.extend(remote[j..].iter().map(|r| key_of(r).clone()));
    plan
}
