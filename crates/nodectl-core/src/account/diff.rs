//! Account snapshot diffing
//!
//! Classifies two account snapshots by full-record equality. A record that
//! changed in any field shows up once in `removed` (old value) and once in
//! `added` (new value); the engine therefore always holds exactly one
//! canonical record per UID and credentials rotate via revoke + reissue.

use std::collections::HashMap;

use crate::model::AccountRecord;

/// Outcome of comparing two account snapshots
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccountDiff {
    /// Present in the old snapshot only, sorted canonically
    pub removed: Vec<AccountRecord>,
    /// Present in the new snapshot only, sorted canonically
    pub added: Vec<AccountRecord>,
}

impl AccountDiff {
    pub fn is_empty(&self) -> bool {
        self.removed.is_empty() && self.added.is_empty()
    }
}

/// Compare two snapshots as multisets
///
/// One pass over each input builds a signed occurrence count per distinct
/// record; positive balances were removed, negative ones added, zero means
/// unchanged.
pub fn diff(old: &[AccountRecord], new: &[AccountRecord]) -> AccountDiff {
    let mut balance: HashMap<&AccountRecord, i64> = HashMap::with_capacity(old.len() + new.len());
    for record in old {
        *balance.entry(record).or_insert(0) += 1;
    }
    for record in new {
        *balance.entry(record).or_insert(0) -= 1;
    }

    let mut result = AccountDiff::default();
    for (record, count) in balance {
        let target = if count > 0 {
            &mut result.removed
        } else {
            &mut result.added
        };
        for _ in 0..count.unsigned_abs() {
            target.push(record.clone());
        }
    }

    result.removed.sort();
    result.added.sort();
    result
}
