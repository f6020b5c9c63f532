//! Company identity grouping and canonical-record selection.
//!
//! Grouping runs over the whole fetched batch before anything is written, so
//! the outcome never depends on page arrival order.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use lcr_core::{CompanyKey, NormalizedRecord};

/// Tax ID, else address, else the record itself. Changing this order splits
/// or merges previously reconciled companies.
pub fn company_key(record: &NormalizedRecord) -> CompanyKey {
    if let Some(inn) = trimmed(record.inn.as_deref()) {
        return CompanyKey::tax(inn);
    }
    if let Some(address) = trimmed(record.address.as_deref()) {
        return CompanyKey::address(address);
    }
    CompanyKey::record(record.global_id)
}

fn trimmed(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Groups keep the relative arrival order of their members.
pub fn group_by_company(
    records: impl IntoIterator<Item = NormalizedRecord>,
) -> BTreeMap<CompanyKey, Vec<NormalizedRecord>> {
    let mut grouped: BTreeMap<CompanyKey, Vec<NormalizedRecord>> = BTreeMap::new();
    for record in records {
        grouped.entry(company_key(&record)).or_default().push(record);
    }
    grouped
}

/// Total order over candidate records; the greatest is canonical.
///
/// Later install date of the current state, then later expiry, then larger
/// source id. Absent dates sort oldest. Exact source duplicates (same
/// `global_id`) fall through to row number and content hash.
pub fn canonical_order(a: &NormalizedRecord, b: &NormalizedRecord) -> Ordering {
    a.install_date
        .cmp(&b.install_date)
        .then_with(|| a.license_expire.cmp(&b.license_expire))
        .then_with(|| a.global_id.cmp(&b.global_id))
        .then_with(|| a.row_number.cmp(&b.row_number))
        .then_with(|| a.content_hash.cmp(&b.content_hash))
}

pub fn select(group: &[NormalizedRecord]) -> Option<&NormalizedRecord> {
    if let [only] = group {
        return Some(only);
    }
    group.iter().max_by(|a, b| canonical_order(a, b))
}

/// Consume a group and keep only its canonical member.
pub fn select_owned(mut group: Vec<NormalizedRecord>) -> Option<NormalizedRecord> {
    if group.len() == 1 {
        return group.pop();
    }
    let idx = group
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| canonical_order(a, b))
        .map(|(idx, _)| idx)?;
    Some(group.swap_remove(idx))
}

#[derive(Debug, Clone, Default)]
pub struct Reconciled {
    pub company_groups: usize,
    pub superseded: usize,
    /// One record per company, in key order.
    pub canonical: Vec<NormalizedRecord>,
}

pub fn reconcile_groups(grouped: BTreeMap<CompanyKey, Vec<NormalizedRecord>>) -> Reconciled {
    let company_groups = grouped.len();
    let mut superseded = 0usize;
    let mut canonical = Vec::with_capacity(company_groups);
    for (_key, members) in grouped {
        superseded += members.len().saturating_sub(1);
        if let Some(record) = select_owned(members) {
            canonical.push(record);
        }
    }
    Reconciled {
        company_groups,
        superseded,
        canonical,
    }
}
