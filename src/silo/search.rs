//! Search compilation: index-backed candidate sets.
//!
//! The compile phase walks the filter and, for every `eq` or `pr` atom in a
//! positive conjunctive position (not under `or` or `not`), estimates the
//! matching tuple count through the index manager. The cheapest atom supplies
//! the candidate id set; everything else is left to the in-memory evaluator.
//! When no such atom is indexable the caller falls back to a full scan of the
//! resource bucket, which keeps `or`/`not` filters exact.

use std::collections::HashMap;

use crate::error::ScimResult;
use crate::filter::evaluator::coerce_literal;
use crate::filter::{parse_filter, CompareOp, Filter};
use crate::resource::AttrValue;
use crate::schema::AttributeDefinition;
use crate::silo::index::Index;
use crate::storage::SnapshotRead;

/// A search request: the filter plus the resource types to scan.
#[derive(Debug, Clone)]
pub struct SearchContext {
    pub res_types: Vec<String>,
    pub filter: Filter,
}

impl SearchContext {
    /// Builds a context from a filter expression.
    pub fn new(res_types: Vec<String>, filter: &str) -> ScimResult<Self> {
        Ok(Self {
            res_types,
            filter: parse_filter(filter)?,
        })
    }
}

/// An indexable atom with its estimated cost.
struct IndexableAtom<'a> {
    index: &'a Index,
    key: AttrValue,
    count: i64,
}

/// Computes the candidate resource ids for one resource type, or `None` when
/// the filter offers no indexable atom and a full scan is required.
pub(crate) fn candidate_rids(
    filter: &Filter,
    indices: &HashMap<String, Index>,
    presence: &Index,
    txn: &impl SnapshotRead,
) -> ScimResult<Option<Vec<String>>> {
    let mut atoms = Vec::new();
    collect_atoms(filter, indices, presence, txn, &mut atoms)?;

    let Some(best) = atoms.into_iter().min_by_key(|a| a.count) else {
        return Ok(None);
    };
    log::debug!(
        "search candidates from index {} ({} tuples)",
        best.index.name,
        best.count
    );

    if best.index.allow_dup_key {
        Ok(Some(best.index.get_rids(txn, &best.key)?))
    } else {
        Ok(Some(best.index.get_rid(txn, &best.key)?.into_iter().collect()))
    }
}

fn collect_atoms<'a>(
    filter: &Filter,
    indices: &'a HashMap<String, Index>,
    presence: &'a Index,
    txn: &impl SnapshotRead,
    out: &mut Vec<IndexableAtom<'a>>,
) -> ScimResult<()> {
    match filter {
        // Only conjunctions preserve the superset property of a candidate
        // set; atoms under or/not stay with the evaluator.
        Filter::And(a, b) => {
            collect_atoms(a, indices, presence, txn, out)?;
            collect_atoms(b, indices, presence, txn, out)?;
        }
        Filter::Compare {
            path,
            op: CompareOp::Eq,
            value,
        } => {
            if let Some(index) = indices.get(&path.bare()) {
                if let Some(key) = coerce_for_index(index, value) {
                    let count = index.key_count(txn, &key)?;
                    out.push(IndexableAtom { index, key, count });
                }
            }
        }
        Filter::Present { path } => {
            if indices.contains_key(&path.bare()) {
                let key = AttrValue::String(path.bare());
                let count = presence.key_count(txn, &key)?;
                out.push(IndexableAtom {
                    index: presence,
                    key,
                    count,
                });
            }
        }
        _ => {}
    }
    Ok(())
}

/// Coerces a filter literal using the index's stored value type.
fn coerce_for_index(index: &Index, lit: &crate::filter::Literal) -> Option<AttrValue> {
    let def = AttributeDefinition {
        name: index.name.clone(),
        data_type: index.value_type,
        case_exact: index.case_sensitive,
        ..AttributeDefinition::default()
    };
    coerce_literal(&def, lit)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::AttributeType;
    use crate::storage::KvStore;

    fn indexed() -> (tempfile::TempDir, KvStore, HashMap<String, Index>, Index) {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("s.db")).unwrap();
        let mut indices = HashMap::new();
        indices.insert(
            "username".to_string(),
            Index::new("User", "username", AttributeType::String, false, false, false),
        );
        indices.insert(
            "emails.value".to_string(),
            Index::new("User", "emails.value", AttributeType::String, false, true, false),
        );
        let presence = Index::presence("User");

        let txn = store.begin_write().unwrap();
        txn.ensure_bucket(crate::silo::index::BUC_COUNTS).unwrap();
        let uname = &indices["username"];
        txn.ensure_bucket(&uname.bucket).unwrap();
        let emails = &indices["emails.value"];
        txn.ensure_dup_bucket(&emails.bucket).unwrap();
        txn.ensure_dup_bucket(&presence.bucket).unwrap();

        uname
            .add(&txn, &AttrValue::String("admin".into()), "r1")
            .unwrap();
        emails
            .add(&txn, &AttrValue::String("a@x".into()), "r1")
            .unwrap();
        emails
            .add(&txn, &AttrValue::String("a@x".into()), "r2")
            .unwrap();
        presence
            .add(&txn, &AttrValue::String("username".into()), "r1")
            .unwrap();
        txn.commit().unwrap();

        (dir, store, indices, presence)
    }

    #[test]
    fn test_picks_cheapest_eq_atom() {
        let (_d, store, indices, presence) = indexed();
        let read = store.begin_read().unwrap();
        let filter = parse_filter(r#"userName eq "admin" and emails.value eq "a@x""#).unwrap();
        let rids = candidate_rids(&filter, &indices, &presence, &read)
            .unwrap()
            .unwrap();
        // username has one tuple, emails two: the unique index wins.
        assert_eq!(rids, vec!["r1".to_string()]);
    }

    #[test]
    fn test_or_filter_forces_full_scan() {
        let (_d, store, indices, presence) = indexed();
        let read = store.begin_read().unwrap();
        let filter = parse_filter(r#"userName eq "admin" or emails.value eq "a@x""#).unwrap();
        assert!(candidate_rids(&filter, &indices, &presence, &read)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_presence_atom_uses_system_index() {
        let (_d, store, indices, presence) = indexed();
        let read = store.begin_read().unwrap();
        let filter = parse_filter("userName pr").unwrap();
        let rids = candidate_rids(&filter, &indices, &presence, &read)
            .unwrap()
            .unwrap();
        assert_eq!(rids, vec!["r1".to_string()]);
    }

    #[test]
    fn test_unindexed_atom_scans() {
        let (_d, store, indices, presence) = indexed();
        let read = store.begin_read().unwrap();
        let filter = parse_filter(r#"displayName eq "x""#).unwrap();
        assert!(candidate_rids(&filter, &indices, &presence, &read)
            .unwrap()
            .is_none());
    }
}
