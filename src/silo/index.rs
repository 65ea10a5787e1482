//! Secondary indices over attribute values.
//!
//! Each index covers one (resource type, attribute path) pair and lives in
//! its own bucket named `<ResName>:<lowerAttrName>` (suffixed `_system` for
//! system indices such as the presence index). Unique indices map an encoded
//! value directly to the owning resource id; duplicate-key indices map the
//! encoded value to a set of ids and keep a per-value multiplicity next to
//! the per-index total in the `counts` bucket.

use serde::{Deserialize, Serialize};

use crate::error::{ScimError, ScimResult};
use crate::resource::value::{decode_i64, encode_i64};
use crate::resource::AttrValue;
use crate::schema::AttributeType;
use crate::storage::{SnapshotRead, WriteTxn};

/// Meta-bucket listing the resource buckets.
pub const BUC_RESOURCES: &str = "resources";
/// Meta-bucket holding the serialized index definitions.
pub const BUC_INDICES: &str = "indices";
/// Meta-bucket holding total and per-value tuple counts.
pub const BUC_COUNTS: &str = "counts";
/// Separates the resource name from the attribute name in bucket names.
pub const RES_INDEX_DELIM: &str = ":";
/// Suffix of system index buckets, which survive config changes.
pub const SYSTEM_SUFFIX: &str = "_system";

/// Name of the per-resource-type presence index.
pub const PRESENCE_INDEX: &str = "presence";

/// One secondary index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Index {
    /// Lowercase attribute path, e.g. `username` or `emails.value`.
    pub name: String,
    /// Bucket name, `<ResName>:<name>` (+ `_system`).
    pub bucket: String,
    /// Declared type of the indexed values.
    pub value_type: AttributeType,
    /// Whether string keys keep their case.
    pub case_sensitive: bool,
    /// True when the attribute, or its complex parent, is multi-valued.
    pub allow_dup_key: bool,
}

impl Index {
    pub fn new(
        res_name: &str,
        attr_path: &str,
        value_type: AttributeType,
        case_sensitive: bool,
        allow_dup_key: bool,
        system: bool,
    ) -> Self {
        let name = attr_path.to_lowercase();
        let mut bucket = format!("{}{}{}", res_name, RES_INDEX_DELIM, name);
        if system {
            bucket.push_str(SYSTEM_SUFFIX);
        }
        Self {
            name,
            bucket,
            value_type,
            case_sensitive,
            allow_dup_key,
        }
    }

    /// The presence index of a resource type: duplicate-keyed by attribute
    /// path rather than by value.
    pub fn presence(res_name: &str) -> Self {
        Self::new(
            res_name,
            PRESENCE_INDEX,
            AttributeType::String,
            false,
            true,
            true,
        )
    }

    fn key(&self, val: &AttrValue) -> Vec<u8> {
        val.index_key(self.case_sensitive)
    }

    fn value_count_key(&self, val: &AttrValue) -> Vec<u8> {
        format!(
            "{}{}{}_count",
            self.bucket,
            RES_INDEX_DELIM,
            val.count_key()
        )
        .into_bytes()
    }

    /// Inserts the (value, rid) tuple.
    ///
    /// Unique indices fail fast with a `uniqueness` error when the key is
    /// already taken by another resource; callers are expected to have
    /// checked beforehand.
    pub fn add(&self, txn: &WriteTxn, val: &AttrValue, rid: &str) -> ScimResult<()> {
        log::debug!("adding value {} of resource {} to index {}", val.count_key(), rid, self.name);
        let key = self.key(val);
        if self.allow_dup_key {
            txn.dup_put(&self.bucket, &key, rid.as_bytes())?;
            bump_count(txn, &self.value_count_key(val), 1)?;
        } else {
            if let Some(existing) = txn.get(&self.bucket, &key)? {
                if existing != rid.as_bytes() {
                    return Err(ScimError::uniqueness(format!(
                        "value {} of attribute {} already exists",
                        val.count_key(),
                        self.name
                    )));
                }
            }
            txn.put(&self.bucket, &key, rid.as_bytes())?;
        }
        bump_count(txn, self.bucket.as_bytes(), 1)?;
        Ok(())
    }

    /// Removes the (value, rid) tuple; missing tuples are ignored.
    pub fn remove(&self, txn: &WriteTxn, val: &AttrValue, rid: &str) -> ScimResult<()> {
        log::debug!(
            "removing value {} of resource {} from index {}",
            val.count_key(),
            rid,
            self.name
        );
        let key = self.key(val);
        let removed = if self.allow_dup_key {
            let removed = txn.dup_delete(&self.bucket, &key, rid.as_bytes())?;
            if removed {
                bump_count(txn, &self.value_count_key(val), -1)?;
            }
            removed
        } else {
            txn.delete(&self.bucket, &key)?
        };
        if removed {
            bump_count(txn, self.bucket.as_bytes(), -1)?;
        }
        Ok(())
    }

    /// Whether any resource carries this value.
    pub fn has_val(&self, txn: &impl SnapshotRead, val: &AttrValue) -> ScimResult<bool> {
        let key = self.key(val);
        if self.allow_dup_key {
            txn.dup_has_key(&self.bucket, &key)
        } else {
            Ok(txn.get(&self.bucket, &key)?.is_some())
        }
    }

    /// Resource id holding the value; unique indices only.
    pub fn get_rid(&self, txn: &impl SnapshotRead, val: &AttrValue) -> ScimResult<Option<String>> {
        let key = self.key(val);
        Ok(txn
            .get(&self.bucket, &key)?
            .map(|b| String::from_utf8_lossy(&b).into_owned()))
    }

    /// Resource ids holding the value; duplicate-key indices only.
    pub fn get_rids(&self, txn: &impl SnapshotRead, val: &AttrValue) -> ScimResult<Vec<String>> {
        let key = self.key(val);
        Ok(txn
            .dup_values(&self.bucket, &key)?
            .into_iter()
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .collect())
    }

    /// Number of tuples stored for this value.
    pub fn key_count(&self, txn: &impl SnapshotRead, val: &AttrValue) -> ScimResult<i64> {
        if self.allow_dup_key {
            read_count(txn, &self.value_count_key(val))
        } else {
            Ok(if self.has_val(txn, val)? { 1 } else { 0 })
        }
    }

    /// Total number of tuples in the index.
    pub fn total_count(&self, txn: &impl SnapshotRead) -> ScimResult<i64> {
        read_count(txn, self.bucket.as_bytes())
    }

    /// Persists the index definition into the `indices` meta-bucket.
    pub fn save(&self, txn: &WriteTxn) -> ScimResult<()> {
        let data = serde_json::to_vec(self)
            .map_err(|e| ScimError::internal(format!("encode index: {}", e)))?;
        txn.put(BUC_INDICES, self.bucket.as_bytes(), &data)
    }
}

/// Reads a count from the `counts` bucket; missing keys are zero.
pub fn read_count(txn: &impl SnapshotRead, key: &[u8]) -> ScimResult<i64> {
    match txn.get(BUC_COUNTS, key)? {
        Some(data) => decode_i64(&data),
        None => Ok(0),
    }
}

/// Adjusts a count by `delta`, deleting the key when it reaches zero.
pub fn bump_count(txn: &WriteTxn, key: &[u8], delta: i64) -> ScimResult<i64> {
    let current = read_count(txn, key)?;
    let next = current + delta;
    if next <= 0 {
        txn.delete(BUC_COUNTS, key)?;
        Ok(0)
    } else {
        txn.put(BUC_COUNTS, key, &encode_i64(next))?;
        Ok(next)
    }
}
