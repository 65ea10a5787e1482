//! Storage adapter over the embedded KV engine.
//!
//! Wraps a redb database behind named buckets of bytes. Two bucket shapes
//! exist: plain buckets (one value per key, used for resource rows, unique
//! indices and the meta-buckets) and duplicate-key buckets (redb multimap
//! tables, used for indices whose keys map to sets of resource ids).
//!
//! redb gives the transactional contract the silo relies on: a single writer
//! at a time, readers isolated on committed snapshots, atomic commit, and
//! rollback that discards every change including bucket creation.

use std::path::Path;

use redb::{
    Database, MultimapTableDefinition, MultimapTableHandle as _, ReadableMultimapTable,
    ReadableTable, TableDefinition, TableHandle as _,
};

use crate::error::{ScimError, ScimResult};

fn plain(name: &str) -> TableDefinition<'_, &'static [u8], &'static [u8]> {
    TableDefinition::new(name)
}

fn dup(name: &str) -> MultimapTableDefinition<'_, &'static [u8], &'static [u8]> {
    MultimapTableDefinition::new(name)
}

/// Handle to the on-disk store. Cheap to share behind the silo; must outlive
/// every transaction it produced.
pub struct KvStore {
    db: Database,
}

impl KvStore {
    /// Opens (creating if necessary) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> ScimResult<Self> {
        let db = Database::create(path)?;
        Ok(Self { db })
    }

    /// Begins the single write transaction; blocks while another writer is
    /// active.
    pub fn begin_write(&self) -> ScimResult<WriteTxn> {
        Ok(WriteTxn {
            txn: self.db.begin_write()?,
        })
    }

    /// Begins a read-only snapshot transaction.
    pub fn begin_read(&self) -> ScimResult<ReadTxn> {
        Ok(ReadTxn {
            txn: self.db.begin_read()?,
        })
    }
}

/// Read-side operations shared by both transaction kinds, so index lookups
/// can run against either a snapshot or the write transaction in progress.
pub trait SnapshotRead {
    /// Value stored under `key`, or `None`.
    fn get(&self, bucket: &str, key: &[u8]) -> ScimResult<Option<Vec<u8>>>;

    /// Visits every `(key, value)` pair of a plain bucket in key order.
    fn for_each(
        &self,
        bucket: &str,
        f: &mut dyn FnMut(&[u8], &[u8]) -> ScimResult<()>,
    ) -> ScimResult<()>;

    /// All values stored under `key` in a duplicate-key bucket.
    fn dup_values(&self, bucket: &str, key: &[u8]) -> ScimResult<Vec<Vec<u8>>>;

    /// Whether a duplicate-key bucket has any value under `key`.
    fn dup_has_key(&self, bucket: &str, key: &[u8]) -> ScimResult<bool> {
        Ok(!self.dup_values(bucket, key)?.is_empty())
    }
}

/// The one read-write transaction.
pub struct WriteTxn {
    txn: redb::WriteTransaction,
}

impl WriteTxn {
    /// Creates a plain bucket if missing.
    pub fn ensure_bucket(&self, bucket: &str) -> ScimResult<()> {
        self.txn.open_table(plain(bucket))?;
        Ok(())
    }

    /// Creates a duplicate-key bucket if missing.
    pub fn ensure_dup_bucket(&self, bucket: &str) -> ScimResult<()> {
        self.txn.open_multimap_table(dup(bucket))?;
        Ok(())
    }

    /// Deletes a plain bucket and everything in it.
    pub fn drop_bucket(&self, bucket: &str) -> ScimResult<bool> {
        Ok(self.txn.delete_table(plain(bucket))?)
    }

    /// Deletes a duplicate-key bucket and everything in it.
    pub fn drop_dup_bucket(&self, bucket: &str) -> ScimResult<bool> {
        Ok(self.txn.delete_multimap_table(dup(bucket))?)
    }

    /// Names of all plain buckets.
    pub fn bucket_names(&self) -> ScimResult<Vec<String>> {
        Ok(self
            .txn
            .list_tables()?
            .map(|h| h.name().to_string())
            .collect())
    }

    /// Names of all duplicate-key buckets.
    pub fn dup_bucket_names(&self) -> ScimResult<Vec<String>> {
        Ok(self
            .txn
            .list_multimap_tables()?
            .map(|h| h.name().to_string())
            .collect())
    }

    pub fn put(&self, bucket: &str, key: &[u8], value: &[u8]) -> ScimResult<()> {
        let mut table = self.txn.open_table(plain(bucket))?;
        table.insert(key, value)?;
        Ok(())
    }

    /// Removes `key`; returns whether it existed.
    pub fn delete(&self, bucket: &str, key: &[u8]) -> ScimResult<bool> {
        let mut table = self.txn.open_table(plain(bucket))?;
        let removed = table.remove(key)?.is_some();
        Ok(removed)
    }

    /// Adds `value` under `key` in a duplicate-key bucket.
    pub fn dup_put(&self, bucket: &str, key: &[u8], value: &[u8]) -> ScimResult<()> {
        let mut table = self.txn.open_multimap_table(dup(bucket))?;
        table.insert(key, value)?;
        Ok(())
    }

    /// Removes one `(key, value)` pair; returns whether it existed.
    pub fn dup_delete(&self, bucket: &str, key: &[u8], value: &[u8]) -> ScimResult<bool> {
        let mut table = self.txn.open_multimap_table(dup(bucket))?;
        Ok(table.remove(key, value)?)
    }

    /// Removes every value under `key`.
    pub fn dup_clear(&self, bucket: &str, key: &[u8]) -> ScimResult<()> {
        let mut table = self.txn.open_multimap_table(dup(bucket))?;
        table.remove_all(key)?;
        Ok(())
    }

    /// Atomically publishes every change made in this transaction.
    pub fn commit(self) -> ScimResult<()> {
        self.txn.commit()?;
        Ok(())
    }

    /// Discards every change, including bucket creations.
    pub fn abort(self) {
        let _ = self.txn.abort();
    }
}

impl SnapshotRead for WriteTxn {
    fn get(&self, bucket: &str, key: &[u8]) -> ScimResult<Option<Vec<u8>>> {
        let table = self.txn.open_table(plain(bucket))?;
        let value = table.get(key)?.map(|g| g.value().to_vec());
        Ok(value)
    }

    fn for_each(
        &self,
        bucket: &str,
        f: &mut dyn FnMut(&[u8], &[u8]) -> ScimResult<()>,
    ) -> ScimResult<()> {
        let table = self.txn.open_table(plain(bucket))?;
        for entry in table.iter()? {
            let (k, v) = entry?;
            f(k.value(), v.value())?;
        }
        Ok(())
    }

    fn dup_values(&self, bucket: &str, key: &[u8]) -> ScimResult<Vec<Vec<u8>>> {
        let table = self.txn.open_multimap_table(dup(bucket))?;
        let mut out = Vec::new();
        for guard in table.get(key)? {
            out.push(guard?.value().to_vec());
        }
        Ok(out)
    }
}

/// A read-only snapshot. Buckets that do not exist yet read as empty.
pub struct ReadTxn {
    txn: redb::ReadTransaction,
}

impl SnapshotRead for ReadTxn {
    fn get(&self, bucket: &str, key: &[u8]) -> ScimResult<Option<Vec<u8>>> {
        let table = match self.txn.open_table(plain(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(None),
            Err(e) => return Err(ScimError::from(e)),
        };
        Ok(table.get(key)?.map(|g| g.value().to_vec()))
    }

    fn for_each(
        &self,
        bucket: &str,
        f: &mut dyn FnMut(&[u8], &[u8]) -> ScimResult<()>,
    ) -> ScimResult<()> {
        let table = match self.txn.open_table(plain(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(()),
            Err(e) => return Err(ScimError::from(e)),
        };
        for entry in table.iter()? {
            let (k, v) = entry?;
            f(k.value(), v.value())?;
        }
        Ok(())
    }

    fn dup_values(&self, bucket: &str, key: &[u8]) -> ScimResult<Vec<Vec<u8>>> {
        let table = match self.txn.open_multimap_table(dup(bucket)) {
            Ok(t) => t,
            Err(redb::TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
            Err(e) => return Err(ScimError::from(e)),
        };
        let mut out = Vec::new();
        for guard in table.get(key)? {
            out.push(guard?.value().to_vec());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, KvStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = KvStore::open(dir.path().join("test.db")).unwrap();
        (dir, store)
    }

    #[test]
    fn test_put_get_delete_round_trip() {
        let (_dir, store) = store();
        let txn = store.begin_write().unwrap();
        txn.put("b", b"k", b"v").unwrap();
        assert_eq!(txn.get("b", b"k").unwrap(), Some(b"v".to_vec()));
        txn.commit().unwrap();

        let read = store.begin_read().unwrap();
        assert_eq!(read.get("b", b"k").unwrap(), Some(b"v".to_vec()));

        let txn = store.begin_write().unwrap();
        assert!(txn.delete("b", b"k").unwrap());
        assert!(!txn.delete("b", b"k").unwrap());
        txn.commit().unwrap();
    }

    #[test]
    fn test_abort_discards_changes() {
        let (_dir, store) = store();
        let txn = store.begin_write().unwrap();
        txn.put("b", b"k", b"v").unwrap();
        txn.abort();

        let read = store.begin_read().unwrap();
        assert_eq!(read.get("b", b"k").unwrap(), None);
    }

    #[test]
    fn test_dup_bucket_semantics() {
        let (_dir, store) = store();
        let txn = store.begin_write().unwrap();
        txn.dup_put("d", b"k", b"r1").unwrap();
        txn.dup_put("d", b"k", b"r2").unwrap();
        assert!(txn.dup_has_key("d", b"k").unwrap());
        assert_eq!(txn.dup_values("d", b"k").unwrap().len(), 2);

        assert!(txn.dup_delete("d", b"k", b"r1").unwrap());
        assert!(!txn.dup_delete("d", b"k", b"r1").unwrap());
        assert_eq!(txn.dup_values("d", b"k").unwrap().len(), 1);
        txn.commit().unwrap();
    }

    #[test]
    fn test_missing_bucket_reads_empty() {
        let (_dir, store) = store();
        let read = store.begin_read().unwrap();
        assert_eq!(read.get("nope", b"k").unwrap(), None);
        assert!(read.dup_values("nope", b"k").unwrap().is_empty());
        let mut seen = 0;
        read.for_each("nope", &mut |_, _| {
            seen += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, 0);
    }
}
