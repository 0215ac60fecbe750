//! Level handlers: the sorted, range-disjoint table runs below L0.

use std::sync::Arc;

use bytes::Bytes;

use crate::error::Result;
use crate::format::{self, Value};
use crate::sstable::SsTable;

/// An immutable snapshot of one level of one column family. Edits build a
/// new handler and swap it in; readers keep their captured handler.
pub struct LevelHandler {
    level: usize,
    tables: Vec<Arc<SsTable>>,
    total_size: u64,
}

impl LevelHandler {
    pub fn new(level: usize) -> Self {
        Self {
            level,
            tables: Vec::new(),
            total_size: 0,
        }
    }

    /// Build a handler from tables. Sorts by smallest key; ranges must be
    /// pairwise disjoint for levels at or above 1.
    pub fn with_tables(level: usize, mut tables: Vec<Arc<SsTable>>) -> Self {
        tables.sort_by(|a, b| a.smallest().cmp(b.smallest()));
        debug_assert!(tables
            .windows(2)
            .all(|w| w[0].biggest() < w[1].smallest()));
        let total_size = tables.iter().map(|t| t.size()).sum();
        Self {
            level,
            tables,
            total_size,
        }
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn tables(&self) -> &[Arc<SsTable>] {
        &self.tables
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Point lookup: ranges are disjoint, so at most one table can hold the
    /// key. Binary-search for the first table whose biggest key reaches the
    /// newest possible internal key of `key`, then consult only that table.
    pub fn get(&self, key: &[u8], version: u64, key_hash: u64) -> Result<Option<Value>> {
        let target = format::encode_internal(key, u64::MAX);
        let idx = self
            .tables
            .partition_point(|t| t.biggest().as_ref() < target.as_ref());
        match self.tables.get(idx) {
            Some(table) => table.get(key, version, key_hash),
            None => Ok(None),
        }
    }

    /// Tables whose key range intersects `[smallest, biggest]` (internal
    /// keys), as a subslice index range.
    pub fn overlapping(&self, smallest: &[u8], biggest: &[u8]) -> std::ops::Range<usize> {
        let start = self
            .tables
            .partition_point(|t| t.biggest().as_ref() < smallest);
        let end = self
            .tables
            .partition_point(|t| t.smallest().as_ref() <= biggest);
        start..end.max(start)
    }

    /// Replace `deleted` table ids with `added` tables, producing the next
    /// published handler.
    pub fn replace(&self, deleted: &[u64], added: Vec<Arc<SsTable>>) -> LevelHandler {
        let mut tables: Vec<Arc<SsTable>> = self
            .tables
            .iter()
            .filter(|t| !deleted.contains(&t.id()))
            .cloned()
            .collect();
        tables.extend(added);
        Self::with_tables(self.level, tables)
    }

    /// First key of the table run, if any.
    pub fn smallest(&self) -> Option<&Bytes> {
        self.tables.first().map(|t| t.smallest())
    }

    pub fn biggest(&self) -> Option<&Bytes> {
        self.tables.last().map(|t| t.biggest())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sstable::{TableBuilder, TableFile};
    use crate::tmpfs::TempDir;

    fn table_for_range(dir: &TempDir, id: u64, lo: u32, hi: u32) -> Arc<SsTable> {
        let mut builder = TableBuilder::new(1, true);
        for i in lo..hi {
            let key = format!("key-{i:05}");
            let ikey = format::encode_internal(key.as_bytes(), 1);
            builder.add(&ikey, &Value::new(1, key.clone().into_bytes()).encode());
        }
        let image = builder.finish();
        let path = dir.path().join(format!("{id:08}.sst"));
        std::fs::write(&path, &image).unwrap();
        let file = TableFile::open(id, path, false).unwrap();
        let len = file.size();
        SsTable::open(file, 0, len, None).unwrap()
    }

    #[test]
    fn test_sorted_and_sized() {
        let dir = TempDir::new().unwrap();
        let t1 = table_for_range(&dir, 1, 0, 100);
        let t2 = table_for_range(&dir, 2, 100, 200);
        let t3 = table_for_range(&dir, 3, 200, 300);
        // Construction order does not matter.
        let handler = LevelHandler::with_tables(1, vec![t3.clone(), t1.clone(), t2.clone()]);
        assert_eq!(handler.tables()[0].id(), 1);
        assert_eq!(handler.tables()[2].id(), 3);
        assert_eq!(
            handler.total_size(),
            t1.size() + t2.size() + t3.size()
        );
    }

    #[test]
    fn test_point_get_probes_one_table() {
        let dir = TempDir::new().unwrap();
        let handler = LevelHandler::with_tables(
            1,
            vec![
                table_for_range(&dir, 1, 0, 100),
                table_for_range(&dir, 2, 100, 200),
            ],
        );
        let key = b"key-00150";
        let hash = farmhash::fingerprint64(key);
        let v = handler.get(key, u64::MAX, hash).unwrap().unwrap();
        assert_eq!(v.value, &b"key-00150"[..]);

        let missing = b"key-00500";
        let hash = farmhash::fingerprint64(missing);
        assert!(handler.get(missing, u64::MAX, hash).unwrap().is_none());
    }

    #[test]
    fn test_point_get_table_boundary_keys() {
        // Records are stored at version 1, so the smallest internal key of
        // each table is larger than (key, MAX); the boundary user keys must
        // still be readable.
        let dir = TempDir::new().unwrap();
        let handler = LevelHandler::with_tables(
            1,
            vec![
                table_for_range(&dir, 1, 0, 100),
                table_for_range(&dir, 2, 100, 200),
            ],
        );
        for key in [
            &b"key-00000"[..],
            &b"key-00100"[..],
            &b"key-00099"[..],
            &b"key-00199"[..],
        ] {
            let hash = farmhash::fingerprint64(key);
            let v = handler.get(key, u64::MAX, hash).unwrap().unwrap();
            assert_eq!(v.value, key, "boundary key {key:?}");
        }

        // Reading at the exact stored version finds it too.
        let hash = farmhash::fingerprint64(b"key-00100");
        let v = handler.get(b"key-00100", 1, hash).unwrap().unwrap();
        assert_eq!(v.version, 1);
        // Below the stored version there is nothing visible.
        assert!(handler.get(b"key-00100", 0, hash).unwrap().is_none());
    }

    #[test]
    fn test_overlapping_range() {
        let dir = TempDir::new().unwrap();
        let handler = LevelHandler::with_tables(
            1,
            vec![
                table_for_range(&dir, 1, 0, 100),
                table_for_range(&dir, 2, 100, 200),
                table_for_range(&dir, 3, 200, 300),
            ],
        );
        let lo = format::encode_internal(b"key-00150", u64::MAX);
        let hi = format::encode_internal(b"key-00250", 0);
        assert_eq!(handler.overlapping(&lo, &hi), 1..3);

        let lo = format::encode_internal(b"key-99990", u64::MAX);
        let hi = format::encode_internal(b"key-99999", 0);
        let range = handler.overlapping(&lo, &hi);
        assert!(range.is_empty());
    }

    #[test]
    fn test_replace_swaps_tables() {
        let dir = TempDir::new().unwrap();
        let t1 = table_for_range(&dir, 1, 0, 100);
        let t2 = table_for_range(&dir, 2, 100, 200);
        let handler = LevelHandler::with_tables(1, vec![t1, t2]);

        let merged = table_for_range(&dir, 9, 0, 200);
        let next = handler.replace(&[1, 2], vec![merged]);
        assert_eq!(next.tables().len(), 1);
        assert_eq!(next.tables()[0].id(), 9);
        // The original handler is untouched.
        assert_eq!(handler.tables().len(), 2);
    }
}
