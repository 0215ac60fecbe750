use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};

use super::builder::CASTAGNOLI;
use super::{SsTable, TableFile, TableIter, L0_FOOTER_SIZE, L0_MAGIC};
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::format::Value;

/// An L0 file: one table image per column family that was present in the
/// flushed memtable, all sharing the memtable's commit version.
pub struct L0Table {
    file: Arc<TableFile>,
    cfs: Vec<Option<Arc<SsTable>>>,
    commit_version: u64,
}

impl L0Table {
    pub fn open(file: Arc<TableFile>, cache: Option<Arc<BlockCache>>) -> Result<Arc<Self>> {
        let size = file.size();
        if (size as usize) < L0_FOOTER_SIZE {
            return Err(Error::CorruptFile(format!(
                "l0 table {} too small: {size}",
                file.id()
            )));
        }
        let footer = file.read(size - L0_FOOTER_SIZE as u64, L0_FOOTER_SIZE)?;
        let magic = BigEndian::read_u32(&footer[20..24]);
        if magic != L0_MAGIC {
            return Err(Error::CorruptFile(format!(
                "bad magic in l0 table {}: {magic:#x}",
                file.id()
            )));
        }
        let cf_index_off = BigEndian::read_u64(&footer[0..8]);
        let commit_version = BigEndian::read_u64(&footer[8..16]);
        let trailer_crc = BigEndian::read_u32(&footer[16..20]);

        let trailer_len = size - L0_FOOTER_SIZE as u64 - cf_index_off;
        let trailer = file.read(cf_index_off, trailer_len as usize)?;
        if CASTAGNOLI.checksum(&trailer) != trailer_crc {
            return Err(Error::CorruptFile(format!(
                "trailer checksum mismatch in l0 table {}",
                file.id()
            )));
        }
        if trailer.len() < 4 {
            return Err(Error::CorruptFile("truncated l0 trailer".into()));
        }
        let num_cfs = BigEndian::read_u32(&trailer[..4]) as usize;
        if trailer.len() < 4 + num_cfs * 12 {
            return Err(Error::CorruptFile("truncated l0 cf index".into()));
        }
        let mut cfs = Vec::with_capacity(num_cfs);
        for cf in 0..num_cfs {
            let pos = 4 + cf * 12;
            let off = BigEndian::read_u64(&trailer[pos..pos + 8]);
            let len = BigEndian::read_u32(&trailer[pos + 8..pos + 12]) as u64;
            if len == 0 {
                cfs.push(None);
                continue;
            }
            let table = SsTable::open(file.clone(), off, len, cache.clone())?;
            cfs.push(Some(table));
        }

        Ok(Arc::new(Self {
            file,
            cfs,
            commit_version,
        }))
    }

    pub fn id(&self) -> u64 {
        self.file.id()
    }

    pub fn commit_version(&self) -> u64 {
        self.commit_version
    }

    pub fn size(&self) -> u64 {
        self.file.size()
    }

    pub fn num_cfs(&self) -> usize {
        self.cfs.len()
    }

    pub fn cf_table(&self, cf: usize) -> Option<&Arc<SsTable>> {
        self.cfs.get(cf).and_then(|t| t.as_ref())
    }

    /// (smallest, biggest) internal keys across all column families.
    pub fn bounds(&self) -> (bytes::Bytes, bytes::Bytes) {
        let smallest = self
            .cfs
            .iter()
            .flatten()
            .map(|t| t.smallest())
            .min()
            .cloned()
            .unwrap_or_default();
        let biggest = self
            .cfs
            .iter()
            .flatten()
            .map(|t| t.biggest())
            .max()
            .cloned()
            .unwrap_or_default();
        (smallest, biggest)
    }

    /// Lookup fans out to the requested column family's sub-table only.
    pub fn get(&self, cf: usize, key: &[u8], version: u64, key_hash: u64) -> Result<Option<Value>> {
        match self.cf_table(cf) {
            Some(table) => table.get(key, version, key_hash),
            None => Ok(None),
        }
    }

    pub fn iter(&self, cf: usize, reversed: bool) -> Option<TableIter> {
        self.cf_table(cf).map(|t| t.iter(reversed))
    }

    pub fn close(&self) {
        self.file.close();
    }

    pub fn delete(&self) {
        self.file.delete();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format;
    use crate::sstable::L0Builder;
    use crate::tmpfs::TempDir;
    use bytes::Bytes;

    fn build_l0(dir: &TempDir) -> Arc<L0Table> {
        let mut builder = L0Builder::new(3, 42);
        for i in 0..100 {
            let key = format!("a-{i:03}");
            let ikey = format::encode_internal(key.as_bytes(), 42);
            builder.add(0, &ikey, &Value::new(42, key.clone().into_bytes()).encode());
        }
        // CF 1 intentionally left empty.
        for i in 0..10 {
            let key = format!("c-{i:03}");
            let ikey = format::encode_internal(key.as_bytes(), 42);
            builder.add(2, &ikey, &Value::new(42, Bytes::from_static(b"z")).encode());
        }
        let image = builder.finish();
        let path = dir.path().join("00000007.l0");
        std::fs::write(&path, &image).unwrap();
        let file = TableFile::open(7, path, false).unwrap();
        L0Table::open(file, None).unwrap()
    }

    #[test]
    fn test_per_cf_subtables() {
        let dir = TempDir::new().unwrap();
        let l0 = build_l0(&dir);
        assert_eq!(l0.commit_version(), 42);
        assert_eq!(l0.num_cfs(), 3);
        assert!(l0.cf_table(0).is_some());
        assert!(l0.cf_table(1).is_none());
        assert!(l0.cf_table(2).is_some());
    }

    #[test]
    fn test_get_routes_to_cf() {
        let dir = TempDir::new().unwrap();
        let l0 = build_l0(&dir);
        let hash = farmhash::fingerprint64(b"a-050");
        let v = l0.get(0, b"a-050", u64::MAX, hash).unwrap().unwrap();
        assert_eq!(v.value, Bytes::from("a-050"));
        // Present in CF 0, absent from CF 2.
        assert!(l0.get(2, b"a-050", u64::MAX, hash).unwrap().is_none());
        assert!(l0.get(1, b"a-050", u64::MAX, hash).unwrap().is_none());
    }

    #[test]
    fn test_iter_cf() {
        let dir = TempDir::new().unwrap();
        let l0 = build_l0(&dir);
        let n = l0.iter(0, false).unwrap().count();
        assert_eq!(n, 100);
        assert!(l0.iter(1, false).is_none());
    }
}
