use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use memmap2::Mmap;

use super::builder::{Bloom, CASTAGNOLI};
use super::{TABLE_FOOTER_SIZE, TABLE_MAGIC};
use crate::cache::BlockCache;
use crate::error::{Error, Result};
use crate::format::{self, Value};

/// An open table file handle shared by the table readers built over it. An
/// L0 file carries several table images; `.sst` files carry one at offset 0.
pub struct TableFile {
    id: u64,
    path: PathBuf,
    file: File,
    size: u64,
    mmap: Option<Mmap>,
    deleted: AtomicBool,
}

impl TableFile {
    /// Open a table file. `use_mmap` is set when the block cache is
    /// disabled, switching block reads to a shared mapping.
    pub fn open(id: u64, path: PathBuf, use_mmap: bool) -> Result<Arc<Self>> {
        let file = File::open(&path)?;
        let size = file.metadata()?.len();
        let mmap = if use_mmap {
            // Safe: table files are immutable once published; the engine
            // never writes to a file after it becomes readable.
            Some(unsafe { Mmap::map(&file)? })
        } else {
            None
        };
        Ok(Arc::new(Self {
            id,
            path,
            file,
            size,
            mmap,
            deleted: AtomicBool::new(false),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn read(&self, offset: u64, len: usize) -> Result<Bytes> {
        if offset + len as u64 > self.size {
            return Err(Error::CorruptFile(format!(
                "read past end of table {}: {}+{} > {}",
                self.id, offset, len, self.size
            )));
        }
        if let Some(mmap) = &self.mmap {
            let start = offset as usize;
            return Ok(Bytes::copy_from_slice(&mmap[start..start + len]));
        }
        let mut buf = vec![0u8; len];
        read_exact_at(&self.file, &mut buf, offset)?;
        Ok(Bytes::from(buf))
    }

    /// Close the handle. Destruction happens on drop; kept explicit for the
    /// reclaimer contract and safe to call repeatedly.
    pub fn close(&self) {}

    /// Unlink the backing file. Idempotent.
    pub fn delete(&self) {
        if !self.deleted.swap(true, Ordering::SeqCst) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                tracing::warn!(file_id = self.id, error = %e, "failed to delete table file");
            }
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(not(unix))]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file.try_clone()?;
    f.seek(SeekFrom::Start(offset))?;
    f.read_exact(buf)
}

struct IndexEntry {
    first_key: Bytes,
    offset: u64,
    len: u32,
}

/// A readable sorted table image inside a [`TableFile`].
pub struct SsTable {
    file: Arc<TableFile>,
    base: u64,
    len: u64,
    index: Vec<IndexEntry>,
    filter: Option<Bloom>,
    smallest: Bytes,
    biggest: Bytes,
    commit_version: u64,
    cache: Option<Arc<BlockCache>>,
}

impl SsTable {
    /// Parse the image footprint `[base, base+len)` of `file`.
    pub fn open(
        file: Arc<TableFile>,
        base: u64,
        len: u64,
        cache: Option<Arc<BlockCache>>,
    ) -> Result<Arc<Self>> {
        if (len as usize) < TABLE_FOOTER_SIZE {
            return Err(Error::CorruptFile(format!(
                "table {} too small: {len}",
                file.id()
            )));
        }
        let footer = file.read(base + len - TABLE_FOOTER_SIZE as u64, TABLE_FOOTER_SIZE)?;
        let magic = BigEndian::read_u32(&footer[48..52]);
        if magic != TABLE_MAGIC {
            return Err(Error::CorruptFile(format!(
                "bad magic in table {}: {magic:#x}",
                file.id()
            )));
        }
        let index_off = BigEndian::read_u64(&footer[0..8]);
        let index_len = BigEndian::read_u32(&footer[8..12]) as u64;
        let filter_off = BigEndian::read_u64(&footer[12..20]);
        let filter_len = BigEndian::read_u32(&footer[20..24]) as u64;
        let props_off = BigEndian::read_u64(&footer[24..32]);
        let props_len = BigEndian::read_u32(&footer[32..36]) as u64;
        let commit_version = BigEndian::read_u64(&footer[36..44]);
        let meta_crc = BigEndian::read_u32(&footer[44..48]);

        let meta_len = (index_len + filter_len + props_len) as usize;
        if index_off + meta_len as u64 + TABLE_FOOTER_SIZE as u64 != len {
            return Err(Error::CorruptFile(format!(
                "inconsistent footer in table {}",
                file.id()
            )));
        }
        let meta = file.read(base + index_off, meta_len)?;
        if CASTAGNOLI.checksum(&meta) != meta_crc {
            return Err(Error::CorruptFile(format!(
                "meta checksum mismatch in table {}",
                file.id()
            )));
        }

        let index = decode_index(meta.slice(..index_len as usize))?;
        let filter = if filter_len > 0 {
            Bloom::decode(&meta[(filter_off - index_off) as usize..(filter_off - index_off + filter_len) as usize])
        } else {
            None
        };
        let props = meta.slice((props_off - index_off) as usize..);
        let (smallest, biggest) = decode_props(&props)?;

        Ok(Arc::new(Self {
            file,
            base,
            len,
            index,
            filter,
            smallest,
            biggest,
            commit_version,
            cache,
        }))
    }

    pub fn id(&self) -> u64 {
        self.file.id()
    }

    pub fn size(&self) -> u64 {
        self.len
    }

    pub fn commit_version(&self) -> u64 {
        self.commit_version
    }

    /// Smallest internal key in the table.
    pub fn smallest(&self) -> &Bytes {
        &self.smallest
    }

    /// Biggest internal key in the table.
    pub fn biggest(&self) -> &Bytes {
        &self.biggest
    }

    pub fn file(&self) -> &Arc<TableFile> {
        &self.file
    }

    /// Newest record for `key` at or below `version`, if this table holds
    /// one. `key_hash` is the farmhash fingerprint used for the filter probe.
    pub fn get(&self, key: &[u8], version: u64, key_hash: u64) -> Result<Option<Value>> {
        if let Some(filter) = &self.filter {
            if !filter.may_contain(key_hash) {
                return Ok(None);
            }
        }
        let seek = format::encode_internal(key, version);
        // First block whose first key is past the seek target.
        let upper = self
            .index
            .partition_point(|e| e.first_key.as_ref() <= seek.as_ref());
        let candidates = [
            upper.checked_sub(1),
            (upper < self.index.len()).then_some(upper),
        ];
        for block_idx in candidates.into_iter().flatten() {
            let entries = self.load_block(block_idx)?;
            let pos = entries.partition_point(|(k, _)| k.as_ref() < seek.as_ref());
            if let Some((ikey, val)) = entries.get(pos) {
                // The successor of the seek key decides: either it is the
                // requested user key, or the key has no visible version.
                if format::user_key(ikey) == key {
                    return Ok(Some(Value::decode(val.clone())?));
                }
                break;
            }
        }
        Ok(None)
    }

    fn load_block(&self, block_idx: usize) -> Result<Vec<(Bytes, Bytes)>> {
        let entry = &self.index[block_idx];
        let abs_off = self.base + entry.offset;
        let len = entry.len as usize;
        let data = match &self.cache {
            Some(cache) => {
                cache.get_or_load(self.file.id(), abs_off, || self.file.read(abs_off, len))?
            }
            None => self.file.read(abs_off, len)?,
        };
        decode_block(&data)
    }

    pub fn iter(self: &Arc<Self>, reversed: bool) -> TableIter {
        TableIter {
            table: self.clone(),
            block_idx: if reversed {
                self.index.len() as isize - 1
            } else {
                0
            },
            entries: Vec::new(),
            pos: 0,
            reversed,
            errored: false,
        }
    }
}

fn decode_index(data: Bytes) -> Result<Vec<IndexEntry>> {
    let corrupt = || Error::CorruptFile("truncated index block".into());
    if data.len() < 4 {
        return Err(corrupt());
    }
    let count = BigEndian::read_u32(&data[..4]) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 4usize;
    for _ in 0..count {
        if pos + 2 > data.len() {
            return Err(corrupt());
        }
        let klen = BigEndian::read_u16(&data[pos..pos + 2]) as usize;
        pos += 2;
        if pos + klen + 12 > data.len() {
            return Err(corrupt());
        }
        let first_key = data.slice(pos..pos + klen);
        pos += klen;
        let offset = BigEndian::read_u64(&data[pos..pos + 8]);
        let len = BigEndian::read_u32(&data[pos + 8..pos + 12]);
        pos += 12;
        entries.push(IndexEntry {
            first_key,
            offset,
            len,
        });
    }
    Ok(entries)
}

fn decode_props(data: &Bytes) -> Result<(Bytes, Bytes)> {
    let corrupt = || Error::CorruptFile("truncated properties block".into());
    if data.len() < 2 {
        return Err(corrupt());
    }
    let slen = BigEndian::read_u16(&data[..2]) as usize;
    if data.len() < 2 + slen + 2 {
        return Err(corrupt());
    }
    let smallest = data.slice(2..2 + slen);
    let blen = BigEndian::read_u16(&data[2 + slen..4 + slen]) as usize;
    if data.len() < 4 + slen + blen {
        return Err(corrupt());
    }
    let biggest = data.slice(4 + slen..4 + slen + blen);
    Ok((smallest, biggest))
}

pub(crate) fn decode_block(data: &Bytes) -> Result<Vec<(Bytes, Bytes)>> {
    let corrupt = || Error::CorruptFile("truncated data block".into());
    if data.len() < 4 {
        return Err(corrupt());
    }
    let count = BigEndian::read_u32(&data[..4]) as usize;
    let mut entries = Vec::with_capacity(count);
    let mut pos = 4usize;
    for _ in 0..count {
        if pos + 2 > data.len() {
            return Err(corrupt());
        }
        let klen = BigEndian::read_u16(&data[pos..pos + 2]) as usize;
        pos += 2;
        if pos + klen + 4 > data.len() {
            return Err(corrupt());
        }
        let key = data.slice(pos..pos + klen);
        pos += klen;
        let vlen = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
        pos += 4;
        if pos + vlen > data.len() {
            return Err(corrupt());
        }
        let value = data.slice(pos..pos + vlen);
        pos += vlen;
        entries.push((key, value));
    }
    Ok(entries)
}

/// Block-at-a-time iterator over a table image, in internal-key order or
/// its reverse. Yields (internal key, encoded value record).
pub struct TableIter {
    table: Arc<SsTable>,
    block_idx: isize,
    entries: Vec<(Bytes, Bytes)>,
    pos: usize,
    reversed: bool,
    errored: bool,
}

impl Iterator for TableIter {
    type Item = Result<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.errored {
            return None;
        }
        loop {
            if self.pos < self.entries.len() {
                let idx = if self.reversed {
                    self.entries.len() - 1 - self.pos
                } else {
                    self.pos
                };
                self.pos += 1;
                let (k, v) = self.entries[idx].clone();
                return Some(Ok((k, v)));
            }
            if self.block_idx < 0 || self.block_idx as usize >= self.table.index.len() {
                return None;
            }
            match self.table.load_block(self.block_idx as usize) {
                Ok(entries) => {
                    self.entries = entries;
                    self.pos = 0;
                    self.block_idx += if self.reversed { -1 } else { 1 };
                }
                Err(e) => {
                    self.errored = true;
                    return Some(Err(e));
                }
            }
        }
    }
}
