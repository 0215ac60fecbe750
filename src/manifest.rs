//! Manifest: the ordered change-set log that makes shard metadata durable.
//!
//! Records are bincode-encoded and framed as `len u32 | crc32 u32 | payload`.
//! Replaying the file rebuilds every shard's file set, split state and the
//! file-id watermark. Once the log accumulates enough records it is
//! rewritten as a single snapshot followed by fresh deltas.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::sstable::CASTAGNOLI;

pub const MANIFEST_FILENAME: &str = "MANIFEST";
const REWRITE_THRESHOLD: usize = 4096;

/// Column family value marking an L0 file in a [`FileMeta`].
pub const CF_L0: i32 = -1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileMeta {
    pub id: u64,
    /// `CF_L0` for L0 files, the owning column family otherwise.
    pub cf: i32,
    /// 0 for L0 files.
    pub level: u32,
    pub smallest: Bytes,
    pub biggest: Bytes,
    pub commit_version: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShardMeta {
    pub id: u64,
    pub ver: u64,
    pub start: Bytes,
    /// Empty means unbounded.
    pub end: Bytes,
    pub base_version: u64,
    /// Highest commit version made durable so far.
    pub data_version: u64,
    pub split_stage: u8,
    pub split_keys: Vec<Bytes>,
    pub initial_flushed: bool,
    pub files: Vec<FileMeta>,
    pub properties: HashMap<String, Vec<u8>>,
}

impl ShardMeta {
    pub fn new(id: u64, ver: u64, start: Bytes, end: Bytes, base_version: u64) -> Self {
        Self {
            id,
            ver,
            start,
            end,
            base_version,
            data_version: 0,
            split_stage: 0,
            split_keys: Vec::new(),
            initial_flushed: false,
            files: Vec::new(),
            properties: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Change {
    ShardCreate(ShardMeta),
    /// A flush of an empty memtable; makes the shard's recovery state
    /// durable without producing a file.
    InitialFlush { commit_version: u64 },
    Flush {
        l0: FileMeta,
        mem_table_version: u64,
    },
    Compaction {
        cf: i32,
        level: u32,
        deleted: Vec<u64>,
        added: Vec<FileMeta>,
    },
    PreSplit { keys: Vec<Bytes> },
    SplitFiles {
        deleted: Vec<u64>,
        added: Vec<FileMeta>,
    },
    FinishSplit { children: Vec<ShardMeta> },
    ShardRemove,
    /// Full-state record written by a manifest rewrite.
    Snapshot {
        shards: Vec<ShardMeta>,
        max_file_id: u64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeSet {
    pub shard_id: u64,
    pub shard_ver: u64,
    pub seq: u64,
    pub change: Change,
}

/// Replayed manifest state.
#[derive(Default)]
pub struct ManifestState {
    pub shards: HashMap<u64, ShardMeta>,
    pub max_file_id: u64,
    pub seq: u64,
}

impl ManifestState {
    fn apply(&mut self, cs: &ChangeSet) -> Result<()> {
        self.seq = self.seq.max(cs.seq);
        match &cs.change {
            Change::Snapshot {
                shards,
                max_file_id,
            } => {
                self.shards = shards.iter().map(|m| (m.id, m.clone())).collect();
                self.max_file_id = self.max_file_id.max(*max_file_id);
            }
            Change::ShardCreate(meta) => {
                for f in &meta.files {
                    self.max_file_id = self.max_file_id.max(f.id);
                }
                self.shards.insert(meta.id, meta.clone());
            }
            Change::InitialFlush { commit_version } => {
                let Some(meta) = self.shards.get_mut(&cs.shard_id) else {
                    return Ok(());
                };
                meta.initial_flushed = true;
                meta.data_version = meta.data_version.max(*commit_version);
            }
            Change::Flush {
                l0,
                mem_table_version,
            } => {
                self.max_file_id = self.max_file_id.max(l0.id);
                let Some(meta) = self.shards.get_mut(&cs.shard_id) else {
                    return Ok(());
                };
                meta.initial_flushed = true;
                meta.data_version = meta.data_version.max(*mem_table_version);
                meta.files.push(l0.clone());
            }
            Change::Compaction { deleted, added, .. } => {
                for f in added {
                    self.max_file_id = self.max_file_id.max(f.id);
                }
                let Some(meta) = self.shards.get_mut(&cs.shard_id) else {
                    return Ok(());
                };
                meta.files.retain(|f| !deleted.contains(&f.id));
                meta.files.extend(added.iter().cloned());
            }
            Change::PreSplit { keys } => {
                let Some(meta) = self.shards.get_mut(&cs.shard_id) else {
                    return Ok(());
                };
                meta.split_stage = 1;
                meta.split_keys = keys.clone();
            }
            Change::SplitFiles { deleted, added } => {
                for f in added {
                    self.max_file_id = self.max_file_id.max(f.id);
                }
                let Some(meta) = self.shards.get_mut(&cs.shard_id) else {
                    return Ok(());
                };
                meta.files.retain(|f| !deleted.contains(&f.id));
                meta.files.extend(added.iter().cloned());
                meta.split_stage = 2;
            }
            Change::FinishSplit { children } => {
                self.shards.remove(&cs.shard_id);
                for child in children {
                    for f in &child.files {
                        self.max_file_id = self.max_file_id.max(f.id);
                    }
                    self.shards.insert(child.id, child.clone());
                }
            }
            Change::ShardRemove => {
                self.shards.remove(&cs.shard_id);
            }
        }
        Ok(())
    }
}

pub struct Manifest {
    file: File,
    path: PathBuf,
    dir: PathBuf,
    seq: u64,
    records_since_rewrite: usize,
}

impl Manifest {
    /// Open (or create) the manifest under `dir` and replay its state.
    pub fn open(dir: &Path) -> Result<(Manifest, ManifestState)> {
        let path = dir.join(MANIFEST_FILENAME);
        let mut state = ManifestState::default();
        let mut records = 0usize;
        if path.exists() {
            let mut data = Vec::new();
            File::open(&path)?.read_to_end(&mut data)?;
            for cs in decode_records(&data)? {
                state.apply(&cs)?;
                records += 1;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut manifest = Manifest {
            file,
            path,
            dir: dir.to_path_buf(),
            seq: state.seq,
            records_since_rewrite: records,
        };
        if records >= REWRITE_THRESHOLD {
            manifest.rewrite(&state)?;
        }
        Ok((manifest, state))
    }

    pub fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Append a change-set and fsync.
    pub fn append(&mut self, cs: &ChangeSet) -> Result<()> {
        let payload = bincode::serialize(cs)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.write_u32::<BigEndian>(payload.len() as u32).unwrap();
        frame
            .write_u32::<BigEndian>(CASTAGNOLI.checksum(&payload))
            .unwrap();
        frame.extend_from_slice(&payload);
        self.file.write_all(&frame)?;
        self.file.sync_data()?;
        self.records_since_rewrite += 1;
        Ok(())
    }

    /// Compact the log into a single snapshot record.
    pub fn rewrite(&mut self, state: &ManifestState) -> Result<()> {
        let tmp_path = self.dir.join("MANIFEST.rewrite");
        let mut tmp = File::create(&tmp_path)?;
        let snapshot = ChangeSet {
            shard_id: 0,
            shard_ver: 0,
            seq: self.next_seq(),
            change: Change::Snapshot {
                shards: state.shards.values().cloned().collect(),
                max_file_id: state.max_file_id,
            },
        };
        let payload = bincode::serialize(&snapshot)?;
        let mut frame = Vec::with_capacity(payload.len() + 8);
        frame.write_u32::<BigEndian>(payload.len() as u32).unwrap();
        frame
            .write_u32::<BigEndian>(CASTAGNOLI.checksum(&payload))
            .unwrap();
        frame.extend_from_slice(&payload);
        tmp.write_all(&frame)?;
        tmp.sync_data()?;
        std::fs::rename(&tmp_path, &self.path)?;
        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.records_since_rewrite = 0;
        tracing::info!(shards = state.shards.len(), "rewrote manifest");
        Ok(())
    }

    pub fn should_rewrite(&self) -> bool {
        self.records_since_rewrite >= REWRITE_THRESHOLD
    }
}

fn decode_records(data: &[u8]) -> Result<Vec<ChangeSet>> {
    let mut records = Vec::new();
    let mut pos = 0usize;
    while pos + 8 <= data.len() {
        let len = BigEndian::read_u32(&data[pos..pos + 4]) as usize;
        let crc = BigEndian::read_u32(&data[pos + 4..pos + 8]);
        if pos + 8 + len > data.len() {
            // Torn tail write; everything before it is intact.
            tracing::warn!("truncated manifest tail record, dropping");
            break;
        }
        let payload = &data[pos + 8..pos + 8 + len];
        if CASTAGNOLI.checksum(payload) != crc {
            return Err(Error::CorruptFile("manifest record checksum".into()));
        }
        records.push(bincode::deserialize(payload)?);
        pos += 8 + len;
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn file_meta(id: u64, commit_version: u64) -> FileMeta {
        FileMeta {
            id,
            cf: CF_L0,
            level: 0,
            smallest: Bytes::from_static(b"a"),
            biggest: Bytes::from_static(b"z"),
            commit_version,
            size: 128,
        }
    }

    #[test]
    fn test_replay_restores_shards() {
        let dir = TempDir::new().unwrap();
        {
            let (mut manifest, _) = Manifest::open(dir.path()).unwrap();
            let meta = ShardMeta::new(1, 1, Bytes::new(), Bytes::new(), 10);
            let seq = manifest.next_seq();
            manifest
                .append(&ChangeSet {
                    shard_id: 1,
                    shard_ver: 1,
                    seq,
                    change: Change::ShardCreate(meta),
                })
                .unwrap();
            let seq = manifest.next_seq();
            manifest
                .append(&ChangeSet {
                    shard_id: 1,
                    shard_ver: 1,
                    seq,
                    change: Change::Flush {
                        l0: file_meta(7, 12),
                        mem_table_version: 12,
                    },
                })
                .unwrap();
        }
        let (_, state) = Manifest::open(dir.path()).unwrap();
        let meta = &state.shards[&1];
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].id, 7);
        assert!(meta.initial_flushed);
        assert_eq!(meta.data_version, 12);
        assert_eq!(state.max_file_id, 7);
        assert_eq!(state.seq, 2);
    }

    #[test]
    fn test_compaction_swaps_files() {
        let dir = TempDir::new().unwrap();
        let (mut manifest, _) = Manifest::open(dir.path()).unwrap();
        let meta = ShardMeta::new(1, 1, Bytes::new(), Bytes::new(), 0);
        let seq = manifest.next_seq();
        manifest
            .append(&ChangeSet {
                shard_id: 1,
                shard_ver: 1,
                seq,
                change: Change::ShardCreate(meta),
            })
            .unwrap();
        for id in [2, 3] {
            let seq = manifest.next_seq();
            manifest
                .append(&ChangeSet {
                    shard_id: 1,
                    shard_ver: 1,
                    seq,
                    change: Change::Flush {
                        l0: file_meta(id, id),
                        mem_table_version: id,
                    },
                })
                .unwrap();
        }
        let seq = manifest.next_seq();
        let mut added = file_meta(9, 3);
        added.cf = 0;
        added.level = 1;
        manifest
            .append(&ChangeSet {
                shard_id: 1,
                shard_ver: 1,
                seq,
                change: Change::Compaction {
                    cf: 0,
                    level: 1,
                    deleted: vec![2, 3],
                    added: vec![added],
                },
            })
            .unwrap();
        drop(manifest);

        let (_, state) = Manifest::open(dir.path()).unwrap();
        let meta = &state.shards[&1];
        assert_eq!(meta.files.len(), 1);
        assert_eq!(meta.files[0].id, 9);
        assert_eq!(state.max_file_id, 9);
    }

    #[test]
    fn test_truncated_tail_tolerated() {
        let dir = TempDir::new().unwrap();
        {
            let (mut manifest, _) = Manifest::open(dir.path()).unwrap();
            let seq = manifest.next_seq();
            manifest
                .append(&ChangeSet {
                    shard_id: 1,
                    shard_ver: 1,
                    seq,
                    change: Change::ShardCreate(ShardMeta::new(
                        1,
                        1,
                        Bytes::new(),
                        Bytes::new(),
                        0,
                    )),
                })
                .unwrap();
        }
        // Simulate a torn write.
        let path = dir.path().join(MANIFEST_FILENAME);
        let mut data = std::fs::read(&path).unwrap();
        data.extend_from_slice(&[0, 0, 0, 99, 1, 2, 3]);
        std::fs::write(&path, &data).unwrap();

        let (_, state) = Manifest::open(dir.path()).unwrap();
        assert!(state.shards.contains_key(&1));
    }

    #[test]
    fn test_corrupt_record_rejected() {
        let dir = TempDir::new().unwrap();
        {
            let (mut manifest, _) = Manifest::open(dir.path()).unwrap();
            let seq = manifest.next_seq();
            manifest
                .append(&ChangeSet {
                    shard_id: 1,
                    shard_ver: 1,
                    seq,
                    change: Change::ShardRemove,
                })
                .unwrap();
        }
        let path = dir.path().join(MANIFEST_FILENAME);
        let mut data = std::fs::read(&path).unwrap();
        let n = data.len();
        data[n - 1] ^= 0xff;
        std::fs::write(&path, &data).unwrap();
        assert!(matches!(
            Manifest::open(dir.path()),
            Err(Error::CorruptFile(_))
        ));
    }

    #[test]
    fn test_rewrite_compacts_log() {
        let dir = TempDir::new().unwrap();
        let (mut manifest, mut state) = Manifest::open(dir.path()).unwrap();
        let meta = ShardMeta::new(5, 2, Bytes::new(), Bytes::new(), 0);
        let cs = ChangeSet {
            shard_id: 5,
            shard_ver: 2,
            seq: manifest.next_seq(),
            change: Change::ShardCreate(meta),
        };
        manifest.append(&cs).unwrap();
        state.apply(&cs).unwrap();
        manifest.rewrite(&state).unwrap();
        drop(manifest);

        let (_, replayed) = Manifest::open(dir.path()).unwrap();
        assert!(replayed.shards.contains_key(&5));
        assert_eq!(replayed.shards[&5].ver, 2);
    }
}
