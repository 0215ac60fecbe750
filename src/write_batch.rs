//! Write batches: the admission interface between the ordering layer above
//! the engine and a shard's memtables.

use std::collections::HashMap;

use bytes::Bytes;

use crate::config::CfConfig;
use crate::error::{Error, Result};
use crate::format::{Value, BIT_VALUE_POINTER};
use crate::memtable::Entry;

/// A batch of versioned writes against one shard, owned by a single writer.
/// Entry vectors are retained across [`WriteBatch::reset`], so a reused
/// batch stops allocating once it has seen its peak size.
pub struct WriteBatch {
    shard_id: u64,
    shard_ver: u64,
    cf_configs: Vec<CfConfig>,
    entries: Vec<Vec<Entry>>,
    estimated_size: usize,
    properties: HashMap<String, Bytes>,
    value_threshold: usize,
}

impl WriteBatch {
    pub fn new(shard_id: u64, shard_ver: u64, cf_configs: Vec<CfConfig>) -> Self {
        let entries = (0..cf_configs.len()).map(|_| Vec::new()).collect();
        Self {
            shard_id,
            shard_ver,
            cf_configs,
            entries,
            estimated_size: 0,
            properties: HashMap::new(),
            value_threshold: 0,
        }
    }

    /// Values at or above the threshold are tagged for the external value
    /// log. Zero disables tagging.
    pub fn with_value_threshold(mut self, threshold: usize) -> Self {
        self.value_threshold = threshold;
        self
    }

    pub fn shard_id(&self) -> u64 {
        self.shard_id
    }

    pub fn shard_ver(&self) -> u64 {
        self.shard_ver
    }

    fn check_version(&self, cf: usize, version: u64) -> Result<()> {
        let conf = &self.cf_configs[cf];
        if conf.managed && version == 0 {
            return Err(Error::InvalidBatch(format!(
                "version is zero for managed CF {cf}"
            )));
        }
        if !conf.managed && version != 0 {
            return Err(Error::InvalidBatch(format!(
                "version is not zero for unmanaged CF {cf}"
            )));
        }
        Ok(())
    }

    pub fn put(&mut self, cf: usize, key: impl Into<Bytes>, value: Value) -> Result<()> {
        self.check_version(cf, value.version)?;
        let mut value = value;
        if self.value_threshold > 0 && value.value.len() >= self.value_threshold {
            value.meta |= BIT_VALUE_POINTER;
        }
        let entry = Entry::new(key.into(), value);
        self.estimated_size += entry.estimated_size();
        self.entries[cf].push(entry);
        Ok(())
    }

    /// Record a tombstone for `key` at `version`.
    pub fn delete(&mut self, cf: usize, key: impl Into<Bytes>, version: u64) -> Result<()> {
        self.check_version(cf, version)?;
        let entry = Entry::new(key.into(), Value::tombstone(version));
        self.estimated_size += entry.estimated_size();
        self.entries[cf].push(entry);
        Ok(())
    }

    /// Attach a named property consumed by the engine and its listeners,
    /// e.g. split checkpoints.
    pub fn set_property(&mut self, name: impl Into<String>, value: impl Into<Bytes>) {
        self.properties.insert(name.into(), value.into());
    }

    pub fn properties(&self) -> &HashMap<String, Bytes> {
        &self.properties
    }

    pub fn estimated_size(&self) -> usize {
        self.estimated_size
    }

    pub fn num_entries(&self) -> usize {
        self.entries.iter().map(|e| e.len()).sum()
    }

    pub fn num_cfs(&self) -> usize {
        self.entries.len()
    }

    pub fn entries(&self, cf: usize) -> &[Entry] {
        &self.entries[cf]
    }

    /// Visit entries of one column family in insertion order; the visitor
    /// returns false to stop early.
    pub fn iterate(&self, cf: usize, mut visitor: impl FnMut(&Entry) -> bool) {
        for entry in &self.entries[cf] {
            if !visitor(entry) {
                break;
            }
        }
    }

    /// Clear the batch for reuse, keeping allocated capacity.
    pub fn reset(&mut self) {
        for entries in &mut self.entries {
            entries.clear();
        }
        self.estimated_size = 0;
        self.properties.clear();
    }
}
