use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};

pub const MB: usize = 1024 * 1024;

/// Per-column-family configuration. A shard holds a fixed ordered list of
/// column families declared at open time.
#[derive(Debug, Clone, Copy)]
pub struct CfConfig {
    /// Managed CFs carry caller-supplied commit versions; unmanaged CFs
    /// always store logical version 0.
    pub managed: bool,
    /// Number of on-disk levels below L0.
    pub max_levels: usize,
}

impl CfConfig {
    pub fn new(managed: bool, max_levels: usize) -> Self {
        Self {
            managed,
            max_levels,
        }
    }
}

/// Object storage options. An empty `key_id` disables mirroring.
#[derive(Debug, Clone, Default)]
pub struct S3Options {
    pub endpoint: String,
    pub key_id: String,
    pub secret_key: String,
    pub bucket: String,
    pub region: String,
}

impl S3Options {
    pub fn enabled(&self) -> bool {
        !self.key_id.is_empty()
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Data directory. Created if missing.
    pub dir: PathBuf,

    /// Values at or above this size carry the value-pointer tag. The
    /// large-value store itself is external to the engine.
    pub value_threshold: usize,

    /// Active memtable size that triggers rotation.
    pub max_mem_table_size: usize,

    /// Flush queue depth. Writers block once this many memtables await flush.
    pub num_mem_tables: usize,

    /// L0 table count that makes a shard a compaction candidate.
    pub num_l0_tables: usize,

    /// L0 table count that stalls writers until compaction catches up.
    pub num_l0_tables_stall: usize,

    /// Compaction target file size.
    pub max_table_size: usize,

    /// Target total size of L1; each deeper level is ten times larger.
    pub l1_size: u64,

    /// Number of parallel compaction runners.
    pub num_compactors: usize,

    /// Level from which table filters are no longer built.
    pub surf_start_level: usize,

    /// Value log rotation threshold, forwarded to the external value store.
    pub vlog_file_size: usize,

    /// Fsync table files on flush.
    pub sync_write: bool,

    /// Block cache budget in bytes. Zero disables the cache and switches
    /// table reads to memory mapping.
    pub block_cache_size: usize,

    /// Run a final L0 compaction pass during close.
    pub compact_l0_when_close: bool,

    /// Disable the background compaction runners. Only used in tests.
    pub do_not_compact: bool,

    /// Interval between epoch advances of the resource reclaimer.
    pub reclaim_interval: Duration,

    /// Interval between compaction candidate scans.
    pub compaction_interval: Duration,

    /// Column families, in CF-id order.
    pub cfs: Vec<CfConfig>,

    /// Identifies this store instance inside the object storage bucket.
    pub instance_id: u32,

    pub s3: S3Options,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./emberdb"),
            value_threshold: 256,
            max_mem_table_size: 64 * MB,
            num_mem_tables: 3,
            num_l0_tables: 4,
            num_l0_tables_stall: 8,
            max_table_size: 8 * MB,
            l1_size: 512 * MB as u64,
            num_compactors: 3,
            surf_start_level: 8,
            vlog_file_size: 256 * MB,
            sync_write: false,
            block_cache_size: 0,
            compact_l0_when_close: false,
            do_not_compact: false,
            reclaim_interval: Duration::from_millis(100),
            compaction_interval: Duration::from_millis(100),
            cfs: vec![CfConfig::new(true, 3)],
            instance_id: 0,
            s3: S3Options::default(),
        }
    }
}

impl Options {
    /// Create options with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    pub fn cfs(mut self, cfs: Vec<CfConfig>) -> Self {
        self.cfs = cfs;
        self
    }

    pub fn max_mem_table_size(mut self, size: usize) -> Self {
        self.max_mem_table_size = size;
        self
    }

    pub fn num_mem_tables(mut self, n: usize) -> Self {
        self.num_mem_tables = n;
        self
    }

    pub fn num_l0_tables(mut self, soft: usize, stall: usize) -> Self {
        self.num_l0_tables = soft;
        self.num_l0_tables_stall = stall;
        self
    }

    pub fn max_table_size(mut self, size: usize) -> Self {
        self.max_table_size = size;
        self
    }

    pub fn block_cache_size(mut self, size: usize) -> Self {
        self.block_cache_size = size;
        self
    }

    pub fn num_compactors(mut self, n: usize) -> Self {
        self.num_compactors = n;
        self
    }

    pub fn do_not_compact(mut self, v: bool) -> Self {
        self.do_not_compact = v;
        self
    }

    pub fn compact_l0_when_close(mut self, v: bool) -> Self {
        self.compact_l0_when_close = v;
        self
    }

    pub fn sync_write(mut self, v: bool) -> Self {
        self.sync_write = v;
        self
    }

    pub fn s3(mut self, s3: S3Options) -> Self {
        self.s3 = s3;
        self
    }

    /// Validate option consistency. Fatal at open time.
    pub fn check(&self) -> Result<()> {
        if self.cfs.is_empty() {
            return Err(Error::Config("at least one column family".into()));
        }
        if self.max_mem_table_size == 0 {
            return Err(Error::Config("max_mem_table_size must be non-zero".into()));
        }
        if self.num_mem_tables == 0 {
            return Err(Error::Config("num_mem_tables must be non-zero".into()));
        }
        if self.num_l0_tables_stall < self.num_l0_tables {
            return Err(Error::Config(
                "num_l0_tables_stall below num_l0_tables".into(),
            ));
        }
        if self.max_table_size == 0 {
            return Err(Error::Config("max_table_size must be non-zero".into()));
        }
        Ok(())
    }
}

/// Parse a duration string. A unitless number means seconds; `ms`, `s`, `m`
/// and `h` suffixes are accepted. Anything else is a fatal config error.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let (num, unit) = match s.find(|c: char| !c.is_ascii_digit() && c != '.') {
        Some(idx) => s.split_at(idx),
        None => (s, ""),
    };
    let value: f64 = num
        .parse()
        .map_err(|_| Error::Config(format!("bad duration {s:?}")))?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(Error::Config(format!("bad duration unit {s:?}"))),
    };
    Ok(Duration::from_secs_f64(secs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let opts = Options::default();
        assert_eq!(opts.max_mem_table_size, 64 * MB);
        assert_eq!(opts.num_mem_tables, 3);
        assert_eq!(opts.num_l0_tables, 4);
        assert_eq!(opts.num_l0_tables_stall, 8);
        assert!(opts.check().is_ok());
    }

    #[test]
    fn test_builder() {
        let opts = Options::new("/tmp/ember")
            .max_mem_table_size(MB)
            .num_l0_tables(2, 4)
            .do_not_compact(true);
        assert_eq!(opts.dir, PathBuf::from("/tmp/ember"));
        assert_eq!(opts.max_mem_table_size, MB);
        assert_eq!(opts.num_l0_tables_stall, 4);
        assert!(opts.do_not_compact);
    }

    #[test]
    fn test_check_rejects_inverted_stall() {
        let opts = Options::default().num_l0_tables(8, 4);
        assert!(matches!(opts.check(), Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15").unwrap(), Duration::from_secs(15));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("fast").is_err());
    }
}
