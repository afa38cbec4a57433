//! Centralized configuration and builder for QuiverLevel.
//!
//! Goals:
//! - One typed structure with documented defaults, validated once when the
//!   database handle is constructed (not per call).
//! - `DbOptions::from_env()` applies `QL_*` overrides on top of defaults.
//! - `DbOptions::from_value()` accepts the camelCase JSON options object used by
//!   the admin CLI and config files. The removed positional/callback calling
//!   convention is rejected there with `Error::LegacyUsage`.
//!
//! Defaults:
//! - create_if_missing = true, error_if_exists = false
//! - parallelism = max(1, cpus / 2)
//! - wal_ttl_ms = 0, wal_size_limit = 0 (covered WAL segments are deleted at checkpoint)
//! - write_buffer_size = 64 MiB (WAL bytes between automatic checkpoints)
//! - wal_segment_bytes = 8 MiB
//! - info_log_level = None (engine log is silent)

use std::fmt;

use serde_json::Value;

use crate::cache::Cache;
use crate::db::ColumnHandle;
use crate::error::{Error, Result};

pub const DEFAULT_WRITE_BUFFER_SIZE: u64 = 64 * 1024 * 1024;
pub const DEFAULT_WAL_SEGMENT_BYTES: u64 = 8 * 1024 * 1024;

/// Engine log verbosity. Parsing is lenient: anything unknown maps to `Error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InfoLogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Header,
}

impl InfoLogLevel {
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => InfoLogLevel::Debug,
            "info" => InfoLogLevel::Info,
            "warn" => InfoLogLevel::Warn,
            "error" => InfoLogLevel::Error,
            "fatal" => InfoLogLevel::Fatal,
            "header" => InfoLogLevel::Header,
            _ => InfoLogLevel::Error,
        }
    }

    /// Mapping onto the `log` facade. fatal/header have no own level there.
    pub fn level_filter(self) -> log::LevelFilter {
        match self {
            InfoLogLevel::Debug => log::LevelFilter::Debug,
            InfoLogLevel::Info => log::LevelFilter::Info,
            InfoLogLevel::Warn => log::LevelFilter::Warn,
            InfoLogLevel::Error | InfoLogLevel::Fatal | InfoLogLevel::Header => {
                log::LevelFilter::Error
            }
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            InfoLogLevel::Debug => "debug",
            InfoLogLevel::Info => "info",
            InfoLogLevel::Warn => "warn",
            InfoLogLevel::Error => "error",
            InfoLogLevel::Fatal => "fatal",
            InfoLogLevel::Header => "header",
        }
    }
}

/// How a merge operand combines with the existing value of a key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MergeOperator {
    /// Append the operand to the existing value.
    #[default]
    Concat,
    /// Keep the lexicographically greater of existing value and operand.
    Max,
}

impl MergeOperator {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "concat" => Some(MergeOperator::Concat),
            "max" => Some(MergeOperator::Max),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MergeOperator::Concat => "concat",
            MergeOperator::Max => "max",
        }
    }

    pub fn apply(self, existing: Option<&[u8]>, operand: &[u8]) -> Vec<u8> {
        match (self, existing) {
            (_, None) => operand.to_vec(),
            (MergeOperator::Concat, Some(cur)) => {
                let mut out = Vec::with_capacity(cur.len() + operand.len());
                out.extend_from_slice(cur);
                out.extend_from_slice(operand);
                out
            }
            (MergeOperator::Max, Some(cur)) => {
                if operand > cur {
                    operand.to_vec()
                } else {
                    cur.to_vec()
                }
            }
        }
    }
}

/// Options of a column family.
#[derive(Clone, Copy, Debug, Default)]
pub struct ColumnOptions {
    /// None inherits the database-wide merge operator.
    pub merge_operator: Option<MergeOperator>,
}

impl ColumnOptions {
    pub fn with_merge_operator(mut self, op: MergeOperator) -> Self {
        self.merge_operator = Some(op);
        self
    }
}

/// Options of point reads and `getMany`.
#[derive(Clone, Debug, Default)]
pub struct ReadOptions {
    pub column: Option<ColumnHandle>,
    /// Accepted for compatibility; the bundled engine keeps its table in memory.
    pub fill_cache: bool,
}

impl ReadOptions {
    pub fn column(mut self, column: &ColumnHandle) -> Self {
        self.column = Some(column.clone());
        self
    }
}

/// Options of point writes, `batch` and chained batch commits.
#[derive(Clone, Debug, Default)]
pub struct WriteOptions {
    /// fsync the WAL segment before the commit resolves.
    pub sync: bool,
    /// Advisory hint; the bundled engine does not throttle.
    pub low_priority: bool,
    /// Column of point writes; for `batch` the default of operations without one.
    pub column: Option<ColumnHandle>,
}

impl WriteOptions {
    pub fn sync() -> Self {
        Self {
            sync: true,
            ..Self::default()
        }
    }

    pub fn column(mut self, column: &ColumnHandle) -> Self {
        self.column = Some(column.clone());
        self
    }
}

/// Top-level configuration of a database handle.
#[derive(Clone, Debug)]
pub struct DbOptions {
    /// Create the directory and engine files when missing.
    /// Env: QL_CREATE_IF_MISSING (default true)
    pub create_if_missing: bool,

    /// Fail the open when the database already exists.
    pub error_if_exists: bool,

    /// Concurrent engine calls per handle.
    /// Env: QL_PARALLELISM (default max(1, cpus/2))
    pub parallelism: usize,

    /// Keep covered WAL segments younger than this (ms). Env: QL_WAL_TTL_MS
    pub wal_ttl_ms: u64,

    /// Keep the newest WAL segments up to this many bytes. Env: QL_WAL_SIZE_LIMIT
    pub wal_size_limit: u64,

    /// zstd-compress WAL record payloads. Env: QL_WAL_COMPRESSION
    pub wal_compression: bool,

    /// Apply commits to the table after releasing the commit lock. Env: QL_UNORDERED_WRITE
    pub unordered_write: bool,

    /// Buffer WAL bytes until `flush_wal`. Env: QL_MANUAL_WAL_FLUSH
    pub manual_wal_flush: bool,

    /// Engine log verbosity (None = silent). Env: QL_INFO_LOG_LEVEL
    pub info_log_level: Option<InfoLogLevel>,

    /// Shared block cache.
    pub cache: Option<Cache>,

    /// Columns created/opened together with the database.
    pub columns: Vec<String>,

    /// Database-wide merge operator.
    pub merge_operator: MergeOperator,

    /// WAL bytes between automatic checkpoints. Env: QL_WRITE_BUFFER_SIZE
    pub write_buffer_size: u64,

    /// WAL segment rotation threshold. Env: QL_WAL_SEGMENT_BYTES
    pub wal_segment_bytes: u64,
}

pub fn default_parallelism() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (cpus / 2).max(1)
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            parallelism: default_parallelism(),
            wal_ttl_ms: 0,
            wal_size_limit: 0,
            wal_compression: false,
            unordered_write: false,
            manual_wal_flush: false,
            info_log_level: None,
            cache: None,
            columns: Vec::new(),
            merge_operator: MergeOperator::Concat,
            write_buffer_size: DEFAULT_WRITE_BUFFER_SIZE,
            wal_segment_bytes: DEFAULT_WAL_SEGMENT_BYTES,
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| {
        let s = v.trim().to_ascii_lowercase();
        s == "1" || s == "true" || s == "on" || s == "yes"
    })
}

fn env_num<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

impl DbOptions {
    /// Defaults with `QL_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Some(on) = env_flag("QL_CREATE_IF_MISSING") {
            cfg.create_if_missing = on;
        }
        if let Some(n) = env_num::<usize>("QL_PARALLELISM") {
            cfg.parallelism = n.max(1);
        }
        if let Some(n) = env_num::<u64>("QL_WAL_TTL_MS") {
            cfg.wal_ttl_ms = n;
        }
        if let Some(n) = env_num::<u64>("QL_WAL_SIZE_LIMIT") {
            cfg.wal_size_limit = n;
        }
        if let Some(on) = env_flag("QL_WAL_COMPRESSION") {
            cfg.wal_compression = on;
        }
        if let Some(on) = env_flag("QL_UNORDERED_WRITE") {
            cfg.unordered_write = on;
        }
        if let Some(on) = env_flag("QL_MANUAL_WAL_FLUSH") {
            cfg.manual_wal_flush = on;
        }
        if let Ok(v) = std::env::var("QL_INFO_LOG_LEVEL") {
            if !v.trim().is_empty() {
                cfg.info_log_level = Some(InfoLogLevel::parse(&v));
            }
        }
        if let Some(n) = env_num::<u64>("QL_WRITE_BUFFER_SIZE") {
            cfg.write_buffer_size = n;
        }
        if let Some(n) = env_num::<u64>("QL_WAL_SEGMENT_BYTES") {
            cfg.wal_segment_bytes = n;
        }

        cfg
    }

    /// Parse a camelCase JSON options object on top of defaults.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value.as_object().ok_or_else(|| {
            Error::LegacyUsage(
                "options must be an object; positional and callback arguments were removed".into(),
            )
        })?;
        if obj.contains_key("callback") {
            return Err(Error::LegacyUsage(
                "the callback option was removed; await the returned future instead".into(),
            ));
        }

        let mut cfg = Self::default();
        let flag = |key: &str| obj.get(key).and_then(Value::as_bool);
        let num = |key: &str| obj.get(key).and_then(Value::as_u64);

        if let Some(on) = flag("createIfMissing") {
            cfg.create_if_missing = on;
        }
        if let Some(on) = flag("errorIfExists") {
            cfg.error_if_exists = on;
        }
        if let Some(n) = num("parallelism") {
            cfg.parallelism = (n as usize).max(1);
        }
        if let Some(n) = num("walTTL") {
            cfg.wal_ttl_ms = n;
        }
        if let Some(n) = num("walSizeLimit") {
            cfg.wal_size_limit = n;
        }
        if let Some(on) = flag("walCompression") {
            cfg.wal_compression = on;
        }
        if let Some(on) = flag("unorderedWrite") {
            cfg.unordered_write = on;
        }
        if let Some(on) = flag("manualWalFlush") {
            cfg.manual_wal_flush = on;
        }
        if let Some(s) = obj.get("infoLogLevel").and_then(Value::as_str) {
            cfg.info_log_level = Some(InfoLogLevel::parse(s));
        }
        if let Some(token) = num("cache") {
            cfg.cache = Some(Cache::from_token(token)?);
        }
        if let Some(cols) = obj.get("columns").and_then(Value::as_array) {
            cfg.columns = cols
                .iter()
                .filter_map(|c| c.as_str().map(str::to_string))
                .collect();
        }
        if let Some(s) = obj.get("mergeOperator").and_then(Value::as_str) {
            cfg.merge_operator = MergeOperator::parse(s).ok_or_else(|| {
                Error::Engine(anyhow::anyhow!("unknown merge operator {:?}", s))
            })?;
        }
        if let Some(n) = num("writeBufferSize") {
            cfg.write_buffer_size = n;
        }
        if let Some(n) = num("walSegmentBytes") {
            cfg.wal_segment_bytes = n;
        }

        Ok(cfg)
    }

    pub fn builder() -> DbBuilder {
        DbBuilder::new()
    }

    // Fluent setters (builder-style) to override specific fields.

    pub fn with_create_if_missing(mut self, on: bool) -> Self {
        self.create_if_missing = on;
        self
    }

    pub fn with_error_if_exists(mut self, on: bool) -> Self {
        self.error_if_exists = on;
        self
    }

    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n.max(1);
        self
    }

    pub fn with_wal_ttl_ms(mut self, ms: u64) -> Self {
        self.wal_ttl_ms = ms;
        self
    }

    pub fn with_wal_size_limit(mut self, bytes: u64) -> Self {
        self.wal_size_limit = bytes;
        self
    }

    pub fn with_wal_compression(mut self, on: bool) -> Self {
        self.wal_compression = on;
        self
    }

    pub fn with_unordered_write(mut self, on: bool) -> Self {
        self.unordered_write = on;
        self
    }

    pub fn with_manual_wal_flush(mut self, on: bool) -> Self {
        self.manual_wal_flush = on;
        self
    }

    pub fn with_info_log_level(mut self, level: Option<InfoLogLevel>) -> Self {
        self.info_log_level = level;
        self
    }

    pub fn with_cache(mut self, cache: Option<Cache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_columns<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.columns = columns.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_merge_operator(mut self, op: MergeOperator) -> Self {
        self.merge_operator = op;
        self
    }

    pub fn with_write_buffer_size(mut self, bytes: u64) -> Self {
        self.write_buffer_size = bytes;
        self
    }

    pub fn with_wal_segment_bytes(mut self, bytes: u64) -> Self {
        self.wal_segment_bytes = bytes;
        self
    }
}

impl fmt::Display for DbOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DbOptions {{ \
             create_if_missing: {}, \
             error_if_exists: {}, \
             parallelism: {}, \
             wal_ttl_ms: {}, \
             wal_size_limit: {}, \
             wal_compression: {}, \
             unordered_write: {}, \
             manual_wal_flush: {}, \
             info_log_level: {}, \
             cache: {}, \
             columns: [{}], \
             merge_operator: {:?}, \
             write_buffer_size: {}, \
             wal_segment_bytes: {} \
             }}",
            self.create_if_missing,
            self.error_if_exists,
            self.parallelism,
            self.wal_ttl_ms,
            self.wal_size_limit,
            self.wal_compression,
            self.unordered_write,
            self.manual_wal_flush,
            self.info_log_level.map(InfoLogLevel::as_str).unwrap_or("off"),
            self.cache
                .as_ref()
                .map(|c| format!("#{}", c.token()))
                .unwrap_or_else(|| "none".to_string()),
            self.columns.join(", "),
            self.merge_operator,
            self.write_buffer_size,
            self.wal_segment_bytes,
        )
    }
}

/// Lightweight builder that produces `DbOptions`.
#[derive(Clone, Debug)]
pub struct DbBuilder {
    cfg: DbOptions,
}

impl Default for DbBuilder {
    fn default() -> Self {
        // Start from env, then allow overrides.
        Self {
            cfg: DbOptions::from_env(),
        }
    }
}

impl DbBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a clean default (without reading env).
    pub fn from_default() -> Self {
        Self {
            cfg: DbOptions::default(),
        }
    }

    pub fn create_if_missing(mut self, on: bool) -> Self {
        self.cfg.create_if_missing = on;
        self
    }

    pub fn error_if_exists(mut self, on: bool) -> Self {
        self.cfg.error_if_exists = on;
        self
    }

    pub fn parallelism(mut self, n: usize) -> Self {
        self.cfg.parallelism = n.max(1);
        self
    }

    pub fn wal_ttl_ms(mut self, ms: u64) -> Self {
        self.cfg.wal_ttl_ms = ms;
        self
    }

    pub fn wal_size_limit(mut self, bytes: u64) -> Self {
        self.cfg.wal_size_limit = bytes;
        self
    }

    pub fn wal_compression(mut self, on: bool) -> Self {
        self.cfg.wal_compression = on;
        self
    }

    pub fn unordered_write(mut self, on: bool) -> Self {
        self.cfg.unordered_write = on;
        self
    }

    pub fn manual_wal_flush(mut self, on: bool) -> Self {
        self.cfg.manual_wal_flush = on;
        self
    }

    pub fn info_log_level(mut self, level: InfoLogLevel) -> Self {
        self.cfg.info_log_level = Some(level);
        self
    }

    pub fn cache(mut self, cache: &Cache) -> Self {
        self.cfg.cache = Some(cache.clone());
        self
    }

    pub fn column<S: Into<String>>(mut self, name: S) -> Self {
        self.cfg.columns.push(name.into());
        self
    }

    pub fn merge_operator(mut self, op: MergeOperator) -> Self {
        self.cfg.merge_operator = op;
        self
    }

    pub fn write_buffer_size(mut self, bytes: u64) -> Self {
        self.cfg.write_buffer_size = bytes;
        self
    }

    pub fn wal_segment_bytes(mut self, bytes: u64) -> Self {
        self.cfg.wal_segment_bytes = bytes;
        self
    }

    /// Finish the builder and obtain the configuration.
    pub fn build(self) -> DbOptions {
        self.cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_options_map_onto_typed_fields() {
        let cfg = DbOptions::from_value(&json!({
            "createIfMissing": false,
            "parallelism": 3,
            "walTTL": 60000,
            "walSizeLimit": 1048576,
            "walCompression": true,
            "manualWalFlush": true,
            "infoLogLevel": "bogus",
            "columns": ["meta", "blobs"],
            "mergeOperator": "max"
        }))
        .unwrap();
        assert!(!cfg.create_if_missing);
        assert_eq!(cfg.parallelism, 3);
        assert_eq!(cfg.wal_ttl_ms, 60_000);
        assert_eq!(cfg.wal_size_limit, 1 << 20);
        assert!(cfg.wal_compression && cfg.manual_wal_flush);
        assert_eq!(cfg.info_log_level, Some(InfoLogLevel::Error));
        assert_eq!(cfg.columns, vec!["meta".to_string(), "blobs".to_string()]);
        assert_eq!(cfg.merge_operator, MergeOperator::Max);
    }

    #[test]
    fn callback_convention_is_legacy() {
        let e = DbOptions::from_value(&json!("location-as-options")).unwrap_err();
        assert_eq!(e.code(), "LEVEL_LEGACY");
        let e = DbOptions::from_value(&json!({ "callback": true })).unwrap_err();
        assert_eq!(e.code(), "LEVEL_LEGACY");
    }

    #[test]
    fn merge_operators() {
        assert_eq!(MergeOperator::Concat.apply(Some(&b"ab"[..]), b"cd"), b"abcd".to_vec());
        assert_eq!(MergeOperator::Concat.apply(None, b"cd"), b"cd".to_vec());
        assert_eq!(MergeOperator::Max.apply(Some(&b"b"[..]), b"a"), b"b".to_vec());
        assert_eq!(MergeOperator::Max.apply(Some(&b"b"[..]), b"c"), b"c".to_vec());
    }
}
