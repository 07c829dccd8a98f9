//! Endpoint configuration.
//!
//! The host hands the endpoint a flat string key-value map ([`Props`]); this
//! module turns it into the immutable, validated [`EndpointConfig`] used
//! everywhere else.  An explicit [`EndpointConfigBuilder`] exists for
//! programmatic construction; `build()` is the single validation point.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;
use uuid::Uuid;

use crate::error::ConfigError;
use crate::wal::TableName;

// Configuration keys.
const K_BOOTSTRAP: &str = "broker.bootstrap";
const K_TOPIC_PATTERN: &str = "topic.pattern";
const K_TOPIC_MAX_LENGTH: &str = "topic.max-length";
const K_FAMILY_NAME: &str = "family.name";
const K_INCLUDE_ROWKEY: &str = "payload.include-rowkey";
const K_ROWKEY_ENCODING: &str = "rowkey.encoding";
const K_INCLUDE_META: &str = "payload.include-meta";
const K_INCLUDE_META_WAL: &str = "payload.include-meta-wal";
const K_SERIALIZE_NULLS: &str = "json.serialize-nulls";
const K_FILTER_WAL_MIN_TS: &str = "filter.wal.min-ts";
const K_TOPIC_ENSURE: &str = "topic.ensure";
const K_TOPIC_PARTITIONS: &str = "topic.partitions";
const K_TOPIC_REPLICATION: &str = "topic.replication";
const K_ADMIN_TIMEOUT_MS: &str = "admin.timeout-ms";
const K_ADMIN_CLIENT_ID: &str = "admin.client-id";
const K_UNKNOWN_BACKOFF_MS: &str = "topic.unknown-backoff-ms";
const K_AWAIT_EVERY: &str = "producer.await.every";
const K_AWAIT_TIMEOUT_MS: &str = "producer.await.timeout-ms";
const K_BATCH_COUNTERS: &str = "producer.batch.counters-enabled";
const K_BATCH_DEBUG: &str = "producer.batch.debug-on-failure";
const K_DECODE_MODE: &str = "decode.mode";
const K_SCHEMA_PATH: &str = "schema.path";
const K_PRODUCER_CLIENT_ID: &str = "producer.client-id";
const P_TOPIC_CONFIG: &str = "topic.config.";
const P_PRODUCER_CONFIG: &str = "producer.config.";

// Defaults.
const DEFAULT_TOPIC_PATTERN: &str = "${table}";
const DEFAULT_TOPIC_MAX_LENGTH: i64 = 249;
const DEFAULT_FAMILY: &str = "0";
const DEFAULT_TOPIC_PARTITIONS: i64 = 3;
const DEFAULT_TOPIC_REPLICATION: i64 = 1;
const DEFAULT_ADMIN_TIMEOUT_MS: i64 = 60_000;
const DEFAULT_UNKNOWN_BACKOFF_MS: i64 = 15_000;
const DEFAULT_AWAIT_EVERY: i64 = 500;
const DEFAULT_AWAIT_TIMEOUT_MS: i64 = 180_000;

const PLACEHOLDER_TABLE: &str = "${table}";
const PLACEHOLDER_NAMESPACE: &str = "${namespace}";
const PLACEHOLDER_QUALIFIER: &str = "${qualifier}";

/// Row-key representation in the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowKeyEncoding {
    Hex,
    Base64,
}

impl RowKeyEncoding {
    /// Lenient parse: anything that is not `base64` is hex.
    fn parse(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("base64") {
            Self::Base64
        } else {
            Self::Hex
        }
    }
}

/// Value decoding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Raw,
    Typed,
}

/// Flat string configuration map with typed accessors, the surface the host
/// configuration loader provides.
#[derive(Debug, Clone, Default)]
pub struct Props {
    entries: BTreeMap<String, String>,
}

impl Props {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Builder-style `set`, convenient in tests and wiring code.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.set(key, value);
        self
    }

    /// Trimmed value of `key`; empty values read as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    /// Boolean with the common truthy/falsy tokens; anything else keeps the
    /// default with a warning.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            None => default,
            Some(raw) => match raw.to_ascii_lowercase().as_str() {
                "true" | "yes" | "on" | "1" => true,
                "false" | "no" | "off" | "0" => false,
                other => {
                    warn!(key, value = other, "unrecognized boolean value, keeping default");
                    default
                }
            },
        }
    }

    /// Integer floored at `min`; unparsable values keep the default with a
    /// warning.
    pub fn get_i64_min(&self, key: &str, default: i64, min: i64) -> i64 {
        let value = match self.get(key) {
            None => default,
            Some(raw) => match raw.parse::<i64>() {
                Ok(v) => v,
                Err(_) => {
                    warn!(key, value = raw, "unparsable integer value, keeping default");
                    default
                }
            },
        };
        if value < min {
            warn!(key, value, min, "integer value below minimum, clamping");
            min
        } else {
            value
        }
    }

    /// Optional integer: absent or unparsable reads as `None`.
    pub fn get_opt_i64(&self, key: &str) -> Option<i64> {
        let raw = self.get(key)?;
        match raw.parse::<i64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = raw, "unparsable integer value, ignoring");
                None
            }
        }
    }

    /// All entries under `prefix`, with the prefix stripped and blank keys
    /// or values dropped.
    pub fn strip_prefix(&self, prefix: &str) -> BTreeMap<String, String> {
        self.entries
            .iter()
            .filter_map(|(k, v)| {
                let stripped = k.strip_prefix(prefix)?.trim();
                let value = v.trim();
                if stripped.is_empty() || value.is_empty() {
                    return None;
                }
                Some((stripped.to_string(), value.to_string()))
            })
            .collect()
    }
}

impl FromIterator<(String, String)> for Props {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

impl From<BTreeMap<String, String>> for Props {
    fn from(entries: BTreeMap<String, String>) -> Self {
        Self { entries }
    }
}

/// Immutable, validated endpoint configuration.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    bootstrap: String,
    topic_pattern: String,
    topic_max_length: usize,
    family: Vec<u8>,
    family_name: String,
    include_rowkey: bool,
    rowkey_encoding: RowKeyEncoding,
    include_meta: bool,
    include_meta_wal: bool,
    serialize_nulls: bool,
    wal_min_ts: Option<i64>,
    ensure_topics: bool,
    topic_partitions: i32,
    topic_replication: i32,
    admin_timeout: Duration,
    admin_client_id: String,
    unknown_backoff: Duration,
    await_every: usize,
    await_timeout: Duration,
    batch_counters_enabled: bool,
    batch_debug_on_failure: bool,
    topic_configs: BTreeMap<String, String>,
    producer_options: BTreeMap<String, String>,
    producer_client_id: String,
    decode_mode: DecodeMode,
    schema_path: Option<PathBuf>,
}

impl EndpointConfig {
    /// Reads the full configuration surface out of the host-provided map.
    pub fn from_props(props: &Props) -> Result<Self, ConfigError> {
        let bootstrap = props
            .get(K_BOOTSTRAP)
            .ok_or(ConfigError::MissingKey { key: K_BOOTSTRAP })?
            .to_string();

        let mut builder = EndpointConfigBuilder::new(bootstrap)
            .topic_pattern(props.get_string(K_TOPIC_PATTERN, DEFAULT_TOPIC_PATTERN))
            .topic_max_length(props.get_i64_min(K_TOPIC_MAX_LENGTH, DEFAULT_TOPIC_MAX_LENGTH, 1) as usize)
            .family(props.get_string(K_FAMILY_NAME, DEFAULT_FAMILY))
            .include_rowkey(props.get_bool(K_INCLUDE_ROWKEY, true))
            .rowkey_encoding(RowKeyEncoding::parse(
                &props.get_string(K_ROWKEY_ENCODING, "hex"),
            ))
            .include_meta(props.get_bool(K_INCLUDE_META, false))
            .include_meta_wal(props.get_bool(K_INCLUDE_META_WAL, false))
            .serialize_nulls(props.get_bool(K_SERIALIZE_NULLS, false))
            .ensure_topics(props.get_bool(K_TOPIC_ENSURE, false))
            .topic_partitions(props.get_i64_min(K_TOPIC_PARTITIONS, DEFAULT_TOPIC_PARTITIONS, 1) as i32)
            .topic_replication(props.get_i64_min(K_TOPIC_REPLICATION, DEFAULT_TOPIC_REPLICATION, 1) as i32)
            .admin_timeout(Duration::from_millis(
                props.get_i64_min(K_ADMIN_TIMEOUT_MS, DEFAULT_ADMIN_TIMEOUT_MS, 1) as u64,
            ))
            .unknown_backoff(Duration::from_millis(
                props.get_i64_min(K_UNKNOWN_BACKOFF_MS, DEFAULT_UNKNOWN_BACKOFF_MS, 1) as u64,
            ))
            .await_every(props.get_i64_min(K_AWAIT_EVERY, DEFAULT_AWAIT_EVERY, 1) as usize)
            .await_timeout(Duration::from_millis(
                props.get_i64_min(K_AWAIT_TIMEOUT_MS, DEFAULT_AWAIT_TIMEOUT_MS, 1) as u64,
            ))
            .batch_counters_enabled(props.get_bool(K_BATCH_COUNTERS, false))
            .batch_debug_on_failure(props.get_bool(K_BATCH_DEBUG, false))
            .topic_configs(props.strip_prefix(P_TOPIC_CONFIG))
            .producer_options(props.strip_prefix(P_PRODUCER_CONFIG));

        if let Some(min_ts) = props.get_opt_i64(K_FILTER_WAL_MIN_TS) {
            builder = builder.wal_min_ts(min_ts);
        }
        if let Some(client_id) = props.get(K_ADMIN_CLIENT_ID) {
            builder = builder.admin_client_id(client_id);
        }
        if let Some(client_id) = props.get(K_PRODUCER_CLIENT_ID) {
            builder = builder.producer_client_id(client_id);
        }

        let typed = props
            .get(K_DECODE_MODE)
            .map(|mode| mode.eq_ignore_ascii_case("typed"))
            .unwrap_or(false);
        if typed {
            builder = builder.decode_mode(DecodeMode::Typed);
        }
        if let Some(path) = props.get(K_SCHEMA_PATH) {
            builder = builder.schema_path(path);
        }

        builder.build()
    }

    pub fn bootstrap(&self) -> &str {
        &self.bootstrap
    }

    pub fn topic_pattern(&self) -> &str {
        &self.topic_pattern
    }

    pub fn topic_max_length(&self) -> usize {
        self.topic_max_length
    }

    /// Target column family, UTF-8 bytes.
    pub fn family(&self) -> &[u8] {
        &self.family
    }

    pub fn family_name(&self) -> &str {
        &self.family_name
    }

    pub fn include_rowkey(&self) -> bool {
        self.include_rowkey
    }

    pub fn rowkey_encoding(&self) -> RowKeyEncoding {
        self.rowkey_encoding
    }

    pub fn include_meta(&self) -> bool {
        self.include_meta
    }

    pub fn include_meta_wal(&self) -> bool {
        self.include_meta_wal
    }

    pub fn serialize_nulls(&self) -> bool {
        self.serialize_nulls
    }

    /// WAL timestamp filter threshold; the filter is enabled when set.
    pub fn wal_min_ts(&self) -> Option<i64> {
        self.wal_min_ts
    }

    pub fn ensure_topics(&self) -> bool {
        self.ensure_topics
    }

    pub fn topic_partitions(&self) -> i32 {
        self.topic_partitions
    }

    pub fn topic_replication(&self) -> i32 {
        self.topic_replication
    }

    pub fn admin_timeout(&self) -> Duration {
        self.admin_timeout
    }

    pub fn admin_client_id(&self) -> &str {
        &self.admin_client_id
    }

    pub fn unknown_backoff(&self) -> Duration {
        self.unknown_backoff
    }

    pub fn await_every(&self) -> usize {
        self.await_every
    }

    pub fn await_timeout(&self) -> Duration {
        self.await_timeout
    }

    pub fn batch_counters_enabled(&self) -> bool {
        self.batch_counters_enabled
    }

    pub fn batch_debug_on_failure(&self) -> bool {
        self.batch_debug_on_failure
    }

    pub fn topic_configs(&self) -> &BTreeMap<String, String> {
        &self.topic_configs
    }

    /// rdkafka pass-through options (`producer.config.*`).
    pub fn producer_options(&self) -> &BTreeMap<String, String> {
        &self.producer_options
    }

    pub fn producer_client_id(&self) -> &str {
        &self.producer_client_id
    }

    pub fn decode_mode(&self) -> DecodeMode {
        self.decode_mode
    }

    pub fn schema_path(&self) -> Option<&PathBuf> {
        self.schema_path.as_ref()
    }

    /// Derives the topic for a table: placeholder expansion, replacement of
    /// characters outside `[A-Za-z0-9._-]` with `_`, truncation to the
    /// configured maximum length.
    pub fn topic_for(&self, table: &TableName) -> String {
        let ns = table.namespace();
        let qn = table.qualifier();
        let expanded = self
            .topic_pattern
            .replace(PLACEHOLDER_TABLE, &format!("{ns}_{qn}"))
            .replace(PLACEHOLDER_NAMESPACE, ns)
            .replace(PLACEHOLDER_QUALIFIER, qn);
        let mut sanitized: String = expanded
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        sanitized.truncate(self.topic_max_length);
        sanitized
    }
}

impl Display for EndpointConfig {
    /// One-line summary for startup logs; omits the pass-through maps.
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EndpointConfig{{bootstrap={}, pattern={}, family={}, rowkey={:?}, \
             meta={}, ensure={}, await_every={}, await_timeout_ms={}, decode={:?}}}",
            self.bootstrap,
            self.topic_pattern,
            self.family_name,
            self.rowkey_encoding,
            self.include_meta,
            self.ensure_topics,
            self.await_every,
            self.await_timeout.as_millis(),
            self.decode_mode,
        )
    }
}

/// Step-by-step construction of an [`EndpointConfig`]; validation happens in
/// [`EndpointConfigBuilder::build`].
#[derive(Debug, Clone)]
pub struct EndpointConfigBuilder {
    bootstrap: String,
    topic_pattern: String,
    topic_max_length: usize,
    family_name: String,
    include_rowkey: bool,
    rowkey_encoding: RowKeyEncoding,
    include_meta: bool,
    include_meta_wal: bool,
    serialize_nulls: bool,
    wal_min_ts: Option<i64>,
    ensure_topics: bool,
    topic_partitions: i32,
    topic_replication: i32,
    admin_timeout: Duration,
    admin_client_id: Option<String>,
    unknown_backoff: Duration,
    await_every: usize,
    await_timeout: Duration,
    batch_counters_enabled: bool,
    batch_debug_on_failure: bool,
    topic_configs: BTreeMap<String, String>,
    producer_options: BTreeMap<String, String>,
    producer_client_id: Option<String>,
    decode_mode: DecodeMode,
    schema_path: Option<PathBuf>,
}

impl EndpointConfigBuilder {
    pub fn new(bootstrap: impl Into<String>) -> Self {
        Self {
            bootstrap: bootstrap.into(),
            topic_pattern: DEFAULT_TOPIC_PATTERN.to_string(),
            topic_max_length: DEFAULT_TOPIC_MAX_LENGTH as usize,
            family_name: DEFAULT_FAMILY.to_string(),
            include_rowkey: true,
            rowkey_encoding: RowKeyEncoding::Hex,
            include_meta: false,
            include_meta_wal: false,
            serialize_nulls: false,
            wal_min_ts: None,
            ensure_topics: false,
            topic_partitions: DEFAULT_TOPIC_PARTITIONS as i32,
            topic_replication: DEFAULT_TOPIC_REPLICATION as i32,
            admin_timeout: Duration::from_millis(DEFAULT_ADMIN_TIMEOUT_MS as u64),
            admin_client_id: None,
            unknown_backoff: Duration::from_millis(DEFAULT_UNKNOWN_BACKOFF_MS as u64),
            await_every: DEFAULT_AWAIT_EVERY as usize,
            await_timeout: Duration::from_millis(DEFAULT_AWAIT_TIMEOUT_MS as u64),
            batch_counters_enabled: false,
            batch_debug_on_failure: false,
            topic_configs: BTreeMap::new(),
            producer_options: BTreeMap::new(),
            producer_client_id: None,
            decode_mode: DecodeMode::Raw,
            schema_path: None,
        }
    }

    pub fn topic_pattern(mut self, v: impl Into<String>) -> Self {
        self.topic_pattern = v.into().trim().to_string();
        self
    }

    pub fn topic_max_length(mut self, v: usize) -> Self {
        self.topic_max_length = v;
        self
    }

    pub fn family(mut self, v: impl Into<String>) -> Self {
        self.family_name = v.into().trim().to_string();
        self
    }

    pub fn include_rowkey(mut self, v: bool) -> Self {
        self.include_rowkey = v;
        self
    }

    pub fn rowkey_encoding(mut self, v: RowKeyEncoding) -> Self {
        self.rowkey_encoding = v;
        self
    }

    pub fn include_meta(mut self, v: bool) -> Self {
        self.include_meta = v;
        self
    }

    pub fn include_meta_wal(mut self, v: bool) -> Self {
        self.include_meta_wal = v;
        self
    }

    pub fn serialize_nulls(mut self, v: bool) -> Self {
        self.serialize_nulls = v;
        self
    }

    pub fn wal_min_ts(mut self, v: i64) -> Self {
        self.wal_min_ts = Some(v);
        self
    }

    pub fn ensure_topics(mut self, v: bool) -> Self {
        self.ensure_topics = v;
        self
    }

    pub fn topic_partitions(mut self, v: i32) -> Self {
        self.topic_partitions = v;
        self
    }

    pub fn topic_replication(mut self, v: i32) -> Self {
        self.topic_replication = v;
        self
    }

    pub fn admin_timeout(mut self, v: Duration) -> Self {
        self.admin_timeout = v;
        self
    }

    pub fn admin_client_id(mut self, v: impl Into<String>) -> Self {
        self.admin_client_id = Some(v.into());
        self
    }

    pub fn unknown_backoff(mut self, v: Duration) -> Self {
        self.unknown_backoff = v;
        self
    }

    pub fn await_every(mut self, v: usize) -> Self {
        self.await_every = v;
        self
    }

    pub fn await_timeout(mut self, v: Duration) -> Self {
        self.await_timeout = v;
        self
    }

    pub fn batch_counters_enabled(mut self, v: bool) -> Self {
        self.batch_counters_enabled = v;
        self
    }

    pub fn batch_debug_on_failure(mut self, v: bool) -> Self {
        self.batch_debug_on_failure = v;
        self
    }

    pub fn topic_configs(mut self, v: BTreeMap<String, String>) -> Self {
        self.topic_configs = v;
        self
    }

    pub fn producer_options(mut self, v: BTreeMap<String, String>) -> Self {
        self.producer_options = v;
        self
    }

    pub fn producer_client_id(mut self, v: impl Into<String>) -> Self {
        self.producer_client_id = Some(v.into());
        self
    }

    pub fn decode_mode(mut self, v: DecodeMode) -> Self {
        self.decode_mode = v;
        self
    }

    pub fn schema_path(mut self, v: impl Into<PathBuf>) -> Self {
        self.schema_path = Some(v.into());
        self
    }

    /// Validates and freezes the configuration.
    pub fn build(self) -> Result<EndpointConfig, ConfigError> {
        let bootstrap = self.bootstrap.trim().to_string();
        if bootstrap.is_empty() {
            return Err(ConfigError::MissingKey { key: K_BOOTSTRAP });
        }
        check_positive(K_TOPIC_MAX_LENGTH, self.topic_max_length as i64)?;
        check_positive(K_TOPIC_PARTITIONS, i64::from(self.topic_partitions))?;
        check_positive(K_TOPIC_REPLICATION, i64::from(self.topic_replication))?;
        check_positive(K_ADMIN_TIMEOUT_MS, self.admin_timeout.as_millis() as i64)?;
        check_positive(K_UNKNOWN_BACKOFF_MS, self.unknown_backoff.as_millis() as i64)?;
        check_positive(K_AWAIT_EVERY, self.await_every as i64)?;
        check_positive(K_AWAIT_TIMEOUT_MS, self.await_timeout.as_millis() as i64)?;
        if self.decode_mode == DecodeMode::Typed && self.schema_path.is_none() {
            return Err(ConfigError::MissingSchemaPath);
        }
        let family_name = if self.family_name.is_empty() {
            DEFAULT_FAMILY.to_string()
        } else {
            self.family_name
        };

        Ok(EndpointConfig {
            bootstrap,
            topic_pattern: self.topic_pattern,
            topic_max_length: self.topic_max_length,
            family: family_name.as_bytes().to_vec(),
            family_name,
            include_rowkey: self.include_rowkey,
            rowkey_encoding: self.rowkey_encoding,
            include_meta: self.include_meta,
            include_meta_wal: self.include_meta_wal,
            serialize_nulls: self.serialize_nulls,
            wal_min_ts: self.wal_min_ts,
            ensure_topics: self.ensure_topics,
            topic_partitions: self.topic_partitions,
            topic_replication: self.topic_replication,
            admin_timeout: self.admin_timeout,
            admin_client_id: self
                .admin_client_id
                .unwrap_or_else(|| derived_client_id("wal2kafka-admin")),
            unknown_backoff: self.unknown_backoff,
            await_every: self.await_every,
            await_timeout: self.await_timeout,
            batch_counters_enabled: self.batch_counters_enabled,
            batch_debug_on_failure: self.batch_debug_on_failure,
            topic_configs: self.topic_configs,
            producer_options: self.producer_options,
            producer_client_id: self
                .producer_client_id
                .unwrap_or_else(|| derived_client_id("wal2kafka")),
            decode_mode: self.decode_mode,
            schema_path: self.schema_path,
        })
    }
}

fn check_positive(key: &'static str, value: i64) -> Result<(), ConfigError> {
    if value > 0 {
        Ok(())
    } else {
        Err(ConfigError::NotPositive { key, value })
    }
}

/// `<prefix>-<hostname>`, with a UUID suffix when the hostname is not
/// available, so concurrently running processes stay distinguishable in
/// broker logs.
fn derived_client_id(prefix: &str) -> String {
    match std::env::var("HOSTNAME") {
        Ok(host) if !host.trim().is_empty() => format!("{prefix}-{}", host.trim()),
        _ => format!("{prefix}-{}", Uuid::new_v4()),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn minimal_props() -> Props {
        Props::new().with(K_BOOTSTRAP, "broker-1:9092,broker-2:9092")
    }

    #[test]
    fn defaults_apply() {
        let config = EndpointConfig::from_props(&minimal_props()).unwrap();
        assert_eq!(config.bootstrap(), "broker-1:9092,broker-2:9092");
        assert_eq!(config.topic_pattern(), "${table}");
        assert_eq!(config.topic_max_length(), 249);
        assert_eq!(config.family(), b"0");
        assert!(config.include_rowkey());
        assert_eq!(config.rowkey_encoding(), RowKeyEncoding::Hex);
        assert!(!config.include_meta());
        assert!(!config.serialize_nulls());
        assert_eq!(config.wal_min_ts(), None);
        assert!(!config.ensure_topics());
        assert_eq!(config.topic_partitions(), 3);
        assert_eq!(config.topic_replication(), 1);
        assert_eq!(config.admin_timeout(), Duration::from_secs(60));
        assert_eq!(config.unknown_backoff(), Duration::from_millis(15_000));
        assert_eq!(config.await_every(), 500);
        assert_eq!(config.await_timeout(), Duration::from_secs(180));
        assert_eq!(config.decode_mode(), DecodeMode::Raw);
    }

    #[test]
    fn missing_bootstrap_fails_fast() {
        assert!(matches!(
            EndpointConfig::from_props(&Props::new()),
            Err(ConfigError::MissingKey { .. })
        ));
        assert!(matches!(
            EndpointConfig::from_props(&Props::new().with(K_BOOTSTRAP, "   ")),
            Err(ConfigError::MissingKey { .. })
        ));
    }

    #[test]
    fn boolean_tokens_are_lenient() {
        let props = minimal_props()
            .with(K_INCLUDE_META, "Yes")
            .with(K_SERIALIZE_NULLS, "1")
            .with(K_INCLUDE_ROWKEY, "off");
        let config = EndpointConfig::from_props(&props).unwrap();
        assert!(config.include_meta());
        assert!(config.serialize_nulls());
        assert!(!config.include_rowkey());
    }

    #[test]
    fn invalid_rowkey_encoding_normalizes_to_hex() {
        let props = minimal_props().with(K_ROWKEY_ENCODING, "base32");
        let config = EndpointConfig::from_props(&props).unwrap();
        assert_eq!(config.rowkey_encoding(), RowKeyEncoding::Hex);

        let props = minimal_props().with(K_ROWKEY_ENCODING, "Base64");
        let config = EndpointConfig::from_props(&props).unwrap();
        assert_eq!(config.rowkey_encoding(), RowKeyEncoding::Base64);
    }

    #[test]
    fn numeric_values_are_clamped_to_minimum() {
        let props = minimal_props()
            .with(K_TOPIC_PARTITIONS, "-3")
            .with(K_AWAIT_EVERY, "0")
            .with(K_AWAIT_TIMEOUT_MS, "junk");
        let config = EndpointConfig::from_props(&props).unwrap();
        assert_eq!(config.topic_partitions(), 1);
        assert_eq!(config.await_every(), 1);
        assert_eq!(config.await_timeout(), Duration::from_millis(180_000));
    }

    #[test]
    fn filter_enabled_only_when_set_and_parsable() {
        let config = EndpointConfig::from_props(&minimal_props()).unwrap();
        assert_eq!(config.wal_min_ts(), None);

        let props = minimal_props().with(K_FILTER_WAL_MIN_TS, "1700000000000");
        let config = EndpointConfig::from_props(&props).unwrap();
        assert_eq!(config.wal_min_ts(), Some(1_700_000_000_000));

        let props = minimal_props().with(K_FILTER_WAL_MIN_TS, "soon");
        let config = EndpointConfig::from_props(&props).unwrap();
        assert_eq!(config.wal_min_ts(), None);
    }

    #[test]
    fn typed_mode_requires_schema_path() {
        let props = minimal_props().with(K_DECODE_MODE, "typed");
        assert!(matches!(
            EndpointConfig::from_props(&props),
            Err(ConfigError::MissingSchemaPath)
        ));

        let props = minimal_props()
            .with(K_DECODE_MODE, "Typed")
            .with(K_SCHEMA_PATH, "/etc/schema.json");
        let config = EndpointConfig::from_props(&props).unwrap();
        assert_eq!(config.decode_mode(), DecodeMode::Typed);
        assert_eq!(
            config.schema_path().unwrap().to_str().unwrap(),
            "/etc/schema.json"
        );
    }

    #[test]
    fn prefixed_maps_are_collected() {
        let props = minimal_props()
            .with("topic.config.retention.ms", "604800000")
            .with("topic.config.cleanup.policy", "compact")
            .with("topic.config.", "ignored")
            .with("producer.config.linger.ms", "50");
        let config = EndpointConfig::from_props(&props).unwrap();
        assert_eq!(
            config.topic_configs().get("retention.ms").map(String::as_str),
            Some("604800000")
        );
        assert_eq!(config.topic_configs().len(), 2);
        assert_eq!(
            config.producer_options().get("linger.ms").map(String::as_str),
            Some("50")
        );
    }

    #[test]
    fn topic_derivation_expands_and_sanitizes() {
        let table = TableName::new("ns", "TBL");

        let config = EndpointConfigBuilder::new("b:9092")
            .topic_pattern("${namespace}.${qualifier}")
            .build()
            .unwrap();
        assert_eq!(config.topic_for(&table), "ns.TBL");

        let config = EndpointConfigBuilder::new("b:9092")
            .topic_pattern("${namespace}:${qualifier}")
            .build()
            .unwrap();
        assert_eq!(config.topic_for(&table), "ns_TBL");

        let config = EndpointConfigBuilder::new("b:9092").build().unwrap();
        assert_eq!(config.topic_for(&table), "ns_TBL");
    }

    #[test]
    fn topic_derivation_truncates() {
        let config = EndpointConfigBuilder::new("b:9092")
            .topic_max_length(5)
            .build()
            .unwrap();
        let table = TableName::new("namespace", "qualifier");
        assert_eq!(config.topic_for(&table), "names");
    }

    #[test]
    fn builder_rejects_non_positive_values() {
        assert!(matches!(
            EndpointConfigBuilder::new("b:9092").await_every(0).build(),
            Err(ConfigError::NotPositive { .. })
        ));
        assert!(matches!(
            EndpointConfigBuilder::new("b:9092")
                .topic_partitions(-1)
                .build(),
            Err(ConfigError::NotPositive { .. })
        ));
    }

    #[test]
    fn client_ids_are_derived_when_unset() {
        let config = EndpointConfigBuilder::new("b:9092").build().unwrap();
        assert!(config.admin_client_id().starts_with("wal2kafka-admin-"));
        assert!(config.producer_client_id().starts_with("wal2kafka-"));

        let config = EndpointConfigBuilder::new("b:9092")
            .admin_client_id("ops-admin")
            .producer_client_id("ops-producer")
            .build()
            .unwrap();
        assert_eq!(config.admin_client_id(), "ops-admin");
        assert_eq!(config.producer_client_id(), "ops-producer");
    }

    #[test]
    fn empty_family_falls_back_to_default() {
        let config = EndpointConfigBuilder::new("b:9092").family("  ").build().unwrap();
        assert_eq!(config.family(), b"0");
        assert_eq!(config.family_name(), "0");
    }

    #[test]
    fn display_summarizes_the_configuration() {
        let config = EndpointConfigBuilder::new("b:9092").build().unwrap();
        let text = config.to_string();
        assert!(text.contains("bootstrap=b:9092"));
        assert!(text.contains("decode=Raw"));
    }

    mod properties {
        use super::*;
        use crate::kafka::topics::is_valid_topic_name;
        use proptest::prelude::*;

        proptest! {
            /// Whatever the table identifiers look like, the derived topic
            /// passes the broker's naming rules.
            #[test]
            fn derived_topics_are_always_valid(
                ns in "[a-zA-Z0-9:/ @]{0,300}",
                qn in "[a-zA-Z0-9:/ @]{1,300}",
            ) {
                let config = EndpointConfigBuilder::new("b:9092").build().unwrap();
                let topic = config.topic_for(&TableName::new(ns, qn));
                prop_assert!(is_valid_topic_name(&topic), "invalid topic {topic:?}");
            }
        }
    }
}
