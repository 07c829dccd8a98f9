//! Typed decoding of raw column values.
//!
//! Two decoders cover the two operating modes of the endpoint:
//!
//! * [`ValueDecoder::Raw`] passes value bytes through untouched (rendered as
//!   a JSON array of byte values).
//! * [`ValueDecoder::Typed`] resolves the declared type of each column
//!   through a [`SchemaRegistry`] and converts the bytes accordingly,
//!   caching the resolved [`LogicalType`] per column.
//!
//! ## Wire encodings
//!
//! All multi-byte integers are big-endian.
//!
//! | type | encoding |
//! |---|---|
//! | `VARCHAR` / `CHAR` / `STRING` | UTF-8 bytes |
//! | `TINYINT`..`BIGINT` | 1/2/4/8-byte two's complement |
//! | `UNSIGNED_TINYINT`..`UNSIGNED_LONG` | 1/2/4/8-byte unsigned |
//! | `FLOAT` / `DOUBLE` | 4/8-byte IEEE-754 bit pattern |
//! | `DECIMAL` | UTF-8 decimal string |
//! | `BOOLEAN` | one byte, zero = false |
//! | `DATE` / `TIME` / `TIMESTAMP` | 8-byte epoch milliseconds; `TIMESTAMP` also accepts a 12-byte form whose trailing nanosecond word is discarded |
//! | `BINARY` / `VARBINARY` | bytes as-is |
//! | `T ARRAY` | 4-byte element count, then per element a 4-byte length prefix (`0xFFFF_FFFF` marks null) and the element bytes |
//!
//! Unknown declared types fall back to `VARCHAR` semantics with a single
//! warning per column; conversion failures surface as [`DecodeError`] with
//! the column coordinates attached.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, bail, Context, Result as AnyResult};
use once_cell::sync::Lazy;
use serde_json::{Number, Value};
use thiserror::Error;
use tracing::{debug, warn};

use crate::schema::SchemaRegistry;
use crate::wal::TableName;

/// Length prefix that marks a null array element.
const ARRAY_NULL_ELEMENT: u32 = u32::MAX;

/// A conversion failed for one column value.
#[derive(Debug, Error)]
#[error("failed to decode {table}.{qualifier} as {logical_type}: {source}")]
pub struct DecodeError {
    pub table: String,
    pub qualifier: String,
    pub logical_type: String,
    #[source]
    pub source: anyhow::Error,
}

/// Canonical logical column types this crate can decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogicalType {
    Varchar,
    Char,
    Tinyint,
    Smallint,
    Integer,
    Bigint,
    UnsignedTinyint,
    UnsignedSmallint,
    UnsignedInt,
    UnsignedLong,
    Float,
    Double,
    Decimal,
    Boolean,
    Date,
    Time,
    Timestamp,
    Binary,
    Varbinary,
    Array(Box<LogicalType>),
}

impl LogicalType {
    /// Canonical display name, matching the normalized type-name grammar.
    pub fn name(&self) -> String {
        match self {
            Self::Varchar => "VARCHAR".into(),
            Self::Char => "CHAR".into(),
            Self::Tinyint => "TINYINT".into(),
            Self::Smallint => "SMALLINT".into(),
            Self::Integer => "INTEGER".into(),
            Self::Bigint => "BIGINT".into(),
            Self::UnsignedTinyint => "UNSIGNED TINYINT".into(),
            Self::UnsignedSmallint => "UNSIGNED SMALLINT".into(),
            Self::UnsignedInt => "UNSIGNED INT".into(),
            Self::UnsignedLong => "UNSIGNED LONG".into(),
            Self::Float => "FLOAT".into(),
            Self::Double => "DOUBLE".into(),
            Self::Decimal => "DECIMAL".into(),
            Self::Boolean => "BOOLEAN".into(),
            Self::Date => "DATE".into(),
            Self::Time => "TIME".into(),
            Self::Timestamp => "TIMESTAMP".into(),
            Self::Binary => "BINARY".into(),
            Self::Varbinary => "VARBINARY".into(),
            Self::Array(elem) => format!("{} ARRAY", elem.name()),
        }
    }
}

/// Scalar type names (after normalization) and their synonyms.
static SCALAR_TYPES: Lazy<HashMap<&'static str, LogicalType>> = Lazy::new(|| {
    use LogicalType::*;
    HashMap::from([
        ("VARCHAR", Varchar),
        ("STRING", Varchar),
        ("CHARACTER VARYING", Varchar),
        ("CHAR", Char),
        ("TINYINT", Tinyint),
        ("SMALLINT", Smallint),
        ("INTEGER", Integer),
        ("INT", Integer),
        ("BIGINT", Bigint),
        ("LONG", Bigint),
        ("UNSIGNED TINYINT", UnsignedTinyint),
        ("UNSIGNED SMALLINT", UnsignedSmallint),
        ("UNSIGNED INT", UnsignedInt),
        ("UNSIGNED LONG", UnsignedLong),
        ("FLOAT", Float),
        ("DOUBLE", Double),
        ("DECIMAL", Decimal),
        ("NUMERIC", Decimal),
        ("NUMBER", Decimal),
        ("BOOLEAN", Boolean),
        ("BOOL", Boolean),
        ("DATE", Date),
        ("TIME", Time),
        ("TIMESTAMP", Timestamp),
        ("BINARY", Binary),
        ("VARBINARY", Varbinary),
        ("BINARY VARYING", Varbinary),
    ])
});

/// Canonicalizes a declared type name: trim, upper-case, strip parenthesized
/// parameters, rewrite `T[]` and `ARRAY<T>` to `T ARRAY`, replace
/// underscores with spaces and collapse whitespace runs.  An empty input
/// canonicalizes to `VARCHAR`.
pub fn normalize_type_name(raw: &str) -> String {
    let mut t = raw.trim().to_uppercase();
    if t.is_empty() {
        return "VARCHAR".to_string();
    }
    t = strip_paren_params(&t);
    t = normalize_array_syntax(&t);
    t = t.replace('_', " ");
    collapse_spaces(&t)
}

/// Resolves a declared type name to a [`LogicalType`], honoring synonyms and
/// the `T ARRAY` form.  `None` means the name is unknown even after
/// normalization.
pub fn resolve_type_name(raw: &str) -> Option<LogicalType> {
    let normalized = normalize_type_name(raw);
    if let Some(base) = normalized.strip_suffix(" ARRAY") {
        return SCALAR_TYPES
            .get(base)
            .cloned()
            .map(|elem| LogicalType::Array(Box::new(elem)));
    }
    SCALAR_TYPES.get(normalized.as_str()).cloned()
}

/// `VARCHAR(100)` → `VARCHAR`, `DECIMAL(10,2)` → `DECIMAL`.
fn strip_paren_params(t: &str) -> String {
    match t.find('(') {
        None => t.to_string(),
        Some(open) => match t[open..].find(')') {
            Some(close) => {
                let mut out = String::with_capacity(t.len());
                out.push_str(t[..open].trim_end());
                out.push_str(t[open + close + 1..].trim_start());
                out.trim().to_string()
            }
            None => t[..open].trim().to_string(),
        },
    }
}

/// `T[]` and `ARRAY<T>` → `T ARRAY`; the element type is cleaned of
/// parenthesized parameters as well.
fn normalize_array_syntax(t: &str) -> String {
    if let Some(base) = t.strip_suffix("[]") {
        return format!("{} ARRAY", strip_paren_params(base.trim()));
    }
    if let Some(inner) = t.strip_prefix("ARRAY<").and_then(|rest| rest.strip_suffix('>')) {
        return format!("{} ARRAY", strip_paren_params(inner.trim()));
    }
    t.to_string()
}

fn collapse_spaces(t: &str) -> String {
    let mut out = String::with_capacity(t.len());
    let mut in_space = false;
    for c in t.chars() {
        if c.is_whitespace() {
            if !in_space {
                out.push(' ');
                in_space = true;
            }
        } else {
            out.push(c);
            in_space = false;
        }
    }
    out
}

/// Column coordinates used as the type-cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ColumnKey {
    namespace: String,
    table: String,
    qualifier: String,
}

impl ColumnKey {
    fn new(table: &TableName, qualifier: &str) -> Self {
        Self {
            namespace: table.namespace().to_string(),
            table: table.qualifier().to_string(),
            qualifier: qualifier.to_string(),
        }
    }
}

/// Value decoder: either a byte passthrough or schema-driven typed
/// conversion.
pub enum ValueDecoder {
    Raw,
    Typed(TypedDecoder),
}

impl ValueDecoder {
    pub fn raw() -> Self {
        Self::Raw
    }

    pub fn typed(registry: Arc<dyn SchemaRegistry>) -> Self {
        Self::Typed(TypedDecoder::new(registry))
    }

    /// Decodes one cell value.  `None` in yields `None` out without any
    /// registry lookup.
    pub fn decode(
        &self,
        table: &TableName,
        qualifier: &[u8],
        value: Option<&[u8]>,
    ) -> Result<Option<Value>, DecodeError> {
        let Some(bytes) = value else {
            return Ok(None);
        };
        match self {
            Self::Raw => Ok(Some(byte_array_value(bytes))),
            Self::Typed(typed) => typed.decode(table, qualifier, bytes).map(Some),
        }
    }
}

/// Schema-driven decoder with a per-column resolved-type cache.
///
/// Safe for concurrent use; the cache is invalidated wholesale whenever the
/// registry reports a new generation (i.e. after a schema refresh).
pub struct TypedDecoder {
    registry: Arc<dyn SchemaRegistry>,
    cache: RwLock<HashMap<ColumnKey, LogicalType>>,
    /// Columns whose unknown declared type was already warned about.
    warned: Mutex<HashSet<ColumnKey>>,
    cached_generation: AtomicU64,
}

impl TypedDecoder {
    pub fn new(registry: Arc<dyn SchemaRegistry>) -> Self {
        let generation = registry.generation();
        Self {
            registry,
            cache: RwLock::new(HashMap::new()),
            warned: Mutex::new(HashSet::new()),
            cached_generation: AtomicU64::new(generation),
        }
    }

    fn decode(
        &self,
        table: &TableName,
        qualifier: &[u8],
        bytes: &[u8],
    ) -> Result<Value, DecodeError> {
        let qualifier = String::from_utf8_lossy(qualifier).into_owned();
        let logical_type = self.resolve_type(table, &qualifier);
        convert(&logical_type, bytes).map_err(|source| DecodeError {
            table: table.canonical(),
            qualifier,
            logical_type: logical_type.name(),
            source,
        })
    }

    /// Resolved logical type of the column, from the cache when possible.
    /// The registry is consulted at most once per column per schema
    /// generation.
    fn resolve_type(&self, table: &TableName, qualifier: &str) -> LogicalType {
        let generation = self.registry.generation();
        if self.cached_generation.swap(generation, Ordering::AcqRel) != generation {
            self.cache.write().unwrap().clear();
        }

        let key = ColumnKey::new(table, qualifier);
        if let Some(cached) = self.cache.read().unwrap().get(&key) {
            return cached.clone();
        }

        let declared = self.registry.column_type(table, qualifier);
        let resolved = match &declared {
            None => LogicalType::Varchar,
            Some(raw) => resolve_type_name(raw).unwrap_or_else(|| {
                self.warn_unknown_type(&key, table, qualifier, raw);
                LogicalType::Varchar
            }),
        };
        self.cache
            .write()
            .unwrap()
            .entry(key)
            .or_insert(resolved.clone());
        resolved
    }

    fn warn_unknown_type(&self, key: &ColumnKey, table: &TableName, qualifier: &str, raw: &str) {
        if self.warned.lock().unwrap().insert(key.clone()) {
            warn!(
                table = %table,
                qualifier,
                declared = raw,
                normalized = %normalize_type_name(raw),
                "unknown column type, falling back to VARCHAR"
            );
        } else {
            debug!(table = %table, qualifier, declared = raw, "unknown column type (repeat)");
        }
    }

    #[cfg(test)]
    fn warned_count(&self) -> usize {
        self.warned.lock().unwrap().len()
    }
}

/// Bytes rendered as a JSON array of unsigned byte values.
fn byte_array_value(bytes: &[u8]) -> Value {
    Value::Array(bytes.iter().map(|&b| Value::from(b)).collect())
}

fn convert(logical_type: &LogicalType, bytes: &[u8]) -> AnyResult<Value> {
    use LogicalType::*;
    match logical_type {
        Varchar | Char => Ok(Value::String(
            std::str::from_utf8(bytes).context("invalid UTF-8")?.to_string(),
        )),
        Tinyint => Ok(Value::from(i8::from_be_bytes(fixed(bytes)?))),
        Smallint => Ok(Value::from(i16::from_be_bytes(fixed(bytes)?))),
        Integer => Ok(Value::from(i32::from_be_bytes(fixed(bytes)?))),
        Bigint => Ok(Value::from(i64::from_be_bytes(fixed(bytes)?))),
        UnsignedTinyint => Ok(Value::from(u8::from_be_bytes(fixed(bytes)?))),
        UnsignedSmallint => Ok(Value::from(u16::from_be_bytes(fixed(bytes)?))),
        UnsignedInt => Ok(Value::from(u32::from_be_bytes(fixed(bytes)?))),
        UnsignedLong => Ok(Value::from(u64::from_be_bytes(fixed(bytes)?))),
        Float => finite_number(f64::from(f32::from_be_bytes(fixed(bytes)?))),
        Double => finite_number(f64::from_be_bytes(fixed(bytes)?)),
        Decimal => {
            let text = std::str::from_utf8(bytes).context("invalid UTF-8 in decimal")?;
            let decimal =
                rust_decimal::Decimal::from_str(text.trim()).context("unparsable decimal")?;
            decimal_number(&decimal)
        }
        Boolean => {
            let [b] = fixed::<1>(bytes)?;
            Ok(Value::Bool(b != 0))
        }
        Date | Time => Ok(Value::from(i64::from_be_bytes(fixed(bytes)?))),
        Timestamp => {
            // 8-byte epoch millis, or 12 bytes with a nanosecond remainder
            // that is dropped here: event timestamps are millisecond-grained.
            let millis: [u8; 8] = match bytes.len() {
                8 => fixed(bytes)?,
                12 => fixed(&bytes[..8])?,
                n => bail!("expected 8 or 12 bytes, got {n}"),
            };
            Ok(Value::from(i64::from_be_bytes(millis)))
        }
        Binary | Varbinary => Ok(byte_array_value(bytes)),
        Array(elem) => decode_array(elem, bytes),
    }
}

/// Decodes the length-prefixed array format described in the module docs.
fn decode_array(elem: &LogicalType, bytes: &[u8]) -> AnyResult<Value> {
    if bytes.is_empty() {
        return Ok(Value::Array(Vec::new()));
    }
    let mut rest = bytes;
    let count = read_u32(&mut rest).context("array element count")? as usize;
    let mut out = Vec::with_capacity(count);
    for index in 0..count {
        let len = read_u32(&mut rest).with_context(|| format!("length of element {index}"))?;
        if len == ARRAY_NULL_ELEMENT {
            out.push(Value::Null);
            continue;
        }
        let len = len as usize;
        if rest.len() < len {
            bail!("element {index} truncated: need {len} bytes, {} left", rest.len());
        }
        let (chunk, tail) = rest.split_at(len);
        rest = tail;
        out.push(convert(elem, chunk).with_context(|| format!("element {index}"))?);
    }
    if !rest.is_empty() {
        bail!("{} trailing bytes after {count} array elements", rest.len());
    }
    Ok(Value::Array(out))
}

fn read_u32(rest: &mut &[u8]) -> AnyResult<u32> {
    if rest.len() < 4 {
        bail!("truncated input: need 4 bytes, {} left", rest.len());
    }
    let (word, tail) = rest.split_at(4);
    *rest = tail;
    Ok(u32::from_be_bytes(word.try_into().unwrap()))
}

fn fixed<const N: usize>(bytes: &[u8]) -> AnyResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| anyhow!("expected {N} bytes, got {}", bytes.len()))
}

fn finite_number(value: f64) -> AnyResult<Value> {
    Number::from_f64(value)
        .map(Value::Number)
        .ok_or_else(|| anyhow!("non-finite floating point value"))
}

/// Decimal rendered as a JSON number without going through `f64`.
fn decimal_number(decimal: &rust_decimal::Decimal) -> AnyResult<Value> {
    let number = serde_json::from_str::<Number>(&decimal.to_string())
        .context("decimal is not a valid JSON number")?;
    Ok(Value::Number(number))
}
