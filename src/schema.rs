//! Column type registry.
//!
//! Maps `(table, qualifier)` to the type name declared for the column.  The
//! production implementation loads a JSON document of the form
//!
//! ```text
//! {
//!   "NS:TBL": { "columns": { "col1": "VARCHAR", "created_at": "TIMESTAMP" } },
//!   ...
//! }
//! ```
//!
//! and publishes each table under several aliases (original, upper-cased and
//! lower-cased forms of both the full `ns:qual` name and the short name after
//! the colon) so that lookups are tolerant of the case and namespace
//! conventions of the WAL stream.  Load failures never escape: a broken or
//! missing file produces an empty snapshot and a warning.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::Deserialize;
use tracing::warn;

use crate::wal::TableName;

/// Shared, immutable column map of one table: qualifier alias → type name.
type ColumnMap = Arc<HashMap<String, String>>;

/// Immutable snapshot: table alias → shared column map.
type Snapshot = HashMap<String, ColumnMap>;

/// Source of declared column types.
///
/// Implementations must be safe for concurrent readers; `refresh` replaces
/// the underlying snapshot atomically and bumps the generation counter so
/// that dependent caches can invalidate themselves.
pub trait SchemaRegistry: Send + Sync {
    /// Declared type name for the column, or `None` when the table or the
    /// qualifier is unknown.
    fn column_type(&self, table: &TableName, qualifier: &str) -> Option<String>;

    /// Reload the registry from its source, replacing the snapshot
    /// atomically.
    fn refresh(&self);

    /// Monotonic counter incremented by every `refresh`.
    fn generation(&self) -> u64;

    /// Lookup that tries the exact qualifier, then its upper-cased, then its
    /// lower-cased form.
    fn column_type_relaxed(&self, table: &TableName, qualifier: &str) -> Option<String> {
        if let Some(t) = self.column_type(table, qualifier) {
            return Some(t);
        }
        let upper = qualifier.to_uppercase();
        if upper != qualifier {
            if let Some(t) = self.column_type(table, &upper) {
                return Some(t);
            }
        }
        let lower = qualifier.to_lowercase();
        if lower != qualifier && lower != upper {
            if let Some(t) = self.column_type(table, &lower) {
                return Some(t);
            }
        }
        None
    }
}

/// Type names the loader recognizes.  Validation is soft: anything else is
/// kept verbatim with a warning, so a schema file can carry types this crate
/// learns about later.
static KNOWN_TYPES: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    HashSet::from([
        "TINYINT",
        "UNSIGNED_TINYINT",
        "SMALLINT",
        "UNSIGNED_SMALLINT",
        "INTEGER",
        "INT",
        "UNSIGNED_INT",
        "BIGINT",
        "LONG",
        "UNSIGNED_LONG",
        "FLOAT",
        "DOUBLE",
        "DECIMAL",
        "NUMERIC",
        "NUMBER",
        "CHAR",
        "VARCHAR",
        "STRING",
        "BINARY",
        "VARBINARY",
        "DATE",
        "TIME",
        "TIMESTAMP",
        "BOOLEAN",
        "BOOL",
        "ARRAY",
    ])
});

/// One table section of the schema document.
#[derive(Debug, Deserialize)]
struct TableSection {
    #[serde(default)]
    columns: HashMap<String, String>,
}

/// JSON-file-backed [`SchemaRegistry`] with hot reload.
pub struct JsonSchemaRegistry {
    source_path: PathBuf,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Canonical table name → resolved column map (including the short-name
    /// fallback).  Cleared on refresh.
    table_cache: RwLock<HashMap<String, Option<ColumnMap>>>,
    generation: AtomicU64,
}

impl JsonSchemaRegistry {
    /// Loads the registry from `path`.  Never fails; see the module docs for
    /// the failure policy.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let source_path = path.into();
        let snapshot = Arc::new(load_from_file(&source_path));
        Self {
            source_path,
            snapshot: RwLock::new(snapshot),
            table_cache: RwLock::new(HashMap::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Number of table aliases in the current snapshot.
    pub fn table_alias_count(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    fn resolve_columns(&self, canonical: &str) -> Option<ColumnMap> {
        let snapshot = self.snapshot.read().unwrap().clone();
        if let Some(cols) = snapshot.get(canonical) {
            return Some(cols.clone());
        }
        // Fall back to the short name after the namespace separator.
        let short = canonical.split_once(':').map(|(_, s)| s)?;
        if short.is_empty() {
            return None;
        }
        snapshot.get(short).cloned()
    }
}

impl SchemaRegistry for JsonSchemaRegistry {
    fn column_type(&self, table: &TableName, qualifier: &str) -> Option<String> {
        let canonical = table.canonical();
        if let Some(cached) = self.table_cache.read().unwrap().get(&canonical) {
            return cached.as_ref()?.get(qualifier).cloned();
        }
        let resolved = self.resolve_columns(&canonical);
        let result = resolved.as_ref().and_then(|cols| cols.get(qualifier).cloned());
        self.table_cache
            .write()
            .unwrap()
            .entry(canonical)
            .or_insert(resolved);
        result
    }

    fn refresh(&self) {
        let fresh = Arc::new(load_from_file(&self.source_path));
        *self.snapshot.write().unwrap() = fresh;
        self.table_cache.write().unwrap().clear();
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// Parses and builds an immutable snapshot.  Any failure yields an empty
/// snapshot after a warning.
fn load_from_file(path: &Path) -> Snapshot {
    let text = match std::fs::read_to_string(path) {
        Ok(text) => text,
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to read schema file, using an empty schema");
            return Snapshot::new();
        }
    };
    let root: HashMap<String, TableSection> = match serde_json::from_str(&text) {
        Ok(root) => root,
        Err(error) => {
            warn!(path = %path.display(), %error, "failed to parse schema file, using an empty schema");
            return Snapshot::new();
        }
    };
    if root.is_empty() {
        warn!(path = %path.display(), "schema file is empty, the registry will resolve nothing");
        return Snapshot::new();
    }
    build_snapshot(root, path)
}

fn build_snapshot(root: HashMap<String, TableSection>, path: &Path) -> Snapshot {
    let mut result = Snapshot::with_capacity(root.len() * 4);
    for (table, section) in root {
        let columns = normalize_columns(&table, section.columns, path);
        if columns.is_empty() {
            warn!(%table, path = %path.display(), "table section declares no usable columns, skipping");
            continue;
        }
        publish_table_aliases(&mut result, &table, Arc::new(columns), path);
    }
    result
}

/// Publishes the column map under original/upper/lower variants of the full
/// table name and of the short name after `':'`.
fn publish_table_aliases(result: &mut Snapshot, table: &str, columns: ColumnMap, path: &Path) {
    let mut seen = HashSet::with_capacity(6);
    let mut add = |result: &mut Snapshot, alias: String| {
        if alias.is_empty() || !seen.insert(alias.clone()) {
            return;
        }
        if let Some(prev) = result.insert(alias.clone(), columns.clone()) {
            if !Arc::ptr_eq(&prev, &columns) {
                warn!(
                    table,
                    %alias,
                    path = %path.display(),
                    "duplicate table alias in schema file, previous definition replaced"
                );
            }
        }
    };
    for name in alias_variants(table) {
        add(result, name);
    }
    if let Some((_, short)) = table.split_once(':') {
        for name in alias_variants(short) {
            add(result, name);
        }
    }
}

fn alias_variants(name: &str) -> Vec<String> {
    let mut out = Vec::with_capacity(3);
    out.push(name.to_string());
    out.push(name.to_uppercase());
    out.push(name.to_lowercase());
    out
}

/// Normalizes one `columns` section: trims names, upper-cases type names and
/// publishes every qualifier under its original/upper/lower forms without
/// overwriting earlier entries.
fn normalize_columns(
    table: &str,
    columns: HashMap<String, String>,
    path: &Path,
) -> HashMap<String, String> {
    let mut out = HashMap::with_capacity(columns.len() * 3);
    for (raw_qualifier, raw_type) in columns {
        let qualifier = raw_qualifier.trim();
        if qualifier.is_empty() {
            warn!(table, path = %path.display(), "skipping column with an empty name");
            continue;
        }
        let type_name = raw_type.trim();
        if type_name.is_empty() {
            warn!(table, qualifier, path = %path.display(), "skipping column with an empty type");
            continue;
        }
        let canonical_type = type_name.to_uppercase();
        if !KNOWN_TYPES.contains(canonical_type.as_str()) {
            warn!(
                table,
                qualifier,
                declared = %canonical_type,
                path = %path.display(),
                "unrecognized column type kept verbatim"
            );
        }
        for form in alias_variants(qualifier) {
            out.entry(form).or_insert_with(|| canonical_type.clone());
        }
    }
    out
}
