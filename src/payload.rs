//! Assembly of one outbound JSON event from the cells of one row.
//!
//! The payload is an insertion-ordered map, so the serialized JSON has a
//! stable key order: optional table metadata first, then the decoded columns
//! in cell order, then `event_version` and the optional `delete`, row-key
//! and WAL bookkeeping fields.

use std::str::from_utf8;
use std::sync::Arc;

use base64::prelude::{Engine, BASE64_STANDARD};
use serde_json::Value;

use crate::config::{EndpointConfig, RowKeyEncoding};
use crate::decode::{DecodeError, ValueDecoder};
use crate::rowkey::RowKeySlice;
use crate::wal::{Cell, TableName};

/// Insertion-ordered JSON object (`serde_json` is built with
/// `preserve_order`).
pub type Payload = serde_json::Map<String, Value>;

// Reserved payload keys.
const K_TABLE: &str = "_table";
const K_NAMESPACE: &str = "_namespace";
const K_QUALIFIER: &str = "_qualifier";
const K_CF: &str = "_cf";
const K_CELLS_TOTAL: &str = "_cells_total";
const K_CELLS_CF: &str = "_cells_cf";
const K_EVENT_VERSION: &str = "event_version";
const K_DELETE: &str = "delete";
const K_ROWKEY_HEX: &str = "rowkey_hex";
const K_ROWKEY_B64: &str = "rowkey_b64";
const K_WAL_SEQ: &str = "_wal_seq";
const K_WAL_WRITE_TIME: &str = "_wal_write_time";

/// Upper bound on the pre-sized capacity.
const MAX_CAPACITY: u128 = 1 << 30;

/// Initial map capacity for an expected number of entries, sized so the
/// target load factor of 3/4 is not exceeded: `1 + ceil(4 * target / 3)`,
/// where `target = max(estimated, hint)`.  Integer arithmetic only (widened
/// so the intermediate product cannot overflow), capped at `1 << 30`, never
/// below 1; monotonic in both arguments.
pub fn initial_capacity(estimated: usize, hint: usize) -> usize {
    let target = estimated.max(hint) as u128;
    if target == 0 {
        return 1;
    }
    let cap = 1 + (4 * target + 2) / 3;
    cap.min(MAX_CAPACITY) as usize
}

/// Aggregates accumulated over the target-family cells of one row.
#[derive(Default)]
struct CellStats {
    max_ts: i64,
    has_delete: bool,
    cf_cells: u64,
}

/// Builds the per-row payload map.  No side effects; all behavior switches
/// come from the immutable [`EndpointConfig`].
pub struct PayloadBuilder {
    decoder: ValueDecoder,
    config: Arc<EndpointConfig>,
}

impl PayloadBuilder {
    pub fn new(decoder: ValueDecoder, config: Arc<EndpointConfig>) -> Self {
        Self { decoder, config }
    }

    /// Assembles the event for one row.
    ///
    /// `cells` are all cells of the row (any family); only cells of the
    /// configured target family contribute.  `wal_seq` / `wal_write_time`
    /// are emitted only when present and non-negative, and only when WAL
    /// metadata is enabled together with table metadata.
    pub fn build_row_payload(
        &self,
        table: &TableName,
        cells: &[Cell<'_>],
        row_key: Option<&RowKeySlice<'_>>,
        wal_seq: Option<i64>,
        wal_write_time: Option<i64>,
    ) -> Result<Payload, DecodeError> {
        let include_meta = self.config.include_meta();
        let include_wal_meta = include_meta && self.config.include_meta_wal();
        let include_row_key = self.config.include_rowkey() && row_key.is_some();

        let cap = 1
            + cells.len()
            + if include_meta { 5 } else { 0 }
            + usize::from(include_row_key)
            + if include_wal_meta { 2 } else { 0 };
        let mut payload = Payload::with_capacity(initial_capacity(cap, 0));

        if include_meta {
            self.add_meta_fields(&mut payload, table, cells.len());
        }

        let stats = self.decode_cells(table, cells, &mut payload)?;

        if include_meta {
            payload.insert(K_CELLS_CF.into(), Value::from(stats.cf_cells));
        }
        payload.insert(K_EVENT_VERSION.into(), Value::from(stats.max_ts));
        if stats.has_delete {
            payload.insert(K_DELETE.into(), Value::Bool(true));
        }

        if include_row_key {
            if let Some(key) = row_key {
                self.add_row_key(&mut payload, key);
            }
        }

        if include_wal_meta {
            if let Some(seq) = wal_seq.filter(|v| *v >= 0) {
                payload.insert(K_WAL_SEQ.into(), Value::from(seq));
            }
            if let Some(ts) = wal_write_time.filter(|v| *v >= 0) {
                payload.insert(K_WAL_WRITE_TIME.into(), Value::from(ts));
            }
        }

        Ok(payload)
    }

    fn add_meta_fields(&self, payload: &mut Payload, table: &TableName, total_cells: usize) {
        payload.insert(K_TABLE.into(), Value::String(table.canonical()));
        payload.insert(K_NAMESPACE.into(), Value::String(table.namespace().to_string()));
        payload.insert(K_QUALIFIER.into(), Value::String(table.qualifier().to_string()));
        payload.insert(K_CF.into(), Value::String(self.config.family_name().to_string()));
        payload.insert(K_CELLS_TOTAL.into(), Value::from(total_cells as u64));
    }

    /// Decodes the target-family cells into `payload` and returns the row
    /// aggregates.  Tombstones set the delete flag and contribute no column.
    fn decode_cells(
        &self,
        table: &TableName,
        cells: &[Cell<'_>],
        payload: &mut Payload,
    ) -> Result<CellStats, DecodeError> {
        let mut stats = CellStats::default();
        let family = self.config.family();
        let serialize_nulls = self.config.serialize_nulls();

        for cell in cells {
            if !cell.matches_family(family) {
                continue;
            }
            stats.cf_cells += 1;
            if cell.timestamp > stats.max_ts {
                stats.max_ts = cell.timestamp;
            }
            if cell.tombstone {
                stats.has_delete = true;
                continue;
            }
            let decoded = self.decoder.decode(table, cell.qualifier, cell.value)?;
            if decoded.is_some() || serialize_nulls {
                // The qualifier string is materialized only when the column
                // actually enters the payload.
                let qualifier = match from_utf8(cell.qualifier) {
                    Ok(q) => q.to_string(),
                    Err(_) => String::from_utf8_lossy(cell.qualifier).into_owned(),
                };
                payload.insert(qualifier, decoded.unwrap_or(Value::Null));
            }
        }
        Ok(stats)
    }

    fn add_row_key(&self, payload: &mut Payload, key: &RowKeySlice<'_>) {
        match self.config.rowkey_encoding() {
            RowKeyEncoding::Base64 => {
                let encoded = if key.is_empty() {
                    String::new()
                } else {
                    BASE64_STANDARD.encode(key.as_bytes())
                };
                payload.insert(K_ROWKEY_B64.into(), Value::String(encoded));
            }
            RowKeyEncoding::Hex => {
                let encoded = if key.is_empty() {
                    String::new()
                } else {
                    hex::encode(key.as_bytes())
                };
                payload.insert(K_ROWKEY_HEX.into(), Value::String(encoded));
            }
        }
    }
}
