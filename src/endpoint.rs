//! The replication endpoint: the integration point the host database's WAL
//! shipping framework drives.
//!
//! Per batch, [`KafkaEndpoint::replicate`] groups each entry's cells by row
//! key without copying, optionally filters rows by cell timestamp, assembles
//! one JSON event per row and produces it keyed by the raw row-key bytes.  A
//! batch-scoped [`BatchSender`] bounds the number of unacknowledged sends
//! and performs the final strict flush whose outcome decides the boolean
//! acknowledgement to the host: `false` asks for a resubmission, so nothing
//! is acknowledged that the broker has not confirmed.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DecodeMode, EndpointConfig, Props};
use crate::decode::ValueDecoder;
use crate::error::EndpointError;
use crate::kafka::batch::BatchSender;
use crate::kafka::topics::TopicEnsurer;
use crate::kafka::{KafkaRecordSink, RecordSink};
use crate::payload::PayloadBuilder;
use crate::rowkey::RowKeySlice;
use crate::schema::JsonSchemaRegistry;
use crate::wal::{Cell, WalEntry};

/// Host-provided context for [`ReplicationEndpoint::init`].
pub struct ReplicationContext {
    props: Props,
}

impl ReplicationContext {
    pub fn new(props: Props) -> Self {
        Self { props }
    }

    pub fn configuration(&self) -> &Props {
        &self.props
    }
}

/// Lifecycle hooks the host framework invokes.
///
/// `replicate` returns `true` to acknowledge the batch; `false` asks the
/// host to resubmit it.
pub trait ReplicationEndpoint {
    fn init(&mut self, ctx: &ReplicationContext) -> Result<(), EndpointError>;
    fn start(&mut self);
    fn stop(&mut self);
    fn replicate(&mut self, batch: &[WalEntry<'_>]) -> bool;

    /// Identity used by the host for replication-loop detection.
    fn peer_uuid(&self) -> Option<Uuid> {
        None
    }
}

/// Everything `replicate` needs, built once in `init`.
struct Pipeline {
    config: Arc<EndpointConfig>,
    sink: Arc<dyn RecordSink>,
    payload: PayloadBuilder,
    ensurer: Option<TopicEnsurer>,
}

/// [`ReplicationEndpoint`] publishing WAL edits to Kafka as JSON events.
#[derive(Default)]
pub struct KafkaEndpoint {
    pipeline: Option<Pipeline>,
    started: bool,
}

impl KafkaEndpoint {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        config: Arc<EndpointConfig>,
        decoder: ValueDecoder,
        sink: Arc<dyn RecordSink>,
        ensurer: Option<TopicEnsurer>,
    ) -> Self {
        let payload = PayloadBuilder::new(decoder, config.clone());
        Self {
            pipeline: Some(Pipeline {
                config,
                sink,
                payload,
                ensurer,
            }),
            started: false,
        }
    }

    fn build_decoder(config: &EndpointConfig) -> ValueDecoder {
        match (config.decode_mode(), config.schema_path()) {
            (DecodeMode::Typed, Some(path)) => {
                info!(schema = %path.display(), "decoding mode: typed");
                ValueDecoder::typed(Arc::new(JsonSchemaRegistry::load(path.clone())))
            }
            _ => {
                info!("decoding mode: raw");
                ValueDecoder::raw()
            }
        }
    }
}

impl ReplicationEndpoint for KafkaEndpoint {
    fn init(&mut self, ctx: &ReplicationContext) -> Result<(), EndpointError> {
        let config = Arc::new(EndpointConfig::from_props(ctx.configuration())?);
        let sink: Arc<dyn RecordSink> =
            Arc::new(KafkaRecordSink::new(&config).map_err(EndpointError::Producer)?);
        let decoder = Self::build_decoder(&config);
        let payload = PayloadBuilder::new(decoder, config.clone());
        let ensurer = TopicEnsurer::create_if_enabled(&config).map_err(EndpointError::Admin)?;

        info!(
            bootstrap = config.bootstrap(),
            topic_pattern = config.topic_pattern(),
            family = config.family_name(),
            ensure_topics = config.ensure_topics(),
            "replication endpoint initialized"
        );
        self.pipeline = Some(Pipeline {
            config,
            sink,
            payload,
            ensurer,
        });
        Ok(())
    }

    fn start(&mut self) {
        self.started = true;
        info!("replication endpoint started");
    }

    fn stop(&mut self) {
        if let Some(pipeline) = &self.pipeline {
            if let Err(error) = pipeline.sink.flush(pipeline.config.await_timeout()) {
                warn!(%error, "final producer flush failed during stop");
            }
            if let Some(ensurer) = &pipeline.ensurer {
                debug!(state = %ensurer, "closing topic ensurer");
                ensurer.close();
            }
        }
        self.pipeline = None;
        self.started = false;
        info!("replication endpoint stopped");
    }

    fn replicate(&mut self, batch: &[WalEntry<'_>]) -> bool {
        let Some(pipeline) = &self.pipeline else {
            warn!("replicate invoked before init, rejecting batch");
            return false;
        };
        if batch.is_empty() {
            return true;
        }

        let config = &pipeline.config;
        let mut sender = BatchSender::with_flags(
            config.await_every(),
            config.await_timeout(),
            config.batch_counters_enabled(),
            config.batch_debug_on_failure(),
        );

        match pipeline.replicate_batch(batch, &mut sender) {
            Ok(()) => match sender.flush() {
                Ok(()) => true,
                Err(error) => {
                    error!(%error, "waiting for broker acknowledgements failed, batch will be resubmitted");
                    false
                }
            },
            Err(error) => {
                error!(%error, "batch processing failed, batch will be resubmitted");
                // Drain what can still be drained so the drop is quiet.
                let _ = sender.try_flush();
                false
            }
        }
    }
}

impl Pipeline {
    fn replicate_batch(
        &self,
        batch: &[WalEntry<'_>],
        sender: &mut BatchSender,
    ) -> AnyResult<()> {
        // Topic ensured most recently in this invocation; consecutive
        // entries of one table skip the ensurer entirely.
        let mut last_ensured: Option<String> = None;

        for entry in batch {
            let topic = self.config.topic_for(&entry.table);
            if let Some(ensurer) = &self.ensurer {
                if last_ensured.as_deref() != Some(topic.as_str()) {
                    ensurer.ensure_topic(&topic);
                    last_ensured = Some(topic.clone());
                }
            }

            let mut rows = group_cells_by_row(&entry.cells);
            if let Some(min_ts) = self.config.wal_min_ts() {
                let family = self.config.family();
                rows.retain(|(_, cells)| {
                    cells
                        .iter()
                        .any(|c| c.matches_family(family) && c.timestamp >= min_ts)
                });
            }

            for (row_key, cells) in &rows {
                let payload = self.payload.build_row_payload(
                    &entry.table,
                    cells,
                    Some(row_key),
                    entry.sequence_id,
                    entry.write_time,
                )?;
                let bytes = serde_json::to_vec(&payload)
                    .with_context(|| format!("serializing event for table {}", entry.table))?;
                let handle = self
                    .sink
                    .send(&topic, row_key.as_bytes(), &bytes)
                    .with_context(|| format!("producing to topic {topic}"))?;
                sender.add(handle);
            }
        }
        Ok(())
    }
}

/// Groups cells by row key, preserving first-appearance order.  Keys are
/// zero-copy slices over the batch buffers.
fn group_cells_by_row<'a>(cells: &[Cell<'a>]) -> Vec<(RowKeySlice<'a>, Vec<Cell<'a>>)> {
    let mut index: HashMap<RowKeySlice<'a>, usize> = HashMap::with_capacity(cells.len());
    let mut rows: Vec<(RowKeySlice<'a>, Vec<Cell<'a>>)> = Vec::new();
    for cell in cells {
        let key = RowKeySlice::whole(cell.row);
        match index.entry(key) {
            Entry::Occupied(slot) => rows[*slot.get()].1.push(*cell),
            Entry::Vacant(slot) => {
                slot.insert(rows.len());
                rows.push((key, vec![*cell]));
            }
        }
    }
    rows
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::EndpointConfigBuilder;
    use crate::kafka::topics::TopicCheck;
    use crate::test::{cell, entry, init_test_logger, MockAdmin, MockSink, SinkMode};
    use crate::wal::TableName;
    use serde_json::{json, Value};
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn config() -> EndpointConfigBuilder {
        EndpointConfigBuilder::new("broker:9092").include_rowkey(false)
    }

    fn endpoint_with(config: EndpointConfigBuilder, sink: Arc<MockSink>) -> KafkaEndpoint {
        KafkaEndpoint::for_tests(
            Arc::new(config.build().unwrap()),
            ValueDecoder::raw(),
            sink,
            None,
        )
    }

    fn parse(value: &[u8]) -> Value {
        serde_json::from_slice(value).unwrap()
    }

    #[test]
    fn raw_mode_end_to_end() {
        init_test_logger();
        let sink = MockSink::new();
        let mut endpoint = endpoint_with(config(), sink.clone());

        let table = TableName::new("ns", "TBL");
        let cells = vec![cell(b"row1", b"0", b"colX", Some(&[1, 2, 3, 4]), 100)];
        assert!(endpoint.replicate(&[entry(table, cells)]));

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].topic, "ns_TBL");
        assert_eq!(records[0].key, b"row1");
        let value = parse(&records[0].value);
        assert_eq!(value["colX"], json!([1, 2, 3, 4]));
        assert_eq!(value["event_version"], json!(100));
    }

    #[test]
    fn rows_are_grouped_in_first_appearance_order() {
        let sink = MockSink::new();
        let mut endpoint = endpoint_with(config(), sink.clone());

        let cells = vec![
            cell(b"r1", b"0", b"a", Some(b"1"), 1),
            cell(b"r2", b"0", b"b", Some(b"2"), 2),
            cell(b"r1", b"0", b"c", Some(b"3"), 3),
        ];
        assert!(endpoint.replicate(&[entry(TableName::new("ns", "T"), cells)]));

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].key, b"r1");
        assert_eq!(records[1].key, b"r2");
        let first = parse(&records[0].value);
        assert!(first.get("a").is_some() && first.get("c").is_some());
        assert_eq!(first["event_version"], json!(3));
    }

    #[test]
    fn wal_timestamp_filter_drops_stale_rows() {
        let sink = MockSink::new();
        let mut endpoint = endpoint_with(config().wal_min_ts(200), sink.clone());

        let cells = vec![cell(b"r1", b"0", b"a", Some(b"1"), 100)];
        assert!(endpoint.replicate(&[entry(TableName::new("ns", "T"), cells)]));
        assert_eq!(sink.sent_count(), 0);

        // A single fresh cell keeps the whole row.
        let cells = vec![
            cell(b"r2", b"0", b"a", Some(b"1"), 100),
            cell(b"r2", b"0", b"b", Some(b"2"), 250),
        ];
        assert!(endpoint.replicate(&[entry(TableName::new("ns", "T"), cells)]));
        assert_eq!(sink.sent_count(), 1);
        let records = sink.records.lock().unwrap();
        let value = parse(&records[0].value);
        assert!(value.get("a").is_some() && value.get("b").is_some());
    }

    #[test]
    fn filter_ignores_other_families() {
        let sink = MockSink::new();
        let mut endpoint = endpoint_with(config().wal_min_ts(200), sink.clone());
        // Fresh cell in a foreign family does not rescue the row.
        let cells = vec![
            cell(b"r1", b"other", b"x", Some(b"1"), 900),
            cell(b"r1", b"0", b"a", Some(b"1"), 100),
        ];
        assert!(endpoint.replicate(&[entry(TableName::new("ns", "T"), cells)]));
        assert_eq!(sink.sent_count(), 0);
    }

    #[test]
    fn delivery_failure_rejects_the_batch() {
        let sink = MockSink::new();
        sink.set_mode(SinkMode::FailDelivery);
        let mut endpoint = endpoint_with(config(), sink.clone());
        let cells = vec![cell(b"r", b"0", b"a", Some(b"1"), 1)];
        assert!(!endpoint.replicate(&[entry(TableName::new("ns", "T"), cells)]));
    }

    #[test]
    fn send_error_rejects_the_batch() {
        let sink = MockSink::new();
        sink.set_mode(SinkMode::RejectSend);
        let mut endpoint = endpoint_with(config(), sink.clone());
        let cells = vec![cell(b"r", b"0", b"a", Some(b"1"), 1)];
        assert!(!endpoint.replicate(&[entry(TableName::new("ns", "T"), cells)]));
    }

    #[test]
    fn acknowledgement_timeout_rejects_the_batch() {
        let sink = MockSink::new();
        sink.set_mode(SinkMode::Stall);
        let mut endpoint = endpoint_with(
            config().await_timeout(Duration::from_millis(50)),
            sink.clone(),
        );
        let cells = vec![cell(b"r", b"0", b"a", Some(b"1"), 1)];
        assert!(!endpoint.replicate(&[entry(TableName::new("ns", "T"), cells)]));
    }

    #[test]
    fn empty_batch_is_acknowledged() {
        let sink = MockSink::new();
        let mut endpoint = endpoint_with(config(), sink.clone());
        assert!(endpoint.replicate(&[]));
        assert_eq!(sink.sent_count(), 0);
    }

    #[test]
    fn replicate_before_init_is_rejected() {
        let mut endpoint = KafkaEndpoint::new();
        assert!(!endpoint.replicate(&[]));
        assert_eq!(endpoint.peer_uuid(), None);
    }

    #[test]
    fn decode_failure_rejects_the_batch() {
        use crate::test::MockRegistry;
        let sink = MockSink::new();
        let registry = MockRegistry::with_types(&[("d", "DECIMAL")]);
        let mut endpoint = KafkaEndpoint::for_tests(
            Arc::new(config().build().unwrap()),
            ValueDecoder::typed(Arc::new(registry)),
            sink.clone(),
            None,
        );
        let cells = vec![cell(b"r", b"0", b"d", Some(b"not-a-number"), 1)];
        assert!(!endpoint.replicate(&[entry(TableName::new("ns", "T"), cells)]));
        assert_eq!(sink.sent_count(), 0);
    }

    #[test]
    fn metadata_and_rowkey_flow_through_to_the_wire() {
        use crate::config::RowKeyEncoding;
        let sink = MockSink::new();
        let mut endpoint = endpoint_with(
            EndpointConfigBuilder::new("broker:9092")
                .include_meta(true)
                .include_meta_wal(true)
                .rowkey_encoding(RowKeyEncoding::Base64),
            sink.clone(),
        );

        let mut wal_entry = entry(
            TableName::new("ns", "TBL"),
            vec![cell(&[0x01, 0x02], b"0", b"c", Some(b"v"), 10)],
        );
        wal_entry.sequence_id = Some(77);
        wal_entry.write_time = Some(1_700_000_000_000);
        assert!(endpoint.replicate(&[wal_entry]));

        let records = sink.records.lock().unwrap();
        let value = parse(&records[0].value);
        assert_eq!(value["_table"], json!("ns:TBL"));
        assert_eq!(value["_cells_total"], json!(1));
        assert_eq!(value["rowkey_b64"], json!("AQI="));
        assert_eq!(value["_wal_seq"], json!(77));
        assert_eq!(value["_wal_write_time"], json!(1_700_000_000_000i64));
        assert!(value.get("rowkey_hex").is_none());
    }

    #[test]
    fn one_message_per_row_per_entry() {
        let sink = MockSink::new();
        let mut endpoint = endpoint_with(config(), sink.clone());
        let batch = vec![
            entry(
                TableName::new("ns", "T"),
                vec![
                    cell(b"r1", b"0", b"a", Some(b"1"), 1),
                    cell(b"r2", b"0", b"a", Some(b"1"), 1),
                ],
            ),
            // The same row key in a later entry is a separate event.
            entry(
                TableName::new("ns", "T"),
                vec![cell(b"r1", b"0", b"b", Some(b"2"), 2)],
            ),
        ];
        assert!(endpoint.replicate(&batch));
        assert_eq!(sink.sent_count(), 3);
    }

    #[test]
    fn consecutive_entries_reuse_the_ensured_topic() {
        let admin = MockAdmin::new();
        admin.set_describe("ns_T", TopicCheck::Exists);
        admin.set_describe("ns_U", TopicCheck::Exists);
        let calls = admin.calls();
        let ensurer = TopicEnsurer::with_admin(
            Box::new(admin),
            1,
            1,
            BTreeMap::new(),
            Duration::from_secs(10),
        );
        let sink = MockSink::new();
        let mut endpoint = KafkaEndpoint::for_tests(
            Arc::new(config().build().unwrap()),
            ValueDecoder::raw(),
            sink,
            Some(ensurer),
        );

        let batch = vec![
            entry(
                TableName::new("ns", "T"),
                vec![cell(b"r1", b"0", b"a", Some(b"1"), 1)],
            ),
            entry(
                TableName::new("ns", "T"),
                vec![cell(b"r2", b"0", b"a", Some(b"1"), 1)],
            ),
            entry(
                TableName::new("ns", "U"),
                vec![cell(b"r3", b"0", b"a", Some(b"1"), 1)],
            ),
        ];
        assert!(endpoint.replicate(&batch));
        // One describe for ns_T (second entry short-circuits), one for ns_U.
        assert_eq!(calls.describe_call_count(), 2);
    }

    #[test]
    fn grouping_preserves_order_and_content() {
        let cells = vec![
            cell(b"x", b"0", b"a", Some(b"1"), 1),
            cell(b"y", b"0", b"b", Some(b"2"), 2),
            cell(b"x", b"0", b"c", Some(b"3"), 3),
            cell(b"z", b"0", b"d", Some(b"4"), 4),
        ];
        let rows = group_cells_by_row(&cells);
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].0.as_bytes(), b"x");
        assert_eq!(rows[0].1.len(), 2);
        assert_eq!(rows[1].0.as_bytes(), b"y");
        assert_eq!(rows[2].0.as_bytes(), b"z");
    }

    #[test]
    fn stop_without_init_is_a_noop() {
        let mut endpoint = KafkaEndpoint::new();
        endpoint.start();
        endpoint.stop();
    }

    #[test]
    fn stop_tears_down_the_pipeline() {
        let sink = MockSink::new();
        let mut endpoint = endpoint_with(config(), sink);
        endpoint.start();
        endpoint.stop();
        assert!(!endpoint.replicate(&[]));
    }
}
