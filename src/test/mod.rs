//! Shared test fixtures: mock collaborators for the schema registry, the
//! record sink and the broker admin surface, plus builders for WAL cells.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::kafka::topics::{CreateOutcome, NewTopicSpec, TopicAdmin, TopicCheck};
use crate::kafka::{DeliveryHandle, RecordSink};
use crate::schema::SchemaRegistry;
use crate::wal::{Cell, TableName, WalEntry};

pub(crate) fn init_test_logger() {
    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .with(
            EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new("info")).unwrap(),
        )
        .try_init();
}

pub(crate) fn cell<'a>(
    row: &'a [u8],
    family: &'a [u8],
    qualifier: &'a [u8],
    value: Option<&'a [u8]>,
    timestamp: i64,
) -> Cell<'a> {
    Cell {
        row,
        family,
        qualifier,
        value,
        timestamp,
        tombstone: false,
    }
}

pub(crate) fn entry<'a>(table: TableName, cells: Vec<Cell<'a>>) -> WalEntry<'a> {
    WalEntry {
        table,
        sequence_id: None,
        write_time: None,
        cells,
    }
}

/// Registry over a fixed qualifier → type table, counting lookups.
pub(crate) struct MockRegistry {
    types: HashMap<String, String>,
    lookups: AtomicUsize,
    generation: AtomicU64,
}

impl MockRegistry {
    pub fn with_types(types: &[(&str, &str)]) -> Self {
        Self {
            types: types
                .iter()
                .map(|(q, t)| (q.to_string(), t.to_string()))
                .collect(),
            lookups: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
        }
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::Relaxed)
    }
}

impl SchemaRegistry for MockRegistry {
    fn column_type(&self, _table: &TableName, qualifier: &str) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        self.types.get(qualifier).cloned()
    }

    fn refresh(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}

/// How a [`MockSink`] resolves the handles it returns.
#[derive(Clone, Copy, PartialEq, Eq)]
pub(crate) enum SinkMode {
    /// Every record acknowledges immediately.
    Ack,
    /// Every record fails delivery.
    FailDelivery,
    /// Handles never resolve.
    Stall,
    /// `send` itself errors.
    RejectSend,
}

pub(crate) struct SentRecord {
    pub topic: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// In-memory [`RecordSink`] capturing everything that was produced.
pub(crate) struct MockSink {
    pub records: Mutex<Vec<SentRecord>>,
    mode: Mutex<SinkMode>,
}

impl MockSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            records: Mutex::new(Vec::new()),
            mode: Mutex::new(SinkMode::Ack),
        })
    }

    pub fn set_mode(&self, mode: SinkMode) {
        *self.mode.lock().unwrap() = mode;
    }

    pub fn sent_count(&self) -> usize {
        self.records.lock().unwrap().len()
    }
}

impl RecordSink for MockSink {
    fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<DeliveryHandle, KafkaError> {
        let mode = *self.mode.lock().unwrap();
        if mode == SinkMode::RejectSend {
            return Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull));
        }
        self.records.lock().unwrap().push(SentRecord {
            topic: topic.to_string(),
            key: key.to_vec(),
            value: value.to_vec(),
        });
        Ok(match mode {
            SinkMode::Ack => DeliveryHandle::settled(Ok((0, 0))),
            SinkMode::FailDelivery => DeliveryHandle::settled(Err(KafkaError::MessageProduction(
                RDKafkaErrorCode::MessageTimedOut,
            ))),
            SinkMode::Stall => {
                let (notifier, handle) = DeliveryHandle::pending();
                std::mem::forget(notifier);
                handle
            }
            SinkMode::RejectSend => unreachable!(),
        })
    }

    fn flush(&self, _timeout: Duration) -> Result<(), KafkaError> {
        Ok(())
    }
}

struct MockAdminState {
    describe_outcomes: Mutex<HashMap<String, TopicCheck>>,
    create_outcomes: Mutex<HashMap<String, CreateOutcome>>,
    describe_calls: Mutex<Vec<Vec<String>>>,
    create_calls: Mutex<Vec<Vec<NewTopicSpec>>>,
}

/// Scripted [`TopicAdmin`]: per-topic outcomes with defaults (`Missing` for
/// describe, `Created` for create) and a full call log.
pub(crate) struct MockAdmin {
    state: Arc<MockAdminState>,
}

/// Read-side view of a [`MockAdmin`] call log, usable after the admin moved
/// into a `TopicEnsurer`.
pub(crate) struct MockAdminCalls {
    state: Arc<MockAdminState>,
}

impl MockAdmin {
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockAdminState {
                describe_outcomes: Mutex::new(HashMap::new()),
                create_outcomes: Mutex::new(HashMap::new()),
                describe_calls: Mutex::new(Vec::new()),
                create_calls: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn set_describe(&self, topic: &str, check: TopicCheck) {
        self.state
            .describe_outcomes
            .lock()
            .unwrap()
            .insert(topic.to_string(), check);
    }

    pub fn set_create(&self, topic: &str, outcome: CreateOutcome) {
        self.state
            .create_outcomes
            .lock()
            .unwrap()
            .insert(topic.to_string(), outcome);
    }

    pub fn calls(&self) -> MockAdminCalls {
        MockAdminCalls {
            state: self.state.clone(),
        }
    }
}

impl MockAdminCalls {
    pub fn describe_call_count(&self) -> usize {
        self.state.describe_calls.lock().unwrap().len()
    }

    pub fn describe_call(&self, index: usize) -> Vec<String> {
        self.state.describe_calls.lock().unwrap()[index].clone()
    }

    pub fn create_call_count(&self) -> usize {
        self.state.create_calls.lock().unwrap().len()
    }

    pub fn create_call(&self, index: usize) -> Vec<String> {
        self.state.create_calls.lock().unwrap()[index]
            .iter()
            .map(|spec| spec.name.clone())
            .collect()
    }

    pub fn create_spec(&self, call: usize, index: usize) -> NewTopicSpec {
        self.state.create_calls.lock().unwrap()[call][index].clone()
    }
}

impl TopicAdmin for MockAdmin {
    fn describe_topics(&self, topics: &[String]) -> Vec<(String, TopicCheck)> {
        self.state
            .describe_calls
            .lock()
            .unwrap()
            .push(topics.to_vec());
        let outcomes = self.state.describe_outcomes.lock().unwrap();
        topics
            .iter()
            .map(|t| {
                (
                    t.clone(),
                    outcomes.get(t).cloned().unwrap_or(TopicCheck::Missing),
                )
            })
            .collect()
    }

    fn create_topics(&self, specs: &[NewTopicSpec]) -> Vec<(String, CreateOutcome)> {
        self.state
            .create_calls
            .lock()
            .unwrap()
            .push(specs.to_vec());
        let outcomes = self.state.create_outcomes.lock().unwrap();
        specs
            .iter()
            .map(|spec| {
                (
                    spec.name.clone(),
                    outcomes
                        .get(&spec.name)
                        .cloned()
                        .unwrap_or(CreateOutcome::Created),
                )
            })
            .collect()
    }
}
