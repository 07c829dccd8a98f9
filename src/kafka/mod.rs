//! Kafka-facing plumbing: the producer seam, per-record delivery handles,
//! batched acknowledgement waiting and topic lifecycle management.

pub mod batch;
pub mod topics;

use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use rdkafka::{
    config::FromClientConfigAndContext,
    error::KafkaError,
    producer::{BaseRecord, DeliveryResult, Producer, ProducerContext, ThreadedProducer},
    ClientConfig, ClientContext,
};
use tracing::{debug, warn};

use crate::config::EndpointConfig;

/// Terminal outcome of one produced record: `(partition, offset)` on
/// acknowledgement, the producer error otherwise.
pub type DeliveryOutcome = Result<(i32, i64), KafkaError>;

/// One observation of a [`DeliveryHandle`].
#[derive(Debug)]
pub enum HandleWait {
    /// The record reached a terminal state.
    Ready(DeliveryOutcome),
    /// Nothing arrived within the allotted time.
    TimedOut,
    /// The producer side went away without reporting an outcome.
    Disconnected,
}

/// Completion handle for a single produced record.
///
/// The outcome is memoized on first receipt, so a handle can be awaited
/// again after a failed flush pass; repeated waits observe the same
/// terminal outcome.
pub struct DeliveryHandle {
    rx: Receiver<DeliveryOutcome>,
    settled: Option<DeliveryOutcome>,
}

/// Producer-side counterpart of a [`DeliveryHandle`].
pub struct DeliveryNotifier {
    tx: Sender<DeliveryOutcome>,
}

impl DeliveryNotifier {
    /// Reports the terminal outcome.  Dropping the notifier without calling
    /// this leaves the handle disconnected, which waiters treat as failure.
    pub fn complete(self, outcome: DeliveryOutcome) {
        let _ = self.tx.send(outcome);
    }
}

impl DeliveryHandle {
    /// An unresolved handle and the notifier that settles it.
    pub fn pending() -> (DeliveryNotifier, DeliveryHandle) {
        let (tx, rx) = bounded(1);
        (DeliveryNotifier { tx }, DeliveryHandle { rx, settled: None })
    }

    /// A handle that already carries its terminal outcome.
    pub fn settled(outcome: DeliveryOutcome) -> DeliveryHandle {
        let (notifier, handle) = Self::pending();
        notifier.complete(outcome);
        handle
    }

    /// Waits up to `timeout` for the terminal outcome.
    pub fn wait_timeout(&mut self, timeout: Duration) -> HandleWait {
        if let Some(outcome) = &self.settled {
            return HandleWait::Ready(outcome.clone());
        }
        match self.rx.recv_timeout(timeout) {
            Ok(outcome) => {
                self.settled = Some(outcome.clone());
                HandleWait::Ready(outcome)
            }
            Err(RecvTimeoutError::Timeout) => HandleWait::TimedOut,
            Err(RecvTimeoutError::Disconnected) => HandleWait::Disconnected,
        }
    }
}

/// Outbound record sink: the producer surface the endpoint writes to.
///
/// `send` must be non-blocking apart from local queueing; the returned
/// handle resolves when the broker acknowledges (or rejects) the record.
pub trait RecordSink: Send + Sync {
    fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<DeliveryHandle, KafkaError>;

    /// Best-effort producer flush, used during shutdown.
    fn flush(&self, timeout: Duration) -> Result<(), KafkaError>;
}

/// Producer context that resolves the per-record delivery channel from the
/// delivery callback.
struct SinkContext;

/// Carries the notifier through librdkafka to the delivery callback.
struct DeliverySlot {
    tx: Sender<DeliveryOutcome>,
}

impl ClientContext for SinkContext {
    fn error(&self, error: KafkaError, reason: &str) {
        warn!(%error, reason, "kafka producer error");
    }
}

impl ProducerContext for SinkContext {
    type DeliveryOpaque = Box<DeliverySlot>;

    fn delivery(&self, delivery_result: &DeliveryResult<'_>, slot: Self::DeliveryOpaque) {
        use rdkafka::message::Message;
        let outcome = match delivery_result {
            Ok(message) => Ok((message.partition(), message.offset())),
            Err((error, _message)) => Err(error.clone()),
        };
        // The waiting side may have given up already; a closed channel is
        // not an error here.
        let _ = slot.tx.send(outcome);
    }
}

/// Reliability-leaning producer defaults.  Applied only when the
/// corresponding `producer.config.*` option is absent, so operators can
/// trade durability for throughput explicitly.
const PRODUCER_DEFAULTS: &[(&str, &str)] = &[
    ("enable.idempotence", "true"),
    ("acks", "all"),
    ("retries", "2147483647"),
    ("delivery.timeout.ms", "180000"),
    ("linger.ms", "50"),
    ("batch.size", "65536"),
    ("compression.type", "snappy"),
    // One request in flight keeps records ordered across retries.
    ("max.in.flight.requests.per.connection", "1"),
];

/// Assembles the rdkafka client configuration for the producer: bootstrap
/// servers, derived client id, `producer.config.*` pass-through options and
/// the reliability defaults above.
pub(crate) fn producer_client_config(config: &EndpointConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config.set("bootstrap.servers", config.bootstrap());
    client_config.set("client.id", config.producer_client_id());
    for (key, value) in config.producer_options() {
        client_config.set(key, value);
    }
    for (key, value) in PRODUCER_DEFAULTS {
        if client_config.get(key).is_none() {
            client_config.set(*key, *value);
        }
    }
    client_config
}

/// [`RecordSink`] over an rdkafka [`ThreadedProducer`].
pub struct KafkaRecordSink {
    producer: ThreadedProducer<SinkContext>,
}

impl KafkaRecordSink {
    pub fn new(config: &EndpointConfig) -> Result<Self, KafkaError> {
        let client_config = producer_client_config(config);
        debug!(
            bootstrap = config.bootstrap(),
            client_id = config.producer_client_id(),
            "starting kafka producer"
        );
        let producer = ThreadedProducer::from_config_and_context(&client_config, SinkContext)?;
        Ok(Self { producer })
    }
}

impl RecordSink for KafkaRecordSink {
    fn send(&self, topic: &str, key: &[u8], value: &[u8]) -> Result<DeliveryHandle, KafkaError> {
        let (tx, rx) = bounded(1);
        let record = BaseRecord::with_opaque_to(topic, Box::new(DeliverySlot { tx }))
            .key(key)
            .payload(value);
        self.producer.send(record).map_err(|(error, _record)| error)?;
        Ok(DeliveryHandle { rx, settled: None })
    }

    fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::EndpointConfigBuilder;
    use rdkafka::types::RDKafkaErrorCode;

    #[test]
    fn producer_config_applies_reliability_defaults() {
        let config = EndpointConfigBuilder::new("broker:9092").build().unwrap();
        let client_config = producer_client_config(&config);
        assert_eq!(client_config.get("bootstrap.servers"), Some("broker:9092"));
        assert_eq!(client_config.get("enable.idempotence"), Some("true"));
        assert_eq!(client_config.get("acks"), Some("all"));
        assert_eq!(
            client_config.get("max.in.flight.requests.per.connection"),
            Some("1")
        );
    }

    #[test]
    fn pass_through_options_override_the_defaults() {
        let config = EndpointConfigBuilder::new("broker:9092")
            .producer_options(
                [
                    ("acks".to_string(), "1".to_string()),
                    ("linger.ms".to_string(), "5".to_string()),
                ]
                .into_iter()
                .collect(),
            )
            .build()
            .unwrap();
        let client_config = producer_client_config(&config);
        assert_eq!(client_config.get("acks"), Some("1"));
        assert_eq!(client_config.get("linger.ms"), Some("5"));
        assert_eq!(client_config.get("compression.type"), Some("snappy"));
    }

    #[test]
    fn settled_handle_resolves_immediately() {
        let mut handle = DeliveryHandle::settled(Ok((0, 42)));
        match handle.wait_timeout(Duration::from_millis(1)) {
            HandleWait::Ready(Ok((0, 42))) => {}
            other => panic!("unexpected wait result: {other:?}"),
        }
    }

    #[test]
    fn outcome_is_memoized_across_waits() {
        let (notifier, mut handle) = DeliveryHandle::pending();
        notifier.complete(Err(KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageTimedOut,
        )));
        for _ in 0..3 {
            match handle.wait_timeout(Duration::from_millis(1)) {
                HandleWait::Ready(Err(_)) => {}
                other => panic!("unexpected wait result: {other:?}"),
            }
        }
    }

    #[test]
    fn pending_handle_times_out() {
        let (_notifier, mut handle) = DeliveryHandle::pending();
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(5)),
            HandleWait::TimedOut
        ));
    }

    #[test]
    fn dropped_notifier_reads_as_disconnected() {
        let (notifier, mut handle) = DeliveryHandle::pending();
        drop(notifier);
        assert!(matches!(
            handle.wait_timeout(Duration::from_millis(5)),
            HandleWait::Disconnected
        ));
    }
}
