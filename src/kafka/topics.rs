//! Topic existence checks and creation against the broker admin API.
//!
//! [`TopicEnsurer`] guarantees at-least-once confirmation that a topic
//! exists before records are produced to it, while keeping admin traffic
//! low: confirmed topics are cached for the process lifetime, and topics
//! whose state could not be determined (timeouts, transport errors) enter a
//! jittered cool-down before the next attempt.
//!
//! The ensurer never alters existing topics; partitions, replication and
//! per-topic configs apply only when a topic is created here.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt::{self, Display, Formatter};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use futures::executor::block_on;
use rand::rngs::OsRng;
use rand::RngCore;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use tracing::{debug, info, warn};

use crate::config::EndpointConfig;

/// Broker-mandated ceiling on topic name length.
pub const TOPIC_NAME_MAX_LEN: usize = 249;

/// Topic config keys surfaced in the creation log summary.
const SUMMARY_KEYS: [&str; 4] = [
    "retention.ms",
    "cleanup.policy",
    "compression.type",
    "min.insync.replicas",
];

/// Outcome of an existence check for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicCheck {
    Exists,
    Missing,
    /// The state could not be determined (timeout, transport, ACL, ...).
    Unknown(String),
}

/// Outcome of a creation attempt for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome {
    Created,
    /// Lost a creation race; the topic exists now, which is all we wanted.
    AlreadyExists,
    Failed(String),
}

/// Creation parameters for one topic.
#[derive(Debug, Clone)]
pub struct NewTopicSpec {
    pub name: String,
    pub partitions: i32,
    pub replication: i32,
    pub configs: BTreeMap<String, String>,
}

/// Admin-side broker surface consumed by the ensurer.  One call covers a
/// whole batch of topics and reports a per-topic outcome.
pub trait TopicAdmin: Send + Sync {
    fn describe_topics(&self, topics: &[String]) -> Vec<(String, TopicCheck)>;
    fn create_topics(&self, specs: &[NewTopicSpec]) -> Vec<(String, CreateOutcome)>;

    /// Release the underlying client.  Default: nothing to release.
    fn close(&self) {}
}

/// [`TopicAdmin`] over an rdkafka [`AdminClient`].
pub struct KafkaTopicAdmin {
    admin: AdminClient<DefaultClientContext>,
    timeout: Duration,
}

impl KafkaTopicAdmin {
    pub fn new(config: &EndpointConfig) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();
        client_config.set("bootstrap.servers", config.bootstrap());
        client_config.set("client.id", config.admin_client_id());
        client_config.set(
            "request.timeout.ms",
            config.admin_timeout().as_millis().to_string(),
        );
        let admin = client_config.create()?;
        Ok(Self {
            admin,
            timeout: config.admin_timeout(),
        })
    }
}

impl TopicAdmin for KafkaTopicAdmin {
    fn describe_topics(&self, topics: &[String]) -> Vec<(String, TopicCheck)> {
        topics
            .iter()
            .map(|topic| {
                let check = match self.admin.inner().fetch_metadata(Some(topic), self.timeout) {
                    Ok(metadata) => match metadata.topics().first() {
                        Some(t) => match t.error() {
                            None => TopicCheck::Exists,
                            Some(err) => {
                                let code = RDKafkaErrorCode::from(err);
                                if code == RDKafkaErrorCode::UnknownTopicOrPartition {
                                    TopicCheck::Missing
                                } else {
                                    TopicCheck::Unknown(code.to_string())
                                }
                            }
                        },
                        None => TopicCheck::Unknown("empty metadata response".to_string()),
                    },
                    Err(error) => TopicCheck::Unknown(error.to_string()),
                };
                (topic.clone(), check)
            })
            .collect()
    }

    fn create_topics(&self, specs: &[NewTopicSpec]) -> Vec<(String, CreateOutcome)> {
        let new_topics: Vec<NewTopic<'_>> = specs
            .iter()
            .map(|spec| {
                let mut topic = NewTopic::new(
                    &spec.name,
                    spec.partitions,
                    TopicReplication::Fixed(spec.replication),
                );
                for (key, value) in &spec.configs {
                    topic = topic.set(key, value);
                }
                topic
            })
            .collect();
        let options = AdminOptions::new().request_timeout(Some(self.timeout));
        match block_on(self.admin.create_topics(new_topics.iter(), &options)) {
            Ok(results) => results
                .into_iter()
                .map(|result| match result {
                    Ok(name) => (name, CreateOutcome::Created),
                    Err((name, code)) => {
                        if code == RDKafkaErrorCode::TopicAlreadyExists {
                            (name, CreateOutcome::AlreadyExists)
                        } else {
                            (name, CreateOutcome::Failed(code.to_string()))
                        }
                    }
                })
                .collect(),
            Err(error) => specs
                .iter()
                .map(|spec| (spec.name.clone(), CreateOutcome::Failed(error.to_string())))
                .collect(),
        }
    }

    fn close(&self) {
        debug!("releasing kafka admin client");
    }
}

/// Counter snapshot keys follow the `ensure.*` / `exists.*` / `create.*`
/// naming of the metrics accessor.
#[derive(Default)]
struct EnsurerCounters {
    invocations: AtomicU64,
    cache_hits: AtomicU64,
    exists_true: AtomicU64,
    exists_false: AtomicU64,
    exists_unknown: AtomicU64,
    create_ok: AtomicU64,
    create_race: AtomicU64,
    create_fail: AtomicU64,
}

/// Idempotent topic existence/creation with caching and failure cool-down.
pub struct TopicEnsurer {
    admin: Box<dyn TopicAdmin>,
    partitions: i32,
    replication: i32,
    topic_configs: BTreeMap<String, String>,
    unknown_backoff: Duration,
    ensured: RwLock<HashSet<String>>,
    unknown_until: Mutex<HashMap<String, Instant>>,
    counters: EnsurerCounters,
}

impl TopicEnsurer {
    /// Builds the ensurer when `topic.ensure` is enabled; `None` otherwise.
    pub fn create_if_enabled(config: &EndpointConfig) -> Result<Option<Self>, KafkaError> {
        if !config.ensure_topics() {
            return Ok(None);
        }
        let admin = KafkaTopicAdmin::new(config)?;
        Ok(Some(Self::with_admin(
            Box::new(admin),
            config.topic_partitions(),
            config.topic_replication(),
            config.topic_configs().clone(),
            config.unknown_backoff(),
        )))
    }

    pub fn with_admin(
        admin: Box<dyn TopicAdmin>,
        partitions: i32,
        replication: i32,
        topic_configs: BTreeMap<String, String>,
        unknown_backoff: Duration,
    ) -> Self {
        let partitions = if partitions < 1 {
            warn!(partitions, "invalid partition count, forcing 1");
            1
        } else {
            partitions
        };
        let replication = if replication < 1 {
            warn!(replication, "invalid replication factor, forcing 1");
            1
        } else {
            replication
        };
        Self {
            admin,
            partitions,
            replication,
            topic_configs,
            unknown_backoff,
            ensured: RwLock::new(HashSet::new()),
            unknown_until: Mutex::new(HashMap::new()),
            counters: EnsurerCounters::default(),
        }
    }

    /// Ensures one topic exists, creating it when missing.  Never fails:
    /// uncertain outcomes only schedule a cool-down.
    pub fn ensure_topic(&self, topic: &str) {
        self.counters.invocations.fetch_add(1, Ordering::Relaxed);
        let topic = topic.trim();
        if topic.is_empty() {
            warn!("empty topic name, skipping ensure");
            return;
        }
        if !is_valid_topic_name(topic) {
            warn!(
                topic,
                max_len = TOPIC_NAME_MAX_LEN,
                "invalid topic name: allowed are [A-Za-z0-9._-], 1..=249 chars, not '.' or '..'"
            );
            return;
        }
        if self.cache_hit(topic) || self.backoff_active(topic) {
            return;
        }

        let (_, check) = self
            .admin
            .describe_topics(&[topic.to_string()])
            .into_iter()
            .next()
            .unwrap_or_else(|| (topic.to_string(), TopicCheck::Unknown("no response".into())));
        match check {
            TopicCheck::Exists => {
                self.counters.exists_true.fetch_add(1, Ordering::Relaxed);
                self.mark_ensured(topic);
                debug!(topic, "topic already exists");
            }
            TopicCheck::Unknown(reason) => {
                self.counters.exists_unknown.fetch_add(1, Ordering::Relaxed);
                self.schedule_unknown(topic);
                debug!(topic, %reason, "could not determine topic state, backing off");
            }
            TopicCheck::Missing => {
                self.counters.exists_false.fetch_add(1, Ordering::Relaxed);
                let spec = self.new_topic_spec(topic);
                let outcome = self
                    .admin
                    .create_topics(&[spec])
                    .into_iter()
                    .next()
                    .map(|(_, outcome)| outcome)
                    .unwrap_or_else(|| CreateOutcome::Failed("no response".into()));
                self.record_create_outcome(topic, outcome);
            }
        }
    }

    /// Ensure plus a definite-existence answer.  `true` only when the topic
    /// is known to exist (cached, confirmed or created just now).
    pub fn ensure_topic_ok(&self, topic: &str) -> bool {
        let trimmed = topic.trim();
        if trimmed.is_empty() {
            return false;
        }
        if self.is_ensured(trimmed) {
            return true;
        }
        self.ensure_topic(trimmed);
        self.is_ensured(trimmed)
    }

    /// Batch ensure with one describe and one create round-trip for the
    /// topics that need them.
    pub fn ensure_topics(&self, topics: &[String]) {
        let to_check = self.normalize_candidates(topics);
        if to_check.is_empty() {
            return;
        }

        let mut missing = Vec::with_capacity(to_check.len());
        for (topic, check) in self.admin.describe_topics(&to_check) {
            match check {
                TopicCheck::Exists => {
                    self.counters.exists_true.fetch_add(1, Ordering::Relaxed);
                    self.mark_ensured(&topic);
                    debug!(topic, "topic already exists (batch)");
                }
                TopicCheck::Missing => {
                    self.counters.exists_false.fetch_add(1, Ordering::Relaxed);
                    missing.push(topic);
                }
                TopicCheck::Unknown(reason) => {
                    self.counters.exists_unknown.fetch_add(1, Ordering::Relaxed);
                    self.schedule_unknown(&topic);
                    warn!(%topic, %reason, "could not determine topic state (batch)");
                }
            }
        }
        if missing.is_empty() {
            return;
        }

        let specs: Vec<NewTopicSpec> = missing.iter().map(|t| self.new_topic_spec(t)).collect();
        for (topic, outcome) in self.admin.create_topics(&specs) {
            self.record_create_outcome(&topic, outcome);
        }
    }

    /// Trim, validate, drop cached and cooling-down topics; preserves the
    /// first-appearance order of the remainder.
    fn normalize_candidates(&self, topics: &[String]) -> Vec<String> {
        let mut seen = HashSet::with_capacity(topics.len());
        let mut to_check = Vec::with_capacity(topics.len());
        for raw in topics {
            let topic = raw.trim();
            if topic.is_empty() || !seen.insert(topic.to_string()) {
                continue;
            }
            if !is_valid_topic_name(topic) {
                warn!(
                    topic,
                    max_len = TOPIC_NAME_MAX_LEN,
                    "invalid topic name: allowed are [A-Za-z0-9._-], 1..=249 chars, not '.' or '..'"
                );
            } else if self.cache_hit(topic) || self.backoff_active(topic) {
                // Covered already; counters updated inside the helpers.
            } else {
                to_check.push(topic.to_string());
            }
        }
        to_check
    }

    fn record_create_outcome(&self, topic: &str, outcome: CreateOutcome) {
        match outcome {
            CreateOutcome::Created => {
                self.counters.create_ok.fetch_add(1, Ordering::Relaxed);
                self.mark_ensured(topic);
                info!(
                    topic,
                    partitions = self.partitions,
                    replication = self.replication,
                    configs = %self.summarize_topic_configs(),
                    "created topic"
                );
            }
            CreateOutcome::AlreadyExists => {
                self.counters.create_race.fetch_add(1, Ordering::Relaxed);
                self.mark_ensured(topic);
                debug!(topic, "topic created concurrently elsewhere");
            }
            CreateOutcome::Failed(reason) => {
                self.counters.create_fail.fetch_add(1, Ordering::Relaxed);
                warn!(topic, %reason, "failed to create topic");
            }
        }
    }

    fn new_topic_spec(&self, topic: &str) -> NewTopicSpec {
        NewTopicSpec {
            name: topic.to_string(),
            partitions: self.partitions,
            replication: self.replication,
            configs: self.topic_configs.clone(),
        }
    }

    pub fn is_ensured(&self, topic: &str) -> bool {
        self.ensured.read().unwrap().contains(topic)
    }

    fn cache_hit(&self, topic: &str) -> bool {
        if self.is_ensured(topic) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!(topic, "topic confirmed earlier, skipping ensure");
            true
        } else {
            false
        }
    }

    fn mark_ensured(&self, topic: &str) {
        self.ensured.write().unwrap().insert(topic.to_string());
        self.unknown_until.lock().unwrap().remove(topic);
    }

    /// `true` while the topic sits in its unknown-state cool-down; expired
    /// entries are removed on the way.
    fn backoff_active(&self, topic: &str) -> bool {
        let mut map = self.unknown_until.lock().unwrap();
        match map.get(topic) {
            None => false,
            Some(until) => {
                let now = Instant::now();
                if now < *until {
                    debug!(
                        topic,
                        remaining_ms = (*until - now).as_millis() as u64,
                        "skipping ensure during unknown-state backoff"
                    );
                    true
                } else {
                    map.remove(topic);
                    false
                }
            }
        }
    }

    fn schedule_unknown(&self, topic: &str) {
        let delay = jittered_backoff(self.unknown_backoff);
        self.unknown_until
            .lock()
            .unwrap()
            .insert(topic.to_string(), Instant::now() + delay);
    }

    /// Compact `key=value` list of the well-known creation configs, with a
    /// `+N more` tail for the rest.
    fn summarize_topic_configs(&self) -> String {
        if self.topic_configs.is_empty() {
            return "none".to_string();
        }
        let mut parts = Vec::with_capacity(SUMMARY_KEYS.len() + 1);
        let mut known = 0usize;
        for key in SUMMARY_KEYS {
            if let Some(value) = self.topic_configs.get(key) {
                parts.push(format!("{key}={value}"));
                known += 1;
            }
        }
        let others = self.topic_configs.len() - known;
        if others > 0 {
            parts.push(format!("+{others} more"));
        }
        parts.join(", ")
    }

    /// Counter snapshot for diagnostics.
    pub fn metrics(&self) -> BTreeMap<&'static str, u64> {
        let c = &self.counters;
        BTreeMap::from([
            ("ensure.invocations", c.invocations.load(Ordering::Relaxed)),
            ("ensure.cache.hit", c.cache_hits.load(Ordering::Relaxed)),
            ("exists.true", c.exists_true.load(Ordering::Relaxed)),
            ("exists.false", c.exists_false.load(Ordering::Relaxed)),
            ("exists.unknown", c.exists_unknown.load(Ordering::Relaxed)),
            ("create.ok", c.create_ok.load(Ordering::Relaxed)),
            ("create.race", c.create_race.load(Ordering::Relaxed)),
            ("create.fail", c.create_fail.load(Ordering::Relaxed)),
            (
                "unknown.backoff.size",
                self.unknown_until.lock().unwrap().len() as u64,
            ),
        ])
    }

    pub fn close(&self) {
        self.admin.close();
    }
}

impl Display for TopicEnsurer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let m = self.metrics();
        write!(
            f,
            "TopicEnsurer{{partitions={}, replication={}, backoff_ms={}, ensured={}, metrics={m:?}}}",
            self.partitions,
            self.replication,
            self.unknown_backoff.as_millis(),
            self.ensured.read().unwrap().len(),
        )
    }
}

/// Broker topic-name rules, checked without a regex: 1..=249 characters
/// from `[A-Za-z0-9._-]`, and not the reserved `"."` / `".."`.
pub fn is_valid_topic_name(topic: &str) -> bool {
    if topic.is_empty() || topic.len() > TOPIC_NAME_MAX_LEN {
        return false;
    }
    if topic == "." || topic == ".." {
        return false;
    }
    topic
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// Backoff delay with ±20% jitter, at least 1ms.  The jitter is sampled
/// from the OS entropy source with rejection to avoid modulo bias on narrow
/// ranges.
fn jittered_backoff(base: Duration) -> Duration {
    let base_ns = base.as_nanos().min(i64::MAX as u128) as i64;
    let jitter = (base_ns / 5).max(1);
    let delta = random_between(-jitter, jitter + 1);
    let delay_ns = (base_ns + delta).max(1_000_000);
    Duration::from_nanos(delay_ns as u64)
}

/// Uniform value in `[origin, bound)` from a cryptographically-strong
/// source, rejection-sampled.
fn random_between(origin: i64, bound: i64) -> i64 {
    let span = bound - origin;
    if span <= 0 {
        return origin;
    }
    let span = span as u64;
    loop {
        let bits = OsRng.next_u64() >> 1;
        let val = bits % span;
        if (bits - val).checked_add(span - 1).is_some() {
            return origin + val as i64;
        }
    }
}
