//! WAL-to-Kafka replication endpoint.
//!
//! Plugs into a column-store database's WAL replication framework and
//! publishes committed edits to Kafka, one JSON event per source row per
//! WAL entry.
//!
//! ```text
//!                    host replication framework
//!                               │ replicate(batch)
//!                               ▼
//!  ┌──────────┐  group by  ┌─────────┐  decode   ┌────────────────┐
//!  │ WalEntry ├───────────►│ row map ├──────────►│ PayloadBuilder │
//!  └──────────┘  row key   └─────────┘  values   └───────┬────────┘
//!                (RowKeySlice, zero-copy)                │ ordered JSON
//!                                                        ▼
//!                 ┌─────────────┐  completion   ┌─────────────────┐
//!                 │ BatchSender │◄──────────────┤ RecordSink      ├──► Kafka
//!                 └──────┬──────┘  handles      │ (rdkafka)       │
//!                        │ strict flush         └─────────────────┘
//!                        ▼                       TopicEnsurer keeps the
//!                 true / false to host           target topics existing
//! ```
//!
//! ## Overview
//!
//! * [`wal`] defines the input model ([`wal::WalEntry`], [`wal::Cell`],
//!   [`wal::TableName`]); cells borrow the host batch buffers.
//! * [`rowkey::RowKeySlice`] is the zero-copy row-key view used as the
//!   grouping key.
//! * [`schema`] and [`decode`] turn raw column bytes into typed JSON values:
//!   a hot-reloadable JSON schema registry and a raw/typed decoder pair with
//!   a per-column type cache.
//! * [`payload::PayloadBuilder`] assembles the insertion-ordered event
//!   object per row, including `event_version` (maximum cell timestamp of
//!   the target family) and the optional row-key/metadata fields.
//! * [`kafka`] holds the producer seam ([`kafka::RecordSink`]), the pending
//!   acknowledgement buffer ([`kafka::batch::BatchSender`]) and topic
//!   lifecycle management ([`kafka::topics::TopicEnsurer`]).
//! * [`endpoint::KafkaEndpoint`] wires it all behind the host-facing
//!   [`endpoint::ReplicationEndpoint`] hooks.
//!
//! ## Delivery contract
//!
//! `replicate` acknowledges a batch only after a strict flush confirmed
//! every produced record; any decode error, producer error or
//! acknowledgement timeout returns `false` so the host resubmits the batch.
//! The endpoint keeps no persistent state of its own.
//!
//! ## Threading
//!
//! The host invokes `replicate` from its own worker threads, one batch at a
//! time per endpoint instance.  The producer, the admin client, the schema
//! snapshot and the decoder caches are shared and safe for concurrent
//! readers; the per-batch `BatchSender` is single-owner by design.

pub mod config;
pub mod decode;
pub mod endpoint;
pub mod error;
pub mod kafka;
pub mod payload;
pub mod rowkey;
pub mod schema;
pub mod wal;

#[cfg(test)]
mod test;

pub use config::{DecodeMode, EndpointConfig, EndpointConfigBuilder, Props, RowKeyEncoding};
pub use decode::{DecodeError, LogicalType, ValueDecoder};
pub use endpoint::{KafkaEndpoint, ReplicationContext, ReplicationEndpoint};
pub use error::{ConfigError, EndpointError};
pub use kafka::batch::{BatchSender, FlushError};
pub use kafka::topics::{TopicAdmin, TopicEnsurer};
pub use kafka::{DeliveryHandle, RecordSink};
pub use payload::PayloadBuilder;
pub use rowkey::RowKeySlice;
pub use schema::{JsonSchemaRegistry, SchemaRegistry};
pub use wal::{Cell, TableName, WalEntry};
