//! Collector engine for query-execution telemetry.
//!
//! Each operating unit (OU) is one named kind of executor work (sequential
//! scan, hash join, aggregate, ...). The instrumented server emits
//! begin/end/features/flush markers per plan node; this crate folds those
//! events into completed records (features plus accumulated resource
//! metrics) and publishes them on per-OU rings.
//!
//! The engine is deliberately drop-happy: a counter that moved backward, a
//! marker out of protocol order, or a full map erases the affected key and
//! moves on. Telemetry must never degrade the host server.

pub mod lifecycle;
pub mod machine;
pub mod metrics;
pub mod ring;
pub mod schema;
pub mod sources;

pub use machine::{CollectorEngine, CollectorStats, CollectorStatsSnapshot, MAP_CAPACITY};
pub use ring::{PopResult, RecordRing};
pub use schema::{CollectorSchema, DecodedRecord, FieldKind, FieldSpec, FieldValue, OuSchema};
