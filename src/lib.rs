//! # Flowmon - Network Flow Telemetry Agent
//!
//! Flowmon is a flow telemetry and security-classification agent for
//! residential and edge gateways. It samples traffic counters on collector
//! timers, aggregates them into per-flow accumulators, classifies payloads
//! against a streaming signature engine and a gatekeeper policy cache, and
//! emits length-delimited reports to an MQTT topic.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use flowmon::config::{CollectorConfig, ConfigEvent, ReportConfig};
//! use flowmon::fcm::FcmManager;
//!
//! let mut mgr = FcmManager::new(Default::default());
//! mgr.apply_report_event(ConfigEvent::New(ReportConfig {
//!     name: "lan_report".into(),
//!     report_interval: 60,
//!     ..Default::default()
//! }));
//! mgr.apply_collector_event(ConfigEvent::New(CollectorConfig {
//!     name: "lanstats".into(),
//!     sample_interval: 10,
//!     report_name: "lan_report".into(),
//!     ..Default::default()
//! }));
//! ```
//!
//! ## Architecture
//!
//! Flowmon uses a layered architecture:
//! - **RTS Layer**: streaming byte classifier (VM, DFA, pool, fan-out queue)
//! - **Aggregation Layer**: five-tuple accumulators and observation windows
//! - **Collection Layer**: pluggable collectors on a cooperative scheduler
//! - **Reporting Layer**: wire encoders and the gatekeeper cache engine

pub mod aggregator;
pub mod collectors;
pub mod config;
pub mod error;
pub mod fcm;
pub mod filter;
pub mod gatekeeper;
pub mod logging;
pub mod report;
pub mod rts;

// Re-export the main public API
pub use crate::aggregator::{Aggregator, FlowCounters, FlowKey, MacAddr};
pub use crate::error::{FlowError, Result};
pub use crate::fcm::FcmManager;
pub use crate::rts::{RtsHandle, RtsRuntime, RtsStream};
