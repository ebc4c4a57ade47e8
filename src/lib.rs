//! # Host Telemetry Agent
//!
//! Periodically samples operating-system resource counters (CPU, memory, disk,
//! network) and publishes each sample as a JSON document to a named channel on
//! a message broker.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         TELEMETRY AGENT                              │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │  COUNTER SOURCE → SAMPLER → (RATE CALCULATOR) → PUBLISHER → BROKER   │
//! │                        ▲                                             │
//! │                    SCHEDULER (fixed interval, per-category isolation)│
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Stateless sampling**: every sample is a fresh read, all-or-nothing
//! - **Network rates**: upload/download deltas between consecutive samples
//! - **Bounded delivery**: timeouts retried with exponential backoff, other
//!   broker errors dropped at once
//! - **Isolation**: one failing category never stops the others

#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod rates;
pub mod sampler;
pub mod scheduler;
pub mod snapshot;
pub mod source;

pub use broker::{Broker, TcpBroker};
pub use config::AgentConfig;
pub use error::{AgentError, AgentResult, BrokerError, PublishError, SampleError};
pub use publisher::{DeliveryState, PublishReport, Publisher, RetryPolicy};
pub use rates::{RateCalculator, RateRecord};
pub use sampler::Sampler;
pub use scheduler::{CycleReport, Scheduler};
pub use snapshot::{Category, Snapshot};
pub use source::{CounterSource, ProcfsSource};

// ============================================================================
// CONSTANTS
// ============================================================================

/// Agent name used in logs and the CLI
pub const AGENT_NAME: &str = "telemetry-agent";

/// Crate version
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Prefix for environment overrides (`TELEMETRY_BROKER__ADDRESS`, ...)
pub const ENV_PREFIX: &str = "TELEMETRY_";

/// Default seconds between sampling cycles
pub const DEFAULT_INTERVAL_SECS: f64 = 2.0;

/// Default broker bootstrap address
pub const DEFAULT_BROKER_ADDRESS: &str = "kafka:9092";

/// Default connection timeout at startup
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 5_000;

/// Default bound on one send + flush round trip
pub const DEFAULT_SEND_TIMEOUT_MS: u64 = 5_000;

/// Default retries after a timed-out send
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default first backoff delay
pub const DEFAULT_BASE_DELAY_SECS: f64 = 1.0;

/// Retry ceiling; the worst-case wait is `base * (2^n - 1)`
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Longest accepted sampling interval
pub const MAX_INTERVAL_SECS: u64 = 86_400;

/// Longest accepted first backoff delay
pub const MAX_BASE_DELAY_SECS: u64 = 3_600;

/// Default gap between the two CPU tick readings of one sample
pub const DEFAULT_CPU_WINDOW_MS: u64 = 100;

/// Default watchdog on a single sample call
pub const DEFAULT_SAMPLE_TIMEOUT_SECS: u64 = 10;
