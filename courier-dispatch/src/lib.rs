//! Multi-provider transactional mail dispatch
//!
//! This crate provides:
//! - A provider registry with per-provider health and enabled state
//! - Per-provider admission control over fixed windows, burst tokens and a
//!   concurrency cap, backed by an in-process or Redis counter store
//! - Tiered, weighted-random provider selection with an injectable RNG
//! - The send pipeline with fallback, and a background health recovery loop

pub mod clock;
mod config;
mod error;
pub mod health;
pub mod provider;
pub mod rate_limiter;
pub mod recovery;
pub mod selection;
mod service;
pub mod store;
pub mod transport;
mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DispatchConfig, ProviderConfig};
pub use error::{DispatchError, ErrorClass, StoreError, TransportError};
pub use health::{HealthConfig, HealthScorer, HealthState};
pub use provider::{Provider, ProviderRegistry, ProviderSnapshot};
pub use rate_limiter::{Admission, BurstConfig, RateLimitConfig, RateLimitStats, RateLimiter, Window};
pub use recovery::{HealthRecovery, RecoveryConfig, RecoveryReport};
pub use selection::Selector;
pub use service::{DEFAULT_TRANSPORT_TIMEOUT, DispatchService, DispatchServiceBuilder};
pub use store::{CounterStore, MemoryCounterStore, RedisCounterStore, RedisStoreConfig, StoreConfig};
pub use transport::{
    HttpApiConfig, HttpApiTransport, ScriptedOutcome, ScriptedTransport, SmtpConfig, SmtpTransport,
    Transport, TransportConfig, TransportKind,
};
pub use types::{
    AttemptOutcome, DeliveryAttempt, DeliveryOutcome, ProviderStatus, ProviderStatusReport,
    SendFailure, SendResult,
};
