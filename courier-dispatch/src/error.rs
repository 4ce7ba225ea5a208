//! Typed error handling for dispatch operations.
//!
//! This module separates three kinds of failure:
//! - Transport failures for a single attempt, which are always recovered
//!   locally by falling back to the next provider
//! - Counter store failures, which fail open
//! - Service level errors (configuration, unknown provider), which are the
//!   only ones surfaced to callers as `Err`

use std::{fmt, time::Duration};

use courier_metrics::MetricsError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Top-level dispatch service error type.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Invalid provider, store or health configuration.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No provider is registered under this name.
    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    /// The counter store could not be constructed.
    #[error("Counter store error: {0}")]
    Store(#[from] StoreError),

    /// A transport could not be built from its configuration.
    #[error("Failed to build transport for {provider}: {reason}")]
    Transport { provider: String, reason: String },

    /// Metrics instruments could not be created.
    #[error("Metrics error: {0}")]
    Metrics(#[from] MetricsError),
}

/// Errors raised by a [`CounterStore`](crate::CounterStore).
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store did not answer within its deadline.
    #[error("Counter store timed out after {0:?}")]
    Timeout(Duration),

    /// The Redis backend returned an error.
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Any other backend failure.
    #[error("Counter store backend error: {0}")]
    Backend(String),
}

/// Failure of a single transport call.
///
/// [`class`](Self::class) maps each variant to an [`ErrorClass`].
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// The provider rejected the message for a reason we do not recognise.
    #[error("Provider error: {0}")]
    Provider(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Typed variants map straight to their class. Network and provider
    /// errors fall back to the words in the message, so a network error
    /// that reports a timeout still counts as one.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Authentication(_) => ErrorClass::Authentication,
            Self::RateLimited(_) => ErrorClass::RateLimit,
            Self::Timeout(_) => ErrorClass::Timeout,
            Self::InvalidRecipient(_) => ErrorClass::InvalidRecipient,
            Self::Network(_) | Self::Io(_) => match ErrorClass::classify(&self.to_string()) {
                ErrorClass::Unknown => ErrorClass::Network,
                class => class,
            },
            Self::Provider(message) => ErrorClass::classify(message),
        }
    }
}

/// Category of a failed delivery attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Authentication,
    RateLimit,
    Timeout,
    Network,
    InvalidRecipient,
    Unknown,
}

impl ErrorClass {
    /// Classify an error by the words in its message.
    ///
    /// Categories are checked in a fixed order so that, for example,
    /// "connection timed out" counts as a timeout rather than a network error.
    #[must_use]
    pub fn classify(message: &str) -> Self {
        const RULES: &[(ErrorClass, &[&str])] = &[
            (
                ErrorClass::Authentication,
                &[
                    "authentication",
                    "unauthorized",
                    "unauthorised",
                    "forbidden",
                    "invalid credentials",
                    "api key",
                ],
            ),
            (
                ErrorClass::RateLimit,
                &["rate limit", "rate_limit", "too many", "throttl", "quota"],
            ),
            (ErrorClass::Timeout, &["timed out", "timeout", "deadline"]),
            (
                ErrorClass::Network,
                &[
                    "network",
                    "connection",
                    "connect",
                    "refused",
                    "reset by peer",
                    "broken pipe",
                    "unreachable",
                    "dns",
                ],
            ),
            (
                ErrorClass::InvalidRecipient,
                &[
                    "invalid recipient",
                    "recipient",
                    "mailbox",
                    "no such user",
                    "user unknown",
                    "does not exist",
                ],
            ),
        ];

        let message = message.to_ascii_lowercase();
        RULES
            .iter()
            .find(|(_, needles)| needles.iter().any(|needle| message.contains(needle)))
            .map_or(Self::Unknown, |(class, _)| *class)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Authentication => "authentication",
            Self::RateLimit => "rate_limit",
            Self::Timeout => "timeout",
            Self::Network => "network",
            Self::InvalidRecipient => "invalid_recipient",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
