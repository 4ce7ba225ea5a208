//! Results and reports produced by the dispatch service

use serde::{Deserialize, Serialize};

use crate::{error::ErrorClass, health::HealthState, transport::TransportKind};

/// Whether one attempt got the message accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Success,
    Failure,
}

/// One provider tried during a send
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryAttempt {
    pub provider: String,

    /// Unix milliseconds
    pub started_at: u64,

    pub outcome: AttemptOutcome,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,

    pub latency_ms: u64,

    /// `false` when admission control turned the attempt away before the
    /// transport was called
    pub dispatched: bool,

    /// Admission denial or transport error text
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Milliseconds until the limiter window that denied this attempt resets
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl DeliveryAttempt {
    pub(crate) fn rate_limited(
        provider: &str,
        started_at: u64,
        reason: String,
        retry_after_ms: Option<u64>,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            started_at,
            outcome: AttemptOutcome::Failure,
            error_class: Some(ErrorClass::RateLimit),
            latency_ms: 0,
            dispatched: false,
            reason: Some(reason),
            retry_after_ms,
        }
    }

    pub(crate) fn succeeded(provider: &str, started_at: u64, latency_ms: u64) -> Self {
        Self {
            provider: provider.to_string(),
            started_at,
            outcome: AttemptOutcome::Success,
            error_class: None,
            latency_ms,
            dispatched: true,
            reason: None,
            retry_after_ms: None,
        }
    }

    pub(crate) fn failed(
        provider: &str,
        started_at: u64,
        latency_ms: u64,
        class: ErrorClass,
        reason: String,
    ) -> Self {
        Self {
            provider: provider.to_string(),
            started_at,
            outcome: AttemptOutcome::Failure,
            error_class: Some(class),
            latency_ms,
            dispatched: true,
            reason: Some(reason),
            retry_after_ms: None,
        }
    }

    /// Turned away by admission control, no transport call
    #[must_use]
    pub const fn is_rate_limited(&self) -> bool {
        !self.dispatched
    }
}

/// Why a send ended without any provider accepting the message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SendFailure {
    /// No candidates, or every candidate was turned away by its rate limits.
    /// A capacity or configuration problem; the message was never offered.
    NoProviderAccepted,

    /// At least one provider was called and every call failed
    AllProvidersRejected,
}

impl SendFailure {
    /// Classify an exhausted attempt list
    #[must_use]
    pub fn from_attempts(attempts: &[DeliveryAttempt]) -> Self {
        if attempts.iter().any(|attempt| attempt.dispatched) {
            Self::AllProvidersRejected
        } else {
            Self::NoProviderAccepted
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoProviderAccepted => "no provider accepted the message",
            Self::AllProvidersRejected => "all providers rejected the message",
        }
    }
}

/// Outcome of one `send`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SendResult {
    pub message_id: String,
    pub success: bool,

    /// Every provider tried, in order
    pub attempts: Vec<DeliveryAttempt>,

    /// Winning provider
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,

    /// Identifier the winning provider assigned to the message
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transport_message_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<SendFailure>,

    /// Human readable summary of a failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SendResult {
    pub(crate) fn delivered(
        message_id: &str,
        attempts: Vec<DeliveryAttempt>,
        provider: &str,
        transport_message_id: String,
    ) -> Self {
        Self {
            message_id: message_id.to_string(),
            success: true,
            attempts,
            provider: Some(provider.to_string()),
            transport_message_id: Some(transport_message_id),
            failure: None,
            error: None,
        }
    }

    pub(crate) fn no_providers(message_id: &str) -> Self {
        Self {
            message_id: message_id.to_string(),
            success: false,
            attempts: Vec::new(),
            provider: None,
            transport_message_id: None,
            failure: Some(SendFailure::NoProviderAccepted),
            error: Some("no providers available".to_string()),
        }
    }

    pub(crate) fn exhausted(message_id: &str, attempts: Vec<DeliveryAttempt>) -> Self {
        let failure = SendFailure::from_attempts(&attempts);
        Self {
            message_id: message_id.to_string(),
            success: false,
            attempts,
            provider: None,
            transport_message_id: None,
            failure: Some(failure),
            error: Some(failure.as_str().to_string()),
        }
    }
}

/// Final fate of a message as later reported by the provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    Bounced,
    Complained,
    Deferred,
}

/// Read-only view of one provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatus {
    pub name: String,
    pub kind: TransportKind,
    pub priority_tier: u32,
    pub weight: f64,
    pub enabled: bool,
    pub health_score: u8,
    pub state: HealthState,
    pub in_flight: u32,

    /// Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<u64>,

    /// Unix seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<u64>,
}

/// Read-only view of every provider
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProviderStatusReport {
    pub providers: Vec<ProviderStatus>,

    /// Providers in the healthy band
    pub healthy_count: usize,

    /// Providers that may be selected
    pub available_count: usize,

    pub total_count: usize,
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_failure_kind_from_attempts() {
        let limited = DeliveryAttempt::rate_limited("a", 0, "per-second limit of 1 reached".into(), Some(400));
        let rejected = DeliveryAttempt::failed("b", 0, 12, ErrorClass::InvalidRecipient, "Invalid recipient: x".into());

        assert_eq!(SendFailure::from_attempts(&[]), SendFailure::NoProviderAccepted);
        assert_eq!(
            SendFailure::from_attempts(&[limited.clone(), limited.clone()]),
            SendFailure::NoProviderAccepted
        );
        assert_eq!(
            SendFailure::from_attempts(&[limited, rejected]),
            SendFailure::AllProvidersRejected
        );
    }

    #[test]
    fn test_result_json_shape() {
        let result = SendResult::delivered(
            "01J",
            vec![DeliveryAttempt::succeeded("primary", 1_000, 42)],
            "primary",
            "abc".to_string(),
        );
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["provider"], "primary");
        assert_eq!(json["attempts"][0]["outcome"], "success");
        assert!(json.get("failure").is_none());
        assert!(json["attempts"][0].get("error_class").is_none());
    }

    #[test]
    fn test_exhausted_carries_summary() {
        let result = SendResult::exhausted(
            "01J",
            vec![DeliveryAttempt::failed("a", 0, 5, ErrorClass::Network, "Network error".into())],
        );
        assert!(!result.success);
        assert_eq!(result.failure, Some(SendFailure::AllProvidersRejected));
        assert_eq!(result.error.as_deref(), Some("all providers rejected the message"));
    }
}
