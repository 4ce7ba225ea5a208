//! A transport that replays queued outcomes instead of talking to anyone

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicU32, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use courier_common::Message;
use parking_lot::Mutex;

use super::{Transport, TransportKind};
use crate::error::{ErrorClass, TransportError};

/// What the next call to [`ScriptedTransport::send`] does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Accept,
    Fail(ErrorClass),
    /// Never complete; only a timeout ends the call
    Hang,
}

impl ScriptedOutcome {
    fn error(class: ErrorClass) -> TransportError {
        let detail = "scripted failure".to_string();
        match class {
            ErrorClass::Authentication => TransportError::Authentication(detail),
            ErrorClass::RateLimit => TransportError::RateLimited(detail),
            ErrorClass::Timeout => TransportError::Timeout(Duration::ZERO),
            ErrorClass::Network => TransportError::Network(detail),
            ErrorClass::InvalidRecipient => TransportError::InvalidRecipient(detail),
            ErrorClass::Unknown => TransportError::Provider(detail),
        }
    }
}

/// Outcomes are taken from the queue first, then `fallback` forever after.
///
/// With no latency configured the call completes without yielding to the
/// runtime.
#[derive(Debug)]
pub struct ScriptedTransport {
    kind: TransportKind,
    queue: Mutex<VecDeque<ScriptedOutcome>>,
    fallback: ScriptedOutcome,
    latency: Duration,
    calls: AtomicU32,
    accepted: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    #[must_use]
    pub fn new(fallback: ScriptedOutcome) -> Self {
        Self {
            kind: TransportKind::HttpApi,
            queue: Mutex::new(VecDeque::new()),
            fallback,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
            accepted: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn accepting() -> Self {
        Self::new(ScriptedOutcome::Accept)
    }

    #[must_use]
    pub fn failing(class: ErrorClass) -> Self {
        Self::new(ScriptedOutcome::Fail(class))
    }

    #[must_use]
    pub fn hanging() -> Self {
        Self::new(ScriptedOutcome::Hang)
    }

    #[must_use]
    pub const fn with_kind(mut self, kind: TransportKind) -> Self {
        self.kind = kind;
        self
    }

    /// Sleep for `latency` before every outcome
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Queue `outcome` ahead of the fallback
    #[must_use]
    pub fn then(self, outcome: ScriptedOutcome) -> Self {
        self.queue.lock().push_back(outcome);
        self
    }

    /// Number of times `send` was called
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids of the messages accepted so far, in order
    pub fn accepted(&self) -> Vec<String> {
        self.accepted.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn send(&self, message: &Message) -> Result<String, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let outcome = self.queue.lock().pop_front().unwrap_or(self.fallback);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        match outcome {
            ScriptedOutcome::Accept => {
                self.accepted.lock().push(message.id.clone());
                Ok(format!("scripted-{}", message.id))
            }
            ScriptedOutcome::Fail(class) => Err(ScriptedOutcome::error(class)),
            ScriptedOutcome::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn message() -> Message {
        Message::new("a@example.org", ["b@example.com"], "Hi", "Body")
    }

    #[tokio::test]
    async fn test_queue_then_fallback() {
        let transport = ScriptedTransport::accepting()
            .then(ScriptedOutcome::Fail(ErrorClass::Network))
            .then(ScriptedOutcome::Fail(ErrorClass::InvalidRecipient));

        let message = message();
        assert_eq!(
            transport.send(&message).await.unwrap_err().class(),
            ErrorClass::Network
        );
        assert_eq!(
            transport.send(&message).await.unwrap_err().class(),
            ErrorClass::InvalidRecipient
        );
        assert_eq!(
            transport.send(&message).await.unwrap(),
            format!("scripted-{}", message.id)
        );
        assert_eq!(transport.calls(), 3);
        assert_eq!(transport.accepted(), vec![message.id]);
    }

    #[tokio::test]
    async fn test_every_class_round_trips() {
        for class in [
            ErrorClass::Authentication,
            ErrorClass::RateLimit,
            ErrorClass::Timeout,
            ErrorClass::Network,
            ErrorClass::InvalidRecipient,
            ErrorClass::Unknown,
        ] {
            let transport = ScriptedTransport::failing(class);
            assert_eq!(transport.send(&message()).await.unwrap_err().class(), class);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_hang_never_completes() {
        let transport = ScriptedTransport::hanging();
        let result =
            tokio::time::timeout(Duration::from_secs(5), transport.send(&message())).await;
        assert!(result.is_err());
    }
}
