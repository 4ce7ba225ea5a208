//! Provider transports
//!
//! A [`Transport`] hands one message to one external provider. The pipeline
//! wraps every call in a timeout, so transports do not need their own
//! overall deadline.
//!
//! - [`SmtpTransport`]: plain SMTP submission over TCP
//! - [`HttpApiTransport`]: JSON POST to a provider REST endpoint
//! - [`ScriptedTransport`]: replays queued outcomes, for tests and dry runs

mod http;
mod scripted;
mod smtp;

use std::{collections::BTreeMap, fmt, sync::Arc};

use async_trait::async_trait;
use courier_common::Message;
pub use http::HttpApiTransport;
pub use scripted::{ScriptedOutcome, ScriptedTransport};
use serde::{Deserialize, Serialize};
pub use smtp::SmtpTransport;

use crate::error::{DispatchError, TransportError};

/// Broad family a provider's transport belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Smtp,
    HttpApi,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Smtp => f.write_str("smtp"),
            Self::HttpApi => f.write_str("http_api"),
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    fn kind(&self) -> TransportKind;

    /// Submit `message`, returning the provider's identifier for it
    async fn send(&self, message: &Message) -> Result<String, TransportError>;
}

/// How to reach a provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportConfig {
    Smtp(SmtpConfig),
    HttpApi(HttpApiConfig),
}

impl TransportConfig {
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        match self {
            Self::Smtp(_) => TransportKind::Smtp,
            Self::HttpApi(_) => TransportKind::HttpApi,
        }
    }

    /// Check the endpoint is present
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Configuration`] if the host or endpoint is
    /// empty, or the SMTP credentials are only half set.
    pub fn validate(&self, provider: &str) -> Result<(), DispatchError> {
        match self {
            Self::Smtp(smtp) => {
                if smtp.host.trim().is_empty() {
                    return Err(DispatchError::Configuration(format!(
                        "provider {provider}: SMTP host must not be empty"
                    )));
                }
                if smtp.username.is_some() != smtp.password.is_some() {
                    return Err(DispatchError::Configuration(format!(
                        "provider {provider}: SMTP username and password must be set together"
                    )));
                }
            }
            Self::HttpApi(http) => {
                if http.endpoint.trim().is_empty() {
                    return Err(DispatchError::Configuration(format!(
                        "provider {provider}: HTTP endpoint must not be empty"
                    )));
                }
            }
        }

        Ok(())
    }

    /// Build the transport described by this configuration
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Transport`] if the underlying client cannot
    /// be constructed.
    pub fn build(&self, provider: &str) -> Result<Arc<dyn Transport>, DispatchError> {
        Ok(match self {
            Self::Smtp(smtp) => Arc::new(SmtpTransport::new(smtp.clone())),
            Self::HttpApi(http) => Arc::new(HttpApiTransport::new(http.clone()).map_err(
                |e| DispatchError::Transport {
                    provider: provider.to_string(),
                    reason: e.to_string(),
                },
            )?),
        })
    }
}

/// SMTP submission settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,

    #[serde(default = "default_smtp_port")]
    pub port: u16,

    /// Name announced in EHLO
    #[serde(default = "default_helo_name")]
    pub helo_name: String,

    /// Credentials for AUTH PLAIN, both or neither
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

const fn default_smtp_port() -> u16 {
    587
}

fn default_helo_name() -> String {
    "localhost".to_string()
}

/// REST API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpApiConfig {
    /// URL messages are POSTed to
    pub endpoint: String,

    /// Sent as a bearer token
    #[serde(default)]
    pub api_key: Option<String>,

    /// Extra request headers
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}
