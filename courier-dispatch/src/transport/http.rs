//! JSON over HTTP submission to a provider REST API

use async_trait::async_trait;
use courier_common::Message;
use reqwest::{
    Client, StatusCode,
    header::{HeaderMap, HeaderName, HeaderValue},
};
use serde::{Deserialize, Serialize};

use super::{HttpApiConfig, Transport, TransportKind};
use crate::error::TransportError;

/// Longest slice of an error body carried into the error message
const MAX_ERROR_BODY: usize = 256;

#[derive(Debug, Serialize)]
struct SendRequest<'a> {
    id: &'a str,
    from: &'a str,
    to: &'a [String],
    subject: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    html: Option<&'a str>,
    #[serde(skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    headers: &'a std::collections::BTreeMap<String, String>,
}

impl<'a> From<&'a Message> for SendRequest<'a> {
    fn from(message: &'a Message) -> Self {
        Self {
            id: &message.id,
            from: &message.from,
            to: &message.to,
            subject: &message.subject,
            text: &message.text,
            html: message.html.as_deref(),
            headers: &message.headers,
        }
    }
}

/// The fields providers commonly use for the accepted message's id
#[derive(Debug, Default, Deserialize)]
struct SendResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

fn status_error(status: StatusCode, body: &str) -> TransportError {
    let mut body = body.trim().to_string();
    if body.len() > MAX_ERROR_BODY {
        let mut end = MAX_ERROR_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body.truncate(end);
    }
    let detail = format!("HTTP {status}: {body}");

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            TransportError::Authentication(detail)
        }
        StatusCode::TOO_MANY_REQUESTS => TransportError::RateLimited(detail),
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
            TransportError::InvalidRecipient(detail)
        }
        _ => TransportError::Provider(detail),
    }
}

fn request_error(error: &reqwest::Error) -> TransportError {
    if error.is_timeout() {
        TransportError::Network(format!("request timed out: {error}"))
    } else if error.is_connect() {
        TransportError::Network(format!("connection failed: {error}"))
    } else {
        TransportError::Network(error.to_string())
    }
}

#[derive(Debug)]
pub struct HttpApiTransport {
    client: Client,
    config: HttpApiConfig,
}

impl HttpApiTransport {
    /// # Errors
    ///
    /// Returns an error if a configured header is invalid or the HTTP client
    /// cannot be initialised.
    pub fn new(config: HttpApiConfig) -> Result<Self, TransportError> {
        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| TransportError::Provider(format!("header {name}: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::Provider(format!("header {name}: {e}")))?;
            headers.insert(name, value);
        }

        let client = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|e| TransportError::Provider(e.to_string()))?;

        Ok(Self { client, config })
    }
}

#[async_trait]
impl Transport for HttpApiTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpApi
    }

    async fn send(&self, message: &Message) -> Result<String, TransportError> {
        let mut request = self
            .client
            .post(&self.config.endpoint)
            .json(&SendRequest::from(message));

        if let Some(api_key) = &self.config.api_key {
            request = request.bearer_auth(api_key);
        }

        let response = request.send().await.map_err(|e| request_error(&e))?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        // A 2xx without a usable body still means the provider took the message
        let body = response.text().await.unwrap_or_default();
        let parsed: SendResponse = serde_json::from_str(&body).unwrap_or_default();

        Ok(parsed
            .id
            .or(parsed.message_id)
            .unwrap_or_else(|| message.id.clone()))
    }
}
