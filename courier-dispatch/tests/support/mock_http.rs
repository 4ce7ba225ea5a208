//! Minimal HTTP/1.1 endpoint standing in for a provider REST API
//!
//! Every request gets the same configured status and body. Requests are
//! recorded with their headers and body for later inspection.
#![allow(dead_code)] // Not every suite uses every knob

use std::{net::SocketAddr, sync::Arc, time::Duration};

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
};

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header == name)
            .map(|(_, value)| value.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body).unwrap()
    }
}

#[derive(Clone)]
struct Reply {
    status: u16,
    reason: &'static str,
    body: String,
    delay: Option<Duration>,
}

pub struct MockHttpProvider {
    addr: SocketAddr,
    requests: Arc<RwLock<Vec<RecordedRequest>>>,
}

impl MockHttpProvider {
    /// Answer every request with `status` and a JSON `body`
    pub async fn start(status: u16, reason: &'static str, body: &str) -> Self {
        Self::start_with(Reply {
            status,
            reason,
            body: body.to_string(),
            delay: None,
        })
        .await
    }

    /// Like [`start`](Self::start) but wait `delay` before replying
    pub async fn start_delayed(status: u16, body: &str, delay: Duration) -> Self {
        Self::start_with(Reply {
            status,
            reason: "OK",
            body: body.to_string(),
            delay: Some(delay),
        })
        .await
    }

    async fn start_with(reply: Reply) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(RwLock::new(Vec::new()));

        let recorded = Arc::clone(&requests);
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let reply = reply.clone();
                let recorded = Arc::clone(&recorded);
                tokio::spawn(async move {
                    let _ = Self::serve(stream, reply, recorded).await;
                });
            }
        });

        Self { addr, requests }
    }

    async fn serve(
        stream: TcpStream,
        reply: Reply,
        recorded: Arc<RwLock<Vec<RecordedRequest>>>,
    ) -> std::io::Result<()> {
        let mut stream = BufReader::new(stream);

        let mut request_line = String::new();
        stream.read_line(&mut request_line).await?;
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        let mut headers = Vec::new();
        loop {
            let mut line = String::new();
            if stream.read_line(&mut line).await? == 0 || line == "\r\n" {
                break;
            }
            if let Some((name, value)) = line.trim_end().split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }

        let length = headers
            .iter()
            .find(|(name, _)| name == "content-length")
            .and_then(|(_, value)| value.parse::<usize>().ok())
            .unwrap_or(0);
        let mut body = vec![0; length];
        stream.read_exact(&mut body).await?;

        recorded.write().await.push(RecordedRequest {
            method,
            path,
            headers,
            body: String::from_utf8_lossy(&body).into_owned(),
        });

        if let Some(delay) = reply.delay {
            tokio::time::sleep(delay).await;
        }

        let response = format!(
            "HTTP/1.1 {} {}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            reply.status,
            reply.reason,
            reply.body.len(),
            reply.body
        );
        stream.get_mut().write_all(response.as_bytes()).await?;
        stream.get_mut().shutdown().await
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/v1/messages", self.addr)
    }

    pub async fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.read().await.clone()
    }
}
