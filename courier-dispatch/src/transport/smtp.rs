//! Plain SMTP submission
//!
//! One connection per message: greeting, EHLO, optional AUTH PLAIN, MAIL,
//! RCPT for every recipient, DATA and QUIT. Rejections are mapped onto
//! [`TransportError`] variants by reply code.

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use courier_common::{Message, outgoing};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
};

use super::{SmtpConfig, Transport, TransportKind};
use crate::error::TransportError;

/// A complete, possibly multi-line, SMTP reply
#[derive(Debug, Clone, PartialEq, Eq)]
struct Reply {
    code: u16,
    lines: Vec<String>,
}

impl Reply {
    fn message(&self) -> String {
        self.lines.join(" ")
    }

    const fn is_positive(&self) -> bool {
        self.code >= 200 && self.code < 400
    }
}

/// Split one reply line into its code, whether it is the last line, and text
fn parse_line(line: &str) -> Result<(u16, bool, &str), TransportError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let code = line
        .get(..3)
        .and_then(|code| code.parse::<u16>().ok())
        .ok_or_else(|| TransportError::Provider(format!("Malformed SMTP reply '{line}'")))?;

    let is_last = match line.as_bytes().get(3) {
        None | Some(b' ') => true,
        Some(b'-') => false,
        Some(_) => {
            return Err(TransportError::Provider(format!(
                "Malformed SMTP reply '{line}'"
            )));
        }
    };

    Ok((code, is_last, line.get(4..).unwrap_or_default()))
}

/// Map a rejection onto the error the pipeline will classify
fn rejection(stage: &str, reply: &Reply) -> TransportError {
    let detail = format!("{stage} rejected with {} {}", reply.code, reply.message());
    match reply.code {
        530 | 534 | 535 | 538 => TransportError::Authentication(detail),
        421 | 450 | 451 => TransportError::RateLimited(detail),
        550 | 551 | 553 => TransportError::InvalidRecipient(detail),
        _ => TransportError::Provider(detail),
    }
}

/// Pull the server's queue id out of the final DATA reply, if it gave one
fn queue_id(reply: &Reply) -> Option<String> {
    let message = reply.message();
    let (_, rest) = message.split_once("queued as ")?;
    rest.split_whitespace().next().map(ToString::to_string)
}

struct Session {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Session {
    async fn connect(host: &str, port: u16) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| TransportError::Network(format!("connect to {host}:{port}: {e}")))?;
        let (reader, writer) = stream.into_split();

        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn read_reply(&mut self) -> Result<Reply, TransportError> {
        let mut lines = Vec::new();
        let mut line = String::new();

        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Err(TransportError::Network(
                    "connection closed by server".to_string(),
                ));
            }

            let (code, is_last, text) = parse_line(&line)?;
            lines.push(text.to_string());

            if is_last {
                return Ok(Reply { code, lines });
            }
        }
    }

    async fn command(&mut self, command: &str) -> Result<Reply, TransportError> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    /// Send `command` and fail unless the reply is positive
    async fn require(&mut self, stage: &str, command: &str) -> Result<Reply, TransportError> {
        let reply = self.command(command).await?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(rejection(stage, &reply))
        }
    }

    async fn data(&mut self, content: &str) -> Result<Reply, TransportError> {
        self.writer.write_all(content.as_bytes()).await?;
        if !content.ends_with("\r\n") {
            self.writer.write_all(b"\r\n").await?;
        }
        self.writer.write_all(b".\r\n").await?;
        self.writer.flush().await?;

        let reply = self.read_reply().await?;
        if reply.is_positive() {
            Ok(reply)
        } else {
            Err(rejection("message", &reply))
        }
    }
}

#[derive(Debug)]
pub struct SmtpTransport {
    config: SmtpConfig,
}

impl SmtpTransport {
    #[must_use]
    pub const fn new(config: SmtpConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Transport for SmtpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Smtp
    }

    async fn send(&self, message: &Message) -> Result<String, TransportError> {
        if message.to.is_empty() {
            return Err(TransportError::InvalidRecipient(
                "message has no recipients".to_string(),
            ));
        }

        let mut session = Session::connect(&self.config.host, self.config.port).await?;

        let greeting = session.read_reply().await?;
        if !greeting.is_positive() {
            return Err(rejection("greeting", &greeting));
        }

        session
            .require("EHLO", &format!("EHLO {}", self.config.helo_name))
            .await?;

        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            let credentials = STANDARD.encode(format!("\0{username}\0{password}"));
            session
                .require("AUTH", &format!("AUTH PLAIN {credentials}"))
                .await?;
        }

        session
            .require("MAIL FROM", &format!("MAIL FROM:<{}>", message.from))
            .await?;

        for recipient in &message.to {
            session
                .require("RCPT TO", &format!("RCPT TO:<{recipient}>"))
                .await?;
        }

        session.require("DATA", "DATA").await?;
        let accepted = session.data(&message.to_rfc5322()).await?;

        // The message is accepted at this point; a failed QUIT changes nothing
        if let Err(e) = session.command("QUIT").await {
            outgoing!(level = DEBUG, host = %self.config.host, "QUIT failed after delivery: {e}");
        }

        Ok(queue_id(&accepted).unwrap_or_else(|| message.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorClass;

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("250-SIZE 1000\r\n").unwrap(), (250, false, "SIZE 1000"));
        assert_eq!(parse_line("250 OK\r\n").unwrap(), (250, true, "OK"));
        assert_eq!(parse_line("354").unwrap(), (354, true, ""));
        assert!(parse_line("25").is_err());
        assert!(parse_line("250?OK").is_err());
    }

    #[test]
    fn test_rejection_classes() {
        let reply = |code| Reply {
            code,
            lines: vec!["nope".to_string()],
        };

        assert_eq!(
            rejection("AUTH", &reply(535)).class(),
            ErrorClass::Authentication
        );
        assert_eq!(
            rejection("RCPT TO", &reply(550)).class(),
            ErrorClass::InvalidRecipient
        );
        assert_eq!(
            rejection("RCPT TO", &reply(553)).class(),
            ErrorClass::InvalidRecipient
        );
        assert_eq!(
            rejection("MAIL FROM", &reply(451)).class(),
            ErrorClass::RateLimit
        );
        assert_eq!(rejection("DATA", &reply(554)).class(), ErrorClass::Unknown);
    }

    #[test]
    fn test_queue_id() {
        let reply = Reply {
            code: 250,
            lines: vec!["2.0.0 Ok: queued as 4F2B1C0A3".to_string()],
        };
        assert_eq!(queue_id(&reply).as_deref(), Some("4F2B1C0A3"));

        let reply = Reply {
            code: 250,
            lines: vec!["OK".to_string()],
        };
        assert_eq!(queue_id(&reply), None);
    }
}
