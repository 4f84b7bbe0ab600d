//! Delivery of the artifact to the e-reader mailbox.

use crate::config::SmtpConfig;
use crate::error::{CourierError, CourierResult};
use crate::fetcher::Artifact;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials as SmtpCredentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::Serialize;
use tracing::{debug, info};

pub const EPUB_MIME: &str = "application/epub+zip";

/// Addressing for one message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub sender: String,
    pub recipient: String,
    pub subject: String,
}

/// Relay acceptance of a message.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReceipt {
    /// SMTP reply code, e.g. `250`.
    pub code: String,
    pub message: String,
    pub accepted_at: DateTime<Utc>,
    pub attachment_bytes: u64,
}

/// Sends an artifact as a mail attachment.
#[async_trait]
pub trait Mailer: Send + Sync {
    /// Returns only once the relay has accepted the message.
    async fn send(&self, envelope: &Envelope, artifact: &Artifact) -> CourierResult<DeliveryReceipt>;
}

/// STARTTLS relay with password authentication, one connection per message.
pub struct SmtpMailer {
    config: SmtpConfig,
    attachment_limit: u64,
}

impl SmtpMailer {
    pub fn new(config: SmtpConfig, attachment_limit: u64) -> Self {
        Self {
            config,
            attachment_limit,
        }
    }

    fn transport(&self) -> CourierResult<AsyncSmtpTransport<Tokio1Executor>> {
        let builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&self.config.host)
            .map_err(|e| {
                CourierError::Delivery(format!("invalid SMTP relay '{}': {e}", self.config.host))
            })?;
        Ok(builder
            .port(self.config.port)
            .credentials(SmtpCredentials::new(
                self.config.user.clone(),
                self.config.password.expose().to_string(),
            ))
            .timeout(Some(self.config.timeout))
            .build())
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(&self, envelope: &Envelope, artifact: &Artifact) -> CourierResult<DeliveryReceipt> {
        check_attachment(artifact, self.attachment_limit)?;

        let bytes = tokio::fs::read(&artifact.path).await.map_err(|e| {
            CourierError::Delivery(format!("cannot read {}: {e}", artifact.path.display()))
        })?;
        let size = bytes.len() as u64;
        if encoded_size(size) > self.attachment_limit {
            return Err(oversize(&artifact.file_name, size, self.attachment_limit));
        }

        let message = compose(envelope, artifact, bytes)?;
        let transport = self.transport()?;
        debug!(
            host = %self.config.host,
            port = self.config.port,
            recipient = %envelope.recipient,
            "sending message"
        );

        let response = tokio::time::timeout(self.config.timeout, transport.send(message))
            .await
            .map_err(|_| {
                CourierError::Delivery(format!(
                    "SMTP send to {} timed out after {:?}",
                    self.config.host, self.config.timeout
                ))
            })?
            .map_err(|e| CourierError::Delivery(format!("SMTP send failed: {e}")))?;

        let code = response.code().to_string();
        let text = response.message().collect::<Vec<_>>().join(" ");
        if !response.is_positive() {
            return Err(CourierError::Delivery(format!(
                "relay answered {code} {text}"
            )));
        }

        info!(code = %code, recipient = %envelope.recipient, bytes = size, "message accepted");
        Ok(DeliveryReceipt {
            code,
            message: text,
            accepted_at: Utc::now(),
            attachment_bytes: size,
        })
    }
}

/// Checks that need no connection: size ceiling and EPUB type.
///
/// The ceiling applies to the attachment as it travels, base64-encoded.
pub fn check_attachment(artifact: &Artifact, limit: u64) -> CourierResult<()> {
    if encoded_size(artifact.size) > limit {
        return Err(oversize(&artifact.file_name, artifact.size, limit));
    }
    if !artifact.file_name.to_ascii_lowercase().ends_with(".epub") {
        return Err(CourierError::Delivery(format!(
            "'{}' is not an EPUB; the mailbox only converts EPUB files",
            artifact.file_name
        )));
    }
    Ok(())
}

/// Base64 length of `size` raw bytes, line breaks not counted.
pub fn encoded_size(size: u64) -> u64 {
    size.div_ceil(3) * 4
}

fn oversize(name: &str, size: u64, limit: u64) -> CourierError {
    CourierError::Delivery(format!(
        "'{name}' is {size} bytes ({} encoded), above the {limit}-byte attachment limit",
        encoded_size(size)
    ))
}

/// Build the multipart message: short plain-text body plus the EPUB.
pub fn compose(envelope: &Envelope, artifact: &Artifact, bytes: Vec<u8>) -> CourierResult<Message> {
    let from = parse_mailbox("sender", &envelope.sender)?;
    let to = parse_mailbox("recipient", &envelope.recipient)?;
    let content_type = ContentType::parse(EPUB_MIME)
        .map_err(|e| CourierError::Delivery(format!("bad attachment content type: {e}")))?;

    let body = format!("{}\n\nDelivered by issue-courier.\n", artifact.issue);
    Message::builder()
        .from(from)
        .to(to)
        .subject(envelope.subject.as_str())
        .multipart(
            MultiPart::mixed()
                .singlepart(SinglePart::plain(body))
                .singlepart(Attachment::new(artifact.file_name.clone()).body(bytes, content_type)),
        )
        .map_err(|e| CourierError::Delivery(format!("cannot build message: {e}")))
}

fn parse_mailbox(role: &str, address: &str) -> CourierResult<Mailbox> {
    address
        .parse::<Mailbox>()
        .map_err(|e| CourierError::Delivery(format!("invalid {role} address '{address}': {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::path::PathBuf;

    fn artifact(name: &str, size: u64) -> Artifact {
        Artifact {
            issue: "Software Design 2024年5月号".into(),
            path: PathBuf::from("/nonexistent").join(name),
            file_name: name.into(),
            size,
        }
    }

    fn envelope() -> Envelope {
        Envelope {
            sender: "courier@example.com".into(),
            recipient: "reader@kindle.com".into(),
            subject: String::new(),
        }
    }

    fn mailer(limit: u64) -> SmtpMailer {
        SmtpMailer::new(
            SmtpConfig {
                host: "smtp.invalid".into(),
                port: 587,
                user: "courier".into(),
                password: crate::config::Secret::new("pw"),
                timeout: std::time::Duration::from_secs(1),
            },
            limit,
        )
    }

    #[tokio::test]
    async fn test_oversize_rejected_before_connecting() {
        // The relay host does not resolve, so reaching it would be a different error.
        let err = mailer(1024)
            .send(&envelope(), &artifact("sd.epub", 4096))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Delivery);
        assert!(err.to_string().contains("attachment limit"));
    }

    #[test]
    fn test_limit_counts_encoded_size() {
        assert_eq!(encoded_size(0), 0);
        assert_eq!(encoded_size(1), 4);
        assert_eq!(encoded_size(768), 1024);
        assert!(check_attachment(&artifact("sd.epub", 768), 1024).is_ok());

        // 800 raw bytes fit under 1024 but their encoding does not.
        let err = check_attachment(&artifact("sd.epub", 800), 1024).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Delivery);
        assert!(err.to_string().contains("1068 encoded"));
    }

    #[tokio::test]
    async fn test_non_epub_rejected() {
        let err = mailer(1024)
            .send(&envelope(), &artifact("sd.pdf", 10))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not an EPUB"));
    }

    #[test]
    fn test_compose_carries_attachment() {
        let message = compose(&envelope(), &artifact("SD202405.epub", 3), b"PK\x03".to_vec()).unwrap();
        let raw = String::from_utf8_lossy(&message.formatted()).to_string();
        assert!(raw.contains("multipart/mixed"));
        assert!(raw.contains("application/epub+zip"));
        assert!(raw.contains("SD202405.epub"));
        assert!(raw.contains("To: reader@kindle.com"));
    }

    #[test]
    fn test_compose_rejects_bad_address() {
        let mut env = envelope();
        env.recipient = "not an address".into();
        let err = compose(&env, &artifact("sd.epub", 1), vec![1]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Delivery);
    }
}
