//! Outbound mail.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::ExposeSecret;
use tracing::info;

use crate::error::MailError;
use crate::mail::MailConfig;
use crate::mail::types::OutgoingMail;

#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError>;
}

// ── SMTP ────────────────────────────────────────────────────────────

/// SMTP sender via lettre. The blocking transport runs in `spawn_blocking`.
pub struct SmtpSender {
    transport: SmtpTransport,
    from_address: String,
}

impl SmtpSender {
    pub fn new(config: &MailConfig) -> Result<Self, MailError> {
        let creds = Credentials::new(
            config.username.clone(),
            config.password.expose_secret().to_string(),
        );
        let transport = SmtpTransport::starttls_relay(&config.smtp_host)
            .map_err(|e| MailError::ConnectFailed {
                host: config.smtp_host.clone(),
                reason: format!("SMTP relay error: {e}"),
            })?
            .port(config.smtp_port)
            .credentials(creds)
            .build();

        Ok(Self {
            transport,
            from_address: config.from_address.clone(),
        })
    }

    fn build(&self, mail: &OutgoingMail) -> Result<Message, MailError> {
        let fail = |reason: String| MailError::SendFailed {
            to: mail.to.clone(),
            reason,
        };
        Message::builder()
            .from(
                self.from_address
                    .parse()
                    .map_err(|e| fail(format!("Invalid from address: {e}")))?,
            )
            .to(mail
                .to
                .parse()
                .map_err(|e| fail(format!("Invalid to address: {e}")))?)
            .subject(mail.subject.clone())
            .body(mail.body.clone())
            .map_err(|e| fail(format!("Failed to build email: {e}")))
    }
}

#[async_trait]
impl EmailSender for SmtpSender {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        let message = self.build(mail)?;
        let transport = self.transport.clone();
        let to = mail.to.clone();

        tokio::task::spawn_blocking(move || transport.send(&message))
            .await
            .map_err(|e| MailError::TaskPanicked(e.to_string()))?
            .map_err(|e| MailError::SendFailed {
                to: to.clone(),
                reason: format!("SMTP send failed: {e}"),
            })?;

        info!(to = %to, subject = %mail.subject, "Email sent");
        Ok(())
    }
}

// ── Log only ────────────────────────────────────────────────────────

/// Sender used when SMTP is not configured. Logs the message and succeeds.
pub struct LogOnlySender;

#[async_trait]
impl EmailSender for LogOnlySender {
    async fn send(&self, mail: &OutgoingMail) -> Result<(), MailError> {
        info!(
            to = %mail.to,
            subject = %mail.subject,
            body_len = mail.body.len(),
            "SMTP not configured, email logged only"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;
    use std::time::Duration;

    fn config() -> MailConfig {
        MailConfig {
            imap_host: "imap.test.com".into(),
            imap_port: 993,
            smtp_host: "smtp.test.com".into(),
            smtp_port: 587,
            username: "dispatch".into(),
            password: SecretString::from("pass"),
            from_address: "dispatch@test.com".into(),
            poll_interval: Duration::from_secs(60),
        }
    }

    fn mail(to: &str) -> OutgoingMail {
        OutgoingMail {
            to: to.into(),
            subject: "ETA Request - Load PO-2026-001".into(),
            body: "When?".into(),
        }
    }

    #[test]
    fn builds_message() {
        let sender = SmtpSender::new(&config()).unwrap();
        assert!(sender.build(&mail("carrier@acme.com")).is_ok());
    }

    #[test]
    fn invalid_recipient_rejected() {
        let sender = SmtpSender::new(&config()).unwrap();
        let err = sender.build(&mail("not an address")).unwrap_err();
        assert!(matches!(err, MailError::SendFailed { ref to, .. } if to == "not an address"));
    }

    #[tokio::test]
    async fn log_only_succeeds() {
        assert!(LogOnlySender.send(&mail("carrier@acme.com")).await.is_ok());
    }
}
