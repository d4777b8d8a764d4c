//! Mail transport: IMAP mailbox for carrier replies, SMTP for ETA requests.

pub mod imap;
pub mod smtp;
pub mod types;

use std::time::Duration;

use secrecy::SecretString;

pub use imap::{ImapMailbox, Mailbox};
pub use smtp::{EmailSender, LogOnlySender, SmtpSender};
pub use types::{MailMessage, OutgoingMail, clean_body};

// ── Configuration ───────────────────────────────────────────────────

/// Mailbox and SMTP configuration, built from environment variables.
#[derive(Debug, Clone)]
pub struct MailConfig {
    pub imap_host: String,
    pub imap_port: u16,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    /// Sender address on outbound mail. Inbound mail from it is skipped.
    pub from_address: String,
    pub poll_interval: Duration,
}

impl MailConfig {
    /// Build config from environment variables.
    /// Returns `None` if `EMAIL_IMAP_HOST` is not set (mailbox disabled).
    pub fn from_env() -> Option<Self> {
        let imap_host = std::env::var("EMAIL_IMAP_HOST")
            .ok()
            .filter(|h| !h.trim().is_empty())?;

        let smtp_host =
            std::env::var("EMAIL_SMTP_HOST").unwrap_or_else(|_| imap_host.replace("imap", "smtp"));
        let username = std::env::var("EMAIL_USERNAME").unwrap_or_default();
        let password = std::env::var("EMAIL_PASSWORD").unwrap_or_default();
        let from_address = std::env::var("EMAIL_FROM_ADDRESS").unwrap_or_else(|_| username.clone());

        Some(Self {
            imap_port: crate::config::env_or("EMAIL_IMAP_PORT", 993),
            smtp_port: crate::config::env_or("EMAIL_SMTP_PORT", 587),
            poll_interval: Duration::from_secs(crate::config::env_or(
                "EMAIL_POLL_INTERVAL_SECS",
                60u64,
            )),
            imap_host,
            smtp_host,
            username,
            password: SecretString::from(password),
            from_address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_from_env_returns_none_when_no_host() {
        // SAFETY: no other test reads EMAIL_IMAP_HOST concurrently.
        unsafe { std::env::remove_var("EMAIL_IMAP_HOST") };
        assert!(MailConfig::from_env().is_none());
    }

    #[test]
    fn password_is_redacted_in_debug() {
        let config = MailConfig {
            imap_host: "imap.test.com".into(),
            imap_port: 993,
            smtp_host: "smtp.test.com".into(),
            smtp_port: 587,
            username: "dispatch".into(),
            password: SecretString::from("hunter2"),
            from_address: "dispatch@test.com".into(),
            poll_interval: Duration::from_secs(60),
        };
        assert!(!format!("{config:?}").contains("hunter2"));
    }
}
