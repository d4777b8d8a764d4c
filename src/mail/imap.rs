//! IMAP mailbox over rustls.
//!
//! The session is plain blocking I/O driven from `spawn_blocking`. One session
//! is kept open across a poll cycle and dropped on the first error, so the
//! next call reconnects.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::ExposeSecret;
use tracing::{debug, warn};

use crate::error::MailError;
use crate::mail::MailConfig;
use crate::mail::types::MailMessage;

/// Inbound mailbox used by the ingestion poller.
#[async_trait]
pub trait Mailbox: Send + Sync {
    /// Address the mailbox receives at. Mail from it is skipped.
    fn address(&self) -> &str;

    /// Identifiers of unread messages, oldest first.
    async fn list_unread(&self) -> Result<Vec<String>, MailError>;

    async fn fetch(&self, uid: &str) -> Result<MailMessage, MailError>;

    async fn mark_read(&self, uid: &str) -> Result<(), MailError>;

    /// End the current session, if any.
    async fn close(&self) {}
}

// ── Session ─────────────────────────────────────────────────────────

type TlsStream = rustls::StreamOwned<rustls::ClientConnection, TcpStream>;

struct ImapSession {
    tls: TlsStream,
    next_tag: u32,
}

impl ImapSession {
    fn connect(config: &MailConfig) -> Result<Self, MailError> {
        let connect_err = |reason: String| MailError::ConnectFailed {
            host: config.imap_host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((&*config.imap_host, config.imap_port))
            .map_err(|e| connect_err(e.to_string()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(30)))
            .map_err(|e| connect_err(e.to_string()))?;

        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = Arc::new(
            rustls::ClientConfig::builder()
                .with_root_certificates(root_store)
                .with_no_client_auth(),
        );
        let server_name = rustls_pki_types::ServerName::try_from(config.imap_host.clone())
            .map_err(|e| connect_err(e.to_string()))?;
        let conn = rustls::ClientConnection::new(tls_config, server_name)
            .map_err(|e| connect_err(e.to_string()))?;

        let mut session = Self {
            tls: rustls::StreamOwned::new(conn, tcp),
            next_tag: 1,
        };
        let _greeting = session.read_line()?;

        let login = session.command(&format!(
            "LOGIN {} {}",
            quote(&config.username),
            quote(config.password.expose_secret())
        ))?;
        if !tagged_ok(&login) {
            return Err(MailError::AuthFailed {
                user: config.username.clone(),
            });
        }

        let select = session.command("SELECT \"INBOX\"")?;
        if !tagged_ok(&select) {
            return Err(MailError::CommandFailed {
                command: "SELECT".into(),
                reason: last_line(&select),
            });
        }
        debug!(host = %config.imap_host, "IMAP session opened");
        Ok(session)
    }

    fn read_line(&mut self) -> Result<String, MailError> {
        let mut buf = Vec::new();
        loop {
            let mut byte = [0u8; 1];
            match self.tls.read(&mut byte) {
                Ok(0) => {
                    return Err(MailError::CommandFailed {
                        command: "read".into(),
                        reason: "connection closed".into(),
                    });
                }
                Ok(_) => {
                    buf.push(byte[0]);
                    if buf.ends_with(b"\r\n") {
                        return Ok(String::from_utf8_lossy(&buf).to_string());
                    }
                }
                Err(e) => {
                    return Err(MailError::CommandFailed {
                        command: "read".into(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    fn read_exact(&mut self, len: usize) -> Result<Vec<u8>, MailError> {
        let mut buf = vec![0u8; len];
        self.tls
            .read_exact(&mut buf)
            .map_err(|e| MailError::CommandFailed {
                command: "read".into(),
                reason: e.to_string(),
            })?;
        Ok(buf)
    }

    /// Send a tagged command and collect response lines up to the tagged
    /// completion. Literal payloads (`{n}`) are collected separately.
    fn exchange(&mut self, cmd: &str) -> Result<(Vec<String>, Vec<Vec<u8>>), MailError> {
        let tag = format!("A{}", self.next_tag);
        self.next_tag += 1;

        let verb = cmd.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
        let full = format!("{tag} {cmd}\r\n");
        self.tls
            .write_all(full.as_bytes())
            .and_then(|_| self.tls.flush())
            .map_err(|e| MailError::CommandFailed {
                command: verb.clone(),
                reason: e.to_string(),
            })?;

        let mut lines = Vec::new();
        let mut literals = Vec::new();
        loop {
            let line = self.read_line()?;
            if let Some(len) = literal_len(&line) {
                literals.push(self.read_exact(len)?);
            }
            let done = line.starts_with(&format!("{tag} "));
            lines.push(line);
            if done {
                break;
            }
        }
        Ok((lines, literals))
    }

    fn command(&mut self, cmd: &str) -> Result<Vec<String>, MailError> {
        Ok(self.exchange(cmd)?.0)
    }

    fn search_unseen(&mut self) -> Result<Vec<String>, MailError> {
        let resp = self.command("UID SEARCH UNSEEN")?;
        if !tagged_ok(&resp) {
            return Err(MailError::CommandFailed {
                command: "UID SEARCH".into(),
                reason: last_line(&resp),
            });
        }
        Ok(parse_search(&resp))
    }

    fn fetch(&mut self, uid: &str) -> Result<MailMessage, MailError> {
        let (resp, literals) = self.exchange(&format!("UID FETCH {uid} BODY.PEEK[]"))?;
        if !tagged_ok(&resp) {
            return Err(MailError::CommandFailed {
                command: "UID FETCH".into(),
                reason: last_line(&resp),
            });
        }
        let raw = literals.into_iter().next().ok_or_else(|| MailError::Unparseable {
            uid: uid.to_string(),
        })?;
        MailMessage::parse(uid, &raw).ok_or_else(|| MailError::Unparseable {
            uid: uid.to_string(),
        })
    }

    fn mark_seen(&mut self, uid: &str) -> Result<(), MailError> {
        let resp = self.command(&format!("UID STORE {uid} +FLAGS (\\Seen)"))?;
        if tagged_ok(&resp) {
            Ok(())
        } else {
            Err(MailError::CommandFailed {
                command: "UID STORE".into(),
                reason: last_line(&resp),
            })
        }
    }

    fn logout(mut self) {
        let _ = self.command("LOGOUT");
    }
}

/// Quote an IMAP string argument.
fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

fn tagged_ok(lines: &[String]) -> bool {
    lines
        .last()
        .and_then(|l| l.split_whitespace().nth(1))
        .is_some_and(|status| status.eq_ignore_ascii_case("OK"))
}

fn last_line(lines: &[String]) -> String {
    lines.last().map(|l| l.trim().to_string()).unwrap_or_default()
}

/// Length of a trailing `{n}` literal marker, if the line ends with one.
fn literal_len(line: &str) -> Option<usize> {
    let trimmed = line.trim_end_matches("\r\n");
    let open = trimmed.rfind('{')?;
    trimmed
        .strip_suffix('}')
        .and_then(|t| t.get(open + 1..))
        .and_then(|n| n.parse().ok())
}

/// UIDs from `* SEARCH` response lines.
fn parse_search(lines: &[String]) -> Vec<String> {
    lines
        .iter()
        .filter(|l| l.starts_with("* SEARCH"))
        .flat_map(|l| l.split_whitespace().skip(2).map(str::to_string))
        .collect()
}

// ── Mailbox adapter ─────────────────────────────────────────────────

/// IMAP-backed mailbox.
pub struct ImapMailbox {
    config: MailConfig,
    session: Arc<Mutex<Option<ImapSession>>>,
}

impl ImapMailbox {
    pub fn new(config: MailConfig) -> Self {
        Self {
            config,
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `op` against the open session, connecting first if needed.
    async fn with_session<T, F>(&self, op: F) -> Result<T, MailError>
    where
        T: Send + 'static,
        F: FnOnce(&mut ImapSession) -> Result<T, MailError> + Send + 'static,
    {
        let config = self.config.clone();
        let slot = Arc::clone(&self.session);

        tokio::task::spawn_blocking(move || {
            let mut guard = slot
                .lock()
                .map_err(|_| MailError::TaskPanicked("mailbox session lock poisoned".into()))?;
            if guard.is_none() {
                *guard = Some(ImapSession::connect(&config)?);
            }
            let Some(session) = guard.as_mut() else {
                return Err(MailError::ConnectFailed {
                    host: config.imap_host.clone(),
                    reason: "no session".into(),
                });
            };
            let result = op(session);
            if result.is_err() {
                // Drop the session; the next call reconnects.
                *guard = None;
            }
            result
        })
        .await
        .map_err(|e| MailError::TaskPanicked(e.to_string()))?
    }
}

#[async_trait]
impl Mailbox for ImapMailbox {
    fn address(&self) -> &str {
        &self.config.from_address
    }

    async fn list_unread(&self) -> Result<Vec<String>, MailError> {
        self.with_session(|s| s.search_unseen()).await
    }

    async fn fetch(&self, uid: &str) -> Result<MailMessage, MailError> {
        let uid = uid.to_string();
        self.with_session(move |s| s.fetch(&uid)).await
    }

    async fn mark_read(&self, uid: &str) -> Result<(), MailError> {
        let uid = uid.to_string();
        self.with_session(move |s| s.mark_seen(&uid)).await
    }

    async fn close(&self) {
        let slot = Arc::clone(&self.session);
        let result = tokio::task::spawn_blocking(move || {
            if let Ok(mut guard) = slot.lock()
                && let Some(session) = guard.take()
            {
                session.logout();
            }
        })
        .await;
        if let Err(e) = result {
            warn!("Mailbox logout task failed: {e}");
        }
    }
}
