//! IMAP mirroring: response tokenizing, the remote session seam, and the
//! per-mailbox synchronization driver.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use imap::{ClientBuilder, ConnectionMode};
use sha1::{Digest, Sha1};
use thiserror::Error;

use mailkeep_core::{FetchLedger, LocalMailbox, log_debug};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("unbalanced parentheses in response: {0}")]
    UnbalancedParens(String),
    #[error("unterminated quote in response: {0}")]
    UnterminatedQuote(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    /// Connection-level failure. The whole run is retried after a delay.
    #[error("connection lost: {0}")]
    Transport(String),
    /// Protocol-level failure. Aborts the run.
    #[error("protocol error: {0}")]
    Protocol(String),
}

fn session_error(err: imap::Error) -> SessionError {
    match &err {
        imap::Error::Io(_) | imap::Error::ConnectionLost => {
            SessionError::Transport(err.to_string())
        }
        _ if err.to_string().to_lowercase().contains("bye") => {
            SessionError::Transport(err.to_string())
        }
        _ => SessionError::Protocol(err.to_string()),
    }
}

/// Splits one protocol response line into its top-level tokens.
///
/// `(\HasNoChildren) "." "INBOX.Sent"` yields three tokens: the
/// parenthesized group, `"."`, and `"INBOX.Sent"`, quotes intact.
pub fn split_response(input: &str) -> Result<Vec<String>, ResponseError> {
    let mut rest = input.trim();
    let mut tokens = Vec::new();
    while !rest.is_empty() {
        match rest.as_bytes()[0] {
            b'(' => {
                let bytes = rest.as_bytes();
                let mut depth = 1usize;
                let mut i = 1usize;
                while depth > 0 {
                    if i >= bytes.len() {
                        return Err(ResponseError::UnbalancedParens(input.to_string()));
                    }
                    match bytes[i] {
                        b')' => depth -= 1,
                        b'(' => depth += 1,
                        _ => {}
                    }
                    i += 1;
                }
                tokens.push(rest[..i].to_string());
                rest = rest[i..].trim_start();
            }
            b'"' => {
                let (quoted, after) = split_quoted(rest)?;
                tokens.push(quoted.to_string());
                rest = after;
            }
            _ => match rest.find(char::is_whitespace) {
                Some(end) => {
                    tokens.push(rest[..end].to_string());
                    rest = rest[end..].trim_start();
                }
                None => {
                    tokens.push(rest.to_string());
                    rest = "";
                }
            },
        }
    }
    Ok(tokens)
}

/// Scans a token whose first byte is a quote character, returning the token
/// through the matching closing quote (escapes intact) and the remainder
/// with leading whitespace stripped.
///
/// A quote preceded by an odd number of consecutive backslashes is escaped
/// and does not terminate the token.
pub fn split_quoted(s: &str) -> Result<(&str, &str), ResponseError> {
    let bytes = s.as_bytes();
    let quote = bytes[0];
    let mut from = 1;
    loop {
        let Some(off) = bytes[from..].iter().position(|&b| b == quote) else {
            return Err(ResponseError::UnterminatedQuote(s.to_string()));
        };
        let pos = from + off;
        let mut backslashes = 0;
        while pos - backslashes > 1 && bytes[pos - 1 - backslashes] == b'\\' {
            backslashes += 1;
        }
        if backslashes % 2 == 0 {
            return Ok((&s[..pos + 1], s[pos + 1..].trim_start()));
        }
        from = pos + 1;
    }
}

/// Strips surrounding double quotes and unescapes `\"` then `\\`, in that
/// order. Tokens not bounded by quotes pass through unchanged.
pub fn unquote(token: &str) -> String {
    if token.len() >= 2 && token.starts_with('"') && token.ends_with('"') {
        token[1..token.len() - 1]
            .replace("\\\"", "\"")
            .replace("\\\\", "\\")
    } else {
        token.to_string()
    }
}

#[derive(Debug, Clone)]
pub struct MirrorConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub skip_tls_verify: bool,
    pub destination: PathBuf,
    pub exclude: Vec<String>,
    pub fetch_delay: Duration,
    pub retry_delay: Duration,
}

/// The remote side of a mirror run. Implemented over a live IMAP session;
/// tests substitute a scripted double.
pub trait RemoteSession {
    /// Raw `* LIST` payload lines, one per mailbox.
    fn list_raw(&mut self) -> Result<Vec<String>, SessionError>;
    /// Read-only select; returns the reported message count.
    fn examine(&mut self, mailbox: &str) -> Result<u32, SessionError>;
    /// All UIDs of the currently examined mailbox.
    fn uid_search_all(&mut self) -> Result<BTreeSet<u32>, SessionError>;
    /// Full fetch of one message: raw metadata line and the literal body.
    fn uid_fetch_full(&mut self, uid: u32) -> Result<(String, Vec<u8>), SessionError>;
    fn logout(&mut self) -> Result<(), SessionError>;
}

pub struct ImapSession {
    session: imap::Session<imap::Connection>,
}

impl ImapSession {
    pub fn connect(config: &MirrorConfig, password: &str) -> Result<Self, SessionError> {
        log_debug(&format!(
            "imap connect host={} port={}",
            config.host, config.port
        ));
        let client = ClientBuilder::new(config.host.as_str(), config.port)
            .tls_kind(imap::TlsKind::Native)
            .mode(ConnectionMode::AutoTls)
            .danger_skip_tls_verify(config.skip_tls_verify)
            .connect()
            .map_err(session_error)?;
        let session = client
            .login(&config.username, password)
            .map_err(|e| session_error(e.0))?;
        log_debug("imap login ok");
        Ok(Self { session })
    }
}

impl RemoteSession for ImapSession {
    fn list_raw(&mut self) -> Result<Vec<String>, SessionError> {
        let response = self
            .session
            .run_command_and_read_response("LIST \"\" \"*\"")
            .map_err(session_error)?;
        let text = String::from_utf8_lossy(&response);
        Ok(text
            .lines()
            .filter_map(|line| line.trim_end().strip_prefix("* LIST "))
            .map(|entry| entry.to_string())
            .collect())
    }

    fn examine(&mut self, mailbox: &str) -> Result<u32, SessionError> {
        let selected = self.session.examine(mailbox).map_err(session_error)?;
        Ok(selected.exists)
    }

    fn uid_search_all(&mut self) -> Result<BTreeSet<u32>, SessionError> {
        let uids = self.session.uid_search("ALL").map_err(session_error)?;
        Ok(uids.into_iter().collect())
    }

    fn uid_fetch_full(&mut self, uid: u32) -> Result<(String, Vec<u8>), SessionError> {
        let command = format!("UID FETCH {} (FLAGS INTERNALDATE BODY.PEEK[])", uid);
        let response = self
            .session
            .run_command_and_read_response(&command)
            .map_err(session_error)?;
        split_fetch_literal(&response).ok_or_else(|| {
            SessionError::Protocol(format!("fetch of uid {} returned no literal body", uid))
        })
    }

    fn logout(&mut self) -> Result<(), SessionError> {
        self.session.logout().map_err(session_error)
    }
}

// A full fetch comes back as one metadata line announcing the body with a
// trailing `{n}` literal marker, followed by n body bytes.
fn split_fetch_literal(response: &[u8]) -> Option<(String, Vec<u8>)> {
    let header_end = response.windows(2).position(|w| w == b"\r\n")?;
    let metadata = String::from_utf8_lossy(&response[..header_end]).into_owned();
    let open = metadata.rfind('{')?;
    let size: usize = metadata[open + 1..].strip_suffix('}')?.parse().ok()?;
    let body_start = header_end + 2;
    let body = response.get(body_start..body_start + size)?.to_vec();
    Some((metadata, body))
}

fn sha1_hex(data: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

fn is_transport_error(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::Transport(_))
    )
}

pub struct Mirror {
    config: MirrorConfig,
    ledger: Arc<dyn FetchLedger>,
    runtime: Arc<tokio::runtime::Runtime>,
    interrupt: Arc<AtomicBool>,
}

impl Mirror {
    pub fn new(
        config: MirrorConfig,
        ledger: Arc<dyn FetchLedger>,
        runtime: Arc<tokio::runtime::Runtime>,
        interrupt: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            ledger,
            runtime,
            interrupt,
        }
    }

    fn interrupted(&self) -> bool {
        self.interrupt.load(Ordering::Relaxed)
    }

    /// Outer run loop: a transport-level failure restarts the whole
    /// enumerate-and-sync pass after a fixed delay, indefinitely. Anything
    /// else aborts. Already-mirrored messages are re-detected on restart, so
    /// a retry costs re-enumeration, not re-fetching.
    pub fn run(&self, password: &str) -> Result<()> {
        loop {
            if self.interrupted() {
                return Ok(());
            }
            match self.run_once(password) {
                Ok(()) => return Ok(()),
                Err(err) if is_transport_error(&err) => {
                    eprintln!(
                        "connection lost, retrying in {}s: {}",
                        self.config.retry_delay.as_secs(),
                        err
                    );
                    log_debug(&format!("transport failure, backing off: {}", err));
                    std::thread::sleep(self.config.retry_delay);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_once(&self, password: &str) -> Result<()> {
        let mut session = ImapSession::connect(&self.config, password)?;
        let result = self.sync_all(&mut session);
        let _ = session.logout();
        result
    }

    /// One full enumerate-and-sync pass over every listed mailbox.
    pub fn sync_all(&self, session: &mut dyn RemoteSession) -> Result<()> {
        for line in session.list_raw()? {
            if self.interrupted() {
                log_debug("interrupted between mailboxes");
                return Ok(());
            }
            let tokens = split_response(&line)?;
            let [_flags, _delimiter, name] = tokens.as_slice() else {
                bail!("unexpected LIST entry: {}", line);
            };
            let name = unquote(name);
            if self.config.exclude.iter().any(|excluded| excluded == &name) {
                continue;
            }
            self.sync_mailbox(session, &name)?;
        }
        Ok(())
    }

    fn sync_mailbox(&self, session: &mut dyn RemoteSession, name: &str) -> Result<()> {
        let remote_count = session.examine(name)? as usize;
        let local = LocalMailbox::open(&self.config.destination, name)?;
        let local_count = local.count()?;
        if remote_count == local_count {
            log_debug(&format!("{} up to date ({} messages)", name, remote_count));
            return Ok(());
        }

        eprintln!(
            "{} missing {}",
            name,
            remote_count as i64 - local_count as i64
        );

        let remote_uids = session.uid_search_all()?;
        let local_uids = local.existing_uids()?;
        if !local_uids.is_subset(&remote_uids) {
            bail!("mailbox {}: local uids are not a subset of remote uids", name);
        }
        let missing: Vec<u32> = remote_uids.difference(&local_uids).copied().collect();
        if missing.len() as i64 != remote_count as i64 - local_count as i64 {
            bail!(
                "mailbox {}: {} uids to fetch but counts differ by {}",
                name,
                missing.len(),
                remote_count as i64 - local_count as i64
            );
        }

        let total = missing.len();
        for (index, uid) in missing.into_iter().enumerate() {
            if self.interrupted() {
                log_debug(&format!("interrupted in {} before uid {}", name, uid));
                return Ok(());
            }
            let (metadata, content) = session.uid_fetch_full(uid)?;
            local.store(uid, &content, &metadata)?;
            let checksum = sha1_hex(&content);
            self.runtime
                .block_on(self.ledger.append(name, uid, &metadata, &checksum))?;
            eprintln!("{}: fetched {}/{} (uid {})", name, index + 1, total, uid);
            std::thread::sleep(self.config.fetch_delay);
        }
        Ok(())
    }
}
