//! Local mailbox storage and the append-only fetch ledger.

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use mailparse::dateparse;
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};

static LOG_FILE: OnceLock<Mutex<Option<std::fs::File>>> = OnceLock::new();

pub fn log_debug(msg: &str) {
    if std::env::var("MAILKEEP_LOG").is_err() {
        return;
    }
    let base = std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"));
    let path = base.join("mailkeep").join("mailkeep.log");
    let lock = LOG_FILE.get_or_init(|| {
        let _ = std::fs::create_dir_all(
            path.parent()
                .unwrap_or_else(|| std::path::Path::new("/tmp")),
        );
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .ok();
        Mutex::new(file)
    });
    if let Ok(mut guard) = lock.lock() {
        if let Some(file) = guard.as_mut() {
            let ts = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let _ = writeln!(file, "[{}] {}", ts, msg);
        }
    }
}

/// Extracts the INTERNALDATE timestamp from a raw fetch metadata line.
///
/// Only the fixed `DD-Mon-YYYY HH:MM:SS +0000` form is recognized. Anything
/// else yields `None` so callers can treat absence as a fallback path.
pub fn internal_date(metadata: &str) -> Option<DateTime<Utc>> {
    let start = metadata.find("INTERNALDATE \"")? + "INTERNALDATE \"".len();
    let end = metadata[start..].find('"')? + start;
    let stamp = metadata[start..end].strip_suffix(" +0000")?;
    let naive = NaiveDateTime::parse_from_str(stamp.trim_start(), "%d-%b-%Y %H:%M:%S").ok()?;
    Some(Utc.from_utc_datetime(&naive))
}

fn date_header_ts(content: &[u8]) -> Option<i64> {
    let (headers, _) = mailparse::parse_headers(content).ok()?;
    for header in headers.iter() {
        if header.get_key_ref().eq_ignore_ascii_case("Date") {
            return dateparse(header.get_value().trim()).ok();
        }
    }
    None
}

/// One mailbox mirrored as a directory of `<uid>.eml` files.
pub struct LocalMailbox {
    path: PathBuf,
}

impl LocalMailbox {
    pub fn open(root: &Path, mailbox: &str) -> Result<Self> {
        let path = root.join(mailbox);
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating mailbox directory {}", path.display()))?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn count(&self) -> Result<usize> {
        let entries = std::fs::read_dir(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?;
        Ok(entries.count())
    }

    /// UIDs already present on disk. Every entry must match `<uid>.eml`;
    /// a stray file fails the run rather than being skipped.
    pub fn existing_uids(&self) -> Result<BTreeSet<u32>> {
        let mut uids = BTreeSet::new();
        for entry in std::fs::read_dir(&self.path)
            .with_context(|| format!("reading {}", self.path.display()))?
        {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            let uid = name
                .strip_suffix(".eml")
                .and_then(|stem| stem.parse::<u32>().ok())
                .with_context(|| {
                    format!("stray file in mailbox {}: {}", self.path.display(), name)
                })?;
            uids.insert(uid);
        }
        Ok(uids)
    }

    /// Writes a new message atomically and stamps its mtime with the logical
    /// send time: the Date header when parseable, INTERNALDATE otherwise.
    pub fn store(&self, uid: u32, content: &[u8], metadata: &str) -> Result<()> {
        let target = self.path.join(format!("{}.eml", uid));
        if target.exists() {
            bail!("duplicate store of uid {} in {}", uid, self.path.display());
        }

        let ts = match date_header_ts(content) {
            Some(ts) => ts,
            None => {
                eprintln!(
                    "{} has no parseable Date header, using INTERNALDATE",
                    target.display()
                );
                log_debug(&format!(
                    "internal date fallback for {}",
                    target.display()
                ));
                internal_date(metadata)
                    .map(|dt| dt.timestamp())
                    .with_context(|| format!("no usable timestamp for uid {}", uid))?
            }
        };

        let mut tmp = tempfile::NamedTempFile::new_in(&self.path)?;
        tmp.write_all(content)?;
        tmp.persist_noclobber(&target)
            .map_err(|e| e.error)
            .with_context(|| format!("persisting {}", target.display()))?;

        let tv = nix::sys::time::TimeVal::new(ts as nix::libc::time_t, 0);
        nix::sys::stat::utimes(&target, &tv, &tv)
            .with_context(|| format!("setting mtime on {}", target.display()))?;
        Ok(())
    }
}

#[async_trait]
pub trait FetchLedger: Send + Sync {
    async fn append(&self, mailbox: &str, uid: u32, metadata: &str, sha1: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub async fn connect(path: &str) -> Result<Self> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{}", path)
        };
        let options = SqliteConnectOptions::new()
            .filename(url.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS fetch_log (
               id INTEGER PRIMARY KEY AUTOINCREMENT,
               mailbox TEXT NOT NULL,
               uid INTEGER NOT NULL,
               metadata TEXT NOT NULL,
               created_at TEXT NOT NULL,
               sha1 TEXT NOT NULL
             )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl FetchLedger for SqliteLedger {
    async fn append(&self, mailbox: &str, uid: u32, metadata: &str, sha1: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO fetch_log (mailbox, uid, metadata, created_at, sha1)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(mailbox)
        .bind(uid as i64)
        .bind(metadata)
        .bind(Utc::now().to_rfc3339())
        .bind(sha1)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
