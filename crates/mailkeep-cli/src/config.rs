use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use mailkeep_mail::MirrorConfig;

#[derive(Debug, Deserialize)]
struct FileConfig {
    imap: ImapSection,
    mirror: MirrorSection,
}

#[derive(Debug, Deserialize)]
struct ImapSection {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    username: String,
    #[serde(default)]
    skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct MirrorSection {
    destination: PathBuf,
    #[serde(default = "default_database")]
    database: String,
    #[serde(default = "default_exclude")]
    exclude: Vec<String>,
    #[serde(default = "default_fetch_delay_ms")]
    fetch_delay_ms: u64,
    #[serde(default = "default_retry_delay_secs")]
    retry_delay_secs: u64,
}

fn default_port() -> u16 {
    993
}

fn default_database() -> String {
    "storage.sqlite".to_string()
}

fn default_exclude() -> Vec<String> {
    vec!["Bulk Mail".to_string(), "Bulk".to_string()]
}

fn default_fetch_delay_ms() -> u64 {
    1000
}

fn default_retry_delay_secs() -> u64 {
    60
}

#[derive(Debug)]
pub struct Config {
    pub mirror: MirrorConfig,
    pub database: String,
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("mailkeep.toml"),
        xdg_config_dir().join("mailkeep").join("mailkeep.toml"),
    ]
}

pub fn load(override_path: Option<&Path>) -> Result<Config> {
    if let Some(path) = override_path {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        return parse(&content);
    }
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            return parse(&content);
        }
    }
    bail!("no mailkeep.toml found; expected one of ./mailkeep.toml or ~/.config/mailkeep/mailkeep.toml");
}

fn parse(content: &str) -> Result<Config> {
    let file: FileConfig = toml::from_str(content).context("invalid mailkeep.toml")?;
    Ok(Config {
        database: file.mirror.database,
        mirror: MirrorConfig {
            host: file.imap.host,
            port: file.imap.port,
            username: file.imap.username,
            skip_tls_verify: file.imap.skip_tls_verify,
            destination: file.mirror.destination,
            exclude: file.mirror.exclude,
            fetch_delay: Duration::from_millis(file.mirror.fetch_delay_ms),
            retry_delay: Duration::from_secs(file.mirror.retry_delay_secs),
        },
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::time::Duration;

    use super::parse;

    #[test]
    fn full_config_round_trips() {
        let config = parse(
            r#"
            [imap]
            host = "imap.example.com"
            port = 143
            username = "me@example.com"
            skip_tls_verify = true

            [mirror]
            destination = "/backup/mail"
            database = "/backup/mailkeep.sqlite"
            exclude = ["Spam"]
            fetch_delay_ms = 250
            retry_delay_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.mirror.host, "imap.example.com");
        assert_eq!(config.mirror.port, 143);
        assert!(config.mirror.skip_tls_verify);
        assert_eq!(config.mirror.destination, PathBuf::from("/backup/mail"));
        assert_eq!(config.database, "/backup/mailkeep.sqlite");
        assert_eq!(config.mirror.exclude, vec!["Spam"]);
        assert_eq!(config.mirror.fetch_delay, Duration::from_millis(250));
        assert_eq!(config.mirror.retry_delay, Duration::from_secs(30));
    }

    #[test]
    fn minimal_config_gets_defaults() {
        let config = parse(
            r#"
            [imap]
            host = "imap.example.com"
            username = "me@example.com"

            [mirror]
            destination = "mail"
            "#,
        )
        .unwrap();

        assert_eq!(config.mirror.port, 993);
        assert!(!config.mirror.skip_tls_verify);
        assert_eq!(config.database, "storage.sqlite");
        assert_eq!(config.mirror.exclude, vec!["Bulk Mail", "Bulk"]);
        assert_eq!(config.mirror.fetch_delay, Duration::from_millis(1000));
        assert_eq!(config.mirror.retry_delay, Duration::from_secs(60));
    }

    #[test]
    fn missing_destination_is_rejected() {
        let err = parse(
            r#"
            [imap]
            host = "imap.example.com"
            username = "me@example.com"

            [mirror]
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("invalid mailkeep.toml"));
    }
}
