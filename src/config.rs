//! Configuration loading from `.env` files.

use std::{env, path::PathBuf, str::FromStr, time::Duration};

use anyhow::{anyhow, bail, Context, Result};

use crate::replay::DEFAULT_TOLERANCE;

/// Output format of the log subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(anyhow!("unknown LOG_FORMAT `{other}`")),
        }
    }
}

/// Runtime settings derived from environment variables.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root directory for the coordination store.
    pub store_root: PathBuf,
    /// HTTP bind address for health and status, e.g. `127.0.0.1:7777`.
    pub bind_http: String,
    /// Hex secret of the service identity.
    pub nostr_private_key: Option<String>,
    /// Public key of the ledger the bridge moves funds for.
    pub ledger_public_key: Option<String>,
    /// Relays acknowledgements and start events are read from.
    pub read_relays: Vec<String>,
    /// Durable relays every service event is published to.
    pub write_relays: Vec<String>,
    /// Optional Tor SOCKS proxy (host:port).
    pub tor_socks: Option<String>,
    /// Base URL of the LND REST listener.
    pub lnd_host: Option<String>,
    /// Hex encoded admin macaroon.
    pub lnd_macaroon: Option<String>,
    /// PEM certificate of the LND REST listener.
    pub lnd_cert: Option<PathBuf>,
    pub pay_timeout: Duration,
    pub pay_fee_limit_msat: u64,
    pub resume_tolerance: Duration,
    pub relay_idle: Duration,
    pub reachability_ttl: Duration,
    pub lease_ttl: Duration,
    pub receipt_fanout: usize,
    pub log_format: LogFormat,
}

impl Settings {
    /// Load settings from the specified `.env` file.
    pub fn from_env(path: &str) -> Result<Self> {
        dotenvy::from_filename(path).with_context(|| format!("reading env file {path}"))?;
        let store_root = PathBuf::from(env::var("STORE_ROOT").context("STORE_ROOT is not set")?);
        let bind_http = env::var("BIND_HTTP").context("BIND_HTTP is not set")?;
        Ok(Self {
            store_root,
            bind_http,
            nostr_private_key: non_empty("NOSTR_PRIVATE_KEY"),
            ledger_public_key: non_empty("LEDGER_PUBLIC_KEY"),
            read_relays: csv_strings(env::var("NOSTR_RELAYS").unwrap_or_default()),
            write_relays: csv_strings(env::var("NOSTR_WRITE_RELAY").unwrap_or_default()),
            tor_socks: non_empty("TOR_SOCKS"),
            lnd_host: non_empty("LND_HOST"),
            lnd_macaroon: non_empty("LND_MACAROON"),
            lnd_cert: non_empty("LND_CERT").map(PathBuf::from),
            pay_timeout: secs("PAY_TIMEOUT_SECS", 5)?,
            pay_fee_limit_msat: number("PAY_FEE_LIMIT_MSAT", 1001)?,
            resume_tolerance: secs("RESUME_TOLERANCE_SECS", DEFAULT_TOLERANCE.as_secs())?,
            relay_idle: secs("RELAY_IDLE_SECS", 600)?,
            reachability_ttl: secs("REACHABILITY_TTL_SECS", 86_400)?,
            lease_ttl: secs("LEASE_TTL_SECS", 600)?,
            receipt_fanout: number("RECEIPT_FANOUT", 5)?,
            log_format: env::var("LOG_FORMAT").unwrap_or_default().parse()?,
        })
    }

    /// Settings `serve` cannot run without.
    pub fn ensure_bridge_ready(&self) -> Result<()> {
        require(&[
            ("NOSTR_PRIVATE_KEY", self.nostr_private_key.is_none()),
            ("LEDGER_PUBLIC_KEY", self.ledger_public_key.is_none()),
            ("LND_HOST", self.lnd_host.is_none()),
            ("LND_MACAROON", self.lnd_macaroon.is_none()),
            ("NOSTR_RELAYS", self.read_relays.is_empty()),
            ("NOSTR_WRITE_RELAY", self.write_relays.is_empty()),
        ])
    }

    /// Settings needed to talk to LND at all.
    pub fn ensure_lnd_ready(&self) -> Result<()> {
        require(&[
            ("LND_HOST", self.lnd_host.is_none()),
            ("LND_MACAROON", self.lnd_macaroon.is_none()),
        ])
    }

    /// Directory of the coordination store.
    pub fn coord_dir(&self) -> PathBuf {
        self.store_root.join("coord")
    }
}

fn require(checks: &[(&str, bool)]) -> Result<()> {
    let missing: Vec<&str> = checks
        .iter()
        .filter_map(|(name, absent)| absent.then_some(*name))
        .collect();
    if !missing.is_empty() {
        bail!("missing configuration: {}", missing.join(", "));
    }
    Ok(())
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|s| !s.trim().is_empty())
}

fn number<T: FromStr>(name: &str, default: T) -> Result<T> {
    match non_empty(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| anyhow!("{name} must be a number, got `{raw}`")),
        None => Ok(default),
    }
}

fn secs(name: &str, default: u64) -> Result<Duration> {
    number(name, default).map(Duration::from_secs)
}

/// Split a comma-separated string into trimmed string values.
pub fn csv_strings(input: impl AsRef<str>) -> Vec<String> {
    input
        .as_ref()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::{fs, sync::Mutex};
    use tempfile::tempdir;

    pub(crate) static ENV_MUTEX: Mutex<()> = Mutex::new(());

    pub(crate) const VARS: [&str; 19] = [
        "STORE_ROOT",
        "BIND_HTTP",
        "NOSTR_PRIVATE_KEY",
        "LEDGER_PUBLIC_KEY",
        "NOSTR_RELAYS",
        "NOSTR_WRITE_RELAY",
        "TOR_SOCKS",
        "LND_HOST",
        "LND_MACAROON",
        "LND_CERT",
        "PAY_TIMEOUT_SECS",
        "PAY_FEE_LIMIT_MSAT",
        "RESUME_TOLERANCE_SECS",
        "RELAY_IDLE_SECS",
        "REACHABILITY_TTL_SECS",
        "LEASE_TTL_SECS",
        "RECEIPT_FANOUT",
        "LOG_FORMAT",
        "RUST_LOG",
    ];

    pub(crate) fn clear_env() {
        for v in VARS {
            env::remove_var(v);
        }
    }

    #[test]
    fn loads_env() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            concat!(
                "STORE_ROOT=/tmp/bridge\n",
                "BIND_HTTP=127.0.0.1:8080\n",
                "NOSTR_PRIVATE_KEY=0101\n",
                "LEDGER_PUBLIC_KEY=ledger\n",
                "NOSTR_RELAYS=\"wss://r1, wss://r2\"\n",
                "NOSTR_WRITE_RELAY=wss://write\n",
                "TOR_SOCKS=\n",
                "LND_HOST=https://127.0.0.1:8080\n",
                "LND_MACAROON=abcd\n",
                "PAY_TIMEOUT_SECS=9\n",
                "RECEIPT_FANOUT=3\n",
                "LOG_FORMAT=json\n"
            ),
        )
        .unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.store_root, PathBuf::from("/tmp/bridge"));
        assert_eq!(cfg.coord_dir(), PathBuf::from("/tmp/bridge/coord"));
        assert_eq!(cfg.read_relays, vec!["wss://r1", "wss://r2"]);
        assert_eq!(cfg.write_relays, vec!["wss://write"]);
        assert_eq!(cfg.tor_socks, None);
        assert_eq!(cfg.pay_timeout, Duration::from_secs(9));
        assert_eq!(cfg.pay_fee_limit_msat, 1001);
        assert_eq!(cfg.resume_tolerance, Duration::from_secs(360));
        assert_eq!(cfg.lease_ttl, Duration::from_secs(600));
        assert_eq!(cfg.receipt_fanout, 3);
        assert_eq!(cfg.log_format, LogFormat::Json);
        cfg.ensure_bridge_ready().unwrap();
    }

    #[test]
    fn unquoted_list_with_spaces_is_rejected() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(
            &env_path,
            "STORE_ROOT=/tmp\nBIND_HTTP=127.0.0.1:0\nNOSTR_RELAYS=wss://r1, wss://r2\n",
        )
        .unwrap();
        let err = Settings::from_env(env_path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().starts_with("reading env file"));
    }

    #[test]
    fn missing_bridge_settings_are_listed() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "STORE_ROOT=/tmp\nBIND_HTTP=127.0.0.1:0\nLND_HOST=x\n").unwrap();
        let cfg = Settings::from_env(env_path.to_str().unwrap()).unwrap();
        let err = cfg.ensure_bridge_ready().unwrap_err().to_string();
        assert!(err.contains("NOSTR_PRIVATE_KEY"));
        assert!(err.contains("NOSTR_WRITE_RELAY"));
        assert!(!err.contains("LND_HOST"));
        let err = cfg.ensure_lnd_ready().unwrap_err().to_string();
        assert_eq!(err, "missing configuration: LND_MACAROON");
    }

    #[test]
    fn invalid_numbers_are_rejected() {
        let _g = ENV_MUTEX.lock().unwrap_or_else(|e| e.into_inner());
        clear_env();
        let dir = tempdir().unwrap();
        let env_path = dir.path().join(".env");
        fs::write(&env_path, "STORE_ROOT=/tmp\nBIND_HTTP=127.0.0.1:0\nLEASE_TTL_SECS=soon\n").unwrap();
        let err = Settings::from_env(env_path.to_str().unwrap()).unwrap_err();
        assert!(err.to_string().contains("LEASE_TTL_SECS"));
    }

    #[test]
    fn csv_helpers() {
        assert_eq!(csv_strings("a, b , ,c"), vec!["a", "b", "c"]);
        assert!(csv_strings("").is_empty());
    }

    #[test]
    fn log_format_parses() {
        assert_eq!("".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
