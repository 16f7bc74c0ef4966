//! Command line interface for operating the bridge. Supports initialization,
//! running the bridge with its health endpoint, inspecting replay watermarks,
//! and clearing stuck leases.

mod config;
mod event;
mod invoice;
mod ledger;
mod lightning;
mod lnd;
mod logging;
mod nip04;
mod outbox;
mod pool;
mod relay;
mod replay;
mod server;
mod settlement;
mod store;
mod subscriptions;
mod transaction;

use std::{
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context;
use clap::{Parser, Subcommand};
use config::Settings;
use tracing::{error, info, warn};

use crate::{
    event::Keys,
    lightning::PaymentBackend,
    lnd::{LndClient, LndConfig},
    outbox::Outbox,
    pool::{Nip11Probe, PoolConfig, RelayPool, WsConnector, DEFAULT_PROBE_TIMEOUT},
    relay::RelaySet,
    replay::ReplayTracker,
    settlement::{invoice_status, issue_invoice, SettlementGuard},
    store::{lease_key, CoordinationStore, FileStore},
    subscriptions::{ack_filter, Registry, SubscriptionKey, SubscriptionRunner},
    transaction::TransactionMachine,
};

const SETTLEMENT_RETRY: Duration = Duration::from_secs(5);

/// Command line interface entry point.
#[derive(Parser)]
#[command(
    name = "zapbridge",
    author,
    version,
    about = "Nostr to Lightning payment bridge",
    short_flag = 'v',
    long_flag = "version"
)]
struct Cli {
    /// Path to the `.env` configuration file.
    #[arg(long, default_value = ".env")]
    env: String,
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

/// Supported CLI subcommands.
#[derive(Subcommand)]
enum Commands {
    /// Create the coordination store under `STORE_ROOT`.
    Init,
    /// Run the bridge and its HTTP endpoint.
    Serve,
    /// Print replay watermarks per subscription.
    Status,
    /// Issue an invoice that credits `pubkey` on the ledger once paid.
    Invoice {
        /// Hex public key receiving the funds.
        pubkey: String,
        amount_msat: u128,
        /// Memo carried into the ledger credit.
        #[arg(long)]
        comment: Option<String>,
    },
    /// Report whether an invoice is settled, with its preimage once it is.
    InvoiceStatus {
        /// Hex payment hash of the invoice.
        payment_hash: String,
    },
    /// Clear a stuck settlement or acknowledgement lease.
    ReleaseLease {
        /// Payment request of the invoice, or an acknowledgement id with `--ack`.
        target: String,
        /// Treat `target` as an acknowledgement event id.
        #[arg(long)]
        ack: bool,
    },
}

/// Execute the selected CLI subcommand.
async fn run(cli: Cli) -> anyhow::Result<()> {
    ensure_env_file(&cli.env)?;
    let cfg = Settings::from_env(&cli.env)?;
    logging::init(cfg.log_format);
    let store = FileStore::new(cfg.coord_dir());
    match cli.command {
        Commands::Init => {
            store.init()?;
            info!(root = %display_path(&cfg.coord_dir()), "store initialized");
        }
        Commands::Serve => {
            store.init()?;
            serve(cfg, Arc::new(store), shutdown_signal()).await?;
        }
        Commands::Status => {
            let tracker = ReplayTracker::new(Arc::new(store), cfg.resume_tolerance);
            for (key, mark) in server::watermarks(&tracker).await? {
                match mark {
                    Some(ts) => println!("{key}\t{ts}"),
                    None => println!("{key}\t-"),
                }
            }
        }
        Commands::Invoice {
            pubkey,
            amount_msat,
            comment,
        } => {
            let backend = lnd_backend(&cfg)?;
            let invoice =
                issue_invoice(backend.as_ref(), &store, pubkey.trim(), amount_msat, comment.as_deref())
                    .await?;
            println!("{}", invoice.payment_request);
        }
        Commands::InvoiceStatus { payment_hash } => {
            let backend = lnd_backend(&cfg)?;
            let status = invoice_status(backend.as_ref(), &store, payment_hash.trim()).await?;
            println!("{}", serde_json::to_string(&status)?);
        }
        Commands::ReleaseLease { target, ack } => {
            let key = if ack {
                target.trim().to_string()
            } else {
                invoice::hash_payment_request(target.trim())
            };
            if store.del(&lease_key(&key)).await? {
                println!("released {key}");
            } else {
                println!("no lease held for {key}");
            }
        }
    }
    Ok(())
}

/// Wire every component and run until `shutdown` resolves.
async fn serve(
    cfg: Settings,
    store: Arc<dyn CoordinationStore>,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    cfg.ensure_bridge_ready()?;
    let backend = lnd_backend(&cfg)?;
    let http_addr: SocketAddr = cfg.bind_http.as_str().parse().context("parsing BIND_HTTP")?;
    let secret = cfg.nostr_private_key.as_deref().unwrap_or_default();
    let keys = Keys::from_hex(secret).context("parsing NOSTR_PRIVATE_KEY")?;
    let ledger = cfg.ledger_public_key.clone().unwrap_or_default();

    let read = Arc::new(RelaySet::new(cfg.read_relays.clone(), cfg.tor_socks.clone()));
    let write = Arc::new(RelaySet::new(cfg.write_relays.clone(), cfg.tor_socks.clone()));
    let outbox = Arc::new(Outbox::new(keys.clone(), write));
    let pool = Arc::new(RelayPool::new(
        Arc::new(Nip11Probe::new(DEFAULT_PROBE_TIMEOUT)?),
        Arc::new(WsConnector::new(cfg.tor_socks.clone())),
        PoolConfig {
            idle_ttl: cfg.relay_idle,
            reachability_ttl: cfg.reachability_ttl,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        },
    ));
    let machine = TransactionMachine::new(
        ledger.clone(),
        store.clone(),
        read.clone(),
        backend.clone(),
        outbox.clone(),
    )
    .with_pay_timeout(cfg.pay_timeout)
    .with_lease_ttl(cfg.lease_ttl);
    let registry = Registry::new().register(
        SubscriptionKey::InternalTransactionOk,
        ack_filter(keys.public_hex()),
        Arc::new(machine),
    );
    let tracker = Arc::new(ReplayTracker::new(store.clone(), cfg.resume_tolerance));
    let runner = Arc::new(SubscriptionRunner::new(read, tracker.clone(), registry));
    let guard = Arc::new(
        SettlementGuard::new(ledger, store, outbox, pool.clone())
            .with_lease_ttl(cfg.lease_ttl)
            .with_fanout(cfg.receipt_fanout),
    );

    info!(service = keys.public_hex(), relays = cfg.read_relays.len(), "bridge starting");
    let subscriptions = tokio::spawn(runner.run());
    let settlements = tokio::spawn(async move {
        loop {
            match guard.clone().run(backend.clone()).await {
                Ok(()) => warn!("settlement stream closed, reconnecting"),
                Err(e) => error!(error = %e, "settlement stream failed"),
            }
            tokio::time::sleep(SETTLEMENT_RETRY).await;
        }
    });

    let result = server::serve_http(http_addr, tracker, pool, shutdown).await;
    subscriptions.abort();
    settlements.abort();
    info!("bridge stopped");
    result
}

fn lnd_backend(cfg: &Settings) -> anyhow::Result<Arc<dyn PaymentBackend>> {
    cfg.ensure_lnd_ready()?;
    // Relay TLS and the LND client share one process-wide rustls provider.
    let _ = rustls::crypto::ring::default_provider().install_default();
    Ok(Arc::new(LndClient::new(LndConfig {
        host: cfg.lnd_host.clone().unwrap_or_default(),
        macaroon_hex: cfg.lnd_macaroon.clone().unwrap_or_default(),
        cert_path: cfg.lnd_cert.clone(),
        pay_timeout: cfg.pay_timeout,
        fee_limit_msat: cfg.pay_fee_limit_msat,
    })?))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}

/// Create a default `.env` file if one is not already present at `path`.
fn ensure_env_file(path: &str) -> anyhow::Result<()> {
    let env_path = Path::new(path);
    if env_path.exists() {
        return Ok(());
    }
    if let Some(parent) = env_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let base_dir = match env_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => std::env::current_dir()?,
    };
    let store_root = base_dir.join("zapbridge-data");
    let mut content = String::new();
    content.push_str(&format!("STORE_ROOT='{}'\n", display_path(&store_root)));
    content.push_str("BIND_HTTP=127.0.0.1:7777\n");
    content.push_str("NOSTR_PRIVATE_KEY=\n");
    content.push_str("LEDGER_PUBLIC_KEY=\n");
    content.push_str("# Relay lists are comma separated; quote a list that contains spaces.\n");
    content.push_str("NOSTR_RELAYS=\n");
    content.push_str("NOSTR_WRITE_RELAY=\n");
    content.push_str("LND_HOST=https://127.0.0.1:8080\n");
    content.push_str("LND_MACAROON=\n");
    content.push_str("LND_CERT=\n");
    content.push_str("TOR_SOCKS=\n");
    content.push_str("LOG_FORMAT=pretty\n");
    fs::write(env_path, content)?;
    Ok(())
}

fn display_path(path: &PathBuf) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(not(test))]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    run(cli).await
}
