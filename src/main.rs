//! sbrwxmpp - XMPP server variant for the SBRW game chat client.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use sbrwxmpp::api::{self, ApiContext};
use sbrwxmpp::certgen;
use sbrwxmpp::cmdhook::CmdHook;
use sbrwxmpp::config::{Config, ConfigError};
use sbrwxmpp::db::Db;
use sbrwxmpp::network::Gateway;
use sbrwxmpp::state::Registry;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CERT_DIR: &str = "sbrwxmpp-certs";
const DB_PATH: &str = "sbrwxmpp.db";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_or_generate_config()?;
    init_logging(&config)?;

    info!(domain = %config.domain, addr = %config.addr, "starting sbrwxmpp");

    let (cert_path, key_path) = tls_material(&config)?;
    let acceptor = certgen::load_acceptor(&cert_path, &key_path).map_err(|e| {
        error!(error = %e, "failed to load tls material");
        e
    })?;

    let db = Db::open(DB_PATH).map_err(|e| {
        error!(error = %e, "failed to open database");
        e
    })?;

    let registry = Arc::new(Registry::new(config.domain.clone()));
    let webhook = Arc::new(CmdHook::new(config.webhook.clone())?);

    let api_ctx = ApiContext {
        registry: Arc::clone(&registry),
        db: db.clone(),
        key: config.api.key.clone(),
    };
    let api_addr = config.api.addr.clone();
    tokio::spawn(async move {
        let listener = match tokio::net::TcpListener::bind(&api_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!(addr = %api_addr, error = %e, "failed to bind admin api");
                return;
            }
        };
        if let Err(e) = api::serve(api_ctx, listener).await {
            error!(error = %e, "admin api error");
        }
    });

    let gateway = Gateway::bind(&config.addr, acceptor, registry, db, webhook).await?;
    info!("server running");
    gateway.run().await?;
    Ok(())
}

/// Load `./sbrwxmpp.toml`, writing the default skeleton first if the file
/// does not exist yet.
fn load_or_generate_config() -> Result<Config, ConfigError> {
    match Config::load(sbrwxmpp::config::DEFAULT_PATH) {
        Ok(config) => Ok(config),
        Err(ConfigError::Io(e)) if e.kind() == ErrorKind::NotFound => {
            eprintln!("No configuration found, generating");
            Config::write_default(sbrwxmpp::config::DEFAULT_PATH)?;
            Config::load(sbrwxmpp::config::DEFAULT_PATH)
        }
        Err(e) => Err(e),
    }
}

/// Initialize the tracing subscriber. A `[logging]` entry for the `server`
/// category can redirect output to a file; the default is stderr.
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    match config
        .logging
        .get("server")
        .map(|category| category.destination.as_str())
    {
        Some(path) if !path.is_empty() && path != "stderr" => {
            let file = std::fs::File::create(path)?;
            builder.with_writer(Arc::new(file)).init();
        }
        _ => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

/// Resolve the certificate and key paths, generating a self-signed pair
/// under `sbrwxmpp-certs/` when the config names none.
fn tls_material(config: &Config) -> anyhow::Result<(PathBuf, PathBuf)> {
    if !config.cert.is_empty() && !config.certkey.is_empty() {
        return Ok((PathBuf::from(&config.cert), PathBuf::from(&config.certkey)));
    }
    warn!("no certificate specified, using selfsigned certificate");
    let dir = Path::new(CERT_DIR);
    let cert_path = dir.join(format!("{}.crt", config.domain));
    let key_path = dir.join(format!("{}.key", config.domain));
    if !cert_path.exists() {
        info!(domain = %config.domain, "no certificate found, generating new");
        std::fs::create_dir_all(dir)?;
        certgen::generate_certificate(dir, &config.domain)?;
    }
    Ok((cert_path, key_path))
}
