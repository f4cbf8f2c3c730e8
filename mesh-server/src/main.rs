//! `mesh-server` process entry point (spec.md §6 "Environment knobs", §6
//! "Process exit codes"). Split into `init` (write the config file and
//! open/migrate the database) and `serve` (bind and run) the way the
//! teacher splits `innernet-server new` from `innernet-server serve`.

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand};
use mesh_server::{
    auth::{Authenticator, JwksAuthenticator, NoAuthenticator, Principal, StaticKeyAuthenticator},
    config::{self, ConfigFile, ServerConfig},
    repository::{Repository, SqliteRepository},
    Context,
};
use std::{collections::HashMap, env, path::PathBuf, sync::Arc};

#[derive(Debug, Parser)]
#[clap(name = "mesh-server", author, version, about)]
struct Opts {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value = "/etc/mesh-server")]
    config_dir: PathBuf,

    #[clap(short, long, default_value = "/var/lib/mesh-server")]
    data_dir: PathBuf,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Write the initial server configuration and create the database.
    Init {
        #[clap(long, default_value = "8080")]
        listen_port: u16,

        /// Validate bearer credentials against an external identity
        /// provider instead of granting every caller admin access.
        #[clap(long)]
        auth_enabled: bool,

        #[clap(long)]
        issuer_url: Option<String>,

        #[clap(long)]
        client_id: Option<String>,

        #[clap(long)]
        client_secret: Option<String>,

        #[clap(long, default_value = "300")]
        jwks_cache_secs: u64,
    },

    /// Run the control-plane server.
    Serve,
}

fn main() {
    if env::var_os("RUST_LOG").is_none() {
        env::set_var("RUST_LOG", "warn,mesh_server=info");
    }
    pretty_env_logger::init();

    if let Err(e) = run() {
        log::error!("{e}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let opts = Opts::parse();
    let conf = ServerConfig::new(opts.config_dir, opts.data_dir);

    match opts.command {
        Command::Init { listen_port, auth_enabled, issuer_url, client_id, client_secret, jwks_cache_secs } => {
            init(&conf, listen_port, auth_enabled, issuer_url, client_id, client_secret, jwks_cache_secs)
        },
        Command::Serve => serve(&conf),
    }
}

fn init(
    conf: &ServerConfig,
    listen_port: u16,
    auth_enabled: bool,
    issuer_url: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    jwks_cache_secs: u64,
) -> anyhow::Result<()> {
    if auth_enabled && issuer_url.is_none() {
        bail!("auth-enabled requires --issuer-url");
    }

    config::ensure_dirs_exist(&[&conf.config_dir, &conf.data_dir])?;

    let config_file =
        ConfigFile { listen_port, auth_enabled, issuer_url, client_id, client_secret, jwks_cache_secs };
    config_file.write_to_path(conf.config_path()).context("writing server config")?;

    SqliteRepository::open(&conf.database_path()).context("creating database")?;

    log::info!("wrote {} and created {}", conf.config_path().display(), conf.database_path().display());
    Ok(())
}

fn serve(conf: &ServerConfig) -> anyhow::Result<()> {
    let config_file = ConfigFile::from_file(conf.config_path()).context("reading server config")?;

    let repo: Arc<dyn Repository> =
        Arc::new(SqliteRepository::open(&conf.database_path()).context("opening database")?);
    let authenticator: Arc<dyn Authenticator> = build_authenticator(&config_file)?;
    let context = Context::new(repo, authenticator);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(mesh_server::serve(context, &config_file))?;
    Ok(())
}

fn build_authenticator(config: &ConfigFile) -> anyhow::Result<Arc<dyn Authenticator>> {
    if !config.auth_enabled {
        log::warn!("authentication disabled: every bearer credential is granted administrator access");
        return Ok(Arc::new(NoAuthenticator::new()));
    }

    let issuer_url = config
        .issuer_url
        .clone()
        .context("auth-enabled but no issuer_url configured")?;
    if let Some(raw) = env::var_os("MESH_SERVER_STATIC_API_KEYS") {
        let keys = parse_static_keys(&raw.to_string_lossy())?;
        return Ok(Arc::new(StaticKeyAuthenticator::new(keys)));
    }

    Ok(Arc::new(JwksAuthenticator::new(issuer_url, config.jwks_cache_duration())))
}

/// Parses `MESH_SERVER_STATIC_API_KEYS` as `key=user_id` pairs separated
/// by commas, one admin `Principal` per key (spec.md §4.7's static-key
/// fallback is scoped to administrators only — see DESIGN.md).
fn parse_static_keys(raw: &str) -> anyhow::Result<HashMap<String, Principal>> {
    raw.split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (key, user_id) = entry
                .split_once('=')
                .with_context(|| format!("malformed static api key entry: {entry}"))?;
            let principal =
                Principal { user_id: user_id.trim().to_string().into(), role: mesh_core::UserRole::Administrator };
            Ok((key.trim().to_string(), principal))
        })
        .collect()
}
