//! Beacon presence server
//!
//! WebSocket presence endpoint with liveness reaping and ICE server issuance.
//!
//! # Usage
//!
//! ```bash
//! # In-memory mode (default)
//! beacon-signal --port 8080
//!
//! # With SQLite persistence and a TURN relay
//! TURN_HOST=turn.example.org TURN_PORT=3478 TURN_STATIC_AUTH_SECRET=... \
//!     beacon-signal --db /var/lib/beacon/presence.db
//! ```

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use beacon_core::Config;
use beacon_signal::{
    IceDirectory, PresenceServer, PresenceStore, Reaper, ReaperPolicy, SqliteStore,
};

#[derive(Parser, Debug)]
#[command(name = "beacon-signal")]
#[command(about = "Beacon presence server with liveness reaping and ICE server issuance")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long, env = "BEACON_CONFIG")]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(short, long)]
    bind: Option<IpAddr>,

    /// SQLite database path for persistence (in-memory if not specified)
    #[arg(short, long)]
    db: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    #[arg(long, env = "STUN_HOST")]
    stun_host: Option<String>,

    #[arg(long, env = "STUN_PORT")]
    stun_port: Option<u16>,

    #[arg(long, env = "TURN_HOST")]
    turn_host: Option<String>,

    #[arg(long, env = "TURN_PORT")]
    turn_port: Option<u16>,

    /// Shared secret configured on the TURN server
    #[arg(long, env = "TURN_STATIC_AUTH_SECRET", hide_env_values = true)]
    turn_secret: Option<String>,

    #[arg(long, env = "TWILIO_ACCOUNT_SID")]
    twilio_account_sid: Option<String>,

    #[arg(long, env = "TWILIO_AUTH_TOKEN", hide_env_values = true)]
    twilio_auth_token: Option<String>,

    #[arg(long, env = "TWILIO_KEY_SID")]
    twilio_key_sid: Option<String>,
}

impl Args {
    /// Apply command-line and environment overrides on top of the file config
    fn apply(self, config: &mut Config) {
        if let Some(port) = self.port {
            config.signal.port = port;
        }
        if let Some(bind) = self.bind {
            config.signal.bind = bind;
        }
        if self.db.is_some() {
            config.signal.db_path = self.db;
        }

        let ice = &mut config.ice;
        if let Some(host) = self.stun_host {
            ice.stun_host = host;
        }
        if let Some(port) = self.stun_port {
            ice.stun_port = port;
        }
        ice.turn_host = self.turn_host.or(ice.turn_host.take());
        ice.turn_port = self.turn_port.or(ice.turn_port);
        ice.turn_static_auth_secret = self.turn_secret.or(ice.turn_static_auth_secret.take());

        let twilio = &mut ice.twilio;
        twilio.account_sid = self.twilio_account_sid.or(twilio.account_sid.take());
        twilio.auth_token = self.twilio_auth_token.or(twilio.auth_token.take());
        twilio.key_sid = self.twilio_key_sid.or(twilio.key_sid.take());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();
    tracing_subscriber::registry()
        .with(args.json.then(|| fmt::layer().json()))
        .with((!args.json).then(fmt::layer))
        .with(filter)
        .init();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("failed to load config from {:?}", path))?,
        None => Config::load(),
    };
    let print_config = args.print_config;
    args.apply(&mut config);

    if print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    let addr = SocketAddr::new(config.signal.bind, config.signal.port);

    info!("Starting Beacon presence server");

    let store: Arc<dyn PresenceStore> = match &config.signal.db_path {
        Some(db_path) => {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {:?}", parent))?;
            }
            info!("Using SQLite persistence: {:?}", db_path);
            Arc::new(
                SqliteStore::open(db_path)
                    .with_context(|| format!("failed to open database {:?}", db_path))?,
            )
        }
        None => {
            info!("Using in-memory storage (no persistence)");
            Arc::new(SqliteStore::in_memory()?)
        }
    };

    let client_count = store.client_count().await.unwrap_or(0);
    let room_count = store.room_count().await.unwrap_or(0);
    info!(
        "Loaded {} clients in {} rooms from storage",
        client_count, room_count
    );

    let directory = IceDirectory::from_config(&config.ice);
    info!(
        "ICE: stun {}:{}, turn {}, token service {}",
        config.ice.stun_host,
        config.ice.stun_port,
        if config.ice.turn().is_some() { "enabled" } else { "disabled" },
        if directory.has_provider() { "enabled" } else { "disabled" },
    );

    let server = Arc::new(PresenceServer::new(
        store.clone(),
        directory,
        config.ice.clone(),
    ));

    let reaper = Arc::new(Reaper::new(
        store,
        server.registry(),
        ReaperPolicy::from(&config.reaper),
    ));
    let reaper_handles = reaper.start();

    tokio::select! {
        result = server.serve(addr) => {
            result.with_context(|| format!("failed to serve on {}", addr))?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    reaper_handles.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn file_config() -> Config {
        let mut config = Config::default();
        config.signal.port = 9000;
        config.ice.stun_host = "stun.file.example.org".into();
        config.ice.turn_host = Some("turn.file.example.org".into());
        config.ice.turn_port = Some(3478);
        config.ice.turn_static_auth_secret = Some("file-secret".into());
        config.ice.twilio.account_sid = Some("ACfile".into());
        config.ice.twilio.key_sid = Some("SKfile".into());
        config
    }

    #[test]
    fn test_args_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_flags_override_file_values() {
        let mut config = file_config();
        Args::parse_from([
            "beacon-signal",
            "--port",
            "7000",
            "--stun-port",
            "5349",
            "--turn-host",
            "turn.flag.example.org",
            "--turn-secret",
            "flag-secret",
            "--twilio-key-sid",
            "SKflag",
        ])
        .apply(&mut config);

        assert_eq!(config.signal.port, 7000);
        assert_eq!(config.ice.stun_port, 5349);
        assert_eq!(config.ice.turn_host.as_deref(), Some("turn.flag.example.org"));
        assert_eq!(config.ice.turn_static_auth_secret.as_deref(), Some("flag-secret"));
        assert_eq!(config.ice.twilio.key_sid.as_deref(), Some("SKflag"));

        // Values without a flag come from the file
        assert_eq!(config.ice.stun_host, "stun.file.example.org");
        assert_eq!(config.ice.turn_port, Some(3478));
        assert_eq!(config.ice.twilio.account_sid.as_deref(), Some("ACfile"));
    }

    #[test]
    fn test_file_values_survive_without_flags() {
        let mut config = file_config();
        Args::parse_from(["beacon-signal"]).apply(&mut config);

        assert_eq!(config.signal.port, 9000);
        assert!(config.signal.db_path.is_none());
        assert_eq!(
            config.ice.turn(),
            Some(beacon_core::TurnSettings {
                host: "turn.file.example.org",
                port: 3478,
                secret: "file-secret",
            })
        );
        assert_eq!(config.ice.twilio.key_sid.as_deref(), Some("SKfile"));
        assert!(config.ice.twilio.auth_token.is_none());
    }
}
