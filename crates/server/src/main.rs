use std::net::SocketAddr;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use dotbot_domain::config::ServerConfig;
use dotbot_providers::ProviderRegistry;
use dotbot_server::state::AppState;

#[derive(Parser)]
#[command(name = "dotbotd", about = "DotBot server", version)]
struct Cli {
    /// Path to the TOML config file.
    #[arg(long, default_value = "dotbot.toml")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the server (default).
    Run,
    /// Manage invite tokens.
    Invite {
        #[command(subcommand)]
        action: InviteAction,
    },
    /// Manage registered devices.
    Device {
        #[command(subcommand)]
        action: DeviceAction,
    },
}

#[derive(Subcommand)]
enum InviteAction {
    /// Mint a new invite token.
    Create {
        /// Human label for the device this invite is for.
        label: String,
        #[arg(long, default_value_t = 1)]
        max_uses: u32,
        #[arg(long)]
        expiry_days: Option<i64>,
        #[arg(long, default_value = "default")]
        user: String,
    },
    /// List invites.
    List,
}

#[derive(Subcommand)]
enum DeviceAction {
    /// List registered devices.
    List,
    /// Revoke a device by id.
    Revoke { device_id: String },
}

fn load_config(path: &str) -> anyhow::Result<ServerConfig> {
    match std::fs::read_to_string(path) {
        Ok(raw) => Ok(toml::from_str(&raw)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path, "no config file, using defaults");
            Ok(ServerConfig::default())
        }
        Err(e) => Err(e.into()),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(config).await,
        Command::Invite { action } => invite(config, action),
        Command::Device { action } => device(config, action),
    }
}

async fn run(config: ServerConfig) -> anyhow::Result<()> {
    let bind: SocketAddr = config.listen.bind.parse()?;

    // LLM provider adapters register here at deployment; the registry
    // resolves by role (intake / workhorse / smart).
    let providers = ProviderRegistry::new();

    let state = AppState::build(config, providers)?;
    let app = dotbot_server::app(state);

    tracing::info!(%bind, "dotbotd listening");
    let listener = tokio::net::TcpListener::bind(bind).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

fn invite(config: ServerConfig, action: InviteAction) -> anyhow::Result<()> {
    let store = dotbot_server::identity::IdentityStore::open(&config.identity)?;
    match action {
        InviteAction::Create {
            label,
            max_uses,
            expiry_days,
            user,
        } => {
            let record = store.create_invite(&label, &user, max_uses, expiry_days);
            println!("{}", record.token);
            println!(
                "  label: {}  max_uses: {}  expires: {}",
                record.label, record.max_uses, record.expires_at
            );
        }
        InviteAction::List => {
            for invite in store.list_invites() {
                println!(
                    "{}  {}  uses {}/{}  expires {}{}",
                    invite.token,
                    invite.label,
                    invite.uses,
                    invite.max_uses,
                    invite.expires_at,
                    if invite.revoked { "  REVOKED" } else { "" }
                );
            }
        }
    }
    Ok(())
}

fn device(config: ServerConfig, action: DeviceAction) -> anyhow::Result<()> {
    let store = dotbot_server::identity::IdentityStore::open(&config.identity)?;
    match action {
        DeviceAction::List => {
            for device in store.list_devices() {
                println!(
                    "{}  {}  user {}  registered {}{}",
                    device.device_id,
                    device.label,
                    device.user_id,
                    device.registered_at,
                    if device.revoked { "  REVOKED" } else { "" }
                );
            }
        }
        DeviceAction::Revoke { device_id } => {
            store.revoke(&device_id);
            println!("revoked {device_id}");
        }
    }
    Ok(())
}
