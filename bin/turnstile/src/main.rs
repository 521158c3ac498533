use alloy_primitives::U256;
use clap::{Parser, Subcommand};
use eyre::{Result, eyre};
use std::{path::PathBuf, sync::Arc};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use turnstile::{
    HttpLedger, LedgerClient, LineConnector, LineMember, LinkConfig, NetworkName, SimulatedLedger,
    encode_key,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration directory
    #[arg(long, default_value = "./configs/dev")]
    config_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Network profile, overrides config file and NETWORK
    #[arg(long)]
    network: Option<NetworkName>,

    /// Run against an in-process ledger instead of a real network
    #[arg(long)]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Allocate a user id for a session
    Allocate { session_id: String, secret_word: String },
    /// Put a user in line and print the assigned turn
    AddToLine { user_id: U256 },
    /// Remove the head of the line and print its user id
    Peek,
    /// Mint a game token for a user
    RewardToken { user_id: U256, nft_url: String },
    /// Add points to a user and print the new total
    RewardPoints { user_id: U256, points: U256 },
    /// Compare a user's turn with the head of the line
    Sync { user_id: U256 },
    /// Print the contract encoding of a secret word
    EncodeKey { secret_word: String },
    /// Log contract events until interrupted
    Watch,
}

/// Stand-in for the game's user object
struct CliMember {
    user_id: U256,
    turn: Option<U256>,
}

impl LineMember for CliMember {
    fn user_id(&self) -> U256 {
        self.user_id
    }

    fn assign_turn(&mut self, turn: U256) {
        self.turn = Some(turn);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| cli.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Command::EncodeKey { secret_word } = &cli.command {
        println!("{}", encode_key(secret_word));
        return Ok(());
    }

    // Load configuration
    let config_path = PathBuf::from(&cli.config_path).join("turnstile.json");
    let mut config = if config_path.exists() {
        LinkConfig::load_from_file(&config_path).await?.with_env_overrides()
    } else {
        tracing::warn!("turnstile.json not found, using defaults");
        LinkConfig::default().with_env_overrides()
    };
    if let Some(network) = cli.network {
        config.network = network;
    }

    tracing::info!(
        network = %config.network,
        gas_limit = config.gas_limit,
        event_timeout_secs = ?config.event_timeout_secs,
        policy = ?config.registration_policy,
        simulate = cli.simulate,
        "Config loaded"
    );

    if cli.simulate {
        let connector = LineConnector::from_config(&config);
        if let Err(e) = connector.connect(Arc::new(SimulatedLedger::new())).await {
            tracing::error!("Connection failed: {}", e);
        }
        return run(&config, &connector, cli.command).await;
    }

    let private_key = std::env::var("PRIVATE_KEY")
        .map_err(|_| eyre!("PRIVATE_KEY environment variable not set"))?;
    let connector: LineConnector<HttpLedger> = LineConnector::from_config(&config);
    // A failed setup leaves the connector disconnected; commands then fail
    // with NotConnected
    if let Err(e) = connector.connect_network(&config, &private_key).await {
        tracing::error!(network = %config.network, "Connection failed: {}", e);
    }

    run(&config, &connector, cli.command).await
}

async fn run<C: LedgerClient>(
    config: &LinkConfig,
    connector: &LineConnector<C>,
    command: Command,
) -> Result<()> {
    match command {
        Command::Allocate { session_id, secret_word } => {
            let allocation = connector.allocate_user(&session_id, &secret_word).await?;
            println!("user_id={} encoded_key={}", allocation.user_id, allocation.encoded_key);
        }
        Command::AddToLine { user_id } => {
            let turn = connector.add_to_line(user_id).await?;
            println!("turn={}", turn);
        }
        Command::Peek => {
            let user_id = connector.peek().await?;
            println!("user_id={}", user_id);
        }
        Command::RewardToken { user_id, nft_url } => {
            let token_id = connector.reward_game_token(user_id, &nft_url).await?;
            println!("token_id={}", token_id);
        }
        Command::RewardPoints { user_id, points } => {
            let total = connector.reward_points(user_id, points).await?;
            println!("points={}", total);
        }
        Command::Sync { user_id } => {
            let mut member = CliMember { user_id, turn: None };
            let assigned = connector.sync_user(&mut member).await?;
            match member.turn {
                Some(turn) if assigned => println!("turn={}", turn),
                _ => println!("at head of line or not in line"),
            }
        }
        Command::EncodeKey { secret_word } => {
            println!("{}", encode_key(&secret_word));
        }
        Command::Watch => {
            if !connector.is_connected() {
                return Err(eyre!("not connected to {}", config.network));
            }
            tracing::info!("👀 Watching show-line events, Ctrl+C to stop");
            tokio::signal::ctrl_c().await?;
            if let Some(stats) = connector.dispatch_stats() {
                tracing::info!(matched = stats.matched, unmatched = stats.unmatched, "Watch finished");
            }
        }
    }

    connector.disconnect();
    Ok(())
}
