//! dhtchat - two-party encrypted chat over a shared DHT record.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand};
use tracing::{debug, warn};
use tracing_subscriber::{fmt, EnvFilter};

use dhtchat::{
    add_friend, clean, default_keystore_path, delete_keystore, dump_keystore, keygen, log_filter,
    spawn_console_reader, ChatClient, ChatError, ClientConfig, ConsoleView, DhtNetwork,
    FileKeyStore, Keygen, NodeServer, RecordKey, RemoteDht, SessionEnd, DEFAULT_HOST,
    DEFAULT_PORT,
};

/// Encrypted two-party chat over a DHT record.
#[derive(Parser, Debug)]
#[command(name = "dhtchat")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Address of the node host
    #[arg(long, global = true, env = "DHTCHAT_HOST", default_value = DEFAULT_HOST)]
    host: String,

    /// Port of the node
    #[arg(long, global = true, env = "DHTCHAT_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Keystore file [default: ~/.dhtchat/keystore.json]
    #[arg(long, global = true, env = "DHTCHAT_KEYSTORE")]
    keystore: Option<PathBuf>,

    /// Milliseconds between polls that found nothing new
    #[arg(long, global = true, default_value_t = 100)]
    poll_interval_ms: u64,

    /// More output (-v info, -vv debug)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start a new chat with a friend
    Start {
        /// Your friend's name
        name: String,
    },

    /// Join a chat your friend started
    Respond {
        /// Your friend's name
        name: String,
        /// The chat's record key
        key: String,
    },

    /// Generate your key pair
    Keygen,

    /// Delete the keystore, identity and friends included
    DeleteKeystore,

    /// Print the contents of the keystore
    DumpKeystore,

    /// Add a friend's public key
    AddFriend {
        /// Your friend's name
        name: String,
        /// Your friend's public key
        pubkey: String,
    },

    /// Close and delete a record left behind
    Clean {
        /// Record key to delete
        key: String,
    },

    /// Run a node that chat clients connect to
    Serve,
}

fn setup_logging(verbosity: u8) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_filter(verbosity)))
        .context("Invalid log filter")?;

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")?;

    Ok(())
}

fn build_config(cli: &Cli) -> ClientConfig {
    ClientConfig {
        host: cli.host.clone(),
        port: cli.port,
        keystore_path: cli.keystore.clone().unwrap_or_else(default_keystore_path),
        poll_interval: Duration::from_millis(cli.poll_interval_ms),
        ..ClientConfig::default()
    }
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
    debug!("interrupted");
}

async fn connect(config: &ClientConfig) -> Result<RemoteDht> {
    RemoteDht::connect(&config.host, config.port)
        .await
        .with_context(|| format!("Cannot reach the node at {}:{}", config.host, config.port))
}

fn parse_key(text: &str) -> Result<RecordKey> {
    text.trim()
        .parse()
        .with_context(|| format!("'{}' is not a chat key", text))
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = build_config(&cli);
    let store = FileKeyStore::new(&config.keystore_path);
    debug!(?config, "configured");

    match cli.command {
        Command::Start { name } => {
            let dht = connect(&config).await?;
            let client = ChatClient::new(dht, store, config.session_config());
            let mut lines = spawn_console_reader().context("Cannot read the console")?;
            let end = client.start(&name, &mut lines, &ConsoleView::stdout(), ctrl_c()).await?;
            report_end(end);
        }
        Command::Respond { name, key } => {
            let key = parse_key(&key)?;
            let dht = connect(&config).await?;
            let client = ChatClient::new(dht, store, config.session_config());
            let mut lines = spawn_console_reader().context("Cannot read the console")?;
            let end = client
                .respond(&name, key, &mut lines, &ConsoleView::stdout(), ctrl_c())
                .await?;
            report_end(end);
        }
        Command::Keygen => match keygen(&store).await? {
            Keygen::Generated(pair) => {
                println!("Your new public key is: {}", dhtchat::encode_public_key(pair.public()));
                println!("Share it with your friends!");
            }
            Keygen::Existing(_) => {
                println!("You already have a keypair.");
                println!("{}", dump_keystore(&store).await?);
                return Ok(ExitCode::FAILURE);
            }
        },
        Command::DeleteKeystore => delete_keystore(&store).await?,
        Command::DumpKeystore => println!("{}", dump_keystore(&store).await?),
        Command::AddFriend { name, pubkey } => add_friend(&store, &name, &pubkey)
            .await
            .with_context(|| format!("Cannot add {}", name))?,
        Command::Clean { key } => {
            let key = parse_key(&key)?;
            let dht = connect(&config).await?;
            clean(&dht, &key).await?;
        }
        Command::Serve => {
            let server = NodeServer::bind((config.host.as_str(), config.port), DhtNetwork::new())
                .await
                .with_context(|| format!("Cannot listen on {}:{}", config.host, config.port))?;
            println!("Node listening on {}", server.local_addr()?);
            tokio::select! {
                res = server.serve() => res?,
                () = ctrl_c() => {}
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}

fn report_end(end: SessionEnd) {
    if end == SessionEnd::Interrupted {
        println!("Interrupted, chat closed.");
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(cli.verbose) {
        eprintln!("Error: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            match e.downcast_ref::<ChatError>() {
                Some(ChatError::NoIdentity) => {
                    eprintln!("You don't have a keypair yet.");
                    eprintln!("Use 'keygen' to generate a keypair first.");
                }
                Some(ChatError::UnknownFriend(name)) => {
                    eprintln!("Friend '{}' is not in the keystore.", name);
                    eprintln!("Add their key with 'add-friend' first.");
                }
                _ => eprintln!("Error: {:#}", e),
            }
            ExitCode::FAILURE
        }
    }
}
