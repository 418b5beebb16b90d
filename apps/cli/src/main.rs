use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    load_settings, ConnectionEvent, Envelope, EventTag, MarketplaceClient, ServerEvent,
};
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Marketplace session and realtime client")]
struct Cli {
    /// Overrides `api_base_url` from client.toml and APP__API_BASE_URL.
    #[arg(long)]
    api_base_url: Option<String>,
    #[arg(long)]
    realtime_url: Option<String>,
    #[arg(long)]
    credentials_database_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Login {
        email: String,
        password: String,
    },
    Logout,
    /// Authenticated GET against the API, e.g. `get /profile`.
    Get {
        path: String,
    },
    /// Connects the realtime channel and prints every event until ctrl-c.
    Listen {
        #[arg(long = "room")]
        rooms: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut settings = load_settings();
    if let Some(url) = cli.api_base_url {
        settings.api_base_url = url;
    }
    if let Some(url) = cli.realtime_url {
        settings.realtime_url = url;
    }
    if let Some(url) = cli.credentials_database_url {
        settings.credentials_database_url = url;
    }

    let client = MarketplaceClient::init(&settings).await?;
    let outcome = run(&client, cli.command).await;
    client.teardown().await;
    outcome
}

async fn run(client: &MarketplaceClient, command: Command) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let envelope = client
                .api
                .login(&email, &password)
                .await
                .context("login failed")?;
            print_envelope(&envelope);
        }
        Command::Logout => {
            client.api.logout().await;
            println!("logged out");
        }
        Command::Get { path } => {
            let envelope = client
                .api
                .client()
                .get(&path)
                .await
                .with_context(|| format!("GET {path} failed"))?;
            print_envelope(&envelope);
        }
        Command::Listen { rooms } => listen(client, rooms).await?,
    }
    Ok(())
}

async fn listen(client: &MarketplaceClient, rooms: Vec<String>) -> Result<()> {
    if client.credentials().read().await.is_none() {
        bail!("not logged in, run `marketplace login` first");
    }

    for tag in EventTag::KNOWN {
        client.events().on(tag, print_event);
    }
    let mut connection_events = client.connection_events();
    let mut states = WatchStream::new(client.realtime.watch_state());

    for room in rooms {
        client.realtime.join_room(room);
    }
    client.realtime.connect();

    loop {
        tokio::select! {
            state = states.next() => match state {
                Some(state) => info!(?state, "connection state"),
                None => break,
            },
            event = connection_events.recv() => match event {
                Ok(ConnectionEvent::ReconnectExhausted { attempts }) => {
                    bail!("realtime connection lost after {attempts} reconnect attempts");
                }
                Ok(ConnectionEvent::ReconnectScheduled { attempt, delay }) => {
                    warn!(attempt, ?delay, "connection dropped, retrying");
                }
                Ok(ConnectionEvent::StateChanged(_)) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "connection events lagged"),
                Err(RecvError::Closed) => break,
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("interrupted, disconnecting");
                break;
            }
        }
    }
    Ok(())
}

fn print_event(event: &ServerEvent) {
    println!("{} {}", event.tag, Value::Object(event.fields.clone()));
}

fn print_envelope(envelope: &Envelope) {
    match &envelope.data {
        Some(data) => match serde_json::to_string_pretty(data) {
            Ok(text) => println!("{text}"),
            Err(_) => println!("{data}"),
        },
        None => println!("{}", envelope.message.as_deref().unwrap_or("ok")),
    }
}
