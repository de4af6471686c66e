//! Line-oriented chat client.
//!
//! Run with: cargo run -p chat-cli -- --discover
//!
//! Lines typed on stdin are sent as chat messages. `/status`, `/reconnect`,
//! `/close` and `/quit` control the session.

use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::Parser;
use exo_client::{
    Address, Candidate, Client, ClientConfig, ConnectRequest, Connecting, DOT_STATE, Envelope,
};
use futures::StreamExt;
use tokio::{
    io::{AsyncBufReadExt, BufReader, Lines, Stdin},
    sync::broadcast::error::RecvError,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "chat-cli", about = "Chat with an exo backend")]
struct Args {
    /// Config file to read instead of ~/.config/exo/config.toml.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Find the backend among running containers.
    #[arg(long, conflicts_with_all = ["host", "port", "websocket_port"])]
    discover: bool,

    /// Backend host.
    #[arg(long)]
    host: Option<String>,

    /// Primary (framed) port.
    #[arg(long)]
    port: Option<u16>,

    /// Fallback (raw websocket) port.
    #[arg(long)]
    websocket_port: Option<u16>,
}

impl Args {
    fn load_config(&self) -> anyhow::Result<ClientConfig> {
        let mut config = match &self.config {
            Some(path) => {
                let mut config = ClientConfig::load_from(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                config.apply_overrides(|name| std::env::var(name).ok())?;
                config
            }
            None => ClientConfig::load().context("loading configuration")?,
        };
        if let Some(host) = &self.host {
            config.backend.host.clone_from(host);
        }
        if let Some(port) = self.port {
            config.backend.primary_port = port;
        }
        if let Some(port) = self.websocket_port {
            config.backend.fallback_port = port;
        }
        Ok(config)
    }
}

type Input = Lines<BufReader<Stdin>>;

async fn pick(candidates: &[Candidate], input: &mut Input) -> anyhow::Result<String> {
    println!("Several backends are available:");
    for (i, candidate) in candidates.iter().enumerate() {
        println!("  {}) {candidate}", i + 1);
    }
    loop {
        println!("Pick one [1-{}]:", candidates.len());
        let Some(line) = input.next_line().await? else {
            bail!("no backend picked");
        };
        match line.trim().parse::<usize>() {
            Ok(n) if (1..=candidates.len()).contains(&n) => return Ok(candidates[n - 1].id.clone()),
            _ => println!("Not a choice: {}", line.trim()),
        }
    }
}

async fn connect(client: &Client, discover: bool, input: &mut Input) -> anyhow::Result<Address> {
    let request = if discover {
        ConnectRequest::Discover
    } else {
        ConnectRequest::Address(client.config().address())
    };
    let address = match client.connect(request).await? {
        Connecting::Started(address) => address,
        Connecting::Choose(candidates) => {
            let id = pick(&candidates, input).await?;
            client.choose(&id).await?
        }
    };
    println!("Connecting to {address}...");
    Ok(address)
}

fn print_frame(envelope: &Envelope) {
    match envelope.payload.get("text").and_then(|t| t.as_str()) {
        Some(text) => println!("< {text}"),
        None => println!("< [{}] {}", envelope.kind, envelope.payload),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = Args::parse();
    let client = Client::new(args.load_config()?);
    let mut input = BufReader::new(tokio::io::stdin()).lines();

    let mut status = client.status_stream();
    let mut display = client.display();
    let mut frames = client.frames();

    connect(&client, args.discover, &mut input).await?;

    loop {
        tokio::select! {
            Some(state) = status.next() => println!("* connection {state}"),
            Ok(()) = display.changed() => {
                let state = *display.borrow_and_update();
                println!("* assistant {state}");
            }
            frame = frames.recv() => match frame {
                Ok(envelope) if !envelope.is(DOT_STATE) => print_frame(&envelope),
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::warn!("Missed {n} frames"),
                Err(RecvError::Closed) => break,
            },
            line = input.next_line() => {
                let Some(line) = line? else { break };
                match line.trim() {
                    "" => {}
                    "/quit" => break,
                    "/status" => println!("* connection {}, assistant {}", client.status(), *display.borrow()),
                    "/close" => client.close().await?,
                    "/reconnect" => {
                        if let Err(e) = client.reconnect().await {
                            println!("! {e}");
                        }
                    }
                    text => client.send(Envelope::chat(text))?,
                }
            }
        }
    }

    client.close().await?;
    Ok(())
}
