pub mod host;
pub mod peer;
pub mod util;

use crate::config::SignalConfig;
use crate::peer::connection::{Callbacks, Session};
use crate::peer::loopback::LoopbackNetwork;
use crate::signaler::Signaler;
use crate::utils::short_id;
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, Lines};

#[derive(Debug, Parser)]
#[command(name = "ssc-mesh", version, about = "Copy/paste WebRTC signaling")]
pub struct Cli {
    /// TOML config file
    #[arg(long, global = true, env = "SSC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Run against an in-process network; the other side is simulated
    #[arg(long, global = true)]
    pub loopback: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Join a host: print an offer, paste back its answer
    Peer {
        #[arg(long, default_value = "peer")]
        name: String,
    },
    /// Accept any number of peers
    Host {
        #[arg(long, default_value = "host")]
        name: String,
    },
    /// Check that a STUN/TURN server hands out candidates
    Probe {
        url: String,
        #[arg(long)]
        turn: bool,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        credential: Option<String>,
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
    /// Decode a pasted payload and describe it
    Inspect,
}

/// Single-threaded runtime the CLI runs on. Sessions and the log sink
/// assume one event loop: a burst of work within one tick completes before
/// any task it spawned gets to run.
pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Peer { name } => peer::run(signaler(config, cli.loopback), &name, cli.loopback).await,
        Command::Host { name } => host::run(signaler(config, cli.loopback), &name, cli.loopback).await,
        Command::Probe {
            url,
            turn,
            username,
            credential,
            timeout_secs,
        } => util::probe(url, turn, username, credential, timeout_secs).await,
        Command::Inspect => util::inspect().await,
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<SignalConfig> {
    let config = match path {
        Some(path) => SignalConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => SignalConfig::default(),
    };
    Ok(config.apply_env())
}

fn signaler(config: SignalConfig, loopback: bool) -> Signaler {
    let signaler = if loopback {
        Signaler::new(Arc::new(LoopbackNetwork::new()), config)
    } else {
        Signaler::rtc(config)
    };
    signaler.with_callbacks(
        Callbacks::new()
            .on_connect(|s| println!("* {} connected", label(s)))
            .on_disconnect(|s| println!("* {} disconnected", label(s))),
    )
}

fn label(session: &Session) -> String {
    match session.peer_id() {
        Some(peer) => peer.to_string(),
        None => format!("session {}", short_id(session.id())),
    }
}

/// Reads one pasted block: lines up to the first blank line after some
/// content, or end of input. `None` when nothing was pasted.
pub async fn read_block<R>(lines: &mut Lines<R>) -> std::io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut block = String::new();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            if block.is_empty() {
                continue;
            }
            break;
        }
        block.push_str(line);
    }
    Ok((!block.is_empty()).then_some(block))
}
