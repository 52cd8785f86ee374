use crate::commands::read_block;
use crate::commands::util::{print_payload, render};
use crate::peer::connection::Session;
use crate::peer::data_channel::{Frame, MessageChannel};
use crate::peer::state::SessionState;
use crate::peer::types::Role;
use crate::registry::HostRegistry;
use crate::signaler::Signaler;
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines};
use tracing::debug;

const HELP: &str = "\
commands:
  accept <id>          paste a peer's offer, get its answer
  send <id> <text>     message one peer
  broadcast <text>     message every connected peer
  kick <id>            disconnect a peer
  peers                list peers and their state
  quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCommand {
    Accept(String),
    Send { id: String, text: String },
    Broadcast(String),
    Kick(String),
    Peers,
    Help,
    Quit,
}

impl HostCommand {
    /// `Ok(None)` for blank lines; `Err` carries a usage hint.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let (word, rest) = line
            .split_once(char::is_whitespace)
            .map(|(w, r)| (w, r.trim()))
            .unwrap_or((line, ""));

        let cmd = match word {
            "accept" => HostCommand::Accept(single_id(rest, "accept <id>")?),
            "send" => {
                let (id, text) = rest
                    .split_once(char::is_whitespace)
                    .ok_or("usage: send <id> <text>")?;
                HostCommand::Send {
                    id: id.to_string(),
                    text: text.trim().to_string(),
                }
            }
            "broadcast" if rest.is_empty() => return Err("usage: broadcast <text>".into()),
            "broadcast" => HostCommand::Broadcast(rest.to_string()),
            "kick" => HostCommand::Kick(single_id(rest, "kick <id>")?),
            "peers" => HostCommand::Peers,
            "help" | "?" => HostCommand::Help,
            "quit" | "exit" => HostCommand::Quit,
            other => return Err(format!("unknown command `{other}`, try `help`")),
        };
        Ok(Some(cmd))
    }
}

fn single_id(rest: &str, usage: &str) -> Result<String, String> {
    if rest.is_empty() || rest.contains(char::is_whitespace) {
        Err(format!("usage: {usage}"))
    } else {
        Ok(rest.to_string())
    }
}

pub async fn run(signaler: Signaler, name: &str, loopback: bool) -> anyhow::Result<()> {
    let registry = signaler.host_registry();
    registry.on_peers_changed(|ids| println!("* peers: [{}]", ids.join(", ")));
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    // loopback only: the in-process peers we answered
    let mut simulated: Vec<Session> = Vec::new();

    println!("{HELP}");
    while let Some(line) = lines.next_line().await? {
        let cmd = match HostCommand::parse(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(usage) => {
                eprintln!("{usage}");
                continue;
            }
        };

        let outcome = match cmd {
            HostCommand::Accept(id) => {
                let simulate = loopback.then_some(&mut simulated);
                accept(&signaler, &registry, &id, name, &mut lines, simulate).await
            }
            HostCommand::Send { id, text } => send(&registry, &id, text).await,
            HostCommand::Broadcast(text) => broadcast(&registry, text).await,
            HostCommand::Kick(id) => registry.disconnect_peer(&id).await.map_err(Into::into),
            HostCommand::Peers => {
                for id in registry.peer_ids() {
                    if let Some(session) = registry.get(&id) {
                        println!("  {id}: {}", session.state());
                    }
                }
                Ok(())
            }
            HostCommand::Help => {
                println!("{HELP}");
                Ok(())
            }
            HostCommand::Quit => break,
        };
        if let Err(err) = outcome {
            eprintln!("error: {err:#}");
        }
    }

    registry.shutdown().await;
    for session in simulated {
        session.close().await;
    }
    Ok(())
}

async fn accept<R>(
    signaler: &Signaler,
    registry: &HostRegistry,
    id: &str,
    name: &str,
    lines: &mut Lines<R>,
    simulated: Option<&mut Vec<Session>>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let session = registry.create_peer(id).await?;
    let tag = id.to_string();
    let channel = MessageChannel::attach(&session, move |_, inbound| {
        println!("<{tag}> {}", render(&inbound))
    });

    let exchanged = exchange(signaler, registry, id, lines, simulated).await;
    if exchanged.is_err() {
        // free the id so the operator can try again; a failed session is
        // usually gone already
        if let Err(err) = registry.disconnect_peer(id).await {
            debug!(peer = id, error = %err, "cleanup after failed accept");
        }
        return exchanged;
    }

    let name = name.to_string();
    tokio::spawn(async move {
        if channel.session().wait_for_state(SessionState::Open).await.is_ok() {
            if let Err(err) = channel.introduce(&name).await {
                debug!(error = %err, "intro not sent");
            }
        }
    });
    Ok(())
}

async fn exchange<R>(
    signaler: &Signaler,
    registry: &HostRegistry,
    id: &str,
    lines: &mut Lines<R>,
    simulated: Option<&mut Vec<Session>>,
) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let peer = match simulated {
        Some(list) => {
            let peer = signaler.create_session(Role::Peer).await?;
            list.push(peer.clone());
            Some(peer)
        }
        None => None,
    };

    let offer = match &peer {
        Some(peer) => peer.local_payload().await?,
        None => {
            println!("paste {id}'s offer, then an empty line:");
            read_block(lines)
                .await?
                .ok_or_else(|| anyhow::anyhow!("no offer pasted"))?
        }
    };

    registry.accept_for_peer(id, &offer).await?;
    let answer = registry.answer_for_peer(id).await?;
    print_payload(&format!("answer for {id}"), &answer);

    if let Some(peer) = peer {
        peer.accept_remote(&answer).await?;
        let channel = MessageChannel::attach(&peer, |_, _| {});
        let name = format!("sim-{id}");
        tokio::spawn(async move {
            if channel.session().wait_for_state(SessionState::Open).await.is_ok() {
                let _ = channel.introduce(&name).await;
            }
        });
    }
    Ok(())
}

async fn send(registry: &HostRegistry, id: &str, text: String) -> anyhow::Result<()> {
    let frame = Frame::Msg {
        payload: Value::String(text),
    };
    registry.send_to_peer(id, frame.to_bytes()?).await?;
    Ok(())
}

async fn broadcast(registry: &HostRegistry, text: String) -> anyhow::Result<()> {
    let frame = Frame::Msg {
        payload: Value::String(text),
    };
    let delivered = registry.broadcast(frame.to_bytes()?).await;
    println!("delivered to {delivered} peer(s)");
    Ok(())
}
