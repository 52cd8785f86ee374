use crate::commands::read_block;
use crate::commands::util::{print_payload, render};
use crate::peer::connection::Session;
use crate::peer::data_channel::{Frame, Inbound, MessageChannel};
use crate::peer::state::SessionState;
use crate::peer::types::Role;
use crate::signaler::Signaler;
use anyhow::Context;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

/// Peer side: offer out, answer in, then stdin lines become messages.
pub async fn run(signaler: Signaler, name: &str, loopback: bool) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let session = signaler.create_session(Role::Peer).await?;
    let channel = MessageChannel::attach(&session, |_, inbound| println!("{}", render(&inbound)));

    let offer = session.local_payload().await.context("producing offer")?;
    print_payload("offer", &offer);

    // the simulated host must outlive the exchange
    let (answer, _host) = if loopback {
        let (host, answer) = simulated_host(&signaler, &offer).await?;
        (answer, Some(host))
    } else {
        println!("paste the host's answer, then an empty line:");
        let answer = read_block(&mut lines).await?.context("no answer pasted")?;
        (answer, None)
    };

    session
        .accept_remote(&answer)
        .await
        .context("applying answer")?;
    session
        .wait_for_state(SessionState::Open)
        .await
        .context("waiting for the data channel")?;
    info!(session = session.id(), "channel open");
    channel.introduce(name).await?;
    println!("connected; type messages, ctrl-d to leave");

    while let Some(line) = lines.next_line().await? {
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if let Err(err) = channel.send_msg(Value::String(text.to_string())).await {
            eprintln!("send failed: {err}");
            if session.state().is_terminal() {
                break;
            }
        }
    }
    session.close().await;
    Ok(())
}

/// In-process host that answers `offer` and echoes every message back.
async fn simulated_host(signaler: &Signaler, offer: &str) -> anyhow::Result<(Session, String)> {
    let host = signaler.create_session(Role::Host).await?;
    MessageChannel::attach(&host, |session, inbound| {
        let Inbound::Message { payload, .. } = inbound else {
            return;
        };
        let session = session.clone();
        tokio::spawn(async move {
            let text = payload
                .as_str()
                .map(str::to_string)
                .unwrap_or_else(|| payload.to_string());
            let echoed = Frame::Msg {
                payload: Value::String(format!("echo {text}")),
            };
            if let Ok(data) = echoed.to_bytes() {
                if let Err(err) = session.send(data).await {
                    debug!(error = %err, "echo dropped");
                }
            }
        });
    });
    host.accept_remote(offer).await?;
    let answer = host.local_payload().await?;
    print_payload("answer (simulated host)", &answer);
    Ok((host, answer))
}
