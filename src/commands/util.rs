use crate::commands::read_block;
use crate::config::{IceServerKind, ServerConfig, SignalConfig};
use crate::error::SignalError;
use crate::peer::codec;
use crate::peer::data_channel::Inbound;
use crate::peer::ice::CandidateSummary;
use crate::peer::rtc::probe_ice_server;
use crate::peer::types::DescriptorKind;
use crate::utils::payload_fingerprint;
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Prints a payload the operator has to hand to the other side.
pub fn print_payload(label: &str, text: &str) {
    println!("{label} [{}]:\n\n{text}\n", payload_fingerprint(text));
}

pub fn render(inbound: &Inbound) -> String {
    match inbound {
        Inbound::Introduced { name } => format!("* {name} joined"),
        Inbound::Message {
            from: Some(name),
            payload,
        } => format!("{name}: {}", text_of(payload)),
        Inbound::Message { from: None, payload } => format!("?: {}", text_of(payload)),
        Inbound::Raw(data) => match std::str::from_utf8(data) {
            Ok(text) => format!("(raw) {text}"),
            Err(_) => format!("({} raw bytes)", data.len()),
        },
    }
}

fn text_of(payload: &serde_json::Value) -> String {
    match payload {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// What `inspect` reports about a pasted payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadReport {
    pub kind: DescriptorKind,
    pub id: String,
    pub ts: i64,
    pub summary: CandidateSummary,
    pub fingerprint: String,
}

impl PayloadReport {
    pub fn of(text: &str) -> Result<Self, SignalError> {
        let payload = codec::decode(text)?;
        Ok(Self {
            kind: payload.descriptor.kind,
            id: payload.id,
            ts: payload.ts,
            summary: CandidateSummary::of(&payload.candidates),
            fingerprint: payload_fingerprint(text),
        })
    }
}

impl fmt::Display for PayloadReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "kind:        {}", self.kind)?;
        writeln!(f, "session:     {}", self.id)?;
        match DateTime::<Utc>::from_timestamp(self.ts, 0) {
            Some(at) => writeln!(f, "created:     {}", at.to_rfc3339())?,
            None => writeln!(f, "created:     {} (out of range)", self.ts)?,
        }
        writeln!(f, "candidates:  {}", self.summary)?;
        write!(f, "fingerprint: {}", self.fingerprint)
    }
}

pub async fn inspect() -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    eprintln!("paste a payload, then an empty line:");
    let text = read_block(&mut lines)
        .await?
        .context("nothing pasted")?;
    let report = PayloadReport::of(&text)?;
    println!("{report}");
    if report.summary.relay == 0 {
        println!("note: no relay candidates; peers behind symmetric NAT may not connect");
    }
    Ok(())
}

pub async fn probe(
    url: String,
    turn: bool,
    username: Option<String>,
    credential: Option<String>,
    timeout_secs: u64,
) -> anyhow::Result<()> {
    let server = ServerConfig {
        id: "probe".into(),
        r#type: if turn {
            IceServerKind::Turn
        } else {
            IceServerKind::Stun
        },
        url,
        username,
        credential,
    };
    SignalConfig {
        ice_servers: vec![server.clone()],
        ..SignalConfig::default()
    }
    .validate()?;

    let reachable = probe_ice_server(&server, Duration::from_secs(timeout_secs)).await;
    if reachable {
        println!("{}: reachable", server.url_with_scheme());
        Ok(())
    } else {
        anyhow::bail!("{}: no usable candidate", server.url_with_scheme())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::types::{IceCandidate, SessionDescriptor, SignalingPayload};
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn report_describes_payload() {
        let payload = SignalingPayload::new(
            "abcd1234",
            SessionDescriptor::offer("v=0\r\n"),
            vec![
                IceCandidate::new("candidate:1 1 udp 2130706431 192.168.1.4 5000 typ host"),
                IceCandidate::new("candidate:2 1 udp 41885439 198.51.100.1 6000 typ relay"),
            ],
        );
        let text = codec::encode(&payload).unwrap();
        let report = PayloadReport::of(&text).unwrap();
        assert_eq!(report.kind, DescriptorKind::Offer);
        assert_eq!(report.id, "abcd1234");
        assert_eq!(report.summary.host, 1);
        assert_eq!(report.summary.relay, 1);
        assert_eq!(report.fingerprint, payload_fingerprint(&text));
        assert!(report.to_string().contains("fingerprint: "));
    }

    #[test]
    fn report_rejects_garbage() {
        assert!(matches!(
            PayloadReport::of("hello"),
            Err(SignalError::MalformedPayload(_))
        ));
    }

    #[test]
    fn render_inbound() {
        assert_eq!(
            render(&Inbound::Message {
                from: Some("ann".into()),
                payload: json!("hi")
            }),
            "ann: hi"
        );
        assert_eq!(
            render(&Inbound::Message {
                from: None,
                payload: json!({"x": 1})
            }),
            "?: {\"x\":1}"
        );
        assert_eq!(render(&Inbound::Raw(Bytes::from_static(b"abc"))), "(raw) abc");
        assert_eq!(
            render(&Inbound::Raw(Bytes::from_static(b"{\"t\":\"nope\"}"))),
            "(raw) {\"t\":\"nope\"}"
        );
        assert_eq!(
            render(&Inbound::Raw(Bytes::from_static(&[0xff, 0xfe, 0x00]))),
            "(3 raw bytes)"
        );
    }
}
