//! Interactive harness: one node driven from stdin.
//!
//! Every line typed is broadcast on the root channel as a `say` message;
//! `/to UID text` unicasts instead and `/quit` leaves. Received messages are
//! printed as `<from> [channel] type: part | part`.

use std::{io::Write as _, time::Duration};

use anyhow::{Context, Result};
use tokio::{
    io::{self, AsyncBufReadExt, BufReader},
    select,
};
use tracing::{info, warn};

use crate::{
    channel::Messenger,
    cli::NodeArgs,
    message::{Message, NodeUid},
    node::NetworkNode,
};

pub async fn run(args: NodeArgs) -> Result<()> {
    let mut node = NetworkNode::with_config(args.uid.as_str(), args.config());
    node.set_dispatcher(print_message);
    node.connect(args.peer_table(), !args.no_recv_self)
        .await
        .with_context(|| format!("failed to connect node {}", args.uid))?;

    match node.wait_ready(Duration::from_millis(args.ready_timeout_ms)).await {
        Ok(()) => info!(node = %node.uid(), "all links settled"),
        Err(err) => warn!(node = %node.uid(), error = %err, "continuing before every link settled"),
    }

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();
    let outcome = run_console_loop(&node, &mut stdin, &mut input).await;

    node.shutdown().await;
    outcome
}

async fn run_console_loop(
    node: &NetworkNode,
    stdin: &mut BufReader<tokio::io::Stdin>,
    input: &mut String,
) -> Result<()> {
    loop {
        input.clear();
        select! {
            bytes_read = stdin.read_line(input) => {
                if !handle_stdin_input(bytes_read, input, node)? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    Ok(())
}

fn handle_stdin_input(bytes_read: io::Result<usize>, input: &str, node: &NetworkNode) -> Result<bool> {
    if bytes_read? == 0 {
        return Ok(false);
    }

    let text = input.trim_end();
    if text.is_empty() {
        return Ok(true);
    }
    if text.eq_ignore_ascii_case("/quit") {
        return Ok(false);
    }

    let sent = match parse_unicast(text) {
        Some((to, body)) => node.unicast_message(&to, "say", [body]),
        None => node.broadcast_message("say", [text]),
    };
    if let Err(err) = sent {
        // Unknown destinations are a typo, not a reason to leave.
        warn!(error = %err, "message not sent");
    }
    Ok(true)
}

fn parse_unicast(text: &str) -> Option<(NodeUid, &str)> {
    let rest = text.strip_prefix("/to ")?;
    let (to, body) = rest.trim_start().split_once(' ')?;
    Some((NodeUid::new(to), body))
}

fn print_message(message: Message) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", render_message(&message));
    let _ = stdout.flush();
}

fn render_message(message: &Message) -> String {
    let parts: Vec<_> = message
        .parts
        .iter()
        .map(|part| String::from_utf8_lossy(part))
        .collect();
    if message.channel.is_empty() {
        format!("<{}> {}: {}", message.from, message.msg_type, parts.join(" | "))
    } else {
        format!(
            "<{}> [{}] {}: {}",
            message.from,
            message.channel,
            message.msg_type,
            parts.join(" | ")
        )
    }
}
