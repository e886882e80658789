use std::{path::Path, process::Stdio, time::Duration};

use anyhow::{Context, Result, anyhow};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    process::{Child, ChildStdin, ChildStdout, Command},
    time::timeout,
};

const READ_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn cli_nodes_exchange_unicasts() -> Result<()> {
    let binary = Path::new(env!("CARGO_BIN_EXE_paxos_mesh"));
    let peers = [
        format!("A={},{}", free_addr()?, free_addr()?),
        format!("B={},{}", free_addr()?, free_addr()?),
    ];

    let mut alice = spawn_node(binary, "A", &peers).await?;
    let mut bob = spawn_node(binary, "B", &peers).await?;

    // Unicasts are queued until the link is up, so no settling wait is needed.
    alice.send_line("/to B hello bob").await?;
    let bob_hears = read_line_expect(&mut bob.stdout, "waiting for bob to hear alice").await?;
    assert_eq!(bob_hears, "<A> say: hello bob");

    bob.send_line("/to A hi alice").await?;
    let alice_hears = read_line_expect(&mut alice.stdout, "waiting for alice to hear bob").await?;
    assert_eq!(alice_hears, "<B> say: hi alice");

    alice.send_line("/quit").await?;
    bob.send_line("/quit").await?;
    ensure_success(&mut alice.child, "node A").await?;
    ensure_success(&mut bob.child, "node B").await?;

    Ok(())
}

fn free_addr() -> Result<String> {
    let probe = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(probe.local_addr()?.to_string())
}

struct NodeProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl NodeProcess {
    async fn send_line(&mut self, line: &str) -> Result<()> {
        self.stdin
            .write_all(line.as_bytes())
            .await
            .with_context(|| format!("failed to send line '{line}'"))?;
        self.stdin.write_all(b"\n").await?;
        self.stdin.flush().await?;
        Ok(())
    }
}

async fn spawn_node(binary: &Path, uid: &str, peers: &[String]) -> Result<NodeProcess> {
    let mut cmd = Command::new(binary);
    cmd.arg("node")
        .arg("--uid")
        .arg(uid)
        .arg("--no-recv-self")
        .arg("--ready-timeout-ms")
        .arg("200");
    for peer in peers {
        cmd.arg("--peer").arg(peer);
    }
    cmd.env("RUST_LOG", "warn")
        .env("RUST_LOG_STYLE", "never")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn node {uid}"))?;
    let stdin = child.stdin.take().context("node stdin missing after spawn")?;
    let stdout = child
        .stdout
        .take()
        .context("node stdout missing after spawn")?;

    Ok(NodeProcess {
        child,
        stdin,
        stdout: BufReader::new(stdout),
    })
}

async fn read_line_expect(reader: &mut BufReader<ChildStdout>, description: &str) -> Result<String> {
    let mut line = String::new();
    let byte_count = timeout(READ_TIMEOUT, reader.read_line(&mut line))
        .await
        .map_err(|_| anyhow!("{description}: timed out waiting for line"))?
        .with_context(|| format!("{description}: failed to read line"))?;
    if byte_count == 0 {
        return Err(anyhow!("{description}: stream closed"));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

async fn ensure_success(child: &mut Child, label: &str) -> Result<()> {
    let status = timeout(READ_TIMEOUT, child.wait())
        .await
        .map_err(|_| anyhow!("{label} did not exit"))??;
    if !status.success() {
        return Err(anyhow!("{label} exited with {status}"));
    }
    Ok(())
}
