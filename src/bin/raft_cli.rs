use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use std::time::Duration;
use tokio::net::TcpStream;

use raft_node::codec::{read_frame, write_frame};
use raft_node::{ClientReply, ClientRequest, RpcMessage};

const MAX_REDIRECTS: usize = 3;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Talk to a Raft node", long_about = None)]
struct Cli {
    /// Address of the node to contact first (e.g. 127.0.0.1:9081)
    #[clap(short, long, global = true, default_value = "127.0.0.1:9081")]
    address: String,

    /// Seconds to wait for each reply. A leader short of a quorum answers
    /// only once its round has waited out every peer (3 attempts of 5s plus
    /// backoff with the node's default retry settings).
    #[clap(long, global = true, default_value_t = 20)]
    timeout_secs: u64,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Append a command to the replicated log (via the leader)
    Append {
        #[clap(value_parser)]
        command: String,
    },
    /// Print the node's status as JSON
    Status,
}

async fn exchange(addr: &str, request: &RpcMessage, timeout: Duration) -> anyhow::Result<RpcMessage> {
    let call = async {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("failed to connect to {}", addr))?;
        write_frame(&mut stream, request).await?;
        match read_frame(&mut stream).await? {
            Some(reply) => Ok::<_, anyhow::Error>(reply),
            None => bail!("{} closed the connection without replying", addr),
        }
    };
    tokio::time::timeout(timeout, call)
        .await
        .with_context(|| format!("no reply from {} within {:?}", addr, timeout))?
}

/// Sends the append to `initial_addr`, following not-leader redirects.
async fn append(initial_addr: String, command: String, timeout: Duration) -> anyhow::Result<ClientReply> {
    let request = RpcMessage::ClientAppend(ClientRequest { command });
    let mut target = initial_addr;
    for attempt in 0..=MAX_REDIRECTS {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        match exchange(&target, &request, timeout).await? {
            RpcMessage::ClientReply(ClientReply::NotLeader {
                leader_addr: Some(next),
                ..
            }) if attempt < MAX_REDIRECTS => {
                eprintln!("[cli] {} is not the leader, redirecting to {}", target, next);
                target = next;
            }
            RpcMessage::ClientReply(reply) => return Ok(reply),
            RpcMessage::Error { message, .. } => bail!("{} failed the request: {}", target, message),
            other => bail!("unexpected {} reply from {}", other.kind(), target),
        }
    }
    bail!("gave up after {} redirects, last target {}", MAX_REDIRECTS, target)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let timeout = Duration::from_secs(cli.timeout_secs);

    match cli.command {
        Commands::Append { command } => match append(cli.address, command, timeout).await? {
            ClientReply::Appended {
                index,
                term,
                committed,
            } => {
                println!("appended at index {} (term {}), committed: {}", index, term, committed);
            }
            ClientReply::NotLeader {
                leader_id,
                leader_addr,
            } => {
                println!("not the leader; known leader: {:?} at {:?}", leader_id, leader_addr);
            }
            ClientReply::Rejected { reason } => bail!("rejected: {}", reason),
        },
        Commands::Status => match exchange(&cli.address, &RpcMessage::Status, timeout).await? {
            RpcMessage::StatusReply(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            other => bail!("unexpected {} reply", other.kind()),
        },
    }
    Ok(())
}
