//! RED — terminal front end for a collaborative editing session.
//!
//! Binds a session on `--addr`, invites any `--invite` peers, then reads
//! commands from stdin and prints every converged text as `[update] <text>`.
//!
//! ```bash
//! red --addr 127.0.0.1:9000
//! red --addr 127.0.0.1:9001 --invite 127.0.0.1:9000
//! ```

mod commands;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};

use commands::{Command, HELP};
use red_session::{Session, SessionConfig, TransportConfig};

#[derive(Parser)]
#[command(name = "red")]
#[command(about = "Peer-to-peer collaborative text editing session")]
#[command(version)]
struct Cli {
    /// Address to listen on (host:port). Peers reach this session at the
    /// same address, so it must be routable from them; wildcard hosts such
    /// as 0.0.0.0 are rejected
    #[arg(short, long)]
    addr: String,

    /// Peer to invite on startup; may be repeated
    #[arg(short, long)]
    invite: Vec<String>,

    /// Converged texts buffered before remote edits are held back
    #[arg(long, default_value_t = 64)]
    update_capacity: usize,

    /// Seconds to wait when connecting to a peer
    #[arg(long, default_value_t = 5)]
    connect_timeout: u64,
}

impl Cli {
    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            update_capacity: self.update_capacity,
            transport: TransportConfig {
                connect_timeout_secs: self.connect_timeout,
                ..TransportConfig::default()
            },
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let session = Session::create_with_config(cli.addr.clone(), cli.session_config())
        .await
        .with_context(|| format!("Failed to start session on {}", cli.addr))?;
    info!("Listening on {}", session.address());

    let updates = session.fetch_updates();
    let printer = tokio::spawn(async move {
        while let Some(text) = updates.recv().await {
            println!("[update] {text}");
        }
    });

    for peer in &cli.invite {
        if let Err(e) = session.invite(peer).await {
            warn!("Invite to {peer} failed: {e}");
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read stdin")? {
        let cmd = match Command::parse(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("{e} (try 'help')");
                continue;
            }
        };
        if cmd == Command::Quit {
            break;
        }
        run(&session, cmd).await;
    }

    session.terminate().await;
    let _ = printer.await;
    info!("Session on {} closed", session.address());
    Ok(())
}

async fn run(session: &Session, cmd: Command) {
    match cmd {
        Command::Invite(addr) => match session.invite(&addr).await {
            Ok(()) => println!("invited {addr}"),
            Err(e) => eprintln!("{e}"),
        },
        Command::Edit(edit) => match session.notify(edit).await {
            Ok(report) => println!("sent {edit} to {} peer(s)", report.delivered.len()),
            Err(e) => eprintln!("{e}"),
        },
        Command::Peers => {
            let peers = session.peers().await;
            if peers.is_empty() {
                println!("no peers");
            }
            for peer in peers {
                println!("{peer}");
            }
        }
        Command::Stats => println!("{:?}", session.stats()),
        Command::Help => println!("{HELP}"),
        Command::Quit => {}
    }
}
