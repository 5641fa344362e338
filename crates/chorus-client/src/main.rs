//! Line-oriented terminal client for the chorus backend. Presentation
//! glue only: all protocol and state logic lives in chorus-session and
//! chorus-client::connection.

use anyhow::{Context, Result};
use chorus_client::connection::{self, ConnectionConfig, LinkEvent, LinkState};
use chorus_core::{decode_event, ServerEvent};
use chorus_session::{SelectionStore, SessionController, SortKey, Turn};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tracing::warn;
use tracing_subscriber::EnvFilter;
use url::Url;

#[derive(Debug, Parser)]
#[command(name = "chorus-client", about = "Terminal client for the chorus chat backend")]
struct Args {
    /// WebSocket endpoint of the backend.
    #[arg(long, default_value = "ws://localhost:8000/ws", env = "CHORUS_URL")]
    url: String,

    /// Wallet public key announced to the backend.
    #[arg(long, env = "CHORUS_PUBLIC_KEY")]
    public_key: Option<String>,

    /// Client state file (last selected thread).
    #[arg(long, env = "CHORUS_STATE_FILE")]
    state_file: Option<PathBuf>,

    /// Seconds between reconnect attempts.
    #[arg(long, default_value_t = 3)]
    reconnect_delay: u64,

    /// Reconnect attempts before giving up.
    #[arg(long, default_value_t = 10)]
    max_reconnect_attempts: u32,
}

fn resolve_state_file(arg: Option<PathBuf>) -> PathBuf {
    if let Some(path) = arg {
        return path;
    }
    let base = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    base.join(".chorus/state.json")
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let url = Url::parse(&args.url).context("invalid websocket url")?;
    let config = ConnectionConfig {
        url,
        reconnect_delay: Duration::from_secs(args.reconnect_delay),
        max_reconnect_attempts: args.max_reconnect_attempts,
    };

    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (identity_tx, identity_rx) = watch::channel(None);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (state_tx, _state_rx) = watch::channel(LinkState::default());

    let store = SelectionStore::open(resolve_state_file(args.state_file));
    let mut session = SessionController::new(store, outbound_tx, identity_tx);
    if let Some(public_key) = &args.public_key {
        session.set_identity(public_key);
    }

    let link = tokio::spawn(connection::run_connection(
        config,
        identity_rx,
        outbound_rx,
        events_tx,
        state_tx,
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("chorus client ready; /help for commands");

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                let Some(event) = event else {
                    break;
                };
                if !handle_link_event(&mut session, event) {
                    break;
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if !handle_line(&mut session, line.trim()) {
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(error = %err, "stdin read failed");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    drop(session);
    link.abort();
    Ok(())
}

/// Returns false once the connection has given up for good.
fn handle_link_event(session: &mut SessionController, event: LinkEvent) -> bool {
    match event {
        LinkEvent::Open => {
            session.connection_opened();
            println!("* connected");
        }
        LinkEvent::Closed => {
            session.connection_closed();
            println!("* connection lost; reconnecting");
        }
        LinkEvent::GaveUp => {
            session.connection_gave_up();
            println!("* disconnected; giving up");
            return false;
        }
        LinkEvent::Inbound(raw) => match decode_event(&raw) {
            Ok(event) => {
                render_event(&event);
                session.apply_event(event);
            }
            Err(err) => warn!(error = %err, "dropping undecodable frame"),
        },
    }
    true
}

fn render_event(event: &ServerEvent) {
    match event {
        ServerEvent::Chorus(chorus) => {
            if let (Some(step), Some(content)) = (&chorus.step, &chorus.content) {
                println!("[{step}] {content}");
            }
        }
        ServerEvent::Init(init) => {
            println!("* signed in as {}; {} thread(s)", init.user.id, init.chat_threads.len());
        }
        ServerEvent::NewThread(payload) => {
            println!("* thread created: {} ({})", payload.chat_thread.name, payload.chat_thread.id);
        }
        ServerEvent::ThreadMessages(payload) => {
            println!("* history loaded for {}: {} message(s)", payload.thread_id, payload.messages.len());
        }
        ServerEvent::Error(payload) => {
            println!("! server error: {}", payload.error);
        }
    }
}

/// Returns false on /quit.
fn handle_line(session: &mut SessionController, line: &str) -> bool {
    match line.split_once(' ').map_or((line, ""), |(cmd, rest)| (cmd, rest.trim())) {
        ("", _) => {}
        ("/quit", _) | ("/exit", _) => return false,
        ("/help", _) => {
            println!("/threads /select <id> /new /history /sources /sort <key> /quit");
        }
        ("/threads", _) => {
            for thread in session.registry().threads() {
                let marker = if session.selected_thread() == Some(thread.id.as_str()) {
                    "*"
                } else {
                    " "
                };
                println!("{marker} {}  {}", thread.id, thread.name);
            }
        }
        ("/select", id) if !id.is_empty() => {
            if let Err(err) = session.select_thread(id) {
                println!("! {err}");
            }
        }
        ("/select", _) => println!("! usage: /select <thread-id>"),
        ("/new", _) => {
            if let Err(err) = session.create_thread() {
                println!("! cannot create thread: {err}");
            }
        }
        ("/history", _) => {
            for turn in session.active_turns() {
                match turn {
                    Turn::User { content, .. } => println!("you: {content}"),
                    Turn::Assistant(turn) => {
                        if let Some(content) = turn.display_content() {
                            let status = if turn.is_complete { "" } else { " (streaming)" };
                            println!("assistant{status}: {content}");
                        }
                    }
                }
            }
        }
        ("/sources", _) => {
            for source in session.ranked_sources() {
                println!(
                    "- [{:.2}] {}",
                    source.similarity.unwrap_or(0.0),
                    source.content
                );
            }
        }
        ("/sort", key) => match key.parse::<SortKey>() {
            Ok(key) => session.set_sort_key(key),
            Err(err) => println!("! {err}"),
        },
        _ if line.starts_with('/') => println!("! unknown command: {line}"),
        _ => {
            if let Err(err) = session.submit(line) {
                println!("! cannot send: {err}");
            }
        }
    }
    true
}
