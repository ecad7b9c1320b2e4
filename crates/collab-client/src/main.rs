//! collab-client: join a collaborative note or board from the terminal.
//!
//! Connects to the relay, loads the document from the REST store, then reads
//! edit commands from stdin while logging everything peers do.

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use collab_client::config::offline_policy;
use collab_client::{ClientConfig, FileBackupStorage, HttpDocumentStore, SessionHandle};
use collab_core::{
    BackupStorage, BoardDocument, Document, DocumentId, DocumentStore, Edge, InMemoryStorage, Node,
    NodePatch, NoteDocument, SessionEvent, SessionIdentity,
};

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Note,
    Board,
}

#[derive(Parser, Debug)]
#[command(name = "collab-client")]
#[command(about = "Real-time collaborative note and board client")]
struct Args {
    /// Document type to open
    #[arg(value_enum)]
    kind: Kind,

    /// Note or board id
    id: String,

    /// User id announced to the relay (generated if not provided)
    #[arg(long)]
    user_id: Option<String>,

    /// Display name announced to the relay
    #[arg(short, long, default_value = "anonymous")]
    username: String,

    /// Relay base URL (overrides COLLAB_WS_URL)
    #[arg(long)]
    ws_url: Option<String>,

    /// REST base URL (overrides COLLAB_API_URL)
    #[arg(long)]
    api_url: Option<String>,

    /// Bearer token for the REST store (overrides COLLAB_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Directory for local backups (overrides COLLAB_BACKUP_DIR)
    #[arg(long)]
    backup_dir: Option<PathBuf>,

    /// Queue up to N operations while disconnected (0 drops them)
    #[arg(long)]
    offline_queue: Option<usize>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,collab_client=debug,collab_core=debug"
    } else {
        "info,collab_client=info,collab_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = ClientConfig::from_env().context("Invalid environment configuration")?;
    if let Some(url) = args.ws_url.clone() {
        config.ws_url = url;
    }
    if let Some(url) = args.api_url.clone() {
        config.api_url = url;
    }
    if let Some(token) = args.token.clone() {
        config.token = Some(token);
    }
    if let Some(dir) = args.backup_dir.clone() {
        config.backup_dir = Some(dir);
    }
    if let Some(capacity) = args.offline_queue {
        config.session.offline = offline_policy(capacity);
    }
    config.validate()?;

    let user_id = args.user_id.clone().unwrap_or_else(|| {
        let id = uuid::Uuid::new_v4().to_string();
        info!("Generated user ID: {}", id);
        id
    });
    let identity = SessionIdentity::new(user_id, args.username.clone());

    let backups: Arc<dyn BackupStorage> = match &config.backup_dir {
        Some(dir) => {
            info!("Local backups in {:?}", dir);
            Arc::new(FileBackupStorage::new(dir).context("Failed to open backup directory")?)
        }
        None => {
            warn!("No backup directory configured; backups are kept in memory only");
            Arc::new(InMemoryStorage::new())
        }
    };
    let store = Arc::new(HttpDocumentStore::new(
        config.api_url.clone(),
        config.token.as_deref(),
    )?);

    let id = DocumentId::new(args.id.clone());
    match args.kind {
        Kind::Note => {
            let store: Arc<dyn DocumentStore<NoteDocument>> = store;
            let session =
                SessionHandle::open(&config.ws_url, id, identity, store, backups, config.session).await?;
            run(session, note_command).await
        }
        Kind::Board => {
            let store: Arc<dyn DocumentStore<BoardDocument>> = store;
            let session =
                SessionHandle::open(&config.ws_url, id, identity, store, backups, config.session).await?;
            run(session, board_command).await
        }
    }
}

type NoteSession = SessionHandle<NoteDocument>;
type BoardSession = SessionHandle<BoardDocument>;

/// Kind-specific edit parsed from a stdin line.
type Edit<D> = Box<dyn FnOnce(&SessionHandle<D>, &D) -> collab_client::session::Result<()>>;

async fn run<D: Document>(
    session: SessionHandle<D>,
    parse: fn(&str) -> Result<Edit<D>>,
) -> Result<()> {
    let _subscription = session.subscribe(log_event::<D>);

    info!("Session open. Type :help for commands, Ctrl+C to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match handle_line(&session, parse, line.trim()).await {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(e) => error!("{:#}", e),
                }
            }

            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    session.close().await?;
    Ok(())
}

/// Handle one command line. Returns `false` to quit.
async fn handle_line<D: Document>(
    session: &SessionHandle<D>,
    parse: fn(&str) -> Result<Edit<D>>,
    line: &str,
) -> Result<bool> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        ":quit" | ":q" => return Ok(false),
        ":help" => print_help(),
        ":save" => {
            session.force_save().await?;
            info!("Saved");
        }
        ":status" => {
            let status = session.status();
            info!(
                "{:?} (attempt {}), unsaved: {}, online: {}",
                status.connection, status.attempts, status.has_unsaved_changes, status.presence.online
            );
            for member in &status.presence.members {
                info!("  {} ({})", member.username, member.user_id);
            }
        }
        ":show" => {
            let document = session.document().await?;
            println!("{}", serde_json::to_string_pretty(&document)?);
        }
        ":reconnect" => session.reconnect()?,
        ":backup" => session.snapshot().await?,
        ":backups" => {
            for (index, backup) in session.list_backups().await?.iter().enumerate() {
                info!("[{}] {} {}", index, backup.timestamp, backup.preview);
            }
        }
        ":restore" => {
            let index: usize = rest.trim().parse().context("usage: :restore <index>")?;
            let restored = session
                .restore(index)
                .await?
                .ok_or_else(|| anyhow!("no backup at index {}", index))?;
            session.update(move |document| *document = restored)?;
            info!("Restored backup {}", index);
        }
        _ => {
            let edit = parse(line)?;
            let current = session.document().await?;
            edit(session, &current)?;
        }
    }
    Ok(true)
}

fn print_help() {
    println!(
        ":save  :status  :show  :reconnect  :backup  :backups  :restore <n>  :quit\n\
         note:  :title <text>   any other line is appended to the content\n\
         board: :node <id> <x> <y> [type]  :move <id> <x> <y>  :rm <id>\n\
         \u{20}      :edge <id> <from> <to>  :unedge <id>"
    );
}

fn note_command(line: &str) -> Result<Edit<NoteDocument>> {
    if let Some(title) = line.strip_prefix(":title ") {
        let title = title.to_string();
        return Ok(Box::new(move |session: &NoteSession, _: &NoteDocument| session.rename(title)));
    }
    if line.starts_with(':') {
        bail!("unknown command {:?}", line);
    }
    let line = line.to_string();
    Ok(Box::new(move |session: &NoteSession, note: &NoteDocument| {
        let mut content = note.content.clone();
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&line);
        session.edit_content(content)
    }))
}

fn board_command(line: &str) -> Result<Edit<BoardDocument>> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let coord = |s: &str| -> Result<f64> { s.parse().with_context(|| format!("invalid coordinate {:?}", s)) };

    let edit: Edit<BoardDocument> = match parts.as_slice() {
        [":node", id, x, y, rest @ ..] => {
            let node = Node::new(*id, rest.first().copied().unwrap_or("text"), coord(x)?, coord(y)?);
            Box::new(move |session: &BoardSession, _: &BoardDocument| session.add_node(node))
        }
        [":move", id, x, y] => {
            let patch = NodePatch::new(*id).set("x", coord(x)?).set("y", coord(y)?);
            Box::new(move |session: &BoardSession, _: &BoardDocument| session.update_node(patch))
        }
        [":rm", id] => {
            let id = id.to_string();
            Box::new(move |session: &BoardSession, _: &BoardDocument| session.delete_node(id))
        }
        [":edge", id, from, to] => {
            let edge = Edge::new(*id, *from, *to);
            Box::new(move |session: &BoardSession, _: &BoardDocument| session.add_edge(edge))
        }
        [":unedge", id] => {
            let id = id.to_string();
            Box::new(move |session: &BoardSession, _: &BoardDocument| session.delete_edge(id))
        }
        _ => bail!("unknown board command {:?}; try :help", line),
    };
    Ok(edit)
}

fn log_event<D: Document>(event: SessionEvent<D>) {
    match event {
        SessionEvent::ConnectionChanged { state, attempts } => {
            info!("Connection: {:?} (attempts: {})", state, attempts)
        }
        SessionEvent::RemoteOperation(operation) => {
            info!(
                "{} applied {:?}",
                operation.username.as_deref().unwrap_or("peer"),
                operation.op
            )
        }
        SessionEvent::DocumentReplaced(document) => info!("Document replaced: {}", document.preview()),
        SessionEvent::PresenceChanged(presence) => {
            let names: Vec<&str> = presence.members.iter().map(|m| m.username.as_str()).collect();
            info!("Online ({}): {}", presence.online, names.join(", "))
        }
        SessionEvent::PeerTyping { username, active } => {
            let who = username.as_deref().unwrap_or("someone");
            if active {
                info!("{} is typing...", who)
            } else {
                debug!("{} stopped typing", who)
            }
        }
        SessionEvent::SaveStarted => debug!("Saving..."),
        SessionEvent::SaveSucceeded => debug!("Saved"),
        SessionEvent::SaveFailed { message } => warn!("Save failed: {}", message),
        SessionEvent::Notice(notice) => info!("Notice: {:?}", notice),
        SessionEvent::OperationDropped => warn!("Offline: operation not sent"),
        SessionEvent::BackupStored { timestamp } => debug!("Local backup at {}", timestamp),
        SessionEvent::BackupFailed { message } => warn!("Local backup failed: {}", message),
    }
}
