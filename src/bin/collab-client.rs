//! collab-client - headless collaborator.
//!
//! Joins the configured document and appends every stdin line to it.
//! Lines starting with `/` are commands:
//! - `/comment <text>` comments at the start of the document
//! - `/resync` asks the relay for its text
//! - `/mine` and `/theirs` settle a pending conflict
//! - `/quit` leaves the session

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use collab_core::sync::connection::ConnectionManager;
use collab_core::sync::editor::BufferSurface;
use collab_core::{
    CollabConfig, Coordinator, CoordinatorHandle, Decision, Edit, Notice, Position,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "collab_core=info,collab_client=info".into()),
        )
        .init();

    let config = CollabConfig::from_env();
    info!(
        relay = %config.relay_url,
        document = %config.document_id,
        user = %config.user_name,
        "Starting client"
    );

    let surface = BufferSurface::default();
    let connection = ConnectionManager::websocket(&config);
    let mut coordinator = Coordinator::new(&config, surface.clone(), connection);
    coordinator
        .start()
        .await
        .context("could not join the document")?;
    info!(text = %coordinator.text(), "Joined");

    tokio::spawn(read_input(surface, coordinator.handle()));

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut shown_version = coordinator.document().version();
    let mut stopping = false;

    loop {
        tokio::select! {
            alive = coordinator.step() => {
                if !alive {
                    break;
                }
            }
            _ = &mut shutdown, if !stopping => {
                stopping = true;
                coordinator.handle().shutdown();
            }
        }

        for notice in coordinator.take_notices() {
            report(notice);
        }
        let version = coordinator.document().version();
        if version != shown_version {
            shown_version = version;
            info!(version, text = %coordinator.text(), "Document");
        }
    }

    info!("Left the document");
    Ok(())
}

async fn read_input(surface: BufferSurface, handle: CoordinatorHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim_end();
        match line.split_once(' ').unwrap_or((line, "")) {
            ("/quit", _) => break,
            ("/resync", _) => {
                if let Err(e) = handle.request_resync() {
                    warn!("Resync failed: {}", e);
                }
            }
            ("/mine", _) => settle(&handle, Decision::AcceptLocal).await,
            ("/theirs", _) => settle(&handle, Decision::AcceptRemote).await,
            ("/comment", text) => match handle.add_comment(text, Position::new(0, 0)).await {
                Ok(id) => info!(comment = %id, "Comment requested"),
                Err(e) => warn!("Comment failed: {}", e),
            },
            _ => {
                let end = surface.snapshot().end_position();
                let text = if end == Position::new(0, 0) {
                    line.to_string()
                } else {
                    format!("\n{}", line)
                };
                if let Err(e) = surface.user_edit(Edit::insert(end, text)) {
                    warn!("Edit failed: {}", e);
                }
            }
        }
    }

    handle.shutdown();
}

async fn settle(handle: &CoordinatorHandle, decision: Decision) {
    if let Err(e) = handle.resolve_conflict(decision).await {
        warn!("Could not settle conflict: {}", e);
    }
}

fn report(notice: Notice) {
    match notice {
        Notice::Connected { reconnected } => info!(reconnected, "Connected"),
        Notice::Disconnected => warn!("Connection lost, reconnecting"),
        Notice::Offline(e) => warn!("Working offline: {}", e),
        Notice::CollaboratorJoined(c) => info!(user = %c.name, color = %c.color, "Joined"),
        Notice::CollaboratorLeft(id) => info!(user = %id, "Left"),
        Notice::CursorMoved(_) => {}
        Notice::ConflictPending { local, remote } => warn!(
            local = %local.id(),
            remote = %remote.id(),
            "Conflicting edits; answer /mine or /theirs"
        ),
        Notice::Resynced { version } => info!(version, "Resynced"),
        Notice::LocalEditsDiscarded { count } => {
            warn!(count, "Edits made while offline were replaced by the relay's text")
        }
        Notice::Comment(comment) => info!(?comment, "Comment"),
        Notice::RelayError(message) => warn!("Relay error: {}", message),
    }
}
