use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use peer_mesh::{MeshEvent, Orchestrator, PeerId, SignalingSession};
use signaling_bus::{LocalSignalingStore, SignalingChannel};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};
use transport_webrtc::WebRtcTransportFactory;

use crate::config::AppConfig;

struct Seat {
    id: PeerId,
    session: SignalingSession,
}

/// Connects every seat to every other, broadcasts one greeting per seat and
/// waits for all of them to land.
pub async fn run(config: &AppConfig) -> Result<()> {
    let seats = config.seats()?;
    let store = Arc::new(LocalSignalingStore::new());
    let (feed_tx, mut feed_rx) = mpsc::unbounded_channel::<(PeerId, MeshEvent)>();

    let mut table = Vec::with_capacity(seats.len());
    for id in seats.iter() {
        let mesh = config
            .mesh_config(id)
            .with_context(|| format!("configuring seat {id}"))?;
        let factory = WebRtcTransportFactory::new(&mesh).shared();
        let (handle, events) = Orchestrator::spawn(&mesh, factory)?;
        let channel: Arc<dyn SignalingChannel> = store.clone();
        let (session, mut events) = SignalingSession::start(handle, events, channel).await?;

        let feed = feed_tx.clone();
        let seat = id.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if feed.send((seat.clone(), event)).is_err() {
                    break;
                }
            }
        });
        table.push(Seat {
            id: id.clone(),
            session,
        });
    }
    drop(feed_tx);

    for seat in &table {
        seat.session
            .dial_all()
            .await
            .with_context(|| format!("seat {} could not dial", seat.id))?;
    }

    let expected_links = seats.len() * (seats.len() - 1);
    let deadline = Instant::now() + config.connect_timeout();
    let mut established: HashSet<(PeerId, PeerId)> = HashSet::new();
    while established.len() < expected_links {
        let Some((seat, event)) = next_before(&mut feed_rx, deadline).await else {
            bail!(
                "only {} of {expected_links} links came up within {:?}",
                established.len(),
                config.connect_timeout()
            );
        };
        match event {
            MeshEvent::ConnectionEstablished(remote) => {
                info!(%seat, %remote, "link established");
                established.insert((seat, remote));
            }
            MeshEvent::ConnectionFailed { peer, reason } => {
                bail!("{seat} could not reach {peer}: {reason}");
            }
            MeshEvent::SignalingFailed { peer, reason } => {
                warn!(%seat, %peer, %reason, "signaling write failed");
            }
            _ => {}
        }
    }

    for seat in &table {
        let text = format!("{} {}", config.greeting, seat.id);
        let delivered = seat.session.handle().send_message(&text).await?;
        info!(seat = %seat.id, delivered, "greeting sent");
    }

    let deadline = Instant::now() + config.connect_timeout();
    let mut heard = 0;
    while heard < expected_links {
        let Some((seat, event)) = next_before(&mut feed_rx, deadline).await else {
            warn!(heard, expected = expected_links, "not every greeting arrived");
            break;
        };
        if let MeshEvent::MessageReceived { peer, text } = event {
            println!("{seat} <- {peer}: {text}");
            heard += 1;
        }
    }

    for seat in table {
        let handle = seat.session.handle().clone();
        for remote in seats.others(&seat.id) {
            handle.close_connection(remote).await?;
        }
        seat.session.shutdown().await?;
        handle.shutdown().await?;
    }
    info!(seats = seats.len(), messages = heard, "table closed");

    if heard < expected_links {
        bail!("{heard} of {expected_links} greetings arrived");
    }
    Ok(())
}

async fn next_before(
    feed: &mut mpsc::UnboundedReceiver<(PeerId, MeshEvent)>,
    deadline: Instant,
) -> Option<(PeerId, MeshEvent)> {
    tokio::time::timeout_at(deadline, feed.recv()).await.ok().flatten()
}
