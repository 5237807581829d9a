//! Sender loop: drains the outbound queue onto the live transport.
//!
//! Items are written strictly in queue order. An item whose write fails is
//! held back and retried on the next link, so a reconnect never reorders or
//! silently loses audio under [`OutboundRetention::Preserve`].

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use super::base::{OutboundItem, OutboundRetention};
use super::session::{Link, Session};
use super::state::SessionState;
use super::transport::{BoxedTransport, TransportResult};

pub(crate) async fn run_sender(session: Arc<Session>, mut outbound: mpsc::Receiver<OutboundItem>) {
    let mut state_rx = session.state.subscribe();
    let mut link_rx = session.subscribe_link();
    let retention = session.config.retention;
    let mut pending: Option<OutboundItem> = None;
    let mut last_generation: Option<u64> = None;
    let mut sent: u64 = 0;

    debug!(session_id = %session.id, "Sender loop started");

    loop {
        let state = *state_rx.borrow_and_update();
        if state.is_shutting_down() {
            if state == SessionState::Closing && retention == OutboundRetention::Preserve {
                sent += flush(&session, &mut outbound, pending.take()).await;
            }
            break;
        }

        let link = link_rx.borrow_and_update().clone();
        let link = match (state, link) {
            (SessionState::Open, Some(link)) => link,
            _ => {
                wait_for_change(&mut state_rx, &mut link_rx).await;
                continue;
            }
        };

        if last_generation.is_some_and(|g| g != link.generation)
            && retention == OutboundRetention::DiscardOnReconnect
        {
            let dropped = discard(&mut outbound, pending.take());
            if dropped > 0 {
                warn!(
                    session_id = %session.id,
                    generation = link.generation,
                    dropped,
                    "Discarded queued outbound items after reconnection"
                );
            }
        }
        last_generation = Some(link.generation);

        let item = match pending.take() {
            Some(item) => item,
            None => tokio::select! {
                biased;
                _ = state_rx.changed() => continue,
                _ = link_rx.changed() => continue,
                item = outbound.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            },
        };

        match write_item(&link.transport, &item).await {
            Ok(()) => {
                sent += 1;
                trace!(session_id = %session.id, kind = item.kind(), "Outbound item written");
            }
            Err(error) => {
                warn!(
                    session_id = %session.id,
                    generation = link.generation,
                    kind = item.kind(),
                    "Outbound write failed: {}",
                    error
                );
                pending = Some(item);
                session.report_failure(link.generation, error);
                wait_for_change(&mut state_rx, &mut link_rx).await;
            }
        }
    }

    debug!(session_id = %session.id, sent, "Sender loop stopped");
}

/// Write whatever is still queued to the current link, stopping at the first failure.
async fn flush(
    session: &Session,
    outbound: &mut mpsc::Receiver<OutboundItem>,
    pending: Option<OutboundItem>,
) -> u64 {
    let Some(link) = session.current_link() else {
        let dropped = discard(outbound, pending);
        if dropped > 0 {
            warn!(session_id = %session.id, dropped, "No link to flush outbound items to");
        }
        return 0;
    };

    let mut flushed = 0;
    let mut next = pending;
    loop {
        let item = match next.take() {
            Some(item) => item,
            None => match outbound.try_recv() {
                Ok(item) => item,
                Err(_) => break,
            },
        };

        if let Err(e) = write_item(&link.transport, &item).await {
            warn!(session_id = %session.id, flushed, "Flush interrupted: {}", e);
            break;
        }
        flushed += 1;
    }

    debug!(session_id = %session.id, flushed, "Flushed outbound queue");
    flushed
}

fn discard(outbound: &mut mpsc::Receiver<OutboundItem>, pending: Option<OutboundItem>) -> usize {
    let mut dropped = usize::from(pending.is_some());
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

async fn write_item(transport: &BoxedTransport, item: &OutboundItem) -> TransportResult<()> {
    match item {
        OutboundItem::AudioFrame { data, .. } => transport.send_binary(data.clone()).await,
        OutboundItem::ControlMessage(payload) => transport.send_text(payload.to_string()).await,
    }
}

/// Park until either the state or the link changes.
pub(crate) async fn wait_for_change(
    state_rx: &mut watch::Receiver<SessionState>,
    link_rx: &mut watch::Receiver<Option<Link>>,
) {
    tokio::select! {
        _ = state_rx.changed() => {}
        _ = link_rx.changed() => {}
    }
}
