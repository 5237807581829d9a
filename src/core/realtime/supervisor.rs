//! Reconnection supervisor.
//!
//! Consumes failure reports from the sender loop and the dispatcher, tears the
//! broken link down and re-establishes it with exponential backoff. Reports
//! for a link generation that is no longer live are ignored, so two tasks
//! noticing the same drop trigger a single recovery.

use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::session::{LinkFailure, Session};
use super::state::{SessionState, wait_for_state};
use super::transport::TransportFactory;

enum Recovery {
    Reconnected,
    Cancelled,
    GaveUp,
}

pub(crate) async fn run_supervisor(
    session: Arc<Session>,
    factory: Arc<dyn TransportFactory>,
    mut failures: mpsc::Receiver<LinkFailure>,
) {
    let mut state_rx = session.state.subscribe();

    debug!(session_id = %session.id, "Reconnection supervisor started");

    loop {
        let failure = tokio::select! {
            failure = failures.recv() => match failure {
                Some(failure) => failure,
                None => break,
            },
            _ = wait_for_state(&mut state_rx, SessionState::is_shutting_down) => break,
        };

        if session.state.get() != SessionState::Open
            || session.current_generation() != Some(failure.generation)
        {
            debug!(
                session_id = %session.id,
                generation = failure.generation,
                "Ignoring stale failure report: {}",
                failure.error
            );
            continue;
        }

        warn!(
            session_id = %session.id,
            generation = failure.generation,
            "Realtime link lost: {}",
            failure.error
        );
        session.record_error(failure.error.to_string());

        if !failure.error.is_retryable() {
            error!(session_id = %session.id, "Unrecoverable transport error: {}", failure.error);
            session.fail(failure.error.to_string()).await;
            break;
        }

        let policy = &session.config.reconnection;
        if !policy.should_retry(session.retry_count()) {
            error!(
                session_id = %session.id,
                "Reconnection not permitted (enabled: {}, budget: {})",
                policy.enabled,
                policy.budget_label()
            );
            session
                .fail(format!("connection lost: {}", failure.error))
                .await;
            break;
        }

        if session
            .state
            .transition_from(SessionState::Open, SessionState::Connecting)
            .is_err()
        {
            continue;
        }
        session.close_link().await;

        match reconnect(&session, factory.as_ref(), &mut state_rx).await {
            Recovery::Reconnected => continue,
            Recovery::Cancelled | Recovery::GaveUp => break,
        }
    }

    debug!(session_id = %session.id, "Reconnection supervisor stopped");
}

/// Retry opening a link until it succeeds, the budget runs out or the
/// session starts shutting down.
async fn reconnect(
    session: &Session,
    factory: &dyn TransportFactory,
    state_rx: &mut watch::Receiver<SessionState>,
) -> Recovery {
    let policy = &session.config.reconnection;

    loop {
        let attempts_made = session.retry_count();
        if !policy.should_retry(attempts_made) {
            error!(
                session_id = %session.id,
                "Giving up after {} reconnection attempts",
                attempts_made
            );
            let reason = match session.last_error() {
                Some(last) => format!("reconnection failed after {attempts_made} attempts: {last}"),
                None => format!("reconnection failed after {attempts_made} attempts"),
            };
            session.fail(reason).await;
            return Recovery::GaveUp;
        }

        let attempt = session.bump_retry();
        let delay = policy.calculate_delay(attempt);
        info!(
            session_id = %session.id,
            "Attempting reconnection {}/{} in {}ms",
            attempt,
            policy.budget_label(),
            delay.as_millis()
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = wait_for_state(state_rx, SessionState::is_shutting_down) => return Recovery::Cancelled,
        }

        match session.open_transport(factory).await {
            Ok(transport) => {
                let generation = session.install_link(transport);
                if session
                    .state
                    .transition_from(SessionState::Connecting, SessionState::Open)
                    .is_err()
                {
                    // disconnect won the race
                    session.close_link().await;
                    return Recovery::Cancelled;
                }
                session.reset_retries();
                info!(session_id = %session.id, generation, attempt, "Reconnected to realtime service");
                return Recovery::Reconnected;
            }
            Err(_) if session.state.get().is_shutting_down() => return Recovery::Cancelled,
            Err(e) if !e.is_retryable() => {
                error!(session_id = %session.id, attempt, "Reconnection rejected: {}", e);
                session.fail(e.to_string()).await;
                return Recovery::GaveUp;
            }
            Err(e) => {
                warn!(session_id = %session.id, attempt, "Reconnection attempt failed: {}", e);
                session.record_error(e.to_string());
            }
        }
    }
}
