use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::Polling;
use crate::oracle::BroadcastOracle;
use crate::tx::TxId;

/// Result of the short acceptance poll. Running out of attempts is not a
/// failure: the ledger may have the transaction even though we never saw it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Acceptance {
    Accepted,
    Unconfirmed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InclusionOutcome {
    Included,
    Unconfirmed,
    Cancelled,
}

/// Polls `accepted(id)` at a fixed interval up to the attempt cap.
/// Oracle errors count as a "not yet".
pub async fn poll_acceptance(oracle: &dyn BroadcastOracle, id: &TxId, polling: &Polling) -> Acceptance {
    let attempts = polling.acceptance_attempts.max(1);
    for attempt in 1..=attempts {
        match oracle.accepted(id).await {
            Ok(true) => {
                debug!(id = %id.short(), attempt, "transaction accepted");
                return Acceptance::Accepted;
            }
            Ok(false) => {}
            Err(e) => warn!(id = %id.short(), attempt, "acceptance query failed: {e}"),
        }
        if attempt < attempts {
            sleep(polling.acceptance_interval()).await;
        }
    }
    info!(id = %id.short(), attempts, "acceptance not observed; leaving transaction unconfirmed");
    Acceptance::Unconfirmed
}

/// Polls `included(id)` until it reports true, the time budget runs out, or
/// `shutdown` fires. A closed shutdown channel also cancels.
pub async fn poll_inclusion(
    oracle: &dyn BroadcastOracle,
    id: &TxId,
    polling: &Polling,
    mut shutdown: broadcast::Receiver<()>,
) -> InclusionOutcome {
    let mut ticker = interval(polling.inclusion_interval().max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let budget = sleep(polling.inclusion_budget());
    tokio::pin!(budget);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(id = %id.short(), "inclusion poll cancelled");
                return InclusionOutcome::Cancelled;
            }
            _ = &mut budget => {
                info!(id = %id.short(), "inclusion budget exhausted");
                return InclusionOutcome::Unconfirmed;
            }
            _ = ticker.tick() => {
                match oracle.included(id).await {
                    Ok(true) => return InclusionOutcome::Included,
                    Ok(false) => {}
                    Err(e) => warn!(id = %id.short(), "inclusion query failed: {e}"),
                }
            }
        }
    }
}
