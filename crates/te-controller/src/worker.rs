//! Allocation worker: drains a flow source into the engine, one event at a
//! time.

use std::sync::Arc;
use te_engine::{AllocationEngine, FlowSource};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Handle events until the source closes or `shutdown` flips to true.
/// An event in progress always completes. Returns the number of events
/// handled.
pub async fn run_worker<S: FlowSource>(
    engine: Arc<AllocationEngine>,
    mut source: S,
    mut shutdown: watch::Receiver<bool>,
) -> u64 {
    let mut handled = 0u64;
    loop {
        let event = tokio::select! {
            event = source.next_event() => event,
            _ = shutdown.changed() => {
                info!(handled, "Worker stopping on shutdown");
                return handled;
            }
        };
        let Some(event) = event else {
            info!(handled, "Flow source closed, worker stopping");
            return handled;
        };

        match engine.handle(event).await {
            Ok(Some(decision)) => debug!(
                flow = %decision.flow,
                outcome = decision.outcome.label(),
                hops = decision.path.len(),
                "Flow event handled"
            ),
            Ok(None) => {}
            Err(e) => warn!(error = %e, "Flow event rejected"),
        }
        handled += 1;
    }
}
