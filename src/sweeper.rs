use crate::hub::TrackingHub;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Spawns the retention sweeper. Each tick prunes in-memory history by
/// wall-clock age; the database keeps its own retention and is never touched
/// from here. The task runs until aborted at shutdown.
pub fn spawn(hub: TrackingHub, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick fires immediately; skip it so the initial sweep
        // happens one full period after startup.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let sweep = hub.cleanup_memory().await;
            tracing::debug!(
                points_removed = sweep.points_removed,
                sessions_removed = sweep.sessions_removed,
                "retention sweep tick"
            );
        }
    })
}
