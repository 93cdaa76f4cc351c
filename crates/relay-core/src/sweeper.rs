//! Idle session sweeper
//!
//! Runs on its own interval, independent of any session's activity. Each idle
//! session is expired through its own task, so deletion goes through the same
//! serialization as every other event for that code.

use chrono::Utc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::coordinator::RelayCoordinator;

/// Spawn the periodic sweep; abort the handle to stop it
pub fn spawn_sweeper(
    coordinator: RelayCoordinator,
    every: Duration,
    idle_timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        ticker.tick().await;
        info!(
            "Session sweeper running every {:?}, idle timeout {:?}",
            every, idle_timeout
        );
        loop {
            ticker.tick().await;
            sweep_once(&coordinator, idle_timeout).await;
        }
    })
}

/// Expire every session idle for longer than `idle_timeout`
pub async fn sweep_once(coordinator: &RelayCoordinator, idle_timeout: Duration) -> usize {
    let Some(cutoff) = chrono::Duration::from_std(idle_timeout)
        .ok()
        .and_then(|timeout| Utc::now().checked_sub_signed(timeout))
    else {
        return 0;
    };

    match coordinator.expire_idle(cutoff).await {
        Ok(0) => {
            debug!("Sweep found no idle sessions");
            0
        }
        Ok(expired) => {
            info!("Sweep expired {} idle sessions", expired);
            expired
        }
        Err(e) => {
            error!("Session sweep failed: {}", e);
            0
        }
    }
}
