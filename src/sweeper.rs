//! Background reservation sweeper.
//!
//! Runs on a fixed cadence and reclaims Active reservations past their
//! TTL. Each reclaimed hold emits exactly one `order.reservation.expired`
//! event from the engine.

use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::services::ReservationEngine;

/// Spawns the sweep loop. Dropping the handle does not stop the task; call
/// `abort` on shutdown.
pub fn spawn(engine: ReservationEngine, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a fresh process does
        // not sweep before consumers are registered.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            match engine.sweep_expired(Utc::now()).await {
                Ok(outcome) if outcome.expired_count > 0 => {
                    info!(
                        expired_count = outcome.expired_count,
                        "Reservation sweep reclaimed expired holds"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    error!(error = %e, "Reservation sweep failed");
                }
            }
        }
    })
}
