// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Weather monitor task.

use tokio::sync::{mpsc, watch};
use tokio::time;
use tracing::{debug, info, warn};

use obs_core::controller::PollingPolicy;
use obs_core::{ObsMessage, SafetyKind, SafetyMonitor, SafetySignal};

/// Read the monitor once. A failed read counts as unsafe.
pub async fn poll_once(monitor: &mut dyn SafetyMonitor) -> bool {
    match monitor.is_safe().await {
        Ok(safe) => safe,
        Err(e) => {
            warn!("Weather monitor read failed, assuming unsafe: {}", e);
            false
        }
    }
}

/// Poll `monitor` and send a weather safety signal whenever the reading
/// changes. `last_safe` is the value the controller already knows about.
pub async fn run_weather_monitor(
    mut monitor: Box<dyn SafetyMonitor>,
    polling: Box<dyn PollingPolicy>,
    mut last_safe: bool,
    inbox_tx: mpsc::Sender<ObsMessage>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    info!(
        "Weather monitor started ({}, currently {})",
        monitor.info().model,
        if last_safe { "safe" } else { "unsafe" }
    );

    loop {
        tokio::select! {
            _ = time::sleep(polling.interval(last_safe)) => {}
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
                continue;
            }
        }

        let safe = poll_once(monitor.as_mut()).await;
        if safe == last_safe {
            debug!("Weather unchanged ({})", safe);
            continue;
        }
        last_safe = safe;
        if safe {
            info!("Weather is safe again");
        } else {
            warn!("Weather became unsafe");
        }
        let signal = ObsMessage::Safety(SafetySignal {
            kind: SafetyKind::Weather,
            safe,
        });
        if inbox_tx.send(signal).await.is_err() {
            debug!("Controller inbox closed, stopping weather monitor");
            break;
        }
    }
}
