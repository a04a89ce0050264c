// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Controller task and its bridge to the gateway channels.

use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use obs_core::controller::{ObsListener, ObservationSnapshot, ObservatoryController, Transition};
use obs_core::pointing::PointingOutcome;
use obs_core::ObsError;
use obs_protocol::{transition_event, GatewayEvent};

/// Forwards controller notifications to the gateway.
///
/// State changes and observation counts go to every connected client through
/// `events_tx`; the latest snapshot is kept in `snapshot_tx` for `get_state`.
pub struct GatewayBridge {
    events_tx: broadcast::Sender<GatewayEvent>,
    snapshot_tx: watch::Sender<ObservationSnapshot>,
}

impl GatewayBridge {
    pub fn new(
        events_tx: broadcast::Sender<GatewayEvent>,
        snapshot_tx: watch::Sender<ObservationSnapshot>,
    ) -> Self {
        Self {
            events_tx,
            snapshot_tx,
        }
    }

    fn publish(&self, event: GatewayEvent) {
        // No subscribers just means no client is connected.
        let _ = self.events_tx.send(event);
    }
}

impl ObsListener for GatewayBridge {
    fn on_state_change(&self, transition: &Transition, _snapshot: &ObservationSnapshot) {
        self.publish(transition_event(transition));
    }

    fn on_pointing_outcome(&self, target: &str, outcome: &PointingOutcome) {
        debug!("Pointing on {} finished: {:?}", target, outcome);
    }

    fn on_target_observed(&self, target: &str, observation_count: u32) {
        self.publish(GatewayEvent::TargetObserved {
            target: target.to_string(),
            observation_count,
        });
    }

    fn on_snapshot(&self, snapshot: &ObservationSnapshot) {
        self.snapshot_tx.send_replace(snapshot.clone());
    }
}

/// Drive the controller until it exits. The bridge must already be
/// registered as a listener.
pub async fn run_controller_task(mut controller: ObservatoryController) -> Result<(), ObsError> {
    let result = controller.run().await;
    info!(
        "{} transitions, {} targets still need observations",
        controller.machine().transition_count(),
        controller.scheduler().remaining()
    );
    result
}
