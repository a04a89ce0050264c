// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Conversion between wire DTOs and controller types.

use obs_core::controller::{ObservationSnapshot, Transition};
use obs_core::{ObsMessage, SafetySignal};

use crate::types::{GatewayEvent, GatewayMessage};

/// The controller message for a wire message. `GetState` is answered by the
/// gateway itself and has no controller counterpart.
pub fn message_to_core(message: &GatewayMessage) -> Option<ObsMessage> {
    match *message {
        GatewayMessage::Safety { signal, safe } => {
            Some(ObsMessage::Safety(SafetySignal { kind: signal, safe }))
        }
        GatewayMessage::Shutdown => Some(ObsMessage::Shutdown),
        GatewayMessage::Override { action } => Some(ObsMessage::Override(action)),
        GatewayMessage::GetState => None,
    }
}

pub fn transition_event(transition: &Transition) -> GatewayEvent {
    GatewayEvent::StateChange {
        previous: transition.previous,
        current: transition.current,
        timestamp: transition.timestamp,
        target: transition
            .target
            .clone()
            .or_else(|| transition.released.clone()),
    }
}

pub fn snapshot_event(snapshot: &ObservationSnapshot) -> GatewayEvent {
    GatewayEvent::State(snapshot.clone())
}
