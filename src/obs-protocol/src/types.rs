// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Transport DTOs for the JSON line protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use obs_core::controller::{ObservationSnapshot, ObservationState};
use obs_core::{OverrideAction, SafetyKind};

/// Message received from a gateway client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GatewayMessage {
    Safety { signal: SafetyKind, safe: bool },
    Shutdown,
    Override { action: OverrideAction },
    /// Ask for the current snapshot; answered only to the sender.
    GetState,
}

impl GatewayMessage {
    /// Values accepted in the `kind` field.
    pub const KINDS: &'static [&'static str] = &["safety", "shutdown", "override", "get_state"];
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub message: GatewayMessage,
}

/// Line sent to gateway clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum GatewayEvent {
    StateChange {
        previous: ObservationState,
        current: ObservationState,
        timestamp: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    State(ObservationSnapshot),
    TargetObserved {
        target: String,
        observation_count: u32,
    },
    Error {
        message: String,
    },
}
