// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! JSON-lines protocol spoken by the messaging gateway.
//!
//! Every line carries one object. Inbound objects are tagged with `kind`,
//! outbound ones with `event`.

pub mod auth;
pub mod codec;
pub mod mapping;
pub mod types;

pub use auth::{AuthError, NoAuthValidator, TokenSetValidator, TokenValidator};
pub use codec::{encode_event, parse_line, Inbound};
pub use mapping::{message_to_core, snapshot_event, transition_event};
pub use types::{GatewayEnvelope, GatewayEvent, GatewayMessage};
