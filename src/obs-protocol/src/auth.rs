// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Shared-secret check for gateway clients.

use std::collections::HashSet;

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("missing authorization token")]
    Missing,
    #[error("invalid authorization token")]
    Invalid,
}

/// Accepts the token as sent, with or without a `Bearer ` prefix.
pub fn strip_bearer(value: &str) -> &str {
    let trimmed = value.trim();
    match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("bearer ") => trimmed[7..].trim_start(),
        _ => trimmed,
    }
}

pub trait TokenValidator: Send + Sync {
    fn validate(&self, token: Option<&str>) -> Result<(), AuthError>;
}

/// Accepts any of a fixed set of tokens. An empty set disables the check.
#[derive(Debug, Clone, Default)]
pub struct TokenSetValidator {
    tokens: HashSet<String>,
}

impl TokenSetValidator {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens
                .into_iter()
                .map(Into::into)
                .filter(|t: &String| !t.trim().is_empty())
                .collect(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl TokenValidator for TokenSetValidator {
    fn validate(&self, token: Option<&str>) -> Result<(), AuthError> {
        if self.is_open() {
            return Ok(());
        }
        let token = token.ok_or(AuthError::Missing)?;
        if self.tokens.contains(strip_bearer(token)) {
            Ok(())
        } else {
            Err(AuthError::Invalid)
        }
    }
}

pub struct NoAuthValidator;

impl TokenValidator for NoAuthValidator {
    fn validate(&self, _token: Option<&str>) -> Result<(), AuthError> {
        Ok(())
    }
}
