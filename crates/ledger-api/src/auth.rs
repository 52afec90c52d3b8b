//! Bearer-token identity resolution.
//!
//! Tokens map to principals through a static table loaded from
//! `LEDGER_API_TOKENS`. Handlers only ever see the resolved [`Principal`].

use std::collections::HashMap;
use std::fmt;

use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};
use tracing::{debug, warn};

use ledger_core::Principal;

use crate::error::ApiError;
use crate::AppState;

/// Token → principal lookup table.
#[derive(Clone, Default)]
pub struct TokenTable {
    entries: HashMap<String, Principal>,
}

impl TokenTable {
    /// Parse `token=id:Display Name;token2=id2:Other`.
    ///
    /// Malformed entries are skipped with a warning. The display name may be
    /// omitted, in which case the id is used.
    pub fn parse(raw: &str) -> Self {
        let mut entries = HashMap::new();
        for entry in raw.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((token, identity)) = entry.split_once('=') else {
                warn!(subsystem = "api", component = "auth", "Skipping token entry without '='");
                continue;
            };
            let token = token.trim();
            let (id, display_name) = match identity.split_once(':') {
                Some((id, name)) => (id.trim(), name.trim()),
                None => (identity.trim(), identity.trim()),
            };
            if token.is_empty() || id.is_empty() {
                warn!(subsystem = "api", component = "auth", "Skipping incomplete token entry");
                continue;
            }
            let display_name = if display_name.is_empty() { id } else { display_name };
            entries.insert(token.to_string(), Principal::new(id, display_name));
        }
        Self { entries }
    }

    pub fn resolve(&self, token: &str) -> Option<&Principal> {
        self.entries.get(token)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// Never print the tokens themselves.
impl fmt::Debug for TokenTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}

/// Extractor that requires a known bearer token.
#[derive(Debug, Clone)]
pub struct RequireAuth {
    pub principal: Principal,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for RequireAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .ok_or_else(|| ApiError::Unauthorized("Authentication required".to_string()))?;

        match state.tokens.resolve(token) {
            Some(principal) => {
                debug!(
                    subsystem = "api",
                    component = "auth",
                    principal_id = %principal.id,
                    "Request authenticated"
                );
                Ok(RequireAuth {
                    principal: principal.clone(),
                })
            }
            None => Err(ApiError::Unauthorized("Invalid token".to_string())),
        }
    }
}
