//! Multi-step fill session carried by the client as an opaque token.
//!
//! Nothing about a session is kept server-side: every step decodes the token,
//! advances the state and hands a fresh token back. A token is
//! `<state json>.<sheet bytes>`, both URL-safe base64, so the sheet is only
//! encoded once.

use crate::address::CellAddress;
use crate::error::{FormFillError, FormFillResult};
use crate::services::form_filler;
use crate::types::{FieldCandidate, MatchResult, PendingField};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

const SESSION_VERSION: u32 = 2;

/// Outcome of a step as the client sees it. `idle` and `processing` only
/// exist client-side, before a response arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FillStatus {
    AwaitingInput,
    Error,
    Success,
}

/// Upper bound on the token length for a sheet of `sheet_bytes`, given the
/// rest of the state stays under `state_bytes` of JSON.
pub fn max_token_len(sheet_bytes: usize, state_bytes: usize) -> usize {
    (sheet_bytes + state_bytes + 2).div_ceil(3) * 4 + 1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    version: u32,
    pub file_name: String,
    /// The sheet as filled so far. Carried in the token's second segment.
    #[serde(skip)]
    pub current: Vec<u8>,
    pub candidates: Vec<FieldCandidate>,
    pub values: MatchResult,
    /// Cells written by any step of this session.
    pub written: BTreeSet<CellAddress>,
}

impl SessionState {
    pub fn new(
        file_name: String,
        current: Vec<u8>,
        candidates: Vec<FieldCandidate>,
        values: MatchResult,
        written: impl IntoIterator<Item = CellAddress>,
    ) -> Self {
        Self {
            version: SESSION_VERSION,
            file_name,
            current,
            candidates,
            values,
            written: written.into_iter().collect(),
        }
    }

    pub fn encode(&self) -> FormFillResult<String> {
        let json = serde_json::to_vec(self).map_err(|e| FormFillError::Internal(e.to_string()))?;
        Ok(format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(json),
            URL_SAFE_NO_PAD.encode(&self.current)
        ))
    }

    /// Any token that is missing, corrupt or from another version means the
    /// session has to be restarted.
    pub fn decode(token: &str) -> FormFillResult<Self> {
        let token = token.trim();
        if token.is_empty() {
            return Err(FormFillError::SessionExpired);
        }
        let Some((state_part, sheet_part)) = token.split_once('.') else {
            log::warn!("[session] Token has no sheet segment");
            return Err(FormFillError::SessionExpired);
        };
        let undecodable = |e: base64::DecodeError| {
            log::warn!("[session] Undecodable token: {}", e);
            FormFillError::SessionExpired
        };
        let json = URL_SAFE_NO_PAD.decode(state_part.as_bytes()).map_err(undecodable)?;
        let current = URL_SAFE_NO_PAD.decode(sheet_part.as_bytes()).map_err(undecodable)?;
        let mut state: SessionState = serde_json::from_slice(&json).map_err(|e| {
            log::warn!("[session] Malformed session state: {}", e);
            FormFillError::SessionExpired
        })?;
        if state.version != SESSION_VERSION {
            log::warn!("[session] Session version {} is not {}", state.version, SESSION_VERSION);
            return Err(FormFillError::SessionExpired);
        }
        if current.is_empty() {
            log::warn!("[session] Token carries no sheet");
            return Err(FormFillError::SessionExpired);
        }
        state.current = current;
        Ok(state)
    }

    /// What the user still has to answer: one entry per target cell, never a
    /// cell this session already wrote.
    pub fn pending_fields(&self) -> Vec<PendingField> {
        dedupe_pending(form_filler::list_missing(&self.candidates, &self.values), &self.written)
    }
}

/// Keep the first pending field per target cell and drop written cells.
pub fn dedupe_pending(missing: Vec<PendingField>, written: &BTreeSet<CellAddress>) -> Vec<PendingField> {
    let mut seen = BTreeSet::new();
    missing
        .into_iter()
        .filter(|p| !written.contains(&p.target_cell) && seen.insert(p.target_cell))
        .collect()
}
