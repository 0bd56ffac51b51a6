//! The fill workflow: upload, answer pending fields, correct.

use crate::address::CellAddress;
use crate::config::CorrectionMode;
use crate::error::FormFillResult;
use crate::excel;
use crate::inference::InferenceClient;
use crate::services::master_data::{merge_and_persist, MasterDataStore};
use crate::services::{correction_engine, data_matcher, field_extractor, form_filler};
use crate::session::{FillStatus, SessionState};
use crate::types::{CorrectionDirective, MasterData, MatchResult, PendingField, SkippedWrite};

/// Result of one step, with the advanced session.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub state: SessionState,
    pub pending: Vec<PendingField>,
    pub written: Vec<CellAddress>,
    pub skipped: Vec<SkippedWrite>,
    pub corrections: Vec<CorrectionDirective>,
    pub warnings: Vec<String>,
}

impl StepOutcome {
    fn new(state: SessionState) -> Self {
        let pending = state.pending_fields();
        Self {
            state,
            pending,
            written: Vec::new(),
            skipped: Vec::new(),
            corrections: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn status(&self) -> FillStatus {
        if self.pending.is_empty() {
            FillStatus::Success
        } else {
            FillStatus::AwaitingInput
        }
    }
}

pub struct Pipeline<'a> {
    pub inference: &'a dyn InferenceClient,
    pub store: &'a dyn MasterDataStore,
    pub correction_mode: CorrectionMode,
}

impl<'a> Pipeline<'a> {
    /// Index, extract, match and write the first pass.
    pub fn start(&self, user_id: &str, file_name: &str, bytes: &[u8]) -> FormFillResult<StepOutcome> {
        let mut warnings = Vec::new();
        let master_data = match self.store.get(user_id) {
            Ok(data) => data.unwrap_or_default(),
            Err(e) => {
                log::warn!("[pipeline] Master data unavailable for {}: {}", user_id, e);
                warnings.push(format!("Saved master data could not be loaded: {}", e));
                MasterData::new()
            }
        };

        let candidates = field_extractor::extract(self.inference, bytes)?;
        let labels: Vec<String> = candidates.iter().map(|c| c.label.clone()).collect();
        let values = data_matcher::match_values(self.inference, &labels, &master_data);
        let report = form_filler::fill(bytes, &candidates, &values)?;

        let state = SessionState::new(
            file_name.to_string(),
            report.bytes,
            candidates,
            values,
            report.written.iter().copied(),
        );
        let mut outcome = StepOutcome::new(state);
        outcome.written = report.written;
        outcome.skipped = report.skipped;
        outcome.warnings = warnings;
        log::info!(
            "[pipeline] {} started: {} written, {} pending",
            file_name,
            outcome.written.len(),
            outcome.pending.len()
        );
        Ok(outcome)
    }

    /// Second pass with the user's answers; optionally remembered as master data.
    pub fn resume(
        &self,
        user_id: &str,
        mut state: SessionState,
        user_values: &MatchResult,
        remember: bool,
    ) -> FormFillResult<StepOutcome> {
        let pending_labels: Vec<String> = state
            .pending_fields()
            .into_iter()
            .map(|p| p.label_guessed)
            .collect();
        let (report, merged) =
            form_filler::fill_pending(
                &state.current,
                &state.candidates,
                &state.values,
                user_values,
                &state.written,
            )?;

        let provided: MasterData = user_values
            .iter()
            .filter(|(label, _)| pending_labels.contains(*label))
            .map(|(label, value)| (label.clone(), value.clone()))
            .collect();

        state.current = report.bytes;
        state.values = merged;
        state.written.extend(report.written.iter().copied());

        let mut outcome = StepOutcome::new(state);
        outcome.written = report.written;
        outcome.skipped = report.skipped;
        if remember {
            outcome.warnings.extend(self.remember(user_id, &provided));
        }
        Ok(outcome)
    }

    /// Apply free-text feedback. Corrected cells that were waiting for an
    /// answer count as answered, and are remembered when asked to.
    pub fn correct(
        &self,
        user_id: &str,
        mut state: SessionState,
        feedback: &str,
        remember: bool,
    ) -> FormFillResult<StepOutcome> {
        let pending = state.pending_fields();
        let (corrections, report) =
            correction_engine::correct(self.inference, &state.current, feedback, self.correction_mode)?;

        let mut provided = MasterData::new();
        if !pending.is_empty() && !report.written.is_empty() {
            let layout = excel::read_layout(&state.current)?;
            for correction in &corrections {
                let Ok(addr) = layout.resolve(&correction.target_cell) else {
                    continue;
                };
                let value = correction.value.trim();
                if value.is_empty() || !report.written.contains(&addr) {
                    continue;
                }
                for field in pending.iter().filter(|p| p.target_cell == addr) {
                    state.values.insert(field.label_guessed.clone(), value.to_string());
                    provided.insert(field.label_guessed.clone(), value.to_string());
                }
            }
        }

        state.current = report.bytes;
        state.written.extend(report.written.iter().copied());

        let mut outcome = StepOutcome::new(state);
        outcome.written = report.written;
        outcome.skipped = report.skipped;
        outcome.corrections = corrections;
        if remember {
            outcome.warnings.extend(self.remember(user_id, &provided));
        }
        Ok(outcome)
    }

    /// Merge `provided` into the user's saved master data. Nothing is written
    /// when the current mapping can't be read, so it is never clobbered.
    fn remember(&self, user_id: &str, provided: &MasterData) -> Option<String> {
        if provided.is_empty() {
            return None;
        }
        match self.store.get(user_id) {
            Ok(existing) => {
                merge_and_persist(self.store, user_id, &existing.unwrap_or_default(), provided).warning
            }
            Err(e) => {
                log::warn!("[pipeline] Not saving values for {}: {}", user_id, e);
                Some(e.to_string())
            }
        }
    }
}
