use crate::address::CellAddress;
use crate::error::FormFillResult;
use crate::excel::{self, WriteReport};
use crate::types::{FieldCandidate, FillDirective, MatchResult, PendingField};
use std::collections::BTreeSet;

/// The usable value for `label`: present and not blank.
pub fn resolved_value<'a>(values: &'a MatchResult, label: &str) -> Option<&'a str> {
    values
        .get(label)
        .map(String::as_str)
        .filter(|v| !v.trim().is_empty())
}

/// One directive per candidate whose label has a value.
pub fn fill_directives(candidates: &[FieldCandidate], values: &MatchResult) -> Vec<FillDirective> {
    candidates
        .iter()
        .filter_map(|c| {
            resolved_value(values, &c.label).map(|value| FillDirective {
                target_cell: c.target_cell.to_string(),
                value: value.to_string(),
                label_guessed: Some(c.label.clone()),
            })
        })
        .collect()
}

/// Candidates still without a value, in candidate order, duplicates kept.
pub fn list_missing(candidates: &[FieldCandidate], values: &MatchResult) -> Vec<PendingField> {
    candidates
        .iter()
        .filter(|c| resolved_value(values, &c.label).is_none())
        .map(|c| PendingField {
            label_guessed: c.label.clone(),
            target_cell: c.target_cell,
        })
        .collect()
}

/// Write every resolved candidate into the sheet. Existing cell content is
/// overwritten; that is logged, not refused.
pub fn fill(
    sheet_bytes: &[u8],
    candidates: &[FieldCandidate],
    values: &MatchResult,
) -> FormFillResult<WriteReport> {
    let directives = fill_directives(candidates, values);
    let report = excel::write_cells(sheet_bytes, &directives)?;
    for addr in &report.overwritten {
        log::warn!("[fill] Overwrote existing content in {}", addr);
    }
    log::info!(
        "[fill] Wrote {} cells, skipped {}",
        report.written.len(),
        report.skipped.len()
    );
    Ok(report)
}

/// `phase_one` extended with the user's answers. A user answer only fills a
/// label that had no value.
pub fn merge_user_values(phase_one: &MatchResult, user_values: &MatchResult) -> MatchResult {
    let mut merged = phase_one.clone();
    for (label, value) in user_values {
        if value.trim().is_empty() || resolved_value(phase_one, label).is_some() {
            continue;
        }
        merged.insert(label.clone(), value.trim().to_string());
    }
    merged
}

/// Second pass: write only the candidates that were pending after the first
/// pass and whose cell is not in `written`, so nothing is written twice in a
/// session.
pub fn fill_pending(
    filled_bytes: &[u8],
    candidates: &[FieldCandidate],
    phase_one: &MatchResult,
    user_values: &MatchResult,
    written: &BTreeSet<CellAddress>,
) -> FormFillResult<(WriteReport, MatchResult)> {
    let pending: Vec<FieldCandidate> = candidates
        .iter()
        .filter(|c| resolved_value(phase_one, &c.label).is_none() && !written.contains(&c.target_cell))
        .cloned()
        .collect();
    let merged = merge_user_values(phase_one, user_values);
    let report = fill(filled_bytes, &pending, &merged)?;
    Ok((report, merged))
}
