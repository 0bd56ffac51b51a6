//! Turn free-text feedback on a filled sheet into cell overwrites.

use crate::config::CorrectionMode;
use crate::error::{FormFillError, FormFillResult};
use crate::excel::{self, WriteReport};
use crate::inference::{generate_structured, generate_text, InferenceClient, Outcome, Prompt};
use crate::types::{CorrectionDirective, FillDirective, SheetCell};
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::OnceLock;

const STRUCTURED_INSTRUCTIONS: &str = "You correct a filled vendor form. The input has the form's cells \
in reading order as {address, value} and the user's feedback. Return one correction per cell the feedback \
asks to change, with the cell's A1 address (targetCell) and its new value. Only blank a cell when the \
feedback explicitly asks for it. Return an empty list when nothing should change.";

const TEXT_INSTRUCTIONS: &str = "You correct a filled vendor form. The input has the form's cells in \
reading order as {address, value} and the user's feedback. Answer with one line per cell to change, \
formatted exactly as CELL: new value (for example B1: Acme Pvt Ltd). Write nothing else.";

#[derive(Debug, Deserialize)]
struct Corrections {
    corrections: Vec<CorrectionDirective>,
}

fn output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "corrections": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "targetCell": { "type": "string" },
                        "value": { "type": "string" }
                    },
                    "required": ["targetCell", "value"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["corrections"],
        "additionalProperties": false
    })
}

fn build_prompt(cells: &[SheetCell], feedback: &str, mode: CorrectionMode) -> Prompt {
    let listing: Vec<Value> = cells
        .iter()
        .map(|c| json!({ "address": c.address.to_string(), "value": c.text }))
        .collect();
    let input = json!({ "cells": listing, "feedback": feedback.trim() });
    match mode {
        CorrectionMode::Structured => Prompt {
            name: "form_corrections",
            instructions: STRUCTURED_INSTRUCTIONS.to_string(),
            input,
            output_schema: Some(output_schema()),
        },
        CorrectionMode::RawText => Prompt {
            name: "form_corrections_text",
            instructions: TEXT_INSTRUCTIONS.to_string(),
            input,
            output_schema: None,
        },
    }
}

fn correction_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[-*]\s*)?(\$?[A-Za-z]{1,3}\$?[0-9]{1,7})\s*[:=]\s*(.*?)\s*$")
            .expect("correction line regex")
    })
}

fn strip_quotes(value: &str) -> &str {
    for q in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(q) && value.ends_with(q) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// `CELL: value` lines of a plain-text answer. Lines that don't fit are skipped.
pub fn parse_correction_lines(text: &str) -> Vec<CorrectionDirective> {
    text.lines()
        .filter_map(|line| {
            let parsed = correction_line_re().captures(line).map(|caps| CorrectionDirective {
                target_cell: caps[1].to_ascii_uppercase(),
                value: strip_quotes(&caps[2]).to_string(),
            });
            if parsed.is_none() && !line.trim().is_empty() {
                log::debug!("[correct] Skipping unparseable line {:?}", line);
            }
            parsed
        })
        .collect()
}

/// Directives the feedback asks for. Blank feedback is a no-op. Inference
/// problems yield no corrections, except an empty plain-text answer which is
/// `EmptyGeneration`.
pub fn propose_corrections(
    client: &dyn InferenceClient,
    sheet_bytes: &[u8],
    feedback: &str,
    mode: CorrectionMode,
) -> FormFillResult<Vec<CorrectionDirective>> {
    if feedback.trim().is_empty() {
        return Ok(Vec::new());
    }
    let cells = excel::index_sheet(sheet_bytes)?;
    let prompt = build_prompt(&cells, feedback, mode);

    let corrections = match mode {
        CorrectionMode::Structured => match generate_structured::<Corrections>(client, &prompt) {
            Outcome::Ok(out) => out.corrections,
            Outcome::Empty => {
                log::warn!("[correct] Model returned an empty answer");
                Vec::new()
            }
            Outcome::SchemaInvalid(e) => {
                log::warn!("[correct] Answer failed schema validation: {}", e);
                Vec::new()
            }
            Outcome::Unavailable(e) => {
                log::warn!("[correct] Inference unavailable: {}", e);
                Vec::new()
            }
        },
        CorrectionMode::RawText => match generate_text(client, &prompt) {
            Outcome::Ok(text) => parse_correction_lines(&text),
            Outcome::Empty => return Err(FormFillError::EmptyGeneration),
            Outcome::SchemaInvalid(e) | Outcome::Unavailable(e) => {
                log::warn!("[correct] Inference unavailable: {}", e);
                Vec::new()
            }
        },
    };
    log::info!("[correct] {} corrections proposed", corrections.len());
    Ok(corrections)
}

/// Overwrite each target cell, per-cell fail-soft.
pub fn apply_corrections(
    sheet_bytes: &[u8],
    corrections: &[CorrectionDirective],
) -> FormFillResult<WriteReport> {
    let directives: Vec<FillDirective> = corrections.iter().map(FillDirective::from).collect();
    excel::write_cells(sheet_bytes, &directives)
}

/// Propose and apply in one step.
pub fn correct(
    client: &dyn InferenceClient,
    sheet_bytes: &[u8],
    feedback: &str,
    mode: CorrectionMode,
) -> FormFillResult<(Vec<CorrectionDirective>, WriteReport)> {
    let corrections = propose_corrections(client, sheet_bytes, feedback, mode)?;
    let report = apply_corrections(sheet_bytes, &corrections)?;
    Ok((corrections, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceError;
    use crate::test_utils::{cell_text, form_workbook, ScriptedInference};

    fn filled_form() -> Vec<u8> {
        form_workbook(&[
            ("A1", "Vendor Name:"),
            ("B1", "Acme"),
            ("A2", "GST:"),
            ("B2", "27AAAAA0000A1Z5"),
        ])
    }

    #[test]
    fn parses_plain_text_lines() {
        let parsed = parse_correction_lines("B1: 'New Corp'\n- c7 = \"x, y\"\nsure, here you go\nD2:\n");
        assert_eq!(
            parsed,
            vec![
                CorrectionDirective { target_cell: "B1".to_string(), value: "New Corp".to_string() },
                CorrectionDirective { target_cell: "C7".to_string(), value: "x, y".to_string() },
                CorrectionDirective { target_cell: "D2".to_string(), value: String::new() },
            ]
        );
    }

    #[test]
    fn blank_feedback_skips_the_model() {
        let client = ScriptedInference::answers(&[]);
        let out = propose_corrections(&client, &filled_form(), "  \n", CorrectionMode::Structured).unwrap();
        assert!(out.is_empty());
        assert!(client.prompts().is_empty());
    }

    #[test]
    fn structured_correction_changes_only_target_cell() {
        let client = ScriptedInference::answers(&[
            r#"{"corrections": [{"targetCell": "B1", "value": "New Corp"}]}"#,
        ]);
        let bytes = filled_form();
        let (corrections, report) =
            correct(&client, &bytes, "Change B1 to 'New Corp'", CorrectionMode::Structured).unwrap();

        assert_eq!(
            corrections,
            vec![CorrectionDirective { target_cell: "B1".to_string(), value: "New Corp".to_string() }]
        );
        assert_eq!(cell_text(&report.bytes, "B1"), "New Corp");
        assert_eq!(cell_text(&report.bytes, "A1"), "Vendor Name:");
        assert_eq!(cell_text(&report.bytes, "B2"), "27AAAAA0000A1Z5");

        let input = &client.prompts()[0].input;
        assert_eq!(input["feedback"], "Change B1 to 'New Corp'");
        assert_eq!(input["cells"][1]["value"], "Acme");
    }

    #[test]
    fn structured_failures_mean_no_corrections() {
        let client = ScriptedInference::new(vec![
            Err(InferenceError::Timeout),
            Ok(r#"{"fixes": []}"#.to_string()),
        ]);
        let bytes = filled_form();
        for _ in 0..2 {
            let (corrections, report) =
                correct(&client, &bytes, "fix the GST", CorrectionMode::Structured).unwrap();
            assert!(corrections.is_empty());
            assert_eq!(report.bytes, bytes);
        }
    }

    #[test]
    fn empty_text_answer_is_a_hard_failure() {
        let client = ScriptedInference::answers(&["  "]);
        let err = propose_corrections(&client, &filled_form(), "fix it", CorrectionMode::RawText).unwrap_err();
        assert!(matches!(err, FormFillError::EmptyGeneration));
    }

    #[test]
    fn text_mode_applies_parsed_lines_and_skips_bad_cells() {
        let client = ScriptedInference::answers(&["B2: 29BBBBB1111B1Z1\nZZ900: lost"]);
        let (corrections, report) =
            correct(&client, &filled_form(), "GST changed", CorrectionMode::RawText).unwrap();
        assert_eq!(corrections.len(), 2);
        assert_eq!(report.written.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert_eq!(cell_text(&report.bytes, "B2"), "29BBBBB1111B1Z1");
        assert!(client.prompts()[0].output_schema.is_none());
    }
}
