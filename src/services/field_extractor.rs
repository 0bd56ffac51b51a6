//! Detect fillable fields in an indexed sheet via the model.

use crate::error::{FormFillError, FormFillResult};
use crate::excel::{self, SheetLayout};
use crate::inference::{generate_structured, InferenceClient, Outcome, Prompt};
use crate::types::{FieldCandidate, SheetCell};
use serde::Deserialize;
use serde_json::{json, Value};

const INSTRUCTIONS: &str = "You read vendor registration forms laid out in a spreadsheet. \
The input lists every cell of the form in reading order as {address, value}; empty cells have an empty value. \
Identify each field the vendor has to fill in. For each one return the field's label as written on the form \
(fieldName) and the A1 address of the empty cell where its answer belongs (cellLocation), usually right of or \
below the label. Do not return headings or instructions.";

#[derive(Debug, Deserialize)]
struct ExtractedFields {
    fields: Vec<ExtractedField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractedField {
    field_name: String,
    cell_location: String,
}

fn output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "fields": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "fieldName": { "type": "string" },
                        "cellLocation": { "type": "string" }
                    },
                    "required": ["fieldName", "cellLocation"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["fields"],
        "additionalProperties": false
    })
}

fn build_prompt(cells: &[SheetCell]) -> Prompt {
    let listing: Vec<Value> = cells
        .iter()
        .map(|c| json!({ "address": c.address.to_string(), "value": c.text }))
        .collect();
    Prompt {
        name: "form_fields",
        instructions: INSTRUCTIONS.to_string(),
        input: json!({ "cells": listing }),
        output_schema: Some(output_schema()),
    }
}

/// Index `sheet_bytes` and ask the model for its field candidates.
/// Structural workbook errors propagate; every inference problem becomes
/// `EmptyExtraction`.
pub fn extract(client: &dyn InferenceClient, sheet_bytes: &[u8]) -> FormFillResult<Vec<FieldCandidate>> {
    let (layout, cells) = excel::read_indexed(sheet_bytes)?;
    extract_from_cells(client, &layout, &cells)
}

/// Candidate targets are resolved against `layout`: merged cells become
/// their anchor, anything off the sheet is dropped.
pub fn extract_from_cells(
    client: &dyn InferenceClient,
    layout: &SheetLayout,
    cells: &[SheetCell],
) -> FormFillResult<Vec<FieldCandidate>> {
    if cells.iter().all(|c| c.text.trim().is_empty()) {
        log::info!("[extract] Sheet has no text, nothing to detect");
        return Err(FormFillError::EmptyExtraction);
    }

    let fields = match generate_structured::<ExtractedFields>(client, &build_prompt(cells)) {
        Outcome::Ok(out) => out.fields,
        Outcome::Empty => {
            log::warn!("[extract] Model returned an empty answer");
            return Err(FormFillError::EmptyExtraction);
        }
        Outcome::SchemaInvalid(e) => {
            log::warn!("[extract] Answer failed schema validation: {}", e);
            return Err(FormFillError::EmptyExtraction);
        }
        Outcome::Unavailable(e) => {
            log::warn!("[extract] Inference unavailable: {}", e);
            return Err(FormFillError::EmptyExtraction);
        }
    };

    let candidates: Vec<FieldCandidate> = fields
        .into_iter()
        .filter_map(|f| {
            let label = f.field_name.trim();
            if label.is_empty() {
                log::warn!("[extract] Dropping field with no label at {:?}", f.cell_location);
                return None;
            }
            match layout.resolve(&f.cell_location) {
                Ok(target_cell) => Some(FieldCandidate {
                    label: label.to_string(),
                    target_cell,
                }),
                Err(reason) => {
                    log::warn!("[extract] Dropping '{}': {}", label, reason);
                    None
                }
            }
        })
        .collect();

    if candidates.is_empty() {
        return Err(FormFillError::EmptyExtraction);
    }
    log::info!("[extract] {} field candidates", candidates.len());
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceError;
    use crate::test_utils::{form_workbook, vendor_form, ScriptedInference};
    use rust_xlsxwriter::{Format, Workbook};

    #[test]
    fn maps_fields_and_drops_bad_locations() {
        let client = ScriptedInference::answers(&[r#"{"fields": [
            {"fieldName": "Vendor Name", "cellLocation": "B1"},
            {"fieldName": "GST", "cellLocation": "$b$2"},
            {"fieldName": "Bank", "cellLocation": "next to bank"},
            {"fieldName": "  ", "cellLocation": "B3"},
            {"fieldName": "Vendor Name", "cellLocation": "B1"}
        ]}"#]);
        let candidates = extract(&client, &vendor_form()).unwrap();
        let listing: Vec<(String, String)> = candidates
            .iter()
            .map(|c| (c.label.clone(), c.target_cell.to_string()))
            .collect();
        assert_eq!(
            listing,
            vec![
                ("Vendor Name".to_string(), "B1".to_string()),
                ("GST".to_string(), "B2".to_string()),
                ("Vendor Name".to_string(), "B1".to_string()),
            ]
        );
    }

    #[test]
    fn targets_resolve_against_the_sheet() {
        let mut workbook = Workbook::new();
        let worksheet = workbook.add_worksheet();
        worksheet.set_name("Vendor Form").unwrap();
        worksheet.write_string(0, 0, "Vendor Name:").unwrap();
        worksheet.merge_range(0, 1, 0, 3, "", &Format::new()).unwrap();
        let bytes = workbook.save_to_buffer().unwrap();

        let client = ScriptedInference::answers(&[r#"{"fields": [
            {"fieldName": "Vendor Name", "cellLocation": "C1"},
            {"fieldName": "Bank IFSC", "cellLocation": "Z99"},
            {"fieldName": "PAN", "cellLocation": "Sheet2!B1"}
        ]}"#]);
        let candidates = extract(&client, &bytes).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].label, "Vendor Name");
        assert_eq!(candidates[0].target_cell.to_string(), "B1");
    }

    #[test]
    fn answers_entirely_off_the_sheet_find_nothing() {
        let bytes = form_workbook(&[("A1", "Vendor Name:"), ("B1", "")]);
        let client = ScriptedInference::answers(&[r#"{"fields": [{"fieldName": "Vendor Name", "cellLocation": "Q40"}]}"#]);
        assert!(matches!(extract(&client, &bytes), Err(FormFillError::EmptyExtraction)));
    }

    #[test]
    fn prompt_lists_every_cell_in_order() {
        let client = ScriptedInference::answers(&[r#"{"fields": [{"fieldName": "GST", "cellLocation": "B2"}]}"#]);
        extract(&client, &vendor_form()).unwrap();
        let prompts = client.prompts();
        let cells = prompts[0].input["cells"].as_array().unwrap();
        let addresses: Vec<&str> = cells.iter().map(|c| c["address"].as_str().unwrap()).collect();
        assert_eq!(addresses, ["A1", "B1", "A2", "B2"]);
        assert_eq!(cells[0]["value"], "Vendor Name:");
        assert!(prompts[0].output_schema.is_some());
    }

    #[test]
    fn every_failure_mode_is_empty_extraction() {
        let client = ScriptedInference::new(vec![
            Ok(r#"{"fields": []}"#.to_string()),
            Ok("".to_string()),
            Ok(r#"[{"fieldName": "GST"}]"#.to_string()),
            Err(InferenceError::Timeout),
        ]);
        for _ in 0..4 {
            assert!(matches!(
                extract(&client, &vendor_form()),
                Err(FormFillError::EmptyExtraction)
            ));
        }
    }

    #[test]
    fn structural_errors_are_not_masked() {
        let client = ScriptedInference::answers(&[]);
        assert!(matches!(
            extract(&client, b"PK\x03\x04garbage"),
            Err(FormFillError::UnreadableFile(_))
        ));
        assert!(client.prompts().is_empty());
    }
}
