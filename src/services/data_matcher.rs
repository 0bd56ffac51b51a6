//! Fuzzy match form labels against a user's master data via the model.

use crate::inference::{generate_structured, InferenceClient, Outcome, Prompt};
use crate::types::{MasterData, MatchResult};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::BTreeSet;

const INSTRUCTIONS: &str = "You fill vendor forms from a company's saved profile. \
For every entry of fieldNames, find the masterData key that means the same thing even when worded \
differently (e.g. \"GSTIN\" and \"GST Number\") and return its value. If no key is a close match, return \
an empty string as the value. Never invent values and never combine several keys.";

#[derive(Debug, Deserialize)]
struct Matches {
    matches: Vec<MatchedField>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MatchedField {
    field_name: String,
    value: String,
}

fn output_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "matches": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "fieldName": { "type": "string" },
                        "value": { "type": "string" }
                    },
                    "required": ["fieldName", "value"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["matches"],
        "additionalProperties": false
    })
}

/// One value per requested label, `""` where nothing matched. Never fails:
/// inference problems and empty master data yield the all-empty mapping.
pub fn match_values(
    client: &dyn InferenceClient,
    labels: &[String],
    master_data: &MasterData,
) -> MatchResult {
    let requested: BTreeSet<&str> = labels.iter().map(String::as_str).collect();
    let mut result: MatchResult = requested
        .iter()
        .map(|label| (label.to_string(), String::new()))
        .collect();

    if requested.is_empty() || master_data.is_empty() {
        log::info!("[match] No master data to match {} labels against", requested.len());
        return result;
    }

    let prompt = Prompt {
        name: "field_matches",
        instructions: INSTRUCTIONS.to_string(),
        input: json!({ "fieldNames": requested, "masterData": master_data }),
        output_schema: Some(output_schema()),
    };
    let matches = match generate_structured::<Matches>(client, &prompt) {
        Outcome::Ok(out) => out.matches,
        Outcome::Empty => {
            log::warn!("[match] Model returned an empty answer");
            return result;
        }
        Outcome::SchemaInvalid(e) => {
            log::warn!("[match] Answer failed schema validation: {}", e);
            return result;
        }
        Outcome::Unavailable(e) => {
            log::warn!("[match] Inference unavailable: {}", e);
            return result;
        }
    };

    for m in matches {
        match result.get_mut(&m.field_name) {
            Some(slot) => *slot = m.value.trim().to_string(),
            None => log::debug!("[match] Ignoring unrequested label {:?}", m.field_name),
        }
    }
    let matched = result.values().filter(|v| !v.is_empty()).count();
    log::info!("[match] Matched {}/{} labels", matched, result.len());
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::InferenceError;
    use crate::test_utils::ScriptedInference;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn master(pairs: &[(&str, &str)]) -> MasterData {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn unmatched_labels_stay_present_and_empty() {
        let client = ScriptedInference::answers(&[r#"{"matches": [
            {"fieldName": "Vendor Name", "value": "Acme"},
            {"fieldName": "Fax", "value": "nope"}
        ]}"#]);
        let result = match_values(
            &client,
            &labels(&["Vendor Name", "GST"]),
            &master(&[("Company Name", "Acme")]),
        );
        assert_eq!(result.get("Vendor Name").map(String::as_str), Some("Acme"));
        assert_eq!(result.get("GST").map(String::as_str), Some(""));
        assert!(!result.contains_key("Fax"));
    }

    #[test]
    fn empty_master_data_skips_the_model() {
        let client = ScriptedInference::answers(&[]);
        let result = match_values(&client, &labels(&["Vendor Name", "GST"]), &MasterData::new());
        assert_eq!(result, master(&[("GST", ""), ("Vendor Name", "")]));
        assert!(client.prompts().is_empty());
    }

    #[test]
    fn failures_fail_soft() {
        let client = ScriptedInference::new(vec![
            Err(InferenceError::Http { status: 500, body: String::new() }),
            Ok("not json".to_string()),
        ]);
        let data = master(&[("Company Name", "Acme")]);
        for _ in 0..2 {
            let result = match_values(&client, &labels(&["Vendor Name"]), &data);
            assert_eq!(result, master(&[("Vendor Name", "")]));
        }
    }

    #[test]
    fn prompt_carries_deduplicated_labels_and_master_data() {
        let client = ScriptedInference::answers(&[r#"{"matches": []}"#]);
        match_values(
            &client,
            &labels(&["GST", "GST", "Vendor Name"]),
            &master(&[("GST Number", "27AAAAA0000A1Z5")]),
        );
        let input = &client.prompts()[0].input;
        assert_eq!(input["fieldNames"], json!(["GST", "Vendor Name"]));
        assert_eq!(input["masterData"]["GST Number"], "27AAAAA0000A1Z5");
    }
}
