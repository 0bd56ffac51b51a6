use formfill_lib::config::CorrectionMode;
use formfill_lib::db::Db;
use formfill_lib::pipeline::Pipeline;
use formfill_lib::services::master_data::MasterDataStore;
use formfill_lib::session::{FillStatus, SessionState};
use formfill_lib::test_utils::{
    cell_text, data, index_texts, vendor_form, ScriptedInference, VENDOR_FIELDS,
};
use rust_xlsxwriter::{Format, Workbook};

fn pipeline<'a>(inference: &'a ScriptedInference, db: &'a Db, mode: CorrectionMode) -> Pipeline<'a> {
    Pipeline {
        inference,
        store: db,
        correction_mode: mode,
    }
}

#[test]
fn full_match_fills_every_field() {
    let db = Db::open_in_memory().unwrap();
    db.put(
        "u1",
        &data(&[("Company Name", "Acme"), ("GST Number", "27AAAAA0000A1Z5")]),
    )
    .unwrap();
    let inference = ScriptedInference::answers(&[
        VENDOR_FIELDS,
        r#"{"matches": [
            {"fieldName": "Vendor Name", "value": "Acme"},
            {"fieldName": "GST", "value": "27AAAAA0000A1Z5"}
        ]}"#,
    ]);

    let outcome = pipeline(&inference, &db, CorrectionMode::Structured)
        .start("u1", "vendor.xlsx", &vendor_form())
        .unwrap();

    assert_eq!(outcome.status(), FillStatus::Success);
    assert!(outcome.pending.is_empty());
    assert_eq!(outcome.written.len(), 2);
    assert_eq!(cell_text(&outcome.state.current, "B1"), "Acme");
    assert_eq!(cell_text(&outcome.state.current, "B2"), "27AAAAA0000A1Z5");
    assert_eq!(inference.call_names(), ["form_fields", "field_matches"]);
}

#[test]
fn empty_master_data_then_user_completes_in_two_steps() {
    let db = Db::open_in_memory().unwrap();
    let inference = ScriptedInference::answers(&[VENDOR_FIELDS]);
    let p = pipeline(&inference, &db, CorrectionMode::Structured);

    let started = p.start("u1", "vendor.xlsx", &vendor_form()).unwrap();
    assert_eq!(started.status(), FillStatus::AwaitingInput);
    let labels: Vec<&str> = started.pending.iter().map(|f| f.label_guessed.as_str()).collect();
    assert_eq!(labels, ["Vendor Name", "GST"]);
    // The matcher never calls the model without master data.
    assert_eq!(inference.call_names(), ["form_fields"]);

    // The session travels through the client as a token.
    let token = started.state.encode().unwrap();
    let partial = p
        .resume("u1", SessionState::decode(&token).unwrap(), &data(&[("Vendor Name", "Acme")]), false)
        .unwrap();
    assert_eq!(partial.status(), FillStatus::AwaitingInput);
    assert_eq!(partial.pending.len(), 1);
    assert_eq!(partial.pending[0].label_guessed, "GST");
    assert_eq!(db.get("u1").unwrap(), None);

    let done = p
        .resume("u1", partial.state, &data(&[("GST", "27AAAAA0000A1Z5")]), true)
        .unwrap();
    assert_eq!(done.status(), FillStatus::Success);
    assert_eq!(cell_text(&done.state.current, "B1"), "Acme");
    assert_eq!(cell_text(&done.state.current, "B2"), "27AAAAA0000A1Z5");
    assert_eq!(db.get("u1").unwrap(), Some(data(&[("GST", "27AAAAA0000A1Z5")])));
}

#[test]
fn correction_changes_only_the_named_cell() {
    let db = Db::open_in_memory().unwrap();
    db.put("u1", &data(&[("Company Name", "Acme"), ("GST Number", "27AAAAA0000A1Z5")]))
        .unwrap();
    let inference = ScriptedInference::answers(&[
        VENDOR_FIELDS,
        r#"{"matches": [
            {"fieldName": "Vendor Name", "value": "Acme"},
            {"fieldName": "GST", "value": "27AAAAA0000A1Z5"}
        ]}"#,
        r#"{"corrections": [{"targetCell": "B1", "value": "New Corp"}]}"#,
    ]);
    let p = pipeline(&inference, &db, CorrectionMode::Structured);
    let filled = p.start("u1", "vendor.xlsx", &vendor_form()).unwrap();
    let before = index_texts(&filled.state.current);

    let corrected = p
        .correct("u1", filled.state, "Change B1 to 'New Corp'", false)
        .unwrap();

    assert_eq!(corrected.corrections.len(), 1);
    assert_eq!(corrected.corrections[0].target_cell, "B1");
    assert_eq!(corrected.corrections[0].value, "New Corp");
    let after = index_texts(&corrected.state.current);
    let changed: Vec<&(String, String)> = after.iter().filter(|cell| !before.contains(cell)).collect();
    assert_eq!(changed, vec![&("B1".to_string(), "New Corp".to_string())]);
    assert_eq!(after.len(), before.len());
}

#[test]
fn raw_text_corrections_apply_line_by_line() {
    let db = Db::open_in_memory().unwrap();
    let inference = ScriptedInference::answers(&[VENDOR_FIELDS, "B1: 'New Corp'\nThanks!"]);
    let p = pipeline(&inference, &db, CorrectionMode::RawText);
    let started = p.start("u1", "vendor.xlsx", &vendor_form()).unwrap();

    let corrected = p
        .correct("u1", started.state, "Vendor is New Corp", true)
        .unwrap();
    assert_eq!(cell_text(&corrected.state.current, "B1"), "New Corp");
    // B1 was waiting for an answer, so the correction counts as one.
    assert_eq!(corrected.pending.len(), 1);
    assert_eq!(db.get("u1").unwrap(), Some(data(&[("Vendor Name", "New Corp")])));
}

#[test]
fn duplicate_targets_are_asked_once() {
    let db = Db::open_in_memory().unwrap();
    let inference = ScriptedInference::answers(&[r#"{"fields": [
        {"fieldName": "GST", "cellLocation": "B2"},
        {"fieldName": "GSTIN", "cellLocation": "B2"},
        {"fieldName": "Vendor Name", "cellLocation": "B1"}
    ]}"#]);
    let outcome = pipeline(&inference, &db, CorrectionMode::Structured)
        .start("u1", "vendor.xlsx", &vendor_form())
        .unwrap();
    let targets: Vec<String> = outcome.pending.iter().map(|f| f.target_cell.to_string()).collect();
    assert_eq!(targets, ["B2", "B1"]);
}

#[test]
fn merged_answer_boxes_are_filled_once() {
    let db = Db::open_in_memory().unwrap();
    db.put("u1", &data(&[("Company Name", "Acme")])).unwrap();
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Vendor Form").unwrap();
    worksheet.write_string(0, 0, "Vendor Name:").unwrap();
    worksheet.merge_range(0, 1, 0, 3, "", &Format::new()).unwrap();
    let form = workbook.save_to_buffer().unwrap();

    let inference = ScriptedInference::answers(&[
        r#"{"fields": [
            {"fieldName": "Vendor Name", "cellLocation": "B1"},
            {"fieldName": "Supplier", "cellLocation": "C1"},
            {"fieldName": "Bank IFSC", "cellLocation": "Z99"}
        ]}"#,
        r#"{"matches": [{"fieldName": "Vendor Name", "value": "Acme"}]}"#,
    ]);
    let p = pipeline(&inference, &db, CorrectionMode::Structured);
    let started = p.start("u1", "vendor.xlsx", &form).unwrap();

    let targets: Vec<String> = started.state.candidates.iter().map(|c| c.target_cell.to_string()).collect();
    assert_eq!(targets, ["B1", "B1"]);
    assert_eq!(started.status(), FillStatus::Success);
    assert!(started.pending.is_empty());

    let resumed = p
        .resume("u1", started.state, &data(&[("Supplier", "Other Corp")]), false)
        .unwrap();
    assert!(resumed.written.is_empty());
    assert_eq!(cell_text(&resumed.state.current, "B1"), "Acme");
}
