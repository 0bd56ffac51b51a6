use crate::address::CellAddress;
use crate::error::PersistenceError;
use crate::excel;
use crate::inference::{InferenceClient, InferenceError, Prompt};
use crate::services::master_data::MasterDataStore;
use crate::types::MasterData;
use rust_xlsxwriter::{Format, FormatBorder, Workbook};
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, Once};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Model answer naming the two fields of [`vendor_form`].
pub const VENDOR_FIELDS: &str = r#"{"fields": [
    {"fieldName": "Vendor Name", "cellLocation": "B1"},
    {"fieldName": "GST", "cellLocation": "B2"}
]}"#;

pub fn data(pairs: &[(&str, &str)]) -> MasterData {
    pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
}

/// Single-sheet workbook named "Vendor Form". Empty text writes a bordered
/// blank, the way form authors mark answer boxes.
pub fn form_workbook(cells: &[(&str, &str)]) -> Vec<u8> {
    init_logging();
    let mut workbook = Workbook::new();
    let worksheet = workbook.add_worksheet();
    worksheet.set_name("Vendor Form").expect("sheet name");
    let answer_box = Format::new().set_border(FormatBorder::Thin);
    for (raw, text) in cells {
        let addr = CellAddress::parse(raw).expect("fixture address");
        let col = addr.col as u16;
        if text.is_empty() {
            worksheet.write_blank(addr.row, col, &answer_box).expect("write blank");
        } else {
            worksheet.write_string(addr.row, col, *text).expect("write string");
        }
    }
    workbook.save_to_buffer().expect("save fixture")
}

/// Labels in column A, empty answer boxes in column B.
pub fn vendor_form() -> Vec<u8> {
    form_workbook(&[
        ("A1", "Vendor Name:"),
        ("B1", ""),
        ("A2", "GST:"),
        ("B2", ""),
    ])
}

/// Displayed text of one cell of the first sheet.
pub fn cell_text(bytes: &[u8], raw: &str) -> String {
    let addr = CellAddress::parse(raw).expect("address");
    excel::index_sheet(bytes)
        .expect("index")
        .into_iter()
        .find(|c| c.address == addr)
        .map(|c| c.text)
        .unwrap_or_default()
}

/// `(address, text)` listing of the first sheet.
pub fn index_texts(bytes: &[u8]) -> Vec<(String, String)> {
    excel::index_sheet(bytes)
        .expect("index")
        .into_iter()
        .map(|c| (c.address.to_string(), c.text))
        .collect()
}

/// Inference fake answering from a script, in order, and recording prompts.
/// Once the script runs out every call fails.
pub struct ScriptedInference {
    answers: Mutex<VecDeque<Result<String, InferenceError>>>,
    prompts: Mutex<Vec<Prompt>>,
}

impl ScriptedInference {
    pub fn new(answers: Vec<Result<String, InferenceError>>) -> Self {
        init_logging();
        Self {
            answers: Mutex::new(answers.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn answers(answers: &[&str]) -> Self {
        Self::new(answers.iter().map(|a| Ok(a.to_string())).collect())
    }

    pub fn prompts(&self) -> Vec<Prompt> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn call_names(&self) -> Vec<&'static str> {
        self.prompts.lock().unwrap().iter().map(|p| p.name).collect()
    }
}

impl InferenceClient for ScriptedInference {
    fn complete(&self, prompt: &Prompt) -> Result<String, InferenceError> {
        self.prompts.lock().unwrap().push(prompt.clone());
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(InferenceError::InvalidResponse("script exhausted".to_string())))
    }
}

/// In-memory store; `failing` makes every call return the given error.
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, MasterData>>,
    failure: Option<PersistenceError>,
}

impl MemoryStore {
    pub fn with(user_id: &str, pairs: &[(&str, &str)]) -> Self {
        let store = Self::default();
        store.data.lock().unwrap().insert(user_id.to_string(), data(pairs));
        store
    }

    pub fn failing(error: PersistenceError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }
}

impl MasterDataStore for MemoryStore {
    fn get(&self, user_id: &str) -> Result<Option<MasterData>, PersistenceError> {
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        Ok(self.data.lock().unwrap().get(user_id).cloned())
    }

    fn put(&self, user_id: &str, data: &MasterData) -> Result<(), PersistenceError> {
        if let Some(e) = &self.failure {
            return Err(e.clone());
        }
        self.data.lock().unwrap().insert(user_id.to_string(), data.clone());
        Ok(())
    }
}
