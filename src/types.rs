use crate::address::CellAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A user's canonical label → value table. Keys are case-sensitive.
pub type MasterData = BTreeMap<String, String>;

/// Label → matched value for one fill attempt. `""` means no match.
pub type MatchResult = BTreeMap<String, String>;

/// One cell of the indexed worksheet, empty text included.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetCell {
    pub address: CellAddress,
    pub text: String,
}

/// A fillable slot detected in the form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldCandidate {
    pub label: String,
    pub target_cell: CellAddress,
}

/// One write. `target_cell` stays unparsed until the write so a bad address
/// only fails that write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FillDirective {
    pub target_cell: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_guessed: Option<String>,
}

/// A field the user still has to answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingField {
    pub label_guessed: String,
    pub target_cell: CellAddress,
}

/// Overwrite derived from free-text feedback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CorrectionDirective {
    pub target_cell: String,
    pub value: String,
}

impl From<&CorrectionDirective> for FillDirective {
    fn from(c: &CorrectionDirective) -> Self {
        FillDirective {
            target_cell: c.target_cell.clone(),
            value: c.value.clone(),
            label_guessed: None,
        }
    }
}

/// A write that was dropped, with the reason shown to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedWrite {
    pub target_cell: String,
    pub reason: String,
}
