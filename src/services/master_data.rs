use crate::error::PersistenceError;
use crate::types::MasterData;
use serde::Serialize;

/// Per-user key-value document store holding master data.
pub trait MasterDataStore: Send + Sync {
    fn get(&self, user_id: &str) -> Result<Option<MasterData>, PersistenceError>;
    fn put(&self, user_id: &str, data: &MasterData) -> Result<(), PersistenceError>;
}

/// Stand-in used when no database could be opened: reads are empty, writes
/// are refused as unconfigured.
pub struct UnconfiguredStore;

impl MasterDataStore for UnconfiguredStore {
    fn get(&self, _user_id: &str) -> Result<Option<MasterData>, PersistenceError> {
        Ok(None)
    }

    fn put(&self, _user_id: &str, _data: &MasterData) -> Result<(), PersistenceError> {
        Err(PersistenceError::Unconfigured)
    }
}

/// `existing` overlaid with the non-blank entries of `provided`.
pub fn merge(existing: &MasterData, provided: &MasterData) -> MasterData {
    let mut merged = existing.clone();
    for (key, value) in provided {
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        merged.insert(key.to_string(), value.to_string());
    }
    merged
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeOutcome {
    pub data: MasterData,
    /// Set when the merged mapping could not be saved.
    pub warning: Option<String>,
}

/// Merge and save. A failed save still returns the merged mapping, with the
/// failure as a warning.
pub fn merge_and_persist(
    store: &dyn MasterDataStore,
    user_id: &str,
    existing: &MasterData,
    provided: &MasterData,
) -> MergeOutcome {
    let data = merge(existing, provided);
    if data == *existing {
        return MergeOutcome { data, warning: None };
    }
    let warning = match store.put(user_id, &data) {
        Ok(()) => {
            log::info!("[master-data] Saved {} entries for {}", data.len(), user_id);
            None
        }
        Err(e) => {
            log::warn!("[master-data] Save failed for {}: {}", user_id, e);
            Some(e.to_string())
        }
    };
    MergeOutcome { data, warning }
}

/// Two-column CSV: first field is the key, the rest of the line (commas
/// included) is the value. No quote handling. A `key,value` header line and
/// rows with a blank key or value are skipped.
pub fn parse_master_data_csv(text: &str) -> MasterData {
    let mut data = MasterData::new();
    for (i, line) in text.lines().enumerate() {
        let line = line.trim_start_matches('\u{feff}');
        let Some((key, value)) = line.split_once(',') else {
            if !line.trim().is_empty() {
                log::debug!("[master-data] CSV line {} has no comma, skipped", i + 1);
            }
            continue;
        };
        let (key, value) = (key.trim(), value.trim());
        if i == 0 && key.eq_ignore_ascii_case("key") && value.eq_ignore_ascii_case("value") {
            continue;
        }
        if key.is_empty() || value.is_empty() {
            continue;
        }
        data.insert(key.to_string(), value.to_string());
    }
    data
}
