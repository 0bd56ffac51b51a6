use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FormFillError {
    #[error("The workbook has no worksheets.")]
    NoWorksheet,
    #[error("Could not read the spreadsheet: {0}")]
    UnreadableFile(String),
    #[error("Unsupported file: {0}")]
    UnsupportedFile(String),
    #[error("No fields detected in the uploaded form.")]
    EmptyExtraction,
    #[error("The AI service returned an empty response. Please try again.")]
    EmptyGeneration,
    #[error("Your form session has expired or is incomplete. Please upload the form again.")]
    SessionExpired,
    #[error("Sign in to continue.")]
    Unauthenticated,
    #[error("Invalid request: {0}")]
    InvalidInput(String),
    #[error("Could not write the workbook: {0}")]
    Write(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for FormFillError {
    fn from(error: std::io::Error) -> Self {
        FormFillError::Internal(error.to_string())
    }
}

impl Serialize for FormFillError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}

pub type FormFillResult<T> = Result<T, FormFillError>;

/// Why the master-data store refused a read or write.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("Master data could not be saved: permission denied ({0}).")]
    PermissionDenied(String),
    #[error("Master data could not be saved: the store is unreachable ({0}).")]
    Connectivity(String),
    #[error("Master data storage is not configured.")]
    Unconfigured,
    #[error("Master data store error: {0}")]
    Other(String),
}

impl From<rusqlite::Error> for PersistenceError {
    fn from(error: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        let msg = error.to_string();
        match &error {
            rusqlite::Error::SqliteFailure(e, _) => match e.code {
                ErrorCode::PermissionDenied
                | ErrorCode::ReadOnly
                | ErrorCode::AuthorizationForStatementDenied => PersistenceError::PermissionDenied(msg),
                ErrorCode::CannotOpen
                | ErrorCode::DatabaseBusy
                | ErrorCode::DatabaseLocked
                | ErrorCode::SystemIoFailure
                | ErrorCode::FileLockingProtocolFailed => PersistenceError::Connectivity(msg),
                _ => PersistenceError::Other(msg),
            },
            _ => PersistenceError::Other(msg),
        }
    }
}

impl Serialize for PersistenceError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_ref())
    }
}
