use crate::address::CellAddress;
use crate::config::AppConfig;
use crate::error::{FormFillError, FormFillResult};
use crate::excel;
use crate::inference::InferenceClient;
use crate::pipeline::{Pipeline, StepOutcome};
use crate::services::master_data::{self, MasterDataStore};
use crate::session::{FillStatus, SessionState};
use crate::types::{CorrectionDirective, MasterData, MatchResult, PendingField, SkippedWrite};
use axum::body::Body;
use axum::extract::{Multipart, Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

const XLSX_MIME: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Header carrying the signed-in user, set by the fronting identity provider.
pub const USER_HEADER: &str = "x-user-id";

pub struct AppState {
    pub config: AppConfig,
    pub store: Arc<dyn MasterDataStore>,
    pub inference: Arc<dyn InferenceClient>,
}

impl AppState {
    fn pipeline(&self) -> Pipeline<'_> {
        Pipeline {
            inference: self.inference.as_ref(),
            store: self.store.as_ref(),
            correction_mode: self.config.correction_mode,
        }
    }
}

pub type SharedState = Arc<AppState>;

impl IntoResponse for FormFillError {
    fn into_response(self) -> Response {
        let status = match &self {
            FormFillError::NoWorksheet
            | FormFillError::UnreadableFile(_)
            | FormFillError::UnsupportedFile(_)
            | FormFillError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FormFillError::EmptyExtraction => StatusCode::UNPROCESSABLE_ENTITY,
            FormFillError::EmptyGeneration => StatusCode::BAD_GATEWAY,
            FormFillError::SessionExpired => StatusCode::GONE,
            FormFillError::Unauthenticated => StatusCode::UNAUTHORIZED,
            FormFillError::Persistence(_) => StatusCode::SERVICE_UNAVAILABLE,
            FormFillError::Write(_) | FormFillError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            log::error!("[http] {}", self);
        } else {
            log::info!("[http] {} {}", status.as_u16(), self);
        }
        (status, Json(json!({ "status": "error", "error": self }))).into_response()
    }
}

/// Run blocking work (workbook I/O, inference HTTP, SQLite) off the async runtime.
async fn run_blocking<T, F>(f: F) -> FormFillResult<T>
where
    F: FnOnce() -> FormFillResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FormFillError::Internal(e.to_string()))?
}

pub fn current_user_id(headers: &HeaderMap) -> FormFillResult<String> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(FormFillError::Unauthenticated)
}

/// The uploaded `file` part of a multipart body.
async fn read_upload(mut multipart: Multipart) -> FormFillResult<(String, Vec<u8>)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| FormFillError::InvalidInput(e.to_string()))?
    {
        if field.name() == Some("file") {
            let file_name = field.file_name().unwrap_or("upload").to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| FormFillError::InvalidInput(e.to_string()))?;
            return Ok((file_name, bytes.to_vec()));
        }
    }
    Err(FormFillError::InvalidInput("missing 'file' upload".to_string()))
}

/// ASCII-only name for Content-Disposition.
fn attachment_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') { c } else { '_' })
        .collect()
}

fn xlsx_download(file_name: &str, bytes: Vec<u8>) -> FormFillResult<Response> {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, XLSX_MIME)
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", attachment_name(file_name)),
        )
        .body(Body::from(bytes))
        .map_err(|e| FormFillError::Internal(e.to_string()))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

pub async fn ai_status(State(state): State<SharedState>) -> Json<serde_json::Value> {
    let status = if state.inference.is_configured() {
        "configured"
    } else {
        "not_configured"
    };
    Json(json!({ "status": status }))
}

#[derive(Debug, Serialize)]
pub struct MasterDataResponse {
    pub data: MasterData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

pub async fn get_master_data(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> FormFillResult<Json<MasterDataResponse>> {
    let user_id = current_user_id(&headers)?;
    let data = run_blocking(move || Ok(state.store.get(&user_id)?.unwrap_or_default())).await?;
    Ok(Json(MasterDataResponse { data, warning: None }))
}

/// Profile editor save: the mapping replaces what is stored.
pub async fn put_master_data(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(data): Json<MasterData>,
) -> FormFillResult<Json<MasterDataResponse>> {
    let user_id = current_user_id(&headers)?;
    let cleaned: MasterData = data
        .into_iter()
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect();
    let data = run_blocking(move || {
        state.store.put(&user_id, &cleaned)?;
        Ok(cleaned)
    })
    .await?;
    Ok(Json(MasterDataResponse { data, warning: None }))
}

pub async fn delete_master_data_key(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(key): Path<String>,
) -> FormFillResult<Json<MasterDataResponse>> {
    let user_id = current_user_id(&headers)?;
    let data = run_blocking(move || {
        let mut data = state.store.get(&user_id)?.unwrap_or_default();
        if data.remove(&key).is_some() {
            state.store.put(&user_id, &data)?;
            log::info!("[master-data] Removed {:?} for {}", key, user_id);
        }
        Ok(data)
    })
    .await?;
    Ok(Json(MasterDataResponse { data, warning: None }))
}

/// Bootstrap master data from a two-column CSV, merged into what is stored.
pub async fn import_master_data(
    State(state): State<SharedState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> FormFillResult<Json<MasterDataResponse>> {
    let user_id = current_user_id(&headers)?;
    let (_, bytes) = read_upload(multipart).await?;
    let text = String::from_utf8(bytes)
        .map_err(|_| FormFillError::InvalidInput("the CSV is not valid UTF-8".to_string()))?;
    let provided = master_data::parse_master_data_csv(&text);
    if provided.is_empty() {
        return Err(FormFillError::InvalidInput(
            "no key,value rows found in the CSV".to_string(),
        ));
    }
    let outcome = run_blocking(move || {
        let existing = state.store.get(&user_id)?.unwrap_or_default();
        Ok(master_data::merge_and_persist(
            state.store.as_ref(),
            &user_id,
            &existing,
            &provided,
        ))
    })
    .await?;
    Ok(Json(MasterDataResponse {
        data: outcome.data,
        warning: outcome.warning,
    }))
}

pub async fn export_master_data(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> FormFillResult<Response> {
    let user_id = current_user_id(&headers)?;
    let bytes = run_blocking(move || {
        let data = state.store.get(&user_id)?.unwrap_or_default();
        excel::export_master_data(&data)
    })
    .await?;
    xlsx_download("master-data.xlsx", bytes)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub status: FillStatus,
    pub session: String,
    pub file_name: String,
    pub pending: Vec<PendingField>,
    pub written: Vec<CellAddress>,
    pub skipped: Vec<SkippedWrite>,
    pub corrections: Vec<CorrectionDirective>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub message: String,
}

fn session_response(outcome: StepOutcome) -> FormFillResult<SessionResponse> {
    let status = outcome.status();
    let message = match status {
        FillStatus::AwaitingInput => format!(
            "{} field(s) could not be matched. Please provide values.",
            outcome.pending.len()
        ),
        _ => "Form filled. Ready to download.".to_string(),
    };
    Ok(SessionResponse {
        status,
        session: outcome.state.encode()?,
        file_name: outcome.state.file_name.clone(),
        pending: outcome.pending,
        written: outcome.written,
        skipped: outcome.skipped,
        corrections: outcome.corrections,
        warning: if outcome.warnings.is_empty() {
            None
        } else {
            Some(outcome.warnings.join(" "))
        },
        message,
    })
}

/// Upload a form and run the first fill pass.
pub async fn start_fill(
    State(state): State<SharedState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> FormFillResult<Json<SessionResponse>> {
    let user_id = current_user_id(&headers)?;
    let (file_name, bytes) = read_upload(multipart).await?;
    excel::validate_xlsx_upload(&file_name, &bytes, state.config.max_upload_bytes)?;
    log::info!("[fill] {} uploaded {} ({} bytes)", user_id, file_name, bytes.len());
    let outcome = run_blocking(move || state.pipeline().start(&user_id, &file_name, &bytes)).await?;
    Ok(Json(session_response(outcome)?))
}

#[derive(Debug, Deserialize)]
pub struct ContinuePayload {
    pub session: String,
    #[serde(default)]
    pub values: MatchResult,
    #[serde(default)]
    pub remember: bool,
}

pub async fn continue_fill(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<ContinuePayload>,
) -> FormFillResult<Json<SessionResponse>> {
    let user_id = current_user_id(&headers)?;
    let session = SessionState::decode(&payload.session)?;
    let outcome = run_blocking(move || {
        state
            .pipeline()
            .resume(&user_id, session, &payload.values, payload.remember)
    })
    .await?;
    Ok(Json(session_response(outcome)?))
}

#[derive(Debug, Deserialize)]
pub struct CorrectPayload {
    pub session: String,
    pub feedback: String,
    #[serde(default)]
    pub remember: bool,
}

pub async fn correct_fill(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(payload): Json<CorrectPayload>,
) -> FormFillResult<Json<SessionResponse>> {
    let user_id = current_user_id(&headers)?;
    let session = SessionState::decode(&payload.session)?;
    let outcome = run_blocking(move || {
        state
            .pipeline()
            .correct(&user_id, session, &payload.feedback, payload.remember)
    })
    .await?;
    Ok(Json(session_response(outcome)?))
}

#[derive(Debug, Deserialize)]
pub struct DownloadPayload {
    pub session: String,
}

pub async fn download_fill(
    headers: HeaderMap,
    Json(payload): Json<DownloadPayload>,
) -> FormFillResult<Response> {
    current_user_id(&headers)?;
    let session = SessionState::decode(&payload.session)?;
    xlsx_download(&format!("filled-{}", session.file_name), session.current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn user_id_comes_from_header() {
        let mut headers = HeaderMap::new();
        assert!(matches!(current_user_id(&headers), Err(FormFillError::Unauthenticated)));
        headers.insert(USER_HEADER, HeaderValue::from_static("  "));
        assert!(matches!(current_user_id(&headers), Err(FormFillError::Unauthenticated)));
        headers.insert(USER_HEADER, HeaderValue::from_static("user-42"));
        assert_eq!(current_user_id(&headers).unwrap(), "user-42");
    }

    #[test]
    fn attachment_names_are_header_safe() {
        assert_eq!(attachment_name("filled-Vendor Form \"v2\".xlsx"), "filled-Vendor_Form__v2_.xlsx");
    }

    #[test]
    fn errors_map_to_status_codes() {
        let cases = [
            (FormFillError::UnsupportedFile("x".to_string()), StatusCode::BAD_REQUEST),
            (FormFillError::EmptyExtraction, StatusCode::UNPROCESSABLE_ENTITY),
            (FormFillError::SessionExpired, StatusCode::GONE),
            (FormFillError::Unauthenticated, StatusCode::UNAUTHORIZED),
            (
                crate::error::PersistenceError::Unconfigured.into(),
                StatusCode::SERVICE_UNAVAILABLE,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(err.into_response().status(), status);
        }
    }
}
