use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{DefaultBodyLimit, Multipart, Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{routing::get, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use riskshield_assess::{LocalReportStore, Pipeline, RiskShieldConfig, RunOutcome};
use riskshield_core::{
    AssessmentResult, EncryptionKey, FileType, PipelineError, Questionnaire, RawDocument,
};

const MAX_UPLOAD_BYTES: usize = 25 * 1024 * 1024;

struct AppState {
    config: RiskShieldConfig,
    key: Arc<EncryptionKey>,
    questionnaire: Questionnaire,
    reports: LocalReportStore,
}

impl AppState {
    fn new(config: RiskShieldConfig, key: EncryptionKey, questionnaire: Questionnaire) -> Self {
        let reports = LocalReportStore::new(
            config.report.output_dir.clone(),
            config.report.public_base_url.clone(),
        );
        Self {
            config,
            key: Arc::new(key),
            questionnaire,
            reports,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    init_tracing();
    let config = RiskShieldConfig::load(None)?;
    let key = match EncryptionKey::from_env()? {
        Some(key) => key,
        None => {
            warn!("RISKSHIELD_ENCRYPTION_KEY is not set; sealing uploads with an ephemeral key");
            EncryptionKey::generate()
        }
    };
    let questionnaire = Questionnaire::load(
        &config.questionnaire.path,
        config.questionnaire.skip_rows,
    )
    .with_context(|| {
        format!(
            "failed to load questionnaire {}",
            config.questionnaire.path.display()
        )
    })?;
    info!(
        questions = questionnaire.len(),
        key_id = key.key_id(),
        llm = config.llm.provider.as_str(),
        "service configured"
    );
    let state = Arc::new(AppState::new(config, key, questionnaire));
    let app = router(state);
    let addr: SocketAddr = std::env::var("BIND_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:8000".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening" = %addr);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/health", get(health))
        .route("/upload", post(handle_upload))
        .route("/report/:filename", get(handle_report))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .layer(cors())
        .with_state(state)
}

fn cors() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({ "message": "Welcome to the RiskShield API" }))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[derive(Debug, Deserialize)]
struct UploadParams {
    file_type: Option<String>,
}

#[derive(Debug, Serialize)]
struct UploadResponse {
    message: String,
    report_file: String,
    report_url: Option<String>,
    results: Vec<AssessmentResult>,
}

impl From<RunOutcome> for UploadResponse {
    fn from(value: RunOutcome) -> Self {
        Self {
            message: "Documents processed successfully".to_string(),
            report_file: value.report_file,
            report_url: value.report_url,
            results: value.results,
        }
    }
}

async fn handle_upload(
    State(state): State<Arc<AppState>>,
    Query(params): Query<UploadParams>,
    mut multipart: Multipart,
) -> Result<Json<UploadResponse>, AppError> {
    let upload = extract_file(&mut multipart).await?;
    let file_type = resolve_file_type(params.file_type.as_deref(), upload.filename.as_deref())?;
    if upload.data.is_empty() {
        return Err(AppError::bad_request("uploaded file is empty"));
    }
    info!(file_type = %file_type, bytes = upload.data.len(), "upload received");
    let document = RawDocument::new(upload.data, file_type);
    let state = state.clone();
    let outcome = task::spawn_blocking(move || run_assessment(&state, document))
        .await
        .map_err(AppError::internal)??;
    Ok(Json(outcome.into()))
}

// Blocking HTTP clients live and die on this worker thread, never on the
// async runtime.
fn run_assessment(state: &AppState, document: RawDocument) -> Result<RunOutcome, AppError> {
    let pipeline =
        Pipeline::from_config(&state.config, Arc::clone(&state.key)).map_err(AppError::internal)?;
    Ok(pipeline.run(document, state.questionnaire.questions())?)
}

fn resolve_file_type(param: Option<&str>, filename: Option<&str>) -> Result<FileType, AppError> {
    if let Some(tag) = param {
        return Ok(tag.parse::<FileType>()?);
    }
    let name = filename.ok_or_else(|| {
        AppError::bad_request("file type unknown: pass file_type or a file name with an extension")
    })?;
    Ok(FileType::from_path(Path::new(name))?)
}

async fn handle_report(
    State(state): State<Arc<AppState>>,
    AxumPath(filename): AxumPath<String>,
) -> Result<Response, AppError> {
    let path = state
        .reports
        .resolve(&filename)
        .ok_or_else(|| AppError::NotFound("Report not found".to_string()))?;
    let bytes = tokio::fs::read(&path).await.map_err(AppError::internal)?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{filename}\""),
            ),
        ],
        bytes,
    )
        .into_response())
}

struct UploadedFile {
    data: Vec<u8>,
    filename: Option<String>,
}

async fn extract_file(multipart: &mut Multipart) -> Result<UploadedFile, AppError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(AppError::bad_request)?
    {
        if matches!(field.name(), Some("file") | Some("fileUpload")) {
            let filename = field.file_name().map(|s| s.to_string());
            let data = field.bytes().await.map_err(AppError::bad_request)?;
            return Ok(UploadedFile {
                data: data.to_vec(),
                filename,
            });
        }
    }
    Err(AppError::bad_request("missing file"))
}

#[derive(Debug, Error)]
enum AppError {
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    NotFound(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    fn bad_request<E: ToString>(msg: E) -> Self {
        Self::BadRequest(msg.to_string())
    }

    fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Internal(err.into())
    }
}

impl From<PipelineError> for AppError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::UnsupportedFormat(_) => Self::BadRequest(err.to_string()),
            PipelineError::Extraction { .. } => Self::Unprocessable(err.to_string()),
            other => Self::Internal(other.into()),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Unprocessable(msg) => {
                warn!(error = %msg, "document rejected");
                (StatusCode::UNPROCESSABLE_ENTITY, msg)
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(err) => {
                error!("internal_error" = %format!("{err:#}"));
                (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
            }
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use riskshield_assess::LlmProvider;
    use riskshield_core::{ControlQuestion, TokenizerKind};
    use serde_json::Value;
    use tower::ServiceExt;

    const BOUNDARY: &str = "riskshield-boundary";

    fn app(root: &Path) -> Router {
        let mut config = RiskShieldConfig::default();
        config.llm.provider = LlmProvider::Local;
        config.chunking.tokenizer = TokenizerKind::Whitespace;
        config.chunking.chunk_size = 64;
        config.chunking.overlap = 8;
        config.storage.upload_dir = root.join("uploads");
        config.report.output_dir = root.join("reports");
        let questionnaire = Questionnaire::new(vec![
            ControlQuestion::new(
                "Access Control",
                "Does the organization use multi-factor authentication?",
            ),
            ControlQuestion::new("Physical Security", "Are data centres guarded around the clock?"),
        ])
        .unwrap();
        router(Arc::new(AppState::new(
            config,
            EncryptionKey::generate(),
            questionnaire,
        )))
    }

    fn multipart(field: &str, filename: &str, content: &[u8]) -> Body {
        let mut body = format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .into_bytes();
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
        Body::from(body)
    }

    fn upload_request(uri: &str, field: &str, filename: &str, content: &[u8]) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(multipart(field, filename, content))
            .unwrap()
    }

    async fn json_body(resp: Response) -> Value {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn upload_assesses_and_serves_the_report() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let policy = b"Multi-factor authentication is required for all accounts.";

        let resp = app
            .clone()
            .oneshot(upload_request("/upload", "fileUpload", "policy.txt", policy))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = json_body(resp).await;
        assert_eq!(body["message"], "Documents processed successfully");
        let results = body["results"].as_array().unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["rating"], "Pass");
        assert_eq!(results[1]["rating"], "Fail");
        let report_file = body["report_file"].as_str().unwrap().to_string();
        assert_eq!(
            body["report_url"].as_str().unwrap(),
            format!("http://localhost:8000/report/{report_file}")
        );

        let resp = app
            .oneshot(
                Request::builder()
                    .uri(format!("/report/{report_file}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE], "application/pdf");
        let pdf = resp.into_body().collect().await.unwrap().to_bytes();
        assert!(pdf.starts_with(b"%PDF"));
    }

    #[tokio::test]
    async fn browser_preflight_is_allowed_from_any_origin() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/upload")
                    .header(header::ORIGIN, "https://portal.example.org")
                    .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                    .header(header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
    }

    #[tokio::test]
    async fn unsupported_type_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .oneshot(upload_request("/upload", "file", "tool.exe", b"MZ"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(json_body(resp).await["error"].is_string());
    }

    #[tokio::test]
    async fn broken_document_is_unprocessable() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .oneshot(upload_request(
                "/upload?file_type=pdf",
                "file",
                "upload.bin",
                b"not really a pdf",
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn missing_file_field_is_a_bad_request() {
        let dir = tempfile::tempdir().unwrap();
        let resp = app(dir.path())
            .oneshot(upload_request("/upload", "attachment", "policy.txt", b"text"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_or_traversing_report_names_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        for uri in ["/report/missing.pdf", "/report/..%2F..%2Fetc%2Fpasswd"] {
            let resp = app
                .clone()
                .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::NOT_FOUND, "{uri}");
        }
    }

    #[tokio::test]
    async fn health_and_root_respond() {
        let dir = tempfile::tempdir().unwrap();
        let app = app(dir.path());
        let resp = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(json_body(resp).await, json!({ "status": "ok" }));
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(
            json_body(resp).await["message"],
            "Welcome to the RiskShield API"
        );
    }
}
