use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use survey_core::{AnswerCodec, ResponseId, SessionId, SurveyError, SurveyId};
use survey_store_sqlite::{ResponseRecord, SessionRecord, SqliteSurveyStore};

const SERVICE_CONTRACT_VERSION: &str = "survey-service.v1";

#[derive(Debug, Clone)]
struct ServiceState {
    db: PathBuf,
    codec: AnswerCodec,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    service_contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorBody {
    service_contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    detail: String,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    detail: String,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    validation_error_total: AtomicU64,
    not_found_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    validation_error_total: u64,
    not_found_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Deserialize)]
struct StartSessionRequest {
    survey_id: String,
    token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AutosaveRequest {
    answers: Map<String, Value>,
    last_step: Option<i64>,
}

/// Either `session_id` (with optional extra answers merged over the
/// draft) or `survey_id` with the full answer map.
#[derive(Debug, Clone, Deserialize)]
struct SubmitRequest {
    session_id: Option<String>,
    survey_id: Option<String>,
    answers: Option<Map<String, Value>>,
}

#[derive(Debug, Parser)]
#[command(name = "survey-service")]
#[command(about = "Local HTTP service for the survey backend")]
struct Args {
    #[arg(long, default_value = "./survey_backend.sqlite3")]
    db: PathBuf,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    /// Secret for sensitive-answer encryption; falls back to the
    /// SURVEY_ENCRYPTION_SECRET environment variable.
    #[arg(long, env = "SURVEY_ENCRYPTION_SECRET")]
    encryption_secret: String,
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceErrorBody {
            service_contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                detail: self.detail,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(status: StatusCode, code: &'static str, detail: impl Into<String>) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            detail: detail.into(),
        }
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::failure(rejection.status(), "invalid_json", rejection.body_text())
    }

    fn classify_store_error(err: &anyhow::Error) -> ServiceFailure {
        if let Some(survey_err) = err.chain().find_map(|cause| cause.downcast_ref::<SurveyError>())
        {
            return match survey_err {
                SurveyError::Validation(detail) => {
                    Self::failure(StatusCode::BAD_REQUEST, "validation_error", detail.clone())
                }
                SurveyError::NotFound(detail) => {
                    Self::failure(StatusCode::NOT_FOUND, "not_found", detail.clone())
                }
                SurveyError::Configuration(detail) => Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "configuration_error",
                    detail.clone(),
                ),
            };
        }

        let diagnostic = format!("{err:#}");
        let normalized = diagnostic.to_ascii_lowercase();
        if normalized.contains("sqlite") || normalized.contains("database") {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                err.to_string(),
            );
        }

        Self::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            err.to_string(),
        )
    }

    async fn run_blocking<T, F>(
        &self,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteSurveyStore) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry.requests_total.fetch_add(1, Ordering::Relaxed);
        let db = self.db.clone();
        let codec = self.codec.clone();
        let handle = tokio::task::spawn_blocking(move || -> anyhow::Result<T> {
            let mut store = SqliteSurveyStore::open(&db, codec)?;
            store.migrate()?;
            op(&mut store)
        });

        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure("timeout", true);
                Self::failure(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "timeout",
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
            )
        })?;

        match op_result {
            Ok(value) => {
                self.telemetry
                    .requests_success_total
                    .fetch_add(1, Ordering::Relaxed);
                Ok(value)
            }
            Err(err) => {
                let failure = Self::classify_store_error(&err);
                self.telemetry.record_failure(failure.code, false);
                Err(failure)
            }
        }
    }
}

impl ServiceTelemetry {
    fn record_failure(&self, code: &str, timeout: bool) {
        self.requests_failure_total.fetch_add(1, Ordering::Relaxed);
        if timeout {
            self.timeout_total.fetch_add(1, Ordering::Relaxed);
        }
        match code {
            "invalid_json" => {
                self.invalid_json_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "not_found" => {
                self.not_found_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" | "configuration_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn snapshot(&self) -> ServiceTelemetrySnapshot {
        ServiceTelemetrySnapshot {
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_success_total: self.requests_success_total.load(Ordering::Relaxed),
            requests_failure_total: self.requests_failure_total.load(Ordering::Relaxed),
            timeout_total: self.timeout_total.load(Ordering::Relaxed),
            invalid_json_total: self.invalid_json_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            not_found_total: self.not_found_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        service_contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/sessions/start", post(sessions_start))
        .route("/v1/sessions/:session_id", patch(sessions_autosave).get(sessions_show))
        .route("/v1/sessions/:session_id/abandon", post(sessions_abandon))
        .route("/v1/responses/submit", post(responses_submit))
        .route("/v1/responses/:response_id", get(responses_show))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let state = ServiceState {
        db: args.db,
        codec: AnswerCodec::new(&args.encryption_secret)?,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn sessions_start(
    State(state): State<ServiceState>,
    payload: Result<Json<StartSessionRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SessionRecord>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let session = state
        .run_blocking("session_start", move |store| {
            let survey_id = SurveyId::parse(&request.survey_id)?;
            store.start_session(survey_id, request.token.as_deref())
        })
        .await?;
    Ok(Json(envelope(session)))
}

async fn sessions_autosave(
    State(state): State<ServiceState>,
    Path(session_id): Path<String>,
    payload: Result<Json<AutosaveRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<SessionRecord>>, ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let session = state
        .run_blocking("session_autosave", move |store| {
            let session_id = SessionId::parse(&session_id)?;
            store.autosave_session(session_id, &request.answers, request.last_step)
        })
        .await?;
    Ok(Json(envelope(session)))
}

async fn sessions_show(
    State(state): State<ServiceState>,
    Path(session_id): Path<String>,
) -> Result<Json<ServiceEnvelope<SessionRecord>>, ServiceFailure> {
    let session = state
        .run_blocking("session_show", move |store| {
            let session_id = SessionId::parse(&session_id)?;
            store.get_session(session_id)
        })
        .await?;
    Ok(Json(envelope(session)))
}

async fn sessions_abandon(
    State(state): State<ServiceState>,
    Path(session_id): Path<String>,
) -> Result<Json<ServiceEnvelope<SessionRecord>>, ServiceFailure> {
    let session = state
        .run_blocking("session_abandon", move |store| {
            let session_id = SessionId::parse(&session_id)?;
            store.abandon_session(session_id)
        })
        .await?;
    Ok(Json(envelope(session)))
}

async fn responses_submit(
    State(state): State<ServiceState>,
    payload: Result<Json<SubmitRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ServiceEnvelope<ResponseRecord>>), ServiceFailure> {
    let Json(request) = payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;
    let response = state
        .run_blocking("response_submit", move |store| submit(store, request))
        .await?;
    Ok((StatusCode::CREATED, Json(envelope(response))))
}

fn submit(store: &mut SqliteSurveyStore, request: SubmitRequest) -> Result<ResponseRecord> {
    let answers: Option<BTreeMap<String, Value>> = request
        .answers
        .map(|map| map.into_iter().collect());

    if let Some(raw) = request.session_id.as_deref() {
        let session_id = SessionId::parse(raw)?;
        return store.submit_from_session(session_id, answers.as_ref());
    }

    let Some(raw) = request.survey_id.as_deref() else {
        return Err(
            SurveyError::Validation("either session_id or survey_id is required".to_string())
                .into(),
        );
    };
    let survey_id = SurveyId::parse(raw)?;
    let answers = answers.unwrap_or_default();
    store.submit_direct(survey_id, &answers)
}

async fn responses_show(
    State(state): State<ServiceState>,
    Path(response_id): Path<String>,
) -> Result<Json<ServiceEnvelope<ResponseRecord>>, ServiceFailure> {
    let response = state
        .run_blocking("response_show", move |store| {
            let response_id = ResponseId::parse(&response_id)?;
            store.get_response(response_id)
        })
        .await?;
    Ok(Json(envelope(response)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use http::Request;
    use serde_json::json;
    use survey_core::{QuestionType, SurveyStatus};
    use survey_store_sqlite::NewQuestion;
    use tower::ServiceExt;

    fn unique_temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("survey-service-{}.sqlite3", ulid::Ulid::new()))
    }

    fn test_codec() -> AnswerCodec {
        match AnswerCodec::new("service-test-secret") {
            Ok(codec) => codec,
            Err(err) => panic!("codec construction failed: {err}"),
        }
    }

    fn test_state(db: PathBuf) -> ServiceState {
        ServiceState {
            db,
            codec: test_codec(),
            operation_timeout: Duration::from_millis(2500),
            telemetry: Arc::new(ServiceTelemetry::default()),
        }
    }

    fn must<T>(result: anyhow::Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("operation failed: {err:#}"),
        }
    }

    /// Seeds an active one-question survey and returns its id.
    fn seed_active_survey(db: &std::path::Path) -> SurveyId {
        let store = must(SqliteSurveyStore::open(db, test_codec()));
        must(store.migrate());
        let survey = must(store.create_survey("pulse", "Pulse Survey", None));
        let section = must(store.add_section(survey.survey_id, "Basics", None, 0));
        let _ = must(store.add_question(
            section.section_id,
            &NewQuestion {
                code: "q-1".to_string(),
                prompt: "Your name?".to_string(),
                help_text: None,
                question_type: QuestionType::Text,
                required: true,
                sensitive: false,
                constraints: json!({}),
                sort_order: 0,
            },
        ));
        let _ = must(store.set_survey_status(survey.survey_id, SurveyStatus::Active));
        survey.survey_id
    }

    async fn send(router: Router, request: Request<Body>) -> Response {
        match router.oneshot(request).await {
            Ok(response) => response,
            Err(err) => panic!("router request failed: {err}"),
        }
    }

    fn get_request(uri: &str) -> Request<Body> {
        match Request::builder().uri(uri).method("GET").body(Body::empty()) {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    fn post_json(uri: &str, body: &Value) -> Request<Body> {
        let request = Request::builder()
            .uri(uri)
            .method("POST")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()));
        match request {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        }
    }

    async fn response_json(response: Response) -> Value {
        let bytes = match to_bytes(response.into_body(), 1024 * 1024).await {
            Ok(bytes) => bytes,
            Err(err) => panic!("failed to read response body: {err}"),
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => value,
            Err(err) => panic!(
                "response body is not JSON: {err}; body={}",
                String::from_utf8_lossy(&bytes)
            ),
        }
    }

    #[tokio::test]
    async fn health_endpoint_reports_ok_with_telemetry() {
        let router = app(test_state(unique_temp_db_path()));

        let response = send(router, get_request("/health")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = response_json(response).await;
        assert_eq!(
            value.get("service_contract_version").and_then(Value::as_str),
            Some(SERVICE_CONTRACT_VERSION)
        );
        assert_eq!(value["data"]["status"], "ok");
        assert_eq!(value["data"]["telemetry"]["requests_total"], 0);
    }

    #[tokio::test]
    async fn direct_submission_returns_created_with_answers() {
        let db_path = unique_temp_db_path();
        let survey_id = seed_active_survey(&db_path);
        let router = app(test_state(db_path.clone()));

        let response = send(
            router,
            post_json(
                "/v1/responses/submit",
                &json!({
                    "survey_id": survey_id.to_string(),
                    "answers": {"q-1": "Alice"}
                }),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);

        let value = response_json(response).await;
        assert_eq!(value["data"]["status"], "submitted");
        assert_eq!(value["data"]["answers"][0]["question_code"], "q-1");
        assert_eq!(value["data"]["answers"][0]["value"], "Alice");

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn session_flow_over_http_round_trips() {
        let db_path = unique_temp_db_path();
        let survey_id = seed_active_survey(&db_path);
        let state = test_state(db_path.clone());

        let start = send(
            app(state.clone()),
            post_json(
                "/v1/sessions/start",
                &json!({"survey_id": survey_id.to_string()}),
            ),
        )
        .await;
        assert_eq!(start.status(), StatusCode::OK);
        let started = response_json(start).await;
        let session_id = match started["data"]["session_id"].as_str() {
            Some(raw) => raw.to_string(),
            None => panic!("missing session_id in {started}"),
        };

        let autosave_request = Request::builder()
            .uri(format!("/v1/sessions/{session_id}"))
            .method("PATCH")
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"answers": {"q-1": "Alice"}, "last_step": 1}).to_string(),
            ));
        let autosave_request = match autosave_request {
            Ok(request) => request,
            Err(err) => panic!("failed to build request: {err}"),
        };
        let saved = send(app(state.clone()), autosave_request).await;
        assert_eq!(saved.status(), StatusCode::OK);
        let saved = response_json(saved).await;
        assert_eq!(saved["data"]["partial_payload"]["q-1"], "Alice");

        let submitted = send(
            app(state.clone()),
            post_json("/v1/responses/submit", &json!({"session_id": session_id})),
        )
        .await;
        assert_eq!(submitted.status(), StatusCode::CREATED);
        let submitted = response_json(submitted).await;
        assert_eq!(submitted["data"]["session_id"], session_id);

        let shown = send(
            app(state),
            get_request(&format!("/v1/sessions/{session_id}")),
        )
        .await;
        let shown = response_json(shown).await;
        assert_eq!(shown["data"]["status"], "completed");

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn empty_submission_maps_to_validation_error() {
        let db_path = unique_temp_db_path();
        let survey_id = seed_active_survey(&db_path);
        let router = app(test_state(db_path.clone()));

        let response = send(
            router,
            post_json(
                "/v1/responses/submit",
                &json!({"survey_id": survey_id.to_string(), "answers": {}}),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], "validation_error");
        assert_eq!(value["error"]["detail"], "No answers to submit");

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn missing_response_maps_to_not_found() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let response = send(
            router,
            get_request(&format!("/v1/responses/{}", ulid::Ulid::new())),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], "not_found");

        let _ = std::fs::remove_file(&db_path);
    }

    #[tokio::test]
    async fn submit_without_target_is_a_validation_error() {
        let db_path = unique_temp_db_path();
        let router = app(test_state(db_path.clone()));

        let response = send(
            router,
            post_json("/v1/responses/submit", &json!({"answers": {"q-1": "x"}})),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let value = response_json(response).await;
        assert_eq!(value["error"]["code"], "validation_error");

        let _ = std::fs::remove_file(&db_path);
    }
}
