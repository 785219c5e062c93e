use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use ration_core::{
    day_key_at, next_rollover, parse_utc_offset, AllocationOutcome, Command, IssuancePolicy,
    UserId, GREETING_MESSAGE, LIMIT_REACHED_MESSAGE, NO_RECORDS_MESSAGE,
};
use ration_store_sqlite::RecordStore;
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::{Date, OffsetDateTime, UtcOffset};
use tracing_subscriber::EnvFilter;

const SERVICE_CONTRACT_VERSION: &str = "ration.v1";

/// Per-operation handle over the records database. Each store operation
/// opens a fresh connection, so blocking work never pins a shared handle
/// across requests.
#[derive(Debug, Clone)]
struct AllocationApi {
    db_path: PathBuf,
    policy: IssuancePolicy,
}

impl AllocationApi {
    fn new(db_path: PathBuf, policy: IssuancePolicy) -> Self {
        Self { db_path, policy }
    }

    fn open(&self) -> Result<RecordStore> {
        RecordStore::open(&self.db_path)
    }

    fn migrate(&self) -> Result<()> {
        self.open()?.migrate()
    }

    fn issue(&self, user: &UserId, day: Date) -> Result<AllocationOutcome> {
        let mut store = self.open()?;
        store.issue(user, day, &self.policy)
    }

    fn schema_version(&self) -> Result<Option<i64>> {
        self.open()?.schema_version()
    }
}

/// Cached issuance day. Handlers read the key without touching the wall
/// clock; a background task refreshes it at each local midnight.
#[derive(Debug)]
struct DayClock {
    offset: UtcOffset,
    julian_day: AtomicI32,
}

impl DayClock {
    fn new(offset: UtcOffset) -> Self {
        let today = day_key_at(OffsetDateTime::now_utc(), offset);
        Self {
            offset,
            julian_day: AtomicI32::new(today.to_julian_day()),
        }
    }

    fn current_day(&self) -> Date {
        let julian = self.julian_day.load(Ordering::Relaxed);
        Date::from_julian_day(julian)
            .unwrap_or_else(|_| day_key_at(OffsetDateTime::now_utc(), self.offset))
    }

    fn refresh(&self) -> Date {
        let today = day_key_at(OffsetDateTime::now_utc(), self.offset);
        self.julian_day
            .store(today.to_julian_day(), Ordering::Relaxed);
        today
    }
}

async fn run_day_clock(clock: Arc<DayClock>) {
    loop {
        let now = OffsetDateTime::now_utc();
        let wait = match next_rollover(now, clock.offset) {
            Ok(rollover) => {
                Duration::try_from(rollover - now).unwrap_or(Duration::from_secs(60))
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to compute day rollover; retrying in one hour");
                Duration::from_secs(3600)
            }
        };
        // Land just past midnight so the refreshed key is already tomorrow's.
        tokio::time::sleep(wait.saturating_add(Duration::from_secs(1))).await;
        let day = clock.refresh();
        tracing::info!(day = %day, "issuance day rolled over");
    }
}

#[derive(Debug, Clone)]
struct ServiceState {
    api: AllocationApi,
    api_token: String,
    day_clock: Arc<DayClock>,
    operation_timeout: Duration,
    telemetry: Arc<ServiceTelemetry>,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceEnvelope<T>
where
    T: Serialize,
{
    contract_version: &'static str,
    data: T,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceError {
    contract_version: &'static str,
    error: ServiceErrorPayload,
}

#[derive(Debug, Clone, Serialize)]
struct ServiceErrorPayload {
    code: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
struct ServiceFailure {
    status: StatusCode,
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
struct CommandRequest {
    user_id: String,
    command: String,
}

#[derive(Debug, Clone, Serialize)]
struct CommandResponse {
    status: &'static str,
    messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
struct HealthResponse {
    status: &'static str,
    day: String,
    timeout_ms: u64,
    telemetry: ServiceTelemetrySnapshot,
}

#[derive(Debug, Clone, Serialize)]
struct ReadinessResponse {
    status: &'static str,
    schema_version: i64,
}

#[derive(Debug, Default)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetry {
    requests_total: AtomicU64,
    requests_success_total: AtomicU64,
    requests_failure_total: AtomicU64,
    timeout_total: AtomicU64,
    invalid_json_total: AtomicU64,
    unauthorized_total: AtomicU64,
    unknown_command_total: AtomicU64,
    validation_error_total: AtomicU64,
    store_unavailable_total: AtomicU64,
    internal_error_total: AtomicU64,
    other_error_total: AtomicU64,
    issued_total: AtomicU64,
    limit_reached_total: AtomicU64,
    no_records_total: AtomicU64,
    records_issued_total: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[allow(clippy::struct_field_names)]
struct ServiceTelemetrySnapshot {
    requests_total: u64,
    requests_success_total: u64,
    requests_failure_total: u64,
    timeout_total: u64,
    invalid_json_total: u64,
    unauthorized_total: u64,
    unknown_command_total: u64,
    validation_error_total: u64,
    store_unavailable_total: u64,
    internal_error_total: u64,
    other_error_total: u64,
    issued_total: u64,
    limit_reached_total: u64,
    no_records_total: u64,
    records_issued_total: u64,
}

#[derive(Debug, Parser)]
#[command(name = "rationd")]
#[command(about = "Quota-bounded record allocation service")]
struct Args {
    #[arg(long, env = "RATION_DB")]
    db: PathBuf,
    #[arg(long, env = "RATION_API_TOKEN", hide_env_values = true)]
    api_token: String,
    #[arg(long, default_value = "127.0.0.1:4020")]
    bind: SocketAddr,
    #[arg(long, default_value_t = 2500)]
    operation_timeout_ms: u64,
    #[arg(long, default_value = "+00:00", value_parser = parse_offset_arg)]
    utc_offset: UtcOffset,
}

fn parse_offset_arg(value: &str) -> Result<UtcOffset, String> {
    parse_utc_offset(value).map_err(|err| err.to_string())
}

impl IntoResponse for ServiceFailure {
    fn into_response(self) -> Response {
        let payload = ServiceError {
            contract_version: SERVICE_CONTRACT_VERSION,
            error: ServiceErrorPayload {
                code: self.code,
                message: self.message,
                details: self.details,
            },
        };
        (self.status, Json(payload)).into_response()
    }
}

impl ServiceState {
    fn failure(
        status: StatusCode,
        code: &'static str,
        message: impl Into<String>,
        details: Option<serde_json::Value>,
    ) -> ServiceFailure {
        ServiceFailure {
            status,
            code,
            message: message.into(),
            details,
        }
    }

    fn invalid_json(rejection: &JsonRejection) -> ServiceFailure {
        Self::failure(
            rejection.status(),
            "invalid_json",
            rejection.body_text(),
            Some(json!({"rejection": rejection.to_string()})),
        )
    }

    fn invalid_json_with_telemetry(&self, rejection: &JsonRejection) -> ServiceFailure {
        self.telemetry.record_failure("invalid_json", false);
        Self::invalid_json(rejection)
    }

    fn authorize(&self, headers: &HeaderMap) -> Result<(), ServiceFailure> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));

        if token == Some(self.api_token.as_str()) {
            return Ok(());
        }

        self.telemetry.record_failure("unauthorized", false);
        Err(Self::failure(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
            None,
        ))
    }

    fn classify_store_error(
        err: &anyhow::Error,
        default_status: StatusCode,
        default_code: &'static str,
    ) -> ServiceFailure {
        let message = err.to_string();
        let diagnostic = format!("{err:#}");
        let normalized = diagnostic.to_ascii_lowercase();

        if normalized.contains("validation error") {
            return Self::failure(StatusCode::BAD_REQUEST, "validation_error", message, None);
        }

        if normalized.contains("configuration error") {
            return Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                message,
                None,
            );
        }

        if normalized.contains("sqlite")
            || normalized.contains("database")
            || normalized.contains("locked")
            || normalized.contains("schema")
        {
            return Self::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "records store is temporarily unavailable; retry the command",
                None,
            );
        }

        Self::failure(default_status, default_code, message, None)
    }

    async fn run_blocking<T, F>(
        &self,
        default_status: StatusCode,
        default_code: &'static str,
        operation_label: &'static str,
        op: F,
    ) -> Result<T, ServiceFailure>
    where
        T: Send + 'static,
        F: FnOnce(AllocationApi) -> anyhow::Result<T> + Send + 'static,
    {
        self.telemetry
            .requests_total
            .fetch_add(1, Ordering::Relaxed);
        let api = self.api.clone();
        let handle = tokio::task::spawn_blocking(move || op(api));
        let join_result = tokio::time::timeout(self.operation_timeout, handle)
            .await
            .map_err(|_| {
                self.telemetry.record_failure(default_code, true);
                Self::failure(
                    default_status,
                    default_code,
                    format!(
                        "{operation_label} timed out after {} ms",
                        self.operation_timeout.as_millis()
                    ),
                    Some(json!({ "timeout_ms": self.operation_timeout.as_millis() })),
                )
            })?;

        let op_result = join_result.map_err(|err| {
            self.telemetry.record_failure("internal_error", false);
            Self::failure(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                format!("{operation_label} join failure: {err}"),
                None,
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
                tracing::warn!(
                    operation = operation_label,
                    error = %format!("{err:#}"),
                    "store operation failed"
                );
                let failure = Self::classify_store_error(&err, default_status, default_code);
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
            "unauthorized" => {
                self.unauthorized_total.fetch_add(1, Ordering::Relaxed);
            }
            "unknown_command" => {
                self.unknown_command_total.fetch_add(1, Ordering::Relaxed);
            }
            "validation_error" => {
                self.validation_error_total.fetch_add(1, Ordering::Relaxed);
            }
            "store_unavailable" => {
                self.store_unavailable_total.fetch_add(1, Ordering::Relaxed);
            }
            "internal_error" => {
                self.internal_error_total.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.other_error_total.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    fn record_outcome(&self, outcome: &AllocationOutcome) {
        match outcome {
            AllocationOutcome::LimitReached => {
                self.limit_reached_total.fetch_add(1, Ordering::Relaxed);
            }
            AllocationOutcome::NoRecordsAvailable => {
                self.no_records_total.fetch_add(1, Ordering::Relaxed);
            }
            AllocationOutcome::Issued { records } => {
                self.issued_total.fetch_add(1, Ordering::Relaxed);
                let count = u64::try_from(records.len()).unwrap_or(u64::MAX);
                self.records_issued_total.fetch_add(count, Ordering::Relaxed);
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
            unauthorized_total: self.unauthorized_total.load(Ordering::Relaxed),
            unknown_command_total: self.unknown_command_total.load(Ordering::Relaxed),
            validation_error_total: self.validation_error_total.load(Ordering::Relaxed),
            store_unavailable_total: self.store_unavailable_total.load(Ordering::Relaxed),
            internal_error_total: self.internal_error_total.load(Ordering::Relaxed),
            other_error_total: self.other_error_total.load(Ordering::Relaxed),
            issued_total: self.issued_total.load(Ordering::Relaxed),
            limit_reached_total: self.limit_reached_total.load(Ordering::Relaxed),
            no_records_total: self.no_records_total.load(Ordering::Relaxed),
            records_issued_total: self.records_issued_total.load(Ordering::Relaxed),
        }
    }
}

fn envelope<T>(data: T) -> ServiceEnvelope<T>
where
    T: Serialize,
{
    ServiceEnvelope {
        contract_version: SERVICE_CONTRACT_VERSION,
        data,
    }
}

fn app(state: ServiceState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/ready", get(ready))
        .route("/v1/commands", post(commands))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let args = Args::parse();
    let api = AllocationApi::new(args.db, IssuancePolicy::v1());
    api.migrate().context("failed to prepare records database")?;

    let day_clock = Arc::new(DayClock::new(args.utc_offset));
    tokio::spawn(run_day_clock(Arc::clone(&day_clock)));

    let state = ServiceState {
        api,
        api_token: args.api_token,
        day_clock,
        operation_timeout: Duration::from_millis(args.operation_timeout_ms),
        telemetry: Arc::new(ServiceTelemetry::default()),
    };

    tracing::info!(
        bind = %args.bind,
        day = %state.day_clock.current_day(),
        "ration service listening"
    );
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn health(State(state): State<ServiceState>) -> Json<ServiceEnvelope<HealthResponse>> {
    let timeout_ms = u64::try_from(state.operation_timeout.as_millis()).unwrap_or(u64::MAX);
    Json(envelope(HealthResponse {
        status: "ok",
        day: state.day_clock.current_day().to_string(),
        timeout_ms,
        telemetry: state.telemetry.snapshot(),
    }))
}

async fn ready(
    State(state): State<ServiceState>,
) -> Result<Json<ServiceEnvelope<ReadinessResponse>>, ServiceFailure> {
    let version = state
        .run_blocking(
            StatusCode::SERVICE_UNAVAILABLE,
            "store_unavailable",
            "schema_version",
            |api| api.schema_version(),
        )
        .await?;

    match version {
        Some(version) => Ok(Json(envelope(ReadinessResponse {
            status: "ready",
            schema_version: version,
        }))),
        None => {
            state.telemetry.record_failure("store_unavailable", false);
            Err(ServiceState::failure(
                StatusCode::SERVICE_UNAVAILABLE,
                "store_unavailable",
                "records schema is not migrated; run `ration db migrate` first",
                None,
            ))
        }
    }
}

async fn commands(
    State(state): State<ServiceState>,
    headers: HeaderMap,
    payload: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<ServiceEnvelope<CommandResponse>>, ServiceFailure> {
    state.authorize(&headers)?;
    let Json(request) =
        payload.map_err(|rejection| state.invalid_json_with_telemetry(&rejection))?;

    let command = Command::parse(&request.command).ok_or_else(|| {
        state.telemetry.record_failure("unknown_command", false);
        ServiceState::failure(
            StatusCode::BAD_REQUEST,
            "unknown_command",
            format!("unknown command: {}", request.command),
            None,
        )
    })?;

    let user = UserId::new(request.user_id).map_err(|err| {
        state.telemetry.record_failure("validation_error", false);
        ServiceState::failure(
            StatusCode::BAD_REQUEST,
            "validation_error",
            err.to_string(),
            None,
        )
    })?;

    let response = match command {
        Command::Start => CommandResponse {
            status: "greeting",
            messages: vec![GREETING_MESSAGE.to_string()],
        },
        Command::GetRecords => {
            let day = state.day_clock.current_day();
            let outcome = state
                .run_blocking(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "store_unavailable",
                    "issue",
                    move |api| api.issue(&user, day),
                )
                .await?;
            state.telemetry.record_outcome(&outcome);
            let status = outcome.status();
            let messages = match outcome {
                AllocationOutcome::LimitReached => vec![LIMIT_REACHED_MESSAGE.to_string()],
                AllocationOutcome::NoRecordsAvailable => vec![NO_RECORDS_MESSAGE.to_string()],
                AllocationOutcome::Issued { records } => {
                    records.into_iter().map(|record| record.content).collect()
                }
            };
            CommandResponse { status, messages }
        }
    };

    Ok(Json(envelope(response)))
}
