use std::{
    collections::BTreeMap,
    convert::Infallible,
    io::ErrorKind,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use axum::{
    extract::{ConnectInfo, FromRequestParts, Path as UrlPath, Query, State},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tokio::{net::TcpListener, sync::Mutex};
use tracing::{info, warn};

use gateway_common::{
    schedule::MAX_SCHEDULE_DURATION_SECS, CallerId, ConnectionInfo, Gateway, GatewayError,
    OperationClass, ParamValue, Parameter, ParameterSpec, Preset, PresetCatalog,
    RateLimitDenial, RuntimeConfig, ScheduleConfig, SerialConnector, MAX_TOGGLE_SECS,
};

#[derive(Clone)]
struct AppState {
    gateway: Arc<Gateway>,
    presets: Arc<Mutex<PresetCatalog>>,
    store: AppStore,
}

#[derive(Clone)]
struct AppStore {
    runtime_path: Arc<PathBuf>,
    schedule_path: Arc<PathBuf>,
    presets_path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

/// Rate-limit identity of the requester.
struct Caller(CallerId);

impl<S: Send + Sync> FromRequestParts<S> for Caller {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let header = |name: &'static str| parts.headers.get(name).and_then(|v| v.to_str().ok());
        Ok(Self(CallerId::derive(
            header("x-client-id"),
            header("x-forwarded-for"),
            peer.as_deref(),
        )))
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    kind: Option<&'static str>,
}

#[derive(Debug, Serialize)]
struct RateLimitBody<'a> {
    error: &'static str,
    message: String,
    retry_after_seconds: u64,
    #[serde(flatten)]
    denial: &'a RateLimitDenial,
}

#[derive(Debug, Serialize)]
struct ServiceDescription {
    name: &'static str,
    version: &'static str,
    description: &'static str,
    endpoints: BTreeMap<&'static str, &'static str>,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    connection: ConnectionInfo,
}

#[derive(Debug, Serialize)]
struct ParameterRegistry {
    configurable_parameters: Vec<&'static str>,
    parameter_info: BTreeMap<&'static str, ParameterSpec>,
}

#[derive(Debug, Deserialize)]
struct SetParameterRequest {
    value: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct SetParameterResponse {
    success: bool,
    parameter: Parameter,
    value: ParamValue,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
struct ToggleRequest {
    #[serde(default)]
    hours: u32,
    #[serde(default)]
    minutes: u32,
    #[serde(default)]
    seconds: u32,
    #[serde(default = "default_manual_override")]
    is_manual_override: bool,
}

fn default_manual_override() -> bool {
    true
}

#[derive(Debug, Serialize)]
struct ToggleDuration {
    hours: u32,
    minutes: u32,
    seconds: u32,
    total_seconds: u32,
}

#[derive(Debug, Serialize)]
struct ToggleResponse {
    success: bool,
    message: String,
    duration: ToggleDuration,
    #[serde(skip_serializing_if = "Option::is_none")]
    manual_override_until: Option<chrono::NaiveDateTime>,
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    success: bool,
    message: String,
}

#[derive(Debug, Deserialize)]
struct ScheduleConfigRequest {
    enabled: bool,
    start_time: String,
    duration_seconds: u64,
}

#[derive(Debug, Serialize)]
struct ScheduleConfigResponse {
    success: bool,
    config: ScheduleConfig,
    persisted: bool,
}

#[derive(Debug, Default, Deserialize)]
struct ResetQuery {
    #[serde(default)]
    operation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CreatePresetRequest {
    name: String,
    #[serde(flatten)]
    preset: Preset,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let store = AppStore::new();
    let mut runtime = store.load_runtime_config().await.unwrap_or_else(|err| {
        warn!("failed to load runtime config from store: {err:#}");
        RuntimeConfig::default()
    });
    apply_env_overrides(&mut runtime);
    runtime.sanitize();

    let mut schedule = store.load_schedule().await.unwrap_or_else(|err| {
        warn!("failed to load schedule from store: {err:#}");
        ScheduleConfig::default()
    });
    schedule.normalize();

    let presets = store.load_presets().await.unwrap_or_else(|err| {
        warn!("failed to load presets from store: {err:#}");
        PresetCatalog::default()
    });

    let connector = Arc::new(SerialConnector::new(runtime.serial.clone()));
    let gateway = Arc::new(Gateway::new(&runtime, connector, schedule));
    gateway.start().await;

    let app_state = AppState {
        gateway: gateway.clone(),
        presets: Arc::new(Mutex::new(presets)),
        store,
    };
    let app = router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], runtime.http_port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gateway server at {addr}"))?;

    info!(
        "gateway listening on http://{addr} (device {} @ {} baud)",
        runtime.serial.port, runtime.serial.baudrate
    );
    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await;

    gateway.stop().await;
    served.context("gateway server failed")
}

fn router(app_state: AppState) -> Router {
    Router::new()
        .route("/", get(handle_root))
        .route("/health", get(handle_health))
        .route("/data", get(handle_get_data))
        .route("/data/{param}", get(handle_get_data_field))
        .route("/data/status/connection", get(handle_get_connection))
        .route("/data/status/cache", get(handle_get_cache))
        .route("/config", get(handle_get_config))
        .route("/config/{param}", put(handle_set_parameter))
        .route("/actions/toggle_load", post(handle_toggle_load))
        .route("/actions/cancel_temp_off", post(handle_cancel_temp_off))
        .route("/actions/status", get(handle_get_action_status))
        .route("/schedule", get(handle_get_schedule))
        .route("/schedule/config", put(handle_put_schedule_config))
        .route("/schedule/toggle", post(handle_schedule_toggle))
        .route("/schedule/clear_override", post(handle_clear_override))
        .route("/schedule/info", get(handle_get_schedule_info))
        .route("/schedule/enable", post(handle_schedule_enable))
        .route("/schedule/disable", post(handle_schedule_disable))
        .route("/rate-limit/stats", get(handle_get_rate_limit_stats))
        .route("/rate-limit/reset", post(handle_reset_rate_limit))
        .route("/presets", get(handle_list_presets).post(handle_create_preset))
        .route(
            "/presets/{name}",
            get(handle_get_preset).delete(handle_delete_preset),
        )
        .route("/presets/{name}/apply", post(handle_apply_preset))
        .with_state(app_state)
}

fn apply_env_overrides(runtime: &mut RuntimeConfig) {
    if let Ok(port) = std::env::var("SERIAL_PORT") {
        runtime.serial.port = port;
    }
    runtime.serial.baudrate = std::env::var("SERIAL_BAUDRATE")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(runtime.serial.baudrate);
    runtime.http_port = std::env::var("GATEWAY_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(runtime.http_port);
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {err}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn handle_root() -> impl IntoResponse {
    let endpoints = BTreeMap::from([
        ("data", "/data"),
        ("config", "/config"),
        ("actions", "/actions"),
        ("schedule", "/schedule"),
        ("presets", "/presets"),
        ("rate_limit", "/rate-limit/stats"),
    ]);
    Json(ServiceDescription {
        name: "solar-gateway",
        version: env!("CARGO_PKG_VERSION"),
        description: "HTTP gateway for a serial-attached solar charge controller",
        endpoints,
    })
}

async fn handle_health(State(state): State<AppState>, Caller(caller): Caller) -> Response {
    if let Err(response) = admit(&state, OperationClass::HealthCheck, &caller) {
        return response;
    }
    let connection = state.gateway.connection_info();
    Json(HealthResponse {
        status: if connection.connected {
            "healthy"
        } else {
            "degraded"
        },
        timestamp: Utc::now(),
        connection,
    })
    .into_response()
}

async fn handle_get_data(State(state): State<AppState>, Caller(caller): Caller) -> Response {
    if let Err(response) = admit(&state, OperationClass::ReadData, &caller) {
        return response;
    }
    match state.gateway.get_snapshot().await {
        Ok(snapshot) => Json(&*snapshot).into_response(),
        Err(err) => gateway_error_response(&err),
    }
}

async fn handle_get_data_field(
    State(state): State<AppState>,
    Caller(caller): Caller,
    UrlPath(param): UrlPath<String>,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::ReadData, &caller) {
        return response;
    }
    match state.gateway.get_parameter(&param).await {
        Ok(value) => Json(serde_json::json!({ "parameter": param, "value": value })).into_response(),
        Err(GatewayError::InvalidParameter(message)) => {
            error_response(StatusCode::NOT_FOUND, &message)
        }
        Err(err) => gateway_error_response(&err),
    }
}

async fn handle_get_connection(State(state): State<AppState>, Caller(caller): Caller) -> Response {
    if let Err(response) = admit(&state, OperationClass::ReadData, &caller) {
        return response;
    }
    Json(state.gateway.connection_info()).into_response()
}

async fn handle_get_cache(State(state): State<AppState>, Caller(caller): Caller) -> Response {
    if let Err(response) = admit(&state, OperationClass::ReadData, &caller) {
        return response;
    }
    Json(state.gateway.cache_stats()).into_response()
}

async fn handle_get_config() -> impl IntoResponse {
    Json(ParameterRegistry {
        configurable_parameters: Parameter::ALL.iter().map(|p| p.wire_name()).collect(),
        parameter_info: Parameter::ALL
            .iter()
            .map(|p| (p.wire_name(), p.spec()))
            .collect(),
    })
}

async fn handle_set_parameter(
    State(state): State<AppState>,
    Caller(caller): Caller,
    UrlPath(param): UrlPath<String>,
    Json(request): Json<SetParameterRequest>,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::SetConfig, &caller) {
        return response;
    }
    let Some(value) = ParamValue::from_json(&request.value) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "value must be a boolean, number or string",
        );
    };
    match state.gateway.set_parameter(&param, value).await {
        Ok((parameter, value)) => Json(SetParameterResponse {
            success: true,
            parameter,
            message: format!("{parameter} set to {value}"),
            value,
        })
        .into_response(),
        Err(err) => gateway_error_response(&err),
    }
}

async fn handle_toggle_load(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<ToggleRequest>,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::ExecuteAction, &caller) {
        return response;
    }
    run_toggle(&state, &request, false, MAX_TOGGLE_SECS / 3_600).await
}

async fn handle_schedule_toggle(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<ToggleRequest>,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::ExecuteAction, &caller) {
        return response;
    }
    let is_override = request.is_manual_override;
    run_toggle(&state, &request, is_override, MAX_SCHEDULE_DURATION_SECS / 3_600).await
}

async fn run_toggle(
    state: &AppState,
    request: &ToggleRequest,
    is_override: bool,
    max_hours: u32,
) -> Response {
    let total_seconds = match toggle_seconds(request, max_hours) {
        Ok(total) => total,
        Err(message) => return error_response(StatusCode::BAD_REQUEST, &message),
    };
    match state.gateway.toggle_load(total_seconds, is_override).await {
        Ok(outcome) => Json(ToggleResponse {
            success: true,
            message: format!("load switched off for {total_seconds} seconds"),
            duration: ToggleDuration {
                hours: request.hours,
                minutes: request.minutes,
                seconds: request.seconds,
                total_seconds,
            },
            manual_override_until: outcome.manual_override_until,
        })
        .into_response(),
        Err(err) => gateway_error_response(&err),
    }
}

fn toggle_seconds(request: &ToggleRequest, max_hours: u32) -> Result<u32, String> {
    if request.hours > max_hours {
        return Err(format!("hours must be between 0 and {max_hours}"));
    }
    if request.minutes > 59 || request.seconds > 59 {
        return Err("minutes and seconds must be between 0 and 59".to_string());
    }
    let total = request.hours * 3_600 + request.minutes * 60 + request.seconds;
    if total == 0 {
        return Err("duration must be at least 1 second".to_string());
    }
    if total > max_hours * 3_600 {
        return Err(format!("duration must not exceed {max_hours} hours"));
    }
    Ok(total)
}

async fn handle_cancel_temp_off(State(state): State<AppState>, Caller(caller): Caller) -> Response {
    if let Err(response) = admit(&state, OperationClass::ExecuteAction, &caller) {
        return response;
    }
    match state.gateway.cancel_override().await {
        Ok(_) => Json(ActionResponse {
            success: true,
            message: "temporary load-off cancelled".to_string(),
        })
        .into_response(),
        Err(err) => gateway_error_response(&err),
    }
}

async fn handle_get_action_status(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::ReadData, &caller) {
        return response;
    }
    match state.gateway.get_snapshot().await {
        Ok(snapshot) => Json(snapshot.telemetry.load_status()).into_response(),
        Err(err) => gateway_error_response(&err),
    }
}

async fn handle_get_schedule(State(state): State<AppState>, Caller(caller): Caller) -> Response {
    if let Err(response) = admit(&state, OperationClass::ReadData, &caller) {
        return response;
    }
    Json(state.gateway.schedule_status()).into_response()
}

async fn handle_put_schedule_config(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<ScheduleConfigRequest>,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::SetConfig, &caller) {
        return response;
    }
    match state.gateway.schedule_configure(
        request.enabled,
        &request.start_time,
        request.duration_seconds,
    ) {
        Ok(config) => schedule_saved(&state, config).await,
        Err(err) => gateway_error_response(&err),
    }
}

async fn handle_schedule_enable(State(state): State<AppState>, Caller(caller): Caller) -> Response {
    if let Err(response) = admit(&state, OperationClass::SetConfig, &caller) {
        return response;
    }
    let config = state.gateway.schedule_enable();
    schedule_saved(&state, config).await
}

async fn handle_schedule_disable(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::SetConfig, &caller) {
        return response;
    }
    let config = state.gateway.schedule_disable();
    schedule_saved(&state, config).await
}

async fn schedule_saved(state: &AppState, config: ScheduleConfig) -> Response {
    let persisted = match state.store.save_schedule(&config).await {
        Ok(()) => true,
        Err(err) => {
            warn!("failed to persist schedule: {err:#}");
            false
        }
    };
    Json(ScheduleConfigResponse {
        success: true,
        config,
        persisted,
    })
    .into_response()
}

async fn handle_clear_override(State(state): State<AppState>, Caller(caller): Caller) -> Response {
    if let Err(response) = admit(&state, OperationClass::ExecuteAction, &caller) {
        return response;
    }
    let cleared = state.gateway.schedule_clear_override();
    Json(ActionResponse {
        success: true,
        message: if cleared {
            "manual override cleared, daily schedule resumed".to_string()
        } else {
            "no manual override was active".to_string()
        },
    })
    .into_response()
}

async fn handle_get_schedule_info(
    State(state): State<AppState>,
    Caller(caller): Caller,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::ReadData, &caller) {
        return response;
    }
    Json(state.gateway.schedule_info()).into_response()
}

async fn handle_get_rate_limit_stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.gateway.rate_limiter_stats())
}

async fn handle_reset_rate_limit(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Query(query): Query<ResetQuery>,
) -> Response {
    let class = match query.operation.as_deref() {
        None => None,
        Some(raw) => match OperationClass::parse(raw) {
            Some(class) => Some(class),
            None => {
                return error_response(
                    StatusCode::BAD_REQUEST,
                    &format!("unknown operation class '{raw}'"),
                )
            }
        },
    };
    state.gateway.rate_limiter_reset(class, &caller);
    Json(ActionResponse {
        success: true,
        message: match class {
            Some(class) => format!("{} limits reset for {caller}", class.as_str()),
            None => format!("all limits reset for {caller}"),
        },
    })
    .into_response()
}

async fn handle_list_presets(State(state): State<AppState>) -> impl IntoResponse {
    let presets = state.presets.lock().await.clone();
    Json(presets)
}

async fn handle_get_preset(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Response {
    let presets = state.presets.lock().await;
    match presets.get(&name) {
        Some(preset) => Json(preset).into_response(),
        None => error_response(StatusCode::NOT_FOUND, &format!("preset '{name}' not found")),
    }
}

async fn handle_create_preset(
    State(state): State<AppState>,
    Caller(caller): Caller,
    Json(request): Json<CreatePresetRequest>,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::SetConfig, &caller) {
        return response;
    }
    let (stored, snapshot) = {
        let mut presets = state.presets.lock().await;
        match presets.upsert(&request.name, request.preset, Utc::now()) {
            Ok(stored) => {
                let stored = stored.clone();
                (stored, presets.clone())
            }
            Err(err) => return gateway_error_response(&err),
        }
    };
    if let Err(err) = state.store.save_presets(&snapshot).await {
        warn!("failed to persist presets: {err:#}");
    }
    (StatusCode::CREATED, Json(stored)).into_response()
}

async fn handle_delete_preset(
    State(state): State<AppState>,
    Caller(caller): Caller,
    UrlPath(name): UrlPath<String>,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::SetConfig, &caller) {
        return response;
    }
    let snapshot = {
        let mut presets = state.presets.lock().await;
        if presets.remove(&name).is_none() {
            return error_response(StatusCode::NOT_FOUND, &format!("preset '{name}' not found"));
        }
        presets.clone()
    };
    if let Err(err) = state.store.save_presets(&snapshot).await {
        warn!("failed to persist presets: {err:#}");
    }
    Json(ActionResponse {
        success: true,
        message: format!("preset '{name}' deleted"),
    })
    .into_response()
}

async fn handle_apply_preset(
    State(state): State<AppState>,
    Caller(caller): Caller,
    UrlPath(name): UrlPath<String>,
) -> Response {
    if let Err(response) = admit(&state, OperationClass::SetConfig, &caller) {
        return response;
    }
    let Some(preset) = state.presets.lock().await.get(&name).cloned() else {
        return error_response(StatusCode::NOT_FOUND, &format!("preset '{name}' not found"));
    };
    match state.gateway.apply_preset(&preset).await {
        Ok(report) if report.is_complete() => Json(report).into_response(),
        Ok(report) => (StatusCode::BAD_GATEWAY, Json(report)).into_response(),
        Err(err) => gateway_error_response(&err),
    }
}

fn admit(state: &AppState, class: OperationClass, caller: &CallerId) -> Result<(), Response> {
    state
        .gateway
        .rate_limiter_check(class, caller)
        .map_err(|err| gateway_error_response(&err))
}

impl AppStore {
    fn new() -> Self {
        let data_dir = std::env::var("GATEWAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./.gateway"));
        Self::in_dir(&data_dir)
    }

    fn in_dir(data_dir: &Path) -> Self {
        Self {
            runtime_path: Arc::new(data_dir.join("runtime.json")),
            schedule_path: Arc::new(data_dir.join("schedule.json")),
            presets_path: Arc::new(data_dir.join("presets.json")),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load_runtime_config(&self) -> anyhow::Result<RuntimeConfig> {
        self.load(&self.runtime_path).await
    }

    #[cfg(test)]
    async fn save_runtime_config(&self, runtime: &RuntimeConfig) -> anyhow::Result<()> {
        self.save(&self.runtime_path, runtime).await
    }

    async fn load_schedule(&self) -> anyhow::Result<ScheduleConfig> {
        self.load(&self.schedule_path).await
    }

    async fn save_schedule(&self, schedule: &ScheduleConfig) -> anyhow::Result<()> {
        self.save(&self.schedule_path, schedule).await
    }

    async fn load_presets(&self) -> anyhow::Result<PresetCatalog> {
        self.load(&self.presets_path).await
    }

    async fn save_presets(&self, presets: &PresetCatalog) -> anyhow::Result<()> {
        self.save(&self.presets_path, presets).await
    }

    async fn load<T: DeserializeOwned + Default>(&self, path: &Path) -> anyhow::Result<T> {
        let _guard = self.lock.lock().await;
        match tokio::fs::read(path).await {
            Ok(raw) => serde_json::from_slice::<T>(&raw)
                .with_context(|| format!("malformed {}", path.display())),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(T::default()),
            Err(err) => Err(err).with_context(|| format!("failed to read {}", path.display())),
        }
    }

    async fn save<T: Serialize>(&self, path: &Path, value: &T) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(path, payload)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}

fn status_for(err: &GatewayError) -> StatusCode {
    match err {
        GatewayError::InvalidParameter(_)
        | GatewayError::ScheduleConfigInvalid(_)
        | GatewayError::PresetInvalid(_) => StatusCode::BAD_REQUEST,
        GatewayError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
        GatewayError::DeviceRejected(_) | GatewayError::FrameInvalid(_) => StatusCode::BAD_GATEWAY,
        GatewayError::LockTimeout { .. } | GatewayError::FrameTimeout { .. } => {
            StatusCode::GATEWAY_TIMEOUT
        }
        GatewayError::ConnectionLost(_) | GatewayError::Unavailable(_) => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    }
}

fn gateway_error_response(err: &GatewayError) -> Response {
    if let GatewayError::RateLimitExceeded(denial) = err {
        return rate_limited_response(denial);
    }
    (
        status_for(err),
        Json(ErrorBody {
            error: err.to_string(),
            kind: Some(err.kind()),
        }),
    )
        .into_response()
}

fn rate_limited_response(denial: &RateLimitDenial) -> Response {
    let retry_after = denial.retry_after().as_secs_f64().ceil().max(1.0) as u64;
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, retry_after.to_string())],
        Json(RateLimitBody {
            error: "rate_limit_exceeded",
            message: format!("too many {} requests", denial.operation.as_str()),
            retry_after_seconds: retry_after,
            denial,
        }),
    )
        .into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
            kind: None,
        }),
    )
        .into_response()
}
