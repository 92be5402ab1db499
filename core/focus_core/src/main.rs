use axum::{
    extract::{Path, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use clap::Parser;
use rusqlite::{Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    net::{IpAddr, SocketAddr},
    path::PathBuf,
    sync::Arc,
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

const DEFAULT_PORT: u16 = 17700;
const TZ_OFFSET_MINUTES_MIN: i32 = -14 * 60;
const TZ_OFFSET_MINUTES_MAX: i32 = 14 * 60;
const DEFAULT_FOCUS_SECONDS: i64 = 25 * 60;
const DEFAULT_BREAK_SECONDS: i64 = 5 * 60;
const DEFAULT_REMINDER_MINUTES: i64 = 20;

#[derive(Parser, Debug)]
#[command(name = "focus_core", version)]
struct Args {
    /// Listen address.
    ///
    /// Accepts:
    /// - ip:port (recommended), e.g. 127.0.0.1:17700
    /// - ip (implies port 17700), e.g. 127.0.0.1
    /// - localhost or localhost:port
    #[arg(long, default_value = "127.0.0.1:17700")]
    listen: String,

    /// SQLite database path.
    #[arg(long, default_value = "./data/focus-core.db")]
    db: PathBuf,
}

#[derive(Clone)]
struct AppState {
    conn: Arc<Mutex<Connection>>,
}

#[derive(Serialize)]
struct OkResponse<T: Serialize> {
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
}

#[derive(Serialize)]
struct ErrResponse {
    ok: bool,
    error: &'static str,
}

/// Every user-scoped route takes the owner explicitly: `?user=<id>`.
#[derive(Deserialize)]
struct UserQuery {
    #[serde(default)]
    user: Option<i64>,
}

#[derive(Deserialize)]
struct StatsQuery {
    #[serde(default)]
    user: Option<i64>,
    /// Client local offset minutes, e.g. 180 for UTC+3.
    #[serde(default)]
    tz_offset_minutes: Option<i32>,
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum SessionType {
    Focus,
    Break,
}

impl SessionType {
    fn as_str(self) -> &'static str {
        match self {
            SessionType::Focus => "focus",
            SessionType::Break => "break",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "focus" => Some(SessionType::Focus),
            "break" => Some(SessionType::Break),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TimerSession {
    id: i64,
    user_id: i64,
    #[serde(rename = "type")]
    kind: SessionType,
    duration: i64,
    completed: bool,
    created_at: String,
}

#[derive(Deserialize)]
struct NewSession {
    #[serde(rename = "type")]
    kind: SessionType,
    duration: i64,
    #[serde(default)]
    completed: bool,
}

#[derive(Debug, Default, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct TodayStats {
    focus_minutes: i64,
    break_minutes: i64,
    sessions: i64,
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
struct ScheduleSuggestion {
    title: String,
    schedule: String,
    color: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    #[serde(default)]
    work_schedule: Option<String>,
    #[serde(default)]
    extra_activities: Option<String>,
    #[serde(default)]
    goals: Option<String>,
}

#[derive(Serialize)]
struct ScheduleResponse {
    schedule: Vec<ScheduleSuggestion>,
}

#[derive(Deserialize)]
struct BulkHabitsRequest {
    schedule: Vec<ScheduleSuggestion>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Habit {
    id: i64,
    user_id: i64,
    title: String,
    description: Option<String>,
    schedule: String,
    reminder_minutes: i64,
    is_active: bool,
    created_at: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HabitCreate {
    title: String,
    #[serde(default)]
    description: Option<String>,
    schedule: String,
    #[serde(default = "default_reminder_minutes")]
    reminder_minutes: i64,
    #[serde(default = "default_true")]
    is_active: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct HabitUpdate {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    schedule: Option<String>,
    #[serde(default)]
    reminder_minutes: Option<i64>,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AppLimit {
    id: i64,
    user_id: i64,
    app_name: String,
    app_icon: String,
    daily_limit_minutes: i64,
    used_minutes_today: i64,
    is_active: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppLimitCreate {
    app_name: String,
    app_icon: String,
    daily_limit_minutes: i64,
    #[serde(default)]
    used_minutes_today: i64,
    #[serde(default = "default_true")]
    is_active: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppLimitUpdate {
    #[serde(default)]
    app_name: Option<String>,
    #[serde(default)]
    app_icon: Option<String>,
    #[serde(default)]
    daily_limit_minutes: Option<i64>,
    #[serde(default)]
    used_minutes_today: Option<i64>,
    #[serde(default)]
    is_active: Option<bool>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct JournalEntry {
    id: i64,
    user_id: i64,
    content: String,
    created_at: String,
}

#[derive(Deserialize)]
struct JournalEntryCreate {
    content: String,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct TimerSettings {
    focus_seconds: i64,
    break_seconds: i64,
    sound_enabled: bool,
}

impl Default for TimerSettings {
    fn default() -> Self {
        TimerSettings {
            focus_seconds: DEFAULT_FOCUS_SECONDS,
            break_seconds: DEFAULT_BREAK_SECONDS,
            sound_enabled: true,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TimerSettingsUpdate {
    #[serde(default)]
    focus_seconds: Option<i64>,
    #[serde(default)]
    break_seconds: Option<i64>,
    #[serde(default)]
    sound_enabled: Option<bool>,
}

#[derive(Serialize)]
struct DeleteResult {
    deleted: bool,
}

fn default_reminder_minutes() -> i64 {
    DEFAULT_REMINDER_MINUTES
}

fn default_true() -> bool {
    true
}

/// One goal keyword rule: fires when any keyword occurs in the lowercased goals.
struct GoalRule {
    keywords: &'static [&'static str],
    title: &'static str,
    schedule: &'static str,
    color: &'static str,
}

const WORK_TITLE: &str = "Work/Study";
const WORK_COLOR: &str = "#10B981";
const EXTRA_TITLE: &str = "Extra activities";
const EXTRA_COLOR: &str = "#3B82F6";

// Evaluated in order; rules are independent and several may fire.
const GOAL_RULES: &[GoalRule] = &[
    GoalRule {
        keywords: &["gym", "зал"],
        title: "Gym",
        schedule: "Tue, Thu, Sat 16:00-17:30",
        color: "#EF4444",
    },
    GoalRule {
        keywords: &["read", "читать"],
        title: "Reading",
        schedule: "Daily, 20:00-20:30",
        color: "#8B5CF6",
    },
    GoalRule {
        keywords: &["english", "language", "английский"],
        title: "English study",
        schedule: "Mon, Wed, Fri 19:00-19:30",
        color: "#F59E0B",
    },
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "focus_core=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();

    if let Some(parent) = args.db.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(&args.db)?;
    init_db(&conn)?;

    let state = AppState {
        conn: Arc::new(Mutex::new(conn)),
    };

    let app = app_router(state);

    let addr = parse_listen(&args.listen)?;
    info!("Core listening on http://{addr}");
    info!("DB: {}", args.db.display());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([axum::http::header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(health))
        .route(
            "/sessions",
            get(get_sessions).post(post_session).options(options_ok),
        )
        .route("/sessions/stats/today", get(get_stats_today))
        .route(
            "/schedule/generate",
            post(post_schedule_generate).options(options_ok),
        )
        .route(
            "/habits",
            get(get_habits).post(post_habit).options(options_ok),
        )
        .route("/habits/bulk", post(post_habits_bulk).options(options_ok))
        .route(
            "/habits/:id",
            put(put_habit).delete(delete_habit).options(options_ok),
        )
        .route(
            "/app-limits",
            get(get_app_limits).post(post_app_limit).options(options_ok),
        )
        .route(
            "/app-limits/:id",
            put(put_app_limit).delete(delete_app_limit).options(options_ok),
        )
        .route(
            "/journal-entries",
            get(get_journal_entries)
                .post(post_journal_entry)
                .options(options_ok),
        )
        .route(
            "/journal-entries/:id",
            delete(delete_journal_entry).options(options_ok),
        )
        .route(
            "/settings",
            get(get_settings).post(post_settings).options(options_ok),
        )
        .with_state(state)
        .layer(cors)
}

fn parse_listen(input: &str) -> anyhow::Result<SocketAddr> {
    if let Ok(addr) = input.parse::<SocketAddr>() {
        return Ok(addr);
    }

    if let Ok(ip) = input.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, DEFAULT_PORT));
    }

    if let Some((host, port_str)) = input.rsplit_once(':') {
        if host == "localhost" {
            let port: u16 = port_str.parse().map_err(|_| {
                anyhow::anyhow!(
                    "invalid --listen '{}': bad port. Example: 127.0.0.1:{}",
                    input,
                    DEFAULT_PORT
                )
            })?;
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), port));
        }
    }

    if input == "localhost" {
        return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), DEFAULT_PORT));
    }

    Err(anyhow::anyhow!(
        "invalid --listen '{}'. Use ip:port (e.g. 127.0.0.1:{}) or ip (e.g. 127.0.0.1).",
        input,
        DEFAULT_PORT
    ))
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown requested");
}

async fn options_ok() -> impl IntoResponse {
    StatusCode::OK
}

fn ok_response<T: Serialize>(data: T) -> Response {
    Json(OkResponse {
        ok: true,
        data: Some(data),
    })
    .into_response()
}

fn err_response(status: StatusCode, error: &'static str) -> Response {
    (status, Json(ErrResponse { ok: false, error })).into_response()
}

fn db_error(op: &str, err: rusqlite::Error) -> Response {
    error!("{op} failed: {err}");
    err_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error")
}

fn require_user(user: Option<i64>) -> Result<i64, Response> {
    match user {
        Some(id) if id > 0 => Ok(id),
        _ => Err(err_response(StatusCode::BAD_REQUEST, "invalid_user")),
    }
}

fn parse_body<T: serde::de::DeserializeOwned>(payload: Value) -> Result<T, Response> {
    serde_json::from_value(payload).map_err(|_| err_response(StatusCode::BAD_REQUEST, "invalid_json"))
}

/// Whole-second UTC timestamps keep `created_at` text comparable in SQL.
fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.replace_nanosecond(0)
        .unwrap_or(now)
        .format(&Rfc3339)
        .unwrap_or_default()
}

#[derive(Serialize)]
struct HealthInfo {
    service: &'static str,
    version: &'static str,
}

async fn health() -> impl IntoResponse {
    Json(OkResponse {
        ok: true,
        data: Some(HealthInfo {
            service: "focus_core",
            version: env!("CARGO_PKG_VERSION"),
        }),
    })
}

async fn post_session(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
    Json(payload): Json<Value>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let s: NewSession = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if s.duration < 0 {
        return err_response(StatusCode::BAD_REQUEST, "invalid_duration");
    }

    let created_at = now_rfc3339();
    let conn = state.conn.lock().await;
    match insert_session(&conn, user, &s, &created_at) {
        Ok(session) => {
            info!(
                user,
                kind = session.kind.as_str(),
                duration = session.duration,
                completed = session.completed,
                "session recorded"
            );
            ok_response(session)
        }
        Err(err) => db_error("insert_session", err),
    }
}

async fn get_sessions(State(state): State<AppState>, Query(q): Query<UserQuery>) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn.lock().await;
    match list_sessions(&conn, user) {
        Ok(sessions) => ok_response(sessions),
        Err(err) => db_error("list_sessions", err),
    }
}

async fn get_stats_today(State(state): State<AppState>, Query(q): Query<StatsQuery>) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let tz_offset = tz_offset_from_minutes(normalize_tz_offset_minutes(q.tz_offset_minutes));
    let day_start = local_day_start_utc(OffsetDateTime::now_utc(), tz_offset);
    let since = day_start.format(&Rfc3339).unwrap_or_default();

    let sessions = {
        let conn = state.conn.lock().await;
        match list_completed_sessions_since(&conn, user, &since) {
            Ok(v) => v,
            Err(err) => return db_error("list_completed_sessions_since", err),
        }
    };

    ok_response(compute_today_stats(&sessions, day_start))
}

async fn post_schedule_generate(Json(payload): Json<Value>) -> Response {
    let req: ScheduleRequest = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let schedule = generate_schedule(
        req.work_schedule.as_deref().unwrap_or(""),
        req.extra_activities.as_deref().unwrap_or(""),
        req.goals.as_deref().unwrap_or(""),
    );
    ok_response(ScheduleResponse { schedule })
}

async fn get_habits(State(state): State<AppState>, Query(q): Query<UserQuery>) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn.lock().await;
    match list_habits(&conn, user) {
        Ok(habits) => ok_response(habits),
        Err(err) => db_error("list_habits", err),
    }
}

fn validate_habit(
    title: &str,
    schedule: &str,
    reminder_minutes: i64,
) -> Result<(), &'static str> {
    if title.trim().is_empty() {
        return Err("invalid_title");
    }
    if schedule.trim().is_empty() {
        return Err("invalid_schedule");
    }
    if reminder_minutes < 0 {
        return Err("invalid_reminder_minutes");
    }
    Ok(())
}

async fn post_habit(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
    Json(payload): Json<Value>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let h: HabitCreate = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(code) = validate_habit(&h.title, &h.schedule, h.reminder_minutes) {
        return err_response(StatusCode::BAD_REQUEST, code);
    }

    let created_at = now_rfc3339();
    let conn = state.conn.lock().await;
    match insert_habit(&conn, user, &h, &created_at) {
        Ok(habit) => ok_response(habit),
        Err(err) => db_error("insert_habit", err),
    }
}

async fn post_habits_bulk(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
    Json(payload): Json<Value>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req: BulkHabitsRequest = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    // Validate everything up front so a bad item leaves no rows behind.
    for s in &req.schedule {
        if let Err(code) = validate_habit(&s.title, &s.schedule, DEFAULT_REMINDER_MINUTES) {
            return err_response(StatusCode::BAD_REQUEST, code);
        }
    }
    let habits: Vec<HabitCreate> = req.schedule.iter().map(habit_from_suggestion).collect();

    let created_at = now_rfc3339();
    let mut conn = state.conn.lock().await;
    match insert_habits_bulk(&mut conn, user, &habits, &created_at) {
        Ok(created) => {
            info!(user, count = created.len(), "habits created from schedule");
            ok_response(created)
        }
        Err(err) => db_error("insert_habits_bulk", err),
    }
}

async fn put_habit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(payload): Json<Value>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let u: HabitUpdate = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let conn = state.conn.lock().await;
    let mut habit = match get_habit(&conn, user, id) {
        Ok(Some(h)) => h,
        Ok(None) => return err_response(StatusCode::NOT_FOUND, "not_found"),
        Err(err) => return db_error("get_habit", err),
    };

    if let Some(v) = u.title {
        habit.title = v.trim().to_string();
    }
    if let Some(v) = u.description {
        habit.description = Some(v);
    }
    if let Some(v) = u.schedule {
        habit.schedule = v;
    }
    if let Some(v) = u.reminder_minutes {
        habit.reminder_minutes = v;
    }
    if let Some(v) = u.is_active {
        habit.is_active = v;
    }
    if let Err(code) = validate_habit(&habit.title, &habit.schedule, habit.reminder_minutes) {
        return err_response(StatusCode::BAD_REQUEST, code);
    }

    match update_habit(&conn, &habit) {
        Ok(()) => ok_response(habit),
        Err(err) => db_error("update_habit", err),
    }
}

async fn delete_habit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn.lock().await;
    match delete_owned(&conn, "habits", user, id) {
        Ok(0) => err_response(StatusCode::NOT_FOUND, "not_found"),
        Ok(_) => ok_response(DeleteResult { deleted: true }),
        Err(err) => db_error("delete_habit", err),
    }
}

fn validate_app_limit(
    app_name: &str,
    app_icon: &str,
    daily_limit_minutes: i64,
    used_minutes_today: i64,
) -> Result<(), &'static str> {
    if app_name.trim().is_empty() {
        return Err("invalid_app_name");
    }
    if app_icon.trim().is_empty() {
        return Err("invalid_app_icon");
    }
    if daily_limit_minutes <= 0 {
        return Err("invalid_daily_limit_minutes");
    }
    if used_minutes_today < 0 {
        return Err("invalid_used_minutes_today");
    }
    Ok(())
}

async fn get_app_limits(State(state): State<AppState>, Query(q): Query<UserQuery>) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn.lock().await;
    match list_app_limits(&conn, user) {
        Ok(limits) => ok_response(limits),
        Err(err) => db_error("list_app_limits", err),
    }
}

async fn post_app_limit(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
    Json(payload): Json<Value>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let a: AppLimitCreate = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Err(code) = validate_app_limit(
        &a.app_name,
        &a.app_icon,
        a.daily_limit_minutes,
        a.used_minutes_today,
    ) {
        return err_response(StatusCode::BAD_REQUEST, code);
    }

    let conn = state.conn.lock().await;
    match insert_app_limit(&conn, user, &a) {
        Ok(limit) => ok_response(limit),
        Err(err) => db_error("insert_app_limit", err),
    }
}

async fn put_app_limit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<UserQuery>,
    Json(payload): Json<Value>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let u: AppLimitUpdate = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let conn = state.conn.lock().await;
    let mut limit = match get_app_limit(&conn, user, id) {
        Ok(Some(a)) => a,
        Ok(None) => return err_response(StatusCode::NOT_FOUND, "not_found"),
        Err(err) => return db_error("get_app_limit", err),
    };

    if let Some(v) = u.app_name {
        limit.app_name = v;
    }
    if let Some(v) = u.app_icon {
        limit.app_icon = v;
    }
    if let Some(v) = u.daily_limit_minutes {
        limit.daily_limit_minutes = v;
    }
    if let Some(v) = u.used_minutes_today {
        limit.used_minutes_today = v;
    }
    if let Some(v) = u.is_active {
        limit.is_active = v;
    }
    if let Err(code) = validate_app_limit(
        &limit.app_name,
        &limit.app_icon,
        limit.daily_limit_minutes,
        limit.used_minutes_today,
    ) {
        return err_response(StatusCode::BAD_REQUEST, code);
    }

    match update_app_limit(&conn, &limit) {
        Ok(()) => ok_response(limit),
        Err(err) => db_error("update_app_limit", err),
    }
}

async fn delete_app_limit(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn.lock().await;
    match delete_owned(&conn, "app_limits", user, id) {
        Ok(0) => err_response(StatusCode::NOT_FOUND, "not_found"),
        Ok(_) => ok_response(DeleteResult { deleted: true }),
        Err(err) => db_error("delete_app_limit", err),
    }
}

async fn get_journal_entries(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn.lock().await;
    match list_journal_entries(&conn, user) {
        Ok(entries) => ok_response(entries),
        Err(err) => db_error("list_journal_entries", err),
    }
}

async fn post_journal_entry(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
    Json(payload): Json<Value>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let e: JournalEntryCreate = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let content = e.content.trim();
    if content.is_empty() {
        return err_response(StatusCode::BAD_REQUEST, "invalid_content");
    }

    let created_at = now_rfc3339();
    let conn = state.conn.lock().await;
    match insert_journal_entry(&conn, user, content, &created_at) {
        Ok(entry) => ok_response(entry),
        Err(err) => db_error("insert_journal_entry", err),
    }
}

async fn delete_journal_entry(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(q): Query<UserQuery>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn.lock().await;
    match delete_owned(&conn, "journal_entries", user, id) {
        Ok(0) => err_response(StatusCode::NOT_FOUND, "not_found"),
        Ok(_) => ok_response(DeleteResult { deleted: true }),
        Err(err) => db_error("delete_journal_entry", err),
    }
}

async fn get_settings(State(state): State<AppState>, Query(q): Query<UserQuery>) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let conn = state.conn.lock().await;
    match load_timer_settings(&conn, user) {
        Ok(settings) => ok_response(settings.unwrap_or_default()),
        Err(err) => db_error("load_timer_settings", err),
    }
}

async fn post_settings(
    State(state): State<AppState>,
    Query(q): Query<UserQuery>,
    Json(payload): Json<Value>,
) -> Response {
    let user = match require_user(q.user) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let req: TimerSettingsUpdate = match parse_body(payload) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if let Some(focus_seconds) = req.focus_seconds {
        if focus_seconds <= 0 {
            return err_response(StatusCode::BAD_REQUEST, "invalid_focus_seconds");
        }
    }
    if let Some(break_seconds) = req.break_seconds {
        if break_seconds <= 0 {
            return err_response(StatusCode::BAD_REQUEST, "invalid_break_seconds");
        }
    }

    let conn = state.conn.lock().await;
    let mut settings = match load_timer_settings(&conn, user) {
        Ok(v) => v.unwrap_or_default(),
        Err(err) => return db_error("load_timer_settings", err),
    };
    if let Some(v) = req.focus_seconds {
        settings.focus_seconds = v;
    }
    if let Some(v) = req.break_seconds {
        settings.break_seconds = v;
    }
    if let Some(v) = req.sound_enabled {
        settings.sound_enabled = v;
    }

    match upsert_timer_settings(&conn, user, settings, &now_rfc3339()) {
        Ok(()) => ok_response(settings),
        Err(err) => db_error("upsert_timer_settings", err),
    }
}

fn init_db(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS timer_sessions (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  type TEXT NOT NULL CHECK (type IN ('focus', 'break')),
  duration INTEGER NOT NULL CHECK (duration >= 0),
  completed INTEGER NOT NULL DEFAULT 0,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_timer_sessions_user ON timer_sessions(user_id, created_at);

CREATE TABLE IF NOT EXISTS habits (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  title TEXT NOT NULL,
  description TEXT,
  schedule TEXT NOT NULL,
  reminder_minutes INTEGER NOT NULL DEFAULT 20,
  is_active INTEGER NOT NULL DEFAULT 1,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_habits_user ON habits(user_id);

CREATE TABLE IF NOT EXISTS app_limits (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  app_name TEXT NOT NULL,
  app_icon TEXT NOT NULL,
  daily_limit_minutes INTEGER NOT NULL,
  used_minutes_today INTEGER NOT NULL DEFAULT 0,
  is_active INTEGER NOT NULL DEFAULT 1
);
CREATE INDEX IF NOT EXISTS idx_app_limits_user ON app_limits(user_id);

CREATE TABLE IF NOT EXISTS journal_entries (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  user_id INTEGER NOT NULL,
  content TEXT NOT NULL,
  created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_journal_entries_user ON journal_entries(user_id, created_at);

CREATE TABLE IF NOT EXISTS timer_settings (
  user_id INTEGER PRIMARY KEY,
  focus_seconds INTEGER NOT NULL,
  break_seconds INTEGER NOT NULL,
  sound_enabled INTEGER NOT NULL DEFAULT 1,
  updated_at TEXT NOT NULL
);
"#,
    )
}

fn session_from_row(row: &Row) -> rusqlite::Result<TimerSession> {
    let kind: String = row.get(2)?;
    let completed: i64 = row.get(4)?;
    Ok(TimerSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        kind: SessionType::parse(&kind).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                rusqlite::types::Type::Text,
                format!("unknown session type '{kind}'").into(),
            )
        })?,
        duration: row.get(3)?,
        completed: completed != 0,
        created_at: row.get(5)?,
    })
}

fn insert_session(
    conn: &Connection,
    user: i64,
    s: &NewSession,
    created_at: &str,
) -> rusqlite::Result<TimerSession> {
    conn.execute(
        "INSERT INTO timer_sessions (user_id, type, duration, completed, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        (user, s.kind.as_str(), s.duration, s.completed as i64, created_at),
    )?;
    Ok(TimerSession {
        id: conn.last_insert_rowid(),
        user_id: user,
        kind: s.kind,
        duration: s.duration,
        completed: s.completed,
        created_at: created_at.to_string(),
    })
}

fn list_sessions(conn: &Connection, user: i64) -> rusqlite::Result<Vec<TimerSession>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, type, duration, completed, created_at FROM timer_sessions WHERE user_id = ?1 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map([user], session_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn list_completed_sessions_since(
    conn: &Connection,
    user: i64,
    since: &str,
) -> rusqlite::Result<Vec<TimerSession>> {
    let mut stmt = conn.prepare(
        "SELECT id, user_id, type, duration, completed, created_at FROM timer_sessions WHERE user_id = ?1 AND completed = 1 AND created_at >= ?2 ORDER BY created_at ASC, id ASC",
    )?;
    let rows = stmt.query_map((user, since), session_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn habit_from_suggestion(s: &ScheduleSuggestion) -> HabitCreate {
    HabitCreate {
        title: s.title.clone(),
        description: Some(String::new()),
        schedule: serde_json::json!({
            "type": "text",
            "value": s.schedule,
            "color": s.color,
        })
        .to_string(),
        reminder_minutes: DEFAULT_REMINDER_MINUTES,
        is_active: true,
    }
}

fn habit_from_row(row: &Row) -> rusqlite::Result<Habit> {
    let is_active: i64 = row.get(6)?;
    Ok(Habit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        schedule: row.get(4)?,
        reminder_minutes: row.get(5)?,
        is_active: is_active != 0,
        created_at: row.get(7)?,
    })
}

const HABIT_COLUMNS: &str =
    "id, user_id, title, description, schedule, reminder_minutes, is_active, created_at";

fn insert_habit(
    conn: &Connection,
    user: i64,
    h: &HabitCreate,
    created_at: &str,
) -> rusqlite::Result<Habit> {
    conn.execute(
        r#"
INSERT INTO habits (user_id, title, description, schedule, reminder_minutes, is_active, created_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
"#,
        (
            user,
            h.title.trim(),
            h.description.as_deref(),
            &h.schedule,
            h.reminder_minutes,
            h.is_active as i64,
            created_at,
        ),
    )?;
    Ok(Habit {
        id: conn.last_insert_rowid(),
        user_id: user,
        title: h.title.trim().to_string(),
        description: h.description.clone(),
        schedule: h.schedule.clone(),
        reminder_minutes: h.reminder_minutes,
        is_active: h.is_active,
        created_at: created_at.to_string(),
    })
}

fn insert_habits_bulk(
    conn: &mut Connection,
    user: i64,
    habits: &[HabitCreate],
    created_at: &str,
) -> rusqlite::Result<Vec<Habit>> {
    let tx = conn.transaction()?;
    let mut out = Vec::with_capacity(habits.len());
    for h in habits {
        out.push(insert_habit(&tx, user, h, created_at)?);
    }
    tx.commit()?;
    Ok(out)
}

fn list_habits(conn: &Connection, user: i64) -> rusqlite::Result<Vec<Habit>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {HABIT_COLUMNS} FROM habits WHERE user_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([user], habit_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn get_habit(conn: &Connection, user: i64, id: i64) -> rusqlite::Result<Option<Habit>> {
    conn.query_row(
        &format!("SELECT {HABIT_COLUMNS} FROM habits WHERE id = ?1 AND user_id = ?2"),
        (id, user),
        habit_from_row,
    )
    .optional()
}

fn update_habit(conn: &Connection, h: &Habit) -> rusqlite::Result<()> {
    conn.execute(
        r#"
UPDATE habits SET
  title = ?1,
  description = ?2,
  schedule = ?3,
  reminder_minutes = ?4,
  is_active = ?5
WHERE id = ?6 AND user_id = ?7
"#,
        (
            &h.title,
            h.description.as_deref(),
            &h.schedule,
            h.reminder_minutes,
            h.is_active as i64,
            h.id,
            h.user_id,
        ),
    )?;
    Ok(())
}

/// Deletes one row owned by `user`. `table` is always a compile-time constant.
fn delete_owned(conn: &Connection, table: &'static str, user: i64, id: i64) -> rusqlite::Result<usize> {
    conn.execute(
        &format!("DELETE FROM {table} WHERE id = ?1 AND user_id = ?2"),
        (id, user),
    )
}

fn app_limit_from_row(row: &Row) -> rusqlite::Result<AppLimit> {
    let is_active: i64 = row.get(6)?;
    Ok(AppLimit {
        id: row.get(0)?,
        user_id: row.get(1)?,
        app_name: row.get(2)?,
        app_icon: row.get(3)?,
        daily_limit_minutes: row.get(4)?,
        used_minutes_today: row.get(5)?,
        is_active: is_active != 0,
    })
}

const APP_LIMIT_COLUMNS: &str =
    "id, user_id, app_name, app_icon, daily_limit_minutes, used_minutes_today, is_active";

fn insert_app_limit(conn: &Connection, user: i64, a: &AppLimitCreate) -> rusqlite::Result<AppLimit> {
    conn.execute(
        r#"
INSERT INTO app_limits (user_id, app_name, app_icon, daily_limit_minutes, used_minutes_today, is_active)
VALUES (?1, ?2, ?3, ?4, ?5, ?6)
"#,
        (
            user,
            a.app_name.trim(),
            &a.app_icon,
            a.daily_limit_minutes,
            a.used_minutes_today,
            a.is_active as i64,
        ),
    )?;
    Ok(AppLimit {
        id: conn.last_insert_rowid(),
        user_id: user,
        app_name: a.app_name.trim().to_string(),
        app_icon: a.app_icon.clone(),
        daily_limit_minutes: a.daily_limit_minutes,
        used_minutes_today: a.used_minutes_today,
        is_active: a.is_active,
    })
}

fn list_app_limits(conn: &Connection, user: i64) -> rusqlite::Result<Vec<AppLimit>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {APP_LIMIT_COLUMNS} FROM app_limits WHERE user_id = ?1 ORDER BY id ASC"
    ))?;
    let rows = stmt.query_map([user], app_limit_from_row)?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn get_app_limit(conn: &Connection, user: i64, id: i64) -> rusqlite::Result<Option<AppLimit>> {
    conn.query_row(
        &format!("SELECT {APP_LIMIT_COLUMNS} FROM app_limits WHERE id = ?1 AND user_id = ?2"),
        (id, user),
        app_limit_from_row,
    )
    .optional()
}

fn update_app_limit(conn: &Connection, a: &AppLimit) -> rusqlite::Result<()> {
    conn.execute(
        r#"
UPDATE app_limits SET
  app_name = ?1,
  app_icon = ?2,
  daily_limit_minutes = ?3,
  used_minutes_today = ?4,
  is_active = ?5
WHERE id = ?6 AND user_id = ?7
"#,
        (
            &a.app_name,
            &a.app_icon,
            a.daily_limit_minutes,
            a.used_minutes_today,
            a.is_active as i64,
            a.id,
            a.user_id,
        ),
    )?;
    Ok(())
}

fn insert_journal_entry(
    conn: &Connection,
    user: i64,
    content: &str,
    created_at: &str,
) -> rusqlite::Result<JournalEntry> {
    conn.execute(
        "INSERT INTO journal_entries (user_id, content, created_at) VALUES (?1, ?2, ?3)",
        (user, content, created_at),
    )?;
    Ok(JournalEntry {
        id: conn.last_insert_rowid(),
        user_id: user,
        content: content.to_string(),
        created_at: created_at.to_string(),
    })
}

fn list_journal_entries(conn: &Connection, user: i64) -> rusqlite::Result<Vec<JournalEntry>> {
    // Newest first; id breaks ties between entries written in the same instant.
    let mut stmt = conn.prepare(
        "SELECT id, user_id, content, created_at FROM journal_entries WHERE user_id = ?1 ORDER BY created_at DESC, id DESC",
    )?;
    let rows = stmt.query_map([user], |row| {
        Ok(JournalEntry {
            id: row.get(0)?,
            user_id: row.get(1)?,
            content: row.get(2)?,
            created_at: row.get(3)?,
        })
    })?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok(out)
}

fn load_timer_settings(conn: &Connection, user: i64) -> rusqlite::Result<Option<TimerSettings>> {
    conn.query_row(
        "SELECT focus_seconds, break_seconds, sound_enabled FROM timer_settings WHERE user_id = ?1",
        [user],
        |row| {
            let sound_enabled: i64 = row.get(2)?;
            Ok(TimerSettings {
                focus_seconds: row.get::<_, i64>(0)?.max(1),
                break_seconds: row.get::<_, i64>(1)?.max(1),
                sound_enabled: sound_enabled != 0,
            })
        },
    )
    .optional()
}

fn upsert_timer_settings(
    conn: &Connection,
    user: i64,
    settings: TimerSettings,
    updated_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        r#"
INSERT INTO timer_settings (user_id, focus_seconds, break_seconds, sound_enabled, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5)
ON CONFLICT(user_id) DO UPDATE SET
  focus_seconds=excluded.focus_seconds,
  break_seconds=excluded.break_seconds,
  sound_enabled=excluded.sound_enabled,
  updated_at=excluded.updated_at
        "#,
        (
            user,
            settings.focus_seconds,
            settings.break_seconds,
            settings.sound_enabled as i64,
            updated_at,
        ),
    )?;
    Ok(())
}

fn normalize_tz_offset_minutes(v: Option<i32>) -> i32 {
    v.unwrap_or(0)
        .clamp(TZ_OFFSET_MINUTES_MIN, TZ_OFFSET_MINUTES_MAX)
}

fn tz_offset_from_minutes(minutes: i32) -> time::UtcOffset {
    time::UtcOffset::from_whole_seconds(minutes.saturating_mul(60))
        .unwrap_or(time::UtcOffset::UTC)
}

/// Midnight of `now`'s calendar day in `tz_offset`, expressed in UTC.
fn local_day_start_utc(now: OffsetDateTime, tz_offset: time::UtcOffset) -> OffsetDateTime {
    now.to_offset(tz_offset)
        .replace_time(time::Time::MIDNIGHT)
        .to_offset(time::UtcOffset::UTC)
}

/// Each session contributes `floor(duration / 60)` minutes; totals saturate.
fn compute_today_stats(sessions: &[TimerSession], day_start: OffsetDateTime) -> TodayStats {
    let mut focus_minutes = 0i64;
    let mut break_minutes = 0i64;
    let mut focus_sessions = 0i64;

    for s in sessions {
        if !s.completed {
            continue;
        }
        let Ok(created_at) = OffsetDateTime::parse(&s.created_at, &Rfc3339) else {
            continue;
        };
        if created_at < day_start {
            continue;
        }
        let minutes = s.duration / 60;
        match s.kind {
            SessionType::Focus => {
                focus_minutes = focus_minutes.saturating_add(minutes);
                focus_sessions = focus_sessions.saturating_add(1);
            }
            SessionType::Break => break_minutes = break_minutes.saturating_add(minutes),
        }
    }

    TodayStats {
        focus_minutes,
        break_minutes,
        sessions: focus_sessions,
    }
}

fn generate_schedule(
    work_schedule: &str,
    extra_activities: &str,
    goals: &str,
) -> Vec<ScheduleSuggestion> {
    let mut out = Vec::new();

    let work = work_schedule.trim();
    if !work.is_empty() {
        out.push(ScheduleSuggestion {
            title: WORK_TITLE.to_string(),
            schedule: work.to_string(),
            color: WORK_COLOR.to_string(),
        });
    }

    let extra = extra_activities.trim();
    if !extra.is_empty() {
        out.push(ScheduleSuggestion {
            title: EXTRA_TITLE.to_string(),
            schedule: extra.to_string(),
            color: EXTRA_COLOR.to_string(),
        });
    }

    let goals = goals.to_lowercase();
    for rule in GOAL_RULES {
        if rule.keywords.iter().any(|k| goals.contains(k)) {
            out.push(ScheduleSuggestion {
                title: rule.title.to_string(),
                schedule: rule.schedule.to_string(),
                color: rule.color.to_string(),
            });
        }
    }

    out
}
