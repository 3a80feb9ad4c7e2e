use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::{
    admin::{agents, examples, faqs, organisations, partners, quotes, sessions, upload_body_limit, users},
    auth::{self, SessionKeys},
    config::{Config, ConfigError, StorageConfig},
    db,
    email::mailer_from_config,
    error::ApiError,
    generation,
    llm::LlmClient,
    logging::init_logging,
    public, realtime,
    realtime::EventHub,
    storage::{content_type_for_key, read_local_object, LocalStorage, ObjectStorage, S3Storage, StorageError},
    types::AppState,
    whatsapp::{self, WhatsAppClient},
};

pub fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

pub fn slugify(value: &str) -> String {
    let mut slug = value
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>();
    while slug.contains("--") {
        slug = slug.replace("--", "-");
    }
    slug.trim_matches('-').to_string()
}

pub fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

lazy_static! {
    static ref EMAIL: Option<Regex> = Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").ok();
}

pub fn is_valid_email(value: &str) -> bool {
    value.len() <= 254 && EMAIL.as_ref().is_some_and(|re| re.is_match(value))
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to connect to postgres: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to run migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("failed to set up storage: {0}")]
    Storage(#[from] StorageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

/// Serves objects written by [`LocalStorage`]; S3 objects are served by the bucket.
async fn serve_media(Path(key): Path<String>, State(state): State<Arc<AppState>>) -> Response {
    let StorageConfig::Local { dir } = &state.config.storage else {
        return ApiError::not_found("media not found").into_response();
    };
    match read_local_object(dir, &key).await {
        Ok(Some(bytes)) => (
            [
                (header::CONTENT_TYPE, HeaderValue::from_static(content_type_for_key(&key))),
                (header::CACHE_CONTROL, HeaderValue::from_static("public, max-age=300")),
                (header::X_CONTENT_TYPE_OPTIONS, HeaderValue::from_static("nosniff")),
                (
                    header::CONTENT_SECURITY_POLICY,
                    HeaderValue::from_static("default-src 'none'; img-src 'self'; style-src 'unsafe-inline'"),
                ),
            ],
            bytes,
        )
            .into_response(),
        Ok(None) => ApiError::not_found("media not found").into_response(),
        Err(StorageError::InvalidKey(_)) => ApiError::bad_request("invalid media key").into_response(),
        Err(err) => {
            warn!(%key, error = %err, "unable to read media");
            (StatusCode::INTERNAL_SERVER_ERROR, "unable to read media").into_response()
        }
    }
}

pub async fn build_storage(
    http: &reqwest::Client,
    config: &Config,
) -> Result<Arc<dyn ObjectStorage>, StartupError> {
    Ok(match &config.storage {
        StorageConfig::S3(s3) => Arc::new(S3Storage::new(http.clone(), s3.clone())?),
        StorageConfig::Local { dir } => {
            tokio::fs::create_dir_all(dir).await?;
            Arc::new(LocalStorage::new(dir.clone(), &config.public_base_url))
        }
    })
}

/// Wires every client around an existing pool; nothing here touches the network.
pub fn build_state(
    config: Config,
    db: sqlx::PgPool,
    http: reqwest::Client,
    storage: Arc<dyn ObjectStorage>,
) -> AppState {
    AppState {
        session_keys: SessionKeys::new(&config.jwt_secret, config.session_ttl_hours),
        mailer: mailer_from_config(http.clone(), &config.email),
        llm: LlmClient::new(http.clone(), config.llm.clone()),
        whatsapp: WhatsAppClient::new(http.clone(), config.whatsapp.clone()),
        events: EventHub::new(),
        storage,
        http,
        db,
        config,
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/media/{*key}", get(serve_media))
        .route("/api/auth/request-otp", post(auth::request_otp))
        .route("/api/auth/verify-otp", post(auth::verify_otp))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/me", get(auth::me))
        .route("/api/events", get(realtime::events_stream))
        .route("/api/generate-conversation", post(generation::generate_conversation))
        .route("/api/public/faqs", get(public::published_faqs))
        .route("/api/public/branding", get(public::branding))
        .route("/api/public/contact", post(public::contact))
        .route(
            "/api/whatsapp/webhook",
            get(whatsapp::webhook_verify).post(whatsapp::webhook_event),
        )
        .route(
            "/api/admin/organisations",
            get(organisations::list_organisations).post(organisations::create_organisation),
        )
        .route(
            "/api/admin/organisations/{org_id}",
            get(organisations::get_organisation)
                .patch(organisations::update_organisation)
                .delete(organisations::delete_organisation),
        )
        .route(
            "/api/admin/partners",
            get(partners::list_partners).post(partners::create_partner),
        )
        .route(
            "/api/admin/partners/{partner_id}",
            get(partners::get_partner)
                .patch(partners::update_partner)
                .delete(partners::delete_partner),
        )
        .route(
            "/api/admin/partners/{partner_id}/logo",
            post(partners::upload_partner_logo).layer(upload_body_limit(partners::MAX_LOGO_BYTES)),
        )
        .route("/api/admin/agents", get(agents::list_agents).post(agents::create_agent))
        .route(
            "/api/admin/agents/{agent_id}",
            get(agents::get_agent)
                .patch(agents::update_agent)
                .delete(agents::delete_agent),
        )
        .route(
            "/api/admin/agents/{agent_id}/avatar",
            post(agents::upload_agent_avatar).layer(upload_body_limit(agents::MAX_AVATAR_BYTES)),
        )
        .route(
            "/api/admin/agents/{agent_id}/generate-description",
            post(generation::generate_agent_description),
        )
        .route(
            "/api/admin/agents/{agent_id}/whatsapp/connect",
            post(whatsapp::connect_agent_whatsapp),
        )
        .route(
            "/api/admin/agents/{agent_id}/examples",
            get(examples::list_examples).post(examples::create_example),
        )
        .route(
            "/api/admin/agents/{agent_id}/examples/{example_id}",
            delete(examples::delete_example),
        )
        .route(
            "/api/admin/whatsapp/{waba_id}/phone-numbers",
            get(whatsapp::list_waba_phone_numbers),
        )
        .route("/api/admin/faqs", get(faqs::list_faqs).post(faqs::create_faq))
        .route("/api/admin/faqs/reorder", post(faqs::reorder_faqs))
        .route("/api/admin/faqs/generate", post(generation::generate_faq_answer))
        .route(
            "/api/admin/faqs/{faq_id}",
            axum::routing::patch(faqs::update_faq).delete(faqs::delete_faq),
        )
        .route("/api/admin/quotes", get(quotes::list_quotes).post(quotes::create_quote))
        .route(
            "/api/admin/quotes/{quote_id}",
            get(quotes::get_quote)
                .patch(quotes::update_quote)
                .delete(quotes::delete_quote),
        )
        .route("/api/admin/quotes/{quote_id}/render", post(quotes::render_quote))
        .route("/api/admin/quotes/{quote_id}/send", post(quotes::send_quote))
        .route("/api/admin/users", get(users::list_users).post(users::create_user))
        .route(
            "/api/admin/users/{user_id}",
            get(users::get_user)
                .patch(users::update_user)
                .delete(users::delete_user),
        )
        .route("/api/admin/sessions", get(sessions::list_sessions))
        .route(
            "/api/admin/sessions/{session_id}",
            get(sessions::get_session).delete(sessions::delete_session),
        )
        .route("/api/admin/sessions/{session_id}/close", post(sessions::close_session))
        .route(
            "/api/admin/sessions/{session_id}/messages",
            get(sessions::list_messages).post(sessions::send_operator_reply),
        )
        .route(
            "/api/admin/sessions/{session_id}/messages/{message_id}",
            delete(sessions::delete_message),
        )
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&state.config))
        .with_state(state)
}

/// Credentialed CORS for the configured front-end origin; permissive in development.
fn cors_layer(config: &Config) -> CorsLayer {
    let Some(origin) = config
        .cors_origin
        .as_deref()
        .and_then(|origin| HeaderValue::from_str(origin).ok())
    else {
        return CorsLayer::permissive();
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            axum::http::Method::GET,
            axum::http::Method::POST,
            axum::http::Method::PATCH,
            axum::http::Method::DELETE,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "unable to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

pub async fn run() -> Result<(), StartupError> {
    let config = Config::from_env()?;
    init_logging(config.log_format, "agenthub_server=info,tower_http=info");

    let db = db::connect(&config.database_url).await?;
    db::migrate(&db).await?;

    let http = reqwest::Client::new();
    let storage = build_storage(&http, &config).await?;
    let port = config.port;
    let state = Arc::new(build_state(config, db, http, storage));
    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "agenthub server listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}
