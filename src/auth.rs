//! Email one-time-password sign-in and JWT session cookies.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderValue},
    response::IntoResponse,
    Json,
};
use bcrypt::{hash, verify};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    app::{is_valid_email, normalize_email, now_iso},
    email::{EmailMessage, Mailer},
    error::{success, ApiError, ApiResult},
    prompting::{render_otp_email, OtpEmailContext},
    types::{parse_admin_user_row, AdminUser, AppState, RequestOtpBody, VerifyOtpBody},
};

pub const SESSION_COOKIE: &str = "agenthub_session";
const OTP_HASH_COST: u32 = 8;
const OTP_REQUESTS_PER_WINDOW: i64 = 5;
const OTP_REQUEST_WINDOW_MINUTES: i64 = 15;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

pub struct SessionKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: ChronoDuration,
}

impl SessionKeys {
    pub fn new(secret: &str, ttl_hours: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            ttl: ChronoDuration::hours(ttl_hours),
        }
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl.num_seconds()
    }

    pub fn issue(&self, user: &AdminUser) -> Result<String, jsonwebtoken::errors::Error> {
        self.issue_at(user, Utc::now())
    }

    fn issue_at(
        &self,
        user: &AdminUser,
        now: DateTime<Utc>,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: user.id.clone(),
            email: user.email.clone(),
            role: user.role.as_str().to_string(),
            iat: now.timestamp(),
            exp: (now + self.ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Claims, jsonwebtoken::errors::Error> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<Claims>(token, &self.decoding, &validation).map(|data| data.claims)
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

fn cookie_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// The session token from the cookie, falling back to an `Authorization: Bearer` header.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    cookie_token(headers).or_else(|| bearer_token(headers))
}

pub fn session_cookie(token: &str, max_age_seconds: i64, secure: bool) -> String {
    let mut cookie =
        format!("{SESSION_COOKIE}={token}; Path=/; HttpOnly; SameSite=Lax; Max-Age={max_age_seconds}");
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

pub fn clear_session_cookie(secure: bool) -> String {
    session_cookie("", 0, secure)
}

/// Resolves the signed-in admin. The user row is reloaded so role changes and
/// deactivation take effect before the token expires.
pub async fn authenticate(state: &Arc<AppState>, headers: &HeaderMap) -> Result<AdminUser, ApiError> {
    let token = session_token(headers).ok_or_else(|| ApiError::unauthorized("not signed in"))?;
    let claims = state
        .session_keys
        .verify(&token)
        .map_err(|_| ApiError::unauthorized("invalid or expired session"))?;

    let row = sqlx::query("SELECT * FROM admin_users WHERE id = $1")
        .bind(&claims.sub)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::unauthorized("account no longer exists"))?;
    let user = parse_admin_user_row(&row);
    if !user.active {
        return Err(ApiError::unauthorized("account disabled"));
    }
    Ok(user)
}

pub fn generate_otp_code() -> String {
    let code: u32 = rand::thread_rng().gen_range(0..1_000_000);
    format!("{code:06}")
}

#[derive(Debug, PartialEq, Eq)]
pub enum OtpCheck {
    Valid,
    Expired,
    TooManyAttempts,
    Mismatch,
}

pub fn check_otp(
    code: &str,
    code_hash: &str,
    attempts: i32,
    expires_at: &str,
    max_attempts: i32,
    now: DateTime<Utc>,
) -> OtpCheck {
    let expired = DateTime::parse_from_rfc3339(expires_at)
        .map(|at| at.with_timezone(&Utc) <= now)
        .unwrap_or(true);
    if expired {
        return OtpCheck::Expired;
    }
    if attempts >= max_attempts {
        return OtpCheck::TooManyAttempts;
    }
    let normalized = code.trim();
    if normalized.len() != 6 || !normalized.chars().all(|c| c.is_ascii_digit()) {
        return OtpCheck::Mismatch;
    }
    if verify(normalized, code_hash).unwrap_or(false) {
        OtpCheck::Valid
    } else {
        OtpCheck::Mismatch
    }
}

pub fn otp_request_allowed(recent_requests: i64) -> bool {
    recent_requests < OTP_REQUESTS_PER_WINDOW
}

/// Emails the code. Failures are logged only, so the response never differs
/// between known and unknown addresses.
pub async fn deliver_otp(mailer: &dyn Mailer, email: &str, code: &str, ttl_minutes: i64) -> bool {
    let (html, text) = render_otp_email(&OtpEmailContext { code, ttl_minutes });
    let message = EmailMessage {
        to: email.to_string(),
        subject: "Your sign-in code".to_string(),
        html,
        text,
    };
    match mailer.send(message).await {
        Ok(()) => true,
        Err(err) => {
            warn!(error = %err, "unable to send sign-in code");
            false
        }
    }
}

/// Rate limited per email address whether or not an account exists; the
/// response is otherwise identical for every well-formed address.
pub async fn request_otp(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RequestOtpBody>,
) -> ApiResult {
    let email = normalize_email(&body.email);
    if !is_valid_email(&email) {
        return Err(ApiError::bad_request("a valid email is required"));
    }

    let now = Utc::now();
    let window_start = (now - ChronoDuration::minutes(OTP_REQUEST_WINDOW_MINUTES)).to_rfc3339();
    let recent = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM otp_requests WHERE email = $1 AND created_at > $2",
    )
    .bind(&email)
    .bind(&window_start)
    .fetch_one(&state.db)
    .await?;
    if !otp_request_allowed(recent) {
        return Err(ApiError::TooManyRequests(
            "too many codes requested, try again later".to_string(),
        ));
    }
    sqlx::query("INSERT INTO otp_requests (id, email, created_at) VALUES ($1,$2,$3)")
        .bind(Uuid::new_v4().to_string())
        .bind(&email)
        .bind(now.to_rfc3339())
        .execute(&state.db)
        .await?;

    let active = sqlx::query_scalar::<_, bool>("SELECT active FROM admin_users WHERE email = $1")
        .bind(&email)
        .fetch_optional(&state.db)
        .await?
        .unwrap_or(false);
    if !active {
        info!("otp requested for unknown or inactive account");
        return Ok(success(json!({ "sent": true })));
    }

    let code = generate_otp_code();
    let code_hash = hash(&code, OTP_HASH_COST)
        .map_err(|err| ApiError::Internal(format!("unable to hash otp: {err}")))?;
    let expires_at = (now + ChronoDuration::minutes(state.config.otp_ttl_minutes)).to_rfc3339();

    sqlx::query("UPDATE otp_codes SET used = true WHERE email = $1 AND used = false")
        .bind(&email)
        .execute(&state.db)
        .await?;
    sqlx::query(
        "INSERT INTO otp_codes (id, email, code_hash, attempts, expires_at, used, created_at) VALUES ($1,$2,$3,0,$4,false,$5)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(&email)
    .bind(&code_hash)
    .bind(&expires_at)
    .bind(now.to_rfc3339())
    .execute(&state.db)
    .await?;

    deliver_otp(state.mailer.as_ref(), &email, &code, state.config.otp_ttl_minutes).await;
    Ok(success(json!({ "sent": true })))
}

pub async fn verify_otp(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyOtpBody>,
) -> ApiResult {
    let email = normalize_email(&body.email);
    if !is_valid_email(&email) || body.code.trim().is_empty() {
        return Err(ApiError::bad_request("email and code are required"));
    }

    let row = sqlx::query(
        "SELECT id, code_hash, attempts, expires_at FROM otp_codes \
         WHERE email = $1 AND used = false ORDER BY created_at DESC LIMIT 1",
    )
    .bind(&email)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::unauthorized("invalid or expired code"))?;
    let otp_id: String = row.get("id");
    let code_hash: String = row.get("code_hash");
    let attempts: i32 = row.get("attempts");
    let expires_at: String = row.get("expires_at");

    match check_otp(
        &body.code,
        &code_hash,
        attempts,
        &expires_at,
        state.config.otp_max_attempts,
        Utc::now(),
    ) {
        OtpCheck::Valid => {}
        OtpCheck::Mismatch => {
            sqlx::query("UPDATE otp_codes SET attempts = attempts + 1 WHERE id = $1")
                .bind(&otp_id)
                .execute(&state.db)
                .await?;
            return Err(ApiError::unauthorized("invalid or expired code"));
        }
        OtpCheck::Expired | OtpCheck::TooManyAttempts => {
            sqlx::query("UPDATE otp_codes SET used = true WHERE id = $1")
                .bind(&otp_id)
                .execute(&state.db)
                .await?;
            return Err(ApiError::unauthorized("invalid or expired code"));
        }
    }

    // Single use: only the request that flips `used` may sign in.
    let consumed = sqlx::query("UPDATE otp_codes SET used = true WHERE id = $1 AND used = false")
        .bind(&otp_id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if consumed == 0 {
        return Err(ApiError::unauthorized("invalid or expired code"));
    }

    let row = sqlx::query("UPDATE admin_users SET last_login_at = $1 WHERE email = $2 AND active = true RETURNING *")
        .bind(now_iso())
        .bind(&email)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::unauthorized("account disabled"))?;
    let user = parse_admin_user_row(&row);

    let token = state
        .session_keys
        .issue(&user)
        .map_err(|err| ApiError::Internal(format!("unable to sign session: {err}")))?;
    let cookie = session_cookie(
        &token,
        state.session_keys.ttl_seconds(),
        state.config.cookie_secure,
    );
    let cookie = HeaderValue::from_str(&cookie)
        .map_err(|err| ApiError::Internal(format!("invalid cookie header: {err}")))?;

    info!(user_id = %user.id, "admin signed in");
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "success": true, "data": { "user": user, "token": token } })),
    )
        .into_response())
}

pub async fn logout(State(state): State<Arc<AppState>>) -> ApiResult {
    let cookie = HeaderValue::from_str(&clear_session_cookie(state.config.cookie_secure))
        .map_err(|err| ApiError::Internal(format!("invalid cookie header: {err}")))?;
    Ok((
        [(header::SET_COOKIE, cookie)],
        Json(json!({ "success": true, "data": null })),
    )
        .into_response())
}

pub async fn me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    match authenticate(&state, &headers).await {
        Ok(user) => Ok(success(user)),
        Err(err) => {
            warn!(error = %err, "session lookup failed");
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permissions::Role;

    const SECRET: &str = "test-secret-test-secret-test-secret";

    struct FailingMailer;

    #[async_trait::async_trait]
    impl Mailer for FailingMailer {
        async fn send(&self, _message: EmailMessage) -> Result<(), crate::email::EmailError> {
            Err(crate::email::EmailError::Rejected {
                status: 503,
                body: "down".into(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingMailer(parking_lot::Mutex<Vec<EmailMessage>>);

    #[async_trait::async_trait]
    impl Mailer for RecordingMailer {
        async fn send(&self, message: EmailMessage) -> Result<(), crate::email::EmailError> {
            self.0.lock().push(message);
            Ok(())
        }
    }

    #[tokio::test]
    async fn otp_delivery_failure_is_swallowed() {
        assert!(!deliver_otp(&FailingMailer, "ana@example.com", "123456", 10).await);

        let mailer = RecordingMailer::default();
        assert!(deliver_otp(&mailer, "ana@example.com", "123456", 10).await);
        let sent = mailer.0.lock();
        assert_eq!(sent[0].to, "ana@example.com");
        assert!(sent[0].text.contains("123456"));
    }

    #[test]
    fn otp_requests_are_limited_per_window() {
        assert!(otp_request_allowed(0));
        assert!(otp_request_allowed(OTP_REQUESTS_PER_WINDOW - 1));
        assert!(!otp_request_allowed(OTP_REQUESTS_PER_WINDOW));
    }

    fn admin() -> AdminUser {
        AdminUser {
            id: "user-1".into(),
            email: "ops@example.com".into(),
            full_name: "Ops".into(),
            role: Role::SuperAdmin,
            partner_id: None,
            organisation_id: None,
            active: true,
            created_at: String::new(),
            updated_at: String::new(),
            last_login_at: String::new(),
        }
    }

    #[test]
    fn session_tokens_round_trip() {
        let keys = SessionKeys::new(SECRET, 24);
        let token = keys.issue(&admin()).unwrap();
        let claims = keys.verify(&token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.role, "super_admin");
        assert_eq!(claims.exp - claims.iat, 24 * 3600);
    }

    #[test]
    fn tokens_from_other_secrets_are_rejected() {
        let token = SessionKeys::new(SECRET, 24).issue(&admin()).unwrap();
        let other = SessionKeys::new("another-secret-another-secret-xx", 24);
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let keys = SessionKeys::new(SECRET, 1);
        let token = keys
            .issue_at(&admin(), Utc::now() - ChronoDuration::hours(3))
            .unwrap();
        assert!(keys.verify(&token).is_err());
    }

    #[test]
    fn otp_codes_are_six_digits() {
        for _ in 0..50 {
            let code = generate_otp_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn otp_check_covers_every_outcome() {
        let code_hash = hash("123456", 4).unwrap();
        let now = Utc::now();
        let later = (now + ChronoDuration::minutes(5)).to_rfc3339();
        let earlier = (now - ChronoDuration::minutes(5)).to_rfc3339();

        assert_eq!(check_otp("123456", &code_hash, 0, &later, 5, now), OtpCheck::Valid);
        assert_eq!(check_otp(" 123456 ", &code_hash, 0, &later, 5, now), OtpCheck::Valid);
        assert_eq!(check_otp("654321", &code_hash, 0, &later, 5, now), OtpCheck::Mismatch);
        assert_eq!(check_otp("12345", &code_hash, 0, &later, 5, now), OtpCheck::Mismatch);
        assert_eq!(check_otp("123456", &code_hash, 0, &earlier, 5, now), OtpCheck::Expired);
        assert_eq!(
            check_otp("123456", &code_hash, 5, &later, 5, now),
            OtpCheck::TooManyAttempts
        );
        assert_eq!(check_otp("123456", &code_hash, 0, "garbage", 5, now), OtpCheck::Expired);
    }

    #[test]
    fn session_token_prefers_cookie_over_bearer() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        assert_eq!(session_token(&headers).as_deref(), Some("from-header"));

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; agenthub_session=from-cookie"),
        );
        assert_eq!(session_token(&headers).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn cookies_are_http_only_and_optionally_secure() {
        let cookie = session_cookie("abc", 60, true);
        assert!(cookie.starts_with("agenthub_session=abc;"));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.ends_with("; Secure"));
        assert!(!clear_session_cookie(false).contains("Secure"));
        assert!(clear_session_cookie(false).contains("Max-Age=0"));
    }
}
