//! Unauthenticated endpoints backing the marketing site.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    Json,
};
use serde_json::json;
use tracing::info;

use crate::{
    admin::{partners::branding_for_host, required_text},
    app::{is_valid_email, normalize_email},
    email::EmailMessage,
    error::{success, ApiError, ApiResult},
    prompting::{render_contact_email, ContactEmailContext},
    types::{parse_faq_row, AppState, ContactFormBody},
};

const MAX_CONTACT_MESSAGE_CHARS: usize = 5000;

pub async fn published_faqs(State(state): State<Arc<AppState>>) -> ApiResult {
    let rows = sqlx::query("SELECT * FROM faqs WHERE published = true ORDER BY position ASC, created_at ASC")
        .fetch_all(&state.db)
        .await?;
    let items = rows.iter().map(parse_faq_row).collect::<Vec<_>>();
    Ok(success(items))
}

/// Forwarded host wins over `Host` when running behind a proxy.
fn request_host(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-host")
        .or_else(|| headers.get(header::HOST))
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .unwrap_or("")
        .trim()
        .to_string()
}

pub async fn branding(State(state): State<Arc<AppState>>, headers: HeaderMap) -> ApiResult {
    let branding = branding_for_host(&state, &request_host(&headers)).await?;
    Ok(success(branding))
}

struct ContactRequest {
    name: String,
    email: String,
    company: String,
    message: String,
}

fn validate_contact(body: &ContactFormBody) -> Result<ContactRequest, ApiError> {
    let name = required_text(&body.name, "name")?;
    let email = normalize_email(&body.email);
    if !is_valid_email(&email) {
        return Err(ApiError::bad_request("a valid email is required"));
    }
    let message = required_text(&body.message, "message")?;
    if message.chars().count() > MAX_CONTACT_MESSAGE_CHARS {
        return Err(ApiError::bad_request(format!(
            "message is limited to {MAX_CONTACT_MESSAGE_CHARS} characters"
        )));
    }
    Ok(ContactRequest {
        name,
        email,
        company: body.company.trim().to_string(),
        message,
    })
}

pub async fn contact(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ContactFormBody>,
) -> ApiResult {
    let request = validate_contact(&body)?;
    let (html, text) = render_contact_email(&ContactEmailContext {
        name: &request.name,
        email: &request.email,
        company: &request.company,
        message: &request.message,
    });
    state
        .mailer
        .send(EmailMessage {
            to: state.config.email.sales_inbox.clone(),
            subject: format!("Contact request from {}", request.name),
            html,
            text,
        })
        .await
        .map_err(|err| ApiError::Upstream(format!("unable to deliver message: {err}")))?;
    info!(from = %request.email, "contact request forwarded");
    Ok(success(json!({ "sent": true })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn form(name: &str, email: &str, message: &str) -> ContactFormBody {
        ContactFormBody {
            name: name.into(),
            email: email.into(),
            company: "  Acme ".into(),
            message: message.into(),
        }
    }

    #[test]
    fn contact_form_is_validated() {
        let ok = validate_contact(&form(" Ana ", " Ana@Acme.test", " Hello ")).unwrap();
        assert_eq!(ok.name, "Ana");
        assert_eq!(ok.email, "ana@acme.test");
        assert_eq!(ok.company, "Acme");
        assert_eq!(ok.message, "Hello");

        assert!(validate_contact(&form("", "ana@acme.test", "hi")).is_err());
        assert!(validate_contact(&form("Ana", "nope", "hi")).is_err());
        assert!(validate_contact(&form("Ana", "ana@acme.test", " ")).is_err());
        let long = "x".repeat(MAX_CONTACT_MESSAGE_CHARS + 1);
        assert!(validate_contact(&form("Ana", "ana@acme.test", &long)).is_err());
    }

    #[test]
    fn forwarded_host_takes_precedence() {
        let mut headers = HeaderMap::new();
        headers.insert(header::HOST, HeaderValue::from_static("internal:8080"));
        assert_eq!(request_host(&headers), "internal:8080");
        headers.insert("x-forwarded-host", HeaderValue::from_static("bots.reseller.com, proxy"));
        assert_eq!(request_host(&headers), "bots.reseller.com");
        assert_eq!(request_host(&HeaderMap::new()), "");
    }
}
