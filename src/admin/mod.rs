//! Back-office CRUD handlers. Every handler authenticates, checks the
//! permission predicate for the operation, then queries the database directly.

pub mod agents;
pub mod examples;
pub mod faqs;
pub mod organisations;
pub mod partners;
pub mod quotes;
pub mod sessions;
pub mod users;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Multipart};

use crate::{
    error::ApiError,
    permissions::can_access_organisation,
    types::{
        parse_agent_row, parse_chat_session_row, parse_organisation_row, AdminUser, Agent,
        AppState, ChatSession, Organisation,
    },
};

pub const SCOPE_FILTER_SQL: &str =
    "($1::text IS NULL OR o.partner_id = $1) AND ($2::text IS NULL OR o.id = $2)";

pub fn require(allowed: bool, message: &str) -> Result<(), ApiError> {
    if allowed {
        Ok(())
    } else {
        Err(ApiError::forbidden(message))
    }
}

/// Trimmed value, or an error naming the field when it is empty.
pub fn required_text(value: &str, field: &str) -> Result<String, ApiError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request(format!("{field} is required")));
    }
    Ok(trimmed.to_string())
}

pub async fn load_organisation(state: &Arc<AppState>, org_id: &str) -> Result<Organisation, ApiError> {
    let row = sqlx::query("SELECT * FROM organisations WHERE id = $1")
        .bind(org_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("organisation not found"))?;
    Ok(parse_organisation_row(&row))
}

/// Organisations outside the caller's scope are reported as missing.
pub async fn load_accessible_organisation(
    state: &Arc<AppState>,
    user: &AdminUser,
    org_id: &str,
) -> Result<Organisation, ApiError> {
    let org = load_organisation(state, org_id).await?;
    if !can_access_organisation(user, &org.id, org.partner_id.as_deref()) {
        return Err(ApiError::not_found("organisation not found"));
    }
    Ok(org)
}

pub async fn load_accessible_agent(
    state: &Arc<AppState>,
    user: &AdminUser,
    agent_id: &str,
) -> Result<(Agent, Organisation), ApiError> {
    let row = sqlx::query("SELECT * FROM agents WHERE id = $1")
        .bind(agent_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("agent not found"))?;
    let agent = parse_agent_row(&row);
    let org = load_organisation(state, &agent.organisation_id).await?;
    if !can_access_organisation(user, &org.id, org.partner_id.as_deref()) {
        return Err(ApiError::not_found("agent not found"));
    }
    Ok((agent, org))
}

pub async fn load_accessible_session(
    state: &Arc<AppState>,
    user: &AdminUser,
    session_id: &str,
) -> Result<(ChatSession, Agent, Organisation), ApiError> {
    let row = sqlx::query("SELECT * FROM chat_sessions WHERE id = $1")
        .bind(session_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("session not found"))?;
    let session = parse_chat_session_row(&row);
    let (agent, org) = load_accessible_agent(state, user, &session.agent_id)
        .await
        .map_err(|err| match err {
            ApiError::NotFound(_) => ApiError::not_found("session not found"),
            other => other,
        })?;
    Ok((session, agent, org))
}

/// Room for multipart framing around the file.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

/// Request body limit for an upload route whose file may be `max_file_bytes`.
pub fn upload_body_limit(max_file_bytes: usize) -> DefaultBodyLimit {
    DefaultBodyLimit::max(max_file_bytes + MULTIPART_OVERHEAD)
}

pub struct Upload {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

/// Reads the first `file` field of a multipart body.
pub async fn read_image_upload(mut multipart: Multipart, max_bytes: usize) -> Result<Upload, ApiError> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("invalid multipart body: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_ascii_lowercase();
        if !content_type.starts_with("image/") {
            return Err(ApiError::bad_request("only image uploads are accepted"));
        }
        let bytes = field
            .bytes()
            .await
            .map_err(|err| ApiError::bad_request(format!("unable to read upload: {err}")))?;
        if bytes.is_empty() {
            return Err(ApiError::bad_request("uploaded file is empty"));
        }
        if bytes.len() > max_bytes {
            return Err(ApiError::bad_request(format!(
                "file exceeds {} bytes",
                max_bytes
            )));
        }
        return Ok(Upload {
            bytes: bytes.to_vec(),
            content_type,
        });
    }
    Err(ApiError::bad_request("multipart field 'file' is required"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{header, Request, StatusCode},
        routing::post,
        Router,
    };
    use tower::ServiceExt;

    const LIMIT: usize = 5 * 1024 * 1024;

    async fn upload_size(multipart: Multipart) -> Result<String, ApiError> {
        let upload = read_image_upload(multipart, LIMIT).await?;
        Ok(upload.bytes.len().to_string())
    }

    fn image_request(size: usize) -> Request<Body> {
        let boundary = "agenthub-upload";
        let mut body = format!(
            "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.png\"\r\n\
             Content-Type: image/png\r\n\r\n"
        )
        .into_bytes();
        body.extend(std::iter::repeat(7u8).take(size));
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        Request::builder()
            .method("POST")
            .uri("/upload")
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn uploads_above_the_default_body_limit_are_accepted() {
        let app = Router::new().route("/upload", post(upload_size).layer(upload_body_limit(LIMIT)));
        let size = 3 * 1024 * 1024;
        let response = app.oneshot(image_request(size)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, size.to_string().as_bytes());
    }

    #[tokio::test]
    async fn uploads_over_the_file_limit_are_rejected() {
        let app = Router::new().route("/upload", post(upload_size).layer(upload_body_limit(LIMIT)));
        let response = app.oneshot(image_request(LIMIT + 1)).await.unwrap();
        assert!(response.status().is_client_error(), "{}", response.status());
    }

    #[test]
    fn required_text_trims_and_rejects_blank() {
        assert_eq!(required_text("  Acme ", "name").unwrap(), "Acme");
        let err = required_text("   ", "name").unwrap_err();
        assert_eq!(err.to_string(), "name is required");
    }

    #[test]
    fn require_maps_to_forbidden() {
        assert!(require(true, "nope").is_ok());
        assert!(matches!(require(false, "nope"), Err(ApiError::Forbidden(_))));
    }
}
