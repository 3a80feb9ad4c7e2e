//! Chat sessions and their messages, as seen by operators in the back office.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{load_accessible_session, require, required_text, SCOPE_FILTER_SQL};
use crate::{
    app::now_iso,
    auth::authenticate,
    error::{created, success, ApiError, ApiResult},
    permissions::{can_delete_org_content, is_super_admin, organisation_scope},
    realtime::emit_to_organisation_admins,
    types::{
        parse_chat_message_row, parse_chat_session_row, AppState, ChatMessage, ListQuery,
        OperatorReplyBody, Page,
    },
};

pub const SESSION_OPEN: &str = "open";
pub const SESSION_CLOSED: &str = "closed";
pub const MAX_REPLY_CHARS: usize = 4096;

/// Stores a message and bumps the session's `last_message_at`.
pub async fn store_message(
    state: &Arc<AppState>,
    session_id: &str,
    role: &str,
    content: &str,
    wa_message_id: &str,
) -> Result<ChatMessage, ApiError> {
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        session_id: session_id.to_string(),
        role: role.to_string(),
        content: content.to_string(),
        wa_message_id: wa_message_id.to_string(),
        created_at: now_iso(),
    };
    let mut tx = state.db.begin().await?;
    sqlx::query(
        "INSERT INTO chat_messages (id, session_id, role, content, wa_message_id, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(&message.id)
    .bind(&message.session_id)
    .bind(&message.role)
    .bind(&message.content)
    .bind(&message.wa_message_id)
    .bind(&message.created_at)
    .execute(&mut *tx)
    .await?;
    sqlx::query("UPDATE chat_sessions SET last_message_at = $1 WHERE id = $2")
        .bind(&message.created_at)
        .bind(session_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(message)
}

fn validate_reply(text: &str) -> Result<String, ApiError> {
    let text = required_text(text, "text")?;
    if text.chars().count() > MAX_REPLY_CHARS {
        return Err(ApiError::bad_request(format!(
            "replies are limited to {MAX_REPLY_CHARS} characters"
        )));
    }
    Ok(text)
}

pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (partner_bind, org_bind) = organisation_scope(&user).binds();
    let pattern = query.like_pattern();
    let from = "FROM chat_sessions s JOIN agents a ON a.id = s.agent_id \
                JOIN organisations o ON o.id = a.organisation_id";
    let filter = format!(
        "{SCOPE_FILTER_SQL} AND (s.contact_name ILIKE $3 OR s.contact_wa_id ILIKE $3) \
         AND ($4::text IS NULL OR s.agent_id = $4) AND ($5::text IS NULL OR s.status = $5)"
    );

    let total = sqlx::query_scalar::<_, i64>(&format!("SELECT COUNT(1) {from} WHERE {filter}"))
        .bind(&partner_bind)
        .bind(&org_bind)
        .bind(&pattern)
        .bind(&query.agent_id)
        .bind(&query.status)
        .fetch_one(&state.db)
        .await?;
    let rows = sqlx::query(&format!(
        "SELECT s.* {from} WHERE {filter} ORDER BY s.last_message_at DESC LIMIT $6 OFFSET $7"
    ))
    .bind(&partner_bind)
    .bind(&org_bind)
    .bind(&pattern)
    .bind(&query.agent_id)
    .bind(&query.status)
    .bind(query.page_size())
    .bind(query.offset())
    .fetch_all(&state.db)
    .await?;

    let items = rows.iter().map(parse_chat_session_row).collect::<Vec<_>>();
    Ok(success(Page::new(items, total, &query)))
}

pub async fn get_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (session, agent, _) = load_accessible_session(&state, &user, &session_id).await?;
    let rows = sqlx::query("SELECT * FROM chat_messages WHERE session_id = $1 ORDER BY created_at ASC")
        .bind(&session.id)
        .fetch_all(&state.db)
        .await?;
    let messages = rows.iter().map(parse_chat_message_row).collect::<Vec<_>>();
    Ok(success(json!({
        "session": session,
        "agent": { "id": agent.id, "name": agent.name },
        "messages": messages
    })))
}

pub async fn close_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (mut session, _, org) = load_accessible_session(&state, &user, &session_id).await?;
    if session.status != SESSION_CLOSED {
        sqlx::query("UPDATE chat_sessions SET status = $1 WHERE id = $2")
            .bind(SESSION_CLOSED)
            .bind(&session.id)
            .execute(&state.db)
            .await?;
        session.status = SESSION_CLOSED.to_string();
        emit_to_organisation_admins(&state, &org.id, "session.updated", &json!(session)).await;
    }
    Ok(success(session))
}

pub async fn delete_session(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (session, _, org) = load_accessible_session(&state, &user, &session_id).await?;
    require(
        can_delete_org_content(&user, &org.id, org.partner_id.as_deref()),
        "you cannot delete chat sessions",
    )?;
    sqlx::query("DELETE FROM chat_sessions WHERE id = $1")
        .bind(&session.id)
        .execute(&state.db)
        .await?;
    emit_to_organisation_admins(
        &state,
        &org.id,
        "session.updated",
        &json!({ "id": session.id, "deleted": true }),
    )
    .await;
    info!(session_id = %session.id, by = %user.id, "chat session deleted");
    Ok(success(json!({ "id": session.id })))
}

pub async fn list_messages(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (session, _, _) = load_accessible_session(&state, &user, &session_id).await?;
    let rows = sqlx::query("SELECT * FROM chat_messages WHERE session_id = $1 ORDER BY created_at ASC")
        .bind(&session.id)
        .fetch_all(&state.db)
        .await?;
    let items = rows.iter().map(parse_chat_message_row).collect::<Vec<_>>();
    Ok(success(items))
}

/// Operator reply: relayed over WhatsApp when the agent has a number, always stored.
pub async fn send_operator_reply(
    Path(session_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OperatorReplyBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (session, agent, org) = load_accessible_session(&state, &user, &session_id).await?;
    if session.status == SESSION_CLOSED {
        return Err(ApiError::Conflict("session is closed".to_string()));
    }
    let text = validate_reply(&body.text)?;

    let wa_message_id = if agent.phone_number_id.is_empty() {
        String::new()
    } else if state.whatsapp.is_configured() {
        state
            .whatsapp
            .send_text(&agent.phone_number_id, &session.contact_wa_id, &text)
            .await
            .map_err(|err| ApiError::Upstream(format!("unable to deliver reply: {err}")))?
    } else {
        warn!(agent_id = %agent.id, "whatsapp not configured, reply stored only");
        String::new()
    };

    let message = store_message(&state, &session.id, "operator", &text, &wa_message_id).await?;
    emit_to_organisation_admins(&state, &org.id, "message.created", &json!(message)).await;
    Ok(created(message))
}

pub async fn delete_message(
    Path((session_id, message_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can delete messages")?;
    let (session, _, _) = load_accessible_session(&state, &user, &session_id).await?;
    let deleted = sqlx::query("DELETE FROM chat_messages WHERE id = $1 AND session_id = $2")
        .bind(&message_id)
        .bind(&session.id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("message not found"));
    }
    Ok(success(json!({ "id": message_id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_are_trimmed_and_bounded() {
        assert_eq!(validate_reply("  on my way ").unwrap(), "on my way");
        assert!(validate_reply("   ").is_err());
        assert!(validate_reply(&"x".repeat(MAX_REPLY_CHARS)).is_ok());
        assert!(validate_reply(&"x".repeat(MAX_REPLY_CHARS + 1)).is_err());
    }
}
