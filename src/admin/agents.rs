use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use super::{
    load_accessible_agent, load_accessible_organisation, read_image_upload, require,
    required_text, SCOPE_FILTER_SQL,
};
use crate::{
    app::now_iso,
    auth::authenticate,
    error::{created, success, ApiError, ApiResult},
    permissions::{can_delete_org_content, organisation_scope},
    storage::extension_for_content_type,
    types::{parse_agent_row, Agent, AppState, CreateAgentBody, ListQuery, Page, UpdateAgentBody},
};

pub const MAX_AVATAR_BYTES: usize = 5 * 1024 * 1024;
pub const AGENT_STATUSES: [&str; 3] = ["draft", "active", "paused"];

fn validate_status(status: &str) -> Result<String, ApiError> {
    let status = status.trim().to_ascii_lowercase();
    if AGENT_STATUSES.contains(&status.as_str()) {
        Ok(status)
    } else {
        Err(ApiError::bad_request("status must be draft, active or paused"))
    }
}

/// BCP 47-ish tag such as `en` or `pt-BR`; blank falls back to `en`.
fn normalize_language(value: Option<&str>) -> Result<String, ApiError> {
    let value = value.map(str::trim).unwrap_or("");
    if value.is_empty() {
        return Ok("en".to_string());
    }
    let valid = value.len() <= 10
        && value
            .split('-')
            .all(|part| !part.is_empty() && part.chars().all(|c| c.is_ascii_alphanumeric()));
    if !valid {
        return Err(ApiError::bad_request("language must be a language tag like en or pt-BR"));
    }
    Ok(value.to_string())
}

pub async fn list_agents(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (partner_bind, org_bind) = organisation_scope(&user).binds();
    let pattern = query.like_pattern();
    let filter = format!(
        "{SCOPE_FILTER_SQL} AND (a.name ILIKE $3 OR a.description ILIKE $3) \
         AND ($4::text IS NULL OR a.organisation_id = $4) AND ($5::text IS NULL OR a.status = $5)"
    );

    let total = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(1) FROM agents a JOIN organisations o ON o.id = a.organisation_id WHERE {filter}"
    ))
    .bind(&partner_bind)
    .bind(&org_bind)
    .bind(&pattern)
    .bind(&query.organisation_id)
    .bind(&query.status)
    .fetch_one(&state.db)
    .await?;
    let rows = sqlx::query(&format!(
        "SELECT a.* FROM agents a JOIN organisations o ON o.id = a.organisation_id WHERE {filter} \
         ORDER BY a.created_at DESC LIMIT $6 OFFSET $7"
    ))
    .bind(&partner_bind)
    .bind(&org_bind)
    .bind(&pattern)
    .bind(&query.organisation_id)
    .bind(&query.status)
    .bind(query.page_size())
    .bind(query.offset())
    .fetch_all(&state.db)
    .await?;

    let items = rows.iter().map(parse_agent_row).collect::<Vec<_>>();
    Ok(success(Page::new(items, total, &query)))
}

pub async fn get_agent(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (agent, org) = load_accessible_agent(&state, &user, &agent_id).await?;
    let open_sessions = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM chat_sessions WHERE agent_id = $1 AND status = 'open'",
    )
    .bind(&agent.id)
    .fetch_one(&state.db)
    .await?;
    Ok(success(json!({
        "agent": agent,
        "organisation": org,
        "openSessions": open_sessions
    })))
}

pub async fn create_agent(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAgentBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let org = load_accessible_organisation(&state, &user, &body.organisation_id).await?;

    let now = now_iso();
    let agent = Agent {
        id: Uuid::new_v4().to_string(),
        organisation_id: org.id.clone(),
        name: required_text(&body.name, "name")?,
        description: body.description.trim().to_string(),
        system_prompt: body.system_prompt.trim().to_string(),
        language: normalize_language(body.language.as_deref())?,
        status: "draft".to_string(),
        avatar_url: String::new(),
        waba_id: String::new(),
        phone_number_id: String::new(),
        display_phone_number: String::new(),
        created_at: now.clone(),
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO agents (id, organisation_id, name, description, system_prompt, language, status, \
         avatar_url, waba_id, phone_number_id, display_phone_number, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,'','','','',$8,$9)",
    )
    .bind(&agent.id)
    .bind(&agent.organisation_id)
    .bind(&agent.name)
    .bind(&agent.description)
    .bind(&agent.system_prompt)
    .bind(&agent.language)
    .bind(&agent.status)
    .bind(&agent.created_at)
    .bind(&agent.updated_at)
    .execute(&state.db)
    .await?;

    info!(agent_id = %agent.id, organisation_id = %org.id, by = %user.id, "agent created");
    Ok(created(agent))
}

pub async fn update_agent(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateAgentBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (mut agent, _) = load_accessible_agent(&state, &user, &agent_id).await?;

    if let Some(name) = body.name.as_deref() {
        agent.name = required_text(name, "name")?;
    }
    if let Some(description) = body.description.as_deref() {
        agent.description = description.trim().to_string();
    }
    if let Some(prompt) = body.system_prompt.as_deref() {
        agent.system_prompt = prompt.trim().to_string();
    }
    if body.language.is_some() {
        agent.language = normalize_language(body.language.as_deref())?;
    }
    if let Some(status) = body.status.as_deref() {
        agent.status = validate_status(status)?;
    }
    agent.updated_at = now_iso();

    sqlx::query(
        "UPDATE agents SET name = $1, description = $2, system_prompt = $3, language = $4, status = $5, \
         updated_at = $6 WHERE id = $7",
    )
    .bind(&agent.name)
    .bind(&agent.description)
    .bind(&agent.system_prompt)
    .bind(&agent.language)
    .bind(&agent.status)
    .bind(&agent.updated_at)
    .bind(&agent.id)
    .execute(&state.db)
    .await?;
    Ok(success(agent))
}

pub async fn delete_agent(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (agent, org) = load_accessible_agent(&state, &user, &agent_id).await?;
    require(
        can_delete_org_content(&user, &org.id, org.partner_id.as_deref()),
        "you cannot delete agents",
    )?;
    sqlx::query("DELETE FROM agents WHERE id = $1")
        .bind(&agent.id)
        .execute(&state.db)
        .await?;
    if let Some(key) = avatar_key_from_url(&agent) {
        if let Err(err) = state.storage.delete(&key).await {
            warn!(agent_id = %agent.id, error = %err, "unable to delete avatar");
        }
    }
    info!(agent_id = %agent.id, by = %user.id, "agent deleted");
    Ok(success(json!({ "id": agent.id })))
}

/// Storage key of the current avatar, recovered from the stored public URL.
fn avatar_key_from_url(agent: &Agent) -> Option<String> {
    let prefix = format!("agents/{}/", agent.id);
    let start = agent.avatar_url.find(&prefix)?;
    Some(agent.avatar_url[start..].to_string())
}

pub async fn upload_agent_avatar(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (agent, _) = load_accessible_agent(&state, &user, &agent_id).await?;
    let upload = read_image_upload(multipart, MAX_AVATAR_BYTES).await?;
    let ext = extension_for_content_type(&upload.content_type)
        .ok_or_else(|| ApiError::bad_request("unsupported image type"))?;
    let key = format!("agents/{}/avatar.{ext}", agent.id);
    let url = state
        .storage
        .put(&key, upload.bytes, &upload.content_type)
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;

    // A new extension leaves the previous object orphaned.
    if let Some(old_key) = avatar_key_from_url(&agent).filter(|old| *old != key) {
        if let Err(err) = state.storage.delete(&old_key).await {
            warn!(agent_id = %agent.id, error = %err, "unable to delete previous avatar");
        }
    }

    sqlx::query("UPDATE agents SET avatar_url = $1, updated_at = $2 WHERE id = $3")
        .bind(&url)
        .bind(now_iso())
        .bind(&agent.id)
        .execute(&state.db)
        .await?;
    Ok(success(json!({ "avatarUrl": url })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statuses_are_limited() {
        assert_eq!(validate_status(" Active ").unwrap(), "active");
        assert!(validate_status("archived").is_err());
    }

    #[test]
    fn languages_default_to_english() {
        assert_eq!(normalize_language(None).unwrap(), "en");
        assert_eq!(normalize_language(Some("  ")).unwrap(), "en");
        assert_eq!(normalize_language(Some("pt-BR")).unwrap(), "pt-BR");
        assert!(normalize_language(Some("en_US!")).is_err());
        assert!(normalize_language(Some("-en")).is_err());
    }

    #[test]
    fn avatar_key_is_recovered_from_public_url() {
        let mut agent = Agent {
            id: "a1".into(),
            organisation_id: "o1".into(),
            name: "Bella".into(),
            description: String::new(),
            system_prompt: String::new(),
            language: "en".into(),
            status: "draft".into(),
            avatar_url: "https://cdn.example.com/bucket/agents/a1/avatar.png".into(),
            waba_id: String::new(),
            phone_number_id: String::new(),
            display_phone_number: String::new(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        assert_eq!(avatar_key_from_url(&agent).as_deref(), Some("agents/a1/avatar.png"));
        agent.avatar_url.clear();
        assert_eq!(avatar_key_from_url(&agent), None);
    }
}
