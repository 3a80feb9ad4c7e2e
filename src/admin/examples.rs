use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;
use sqlx::Row;

use super::{load_accessible_agent, required_text};
use crate::{
    app::now_iso,
    auth::authenticate,
    error::{created, success, ApiError, ApiResult},
    types::{parse_example_row, AppState, ConversationTurn, CreateExampleBody, Example},
};

pub const MAX_EXAMPLE_TURNS: usize = 40;

/// Lower-cases roles, trims content and rejects anything but `user`/`assistant` text turns.
pub fn validate_conversation(turns: &[ConversationTurn]) -> Result<Vec<ConversationTurn>, ApiError> {
    if turns.is_empty() {
        return Err(ApiError::bad_request("conversation must not be empty"));
    }
    if turns.len() > MAX_EXAMPLE_TURNS {
        return Err(ApiError::bad_request(format!(
            "conversation is limited to {MAX_EXAMPLE_TURNS} messages"
        )));
    }
    turns
        .iter()
        .map(|turn| {
            let role = turn.role.trim().to_ascii_lowercase();
            if role != "user" && role != "assistant" {
                return Err(ApiError::bad_request("conversation roles must be user or assistant"));
            }
            let content = turn.content.trim();
            if content.is_empty() {
                return Err(ApiError::bad_request("conversation messages need content"));
            }
            Ok(ConversationTurn {
                role,
                content: content.to_string(),
            })
        })
        .collect()
}

/// Inserts a validated example for an agent whose access was already checked.
pub async fn insert_example(
    state: &Arc<AppState>,
    agent_id: &str,
    title: &str,
    conversation: Vec<ConversationTurn>,
) -> Result<Example, ApiError> {
    let example = Example {
        id: uuid::Uuid::new_v4().to_string(),
        agent_id: agent_id.to_string(),
        title: title.to_string(),
        conversation,
        created_at: now_iso(),
    };
    let encoded = serde_json::to_string(&example.conversation)
        .map_err(|err| ApiError::Internal(format!("unable to encode conversation: {err}")))?;
    sqlx::query("INSERT INTO examples (id, agent_id, title, conversation, created_at) VALUES ($1,$2,$3,$4,$5)")
        .bind(&example.id)
        .bind(&example.agent_id)
        .bind(&example.title)
        .bind(&encoded)
        .bind(&example.created_at)
        .execute(&state.db)
        .await?;
    Ok(example)
}

pub async fn list_examples(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (agent, _) = load_accessible_agent(&state, &user, &agent_id).await?;
    let rows = sqlx::query("SELECT * FROM examples WHERE agent_id = $1 ORDER BY created_at DESC")
        .bind(&agent.id)
        .fetch_all(&state.db)
        .await?;
    let items = rows.iter().map(parse_example_row).collect::<Vec<_>>();
    Ok(success(items))
}

pub async fn create_example(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateExampleBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (agent, _) = load_accessible_agent(&state, &user, &agent_id).await?;
    let title = required_text(&body.title, "title")?;
    let conversation = validate_conversation(&body.conversation)?;
    let example = insert_example(&state, &agent.id, &title, conversation).await?;
    Ok(created(example))
}

pub async fn delete_example(
    Path((agent_id, example_id)): Path<(String, String)>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (agent, _) = load_accessible_agent(&state, &user, &agent_id).await?;
    let row = sqlx::query("DELETE FROM examples WHERE id = $1 AND agent_id = $2 RETURNING id")
        .bind(&example_id)
        .bind(&agent.id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("example not found"))?;
    let id: String = row.get("id");
    Ok(success(json!({ "id": id })))
}
