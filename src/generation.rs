//! LLM-backed drafting: example conversations, FAQ answers and agent descriptions.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::{
    admin::{examples::insert_example, load_accessible_agent, require, required_text},
    auth::authenticate,
    error::{success, ApiError, ApiResult},
    llm::LlmError,
    permissions::is_super_admin,
    prompting::{
        render_agent_description_prompt, render_conversation_system_prompt,
        render_conversation_user_prompt, render_faq_answer_prompt, ConversationPromptContext,
    },
    types::{AppState, ConversationTurn, GenerateConversationBody, GenerateFaqBody},
};

pub const DEFAULT_TURNS: usize = 8;
pub const MIN_TURNS: usize = 2;
pub const MAX_TURNS: usize = 20;

const CONVERSATION_TEMPERATURE: f32 = 0.8;
const FAQ_TEMPERATURE: f32 = 0.3;
const DESCRIPTION_TEMPERATURE: f32 = 0.5;

pub fn clamp_turns(turns: Option<usize>) -> usize {
    turns.unwrap_or(DEFAULT_TURNS).clamp(MIN_TURNS, MAX_TURNS)
}

fn canonical_role(role: &str) -> Option<&'static str> {
    match role.trim().to_ascii_lowercase().as_str() {
        "user" | "customer" | "client" | "human" | "contact" => Some("user"),
        "assistant" | "agent" | "bot" | "ai" | "chatbot" => Some("assistant"),
        _ => None,
    }
}

fn turns_from_array(items: &[Value]) -> Option<Vec<ConversationTurn>> {
    let turns = items
        .iter()
        .map(|item| {
            let role = canonical_role(item.get("role")?.as_str()?)?;
            let content = item
                .get("content")
                .or_else(|| item.get("text"))?
                .as_str()?
                .trim();
            if content.is_empty() {
                return None;
            }
            Some(ConversationTurn {
                role: role.to_string(),
                content: content.to_string(),
            })
        })
        .collect::<Option<Vec<_>>>()?;
    if turns.is_empty() {
        None
    } else {
        Some(turns)
    }
}

/// Reads the conversation out of a model reply. Accepts a bare JSON array, one
/// wrapped in a code fence or surrounded by prose, or an object holding the
/// array under `conversation`/`messages`. Every turn must have a known role and
/// non-empty content.
pub fn parse_conversation(raw: &str) -> Option<Vec<ConversationTurn>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let mut candidates = vec![trimmed.to_string()];
    if trimmed.starts_with("```") {
        let stripped = trimmed
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
        if !stripped.is_empty() {
            candidates.push(stripped.to_string());
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('['), trimmed.rfind(']')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }
    if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if end > start {
            candidates.push(trimmed[start..=end].to_string());
        }
    }

    for candidate in candidates {
        let Ok(parsed) = serde_json::from_str::<Value>(&candidate) else {
            continue;
        };
        let items = match &parsed {
            Value::Array(items) => Some(items),
            Value::Object(map) => map
                .get("conversation")
                .or_else(|| map.get("messages"))
                .and_then(Value::as_array),
            _ => None,
        };
        if let Some(turns) = items.and_then(|items| turns_from_array(items)) {
            return Some(turns);
        }
    }
    None
}

fn llm_error(err: LlmError) -> ApiError {
    match err {
        LlmError::NotConfigured => ApiError::Upstream("content generation is not configured".to_string()),
        other => ApiError::Upstream(other.to_string()),
    }
}

/// Strips wrapping quotes models like to add around one-line answers.
fn clean_single_text(raw: &str) -> String {
    raw.trim()
        .trim_matches(|c| c == '"' || c == '\u{201c}' || c == '\u{201d}')
        .trim()
        .to_string()
}

pub async fn generate_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GenerateConversationBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (agent, _) = load_accessible_agent(&state, &user, &body.agent_id).await?;
    let turns = clamp_turns(body.turns);
    let topic = body.topic.as_deref().unwrap_or("").trim();

    let ctx = ConversationPromptContext {
        agent_name: &agent.name,
        description: &agent.description,
        system_prompt: &agent.system_prompt,
        language: &agent.language,
        topic,
        turns,
    };
    let reply = state
        .llm
        .chat_completion_text(
            &render_conversation_system_prompt(&ctx),
            &render_conversation_user_prompt(&ctx),
            CONVERSATION_TEMPERATURE,
        )
        .await
        .map_err(llm_error)?;

    let Some(conversation) = parse_conversation(&reply) else {
        warn!(agent_id = %agent.id, reply_len = reply.len(), "unparseable conversation reply");
        return Err(ApiError::Upstream(
            "the model reply was not a valid conversation".to_string(),
        ));
    };

    let example = if body.save {
        let title = if topic.is_empty() {
            format!("Generated conversation for {}", agent.name)
        } else {
            topic.to_string()
        };
        Some(insert_example(&state, &agent.id, &title, conversation.clone()).await?)
    } else {
        None
    };

    info!(agent_id = %agent.id, turns = conversation.len(), saved = example.is_some(), "conversation generated");
    Ok(success(json!({
        "conversation": conversation,
        "example": example
    })))
}

pub async fn generate_faq_answer(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GenerateFaqBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can edit FAQs")?;
    let question = required_text(&body.question, "question")?;

    let answer = state
        .llm
        .chat_completion_text(
            "You write concise, friendly answers for a SaaS product FAQ.",
            &render_faq_answer_prompt(&question, &body.context),
            FAQ_TEMPERATURE,
        )
        .await
        .map_err(llm_error)?;
    Ok(success(json!({ "question": question, "answer": answer.trim() })))
}

pub async fn generate_agent_description(
    Path(agent_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (agent, _) = load_accessible_agent(&state, &user, &agent_id).await?;
    if agent.system_prompt.trim().is_empty() {
        return Err(ApiError::bad_request(
            "add a system prompt before generating a description",
        ));
    }

    let reply = state
        .llm
        .chat_completion_text(
            "You summarise chatbot configurations for a public directory.",
            &render_agent_description_prompt(&agent.name, &agent.system_prompt),
            DESCRIPTION_TEMPERATURE,
        )
        .await
        .map_err(llm_error)?;
    let description = clean_single_text(&reply);
    if description.is_empty() {
        return Err(ApiError::Upstream("the model returned an empty description".to_string()));
    }
    Ok(success(json!({ "agentId": agent.id, "description": description })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(role: &str, content: &str) -> ConversationTurn {
        ConversationTurn {
            role: role.into(),
            content: content.into(),
        }
    }

    #[test]
    fn turns_are_clamped() {
        assert_eq!(clamp_turns(None), DEFAULT_TURNS);
        assert_eq!(clamp_turns(Some(0)), MIN_TURNS);
        assert_eq!(clamp_turns(Some(7)), 7);
        assert_eq!(clamp_turns(Some(500)), MAX_TURNS);
    }

    #[test]
    fn parses_a_bare_array() {
        let raw = r#"[{"role":"user","content":"Hi"},{"role":"assistant","content":"Hello!"}]"#;
        assert_eq!(
            parse_conversation(raw).unwrap(),
            vec![turn("user", "Hi"), turn("assistant", "Hello!")]
        );
    }

    #[test]
    fn tolerates_code_fences_and_prose() {
        let fenced = "```json\n[{\"role\":\"user\",\"content\":\"Table for 2?\"}]\n```";
        assert_eq!(parse_conversation(fenced).unwrap(), vec![turn("user", "Table for 2?")]);

        let chatty = "Sure! Here it is:\n[{\"role\":\"customer\",\"content\":\" Hi \"},{\"role\":\"bot\",\"text\":\"Ciao\"}]\nEnjoy.";
        assert_eq!(
            parse_conversation(chatty).unwrap(),
            vec![turn("user", "Hi"), turn("assistant", "Ciao")]
        );
    }

    #[test]
    fn accepts_wrapped_objects() {
        let raw = r#"{"conversation":[{"role":"User","content":"Open on Sunday?"}]}"#;
        assert_eq!(parse_conversation(raw).unwrap(), vec![turn("user", "Open on Sunday?")]);
    }

    #[test]
    fn rejects_invalid_turns() {
        assert!(parse_conversation("").is_none());
        assert!(parse_conversation("no json here").is_none());
        assert!(parse_conversation("[]").is_none());
        assert!(parse_conversation(r#"[{"role":"system","content":"x"}]"#).is_none());
        assert!(parse_conversation(r#"[{"role":"user","content":"  "}]"#).is_none());
        assert!(parse_conversation(r#"[{"role":"user"}]"#).is_none());
    }

    #[test]
    fn single_text_answers_lose_wrapping_quotes() {
        assert_eq!(clean_single_text("  \"Books tables.\" "), "Books tables.");
        assert_eq!(clean_single_text("Plain"), "Plain");
    }

    #[test]
    fn missing_llm_key_is_an_upstream_error() {
        assert!(matches!(llm_error(LlmError::NotConfigured), ApiError::Upstream(_)));
    }
}
