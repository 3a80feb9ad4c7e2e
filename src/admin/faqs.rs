use std::{collections::HashSet, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{require, required_text};
use crate::{
    app::now_iso,
    auth::authenticate,
    error::{created, success, ApiError, ApiResult},
    permissions::is_super_admin,
    types::{
        parse_faq_row, AppState, CreateFaqBody, Faq, ListQuery, Page, ReorderFaqsBody,
        UpdateFaqBody,
    },
};

async fn load_faq(state: &Arc<AppState>, faq_id: &str) -> Result<Faq, ApiError> {
    let row = sqlx::query("SELECT * FROM faqs WHERE id = $1")
        .bind(faq_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("faq not found"))?;
    Ok(parse_faq_row(&row))
}

fn unique_ids(ids: &[String]) -> Result<(), ApiError> {
    let mut seen = HashSet::new();
    if ids.iter().all(|id| seen.insert(id.as_str())) {
        Ok(())
    } else {
        Err(ApiError::bad_request("ids must not repeat"))
    }
}

pub async fn list_faqs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    authenticate(&state, &headers).await?;
    let pattern = query.like_pattern();
    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM faqs WHERE question ILIKE $1 OR answer ILIKE $1 OR category ILIKE $1",
    )
    .bind(&pattern)
    .fetch_one(&state.db)
    .await?;
    let rows = sqlx::query(
        "SELECT * FROM faqs WHERE question ILIKE $1 OR answer ILIKE $1 OR category ILIKE $1 \
         ORDER BY position ASC, created_at ASC LIMIT $2 OFFSET $3",
    )
    .bind(&pattern)
    .bind(query.page_size())
    .bind(query.offset())
    .fetch_all(&state.db)
    .await?;
    let items = rows.iter().map(parse_faq_row).collect::<Vec<_>>();
    Ok(success(Page::new(items, total, &query)))
}

pub async fn create_faq(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateFaqBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can edit FAQs")?;

    let position = match body.position {
        Some(position) => position,
        None => {
            sqlx::query_scalar::<_, i32>("SELECT COALESCE(MAX(position) + 1, 0) FROM faqs")
                .fetch_one(&state.db)
                .await?
        }
    };
    let now = now_iso();
    let faq = Faq {
        id: Uuid::new_v4().to_string(),
        question: required_text(&body.question, "question")?,
        answer: required_text(&body.answer, "answer")?,
        category: body.category.trim().to_string(),
        position,
        published: body.published,
        created_at: now.clone(),
        updated_at: now,
    };
    sqlx::query(
        "INSERT INTO faqs (id, question, answer, category, position, published, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(&faq.id)
    .bind(&faq.question)
    .bind(&faq.answer)
    .bind(&faq.category)
    .bind(faq.position)
    .bind(faq.published)
    .bind(&faq.created_at)
    .bind(&faq.updated_at)
    .execute(&state.db)
    .await?;
    Ok(created(faq))
}

pub async fn update_faq(
    Path(faq_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateFaqBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can edit FAQs")?;
    let mut faq = load_faq(&state, &faq_id).await?;

    if let Some(question) = body.question.as_deref() {
        faq.question = required_text(question, "question")?;
    }
    if let Some(answer) = body.answer.as_deref() {
        faq.answer = required_text(answer, "answer")?;
    }
    if let Some(category) = body.category.as_deref() {
        faq.category = category.trim().to_string();
    }
    if let Some(position) = body.position {
        faq.position = position;
    }
    if let Some(published) = body.published {
        faq.published = published;
    }
    faq.updated_at = now_iso();

    sqlx::query(
        "UPDATE faqs SET question = $1, answer = $2, category = $3, position = $4, published = $5, \
         updated_at = $6 WHERE id = $7",
    )
    .bind(&faq.question)
    .bind(&faq.answer)
    .bind(&faq.category)
    .bind(faq.position)
    .bind(faq.published)
    .bind(&faq.updated_at)
    .bind(&faq.id)
    .execute(&state.db)
    .await?;
    Ok(success(faq))
}

pub async fn delete_faq(
    Path(faq_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can edit FAQs")?;
    let deleted = sqlx::query("DELETE FROM faqs WHERE id = $1")
        .bind(&faq_id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("faq not found"));
    }
    Ok(success(json!({ "id": faq_id })))
}

/// Positions follow the order of `ids`; FAQs not listed keep their position.
pub async fn reorder_faqs(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ReorderFaqsBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can edit FAQs")?;
    unique_ids(&body.ids)?;

    let now = now_iso();
    let mut tx = state.db.begin().await?;
    for (position, id) in body.ids.iter().enumerate() {
        let updated = sqlx::query("UPDATE faqs SET position = $1, updated_at = $2 WHERE id = $3")
            .bind(position as i32)
            .bind(&now)
            .bind(id)
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            return Err(ApiError::not_found(format!("faq {id} not found")));
        }
    }
    tx.commit().await?;

    info!(count = body.ids.len(), by = %user.id, "faqs reordered");
    Ok(success(json!({ "ids": body.ids })))
}
