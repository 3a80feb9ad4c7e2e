use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

use super::{load_accessible_organisation, require, required_text, SCOPE_FILTER_SQL};
use crate::{
    app::{is_valid_email, normalize_email, now_iso, slugify},
    auth::authenticate,
    error::{created, success, ApiError, ApiResult},
    permissions::{can_create_organisation, is_super_admin, organisation_scope, Role},
    types::{
        parse_organisation_row, AppState, CreateOrganisationBody, ListQuery, Organisation, Page,
        UpdateOrganisationBody,
    },
};

fn optional_email(value: &str) -> Result<String, ApiError> {
    let email = normalize_email(value);
    if !email.is_empty() && !is_valid_email(&email) {
        return Err(ApiError::bad_request("contactEmail must be a valid email"));
    }
    Ok(email)
}

pub async fn list_organisations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (partner_bind, org_bind) = organisation_scope(&user).binds();
    let pattern = query.like_pattern();

    let total = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(1) FROM organisations o WHERE {SCOPE_FILTER_SQL} AND (o.name ILIKE $3 OR o.slug ILIKE $3)"
    ))
    .bind(&partner_bind)
    .bind(&org_bind)
    .bind(&pattern)
    .fetch_one(&state.db)
    .await?;
    let rows = sqlx::query(&format!(
        "SELECT o.* FROM organisations o WHERE {SCOPE_FILTER_SQL} AND (o.name ILIKE $3 OR o.slug ILIKE $3) \
         ORDER BY o.name ASC LIMIT $4 OFFSET $5"
    ))
    .bind(&partner_bind)
    .bind(&org_bind)
    .bind(&pattern)
    .bind(query.page_size())
    .bind(query.offset())
    .fetch_all(&state.db)
    .await?;

    let items = rows.iter().map(parse_organisation_row).collect::<Vec<_>>();
    Ok(success(Page::new(items, total, &query)))
}

pub async fn get_organisation(
    Path(org_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let org = load_accessible_organisation(&state, &user, &org_id).await?;
    let agent_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents WHERE organisation_id = $1")
        .bind(&org.id)
        .fetch_one(&state.db)
        .await?;
    Ok(success(json!({ "organisation": org, "agentCount": agent_count })))
}

pub async fn create_organisation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateOrganisationBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    // Partner admins create under their own partner even when they omit it.
    let partner_id = match user.role {
        Role::PartnerAdmin => body.partner_id.clone().or_else(|| user.partner_id.clone()),
        _ => body.partner_id.clone(),
    };
    require(
        can_create_organisation(&user, partner_id.as_deref()),
        "you cannot create organisations for this partner",
    )?;

    let name = required_text(&body.name, "name")?;
    let slug = slugify(body.slug.as_deref().unwrap_or(&name));
    if slug.is_empty() {
        return Err(ApiError::bad_request("slug must contain letters or digits"));
    }
    let now = now_iso();
    let org = Organisation {
        id: Uuid::new_v4().to_string(),
        partner_id,
        name,
        slug,
        contact_email: optional_email(&body.contact_email)?,
        phone: body.phone.trim().to_string(),
        created_at: now.clone(),
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO organisations (id, partner_id, name, slug, contact_email, phone, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(&org.id)
    .bind(&org.partner_id)
    .bind(&org.name)
    .bind(&org.slug)
    .bind(&org.contact_email)
    .bind(&org.phone)
    .bind(&org.created_at)
    .bind(&org.updated_at)
    .execute(&state.db)
    .await?;

    info!(organisation_id = %org.id, by = %user.id, "organisation created");
    Ok(created(org))
}

pub async fn update_organisation(
    Path(org_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateOrganisationBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let mut org = load_accessible_organisation(&state, &user, &org_id).await?;

    if let Some(name) = body.name.as_deref() {
        org.name = required_text(name, "name")?;
    }
    if let Some(email) = body.contact_email.as_deref() {
        org.contact_email = optional_email(email)?;
    }
    if let Some(phone) = body.phone.as_deref() {
        org.phone = phone.trim().to_string();
    }
    if let Some(partner_id) = body.partner_id.as_deref() {
        require(is_super_admin(&user), "only super admins can move organisations")?;
        org.partner_id = Some(partner_id.trim().to_string()).filter(|id| !id.is_empty());
    }
    org.updated_at = now_iso();

    sqlx::query(
        "UPDATE organisations SET name = $1, contact_email = $2, phone = $3, partner_id = $4, updated_at = $5 \
         WHERE id = $6",
    )
    .bind(&org.name)
    .bind(&org.contact_email)
    .bind(&org.phone)
    .bind(&org.partner_id)
    .bind(&org.updated_at)
    .bind(&org.id)
    .execute(&state.db)
    .await?;
    Ok(success(org))
}

pub async fn delete_organisation(
    Path(org_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can delete organisations")?;
    let deleted = sqlx::query("DELETE FROM organisations WHERE id = $1")
        .bind(&org_id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("organisation not found"));
    }
    info!(organisation_id = %org_id, by = %user.id, "organisation deleted");
    Ok(success(json!({ "id": org_id })))
}
