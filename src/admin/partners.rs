use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, Query, State},
    http::HeaderMap,
};
use lazy_static::lazy_static;
use regex::Regex;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{read_image_upload, require, required_text};
use crate::{
    app::{now_iso, slugify},
    auth::authenticate,
    error::{created, success, ApiError, ApiResult},
    permissions::{can_read_partner, can_write_partner, is_super_admin, Role},
    storage::extension_for_content_type,
    types::{
        parse_partner_row, AppState, Branding, CreatePartnerBody, ListQuery, Page, Partner,
        UpdatePartnerBody,
    },
};

pub const MAX_LOGO_BYTES: usize = 2 * 1024 * 1024;

/// Lower-cased host without scheme, path or port.
pub fn normalize_domain(value: &str) -> String {
    let value = value.trim().to_ascii_lowercase();
    let without_scheme = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))
        .unwrap_or(&value);
    let host = without_scheme.split('/').next().unwrap_or("");
    let host = host.split(':').next().unwrap_or("");
    host.trim_end_matches('.').to_string()
}

lazy_static! {
    static ref HEX_COLOR: Option<Regex> = Regex::new(r"^#[0-9a-fA-F]{6}$").ok();
}

fn validate_color(value: &str) -> Result<String, ApiError> {
    let valid = HEX_COLOR.as_ref().is_some_and(|re| re.is_match(value.trim()));
    if !valid {
        return Err(ApiError::bad_request("primaryColor must look like #25d366"));
    }
    Ok(value.trim().to_ascii_lowercase())
}

fn optional_domain(value: Option<&str>) -> Option<String> {
    value.map(normalize_domain).filter(|domain| !domain.is_empty())
}

async fn load_partner(state: &Arc<AppState>, partner_id: &str) -> Result<Partner, ApiError> {
    let row = sqlx::query("SELECT * FROM partners WHERE id = $1")
        .bind(partner_id)
        .fetch_optional(&state.db)
        .await?
        .ok_or_else(|| ApiError::not_found("partner not found"))?;
    Ok(parse_partner_row(&row))
}

pub async fn list_partners(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(user.role != Role::OrgAdmin, "organisation admins cannot list partners")?;
    let only_id = if is_super_admin(&user) {
        None
    } else {
        user.partner_id.clone().or_else(|| Some(String::new()))
    };

    let pattern = query.like_pattern();
    let total = sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(1) FROM partners WHERE ($1::text IS NULL OR id = $1) AND (name ILIKE $2 OR slug ILIKE $2)",
    )
    .bind(&only_id)
    .bind(&pattern)
    .fetch_one(&state.db)
    .await?;
    let rows = sqlx::query(
        "SELECT * FROM partners WHERE ($1::text IS NULL OR id = $1) AND (name ILIKE $2 OR slug ILIKE $2) \
         ORDER BY name ASC LIMIT $3 OFFSET $4",
    )
    .bind(&only_id)
    .bind(&pattern)
    .bind(query.page_size())
    .bind(query.offset())
    .fetch_all(&state.db)
    .await?;

    let items = rows.iter().map(parse_partner_row).collect::<Vec<_>>();
    Ok(success(Page::new(items, total, &query)))
}

pub async fn get_partner(
    Path(partner_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    if !can_read_partner(&user, &partner_id) {
        return Err(ApiError::not_found("partner not found"));
    }
    let partner = load_partner(&state, &partner_id).await?;
    let organisation_count =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM organisations WHERE partner_id = $1")
            .bind(&partner_id)
            .fetch_one(&state.db)
            .await?;
    Ok(success(serde_json::json!({
        "partner": partner,
        "organisationCount": organisation_count
    })))
}

pub async fn create_partner(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<CreatePartnerBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(can_write_partner(&user), "only super admins can create partners")?;

    let name = required_text(&body.name, "name")?;
    let slug = slugify(body.slug.as_deref().unwrap_or(&name));
    if slug.is_empty() {
        return Err(ApiError::bad_request("slug must contain letters or digits"));
    }
    let primary_color = match body.primary_color.as_deref() {
        Some(color) => validate_color(color)?,
        None => "#25d366".to_string(),
    };
    let now = now_iso();
    let partner = Partner {
        id: Uuid::new_v4().to_string(),
        name,
        slug,
        domain: optional_domain(body.domain.as_deref()),
        logo_url: String::new(),
        primary_color,
        created_at: now.clone(),
        updated_at: now,
    };

    sqlx::query(
        "INSERT INTO partners (id, name, slug, domain, logo_url, primary_color, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(&partner.id)
    .bind(&partner.name)
    .bind(&partner.slug)
    .bind(&partner.domain)
    .bind(&partner.logo_url)
    .bind(&partner.primary_color)
    .bind(&partner.created_at)
    .bind(&partner.updated_at)
    .execute(&state.db)
    .await?;

    info!(partner_id = %partner.id, by = %user.id, "partner created");
    Ok(created(partner))
}

pub async fn update_partner(
    Path(partner_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    axum::Json(body): axum::Json<UpdatePartnerBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(can_write_partner(&user), "only super admins can edit partners")?;
    let mut partner = load_partner(&state, &partner_id).await?;

    if let Some(name) = body.name.as_deref() {
        partner.name = required_text(name, "name")?;
    }
    if let Some(domain) = body.domain.as_deref() {
        partner.domain = optional_domain(Some(domain));
    }
    if let Some(color) = body.primary_color.as_deref() {
        partner.primary_color = validate_color(color)?;
    }
    partner.updated_at = now_iso();

    sqlx::query(
        "UPDATE partners SET name = $1, domain = $2, primary_color = $3, updated_at = $4 WHERE id = $5",
    )
    .bind(&partner.name)
    .bind(&partner.domain)
    .bind(&partner.primary_color)
    .bind(&partner.updated_at)
    .bind(&partner.id)
    .execute(&state.db)
    .await?;
    Ok(success(partner))
}

pub async fn delete_partner(
    Path(partner_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(can_write_partner(&user), "only super admins can delete partners")?;
    let deleted = sqlx::query("DELETE FROM partners WHERE id = $1")
        .bind(&partner_id)
        .execute(&state.db)
        .await?
        .rows_affected();
    if deleted == 0 {
        return Err(ApiError::not_found("partner not found"));
    }
    info!(%partner_id, by = %user.id, "partner deleted");
    Ok(success(serde_json::json!({ "id": partner_id })))
}

pub async fn upload_partner_logo(
    Path(partner_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(can_write_partner(&user), "only super admins can change partner branding")?;
    let partner = load_partner(&state, &partner_id).await?;
    let upload = read_image_upload(multipart, MAX_LOGO_BYTES).await?;
    let ext = extension_for_content_type(&upload.content_type)
        .ok_or_else(|| ApiError::bad_request("unsupported image type"))?;
    let key = format!("partners/{}/logo.{ext}", partner.id);
    let url = state
        .storage
        .put(&key, upload.bytes, &upload.content_type)
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;

    sqlx::query("UPDATE partners SET logo_url = $1, updated_at = $2 WHERE id = $3")
        .bind(&url)
        .bind(now_iso())
        .bind(&partner.id)
        .execute(&state.db)
        .await?;
    Ok(success(serde_json::json!({ "logoUrl": url })))
}

pub async fn branding_for_host(state: &Arc<AppState>, host: &str) -> Result<Branding, ApiError> {
    let domain = normalize_domain(host);
    if domain.is_empty() {
        return Ok(Branding::default());
    }
    let row = sqlx::query("SELECT id, name, logo_url, primary_color FROM partners WHERE domain = $1")
        .bind(&domain)
        .fetch_optional(&state.db)
        .await?;
    Ok(match row {
        Some(row) => Branding {
            partner_id: Some(row.get("id")),
            name: row.get("name"),
            logo_url: row.get("logo_url"),
            primary_color: row.get("primary_color"),
        },
        None => Branding::default(),
    })
}
