use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::json;
use sqlx::Row;
use tracing::info;
use uuid::Uuid;

use super::{load_organisation, require};
use crate::{
    app::{is_valid_email, normalize_email, now_iso},
    auth::authenticate,
    error::{created, success, ApiError, ApiResult},
    permissions::{
        can_create_admin_user, can_delete_admin_user, can_manage_admin_user, is_super_admin,
        organisation_scope, validate_role_shape, OrganisationScope, Role,
    },
    types::{
        parse_admin_user_row, AdminUser, AppState, CreateAdminUserBody, ListQuery, Page,
        UpdateAdminUserBody,
    },
};

/// A user may rename themself but never change their own role or disable their
/// own account.
pub fn check_self_update(actor: &AdminUser, target: &AdminUser, body: &UpdateAdminUserBody) -> Result<(), ApiError> {
    if actor.id != target.id {
        return Ok(());
    }
    if body.role.is_some_and(|role| role != target.role) {
        return Err(ApiError::forbidden("you cannot change your own role"));
    }
    if body.active == Some(false) {
        return Err(ApiError::forbidden("you cannot deactivate yourself"));
    }
    Ok(())
}

async fn load_user_with_partner(
    state: &Arc<AppState>,
    user_id: &str,
) -> Result<(AdminUser, Option<String>), ApiError> {
    let row = sqlx::query(
        "SELECT u.*, o.partner_id AS org_partner_id FROM admin_users u \
         LEFT JOIN organisations o ON o.id = u.organisation_id WHERE u.id = $1",
    )
    .bind(user_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("user not found"))?;
    Ok((parse_admin_user_row(&row), row.get("org_partner_id")))
}

async fn load_manageable_user(
    state: &Arc<AppState>,
    actor: &AdminUser,
    user_id: &str,
) -> Result<AdminUser, ApiError> {
    let (target, org_partner_id) = load_user_with_partner(state, user_id).await?;
    if !can_manage_admin_user(actor, &target, org_partner_id.as_deref()) {
        return Err(ApiError::not_found("user not found"));
    }
    Ok(target)
}

pub async fn list_users(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    // Partner admins see themselves and the org admins under their partner;
    // org admins only see themselves.
    let (all, partner_bind, self_id) = match organisation_scope(&user) {
        OrganisationScope::All => (true, None, user.id.clone()),
        OrganisationScope::Partner(id) => (false, Some(id), user.id.clone()),
        OrganisationScope::Organisation(_) | OrganisationScope::Nothing => {
            (false, None, user.id.clone())
        }
    };
    let pattern = query.like_pattern();
    let filter = "($1 OR u.id = $3 OR ($2::text IS NOT NULL AND o.partner_id = $2)) \
                  AND (u.email ILIKE $4 OR u.full_name ILIKE $4) \
                  AND ($5::text IS NULL OR u.organisation_id = $5)";

    let total = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(1) FROM admin_users u LEFT JOIN organisations o ON o.id = u.organisation_id WHERE {filter}"
    ))
    .bind(all)
    .bind(&partner_bind)
    .bind(&self_id)
    .bind(&pattern)
    .bind(&query.organisation_id)
    .fetch_one(&state.db)
    .await?;
    let rows = sqlx::query(&format!(
        "SELECT u.* FROM admin_users u LEFT JOIN organisations o ON o.id = u.organisation_id WHERE {filter} \
         ORDER BY u.email ASC LIMIT $6 OFFSET $7"
    ))
    .bind(all)
    .bind(&partner_bind)
    .bind(&self_id)
    .bind(&pattern)
    .bind(&query.organisation_id)
    .bind(query.page_size())
    .bind(query.offset())
    .fetch_all(&state.db)
    .await?;

    let items = rows.iter().map(parse_admin_user_row).collect::<Vec<_>>();
    Ok(success(Page::new(items, total, &query)))
}

pub async fn get_user(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let actor = authenticate(&state, &headers).await?;
    let target = load_manageable_user(&state, &actor, &user_id).await?;
    Ok(success(target))
}

pub async fn create_user(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateAdminUserBody>,
) -> ApiResult {
    let actor = authenticate(&state, &headers).await?;
    let email = normalize_email(&body.email);
    if !is_valid_email(&email) {
        return Err(ApiError::bad_request("a valid email is required"));
    }
    validate_role_shape(
        body.role,
        body.partner_id.as_deref(),
        body.organisation_id.as_deref(),
    )
    .map_err(ApiError::bad_request)?;

    let org_partner_id = match body.organisation_id.as_deref() {
        Some(org_id) => load_organisation(&state, org_id).await?.partner_id,
        None => None,
    };
    require(
        can_create_admin_user(
            &actor,
            body.role,
            body.organisation_id.as_deref(),
            org_partner_id.as_deref(),
        ),
        "you cannot create this kind of user",
    )?;

    let now = now_iso();
    let user = AdminUser {
        id: Uuid::new_v4().to_string(),
        email,
        full_name: body.full_name.trim().to_string(),
        role: body.role,
        partner_id: body.partner_id.clone(),
        organisation_id: body.organisation_id.clone(),
        active: true,
        created_at: now.clone(),
        updated_at: now,
        last_login_at: String::new(),
    };
    sqlx::query(
        "INSERT INTO admin_users (id, email, full_name, role, partner_id, organisation_id, active, created_at, updated_at, last_login_at) \
         VALUES ($1,$2,$3,$4,$5,$6,true,$7,$8,'')",
    )
    .bind(&user.id)
    .bind(&user.email)
    .bind(&user.full_name)
    .bind(user.role.as_str())
    .bind(&user.partner_id)
    .bind(&user.organisation_id)
    .bind(&user.created_at)
    .bind(&user.updated_at)
    .execute(&state.db)
    .await?;

    info!(user_id = %user.id, role = user.role.as_str(), by = %actor.id, "admin user created");
    Ok(created(user))
}

pub async fn update_user(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateAdminUserBody>,
) -> ApiResult {
    let actor = authenticate(&state, &headers).await?;
    let mut target = load_manageable_user(&state, &actor, &user_id).await?;
    check_self_update(&actor, &target, &body)?;

    if let Some(name) = body.full_name.as_deref() {
        target.full_name = name.trim().to_string();
    }
    if let Some(role) = body.role {
        if role != target.role {
            require(is_super_admin(&actor), "only super admins can change roles")?;
            validate_role_shape(
                role,
                target.partner_id.as_deref(),
                target.organisation_id.as_deref(),
            )
            .map_err(ApiError::bad_request)?;
            target.role = role;
        }
    }
    if let Some(active) = body.active {
        require(
            actor.role != Role::OrgAdmin,
            "organisation admins cannot change account status",
        )?;
        target.active = active;
    }
    target.updated_at = now_iso();

    sqlx::query("UPDATE admin_users SET full_name = $1, role = $2, active = $3, updated_at = $4 WHERE id = $5")
        .bind(&target.full_name)
        .bind(target.role.as_str())
        .bind(target.active)
        .bind(&target.updated_at)
        .bind(&target.id)
        .execute(&state.db)
        .await?;
    Ok(success(target))
}

pub async fn delete_user(
    Path(user_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let actor = authenticate(&state, &headers).await?;
    require(is_super_admin(&actor), "only super admins can delete users")?;
    let (target, _) = load_user_with_partner(&state, &user_id).await?;
    require(
        can_delete_admin_user(&actor, &target),
        "you cannot delete your own account",
    )?;
    sqlx::query("DELETE FROM admin_users WHERE id = $1")
        .bind(&target.id)
        .execute(&state.db)
        .await?;
    info!(user_id = %target.id, by = %actor.id, "admin user deleted");
    Ok(success(json!({ "id": target.id })))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin(id: &str, role: Role) -> AdminUser {
        AdminUser {
            id: id.into(),
            email: format!("{id}@example.com"),
            full_name: String::new(),
            role,
            partner_id: None,
            organisation_id: None,
            active: true,
            created_at: String::new(),
            updated_at: String::new(),
            last_login_at: String::new(),
        }
    }

    fn body(role: Option<Role>, active: Option<bool>) -> UpdateAdminUserBody {
        UpdateAdminUserBody {
            full_name: Some("New Name".into()),
            role,
            active,
        }
    }

    #[test]
    fn users_cannot_demote_or_disable_themselves() {
        let me = admin("u1", Role::SuperAdmin);
        assert!(check_self_update(&me, &me, &body(None, None)).is_ok());
        assert!(check_self_update(&me, &me, &body(Some(Role::SuperAdmin), Some(true))).is_ok());
        assert!(matches!(
            check_self_update(&me, &me, &body(Some(Role::OrgAdmin), None)),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            check_self_update(&me, &me, &body(None, Some(false))),
            Err(ApiError::Forbidden(_))
        ));
    }

    #[test]
    fn self_rules_do_not_apply_to_other_accounts() {
        let me = admin("u1", Role::SuperAdmin);
        let other = admin("u2", Role::PartnerAdmin);
        assert!(check_self_update(&me, &other, &body(Some(Role::OrgAdmin), Some(false))).is_ok());
    }
}
