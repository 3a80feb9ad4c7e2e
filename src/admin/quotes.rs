//! Sales quotes: server-side totals, yearly numbering, HTML rendering to
//! storage and delivery to the prospect by email.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{Datelike, Duration as ChronoDuration, NaiveDate, Utc};
use serde_json::json;
use sqlx::Row;
use tracing::{info, warn};
use uuid::Uuid;

use super::{load_accessible_organisation, require, required_text, SCOPE_FILTER_SQL};
use crate::{
    app::{is_valid_email, normalize_email, now_iso},
    auth::authenticate,
    email::EmailMessage,
    error::{created, success, ApiError, ApiResult},
    permissions::{can_access_organisation, is_super_admin, organisation_scope},
    prompting::{render_quote_document, render_quote_email, QuoteDocument, QuoteLine},
    types::{
        parse_quote_row, AdminUser, AppState, Branding, CreateQuoteBody, ListQuery, Page, Quote,
        QuoteItem, QuoteTotals, UpdateQuoteBody,
    },
};

const DEFAULT_VALIDITY_DAYS: i64 = 30;
const NUMBER_ATTEMPTS: usize = 3;
const MAX_ITEMS: usize = 100;
const MAX_QUANTITY: i64 = 1_000_000;
/// Minor units; 100 million in the quote currency.
const MAX_UNIT_PRICE: i64 = 10_000_000_000;

pub const STATUS_DRAFT: &str = "draft";
pub const STATUS_SENT: &str = "sent";
pub const STATUS_ACCEPTED: &str = "accepted";
pub const STATUS_REJECTED: &str = "rejected";

/// Subtotals per billing kind, then the discount applied to each, rounded
/// half-up to whole cents. Amounts beyond `i64` saturate; validated items
/// stay well below that.
pub fn compute_totals(items: &[QuoteItem], discount_percent: i32) -> QuoteTotals {
    let discount = i128::from(discount_percent.clamp(0, 100));
    let (mut one_off, mut monthly) = (0i128, 0i128);
    for item in items {
        let amount = i128::from(item.quantity) * i128::from(item.unit_price);
        if item.recurring {
            monthly = monthly.saturating_add(amount);
        } else {
            one_off = one_off.saturating_add(amount);
        }
    }
    QuoteTotals {
        one_off_subtotal: clamp_cents(one_off),
        monthly_subtotal: clamp_cents(monthly),
        one_off_total: clamp_cents(apply_discount(one_off, discount)),
        monthly_total: clamp_cents(apply_discount(monthly, discount)),
    }
}

fn apply_discount(subtotal: i128, discount: i128) -> i128 {
    (subtotal.saturating_mul(100 - discount).saturating_add(50)).div_euclid(100)
}

fn clamp_cents(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

pub fn format_money(cents: i64, currency: &str) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{sign}{}.{:02} {currency}", abs / 100, abs % 100)
}

pub fn quote_number(year: i32, sequence: i64) -> String {
    format!("Q-{year}-{sequence:04}")
}

/// Sequence part of a `Q-YYYY-NNNN` number.
fn number_sequence(number: &str) -> Option<i64> {
    number.rsplit('-').next()?.parse().ok()
}

pub fn can_transition(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        (STATUS_DRAFT, STATUS_SENT)
            | (STATUS_SENT, STATUS_ACCEPTED)
            | (STATUS_SENT, STATUS_REJECTED)
    ) || from == to
}

fn validate_items(items: &[QuoteItem]) -> Result<Vec<QuoteItem>, ApiError> {
    if items.is_empty() {
        return Err(ApiError::bad_request("a quote needs at least one item"));
    }
    if items.len() > MAX_ITEMS {
        return Err(ApiError::bad_request(format!(
            "a quote holds at most {MAX_ITEMS} items"
        )));
    }
    items
        .iter()
        .map(|item| {
            if !(1..=MAX_QUANTITY).contains(&item.quantity) {
                return Err(ApiError::bad_request(format!(
                    "item quantity must be between 1 and {MAX_QUANTITY}"
                )));
            }
            if !(0..=MAX_UNIT_PRICE).contains(&item.unit_price) {
                return Err(ApiError::bad_request(format!(
                    "item unitPrice must be between 0 and {MAX_UNIT_PRICE}"
                )));
            }
            Ok(QuoteItem {
                description: required_text(&item.description, "item description")?,
                ..item.clone()
            })
        })
        .collect()
}

fn validate_discount(discount_percent: i32) -> Result<i32, ApiError> {
    if (0..=100).contains(&discount_percent) {
        Ok(discount_percent)
    } else {
        Err(ApiError::bad_request("discountPercent must be between 0 and 100"))
    }
}

fn validate_currency(currency: &str) -> Result<String, ApiError> {
    let currency = currency.trim().to_ascii_uppercase();
    if currency.len() == 3 && currency.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(currency)
    } else {
        Err(ApiError::bad_request("currency must be a three-letter ISO code"))
    }
}

fn validate_valid_until(value: &str) -> Result<String, ApiError> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d")
        .map(|date| date.to_string())
        .map_err(|_| ApiError::bad_request("validUntil must be a YYYY-MM-DD date"))
}

fn validate_prospect_email(value: &str) -> Result<String, ApiError> {
    let email = normalize_email(value);
    if !is_valid_email(&email) {
        return Err(ApiError::bad_request("prospectEmail must be a valid email"));
    }
    Ok(email)
}

async fn next_quote_number(state: &Arc<AppState>, year: i32) -> Result<String, ApiError> {
    let numbers = sqlx::query_scalar::<_, String>("SELECT number FROM quotes WHERE number LIKE $1")
        .bind(format!("Q-{year}-%"))
        .fetch_all(&state.db)
        .await?;
    let last = numbers
        .iter()
        .filter_map(|number| number_sequence(number))
        .max()
        .unwrap_or(0);
    Ok(quote_number(year, last + 1))
}

async fn load_accessible_quote(
    state: &Arc<AppState>,
    user: &AdminUser,
    quote_id: &str,
) -> Result<Quote, ApiError> {
    let row = sqlx::query(
        "SELECT q.*, o.partner_id AS org_partner_id FROM quotes q \
         LEFT JOIN organisations o ON o.id = q.organisation_id WHERE q.id = $1",
    )
    .bind(quote_id)
    .fetch_optional(&state.db)
    .await?
    .ok_or_else(|| ApiError::not_found("quote not found"))?;
    let quote = parse_quote_row(&row);
    let org_partner_id: Option<String> = row.get("org_partner_id");
    let visible = match quote.organisation_id.as_deref() {
        Some(org_id) => can_access_organisation(user, org_id, org_partner_id.as_deref()),
        None => is_super_admin(user),
    };
    if !visible {
        return Err(ApiError::not_found("quote not found"));
    }
    Ok(quote)
}

async fn branding_for_quote(state: &Arc<AppState>, quote: &Quote) -> Result<Branding, ApiError> {
    let Some(org_id) = quote.organisation_id.as_deref() else {
        return Ok(Branding::default());
    };
    let row = sqlx::query(
        "SELECT p.id, p.name, p.logo_url, p.primary_color FROM partners p \
         JOIN organisations o ON o.partner_id = p.id WHERE o.id = $1",
    )
    .bind(org_id)
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

pub fn quote_document(quote: &Quote, branding: &Branding) -> QuoteDocument {
    let items = quote
        .items
        .iter()
        .map(|item| QuoteLine {
            description: item.description.clone(),
            recurring: item.recurring,
            quantity: item.quantity,
            unit_price: format_money(item.unit_price, &quote.currency),
            amount: format_money(item.quantity.saturating_mul(item.unit_price), &quote.currency),
        })
        .collect();
    QuoteDocument {
        number: quote.number.clone(),
        brand_name: branding.name.clone(),
        primary_color: branding.primary_color.clone(),
        prospect_name: quote.prospect_name.clone(),
        prospect_email: quote.prospect_email.clone(),
        valid_until: quote.valid_until.clone(),
        items,
        discount_percent: quote.discount_percent,
        one_off_total: format_money(quote.totals.one_off_total, &quote.currency),
        monthly_total: format_money(quote.totals.monthly_total, &quote.currency),
        notes: quote.notes.clone(),
        document_url: quote.document_url.clone(),
    }
}

pub async fn list_quotes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let (partner_bind, org_bind) = organisation_scope(&user).binds();
    let pattern = query.like_pattern();
    let filter = format!(
        "{SCOPE_FILTER_SQL} AND (q.number ILIKE $3 OR q.prospect_name ILIKE $3 OR q.prospect_email ILIKE $3) \
         AND ($4::text IS NULL OR q.status = $4) AND ($5::text IS NULL OR q.organisation_id = $5)"
    );

    let total = sqlx::query_scalar::<_, i64>(&format!(
        "SELECT COUNT(1) FROM quotes q LEFT JOIN organisations o ON o.id = q.organisation_id WHERE {filter}"
    ))
    .bind(&partner_bind)
    .bind(&org_bind)
    .bind(&pattern)
    .bind(&query.status)
    .bind(&query.organisation_id)
    .fetch_one(&state.db)
    .await?;
    let rows = sqlx::query(&format!(
        "SELECT q.* FROM quotes q LEFT JOIN organisations o ON o.id = q.organisation_id WHERE {filter} \
         ORDER BY q.created_at DESC LIMIT $6 OFFSET $7"
    ))
    .bind(&partner_bind)
    .bind(&org_bind)
    .bind(&pattern)
    .bind(&query.status)
    .bind(&query.organisation_id)
    .bind(query.page_size())
    .bind(query.offset())
    .fetch_all(&state.db)
    .await?;

    let items = rows.iter().map(parse_quote_row).collect::<Vec<_>>();
    Ok(success(Page::new(items, total, &query)))
}

pub async fn get_quote(
    Path(quote_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let quote = load_accessible_quote(&state, &user, &quote_id).await?;
    Ok(success(quote))
}

pub async fn create_quote(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateQuoteBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    match body.organisation_id.as_deref() {
        Some(org_id) => {
            load_accessible_organisation(&state, &user, org_id).await?;
        }
        None => require(
            is_super_admin(&user),
            "only super admins can create quotes without an organisation",
        )?,
    }

    let items = validate_items(&body.items)?;
    let discount_percent = validate_discount(body.discount_percent)?;
    let currency = validate_currency(body.currency.as_deref().unwrap_or("EUR"))?;
    let prospect_email = validate_prospect_email(&body.prospect_email)?;
    let prospect_name = required_text(&body.prospect_name, "prospectName")?;
    let today = Utc::now().date_naive();
    let valid_until = match body.valid_until.as_deref() {
        Some(value) => validate_valid_until(value)?,
        None => (today + ChronoDuration::days(DEFAULT_VALIDITY_DAYS)).to_string(),
    };
    let items_json = serde_json::to_string(&items)
        .map_err(|err| ApiError::Internal(format!("unable to encode items: {err}")))?;

    let id = Uuid::new_v4().to_string();
    let now = now_iso();
    let mut attempt = 0;
    let row = loop {
        attempt += 1;
        let number = next_quote_number(&state, today.year()).await?;
        let inserted = sqlx::query(
            "INSERT INTO quotes (id, number, organisation_id, prospect_name, prospect_email, items, currency, \
             discount_percent, status, notes, document_url, valid_until, created_by, created_at, updated_at) \
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,'',$11,$12,$13,$13) RETURNING *",
        )
        .bind(&id)
        .bind(&number)
        .bind(&body.organisation_id)
        .bind(&prospect_name)
        .bind(&prospect_email)
        .bind(&items_json)
        .bind(&currency)
        .bind(discount_percent)
        .bind(STATUS_DRAFT)
        .bind(body.notes.trim())
        .bind(&valid_until)
        .bind(&user.id)
        .bind(&now)
        .fetch_one(&state.db)
        .await;
        match inserted {
            Ok(row) => break row,
            Err(err) if attempt < NUMBER_ATTEMPTS && is_number_collision(&err) => {
                warn!(%number, "quote number taken, retrying");
            }
            Err(err) => return Err(err.into()),
        }
    };

    let quote = parse_quote_row(&row);
    info!(quote_id = %quote.id, number = %quote.number, by = %user.id, "quote created");
    Ok(created(quote))
}

fn is_number_collision(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .map(|db| db.is_unique_violation())
        .unwrap_or(false)
}

pub async fn update_quote(
    Path(quote_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<UpdateQuoteBody>,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let mut quote = load_accessible_quote(&state, &user, &quote_id).await?;

    let edits_content = body.prospect_name.is_some()
        || body.prospect_email.is_some()
        || body.items.is_some()
        || body.currency.is_some()
        || body.discount_percent.is_some()
        || body.notes.is_some()
        || body.valid_until.is_some();
    if edits_content && quote.status != STATUS_DRAFT {
        return Err(ApiError::Conflict("only draft quotes can be edited".to_string()));
    }

    if let Some(name) = body.prospect_name.as_deref() {
        quote.prospect_name = required_text(name, "prospectName")?;
    }
    if let Some(email) = body.prospect_email.as_deref() {
        quote.prospect_email = validate_prospect_email(email)?;
    }
    if let Some(items) = body.items.as_deref() {
        quote.items = validate_items(items)?;
    }
    if let Some(currency) = body.currency.as_deref() {
        quote.currency = validate_currency(currency)?;
    }
    if let Some(discount) = body.discount_percent {
        quote.discount_percent = validate_discount(discount)?;
    }
    if let Some(notes) = body.notes.as_deref() {
        quote.notes = notes.trim().to_string();
    }
    if let Some(valid_until) = body.valid_until.as_deref() {
        quote.valid_until = validate_valid_until(valid_until)?;
    }
    if let Some(status) = body.status.as_deref() {
        if !can_transition(&quote.status, status) {
            return Err(ApiError::Conflict(format!(
                "cannot move a {} quote to {status}",
                quote.status
            )));
        }
        quote.status = status.to_string();
    }
    quote.totals = compute_totals(&quote.items, quote.discount_percent);
    quote.updated_at = now_iso();

    let items_json = serde_json::to_string(&quote.items)
        .map_err(|err| ApiError::Internal(format!("unable to encode items: {err}")))?;
    sqlx::query(
        "UPDATE quotes SET prospect_name = $1, prospect_email = $2, items = $3, currency = $4, \
         discount_percent = $5, notes = $6, valid_until = $7, status = $8, updated_at = $9 WHERE id = $10",
    )
    .bind(&quote.prospect_name)
    .bind(&quote.prospect_email)
    .bind(&items_json)
    .bind(&quote.currency)
    .bind(quote.discount_percent)
    .bind(&quote.notes)
    .bind(&quote.valid_until)
    .bind(&quote.status)
    .bind(&quote.updated_at)
    .bind(&quote.id)
    .execute(&state.db)
    .await?;
    Ok(success(quote))
}

pub async fn delete_quote(
    Path(quote_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    require(is_super_admin(&user), "only super admins can delete quotes")?;
    let quote = load_accessible_quote(&state, &user, &quote_id).await?;
    sqlx::query("DELETE FROM quotes WHERE id = $1")
        .bind(&quote.id)
        .execute(&state.db)
        .await?;
    if !quote.document_url.is_empty() {
        if let Err(err) = state.storage.delete(&document_key(&quote.id)).await {
            warn!(quote_id = %quote.id, error = %err, "unable to delete quote document");
        }
    }
    Ok(success(json!({ "id": quote.id })))
}

fn document_key(quote_id: &str) -> String {
    format!("quotes/{quote_id}/quote.html")
}

/// Renders the quote to HTML, stores it and records the public URL.
async fn store_document(state: &Arc<AppState>, quote: &mut Quote) -> Result<(), ApiError> {
    let branding = branding_for_quote(state, quote).await?;
    let html = render_quote_document(&quote_document(quote, &branding))
        .map_err(|err| ApiError::Internal(format!("unable to render quote: {err}")))?;
    let url = state
        .storage
        .put(&document_key(&quote.id), html.into_bytes(), "text/html; charset=utf-8")
        .await
        .map_err(|err| ApiError::Upstream(err.to_string()))?;
    quote.document_url = url;
    quote.updated_at = now_iso();
    sqlx::query("UPDATE quotes SET document_url = $1, updated_at = $2 WHERE id = $3")
        .bind(&quote.document_url)
        .bind(&quote.updated_at)
        .bind(&quote.id)
        .execute(&state.db)
        .await?;
    Ok(())
}

pub async fn render_quote(
    Path(quote_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let mut quote = load_accessible_quote(&state, &user, &quote_id).await?;
    store_document(&state, &mut quote).await?;
    Ok(success(quote))
}

pub async fn send_quote(
    Path(quote_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult {
    let user = authenticate(&state, &headers).await?;
    let mut quote = load_accessible_quote(&state, &user, &quote_id).await?;
    if quote.status != STATUS_DRAFT && quote.status != STATUS_SENT {
        return Err(ApiError::Conflict(format!(
            "a {} quote cannot be sent",
            quote.status
        )));
    }

    store_document(&state, &mut quote).await?;
    let branding = branding_for_quote(&state, &quote).await?;
    let document = quote_document(&quote, &branding);
    let html = render_quote_email(&document)
        .map_err(|err| ApiError::Internal(format!("unable to render quote email: {err}")))?;
    let text = format!(
        "Hello {},\n\nyour quote {} from {} is ready: {}\n\nOne-off: {}\nMonthly: {}\nValid until {}.",
        document.prospect_name,
        document.number,
        document.brand_name,
        document.document_url,
        document.one_off_total,
        document.monthly_total,
        document.valid_until,
    );
    state
        .mailer
        .send(EmailMessage {
            to: quote.prospect_email.clone(),
            subject: format!("Your quote {} from {}", quote.number, branding.name),
            html,
            text,
        })
        .await
        .map_err(|err| ApiError::Upstream(format!("unable to send quote: {err}")))?;

    quote.status = STATUS_SENT.to_string();
    quote.updated_at = now_iso();
    sqlx::query("UPDATE quotes SET status = $1, updated_at = $2 WHERE id = $3")
        .bind(&quote.status)
        .bind(&quote.updated_at)
        .bind(&quote.id)
        .execute(&state.db)
        .await?;
    info!(quote_id = %quote.id, to = %quote.prospect_email, "quote sent");
    Ok(success(quote))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(quantity: i64, unit_price: i64, recurring: bool) -> QuoteItem {
        QuoteItem {
            description: "line".into(),
            quantity,
            unit_price,
            recurring,
        }
    }

    #[test]
    fn totals_split_one_off_and_monthly() {
        let items = [item(1, 50_000, false), item(2, 9_900, true), item(1, 1_000, false)];
        let totals = compute_totals(&items, 0);
        assert_eq!(totals.one_off_subtotal, 51_000);
        assert_eq!(totals.monthly_subtotal, 19_800);
        assert_eq!(totals.one_off_total, 51_000);
        assert_eq!(totals.monthly_total, 19_800);
    }

    #[test]
    fn discount_rounds_half_up_to_cents() {
        let totals = compute_totals(&[item(1, 999, false)], 15);
        // 999 * 0.85 = 849.15
        assert_eq!(totals.one_off_total, 849);
        let totals = compute_totals(&[item(1, 10, true)], 25);
        // 7.5 rounds to 8
        assert_eq!(totals.monthly_total, 8);
        assert_eq!(compute_totals(&[item(3, 100, false)], 100).one_off_total, 0);
    }

    #[test]
    fn discount_is_clamped_when_reading_old_rows() {
        let totals = compute_totals(&[item(1, 100, false)], 150);
        assert_eq!(totals.one_off_total, 0);
        let totals = compute_totals(&[item(1, 100, false)], -5);
        assert_eq!(totals.one_off_total, 100);
    }

    #[test]
    fn numbers_are_zero_padded_per_year() {
        assert_eq!(quote_number(2026, 7), "Q-2026-0007");
        assert_eq!(quote_number(2026, 12345), "Q-2026-12345");
        assert_eq!(number_sequence("Q-2026-0042"), Some(42));
        assert_eq!(number_sequence("garbage"), None);
    }

    #[test]
    fn money_is_formatted_with_two_decimals() {
        assert_eq!(format_money(9_900, "EUR"), "99.00 EUR");
        assert_eq!(format_money(5, "USD"), "0.05 USD");
        assert_eq!(format_money(-1_250, "EUR"), "-12.50 EUR");
    }

    #[test]
    fn status_moves_forward_only() {
        assert!(can_transition("draft", "sent"));
        assert!(can_transition("sent", "accepted"));
        assert!(can_transition("sent", "rejected"));
        assert!(can_transition("sent", "sent"));
        assert!(!can_transition("draft", "accepted"));
        assert!(!can_transition("accepted", "draft"));
        assert!(!can_transition("rejected", "sent"));
        assert!(!can_transition("draft", "archived"));
    }

    #[test]
    fn items_are_validated() {
        assert!(validate_items(&[]).is_err());
        assert!(validate_items(&[item(0, 100, false)]).is_err());
        assert!(validate_items(&[item(1, -1, false)]).is_err());
        let mut blank = item(1, 100, false);
        blank.description = "  ".into();
        assert!(validate_items(&[blank]).is_err());
        let ok = validate_items(&[item(2, 100, true)]).unwrap();
        assert_eq!(ok[0].quantity, 2);
    }

    #[test]
    fn oversized_items_are_rejected() {
        assert!(validate_items(&[item(1_000_000_000_000, 100_000_000, false)]).is_err());
        assert!(validate_items(&[item(MAX_QUANTITY + 1, 1, false)]).is_err());
        assert!(validate_items(&[item(1, MAX_UNIT_PRICE + 1, false)]).is_err());
        assert!(validate_items(&vec![item(1, 1, false); MAX_ITEMS + 1]).is_err());

        let largest = vec![item(MAX_QUANTITY, MAX_UNIT_PRICE, false); MAX_ITEMS];
        let items = validate_items(&largest).unwrap();
        let totals = compute_totals(&items, 0);
        assert_eq!(totals.one_off_total, MAX_QUANTITY * MAX_UNIT_PRICE * MAX_ITEMS as i64);
    }

    #[test]
    fn totals_saturate_instead_of_overflowing() {
        let totals = compute_totals(&[item(i64::MAX, i64::MAX, false), item(i64::MAX, 2, false)], 0);
        assert_eq!(totals.one_off_subtotal, i64::MAX);
        assert_eq!(totals.one_off_total, i64::MAX);
        let discounted = compute_totals(&[item(1_000_000_000_000, 100_000_000, true)], 50);
        assert_eq!(discounted.monthly_total, i64::MAX);
    }

    #[test]
    fn currency_and_dates_are_normalized() {
        assert_eq!(validate_currency(" eur ").unwrap(), "EUR");
        assert!(validate_currency("EURO").is_err());
        assert_eq!(validate_valid_until("2026-12-31").unwrap(), "2026-12-31");
        assert!(validate_valid_until("31/12/2026").is_err());
        assert!(validate_discount(101).is_err());
    }

    #[test]
    fn document_formats_lines_with_quote_currency() {
        let items = vec![item(2, 9_900, true)];
        let quote = Quote {
            id: "q1".into(),
            number: "Q-2026-0001".into(),
            organisation_id: None,
            prospect_name: "Acme".into(),
            prospect_email: "buyer@acme.test".into(),
            totals: compute_totals(&items, 10),
            items,
            currency: "EUR".into(),
            discount_percent: 10,
            status: "draft".into(),
            notes: String::new(),
            document_url: String::new(),
            valid_until: "2026-12-31".into(),
            created_by: "u1".into(),
            created_at: String::new(),
            updated_at: String::new(),
        };
        let doc = quote_document(&quote, &Branding::default());
        assert_eq!(doc.items[0].amount, "198.00 EUR");
        assert_eq!(doc.monthly_total, "178.20 EUR");
        assert_eq!(doc.one_off_total, "0.00 EUR");
        assert_eq!(doc.brand_name, "AgentHub");
    }
}
