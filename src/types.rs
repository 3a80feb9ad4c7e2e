use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sqlx::{postgres::PgRow, PgPool, Row};

use crate::{
    auth::SessionKeys, config::Config, email::Mailer, llm::LlmClient, permissions::Role,
    realtime::EventHub, storage::ObjectStorage, whatsapp::WhatsAppClient,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Partner {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub domain: Option<String>,
    pub logo_url: String,
    pub primary_color: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Organisation {
    pub id: String,
    pub partner_id: Option<String>,
    pub name: String,
    pub slug: String,
    pub contact_email: String,
    pub phone: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdminUser {
    pub id: String,
    pub email: String,
    pub full_name: String,
    pub role: Role,
    pub partner_id: Option<String>,
    pub organisation_id: Option<String>,
    pub active: bool,
    pub created_at: String,
    pub updated_at: String,
    pub last_login_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub organisation_id: String,
    pub name: String,
    pub description: String,
    pub system_prompt: String,
    pub language: String,
    pub status: String,
    pub avatar_url: String,
    pub waba_id: String,
    pub phone_number_id: String,
    pub display_phone_number: String,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Example {
    pub id: String,
    pub agent_id: String,
    pub title: String,
    pub conversation: Vec<ConversationTurn>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Faq {
    pub id: String,
    pub question: String,
    pub answer: String,
    pub category: String,
    pub position: i32,
    pub published: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteItem {
    pub description: String,
    pub quantity: i64,
    /// Minor currency units.
    pub unit_price: i64,
    #[serde(default)]
    pub recurring: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuoteTotals {
    pub one_off_subtotal: i64,
    pub monthly_subtotal: i64,
    pub one_off_total: i64,
    pub monthly_total: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Quote {
    pub id: String,
    pub number: String,
    pub organisation_id: Option<String>,
    pub prospect_name: String,
    pub prospect_email: String,
    pub items: Vec<QuoteItem>,
    pub currency: String,
    pub discount_percent: i32,
    pub status: String,
    pub notes: String,
    pub document_url: String,
    pub valid_until: String,
    pub created_by: String,
    pub created_at: String,
    pub updated_at: String,
    pub totals: QuoteTotals,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatSession {
    pub id: String,
    pub agent_id: String,
    pub contact_wa_id: String,
    pub contact_name: String,
    pub status: String,
    pub last_message_at: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: String,
    pub content: String,
    pub wa_message_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Branding {
    pub partner_id: Option<String>,
    pub name: String,
    pub logo_url: String,
    pub primary_color: String,
}

impl Default for Branding {
    fn default() -> Self {
        Self {
            partner_id: None,
            name: "AgentHub".to_string(),
            logo_url: String::new(),
            primary_color: "#25d366".to_string(),
        }
    }
}

pub struct AppState {
    pub db: PgPool,
    pub config: Config,
    pub events: EventHub,
    pub http: reqwest::Client,
    pub session_keys: SessionKeys,
    pub storage: Arc<dyn ObjectStorage>,
    pub mailer: Arc<dyn Mailer>,
    pub llm: LlmClient,
    pub whatsapp: WhatsAppClient,
}

pub fn parse_partner_row(row: &PgRow) -> Partner {
    Partner {
        id: row.get("id"),
        name: row.get("name"),
        slug: row.get("slug"),
        domain: row.get("domain"),
        logo_url: row.get("logo_url"),
        primary_color: row.get("primary_color"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn parse_organisation_row(row: &PgRow) -> Organisation {
    Organisation {
        id: row.get("id"),
        partner_id: row.get("partner_id"),
        name: row.get("name"),
        slug: row.get("slug"),
        contact_email: row.get("contact_email"),
        phone: row.get("phone"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn parse_admin_user_row(row: &PgRow) -> AdminUser {
    AdminUser {
        id: row.get("id"),
        email: row.get("email"),
        full_name: row.get("full_name"),
        role: Role::parse(&row.get::<String, _>("role")).unwrap_or(Role::OrgAdmin),
        partner_id: row.get("partner_id"),
        organisation_id: row.get("organisation_id"),
        active: row.get("active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        last_login_at: row.get("last_login_at"),
    }
}

pub fn parse_agent_row(row: &PgRow) -> Agent {
    Agent {
        id: row.get("id"),
        organisation_id: row.get("organisation_id"),
        name: row.get("name"),
        description: row.get("description"),
        system_prompt: row.get("system_prompt"),
        language: row.get("language"),
        status: row.get("status"),
        avatar_url: row.get("avatar_url"),
        waba_id: row.get("waba_id"),
        phone_number_id: row.get("phone_number_id"),
        display_phone_number: row.get("display_phone_number"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn parse_example_row(row: &PgRow) -> Example {
    Example {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        title: row.get("title"),
        conversation: serde_json::from_str(&row.get::<String, _>("conversation"))
            .unwrap_or_default(),
        created_at: row.get("created_at"),
    }
}

pub fn parse_faq_row(row: &PgRow) -> Faq {
    Faq {
        id: row.get("id"),
        question: row.get("question"),
        answer: row.get("answer"),
        category: row.get("category"),
        position: row.get("position"),
        published: row.get("published"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn parse_quote_row(row: &PgRow) -> Quote {
    let items: Vec<QuoteItem> =
        serde_json::from_str(&row.get::<String, _>("items")).unwrap_or_default();
    let discount_percent: i32 = row.get("discount_percent");
    Quote {
        id: row.get("id"),
        number: row.get("number"),
        organisation_id: row.get("organisation_id"),
        prospect_name: row.get("prospect_name"),
        prospect_email: row.get("prospect_email"),
        totals: crate::admin::quotes::compute_totals(&items, discount_percent),
        items,
        currency: row.get("currency"),
        discount_percent,
        status: row.get("status"),
        notes: row.get("notes"),
        document_url: row.get("document_url"),
        valid_until: row.get("valid_until"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

pub fn parse_chat_session_row(row: &PgRow) -> ChatSession {
    ChatSession {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        contact_wa_id: row.get("contact_wa_id"),
        contact_name: row.get("contact_name"),
        status: row.get("status"),
        last_message_at: row.get("last_message_at"),
        created_at: row.get("created_at"),
    }
}

pub fn parse_chat_message_row(row: &PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        session_id: row.get("session_id"),
        role: row.get("role"),
        content: row.get("content"),
        wa_message_id: row.get("wa_message_id"),
        created_at: row.get("created_at"),
    }
}

/// `?q=&page=&pageSize=` accepted by every admin list endpoint.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub q: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
    pub organisation_id: Option<String>,
    pub agent_id: Option<String>,
    pub status: Option<String>,
}

pub const DEFAULT_PAGE_SIZE: i64 = 25;
pub const MAX_PAGE_SIZE: i64 = 100;

impl ListQuery {
    pub fn page(&self) -> i64 {
        self.page.unwrap_or(1).max(1)
    }

    pub fn page_size(&self) -> i64 {
        self.page_size
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.page_size())
    }

    /// `%term%` for ILIKE filters, or `%` when no search term was given.
    pub fn like_pattern(&self) -> String {
        let term = self.q.as_deref().map(str::trim).unwrap_or("");
        if term.is_empty() {
            return "%".to_string();
        }
        let escaped = term
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        format!("%{escaped}%")
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub page_size: i64,
}

impl<T> Page<T> {
    pub fn new(items: Vec<T>, total: i64, query: &ListQuery) -> Self {
        Self {
            items,
            total,
            page: query.page(),
            page_size: query.page_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestOtpBody {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyOtpBody {
    pub email: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePartnerBody {
    pub name: String,
    pub slug: Option<String>,
    pub domain: Option<String>,
    pub primary_color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePartnerBody {
    pub name: Option<String>,
    pub domain: Option<String>,
    pub primary_color: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrganisationBody {
    pub name: String,
    pub slug: Option<String>,
    pub partner_id: Option<String>,
    #[serde(default)]
    pub contact_email: String,
    #[serde(default)]
    pub phone: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrganisationBody {
    pub name: Option<String>,
    pub contact_email: Option<String>,
    pub phone: Option<String>,
    pub partner_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAdminUserBody {
    pub email: String,
    #[serde(default)]
    pub full_name: String,
    pub role: Role,
    pub partner_id: Option<String>,
    pub organisation_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAdminUserBody {
    pub full_name: Option<String>,
    pub role: Option<Role>,
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateAgentBody {
    pub organisation_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub system_prompt: String,
    pub language: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAgentBody {
    pub name: Option<String>,
    pub description: Option<String>,
    pub system_prompt: Option<String>,
    pub language: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExampleBody {
    pub title: String,
    pub conversation: Vec<ConversationTurn>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFaqBody {
    pub question: String,
    pub answer: String,
    #[serde(default)]
    pub category: String,
    pub position: Option<i32>,
    #[serde(default)]
    pub published: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateFaqBody {
    pub question: Option<String>,
    pub answer: Option<String>,
    pub category: Option<String>,
    pub position: Option<i32>,
    pub published: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorderFaqsBody {
    pub ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateFaqBody {
    pub question: String,
    #[serde(default)]
    pub context: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateQuoteBody {
    pub organisation_id: Option<String>,
    pub prospect_name: String,
    pub prospect_email: String,
    pub items: Vec<QuoteItem>,
    pub currency: Option<String>,
    #[serde(default)]
    pub discount_percent: i32,
    #[serde(default)]
    pub notes: String,
    pub valid_until: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateQuoteBody {
    pub prospect_name: Option<String>,
    pub prospect_email: Option<String>,
    pub items: Option<Vec<QuoteItem>>,
    pub currency: Option<String>,
    pub discount_percent: Option<i32>,
    pub notes: Option<String>,
    pub valid_until: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorReplyBody {
    pub text: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectWhatsAppBody {
    pub waba_id: String,
    pub phone_number_id: String,
    pub pin: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateConversationBody {
    pub agent_id: String,
    pub topic: Option<String>,
    pub turns: Option<usize>,
    #[serde(default)]
    pub save: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactFormBody {
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub company: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_query_clamps_paging() {
        let query = ListQuery {
            page: Some(0),
            page_size: Some(1000),
            ..Default::default()
        };
        assert_eq!(query.page(), 1);
        assert_eq!(query.page_size(), MAX_PAGE_SIZE);
        assert_eq!(query.offset(), 0);

        let query = ListQuery {
            page: Some(3),
            ..Default::default()
        };
        assert_eq!(query.page_size(), DEFAULT_PAGE_SIZE);
        assert_eq!(query.offset(), 50);
    }

    #[test]
    fn huge_page_numbers_do_not_overflow() {
        let query = ListQuery {
            page: Some(i64::MAX),
            page_size: Some(MAX_PAGE_SIZE),
            ..Default::default()
        };
        assert_eq!(query.offset(), i64::MAX);
        assert_eq!(Page::new(Vec::<()>::new(), 0, &query).page, i64::MAX);
    }

    #[test]
    fn like_pattern_escapes_wildcards() {
        let query = ListQuery {
            q: Some(" 50%_off ".to_string()),
            ..Default::default()
        };
        assert_eq!(query.like_pattern(), "%50\\%\\_off%");
        assert_eq!(ListQuery::default().like_pattern(), "%");
    }

    #[test]
    fn quote_items_default_to_one_off() {
        let item: QuoteItem =
            serde_json::from_str(r#"{"description":"Setup","quantity":1,"unitPrice":50000}"#)
                .unwrap();
        assert!(!item.recurring);
        assert_eq!(item.unit_price, 50_000);
    }
}
