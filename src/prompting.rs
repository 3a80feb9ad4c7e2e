use minijinja::{context, Environment, Value};
use serde::Serialize;

const CONVERSATION_SYSTEM_TEMPLATE: &str = include_str!("prompts/conversation_system.j2");
const CONVERSATION_USER_TEMPLATE: &str = include_str!("prompts/conversation_user.j2");
const FAQ_ANSWER_TEMPLATE: &str = include_str!("prompts/faq_answer.j2");
const AGENT_DESCRIPTION_TEMPLATE: &str = include_str!("prompts/agent_description.j2");
const OTP_EMAIL_TEMPLATE: &str = include_str!("templates/otp_email.html.j2");
const QUOTE_TEMPLATE: &str = include_str!("templates/quote.html.j2");
const QUOTE_EMAIL_TEMPLATE: &str = include_str!("templates/quote_email.html.j2");
const CONTACT_EMAIL_TEMPLATE: &str = include_str!("templates/contact_email.html.j2");

/// Names ending in `.html` get HTML auto-escaping.
fn render(name: &str, source: &str, ctx: Value) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template(name, source)?;
    env.get_template(name)?.render(ctx)
}

pub struct ConversationPromptContext<'a> {
    pub agent_name: &'a str,
    pub description: &'a str,
    pub system_prompt: &'a str,
    pub language: &'a str,
    pub topic: &'a str,
    pub turns: usize,
}

pub fn render_conversation_system_prompt(ctx: &ConversationPromptContext<'_>) -> String {
    render(
        "conversation_system",
        CONVERSATION_SYSTEM_TEMPLATE,
        context! {
            agent_name => ctx.agent_name,
            description => ctx.description.trim(),
            system_prompt => ctx.system_prompt.trim(),
            language => ctx.language,
        },
    )
    .unwrap_or_else(|_| fallback_conversation_system_prompt(ctx))
}

fn fallback_conversation_system_prompt(ctx: &ConversationPromptContext<'_>) -> String {
    let mut prompt = format!(
        "You write example WhatsApp conversations for the chatbot \"{}\" in language \"{}\".\n",
        ctx.agent_name, ctx.language
    );
    if !ctx.system_prompt.trim().is_empty() {
        prompt.push_str("\nChatbot instructions:\n");
        prompt.push_str(ctx.system_prompt.trim());
        prompt.push('\n');
    }
    prompt.push_str(
        "\nReply with a JSON array of {\"role\": \"user\"|\"assistant\", \"content\": string} objects only.\n",
    );
    prompt
}

pub fn render_conversation_user_prompt(ctx: &ConversationPromptContext<'_>) -> String {
    render(
        "conversation_user",
        CONVERSATION_USER_TEMPLATE,
        context! {
            turns => ctx.turns,
            topic => ctx.topic.trim(),
        },
    )
    .unwrap_or_else(|_| format!("Write a conversation of exactly {} messages.", ctx.turns))
}

pub fn render_faq_answer_prompt(question: &str, facts: &str) -> String {
    render(
        "faq_answer",
        FAQ_ANSWER_TEMPLATE,
        context! { question => question.trim(), context => facts.trim() },
    )
    .unwrap_or_else(|_| format!("Answer this FAQ question in plain text: {}", question.trim()))
}

pub fn render_agent_description_prompt(agent_name: &str, system_prompt: &str) -> String {
    render(
        "agent_description",
        AGENT_DESCRIPTION_TEMPLATE,
        context! { agent_name => agent_name, system_prompt => system_prompt.trim() },
    )
    .unwrap_or_else(|_| {
        format!("Describe the chatbot \"{agent_name}\" in one sentence:\n{system_prompt}")
    })
}

pub struct OtpEmailContext<'a> {
    pub code: &'a str,
    pub ttl_minutes: i64,
}

/// Returns `(html, text)`.
pub fn render_otp_email(ctx: &OtpEmailContext<'_>) -> (String, String) {
    let text = format!(
        "Your AgentHub sign-in code is {}. It expires in {} minutes.",
        ctx.code, ctx.ttl_minutes
    );
    let html = render(
        "otp_email.html",
        OTP_EMAIL_TEMPLATE,
        context! { code => ctx.code, ttl_minutes => ctx.ttl_minutes },
    )
    .unwrap_or_else(|_| format!("<p>{text}</p>"));
    (html, text)
}

#[derive(Debug, Serialize)]
pub struct QuoteLine {
    pub description: String,
    pub recurring: bool,
    pub quantity: i64,
    pub unit_price: String,
    pub amount: String,
}

#[derive(Debug, Serialize)]
pub struct QuoteDocument {
    pub number: String,
    pub brand_name: String,
    pub primary_color: String,
    pub prospect_name: String,
    pub prospect_email: String,
    pub valid_until: String,
    pub items: Vec<QuoteLine>,
    pub discount_percent: i32,
    pub one_off_total: String,
    pub monthly_total: String,
    pub notes: String,
    pub document_url: String,
}

pub fn render_quote_document(doc: &QuoteDocument) -> Result<String, minijinja::Error> {
    render("quote.html", QUOTE_TEMPLATE, Value::from_serialize(doc))
}

pub fn render_quote_email(doc: &QuoteDocument) -> Result<String, minijinja::Error> {
    render("quote_email.html", QUOTE_EMAIL_TEMPLATE, Value::from_serialize(doc))
}

pub struct ContactEmailContext<'a> {
    pub name: &'a str,
    pub email: &'a str,
    pub company: &'a str,
    pub message: &'a str,
}

pub fn render_contact_email(ctx: &ContactEmailContext<'_>) -> (String, String) {
    let text = format!(
        "New contact request\nName: {}\nEmail: {}\nCompany: {}\n\n{}",
        ctx.name, ctx.email, ctx.company, ctx.message
    );
    let html = render(
        "contact_email.html",
        CONTACT_EMAIL_TEMPLATE,
        context! {
            name => ctx.name,
            email => ctx.email,
            company => ctx.company,
            message => ctx.message,
        },
    )
    .unwrap_or_else(|_| format!("<pre>{}</pre>", text.replace('<', "&lt;")));
    (html, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation_ctx<'a>(system_prompt: &'a str, topic: &'a str) -> ConversationPromptContext<'a> {
        ConversationPromptContext {
            agent_name: "Bella",
            description: "Books tables for Trattoria Roma",
            system_prompt,
            language: "it",
            topic,
            turns: 6,
        }
    }

    #[test]
    fn conversation_prompts_carry_agent_details() {
        let ctx = conversation_ctx("Only book between 19:00 and 23:00.", "a birthday dinner");
        let system = render_conversation_system_prompt(&ctx);
        assert!(system.contains("\"Bella\""));
        assert!(system.contains("Only book between 19:00 and 23:00."));
        assert!(system.contains("code \"it\""));

        let user = render_conversation_user_prompt(&ctx);
        assert!(user.contains("exactly 6 messages"));
        assert!(user.contains("a birthday dinner"));
    }

    #[test]
    fn conversation_prompt_without_topic_asks_for_a_common_reason() {
        let user = render_conversation_user_prompt(&conversation_ctx("", "  "));
        assert!(user.contains("common reason"));
    }

    #[test]
    fn otp_email_contains_code_in_both_parts() {
        let (html, text) = render_otp_email(&OtpEmailContext {
            code: "042917",
            ttl_minutes: 10,
        });
        assert!(html.contains("042917"));
        assert!(html.contains("10 minutes"));
        assert!(text.contains("042917"));
    }

    #[test]
    fn html_templates_escape_user_input() {
        let (html, _) = render_contact_email(&ContactEmailContext {
            name: "<script>alert(1)</script>",
            email: "a@b.co",
            company: "",
            message: "hi",
        });
        assert!(!html.contains("<script>"));
        assert!(html.contains("&lt;script&gt;"));
    }

    #[test]
    fn quote_document_lists_items_and_totals() {
        let doc = QuoteDocument {
            number: "Q-2026-0001".into(),
            brand_name: "AgentHub".into(),
            primary_color: "#25d366".into(),
            prospect_name: "Acme".into(),
            prospect_email: "buyer@acme.test".into(),
            valid_until: "2026-12-31".into(),
            items: vec![QuoteLine {
                description: "WhatsApp agent".into(),
                recurring: true,
                quantity: 2,
                unit_price: "99.00 EUR".into(),
                amount: "198.00 EUR".into(),
            }],
            discount_percent: 10,
            one_off_total: "0.00 EUR".into(),
            monthly_total: "178.20 EUR".into(),
            notes: String::new(),
            document_url: String::new(),
        };
        let html = render_quote_document(&doc).unwrap();
        assert!(html.contains("Quote <strong>Q-2026-0001</strong>"));
        assert!(html.contains("WhatsApp agent"));
        assert!(html.contains("Monthly"));
        assert!(html.contains("178.20 EUR"));
        assert!(html.contains("10%"));
    }
}
