use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use thiserror::Error;
use tracing::info;

use crate::config::EmailConfig;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("email provider returned {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError>;
}

/// Sends through a Resend-compatible JSON API.
pub struct HttpMailer {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    from: String,
}

impl HttpMailer {
    pub fn new(http: reqwest::Client, config: &EmailConfig, api_key: String) -> Self {
        Self {
            http,
            api_url: config.api_url.clone(),
            api_key,
            from: config.from.clone(),
        }
    }
}

#[async_trait]
impl Mailer for HttpMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError> {
        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [message.to],
                "subject": message.subject,
                "html": message.html,
                "text": message.text,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmailError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        info!(to = %message.to, subject = %message.subject, "email sent");
        Ok(())
    }
}

/// Development mailer: writes the message to the log instead of sending it.
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, message: EmailMessage) -> Result<(), EmailError> {
        info!(
            to = %message.to,
            subject = %message.subject,
            body = %message.text,
            "email not sent (no EMAIL_API_KEY configured)"
        );
        Ok(())
    }
}

pub fn mailer_from_config(http: reqwest::Client, config: &EmailConfig) -> Arc<dyn Mailer> {
    match &config.api_key {
        Some(key) => Arc::new(HttpMailer::new(http, config, key.clone())),
        None => Arc::new(LogMailer),
    }
}
