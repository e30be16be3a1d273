use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

use super::{EmailProvider, Recipient};
use crate::error::{PipelineError, Result};
use crate::model::EmailMessage;

/// Brevo (ex-Sendinblue) transactional email API client.
pub struct BrevoClient {
    api_url: String,
    api_key: String,
    sender_name: String,
    sender_email: String,
    client: Client,
}

impl BrevoClient {
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        sender_name: impl Into<String>,
        sender_email: impl Into<String>,
        timeout_secs: u64,
    ) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build reqwest client: {}", e))?;

        Ok(Self {
            api_url: api_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            sender_name: sender_name.into(),
            sender_email: sender_email.into(),
            client,
        })
    }
}

#[async_trait]
impl EmailProvider for BrevoClient {
    async fn send(&self, message: &EmailMessage, to: &Recipient) -> Result<()> {
        let body = SendEmailRequest {
            sender: Contact {
                name: Some(&self.sender_name),
                email: &self.sender_email,
            },
            to: vec![Contact {
                name: Some(to.name.as_str()).filter(|n| !n.is_empty()),
                email: &to.email,
            }],
            subject: &message.subject,
            html_content: &message.html_body,
            text_content: &message.text_body,
        };

        let response = self
            .client
            .post(format!("{}/smtp/email", self.api_url))
            .header("accept", "application/json")
            .header("api-key", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| PipelineError::DispatchFailed(format!("email request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(PipelineError::DispatchThrottled { retry_after });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(PipelineError::DispatchFailed(format!(
                "email API error {}: {}",
                status, text
            )));
        }

        debug!(status = %status, "brevo: message accepted");
        Ok(())
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SendEmailRequest<'a> {
    sender: Contact<'a>,
    to: Vec<Contact<'a>>,
    subject: &'a str,
    html_content: &'a str,
    text_content: &'a str,
}

#[derive(Debug, Serialize)]
struct Contact<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    email: &'a str,
}
