use async_trait::async_trait;
use serde_json::{json, Value};
use thiserror::Error;

use crate::types::MessageRecord;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("whatsapp bridge request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("whatsapp bridge rejected the send ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

/// Outbound side of the WhatsApp session collaborator. The bridge process
/// owns the actual device sessions; this trait is the only seam the router
/// and send path talk to, so tests can swap in recording or failing fakes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        tenant_id: &str,
        chat_id: &str,
        body: &str,
    ) -> Result<(), TransportError>;
}

/// HTTP client for the WhatsApp bridge, one session per tenant.
pub struct WhatsappBridge {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl WhatsappBridge {
    pub fn new(base_url: String, token: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        }
    }
}

#[async_trait]
impl Transport for WhatsappBridge {
    async fn send_message(
        &self,
        tenant_id: &str,
        chat_id: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        let mut request = self
            .client
            .post(format!(
                "{}/sessions/{}/messages",
                self.base_url, tenant_id
            ))
            .json(&json!({ "chatId": chat_id, "message": body }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        Err(TransportError::Rejected {
            status: status.as_u16(),
            body,
        })
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("automation webhook unreachable: {0}")]
    Request(#[from] reqwest::Error),
    #[error("automation webhook returned status {0}")]
    Status(u16),
}

/// Forward an inbound message to the automation webhook. A `respuesta`
/// string in the response body is the generated reply; anything else means
/// no reply. One attempt, no retries.
pub async fn request_automation_reply(
    client: &reqwest::Client,
    url: &str,
    record: &MessageRecord,
) -> Result<Option<String>, WebhookError> {
    let response = client
        .post(url)
        .json(&json!({
            "numero": record.numero,
            "nombre": record.nombre,
            "mensaje": record.mensaje,
            "hora": record.hora,
        }))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(WebhookError::Status(status.as_u16()));
    }

    let body = response.json::<Value>().await?;
    Ok(body
        .get("respuesta")
        .and_then(Value::as_str)
        .map(|reply| reply.trim().to_string())
        .filter(|reply| !reply.is_empty()))
}
