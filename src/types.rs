use serde::{Deserialize, Serialize};

/// Direction tag for a received message.
pub const DIRECTION_RECEIVED: &str = "recibido";
/// Direction tag for an operator- or bot-sent message.
pub const DIRECTION_SENT: &str = "enviado";

/// One entry in the per-tenant in-memory message log. The Spanish field
/// names are the wire contract shared with the operator UI and the
/// automation webhook and must not be renamed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default)]
    pub id: String,
    pub numero: String,
    #[serde(default)]
    pub nombre: Option<String>,
    pub mensaje: String,
    pub hora: String,
    pub tipo: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub respuesta: Option<String>,
}

/// Snapshot of one conversation's bot state, as returned by the listing
/// endpoint.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatStateSummary {
    pub conversation: String,
    pub bot_active: bool,
    pub last_activity: String,
    pub last_modified: String,
}

/// A tenant-scoped contact. Contacts flagged as excluded never trigger the
/// automation pipeline, regardless of the conversation's bot state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub tenant_id: String,
    pub number: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub excluded_from_automation: bool,
}

#[derive(Debug, Deserialize)]
pub struct BotStateQuery {
    pub conversation: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetBotStateBody {
    pub conversation: String,
    pub is_active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeactivateBody {
    #[serde(default)]
    pub duration_minutes: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct ConfigChatbotBody {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    pub numero: String,
    pub mensaje: String,
    #[serde(default)]
    pub is_automated: bool,
}

#[derive(Debug, Deserialize)]
pub struct BulkListBody {
    pub numeros: String,
    pub mensaje: String,
}

/// Inbound "message received" event posted by the WhatsApp bridge.
#[derive(Debug, Deserialize)]
pub struct InboundMessageBody {
    pub numero: String,
    #[serde(default)]
    pub nombre: Option<String>,
    pub mensaje: String,
    #[serde(default)]
    pub hora: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContactBody {
    pub number: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub excluded_from_automation: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchContactBody {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub excluded_from_automation: Option<bool>,
}
