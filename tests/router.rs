use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use wiremock::{matchers::method, Mock, MockServer, ResponseTemplate};

use wa_gateway_server::{
    app::{
        handle_incoming_message, send_bulk, send_operator_message, AppState, RouteOutcome,
        SendOutcome,
    },
    chat_state::{ChatStateRegistry, DEFAULT_SUSPEND},
    store::{MemoryTenantStore, TenantStore},
    transport::{Transport, TransportError},
    types::Contact,
};

/// Transport double: records every send, optionally erroring for
/// configured chat ids.
#[derive(Default)]
struct FakeTransport {
    sends: Mutex<Vec<(String, String)>>,
    fail_for: Mutex<Vec<String>>,
}

impl FakeTransport {
    fn sent(&self) -> Vec<(String, String)> {
        self.sends.lock().clone()
    }

    fn fail_chat(&self, chat_id: &str) {
        self.fail_for.lock().push(chat_id.to_string());
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send_message(
        &self,
        _tenant_id: &str,
        chat_id: &str,
        body: &str,
    ) -> Result<(), TransportError> {
        if self.fail_for.lock().iter().any(|c| c == chat_id) {
            return Err(TransportError::Unavailable("simulated outage".to_string()));
        }
        self.sends
            .lock()
            .push((chat_id.to_string(), body.to_string()));
        Ok(())
    }
}

fn test_state(
    webhook_url: Option<String>,
) -> (Arc<AppState>, Arc<MemoryTenantStore>, Arc<FakeTransport>) {
    let store = Arc::new(MemoryTenantStore::new());
    let registry = ChatStateRegistry::new(store.clone());
    let transport = Arc::new(FakeTransport::default());
    let mut app = AppState::new(store.clone(), registry, transport.clone(), webhook_url);
    app.bulk_send_delay = Duration::from_millis(0);
    (Arc::new(app), store, transport)
}

async fn persisted(state: &Arc<AppState>, tenant_id: &str) -> Vec<wa_gateway_server::types::MessageRecord> {
    state
        .messages
        .read()
        .await
        .get(tenant_id)
        .cloned()
        .unwrap_or_default()
}

#[tokio::test]
async fn excluded_contact_never_reaches_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "respuesta": "nope" })))
        .expect(0)
        .mount(&server)
        .await;

    let (state, store, transport) = test_state(Some(server.uri()));
    store
        .create_contact(Contact {
            tenant_id: "t1".to_string(),
            number: "51987654321".to_string(),
            name: Some("Ana".to_string()),
            excluded_from_automation: true,
        })
        .await
        .expect("contact");

    let outcome = handle_incoming_message(
        &state,
        "t1",
        "51987654321@c.us",
        Some("Ana".to_string()),
        "necesito ayuda con mi pedido",
        None,
    )
    .await;

    assert_eq!(outcome, RouteOutcome::Excluded);
    assert!(transport.sent().is_empty());
    let log = persisted(&state, "t1").await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].tipo, "recibido");
    assert!(log[0].respuesta.is_none());
    server.verify().await;
}

#[tokio::test]
async fn faq_match_short_circuits_webhook() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "respuesta": "nope" })))
        .expect(0)
        .mount(&server)
        .await;

    let (state, _, transport) = test_state(Some(server.uri()));
    let outcome = handle_incoming_message(
        &state,
        "t1",
        "51987654321@c.us",
        Some("Luis".to_string()),
        "¿Dónde queda el colegio?",
        None,
    )
    .await;

    assert_eq!(outcome, RouteOutcome::FaqAnswered);
    let sends = transport.sent();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, "51987654321@c.us");
    assert!(sends[0].1.contains("Av. Aviación"));
    let log = persisted(&state, "t1").await;
    assert_eq!(log.len(), 1);
    assert!(log[0].respuesta.as_deref().unwrap().contains("Av. Aviación"));
    server.verify().await;
}

#[tokio::test]
async fn webhook_reply_is_sent_and_persisted() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "respuesta": "Gracias por escribirnos." })),
        )
        .expect(1)
        .mount(&server)
        .await;

    let (state, _, transport) = test_state(Some(server.uri()));
    let outcome = handle_incoming_message(
        &state,
        "t1",
        "51987654321@c.us",
        None,
        "necesito ayuda con mi pedido",
        None,
    )
    .await;

    assert_eq!(outcome, RouteOutcome::WebhookAnswered);
    let sends = transport.sent();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].1, "Gracias por escribirnos.");
    let log = persisted(&state, "t1").await;
    assert_eq!(log[0].respuesta.as_deref(), Some("Gracias por escribirnos."));
    server.verify().await;
}

#[tokio::test]
async fn webhook_without_reply_field_persists_received_only() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let (state, _, transport) = test_state(Some(server.uri()));
    let outcome = handle_incoming_message(
        &state,
        "t1",
        "51987654321@c.us",
        None,
        "necesito ayuda con mi pedido",
        None,
    )
    .await;

    assert_eq!(outcome, RouteOutcome::NoReply);
    assert!(transport.sent().is_empty());
    let log = persisted(&state, "t1").await;
    assert_eq!(log.len(), 1);
    assert!(log[0].respuesta.is_none());
}

#[tokio::test]
async fn webhook_failure_keeps_message_and_reports_no_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;

    let (state, _, transport) = test_state(Some(server.uri()));
    let outcome = handle_incoming_message(
        &state,
        "t1",
        "51987654321@c.us",
        None,
        "necesito ayuda con mi pedido",
        None,
    )
    .await;

    assert_eq!(outcome, RouteOutcome::NoReply);
    assert!(transport.sent().is_empty());
    assert_eq!(persisted(&state, "t1").await.len(), 1);
}

#[tokio::test]
async fn group_status_and_empty_messages_are_ignored() {
    let (state, _, transport) = test_state(None);

    for (numero, mensaje) in [
        ("123456789-987654@g.us", "hola"),
        ("status@broadcast", "hola"),
        ("51987654321@c.us", "   "),
    ] {
        let outcome =
            handle_incoming_message(&state, "t1", numero, None, mensaje, None).await;
        assert_eq!(outcome, RouteOutcome::Ignored);
    }

    assert!(transport.sent().is_empty());
    assert!(persisted(&state, "t1").await.is_empty());
}

#[tokio::test]
async fn inactive_chat_suppresses_automation() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "respuesta": "nope" })))
        .expect(0)
        .mount(&server)
        .await;

    let (state, _, transport) = test_state(Some(server.uri()));
    state
        .registry
        .set_bot_state("t1", "51987654321@c.us", false, false, DEFAULT_SUSPEND)
        .await;

    let outcome = handle_incoming_message(
        &state,
        "t1",
        "51987654321@c.us",
        None,
        "necesito ayuda con mi pedido",
        None,
    )
    .await;

    assert_eq!(outcome, RouteOutcome::Suppressed);
    assert!(transport.sent().is_empty());
    assert_eq!(persisted(&state, "t1").await.len(), 1);
    server.verify().await;
}

#[tokio::test]
async fn disabled_tenant_config_suppresses_even_active_chats() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "respuesta": "nope" })))
        .expect(0)
        .mount(&server)
        .await;

    let (state, store, _) = test_state(Some(server.uri()));
    // Seed the chat while the tenant is globally enabled...
    assert!(state.registry.is_bot_active("t1", "51987654321@c.us").await);
    // ...then flip the global flag off. Both must hold for automation.
    store.set_bot_config("t1", false).await;

    let outcome = handle_incoming_message(
        &state,
        "t1",
        "51987654321@c.us",
        None,
        "necesito ayuda con mi pedido",
        None,
    )
    .await;

    assert_eq!(outcome, RouteOutcome::Suppressed);
    server.verify().await;
}

#[tokio::test]
async fn manual_send_suspends_bot_even_when_transport_fails() {
    let (state, _, transport) = test_state(None);
    transport.fail_chat("51987654321@c.us");

    let result =
        send_operator_message(&state, "t1", "51987654321", "hola, le escribo yo", false).await;

    assert!(result.is_err());
    assert!(!state.registry.is_bot_active("t1", "51987654321@c.us").await);
    assert!(persisted(&state, "t1").await.is_empty());
}

#[tokio::test]
async fn manual_send_suspends_bot_and_persists_as_sent() {
    let (state, _, transport) = test_state(None);

    let outcome = send_operator_message(&state, "t1", "51987654321", "buenas tardes", false)
        .await
        .expect("send");

    assert_eq!(outcome, SendOutcome::Sent);
    assert!(!state.registry.is_bot_active("t1", "51987654321@c.us").await);
    assert_eq!(transport.sent().len(), 1);
    let log = persisted(&state, "t1").await;
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].tipo, "enviado");
}

#[tokio::test(start_paused = true)]
async fn manual_send_cooldown_expires_and_bot_returns() {
    let (state, _, _) = test_state(None);

    send_operator_message(&state, "t1", "51987654321", "un momento por favor", false)
        .await
        .expect("send");
    assert!(!state.registry.is_bot_active("t1", "51987654321@c.us").await);

    tokio::time::sleep(DEFAULT_SUSPEND + Duration::from_secs(1)).await;
    assert!(state.registry.is_bot_active("t1", "51987654321@c.us").await);
}

#[tokio::test]
async fn automated_send_refused_when_operator_holds_chat() {
    let (state, _, transport) = test_state(None);
    state
        .registry
        .set_bot_state("t1", "51987654321@c.us", false, false, DEFAULT_SUSPEND)
        .await;

    let outcome = send_operator_message(&state, "t1", "51987654321", "respuesta del bot", true)
        .await
        .expect("send");

    assert_eq!(outcome, SendOutcome::Suppressed);
    assert!(transport.sent().is_empty());
    assert!(persisted(&state, "t1").await.is_empty());
}

#[tokio::test]
async fn automated_send_goes_through_when_bot_is_active() {
    let (state, _, transport) = test_state(None);

    let outcome = send_operator_message(&state, "t1", "51987654321", "respuesta del bot", true)
        .await
        .expect("send");

    assert_eq!(outcome, SendOutcome::Sent);
    assert_eq!(transport.sent().len(), 1);
    // Automated sends do not take over the chat.
    assert!(state.registry.is_bot_active("t1", "51987654321@c.us").await);
}

#[tokio::test]
async fn bulk_send_skips_excluded_and_survives_failures() {
    let (state, store, transport) = test_state(None);
    store
        .create_contact(Contact {
            tenant_id: "t1".to_string(),
            number: "51900000001".to_string(),
            name: None,
            excluded_from_automation: true,
        })
        .await
        .expect("contact");
    transport.fail_chat("51900000002@c.us");

    let batch = vec![
        ("51900000001".to_string(), "promo".to_string()),
        ("51900000002".to_string(), "promo".to_string()),
        ("51900000003".to_string(), "promo".to_string()),
    ];
    let sent = send_bulk(&state, "t1", batch).await;

    assert_eq!(sent, 1);
    let sends = transport.sent();
    assert_eq!(sends.len(), 1);
    assert_eq!(sends[0].0, "51900000003@c.us");
}
