//! Scenario: Retries Reuse The Idempotency Key
//!
//! # Invariant under test
//! Every transport attempt — first try, retries, and fallback hops —
//! carries the caller-supplied idempotency key verbatim so downstream
//! providers can deduplicate.

use std::collections::HashMap;
use std::sync::Arc;

use pdk_provider::{
    CircuitTable, ControllerConfig, ProviderFallback, ProviderRequest,
    ProviderRequestController, TransportFailure,
};
use pdk_testkit::{MemoryJournal, ScriptedReply, ScriptedTransport};
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn all_attempts_carry_the_same_key() {
    let transport = ScriptedTransport::new(vec![
        ScriptedReply::Fail(TransportFailure::http(500, "boom")),
        ScriptedReply::Fail(TransportFailure::http(500, "boom")),
        ScriptedReply::Final(serde_json::json!({"ok": true})),
    ]);
    let journal = MemoryJournal::new();
    let controller = ProviderRequestController::new(
        Arc::new(transport.clone()),
        Arc::new(journal.clone()),
        Arc::new(CircuitTable::new()),
        ControllerConfig::default(),
    );

    let value = controller
        .complete(&ProviderRequest {
            provider_id: "provider-a".into(),
            model_id: "model-x".into(),
            body: serde_json::json!({"prompt": "hi"}),
            idempotency_key: "caller-chosen-key".into(),
            ctx: CancellationToken::new(),
        })
        .await
        .expect("third attempt succeeds");
    assert_eq!(value, serde_json::json!({"ok": true}));

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert!(requests
        .iter()
        .all(|r| r.idempotency_key == "caller-chosen-key"));
}

#[tokio::test(start_paused = true)]
async fn fallback_hop_keeps_the_key_too() {
    let transport = ScriptedTransport::new(vec![
        // Two timeouts exhaust the timeout budget on the primary.
        ScriptedReply::Fail(TransportFailure::timeout("no response")),
        ScriptedReply::Fail(TransportFailure::timeout("no response")),
        ScriptedReply::Final(serde_json::json!({"via": "alternate"})),
    ]);
    let journal = MemoryJournal::new();

    let mut fallbacks = HashMap::new();
    fallbacks.insert(
        "provider-a".to_string(),
        ProviderFallback {
            large_context_model: None,
            alternate_provider: Some("provider-b".to_string()),
        },
    );
    let controller = ProviderRequestController::new(
        Arc::new(transport.clone()),
        Arc::new(journal.clone()),
        Arc::new(CircuitTable::new()),
        ControllerConfig { fallbacks },
    );

    let value = controller
        .complete(&ProviderRequest {
            provider_id: "provider-a".into(),
            model_id: "model-x".into(),
            body: serde_json::json!({}),
            idempotency_key: "stable-key".into(),
            ctx: CancellationToken::new(),
        })
        .await
        .expect("alternate provider succeeds");
    assert_eq!(value, serde_json::json!({"via": "alternate"}));

    let requests = transport.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(requests[2].provider_id, "provider-b");
    assert!(requests.iter().all(|r| r.idempotency_key == "stable-key"));
}
