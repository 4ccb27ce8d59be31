//! Scenario: Circuit Opens And Fallback Succeeds
//!
//! # Invariant under test
//! Five consecutive 503s from the primary provider exhaust the overloaded
//! retry budget (delays ≈5s, 10s, 20s, 40s ±20%), open the circuit, and
//! escalate to the configured alternate provider; its success completes the
//! stream. Journal: 5 retry_attempt, 1 retry_exhaust, 1 circuit_event
//! closed→open, 1 fallback_event A→B.

use std::collections::HashMap;
use std::sync::Arc;

use pdk_provider::{
    CircuitState, CircuitTable, ControllerConfig, JournalEvent, ProviderFallback, ProviderRequest,
    ProviderRequestController, StreamEvent, TransportFailure,
};
use pdk_testkit::{MemoryJournal, ScriptedReply, ScriptedTransport};
use tokio_util::sync::CancellationToken;

fn controller_with_fallback(
    transport: &ScriptedTransport,
    journal: &MemoryJournal,
) -> ProviderRequestController {
    let mut fallbacks = HashMap::new();
    fallbacks.insert(
        "provider-a".to_string(),
        ProviderFallback {
            large_context_model: None,
            alternate_provider: Some("provider-b".to_string()),
        },
    );
    ProviderRequestController::new(
        Arc::new(transport.clone()),
        Arc::new(journal.clone()),
        Arc::new(CircuitTable::new()),
        ControllerConfig { fallbacks },
    )
}

#[tokio::test(start_paused = true)]
async fn five_overloads_open_circuit_then_alternate_provider_streams() {
    let transport = ScriptedTransport::new(vec![
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedTransport::ok_chunks(&["hello", " world"]),
    ]);
    let journal = MemoryJournal::new();
    let controller = controller_with_fallback(&transport, &journal);

    let mut rx = controller.stream(ProviderRequest {
        provider_id: "provider-a".into(),
        model_id: "model-x".into(),
        body: serde_json::json!({"prompt": "hi"}),
        idempotency_key: "idem-1".into(),
        ctx: CancellationToken::new(),
    });

    let mut chunks = Vec::new();
    let mut done = false;
    while let Some(event) = rx.recv().await {
        match event {
            StreamEvent::Chunk(c) => chunks.push(c.content),
            StreamEvent::Done => {
                done = true;
                break;
            }
            StreamEvent::Failed(e) => panic!("stream must succeed via fallback: {e}"),
            StreamEvent::Restarted => panic!("no partial content was delivered before fallback"),
        }
    }
    assert!(done);
    assert_eq!(chunks, vec!["hello", " world"]);

    // Primary exhausted all 5 attempts, fallback used one.
    let requests = transport.requests();
    assert_eq!(requests.len(), 6);
    assert!(requests[..5].iter().all(|r| r.provider_id == "provider-a"));
    assert_eq!(requests[5].provider_id, "provider-b");
    assert_eq!(requests[5].model_id, "model-x");

    // Circuit for the primary is open; further calls would short-circuit.
    assert_eq!(controller.breakers().state_of("provider-a"), CircuitState::Open);
    assert_eq!(controller.breakers().state_of("provider-b"), CircuitState::Closed);

    // Journal contents.
    let events = journal.events();
    let retry_attempts: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            JournalEvent::RetryAttempt {
                attempt, delay_ms, ..
            } => Some((*attempt, *delay_ms)),
            _ => None,
        })
        .collect();
    assert_eq!(retry_attempts.len(), 5);

    // Delays ≈ 5s, 10s, 20s, 40s with ±20% jitter; the final attempt has
    // no delay (it exhausts).
    let expected = [(5_000u64, 1u32), (10_000, 2), (20_000, 3), (40_000, 4)];
    for (i, (base, attempt)) in expected.iter().enumerate() {
        let (got_attempt, got_delay) = retry_attempts[i];
        assert_eq!(got_attempt, *attempt);
        let lo = base * 8 / 10;
        let hi = base * 12 / 10;
        assert!(
            (lo..=hi).contains(&got_delay),
            "attempt {attempt} delay {got_delay} outside [{lo}, {hi}]"
        );
    }
    assert_eq!(retry_attempts[4], (5, 0));

    assert_eq!(
        journal.count(|e| matches!(e, JournalEvent::RetryExhaust { .. })),
        1
    );
    assert_eq!(
        journal.count(|e| matches!(
            e,
            JournalEvent::CircuitEvent { from, to, .. } if from == "closed" && to == "open"
        )),
        1
    );
    assert_eq!(
        journal.count(|e| matches!(
            e,
            JournalEvent::FallbackEvent { kind, from_provider, to_provider, .. }
                if kind == "provider" && from_provider == "provider-a" && to_provider == "provider-b"
        )),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn open_circuit_short_circuits_without_touching_transport() {
    let transport = ScriptedTransport::new(vec![
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
        ScriptedReply::Fail(TransportFailure::http(503, "overloaded")),
    ]);
    let journal = MemoryJournal::new();
    // No fallback configured: exhaustion bubbles up and the circuit stays
    // open for the next request.
    let controller = ProviderRequestController::new(
        Arc::new(transport.clone()),
        Arc::new(journal.clone()),
        Arc::new(CircuitTable::new()),
        ControllerConfig::default(),
    );

    let req = ProviderRequest {
        provider_id: "provider-a".into(),
        model_id: "model-x".into(),
        body: serde_json::json!({}),
        idempotency_key: "idem-2".into(),
        ctx: CancellationToken::new(),
    };

    let err = controller.complete(&req).await.unwrap_err();
    assert!(err.to_string().contains("transient"), "{err}");
    assert_eq!(transport.requests().len(), 5);

    // Next call: circuit open, transport untouched.
    let err = controller.complete(&req).await.unwrap_err();
    assert!(err.to_string().contains("circuit open"), "{err}");
    assert_eq!(transport.requests().len(), 5, "no further transport calls");
}
