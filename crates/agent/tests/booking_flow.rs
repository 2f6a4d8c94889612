use std::sync::Arc;
use std::time::Duration;

use concierge_agent::sandbox::{GET_SCHEDULE, MAKE_PAYMENT, RESERVE_CART, SET_CONTACT};
use concierge_agent::{BookingRuntime, RuntimeBuilder, SandboxBookingApi, ScriptedLlm, TurnReply};
use concierge_core::audit::InMemoryAuditSink;
use concierge_core::config::EngineConfig;
use concierge_core::domain::session::{FlowBranch, Session, SessionId, SessionStatus};
use concierge_core::domain::slots::GroupKey;
use concierge_core::flows::NodeRef;
use concierge_core::ledger::{InMemorySideEffectLedger, LedgerState, SideEffectLedger};
use concierge_core::store::{InMemorySessionStore, SessionStore};
use serde_json::{json, Value};

struct Harness {
    runtime: BookingRuntime,
    llm: Arc<ScriptedLlm>,
    api: Arc<SandboxBookingApi>,
    store: Arc<InMemorySessionStore>,
    ledger: Arc<InMemorySideEffectLedger>,
    audit: InMemoryAuditSink,
}

impl Harness {
    fn new() -> Self {
        Self::with_engine(engine(true, None))
    }

    fn with_engine(engine: EngineConfig) -> Self {
        let llm = Arc::new(ScriptedLlm::default());
        let api = Arc::new(SandboxBookingApi::new());
        let store = Arc::new(InMemorySessionStore::default());
        let ledger = Arc::new(InMemorySideEffectLedger::default());
        let audit = InMemoryAuditSink::default();
        let runtime = RuntimeBuilder::new(engine)
            .llm(llm.clone())
            .booking_api(api.clone())
            .store(store.clone())
            .ledger(ledger.clone())
            .audit(Arc::new(audit.clone()))
            .build()
            .expect("runtime builds");
        Self { runtime, llm, api, store, ledger, audit }
    }

    async fn say(&self, session_id: &SessionId, model_reply: String, text: &str) -> TurnReply {
        self.llm.push_reply(model_reply);
        self.runtime.process_turn(session_id, text).await.expect("turn")
    }

    async fn load(&self, session_id: &SessionId) -> Session {
        self.store.load(session_id).await.expect("load").expect("session exists")
    }

    /// Classify, product and arrival itinerary for an arrival-only booking.
    async fn reach_contact_step(&self, session_id: &SessionId) -> TurnReply {
        self.say(session_id, booking_intent(), "I'd like to book a lounge").await;
        self.say(session_id, product("ARRIVALONLY"), "Just for my arrival").await;
        self.say(session_id, arrival_itinerary(), "NMIA on 1 Dec 2030, AC920, two adults").await
    }
}

fn engine(collect_payment: bool, max_extraction_retries: Option<u32>) -> EngineConfig {
    EngineConfig {
        collect_payment,
        max_extraction_retries,
        llm_timeout_secs: 5,
        upstream_timeout_secs: 5,
    }
}

fn reply(done: bool, message: &str, collected: Value) -> String {
    json!({ "done": done, "message": message, "collected": collected }).to_string()
}

fn booking_intent() -> String {
    reply(true, "Happy to help with a booking.", json!({ "flow": "booking" }))
}

fn product(id: &str) -> String {
    reply(true, "Great choice.", json!({ "productid": id }))
}

fn arrival_itinerary() -> String {
    reply(
        true,
        "Thanks, I have your arrival details.",
        json!({
            "A": { "airportid": "NMIA", "traveldate": "20301201", "flightId": "AC920" },
            "tickets": { "adulttickets": 2, "childtickets": 0 }
        }),
    )
}

fn contact() -> String {
    reply(
        true,
        "Thanks.",
        json!({
            "title": "MS",
            "firstname": "Ada",
            "lastname": "Lovelace",
            "email": "ada@example.com",
            "phone": "876-555-0100"
        }),
    )
}

fn payment() -> String {
    reply(
        true,
        "Thanks.",
        json!({
            "cardHolder": "Ada Lovelace",
            "cardNumber": "4111111111111111",
            "cardType": "visa",
            "expiryDate": "12/35",
            "cvv": "123"
        }),
    )
}

fn confirmation(confirmed: bool) -> String {
    reply(true, "", json!({ "confirmed": confirmed }))
}

#[tokio::test]
async fn arrival_booking_runs_to_completion_with_one_call_per_side_effect() {
    let harness = Harness::new();
    let id = SessionId::from("arrival-happy-path");

    let first = harness.say(&id, booking_intent(), "I'd like to book a lounge").await;
    assert!(first.is_suspended);
    assert_eq!(first.node, "productType");
    assert!(first.assistant_text.contains("arrival, your departure, or both"));

    let second = harness.say(&id, product("ARRIVALONLY"), "Just for my arrival").await;
    assert_eq!(second.node, "infoCollector.A");
    assert!(second.assistant_text.contains("arrival flight details"));

    let third = harness.say(&id, arrival_itinerary(), "NMIA, 1 Dec 2030, AC920, 2 adults").await;
    assert_eq!(third.node, "contactInfo");
    assert!(third.assistant_text.contains("I've reserved your arrival lounge for 2 guest(s)."));

    let fourth = harness.say(&id, contact(), "Ms Ada Lovelace, ada@example.com").await;
    assert_eq!(fourth.node, "payment");

    let fifth = harness.say(&id, payment(), "Visa 4111 1111 1111 1111").await;
    assert_eq!(fifth.node, "confirm");
    assert!(fifth.assistant_text.contains("Arrival flight AC920 on 1 December 2030 at NMIA"));
    assert!(fifth.assistant_text.contains("**** 1111"));
    assert!(!fifth.assistant_text.contains("4111111111111111"));

    let sixth = harness.say(&id, confirmation(true), "yes please").await;
    assert!(sixth.is_terminal);
    assert!(!sixth.is_suspended);
    assert_eq!(sixth.node, "end");
    assert!(sixth.assistant_text.contains("Your reference is SBX-5000-1."));
    assert!(sixth.assistant_text.contains("Your lounge booking is confirmed"));

    assert_eq!(harness.api.calls(GET_SCHEDULE), 1);
    assert_eq!(harness.api.calls(RESERVE_CART), 1);
    assert_eq!(harness.api.calls(SET_CONTACT), 1);
    assert_eq!(harness.api.calls(MAKE_PAYMENT), 1);
    assert_eq!(harness.llm.remaining(), 0);

    let session = harness.load(&id).await;
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.turn_count, 6);
    assert_eq!(session.side_effect_ledger.len(), 4);
    assert!(session.side_effect_ledger.values().all(|entry| entry.state == LedgerState::Completed));
    assert_eq!(harness.ledger.entries_for_session(&id).await.expect("entries").len(), 4);

    let after = harness.runtime.process_turn(&id, "one more thing").await.expect("turn");
    assert!(after.is_terminal);
    assert!(after.assistant_text.contains("This conversation has ended"));
    assert_eq!(harness.api.total_calls(), 4);
}

#[tokio::test]
async fn general_question_ends_without_entering_booking_nodes() {
    let harness = Harness::new();
    let id = SessionId::from("general-question");
    harness.llm.push_reply(reply(true, "", json!({ "flow": "general" })));
    harness.llm.push_reply("Lounges open two hours before the first departure.");

    let turn = harness.runtime.process_turn(&id, "When do the lounges open?").await.expect("turn");

    assert!(turn.is_terminal);
    assert_eq!(turn.assistant_text, "Lounges open two hours before the first departure.");
    assert_eq!(harness.api.total_calls(), 0);

    let targets: Vec<String> = harness
        .audit
        .events_of_type("flow.transition_applied")
        .into_iter()
        .filter_map(|event| event.metadata.get("to").cloned())
        .collect();
    assert_eq!(targets, vec!["general".to_string(), "end".to_string()]);

    let session = harness.load(&id).await;
    assert_eq!(session.flow, Some(FlowBranch::General));
    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.side_effect_ledger.is_empty());
}

#[tokio::test]
async fn partial_itinerary_answers_stay_on_the_collector_until_complete() {
    let harness = Harness::new();
    let id = SessionId::from("partial-itinerary");
    harness.say(&id, booking_intent(), "Book a lounge").await;
    harness.say(&id, product("ARRIVALONLY"), "arrival").await;

    let utterances = [
        (json!({ "A": { "airportid": "nmia" } }), "Landing at Norman Manley"),
        (json!({ "A": { "traveldate": "20301201" } }), "on the first of December 2030"),
        (json!({ "A": { "flightId": "ac 920" } }), "flight AC 920"),
    ];
    for (collected, text) in utterances {
        let turn = harness.say(&id, reply(false, "And the rest?", collected), text).await;
        assert!(turn.is_suspended);
        assert_eq!(turn.node, "infoCollector.A");
        assert_eq!(turn.assistant_text, "And the rest?");
    }

    let session = harness.load(&id).await;
    let draft = session.draft(GroupKey::Arrival).expect("arrival draft");
    assert_eq!(draft.get_str("airportid"), Some("nmia"));
    assert_eq!(draft.get_str("traveldate"), Some("20301201"));
    assert_eq!(draft.get_str("flightId"), Some("ac 920"));
    assert!(!session.is_committed(GroupKey::Arrival));
    assert_eq!(harness.api.total_calls(), 0);

    let done = harness
        .say(&id, reply(true, "Got it.", json!({ "adulttickets": 1, "childtickets": 0 })), "just me")
        .await;
    assert_eq!(done.node, "contactInfo");

    let session = harness.load(&id).await;
    let arrival = session.committed(GroupKey::Arrival).expect("arrival committed");
    assert_eq!(arrival.get_str("airportid"), Some("NMIA"));
    assert_eq!(arrival.get_str("flightId"), Some("AC920"));
    assert_eq!(harness.api.calls(GET_SCHEDULE), 1);
}

#[tokio::test]
async fn invalid_values_are_reprompted_with_field_guidance() {
    let harness = Harness::new();
    let id = SessionId::from("invalid-itinerary");
    harness.say(&id, booking_intent(), "Book a lounge").await;
    harness.say(&id, product("ARRIVALONLY"), "arrival").await;

    let turn = harness
        .say(
            &id,
            reply(
                true,
                "Thanks!",
                json!({
                    "A": { "airportid": "JFK", "traveldate": "20301201", "flightId": "AC920" },
                    "tickets": { "adulttickets": 2, "childtickets": 0 }
                }),
            ),
            "JFK on the first",
        )
        .await;

    assert!(turn.is_suspended);
    assert_eq!(turn.node, "infoCollector.A");
    assert!(turn.assistant_text.contains("airportid"));
    assert_eq!(harness.audit.events_of_type("extraction.validation_failed").len(), 1);

    let session = harness.load(&id).await;
    assert!(!session.is_committed(GroupKey::Arrival));
    assert!(session.is_committed(GroupKey::Tickets));
    assert_eq!(harness.api.total_calls(), 0);
}

#[tokio::test]
async fn bundle_collects_both_directions_and_keeps_arrival_intact() {
    let harness = Harness::new();
    let id = SessionId::from("bundle");
    harness.say(&id, booking_intent(), "Book a lounge").await;
    harness.say(&id, product("ARRIVALBUNDLE"), "both ways").await;

    let arrival = harness.say(&id, arrival_itinerary(), "arriving AC920 on 1 Dec").await;
    assert_eq!(arrival.node, "infoCollector.D");
    assert!(arrival.assistant_text.contains("departure flight details"));
    assert!(!arrival.assistant_text.contains("number of adults"));

    let departure = harness
        .say(
            &id,
            reply(
                true,
                "Thanks.",
                json!({
                    "A": { "airportid": "SIA", "traveldate": "20301205", "flightId": "ZZ1" },
                    "D": { "airportid": "SIA", "traveldate": "20301208", "flightId": "BA2263" }
                }),
            ),
            "leaving from Sangster on BA2263",
        )
        .await;
    assert_eq!(departure.node, "contactInfo");
    assert!(departure.assistant_text.contains("arrival and departure lounge"));

    assert_eq!(harness.api.calls(GET_SCHEDULE), 2);
    assert_eq!(harness.api.calls(RESERVE_CART), 1);

    let session = harness.load(&id).await;
    let arrival = session.committed(GroupKey::Arrival).expect("arrival committed");
    assert_eq!(arrival.get_str("airportid"), Some("NMIA"));
    assert_eq!(arrival.get_str("flightId"), Some("AC920"));
    assert_eq!(
        session.committed(GroupKey::Departure).and_then(|record| record.get_str("flightId")),
        Some("BA2263")
    );
    assert_eq!(session.schedules.len(), 2);
}

#[tokio::test]
async fn missing_flight_reopens_the_direction_with_a_fresh_lookup_key() {
    let harness = Harness::new();
    let id = SessionId::from("missing-flight");
    harness.api.mark_flight_missing("AC920");
    harness.say(&id, booking_intent(), "Book a lounge").await;
    harness.say(&id, product("ARRIVALONLY"), "arrival").await;

    let turn = harness.say(&id, arrival_itinerary(), "AC920 on 1 Dec").await;
    assert!(turn.is_suspended);
    assert_eq!(turn.node, "infoCollector.A");
    assert!(turn.assistant_text.contains("I couldn't find flight AC920"));

    let session = harness.load(&id).await;
    assert!(!session.is_committed(GroupKey::Arrival));
    assert_eq!(session.revision(GroupKey::Arrival), 1);
    assert_eq!(
        session.draft(GroupKey::Arrival).and_then(|record| record.get_str("flightId")),
        Some("AC920")
    );

    harness.api.restore_flight("AC920");
    let corrected = harness
        .say(&id, reply(true, "Let me check again.", json!({ "A": { "flightId": "AC920" } })), "yes AC920")
        .await;
    assert_eq!(corrected.node, "contactInfo");
    assert_eq!(harness.api.calls(GET_SCHEDULE), 2);
    assert_eq!(harness.load(&id).await.side_effect_ledger.len(), 3);
}

#[tokio::test]
async fn upstream_failure_keeps_the_cursor_and_retries_on_the_next_turn() {
    let harness = Harness::new();
    let id = SessionId::from("upstream-failure");
    harness.api.fail_next(RESERVE_CART, 1);

    let failed = harness.reach_contact_step(&id).await;
    assert!(failed.is_suspended);
    assert!(!failed.is_terminal);
    assert_eq!(failed.node, "reserve");
    assert_eq!(failed.failure, Some("upstream"));
    assert!(failed.assistant_text.contains("isn't responding"));

    let session = harness.load(&id).await;
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.current_node, NodeRef::of(concierge_core::flows::NodeId::Reserve));
    assert!(session.reservation.is_none());

    let retried = harness.runtime.process_turn(&id, "try again").await.expect("turn");
    assert_eq!(retried.node, "contactInfo");
    assert_eq!(retried.failure, None);
    assert_eq!(harness.api.calls(RESERVE_CART), 2);
    assert_eq!(harness.api.calls(GET_SCHEDULE), 1);

    let session = harness.load(&id).await;
    let reserve = session
        .side_effect_ledger
        .values()
        .find(|entry| entry.operation_kind == "reserve_cart")
        .expect("reserve entry");
    assert_eq!(reserve.state, LedgerState::Completed);
    assert_eq!(reserve.attempt_count, 2);
}

#[tokio::test]
async fn turn_dropped_during_reserve_is_retried_without_a_second_call() {
    let harness = Harness::new();
    let id = SessionId::from("dropped-turn");
    harness.say(&id, booking_intent(), "I'd like to book a lounge").await;
    harness.say(&id, product("ARRIVALONLY"), "Just for my arrival").await;

    harness.api.set_latency(Duration::from_millis(200));
    harness.llm.push_reply(arrival_itinerary());
    let dropped = tokio::time::timeout(
        Duration::from_millis(300),
        harness.runtime.process_turn(&id, "NMIA on 1 Dec 2030, AC920, two adults"),
    )
    .await;
    assert!(dropped.is_err());
    assert_eq!(harness.api.calls(GET_SCHEDULE), 1);
    assert_eq!(harness.api.calls(RESERVE_CART), 1);

    harness.api.set_latency(Duration::ZERO);
    let retried = harness.say(&id, arrival_itinerary(), "NMIA on 1 Dec 2030, AC920, two adults").await;

    assert_eq!(retried.failure, None);
    assert!(!retried.is_terminal);
    assert_eq!(retried.node, "contactInfo");
    assert!(retried.assistant_text.contains("I've reserved your arrival lounge for 2 guest(s)."));
    assert_eq!(harness.api.calls(GET_SCHEDULE), 1);
    assert_eq!(harness.api.calls(RESERVE_CART), 1);

    let session = harness.load(&id).await;
    assert_eq!(session.status, SessionStatus::Active);
    assert!(session.reservation.is_some());
    assert_eq!(harness.audit.events_of_type("side_effect.replayed").len(), 2);
}

#[tokio::test]
async fn declining_the_summary_aborts_without_payment() {
    let harness = Harness::new();
    let id = SessionId::from("declined");
    harness.reach_contact_step(&id).await;
    harness.say(&id, contact(), "Ada Lovelace").await;
    harness.say(&id, payment(), "my visa").await;

    let declined = harness.say(&id, confirmation(false), "no, cancel it").await;

    assert!(declined.is_terminal);
    assert!(declined.assistant_text.contains("I've cancelled this booking"));
    assert_eq!(harness.api.calls(MAKE_PAYMENT), 0);
    let session = harness.load(&id).await;
    assert_eq!(session.status, SessionStatus::Aborted);
    assert!(session.payment_receipt.is_none());
}

#[tokio::test]
async fn payment_nodes_are_skipped_when_payment_collection_is_off() {
    let harness = Harness::with_engine(engine(false, None));
    let id = SessionId::from("no-payment");
    harness.reach_contact_step(&id).await;

    let confirm = harness.say(&id, contact(), "Ada Lovelace").await;
    assert_eq!(confirm.node, "confirm");
    assert!(!confirm.assistant_text.contains("Card"));

    let done = harness.say(&id, confirmation(true), "yes").await;
    assert!(done.is_terminal);
    assert_eq!(harness.api.calls(MAKE_PAYMENT), 0);
    assert_eq!(harness.load(&id).await.status, SessionStatus::Completed);
}

#[tokio::test]
async fn extraction_failures_abort_once_the_retry_bound_is_exceeded() {
    let harness = Harness::with_engine(engine(true, Some(1)));
    let id = SessionId::from("retry-bound");

    let first = harness.say(&id, "I am not JSON".to_string(), "hello?").await;
    assert!(first.is_suspended);
    assert_eq!(first.failure, Some("extraction"));
    assert_eq!(first.node, "classify");

    let second = harness.say(&id, "still not JSON".to_string(), "hello??").await;
    assert!(second.is_terminal);
    assert_eq!(second.failure, Some("extraction"));
    assert!(second.assistant_text.contains("can't continue"));

    let session = harness.load(&id).await;
    assert_eq!(session.status, SessionStatus::Aborted);
    assert_eq!(session.extraction_failures, 2);
}

#[tokio::test]
async fn a_valid_reply_clears_the_extraction_failure_count() {
    let harness = Harness::with_engine(engine(true, Some(1)));
    let id = SessionId::from("retry-reset");

    harness.say(&id, "garbled".to_string(), "hi").await;
    let recovered = harness.say(&id, booking_intent(), "book a lounge please").await;
    assert_eq!(recovered.node, "productType");
    assert_eq!(harness.load(&id).await.extraction_failures, 0);

    let again = harness.say(&id, "garbled".to_string(), "erm").await;
    assert!(again.is_suspended);
    assert_eq!(again.node, "productType");
}

#[tokio::test]
async fn unknown_cursor_aborts_as_corrupt_without_side_effects() {
    let harness = Harness::new();
    let id = SessionId::from("corrupt-cursor");
    let mut session = Session::new(id.clone());
    session.current_node = NodeRef("nowhere".to_string());
    harness.store.save(&session).await.expect("seed");

    let turn = harness.runtime.process_turn(&id, "hello").await.expect("turn");

    assert!(turn.is_terminal);
    assert_eq!(turn.failure, Some("corrupt_session"));
    assert!(turn.assistant_text.contains("start a new session"));
    assert_eq!(harness.api.total_calls(), 0);
    assert!(harness.llm.calls().is_empty());

    let stored = harness.load(&id).await;
    assert_eq!(stored.status, SessionStatus::Aborted);
    assert_eq!(stored.current_node.as_str(), "nowhere");
    assert_eq!(harness.audit.events_of_type("flow.session_corrupt").len(), 1);
}

#[tokio::test]
async fn reset_starts_over_under_a_new_epoch() {
    let harness = Harness::new();
    let id = SessionId::from("reset-epoch");
    harness.reach_contact_step(&id).await;
    assert_eq!(harness.api.calls(RESERVE_CART), 1);

    let reset = harness.runtime.reset(&id).await.expect("reset");
    assert_eq!(reset.epoch, 1);
    assert!(reset.collected.is_empty());
    assert_eq!(reset.side_effect_ledger.len(), 2);
    assert_eq!(reset.current_node, NodeRef::start());

    let turn = harness.reach_contact_step(&id).await;
    assert_eq!(turn.node, "contactInfo");
    assert_eq!(harness.api.calls(RESERVE_CART), 2);
    assert_eq!(harness.api.calls(GET_SCHEDULE), 2);
    assert_eq!(harness.load(&id).await.side_effect_ledger.len(), 4);
}

#[tokio::test]
async fn concurrent_turns_on_one_session_run_one_after_another() {
    let harness = Harness::new();
    let id = SessionId::from("concurrent");
    harness.llm.push_reply(booking_intent());
    harness.llm.push_reply(product("DEPARTURE"));

    let (left, right) = tokio::join!(
        harness.runtime.process_turn(&id, "book a lounge"),
        harness.runtime.process_turn(&id, "departure please"),
    );
    left.expect("first turn");
    right.expect("second turn");

    let session = harness.load(&id).await;
    assert_eq!(session.turn_count, 2);
    assert_eq!(session.product().map(|product| product.as_str()), Some("DEPARTURE"));
    assert_eq!(session.current_node.as_str(), "infoCollector.D");
}

#[tokio::test]
async fn aborting_closes_the_session() {
    let harness = Harness::new();
    let id = SessionId::from("abort");
    harness.say(&id, booking_intent(), "book").await;

    let aborted = harness.runtime.abort(&id).await.expect("abort");
    assert_eq!(aborted.status, SessionStatus::Aborted);

    let turn = harness.runtime.process_turn(&id, "still there?").await.expect("turn");
    assert!(turn.is_terminal);
    assert_eq!(harness.llm.calls().len(), 1);
}
