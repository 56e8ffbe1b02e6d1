//! Engine scenario suite, driven through the scripted provider

use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;
use tokio_test::{assert_err, assert_ok};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::*;
use crate::config::AccountConfig;
use crate::error::ProviderError;
use crate::event::{CallDirection, CallState, CallStateEvent, Event, RegistrationState, TraceDirection};
use crate::testing::{FakeProvider, FakeProviderFactory, InviteOutcome, RegisterOutcome};

const WAIT: Duration = Duration::from_secs(2);

fn work() -> AccountConfig {
    AccountConfig::new("work", "sip:alice@pbx", "sip:pbx")
        .with_credentials("alice", "secret")
        .with_register(false)
}

fn config(accounts: Vec<AccountConfig>) -> Config {
    Config {
        accounts,
        ..Config::default()
    }
}

struct Harness {
    engine: Engine,
    events: EventStream,
    factory: FakeProviderFactory,
    provider: Arc<FakeProvider>,
}

async fn started(accounts: Vec<AccountConfig>) -> Harness {
    started_with(accounts, EngineOptions::default()).await
}

async fn started_with(accounts: Vec<AccountConfig>, options: EngineOptions) -> Harness {
    let factory = FakeProviderFactory::new();
    let (engine, events) = Engine::with_options(&config(accounts), &factory, options).unwrap();
    assert_ok!(engine.start(CancellationToken::new()).await);
    let provider = factory.provider().unwrap();
    Harness {
        engine,
        events,
        factory,
        provider,
    }
}

/// Next non-trace event
async fn next_event(events: &mut EventStream) -> Event {
    loop {
        let event = tokio::time::timeout(WAIT, events.next())
            .await
            .expect("timed out waiting for an event")
            .expect("event stream closed");
        if !event.is_trace() {
            return event;
        }
    }
}

async fn next_call_event(events: &mut EventStream) -> CallStateEvent {
    match next_event(events).await {
        Event::CallState(ev) => ev,
        other => panic!("expected a call state event, got {other:?}"),
    }
}

/// Stop the engine and collect every remaining non-trace event
async fn stop_and_drain(engine: &Engine, events: &mut EventStream) -> Vec<Event> {
    engine.stop().await;
    let mut rest = Vec::new();
    while let Some(event) = tokio::time::timeout(WAIT, events.next())
        .await
        .expect("stream did not close")
    {
        if !event.is_trace() {
            rest.push(event);
        }
    }
    rest
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Dial and wait for the call to be confirmed, returning its id
async fn confirmed_outbound(h: &mut Harness, target: &str) -> String {
    h.engine.dial("work", target).unwrap();
    let calling = next_call_event(&mut h.events).await;
    assert_eq!(calling.state, CallState::Calling);
    let confirmed = next_call_event(&mut h.events).await;
    assert_eq!(confirmed.state, CallState::Confirmed);
    assert_eq!(confirmed.call_id, calling.call_id);
    confirmed.call_id.to_string()
}

/// Offer an inbound call and wait for the `incoming` event
async fn ringing_inbound(h: &mut Harness, remote: &str) -> (String, Arc<crate::testing::FakeSession>) {
    let session = h.provider.offer_inbound(remote);
    let incoming = next_call_event(&mut h.events).await;
    assert_eq!(incoming.state, CallState::Incoming);
    assert_eq!(incoming.direction, CallDirection::Inbound);
    assert_eq!(incoming.remote_uri, remote);
    (incoming.call_id.to_string(), session)
}

// ===== Construction and lifecycle =====

#[tokio::test]
async fn test_one_account_per_enabled_definition() {
    let accounts = vec![
        work().with_register(true),
        AccountConfig::new("home", "sip:bob@home", "sip:home").with_enabled(false),
        AccountConfig::new("lab", "sip:carol@lab", "sip:lab").with_register(false),
    ];
    let mut h = started(accounts).await;

    assert_eq!(h.engine.accounts(), vec!["work".to_string(), "lab".to_string()]);

    let Event::Registration(reg) = next_event(&mut h.events).await else {
        panic!("expected a registration event");
    };
    assert_eq!(reg.account, "work");
    assert_eq!(reg.state, RegistrationState::Registered);

    let rest = stop_and_drain(&h.engine, &mut h.events).await;
    assert!(rest.is_empty(), "unexpected events: {rest:?}");

    let registered: Vec<_> = h.provider.registrations().into_iter().map(|(_, opts)| opts.username).collect();
    assert_eq!(registered, vec!["alice".to_string()]);
}

#[tokio::test]
async fn test_agent_options_derive_identity_from_first_enabled_account() {
    let accounts = vec![
        AccountConfig::new("old", "sip:zed@x", "sip:x").with_enabled(false),
        work(),
    ];
    let h = started(accounts).await;

    let options = h.factory.agent_options().unwrap();
    assert_eq!(options.identity, "alice");
    assert_eq!(options.hostname, AGENT_HOSTNAME);
    assert!(options.user_agent.starts_with("siptty/"));
    assert_eq!(options.bind_host, "0.0.0.0");
}

#[test]
fn test_derive_identity_falls_back() {
    let cfg = config(vec![AccountConfig::new("anon", "sip:pbx.example.com", "sip:pbx.example.com")]);
    assert_eq!(derive_identity(&cfg), FALLBACK_IDENTITY);

    let none_enabled = config(vec![work().with_enabled(false)]);
    assert_eq!(derive_identity(&none_enabled), FALLBACK_IDENTITY);
}

#[tokio::test]
async fn test_provider_creation_failure_fails_new() {
    let factory = FakeProviderFactory::new();
    factory.fail_create(ProviderError::transport("bind failed"));

    let err = Engine::new(&config(vec![work()]), &factory).unwrap_err();
    assert!(matches!(err, EngineError::Provider(ProviderError::Transport { .. })));
}

#[tokio::test]
async fn test_listener_starts_before_registration() {
    let mut h = started(vec![work().with_register(true)]).await;
    let _ = next_event(&mut h.events).await;

    let log = h.provider.log();
    let serve = log.iter().position(|e| e == "serve").unwrap();
    let register = log.iter().position(|e| e == "register:alice").unwrap();
    assert!(serve < register, "log: {log:?}");
}

#[tokio::test]
async fn test_listener_failure_fails_start() {
    let factory = FakeProviderFactory::new();
    factory.fail_serve(ProviderError::transport("address in use"));
    let (engine, _events) = Engine::new(&config(vec![work().with_register(true)]), &factory).unwrap();

    let err = assert_err!(engine.start(CancellationToken::new()).await);
    assert!(matches!(err, EngineError::Listener(_)));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(factory.provider().unwrap().registrations().is_empty());
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let h = started(vec![work()]).await;
    let err = assert_err!(h.engine.start(CancellationToken::new()).await);
    assert!(matches!(err, EngineError::AlreadyStarted));
}

#[tokio::test]
async fn test_registration_scenario() {
    let mut h = started(vec![work().with_register(true)]).await;

    let Event::Registration(reg) = next_event(&mut h.events).await else {
        panic!("expected a registration event");
    };
    assert_eq!(reg.account, "work");
    assert_eq!(reg.state, RegistrationState::Registered);
    assert_eq!(reg.reason, None);

    let infos = h.engine.account_infos();
    assert_eq!(infos[0].state, RegistrationState::Registered);
}

#[tokio::test]
async fn test_registration_failure_degrades_only_that_account() {
    let accounts = vec![
        work().with_register(true),
        AccountConfig::new("lab", "sip:carol@lab", "sip:lab"),
    ];
    let factory = FakeProviderFactory::new();
    factory.script_register("carol", RegisterOutcome::RegisterFails(ProviderError::rejected(401, "Unauthorized")));
    let (engine, mut events) = Engine::new(&config(accounts), &factory).unwrap();
    engine.start(CancellationToken::new()).await.unwrap();

    let mut outcomes = Vec::new();
    for _ in 0..2 {
        let Event::Registration(reg) = next_event(&mut events).await else {
            panic!("expected a registration event");
        };
        outcomes.push((reg.account, reg.state, reg.reason));
    }
    outcomes.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        outcomes,
        vec![
            ("lab".to_string(), RegistrationState::Failed, Some("register: rejected with 401 Unauthorized".to_string())),
            ("work".to_string(), RegistrationState::Registered, None),
        ]
    );

    // The failed account does not take the engine down
    engine.dial("work", "sip:100@pbx").unwrap();
    assert_eq!(next_call_event(&mut events).await.state, CallState::Calling);
}

#[tokio::test]
async fn test_stop_unregisters_and_closes_stream() {
    let mut h = started(vec![work().with_register(true)]).await;
    let _ = next_event(&mut h.events).await;

    let rest = stop_and_drain(&h.engine, &mut h.events).await;
    assert!(rest.is_empty());
    assert!(h.engine.is_stopped());
    assert_eq!(h.provider.unregisters(), vec!["alice".to_string()]);
    assert!(!h.provider.is_serving());
    assert!(h.provider.is_closed());
    assert_eq!(h.engine.account_infos()[0].state, RegistrationState::Unregistered);

    // Idempotent after the stream is drained
    h.engine.stop().await;
    assert_eq!(h.provider.unregisters().len(), 1);
}

#[tokio::test]
#[traced_test]
async fn test_stop_survives_unregister_failure() {
    let factory = FakeProviderFactory::new();
    factory.script_register("alice", RegisterOutcome::UnregisterFails(ProviderError::transport("gone")));
    let (engine, mut events) = Engine::new(&config(vec![work().with_register(true)]), &factory).unwrap();
    engine.start(CancellationToken::new()).await.unwrap();
    let _ = next_event(&mut events).await;

    let rest = stop_and_drain(&engine, &mut events).await;
    assert!(rest.is_empty());
    assert!(factory.provider().unwrap().is_closed());
    assert!(logs_contain("unregister failed"));
}

#[tokio::test]
async fn test_cancelling_start_token_unwinds_background_work() {
    let factory = FakeProviderFactory::new();
    factory.script_register("alice", RegisterOutcome::Hang);
    let (engine, mut events) = Engine::new(&config(vec![work().with_register(true)]), &factory).unwrap();

    let cancel = CancellationToken::new();
    engine.start(cancel.clone()).await.unwrap();
    let provider = factory.provider().unwrap();
    wait_until(|| provider.log().contains(&"register:alice".to_string())).await;
    assert!(provider.is_serving());

    cancel.cancel();
    assert!(!provider.is_serving());

    // The hung registration never reports
    let rest = stop_and_drain(&engine, &mut events).await;
    assert!(rest.is_empty());
}

// ===== Outbound calls =====

#[tokio::test]
async fn test_dial_then_hangup_scenario() {
    let mut h = started(vec![work()]).await;

    h.engine.dial("work", "sip:100@pbx").unwrap();
    let calling = next_call_event(&mut h.events).await;
    assert_eq!(calling.state, CallState::Calling);
    assert_eq!(calling.direction, CallDirection::Outbound);
    assert_eq!(calling.remote_uri, "sip:100@pbx");
    assert_eq!(calling.duration, Duration::ZERO);

    let confirmed = next_call_event(&mut h.events).await;
    assert_eq!(confirmed.state, CallState::Confirmed);
    assert_eq!(confirmed.call_id, calling.call_id);
    let id = confirmed.call_id.to_string();

    let invites = h.provider.invites();
    let (_, invite) = &invites[0];
    assert_eq!(invite.username, "alice");
    assert_eq!(invite.password, "secret");

    assert_ok!(h.engine.hangup(&id).await);
    let disconnected = next_call_event(&mut h.events).await;
    assert_eq!(disconnected.state, CallState::Disconnected);
    assert_eq!(disconnected.call_id.as_str(), id);

    // A second hangup still reaches the session but emits nothing
    h.engine.hangup(&id).await.unwrap();
    let session = h.provider.outbound_sessions()[0].clone();
    assert_eq!(session.hangups(), 2);

    let rest = stop_and_drain(&h.engine, &mut h.events).await;
    assert!(rest.is_empty(), "unexpected events: {rest:?}");
}

#[tokio::test]
async fn test_hangup_reports_provider_error_but_still_disconnects() {
    let mut h = started(vec![work()]).await;
    let id = confirmed_outbound(&mut h, "sip:100@pbx").await;
    h.provider.outbound_sessions()[0].fail_hangup(ProviderError::transport("socket closed"));

    let err = h.engine.hangup(&id).await.unwrap_err();
    assert!(matches!(err, EngineError::Provider(ProviderError::Transport { .. })));
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Disconnected);
}

#[tokio::test]
async fn test_failed_dial_is_not_inserted() {
    let mut h = started(vec![work()]).await;
    h.factory.script_invite(InviteOutcome::Fails(ProviderError::rejected(486, "Busy Here")));

    h.engine.dial("work", "sip:100@pbx").unwrap();
    let calling = next_call_event(&mut h.events).await;
    let disconnected = next_call_event(&mut h.events).await;
    assert_eq!(calling.state, CallState::Calling);
    assert_eq!(disconnected.state, CallState::Disconnected);
    assert_eq!(disconnected.call_id, calling.call_id);

    assert!(h.engine.calls().await.is_empty());
    let err = h.engine.hangup(calling.call_id.as_str()).await.unwrap_err();
    assert!(matches!(err, EngineError::CallNotFound { .. }));
}

#[tokio::test]
async fn test_dial_timeout_disconnects() {
    let options = EngineOptions {
        timeouts: Timeouts {
            dial: Duration::from_millis(50),
            ..Timeouts::default()
        },
        ..EngineOptions::default()
    };
    let mut h = started_with(vec![work()], options).await;
    h.factory.script_invite(InviteOutcome::Hang);

    h.engine.dial("work", "sip:100@pbx").unwrap();
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Calling);
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Disconnected);
    assert!(h.engine.calls().await.is_empty());
}

#[tokio::test]
async fn test_dial_passes_account_headers() {
    let mut h = started(vec![work().with_header("X-Tenant", "acme")]).await;
    confirmed_outbound(&mut h, "sip:100@pbx").await;

    let invites = h.provider.invites();
    let (_, invite) = &invites[0];
    assert_eq!(invite.headers.len(), 1);
    assert_eq!(invite.headers.get("X-Tenant").map(String::as_str), Some("acme"));
}

#[tokio::test]
async fn test_invite_answered_after_stop_is_hung_up() {
    let mut h = started(vec![work()]).await;
    h.factory
        .script_invite(InviteOutcome::AnsweredAfter(Duration::from_millis(100)));

    h.engine.dial("work", "sip:100@pbx").unwrap();
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Calling);
    h.engine.stop().await;

    let provider = Arc::clone(&h.provider);
    wait_until(|| {
        provider
            .outbound_sessions()
            .first()
            .is_some_and(|session| session.hangups() == 1)
    })
    .await;
    assert!(provider.outbound_sessions()[0].is_terminated());
    assert!(h.engine.calls().await.is_empty());
}

#[tokio::test]
async fn test_dial_validation_is_synchronous() {
    let factory = FakeProviderFactory::new();
    let (engine, mut events) = Engine::new(&config(vec![work()]), &factory).unwrap();

    let err = engine.dial("nope", "sip:100@pbx").unwrap_err();
    assert!(matches!(err, EngineError::AccountNotFound { .. }));
    assert_eq!(err.to_string(), "account \"nope\" not found");

    let err = engine.dial("work", "100@pbx").unwrap_err();
    assert!(matches!(err, EngineError::InvalidUri { .. }));

    let rest = stop_and_drain(&engine, &mut events).await;
    assert!(rest.is_empty());
    assert!(factory.provider().unwrap().invites().is_empty());
}

#[tokio::test]
async fn test_remote_hangup_of_outbound_call() {
    let mut h = started(vec![work()]).await;
    let id = confirmed_outbound(&mut h, "sip:100@pbx").await;

    h.provider.outbound_sessions()[0].remote_hangup();
    let ev = next_call_event(&mut h.events).await;
    assert_eq!(ev.state, CallState::Disconnected);
    assert_eq!(ev.call_id.as_str(), id);

    // Operator hangup afterwards emits nothing further
    let _ = h.engine.hangup(&id).await;
    let rest = stop_and_drain(&h.engine, &mut h.events).await;
    assert!(rest.is_empty(), "unexpected events: {rest:?}");
}

#[tokio::test]
async fn test_trace_events_carry_wire_messages() {
    let mut h = started(vec![work()]).await;
    h.engine.dial("work", "sip:100@pbx").unwrap();

    let trace = loop {
        let event = tokio::time::timeout(WAIT, h.events.next()).await.unwrap().unwrap();
        if let Event::Trace(trace) = event {
            break trace;
        }
    };
    assert_eq!(trace.direction, TraceDirection::Sent);
    assert!(trace.message.starts_with("INVITE "));
    assert_eq!(trace.transport, "udp");
}

// ===== Inbound calls =====

#[tokio::test]
async fn test_inbound_never_answered_scenario() {
    let mut h = started(vec![work()]).await;
    let (id, session) = ringing_inbound(&mut h, "sip:bob@pbx").await;

    session.remote_hangup();
    let ev = next_call_event(&mut h.events).await;
    assert_eq!(ev.state, CallState::Disconnected);
    assert_eq!(ev.call_id.as_str(), id);
    assert!(!session.is_answered());

    // The call stays listed but its session is gone
    let mut released = false;
    for _ in 0..100 {
        if let Err(EngineError::NoActiveSession { .. }) = h.engine.hangup(&id).await {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(released);
    let calls = h.engine.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].state, CallState::Disconnected);

    let rest = stop_and_drain(&h.engine, &mut h.events).await;
    assert!(rest.is_empty(), "unexpected events: {rest:?}");
}

#[tokio::test]
async fn test_answer_confirms_inbound_call() {
    let mut h = started(vec![work()]).await;
    let (id, session) = ringing_inbound(&mut h, "sip:bob@pbx").await;

    h.engine.answer(&id).unwrap();
    // Absorbed: at most one pending intent
    h.engine.answer(&id).unwrap();

    let ev = next_call_event(&mut h.events).await;
    assert_eq!(ev.state, CallState::Confirmed);
    assert!(session.is_answered());

    h.engine.hangup(&id).await.unwrap();
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Disconnected);

    let rest = stop_and_drain(&h.engine, &mut h.events).await;
    assert!(rest.is_empty(), "unexpected events: {rest:?}");
    assert_eq!(session.hangups(), 1);
}

#[tokio::test]
async fn test_answer_errors_are_synchronous() {
    let mut h = started(vec![work()]).await;

    let err = h.engine.answer("42").unwrap_err();
    assert!(matches!(err, EngineError::CallNotFound { .. }));

    let id = confirmed_outbound(&mut h, "sip:100@pbx").await;
    let err = h.engine.answer(&id).unwrap_err();
    assert!(matches!(err, EngineError::NotInbound { .. }));
    let err = h.engine.reject(&id).unwrap_err();
    assert!(matches!(err, EngineError::NotInbound { .. }));

    let rest = stop_and_drain(&h.engine, &mut h.events).await;
    assert!(rest.is_empty(), "unexpected events: {rest:?}");
}

#[tokio::test]
async fn test_answer_failure_disconnects() {
    let mut h = started(vec![work()]).await;
    let (id, session) = ringing_inbound(&mut h, "sip:bob@pbx").await;
    session.fail_answer(ProviderError::media("no codec"));

    h.engine.answer(&id).unwrap();
    let ev = next_call_event(&mut h.events).await;
    assert_eq!(ev.state, CallState::Disconnected);
}

#[tokio::test]
async fn test_reject_declines_with_busy() {
    let mut h = started(vec![work()]).await;
    let (id, session) = ringing_inbound(&mut h, "sip:bob@pbx").await;

    h.engine.reject(&id).unwrap();
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Disconnected);
    assert_eq!(session.rejection(), Some((486, "Busy Here".to_string())));
    assert!(!session.is_answered());
}

#[tokio::test]
async fn test_received_digits_only_while_confirmed() {
    let mut h = started(vec![work()]).await;
    let (id, session) = ringing_inbound(&mut h, "sip:bob@pbx").await;
    h.engine.answer(&id).unwrap();
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Confirmed);

    session.receive_digit('5').await;
    let Event::Digit(digit) = next_event(&mut h.events).await else {
        panic!("expected a digit event");
    };
    assert_eq!(digit.call_id.as_str(), id);
    assert_eq!(digit.digit, '5');

    h.engine.hangup(&id).await.unwrap();
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Disconnected);
    session.receive_digit('6').await;

    let rest = stop_and_drain(&h.engine, &mut h.events).await;
    assert!(rest.is_empty(), "unexpected events: {rest:?}");
}

#[tokio::test]
async fn test_call_ids_unique_and_increasing_across_origins() {
    let mut h = started(vec![work()]).await;

    let first = confirmed_outbound(&mut h, "sip:100@pbx").await;
    let (second, _session) = ringing_inbound(&mut h, "sip:bob@pbx").await;
    let third = confirmed_outbound(&mut h, "sip:101@pbx").await;

    let seq: Vec<u64> = [&first, &second, &third]
        .iter()
        .map(|id| id.parse().unwrap())
        .collect();
    assert!(seq.windows(2).all(|w| w[0] < w[1]), "ids: {seq:?}");

    let calls = h.engine.calls().await;
    let listed: Vec<_> = calls.iter().map(|c| c.call_id.to_string()).collect();
    assert_eq!(listed, vec![first, second, third]);
    assert_eq!(calls[1].direction, CallDirection::Inbound);
    assert_eq!(calls[1].state, CallState::Incoming);
}

// ===== Mid-call commands =====

#[tokio::test]
async fn test_send_dtmf_to_unknown_call_emits_nothing() {
    let factory = FakeProviderFactory::new();
    let (engine, mut events) = Engine::new(&config(vec![work()]), &factory).unwrap();

    let err = engine.send_dtmf("nonexistent", '5').await.unwrap_err();
    assert!(matches!(err, EngineError::CallNotFound { .. }));

    let rest = stop_and_drain(&engine, &mut events).await;
    assert!(rest.is_empty());
}

#[tokio::test]
async fn test_send_dtmf_validates_before_touching_session() {
    let mut h = started(vec![work()]).await;
    let id = confirmed_outbound(&mut h, "sip:100@pbx").await;
    let session = h.provider.outbound_sessions()[0].clone();

    for digit in ['a', 'd', 'e', 'x', '!', '?', ' ', '\n', '-'] {
        let err = h.engine.send_dtmf(&id, digit).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidDigit { .. }), "{digit:?}");
    }
    assert!(session.digits_sent().is_empty());

    // Invalid digits are rejected even for unknown calls
    let err = h.engine.send_dtmf("nonexistent", 'z').await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidDigit { digit: 'z' }));

    for digit in "0123456789*#ABCD".chars() {
        h.engine.send_dtmf(&id, digit).await.unwrap();
    }
    assert_eq!(session.digits_sent().into_iter().collect::<String>(), "0123456789*#ABCD");
}

#[tokio::test]
async fn test_transfer_and_play_audio() {
    let mut h = started(vec![work()]).await;
    let id = confirmed_outbound(&mut h, "sip:100@pbx").await;
    let session = h.provider.outbound_sessions()[0].clone();

    let err = h.engine.transfer(&id, "not a uri").await.unwrap_err();
    assert!(matches!(err, EngineError::InvalidUri { .. }));
    let err = h.engine.transfer("99", "sip:200@pbx").await.unwrap_err();
    assert!(matches!(err, EngineError::CallNotFound { .. }));

    h.engine.transfer(&id, "sip:200@pbx").await.unwrap();
    let refers = session.refers();
    assert_eq!(refers.len(), 1);
    assert!(refers[0].contains("200@pbx"));

    h.engine.play_audio(&id, "/tmp/greeting.wav").await.unwrap();
    assert_eq!(session.plays(), vec![std::path::PathBuf::from("/tmp/greeting.wav")]);

    session.fail_playback(ProviderError::media("unsupported format"));
    let err = h.engine.play_audio(&id, "/tmp/bad.wav").await.unwrap_err();
    assert!(matches!(err, EngineError::Provider(ProviderError::Media { .. })));
}

#[tokio::test]
async fn test_commands_on_released_inbound_session() {
    let mut h = started(vec![work()]).await;
    let (id, session) = ringing_inbound(&mut h, "sip:bob@pbx").await;
    h.engine.reject(&id).unwrap();
    assert_eq!(next_call_event(&mut h.events).await.state, CallState::Disconnected);

    let mut released = false;
    for _ in 0..100 {
        if matches!(
            h.engine.send_dtmf(&id, '1').await,
            Err(EngineError::NoActiveSession { .. })
        ) {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(released);

    let err = h.engine.transfer(&id, "sip:200@pbx").await.unwrap_err();
    assert!(matches!(err, EngineError::NoActiveSession { .. }));
    let err = h.engine.play_audio(&id, "/tmp/a.wav").await.unwrap_err();
    assert_eq!(err.to_string(), format!("call \"{id}\" has no active session"));
    assert!(session.refers().is_empty());
}

// ===== Backpressure =====

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_trace_flood_never_loses_state_events() {
    let options = EngineOptions {
        event_capacity: 8,
        ..EngineOptions::default()
    };
    let mut h = started_with(vec![work()], options).await;

    let flood_provider = Arc::clone(&h.provider);
    let stop_flood = CancellationToken::new();
    let flood_token = stop_flood.clone();
    let flood = tokio::spawn(async move {
        while !flood_token.is_cancelled() {
            flood_provider.emit_traces(100);
            tokio::task::yield_now().await;
        }
    });

    h.engine.dial("work", "sip:100@pbx").unwrap();

    let mut states = Vec::new();
    while states.len() < 2 {
        let event = tokio::time::timeout(Duration::from_secs(5), h.events.next())
            .await
            .expect("state events stalled behind traces")
            .expect("event stream closed");
        if let Event::CallState(ev) = event {
            states.push(ev.state);
        }
    }
    stop_flood.cancel();
    flood.await.unwrap();

    assert_eq!(states, vec![CallState::Calling, CallState::Confirmed]);
    assert!(h.engine.dropped_traces() > 0);
}
