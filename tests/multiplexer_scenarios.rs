//! Multiplexer behavior driven through the in-memory transport.
//!
//! Each test builds a fresh multiplexer, plays the server's part by feeding
//! `TransportEvent`s, and inspects what the multiplexer asked the transport
//! to do.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use classroom_realtime::message::{LeaderboardRequest, StudentRef};
use classroom_realtime::transport::TransportCall;
use classroom_realtime::{
    filter, ChannelName, ChannelOpenError, ChannelStatus, ConnectionState, Event, MemoryTransport,
    Message, Multiplexer, MuxOptions, SubscriptionId, TransportEvent,
};
use serde_json::{json, Value};
use tokio::time::Instant;

type Seen = Rc<RefCell<Vec<String>>>;

fn setup() -> (Multiplexer, MemoryTransport) {
    let transport = MemoryTransport::new();
    let mux = Multiplexer::new(transport.clone(), MuxOptions::default());
    (mux, transport)
}

fn online(mux: &Multiplexer, transport: &MemoryTransport) {
    mux.handle_event(transport.set_state(ConnectionState::Connected));
}

fn offline(mux: &Multiplexer, transport: &MemoryTransport) {
    mux.handle_event(transport.set_state(ConnectionState::Reconnecting { attempt: 1 }));
}

fn class() -> ChannelName {
    ChannelName::from("class-42")
}

fn inbound(channel: &ChannelName, raw: Value) -> TransportEvent {
    TransportEvent::Message {
        channel: channel.clone(),
        raw,
    }
}

fn enrolled(id: &str) -> Value {
    json!({ "type": "student-enrolled", "payload": { "id": id } })
}

/// Handler that records `tag` for every message it receives.
fn recorder(seen: &Seen, tag: &'static str) -> impl Fn(&Message) -> anyhow::Result<()> {
    let seen = Rc::clone(seen);
    move |_| {
        seen.borrow_mut().push(tag.to_string());
        Ok(())
    }
}

fn leaderboard_limit(message: &Message) -> Option<u32> {
    match &message.event {
        Event::RequestLeaderboard(req) => req.limit,
        _ => None,
    }
}

fn request(limit: u32) -> Event {
    Event::RequestLeaderboard(LeaderboardRequest {
        class_id: Some("42".to_string()),
        limit: Some(limit),
    })
}

// ─── Basics ─────────────────────────────────────────────────────────────────

#[test]
fn test_predicate_selects_message_type() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let received: Rc<RefCell<Vec<Message>>> = Rc::default();

    let sink = Rc::clone(&received);
    mux.subscribe("class-42", filter::kind("student-enrolled"), move |m| {
        sink.borrow_mut().push(m.clone());
        Ok(())
    });

    mux.handle_event(inbound(&class(), enrolled("s1")));
    mux.handle_event(inbound(
        &class(),
        json!({ "type": "student-unenrolled", "payload": { "id": "s1" } }),
    ));

    let received = received.borrow();
    assert_eq!(received.len(), 1);
    assert_eq!(
        received[0].event,
        Event::StudentEnrolled(StudentRef {
            id: "s1".to_string(),
            name: None,
        })
    );
    assert_eq!(received[0].channel, Some(class()));
}

#[test]
fn test_unsubscribed_handler_stops_receiving() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let seen: Seen = Rc::default();

    let first = mux.subscribe("class-42", filter::any(), recorder(&seen, "first"));
    mux.subscribe("class-42", filter::any(), recorder(&seen, "second"));
    mux.unsubscribe(first);

    mux.handle_event(inbound(&class(), enrolled("s1")));

    assert_eq!(*seen.borrow(), vec!["second"]);
    assert_eq!(mux.ref_count(&class()), 1);
    assert!(transport.closed().is_empty());
}

#[test]
fn test_last_unsubscribe_closes_channel() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let seen: Seen = Rc::default();

    let id = mux.subscribe("class-42", filter::any(), recorder(&seen, "only"));
    mux.handle_event(TransportEvent::ChannelOpened(class()));
    assert!(mux.is_open(&class()));

    mux.unsubscribe(id);
    assert_eq!(transport.closed(), vec![class()]);
    assert_eq!(mux.channel_status(&class()), None);
    assert!(!mux.is_open(&class()));

    // Late message for the released channel is dropped silently.
    mux.handle_event(inbound(&class(), enrolled("s1")));
    assert!(seen.borrow().is_empty());
    assert_eq!(mux.diagnostics().dropped, 1);
}

#[test]
fn test_offline_sends_flush_in_order_before_new_sends() {
    let (mux, transport) = setup();

    mux.send("class-42", request(1));
    mux.send("class-42", request(2));
    assert!(transport.sent().is_empty());
    assert_eq!(mux.queued(), 2);

    online(&mux, &transport);
    mux.send("class-42", request(3));

    let limits: Vec<Option<u32>> = transport
        .sent()
        .iter()
        .map(|(_, m)| leaderboard_limit(m))
        .collect();
    assert_eq!(limits, vec![Some(1), Some(2), Some(3)]);
    assert_eq!(mux.queued(), 0);
}

// ─── Registry consistency ───────────────────────────────────────────────────

#[test]
fn test_ref_count_tracks_live_subscriptions() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let a = ChannelName::from("class-1");
    let b = ChannelName::from("class-2");

    let mut live: Vec<(SubscriptionId, ChannelName)> = Vec::new();
    for i in 0..6 {
        let channel = if i % 2 == 0 { a.clone() } else { b.clone() };
        live.push((mux.subscribe(channel.clone(), filter::any(), |_| Ok(())), channel));
    }

    for step in 0..6 {
        let expected_a = live.iter().filter(|(_, c)| *c == a).count();
        let expected_b = live.iter().filter(|(_, c)| *c == b).count();
        assert_eq!(mux.ref_count(&a), expected_a, "step {step}");
        assert_eq!(mux.ref_count(&b), expected_b, "step {step}");
        assert_eq!(mux.subscription_count(), live.len());

        let (id, _) = live.remove(step % live.len());
        mux.unsubscribe(id);
    }

    assert_eq!(mux.ref_count(&a), 0);
    assert_eq!(mux.ref_count(&b), 0);
    assert_eq!(transport.opened(), vec![a.clone(), b.clone()]);
    let mut closed = transport.closed();
    closed.sort();
    assert_eq!(closed, vec![a, b]);
}

#[test]
fn test_unsubscribe_twice_is_noop() {
    let (mux, transport) = setup();
    online(&mux, &transport);

    let keep = mux.subscribe("class-42", filter::any(), |_| Ok(()));
    let drop_me = mux.subscribe("class-42", filter::any(), |_| Ok(()));

    mux.unsubscribe(drop_me);
    let after_once = (mux.ref_count(&class()), transport.calls());
    mux.unsubscribe(drop_me);
    let after_twice = (mux.ref_count(&class()), transport.calls());

    assert_eq!(after_once, after_twice);
    assert!(mux.is_subscribed(keep));
}

#[test]
fn test_reopening_after_close_opens_again() {
    let (mux, transport) = setup();
    online(&mux, &transport);

    let id = mux.subscribe("class-42", filter::any(), |_| Ok(()));
    mux.unsubscribe(id);
    mux.subscribe("class-42", filter::any(), |_| Ok(()));

    assert_eq!(
        transport.calls(),
        vec![
            TransportCall::Open(class()),
            TransportCall::Close(class()),
            TransportCall::Open(class()),
        ]
    );
}

// ─── Dispatch ───────────────────────────────────────────────────────────────

#[test]
fn test_handlers_fire_once_each_in_registration_order() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let seen: Seen = Rc::default();

    mux.subscribe("class-42", filter::any(), recorder(&seen, "a"));
    mux.subscribe("class-42", filter::kind("task-progress"), recorder(&seen, "skipped"));
    mux.subscribe("class-7", filter::any(), recorder(&seen, "other-channel"));
    mux.subscribe("class-42", filter::any(), recorder(&seen, "b"));
    mux.subscribe("class-42", filter::kind("student-enrolled"), recorder(&seen, "c"));

    mux.handle_event(inbound(&class(), enrolled("s1")));
    assert_eq!(*seen.borrow(), vec!["a", "b", "c"]);
}

#[test]
fn test_failing_handlers_do_not_block_others_or_later_messages() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let seen: Seen = Rc::default();

    mux.subscribe("class-42", filter::any(), |_| anyhow::bail!("chart not mounted"));
    mux.subscribe("class-42", filter::any(), |m| {
        if m.kind() == "student-enrolled" {
            panic!("unexpected roster shape");
        }
        Ok(())
    });
    mux.subscribe("class-42", filter::any(), recorder(&seen, "ok"));

    mux.handle_event(inbound(&class(), enrolled("s1")));
    mux.handle_event(inbound(&class(), json!({ "type": "leaderboard-refresh" })));

    assert_eq!(*seen.borrow(), vec!["ok", "ok"]);
    let diag = mux.diagnostics();
    assert_eq!(diag.handler_failures, 3);
    assert_eq!(diag.delivered, 3);
}

#[test]
fn test_malformed_messages_are_counted_and_dropped() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let seen: Seen = Rc::default();
    mux.subscribe("class-42", filter::any(), recorder(&seen, "x"));

    mux.handle_event(inbound(&class(), json!({ "payload": { "id": "s1" } })));
    mux.handle_event(inbound(&class(), json!("student-enrolled")));
    mux.handle_event(inbound(&class(), json!({ "type": 7, "payload": {} })));

    assert!(seen.borrow().is_empty());
    assert_eq!(mux.diagnostics().malformed, 3);
}

#[test]
fn test_known_type_with_unexpected_payload_still_routes() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let received: Rc<RefCell<Vec<Message>>> = Rc::default();

    let sink = Rc::clone(&received);
    mux.subscribe("class-42", filter::kind("student-enrolled"), move |m| {
        sink.borrow_mut().push(m.clone());
        Ok(())
    });

    mux.handle_event(inbound(
        &class(),
        json!({ "type": "student-enrolled", "payload": { "id": 42 } }),
    ));
    mux.handle_event(inbound(
        &class(),
        json!({ "type": "student-enrolled", "payload": { "studentId": "s1" } }),
    ));

    let received = received.borrow();
    assert_eq!(received.len(), 2);
    assert!(received
        .iter()
        .all(|m| matches!(&m.event, Event::Other { kind, .. } if kind == "student-enrolled")));
    assert_eq!(received[1].event.payload()["studentId"], "s1");
    assert_eq!(mux.diagnostics().malformed, 0);
}

#[test]
fn test_unknown_types_still_route() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let seen: Seen = Rc::default();
    mux.subscribe("class-42", filter::kind("badge-awarded"), recorder(&seen, "badge"));

    mux.handle_event(inbound(
        &class(),
        json!({ "type": "badge-awarded", "payload": { "badge": "streak-7" } }),
    ));
    assert_eq!(*seen.borrow(), vec!["badge"]);
}

#[test]
fn test_handler_can_unsubscribe_itself_and_a_later_sibling() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let seen: Seen = Rc::default();
    let ids: Rc<RefCell<Vec<SubscriptionId>>> = Rc::default();

    let handle = mux.clone();
    let own = Rc::clone(&ids);
    let log = Rc::clone(&seen);
    let first = mux.subscribe("class-42", filter::any(), move |_| {
        log.borrow_mut().push("first".to_string());
        for id in own.borrow().iter() {
            handle.unsubscribe(*id);
        }
        Ok(())
    });
    let second = mux.subscribe("class-42", filter::any(), recorder(&seen, "second"));
    mux.subscribe("class-42", filter::any(), recorder(&seen, "third"));
    ids.borrow_mut().extend([first, second]);

    mux.handle_event(inbound(&class(), enrolled("s1")));
    mux.handle_event(inbound(&class(), enrolled("s2")));

    assert_eq!(*seen.borrow(), vec!["first", "third", "third"]);
    assert_eq!(mux.ref_count(&class()), 1);
}

#[test]
fn test_subscription_added_during_dispatch_waits_for_next_message() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let seen: Seen = Rc::default();

    let handle = mux.clone();
    let log = Rc::clone(&seen);
    let added = Rc::new(RefCell::new(false));
    mux.subscribe("class-42", filter::any(), move |_| {
        if !*added.borrow() {
            *added.borrow_mut() = true;
            handle.subscribe("class-42", filter::any(), recorder(&log, "late"));
        }
        Ok(())
    });

    mux.handle_event(inbound(&class(), enrolled("s1")));
    assert!(seen.borrow().is_empty());

    mux.handle_event(inbound(&class(), enrolled("s2")));
    assert_eq!(*seen.borrow(), vec!["late"]);
}

#[test]
fn test_handler_can_send_while_dispatching() {
    let (mux, transport) = setup();
    online(&mux, &transport);

    let handle = mux.clone();
    mux.subscribe("class-42", filter::kind("leaderboard-refresh"), move |_| {
        handle.send("class-42", request(10));
        Ok(())
    });

    mux.handle_event(inbound(&class(), json!({ "type": "leaderboard-refresh" })));
    assert_eq!(transport.sent().len(), 1);
}

// ─── Reconnection ───────────────────────────────────────────────────────────

#[test]
fn test_reconnect_replays_channels_and_resumes_delivery() {
    let (mux, transport) = setup();
    let seen: Seen = Rc::default();
    let roster = ChannelName::from("class-42");
    let tasks = ChannelName::from("tasks-export");

    mux.subscribe(roster.clone(), filter::any(), recorder(&seen, "roster"));
    mux.subscribe(tasks.clone(), filter::any(), recorder(&seen, "tasks"));

    online(&mux, &transport);
    mux.handle_event(TransportEvent::ChannelOpened(roster.clone()));
    mux.handle_event(TransportEvent::ChannelOpened(tasks.clone()));
    transport.take_calls();

    offline(&mux, &transport);
    assert!(!mux.is_open(&roster));
    assert_eq!(mux.channel_status(&roster), Some(ChannelStatus::Pending));

    online(&mux, &transport);
    let mut reopened = transport.opened();
    reopened.sort();
    assert_eq!(reopened, vec![roster.clone(), tasks.clone()]);

    mux.handle_event(TransportEvent::ChannelOpened(roster.clone()));
    mux.handle_event(inbound(&roster, enrolled("s1")));
    assert_eq!(*seen.borrow(), vec!["roster"]);
    assert!(mux.is_open(&roster));
}

#[test]
fn test_channels_released_while_offline_are_not_replayed() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let id = mux.subscribe("class-42", filter::any(), |_| Ok(()));
    transport.take_calls();

    offline(&mux, &transport);
    mux.unsubscribe(id);
    online(&mux, &transport);

    assert!(transport.calls().is_empty());
}

#[test]
fn test_sends_fail_over_to_queue_when_transport_drops_first() {
    let (mux, transport) = setup();
    online(&mux, &transport);

    // Transport has already lost the link; the event is still in flight.
    transport.set_state(ConnectionState::Reconnecting { attempt: 1 });
    mux.send("class-42", request(1));
    assert_eq!(mux.queued(), 1);

    offline(&mux, &transport);
    online(&mux, &transport);
    assert_eq!(transport.sent().len(), 1);
    assert_eq!(mux.queued(), 0);
}

// ─── Channel failures ───────────────────────────────────────────────────────

#[test]
fn test_rejection_reaches_only_that_channels_subscribers() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let errors: Rc<RefCell<Vec<ChannelOpenError>>> = Rc::default();
    let studio = ChannelName::from("private-studio-7");

    for channel in ["private-studio-7", "private-studio-7", "class-42"] {
        let sink = Rc::clone(&errors);
        mux.subscribe_with_errors(channel, filter::any(), |_| Ok(()), move |e| {
            sink.borrow_mut().push(e.clone());
        });
    }

    mux.handle_event(TransportEvent::ChannelFailed(ChannelOpenError::Rejected {
        channel: studio.clone(),
    }));

    let errors = errors.borrow();
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().all(|e| e.channel() == &studio));
    assert_eq!(mux.channel_status(&studio), Some(ChannelStatus::Failed));
    // Subscribers are kept; the channel is retried on the next connect.
    assert_eq!(mux.ref_count(&studio), 2);
}

#[test]
fn test_failed_channel_is_retried_on_reconnect() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let studio = ChannelName::from("private-studio-7");
    mux.subscribe(studio.clone(), filter::any(), |_| Ok(()));

    mux.handle_event(TransportEvent::ChannelFailed(ChannelOpenError::Unauthorized {
        channel: studio.clone(),
        reason: "token endpoint returned 503".to_string(),
    }));
    transport.take_calls();

    offline(&mux, &transport);
    online(&mux, &transport);
    assert_eq!(transport.opened(), vec![studio]);
}

#[test]
fn test_unacknowledged_open_times_out() {
    let transport = MemoryTransport::new();
    let mux = Multiplexer::new(
        transport.clone(),
        MuxOptions {
            open_timeout: Duration::from_secs(5),
            ..MuxOptions::default()
        },
    );
    online(&mux, &transport);
    let errors: Rc<RefCell<Vec<ChannelOpenError>>> = Rc::default();
    let sink = Rc::clone(&errors);
    mux.subscribe_with_errors("class-42", filter::any(), |_| Ok(()), move |e| {
        sink.borrow_mut().push(e.clone());
    });

    mux.check_timeouts(Instant::now());
    assert!(errors.borrow().is_empty());

    let later = Instant::now() + Duration::from_secs(6);
    mux.check_timeouts(later);
    mux.check_timeouts(later);

    assert_eq!(
        *errors.borrow(),
        vec![ChannelOpenError::Timeout { channel: class() }]
    );
    assert_eq!(mux.diagnostics().channel_failures, 1);
}

#[test]
fn test_timed_out_channel_is_closed_on_last_release() {
    let transport = MemoryTransport::new();
    let mux = Multiplexer::new(
        transport.clone(),
        MuxOptions {
            open_timeout: Duration::from_secs(5),
            ..MuxOptions::default()
        },
    );
    online(&mux, &transport);
    let id = mux.subscribe("class-42", filter::any(), |_| Ok(()));
    assert_eq!(transport.opened(), vec![class()]);

    mux.check_timeouts(Instant::now() + Duration::from_secs(60));
    assert_eq!(mux.channel_status(&class()), Some(ChannelStatus::Failed));

    // The subscribe already reached the server, so it must be withdrawn.
    mux.unsubscribe(id);
    assert_eq!(transport.closed(), vec![class()]);
    assert_eq!(mux.channel_status(&class()), None);
}

#[test]
fn test_rejected_channel_is_closed_on_last_release() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let studio = ChannelName::from("private-studio-7");
    let id = mux.subscribe(studio.clone(), filter::any(), |_| Ok(()));

    mux.handle_event(TransportEvent::ChannelFailed(ChannelOpenError::Rejected {
        channel: studio.clone(),
    }));
    mux.unsubscribe(id);

    assert_eq!(transport.closed(), vec![studio]);
}

#[test]
fn test_channel_requested_before_link_loss_is_not_closed_offline() {
    let (mux, transport) = setup();
    online(&mux, &transport);
    let id = mux.subscribe("class-42", filter::any(), |_| Ok(()));
    mux.check_timeouts(Instant::now() + Duration::from_secs(60));

    offline(&mux, &transport);
    mux.unsubscribe(id);
    online(&mux, &transport);

    assert!(transport.closed().is_empty());
}

// ─── Event loop ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_run_processes_events_until_stream_closes() {
    let (mux, transport) = setup();
    let seen: Seen = Rc::default();
    mux.subscribe("class-42", filter::any(), recorder(&seen, "x"));

    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    tx.send(transport.set_state(ConnectionState::Connected)).unwrap();
    tx.send(TransportEvent::ChannelOpened(class())).unwrap();
    tx.send(inbound(&class(), enrolled("s1"))).unwrap();
    drop(tx);

    mux.run(rx).await;

    assert_eq!(*seen.borrow(), vec!["x"]);
    assert!(mux.is_open(&class()));
    assert_eq!(mux.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_status_observable_follows_transport() {
    let (mux, transport) = setup();
    let mut status = mux.status();
    assert_eq!(*status.borrow(), ConnectionState::Disconnected);

    transport.set_state(ConnectionState::Reconnecting { attempt: 2 });
    status.changed().await.unwrap();
    assert_eq!(
        *status.borrow_and_update(),
        ConnectionState::Reconnecting { attempt: 2 }
    );
}
