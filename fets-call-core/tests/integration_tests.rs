//! Integration tests for end-to-end mesh calls

mod common;

use common::{connect, drain_events, id, next_event, Node};
use fets_call_core::{BroadcastHub, CallEvent, CallPhase, CallType, StaffId, TrackKind};
use pretty_assertions::assert_eq;

fn kinds(events: &[CallEvent<StaffId>]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            CallEvent::IncomingCall { .. } => "incoming",
            CallEvent::CallStarted { .. } => "started",
            CallEvent::PeerJoined { .. } => "joined",
            CallEvent::PeerLeft { .. } => "left",
            CallEvent::RemoteStreamAdded { .. } => "stream-added",
            CallEvent::RemoteStreamRemoved { .. } => "stream-removed",
            CallEvent::CallRejected { .. } => "rejected",
            CallEvent::MediaFailed { .. } => "media-failed",
            CallEvent::CallEnded { .. } => "ended",
        })
        .collect()
}

#[tokio::test]
async fn two_party_video_call() {
    let hub = BroadcastHub::default();
    let alice = Node::spawn(&hub, "alice").await;
    let bob = Node::spawn(&hub, "bob").await;
    let mut alice_events = alice.manager.subscribe_events();
    let mut bob_events = bob.manager.subscribe_events();

    connect(&alice, &bob).await;
    bob.wait_for("stream from alice", |s| s.remote_streams.contains_key("alice"))
        .await;

    let a = alice.state();
    assert_eq!(a.phase, CallPhase::InCall);
    assert_eq!(a.participants, vec![id("bob")]);
    assert!(a.start_time.is_some());
    assert!(a.duration().is_some());
    let remote = &a.remote_streams["bob"];
    assert_eq!(remote.tracks_of(TrackKind::Audio).count(), 1);
    assert_eq!(remote.tracks_of(TrackKind::Video).count(), 1);

    let b = bob.state();
    assert_eq!(b.phase, CallPhase::InCall);
    assert_eq!(b.caller_id, None);
    assert_eq!(b.participants, vec![id("alice")]);
    assert!(b.local_stream.as_ref().is_some_and(|s| s.has_video()));

    let pc = bob.factory.connection("alice").unwrap();
    assert_eq!(pc.local_track_kinds(), vec![TrackKind::Audio, TrackKind::Video]);

    alice.manager.end_call().await;
    bob.wait_for("idle", |s| s.is_idle_baseline()).await;
    next_event(&mut bob_events, |e| matches!(e, CallEvent::CallEnded { .. })).await;

    let seen = kinds(&drain_events(&mut alice_events));
    assert_eq!(seen.first(), Some(&"started"));
    assert_eq!(seen.last(), Some(&"ended"));
    assert!(seen.contains(&"joined"));
    assert!(seen.contains(&"stream-added"));
}

#[tokio::test]
async fn audio_call_carries_no_video() {
    let hub = BroadcastHub::default();
    let alice = Node::spawn(&hub, "alice").await;
    let bob = Node::spawn(&hub, "bob").await;

    alice
        .manager
        .start_call(vec![id("bob")], CallType::Audio)
        .await
        .unwrap();
    let ringing = bob.wait_for("ringing", |s| s.is_receiving_call()).await;
    assert_eq!(ringing.call_type, Some(CallType::Audio));
    bob.manager.answer_call().await.unwrap();

    let state = alice
        .wait_for("stream from bob", |s| s.remote_streams.contains_key("bob"))
        .await;
    assert!(!state.remote_streams["bob"].has_video());
    assert_eq!(bob.manager.toggle_video().await, None);
    assert_eq!(bob.manager.toggle_audio().await, Some(false));
}

#[tokio::test]
async fn three_way_mesh_from_one_caller() {
    let hub = BroadcastHub::default();
    let alice = Node::spawn(&hub, "alice").await;
    let bob = Node::spawn(&hub, "bob").await;
    let carol = Node::spawn(&hub, "carol").await;

    let call_id = alice
        .manager
        .start_call(vec![id("bob"), id("carol")], CallType::Video)
        .await
        .unwrap();
    for callee in [&bob, &carol] {
        let state = callee.wait_for("ringing", |s| s.is_receiving_call()).await;
        assert_eq!(state.caller_id, Some(id("alice")));
        callee.manager.answer_call().await.unwrap();
    }

    let state = alice
        .wait_for("both streams", |s| s.remote_streams.len() == 2)
        .await;
    assert_eq!(state.call_id, call_id);
    assert_eq!(state.participants, vec![id("bob"), id("carol")]);

    // one shared local stream for both connections
    assert_eq!(alice.devices.issued().len(), 1);
    assert_eq!(alice.factory.created().len(), 2);

    alice.manager.end_call().await;
    bob.wait_for("idle", |s| s.is_idle_baseline()).await;
    carol.wait_for("idle", |s| s.is_idle_baseline()).await;
    assert!(alice.devices.all_released());
}

#[tokio::test]
async fn one_callee_declines_the_whole_call() {
    let hub = BroadcastHub::default();
    let alice = Node::spawn(&hub, "alice").await;
    let bob = Node::spawn(&hub, "bob").await;
    let carol = Node::spawn(&hub, "carol").await;

    alice
        .manager
        .start_call(vec![id("bob"), id("carol")], CallType::Video)
        .await
        .unwrap();
    bob.wait_for("ringing", |s| s.is_receiving_call()).await;
    carol.wait_for("ringing", |s| s.is_receiving_call()).await;

    carol.manager.reject_call().await;
    alice.wait_for("idle", |s| s.is_idle_baseline()).await;
    // alice hung up on everyone else
    bob.wait_for("idle", |s| s.is_idle_baseline()).await;
}

#[tokio::test]
async fn calls_can_follow_each_other() {
    let hub = BroadcastHub::default();
    let alice = Node::spawn(&hub, "alice").await;
    let bob = Node::spawn(&hub, "bob").await;

    connect(&alice, &bob).await;
    let first = alice.state().call_id;
    alice.manager.end_call().await;
    bob.wait_for("idle", |s| s.is_idle_baseline()).await;

    connect(&bob, &alice).await;
    let second = alice.state();
    assert_ne!(second.call_id, first);
    assert_eq!(second.participants, vec![id("bob")]);

    bob.manager.end_call().await;
    alice.wait_for("idle", |s| s.is_idle_baseline()).await;
    assert!(alice.devices.all_released());
    assert!(bob.devices.all_released());
    assert_eq!(alice.devices.issued().len(), 2);
}
