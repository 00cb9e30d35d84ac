//! End-to-end call flows between two managers on one backend

mod common;

use common::*;
use pretty_assertions::assert_eq;
use quadcall_core::{
    CallError, CallEvent, CallRole, CallState, CallStatus, EndReason, MediaKind, MemoryTransport,
    Operation, SyntheticDevices, TrackKind,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn audio_call_connects_and_ends() {
    let (transport, alice, bob) = pair().await;
    let mut alice_events = alice.manager.subscribe_events();
    let mut bob_events = bob.manager.subscribe_events();

    let call_id = alice
        .manager
        .start_call(bob.user(), MediaKind::Audio)
        .await
        .unwrap();

    let snap = alice.manager.snapshot();
    assert_eq!(snap.state, CallState::Outgoing);
    assert_eq!(snap.role, Some(CallRole::Caller));
    assert_eq!(snap.call_id.as_ref(), Some(&call_id));
    assert!(snap.local_stream.as_ref().unwrap().video.is_none());

    let incoming = next_event(&mut bob_events, |e| matches!(e, CallEvent::IncomingCall { .. })).await;
    assert_eq!(
        incoming,
        CallEvent::IncomingCall {
            call_id: call_id.clone(),
            caller: alice.user(),
            kind: MediaKind::Audio,
        }
    );
    let ringing = bob.manager.snapshot();
    assert_eq!(ringing.state, CallState::Incoming);
    assert!(ringing.local_stream.is_none());

    bob.manager.answer_call().await.unwrap();
    assert_eq!(bob.manager.snapshot().state, CallState::Connected);
    next_event(&mut alice_events, |e| matches!(e, CallEvent::Connected { .. })).await;
    assert_eq!(alice.manager.snapshot().state, CallState::Connected);

    let record = transport.call(&call_id).unwrap();
    assert_eq!(record.status, CallStatus::Answered);
    assert!(record.offer.is_some());
    assert!(record.answer.is_some());

    alice.manager.end_call().await.unwrap();
    assert_eq!(alice.manager.snapshot().state, CallState::Ended);
    let ended = next_event(&mut bob_events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    assert_eq!(
        ended,
        CallEvent::CallEnded {
            call_id: Some(call_id.clone()),
            reason: EndReason::RemoteHangup,
        }
    );
    assert_eq!(transport.call(&call_id).unwrap().status, CallStatus::Ended);

    reach(&alice, CallState::Idle).await;
    reach(&bob, CallState::Idle).await;
    assert!(all_tracks_released(&alice.devices).await);
    assert!(all_tracks_released(&bob.devices).await);
    assert!(alice.peer().is_closed());
    assert!(bob.peer().is_closed());
}

#[tokio::test]
async fn video_call_exposes_remote_tracks() {
    let (_transport, alice, bob) = pair().await;
    let mut alice_events = alice.manager.subscribe_events();

    connect(&alice, &bob, MediaKind::Video).await;
    next_event(&mut alice_events, |e| {
        matches!(e, CallEvent::RemoteTrackAdded { kind: TrackKind::Video, .. })
    })
    .await;

    let snap = alice
        .manager
        .wait_for(|s| s.remote_stream.tracks.len() == 2)
        .await
        .unwrap();
    assert!(snap.remote_stream.has(TrackKind::Audio));
    assert!(snap.remote_stream.has(TrackKind::Video));
    assert!(snap.video_enabled);

    let bob_snap = bob
        .manager
        .wait_for(|s| s.remote_stream.tracks.len() == 2)
        .await
        .unwrap();
    assert!(bob_snap.local_stream.unwrap().video.is_some());
}

#[tokio::test]
async fn candidates_reach_each_side_in_order() {
    let (_transport, alice, bob) = pair().await;
    connect(&alice, &bob, MediaKind::Audio).await;

    // Caller candidates were published before the receiver had a peer.
    let applied = applied_eventually(&bob.peer(), 2).await;
    assert!(applied[0].contains("-offer-0"));
    assert!(applied[1].contains("-offer-1"));

    let remote = applied_eventually(&alice.peer(), 2).await;
    assert!(remote[0].contains("-answer-0"));
    assert!(remote[1].contains("-answer-1"));
}

#[tokio::test]
async fn receiver_hangup_ends_both_sides() {
    let (_transport, alice, bob) = pair().await;
    let mut alice_events = alice.manager.subscribe_events();
    connect(&alice, &bob, MediaKind::Video).await;

    bob.manager.end_call().await.unwrap();
    let ended = next_event(&mut alice_events, |e| matches!(e, CallEvent::CallEnded { .. })).await;
    assert!(matches!(
        ended,
        CallEvent::CallEnded {
            reason: EndReason::RemoteHangup,
            ..
        }
    ));
    reach(&alice, CallState::Idle).await;
    assert!(all_tracks_released(&alice.devices).await);
    assert!(all_tracks_released(&bob.devices).await);
}

#[tokio::test]
async fn decline_ends_caller_attempt() {
    let (transport, alice, bob) = pair().await;
    let mut alice_events = alice.manager.subscribe_events();
    let call_id = alice
        .manager
        .start_call(bob.user(), MediaKind::Video)
        .await
        .unwrap();
    reach(&bob, CallState::Incoming).await;

    bob.manager.decline_call().await.unwrap();
    assert!(status_eventually(&transport, &call_id, CallStatus::Ended).await);
    next_event(&mut alice_events, |e| {
        matches!(e, CallEvent::CallEnded { reason: EndReason::RemoteHangup, .. })
    })
    .await;
    reach(&alice, CallState::Idle).await;
    assert!(all_tracks_released(&alice.devices).await);
    assert_eq!(bob.devices.issued_count(), 0);
}

#[tokio::test]
async fn simultaneous_hangup_ends_each_side_once() {
    let (transport, alice, bob) = pair().await;
    let mut alice_events = alice.manager.subscribe_events();
    let mut bob_events = bob.manager.subscribe_events();
    connect(&alice, &bob, MediaKind::Audio).await;
    let call_id = alice.manager.snapshot().call_id.unwrap();

    let (a, b) = futures::future::join(alice.manager.end_call(), bob.manager.end_call()).await;
    a.unwrap();
    b.unwrap();
    reach(&alice, CallState::Idle).await;
    reach(&bob, CallState::Idle).await;
    assert!(status_eventually(&transport, &call_id, CallStatus::Ended).await);

    for events in [&mut alice_events, &mut bob_events] {
        let mut ended = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, CallEvent::CallEnded { .. }) {
                ended += 1;
            }
        }
        assert_eq!(ended, 1);
    }
}

#[tokio::test]
async fn media_denied_returns_to_idle() {
    let (transport, alice, bob) = pair().await;
    alice.devices.deny_permission(true);
    let mut events = alice.manager.subscribe_events();

    let err = alice
        .manager
        .start_call(bob.user(), MediaKind::Video)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Media(_)));
    next_event(&mut events, |e| matches!(e, CallEvent::CallFailed { .. })).await;

    let snap = alice.manager.snapshot();
    assert_eq!(snap.state, CallState::Idle);
    assert!(snap.last_error.is_some());
    assert!(transport.calls().is_empty());
    assert_eq!(bob.manager.snapshot().state, CallState::Idle);
}

#[tokio::test]
async fn signaling_failure_releases_media() {
    let (transport, alice, bob) = pair().await;
    transport.fail_next(Operation::CreateCall);

    let err = alice
        .manager
        .start_call(bob.user(), MediaKind::Audio)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Signaling(_)));
    assert_eq!(alice.manager.snapshot().state, CallState::Idle);
    assert!(all_tracks_released(&alice.devices).await);

    // Next attempt goes through.
    connect(&alice, &bob, MediaKind::Audio).await;
}

#[tokio::test]
async fn offer_publish_failure_ends_record() {
    let (transport, alice, bob) = pair().await;
    transport.fail_next(Operation::UpdateCall);

    let err = alice
        .manager
        .start_call(bob.user(), MediaKind::Audio)
        .await
        .unwrap_err();
    assert!(matches!(err, CallError::Signaling(_)));
    assert_eq!(alice.manager.snapshot().state, CallState::Idle);
    assert!(all_tracks_released(&alice.devices).await);

    let record = transport.calls().pop().unwrap();
    assert!(status_eventually(&transport, &record.id, CallStatus::Ended).await);
    reach(&bob, CallState::Idle).await;
}

#[tokio::test]
async fn hangup_during_pending_start_cancels() {
    let transport = Arc::new(MemoryTransport::new());
    let alice = party_with(
        &transport,
        "alice",
        SyntheticDevices::new().with_capture_delay(Duration::from_millis(100)),
        test_config(),
    )
    .await;
    let bob = party(&transport, "bob").await;

    let manager = alice.manager.clone();
    let receiver = bob.user();
    let pending = tokio::spawn(async move { manager.start_call(receiver, MediaKind::Video).await });

    alice
        .manager
        .wait_for(|s| s.setup_pending)
        .await
        .unwrap();
    alice.manager.end_call().await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));
    assert!(all_tracks_released(&alice.devices).await);
    assert!(transport.calls().is_empty());
    reach(&alice, CallState::Idle).await;
}

#[tokio::test]
async fn shutdown_during_pending_start_releases_everything() {
    let transport = Arc::new(MemoryTransport::new().with_latency(Duration::from_millis(200)));
    let alice = party(&transport, "alice").await;
    let bob = party(&transport, "bob").await;

    let manager = alice.manager.clone();
    let receiver = bob.user();
    let pending = tokio::spawn(async move { manager.start_call(receiver, MediaKind::Video).await });

    alice
        .manager
        .wait_for(|s| s.setup_pending)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.manager.shutdown().await.unwrap();

    let result = pending.await.unwrap();
    assert!(matches!(result, Err(CallError::Cancelled)));

    // The record was created after shutdown; the pipeline ends it itself.
    let mut ended = false;
    for _ in 0..100 {
        let calls = transport.calls();
        if !calls.is_empty() && calls.iter().all(|c| c.status == CallStatus::Ended) {
            ended = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(ended);
    assert!(all_tracks_released(&alice.devices).await);
    assert!(alice.peers.peers().iter().all(|p| p.is_closed()));
    reach(&bob, CallState::Idle).await;
}

#[tokio::test]
async fn negotiation_failure_on_answer() {
    let (transport, alice, bob) = pair().await;
    bob.peers.reject_remote(true);

    let call_id = alice
        .manager
        .start_call(bob.user(), MediaKind::Audio)
        .await
        .unwrap();
    reach(&bob, CallState::Incoming).await;

    let err = bob.manager.answer_call().await.unwrap_err();
    assert!(matches!(err, CallError::Negotiation(_)));
    assert_eq!(bob.manager.snapshot().state, CallState::Idle);
    assert!(all_tracks_released(&bob.devices).await);
    assert!(status_eventually(&transport, &call_id, CallStatus::Ended).await);
    reach(&alice, CallState::Idle).await;
}

#[tokio::test]
async fn connection_failure_tears_down() {
    let (_transport, alice, bob) = pair().await;
    let mut events = alice.manager.subscribe_events();
    connect(&alice, &bob, MediaKind::Audio).await;

    alice.peer().fail_connection();
    next_event(&mut events, |e| matches!(e, CallEvent::CallFailed { .. })).await;
    assert_eq!(alice.manager.snapshot().state, CallState::Idle);
    assert!(all_tracks_released(&alice.devices).await);
    reach(&bob, CallState::Idle).await;
}

#[tokio::test]
async fn second_call_after_first_ends() {
    let (_transport, alice, bob) = pair().await;
    connect(&alice, &bob, MediaKind::Audio).await;
    alice.manager.end_call().await.unwrap();
    reach(&alice, CallState::Idle).await;
    reach(&bob, CallState::Idle).await;

    connect(&bob, &alice, MediaKind::Video).await;
    assert_eq!(bob.manager.snapshot().role, Some(CallRole::Caller));
    assert_eq!(alice.manager.snapshot().role, Some(CallRole::Receiver));
}
