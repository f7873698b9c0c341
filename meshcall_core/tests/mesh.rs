//! Call scenarios over the in-process relay

use futures::FutureExt;
use meshcall_core::negotiation::Trigger;
use meshcall_core::{
    CallAction, CallError, IceCandidate, IdentitySource, LoopbackEngine, LoopbackMedia, MeshConfig,
    MeshCoordinator, NegotiationState, ParticipantId, RelayConnection, RelayHub,
    SessionDescription, SignalingChannel, SignalingEnvelope, Topology,
};
use std::sync::Arc;
use std::time::Duration;

struct Peer {
    coordinator: MeshCoordinator<RelayConnection>,
    engine: LoopbackEngine,
    media: LoopbackMedia,
}

impl Peer {
    fn new(hub: &RelayHub, address: &str) -> Self {
        Self::with_config(hub, address, MeshConfig::default())
    }

    fn with_config(hub: &RelayHub, address: &str, config: MeshConfig) -> Self {
        Self::with_engine(hub, LoopbackEngine::new(address), config)
    }

    fn with_engine(hub: &RelayHub, engine: LoopbackEngine, config: MeshConfig) -> Self {
        let media = LoopbackMedia::new();
        let coordinator = MeshCoordinator::new(
            config,
            hub.connect(),
            Arc::new(engine.clone()),
            Arc::new(media.clone()),
        );
        Self {
            coordinator,
            engine,
            media,
        }
    }

    fn id(&self) -> ParticipantId {
        ParticipantId::new(self.engine.address())
    }
}

fn pairwise() -> MeshConfig {
    MeshConfig {
        topology: Topology::Pairwise,
        ..MeshConfig::default()
    }
}

/// Calls that end without telling anyone
fn silent_hangup(topology: Topology) -> MeshConfig {
    MeshConfig {
        topology,
        announce_hangup: false,
        ..MeshConfig::default()
    }
}

/// Drain every coordinator until nobody has work left
async fn settle(peers: &mut [Peer]) {
    let mut quiet = 0;
    while quiet < 2 {
        let mut handled = 0;
        for peer in peers.iter_mut() {
            handled += peer.coordinator.drain_ready().await.unwrap();
        }
        if handled == 0 {
            quiet += 1;
            tokio::task::yield_now().await;
        } else {
            quiet = 0;
        }
    }
}

/// Everything a raw relay client has received so far
fn received(client: &mut RelayConnection) -> Vec<SignalingEnvelope> {
    let mut envelopes = Vec::new();
    while let Some(Ok(envelope)) = client.recv().now_or_never() {
        envelopes.push(envelope);
    }
    envelopes
}

fn assert_complete(peers: &[Peer]) {
    for peer in peers {
        let mut expected: Vec<ParticipantId> = peers
            .iter()
            .map(Peer::id)
            .filter(|id| *id != peer.id())
            .collect();
        expected.sort();
        assert_eq!(peer.coordinator.connected_peers(), expected, "peers of {}", peer.id());
        assert_eq!(
            peer.coordinator.registry().map(|r| r.len()),
            Some(expected.len())
        );
        assert_eq!(peer.engine.open_sessions(), expected.len());
    }
}

#[tokio::test]
async fn test_concurrent_start_builds_complete_graph() {
    let hub = RelayHub::new();
    let mut peers: Vec<Peer> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        .iter()
        .map(|address| Peer::new(&hub, address))
        .collect();

    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    assert_complete(&peers);
    assert_eq!(hub.active_count(), 3);
}

#[tokio::test]
async fn test_staggered_start_builds_complete_graph() {
    let hub = RelayHub::new();
    let mut peers: Vec<Peer> = ["10.0.0.4", "10.0.0.2", "10.0.0.3", "10.0.0.1"]
        .iter()
        .map(|address| Peer::new(&hub, address))
        .collect();

    for i in 0..peers.len() {
        peers[i].coordinator.start_call().await.unwrap();
        settle(&mut peers).await;
    }

    assert_complete(&peers);
}

#[tokio::test]
async fn test_mixed_start_order_builds_complete_graph() {
    let hub = RelayHub::new();
    let mut peers: Vec<Peer> = ["10.0.0.1", "10.0.0.2", "10.0.0.3", "10.0.0.4"]
        .iter()
        .map(|address| Peer::new(&hub, address))
        .collect();

    peers[3].coordinator.start_call().await.unwrap();
    peers[0].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;
    peers[2].coordinator.start_call().await.unwrap();
    peers[1].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;

    assert_complete(&peers);
}

#[tokio::test]
async fn test_start_with_no_peers() {
    let hub = RelayHub::new();
    let mut peers = vec![Peer::new(&hub, "10.0.0.1")];

    let local = peers[0].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;

    let coordinator = &peers[0].coordinator;
    assert_eq!(local.as_str(), "10.0.0.1");
    assert!(coordinator.in_call());
    assert!(coordinator.local_media().is_some());
    assert!(coordinator.registry().is_some_and(|r| r.is_empty()));
    assert_eq!(peers[0].media.held(), 1);
    assert_eq!(hub.active_count(), 1);
}

#[tokio::test]
async fn test_duplicate_announce_sends_one_offer() {
    let hub = RelayHub::new();
    let mut remote = hub.connect();
    let mut peers = vec![Peer::new(&hub, "10.0.0.1")];
    peers[0].coordinator.start_call().await.unwrap();
    received(&mut remote);

    let announce = SignalingEnvelope::announce("10.0.0.9".into());
    remote.send(&announce).await.unwrap();
    remote.send(&announce).await.unwrap();
    settle(&mut peers).await;

    let offers: Vec<SignalingEnvelope> = received(&mut remote)
        .into_iter()
        .filter(|e| e.kind() == "offer")
        .collect();
    assert_eq!(offers.len(), 1);
    assert_eq!(offers[0].sender().map(|s| s.as_str()), Some("10.0.0.1"));
    assert_eq!(offers[0].target().map(|t| t.as_str()), Some("10.0.0.9"));

    let remote_id = ParticipantId::new("10.0.0.9");
    let coordinator = &peers[0].coordinator;
    assert_eq!(coordinator.registry().map(|r| r.len()), Some(1));
    assert_eq!(
        coordinator.session(&remote_id).map(|s| s.state()),
        Some(NegotiationState::OfferSent)
    );
    // One probe plus one peer session
    assert_eq!(peers[0].engine.sessions_created(), 2);
}

#[tokio::test]
async fn test_inbound_offer_is_answered() {
    let hub = RelayHub::new();
    let mut remote = hub.connect();
    let mut peers = vec![Peer::new(&hub, "10.0.0.1")];
    let local = peers[0].coordinator.start_call().await.unwrap();
    received(&mut remote);

    let b = ParticipantId::new("B");
    let offer = SignalingEnvelope::offer(SessionDescription::offer("v=0\r\n"), &b, Some(&local));
    peers[0].coordinator.handle_envelope(offer).await.unwrap();

    assert_eq!(
        peers[0].coordinator.session(&b).map(|s| s.state()),
        Some(NegotiationState::Answered)
    );
    let answers: Vec<SignalingEnvelope> = received(&mut remote)
        .into_iter()
        .filter(|e| e.kind() == "answer")
        .collect();
    assert_eq!(answers.len(), 1);
    assert_eq!(answers[0].sender(), Some(&local));
    assert_eq!(answers[0].target(), Some(&b));

    // Connectivity is reported by the transport
    settle(&mut peers).await;
    assert_eq!(
        peers[0].coordinator.session(&b).map(|s| s.state()),
        Some(NegotiationState::Connected)
    );
    assert_eq!(
        peers[0].coordinator.session(&b).map(|s| s.remote_tracks().to_vec()),
        Some(vec!["B-audio".to_string()])
    );

    // Local candidates follow the answer, addressed to B
    let candidates: Vec<SignalingEnvelope> = received(&mut remote)
        .into_iter()
        .filter(|e| e.kind() == "candidate")
        .collect();
    assert_eq!(candidates.len(), 2);
    assert!(candidates.iter().all(|c| c.target() == Some(&b)));
}

#[tokio::test]
async fn test_stale_answer_is_rejected() {
    let hub = RelayHub::new();
    let mut peers = vec![Peer::new(&hub, "10.0.0.1")];
    let local = peers[0].coordinator.start_call().await.unwrap();

    let c = ParticipantId::new("C");
    let answer = SignalingEnvelope::answer(SessionDescription::answer("v=0\r\n"), &c, Some(&local));
    let err = peers[0].coordinator.handle_envelope(answer).await.unwrap_err();

    match err {
        CallError::StaleSignalingMessage { participant, kind } => {
            assert_eq!(participant, c);
            assert_eq!(kind, "answer");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(peers[0].coordinator.registry().is_some_and(|r| r.is_empty()));
    // The coordinator keeps running
    settle(&mut peers).await;
    assert!(peers[0].coordinator.in_call());
}

#[tokio::test]
async fn test_early_candidates_are_applied_once_in_order() {
    let hub = RelayHub::new();
    let mut peers = vec![Peer::new(&hub, "10.0.0.1")];
    let local = peers[0].coordinator.start_call().await.unwrap();
    let b = ParticipantId::new("B");
    peers[0]
        .coordinator
        .handle_envelope(SignalingEnvelope::announce(b.clone()))
        .await
        .unwrap();

    // Candidates overtake the answer
    let first = IceCandidate::new("candidate:1 1 udp 2130706431 10.0.0.2 5001 typ host");
    let second = IceCandidate::new("candidate:2 1 udp 2130706430 10.0.0.2 5002 typ host");
    for candidate in [&first, &second, &first] {
        peers[0]
            .coordinator
            .handle_envelope(SignalingEnvelope::candidate(candidate.clone(), &b, Some(&local)))
            .await
            .unwrap();
    }
    assert_eq!(
        peers[0].coordinator.session(&b).map(|s| s.pending_candidates().len()),
        Some(3)
    );
    assert!(peers[0].engine.applied_candidates(&b).is_empty());

    peers[0]
        .coordinator
        .handle_envelope(SignalingEnvelope::answer(
            SessionDescription::answer("v=0\r\n"),
            &b,
            Some(&local),
        ))
        .await
        .unwrap();

    let session = peers[0].coordinator.session(&b).unwrap();
    assert_eq!(session.state(), NegotiationState::Connected);
    assert!(session.pending_candidates().is_empty());
    assert_eq!(peers[0].engine.applied_candidates(&b), vec![first, second]);
}

#[tokio::test]
async fn test_two_concurrent_starters_connect_once() {
    let hub = RelayHub::new();
    let mut peers = vec![Peer::new(&hub, "10.0.0.7"), Peer::new(&hub, "10.0.0.3")];

    peers[0].coordinator.start_call().await.unwrap();
    peers[1].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;

    for peer in &peers {
        let sessions: Vec<NegotiationState> = peer
            .coordinator
            .registry()
            .map(|r| r.all().map(|s| s.state()).collect())
            .unwrap_or_default();
        assert_eq!(sessions, vec![NegotiationState::Connected]);
        assert_eq!(peer.engine.open_sessions(), 1);
    }
    // The higher id gave up its own offer
    assert_eq!(peers[0].engine.sessions_created(), 3);
    assert_eq!(peers[1].engine.sessions_created(), 2);
}

#[tokio::test]
async fn test_end_call_closes_every_session() {
    let hub = RelayHub::new();
    let mut peers: Vec<Peer> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        .iter()
        .map(|address| Peer::new(&hub, address))
        .collect();
    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    peers[0].coordinator.end_call().await.unwrap();
    settle(&mut peers).await;

    assert!(!peers[0].coordinator.in_call());
    assert!(peers[0].coordinator.registry().is_none());
    assert_eq!(peers[0].engine.open_sessions(), 0);
    assert_eq!(peers[0].media.acquired(), 1);
    assert_eq!(peers[0].media.released(), 1);
    assert_eq!(hub.active_count(), 2);

    // The others dropped their session with the leaver
    let leaver = peers[0].id();
    for peer in &peers[1..] {
        assert!(!peer.coordinator.connected_peers().contains(&leaver));
        assert_eq!(peer.coordinator.connected_peers().len(), 1);
        assert_eq!(peer.engine.open_sessions(), 1);
    }
}

#[tokio::test]
async fn test_rejoin_after_end_call() {
    let hub = RelayHub::new();
    let mut peers = vec![Peer::new(&hub, "10.0.0.1"), Peer::new(&hub, "10.0.0.2")];
    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    peers[1].coordinator.end_call().await.unwrap();
    settle(&mut peers).await;
    peers[1].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;

    assert_complete(&peers);
    assert_eq!(peers[1].media.acquired(), 2);
    assert_eq!(peers[1].media.held(), 1);
}

#[tokio::test]
async fn test_failed_session_is_isolated() {
    let hub = RelayHub::new();
    let failing = LoopbackEngine::new("10.0.0.1");
    failing.fail_sessions_for(&ParticipantId::new("10.0.0.3"));
    let mut peers = vec![
        Peer::with_engine(&hub, failing, MeshConfig::default()),
        Peer::new(&hub, "10.0.0.2"),
        Peer::new(&hub, "10.0.0.3"),
    ];
    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    let [a, b, c] = [peers[0].id(), peers[1].id(), peers[2].id()];
    assert_eq!(peers[0].coordinator.connected_peers(), vec![b.clone()]);
    assert!(!peers[0].coordinator.registry().is_some_and(|r| r.contains(&c)));
    assert_eq!(peers[1].coordinator.connected_peers(), vec![a.clone(), c]);
    assert_eq!(peers[2].coordinator.connected_peers(), vec![b]);
    assert!(peers[0].coordinator.in_call());
}

#[tokio::test]
async fn test_channel_closed_aborts_call() {
    let hub = RelayHub::new();
    let mut peers = vec![Peer::new(&hub, "10.0.0.1"), Peer::new(&hub, "10.0.0.2")];
    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    hub.shutdown();
    let result = peers[0].coordinator.drain_ready().await;

    assert!(matches!(result, Err(CallError::ChannelClosed)));
    assert!(!peers[0].coordinator.in_call());
    assert_eq!(peers[0].engine.open_sessions(), 0);
    assert_eq!(peers[0].media.held(), 0);
}

#[tokio::test]
async fn test_pairwise_call() {
    let hub = RelayHub::new();
    let mut peers = vec![
        Peer::with_config(&hub, "10.0.0.1", pairwise()),
        Peer::with_config(&hub, "10.0.0.2", pairwise()),
    ];

    peers[0].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;
    peers[1].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;

    for peer in &peers {
        assert_eq!(
            peer.coordinator.connected_peers(),
            vec![ParticipantId::implicit_remote()]
        );
        assert_eq!(peer.engine.open_sessions(), 1);
    }

    peers[0].coordinator.end_call().await.unwrap();
    settle(&mut peers).await;
    assert!(peers[1].coordinator.registry().is_some_and(|r| r.is_empty()));
}

#[tokio::test]
async fn test_pairwise_concurrent_start() {
    let hub = RelayHub::new();
    let mut peers = vec![
        Peer::with_config(&hub, "10.0.0.2", pairwise()),
        Peer::with_config(&hub, "10.0.0.1", pairwise()),
    ];

    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    for peer in &peers {
        assert_eq!(
            peer.coordinator.connected_peers(),
            vec![ParticipantId::implicit_remote()]
        );
    }
}

#[tokio::test]
async fn test_media_failure_resets_call() {
    let hub = RelayHub::new();
    let peer = Peer::new(&hub, "10.0.0.1");
    let mut coordinator = peer.coordinator;
    peer.media.set_failing(true);

    let err = coordinator.start_call().await.unwrap_err();

    assert!(matches!(err, CallError::MediaAcquisitionFailed(_)));
    assert!(!coordinator.in_call());
    assert_eq!(hub.active_count(), 0);

    peer.media.set_failing(false);
    coordinator.start_call().await.unwrap();
    assert!(coordinator.in_call());
}

#[tokio::test(start_paused = true)]
async fn test_identity_failure_aborts_start() {
    let hub = RelayHub::new();
    let peer = Peer::with_engine(
        &hub,
        LoopbackEngine::without_candidates("10.0.0.1"),
        MeshConfig::default(),
    );
    let mut coordinator = peer.coordinator;

    let err = coordinator.start_call().await.unwrap_err();

    assert!(matches!(err, CallError::IdentityUnavailable(_)));
    assert!(!coordinator.in_call());
    assert_eq!(peer.media.acquired(), 0);
    assert_eq!(peer.engine.open_sessions(), 0);
}

#[tokio::test]
async fn test_random_identity() {
    let hub = RelayHub::new();
    let config = MeshConfig {
        identity: IdentitySource::Random,
        ..MeshConfig::default()
    };
    let mut peer = Peer::with_config(&hub, "10.0.0.1", config);

    let local = peer.coordinator.start_call().await.unwrap();

    assert!(uuid::Uuid::parse_str(local.as_str()).is_ok());
    assert_eq!(peer.engine.probes_created(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_with_call_handles() {
    let hub = RelayHub::new();
    let a = Peer::new(&hub, "10.0.0.1");
    let b = Peer::new(&hub, "10.0.0.2");
    let (handle_a, handle_b) = (a.coordinator.handle(), b.coordinator.handle());

    let mut coordinator_a = a.coordinator;
    let mut coordinator_b = b.coordinator;
    let task_a = tokio::spawn(async move { coordinator_a.run().await });
    let task_b = tokio::spawn(async move { coordinator_b.run().await });

    assert!(handle_a.start_call());
    assert!(handle_b.start_call());
    // Paused time only advances once both loops are idle
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(hub.active_count(), 2);
    assert_eq!(a.engine.open_sessions(), 1);
    assert_eq!(b.engine.open_sessions(), 1);

    assert!(handle_a.shutdown());
    assert!(handle_b.shutdown());
    assert!(task_a.await.unwrap().is_ok());
    assert!(task_b.await.unwrap().is_ok());

    assert_eq!(hub.active_count(), 0);
    assert_eq!(a.engine.open_sessions(), 0);
    assert_eq!(b.media.held(), 0);
    assert!(!handle_a.start_call());
}

#[tokio::test(start_paused = true)]
async fn test_run_ends_when_relay_goes_away() {
    let hub = RelayHub::new();
    let peer = Peer::new(&hub, "10.0.0.1");
    let handle = peer.coordinator.handle();
    let mut coordinator = peer.coordinator;
    let task = tokio::spawn(async move { coordinator.run().await });

    handle.start_call();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(peer.media.held(), 1);

    hub.shutdown();
    let result = task.await.unwrap();

    assert!(matches!(result, Err(CallError::ChannelClosed)));
    assert_eq!(peer.media.held(), 0);
}

#[tokio::test]
async fn test_rejoin_without_hangup_notice() {
    let hub = RelayHub::new();
    let mut observer = hub.connect();
    let mut peers = vec![
        Peer::with_config(&hub, "10.0.0.1", silent_hangup(Topology::Mesh)),
        Peer::with_config(&hub, "10.0.0.2", silent_hangup(Topology::Mesh)),
        Peer::with_config(&hub, "10.0.0.3", silent_hangup(Topology::Mesh)),
    ];
    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;
    received(&mut observer);

    peers[1].coordinator.end_call().await.unwrap();
    settle(&mut peers).await;

    let hangups = received(&mut observer)
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SignalingEnvelope::Action {
                    action: CallAction::CallEnded,
                    ..
                }
            )
        })
        .count();
    assert_eq!(hangups, 0);
    // Nobody was told, so the others still hold a session with the leaver
    let leaver = peers[1].id();
    assert!(peers[0].coordinator.registry().is_some_and(|r| r.contains(&leaver)));

    peers[1].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;

    assert_complete(&peers);
    assert_eq!(peers[1].media.held(), 1);
}

#[tokio::test]
async fn test_pairwise_rejoin_without_hangup_notice() {
    let hub = RelayHub::new();
    let mut peers = vec![
        Peer::with_config(&hub, "10.0.0.1", silent_hangup(Topology::Pairwise)),
        Peer::with_config(&hub, "10.0.0.2", silent_hangup(Topology::Pairwise)),
    ];
    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    peers[0].coordinator.end_call().await.unwrap();
    settle(&mut peers).await;
    peers[0].coordinator.start_call().await.unwrap();
    settle(&mut peers).await;

    for peer in &peers {
        assert_eq!(
            peer.coordinator.connected_peers(),
            vec![ParticipantId::implicit_remote()]
        );
        assert_eq!(peer.engine.open_sessions(), 1);
    }
}

#[tokio::test]
async fn test_lost_transport_drops_only_that_session() {
    let hub = RelayHub::new();
    let mut peers: Vec<Peer> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        .iter()
        .map(|address| Peer::new(&hub, address))
        .collect();
    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    let [a, b, c] = [peers[0].id(), peers[1].id(), peers[2].id()];
    assert!(peers[0].engine.drop_connection(&c));
    settle(&mut peers).await;

    assert_eq!(peers[0].coordinator.connected_peers(), vec![b.clone()]);
    assert!(!peers[0].coordinator.registry().is_some_and(|r| r.contains(&c)));
    assert_eq!(peers[0].engine.open_sessions(), 1);
    assert!(!peers[0].engine.drop_connection(&c));
    assert!(peers[0].coordinator.in_call());
    assert_eq!(peers[1].coordinator.connected_peers(), vec![a, c]);
}

#[tokio::test]
async fn test_answer_to_connected_session_isolates_it() {
    let hub = RelayHub::new();
    let mut peers: Vec<Peer> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
        .iter()
        .map(|address| Peer::new(&hub, address))
        .collect();
    for peer in peers.iter_mut() {
        peer.coordinator.start_call().await.unwrap();
    }
    settle(&mut peers).await;

    let [a, b, c] = [peers[0].id(), peers[1].id(), peers[2].id()];
    let duplicate = SignalingEnvelope::answer(SessionDescription::answer("v=0\r\n"), &b, Some(&a));
    let err = peers[0].coordinator.handle_envelope(duplicate).await.unwrap_err();

    match err {
        CallError::InvalidNegotiationTransition {
            participant,
            state,
            trigger,
        } => {
            assert_eq!(participant, b);
            assert_eq!(state, NegotiationState::Connected);
            assert_eq!(trigger, Trigger::InboundAnswer);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(peers[0].coordinator.connected_peers(), vec![c.clone()]);
    assert_eq!(
        peers[0].coordinator.session(&c).map(|s| s.state()),
        Some(NegotiationState::Connected)
    );
    assert_eq!(peers[0].engine.open_sessions(), 1);
    assert!(peers[0].coordinator.in_call());
}
