//! Broker routing state machine.
//!
//! All routing state lives here and is touched only from the hub loop, so
//! none of it needs locking. The state machine is pure with respect to time:
//! every entry point takes `now`, which keeps expiry and dispatch ordering
//! deterministic and testable.

use bytes::Bytes;
use flume::Sender;
use hashbrown::HashMap;
use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::peer::{PeerCmd, PeerEvent};
use crate::command::{
    self, BrokerToClient, BrokerToWorker, ClientToBroker, Role, WorkerToBroker, MANAGEMENT_PREFIX,
};
use steward_core::config::FabricConfig;

/// A client request waiting for an idle worker.
pub(crate) struct PendingRequest {
    pub(crate) client: Bytes,
    pub(crate) body: Vec<Bytes>,
    pub(crate) enqueued_at: Instant,
}

/// Per-service routing state.
///
/// Both queues are strict FIFO: the oldest pending request meets the
/// oldest-idle worker.
#[derive(Default)]
pub(crate) struct ServiceState {
    pub(crate) pending: VecDeque<PendingRequest>,
    pub(crate) idle: VecDeque<Bytes>,
    /// Census of currently registered workers (idle + busy).
    pub(crate) registered: usize,
}

impl ServiceState {
    /// A service is available when it has a worker or work in flight.
    pub(crate) fn available(&self) -> bool {
        self.registered > 0 || !self.pending.is_empty()
    }
}

/// One registered worker.
///
/// A known worker is either idle (queued in exactly one service) or busy on
/// exactly one request; eviction removes the record entirely.
pub(crate) struct WorkerRecord {
    pub(crate) service: String,
    pub(crate) expiry: Instant,
    pub(crate) busy: bool,
    /// When the broker last sent this worker a heartbeat.
    pub(crate) last_beat: Instant,
}

pub(crate) struct BrokerState {
    config: FabricConfig,
    pub(crate) started_at: Instant,
    peers: HashMap<Bytes, Sender<PeerCmd>>,
    pub(crate) workers: HashMap<Bytes, WorkerRecord>,
    pub(crate) services: HashMap<String, ServiceState>,
}

impl BrokerState {
    pub(crate) fn new(config: FabricConfig) -> Self {
        Self {
            config,
            started_at: Instant::now(),
            peers: HashMap::new(),
            workers: HashMap::new(),
            services: HashMap::new(),
        }
    }

    pub(crate) fn handle_event(&mut self, event: PeerEvent, now: Instant) {
        match event {
            PeerEvent::Up { identity, tx } => {
                self.peers.insert(identity, tx);
            }
            PeerEvent::Message { identity, frames } => self.on_message(identity, frames, now),
            PeerEvent::Gone { identity } => self.peer_gone(&identity),
        }
    }

    /// Route one inbound message by its protocol-identifier frame.
    fn on_message(&mut self, identity: Bytes, frames: Vec<Bytes>, now: Instant) {
        match command::peek_role(&frames) {
            Some(Role::Client) => match ClientToBroker::parse(&frames) {
                Ok(cmd) => self.handle_client(identity, cmd, now),
                Err(e) => {
                    warn!(
                        "[BROKER] Dropping invalid client message from {:?}: {}",
                        identity, e
                    );
                }
            },
            Some(Role::Worker) => match WorkerToBroker::parse(&frames) {
                Ok(cmd) => self.handle_worker(identity, cmd, now),
                Err(e) => {
                    warn!(
                        "[BROKER] Invalid worker message from {:?}: {}",
                        identity, e
                    );
                    if self.workers.contains_key(&identity) {
                        self.remove_worker(&identity, true);
                    }
                }
            },
            None => {
                // Unknown or mismatched protocol revision. A registered
                // worker is evicted; anything else is dropped and the
                // sender times out on its own.
                warn!(
                    "[BROKER] Protocol identifier mismatch from {:?}, dropping",
                    identity
                );
                if self.workers.contains_key(&identity) {
                    self.remove_worker(&identity, true);
                }
            }
        }
    }

    fn handle_client(&mut self, client: Bytes, cmd: ClientToBroker, now: Instant) {
        let ClientToBroker::Request { service, body } = cmd;

        let Ok(name) = std::str::from_utf8(&service).map(str::to_owned) else {
            warn!(
                "[BROKER] Request from {:?} with non-UTF-8 service name, dropping",
                client
            );
            return;
        };

        if self.config.management_enabled && name.starts_with(MANAGEMENT_PREFIX) {
            let reply = self.management_reply(&name, &body);
            self.send_to_peer(
                &client,
                BrokerToClient::Final {
                    service,
                    body: reply,
                }
                .into_frames(),
            );
            return;
        }

        let hwm = self.config.service_hwm;
        let svc = self.services.entry(name.clone()).or_default();
        svc.pending.push_back(PendingRequest {
            client,
            body,
            enqueued_at: now,
        });
        if svc.pending.len() > hwm {
            // FIFO expiry under backpressure: shed the oldest request.
            if let Some(dropped) = svc.pending.pop_front() {
                warn!(
                    "[BROKER] Service {} over high-water mark ({}), dropping request queued {:?} ago",
                    name,
                    hwm,
                    now.duration_since(dropped.enqueued_at)
                );
            }
        }

        self.dispatch(&name, now);
    }

    fn handle_worker(&mut self, worker: Bytes, cmd: WorkerToBroker, now: Instant) {
        match cmd {
            WorkerToBroker::Ready { service } => self.worker_ready(worker, &service, now),
            WorkerToBroker::Partial { client, body } => {
                self.relay_reply(worker, client, body, false, now);
            }
            WorkerToBroker::Final { client, body } => {
                self.relay_reply(worker, client, body, true, now);
            }
            WorkerToBroker::Heartbeat => {
                if let Some(rec) = self.workers.get_mut(&worker) {
                    rec.expiry = self.config.expiry_deadline(now);
                } else {
                    // Heartbeat from a worker we never registered (or already
                    // evicted): tell it to start over.
                    self.send_to_peer(&worker, BrokerToWorker::Disconnect.into_frames());
                }
            }
            WorkerToBroker::Disconnect => {
                debug!("[BROKER] Worker {:?} disconnected gracefully", worker);
                self.remove_worker(&worker, false);
            }
        }
    }

    fn worker_ready(&mut self, worker: Bytes, service: &Bytes, now: Instant) {
        if self.workers.contains_key(&worker) {
            // READY from an already-registered worker is a protocol
            // violation: evict and drop the frame.
            warn!("[BROKER] Duplicate READY from worker {:?}, evicting", worker);
            self.remove_worker(&worker, true);
            return;
        }

        let Ok(name) = std::str::from_utf8(service).map(str::to_owned) else {
            warn!(
                "[BROKER] READY from {:?} with non-UTF-8 service name, dropping",
                worker
            );
            return;
        };

        if self.config.management_enabled && name.starts_with(MANAGEMENT_PREFIX) {
            // The reserved namespace is served inside the broker; no
            // external worker may claim it.
            warn!(
                "[BROKER] Worker {:?} tried to register reserved service {}",
                worker, name
            );
            self.send_to_peer(&worker, BrokerToWorker::Disconnect.into_frames());
            return;
        }

        debug!("[BROKER] Worker {:?} ready on {}", worker, name);
        self.workers.insert(
            worker.clone(),
            WorkerRecord {
                service: name.clone(),
                expiry: self.config.expiry_deadline(now),
                busy: false,
                last_beat: now,
            },
        );
        let svc = self.services.entry(name.clone()).or_default();
        svc.registered += 1;
        svc.idle.push_back(worker);

        self.dispatch(&name, now);
    }

    /// Rewrite a worker reply into the client protocol and forward it.
    fn relay_reply(&mut self, worker: Bytes, client: Bytes, body: Vec<Bytes>, last: bool, now: Instant) {
        let Some(rec) = self.workers.get_mut(&worker) else {
            debug!("[BROKER] Reply from unknown worker {:?}", worker);
            self.send_to_peer(&worker, BrokerToWorker::Disconnect.into_frames());
            return;
        };
        rec.expiry = self.config.expiry_deadline(now);
        let service_name = rec.service.clone();
        let was_busy = rec.busy;
        if last {
            rec.busy = false;
        }

        // The originating client may be gone; the reply is then dropped.
        let service = Bytes::copy_from_slice(service_name.as_bytes());
        let msg = if last {
            BrokerToClient::Final { service, body }
        } else {
            BrokerToClient::Partial { service, body }
        };
        self.send_to_peer(&client, msg.into_frames());

        if last {
            if was_busy {
                if let Some(svc) = self.services.get_mut(&service_name) {
                    svc.idle.push_back(worker);
                }
                self.dispatch(&service_name, now);
            } else {
                // A reply from a worker we thought idle (e.g. it re-registered
                // mid-request). Forwarded above, but don't queue it twice.
                debug!("[BROKER] FINAL from idle worker {:?}", worker);
            }
        }
    }

    /// Match pending requests with idle workers until either queue drains.
    fn dispatch(&mut self, name: &str, now: Instant) {
        loop {
            // Oldest idle worker first; stale or expired entries are skipped.
            let worker_id = {
                let Some(svc) = self.services.get_mut(name) else { return };
                if svc.pending.is_empty() {
                    return;
                }
                let Some(id) = svc.idle.pop_front() else { return };
                id
            };

            let (alive, expired) = match self.workers.get(&worker_id) {
                Some(rec) if rec.busy => (false, false), // stale idle entry
                Some(rec) => (rec.expiry > now, rec.expiry <= now),
                None => (false, false), // stale idle entry
            };
            if expired {
                // Dead before the next tick could catch it; evict on the spot
                // so the request never reaches a corpse.
                self.remove_worker(&worker_id, true);
            }
            if !alive {
                continue;
            }

            let Some(svc) = self.services.get_mut(name) else { return };
            let Some(request) = svc.pending.pop_front() else {
                svc.idle.push_front(worker_id);
                return;
            };

            if let Some(rec) = self.workers.get_mut(&worker_id) {
                rec.busy = true;
            }
            debug!(
                "[BROKER] Dispatching {} request from {:?} to worker {:?}",
                name, request.client, worker_id
            );
            self.send_to_peer(
                &worker_id,
                BrokerToWorker::Request {
                    client: request.client,
                    body: request.body,
                }
                .into_frames(),
            );
        }
    }

    fn peer_gone(&mut self, identity: &Bytes) {
        self.peers.remove(identity);
        if self.workers.contains_key(identity) {
            debug!("[BROKER] Worker {:?} transport lost", identity);
            self.remove_worker(identity, false);
        }
    }

    /// Destroy a worker record and scrub it from its service's idle queue.
    ///
    /// With `disconnect`, a DISCONNECT is sent so a live-but-confused worker
    /// re-registers from scratch. A busy worker's in-flight request is lost;
    /// the client recovers via its own timeout and retry.
    fn remove_worker(&mut self, identity: &Bytes, disconnect: bool) {
        let Some(rec) = self.workers.remove(identity) else {
            return;
        };
        if let Some(svc) = self.services.get_mut(&rec.service) {
            svc.registered = svc.registered.saturating_sub(1);
            svc.idle.retain(|w| w != identity);
        }
        if rec.busy {
            warn!(
                "[BROKER] Worker {:?} lost while serving {}; request dropped, client will retry",
                identity, rec.service
            );
        }
        if disconnect {
            self.send_to_peer(identity, BrokerToWorker::Disconnect.into_frames());
        }
    }

    /// One heartbeat/expiry pass.
    ///
    /// Heartbeats go out first, then the expiry scan evicts anything whose
    /// deadline passed; dispatch never sees an expired worker after this.
    pub(crate) fn tick(&mut self, now: Instant) {
        let interval = self.config.heartbeat_interval;

        let due: Vec<Bytes> = self
            .workers
            .iter_mut()
            .filter(|(_, rec)| now.duration_since(rec.last_beat) >= interval)
            .map(|(id, rec)| {
                rec.last_beat = now;
                id.clone()
            })
            .collect();
        for id in due {
            self.send_to_peer(&id, BrokerToWorker::Heartbeat.into_frames());
        }

        let expired: Vec<Bytes> = self
            .workers
            .iter()
            .filter(|(_, rec)| rec.expiry <= now)
            .map(|(id, _)| id.clone())
            .collect();
        for id in expired {
            info!("[BROKER] Evicting expired worker {:?}", id);
            self.remove_worker(&id, true);
        }
    }

    /// Orderly shutdown: DISCONNECT every worker, then close every peer.
    pub(crate) fn shutdown(&mut self) {
        info!(
            "[BROKER] Shutting down: disconnecting {} workers",
            self.workers.len()
        );
        let ids: Vec<Bytes> = self.workers.keys().cloned().collect();
        for id in ids {
            self.send_to_peer(&id, BrokerToWorker::Disconnect.into_frames());
        }
        for tx in self.peers.values() {
            let _ = tx.send(PeerCmd::Close);
        }
    }

    fn send_to_peer(&self, identity: &Bytes, frames: Vec<Bytes>) {
        match self.peers.get(identity) {
            Some(tx) => {
                let _ = tx.send(PeerCmd::Send(frames));
            }
            None => debug!("[BROKER] No route to peer {:?}, dropping", identity),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use flume::Receiver;
    use std::time::Duration;

    pub(crate) struct TestPeer {
        pub identity: Bytes,
        pub rx: Receiver<PeerCmd>,
    }

    impl TestPeer {
        /// Pop the next outbound message sent to this peer, if any.
        pub fn next_sent(&self) -> Option<Vec<Bytes>> {
            loop {
                match self.rx.try_recv() {
                    Ok(PeerCmd::Send(frames)) => return Some(frames),
                    Ok(PeerCmd::Close) => continue,
                    Err(_) => return None,
                }
            }
        }

        pub fn drain(&self) -> Vec<Vec<Bytes>> {
            let mut out = Vec::new();
            while let Some(frames) = self.next_sent() {
                out.push(frames);
            }
            out
        }
    }

    pub(crate) fn test_config() -> FabricConfig {
        FabricConfig::default()
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_heartbeat_liveness(3)
    }

    pub(crate) fn connect_peer(state: &mut BrokerState, name: &str, now: Instant) -> TestPeer {
        let identity = Bytes::copy_from_slice(name.as_bytes());
        let (tx, rx) = flume::unbounded();
        state.handle_event(
            PeerEvent::Up {
                identity: identity.clone(),
                tx,
            },
            now,
        );
        TestPeer { identity, rx }
    }

    pub(crate) fn send_ready(state: &mut BrokerState, peer: &TestPeer, service: &str, now: Instant) {
        let frames = WorkerToBroker::Ready {
            service: Bytes::copy_from_slice(service.as_bytes()),
        }
        .into_frames();
        state.handle_event(
            PeerEvent::Message {
                identity: peer.identity.clone(),
                frames,
            },
            now,
        );
    }

    pub(crate) fn send_request(
        state: &mut BrokerState,
        peer: &TestPeer,
        service: &str,
        body: &[&[u8]],
        now: Instant,
    ) {
        let frames = ClientToBroker::Request {
            service: Bytes::copy_from_slice(service.as_bytes()),
            body: body.iter().map(|b| Bytes::copy_from_slice(b)).collect(),
        }
        .into_frames();
        state.handle_event(
            PeerEvent::Message {
                identity: peer.identity.clone(),
                frames,
            },
            now,
        );
    }

    fn send_final(state: &mut BrokerState, peer: &TestPeer, client: &Bytes, body: &[u8], now: Instant) {
        let frames = WorkerToBroker::Final {
            client: client.clone(),
            body: vec![Bytes::copy_from_slice(body)],
        }
        .into_frames();
        state.handle_event(
            PeerEvent::Message {
                identity: peer.identity.clone(),
                frames,
            },
            now,
        );
    }

    /// Every known worker is in exactly one of {idle-in-one-queue, busy}.
    fn assert_worker_invariant(state: &BrokerState) {
        for (id, rec) in &state.workers {
            let queued: usize = state
                .services
                .values()
                .map(|svc| svc.idle.iter().filter(|w| *w == id).count())
                .sum();
            if rec.busy {
                assert_eq!(queued, 0, "busy worker {:?} must not be queued", id);
            } else {
                assert_eq!(queued, 1, "idle worker {:?} must be queued exactly once", id);
            }
        }
        // No ghost entries: everything queued is a known worker.
        for svc in state.services.values() {
            for id in &svc.idle {
                assert!(state.workers.contains_key(id), "ghost idle entry {:?}", id);
            }
        }
    }

    #[test]
    fn test_ready_then_request_dispatches() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        let client = connect_peer(&mut state, "c1", now);
        send_ready(&mut state, &worker, "svc.echo", now);
        assert_worker_invariant(&state);

        send_request(&mut state, &client, "svc.echo", &[b"hello"], now);

        let sent = worker.next_sent().expect("worker got a request");
        let parsed = BrokerToWorker::parse(&sent).unwrap();
        assert_eq!(
            parsed,
            BrokerToWorker::Request {
                client: client.identity.clone(),
                body: vec![Bytes::from_static(b"hello")],
            }
        );
        assert!(state.workers[&worker.identity].busy);
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_request_queued_until_ready() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let client = connect_peer(&mut state, "c1", now);
        send_request(&mut state, &client, "svc.slow", &[b"work"], now);
        assert_eq!(state.services["svc.slow"].pending.len(), 1);

        // A worker arriving later picks the queued request up immediately.
        let worker = connect_peer(&mut state, "w1", now);
        send_ready(&mut state, &worker, "svc.slow", now);

        let sent = worker.next_sent().expect("queued request dispatched");
        assert!(matches!(
            BrokerToWorker::parse(&sent).unwrap(),
            BrokerToWorker::Request { .. }
        ));
        assert!(state.services["svc.slow"].pending.is_empty());
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_fifo_dispatch_order() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let client = connect_peer(&mut state, "c1", now);
        for i in 0..3u8 {
            send_request(&mut state, &client, "svc.q", &[&[i]], now);
        }

        let worker = connect_peer(&mut state, "w1", now);
        send_ready(&mut state, &worker, "svc.q", now);

        // Worker serves one at a time; replies release the next request.
        for expected in 0..3u8 {
            let sent = worker.next_sent().expect("request in FIFO order");
            let BrokerToWorker::Request { client: origin, body } =
                BrokerToWorker::parse(&sent).unwrap()
            else {
                panic!("expected request");
            };
            assert_eq!(body, vec![Bytes::copy_from_slice(&[expected])]);
            send_final(&mut state, &worker, &origin, b"ok", now);
        }
        assert!(state.services["svc.q"].pending.is_empty());
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_final_reply_forwarded_and_worker_requeued() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        let client = connect_peer(&mut state, "c1", now);
        send_ready(&mut state, &worker, "svc.echo", now);
        send_request(&mut state, &client, "svc.echo", &[b"ping"], now);
        worker.next_sent().expect("request");

        send_final(&mut state, &worker, &client.identity, b"pong", now);

        let reply = client.next_sent().expect("client got the reply");
        let parsed = BrokerToClient::parse(&reply).unwrap();
        assert_eq!(
            parsed,
            BrokerToClient::Final {
                service: Bytes::from_static(b"svc.echo"),
                body: vec![Bytes::from_static(b"pong")],
            }
        );
        assert!(!state.workers[&worker.identity].busy);
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_partial_keeps_worker_busy() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        let client = connect_peer(&mut state, "c1", now);
        send_ready(&mut state, &worker, "svc.stream", now);
        send_request(&mut state, &client, "svc.stream", &[b"go"], now);
        worker.next_sent().expect("request");

        let frames = WorkerToBroker::Partial {
            client: client.identity.clone(),
            body: vec![Bytes::from_static(b"chunk")],
        }
        .into_frames();
        state.handle_event(
            PeerEvent::Message {
                identity: worker.identity.clone(),
                frames,
            },
            now,
        );

        let reply = client.next_sent().expect("partial forwarded");
        assert!(!BrokerToClient::parse(&reply).unwrap().is_final());
        assert!(state.workers[&worker.identity].busy);
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_duplicate_ready_evicts() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        send_ready(&mut state, &worker, "svc.a", now);
        worker.drain();

        send_ready(&mut state, &worker, "svc.b", now);

        assert!(!state.workers.contains_key(&worker.identity));
        let sent = worker.next_sent().expect("disconnect sent");
        assert_eq!(
            BrokerToWorker::parse(&sent).unwrap(),
            BrokerToWorker::Disconnect
        );
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_reply_from_unknown_worker_disconnected() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let stranger = connect_peer(&mut state, "w9", now);
        send_final(&mut state, &stranger, &Bytes::from_static(b"c1"), b"late", now);

        let sent = stranger.next_sent().expect("disconnect sent");
        assert_eq!(
            BrokerToWorker::parse(&sent).unwrap(),
            BrokerToWorker::Disconnect
        );
    }

    #[test]
    fn test_expiry_evicts_silent_worker() {
        let config = test_config();
        let window = config.liveness_window();
        let mut state = BrokerState::new(config);
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        send_ready(&mut state, &worker, "svc.x", now);
        worker.drain();

        // Worker stays silent past liveness * interval.
        let later = now + window + Duration::from_millis(1);
        state.tick(later);

        assert!(!state.workers.contains_key(&worker.identity));
        let msgs: Vec<_> = worker
            .drain()
            .into_iter()
            .map(|f| BrokerToWorker::parse(&f).unwrap())
            .collect();
        assert!(msgs.contains(&BrokerToWorker::Disconnect));
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_heartbeat_refreshes_expiry() {
        let config = test_config();
        let window = config.liveness_window();
        let interval = config.heartbeat_interval;
        let mut state = BrokerState::new(config);
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        send_ready(&mut state, &worker, "svc.x", now);

        // Heartbeats every interval keep the worker alive past the window.
        let mut t = now;
        for _ in 0..5 {
            t += interval;
            let frames = WorkerToBroker::Heartbeat.into_frames();
            state.handle_event(
                PeerEvent::Message {
                    identity: worker.identity.clone(),
                    frames,
                },
                t,
            );
            state.tick(t);
        }
        assert!(t > now + window);
        assert!(state.workers.contains_key(&worker.identity));
    }

    #[test]
    fn test_evicted_worker_gets_no_requests_until_ready() {
        let config = test_config();
        let window = config.liveness_window();
        let mut state = BrokerState::new(config);
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        let client = connect_peer(&mut state, "c1", now);
        send_ready(&mut state, &worker, "svc.x", now);
        worker.drain();

        let later = now + window + Duration::from_millis(1);
        state.tick(later);
        worker.drain();

        // Requests after eviction queue instead of reaching the dead worker.
        send_request(&mut state, &client, "svc.x", &[b"job"], later);
        assert!(worker.next_sent().is_none());
        assert_eq!(state.services["svc.x"].pending.len(), 1);

        // Re-registration is required before new work arrives.
        send_ready(&mut state, &worker, "svc.x", later);
        assert!(worker.next_sent().is_some());
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_eviction_fairness_between_two_workers() {
        let config = test_config();
        let window = config.liveness_window();
        let mut state = BrokerState::new(config);
        let now = Instant::now();

        let w1 = connect_peer(&mut state, "w1", now);
        let w2 = connect_peer(&mut state, "w2", now);
        let client = connect_peer(&mut state, "c1", now);
        send_ready(&mut state, &w1, "svc.x", now);
        send_ready(&mut state, &w2, "svc.x", now);

        // w2 keeps heartbeating, w1 goes silent.
        let later = now + window + Duration::from_millis(1);
        state.handle_event(
            PeerEvent::Message {
                identity: w2.identity.clone(),
                frames: WorkerToBroker::Heartbeat.into_frames(),
            },
            later,
        );
        state.tick(later);
        assert!(!state.workers.contains_key(&w1.identity));
        assert!(state.workers.contains_key(&w2.identity));
        w1.drain();
        w2.drain();

        // All subsequent requests land on w2; none are lost.
        for _ in 0..3 {
            send_request(&mut state, &client, "svc.x", &[b"job"], later);
            let sent = w2.next_sent().expect("request reaches surviving worker");
            let BrokerToWorker::Request { client: origin, .. } =
                BrokerToWorker::parse(&sent).unwrap()
            else {
                panic!("expected request");
            };
            send_final(&mut state, &w2, &origin, b"done", later);
            assert!(w1.next_sent().is_none());
        }
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_dispatch_skips_worker_expired_between_ticks() {
        let config = test_config();
        let window = config.liveness_window();
        let mut state = BrokerState::new(config);
        let now = Instant::now();

        let stale = connect_peer(&mut state, "w1", now);
        let fresh = connect_peer(&mut state, "w2", now);
        let client = connect_peer(&mut state, "c1", now);
        send_ready(&mut state, &stale, "svc.x", now);

        let later = now + window + Duration::from_millis(1);
        send_ready(&mut state, &fresh, "svc.x", later);

        // No tick has run, but dispatch must not pick the expired worker.
        send_request(&mut state, &client, "svc.x", &[b"job"], later);
        assert!(stale.drain().iter().all(|f| {
            BrokerToWorker::parse(f).unwrap() != BrokerToWorker::Request {
                client: client.identity.clone(),
                body: vec![Bytes::from_static(b"job")],
            }
        }));
        assert!(fresh.next_sent().is_some());
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_worker_gone_drops_inflight_request() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        let client = connect_peer(&mut state, "c1", now);
        send_ready(&mut state, &worker, "svc.x", now);
        send_request(&mut state, &client, "svc.x", &[b"job"], now);
        worker.next_sent().expect("request");

        state.handle_event(
            PeerEvent::Gone {
                identity: worker.identity.clone(),
            },
            now,
        );

        // Record destroyed, request lost, nothing sent to the client.
        assert!(!state.workers.contains_key(&worker.identity));
        assert!(client.next_sent().is_none());
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_service_hwm_sheds_oldest() {
        let config = test_config().with_service_hwm(2);
        let mut state = BrokerState::new(config);
        let now = Instant::now();

        let client = connect_peer(&mut state, "c1", now);
        for i in 0..4u8 {
            send_request(&mut state, &client, "svc.full", &[&[i]], now);
        }

        let svc = &state.services["svc.full"];
        assert_eq!(svc.pending.len(), 2);
        // Oldest were shed; newest survive.
        assert_eq!(svc.pending[0].body, vec![Bytes::copy_from_slice(&[2u8])]);
        assert_eq!(svc.pending[1].body, vec![Bytes::copy_from_slice(&[3u8])]);
    }

    #[test]
    fn test_shutdown_disconnects_workers() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let worker = connect_peer(&mut state, "w1", now);
        send_ready(&mut state, &worker, "svc.x", now);
        worker.drain();

        state.shutdown();

        let sent = worker.rx.try_recv();
        assert!(matches!(sent, Ok(PeerCmd::Send(_))));
        if let Ok(PeerCmd::Send(frames)) = sent {
            assert_eq!(
                BrokerToWorker::parse(&frames).unwrap(),
                BrokerToWorker::Disconnect
            );
        }
        // And the transport itself is closed.
        assert!(matches!(worker.rx.try_recv(), Ok(PeerCmd::Close)));
    }

    #[test]
    fn test_protocol_mismatch_isolated_to_offender() {
        let mut state = BrokerState::new(test_config());
        let now = Instant::now();

        let good = connect_peer(&mut state, "w1", now);
        let bad = connect_peer(&mut state, "w2", now);
        send_ready(&mut state, &good, "svc.x", now);
        send_ready(&mut state, &bad, "svc.x", now);
        good.drain();
        bad.drain();

        // Wrong revision tag from a registered worker: evicted.
        state.handle_event(
            PeerEvent::Message {
                identity: bad.identity.clone(),
                frames: vec![Bytes::from_static(b"MDPW02"), Bytes::from_static(b"\x05")],
            },
            now,
        );

        assert!(!state.workers.contains_key(&bad.identity));
        let sent = bad.next_sent().expect("disconnect sent");
        assert_eq!(
            BrokerToWorker::parse(&sent).unwrap(),
            BrokerToWorker::Disconnect
        );
        // The other worker is untouched.
        assert!(state.workers.contains_key(&good.identity));
        assert!(good.next_sent().is_none());
        assert_worker_invariant(&state);
    }

    #[test]
    fn test_scripted_history_preserves_invariant() {
        // A deterministic pseudo-random history of READY / REQUEST / FINAL /
        // HEARTBEAT / silence, checking the worker-state invariant after
        // every step.
        let config = test_config();
        let interval = config.heartbeat_interval;
        let mut state = BrokerState::new(config);
        let mut now = Instant::now();

        let workers: Vec<TestPeer> = (0..4)
            .map(|i| connect_peer(&mut state, &format!("w{}", i), now))
            .collect();
        let client = connect_peer(&mut state, "c1", now);
        let mut inflight: Vec<(Bytes, Bytes)> = Vec::new(); // (worker, origin client)

        let mut seed = 0xDEAD_BEEFu64;
        let mut rand = || {
            seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (seed >> 33) as usize
        };

        for _ in 0..500 {
            let w = &workers[rand() % workers.len()];
            match rand() % 6 {
                0 => send_ready(&mut state, w, "svc.a", now),
                1 => send_ready(&mut state, w, "svc.b", now),
                2 => send_request(&mut state, &client, "svc.a", &[b"job"], now),
                3 => {
                    let frames = WorkerToBroker::Heartbeat.into_frames();
                    state.handle_event(
                        PeerEvent::Message {
                            identity: w.identity.clone(),
                            frames,
                        },
                        now,
                    );
                }
                4 => {
                    now += interval;
                    state.tick(now);
                }
                _ => {
                    if let Some((wid, origin)) = inflight.pop() {
                        let frames = WorkerToBroker::Final {
                            client: origin,
                            body: vec![Bytes::from_static(b"ok")],
                        }
                        .into_frames();
                        state.handle_event(
                            PeerEvent::Message {
                                identity: wid,
                                frames,
                            },
                            now,
                        );
                    }
                }
            }

            // Track any requests the broker just handed out.
            for w in &workers {
                while let Some(frames) = w.next_sent() {
                    if let Ok(BrokerToWorker::Request { client: origin, .. }) =
                        BrokerToWorker::parse(&frames)
                    {
                        inflight.push((w.identity.clone(), origin));
                    }
                }
            }
            assert_worker_invariant(&state);
        }
    }
}
