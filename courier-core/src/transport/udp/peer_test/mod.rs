// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS
// OR IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

//! Peer reachability test.
//!
//! The local router can play any of the three roles of the test:
//!
//! * the initiator (Alice), discovering its externally observed address and
//!   whether unsolicited inbound UDP works
//! * the rendezvous peer (Bob), recruiting a prober on behalf of an
//!   initiator
//! * the prober (Charlie), contacting the initiator directly from an
//!   address the initiator has never talked to
//!
//! Roles are disambiguated purely structurally: a message whose embedded
//! endpoint is absent or matches the sender comes from an initiator, a
//! message whose embedded endpoint differs from the sender is a recruitment
//! from a rendezvous peer, and the prober ring decides between the
//! rendezvous and prober roles for initiator messages.

use crate::{
    error::PeerTestError,
    primitives::RouterId,
    runtime::{Counter, Histogram, Instant, MetricType, MetricsHandle, Runtime, UdpSocket},
    storage::RouterStorage,
    transport::udp::{
        canonicalize,
        message::{TestMessage, TestMessageBuilder, TestPayload},
        metrics::*,
    },
};

use bytes::BytesMut;
use futures::{FutureExt, Stream};
use hashbrown::HashMap;
use rand_core::RngCore;
use thingbuf::mpsc::{channel, Receiver, Sender};

use alloc::{collections::VecDeque, vec, vec::Vec};
use core::{
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

pub mod detector;
pub mod types;

pub use types::{PeerTestCommand, PeerTestHandle, PeerTestManagerEvent, TestStatus};

/// Logging target for the file.
const LOG_TARGET: &str = "courier::udp::peer-test";

/// Interval between retransmissions of an in-flight test.
const RESEND_INTERVAL: Duration = Duration::from_secs(5);

/// Deadline after which an in-flight test is classified with whatever has
/// been observed.
const MAX_TEST_DURATION: Duration = Duration::from_secs(30);

/// How long a prober slot is remembered.
const MAX_CHARLIE_LIFETIME: Duration = Duration::from_secs(10);

/// Size of the prober nonce ring.
const CHARLIE_RING_SIZE: usize = 64;

/// Maximum datagram size.
const DATAGRAM_MAX_SIZE: usize = 1500;

/// Command channel size.
const COMMAND_CHANNEL_SIZE: usize = 16;

/// Contact state of the prober during a locally initiated test.
struct CharlieReply<R: Runtime> {
    /// Endpoint the first reply came from.
    address: SocketAddr,

    /// When the first reply was received.
    received: R::Instant,

    /// Externally observed port carried by the second reply.
    ///
    /// Never set before `received`.
    second_port: Option<u16>,
}

/// State of the locally initiated, in-flight test.
///
/// Dropped as a whole on completion so all fields reset atomically.
struct ActiveTest<R: Runtime> {
    /// Endpoint of the rendezvous peer.
    bob_address: SocketAddr,

    /// Intro key of the rendezvous peer.
    bob_intro_key: [u8; 32],

    /// Externally observed port reported by the rendezvous peer, with
    /// receive time.
    ///
    /// Set once, on the first reply.
    bob_reply: Option<(R::Instant, u16)>,

    /// Intro key of the prober.
    ///
    /// Learned from the rendezvous peer's reply, or from the prober's first
    /// reply if that arrives earlier.
    charlie_intro_key: Option<[u8; 32]>,

    /// Contact state of the prober.
    charlie_reply: Option<CharlieReply<R>>,

    /// When a test datagram was last transmitted.
    last_send: R::Instant,

    /// Test nonce.
    nonce: u32,

    /// Retransmit timer.
    retransmit_timer: R::Timer,

    /// When the test was started.
    started: R::Instant,
}

/// Scheduled eviction of a prober slot.
struct CharlieEviction<R: Runtime> {
    /// Nonce the slot held when the eviction was scheduled.
    nonce: u32,

    /// Ring slot.
    slot: usize,

    /// Eviction timer.
    timer: R::Timer,
}

/// Session-established router eligible to act as a prober.
#[derive(Clone)]
struct PeerTestCandidate {
    /// Session endpoint of the router.
    address: SocketAddr,

    /// Session key.
    session_key: [u8; 32],
}

/// Established session.
struct SessionContext {
    /// Router ID.
    router_id: RouterId,

    /// Session key.
    session_key: [u8; 32],
}

/// Peer test manager.
///
/// Plays all three test roles over one UDP socket and emits
/// [`PeerTestManagerEvent`]s for completed local tests. The manager is owned
/// and polled by a single task; inbound datagrams and all deferred events
/// (retransmit ticks, prober slot evictions) are processed inside
/// [`Stream::poll_next`], which serializes access to the test state.
pub struct PeerTestManager<R: Runtime> {
    /// State of the locally initiated test, if any.
    active_test: Option<ActiveTest<R>>,

    /// Session-established routers that advertise test participation.
    candidates: HashMap<RouterId, PeerTestCandidate>,

    /// Ring of nonces for which this router acts as the prober.
    charlie_ring: [Option<u32>; CHARLIE_RING_SIZE],

    /// Next ring slot to write to.
    charlie_ring_index: usize,

    /// RX channel for receiving commands from handles.
    cmd_rx: Receiver<PeerTestCommand>,

    /// TX channel given out through [`PeerTestManager::handle()`].
    cmd_tx: Sender<PeerTestCommand>,

    /// Local intro key.
    intro_key: [u8; 32],

    /// Metrics handle.
    metrics_handle: R::MetricsHandle,

    /// Scheduled prober slot evictions.
    pending_evictions: Vec<CharlieEviction<R>>,

    /// Events waiting to be emitted.
    pending_events: VecDeque<PeerTestManagerEvent>,

    /// Datagram read buffer.
    read_buffer: Vec<u8>,

    /// Established sessions, indexed by the remote endpoint.
    sessions: HashMap<SocketAddr, SessionContext>,

    /// UDP socket.
    socket: R::UdpSocket,

    /// Router storage.
    storage: RouterStorage,

    /// Pending outbound datagrams.
    write_buffer: VecDeque<(BytesMut, SocketAddr)>,
}

impl<R: Runtime> PeerTestManager<R> {
    /// Create new [`PeerTestManager`].
    pub fn new(
        intro_key: [u8; 32],
        socket: R::UdpSocket,
        storage: RouterStorage,
        metrics_handle: R::MetricsHandle,
    ) -> Self {
        let (cmd_tx, cmd_rx) = channel(COMMAND_CHANNEL_SIZE);

        Self {
            active_test: None,
            candidates: HashMap::new(),
            charlie_ring: [None; CHARLIE_RING_SIZE],
            charlie_ring_index: 0,
            cmd_rx,
            cmd_tx,
            intro_key,
            metrics_handle,
            pending_evictions: Vec::new(),
            pending_events: VecDeque::new(),
            read_buffer: vec![0u8; DATAGRAM_MAX_SIZE],
            sessions: HashMap::new(),
            socket,
            storage,
            write_buffer: VecDeque::new(),
        }
    }

    /// Get handle to [`PeerTestManager`].
    pub fn handle(&self) -> PeerTestHandle {
        PeerTestHandle::new(self.cmd_tx.clone())
    }

    /// Collect peer test metric counters and histograms.
    pub fn metrics(metrics: Vec<MetricType>) -> Vec<MetricType> {
        register_metrics(metrics)
    }

    /// Register a session-established router.
    ///
    /// If the router's stored descriptor advertises test participation, the
    /// router also becomes eligible for selection as a prober.
    pub fn add_session(&mut self, router_id: &RouterId, address: SocketAddr, session_key: [u8; 32]) {
        let address = canonicalize(address);

        self.sessions.insert(
            address,
            SessionContext {
                router_id: router_id.clone(),
                session_key,
            },
        );

        let Some(descriptor) = self.storage.get(router_id) else {
            tracing::debug!(
                target: LOG_TARGET,
                %router_id,
                "cannot add prober candidate, router not found in storage",
            );
            return;
        };

        if !descriptor.capabilities.supports_peer_testing() {
            tracing::trace!(
                target: LOG_TARGET,
                %router_id,
                "router doesn't advertise test participation, ignoring",
            );
            return;
        }

        tracing::trace!(
            target: LOG_TARGET,
            %router_id,
            ?address,
            "add new prober candidate",
        );

        self.candidates.insert(
            router_id.clone(),
            PeerTestCandidate {
                address,
                session_key,
            },
        );
    }

    /// Remove a terminated session.
    pub fn remove_session(&mut self, router_id: &RouterId) {
        self.candidates.remove(router_id);
        self.sessions.retain(|_, context| &context.router_id != router_id);
    }

    /// Start a reachability test against the rendezvous peer at `address`.
    ///
    /// Fails with [`PeerTestError::Busy`], without side effects, if a test is
    /// already in flight.
    pub fn run_test(
        &mut self,
        address: SocketAddr,
        intro_key: [u8; 32],
    ) -> Result<(), PeerTestError> {
        if self.active_test.is_some() {
            return Err(PeerTestError::Busy);
        }

        let address = canonicalize(address);
        let nonce = R::rng().next_u32();
        let now = R::now();

        tracing::debug!(
            target: LOG_TARGET,
            ?address,
            ?nonce,
            "start peer test",
        );

        let pkt = TestMessageBuilder::new(nonce)
            .with_intro_key(self.intro_key)
            .with_envelope_key(intro_key)
            .build::<R>();
        self.write_buffer.push_back((pkt, address));

        self.active_test = Some(ActiveTest {
            bob_address: address,
            bob_intro_key: intro_key,
            bob_reply: None,
            charlie_intro_key: None,
            charlie_reply: None,
            last_send: now,
            nonce,
            retransmit_timer: R::timer(RESEND_INTERVAL),
            started: now,
        });
        self.metrics_handle.counter(NUM_TESTS_STARTED).increment(1);

        Ok(())
    }

    /// Handle a decrypted test payload received from `from`.
    pub fn receive_test(&mut self, from: SocketAddr, payload: TestPayload) {
        let from = canonicalize(from);

        // replies to the test we initiated are correlated by nonce before
        // any role is considered
        if self.active_test.as_ref().is_some_and(|test| test.nonce == payload.nonce) {
            return self.on_test_reply(from, payload);
        }

        let endpoint = payload
            .address
            .map(|address| canonicalize(SocketAddr::new(address, payload.port)));

        match endpoint {
            None => self.on_test_from_alice(from, payload),
            Some(endpoint) if endpoint == from => self.on_test_from_alice(from, payload),
            Some(_) => self.on_recruited_as_charlie(from, payload),
        }
    }

    /// Handle a reply carrying the nonce of the locally initiated test.
    fn on_test_reply(&mut self, from: SocketAddr, payload: TestPayload) {
        let intro_key = self.intro_key;
        let Some(test) = &mut self.active_test else {
            return;
        };

        if from.ip() == test.bob_address.ip() {
            match test.bob_reply {
                None => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        nonce = ?test.nonce,
                        port = ?payload.port,
                        "rendezvous peer reported our external port",
                    );

                    test.bob_reply = Some((R::now(), payload.port));
                    test.charlie_intro_key.get_or_insert(payload.intro_key);
                }
                Some(_) => tracing::trace!(
                    target: LOG_TARGET,
                    nonce = ?test.nonce,
                    "duplicate reply from rendezvous peer, ignoring",
                ),
            }

            return;
        }

        let mut probe = None;
        let mut completed = false;

        match &mut test.charlie_reply {
            reply @ None => {
                tracing::debug!(
                    target: LOG_TARGET,
                    nonce = ?payload.nonce,
                    ?from,
                    "first contact from prober",
                );

                *reply = Some(CharlieReply {
                    address: from,
                    received: R::now(),
                    second_port: None,
                });
                let charlie_intro_key = *test.charlie_intro_key.get_or_insert(payload.intro_key);

                // solicit the second reply with a direct probe
                probe = Some((
                    TestMessageBuilder::new(payload.nonce)
                        .with_intro_key(intro_key)
                        .with_envelope_key(charlie_intro_key)
                        .build::<R>(),
                    from,
                ));
            }
            Some(reply) => match reply.second_port {
                None => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        nonce = ?payload.nonce,
                        port = ?payload.port,
                        first_contact = ?reply.received.elapsed(),
                        "prober reported our external port",
                    );

                    reply.second_port = Some(payload.port);
                    completed = true;
                }
                Some(_) => tracing::trace!(
                    target: LOG_TARGET,
                    nonce = ?payload.nonce,
                    "duplicate reply from prober, ignoring",
                ),
            },
        }

        if let Some((pkt, target)) = probe {
            self.write_buffer.push_back((pkt, target));
        }
        if completed {
            self.complete();
        }
    }

    /// Handle a test message sent by an initiator.
    fn on_test_from_alice(&mut self, from: SocketAddr, payload: TestPayload) {
        match self.charlie_ring_contains(payload.nonce) {
            true => self.on_direct_test_from_alice(from, payload),
            false => self.on_test_from_alice_as_bob(from, payload),
        }
    }

    /// The local router is the rendezvous peer: reply to the initiator with
    /// a prober's intro key and hand the initiator's contact information to
    /// the prober over the established session.
    fn on_test_from_alice_as_bob(&mut self, from: SocketAddr, payload: TestPayload) {
        tracing::trace!(
            target: LOG_TARGET,
            ?from,
            nonce = ?payload.nonce,
            "test request from initiator, acting as rendezvous",
        );

        let Some((charlie_router_id, candidate)) = self.select_charlie(from) else {
            tracing::debug!(
                target: LOG_TARGET,
                ?from,
                nonce = ?payload.nonce,
                "no test-capable router available, dropping test request",
            );
            return;
        };

        let Some(descriptor) = self.storage.get(&charlie_router_id) else {
            tracing::warn!(
                target: LOG_TARGET,
                %charlie_router_id,
                nonce = ?payload.nonce,
                "descriptor for prober not found, dropping test request",
            );
            return;
        };

        // tell the initiator how to address the prober directly
        let pkt = TestMessageBuilder::new(payload.nonce)
            .with_address(from)
            .with_intro_key(descriptor.intro_key)
            .with_envelope_key(payload.intro_key)
            .build::<R>();
        self.write_buffer.push_back((pkt, from));

        // recruit the prober with the initiator's observed address and key
        let pkt = TestMessageBuilder::new(payload.nonce)
            .with_address(from)
            .with_intro_key(payload.intro_key)
            .with_envelope_key(candidate.session_key)
            .build::<R>();
        self.write_buffer.push_back((pkt, candidate.address));
    }

    /// A rendezvous peer recruited the local router as the prober: remember
    /// the nonce and contact the initiator directly.
    fn on_recruited_as_charlie(&mut self, from: SocketAddr, payload: TestPayload) {
        let alice_address = match payload.address {
            Some(address) if payload.port > 0 =>
                canonicalize(SocketAddr::new(address, payload.port)),
            _ => {
                tracing::warn!(
                    target: LOG_TARGET,
                    ?from,
                    nonce = ?payload.nonce,
                    "invalid initiator address in recruitment, dropping",
                );
                return;
            }
        };

        tracing::trace!(
            target: LOG_TARGET,
            ?from,
            ?alice_address,
            nonce = ?payload.nonce,
            "recruited as prober",
        );

        let slot = self.charlie_ring_index;
        self.charlie_ring[slot] = Some(payload.nonce);
        self.charlie_ring_index = (slot + 1) % CHARLIE_RING_SIZE;
        self.pending_evictions.push(CharlieEviction {
            nonce: payload.nonce,
            slot,
            timer: R::timer(MAX_CHARLIE_LIFETIME),
        });
        self.metrics_handle.counter(NUM_CHARLIE_RECRUITMENTS).increment(1);

        let pkt = TestMessageBuilder::new(payload.nonce)
            .with_address(alice_address)
            .with_intro_key(self.intro_key)
            .with_envelope_key(payload.intro_key)
            .build::<R>();
        self.write_buffer.push_back((pkt, alice_address));
    }

    /// The initiator contacted the local router directly for a remembered
    /// nonce: reply with its observed address.
    fn on_direct_test_from_alice(&mut self, from: SocketAddr, payload: TestPayload) {
        tracing::trace!(
            target: LOG_TARGET,
            ?from,
            nonce = ?payload.nonce,
            "direct probe from initiator",
        );

        let pkt = TestMessageBuilder::new(payload.nonce)
            .with_address(from)
            .with_intro_key(self.intro_key)
            .with_envelope_key(payload.intro_key)
            .build::<R>();
        self.write_buffer.push_back((pkt, from));
    }

    /// Is `nonce` remembered in the prober ring.
    fn charlie_ring_contains(&self, nonce: u32) -> bool {
        // slots are overwritten in ring order and thus unordered, the ring
        // must be scanned linearly
        self.charlie_ring.iter().any(|slot| slot == &Some(nonce))
    }

    /// Attempt to select a prober for a test requested by `alice`.
    ///
    /// Selection starts at a random offset and skips routers that share the
    /// initiator's IP address.
    fn select_charlie(&self, alice: SocketAddr) -> Option<(RouterId, PeerTestCandidate)> {
        if self.candidates.is_empty() {
            return None;
        }

        let start = (R::rng().next_u32() as usize) % self.candidates.len();

        self.candidates
            .iter()
            .skip(start)
            .find(|(_, candidate)| candidate.address.ip() != alice.ip())
            .or_else(|| {
                self.candidates
                    .iter()
                    .find(|(_, candidate)| candidate.address.ip() != alice.ip())
            })
            .map(|(router_id, candidate)| (router_id.clone(), candidate.clone()))
    }

    /// Handle an inbound datagram.
    ///
    /// Unsolicited test messages are sealed with the local intro key;
    /// in-session recruitment messages with the sender's session key.
    /// Anything else is dropped.
    fn on_datagram(&mut self, from: SocketAddr, datagram: &[u8]) {
        let from = canonicalize(from);

        let payload = match TestMessage::decrypt(&self.intro_key, datagram) {
            Ok(payload) => payload,
            Err(_) => match self.sessions.get(&from) {
                Some(SessionContext { session_key, .. }) =>
                    match TestMessage::decrypt(session_key, datagram) {
                        Ok(payload) => payload,
                        Err(error) => {
                            tracing::debug!(
                                target: LOG_TARGET,
                                ?from,
                                ?error,
                                "failed to decrypt test datagram, ignoring",
                            );
                            return;
                        }
                    },
                None => {
                    tracing::debug!(
                        target: LOG_TARGET,
                        ?from,
                        "unrecognized test datagram, ignoring",
                    );
                    return;
                }
            },
        };

        self.receive_test(from, payload);
    }

    /// Handle an expired retransmit timer.
    ///
    /// Classifies the test if the deadline has passed, otherwise
    /// retransmits according to test progress and re-arms the timer.
    fn on_retransmit_tick(&mut self, cx: &mut Context<'_>) {
        let expired = match &self.active_test {
            None => return,
            Some(test) => test.started.elapsed() > MAX_TEST_DURATION,
        };

        if expired {
            return self.complete();
        }

        let intro_key = self.intro_key;
        let Some(test) = &mut self.active_test else {
            return;
        };

        let context = match (&test.bob_reply, &test.charlie_reply) {
            // no reply from the rendezvous peer yet, or the prober has not
            // made contact: keep prodding the rendezvous peer so it pokes
            // the prober again
            (None, _) | (_, None) => Some((
                TestMessageBuilder::new(test.nonce)
                    .with_intro_key(intro_key)
                    .with_envelope_key(test.bob_intro_key)
                    .build::<R>(),
                test.bob_address,
            )),
            // the prober made contact but has not sent its second reply,
            // solicit it directly
            (_, Some(reply)) => match test.charlie_intro_key {
                Some(charlie_intro_key) => Some((
                    TestMessageBuilder::new(test.nonce)
                        .with_intro_key(intro_key)
                        .with_envelope_key(charlie_intro_key)
                        .build::<R>(),
                    reply.address,
                )),
                None => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        nonce = ?test.nonce,
                        "no intro key for prober, skipping direct probe",
                    );
                    None
                }
            },
        };

        tracing::trace!(
            target: LOG_TARGET,
            nonce = ?test.nonce,
            since_last_send = ?test.last_send.elapsed(),
            "retransmit test datagram",
        );

        test.last_send = R::now();
        test.retransmit_timer = R::timer(RESEND_INTERVAL);
        let _ = test.retransmit_timer.poll_unpin(cx);

        if let Some((pkt, target)) = context {
            self.write_buffer.push_back((pkt, target));
        }
    }

    /// Classify the test from whatever has been observed, emit the verdict
    /// and reset the initiator state.
    fn complete(&mut self) {
        let Some(test) = self.active_test.take() else {
            return;
        };

        let status = match (test.bob_reply, test.charlie_reply) {
            (
                bob_reply,
                Some(CharlieReply {
                    second_port: Some(charlie_port),
                    ..
                }),
            ) => match bob_reply {
                Some((_, bob_port)) if bob_port == charlie_port =>
                    TestStatus::ReachableOk { port: charlie_port },
                _ => TestStatus::ReachableDifferent {
                    bob_port: bob_reply.map(|(_, port)| port),
                    charlie_port,
                },
            },
            (
                _,
                Some(CharlieReply {
                    second_port: None, ..
                }),
            ) => TestStatus::CharlieDied,
            (Some(_), None) => TestStatus::RejectUnsolicited,
            (None, None) => TestStatus::BobUnresponsive,
        };

        tracing::info!(
            target: LOG_TARGET,
            nonce = ?test.nonce,
            ?status,
            duration = ?test.started.elapsed(),
            "peer test completed",
        );

        self.metrics_handle.counter(NUM_TESTS_COMPLETED).increment(1);
        self.metrics_handle
            .histogram(TEST_DURATIONS)
            .record(test.started.elapsed().as_millis() as f64);
        self.pending_events.push_back(PeerTestManagerEvent::TestCompleted { status });
    }
}

impl<R: Runtime> Stream for PeerTestManager<R> {
    type Item = PeerTestManagerEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = Pin::into_inner(self);

        loop {
            match this.cmd_rx.poll_recv(cx) {
                Poll::Pending => break,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(PeerTestCommand::StartTest { address, intro_key })) => {
                    if let Err(error) = this.run_test(address, intro_key) {
                        tracing::debug!(
                            target: LOG_TARGET,
                            ?address,
                            ?error,
                            "failed to start peer test",
                        );
                    }
                }
                Poll::Ready(Some(PeerTestCommand::Dummy)) => unreachable!(),
            }
        }

        loop {
            match Pin::new(&mut this.socket).poll_recv_from(cx, &mut this.read_buffer) {
                Poll::Pending => break,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some((nread, from))) => {
                    let datagram = this.read_buffer[..nread].to_vec();
                    this.on_datagram(from, &datagram);
                }
            }
        }

        let tick = match &mut this.active_test {
            Some(test) => test.retransmit_timer.poll_unpin(cx).is_ready(),
            None => false,
        };
        if tick {
            this.on_retransmit_tick(cx);
        }

        {
            let Self {
                charlie_ring,
                pending_evictions,
                ..
            } = this;

            pending_evictions.retain_mut(|eviction| match eviction.timer.poll_unpin(cx) {
                Poll::Pending => true,
                Poll::Ready(()) => {
                    // clear the slot only if it has not been reused by a
                    // newer recruitment
                    if charlie_ring[eviction.slot] == Some(eviction.nonce) {
                        charlie_ring[eviction.slot] = None;

                        tracing::trace!(
                            target: LOG_TARGET,
                            nonce = ?eviction.nonce,
                            slot = ?eviction.slot,
                            "prober slot expired",
                        );
                    }

                    false
                }
            });
        }

        while let Some((pkt, target)) = this.write_buffer.pop_front() {
            match Pin::new(&mut this.socket).poll_send_to(cx, &pkt, target) {
                Poll::Pending => {
                    this.write_buffer.push_front((pkt, target));
                    break;
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Ready(Some(_)) => {}
            }
        }

        match this.pending_events.pop_front() {
            Some(event) => Poll::Ready(Some(event)),
            None => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        primitives::{Capabilities, RouterDescriptor},
        runtime::mock::{MockMetricsHandle, MockRuntime},
        timeout,
    };
    use futures::StreamExt;
    use std::{net::SocketAddr, time::Duration, vec, vec::Vec};

    /// Intro key of the manager under test.
    const LOCAL_INTRO_KEY: [u8; 32] = [0xff; 32];

    /// Intro key of the rendezvous peer.
    const BOB_INTRO_KEY: [u8; 32] = [0xbb; 32];

    /// Intro key of the prober.
    const CHARLIE_INTRO_KEY: [u8; 32] = [0xdd; 32];

    /// Intro key of the remote initiator.
    const ALICE_INTRO_KEY: [u8; 32] = [0xee; 32];

    /// Session key between the manager and a session-established peer.
    const SESSION_KEY: [u8; 32] = [0xcc; 32];

    async fn make_manager() -> (
        PeerTestManager<MockRuntime>,
        SocketAddr,
        RouterStorage,
        MockMetricsHandle,
    ) {
        let socket = <MockRuntime as Runtime>::UdpSocket::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let address = socket.local_address().unwrap();
        let storage = RouterStorage::new();
        let metrics_handle = MockMetricsHandle::default();

        (
            PeerTestManager::new(LOCAL_INTRO_KEY, socket, storage.clone(), metrics_handle.clone()),
            address,
            storage,
            metrics_handle,
        )
    }

    async fn bind(address: &str) -> (<MockRuntime as Runtime>::UdpSocket, SocketAddr) {
        let socket = <MockRuntime as Runtime>::UdpSocket::bind(address.parse().unwrap())
            .await
            .unwrap();
        let address = socket.local_address().unwrap();

        (socket, address)
    }

    /// Receive and decrypt a test message from `$socket` while driving
    /// `$manager`, panicking if the manager emits an event first.
    macro_rules! recv_test_message {
        ($manager:expr, $socket:expr, $key:expr) => {{
            let mut buf = vec![0u8; 1500];
            loop {
                tokio::select! {
                    result = $socket.recv_from(&mut buf) => {
                        let (nread, from) = result.unwrap();
                        break (TestMessage::decrypt(&$key, &buf[..nread]).unwrap(), from);
                    }
                    event = $manager.next() => panic!("unexpected event: {event:?}"),
                    _ = tokio::time::sleep(Duration::from_secs(60)) => panic!("timed out"),
                }
            }
        }};
    }

    /// Drive `$manager` for `$duration`, panicking if it emits an event.
    macro_rules! drive {
        ($manager:expr, $duration:expr) => {
            tokio::select! {
                event = $manager.next() => panic!("unexpected event: {event:?}"),
                _ = tokio::time::sleep($duration) => {}
            }
        };
    }

    #[tokio::test]
    async fn full_cone_nat_reachable() {
        let (mut bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut charlie_socket, _charlie_address) = bind("127.0.0.3:0").await;
        let (mut manager, alice_address, _storage, metrics) = make_manager().await;

        manager.run_test(bob_address, BOB_INTRO_KEY).unwrap();

        // the rendezvous peer receives the test request
        let (request, from) = recv_test_message!(manager, bob_socket, BOB_INTRO_KEY);
        assert_eq!(request.address, None);
        assert_eq!(request.port, 0);
        assert_eq!(request.intro_key, LOCAL_INTRO_KEY);
        assert_eq!(from, alice_address);
        let nonce = request.nonce;

        // the rendezvous peer reports the observed port and carries the
        // prober's intro key
        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40001))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        bob_socket.send_to(&pkt, alice_address).await.unwrap();

        // the prober makes first contact
        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40001))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        charlie_socket.send_to(&pkt, alice_address).await.unwrap();

        // the prober receives the direct probe
        let (probe, _) = recv_test_message!(manager, charlie_socket, CHARLIE_INTRO_KEY);
        assert_eq!(probe.nonce, nonce);
        assert_eq!(probe.address, None);
        assert_eq!(probe.intro_key, LOCAL_INTRO_KEY);

        // the prober reports the same port as the rendezvous peer
        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40001))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        charlie_socket.send_to(&pkt, alice_address).await.unwrap();

        let event = timeout!(manager.next()).await.unwrap().unwrap();
        assert_eq!(
            event,
            PeerTestManagerEvent::TestCompleted {
                status: TestStatus::ReachableOk { port: 40001 },
            }
        );

        // all state is reset, a new test can be started
        assert!(manager.active_test.is_none());
        assert!(manager.run_test(bob_address, BOB_INTRO_KEY).is_ok());

        assert_eq!(metrics.counter_value(NUM_TESTS_STARTED), 2);
        assert_eq!(metrics.counter_value(NUM_TESTS_COMPLETED), 1);
    }

    #[tokio::test]
    async fn symmetric_nat_detected() {
        let (mut bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut charlie_socket, _charlie_address) = bind("127.0.0.3:0").await;
        let (mut manager, alice_address, _storage, _metrics) = make_manager().await;

        manager.run_test(bob_address, BOB_INTRO_KEY).unwrap();

        let (request, _) = recv_test_message!(manager, bob_socket, BOB_INTRO_KEY);
        let nonce = request.nonce;

        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40001))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        bob_socket.send_to(&pkt, alice_address).await.unwrap();

        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40777))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        charlie_socket.send_to(&pkt, alice_address).await.unwrap();

        let (_, _) = recv_test_message!(manager, charlie_socket, CHARLIE_INTRO_KEY);

        // the prober observed a different port than the rendezvous peer
        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40777))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        charlie_socket.send_to(&pkt, alice_address).await.unwrap();

        let event = timeout!(manager.next()).await.unwrap().unwrap();
        assert_eq!(
            event,
            PeerTestManagerEvent::TestCompleted {
                status: TestStatus::ReachableDifferent {
                    bob_port: Some(40001),
                    charlie_port: 40777,
                },
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn prober_dies_after_first_contact() {
        let (mut bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut charlie_socket, _) = bind("127.0.0.3:0").await;
        let (mut manager, alice_address, _storage, _metrics) = make_manager().await;

        manager.run_test(bob_address, BOB_INTRO_KEY).unwrap();

        let (request, _) = recv_test_message!(manager, bob_socket, BOB_INTRO_KEY);
        let nonce = request.nonce;

        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40001))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        bob_socket.send_to(&pkt, alice_address).await.unwrap();

        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40001))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        charlie_socket.send_to(&pkt, alice_address).await.unwrap();

        // the prober never answers the direct probes, drain them until the
        // test deadline classifies the outcome
        let mut buf = vec![0u8; 1500];
        let event = loop {
            tokio::select! {
                event = manager.next() => break event.unwrap(),
                result = charlie_socket.recv_from(&mut buf) => { result.unwrap(); }
            }
        };

        assert_eq!(
            event,
            PeerTestManagerEvent::TestCompleted {
                status: TestStatus::CharlieDied,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rendezvous_never_recruits() {
        let (mut bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut manager, alice_address, _storage, _metrics) = make_manager().await;

        manager.run_test(bob_address, BOB_INTRO_KEY).unwrap();

        let (request, _) = recv_test_message!(manager, bob_socket, BOB_INTRO_KEY);

        // the rendezvous peer replies but no prober ever makes contact
        let pkt = TestMessageBuilder::new(request.nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40001))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        bob_socket.send_to(&pkt, alice_address).await.unwrap();

        // the request is retransmitted to the rendezvous peer so it pokes
        // the prober again
        let mut resends = 0usize;
        let mut buf = vec![0u8; 1500];
        let event = loop {
            tokio::select! {
                event = manager.next() => break event.unwrap(),
                result = bob_socket.recv_from(&mut buf) => {
                    result.unwrap();
                    resends += 1;
                }
            }
        };

        assert_eq!(
            event,
            PeerTestManagerEvent::TestCompleted {
                status: TestStatus::RejectUnsolicited,
            }
        );
        assert!(resends >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rendezvous_unresponsive() {
        let (mut bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut manager, _alice_address, _storage, _metrics) = make_manager().await;

        manager.run_test(bob_address, BOB_INTRO_KEY).unwrap();

        let mut requests = 0usize;
        let mut buf = vec![0u8; 1500];
        let event = loop {
            tokio::select! {
                event = manager.next() => break event.unwrap(),
                result = bob_socket.recv_from(&mut buf) => {
                    result.unwrap();
                    requests += 1;
                }
            }
        };

        assert_eq!(
            event,
            PeerTestManagerEvent::TestCompleted {
                status: TestStatus::BobUnresponsive,
            }
        );
        assert!(requests >= 2);
    }

    #[tokio::test]
    async fn prober_contact_before_rendezvous_reply() {
        let (_bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut charlie_socket, _) = bind("127.0.0.3:0").await;
        let (mut manager, alice_address, _storage, _metrics) = make_manager().await;

        manager.run_test(bob_address, BOB_INTRO_KEY).unwrap();
        let nonce = manager.active_test.as_ref().unwrap().nonce;

        // the prober makes contact before the rendezvous peer replies; its
        // intro key is learned from the reply itself
        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40777))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        charlie_socket.send_to(&pkt, alice_address).await.unwrap();

        let (probe, _) = recv_test_message!(manager, charlie_socket, CHARLIE_INTRO_KEY);
        assert_eq!(probe.nonce, nonce);

        let pkt = TestMessageBuilder::new(nonce)
            .with_address(SocketAddr::new(alice_address.ip(), 40777))
            .with_intro_key(CHARLIE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        charlie_socket.send_to(&pkt, alice_address).await.unwrap();

        let event = timeout!(manager.next()).await.unwrap().unwrap();
        assert_eq!(
            event,
            PeerTestManagerEvent::TestCompleted {
                status: TestStatus::ReachableDifferent {
                    bob_port: None,
                    charlie_port: 40777,
                },
            }
        );
    }

    #[tokio::test]
    async fn second_test_rejected_while_busy() {
        let (mut manager, _, _, _) = make_manager().await;

        manager.run_test("127.0.0.2:8888".parse().unwrap(), BOB_INTRO_KEY).unwrap();
        let nonce = manager.active_test.as_ref().unwrap().nonce;

        assert_eq!(
            manager.run_test("127.0.0.3:8888".parse().unwrap(), CHARLIE_INTRO_KEY),
            Err(PeerTestError::Busy),
        );

        // the in-flight test is untouched
        let test = manager.active_test.as_ref().unwrap();
        assert_eq!(test.nonce, nonce);
        assert_eq!(test.bob_address, "127.0.0.2:8888".parse().unwrap());
    }

    #[tokio::test]
    async fn test_started_via_handle() {
        let (mut bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut manager, _, _, _) = make_manager().await;

        let handle = manager.handle();
        handle.start_test(bob_address, BOB_INTRO_KEY).unwrap();

        let (request, _) = recv_test_message!(manager, bob_socket, BOB_INTRO_KEY);
        assert_eq!(request.intro_key, LOCAL_INTRO_KEY);
        assert!(manager.active_test.is_some());
    }

    #[tokio::test]
    async fn duplicate_rendezvous_reply_ignored() {
        let (mut manager, _, _, _) = make_manager().await;

        manager.run_test("127.0.0.2:8888".parse().unwrap(), BOB_INTRO_KEY).unwrap();
        let nonce = manager.active_test.as_ref().unwrap().nonce;

        manager.receive_test(
            "127.0.0.2:8888".parse().unwrap(),
            TestPayload {
                address: None,
                port: 40001,
                intro_key: CHARLIE_INTRO_KEY,
                nonce,
            },
        );
        manager.receive_test(
            "127.0.0.2:8888".parse().unwrap(),
            TestPayload {
                address: None,
                port: 41000,
                intro_key: CHARLIE_INTRO_KEY,
                nonce,
            },
        );

        // the port from the first reply is kept
        let (_, port) = manager.active_test.as_ref().unwrap().bob_reply.unwrap();
        assert_eq!(port, 40001);
    }

    #[tokio::test(start_paused = true)]
    async fn recruited_as_prober() {
        let (mut alice_socket, alice_address) = bind("127.0.0.1:0").await;
        let (mut bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut manager, manager_address, _storage, metrics) = make_manager().await;

        let bob_router_id = RouterId::random();
        manager.add_session(&bob_router_id, bob_address, SESSION_KEY);

        // a rendezvous peer recruits the local router for a remote
        // initiator's test
        let pkt = TestMessageBuilder::new(1337)
            .with_address(alice_address)
            .with_intro_key(ALICE_INTRO_KEY)
            .with_envelope_key(SESSION_KEY)
            .build::<MockRuntime>();
        bob_socket.send_to(&pkt, manager_address).await.unwrap();

        // the initiator receives the first prober reply
        let (payload, from) = recv_test_message!(manager, alice_socket, ALICE_INTRO_KEY);
        assert_eq!(payload.nonce, 1337);
        assert_eq!(payload.intro_key, LOCAL_INTRO_KEY);
        assert_eq!(payload.address, Some(alice_address.ip()));
        assert_eq!(payload.port, alice_address.port());
        assert_eq!(from, manager_address);
        assert!(manager.charlie_ring_contains(1337));

        // the initiator probes the local router directly
        let pkt = TestMessageBuilder::new(1337)
            .with_intro_key(ALICE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        alice_socket.send_to(&pkt, manager_address).await.unwrap();

        let (payload, _) = recv_test_message!(manager, alice_socket, ALICE_INTRO_KEY);
        assert_eq!(payload.nonce, 1337);
        assert_eq!(payload.address, Some(alice_address.ip()));

        // the slot expires once the prober lifetime has passed
        drive!(manager, Duration::from_secs(11));
        assert!(!manager.charlie_ring_contains(1337));
        assert!(manager.pending_evictions.is_empty());
        assert_eq!(metrics.counter_value(NUM_CHARLIE_RECRUITMENTS), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn eviction_spares_reused_slot() {
        let (mut manager, _, _, _) = make_manager().await;

        manager.charlie_ring[0] = Some(1337);
        manager.pending_evictions.push(CharlieEviction {
            nonce: 1337,
            slot: 0,
            timer: MockRuntime::timer(MAX_CHARLIE_LIFETIME),
        });
        manager.charlie_ring[1] = Some(1338);
        manager.pending_evictions.push(CharlieEviction {
            nonce: 1338,
            slot: 1,
            timer: MockRuntime::timer(MAX_CHARLIE_LIFETIME),
        });

        // slot 0 is reused by a newer nonce before its eviction fires
        manager.charlie_ring[0] = Some(9999);

        drive!(manager, Duration::from_secs(11));

        assert_eq!(manager.charlie_ring[0], Some(9999));
        assert_eq!(manager.charlie_ring[1], None);
        assert!(manager.pending_evictions.is_empty());
    }

    #[tokio::test]
    async fn prober_ring_wraps_around() {
        let (mut manager, _, _, _) = make_manager().await;
        let from: SocketAddr = "127.0.0.2:9999".parse().unwrap();

        for nonce in 0..(CHARLIE_RING_SIZE as u32 + 1) {
            manager.on_recruited_as_charlie(
                from,
                TestPayload {
                    address: Some("127.0.0.5".parse().unwrap()),
                    port: 1234,
                    intro_key: ALICE_INTRO_KEY,
                    nonce,
                },
            );
        }

        // the oldest nonce was overwritten by the wraparound
        assert!(!manager.charlie_ring_contains(0));
        assert!((1..=CHARLIE_RING_SIZE as u32).all(|nonce| manager.charlie_ring_contains(nonce)));
        assert_eq!(manager.charlie_ring_index, 1);
    }

    #[tokio::test]
    async fn rendezvous_recruits_prober() {
        let (mut alice_socket, alice_address) = bind("127.0.0.1:0").await;
        let (mut charlie_socket, charlie_address) = bind("127.0.0.3:0").await;
        let (mut manager, manager_address, storage, _metrics) = make_manager().await;

        let charlie_router_id = RouterId::random();
        storage.add_router(
            charlie_router_id.clone(),
            RouterDescriptor {
                address: charlie_address,
                intro_key: CHARLIE_INTRO_KEY,
                capabilities: Capabilities::parse("B"),
            },
        );
        manager.add_session(&charlie_router_id, charlie_address, SESSION_KEY);

        // a remote initiator asks the local router to run a test
        let pkt = TestMessageBuilder::new(777)
            .with_intro_key(ALICE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        alice_socket.send_to(&pkt, manager_address).await.unwrap();

        // the initiator learns the prober's intro key and observed address
        let (payload, _) = recv_test_message!(manager, alice_socket, ALICE_INTRO_KEY);
        assert_eq!(payload.nonce, 777);
        assert_eq!(payload.intro_key, CHARLIE_INTRO_KEY);
        assert_eq!(payload.address, Some(alice_address.ip()));
        assert_eq!(payload.port, alice_address.port());

        // the prober receives the initiator's contact information in-session
        let (payload, _) = recv_test_message!(manager, charlie_socket, SESSION_KEY);
        assert_eq!(payload.nonce, 777);
        assert_eq!(payload.intro_key, ALICE_INTRO_KEY);
        assert_eq!(payload.address, Some(alice_address.ip()));
        assert_eq!(payload.port, alice_address.port());
    }

    #[tokio::test]
    async fn no_prober_available() {
        let (mut alice_socket, _) = bind("127.0.0.1:0").await;
        let (mut manager, manager_address, _storage, _metrics) = make_manager().await;

        let pkt = TestMessageBuilder::new(777)
            .with_intro_key(ALICE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        alice_socket.send_to(&pkt, manager_address).await.unwrap();

        // the request is dropped without a reply
        drive!(manager, Duration::from_millis(250));

        let mut buf = vec![0u8; 1500];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), alice_socket.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn prober_descriptor_missing() {
        let (mut alice_socket, _) = bind("127.0.0.1:0").await;
        let (_charlie_socket, charlie_address) = bind("127.0.0.3:0").await;
        let (mut manager, manager_address, storage, _metrics) = make_manager().await;

        let charlie_router_id = RouterId::random();
        storage.add_router(
            charlie_router_id.clone(),
            RouterDescriptor {
                address: charlie_address,
                intro_key: CHARLIE_INTRO_KEY,
                capabilities: Capabilities::parse("B"),
            },
        );
        manager.add_session(&charlie_router_id, charlie_address, SESSION_KEY);

        // the descriptor disappears before the test request arrives
        storage.remove_router(&charlie_router_id);

        let pkt = TestMessageBuilder::new(777)
            .with_intro_key(ALICE_INTRO_KEY)
            .with_envelope_key(LOCAL_INTRO_KEY)
            .build::<MockRuntime>();
        alice_socket.send_to(&pkt, manager_address).await.unwrap();

        drive!(manager, Duration::from_millis(250));

        let mut buf = vec![0u8; 1500];
        assert!(
            tokio::time::timeout(Duration::from_millis(100), alice_socket.recv_from(&mut buf))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn session_without_test_capability_not_a_candidate() {
        let (_charlie_socket, charlie_address) = bind("127.0.0.3:0").await;
        let (mut manager, _, storage, _) = make_manager().await;

        let router_id = RouterId::random();
        storage.add_router(
            router_id.clone(),
            RouterDescriptor {
                address: charlie_address,
                intro_key: CHARLIE_INTRO_KEY,
                capabilities: Capabilities::parse("C"),
            },
        );
        manager.add_session(&router_id, charlie_address, SESSION_KEY);

        assert!(!manager.candidates.contains_key(&router_id));
        assert_eq!(manager.sessions.len(), 1);

        manager.remove_session(&router_id);
        assert!(manager.sessions.is_empty());
    }

    #[tokio::test]
    async fn unknown_router_session_not_a_candidate() {
        let (mut manager, _, _, _) = make_manager().await;

        let router_id = RouterId::random();
        manager.add_session(&router_id, "127.0.0.3:8888".parse().unwrap(), SESSION_KEY);

        assert!(!manager.candidates.contains_key(&router_id));
        assert_eq!(manager.sessions.len(), 1);
    }

    #[tokio::test]
    async fn recruitment_with_zero_port_dropped() {
        let (mut bob_socket, bob_address) = bind("127.0.0.2:0").await;
        let (mut manager, manager_address, _storage, _metrics) = make_manager().await;

        let bob_router_id = RouterId::random();
        manager.add_session(&bob_router_id, bob_address, SESSION_KEY);

        // recruitment that claims an address but a zero port
        let pkt = TestMessageBuilder::new(1337)
            .with_address("9.9.9.9:0".parse().unwrap())
            .with_intro_key(ALICE_INTRO_KEY)
            .with_envelope_key(SESSION_KEY)
            .build::<MockRuntime>();
        bob_socket.send_to(&pkt, manager_address).await.unwrap();

        drive!(manager, Duration::from_millis(250));

        assert!(manager.charlie_ring.iter().all(Option::is_none));
        assert!(manager.pending_evictions.is_empty());
    }

    #[tokio::test]
    async fn unrecognized_datagram_ignored() {
        let (mut alice_socket, _) = bind("127.0.0.1:0").await;
        let (mut manager, manager_address, _storage, _metrics) = make_manager().await;

        alice_socket.send_to(b"not a test message", manager_address).await.unwrap();

        // the datagram is dropped and the manager keeps running
        drive!(manager, Duration::from_millis(250));
        assert!(manager.run_test("127.0.0.2:8888".parse().unwrap(), BOB_INTRO_KEY).is_ok());
    }

    #[tokio::test]
    async fn prober_selection_skips_initiator_ip() {
        let (_charlie_socket, charlie_address) = bind("127.0.0.1:0").await;
        let (mut manager, _, storage, _) = make_manager().await;

        let router_id = RouterId::random();
        storage.add_router(
            router_id.clone(),
            RouterDescriptor {
                address: charlie_address,
                intro_key: CHARLIE_INTRO_KEY,
                capabilities: Capabilities::parse("B"),
            },
        );
        manager.add_session(&router_id, charlie_address, SESSION_KEY);

        // the only candidate shares the initiator's ip
        assert!(manager.select_charlie("127.0.0.1:9999".parse().unwrap()).is_none());
        assert!(manager.select_charlie("127.0.0.9:9999".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn ring_lookup_is_exact() {
        let (mut manager, _, _, _) = make_manager().await;

        manager.charlie_ring[17] = Some(0xdead_beef);

        assert!(manager.charlie_ring_contains(0xdead_beef));
        assert!(!manager.charlie_ring_contains(0xdead_bee0));
        assert!(!manager.charlie_ring_contains(0));
    }

    #[tokio::test]
    async fn mapped_ipv6_reply_correlates_with_ipv4_rendezvous() {
        let (mut manager, _, _, _) = make_manager().await;

        manager.run_test("127.0.0.2:8888".parse().unwrap(), BOB_INTRO_KEY).unwrap();
        let nonce = manager.active_test.as_ref().unwrap().nonce;

        // reply arrives with an ipv4-mapped ipv6 source address
        manager.receive_test(
            "[::ffff:127.0.0.2]:8888".parse().unwrap(),
            TestPayload {
                address: None,
                port: 40001,
                intro_key: CHARLIE_INTRO_KEY,
                nonce,
            },
        );

        let (_, port) = manager.active_test.as_ref().unwrap().bob_reply.unwrap();
        assert_eq!(port, 40001);
    }

    #[tokio::test]
    async fn metrics_registration() {
        let metrics = PeerTestManager::<MockRuntime>::metrics(Vec::new());
        assert!(!metrics.is_empty());
    }
}
