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

use crate::transport::udp::peer_test::TestStatus;

use futures::Stream;

use alloc::collections::VecDeque;
use core::{
    pin::Pin,
    task::{Context, Poll},
};

/// Logging target for the file.
const LOG_TARGET: &str = "courier::udp::peer-test::detector";

/// How many consecutive unsolicited-rejection outcomes are treated as
/// evidence of a firewall.
///
/// A single occurrence only proves that one rendezvous peer refused or
/// failed to recruit a prober.
const MAX_CONSECUTIVE_UNSOLICITED: usize = 2;

/// Reachability of the local router for inbound UDP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReachabilityStatus {
    /// No conclusive test result yet.
    Unknown,

    /// Inbound traffic from previously unknown peers works.
    Reachable,

    /// Reachable but behind a symmetric NAT, the external port differs per
    /// destination.
    SymmetricNat,

    /// Probes from previously unknown peers do not get through.
    Firewalled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorEvent {
    /// Externally observed port of the router has been discovered or has
    /// changed.
    ExternalPortDiscovered {
        /// Externally observed port.
        port: u16,
    },

    /// Reachability status has changed.
    ReachabilityStatusChanged {
        /// New reachability status.
        status: ReachabilityStatus,
    },
}

/// Reachability detector.
///
/// Consumes terminal peer test statuses and tracks the router's inbound
/// reachability and externally observed port.
pub struct Detector {
    /// Consecutive tests that ended without any prober contact.
    consecutive_unsolicited: usize,

    /// Externally observed port.
    ///
    /// `None` until the first conclusive test.
    external_port: Option<u16>,

    /// Pending events.
    pending_events: VecDeque<DetectorEvent>,

    /// Current reachability status.
    reachability: ReachabilityStatus,
}

impl Default for Detector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detector {
    /// Create new `Detector`.
    pub fn new() -> Self {
        Self {
            consecutive_unsolicited: 0,
            external_port: None,
            pending_events: VecDeque::new(),
            reachability: ReachabilityStatus::Unknown,
        }
    }

    /// Get the router's externally observed port.
    pub fn external_port(&self) -> Option<u16> {
        self.external_port
    }

    /// Get the router's reachability status.
    pub fn reachability(&self) -> ReachabilityStatus {
        self.reachability
    }

    /// Register a terminal peer test status.
    pub fn register_test_result(&mut self, status: &TestStatus) {
        tracing::debug!(
            target: LOG_TARGET,
            ?status,
            reachability = ?self.reachability,
            "handle peer test result",
        );

        match status {
            TestStatus::ReachableOk { port } => {
                self.consecutive_unsolicited = 0;
                self.register_port(*port);
                self.set_reachability(ReachabilityStatus::Reachable);
            }
            TestStatus::ReachableDifferent { .. } => {
                // the external port varies per destination, no single port
                // can be advertised
                self.consecutive_unsolicited = 0;
                self.set_reachability(ReachabilityStatus::SymmetricNat);
            }
            TestStatus::CharlieDied => {
                // the prober made first contact, so inbound traffic got
                // through at least once; inconclusive beyond that
                self.consecutive_unsolicited = 0;
            }
            TestStatus::RejectUnsolicited => {
                self.consecutive_unsolicited += 1;

                if self.consecutive_unsolicited >= MAX_CONSECUTIVE_UNSOLICITED {
                    self.set_reachability(ReachabilityStatus::Firewalled);
                }
            }
            TestStatus::BobUnresponsive => {
                // rendezvous peer is down or ignoring us, says nothing about
                // the local router
            }
        }
    }

    fn register_port(&mut self, port: u16) {
        if self.external_port != Some(port) {
            tracing::info!(
                target: LOG_TARGET,
                ?port,
                "discovered external port",
            );
            self.pending_events.push_back(DetectorEvent::ExternalPortDiscovered { port });
        }

        self.external_port = Some(port);
    }

    fn set_reachability(&mut self, status: ReachabilityStatus) {
        if self.reachability != status {
            self.pending_events.push_back(DetectorEvent::ReachabilityStatusChanged { status });
        }

        self.reachability = status;
    }
}

impl Stream for Detector {
    type Item = DetectorEvent;

    fn poll_next(mut self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.pending_events
            .pop_front()
            .map_or(Poll::Pending, |event| Poll::Ready(Some(event)))
    }
}
