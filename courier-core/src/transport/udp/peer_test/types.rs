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

use crate::error::ChannelError;

use thingbuf::mpsc::Sender;

use core::net::SocketAddr;

/// Terminal classification of a peer test run by the local router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestStatus {
    /// Both the rendezvous peer and the prober observed the same external
    /// port, inbound traffic works.
    ReachableOk {
        /// Externally observed port.
        port: u16,
    },

    /// The prober observed a different external port than the rendezvous
    /// peer, indicating a symmetric NAT.
    ReachableDifferent {
        /// Port observed by the rendezvous peer.
        ///
        /// `None` if the rendezvous peer never reported one.
        bob_port: Option<u16>,

        /// Port observed by the prober.
        charlie_port: u16,
    },

    /// The prober made first contact but never answered the direct probe.
    CharlieDied,

    /// The rendezvous peer replied but no prober ever made contact.
    RejectUnsolicited,

    /// The rendezvous peer never replied.
    BobUnresponsive,
}

/// Events emitted by `PeerTestManager`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerTestManagerEvent {
    /// A locally initiated peer test reached a terminal state.
    TestCompleted {
        /// Terminal classification.
        status: TestStatus,
    },
}

/// Peer test commands.
///
/// Sent to `PeerTestManager` through [`PeerTestHandle`].
#[derive(Debug, Default, Clone)]
pub enum PeerTestCommand {
    /// Start a peer test against the given rendezvous peer.
    StartTest {
        /// UDP endpoint of the rendezvous peer.
        address: SocketAddr,

        /// Intro key of the rendezvous peer.
        intro_key: [u8; 32],
    },

    #[default]
    Dummy,
}

/// Peer test handle.
///
/// Given to other subsystems, allowing them to ask `PeerTestManager` to run
/// a reachability test.
#[derive(Clone)]
pub struct PeerTestHandle {
    /// TX channel for sending commands to `PeerTestManager`.
    tx: Sender<PeerTestCommand>,
}

impl PeerTestHandle {
    /// Create new `PeerTestHandle` from `tx`.
    pub(super) fn new(tx: Sender<PeerTestCommand>) -> Self {
        Self { tx }
    }

    /// Ask `PeerTestManager` to run a test against the rendezvous peer at
    /// `address`.
    ///
    /// The request is dropped by the manager if a test is already in flight.
    pub fn start_test(
        &self,
        address: SocketAddr,
        intro_key: [u8; 32],
    ) -> Result<(), ChannelError> {
        self.tx
            .try_send(PeerTestCommand::StartTest { address, intro_key })
            .map_err(From::from)
    }
}
