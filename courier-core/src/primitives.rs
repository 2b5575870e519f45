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

use alloc::sync::Arc;
use core::{fmt, net::SocketAddr};

/// Router ID.
///
/// Truncated hash of the router's identity, cheap to clone.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RouterId(Arc<[u8; 32]>);

impl From<[u8; 32]> for RouterId {
    fn from(hash: [u8; 32]) -> Self {
        Self(Arc::new(hash))
    }
}

impl RouterId {
    /// Create random `RouterId`.
    #[cfg(test)]
    pub fn random() -> Self {
        Self::from(rand::random::<[u8; 32]>())
    }
}

impl fmt::Display for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().take(4).try_for_each(|byte| write!(f, "{byte:02x}"))
    }
}

impl fmt::Debug for RouterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RouterId({self})")
    }
}

/// Transport capabilities advertised in a router's descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Router participates in peer tests when recruited.
    peer_testing: bool,
}

impl Capabilities {
    /// Parse `Capabilities` from an advertised capability string.
    pub fn parse(caps: &str) -> Self {
        Self {
            peer_testing: caps.contains('B'),
        }
    }

    /// Does the router participate in peer tests.
    pub fn supports_peer_testing(&self) -> bool {
        self.peer_testing
    }
}

/// Router descriptor.
///
/// Locally stored addressing information of a remote router, see
/// [`RouterStorage`](crate::storage::RouterStorage).
#[derive(Debug, Clone)]
pub struct RouterDescriptor {
    /// Advertised UDP endpoint.
    pub address: SocketAddr,

    /// Intro key, used to encrypt unsolicited datagrams sent to the router.
    pub intro_key: [u8; 32],

    /// Advertised capabilities.
    pub capabilities: Capabilities,
}
