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

use crate::primitives::{RouterDescriptor, RouterId};

use hashbrown::HashMap;

#[cfg(feature = "std")]
use parking_lot::RwLock;
#[cfg(feature = "no_std")]
use spin::rwlock::RwLock;

use alloc::sync::Arc;

/// Logging target for the file.
const LOG_TARGET: &str = "courier::storage";

/// Router storage.
///
/// Locally queryable store of peer endpoints and keys, shared between
/// subsystems.
#[derive(Clone, Default)]
pub struct RouterStorage {
    /// Known routers.
    routers: Arc<RwLock<HashMap<RouterId, RouterDescriptor>>>,
}

impl RouterStorage {
    /// Create new `RouterStorage`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `descriptor` for `router_id`, overwriting any previous entry.
    pub fn add_router(&self, router_id: RouterId, descriptor: RouterDescriptor) {
        tracing::trace!(
            target: LOG_TARGET,
            %router_id,
            address = ?descriptor.address,
            "store router descriptor",
        );

        self.routers.write().insert(router_id, descriptor);
    }

    /// Remove router from storage.
    pub fn remove_router(&self, router_id: &RouterId) {
        self.routers.write().remove(router_id);
    }

    /// Attempt to get the descriptor of `router_id`.
    pub fn get(&self, router_id: &RouterId) -> Option<RouterDescriptor> {
        self.routers.read().get(router_id).cloned()
    }
}
