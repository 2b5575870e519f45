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

use crate::{crypto::sha256::Sha256, runtime::Runtime};

use rand_core::RngCore;

#[cfg(feature = "std")]
use parking_lot::Mutex;
#[cfg(feature = "no_std")]
use spin::mutex::Mutex;

use alloc::{sync::Arc, vec, vec::Vec};
use core::{
    marker::PhantomData,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

/// Logging target for the file.
const LOG_TARGET: &str = "courier::tunnel::filter";

/// Number of bits per bloom filter generation.
///
/// Together with [`NUM_INDEXES`] this keeps the false positive rate around
/// 1e-4 at 50k insertions per half-life.
const NUM_BITS: usize = 1 << 20;

/// Number of bit indexes derived per key.
const NUM_INDEXES: usize = 7;

/// Bloom filter generation.
struct Bloom {
    /// Bit words.
    bits: Vec<u64>,
}

impl Bloom {
    fn new() -> Self {
        Self {
            bits: vec![0u64; NUM_BITS / 64],
        }
    }

    fn contains(&self, indexes: &[usize; NUM_INDEXES]) -> bool {
        indexes.iter().all(|index| self.bits[index / 64] & (1u64 << (index % 64)) != 0)
    }

    fn insert(&mut self, indexes: &[usize; NUM_INDEXES]) {
        for index in indexes {
            self.bits[index / 64] |= 1u64 << (index % 64);
        }
    }

    fn clear(&mut self) {
        self.bits.fill(0);
    }
}

/// Filter generations.
struct FilterState {
    /// Generation new keys are inserted into.
    current: Bloom,

    /// Previous generation, matched but no longer inserted into.
    previous: Bloom,
}

struct FilterInner {
    /// Filter generations.
    filters: Mutex<FilterState>,

    /// Per-instance seed for index derivation.
    seed: [u8; 32],

    /// Has the decay task been asked to exit.
    stopped: AtomicBool,
}

impl FilterInner {
    /// Derive the bit indexes of `key`.
    fn indexes(&self, key: &[u8; 16]) -> [usize; NUM_INDEXES] {
        let digest = Sha256::new().update(self.seed).update(key).finalize();

        let mut indexes = [0usize; NUM_INDEXES];
        for (i, index) in indexes.iter_mut().enumerate() {
            let word = u32::from_be_bytes(digest[4 * i..4 * i + 4].try_into().expect("4 bytes"));
            *index = word as usize % NUM_BITS;
        }

        indexes
    }

    /// Age the filter by one half-life.
    fn decay(&self) {
        let mut filters = self.filters.lock();
        let filters = &mut *filters;

        core::mem::swap(&mut filters.current, &mut filters.previous);
        filters.current.clear();
    }
}

/// Decaying membership filter over 16-byte keys.
///
/// Two bloom filter generations are kept; keys are inserted into the current
/// generation and matched against both. A background task swaps the
/// generations every half-life, so a key inserted at time `t` is matched
/// until at least `t + halflife` and forgotten by `t + 2 * halflife`.
///
/// Membership is approximate: false positives occur at the configured rate,
/// false negatives never occur within one half-life of insertion.
#[derive(Clone)]
pub struct DecayingFilter<R: Runtime> {
    /// Shared filter state.
    inner: Arc<FilterInner>,

    /// Marker for `R`.
    _runtime: PhantomData<R>,
}

impl<R: Runtime> DecayingFilter<R> {
    /// Create new [`DecayingFilter`] with the given half-life and start the
    /// decay task.
    pub fn new(halflife: Duration) -> Self {
        let mut seed = [0u8; 32];
        R::rng().fill_bytes(&mut seed);

        let inner = Arc::new(FilterInner {
            filters: Mutex::new(FilterState {
                current: Bloom::new(),
                previous: Bloom::new(),
            }),
            seed,
            stopped: AtomicBool::new(false),
        });

        {
            let inner = Arc::clone(&inner);

            R::spawn(async move {
                loop {
                    R::delay(halflife).await;

                    if inner.stopped.load(Ordering::Acquire) {
                        tracing::trace!(
                            target: LOG_TARGET,
                            "decay task exiting",
                        );
                        break;
                    }

                    inner.decay();
                }
            });
        }

        Self {
            inner,
            _runtime: PhantomData,
        }
    }

    /// Insert `key` into the filter.
    ///
    /// Returns `true` if the key was already present.
    pub fn add(&self, key: &[u8; 16]) -> bool {
        let indexes = self.inner.indexes(key);
        let mut filters = self.inner.filters.lock();

        let present = filters.current.contains(&indexes) || filters.previous.contains(&indexes);
        filters.current.insert(&indexes);

        present
    }

    /// Stop the background decay task.
    ///
    /// The task exits at its next tick; the filter itself remains usable but
    /// no longer forgets entries.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::Release);
    }
}
