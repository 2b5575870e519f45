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

use crate::{
    runtime::{Counter, MetricType, MetricsHandle, Runtime},
    tunnel::{
        filter::DecayingFilter,
        metrics::{register_metrics, NUM_DUPLICATE_IVS, NUM_IVS},
        IV_FILTER_HALFLIFE,
    },
};

use alloc::vec::Vec;
use core::time::Duration;

/// Logging target for the file.
const LOG_TARGET: &str = "courier::tunnel::iv-filter";

/// IV validator.
///
/// Validates the IVs of all inbound tunnel messages against one decaying
/// filter. Safe to share between tunnel tasks.
pub struct IvValidator<R: Runtime> {
    /// Decaying membership filter.
    filter: DecayingFilter<R>,

    /// Metrics handle.
    metrics_handle: R::MetricsHandle,
}

impl<R: Runtime> IvValidator<R> {
    /// Create new [`IvValidator`] with the default half-life.
    pub fn new(metrics_handle: R::MetricsHandle) -> Self {
        Self::with_halflife(metrics_handle, IV_FILTER_HALFLIFE)
    }

    /// Create new [`IvValidator`] with a custom half-life.
    pub fn with_halflife(metrics_handle: R::MetricsHandle, halflife: Duration) -> Self {
        Self {
            filter: DecayingFilter::new(halflife),
            metrics_handle,
        }
    }

    /// Collect replay protection metric counters.
    pub fn metrics(metrics: Vec<MetricType>) -> Vec<MetricType> {
        register_metrics(metrics)
    }

    /// Validate the IV of an inbound tunnel message.
    ///
    /// Returns `true` if the IV was accepted and `false` if it was seen
    /// within the replay window and the message must be dropped.
    pub fn receive_iv(&self, iv: &[u8; 16]) -> bool {
        self.metrics_handle.counter(NUM_IVS).increment(1);

        match self.filter.add(iv) {
            true => {
                tracing::debug!(
                    target: LOG_TARGET,
                    "duplicate iv received",
                );
                self.metrics_handle.counter(NUM_DUPLICATE_IVS).increment(1);

                false
            }
            false => true,
        }
    }

    /// Release the validator's background decay resources.
    pub fn destroy(&self) {
        self.filter.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::mock::{MockMetricsHandle, MockRuntime};

    #[tokio::test]
    async fn duplicate_iv_rejected_and_counted() {
        let metrics_handle = MockMetricsHandle::default();
        let validator = IvValidator::<MockRuntime>::new(metrics_handle.clone());

        let iv: [u8; 16] = core::array::from_fn(|i| i as u8 + 1);

        assert!(validator.receive_iv(&iv));
        assert!(!validator.receive_iv(&iv));

        assert_eq!(metrics_handle.counter_value(NUM_IVS), 2);
        assert_eq!(metrics_handle.counter_value(NUM_DUPLICATE_IVS), 1);
    }

    #[tokio::test]
    async fn distinct_ivs_accepted() {
        let metrics_handle = MockMetricsHandle::default();
        let validator = IvValidator::<MockRuntime>::new(metrics_handle.clone());

        for byte in 0u8..16 {
            assert!(validator.receive_iv(&[byte; 16]));
        }

        assert_eq!(metrics_handle.counter_value(NUM_DUPLICATE_IVS), 0);
    }

    #[tokio::test]
    async fn iv_accepted_again_after_decay() {
        let validator = IvValidator::<MockRuntime>::with_halflife(
            MockMetricsHandle::default(),
            Duration::from_millis(300),
        );

        assert!(validator.receive_iv(&[0x01; 16]));
        assert!(!validator.receive_iv(&[0x01; 16]));

        // quiescent for over two half-lives
        tokio::time::sleep(Duration::from_millis(750)).await;

        assert!(validator.receive_iv(&[0x01; 16]));

        validator.destroy();
    }

    #[tokio::test]
    async fn metrics_registration() {
        let metrics = IvValidator::<MockRuntime>::metrics(Vec::new());
        assert_eq!(metrics.len(), 2);
    }
}
