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

use crate::runtime::MetricType;

use alloc::{vec, vec::Vec};

pub const NUM_TESTS_STARTED: &str = "udp_peer_test_started_count";
pub const NUM_TESTS_COMPLETED: &str = "udp_peer_test_completed_count";
pub const NUM_CHARLIE_RECRUITMENTS: &str = "udp_peer_test_charlie_count";
pub const TEST_DURATIONS: &str = "udp_peer_test_durations";

/// Register peer test metrics.
pub fn register_metrics(mut metrics: Vec<MetricType>) -> Vec<MetricType> {
    // counters
    metrics.push(MetricType::Counter {
        name: NUM_TESTS_STARTED,
        description: "number of peer tests started",
    });
    metrics.push(MetricType::Counter {
        name: NUM_TESTS_COMPLETED,
        description: "number of peer tests completed",
    });
    metrics.push(MetricType::Counter {
        name: NUM_CHARLIE_RECRUITMENTS,
        description: "number of times the router was recruited as a prober",
    });

    // histograms
    metrics.push(MetricType::Histogram {
        name: TEST_DURATIONS,
        description: "peer test durations",
        buckets: vec![
            100f64, 250f64, 500f64, 1000f64, 2500f64, 5000f64, 10000f64, 30000f64,
        ],
    });

    metrics
}
