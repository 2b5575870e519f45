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

//! Runtime abstraction.
//!
//! All protocol code is generic over [`Runtime`] which provides the ambient
//! facilities (UDP sockets, timers, clock, randomness, metrics, task
//! spawning) without tying the crate to one executor.

use rand_core::{CryptoRng, RngCore};

use alloc::vec::Vec;
use core::{
    fmt,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

#[cfg(test)]
pub mod mock;

/// UDP socket.
pub trait UdpSocket: Send + Unpin + Sized + 'static {
    /// Bind socket to `address`.
    fn bind(address: SocketAddr) -> impl Future<Output = Option<Self>> + Send;

    /// Attempt to send `buf` to `target`.
    ///
    /// Returns `Poll::Ready(None)` if the socket has failed.
    fn poll_send_to(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<Option<usize>>;

    /// Attempt to receive a datagram into `buf`.
    ///
    /// Returns `Poll::Ready(None)` if the socket has failed.
    fn poll_recv_from(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Option<(usize, SocketAddr)>>;

    /// Get local address of the socket.
    fn local_address(&self) -> Option<SocketAddr>;

    /// Send `buf` to `target`.
    fn send_to<'a>(
        &'a mut self,
        buf: &'a [u8],
        target: SocketAddr,
    ) -> impl Future<Output = Option<usize>> + Send + 'a {
        futures::future::poll_fn(move |cx| Pin::new(&mut *self).poll_send_to(cx, buf, target))
    }

    /// Receive a datagram into `buf`.
    fn recv_from<'a>(
        &'a mut self,
        buf: &'a mut [u8],
    ) -> impl Future<Output = Option<(usize, SocketAddr)>> + Send + 'a {
        futures::future::poll_fn(move |cx| Pin::new(&mut *self).poll_recv_from(cx, &mut *buf))
    }
}

/// Monotonic instant.
pub trait Instant: fmt::Debug + Copy + Clone + Send + Sync + Unpin + 'static {
    /// Time elapsed since the instant was captured.
    fn elapsed(&self) -> Duration;
}

/// Counter.
pub trait Counter: Send + Sync + Unpin {
    /// Increment counter by `value`.
    fn increment(&mut self, value: usize);
}

/// Gauge.
pub trait Gauge: Send + Sync + Unpin {
    /// Increment gauge by `value`.
    fn increment(&mut self, value: usize);

    /// Decrement gauge by `value`.
    fn decrement(&mut self, value: usize);
}

/// Histogram.
pub trait Histogram: Send + Sync + Unpin {
    /// Record `value` into the histogram.
    fn record(&mut self, value: f64);
}

/// Metrics handle.
pub trait MetricsHandle: Clone + Send + Sync + Unpin + 'static {
    /// Get counter called `name`.
    fn counter(&self, name: &'static str) -> impl Counter;

    /// Get gauge called `name`.
    fn gauge(&self, name: &'static str) -> impl Gauge;

    /// Get histogram called `name`.
    fn histogram(&self, name: &'static str) -> impl Histogram;
}

/// Metric kind, used during metric registration.
#[derive(Debug, Clone)]
pub enum MetricType {
    /// Counter.
    Counter {
        /// Metric name.
        name: &'static str,

        /// Metric description.
        description: &'static str,
    },

    /// Gauge.
    Gauge {
        /// Metric name.
        name: &'static str,

        /// Metric description.
        description: &'static str,
    },

    /// Histogram.
    Histogram {
        /// Metric name.
        name: &'static str,

        /// Metric description.
        description: &'static str,

        /// Histogram buckets.
        buckets: Vec<f64>,
    },
}

/// Runtime.
pub trait Runtime: Clone + Send + Unpin + 'static {
    /// UDP socket type.
    type UdpSocket: UdpSocket;

    /// Monotonic instant type.
    type Instant: Instant;

    /// Single-shot timer type.
    type Timer: Future<Output = ()> + Send + Unpin;

    /// Metrics handle type.
    type MetricsHandle: MetricsHandle;

    /// Spawn `future` as a detached task.
    fn spawn<F>(future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send;

    /// Capture the current instant.
    fn now() -> Self::Instant;

    /// Get a cryptographically secure random number generator.
    fn rng() -> impl RngCore + CryptoRng;

    /// Register `metrics` and return a handle for updating them.
    fn register_metrics(metrics: Vec<MetricType>, port: Option<u16>) -> Self::MetricsHandle;

    /// Create a single-shot timer that fires after `duration`.
    fn timer(duration: Duration) -> Self::Timer;

    /// Sleep for `duration`.
    fn delay(duration: Duration) -> impl Future<Output = ()> + Send;
}
