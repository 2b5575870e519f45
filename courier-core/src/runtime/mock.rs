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

//! Tokio-backed [`Runtime`] implementation for tests.
//!
//! Instants and timers use tokio's clock so tests can run with
//! `start_paused = true` and have long protocol timeouts auto-advance.

use crate::runtime::{
    Counter, Gauge, Histogram, Instant as InstantT, MetricType, MetricsHandle,
    Runtime as RuntimeT, UdpSocket,
};

use alloc::boxed::Box;
use alloc::vec::Vec;
use parking_lot::Mutex;
use rand_core::{CryptoRng, RngCore};

use std::{
    collections::HashMap,
    future::Future,
    net::SocketAddr,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

/// Mock runtime.
#[derive(Debug, Clone, Default)]
pub struct MockRuntime {}

/// UDP socket backed by tokio.
#[derive(Clone)]
pub struct MockUdpSocket(Arc<tokio::net::UdpSocket>);

impl UdpSocket for MockUdpSocket {
    fn bind(address: SocketAddr) -> impl Future<Output = Option<Self>> + Send {
        async move {
            tokio::net::UdpSocket::bind(address)
                .await
                .ok()
                .map(|socket| Self(Arc::new(socket)))
        }
    }

    fn poll_send_to(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
        target: SocketAddr,
    ) -> Poll<Option<usize>> {
        match self.0.poll_send_to(cx, buf, target) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(nwritten)) => Poll::Ready(Some(nwritten)),
            Poll::Ready(Err(_)) => Poll::Ready(None),
        }
    }

    fn poll_recv_from(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Option<(usize, SocketAddr)>> {
        let mut buf = tokio::io::ReadBuf::new(buf);

        match self.0.poll_recv_from(cx, &mut buf) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(from)) => Poll::Ready(Some((buf.filled().len(), from))),
            Poll::Ready(Err(_)) => Poll::Ready(None),
        }
    }

    fn local_address(&self) -> Option<SocketAddr> {
        self.0.local_addr().ok()
    }
}

/// Instant backed by tokio's clock.
#[derive(Debug, Clone, Copy)]
pub struct MockInstant(tokio::time::Instant);

impl MockInstant {
    /// Move the instant `duration` into the past.
    pub fn subtract(&self, duration: Duration) -> Self {
        Self(self.0 - duration)
    }
}

impl InstantT for MockInstant {
    fn elapsed(&self) -> Duration {
        self.0.elapsed()
    }
}

#[derive(Clone)]
pub struct MockCounter {
    counters: Arc<Mutex<HashMap<&'static str, usize>>>,
    name: &'static str,
}

impl Counter for MockCounter {
    fn increment(&mut self, value: usize) {
        *self.counters.lock().entry(self.name).or_insert(0) += value;
    }
}

#[derive(Clone)]
pub struct MockGauge;

impl Gauge for MockGauge {
    fn increment(&mut self, _: usize) {}
    fn decrement(&mut self, _: usize) {}
}

#[derive(Clone)]
pub struct MockHistogram;

impl Histogram for MockHistogram {
    fn record(&mut self, _: f64) {}
}

/// Metrics handle that records counter values for assertions.
#[derive(Clone, Default)]
pub struct MockMetricsHandle {
    counters: Arc<Mutex<HashMap<&'static str, usize>>>,
}

impl MockMetricsHandle {
    /// Get the current value of counter `name`.
    pub fn counter_value(&self, name: &'static str) -> usize {
        self.counters.lock().get(name).copied().unwrap_or(0)
    }
}

impl MetricsHandle for MockMetricsHandle {
    fn counter(&self, name: &'static str) -> impl Counter {
        MockCounter {
            counters: Arc::clone(&self.counters),
            name,
        }
    }

    fn gauge(&self, _: &'static str) -> impl Gauge {
        MockGauge
    }

    fn histogram(&self, _: &'static str) -> impl Histogram {
        MockHistogram
    }
}

impl RuntimeT for MockRuntime {
    type UdpSocket = MockUdpSocket;
    type Instant = MockInstant;
    type Timer = Pin<Box<dyn Future<Output = ()> + Send>>;
    type MetricsHandle = MockMetricsHandle;

    fn spawn<F>(future: F)
    where
        F: Future + Send + 'static,
        F::Output: Send,
    {
        tokio::spawn(future);
    }

    fn now() -> Self::Instant {
        MockInstant(tokio::time::Instant::now())
    }

    fn rng() -> impl RngCore + CryptoRng {
        rand_core::OsRng
    }

    fn register_metrics(_: Vec<MetricType>, _: Option<u16>) -> Self::MetricsHandle {
        MockMetricsHandle::default()
    }

    fn timer(duration: Duration) -> Self::Timer {
        Box::pin(tokio::time::sleep(duration))
    }

    fn delay(duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}
