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

//! Protocol cores of the courier UDP overlay transport:
//!
//! * the four-party peer reachability test (Alice/Bob/Charlie roles over a
//!   shared UDP socket, timer-driven retransmission, structural role
//!   disambiguation)
//! * the decaying-membership IV replay filter used by the tunnel layer
//!
//! All code is generic over [`runtime::Runtime`] which provides sockets,
//! timers, randomness and metrics.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub use error::Error;

pub mod crypto;
pub mod error;
pub mod primitives;
pub mod runtime;
pub mod storage;
pub mod transport;
pub mod tunnel;

/// `Result` type used by the crate.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
#[macro_export]
macro_rules! timeout {
    ($future:expr) => {
        tokio::time::timeout(std::time::Duration::from_secs(5), $future)
    };
}
