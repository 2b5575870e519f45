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

use nom::{
    error::{ErrorKind, ParseError},
    Err,
};
use thingbuf::mpsc::errors::TrySendError;

use alloc::string::String;
use core::fmt;

/// General error.
#[derive(Debug, PartialEq, Eq)]
pub enum Error {
    /// Malformed datagram or payload.
    Malformed,

    /// AEAD encryption/decryption failure.
    Crypto,

    /// Channel error.
    Channel(ChannelError),

    /// Custom error.
    Custom(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed => write!(f, "malformed datagram"),
            Self::Crypto => write!(f, "aead failure"),
            Self::Channel(error) => write!(f, "channel error: {error}"),
            Self::Custom(error) => write!(f, "{error}"),
        }
    }
}

impl From<ChannelError> for Error {
    fn from(error: ChannelError) -> Self {
        Self::Channel(error)
    }
}

/// Channel error.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum ChannelError {
    /// Channel is full.
    Full,

    /// Channel is closed.
    Closed,
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "channel full"),
            Self::Closed => write!(f, "channel closed"),
        }
    }
}

impl<T> From<TrySendError<T>> for ChannelError {
    fn from(error: TrySendError<T>) -> Self {
        match error {
            TrySendError::Full(_) => Self::Full,
            _ => Self::Closed,
        }
    }
}

/// Peer test error.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PeerTestError {
    /// A test is already in flight.
    Busy,
}

impl fmt::Display for PeerTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "test already in flight"),
        }
    }
}

/// Parse error for the peer test payload.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum TestPayloadParseError {
    /// Invalid bitstream.
    InvalidBitstream,

    /// Invalid IP address size, must be 0, 4 or 16.
    InvalidIpSize(u8),
}

impl ParseError<&[u8]> for TestPayloadParseError {
    fn from_error_kind(_: &[u8], _: ErrorKind) -> Self {
        Self::InvalidBitstream
    }

    fn append(_: &[u8], _: ErrorKind, _: Self) -> Self {
        Self::InvalidBitstream
    }
}

impl From<Err<TestPayloadParseError>> for TestPayloadParseError {
    fn from(value: Err<TestPayloadParseError>) -> Self {
        match value {
            Err::Incomplete(_) => Self::InvalidBitstream,
            Err::Error(error) | Err::Failure(error) => error,
        }
    }
}

impl From<TestPayloadParseError> for Error {
    fn from(_: TestPayloadParseError) -> Self {
        Self::Malformed
    }
}
