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

//! Peer test message codec.
//!
//! All four test message shapes share one payload:
//!
//! ```text
//! ip_size (1) || ip (0/4/16) || port (2) || intro key (32) || nonce (4)
//! ```
//!
//! The payload travels inside an encrypted envelope: an 8-byte random nonce
//! followed by the ChaCha20-Poly1305 ciphertext of the payload, keyed by the
//! recipient's intro key (or the session key for in-session delivery) with
//! the nonce prefix as associated data. The shapes differ only in which
//! address is embedded, whose intro key is carried and which key seals the
//! envelope.

use crate::{
    crypto::chachapoly::ChaChaPoly,
    error::TestPayloadParseError,
    runtime::Runtime,
    Error,
};

use bytes::{BufMut, BytesMut};
use nom::{
    bytes::complete::take,
    number::complete::{be_u16, be_u32, be_u8},
    Err, IResult,
};
use rand_core::RngCore;

use core::net::{IpAddr, SocketAddr};

/// Intro key length.
const INTRO_KEY_LEN: usize = 32;

/// Envelope nonce prefix length.
const ENVELOPE_NONCE_LEN: usize = 8;

/// Poly1305 tag length.
const ENVELOPE_TAG_LEN: usize = 16;

/// Parsed peer test payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestPayload {
    /// Peer's externally observed IP address, absent when the sender does not
    /// claim one.
    pub address: Option<IpAddr>,

    /// Peer's externally observed port, zero when unknown.
    pub port: u16,

    /// Third-party intro key carried by the message.
    pub intro_key: [u8; 32],

    /// Test nonce.
    pub nonce: u32,
}

impl TestPayload {
    fn parse_frame(input: &[u8]) -> IResult<&[u8], TestPayload, TestPayloadParseError> {
        let (rest, ip_size) = be_u8(input)?;
        let (rest, address) = match ip_size {
            0 => (rest, None),
            4 => {
                let (rest, bytes) = take(4usize)(rest)?;
                let octets: [u8; 4] = bytes.try_into().expect("4 bytes");
                (rest, Some(IpAddr::from(octets)))
            }
            16 => {
                let (rest, bytes) = take(16usize)(rest)?;
                let octets: [u8; 16] = bytes.try_into().expect("16 bytes");
                (rest, Some(IpAddr::from(octets)))
            }
            size => return Err(Err::Error(TestPayloadParseError::InvalidIpSize(size))),
        };
        let (rest, port) = be_u16(rest)?;
        let (rest, intro_key) = take(INTRO_KEY_LEN)(rest)?;
        let (rest, nonce) = be_u32(rest)?;

        Ok((
            rest,
            TestPayload {
                address,
                port,
                intro_key: intro_key.try_into().expect("32 bytes"),
                nonce,
            },
        ))
    }

    /// Parse [`TestPayload`] from `input`, ignoring trailing bytes.
    pub fn parse(input: &[u8]) -> Result<Self, TestPayloadParseError> {
        Self::parse_frame(input).map(|(_, payload)| payload).map_err(From::from)
    }

    /// Serialize [`TestPayload`].
    pub fn serialize(&self) -> BytesMut {
        let mut out = BytesMut::with_capacity(1 + 16 + 2 + INTRO_KEY_LEN + 4);

        match self.address {
            None => out.put_u8(0),
            Some(IpAddr::V4(address)) => {
                out.put_u8(4);
                out.put_slice(&address.octets());
            }
            Some(IpAddr::V6(address)) => {
                out.put_u8(16);
                out.put_slice(&address.octets());
            }
        }
        out.put_u16(self.port);
        out.put_slice(&self.intro_key);
        out.put_u32(self.nonce);

        out
    }
}

/// Builder for encrypted peer test messages.
pub struct TestMessageBuilder {
    /// Externally observed address embedded in the payload.
    address: Option<SocketAddr>,

    /// Envelope encryption key.
    envelope_key: Option<[u8; 32]>,

    /// Third-party intro key carried in the payload.
    intro_key: Option<[u8; 32]>,

    /// Test nonce.
    nonce: u32,
}

impl TestMessageBuilder {
    /// Create new [`TestMessageBuilder`] for a test identified by `nonce`.
    pub fn new(nonce: u32) -> Self {
        Self {
            address: None,
            envelope_key: None,
            intro_key: None,
            nonce,
        }
    }

    /// Embed the recipient's externally observed address.
    pub fn with_address(mut self, address: SocketAddr) -> Self {
        self.address = Some(address);
        self
    }

    /// Carry `intro_key` in the payload.
    pub fn with_intro_key(mut self, intro_key: [u8; 32]) -> Self {
        self.intro_key = Some(intro_key);
        self
    }

    /// Seal the envelope with `key`.
    pub fn with_envelope_key(mut self, key: [u8; 32]) -> Self {
        self.envelope_key = Some(key);
        self
    }

    /// Build the encrypted datagram.
    pub fn build<R: Runtime>(self) -> BytesMut {
        let payload = TestPayload {
            address: self.address.map(|address| address.ip()),
            port: self.address.map_or(0, |address| address.port()),
            intro_key: self.intro_key.expect("intro key to be set"),
            nonce: self.nonce,
        }
        .serialize();

        let envelope_key = self.envelope_key.expect("envelope key to be set");
        let envelope_nonce = R::rng().next_u64();

        let mut ciphertext = payload.to_vec();
        ChaChaPoly::with_nonce(&envelope_key, envelope_nonce)
            .encrypt_with_ad(&envelope_nonce.to_be_bytes(), &mut ciphertext)
            .expect("to succeed");

        let mut out = BytesMut::with_capacity(ENVELOPE_NONCE_LEN + ciphertext.len());
        out.put_u64(envelope_nonce);
        out.put_slice(&ciphertext);

        out
    }
}

/// Encrypted peer test message.
pub struct TestMessage;

impl TestMessage {
    /// Attempt to decrypt `datagram` with `key` and parse the payload.
    pub fn decrypt(key: &[u8; 32], datagram: &[u8]) -> crate::Result<TestPayload> {
        if datagram.len() < ENVELOPE_NONCE_LEN + ENVELOPE_TAG_LEN {
            return Err(Error::Malformed);
        }

        let envelope_nonce =
            u64::from_be_bytes(datagram[..ENVELOPE_NONCE_LEN].try_into().expect("8 bytes"));
        let mut payload = datagram[ENVELOPE_NONCE_LEN..].to_vec();

        ChaChaPoly::with_nonce(key, envelope_nonce)
            .decrypt_with_ad(&datagram[..ENVELOPE_NONCE_LEN], &mut payload)?;

        TestPayload::parse(&payload).map_err(From::from)
    }
}
