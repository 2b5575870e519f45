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

use crate::{Error, Result};

use chacha20poly1305::{aead::AeadInPlace, ChaCha20Poly1305, Key, KeyInit, Nonce, Tag};

use alloc::vec::Vec;

/// Poly1305 authentication tag length.
const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 AEAD.
///
/// The 96-bit nonce carries a caller-provided 64-bit value in its last eight
/// bytes, big-endian.
pub struct ChaChaPoly {
    /// Cipher instance.
    cipher: ChaCha20Poly1305,

    /// Nonce.
    nonce: [u8; 12],
}

impl ChaChaPoly {
    /// Create new [`ChaChaPoly`] with a zero nonce.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            nonce: [0u8; 12],
        }
    }

    /// Create new [`ChaChaPoly`] with an explicit nonce.
    pub fn with_nonce(key: &[u8; 32], nonce: u64) -> Self {
        let mut this = Self::new(key);
        this.nonce[4..].copy_from_slice(&nonce.to_be_bytes());
        this
    }

    /// Encrypt `plaintext` in place, authenticating `ad`, and append the tag.
    pub fn encrypt_with_ad(&mut self, ad: &[u8], plaintext: &mut Vec<u8>) -> Result<()> {
        let tag = self
            .cipher
            .encrypt_in_place_detached(Nonce::from_slice(&self.nonce), ad, plaintext.as_mut_slice())
            .map_err(|_| Error::Crypto)?;
        plaintext.extend_from_slice(tag.as_slice());

        Ok(())
    }

    /// Decrypt `ciphertext` in place, verifying `ad` and the trailing tag.
    pub fn decrypt_with_ad(&mut self, ad: &[u8], ciphertext: &mut Vec<u8>) -> Result<()> {
        if ciphertext.len() < TAG_LEN {
            return Err(Error::Malformed);
        }

        let tag_offset = ciphertext.len() - TAG_LEN;
        let tag = Tag::clone_from_slice(&ciphertext[tag_offset..]);
        ciphertext.truncate(tag_offset);

        self.cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&self.nonce),
                ad,
                ciphertext.as_mut_slice(),
                &tag,
            )
            .map_err(|_| Error::Crypto)
    }
}
