//! Object contents for the upload phase.
//!
//! No two uploaded objects may share their contents. A [`ContentTemplate`] is generated once per
//! run with a random prefix, and every object gets a fresh random suffix appended to it.

use bytes::{BufMut, Bytes, BytesMut};
use rand::Rng;

const HEX_DIGITS: &[u8; 16] = b"0123456789abcdef";

/// A shared prefix plus the length of the per-object random suffix.
#[derive(Clone, Debug)]
pub struct ContentTemplate {
    prefix: Bytes,
    suffix_len: usize,
}

impl ContentTemplate {
    /// Generates a template for objects of `len` bytes, `suffix_len` of which vary per object.
    ///
    /// If the suffix is longer than the object, the whole object is random.
    pub fn generate<R: Rng>(len: usize, suffix_len: usize, rng: &mut R) -> Self {
        let suffix_len = suffix_len.min(len);
        let mut prefix = BytesMut::with_capacity(len - suffix_len);
        put_random_hex(&mut prefix, len - suffix_len, rng);

        Self {
            prefix: prefix.freeze(),
            suffix_len,
        }
    }

    /// The total length of every rendered object.
    pub fn len(&self) -> usize {
        self.prefix.len() + self.suffix_len
    }

    /// Returns `true` if rendered objects are empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The part shared by all objects.
    pub fn prefix(&self) -> &Bytes {
        &self.prefix
    }

    /// Renders the contents of one object: the shared prefix followed by a fresh random suffix.
    pub fn render<R: Rng>(&self, rng: &mut R) -> Bytes {
        let mut content = BytesMut::with_capacity(self.len());
        content.put_slice(&self.prefix);
        put_random_hex(&mut content, self.suffix_len, rng);
        content.freeze()
    }
}

fn put_random_hex<R: Rng>(buf: &mut BytesMut, len: usize, rng: &mut R) {
    for _ in 0..len {
        buf.put_u8(HEX_DIGITS[rng.random_range(0..HEX_DIGITS.len())]);
    }
}
