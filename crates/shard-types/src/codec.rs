//! Bounded binary codec.
//!
//! Thin wrappers around `bincode` (fixed-width integers, little-endian).
//! Every decode runs against a byte budget: a record that claims more bytes
//! than the budget allows fails with [`TypeError::Codec`] before anything is
//! allocated, so a corrupted length field cannot trigger a huge allocation.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{TypeError, TypeResult};

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding()
}

/// Append-only byte sink.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize one value.
    pub fn write<T: Serialize + ?Sized>(&mut self, value: &T) -> TypeResult<()> {
        options()
            .serialize_into(&mut self.buf, value)
            .map_err(|e| TypeError::Codec(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a byte slice with a remaining byte budget.
#[derive(Debug)]
pub struct Decoder<'a> {
    input: &'a [u8],
    pos: usize,
    budget: u64,
}

impl<'a> Decoder<'a> {
    /// Decode from `input`, reading at most `budget` bytes in total.
    pub fn new(input: &'a [u8], budget: u64) -> Self {
        Self {
            input,
            pos: 0,
            budget,
        }
    }

    /// Deserialize the next value.
    pub fn read<T: DeserializeOwned>(&mut self) -> TypeResult<T> {
        let mut rest = &self.input[self.pos..];
        let before = rest.len();
        let value = options()
            .with_limit(self.budget)
            .deserialize_from(&mut rest)
            .map_err(|e| TypeError::Codec(e.to_string()))?;
        let used = before - rest.len();
        self.pos += used;
        self.budget = self.budget.saturating_sub(used as u64);
        Ok(value)
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The unread tail of the input.
    pub fn remaining(&self) -> &'a [u8] {
        &self.input[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.input.len()
    }

    /// Fail if unread bytes remain.
    pub fn expect_end(&self) -> TypeResult<()> {
        match self.input.len() - self.pos {
            0 => Ok(()),
            n => Err(TypeError::TrailingBytes(n)),
        }
    }
}
