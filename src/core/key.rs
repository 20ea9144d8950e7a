//! Variable keys.
//!
//! A [`Key`] is a plain `u64`. Small integers work as keys directly; [`symbol`] packs a
//! character into the top byte and an index into the remaining 56 bits so that `x1` and
//! `l1` name different variables.

use std::borrow::Borrow;

pub type Key = u64;

const CHR_BITS: u32 = 8;
const INDEX_BITS: u32 = 64 - CHR_BITS;
const INDEX_MASK: u64 = (1u64 << INDEX_BITS) - 1;

/// Builds the key for variable `index` of family `chr`, e.g. `symbol('x', 1)`.
///
/// Non-ASCII characters are truncated to their low byte. Indices use the low 56 bits.
pub fn symbol(chr: char, index: u64) -> Key {
    (((chr as u32) as u64 & 0xff) << INDEX_BITS) | (index & INDEX_MASK)
}

/// Character of a symbol key, or `None` for a plain integer key.
pub fn symbol_chr(key: Key) -> Option<char> {
    let byte = (key >> INDEX_BITS) as u8;
    byte.is_ascii_alphabetic().then_some(byte as char)
}

pub fn symbol_index(key: Key) -> u64 {
    key & INDEX_MASK
}

/// Human readable key: `x1` for symbols, the decimal value otherwise.
pub fn format_key(key: impl Borrow<Key>) -> String {
    let key = *key.borrow();
    match symbol_chr(key) {
        Some(chr) => format!("{chr}{}", symbol_index(key)),
        None => key.to_string(),
    }
}
