//! Header obfuscation.
//!
//! An obfuscated datagram has its first [`OBFUSCATED_HEADER_LEN`] bytes XORed
//! with a keystream derived from a random seed byte, and the seed appended at
//! the end. It only keeps the fixed `d1:` prefix away from naive classifiers;
//! it is not encryption.

use crate::constants::OBFUSCATED_HEADER_LEN;

fn keystream(seed: u8, i: usize) -> u8 {
    let x = (seed as u32).wrapping_mul(0x9e37_79b1) ^ (i as u32).wrapping_mul(0x85eb_ca6b);
    (x ^ (x >> 13) ^ (x >> 24)) as u8
}

/// A random seed whose keystream changes the first byte, so an obfuscated
/// datagram never starts with the plain `d` tag.
pub fn random_seed() -> u8 {
    loop {
        let seed: u8 = rand::random();
        if keystream(seed, 0) != 0 {
            return seed;
        }
    }
}

/// Obfuscates `buf[..len]` in place and appends the seed.
///
/// Returns the new length, or `None` if there is no room for the seed byte.
pub fn obfuscate(buf: &mut [u8], len: usize, seed: u8) -> Option<usize> {
    if len >= buf.len() {
        return None;
    }
    for (i, b) in buf[..len.min(OBFUSCATED_HEADER_LEN)].iter_mut().enumerate() {
        *b ^= keystream(seed, i);
    }
    buf[len] = seed;
    Some(len + 1)
}

/// Restores an obfuscated datagram into `out`, returning the plain length.
pub fn deobfuscate(data: &[u8], out: &mut [u8]) -> Option<usize> {
    let (&seed, body) = data.split_last()?;
    if body.is_empty() || body.len() > out.len() {
        return None;
    }
    out[..body.len()].copy_from_slice(body);
    for (i, b) in out[..body.len().min(OBFUSCATED_HEADER_LEN)]
        .iter_mut()
        .enumerate()
    {
        *b ^= keystream(seed, i);
    }
    Some(body.len())
}
