//! Byte classifier: marks quote, separator and newline positions of a span
//! in three disjoint bitmaps of `ceil(len / 64)` u64 words.
//!
//! The classifier has no notion of quoting state; it only records raw byte
//! positions. Callers interpret the bitmaps with their own quote tracking.

/// Number of u64 words needed to cover `len` bytes.
#[inline]
pub fn words_for(len: usize) -> usize {
    (len + 63) / 64
}

/// Populate the three bitmaps for `data`. The slices must hold at least
/// `words_for(data.len())` words and start zeroed.
pub fn classify(data: &[u8], sep: u8, quotes: &mut [u64], seps: &mut [u64], newlines: &mut [u64]) {
    let mut chunks = data.chunks_exact(64);
    let mut word_idx = 0;
    for chunk in &mut chunks {
        let mut q = 0u64;
        let mut s = 0u64;
        let mut n = 0u64;
        for (bit, &b) in chunk.iter().enumerate() {
            if b == b'"' {
                q |= 1 << bit;
            } else if b == sep {
                s |= 1 << bit;
            } else if b == b'\n' {
                n |= 1 << bit;
            }
        }
        quotes[word_idx] = q;
        seps[word_idx] = s;
        newlines[word_idx] = n;
        word_idx += 1;
    }

    let rem = chunks.remainder();
    if !rem.is_empty() {
        let mut q = 0u64;
        let mut s = 0u64;
        let mut n = 0u64;
        for (bit, &b) in rem.iter().enumerate() {
            if b == b'"' {
                q |= 1 << bit;
            } else if b == sep {
                s |= 1 << bit;
            } else if b == b'\n' {
                n |= 1 << bit;
            }
        }
        quotes[word_idx] = q;
        seps[word_idx] = s;
        newlines[word_idx] = n;
    }
}

/// Test a single bit in a bitmap.
#[inline]
pub fn bit_set(bitmap: &[u64], pos: usize) -> bool {
    let word = pos / 64;
    word < bitmap.len() && (bitmap[word] >> (pos % 64)) & 1 == 1
}
