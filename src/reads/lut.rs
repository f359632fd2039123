//! Lookup-table encoding of reads.
//!
//! The device compares every read against a sliding two-base window of the
//! database using one CFGLUT5 primitive per base pair of the read. Each
//! primitive is configured with a 32-bit word from [`LUT5_CFG`], selected
//! by the two read bases it covers. The words are shipped bit-sliced: word
//! `i` of a [`LookupBlock`] holds bit `31 - i` of every pair's
//! configuration, one pair per bit, so the device can shift all 32
//! primitives' configurations in parallel.

/// Bases encoded per read; longer reads are cut.
pub const MAX_READ_BASES: usize = 64;
/// Base pairs (and configuration words) per read.
pub const MAX_PAIRS: usize = MAX_READ_BASES / 2;
/// Size of an encoded block on the wire.
pub const LOOKUP_BLOCK_LEN: usize = (MAX_PAIRS + 1) * 4;

/// Code for an ambiguous base (`N` and friends).
pub const AMBIGUOUS: usize = 4;

/// Configuration word for a read pair `[first][second]`.
///
/// Index order is A, C, T, G, ambiguous, matching [`base_code`].
pub const LUT5_CFG: [[u32; 5]; 5] = [
    [0xEEE0111E, 0xDDD0222D, 0xBBB0444B, 0x77708887, 0x0000FFF0],
    [0xEE0E11E1, 0xDD0D22D2, 0xBB0B44B4, 0x77078878, 0x0000FF0F],
    [0xE0EE1E11, 0xD0DD2D22, 0xB0BB4B44, 0x70778788, 0x0000F0FF],
    [0x0EEEE111, 0x0DDDD222, 0x0BBBB444, 0x07777888, 0x00000FFF],
    [0x0000EEEE, 0x0000DDDD, 0x0000BBBB, 0x00007777, 0],
];

/// Map an ASCII base onto its 2-bit code, or [`AMBIGUOUS`].
///
/// Works for either case: A=0, C=1, T/U=2, G=3. Any letter with bit 3 set
/// (N, K, M, ...) is ambiguous.
pub fn base_code(byte: u8) -> usize {
    if byte & 0x08 != 0 { AMBIGUOUS } else { ((byte >> 1) & 3) as usize }
}

/// Mismatches a configuration word reports against database window `w1 w2`.
///
/// Bit `idx` is the low bit and bit `16 + idx` the high bit of the count,
/// with `idx = w1 << 2 | w2`.
pub fn lut_mismatches(word: u32, w1: u8, w2: u8) -> u8 {
    let idx = u32::from((w1 & 3) << 2 | (w2 & 3));
    let low = (word >> idx) & 1;
    let high = (word >> (16 + idx)) & 1;
    (2 * high + low) as u8
}

/// The 132-byte encoded form of one read.
#[derive(Clone, PartialEq, Eq)]
pub struct LookupBlock {
    words: [u32; MAX_PAIRS + 1],
}

impl LookupBlock {
    /// Encode a sequence.
    ///
    /// Encoding stops at the first byte below `'A'` or after
    /// [`MAX_READ_BASES`] bases. Returns the block and the number of bases
    /// that went into it.
    pub fn encode(sequence: &[u8]) -> (Self, usize) {
        let mut table = [0u32; MAX_PAIRS];
        let mut pairs = 0;
        let mut bases = sequence.iter().copied().take_while(|&b| b >= b'A').take(MAX_READ_BASES);
        let mut encoded = 0;

        while pairs < MAX_PAIRS {
            let Some(first) = bases.next() else {
                // Even length: one empty slot marks the end
                table[pairs] = 0;
                pairs += 1;
                break;
            };
            encoded += 1;
            let c1 = base_code(first);
            match bases.next() {
                Some(second) => {
                    encoded += 1;
                    table[pairs] = LUT5_CFG[c1][base_code(second)];
                    pairs += 1;
                }
                None => {
                    table[pairs] = LUT5_CFG[c1][AMBIGUOUS];
                    pairs += 1;
                    break;
                }
            }
        }

        (Self::transpose(&table[..pairs]), encoded)
    }

    fn transpose(table: &[u32]) -> Self {
        let mut words = [0u32; MAX_PAIRS + 1];
        for (i, word) in words.iter_mut().take(MAX_PAIRS).enumerate() {
            for (k, cfg) in table.iter().enumerate() {
                let bit = (cfg >> (31 - i)) & 1;
                *word |= bit << (31 - k);
            }
        }
        Self { words }
    }

    /// Reassemble the configuration word of pair `k`.
    pub fn pair_word(&self, k: usize) -> u32 {
        let k = k % MAX_PAIRS;
        (0..MAX_PAIRS).fold(0u32, |acc, i| acc | ((self.words[i] >> (31 - k)) & 1) << (31 - i))
    }

    pub fn words(&self) -> &[u32; MAX_PAIRS + 1] {
        &self.words
    }

    /// Little-endian wire form.
    pub fn to_bytes(&self) -> [u8; LOOKUP_BLOCK_LEN] {
        let mut out = [0u8; LOOKUP_BLOCK_LEN];
        for (chunk, word) in out.chunks_exact_mut(4).zip(self.words.iter()) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        out
    }
}

impl Default for LookupBlock {
    fn default() -> Self {
        Self { words: [0u32; MAX_PAIRS + 1] }
    }
}

impl std::fmt::Debug for LookupBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LookupBlock").field("pair0", &format_args!("{:#010x}", self.pair_word(0))).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const BASES: [u8; 5] = [b'A', b'C', b'T', b'G', b'N'];

    #[test]
    fn base_codes() {
        assert_eq!(base_code(b'A'), 0);
        assert_eq!(base_code(b'c'), 1);
        assert_eq!(base_code(b'T'), 2);
        assert_eq!(base_code(b'U'), 2);
        assert_eq!(base_code(b'g'), 3);
        assert_eq!(base_code(b'N'), AMBIGUOUS);
    }

    #[test]
    fn classification_for_every_pair_and_window() {
        for (c1, &b1) in BASES.iter().enumerate() {
            for (c2, &b2) in BASES.iter().enumerate() {
                let (block, bases) = LookupBlock::encode(&[b1, b2, b'\n']);
                assert_eq!(bases, 2);
                let word = block.pair_word(0);
                assert_eq!(word, LUT5_CFG[c1][c2]);

                for w1 in 0..4u8 {
                    for w2 in 0..4u8 {
                        let expected = u8::from(c1 != AMBIGUOUS && c1 != w1 as usize)
                            + u8::from(c2 != AMBIGUOUS && c2 != w2 as usize);
                        assert_eq!(
                            lut_mismatches(word, w1, w2),
                            expected,
                            "read {}{} window {}{}",
                            b1 as char,
                            b2 as char,
                            w1,
                            w2
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn odd_read_pairs_last_base_with_ambiguous() {
        let (block, bases) = LookupBlock::encode(b"ACG");
        assert_eq!(bases, 3);
        assert_eq!(block.pair_word(0), LUT5_CFG[0][1]);
        assert_eq!(block.pair_word(1), LUT5_CFG[3][AMBIGUOUS]);
        assert_eq!(block.pair_word(2), 0);
    }

    #[test]
    fn long_reads_are_cut_at_64_bases() {
        let read = [b'G'; 80];
        let (block, bases) = LookupBlock::encode(&read);
        assert_eq!(bases, MAX_READ_BASES);
        for k in 0..MAX_PAIRS {
            assert_eq!(block.pair_word(k), LUT5_CFG[3][3]);
        }
        assert_eq!(block.words()[MAX_PAIRS], 0);
    }

    #[test]
    fn encoding_stops_at_terminator() {
        let (_, bases) = LookupBlock::encode(b"ACGT/2");
        assert_eq!(bases, 4);
    }

    #[test]
    fn wire_form_is_little_endian() {
        let (block, _) = LookupBlock::encode(b"AC");
        let bytes = block.to_bytes();
        assert_eq!(bytes.len(), 132);
        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), block.words()[0]);
        assert_eq!(&bytes[128..], &[0, 0, 0, 0]);
    }

    proptest! {
        #[test]
        fn window_equal_to_read_never_mismatches(read in "[ACGT]{2,64}") {
            let bytes = read.as_bytes();
            let (block, _) = LookupBlock::encode(bytes);
            for (k, pair) in bytes.chunks_exact(2).enumerate() {
                let w1 = base_code(pair[0]) as u8;
                let w2 = base_code(pair[1]) as u8;
                prop_assert_eq!(lut_mismatches(block.pair_word(k), w1, w2), 0);
            }
        }
    }
}
