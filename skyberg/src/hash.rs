/*
 * Created on Mon Mar 18 2024
 *
 * This file is a part of Skytable
 * Skytable (formerly known as TerrabaseDB or Skybase) is a free and open-source
 * NoSQL database written by Sayan Nandan ("the Author") with the
 * vision to provide flexibility in data modelling without compromising
 * on performance, queryability or scalability.
 *
 * Copyright (c) 2024, Sayan Nandan <ohsayan@outlook.com>
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 *
*/

//! The seeded hash family behind the tiers, and the fingerprint/index split.
//!
//! Every tier derives its own 64-bit hash of the key: one keyed hasher for
//! the primary tier and one per secondary choice. The low byte of a hash is
//! the slot fingerprint, the bits above it select the block. Since metadata
//! byte values 0 (empty) and 1 (reserved) are sentinels, a legal fingerprint
//! is forced to be at least 2 before the hash is ever split

use crate::table::D_CHOICES;
use std::hash::BuildHasher;
use std::hash::Hasher;

use ahash::RandomState;

/// Width of the fingerprint field in a derived hash
pub const FPRINT_BITS: u32 = 8;

/// Five independent seeds for the keyed hash family. Three are live (primary
/// plus the two secondary choices); the trailing two are spares kept so the
/// family can grow without reshuffling the live ones
const SEEDS: [u64; 5] = [
    0x6d40_79e0_8eb8_17b5,
    0x2f1b_3193_86ca_fc95,
    0x91d0_57fe_3c44_2d13,
    0x5be0_76a9_6c07_d981,
    0xc623_93d1_8a5f_71ef,
];

fn hash64(state: &RandomState, key: u64) -> u64 {
    let mut hasher = state.build_hasher();
    hasher.write_u64(key);
    hasher.finish()
}

fn keyed(seed: u64) -> RandomState {
    // spread one seed over the four state words
    RandomState::with_seeds(
        seed,
        seed ^ 0x243f_6a88_85a3_08d3,
        seed ^ 0x1319_8a2e_0370_7344,
        seed ^ 0xa409_3822_299f_31d0,
    )
}

/// If the low [`FPRINT_BITS`] of the hash are 0 or 1, set bit 1. The mask
/// `0xfe` checks "any bit above bit 0 in the low byte"; oring in 2 is the
/// cheapest way to land in the legal range without disturbing the index bits
fn nonzero_fprint(hash: u64) -> u64 {
    if hash & 0xfe != 0 {
        hash
    } else {
        hash | 2
    }
}

/// Split a derived hash into its `(fingerprint, block index)` pair. The
/// fingerprint is the low byte; the index is taken from the bits right above
/// it, masked down to the table's block count (a power of two)
pub fn split_hash(hash: u64, block_bits: u64) -> (u8, u64) {
    let fprint = hash as u8;
    let index = (hash >> FPRINT_BITS) & ((1u64 << block_bits) - 1);
    (fprint, index)
}

/// The keyed hashers of the table. Both sides of an operation (the insert
/// that placed a key and the lookup probing for it) must derive identical
/// hashes, so a family is constructed once and owned by the table
pub struct HashFamily {
    lv1: RandomState,
    lv2: [RandomState; D_CHOICES],
}

impl HashFamily {
    pub fn new() -> Self {
        Self {
            lv1: keyed(SEEDS[0]),
            lv2: [keyed(SEEDS[1]), keyed(SEEDS[2])],
        }
    }

    /// The primary tier hash of `key`, fingerprint already forced nonzero
    pub fn lv1(&self, key: u64) -> u64 {
        nonzero_fprint(hash64(&self.lv1, key))
    }

    /// The secondary tier hash of `key` for the given choice (0 or 1)
    pub fn lv2(&self, key: u64, choice: usize) -> u64 {
        nonzero_fprint(hash64(&self.lv2[choice], key))
    }
}

#[cfg(test)]
mod tests {
    use super::{nonzero_fprint, split_hash, HashFamily};

    #[test]
    fn fingerprint_is_never_a_sentinel() {
        // hit the patch branch directly
        assert_eq!(nonzero_fprint(0) & 0xff, 2);
        assert_eq!(nonzero_fprint(1) & 0xff, 3);
        assert_eq!(nonzero_fprint(0xabcd_0100) & 0xff, 2);
        // and sweep the whole family over a pile of keys
        let family = HashFamily::new();
        for key in 0..1u64 << 16 {
            let (fp, _) = split_hash(family.lv1(key), 10);
            assert!(fp >= 2);
            for choice in 0..2 {
                let (fp, _) = split_hash(family.lv2(key, choice), 10);
                assert!(fp >= 2);
            }
        }
    }

    #[test]
    fn split_respects_block_bits() {
        let (fp, index) = split_hash(0xffff_ffff_ffff_ffff, 4);
        assert_eq!(fp, 0xff);
        assert!(index < 16);
        // zero block bits always map to block zero
        let (_, index) = split_hash(0xdead_beef_cafe_f00d, 0);
        assert_eq!(index, 0);
    }

    #[test]
    fn family_is_deterministic() {
        let a = HashFamily::new();
        let b = HashFamily::new();
        for key in [0u64, 7, 0xffff_ffff, u64::MAX] {
            assert_eq!(a.lv1(key), b.lv1(key));
            assert_eq!(a.lv2(key, 0), b.lv2(key, 0));
            assert_eq!(a.lv2(key, 1), b.lv2(key, 1));
        }
    }
}
