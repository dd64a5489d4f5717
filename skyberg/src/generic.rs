/*
 * Created on Sun Mar 17 2024
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

//! Fingerprint scans for CPU architectures without SSE instructions, eight
//! bytes at a time with plain word ops

use crate::bitmask::Bitmask;
use core::mem;

type GroupWord = u64;

fn repeat(byte: u8) -> GroupWord {
    GroupWord::from_ne_bytes([byte; Group::WIDTH])
}

/// A group of metadata bytes loaded into one machine word
#[derive(Clone, Copy)]
pub struct Group(GroupWord);

impl Group {
    /// Bytes scanned per word compare
    pub const WIDTH: usize = mem::size_of::<Self>();

    /// Load a group of metadata bytes starting at the given address (aligned)
    ///
    /// ## Safety
    /// `ptr` must be valid for a `WIDTH`-byte read and aligned to `WIDTH`
    pub unsafe fn load_aligned(ptr: *const u8) -> Self {
        Group(core::ptr::read(ptr.cast()))
    }

    /// Returns one bit per byte in the group, set where the byte _may_ equal
    /// `byte`.
    ///
    /// This is the classic haszero/hasvalue word trick (see the Stanford bit
    /// twiddling hacks). It can report a false positive for a byte that
    /// differs from the needle only in its lowest bit, when the adjacent lower
    /// byte is a true match. That is fine here because after the metadata scan
    /// we always confirm the candidate slot before trusting it, so a stray hit
    /// only costs one wasted comparison
    pub fn match_byte(self, byte: u8) -> u8 {
        let cmp = self.0 ^ repeat(byte);
        let hits = cmp.wrapping_sub(repeat(0x01)) & !cmp & repeat(0x80);
        /*
         `hits` has bit 8i+7 set where byte i matched (little endian byte
         order; swap on BE hosts so the slot indices come out right). The
         multiply gathers those eight indicator bits into the top byte: the
         magic constant is sum(2^(7j)) for j in 0..8, so the term for byte i
         lands on bit 56+i and nothing else can carry into that range
        */
        ((hits.to_le().wrapping_mul(0x0002_0408_1020_4081) >> 56) & 0xff) as u8
    }
}

/// Scan the 64 metadata bytes of a primary tier block for `needle`, returning
/// one (possibly false positive) match bit per slot
///
/// ## Safety
/// `md` must be valid for a 64-byte read and aligned to `Group::WIDTH`. The
/// bytes may be concurrently mutated; the caller must treat every hit as a
/// hint and confirm it with an atomic load of the individual byte
pub unsafe fn slot_mask_64(md: *const u8, needle: u8) -> Bitmask {
    let mut mask = 0u64;
    let mut base = 0;
    while base < 64 {
        let group = Group::load_aligned(md.add(base));
        mask |= (group.match_byte(needle) as u64) << base;
        base += Group::WIDTH;
    }
    Bitmask(mask)
}

/// Scan the 32 metadata bytes of a secondary tier block for `needle`
///
/// ## Safety
/// Same contract as [`slot_mask_64`], for a 32-byte read
pub unsafe fn slot_mask_32(md: *const u8, needle: u8) -> Bitmask {
    let mut mask = 0u64;
    let mut base = 0;
    while base < 32 {
        let group = Group::load_aligned(md.add(base));
        mask |= (group.match_byte(needle) as u64) << base;
        base += Group::WIDTH;
    }
    Bitmask(mask)
}
