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

//! SSE2 vectorized fingerprint scans for hosts that support them

use crate::bitmask::Bitmask;

#[cfg(target_arch = "x86")]
use core::arch::x86;
#[cfg(target_arch = "x86_64")]
use core::arch::x86_64 as x86;
use core::mem;

/// A group of metadata bytes loaded into one 128-bit SIMD register
#[derive(Clone, Copy)]
pub struct Group(x86::__m128i);

impl Group {
    /// Bytes scanned per vector compare (16 on intel platforms)
    pub const WIDTH: usize = mem::size_of::<Self>();

    /// Load a group of metadata bytes starting at the given address. The read
    /// is aligned: block metadata arrays are aligned to at least `WIDTH`
    ///
    /// ## Safety
    /// `ptr` must be valid for a `WIDTH`-byte read and aligned to `WIDTH`
    pub unsafe fn load_aligned(ptr: *const u8) -> Self {
        Group(x86::_mm_load_si128(ptr.cast()))
    }

    /// Returns one bit per byte in the group, set where the byte equals `byte`.
    ///
    /// `pcmpeqb` leaves `0xff` in every matching lane and `0x00` elsewhere;
    /// `pmovmskb` then collects the high bit of each lane into the low 16 bits
    /// of a general purpose register. Unlike the SWAR fallback this match is
    /// exact: no false positives
    pub fn match_byte(self, byte: u8) -> u16 {
        unsafe {
            let cmp = x86::_mm_cmpeq_epi8(self.0, x86::_mm_set1_epi8(byte as i8));
            x86::_mm_movemask_epi8(cmp) as u16
        }
    }
}

/// Scan the 64 metadata bytes of a primary tier block for `needle`, returning
/// one match bit per slot
///
/// ## Safety
/// `md` must be valid for a 64-byte read and aligned to 16. The bytes may be
/// concurrently mutated; the caller must treat every hit as a hint and confirm
/// it with an atomic load of the individual byte
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
