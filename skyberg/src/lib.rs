/*
 * Created on Sat Mar 16 2024
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

//! # Skyberg
//!
//! A concurrent, in-memory, fixed-capacity hash table for 64-bit keys and
//! values that stays fast at load factors well past 90%. Records are spread
//! over three tiers of increasing flexibility: a big primary tier of
//! 64-slot blocks, a small two-choice balanced secondary tier, and per-block
//! unbounded overflow lists as the never-fails backstop. Every slot is
//! shadowed by a one-byte fingerprint of its key, so a lookup scans a whole
//! block's metadata in a couple of vector compares before it touches any
//! slot payload.
//!
//! Inserts and lookups on the first two tiers are lock-free (per-slot CAS
//! reservation, release/acquire publication); only the overflow lists take a
//! lock, and that is a one-byte spinlock per block.
//!
//! ## Acknowledgements
//!
//! - The tiered bounded-load layout follows the iceberg hashing line of work
//! by Pandey, Bender, Conway, Farach-Colton, Kuszmaul and Tagliavini
//! - The vectorized metadata probing takes after the Swisstable family of
//! open addressing tables (the Abseil developers and contributors)

#![deny(unused_crate_dependencies)]
#![deny(unused_imports)]

mod alloc;
mod bitmask;
mod counter;
mod hash;
mod table;
mod util;

#[cfg(test)]
mod tests;

cfg_if::cfg_if! {
    if #[cfg(all(
        target_feature = "sse2",
        any(target_arch = "x86", target_arch = "x86_64")
    ))] {
        mod sse2;
        pub(crate) use self::sse2 as imp;
    } else {
        mod generic;
        pub(crate) use self::generic as imp;
    }
}

use core::sync::atomic::Ordering;

pub(crate) const ORD_RLX: Ordering = Ordering::Relaxed;
pub(crate) const ORD_ACQ: Ordering = Ordering::Acquire;
pub(crate) const ORD_REL: Ordering = Ordering::Release;
pub(crate) const ORD_ACR: Ordering = Ordering::AcqRel;

pub use crate::table::Skyberg;
