/*
 * Created on Fri Mar 22 2024
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

//! The three-tier bounded-load table.
//!
//! A ball (a live key/value pair) lives in exactly one of three places:
//!
//! 1. the primary tier: per-key one candidate block of 64 slots, scanned as
//!    one 64-byte metadata stripe
//! 2. the secondary tier: per-key two candidate blocks of [`LV2_SLOTS`]
//!    slots each, insert picking the emptier of the two
//! 3. the overflow tier: one unbounded singly linked list per primary block,
//!    each under its own one-byte spinlock
//!
//! The tiered layout is what buys the high load factor: the primary tier
//! soaks up almost everything, the two-choice secondary tier flattens the
//! spill, and the lists catch the remainder so an insert can never fail.
//!
//! Slot discipline on the first two tiers: a metadata byte moves from 0
//! (empty) to 1 (reserved, claimed by CAS) to the key's fingerprint
//! (committed, always >= 2) and back to 0 on removal. Readers only ever act
//! on committed bytes, so the reservation window is invisible to them.

use crate::alloc::zeroed_slab;
use crate::bitmask::Bitmask;
use crate::counter::ShardedCounter;
use crate::hash::{split_hash, HashFamily};
use crate::imp;
use crate::util::{likely, unlikely};
use crate::{ORD_ACQ, ORD_ACR, ORD_REL, ORD_RLX};
use core::cell::UnsafeCell;
use core::fmt;
use core::hint;
use core::mem;
use core::sync::atomic::{AtomicU64, AtomicU8};
use log::{debug, trace};

/// log2 of the primary tier block size
pub(crate) const SLOT_BITS: u64 = 6;
/// Slots per primary tier block (one 64-byte metadata stripe)
pub(crate) const LV1_SLOTS: usize = 1 << SLOT_BITS;
/// Target average occupancy of a secondary tier block
pub(crate) const C_LV2: u64 = 8;
/// Candidate blocks per key in the secondary tier
pub(crate) const D_CHOICES: usize = 2;
/// log log of the largest supported capacity; its share per choice is the
/// slop added on top of [`C_LV2`] so a block can absorb balancing skew
pub(crate) const MAX_LG_LG_N: u64 = 4;
/// Live slots per secondary tier block
pub(crate) const LV2_SLOTS: usize = (C_LV2 + MAX_LG_LG_N / D_CHOICES as u64) as usize;
/// Scan width of a secondary tier metadata stripe. Wider than the live slot
/// count; the padding bytes stay zero forever and get masked out of every scan
const LV2_MD_WIDTH: usize = 32;
/// Restricts a secondary scan to the live slots
const LV2_WIDTH_MASK: u64 = (1u64 << LV2_SLOTS) - 1;
/// Ball counter flush threshold (see the counter module)
pub(crate) const THRESHOLD: i64 = 64;

/// Metadata sentinel: nobody home
const MD_EMPTY: u8 = 0;
/// Metadata sentinel: claimed by an in-flight insert, payload not yet valid
const MD_RESERVED: u8 = 1;

/// One key/value cell. The halves are individually atomic and accessed
/// relaxed; the metadata byte next door provides the publication ordering
#[repr(C)]
struct Slot {
    key: AtomicU64,
    val: AtomicU64,
}

#[repr(C)]
struct Lv1Block {
    slots: [Slot; LV1_SLOTS],
}

#[repr(C)]
struct Lv2Block {
    slots: [Slot; LV2_SLOTS],
}

/// The metadata stripe of a primary block, aligned so the vector loads in the
/// scan never straddle it
#[repr(C, align(64))]
struct Lv1BlockMd {
    md: [AtomicU8; LV1_SLOTS],
}

#[repr(C, align(32))]
struct Lv2BlockMd {
    md: [AtomicU8; LV2_MD_WIDTH],
}

struct Lv3Node {
    key: u64,
    val: u64,
    next: *mut Lv3Node,
}

/// An overflow list head. Only dereferenced under the bucket lock
struct Lv3List {
    head: UnsafeCell<*mut Lv3Node>,
}

/// A concurrent, fixed-capacity, bounded-load hash table mapping `u64` keys
/// to `u64` values.
///
/// The table is a multi-map over physical slots: inserting a key twice
/// stores two balls, and `get`/`remove` act on an arbitrary matching one.
/// All operations take `&self` and may be called from any number of threads;
/// the `tid` parameter on the mutating calls only picks a counter shard and
/// has no correctness impact.
///
/// There is no resize. Once the first two tiers are saturated the overflow
/// lists grow without bound and probes on the affected blocks degrade to a
/// locked list walk, so size the table for the workload up front.
pub struct Skyberg {
    hashes: HashFamily,
    nslots: u64,
    nblocks: u64,
    block_bits: u64,
    /// bytes in the four fixed slabs (the overflow lists are not counted)
    heap_size: usize,
    lv1: Box<[Lv1Block]>,
    lv2: Box<[Lv2Block]>,
    lv1_md: Box<[Lv1BlockMd]>,
    lv2_md: Box<[Lv2BlockMd]>,
    lv3: Box<[Lv3List]>,
    lv3_sizes: Box<[AtomicU64]>,
    lv3_locks: Box<[AtomicU8]>,
    lv1_counter: ShardedCounter,
    lv2_counter: ShardedCounter,
    lv3_counter: ShardedCounter,
}

// UNSAFE(@ohsayan): Everything shared is either atomic (slot payloads,
// metadata stripes, sizes, locks, counters) or reached only under the
// per-list spinlock (the overflow head pointers and the nodes behind them).
// The raw pointers inside are owned by the table alone
unsafe impl Send for Skyberg {}
unsafe impl Sync for Skyberg {}

impl Skyberg {
    /// Construct a table with `2^log_slots` primary slots. `log_slots` below
    /// [`SLOT_BITS`] cannot hold even one block and panics; running out of
    /// memory aborts through the allocation error hook, so a half-built
    /// table is never returned
    pub fn new(log_slots: u64) -> Self {
        assert!(
            log_slots >= SLOT_BITS,
            "need at least {} slots for one block",
            LV1_SLOTS
        );
        let block_bits = log_slots - SLOT_BITS;
        assert!(block_bits <= 32, "table shape out of range");
        let nblocks = 1u64 << block_bits;
        let heap_size = nblocks as usize
            * (mem::size_of::<Lv1Block>()
                + mem::size_of::<Lv2Block>()
                + mem::size_of::<Lv1BlockMd>()
                + mem::size_of::<Lv2BlockMd>());
        let shards = num_cpus::get().max(1);
        let table = Self {
            hashes: HashFamily::new(),
            nslots: 1u64 << log_slots,
            nblocks,
            block_bits,
            heap_size,
            // UNSAFE(@ohsayan): all slab element types are atomics, raw
            // pointers or plain ints wrapped in cells; all-zeroes is the
            // valid "everything empty" state for each of them
            lv1: unsafe { zeroed_slab(nblocks as usize) },
            lv2: unsafe { zeroed_slab(nblocks as usize) },
            lv1_md: unsafe { zeroed_slab(nblocks as usize) },
            lv2_md: unsafe { zeroed_slab(nblocks as usize) },
            lv3: unsafe { zeroed_slab(nblocks as usize) },
            lv3_sizes: unsafe { zeroed_slab(nblocks as usize) },
            lv3_locks: unsafe { zeroed_slab(nblocks as usize) },
            lv1_counter: ShardedCounter::new(shards, 0, THRESHOLD),
            lv2_counter: ShardedCounter::new(shards, 0, THRESHOLD),
            lv3_counter: ShardedCounter::new(shards, 0, THRESHOLD),
        };
        debug!(
            "new table: {} primary slots across {} blocks, {} slab bytes, {} counter shards",
            table.nslots, table.nblocks, table.heap_size, shards
        );
        table
    }

    // scans

    fn lv1_scan(&self, index: u64, needle: u8) -> Bitmask {
        let md = &self.lv1_md[index as usize].md;
        // UNSAFE(@ohsayan): 64 readable bytes, aligned by the stripe repr.
        // Writers may race the vector read, which is why every hit is
        // confirmed with an atomic load before anything trusts it
        unsafe { imp::slot_mask_64(md.as_ptr().cast(), needle) }
    }

    fn lv2_scan(&self, index: u64, needle: u8) -> Bitmask {
        let md = &self.lv2_md[index as usize].md;
        // UNSAFE(@ohsayan): 32 readable bytes, aligned by the stripe repr
        unsafe { imp::slot_mask_32(md.as_ptr().cast(), needle).masked(LV2_WIDTH_MASK) }
    }

    // insert

    /// Insert a ball. Always succeeds: the overflow tier is unbounded.
    /// Duplicate keys are not coalesced
    pub fn insert(&self, key: u64, val: u64, tid: usize) -> bool {
        let (fprint, index) = split_hash(self.hashes.lv1(key), self.block_bits);
        let md = &self.lv1_md[index as usize].md;
        for slot in self.lv1_scan(index, MD_EMPTY) {
            /*
             The empty mask was computed once and may be stale: another
             insert can claim a slot right under us (or may have been midway
             through claiming when we scanned). Such slots simply fail the
             exchange and we move on to the next candidate
            */
            if md[slot]
                .compare_exchange(MD_EMPTY, MD_RESERVED, ORD_ACR, ORD_RLX)
                .is_ok()
            {
                self.lv1_counter.add(1, tid);
                let cell = &self.lv1[index as usize].slots[slot];
                cell.key.store(key, ORD_RLX);
                cell.val.store(val, ORD_RLX);
                // commit. the release pairs with the acquire confirm on the
                // read side, making the payload stores above visible
                md[slot].store(fprint, ORD_REL);
                return true;
            }
        }
        self.insert_lv2(key, val, index, tid)
    }

    fn insert_lv2(&self, key: u64, val: u64, lv3_index: u64, tid: usize) -> bool {
        if unlikely(self.lv2_counter.snapshot() >= (C_LV2 * self.nblocks) as i64) {
            // the tier is at its target average load; don't bother probing
            return self.insert_lv3(key, val, lv3_index, tid);
        }
        let (fprint1, index1) = split_hash(self.hashes.lv2(key, 0), self.block_bits);
        let (fprint2, index2) = split_hash(self.hashes.lv2(key, 1), self.block_bits);
        let empties1 = self.lv2_scan(index1, MD_EMPTY);
        let empties2 = self.lv2_scan(index2, MD_EMPTY);
        // two-choice: only a strictly emptier second candidate wins, ties
        // keep the first. lookups probe both, so this is policy, not truth
        let (fprint, index, empties) = if empties2.set_count() > empties1.set_count() {
            (fprint2, index2, empties2)
        } else {
            (fprint1, index1, empties1)
        };
        let md = &self.lv2_md[index as usize].md;
        for slot in empties {
            if md[slot]
                .compare_exchange(MD_EMPTY, MD_RESERVED, ORD_ACR, ORD_RLX)
                .is_ok()
            {
                self.lv2_counter.add(1, tid);
                let cell = &self.lv2[index as usize].slots[slot];
                cell.key.store(key, ORD_RLX);
                cell.val.store(val, ORD_RLX);
                md[slot].store(fprint, ORD_REL);
                return true;
            }
        }
        self.insert_lv3(key, val, lv3_index, tid)
    }

    fn insert_lv3(&self, key: u64, val: u64, index: u64, tid: usize) -> bool {
        self.lock_lv3(index);
        // UNSAFE(@ohsayan): head pointers are only touched under the bucket
        // lock, which we hold until after the push
        unsafe {
            let head = self.lv3[index as usize].head.get();
            if (*head).is_null() {
                trace!("block {index} spilled into its overflow list");
            }
            let node = Box::into_raw(Box::new(Lv3Node {
                key,
                val,
                next: *head,
            }));
            *head = node;
        }
        self.lv3_sizes[index as usize].fetch_add(1, ORD_RLX);
        self.lv3_counter.add(1, tid);
        self.unlock_lv3(index);
        true
    }

    // lookup

    /// Look up a ball, copying its value out. With duplicates present, which
    /// ball answers is arbitrary
    pub fn get(&self, key: u64) -> Option<u64> {
        let (fprint, index) = split_hash(self.hashes.lv1(key), self.block_bits);
        let md = &self.lv1_md[index as usize].md;
        for slot in self.lv1_scan(index, fprint) {
            // the vector read has no ordering; this acquire confirm is the
            // real correctness gate (and it weeds out scan false positives)
            if md[slot].load(ORD_ACQ) != fprint {
                continue;
            }
            let cell = &self.lv1[index as usize].slots[slot];
            if cell.key.load(ORD_RLX) == key {
                return Some(cell.val.load(ORD_RLX));
            }
        }
        self.get_lv2(key, index)
    }

    fn get_lv2(&self, key: u64, lv3_index: u64) -> Option<u64> {
        // the balancer picked one block at insert time, but load shifts, so
        // both candidates have to be probed
        for choice in 0..D_CHOICES {
            let (fprint, index) = split_hash(self.hashes.lv2(key, choice), self.block_bits);
            let md = &self.lv2_md[index as usize].md;
            for slot in self.lv2_scan(index, fprint) {
                if md[slot].load(ORD_ACQ) != fprint {
                    continue;
                }
                let cell = &self.lv2[index as usize].slots[slot];
                if cell.key.load(ORD_RLX) == key {
                    return Some(cell.val.load(ORD_RLX));
                }
            }
        }
        self.get_lv3(key, lv3_index)
    }

    fn get_lv3(&self, key: u64, index: u64) -> Option<u64> {
        self.lock_lv3(index);
        if likely(self.lv3_sizes[index as usize].load(ORD_RLX) == 0) {
            self.unlock_lv3(index);
            return None;
        }
        // UNSAFE(@ohsayan): nodes are only linked, read and freed under the
        // bucket lock, which we hold for the whole walk
        let found = unsafe {
            let mut node = *self.lv3[index as usize].head.get();
            let mut found = None;
            while !node.is_null() {
                if (*node).key == key {
                    found = Some((*node).val);
                    break;
                }
                node = (*node).next;
            }
            found
        };
        self.unlock_lv3(index);
        found
    }

    // removal

    /// Remove one ball with this key, probing the tiers in the same order as
    /// `get`. Returns false if no ball matched
    pub fn remove(&self, key: u64, tid: usize) -> bool {
        let (fprint, index) = split_hash(self.hashes.lv1(key), self.block_bits);
        let md = &self.lv1_md[index as usize].md;
        for slot in self.lv1_scan(index, fprint) {
            if md[slot].load(ORD_ACQ) != fprint {
                continue;
            }
            let cell = &self.lv1[index as usize].slots[slot];
            if cell.key.load(ORD_RLX) == key {
                // zeroing the byte is the whole removal; the stale payload
                // is unreachable once the zero is visible
                md[slot].store(MD_EMPTY, ORD_REL);
                self.lv1_counter.add(-1, tid);
                return true;
            }
        }
        self.remove_lv2(key, index, tid)
    }

    fn remove_lv2(&self, key: u64, lv3_index: u64, tid: usize) -> bool {
        for choice in 0..D_CHOICES {
            let (fprint, index) = split_hash(self.hashes.lv2(key, choice), self.block_bits);
            let md = &self.lv2_md[index as usize].md;
            for slot in self.lv2_scan(index, fprint) {
                if md[slot].load(ORD_ACQ) != fprint {
                    continue;
                }
                let cell = &self.lv2[index as usize].slots[slot];
                if cell.key.load(ORD_RLX) == key {
                    md[slot].store(MD_EMPTY, ORD_REL);
                    self.lv2_counter.add(-1, tid);
                    return true;
                }
            }
        }
        self.remove_lv3(key, lv3_index, tid)
    }

    fn remove_lv3(&self, key: u64, index: u64, tid: usize) -> bool {
        self.lock_lv3(index);
        if self.lv3_sizes[index as usize].load(ORD_RLX) == 0 {
            self.unlock_lv3(index);
            return false;
        }
        // UNSAFE(@ohsayan): same bucket lock contract as the list lookup;
        // unlinking and freeing are safe because no reader can be inside the
        // list without the lock
        let removed = unsafe {
            let head = self.lv3[index as usize].head.get();
            let mut removed = false;
            if (**head).key == key {
                let node = *head;
                *head = (*node).next;
                drop(Box::from_raw(node));
                removed = true;
            } else {
                let mut prev = *head;
                while !(*prev).next.is_null() {
                    if (*(*prev).next).key == key {
                        let node = (*prev).next;
                        (*prev).next = (*node).next;
                        drop(Box::from_raw(node));
                        removed = true;
                        break;
                    }
                    prev = (*prev).next;
                }
            }
            removed
        };
        if removed {
            self.lv3_sizes[index as usize].fetch_sub(1, ORD_RLX);
            self.lv3_counter.add(-1, tid);
        }
        self.unlock_lv3(index);
        removed
    }

    // the overflow bucket locks

    fn lock_lv3(&self, index: u64) {
        let lock = &self.lv3_locks[index as usize];
        // plain test and set; the uncontended path is a single exchange
        while lock.swap(1, ORD_ACQ) != 0 {
            hint::spin_loop();
        }
    }

    fn unlock_lv3(&self, index: u64) {
        self.lv3_locks[index as usize].store(0, ORD_REL);
    }

    // occupancy

    /// Balls in the primary tier. Drains the counter shards; eventually
    /// consistent while writers are active
    pub fn lv1_balls(&self) -> u64 {
        checked_total(self.lv1_counter.total())
    }

    /// Balls in the secondary tier
    pub fn lv2_balls(&self) -> u64 {
        checked_total(self.lv2_counter.total())
    }

    /// Balls in the overflow lists
    pub fn lv3_balls(&self) -> u64 {
        checked_total(self.lv3_counter.total())
    }

    /// Balls in the whole table
    pub fn tot_balls(&self) -> u64 {
        self.lv1_balls() + self.lv2_balls() + self.lv3_balls()
    }

    /// Total ball capacity. The overflow tier has no fixed bound, so its
    /// contribution is whatever it currently holds
    pub fn capacity(&self) -> u64 {
        self.lv3_balls() + self.nblocks * (LV1_SLOTS + LV2_SLOTS) as u64
    }

    /// Occupancy as a fraction of [`Self::capacity`]
    pub fn load_factor(&self) -> f64 {
        self.tot_balls() as f64 / self.capacity() as f64
    }

    // shape

    /// Primary slot count the table was constructed with
    pub fn nslots(&self) -> u64 {
        self.nslots
    }

    /// Blocks per tier
    pub fn nblocks(&self) -> u64 {
        self.nblocks
    }

    /// Bytes held by the fixed slabs
    pub fn heap_size(&self) -> usize {
        self.heap_size
    }
}

fn checked_total(total: i64) -> u64 {
    debug_assert!(total >= 0, "tier counter went negative");
    total.max(0) as u64
}

impl Drop for Skyberg {
    fn drop(&mut self) {
        // the slabs free themselves; the overflow nodes are ours to walk
        for list in self.lv3.iter() {
            // UNSAFE(@ohsayan): we hold `&mut self`, nobody else is left
            unsafe {
                let mut node = *list.head.get();
                while !node.is_null() {
                    let next = (*node).next;
                    drop(Box::from_raw(node));
                    node = next;
                }
            }
        }
    }
}

impl fmt::Debug for Skyberg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Skyberg")
            .field("nslots", &self.nslots)
            .field("nblocks", &self.nblocks)
            .field("lv1_balls", &self.lv1_balls())
            .field("lv2_balls", &self.lv2_balls())
            .field("lv3_balls", &self.lv3_balls())
            .field("load_factor", &self.load_factor())
            .finish()
    }
}

#[cfg(test)]
impl Skyberg {
    /// Walk every slot and verify the metadata discipline at quiescence: a
    /// byte is either empty or exactly the fingerprint its resident key
    /// hashes to for that tier and block, reservations have all been
    /// committed, and secondary balls sit in an admissible candidate block
    pub(crate) fn check_invariants(&self) {
        for (index, stripe) in self.lv1_md.iter().enumerate() {
            for (slot, md) in stripe.md.iter().enumerate() {
                let byte = md.load(ORD_ACQ);
                if byte == MD_EMPTY {
                    continue;
                }
                assert_ne!(byte, MD_RESERVED, "leaked reservation in primary block {index}");
                let key = self.lv1[index].slots[slot].key.load(ORD_RLX);
                let (fprint, home) = split_hash(self.hashes.lv1(key), self.block_bits);
                assert_eq!(byte, fprint, "fingerprint mismatch in primary block {index}");
                assert_eq!(home, index as u64, "ball strayed from its primary block");
            }
        }
        for (index, stripe) in self.lv2_md.iter().enumerate() {
            for slot in 0..LV2_SLOTS {
                let byte = stripe.md[slot].load(ORD_ACQ);
                if byte == MD_EMPTY {
                    continue;
                }
                assert_ne!(
                    byte, MD_RESERVED,
                    "leaked reservation in secondary block {index}"
                );
                let key = self.lv2[index].slots[slot].key.load(ORD_RLX);
                let admissible = (0..D_CHOICES).any(|choice| {
                    let (fprint, home) =
                        split_hash(self.hashes.lv2(key, choice), self.block_bits);
                    home == index as u64 && fprint == byte
                });
                assert!(admissible, "secondary ball in an inadmissible block");
            }
            for slot in LV2_SLOTS..LV2_MD_WIDTH {
                assert_eq!(
                    stripe.md[slot].load(ORD_ACQ),
                    MD_EMPTY,
                    "scan padding byte got dirtied"
                );
            }
        }
    }

    /// Sum of the per-list overflow sizes, for checking against the tier
    /// counter
    pub(crate) fn lv3_size_sum(&self) -> u64 {
        self.lv3_sizes.iter().map(|size| size.load(ORD_RLX)).sum()
    }
}
