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

//! Sharded occupancy counters.
//!
//! Every ball that enters or leaves a tier bumps a counter, and doing that on
//! one shared word would put a contended cache line on the hot path of every
//! insert and remove. So the count is split into per-shard deltas (one shard
//! per CPU, each on its own cache line) that are folded into a global word
//! only when a shard's local magnitude reaches the flush threshold. The
//! global word is therefore an eventually consistent view that can lag the
//! truth by up to `threshold * shards`

use crate::ORD_RLX;
use core::ops::Deref;
use core::sync::atomic::AtomicI64;

#[derive(Debug, Default)]
#[cfg_attr(
    any(
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "x86_64",
    ),
    repr(align(128))
)]
#[cfg_attr(
    not(any(
        target_arch = "aarch64",
        target_arch = "powerpc64",
        target_arch = "x86_64",
    )),
    repr(align(64))
)]
/**
    cache line padding (to avoid unintended cache line invalidation)
    - 128-bit: aarch64 (big.LITTLE), powerpc64 and x86_64 (Sandy Bridge+
    prefetches line pairs)
    - 64-bit: everything else we target
*/
struct CachePadded<T> {
    data: T,
}

impl<T> CachePadded<T> {
    const fn new(data: T) -> Self {
        Self { data }
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

/// A sharded signed counter with an eventually consistent global total
pub struct ShardedCounter {
    /// the folded total
    global: CachePadded<AtomicI64>,
    /// per-shard pending deltas
    shards: Box<[CachePadded<AtomicI64>]>,
    /// flush a shard into the global total once its magnitude reaches this
    threshold: i64,
}

impl ShardedCounter {
    pub fn new(shards: usize, initial: i64, threshold: i64) -> Self {
        debug_assert!(shards != 0);
        debug_assert!(threshold > 0);
        Self {
            global: CachePadded::new(AtomicI64::new(initial)),
            shards: (0..shards)
                .map(|_| CachePadded::new(AtomicI64::new(0)))
                .collect(),
            threshold,
        }
    }

    /// Apply a delta through the given shard (any integer; it is reduced mod
    /// the shard count). Relaxed all the way: occupancy numbers never carry a
    /// happens-before edge, the slot metadata does that
    pub fn add(&self, delta: i64, shard: usize) {
        let local = &self.shards[shard % self.shards.len()];
        let pending = local.fetch_add(delta, ORD_RLX) + delta;
        if pending.abs() >= self.threshold {
            // move what we saw into the global total. fetch_sub instead of a
            // plain reset so deltas racing in right now are not lost
            local.fetch_sub(pending, ORD_RLX);
            self.global.fetch_add(pending, ORD_RLX);
        }
    }

    /// Drain every shard into the global total
    pub fn sync(&self) {
        for local in self.shards.iter() {
            let pending = local.swap(0, ORD_RLX);
            if pending != 0 {
                self.global.fetch_add(pending, ORD_RLX);
            }
        }
    }

    /// Read the global total as-is, without draining the shards. Cheap, and
    /// may lag by up to `threshold * shards`
    pub fn snapshot(&self) -> i64 {
        self.global.load(ORD_RLX)
    }

    /// Drain and read. Still only eventually consistent while writers are
    /// active, exact once they have quiesced
    pub fn total(&self) -> i64 {
        self.sync();
        self.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::ShardedCounter;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn snapshot_lags_until_sync() {
        let ctr = ShardedCounter::new(4, 0, 1000);
        ctr.add(1, 0);
        ctr.add(1, 1);
        // below threshold, so nothing has been folded yet
        assert_eq!(ctr.snapshot(), 0);
        assert_eq!(ctr.total(), 2);
    }

    #[test]
    fn threshold_flushes_without_sync() {
        let ctr = ShardedCounter::new(2, 0, 4);
        for _ in 0..4 {
            ctr.add(1, 0);
        }
        assert_eq!(ctr.snapshot(), 4);
    }

    #[test]
    fn negative_deltas_cancel() {
        let ctr = ShardedCounter::new(3, 0, 8);
        for shard in 0..6 {
            ctr.add(1, shard);
        }
        for shard in 0..6 {
            ctr.add(-1, shard);
        }
        assert_eq!(ctr.total(), 0);
    }

    #[test]
    fn initial_value_is_respected() {
        let ctr = ShardedCounter::new(2, 42, 4);
        assert_eq!(ctr.total(), 42);
    }

    #[test]
    fn concurrent_adds_fold_exactly() {
        const THREADS: usize = 8;
        const PER_THREAD: i64 = 10_000;
        let ctr = Arc::new(ShardedCounter::new(4, 0, 64));
        let handles: Vec<_> = (0..THREADS)
            .map(|tid| {
                let ctr = Arc::clone(&ctr);
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        ctr.add(1, tid);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(ctr.total(), THREADS as i64 * PER_THREAD);
    }
}
