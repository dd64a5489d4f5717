/*
 * Created on Sat Mar 23 2024
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

use crate::imp;
use crate::Skyberg;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::{self, JoinHandle};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// the fingerprint scans

#[test]
fn scan_finds_every_needle_position() {
    #[repr(align(64))]
    struct Stripe([u8; 64]);
    let mut stripe = Stripe([0; 64]);
    stripe.0[0] = 0xaa;
    stripe.0[17] = 0xaa;
    stripe.0[63] = 0xaa;
    stripe.0[30] = 0x55;
    let hits = unsafe { imp::slot_mask_64(stripe.0.as_ptr(), 0xaa) };
    let hits: Vec<usize> = hits.into_iter().collect();
    assert_eq!(hits, vec![0, 17, 63]);
}

#[test]
fn scan_for_empties_sees_everything_on_a_blank_stripe() {
    #[repr(align(32))]
    struct Stripe([u8; 32]);
    let stripe = Stripe([0; 32]);
    let hits = unsafe { imp::slot_mask_32(stripe.0.as_ptr(), 0) };
    assert_eq!(hits.set_count(), 32);
}

// single threaded scenarios

#[test]
fn insert_get_remove_roundtrip() {
    init_logging();
    let table = Skyberg::new(10);
    assert!(table.insert(7, 100, 0));
    assert_eq!(table.get(7), Some(100));
    assert!(table.remove(7, 0));
    assert_eq!(table.get(7), None);
    // removing again is a miss
    assert!(!table.remove(7, 0));
    table.check_invariants();
}

#[test]
fn get_and_remove_miss_on_an_empty_table() {
    let table = Skyberg::new(10);
    assert_eq!(table.get(0), None);
    assert!(!table.remove(123456, 0));
    assert_eq!(table.tot_balls(), 0);
}

#[test]
fn dense_fill_is_fully_retrievable() {
    // 900 balls into 1024 primary slots: most land in the primary tier, the
    // rest spread over the secondary
    let table = Skyberg::new(10);
    for key in 0..900u64 {
        assert!(table.insert(key, key.wrapping_mul(3), 0));
    }
    for key in 0..900u64 {
        assert_eq!(table.get(key), Some(key.wrapping_mul(3)), "lost key {key}");
    }
    assert_eq!(
        table.lv1_balls() + table.lv2_balls() + table.lv3_balls(),
        900
    );
    assert!(table.load_factor() > 0.7);
    table.check_invariants();
}

#[test]
fn duplicates_are_separate_balls() {
    let table = Skyberg::new(10);
    assert!(table.insert(42, 1, 0));
    assert!(table.insert(42, 2, 0));
    assert_eq!(table.tot_balls(), 2);
    let first = table.get(42).unwrap();
    assert!(first == 1 || first == 2);
    assert!(table.remove(42, 0));
    // one ball left; whichever it is, it answers now
    let second = table.get(42).unwrap();
    assert!(second == 1 || second == 2);
    assert!(table.remove(42, 0));
    assert_eq!(table.get(42), None);
    table.check_invariants();
}

#[test]
fn saturation_spills_into_the_overflow_lists() {
    init_logging();
    // a single-block table: 64 primary slots, 10 secondary slots, everything
    // past that has nowhere to go but the list
    let table = Skyberg::new(6);
    const BALLS: u64 = 200;
    for key in 0..BALLS {
        assert!(table.insert(key, !key, 0));
    }
    for key in 0..BALLS {
        assert_eq!(table.get(key), Some(!key), "lost key {key}");
    }
    assert_eq!(table.tot_balls(), BALLS);
    let overflow = table.lv3_balls();
    assert!(overflow >= BALLS - 74, "overflow tier suspiciously empty");
    assert_eq!(table.lv3_size_sum(), overflow);
    // capacity follows the overflow tier as it grows
    assert_eq!(table.capacity(), overflow + 74);
    table.check_invariants();
}

#[test]
fn churn_returns_to_steady_occupancy() {
    let table = Skyberg::new(11);
    for key in 0..1000u64 {
        table.insert(key, key + 1, 0);
    }
    for key in 0..500u64 {
        assert!(table.remove(key, 0));
    }
    for key in 1000..1500u64 {
        table.insert(key, key + 1, 0);
    }
    assert_eq!(table.tot_balls(), 1000);
    for key in 0..500u64 {
        assert_eq!(table.get(key), None);
    }
    for key in 500..1500u64 {
        assert_eq!(table.get(key), Some(key + 1), "lost key {key}");
    }
    table.check_invariants();
}

#[test]
fn randomized_ops_against_a_mirror() {
    // every ball for a key carries the same value, so a multiset of counts
    // fully describes what any probe is allowed to answer
    fn val_of(key: u64) -> u64 {
        key ^ 0xabcd_ef01_2345_6789
    }
    let table = Skyberg::new(8);
    let mut mirror: HashMap<u64, usize> = HashMap::new();
    let mut rng = rand::thread_rng();
    for _ in 0..10_000 {
        let key = rng.gen_range(0..256u64);
        match rng.gen_range(0..3) {
            0 => {
                assert!(table.insert(key, val_of(key), 0));
                *mirror.entry(key).or_insert(0) += 1;
            }
            1 => {
                let live = mirror.get(&key).copied().unwrap_or(0) > 0;
                assert_eq!(table.remove(key, 0), live);
                if live {
                    *mirror.get_mut(&key).unwrap() -= 1;
                }
            }
            _ => {
                let live = mirror.get(&key).copied().unwrap_or(0) > 0;
                let expected = if live { Some(val_of(key)) } else { None };
                assert_eq!(table.get(key), expected);
            }
        }
    }
    let live_balls: usize = mirror.values().sum();
    assert_eq!(table.tot_balls(), live_balls as u64);
    table.check_invariants();
}

// concurrent scenarios

const SPAM_THREADS: usize = 8;
const SPAM_KEYS_PER_THREAD: u64 = 8192;

#[test]
fn multispam_disjoint_inserts() {
    init_logging();
    let table = Arc::new(Skyberg::new(17));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write().unwrap();
    let threads: Vec<JoinHandle<_>> = (0..SPAM_THREADS)
        .map(|tid| {
            let this_token = token.clone();
            let this_table = table.clone();
            thread::Builder::new()
                .name(tid.to_string())
                .spawn(move || {
                    let _token = this_token.read().unwrap();
                    let base = tid as u64 * SPAM_KEYS_PER_THREAD;
                    for key in base..base + SPAM_KEYS_PER_THREAD {
                        assert!(this_table.insert(key, key << 1, tid));
                    }
                })
                .unwrap()
        })
        .collect();
    // rush everyone to insert; superb intercore traffic
    drop(hold);
    for handle in threads {
        handle.join().unwrap();
    }
    let total = SPAM_THREADS as u64 * SPAM_KEYS_PER_THREAD;
    assert_eq!(table.tot_balls(), total);
    for key in 0..total {
        assert_eq!(table.get(key), Some(key << 1), "lost key {key}");
    }
    table.check_invariants();
}

#[test]
fn multispam_full_lifecycle_drains_clean() {
    let table = Arc::new(Skyberg::new(14));
    let token = Arc::new(RwLock::new(()));
    let hold = token.write().unwrap();
    let threads: Vec<JoinHandle<_>> = (0..4usize)
        .map(|tid| {
            let this_token = token.clone();
            let this_table = table.clone();
            thread::spawn(move || {
                let _token = this_token.read().unwrap();
                let base = tid as u64 * 4096;
                for key in base..base + 4096 {
                    assert!(this_table.insert(key, key, tid));
                }
                for key in base..base + 4096 {
                    assert_eq!(this_table.get(key), Some(key));
                }
                for key in base..base + 4096 {
                    assert!(this_table.remove(key, tid));
                }
            })
        })
        .collect();
    drop(hold);
    for handle in threads {
        handle.join().unwrap();
    }
    assert_eq!(table.tot_balls(), 0);
    assert_eq!(table.lv3_size_sum(), 0);
    table.check_invariants();
}

#[test]
fn readers_see_pre_or_post_state_under_conflict() {
    const KEY: u64 = 0xdead_beef;
    const VAL: u64 = 77;
    let table = Arc::new(Skyberg::new(12));
    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<JoinHandle<_>> = (0..2)
        .map(|_| {
            let this_table = table.clone();
            let this_stop = stop.clone();
            thread::spawn(move || {
                while !this_stop.load(Ordering::Relaxed) {
                    // under a racing insert/remove of the same key the only
                    // legal answers are the committed value or a miss
                    match this_table.get(KEY) {
                        Some(val) => assert_eq!(val, VAL),
                        None => {}
                    }
                }
            })
        })
        .collect();
    for _ in 0..10_000 {
        assert!(table.insert(KEY, VAL, 0));
        assert!(table.remove(KEY, 1));
    }
    stop.store(true, Ordering::Relaxed);
    for handle in readers {
        handle.join().unwrap();
    }
    assert_eq!(table.get(KEY), None);
    table.check_invariants();
}

// shape and reporting

#[test]
#[should_panic(expected = "one block")]
fn undersized_table_panics() {
    let _ = Skyberg::new(5);
}

#[test]
fn shape_accessors() {
    let table = Skyberg::new(12);
    assert_eq!(table.nslots(), 4096);
    assert_eq!(table.nblocks(), 64);
    // 64 primary + 10 secondary slots per block, nothing in overflow yet
    assert_eq!(table.capacity(), 64 * 74);
    assert!(table.heap_size() > 0);
    assert_eq!(table.load_factor(), 0.0);
    let shown = format!("{table:?}");
    assert!(shown.contains("nblocks"));
}
