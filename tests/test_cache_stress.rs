// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Multi-threaded concurrency tests against one shared `ShmCache`, in the
// style of `test_rw_lock.rs`: spawn several threads hammering the same
// region and check the invariants that must hold regardless of
// interleaving, rather than any particular outcome.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use rand::Rng;
use shmcache::{CacheConfig, OpenMode, ShmCache, ShmHandle};

fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    format!(
        "shmcache_test_stress_{tag}_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    )
}

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

fn open_shared(tag: &str) -> Arc<ShmCache> {
    init_tracing();
    let name = unique_name(tag);
    ShmHandle::unlink_by_name(&name);
    let cfg = CacheConfig::new(&name).with_mode(OpenMode::CreateOrAttach);
    Arc::new(ShmCache::open(&cfg).expect("open cache"))
}

#[test]
fn concurrent_sets_on_disjoint_keys_all_land() {
    let cache = open_shared("disjoint");
    let threads = 8;
    let per_thread = 200;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let key = format!("t{t}-k{i}");
                    cache.set(key.as_bytes(), b"value").unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    for t in 0..threads {
        for i in 0..per_thread {
            let key = format!("t{t}-k{i}");
            assert_eq!(cache.get(key.as_bytes()), Some(b"value".to_vec()));
        }
    }

    // Single owner left: safe to destroy.
    Arc::try_unwrap(cache).ok().unwrap().destroy();
}

#[test]
fn concurrent_set_get_delete_on_shared_keys_never_panics_or_corrupts() {
    let cache = open_shared("shared_keys");
    let keys: Vec<String> = (0..16).map(|i| format!("shared-{i}")).collect();
    for k in &keys {
        cache.set(k.as_bytes(), b"seed").unwrap();
    }

    let threads = 6;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let keys = keys.clone();
            thread::spawn(move || {
                for round in 0..300 {
                    let key = &keys[(round + t) % keys.len()];
                    match round % 3 {
                        0 => {
                            cache.set(key.as_bytes(), b"updated").unwrap();
                        }
                        1 => {
                            if let Some(v) = cache.get(key.as_bytes()) {
                                assert!(v == b"seed" || v == b"updated");
                            }
                        }
                        _ => {
                            cache.delete(key.as_bytes());
                        }
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // No crash, no torn reads observed above is the assertion; re-seed and
    // confirm the region is still structurally usable afterward.
    for k in &keys {
        cache.set(k.as_bytes(), b"final").unwrap();
        assert_eq!(cache.get(k.as_bytes()), Some(b"final".to_vec()));
    }

    Arc::try_unwrap(cache).ok().unwrap().destroy();
}

#[test]
fn concurrent_increment_accounts_for_every_caller() {
    let cache = open_shared("increment");
    let threads = 10;
    let per_thread = 500u64;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let cache = Arc::clone(&cache);
            thread::spawn(move || {
                for _ in 0..per_thread {
                    cache.increment(b"counter", 1, 0).unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    let final_value = cache.get(b"counter").unwrap();
    let final_value: u64 = std::str::from_utf8(&final_value).unwrap().parse().unwrap();
    assert_eq!(final_value, threads as u64 * per_thread);

    Arc::try_unwrap(cache).ok().unwrap().destroy();
}

#[test]
fn randomized_concurrent_operations_keep_cache_consistent() {
    let cache = open_shared("randomized");
    let keys: Vec<String> = (0..32).map(|i| format!("rand-{i}")).collect();

    let threads = 6;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let keys = keys.clone();
            thread::spawn(move || {
                let mut rng = rand::thread_rng();
                for _ in 0..400 {
                    let key = &keys[rng.gen_range(0..keys.len())];
                    match rng.gen_range(0..5) {
                        0 => {
                            let value = format!("t{t}-{}", rng.gen::<u32>());
                            cache.set(key.as_bytes(), value.as_bytes()).unwrap();
                        }
                        1 => {
                            cache.get(key.as_bytes());
                        }
                        2 => {
                            cache.delete(key.as_bytes());
                        }
                        3 => {
                            let _ = cache.add(key.as_bytes(), b"added");
                        }
                        _ => {
                            let _ = cache.increment(key.as_bytes(), 1, 0);
                        }
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    // The region must still be structurally usable after an arbitrary
    // interleaving of every operation kind on a small, heavily shared key
    // set — this is what makes the property "random ops never corrupt the
    // region" meaningful rather than just "sequential ops work".
    for k in &keys {
        cache.set(k.as_bytes(), b"settled").unwrap();
        assert_eq!(cache.get(k.as_bytes()), Some(b"settled".to_vec()));
    }

    Arc::try_unwrap(cache).ok().unwrap().destroy();
}

#[test]
fn eviction_under_pressure_keeps_index_consistent() {
    let cache_name = unique_name("eviction");
    ShmHandle::unlink_by_name(&cache_name);
    let cfg = CacheConfig::new(&cache_name)
        .with_size(shmcache::config::MIN_REGION_SIZE)
        .with_mode(OpenMode::CreateOrAttach);
    let cache = Arc::new(ShmCache::open(&cfg).expect("open cache"));

    let threads = 4;
    let value = vec![0xAB_u8; 4096];
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let cache = Arc::clone(&cache);
            let value = value.clone();
            thread::spawn(move || {
                for i in 0..200 {
                    let key = format!("evict-t{t}-{i}");
                    cache.set(key.as_bytes(), &value).unwrap();
                    // Every key we can still see must return exactly what
                    // we wrote for it, even with others evicting around us.
                    if let Some(v) = cache.get(key.as_bytes()) {
                        assert_eq!(v, value);
                    }
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }

    Arc::try_unwrap(cache).ok().unwrap().destroy();
}
