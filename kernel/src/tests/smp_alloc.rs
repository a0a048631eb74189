//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

// 测试：多个 CPU 同时从同一缓存分配

use std::collections::HashSet;
use std::sync::Barrier;
use std::thread;

use crate::mm::slab::Cache;
use crate::testing::{set_cpu, TestMachine};

const PER_THREAD: usize = 500;

fn hammer(cache: &'static Cache, cpu: usize, barrier: &Barrier) -> Vec<usize> {
    set_cpu(cpu);
    barrier.wait();
    (0..PER_THREAD)
        .map(|i| {
            let obj = cache.allocate();
            unsafe { obj.as_ptr().cast::<usize>().write(cpu << 32 | i) };
            obj.as_ptr() as usize
        })
        .collect()
}

#[test]
fn two_cpus_allocate_distinct_objects() {
    let m = TestMachine::new();
    let cache = m.slab.create_cache("smp", 96, 8, None, None);
    let barrier: &'static Barrier = Box::leak(Box::new(Barrier::new(2)));

    let a = thread::spawn(move || hammer(cache, 0, barrier));
    let b = thread::spawn(move || hammer(cache, 1, barrier));
    let a = a.join().unwrap();
    let b = b.join().unwrap();

    let all: HashSet<usize> = a.iter().chain(b.iter()).copied().collect();
    assert_eq!(all.len(), 2 * PER_THREAD);

    // 写入的值没有被另一个线程覆盖
    for (cpu, objs) in [(0usize, &a), (1, &b)] {
        for (i, obj) in objs.iter().enumerate() {
            assert_eq!(unsafe { *(*obj as *const usize) }, cpu << 32 | i);
        }
    }

    let audit = cache.audit();
    assert_eq!(audit.objects_in_use, 2 * PER_THREAD);
    assert_eq!(
        audit.free_objects,
        audit.slabs * cache.objects_per_slab() - 2 * PER_THREAD
    );
}

#[test]
fn concurrent_kmalloc_and_free_balance() {
    let m = TestMachine::new();
    let alloc = m.alloc;

    let handles: Vec<_> = (0..4)
        .map(|cpu| {
            thread::spawn(move || {
                set_cpu(cpu);
                for round in 0..50 {
                    let sizes = [8, 100, 700, 3000, 20_000];
                    let blocks: Vec<_> = sizes
                        .iter()
                        .map(|&size| {
                            let p = alloc.allocate(size + round).unwrap();
                            unsafe { p.as_ptr().write_bytes(cpu as u8, size + round) };
                            (p, size + round)
                        })
                        .collect();
                    for (p, size) in blocks {
                        let bytes = unsafe { core::slice::from_raw_parts(p.as_ptr(), size) };
                        assert!(bytes.iter().all(|b| *b == cpu as u8));
                        alloc.free(p);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(alloc.in_use(), 0);
    for idx in 0..crate::mm::alloc::NCLASSES {
        let cache = alloc.class_cache(idx);
        let audit = cache.audit();
        assert_eq!(audit.objects_in_use, 0);
        assert_eq!(audit.free_objects, audit.slabs * cache.objects_per_slab());
    }
}

#[test]
fn magazines_stay_consistent_across_cpus() {
    let m = TestMachine::new();
    m.slab.enable_magazines();
    let cache = m.slab.create_cache("smp-cached", 128, 16, None, None);
    let barrier: &'static Barrier = Box::leak(Box::new(Barrier::new(4)));

    // 每个 CPU 释放一半给自己，另一半在别的 CPU 上释放
    let handles: Vec<_> = (0..4)
        .map(|cpu| {
            thread::spawn(move || {
                set_cpu(cpu);
                barrier.wait();
                let mut kept = Vec::new();
                for round in 0..20 {
                    let objs: Vec<_> = (0..40).map(|_| cache.allocate()).collect();
                    for (i, obj) in objs.into_iter().enumerate() {
                        if (i + round) % 2 == 0 {
                            cache.free(obj);
                        } else {
                            kept.push(obj.as_ptr() as usize);
                        }
                    }
                }
                kept
            })
        })
        .collect();
    let kept: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let all: HashSet<usize> = kept.iter().flatten().copied().collect();
    assert_eq!(all.len(), 4 * 20 * 20);

    // 交换后在别的 CPU 上释放
    let frees: Vec<_> = kept
        .into_iter()
        .enumerate()
        .map(|(cpu, objs)| {
            thread::spawn(move || {
                set_cpu((cpu + 1) % 4);
                for obj in objs {
                    cache.free(core::ptr::NonNull::new(obj as *mut u8).unwrap());
                }
            })
        })
        .collect();
    for h in frees {
        h.join().unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.objects_in_use, 0);
    assert_eq!(stats.allocs, stats.frees);
    let audit = cache.audit();
    assert_eq!(audit.objects_in_use, audit.cached_objects);

    cache.shrink();
    let audit = cache.audit();
    assert_eq!(audit.objects_in_use, 0);
    assert_eq!(audit.cached_objects, 0);
    assert_eq!(cache.stats().slabs(), 0);
}
