//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

// 测试：全局初始化和 kmalloc 系列接口
//
// 全局实例每个进程只能初始化一次，所以所有用到它们的检查都在这一个测试里。

use crate::mm::{self, alloc::HEADER_SIZE, MemoryRegion, RegionKind, PAGE_SIZE};
use crate::mm::page::page_align_up;
use crate::testing::{install_scheduler, SimMmu, PHYS_BASE};

const RAM: usize = 16 * 1024 * 1024;
const HOLE: usize = 64 * 1024;

#[test]
fn global_heap_lifecycle() {
    install_scheduler();
    let mmu = SimMmu::leak(RAM);
    mm::init(
        &[
            MemoryRegion::new(PHYS_BASE, PHYS_BASE + RAM / 2, RegionKind::Available),
            MemoryRegion::new(
                PHYS_BASE + RAM / 2,
                PHYS_BASE + RAM / 2 + HOLE,
                RegionKind::Reserved,
            ),
            MemoryRegion::new(PHYS_BASE + RAM / 2 + HOLE, PHYS_BASE + RAM, RegionKind::Available),
        ],
        mmu,
        mmu.layout(),
    );
    assert_eq!(mm::pmm().section_count(), 2);

    // kmalloc / kfree
    let before = mm::allocator().in_use();
    let p = mm::kmalloc(48).unwrap();
    assert_eq!(mm::allocator().in_use(), before + 48);
    mm::kfree(p);
    assert_eq!(mm::allocator().in_use(), before);

    // 超过最大等级的请求走直接映射
    let space = mm::vmm().kernel_context().space();
    let mapped = space.mapped_bytes();
    let big = mm::kmalloc(200_000).unwrap();
    assert_eq!(space.mapped_bytes(), mapped + page_align_up(200_000 + HEADER_SIZE));
    assert_eq!(space.mapped_bytes() - mapped, 49 * PAGE_SIZE);

    // krealloc 从大块缩到小块，保留前缀
    unsafe { big.as_ptr().write_bytes(0x3C, 64) };
    let small = mm::krealloc(Some(big), 64).unwrap();
    assert_eq!(space.mapped_bytes(), mapped);
    assert!(unsafe { core::slice::from_raw_parts(small.as_ptr(), 64) }
        .iter()
        .all(|b| *b == 0x3C));
    mm::kfree(small);

    let fresh = mm::krealloc(None, 16).unwrap();
    mm::kfree(fresh);

    // kzalloc / kcalloc
    let z = mm::kzalloc(300).unwrap();
    assert!(unsafe { core::slice::from_raw_parts(z.as_ptr(), 300) }
        .iter()
        .all(|b| *b == 0));
    mm::kfree(z);
    let c = mm::kcalloc(10, 24).unwrap();
    assert!(unsafe { core::slice::from_raw_parts(c.as_ptr(), 240) }
        .iter()
        .all(|b| *b == 0));
    mm::kfree(c);
    assert!(mm::kcalloc(usize::MAX, 8).is_err());

    // 全局分配器适配器
    let heap = mm::KernelHeap;
    unsafe {
        use core::alloc::{GlobalAlloc, Layout};
        let layout = Layout::from_size_align(128, 8).unwrap();
        let p = heap.alloc(layout);
        assert!(!p.is_null());
        heap.dealloc(p, layout);
    }

    // SMP 启动后 kfree 的块先停在 magazine 中
    mm::post_smp_init();
    let q = mm::kmalloc(48).unwrap();
    mm::kfree(q);
    assert_eq!(mm::kmalloc(48).unwrap(), q);
    mm::kfree(q);
    assert!(mm::memory_info().slab_cached >= 1);

    let info = mm::memory_info();
    assert_eq!(info.heap_used, before);
    assert!(info.mem_total > 0 && info.mem_free < info.mem_total);
    mm::pmm().dump();
    mm::allocator().dump();
}

