//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 内存管理模块
//!
//! 初始化顺序：PMM -> VMM（含 Range 池）-> slab 分配器 -> 通用分配器。
//! 四者都是只初始化一次、永不销毁的全局实例。SMP 启动后再调用
//! [`post_smp_init`] 打开 per-CPU magazine。

pub mod alloc;
pub mod meminfo;
pub mod page;
pub mod pmm;
pub mod range;
pub mod slab;
pub mod vmm;

use core::ptr::NonNull;

use log::info;
use spin::Once;

use crate::arch::Mmu;

pub use self::alloc::{AllocError, Allocator, KernelHeap};
pub use self::meminfo::MemoryInfo;
pub use self::page::{PhysAddr, VirtAddr, PAGE_SIZE};
pub use self::pmm::{MemoryRegion, Pmm, PmmError, RegionKind, ZONE_DEFAULT};
pub use self::slab::{Cache, SlabAllocator};
pub use self::vmm::{AddressLayout, Context, ValidateFlags, Vmm, VmmError};

static PMM: Once<Pmm> = Once::new();
static VMM: Once<Vmm> = Once::new();
static SLAB: Once<SlabAllocator> = Once::new();
static ALLOCATOR: Once<Allocator> = Once::new();

/// 初始化内存管理（只在启动核上调用一次）
pub fn init(regions: &[MemoryRegion], mmu: &'static dyn Mmu, layout: AddressLayout) {
    if PMM.is_completed() {
        panic!("mm: memory management initialized twice");
    }

    let pmm = PMM.call_once(|| Pmm::new(regions, mmu));
    info!(
        "mm: {} MB managed, {} pages free",
        pmm.memory_size() / (1024 * 1024),
        pmm.free_pages_count()
    );

    let vmm = VMM.call_once(|| Vmm::new(pmm, mmu, layout));
    let slab = SLAB.call_once(|| SlabAllocator::new(vmm));
    ALLOCATOR.call_once(|| Allocator::new(slab, vmm));
    info!("mm: allocators ready");
}

/// 所有 CPU 上线后调用，打开 slab 的 per-CPU magazine 层
pub fn post_smp_init() {
    let slab = slab();
    slab.enable_magazines();
    allocator().enable_magazines(slab);
    info!("mm: per-CPU magazines online");
}

pub fn pmm() -> &'static Pmm {
    match PMM.get() {
        Some(pmm) => pmm,
        None => panic!("mm: PMM used before init"),
    }
}

pub fn vmm() -> &'static Vmm {
    match VMM.get() {
        Some(vmm) => vmm,
        None => panic!("mm: VMM used before init"),
    }
}

pub fn slab() -> &'static SlabAllocator {
    match SLAB.get() {
        Some(slab) => slab,
        None => panic!("mm: slab allocator used before init"),
    }
}

pub fn allocator() -> &'static Allocator {
    match try_allocator() {
        Some(allocator) => allocator,
        None => panic!("mm: allocator used before init"),
    }
}

pub(crate) fn try_allocator() -> Option<&'static Allocator> {
    ALLOCATOR.get()
}

/// 当前内存统计
pub fn memory_info() -> MemoryInfo {
    MemoryInfo::collect(pmm(), vmm(), allocator())
}

/// 分配内核内存
#[track_caller]
pub fn kmalloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    allocator().allocate(size)
}

/// 分配并清零
#[track_caller]
pub fn kzalloc(size: usize) -> Result<NonNull<u8>, AllocError> {
    allocator().zero_allocate(1, size)
}

/// 分配 `nobj` 个 `size` 字节的数组并清零
#[track_caller]
pub fn kcalloc(nobj: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
    allocator().zero_allocate(nobj, size)
}

/// 重新分配，`ptr` 为空时等同于 `kmalloc`
#[track_caller]
pub fn krealloc(ptr: Option<NonNull<u8>>, size: usize) -> Result<NonNull<u8>, AllocError> {
    match ptr {
        Some(ptr) => allocator().reallocate(ptr, size),
        None => allocator().allocate(size),
    }
}

/// 释放内核内存
#[track_caller]
pub fn kfree(ptr: NonNull<u8>) {
    allocator().free(ptr)
}
