//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 通用内核分配器 (kmalloc)
//!
//! 14 个按 2 的幂递增的大小等级（16 B 到 128 KB），每个等级对应一个
//! slab 缓存。每次分配前面都有一个 [`AllocHeader`]，记录块状态、所属
//! 等级和请求大小。超过最大等级的请求直接向 VMM 映射。
//!
//! ```text
//! +-------------+--------------------+
//! | AllocHeader | 用户数据 ...       |
//! +-------------+--------------------+
//! ^ 缓存对象 / 映射起点
//!               ^ 返回给调用者（16 字节对齐）
//! ```

use core::alloc::{GlobalAlloc, Layout};
use core::fmt;
use core::mem::size_of;
use core::panic::Location;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use log::{debug, error, info};
use thiserror::Error;

use super::page::{page_align_up, VirtAddr};
use super::range::VmFlags;
use super::slab::{Cache, CacheStats, SlabAllocator};
use super::vmm::Vmm;
use crate::arch::MmuFlags;
use crate::config;
use crate::errno::Errno;
use crate::sched;

/// 大小等级数
pub const NCLASSES: usize = 14;

/// 最小等级
pub const MIN_CLASS: usize = 16;

/// 最大等级，超过后直接映射
pub const MAX_CLASS: usize = MIN_CLASS << (NCLASSES - 1);

/// 返回指针的对齐
pub const ALLOC_ALIGN: usize = 16;

pub const HEADER_SIZE: usize = size_of::<AllocHeader>();

const CLASS_NAMES: [&str; NCLASSES] = [
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1k",
    "kmalloc-2k",
    "kmalloc-4k",
    "kmalloc-8k",
    "kmalloc-16k",
    "kmalloc-32k",
    "kmalloc-64k",
    "kmalloc-128k",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("allocation size overflows")]
    Overflow,
}

impl AllocError {
    pub fn errno(&self) -> Errno {
        match self {
            AllocError::ZeroSize => Errno::InvalidArgument,
            AllocError::Overflow => Errno::OutOfMemory,
        }
    }
}

/// 块状态
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockState {
    Live = 0xCAFE_BABE,
    Freed = 0xC0FF_EE11,
}

impl TryFrom<u32> for BlockState {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            v if v == BlockState::Live as u32 => Ok(BlockState::Live),
            v if v == BlockState::Freed as u32 => Ok(BlockState::Freed),
            v => Err(v),
        }
    }
}

/// 分配头部
///
/// 块释放后 slab 会在对象开头写入空闲链表索引，所以 `state`
/// 不放在第一个字段。
#[repr(C, align(16))]
struct AllocHeader {
    /// 所属等级大小，直接映射时为映射长度
    cache_size: usize,
    state: u32,
    /// 请求大小
    alloc_size: usize,
    caller: Option<&'static Location<'static>>,
}

const _: () = assert!(HEADER_SIZE == 32 && HEADER_SIZE % ALLOC_ALIGN == 0);

/// 分配器统计
#[derive(Debug, Clone, Copy)]
pub struct AllocStats {
    pub bytes_in_use: usize,
    pub direct_mappings: usize,
    pub classes: [CacheStats; NCLASSES],
}

impl fmt::Display for AllocStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "alloc: {} bytes in use, {} direct mappings",
            self.bytes_in_use, self.direct_mappings
        )?;
        for class in self.classes.iter().filter(|c| c.allocs > 0) {
            writeln!(f, "  {}", class)?;
        }
        Ok(())
    }
}

/// 满足 `total` 字节（含头部）的最小等级
fn class_index(total: usize) -> Option<usize> {
    if total > MAX_CLASS {
        return None;
    }
    let class = total.max(MIN_CLASS).next_power_of_two();
    Some((class / MIN_CLASS).trailing_zeros() as usize)
}

/// 通用分配器
pub struct Allocator {
    caches: [&'static Cache; NCLASSES],
    vmm: &'static Vmm,
    in_use: AtomicUsize,
    direct: AtomicUsize,
}

impl Allocator {
    pub fn new(slab: &SlabAllocator, vmm: &'static Vmm) -> Self {
        let caches = core::array::from_fn(|i| {
            slab.create_cache(CLASS_NAMES[i], MIN_CLASS << i, ALLOC_ALIGN, None, None)
        });
        debug!("alloc: {} size classes, {} to {} bytes", NCLASSES, MIN_CLASS, MAX_CLASS);
        Self {
            caches,
            vmm,
            in_use: AtomicUsize::new(0),
            direct: AtomicUsize::new(0),
        }
    }

    #[track_caller]
    fn check_not_sleeping(&self) {
        if sched::current().current_thread_sleeping() {
            panic!(
                "mm: allocator called from a sleeping thread at {}",
                Location::caller()
            );
        }
    }

    /// 分配 `size` 字节，返回 16 字节对齐的指针
    #[track_caller]
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        self.check_not_sleeping();

        let total = size.checked_add(HEADER_SIZE).ok_or(AllocError::Overflow)?;
        let (block, cache_size) = match class_index(total) {
            Some(idx) => (self.caches[idx].allocate(), MIN_CLASS << idx),
            None => (self.map_direct(total), page_align_up(total)),
        };

        let header = block.cast::<AllocHeader>();
        // SAFETY: block 至少有 HEADER_SIZE 字节且按 16 字节对齐
        unsafe {
            ptr::write(
                header.as_ptr(),
                AllocHeader {
                    cache_size,
                    state: BlockState::Live as u32,
                    alloc_size: size,
                    caller: if config::ALLOC_TRACKING {
                        Some(Location::caller())
                    } else {
                        None
                    },
                },
            );
        }
        self.in_use.fetch_add(size, Ordering::Relaxed);

        // SAFETY: 用户数据紧跟在头部之后
        Ok(unsafe { NonNull::new_unchecked(block.as_ptr().add(HEADER_SIZE)) })
    }

    fn map_direct(&self, total: usize) -> NonNull<u8> {
        let size = page_align_up(total);
        let virt = match self.vmm.map(
            self.vmm.kernel_base(),
            size,
            VmFlags::ALLOC,
            MmuFlags::PRESENT | MmuFlags::WRITE,
        ) {
            Ok(virt) => virt,
            Err(e) => {
                error!("alloc: {}", self.stats());
                panic!("mm: out of memory mapping {} bytes: {}", size, e);
            }
        };
        self.direct.fetch_add(1, Ordering::Relaxed);
        debug!("alloc: direct mapping of {} bytes at {}", size, virt);
        match NonNull::new(virt.as_mut_ptr::<u8>()) {
            Some(block) => block,
            None => panic!("mm: VMM returned a null mapping"),
        }
    }

    /// 读取并检查头部
    #[track_caller]
    fn header(&self, ptr: NonNull<u8>) -> NonNull<AllocHeader> {
        if ptr.as_ptr() as usize % ALLOC_ALIGN != 0 {
            panic!("mm: {:p} was not returned by the allocator", ptr);
        }
        // SAFETY: 分配器返回的指针前面总有一个头部
        let header =
            unsafe { NonNull::new_unchecked(ptr.as_ptr().sub(HEADER_SIZE)) }.cast::<AllocHeader>();
        let state = unsafe { (*header.as_ptr()).state };
        match BlockState::try_from(state) {
            Ok(BlockState::Live) => header,
            Ok(BlockState::Freed) => {
                panic!("mm: double free of {:p} at {}", ptr, Location::caller())
            }
            Err(bad) => panic!(
                "mm: corrupted allocation header at {:p} (state {:#x}) at {}",
                header,
                bad,
                Location::caller()
            ),
        }
    }

    /// 释放块
    #[track_caller]
    pub fn free(&self, ptr: NonNull<u8>) {
        self.check_not_sleeping();

        let header = self.header(ptr);
        // SAFETY: header 通过了状态检查
        let (cache_size, alloc_size) = unsafe {
            let h = header.as_ptr();
            (*h).state = BlockState::Freed as u32;
            ((*h).cache_size, (*h).alloc_size)
        };
        self.in_use.fetch_sub(alloc_size, Ordering::Relaxed);

        if cache_size > MAX_CLASS {
            let base = VirtAddr::from_ptr(header.as_ptr());
            if let Err(e) = self.vmm.unmap(base, cache_size) {
                panic!("mm: cannot unmap direct allocation at {}: {}", base, e);
            }
            self.direct.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        match class_index(cache_size) {
            Some(idx) if MIN_CLASS << idx == cache_size => self.caches[idx].free(header.cast()),
            _ => panic!(
                "mm: corrupted allocation header at {:p} (class {})",
                header, cache_size
            ),
        }
    }

    /// 块的请求大小
    #[track_caller]
    pub fn size_of(&self, ptr: NonNull<u8>) -> usize {
        unsafe { (*self.header(ptr).as_ptr()).alloc_size }
    }

    /// 分配块的调用位置（仅在 `alloc_tracking` 打开时记录）
    #[track_caller]
    pub fn caller_of(&self, ptr: NonNull<u8>) -> Option<&'static Location<'static>> {
        unsafe { (*self.header(ptr).as_ptr()).caller }
    }

    /// 重新分配：新分配、复制、释放旧块
    #[track_caller]
    pub fn reallocate(&self, ptr: NonNull<u8>, size: usize) -> Result<NonNull<u8>, AllocError> {
        let old = self.size_of(ptr);
        let new = self.allocate(size)?;
        // SAFETY: 两个块互不重叠，各自至少有复制的字节数
        unsafe { ptr::copy_nonoverlapping(ptr.as_ptr(), new.as_ptr(), old.min(size)) };
        self.free(ptr);
        Ok(new)
    }

    /// 分配 `nobj * size` 字节并清零
    #[track_caller]
    pub fn zero_allocate(&self, nobj: usize, size: usize) -> Result<NonNull<u8>, AllocError> {
        let total = nobj.checked_mul(size).ok_or(AllocError::Overflow)?;
        let ptr = self.allocate(total)?;
        unsafe { ptr::write_bytes(ptr.as_ptr(), 0, total) };
        Ok(ptr)
    }

    /// 当前使用中的字节数
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn class_cache(&self, idx: usize) -> &'static Cache {
        self.caches[idx]
    }

    /// 让所有大小等级的缓存使用 per-CPU magazine
    pub fn enable_magazines(&self, slab: &SlabAllocator) {
        for cache in self.caches {
            slab.reinitialize_cache(cache);
        }
        info!("alloc: size classes use per-CPU magazines");
    }

    pub fn stats(&self) -> AllocStats {
        AllocStats {
            bytes_in_use: self.in_use(),
            direct_mappings: self.direct.load(Ordering::Relaxed),
            classes: core::array::from_fn(|i| self.caches[i].stats()),
        }
    }

    pub fn dump(&self) {
        info!("{}", self.stats());
    }
}

unsafe impl GlobalAlloc for Allocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALLOC_ALIGN {
            return ptr::null_mut();
        }
        match self.allocate(layout.size().max(1)) {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.free(ptr);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(old) = NonNull::new(ptr) else {
            return ptr::null_mut();
        };
        if layout.align() > ALLOC_ALIGN {
            return ptr::null_mut();
        }
        match self.reallocate(old, new_size.max(1)) {
            Ok(new) => new.as_ptr(),
            Err(_) => ptr::null_mut(),
        }
    }
}

/// 使用全局分配器实例的 `#[global_allocator]` 适配器
///
/// 初始化之前的分配返回空指针。
pub struct KernelHeap;

unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        match super::try_allocator() {
            Some(allocator) => allocator.alloc(layout),
            None => ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(allocator) = super::try_allocator() {
            allocator.dealloc(ptr, layout);
        }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        match super::try_allocator() {
            Some(allocator) => allocator.realloc(ptr, layout, new_size),
            None => ptr::null_mut(),
        }
    }
}
