//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! Slab 分配器
//!
//! 用于固定大小对象的高效分配。
//!
//! 参考：
//! - https://www.kernel.org/doc/html/latest/core-api/memory-allocation.html
//! - Bonwick & Adams, "Magazines and Vmem" (USENIX 2001)
//!
//! # 设计
//! - Cache: 管理特定大小、对齐的对象，持有 free / partial / full 三个 slab 链表
//! - Slab: 从 VMM 映射的一段页对齐内存，开头是 slab 头，之后是对象数组
//! - 空闲对象内部存放下一个空闲对象的索引（`u32`），分配和释放都是 O(1)
//! - slab 头里有一张在用位图，每个对象一位，用来发现重复释放
//! - 启用 magazine 后，每个 CPU 先在自己的 loaded / previous 两个
//!   magazine 中分配和释放，空了或满了再与 Cache 的 depot 交换整个 magazine
//!
//! # 布局
//! ```text
//! slab 基址（页对齐）
//! +------------+---------+---------+-----+
//! | Slab 头    | 对象 0  | 对象 1  | ... |
//! +------------+---------+---------+-----+
//! ```
//! 所有对象都从 slab 的第一页开始，因此对象地址向下按页对齐就是 slab 头。
//!
//! Cache 对象本身也由一个内嵌的引导 Cache 分配。
//!
//! # 锁顺序
//! CPU 槽位锁 → depot 锁。两者都是忙等锁，持有期间不获取 Cache 的睡眠锁。

use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use log::{debug, error, info, trace};
use spin::Once;

use super::page::{align_up, page_align_up, VirtAddr, PAGE_MASK, PAGE_SIZE};
use super::range::VmFlags;
use super::vmm::Vmm;
use crate::arch::MmuFlags;
use crate::config::{MAX_CPUS, SLAB_MAX_FREE};
use crate::list::{Linked, Links, List};
use crate::sched;
use crate::sync::{Mutex, SpinLock};

/// 对象构造 / 析构回调
pub type ObjectHook = fn(&Cache, NonNull<u8>);

/// 每个 magazine 能缓存的对象数
pub const MAGAZINE_SIZE: usize = 32;

/// 空闲链表结束标记
const FREE_END: u32 = u32::MAX;

/// 在用位图的字数
const LIVE_WORDS: usize = 16;

/// Slab 状态，对应所在的链表
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlabState {
    /// 完全空闲
    Free,
    /// 部分使用
    Partial,
    /// 完全使用
    Full,
}

/// Slab 头部（存储在每个 slab 的开头）
#[repr(C)]
struct Slab {
    links: Links<Slab>,
    state: SlabState,
    /// 第一个空闲对象的索引
    free_head: u32,
    /// 空闲对象数
    free_cnt: u32,
    /// 已交给使用者的对象，位于 magazine 中的对象不算
    live: [AtomicU64; LIVE_WORDS],
}

unsafe impl Linked for Slab {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

impl Slab {
    fn live_count(&self) -> usize {
        self.live
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as usize)
            .sum()
    }
}

const SLAB_HEADER_SIZE: usize = size_of::<Slab>();

// 最小的对象（4 字节）也要在位图里有自己的一位
const _: () = assert!((PAGE_SIZE - SLAB_HEADER_SIZE) / size_of::<u32>() <= LIVE_WORDS * 64);

/// Cache 锁保护的状态
struct CacheLists {
    free: List<Slab>,
    partial: List<Slab>,
    full: List<Slab>,
    /// 从 slab 取出的对象数，包括 magazine 中的
    in_use: usize,
    mem_usage: usize,
}

impl CacheLists {
    fn list_mut(&mut self, state: SlabState) -> &mut List<Slab> {
        match state {
            SlabState::Free => &mut self.free,
            SlabState::Partial => &mut self.partial,
            SlabState::Full => &mut self.full,
        }
    }

    /// 把 slab 移到与新状态对应的链表
    ///
    /// # Safety
    ///
    /// `slab` 在与其当前状态对应的链表中。
    unsafe fn transition(&mut self, slab: NonNull<Slab>, to: SlabState) {
        let s = slab.as_ptr();
        let from = (*s).state;
        if from == to {
            return;
        }
        self.list_mut(from).remove(slab);
        self.list_mut(to).push_front(slab);
        (*s).state = to;
    }
}

/// 一组缓存的空闲对象，本身是 magazine 缓存的对象
#[repr(C)]
struct Magazine {
    links: Links<Magazine>,
    rounds: usize,
    slots: [Option<NonNull<u8>>; MAGAZINE_SIZE],
}

unsafe impl Linked for Magazine {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

impl Magazine {
    fn new() -> Self {
        Self {
            links: Links::new(),
            rounds: 0,
            slots: [None; MAGAZINE_SIZE],
        }
    }
}

/// # Safety
///
/// 调用者独占 `mag`（持有它所在 CPU 槽位的锁，或已把它从槽位和 depot 中取出）。
unsafe fn rounds(mag: NonNull<Magazine>) -> usize {
    (*mag.as_ptr()).rounds
}

/// # Safety
///
/// 同 [`rounds`]，且 magazine 未满。
unsafe fn push_round(mag: NonNull<Magazine>, obj: NonNull<u8>) {
    let m = mag.as_ptr();
    (*m).slots[(*m).rounds] = Some(obj);
    (*m).rounds += 1;
}

/// # Safety
///
/// 同 [`rounds`]。
unsafe fn pop_round(mag: NonNull<Magazine>) -> Option<NonNull<u8>> {
    let m = mag.as_ptr();
    if (*m).rounds == 0 {
        return None;
    }
    (*m).rounds -= 1;
    (*m).slots[(*m).rounds].take()
}

/// 一个 CPU 的两个 magazine
struct CpuMagazines {
    loaded: Option<NonNull<Magazine>>,
    previous: Option<NonNull<Magazine>>,
}

// SAFETY: magazine 只在槽位锁内访问
unsafe impl Send for CpuMagazines {}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub name: &'static str,
    pub object_size: usize,
    pub real_size: usize,
    pub slab_size: usize,
    pub objects_per_slab: usize,
    pub free_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    /// 使用者持有的对象
    pub objects_in_use: usize,
    /// 停在 magazine 中的对象
    pub cached_objects: usize,
    pub mem_usage: usize,
    pub allocs: usize,
    pub frees: usize,
}

impl CacheStats {
    pub fn slabs(&self) -> usize {
        self.free_slabs + self.partial_slabs + self.full_slabs
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} B objects, {} per slab, {}/{}/{} free/partial/full slabs, \
             {} in use, {} cached, {} kB",
            self.name,
            self.object_size,
            self.objects_per_slab,
            self.free_slabs,
            self.partial_slabs,
            self.full_slabs,
            self.objects_in_use,
            self.cached_objects,
            self.mem_usage / 1024
        )
    }
}

/// 遍历所有 slab 得到的计数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheAudit {
    pub slabs: usize,
    pub free_objects: usize,
    /// 从 slab 取出的对象数，包括 magazine 中的
    pub objects_in_use: usize,
    pub cached_objects: usize,
}

/// Slab 缓存
pub struct Cache {
    name: &'static str,
    /// 请求的对象大小
    object_size: usize,
    alignment: usize,
    /// 对齐后的实际对象大小
    real_size: usize,
    /// 第一个对象相对 slab 基址的偏移
    object_offset: usize,
    slab_size: usize,
    objects_per_slab: usize,
    init: Option<ObjectHook>,
    deinit: Option<ObjectHook>,
    /// 是否把多余的空闲 slab 还给 VMM
    reclaim: bool,
    vmm: &'static Vmm,
    lists: Mutex<CacheLists>,
    /// 分配 magazine 的缓存；设置后启用 magazine 层
    magazine_source: Once<&'static Cache>,
    cpus: [SpinLock<CpuMagazines>; MAX_CPUS],
    depot_full: SpinLock<List<Magazine>>,
    depot_empty: SpinLock<List<Magazine>>,
    /// magazine 中的对象总数
    cached: AtomicUsize,
    /// 统计：分配次数
    allocs: AtomicUsize,
    /// 统计：释放次数
    frees: AtomicUsize,
}

impl Cache {
    fn new(
        name: &'static str,
        size: usize,
        alignment: usize,
        init: Option<ObjectHook>,
        deinit: Option<ObjectHook>,
        vmm: &'static Vmm,
        reclaim: bool,
    ) -> Self {
        let alignment = alignment.max(1);
        assert!(size > 0, "mm: slab: cache {} has zero-sized objects", name);
        assert!(
            alignment.is_power_of_two() && alignment < PAGE_SIZE,
            "mm: slab: invalid alignment {} for cache {}",
            alignment,
            name
        );

        let real_size = align_up(size.max(size_of::<u32>()), alignment);
        let object_offset = align_up(SLAB_HEADER_SIZE, alignment);
        let slab_size = page_align_up(object_offset + real_size);

        // 每个对象都必须从第一页开始
        let fit = (slab_size - object_offset) / real_size;
        let in_first_page = (PAGE_SIZE - object_offset - 1) / real_size + 1;
        let objects_per_slab = fit.min(in_first_page);

        Self {
            name,
            object_size: size,
            alignment,
            real_size,
            object_offset,
            slab_size,
            objects_per_slab,
            init,
            deinit,
            reclaim,
            vmm,
            lists: Mutex::new(
                "slab cache",
                CacheLists {
                    free: List::new(),
                    partial: List::new(),
                    full: List::new(),
                    in_use: 0,
                    mem_usage: 0,
                },
            ),
            magazine_source: Once::new(),
            cpus: core::array::from_fn(|_| {
                SpinLock::new(CpuMagazines {
                    loaded: None,
                    previous: None,
                })
            }),
            depot_full: SpinLock::new(List::new()),
            depot_empty: SpinLock::new(List::new()),
            cached: AtomicUsize::new(0),
            allocs: AtomicUsize::new(0),
            frees: AtomicUsize::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn object_size(&self) -> usize {
        self.object_size
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn real_size(&self) -> usize {
        self.real_size
    }

    pub fn slab_size(&self) -> usize {
        self.slab_size
    }

    pub fn objects_per_slab(&self) -> usize {
        self.objects_per_slab
    }

    /// 是否已启用 magazine 层
    pub fn magazines_enabled(&self) -> bool {
        self.magazine_source.get().is_some()
    }

    fn object(&self, slab: NonNull<Slab>, idx: usize) -> NonNull<u8> {
        let addr = slab.as_ptr() as usize + self.object_offset + idx * self.real_size;
        match NonNull::new(addr as *mut u8) {
            Some(obj) => obj,
            None => panic!("mm: slab: null object in cache {}", self.name),
        }
    }

    /// 对象所在的 slab 及其索引
    fn locate(&self, obj: NonNull<u8>) -> (NonNull<Slab>, usize) {
        let addr = obj.as_ptr() as usize;
        let base = addr & !PAGE_MASK;
        let offset = addr.wrapping_sub(base + self.object_offset);
        if addr < base + self.object_offset
            || offset % self.real_size != 0
            || offset / self.real_size >= self.objects_per_slab
        {
            panic!("mm: slab: {:p} is not an object of cache {}", obj, self.name);
        }
        match NonNull::new(base as *mut Slab) {
            Some(slab) => (slab, offset / self.real_size),
            None => panic!("mm: slab: {:p} is not an object of cache {}", obj, self.name),
        }
    }

    /// 在位图中标记对象已交给使用者
    fn mark_live(&self, obj: NonNull<u8>) {
        let (slab, idx) = self.locate(obj);
        // SAFETY: locate 找到的 slab 头有效，位图只通过原子操作访问
        let word = unsafe { &(*slab.as_ptr()).live[idx / 64] };
        let bit = 1u64 << (idx % 64);
        if word.fetch_or(bit, Ordering::AcqRel) & bit != 0 {
            panic!(
                "mm: slab: {:p} in cache {} handed out while still in use",
                obj, self.name
            );
        }
    }

    /// 清除对象的在用位，已经清除时是重复释放
    fn mark_free(&self, obj: NonNull<u8>) {
        let (slab, idx) = self.locate(obj);
        // SAFETY: 同 mark_live
        let word = unsafe { &(*slab.as_ptr()).live[idx / 64] };
        let bit = 1u64 << (idx % 64);
        if word.fetch_and(!bit, Ordering::AcqRel) & bit == 0 {
            panic!("mm: slab: double free of {:p} in cache {}", obj, self.name);
        }
    }

    /// 从 VMM 映射一个新的 slab 并串起空闲链表
    fn new_slab(&self) -> NonNull<Slab> {
        let base = match self.vmm.map(
            self.vmm.kernel_base(),
            self.slab_size,
            VmFlags::ALLOC,
            MmuFlags::PRESENT | MmuFlags::WRITE,
        ) {
            Ok(base) => base,
            Err(e) => {
                error!("slab: cannot grow cache {}", self.name);
                panic!(
                    "mm: slab: out of memory mapping {} bytes for cache {}: {}",
                    self.slab_size, self.name, e
                );
            }
        };

        let Some(slab) = NonNull::new(base.as_mut_ptr::<Slab>()) else {
            panic!("mm: slab: VMM returned a null slab for cache {}", self.name);
        };

        for idx in 0..self.objects_per_slab {
            let next = if idx + 1 < self.objects_per_slab {
                (idx + 1) as u32
            } else {
                FREE_END
            };
            // SAFETY: 对象在刚映射的 slab 内
            unsafe { ptr::write_unaligned(self.object(slab, idx).as_ptr() as *mut u32, next) };
        }

        // SAFETY: slab 头在刚映射的内存开头
        unsafe {
            ptr::write(
                slab.as_ptr(),
                Slab {
                    links: Links::new(),
                    state: SlabState::Free,
                    free_head: 0,
                    free_cnt: self.objects_per_slab as u32,
                    live: core::array::from_fn(|_| AtomicU64::new(0)),
                },
            );
        }

        debug!("slab: new slab {} for cache {}", base, self.name);
        slab
    }

    /// 把 slab 还给 VMM
    fn release_slab(&self, slab: NonNull<Slab>) {
        let base = VirtAddr(slab.as_ptr() as usize);
        trace!("slab: releasing slab {} of cache {}", base, self.name);
        if let Err(e) = self.vmm.unmap(base, self.slab_size) {
            panic!("mm: slab: cannot unmap slab {} of cache {}: {}", base, self.name, e);
        }
    }

    /// 当前 CPU 的 magazine 槽位
    fn cpu_slot(&self) -> &SpinLock<CpuMagazines> {
        let cpu = sched::cpu_id();
        match self.cpus.get(cpu) {
            Some(slot) => slot,
            None => panic!("mm: slab: CPU {} exceeds MAX_CPUS ({})", cpu, MAX_CPUS),
        }
    }

    /// 分配一个对象
    ///
    /// 启用 magazine 时先从当前 CPU 的 magazine 取；否则优先从 partial 链表
    /// 分配，其次 free 链表，都没有时创建新 slab。构造回调在锁外执行。
    pub fn allocate(&self) -> NonNull<u8> {
        let obj = match self.allocate_fast() {
            Some(obj) => obj,
            None => self.take_from_slab(),
        };
        self.mark_live(obj);

        self.allocs.fetch_add(1, Ordering::Relaxed);
        if let Some(init) = self.init {
            init(self, obj);
        }
        obj
    }

    /// 从当前 CPU 的 magazine 取一个对象
    fn allocate_fast(&self) -> Option<NonNull<u8>> {
        self.magazine_source.get()?;
        let mut guard = self.cpu_slot().lock();
        let cpu = &mut *guard;

        // SAFETY: 持有槽位锁；depot 中的 magazine 弹出后归本 CPU 独占
        let obj = unsafe {
            if let Some(obj) = cpu.loaded.and_then(|m| pop_round(m)) {
                Some(obj)
            } else if cpu.previous.is_some_and(|m| rounds(m) > 0) {
                core::mem::swap(&mut cpu.loaded, &mut cpu.previous);
                cpu.loaded.and_then(|m| pop_round(m))
            } else {
                let full = self.depot_full.lock().pop_front()?;
                if let Some(prev) = cpu.previous.take() {
                    self.depot_empty.lock().push_front(prev);
                }
                cpu.previous = cpu.loaded.replace(full);
                pop_round(full)
            }
        };

        if obj.is_some() {
            self.cached.fetch_sub(1, Ordering::Relaxed);
        }
        obj
    }

    /// 从 slab 链表取一个对象
    fn take_from_slab(&self) -> NonNull<u8> {
        let mut lists = self.lists.lock();

        let slab = match lists.partial.front().or(lists.free.front()) {
            Some(slab) => slab,
            None => {
                let slab = self.new_slab();
                // SAFETY: 新 slab 状态为 Free，不在任何链表中
                unsafe { lists.free.push_front(slab) };
                lists.mem_usage += self.slab_size;
                slab
            }
        };

        let s = slab.as_ptr();
        // SAFETY: slab 在本缓存的链表中，且持有缓存锁
        unsafe {
            if (*s).free_cnt == 0 || (*s).free_head == FREE_END {
                panic!(
                    "mm: slab: {:p} in cache {} has no free objects but is on the {:?} list",
                    s,
                    self.name,
                    (*s).state
                );
            }
            let obj = self.object(slab, (*s).free_head as usize);
            (*s).free_head = ptr::read_unaligned(obj.as_ptr() as *const u32);
            (*s).free_cnt -= 1;

            let to = if (*s).free_cnt == 0 {
                SlabState::Full
            } else {
                SlabState::Partial
            };
            lists.transition(slab, to);
            lists.in_use += 1;
            obj
        }
    }

    /// 释放一个对象
    ///
    /// 启用 magazine 时对象先进入当前 CPU 的 magazine。否则直接回到 slab，
    /// 空闲 slab 超过 `SLAB_MAX_FREE` 时，多出的 slab 立即还给 VMM。
    pub fn free(&self, obj: NonNull<u8>) {
        self.mark_free(obj);
        if let Some(deinit) = self.deinit {
            deinit(self, obj);
        }

        self.frees.fetch_add(1, Ordering::Relaxed);
        if !self.free_fast(obj) {
            self.return_to_slab(obj);
        }
    }

    /// 把对象放进当前 CPU 的 magazine
    fn free_fast(&self, obj: NonNull<u8>) -> bool {
        let Some(source) = self.magazine_source.get() else {
            return false;
        };

        loop {
            {
                let mut guard = self.cpu_slot().lock();
                let cpu = &mut *guard;

                // SAFETY: 持有槽位锁；depot 中的 magazine 弹出后归本 CPU 独占
                let stored = unsafe {
                    if let Some(m) = cpu.loaded.filter(|&m| rounds(m) < MAGAZINE_SIZE) {
                        push_round(m, obj);
                        true
                    } else if let Some(m) = cpu.previous.filter(|&m| rounds(m) == 0) {
                        core::mem::swap(&mut cpu.loaded, &mut cpu.previous);
                        push_round(m, obj);
                        true
                    } else {
                        let empty = self.depot_empty.lock().pop_front();
                        match empty {
                            Some(empty) => {
                                if let Some(prev) = cpu.previous.take() {
                                    self.depot_full.lock().push_front(prev);
                                }
                                cpu.previous = cpu.loaded.replace(empty);
                                push_round(empty, obj);
                                true
                            }
                            None => false,
                        }
                    }
                };

                if stored {
                    self.cached.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
            }

            // 没有空 magazine：在槽位锁外分配一个放进 depot 后重试
            let mag = source.allocate().cast::<Magazine>();
            // SAFETY: magazine 缓存的对象大小和对齐按 Magazine 计算
            unsafe {
                ptr::write(mag.as_ptr(), Magazine::new());
                self.depot_empty.lock().push_front(mag);
            }
        }
    }

    /// 把对象放回所属的 slab
    fn return_to_slab(&self, obj: NonNull<u8>) {
        let (slab, idx) = self.locate(obj);
        let victim = {
            let mut lists = self.lists.lock();
            let s = slab.as_ptr();
            // SAFETY: 对象地址通过了 locate 检查，slab 头有效
            unsafe {
                if (*s).free_cnt as usize >= self.objects_per_slab {
                    panic!("mm: slab: double free of {:p} in cache {}", obj, self.name);
                }
                ptr::write_unaligned(obj.as_ptr() as *mut u32, (*s).free_head);
                (*s).free_head = idx as u32;
                (*s).free_cnt += 1;

                let to = if (*s).free_cnt as usize == self.objects_per_slab {
                    SlabState::Free
                } else {
                    SlabState::Partial
                };
                lists.transition(slab, to);
            }
            lists.in_use -= 1;

            if self.reclaim && lists.free.len() > SLAB_MAX_FREE {
                let victim = lists.free.pop_back();
                if victim.is_some() {
                    lists.mem_usage -= self.slab_size;
                }
                victim
            } else {
                None
            }
        };

        if let Some(victim) = victim {
            self.release_slab(victim);
        }
    }

    /// 启用 magazine 层，`source` 提供 magazine 本身
    pub(crate) fn enable_magazines(&self, source: &'static Cache) {
        if ptr::eq(self, source) {
            panic!("mm: slab: cache {} cannot hold its own magazines", self.name);
        }
        self.magazine_source.call_once(|| source);
        debug!("slab: cache {} uses per-CPU magazines", self.name);
    }

    /// 清空 magazine 中的对象，返回 slab 的对象数
    fn drain_magazine(&self, mag: NonNull<Magazine>, source: &Cache) -> usize {
        let mut drained = 0;
        // SAFETY: mag 已从槽位和 depot 中取出，由调用者独占
        while let Some(obj) = unsafe { pop_round(mag) } {
            self.cached.fetch_sub(1, Ordering::Relaxed);
            self.return_to_slab(obj);
            drained += 1;
        }
        source.free(mag.cast());
        drained
    }

    /// 把所有 CPU 和 depot 中的对象还给 slab，并释放 magazine
    ///
    /// 返回放回 slab 的对象数。
    pub fn flush_magazines(&self) -> usize {
        let Some(source) = self.magazine_source.get() else {
            return 0;
        };

        let mut drained = 0;
        for slot in &self.cpus {
            let (loaded, previous) = {
                let mut cpu = slot.lock();
                (cpu.loaded.take(), cpu.previous.take())
            };
            for mag in [loaded, previous].into_iter().flatten() {
                drained += self.drain_magazine(mag, source);
            }
        }
        for depot in [&self.depot_full, &self.depot_empty] {
            loop {
                let mag = depot.lock().pop_front();
                let Some(mag) = mag else { break };
                drained += self.drain_magazine(mag, source);
            }
        }
        drained
    }

    /// 清空 magazine，然后把所有空闲 slab 还给 VMM
    ///
    /// 返回释放的 slab 数。不回收的缓存只清空 magazine。
    pub fn shrink(&self) -> usize {
        let flushed = self.flush_magazines();

        let mut released = 0;
        while self.reclaim {
            let victim = {
                let mut lists = self.lists.lock();
                let victim = lists.free.pop_back();
                if victim.is_some() {
                    lists.mem_usage -= self.slab_size;
                }
                victim
            };
            let Some(victim) = victim else { break };
            self.release_slab(victim);
            released += 1;
        }

        debug!(
            "slab: shrank cache {}: {} objects flushed, {} slabs released",
            self.name, flushed, released
        );
        released
    }

    pub fn stats(&self) -> CacheStats {
        let lists = self.lists.lock();
        let cached = self.cached.load(Ordering::Relaxed);
        CacheStats {
            name: self.name,
            object_size: self.object_size,
            real_size: self.real_size,
            slab_size: self.slab_size,
            objects_per_slab: self.objects_per_slab,
            free_slabs: lists.free.len(),
            partial_slabs: lists.partial.len(),
            full_slabs: lists.full.len(),
            objects_in_use: lists.in_use.saturating_sub(cached),
            cached_objects: cached,
            mem_usage: lists.mem_usage,
            allocs: self.allocs.load(Ordering::Relaxed),
            frees: self.frees.load(Ordering::Relaxed),
        }
    }

    /// 遍历三个链表，检查每个 slab 的状态、空闲链表和在用位图
    ///
    /// 只在没有并发分配和释放时调用。
    pub fn audit(&self) -> CacheAudit {
        let lists = self.lists.lock();
        let mut audit = CacheAudit {
            slabs: 0,
            free_objects: 0,
            objects_in_use: lists.in_use,
            cached_objects: self.cached.load(Ordering::Relaxed),
        };

        let ops = self.objects_per_slab;
        let mut live = 0;
        for (state, list) in [
            (SlabState::Free, &lists.free),
            (SlabState::Partial, &lists.partial),
            (SlabState::Full, &lists.full),
        ] {
            for slab in list.iter() {
                let free = slab.free_cnt as usize;
                let consistent = slab.state == state
                    && match state {
                        SlabState::Free => free == ops,
                        SlabState::Partial => free > 0 && free < ops,
                        SlabState::Full => free == 0,
                    };
                if !consistent {
                    panic!(
                        "mm: slab: cache {} has a slab tagged {:?} with {} free objects \
                         on the {:?} list",
                        self.name, slab.state, free, state
                    );
                }

                // 空闲链表长度必须等于 free_cnt
                let mut walked = 0;
                let mut next = slab.free_head;
                while next != FREE_END {
                    if walked > ops || next as usize >= ops {
                        panic!("mm: slab: corrupted free list in cache {}", self.name);
                    }
                    let obj = self.object(NonNull::from(slab), next as usize);
                    // SAFETY: 空闲对象内存放下一个索引
                    next = unsafe { ptr::read_unaligned(obj.as_ptr() as *const u32) };
                    walked += 1;
                }
                if walked != free {
                    panic!(
                        "mm: slab: cache {} free list has {} objects, free count is {}",
                        self.name, walked, free
                    );
                }

                let slab_live = slab.live_count();
                if slab_live > ops - free {
                    panic!(
                        "mm: slab: cache {} has a slab with {} live bits but {} taken objects",
                        self.name,
                        slab_live,
                        ops - free
                    );
                }

                live += slab_live;
                audit.slabs += 1;
                audit.free_objects += free;
            }
        }

        if live + audit.cached_objects != audit.objects_in_use {
            panic!(
                "mm: slab: cache {} has {} live and {} cached objects, {} taken from slabs",
                self.name, live, audit.cached_objects, audit.objects_in_use
            );
        }
        audit
    }

    pub fn dump(&self) {
        info!("slab: {}", self.stats());
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.name)
            .field("object_size", &self.object_size)
            .field("objects_per_slab", &self.objects_per_slab)
            .field("magazines", &self.magazines_enabled())
            .finish()
    }
}

/// Slab 分配器，内嵌分配 Cache 对象的引导缓存
pub struct SlabAllocator {
    caches: Cache,
    /// 分配 magazine 的缓存，SMP 启动后创建
    magazines: Once<&'static Cache>,
}

impl SlabAllocator {
    pub fn new(vmm: &'static Vmm) -> Self {
        Self {
            caches: Cache::new(
                "cache",
                size_of::<Cache>(),
                align_of::<Cache>(),
                None,
                None,
                vmm,
                false,
            ),
            magazines: Once::new(),
        }
    }

    /// 创建新的对象缓存
    ///
    /// `alignment` 为 0 时按 1 字节对齐。magazine 层已启用时新缓存直接使用它。
    pub fn create_cache(
        &self,
        name: &'static str,
        size: usize,
        alignment: usize,
        init: Option<ObjectHook>,
        deinit: Option<ObjectHook>,
    ) -> &'static Cache {
        let cache = Cache::new(name, size, alignment, init, deinit, self.caches.vmm, true);
        let obj = self.caches.allocate().cast::<Cache>();
        // SAFETY: 引导缓存的对象大小和对齐都按 Cache 计算，且 slab 永不回收
        let cache: &'static Cache = unsafe {
            ptr::write(obj.as_ptr(), cache);
            &*obj.as_ptr()
        };
        debug!(
            "slab: created cache {} ({} B objects, {} per slab)",
            name, cache.object_size, cache.objects_per_slab
        );

        if let Some(source) = self.magazines.get() {
            cache.enable_magazines(source);
        }
        cache
    }

    /// 创建 magazine 缓存，打开 magazine 层
    ///
    /// SMP 启动、每个 CPU 都能报告自己的编号之后调用。此后创建的缓存自动
    /// 使用 magazine；之前创建的缓存需要 [`Self::reinitialize_cache`]。
    pub fn enable_magazines(&self) -> &'static Cache {
        *self.magazines.call_once(|| {
            let source = self.create_cache(
                "magazine",
                size_of::<Magazine>(),
                align_of::<Magazine>(),
                None,
                None,
            );
            info!("slab: per-CPU magazines enabled, {} objects each", MAGAZINE_SIZE);
            source
        })
    }

    /// 让 SMP 启动前创建的缓存也使用 magazine
    pub fn reinitialize_cache(&self, cache: &Cache) {
        let source = self.enable_magazines();
        cache.enable_magazines(source);
    }

    /// 销毁缓存，归还它的所有 slab
    ///
    /// # Safety
    ///
    /// 调用后不能再使用 `cache`。
    pub unsafe fn destroy_cache(&self, cache: &'static Cache) {
        cache.flush_magazines();
        {
            let mut lists = cache.lists.lock();
            if lists.in_use != 0 {
                panic!(
                    "mm: slab: destroying cache {} with {} live objects",
                    cache.name, lists.in_use
                );
            }
            while let Some(slab) = lists.free.pop_front() {
                cache.release_slab(slab);
            }
            lists.mem_usage = 0;
        }
        debug!("slab: destroyed cache {}", cache.name);

        let obj = NonNull::from(cache);
        ptr::drop_in_place(obj.as_ptr());
        self.caches.free(obj.cast());
    }

    /// 分配 Cache 对象的引导缓存
    pub fn cache_of_caches(&self) -> &Cache {
        &self.caches
    }
}
