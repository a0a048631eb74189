//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 物理内存管理器 (PMM)
//!
//! 物理内存按 zone 分组，每个 zone 是一串启动时从固件内存图发现的
//! section。section 是自描述的：section 头和位图放在它所管理区域的开头，
//! 占用的字节向上取整到页后从区域里扣除。
//!
//! 所有 section 的页描述符数组都放在最大的那个 section 里，
//! 这样初始化时不需要任何其它分配器。
//!
//! # 位图
//! - 每页一位，1 表示已使用
//! - `ffb` (first free byte) 指向第一个含 0 位的字节之前或该字节
//! - `nfree` 始终等于位图中 0 位的个数，只在 section 锁内修改
//!
//! # 锁
//! 每个 section 一把睡眠锁，分配和释放同一时刻最多持有一把。

use core::fmt;
use core::mem::size_of;
use core::ptr::{self, NonNull};
use core::slice;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use log::{debug, error, info, warn};
use thiserror::Error;

use super::page::{page_align_down, page_align_up, PhysAddr, PAGE_SIZE};
use crate::arch::{Mmu, RemapMode};
use crate::errno::Errno;
use crate::sync::Mutex;

/// zone 编号
pub type ZoneId = usize;

/// 默认 zone
pub const ZONE_DEFAULT: ZoneId = 0;

/// zone 数量
pub const NZONES: usize = 1;

bitflags! {
    /// 物理页描述符标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFlags: u32 {
        /// 页空闲
        const FREE = 0x1;
    }
}

/// 物理页描述符
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PageRecord {
    flags: PageFlags,
}

impl PageRecord {
    pub fn flags(&self) -> PageFlags {
        self.flags
    }

    pub fn is_free(&self) -> bool {
        self.flags.contains(PageFlags::FREE)
    }
}

/// 固件内存区域类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionKind {
    Available,
    Reserved,
    AcpiNvs,
    AcpiReclaimable,
    BadRam,
    Module,
    Kernel,
}

impl RegionKind {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Available => "AVAILABLE",
            Self::Reserved => "RESERVED",
            Self::AcpiNvs => "ACPI NVS",
            Self::AcpiReclaimable => "ACPI RECLAIMABLE",
            Self::BadRam => "BAD RAM",
            Self::Module => "MODULE",
            Self::Kernel => "KERNEL",
        }
    }
}

/// 固件提供的一段物理内存 `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: PhysAddr,
    pub end: PhysAddr,
    pub kind: RegionKind,
}

impl MemoryRegion {
    pub const fn new(start: usize, end: usize, kind: RegionKind) -> Self {
        Self {
            start: PhysAddr(start),
            end: PhysAddr(end),
            kind,
        }
    }
}

impl fmt::Display for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x} - {:016x} ({})", self.start, self.end, self.kind.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PmmError {
    #[error("invalid zone {0}")]
    InvalidZone(ZoneId),
    #[error("zero-sized page request")]
    ZeroSize,
}

impl PmmError {
    pub fn errno(&self) -> Errno {
        Errno::InvalidArgument
    }
}

/// section 锁保护的状态
struct SectionState {
    bitmap: &'static mut [u8],
    pages: &'static mut [PageRecord],
    ffb: usize,
}

/// 一段连续的物理内存
pub struct Section {
    /// 第一个可分配页（头部之后）
    start: PhysAddr,
    /// 可分配字节数
    size: usize,
    npages: usize,
    nfree: AtomicUsize,
    state: Mutex<SectionState>,
    next: Option<&'static Section>,
}

impl Section {
    pub fn start(&self) -> PhysAddr {
        self.start
    }

    pub fn end(&self) -> PhysAddr {
        self.start.add(self.size)
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn nfree(&self) -> usize {
        self.nfree.load(Ordering::Acquire)
    }

    pub fn contains(&self, addr: PhysAddr) -> bool {
        addr >= self.start && addr < self.end()
    }

    fn page_addr(&self, blk: usize) -> PhysAddr {
        self.start.add(blk * PAGE_SIZE)
    }

    fn is_used(state: &SectionState, blk: usize) -> bool {
        state.bitmap[blk / 8] & (1 << (blk % 8)) != 0
    }

    /// 标记一页为已使用
    fn claim(&self, state: &mut SectionState, blk: usize) {
        state.bitmap[blk / 8] |= 1 << (blk % 8);
        let record = &mut state.pages[blk];
        if !record.is_free() {
            panic!(
                "mm: page {} is free in the bitmap but used in its page record",
                self.page_addr(blk)
            );
        }
        record.flags.remove(PageFlags::FREE);
        self.nfree.fetch_sub(1, Ordering::AcqRel);
    }

    /// 释放一页
    fn release(&self, state: &mut SectionState, blk: usize) {
        if !Self::is_used(state, blk) || state.pages[blk].is_free() {
            panic!("mm: double free of physical page {}", self.page_addr(blk));
        }
        state.bitmap[blk / 8] &= !(1 << (blk % 8));
        state.pages[blk].flags.insert(PageFlags::FREE);
        self.nfree.fetch_add(1, Ordering::AcqRel);

        if blk / 8 < state.ffb {
            state.ffb = blk / 8;
        }
    }

    /// ffb 指向满字节时重新计算
    fn check_ffb(&self, state: &mut SectionState) {
        if state.bitmap.get(state.ffb).map_or(true, |b| *b == 0xFF) {
            error!("pmm: FFB was not calculated correctly or has been corrupted");
            state.ffb = match state.bitmap.iter().position(|b| *b != 0xFF) {
                Some(byte) => byte,
                None => panic!(
                    "mm: section {} bitmap is full but nfree is {}",
                    self.start,
                    self.nfree()
                ),
            };
        }
    }

    fn advance_ffb(state: &mut SectionState) {
        while state.ffb < state.bitmap.len() && state.bitmap[state.ffb] == 0xFF {
            state.ffb += 1;
        }
    }

    /// 分配第一个空闲页，返回页号
    fn take_first_free(&self, state: &mut SectionState) -> usize {
        self.check_ffb(state);

        let byte = state.bitmap[state.ffb];
        let blk = state.ffb * 8 + (!byte).trailing_zeros() as usize;
        if blk >= self.npages {
            panic!(
                "mm: section {} can fit {} pages, chose page {} (nfree {})",
                self.start,
                self.npages,
                blk,
                self.nfree()
            );
        }

        self.claim(state, blk);
        Self::advance_ffb(state);
        blk
    }

    /// 查找 `count` 个连续空闲页，返回第一页页号
    fn take_contiguous(&self, state: &mut SectionState, count: usize) -> Option<usize> {
        self.check_ffb(state);

        let mut run = 0;
        let mut first = 0;
        for blk in state.ffb * 8..self.npages {
            if Self::is_used(state, blk) {
                run = 0;
                continue;
            }
            if run == 0 {
                first = blk;
            }
            run += 1;
            if run == count {
                for idx in first..first + count {
                    self.claim(state, idx);
                }
                Self::advance_ffb(state);
                return Some(first);
            }
        }
        None
    }
}

/// 按链表顺序遍历 zone 中的 section
fn sections(head: Option<&'static Section>) -> impl Iterator<Item = &'static Section> {
    core::iter::successors(head, |s| s.next)
}

/// 物理内存管理器
pub struct Pmm {
    zones: [Option<&'static Section>; NZONES],
    /// PMM 自身占用的字节（section 头 + 页描述符数组）
    internal_bytes: usize,
    /// 固件报告的可用内存
    memory_size: usize,
}

impl Pmm {
    /// 根据固件内存图初始化
    ///
    /// 只在启动时单线程调用一次。
    pub fn new(regions: &[MemoryRegion], mmu: &dyn Mmu) -> Self {
        let mut heads: [Option<NonNull<Section>>; NZONES] = [None; NZONES];
        let mut tails: [Option<NonNull<Section>>; NZONES] = [None; NZONES];
        let mut biggest: Option<NonNull<Section>> = None;
        let mut internal_bytes = 0;
        let mut memory_size = 0;

        for region in regions {
            debug!("pmm: entry {}", region);
            if region.kind != RegionKind::Available {
                continue;
            }

            let start = PhysAddr(page_align_up(region.start.0));
            let end = PhysAddr(page_align_down(region.end.0));
            if end <= start {
                continue;
            }
            memory_size += end.0 - start.0;

            // SAFETY: 区域由固件报告为可用，启动阶段无人使用
            let Some((section, header)) = (unsafe { Self::insert_section(start, end, mmu) }) else {
                continue;
            };
            internal_bytes += header;

            // SAFETY: 初始化阶段独占所有 section
            unsafe {
                match tails[ZONE_DEFAULT] {
                    Some(tail) => (*tail.as_ptr()).next = Some(&*section.as_ptr()),
                    None => heads[ZONE_DEFAULT] = Some(section),
                }
                tails[ZONE_DEFAULT] = Some(section);

                let bigger =
                    biggest.map_or(true, |b| (*b.as_ptr()).size < (*section.as_ptr()).size);
                if bigger {
                    biggest = Some(section);
                }
            }
        }

        let mut pmm = Self {
            zones: [None; NZONES],
            internal_bytes,
            memory_size,
        };

        let Some(biggest) = biggest else {
            error!("pmm: no available memory, cannot build page arrays");
            return pmm;
        };

        // SAFETY: 同上，section 还没有发布
        unsafe {
            internal_bytes += Self::build_page_arrays(&heads, biggest, mmu);
        }
        pmm.internal_bytes = internal_bytes;

        for (zone, head) in heads.iter().enumerate() {
            // SAFETY: 初始化完成后 section 只读共享
            pmm.zones[zone] = head.map(|s| unsafe { &*s.as_ptr() });
        }

        for section in sections(pmm.zones[ZONE_DEFAULT]) {
            info!(
                "pmm: section {} - {}, {} free pages",
                section.start,
                section.end(),
                section.nfree()
            );
        }
        info!("pmm: using {} pages internally", pmm.internal_bytes / PAGE_SIZE);

        pmm
    }

    /// 在区域开头建立 section，返回 section 和头部占用的字节
    unsafe fn insert_section(
        start: PhysAddr,
        end: PhysAddr,
        mmu: &dyn Mmu,
    ) -> Option<(NonNull<Section>, usize)> {
        let len = end.0 - start.0;
        let bitmap_bytes = (len / PAGE_SIZE).div_ceil(8);
        let header = page_align_up(size_of::<Section>() + bitmap_bytes);

        if header >= len {
            warn!(
                "pmm: region {} - {} is too small to describe itself, skipped",
                start, end
            );
            return None;
        }

        let npages = (len - header) / PAGE_SIZE;
        let virt = mmu.remap_physical(start, header, RemapMode::Permanent);
        let section = virt.as_mut_ptr::<Section>();

        let bitmap = slice::from_raw_parts_mut(
            virt.add(size_of::<Section>()).as_mut_ptr::<u8>(),
            npages.div_ceil(8),
        );
        bitmap.fill(0);
        // 末字节中不存在的页永远标记为已使用
        for blk in npages..bitmap.len() * 8 {
            bitmap[blk / 8] |= 1 << (blk % 8);
        }

        ptr::write(
            section,
            Section {
                start: start.add(header),
                size: npages * PAGE_SIZE,
                npages,
                nfree: AtomicUsize::new(npages),
                state: Mutex::new(
                    "pmm section",
                    SectionState {
                        bitmap,
                        pages: &mut [],
                        ffb: 0,
                    },
                ),
                next: None,
            },
        );

        NonNull::new(section).map(|s| (s, header))
    }

    /// 在最大的 section 开头放置所有页描述符数组，返回占用的字节
    unsafe fn build_page_arrays(
        heads: &[Option<NonNull<Section>>; NZONES],
        biggest: NonNull<Section>,
        mmu: &dyn Mmu,
    ) -> usize {
        let big_start = (*biggest.as_ptr()).start;
        let big_npages = (*biggest.as_ptr()).npages;
        let mut offset = big_start;

        for head in heads {
            let mut cursor = *head;
            while let Some(section) = cursor {
                let section = &mut *section.as_ptr();
                let bytes = page_align_up(section.npages * size_of::<PageRecord>());

                let used = (offset.0 + bytes - big_start.0) / PAGE_SIZE;
                if used > big_npages {
                    panic!("mm: insufficient space in biggest section for page arrays");
                }

                let virt = mmu.remap_physical(offset, bytes, RemapMode::Permanent);
                let pages =
                    slice::from_raw_parts_mut(virt.as_mut_ptr::<PageRecord>(), section.npages);
                pages.fill(PageRecord { flags: PageFlags::FREE });
                section.state.get_mut().pages = pages;

                offset = offset.add(bytes);
                cursor = section.next.map(NonNull::from);
            }
        }

        // 页描述符数组占用的页从最大 section 中扣除
        let big = &mut *biggest.as_ptr();
        let used = (offset.0 - big_start.0) / PAGE_SIZE;
        let state = big.state.get_mut();
        for blk in 0..used {
            state.bitmap[blk / 8] |= 1 << (blk % 8);
            state.pages[blk].flags.remove(PageFlags::FREE);
        }
        state.ffb = used / 8;
        Section::advance_ffb(state);
        *big.nfree.get_mut() -= used;

        offset.0 - big_start.0
    }

    fn zone(&self, zone: ZoneId) -> Result<Option<&'static Section>, PmmError> {
        self.zones.get(zone).copied().ok_or(PmmError::InvalidZone(zone))
    }

    fn all_sections(&self) -> impl Iterator<Item = &'static Section> + '_ {
        self.zones.iter().flat_map(|head| sections(*head))
    }

    fn section_containing(&self, addr: PhysAddr) -> Option<&'static Section> {
        self.all_sections().find(|s| s.contains(addr))
    }

    /// 分配一页物理内存
    ///
    /// 没有空闲页时 panic（内存耗尽不可恢复）。
    pub fn allocate(&self, zone: ZoneId) -> Result<PhysAddr, PmmError> {
        for section in sections(self.zone(zone)?) {
            if section.nfree() == 0 {
                continue;
            }

            let mut state = section.state.lock();
            // 在等锁期间被别的 CPU 取完
            if section.nfree() == 0 {
                continue;
            }
            let blk = section.take_first_free(&mut state);
            return Ok(section.page_addr(blk));
        }

        self.out_of_memory(1)
    }

    /// 分配 `count` 个物理连续的页
    pub fn allocate_pages(&self, count: usize, zone: ZoneId) -> Result<PhysAddr, PmmError> {
        if count == 0 {
            return Err(PmmError::ZeroSize);
        }
        if count == 1 {
            return self.allocate(zone);
        }

        for section in sections(self.zone(zone)?) {
            if section.nfree() < count {
                continue;
            }

            let mut state = section.state.lock();
            if section.nfree() < count {
                continue;
            }
            if let Some(first) = section.take_contiguous(&mut state, count) {
                return Ok(section.page_addr(first));
            }
        }

        self.out_of_memory(count)
    }

    /// 释放一页物理内存
    pub fn free(&self, addr: PhysAddr) {
        self.free_pages(addr, 1);
    }

    /// 释放从 `base` 开始的 `count` 页
    pub fn free_pages(&self, base: PhysAddr, count: usize) {
        if !base.is_aligned() {
            panic!("mm: freeing misaligned physical address {}", base);
        }
        let Some(section) = self.section_containing(base) else {
            panic!("mm: physical address {} is not managed by the PMM", base);
        };
        if base.0 + count * PAGE_SIZE > section.end().0 {
            panic!(
                "mm: freeing {} pages at {} runs past section end {}",
                count,
                base,
                section.end()
            );
        }

        let first = (base.0 - section.start.0) / PAGE_SIZE;
        let mut state = section.state.lock();
        for blk in first..first + count {
            section.release(&mut state, blk);
        }
    }

    /// 查询物理页的描述符标志
    pub fn page_flags(&self, addr: PhysAddr) -> Option<PageFlags> {
        let section = self.section_containing(addr)?;
        let blk = (addr.0 - section.start.0) / PAGE_SIZE;
        let state = section.state.lock();
        Some(state.pages[blk].flags())
    }

    /// 可分配页总数
    pub fn total_pages(&self) -> usize {
        self.all_sections().map(|s| s.npages).sum()
    }

    /// 空闲页数
    pub fn free_pages_count(&self) -> usize {
        self.all_sections().map(|s| s.nfree()).sum()
    }

    /// 已使用页数（含页描述符数组）
    pub fn used_pages(&self) -> usize {
        self.total_pages() - self.free_pages_count()
    }

    pub fn internal_bytes(&self) -> usize {
        self.internal_bytes
    }

    pub fn memory_size(&self) -> usize {
        self.memory_size
    }

    pub fn section_count(&self) -> usize {
        self.all_sections().count()
    }

    /// 打印所有 section
    pub fn dump(&self) {
        for (zone, head) in self.zones.iter().enumerate() {
            for section in sections(*head) {
                let state = section.state.lock();
                info!(
                    "pmm: zone {} section {} - {}: {} of {} pages free (FFB {})",
                    zone,
                    section.start,
                    section.end(),
                    section.nfree(),
                    section.npages,
                    state.ffb
                );
            }
        }
    }

    /// 内存耗尽
    fn out_of_memory(&self, request: usize) -> ! {
        let total = self.total_pages();
        let used = self.used_pages();
        error!("*** PMM detected OOM condition while allocating {} pages", request);
        self.dump();
        panic!(
            "mm: out of memory allocating {} pages: {} pages ({} kB) reserved by the PMM, \
             {} kB of RAM available, {} of {} pages ({} kB of {} kB) in use",
            request,
            self.internal_bytes / PAGE_SIZE,
            self.internal_bytes / 1024,
            self.memory_size / 1024,
            used,
            total,
            used * PAGE_SIZE / 1024,
            total * PAGE_SIZE / 1024
        );
    }
}
