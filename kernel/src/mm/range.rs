//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 虚拟内存区间 (Range) 与自托管的 Range 池
//!
//! VMM 在通用分配器存在之前就需要 Range 记录，而通用分配器又需要 VMM
//! 才能拿到内存。为了打破这个循环，Range 记录放在直接从 PMM 取得的
//! 物理页里：
//!
//! ```text
//! +------------------+-------+-------+-----+-------+
//! | RangePage header | Range | Range | ... | Range |
//! +------------------+-------+-------+-----+-------+
//! ```
//!
//! 页头包含自旋锁保护的占用位图和剩余计数。页内最后一条记录释放时，
//! 整页归还给 PMM。
//!
//! 每个地址空间的 Range 按起始地址排序，互不重叠。

use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;
use log::trace;

use super::page::{align_up, PhysAddr, VirtAddr, PAGE_MASK, PAGE_SIZE};
use super::pmm::{Pmm, ZONE_DEFAULT};
use super::vmm::VmmError;
use crate::arch::{DirHandle, Mmu, MmuFlags, RemapMode};
use crate::list::{Linked, Links, List};
use crate::sync::SpinLock;

bitflags! {
    /// Range 的 VMM 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmFlags: u32 {
        /// 物理页由 VMM 分配，销毁时归还 PMM
        const ALLOC  = 0x01;
        /// 已建立页表映射
        const MAPPED = 0x02;
        /// 必须映射在请求的地址
        const FIXED  = 0x04;
        /// 文件映射
        const FILE   = 0x08;
        /// 设备内存，物理页不属于 PMM
        const DEVICE = 0x10;
    }
}

/// 一段虚拟地址区间 `[start, end)`
pub struct Range {
    links: Links<Range>,
    start: VirtAddr,
    end: VirtAddr,
    vm_flags: VmFlags,
    mmu_flags: MmuFlags,
}

unsafe impl Linked for Range {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

impl Range {
    #[inline]
    pub fn start(&self) -> VirtAddr {
        self.start
    }

    #[inline]
    pub fn end(&self) -> VirtAddr {
        self.end
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.end.0 - self.start.0
    }

    pub fn pages(&self) -> usize {
        self.size() / PAGE_SIZE
    }

    pub fn vm_flags(&self) -> VmFlags {
        self.vm_flags
    }

    pub fn mmu_flags(&self) -> MmuFlags {
        self.mmu_flags
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn overlaps(&self, start: VirtAddr, end: VirtAddr) -> bool {
        start < self.end && self.start < end
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}-{:#x}", self.start.0, self.end.0)
    }
}

impl fmt::Debug for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Range")
            .field("start", &self.start)
            .field("end", &self.end)
            .field("vm_flags", &self.vm_flags)
            .field("mmu_flags", &self.mmu_flags)
            .finish()
    }
}

const BITMAP_WORDS: usize = 2;

/// 页内槽位占用状态
struct SlotMap {
    bitmap: [u64; BITMAP_WORDS],
    remaining: usize,
}

/// Range 页头，槽位数组紧随其后
#[repr(C)]
struct RangePage {
    links: Links<RangePage>,
    phys: PhysAddr,
    slots: SpinLock<SlotMap>,
}

unsafe impl Linked for RangePage {
    fn links(&self) -> &Links<Self> {
        &self.links
    }
}

const SLOTS_OFFSET: usize = align_up(size_of::<RangePage>(), align_of::<Range>());

/// 每页可容纳的 Range 数
pub const RANGES_PER_PAGE: usize = (PAGE_SIZE - SLOTS_OFFSET) / size_of::<Range>();

const _: () = assert!(RANGES_PER_PAGE > 0 && RANGES_PER_PAGE <= BITMAP_WORDS * 64);

impl RangePage {
    fn new(phys: PhysAddr) -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        // 不存在的槽位永远占用
        for idx in RANGES_PER_PAGE..BITMAP_WORDS * 64 {
            bitmap[idx / 64] |= 1 << (idx % 64);
        }
        Self {
            links: Links::new(),
            phys,
            slots: SpinLock::new(SlotMap {
                bitmap,
                remaining: RANGES_PER_PAGE,
            }),
        }
    }

    fn base(&self) -> usize {
        self as *const Self as usize
    }

    fn slot(&self, idx: usize) -> *mut Range {
        (self.base() + SLOTS_OFFSET + idx * size_of::<Range>()) as *mut Range
    }

    fn slot_index(&self, range: NonNull<Range>) -> usize {
        let offset = range.as_ptr() as usize - self.base() - SLOTS_OFFSET;
        if offset % size_of::<Range>() != 0 || offset / size_of::<Range>() >= RANGES_PER_PAGE {
            panic!("mm: {:p} is not a range record", range);
        }
        offset / size_of::<Range>()
    }

    /// 取一个空闲槽位并写入记录
    fn take_slot(&self, range: Range) -> Option<NonNull<Range>> {
        let mut slots = self.slots.lock();
        if slots.remaining == 0 {
            return None;
        }

        let (word, free) = slots
            .bitmap
            .iter()
            .enumerate()
            .map(|(w, bits)| (w, !bits))
            .find(|(_, free)| *free != 0)?;
        let idx = word * 64 + free.trailing_zeros() as usize;

        slots.bitmap[word] |= 1 << (idx % 64);
        slots.remaining -= 1;

        let slot = self.slot(idx);
        // SAFETY: 槽位在本页内且刚刚被独占
        unsafe { ptr::write(slot, range) };
        NonNull::new(slot)
    }

    /// 归还槽位，返回本页是否已全部空闲
    fn put_slot(&self, range: NonNull<Range>) -> bool {
        let idx = self.slot_index(range);
        let mut slots = self.slots.lock();
        let bit = 1 << (idx % 64);
        if slots.bitmap[idx / 64] & bit == 0 {
            panic!("mm: range record {:p} released twice", range);
        }
        slots.bitmap[idx / 64] &= !bit;
        slots.remaining += 1;
        slots.remaining == RANGES_PER_PAGE
    }
}

/// 自托管 Range 池
pub struct RangePool {
    pmm: &'static Pmm,
    mmu: &'static dyn Mmu,
    pages: SpinLock<List<RangePage>>,
    live: AtomicUsize,
}

impl RangePool {
    pub fn new(pmm: &'static Pmm, mmu: &'static dyn Mmu) -> Self {
        Self {
            pmm,
            mmu,
            pages: SpinLock::new(List::new()),
            live: AtomicUsize::new(0),
        }
    }

    /// 从 PMM 取一页作为新的 Range 页
    fn create_range_page(&self) -> Result<NonNull<RangePage>, VmmError> {
        let phys = self.pmm.allocate(ZONE_DEFAULT)?;
        let virt = self.mmu.remap_physical(phys, PAGE_SIZE, RemapMode::Permanent);
        let page = virt.as_mut_ptr::<RangePage>();
        // SAFETY: 新分配的物理页，独占
        unsafe { ptr::write(page, RangePage::new(phys)) };
        trace!("vmm: new range page {} at {}", phys, virt);
        match NonNull::new(page) {
            Some(page) => Ok(page),
            None => panic!("mm: remap of range page {} returned null", phys),
        }
    }

    /// 创建一条 Range 记录
    pub fn create_range(
        &self,
        start: VirtAddr,
        end: VirtAddr,
        vm_flags: VmFlags,
        mmu_flags: MmuFlags,
    ) -> Result<NonNull<Range>, VmmError> {
        let start = start.floor();
        let end = end.ceil();
        assert!(end > start, "mm: empty range {}-{}", start, end);

        loop {
            {
                let pages = self.pages.lock();
                for page in pages.iter() {
                    let range = Range {
                        links: Links::new(),
                        start,
                        end,
                        vm_flags,
                        mmu_flags,
                    };
                    if let Some(range) = page.take_slot(range) {
                        self.live.fetch_add(1, Ordering::Relaxed);
                        return Ok(range);
                    }
                }
            }

            // 所有页都满了，PMM 调用不能持有自旋锁
            let page = self.create_range_page()?;
            // SAFETY: 新页不在任何链表中
            unsafe { self.pages.lock().push_back(page) };
        }
    }

    /// 销毁 Range：解除映射，ALLOC 区间的物理页归还 PMM，然后释放记录
    ///
    /// 调用前 Range 必须已经从地址空间链表中摘除。
    pub fn destroy_range(&self, range: NonNull<Range>, dir: DirHandle) {
        // SAFETY: 记录由本池分配，调用者保证已不在链表中
        let r = unsafe { range.as_ref() };
        let (start, end, vm_flags) = (r.start, r.end, r.vm_flags);

        let mut va = start;
        while va < end {
            if let Some(phys) = self.mmu.physical(dir, va) {
                self.mmu.unmap(dir, va);
                if vm_flags.contains(VmFlags::ALLOC) {
                    self.pmm.free(phys);
                }
            }
            va = va.add(PAGE_SIZE);
        }
        self.mmu.invalidate_range(start, end);

        self.release(range);
    }

    fn release(&self, range: NonNull<Range>) {
        let page = (range.as_ptr() as usize & !PAGE_MASK) as *mut RangePage;
        let Some(page) = NonNull::new(page) else {
            panic!("mm: {:p} is not a range record", range);
        };
        // SAFETY: 记录所在的页在记录释放前一直有效
        let page_ref = unsafe { page.as_ref() };
        let phys = page_ref.phys;

        let mut pages = self.pages.lock();
        let empty = page_ref.put_slot(range);
        self.live.fetch_sub(1, Ordering::Relaxed);
        if !empty {
            return;
        }
        // SAFETY: 页在池链表中，且持有池锁
        unsafe { pages.remove(page) };
        drop(pages);

        trace!("vmm: releasing range page {}", phys);
        self.mmu.unmap_physical(VirtAddr(page.as_ptr() as usize), PAGE_SIZE);
        self.pmm.free(phys);
    }

    /// 当前占用的 Range 页数
    pub fn page_count(&self) -> usize {
        self.pages.lock().len()
    }

    /// 存活的 Range 记录数
    pub fn live_ranges(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

/// 一个地址空间内按起始地址排序的 Range 链表
pub struct RangeList {
    list: List<Range>,
}

impl RangeList {
    pub const fn new() -> Self {
        Self { list: List::new() }
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Range> + '_ {
        self.list.iter()
    }

    /// 检查反向链接与遍历顺序一致
    pub fn verify_links(&self) {
        let mut last: Option<NonNull<Range>> = None;
        for r in self.list.iter() {
            if r.links.prev() != last {
                panic!("mm: range list corrupted at {}", r);
            }
            last = Some(NonNull::from(r));
        }
    }

    /// 包含 `addr` 的 Range
    pub fn find(&self, addr: VirtAddr) -> Option<NonNull<Range>> {
        self.list
            .iter()
            .take_while(|r| r.start <= addr)
            .find(|r| r.contains(addr))
            .map(NonNull::from)
    }

    /// 在 `[space_start, space_end)` 中从 `hint` 开始找一个至少 `size` 字节的空洞
    ///
    /// 依次检查第一个 Range 之前、相邻 Range 之间、最后一个 Range 之后。
    pub fn find_free(
        &self,
        space_start: VirtAddr,
        space_end: VirtAddr,
        hint: VirtAddr,
        size: usize,
    ) -> Option<VirtAddr> {
        let mut candidate = core::cmp::max(hint, space_start);
        if candidate >= space_end {
            return None;
        }

        for r in self.list.iter() {
            if r.end <= candidate {
                continue;
            }
            if r.start >= candidate && r.start.0 - candidate.0 >= size {
                return Some(candidate);
            }
            candidate = core::cmp::max(candidate, r.end);
        }

        if candidate < space_end && space_end.0 - candidate.0 >= size {
            Some(candidate)
        } else {
            None
        }
    }

    /// 按起始地址插入
    ///
    /// 与已有 Range 重叠或超出地址空间是致命错误。
    ///
    /// # Safety
    ///
    /// `range` 来自 [`RangePool::create_range`] 且不在任何链表中。
    pub unsafe fn insert(
        &mut self,
        space_start: VirtAddr,
        space_end: VirtAddr,
        range: NonNull<Range>,
    ) {
        let new = range.as_ref();
        if new.start < space_start || new.end > space_end {
            panic!(
                "mm: range {} lies outside its space {}-{}",
                new, space_start, space_end
            );
        }

        let mut after = None;
        for cur in self.list.iter() {
            if cur.overlaps(new.start, new.end) {
                panic!("mm: range {} overlaps existing range {}", new, cur);
            }
            if cur.end <= new.start {
                after = Some(NonNull::from(cur));
            } else {
                break;
            }
        }

        match after {
            Some(at) => self.list.insert_after(at, range),
            None => self.list.push_front(range),
        }
    }

    /// 摘除 Range
    ///
    /// # Safety
    ///
    /// `range` 在本链表中。
    pub unsafe fn remove(&mut self, range: NonNull<Range>) {
        self.list.remove(range);
    }

    pub fn pop_front(&mut self) -> Option<NonNull<Range>> {
        self.list.pop_front()
    }
}

impl Default for RangeList {
    fn default() -> Self {
        Self::new()
    }
}
