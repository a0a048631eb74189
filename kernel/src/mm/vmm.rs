//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 虚拟内存管理器 (VMM)
//!
//! 每个地址空间 (Space) 维护一个按地址排序、互不重叠的 Range 链表。
//! 内核 Space 全局唯一；每个进程的用户 Space 放在它的 Context 里，
//! Context 还持有该进程的页目录句柄。
//!
//! 地址解析规则：
//! - 不低于内核边界的地址总是属于内核 Space
//! - 其余地址属于当前 CPU 的当前 Context
//!
//! 内核 Space 中带 `ALLOC` 的映射立即分配物理页；用户 Space 的映射
//! 由缺页处理按需填充。
//!
//! 锁顺序：Space 锁总是先于其下的 section 锁获取。

use alloc::boxed::Box;
use core::panic::Location;
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use bitflags::bitflags;
use log::{debug, error, info, warn};
use thiserror::Error;

use super::page::{checked_page_align_up, PhysAddr, VirtAddr, PAGE_MASK, PAGE_SIZE};
use super::pmm::{Pmm, PmmError, ZONE_DEFAULT};
use super::range::{RangeList, RangePool, VmFlags};
use crate::arch::{DirHandle, Mmu, MmuFlags};
use crate::config;
use crate::errno::Errno;
use crate::sched;
use crate::sync::Mutex;

bitflags! {
    /// `validate` 请求的访问类型
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ValidateFlags: u32 {
        /// 来自用户态的访问
        const USER  = 0x1;
        /// 写访问
        const WRITE = 0x2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmmError {
    #[error("zero-sized mapping")]
    ZeroSize,
    #[error("no free hole of {0:#x} bytes")]
    NoSpace(usize),
    #[error("fixed address {0} is not available")]
    FixedUnavailable(VirtAddr),
    #[error("address {0} lies outside the current space")]
    OutsideSpace(VirtAddr),
    #[error("no range mapped at {0}")]
    NotMapped(VirtAddr),
    #[error(transparent)]
    Pmm(#[from] PmmError),
}

impl VmmError {
    pub fn errno(&self) -> Errno {
        match self {
            Self::ZeroSize | Self::NotMapped(_) => Errno::InvalidArgument,
            Self::NoSpace(_) => Errno::OutOfMemory,
            Self::FixedUnavailable(_) => Errno::FileExists,
            Self::OutsideSpace(_) => Errno::BadAddress,
            Self::Pmm(e) => e.errno(),
        }
    }
}

/// 内核与用户地址空间边界
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressLayout {
    pub kernel_start: VirtAddr,
    pub kernel_end: VirtAddr,
    pub user_start: VirtAddr,
    pub user_end: VirtAddr,
}

impl Default for AddressLayout {
    fn default() -> Self {
        Self {
            kernel_start: VirtAddr(config::KERNEL_SPACE_START),
            kernel_end: VirtAddr(config::KERNEL_SPACE_END),
            user_start: VirtAddr(config::USER_SPACE_START),
            user_end: VirtAddr(config::USER_SPACE_END),
        }
    }
}

/// 一个地址空间 `[start, end)` 及其 Range 链表
pub struct Space {
    start: VirtAddr,
    end: VirtAddr,
    ranges: Mutex<RangeList>,
}

impl Space {
    fn new(name: &'static str, start: VirtAddr, end: VirtAddr) -> Self {
        Self {
            start,
            end,
            ranges: Mutex::new(name, RangeList::new()),
        }
    }

    pub fn start(&self) -> VirtAddr {
        self.start
    }

    pub fn end(&self) -> VirtAddr {
        self.end
    }

    pub fn contains(&self, addr: VirtAddr) -> bool {
        addr >= self.start && addr < self.end
    }

    pub fn contains_span(&self, start: VirtAddr, end: VirtAddr) -> bool {
        start >= self.start && end <= self.end && start < end
    }

    pub fn range_count(&self) -> usize {
        self.ranges.lock().len()
    }

    /// 所有 Range 的总字节数
    pub fn mapped_bytes(&self) -> usize {
        self.ranges.lock().iter().map(|r| r.size()).sum()
    }

    /// 在 Space 锁内访问 Range 链表
    pub fn with_ranges<R>(&self, f: impl FnOnce(&RangeList) -> R) -> R {
        f(&self.ranges.lock())
    }
}

/// 地址空间与页目录
pub struct Context {
    space: Space,
    dir: DirHandle,
}

impl Context {
    fn new(name: &'static str, start: VirtAddr, end: VirtAddr, dir: DirHandle) -> Self {
        Self {
            space: Space::new(name, start, end),
            dir,
        }
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn directory(&self) -> DirHandle {
        self.dir
    }
}

/// 新 Range 的物理页来源
#[derive(Clone, Copy)]
enum Backing {
    /// 缺页时由外部处理
    Lazy,
    /// 立即从 PMM 分配
    Eager,
    /// 映射到给定的连续物理区间
    Physical(PhysAddr),
}

/// 虚拟内存管理器
pub struct Vmm {
    pmm: &'static Pmm,
    mmu: &'static dyn Mmu,
    pool: RangePool,
    layout: AddressLayout,
    kernel: Context,
    /// 每个 CPU 的当前 Context，空指针表示内核 Context
    current: [AtomicPtr<Context>; config::MAX_CPUS],
}

impl Vmm {
    pub fn new(pmm: &'static Pmm, mmu: &'static dyn Mmu, layout: AddressLayout) -> Self {
        assert!(
            layout.user_end <= layout.kernel_start && layout.user_start < layout.user_end,
            "mm: user space {}-{} must lie below kernel space at {}",
            layout.user_start,
            layout.user_end,
            layout.kernel_start
        );

        let dir = mmu.current_directory();
        info!(
            "vmm: kernel space {}-{}, user space {}-{}",
            layout.kernel_start, layout.kernel_end, layout.user_start, layout.user_end
        );

        Self {
            pmm,
            mmu,
            pool: RangePool::new(pmm, mmu),
            layout,
            kernel: Context::new("kernel space", layout.kernel_start, layout.kernel_end, dir),
            current: [const { AtomicPtr::new(ptr::null_mut()) }; config::MAX_CPUS],
        }
    }

    pub fn layout(&self) -> &AddressLayout {
        &self.layout
    }

    /// 内核映射使用的地址提示
    pub fn kernel_base(&self) -> VirtAddr {
        self.layout.kernel_start
    }

    pub fn kernel_context(&self) -> &Context {
        &self.kernel
    }

    pub fn range_pool(&self) -> &RangePool {
        &self.pool
    }

    fn cpu(&self) -> usize {
        let cpu = sched::cpu_id();
        if cpu >= config::MAX_CPUS {
            panic!("mm: Invalid CPU ID {}", cpu);
        }
        cpu
    }

    fn is_kernel(&self, ctx: &Context) -> bool {
        ptr::eq(ctx, &self.kernel)
    }

    fn context_ptr(&self, ctx: &Context) -> *mut Context {
        if self.is_kernel(ctx) {
            ptr::null_mut()
        } else {
            ctx as *const Context as *mut Context
        }
    }

    /// 当前 CPU 的当前 Context
    pub fn current_context(&self) -> &Context {
        let ctx = self.current[self.cpu()].load(Ordering::Acquire);
        if ctx.is_null() {
            &self.kernel
        } else {
            // SAFETY: destroy_context 在释放 Context 之前会切换走
            unsafe { &*ctx }
        }
    }

    /// 找到地址所属的 Context
    fn resolve(&self, addr: VirtAddr) -> Result<&Context, VmmError> {
        if addr >= self.layout.kernel_start {
            return Ok(&self.kernel);
        }
        let ctx = self.current_context();
        if addr.is_null() || ctx.space.contains(addr) {
            Ok(ctx)
        } else {
            Err(VmmError::OutsideSpace(addr))
        }
    }

    /// 映射一段虚拟内存
    ///
    /// `hint` 为空时从当前 Space 起始处查找。带 `FIXED` 时必须恰好映射在
    /// `hint`，否则失败。内核 Space 中带 `ALLOC` 的映射立即分配物理页。
    pub fn map(
        &self,
        hint: VirtAddr,
        size: usize,
        vm_flags: VmFlags,
        mmu_flags: MmuFlags,
    ) -> Result<VirtAddr, VmmError> {
        let ctx = self.resolve(hint)?;
        let backing = if vm_flags.contains(VmFlags::ALLOC) && self.is_kernel(ctx) {
            Backing::Eager
        } else {
            Backing::Lazy
        };
        self.map_in(ctx, hint, size, vm_flags, mmu_flags, backing)
    }

    fn map_in(
        &self,
        ctx: &Context,
        hint: VirtAddr,
        size: usize,
        vm_flags: VmFlags,
        mmu_flags: MmuFlags,
        backing: Backing,
    ) -> Result<VirtAddr, VmmError> {
        if size == 0 {
            return Err(VmmError::ZeroSize);
        }
        let hint = hint.floor();
        let size = checked_page_align_up(size).ok_or(VmmError::NoSpace(size))?;
        let space = &ctx.space;

        let mut ranges = space.ranges.lock();
        let start = ranges
            .find_free(space.start, space.end, hint, size)
            .ok_or(VmmError::NoSpace(size))?;

        if vm_flags.contains(VmFlags::FIXED) && start != hint {
            warn!(
                "vmm: fixed mapping at {} unavailable, first hole is {}",
                hint, start
            );
            return Err(VmmError::FixedUnavailable(hint));
        }

        let flags = match backing {
            Backing::Lazy => vm_flags,
            Backing::Eager | Backing::Physical(_) => vm_flags | VmFlags::MAPPED,
        };
        let range = self.pool.create_range(start, start.add(size), flags, mmu_flags)?;
        // SAFETY: 新记录，不在任何链表中
        unsafe { ranges.insert(space.start, space.end, range) };

        match backing {
            Backing::Lazy => {}
            Backing::Eager => {
                for offset in (0..size).step_by(PAGE_SIZE) {
                    let phys = self.pmm.allocate(ZONE_DEFAULT)?;
                    self.mmu.map(ctx.dir, start.add(offset), phys, mmu_flags);
                }
            }
            Backing::Physical(base) => {
                for offset in (0..size).step_by(PAGE_SIZE) {
                    self.mmu.map(ctx.dir, start.add(offset), base.add(offset), mmu_flags);
                }
            }
        }

        Ok(start)
    }

    /// 解除映射
    ///
    /// `[addr, addr + size)` 必须与某个 Range 完全一致；部分解除映射是致命错误。
    #[track_caller]
    pub fn unmap(&self, addr: VirtAddr, size: usize) -> Result<(), VmmError> {
        let caller = Location::caller();
        if size == 0 {
            return Err(VmmError::ZeroSize);
        }
        let ctx = self.resolve(addr)?;
        let start = addr.floor();
        let end = addr
            .0
            .checked_add(size)
            .and_then(checked_page_align_up)
            .map(VirtAddr)
            .ok_or(VmmError::OutsideSpace(addr))?;

        let mut ranges = ctx.space.ranges.lock();
        let Some(range) = ranges.find(start) else {
            warn!(
                "vmm: unmap of {} ({:#x} bytes) from {} matches no range",
                addr, size, caller
            );
            return Err(VmmError::NotMapped(addr));
        };

        // SAFETY: 记录在链表中，且持有 Space 锁
        let r = unsafe { range.as_ref() };
        if r.start() != start || r.end() != end {
            error!("vmm: refusing to split range {} for {}", r, caller);
            panic!(
                "mm: partial unmap of range {} with {}-{} requested by {}",
                r, start, end, caller
            );
        }

        // SAFETY: 同上
        unsafe { ranges.remove(range) };
        self.pool.destroy_range(range, ctx.dir);
        Ok(())
    }

    /// 检查 `[addr, addr + size)` 是否完全落在一个 Space 内，
    /// 且每个覆盖它的 Range 都允许请求的访问
    pub fn validate(&self, addr: VirtAddr, size: usize, flags: ValidateFlags) -> bool {
        if size == 0 {
            return false;
        }
        let Some(end) = addr.0.checked_add(size).and_then(checked_page_align_up) else {
            return false;
        };
        let start = addr.floor();
        let end = VirtAddr(end);

        let ctx = if start >= self.layout.kernel_start {
            &self.kernel
        } else {
            self.current_context()
        };
        if !ctx.space.contains_span(start, end) {
            return false;
        }

        let user = flags.contains(ValidateFlags::USER);
        let write = flags.contains(ValidateFlags::WRITE);

        let ranges = ctx.space.ranges.lock();
        let mut cursor = start;
        for r in ranges.iter() {
            if r.end() <= cursor {
                continue;
            }
            if r.start() > cursor {
                return false;
            }
            let prot = r.mmu_flags();
            if prot.contains(MmuFlags::USER) != user {
                return false;
            }
            if write && !prot.contains(MmuFlags::WRITE) {
                return false;
            }
            cursor = r.end();
            if cursor >= end {
                return true;
            }
        }
        false
    }

    /// 切换当前 CPU 的 Context
    pub fn switch(&self, ctx: &Context) {
        let slot = &self.current[self.cpu()];
        let ptr = self.context_ptr(ctx);
        if slot.load(Ordering::Acquire) == ptr {
            return;
        }
        slot.store(ptr, Ordering::Release);
        self.mmu.load(ctx.dir);
    }

    /// 创建用户 Context
    pub fn create_context(&self) -> Box<Context> {
        let dir = self.mmu.create_directory();
        debug!("vmm: new context with directory {:?}", dir);
        Box::new(Context::new(
            "user space",
            self.layout.user_start,
            self.layout.user_end,
            dir,
        ))
    }

    /// 销毁用户 Context
    ///
    /// 临时切换进该 Context，拆除所有 Range，切换回来后释放页目录。
    pub fn destroy_context(&self, ctx: Box<Context>) {
        assert!(!self.is_kernel(&ctx), "mm: destroying the kernel context");

        let cpu = self.cpu();
        let target = self.context_ptr(&ctx);
        let previous = self.current[cpu].load(Ordering::Acquire);

        self.switch(&ctx);
        {
            let mut ranges = ctx.space.ranges.lock();
            while let Some(range) = ranges.pop_front() {
                self.pool.destroy_range(range, ctx.dir);
            }
        }

        if previous.is_null() || previous == target {
            self.switch(&self.kernel);
        } else {
            // SAFETY: 之前的 Context 仍然存活
            self.switch(unsafe { &*previous });
        }

        self.mmu.destroy_directory(ctx.dir);
        debug!("vmm: destroyed context with directory {:?}", ctx.dir);
    }

    /// 映射设备内存（不可缓存，物理页不归还 PMM）
    pub fn map_mmio(&self, phys: PhysAddr, size: usize) -> Result<VirtAddr, VmmError> {
        let offset = phys.0 & PAGE_MASK;
        let span = size.checked_add(offset).ok_or(VmmError::NoSpace(size))?;
        let virt = self.map_in(
            &self.kernel,
            self.layout.kernel_start,
            span,
            VmFlags::DEVICE,
            MmuFlags::PRESENT | MmuFlags::WRITE | MmuFlags::UC | MmuFlags::NOEXEC,
            Backing::Physical(phys.floor()),
        )?;
        Ok(virt.add(offset))
    }

    #[track_caller]
    pub fn unmap_mmio(&self, virt: VirtAddr, size: usize) -> Result<(), VmmError> {
        let offset = virt.0 & PAGE_MASK;
        let span = size.checked_add(offset).ok_or(VmmError::OutsideSpace(virt))?;
        self.unmap(virt.floor(), span)
    }

    /// 映射物理连续的 DMA 缓冲区，返回虚拟地址和物理地址
    pub fn map_dma(&self, size: usize) -> Result<(VirtAddr, PhysAddr), VmmError> {
        if size == 0 {
            return Err(VmmError::ZeroSize);
        }
        let size = checked_page_align_up(size).ok_or(VmmError::NoSpace(size))?;
        let pages = size / PAGE_SIZE;
        let phys = self.pmm.allocate_pages(pages, ZONE_DEFAULT)?;

        match self.map_in(
            &self.kernel,
            self.layout.kernel_start,
            size,
            VmFlags::ALLOC,
            MmuFlags::PRESENT | MmuFlags::WRITE | MmuFlags::UC,
            Backing::Physical(phys),
        ) {
            Ok(virt) => Ok((virt, phys)),
            Err(e) => {
                self.pmm.free_pages(phys, pages);
                Err(e)
            }
        }
    }

    /// 打印 Context 的所有 Range，并检查链表完整性
    pub fn dump_context(&self, ctx: &Context) {
        let ranges = ctx.space.ranges.lock();
        ranges.verify_links();
        for r in ranges.iter() {
            info!(
                "vmm: region {} - {} (flags {:?}, mmu flags {:?})",
                r.start(),
                r.end(),
                r.vm_flags(),
                r.mmu_flags()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestMachine, USER_END, USER_START};

    const RW: MmuFlags = MmuFlags::PRESENT.union(MmuFlags::WRITE);
    const USER_RW: MmuFlags = RW.union(MmuFlags::USER);

    #[test]
    fn kernel_alloc_mapping_is_backed_eagerly() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        let space = vmm.kernel_context().space();
        let ranges_before = space.range_count();
        let used_before = m.pmm.used_pages();

        let addr = vmm.map(vmm.kernel_base(), 3 * PAGE_SIZE + 1, VmFlags::ALLOC, RW).unwrap();
        assert!(space.contains(addr));
        assert_eq!(space.range_count(), ranges_before + 1);
        for i in 0..4 {
            let (_, flags) = m
                .mmu
                .mapping(m.mmu.kernel_directory(), addr.add(i * PAGE_SIZE))
                .unwrap();
            assert_eq!(flags, RW);
        }

        vmm.unmap(addr, 4 * PAGE_SIZE).unwrap();
        assert_eq!(space.range_count(), ranges_before);
        assert_eq!(m.pmm.used_pages(), used_before);
        assert!(m.mmu.mapping(m.mmu.kernel_directory(), addr).is_none());
    }

    #[test]
    fn null_hint_uses_current_space() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        // 当前是内核 Context
        let addr = vmm.map(VirtAddr(0), PAGE_SIZE, VmFlags::empty(), RW).unwrap();
        assert!(vmm.kernel_context().space().contains(addr));

        let ctx = vmm.create_context();
        vmm.switch(&ctx);
        let user = vmm.map(VirtAddr(0), PAGE_SIZE, VmFlags::ALLOC, USER_RW).unwrap();
        assert_eq!(user, VirtAddr(USER_START));
        // 用户映射不立即分配物理页
        assert_eq!(m.mmu.mapped_pages(ctx.directory()), 0);
        assert_eq!(ctx.space().range_count(), 1);

        // 高于内核边界的地址仍然落在内核 Space
        let k = vmm.map(vmm.kernel_base(), PAGE_SIZE, VmFlags::ALLOC, RW).unwrap();
        assert!(vmm.kernel_context().space().contains(k));
        vmm.destroy_context(ctx);
    }

    #[test]
    fn fixed_mapping_is_strict() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        let base = vmm.kernel_base().add(0x100_0000);
        vmm.map(base, 2 * PAGE_SIZE, VmFlags::FIXED, RW).unwrap();
        assert_eq!(
            vmm.map(base.add(PAGE_SIZE), PAGE_SIZE, VmFlags::FIXED, RW),
            Err(VmmError::FixedUnavailable(base.add(PAGE_SIZE)))
        );
        // 不带 FIXED 时挪到下一个空洞
        assert_eq!(
            vmm.map(base.add(PAGE_SIZE), PAGE_SIZE, VmFlags::empty(), RW),
            Ok(base.add(2 * PAGE_SIZE))
        );
    }

    #[test]
    fn caller_errors_are_returned() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        assert_eq!(vmm.map(vmm.kernel_base(), 0, VmFlags::empty(), RW), Err(VmmError::ZeroSize));
        assert_eq!(
            vmm.map(VirtAddr(USER_START), PAGE_SIZE, VmFlags::empty(), RW),
            Err(VmmError::OutsideSpace(VirtAddr(USER_START)))
        );
        let huge = m.layout.kernel_end.0 - m.layout.kernel_start.0 + PAGE_SIZE;
        assert!(matches!(
            vmm.map(vmm.kernel_base(), huge, VmFlags::empty(), RW),
            Err(VmmError::NoSpace(_))
        ));
        let unmapped = vmm.kernel_base().add(0x100_0000);
        assert_eq!(vmm.unmap(unmapped, PAGE_SIZE), Err(VmmError::NotMapped(unmapped)));
        assert_eq!(VmmError::NoSpace(1).errno(), Errno::OutOfMemory);
    }

    #[test]
    #[should_panic(expected = "partial unmap")]
    fn partial_unmap_is_fatal() {
        let m = TestMachine::new();
        let addr = m.vmm.map(m.vmm.kernel_base(), 4 * PAGE_SIZE, VmFlags::ALLOC, RW).unwrap();
        let _ = m.vmm.unmap(addr, 2 * PAGE_SIZE);
    }

    #[test]
    #[should_panic(expected = "partial unmap")]
    fn unmap_from_the_middle_is_fatal() {
        let m = TestMachine::new();
        let addr = m.vmm.map(m.vmm.kernel_base(), 4 * PAGE_SIZE, VmFlags::ALLOC, RW).unwrap();
        let _ = m.vmm.unmap(addr.add(PAGE_SIZE), 3 * PAGE_SIZE);
    }

    #[test]
    fn validate_checks_coverage_and_protection() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        let ctx = vmm.create_context();
        vmm.switch(&ctx);

        let base = VirtAddr(USER_START);
        vmm.map(base, 2 * PAGE_SIZE, VmFlags::FIXED, USER_RW).unwrap();
        let read_only = MmuFlags::PRESENT | MmuFlags::USER;
        vmm.map(base.add(2 * PAGE_SIZE), PAGE_SIZE, VmFlags::FIXED, read_only).unwrap();
        vmm.map(base.add(4 * PAGE_SIZE), PAGE_SIZE, VmFlags::FIXED, USER_RW).unwrap();

        let user = ValidateFlags::USER;
        let user_write = ValidateFlags::USER | ValidateFlags::WRITE;

        // 跨两个相邻 Range
        assert!(vmm.validate(base.add(100), 3 * PAGE_SIZE - 200, user));
        assert!(vmm.validate(base, 2 * PAGE_SIZE, user_write));
        // 第三页只读
        assert!(!vmm.validate(base, 3 * PAGE_SIZE, user_write));
        // 第四页没有映射
        assert!(!vmm.validate(base, 5 * PAGE_SIZE, user));
        // 内核访问类型与用户 Range 不匹配
        assert!(!vmm.validate(base, PAGE_SIZE, ValidateFlags::empty()));
        // 越过用户空间上界
        assert!(!vmm.validate(VirtAddr(USER_END - PAGE_SIZE), 2 * PAGE_SIZE, user));
        assert!(!vmm.validate(base, 0, user));

        // 内核 Space 永远不允许用户访问
        let k = vmm.map(vmm.kernel_base(), PAGE_SIZE, VmFlags::ALLOC, RW).unwrap();
        assert!(vmm.validate(k, PAGE_SIZE, ValidateFlags::WRITE));
        assert!(!vmm.validate(k, PAGE_SIZE, user));

        vmm.destroy_context(ctx);
    }

    #[test]
    fn sizes_reaching_the_top_of_the_address_space_are_rejected() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        let space = vmm.kernel_context().space();
        let ranges = space.range_count();

        let top = VirtAddr(usize::MAX - 0x800);
        assert!(!vmm.validate(top, 0x100, ValidateFlags::USER));
        assert!(!vmm.validate(top, 0x100, ValidateFlags::empty()));

        let huge = vmm.map(vmm.kernel_base(), usize::MAX - 2048, VmFlags::ALLOC, RW);
        assert!(matches!(huge, Err(VmmError::NoSpace(_))));
        assert!(matches!(vmm.map_dma(usize::MAX - 10), Err(VmmError::NoSpace(_))));
        let mmio = vmm.map_mmio(PhysAddr(0x1000_0010), usize::MAX - 8);
        assert!(matches!(mmio, Err(VmmError::NoSpace(_))));

        let a = vmm.map(vmm.kernel_base(), PAGE_SIZE, VmFlags::ALLOC, RW).unwrap();
        let past_top = vmm.unmap(a, usize::MAX - a.0 - 10);
        assert!(matches!(past_top, Err(VmmError::OutsideSpace(_))));
        assert_eq!(space.range_count(), ranges + 1);
        vmm.unmap(a, PAGE_SIZE).unwrap();
        assert_eq!(space.range_count(), ranges);
    }

    #[test]
    fn switch_is_a_noop_when_current() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        let ctx = vmm.create_context();
        let loads = m.mmu.load_count();

        vmm.switch(&ctx);
        vmm.switch(&ctx);
        assert_eq!(m.mmu.load_count(), loads + 1);
        assert!(ptr::eq(vmm.current_context(), &*ctx));

        vmm.switch(vmm.kernel_context());
        assert!(ptr::eq(vmm.current_context(), vmm.kernel_context()));
        assert_eq!(m.mmu.load_count(), loads + 2);
        vmm.destroy_context(ctx);
    }

    #[test]
    fn destroy_context_tears_everything_down() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        let used_before = m.pmm.used_pages();
        let live_before = vmm.range_pool().live_ranges();

        let ctx = vmm.create_context();
        let dir = ctx.directory();
        vmm.switch(&ctx);
        let a = vmm.map(VirtAddr(0), 4 * PAGE_SIZE, VmFlags::ALLOC, USER_RW).unwrap();
        vmm.map(VirtAddr(0), PAGE_SIZE, VmFlags::ALLOC, USER_RW).unwrap();
        // 模拟缺页处理填充的一页
        let frame = m.pmm.allocate(ZONE_DEFAULT).unwrap();
        m.mmu.map(dir, a, frame, USER_RW);

        vmm.switch(vmm.kernel_context());
        vmm.destroy_context(ctx);

        assert!(m.mmu.is_destroyed(dir));
        assert_eq!(m.mmu.mapped_pages(dir), 0);
        assert_eq!(vmm.range_pool().live_ranges(), live_before);
        assert_eq!(m.pmm.used_pages(), used_before);
        assert!(ptr::eq(vmm.current_context(), vmm.kernel_context()));
    }

    #[test]
    fn mmio_frames_are_not_returned_to_the_pmm() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        let device = PhysAddr(0xFEE0_0000 + 0x30);
        let used = m.pmm.used_pages();

        let virt = vmm.map_mmio(device, 0x100).unwrap();
        assert_eq!(virt.0 & PAGE_MASK, 0x30);
        let (phys, flags) = m.mmu.mapping(m.mmu.kernel_directory(), virt.floor()).unwrap();
        assert_eq!(phys, device.floor());
        assert!(flags.contains(MmuFlags::UC));

        vmm.unmap_mmio(virt, 0x100).unwrap();
        assert_eq!(m.pmm.used_pages(), used);
    }

    #[test]
    fn dma_buffers_are_contiguous() {
        let m = TestMachine::new();
        let vmm = m.vmm;
        let used = m.pmm.used_pages();

        let (virt, phys) = vmm.map_dma(3 * PAGE_SIZE).unwrap();
        for i in 0..3 {
            let (p, _) = m.mmu.mapping(m.mmu.kernel_directory(), virt.add(i * PAGE_SIZE)).unwrap();
            assert_eq!(p, phys.add(i * PAGE_SIZE));
        }
        vmm.unmap(virt, 3 * PAGE_SIZE).unwrap();
        assert_eq!(m.pmm.used_pages(), used);
        vmm.dump_context(vmm.kernel_context());
    }
}
