//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 主机测试用的模拟机器
//!
//! - 物理内存和内核虚拟窗口都是泄漏的、页对齐的主机缓冲区
//! - [`SimMmu`] 只记录每个页目录的页表项
//! - [`TestScheduler`] 为每个测试线程分配一个 CPU 编号

use std::alloc::{alloc_zeroed, Layout};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::arch::{DirHandle, Mmu, MmuFlags, RemapMode};
use crate::config::MAX_CPUS;
use crate::mm::alloc::Allocator;
use crate::mm::page::{PhysAddr, VirtAddr, PAGE_SIZE};
use crate::mm::pmm::{MemoryRegion, Pmm, RegionKind};
use crate::mm::slab::SlabAllocator;
use crate::mm::vmm::{AddressLayout, Vmm};
use crate::sched::{self, Scheduler};

/// 模拟物理内存的起始地址
pub const PHYS_BASE: usize = 0x10_0000;

pub const USER_START: usize = 0x1000_0000;

pub const USER_END: usize = 0x4000_0000;

const KERNEL_DIR: DirHandle = DirHandle(1);

type PageTable = HashMap<usize, (PhysAddr, MmuFlags)>;

fn leak_pages(len: usize) -> usize {
    let layout = Layout::from_size_align(len, PAGE_SIZE).unwrap();
    let ptr = unsafe { alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "host allocation of {} bytes failed", len);
    ptr as usize
}

/// 记录页表项的模拟 MMU
pub struct SimMmu {
    ram: usize,
    ram_len: usize,
    window: usize,
    window_len: usize,
    tables: Mutex<HashMap<DirHandle, PageTable>>,
    destroyed: Mutex<HashSet<DirHandle>>,
    next_dir: AtomicUsize,
    loaded: AtomicUsize,
    loads: AtomicUsize,
}

impl SimMmu {
    /// `ram_len` 字节的模拟内存，从 [`PHYS_BASE`] 开始；内核窗口是它的两倍
    pub fn leak(ram_len: usize) -> &'static SimMmu {
        let window_len = 2 * ram_len;
        let window = leak_pages(window_len);
        assert!(window >= USER_END, "host window below the simulated user space");

        let mut tables = HashMap::new();
        tables.insert(KERNEL_DIR, PageTable::new());
        Box::leak(Box::new(SimMmu {
            ram: leak_pages(ram_len),
            ram_len,
            window,
            window_len,
            tables: Mutex::new(tables),
            destroyed: Mutex::new(HashSet::new()),
            next_dir: AtomicUsize::new(KERNEL_DIR.0 + 1),
            loaded: AtomicUsize::new(KERNEL_DIR.0),
            loads: AtomicUsize::new(0),
        }))
    }

    pub fn kernel_directory(&self) -> DirHandle {
        KERNEL_DIR
    }

    /// 以主机内核窗口为内核空间的地址布局
    pub fn layout(&self) -> AddressLayout {
        AddressLayout {
            kernel_start: VirtAddr(self.window),
            kernel_end: VirtAddr(self.window + self.window_len),
            user_start: VirtAddr(USER_START),
            user_end: VirtAddr(USER_END),
        }
    }

    /// 查找页表项；内核地址回落到共享的内核目录
    pub fn mapping(&self, dir: DirHandle, virt: VirtAddr) -> Option<(PhysAddr, MmuFlags)> {
        let tables = self.tables.lock().unwrap();
        let own = tables.get(&dir).and_then(|t| t.get(&virt.0)).copied();
        if own.is_some() || virt.0 < self.window {
            return own;
        }
        tables.get(&KERNEL_DIR).and_then(|t| t.get(&virt.0)).copied()
    }

    pub fn mapped_pages(&self, dir: DirHandle) -> usize {
        self.tables.lock().unwrap().get(&dir).map_or(0, |t| t.len())
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self, dir: DirHandle) -> bool {
        self.destroyed.lock().unwrap().contains(&dir)
    }
}

impl Mmu for SimMmu {
    fn map(&self, dir: DirHandle, virt: VirtAddr, phys: PhysAddr, flags: MmuFlags) {
        assert!(virt.is_aligned() && phys.is_aligned());
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(&dir).expect("map into unknown directory");
        if table.insert(virt.0, (phys, flags)).is_some() {
            panic!("sim: {} mapped twice in {:?}", virt, dir);
        }
    }

    fn unmap(&self, dir: DirHandle, virt: VirtAddr) {
        let mut tables = self.tables.lock().unwrap();
        let table = tables.get_mut(&dir).expect("unmap from unknown directory");
        if table.remove(&virt.0).is_none() {
            panic!("sim: {} is not mapped in {:?}", virt, dir);
        }
    }

    fn read_flags(&self, dir: DirHandle, virt: VirtAddr) -> MmuFlags {
        self.mapping(dir, virt)
            .map_or(MmuFlags::empty(), |(_, flags)| flags)
    }

    fn physical(&self, dir: DirHandle, virt: VirtAddr) -> Option<PhysAddr> {
        self.mapping(dir, virt).map(|(phys, _)| phys)
    }

    fn invalidate_range(&self, start: VirtAddr, end: VirtAddr) {
        assert!(start <= end);
    }

    fn load(&self, dir: DirHandle) {
        self.loaded.store(dir.0, Ordering::SeqCst);
        self.loads.fetch_add(1, Ordering::SeqCst);
    }

    fn current_directory(&self) -> DirHandle {
        DirHandle(self.loaded.load(Ordering::SeqCst))
    }

    fn create_directory(&self) -> DirHandle {
        let dir = DirHandle(self.next_dir.fetch_add(1, Ordering::SeqCst));
        self.tables.lock().unwrap().insert(dir, PageTable::new());
        dir
    }

    fn destroy_directory(&self, dir: DirHandle) {
        assert_ne!(dir, KERNEL_DIR, "destroying the kernel directory");
        let table = self.tables.lock().unwrap().remove(&dir);
        assert!(table.is_some(), "destroying unknown directory {:?}", dir);
        self.destroyed.lock().unwrap().insert(dir);
    }

    fn remap_physical(&self, phys: PhysAddr, size: usize, _mode: RemapMode) -> VirtAddr {
        assert!(
            phys.0 >= PHYS_BASE && phys.0 + size <= PHYS_BASE + self.ram_len,
            "sim: remap of {}+{:#x} outside simulated RAM",
            phys,
            size
        );
        VirtAddr(self.ram + (phys.0 - PHYS_BASE))
    }

    fn unmap_physical(&self, virt: VirtAddr, size: usize) {
        assert!(virt.0 >= self.ram && virt.0 + size <= self.ram + self.ram_len);
    }
}

thread_local! {
    static CPU: Cell<Option<usize>> = const { Cell::new(None) };
    static SLEEPING: Cell<bool> = const { Cell::new(false) };
}

static NEXT_CPU: AtomicUsize = AtomicUsize::new(0);

/// 每个线程一个 CPU 编号的调度器
pub struct TestScheduler;

impl Scheduler for TestScheduler {
    fn current_cpu(&self) -> usize {
        CPU.with(|cpu| match cpu.get() {
            Some(id) => id,
            None => {
                let id = NEXT_CPU.fetch_add(1, Ordering::Relaxed) % MAX_CPUS;
                cpu.set(Some(id));
                id
            }
        })
    }

    fn current_thread_sleeping(&self) -> bool {
        SLEEPING.with(Cell::get)
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

static TEST_SCHEDULER: TestScheduler = TestScheduler;

pub fn install_scheduler() {
    sched::install(&TEST_SCHEDULER);
}

/// 标记当前测试线程正在睡眠
pub fn set_sleeping(sleeping: bool) {
    SLEEPING.with(|s| s.set(sleeping));
}

/// 固定当前测试线程的 CPU 编号
pub fn set_cpu(cpu: usize) {
    assert!(cpu < MAX_CPUS);
    CPU.with(|c| c.set(Some(cpu)));
}

/// 完整初始化的模拟机器，所有部件都泄漏为 `'static`
pub struct TestMachine {
    pub mmu: &'static SimMmu,
    pub pmm: &'static Pmm,
    pub vmm: &'static Vmm,
    pub slab: &'static SlabAllocator,
    pub alloc: &'static Allocator,
    pub layout: AddressLayout,
}

impl TestMachine {
    pub const RAM: usize = 16 * 1024 * 1024;

    pub fn new() -> Self {
        install_scheduler();
        let mmu = SimMmu::leak(Self::RAM);
        let layout = mmu.layout();
        let pmm: &'static Pmm = Box::leak(Box::new(Pmm::new(
            &[MemoryRegion::new(PHYS_BASE, PHYS_BASE + Self::RAM, RegionKind::Available)],
            mmu,
        )));
        let vmm: &'static Vmm = Box::leak(Box::new(Vmm::new(pmm, mmu, layout)));
        let slab: &'static SlabAllocator = Box::leak(Box::new(SlabAllocator::new(vmm)));
        let alloc: &'static Allocator = Box::leak(Box::new(Allocator::new(slab, vmm)));
        TestMachine {
            mmu,
            pmm,
            vmm,
            slab,
            alloc,
            layout,
        }
    }
}
