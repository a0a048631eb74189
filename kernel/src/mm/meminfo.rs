//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 内核内存统计
//!
//! 提供类似 /proc/meminfo 的内存统计，汇总 PMM、内核地址空间、
//! Range 池、slab 缓存和通用分配器的使用情况。

use core::fmt;

use super::alloc::Allocator;
use super::page::PAGE_SIZE;
use super::pmm::Pmm;
use super::vmm::Vmm;

/// 内存统计信息（类似 /proc/meminfo）
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryInfo {
    // ========== 物理内存 ==========
    /// 可管理的物理内存（字节）
    pub mem_total: usize,
    /// 空闲物理内存（字节）
    pub mem_free: usize,
    /// 已使用物理内存（字节）
    pub mem_used: usize,
    /// PMM 自身元数据（字节）
    pub mem_internal: usize,

    // ========== 内核地址空间 ==========
    /// 内核 Range 数
    pub kernel_ranges: usize,
    /// 内核已映射（字节）
    pub kernel_mapped: usize,
    /// Range 池页数
    pub range_pages: usize,

    // ========== 分配器 ==========
    /// Slab 缓存占用（字节）
    pub slab_bytes: usize,
    /// Slab 分配次数
    pub slab_allocs: usize,
    /// Slab 释放次数
    pub slab_frees: usize,
    /// 停在 per-CPU magazine 中的对象数
    pub slab_cached: usize,
    /// kmalloc 使用中（字节）
    pub heap_used: usize,
    /// kmalloc 直接映射数
    pub heap_direct: usize,
}

impl MemoryInfo {
    /// 收集当前统计
    pub fn collect(pmm: &Pmm, vmm: &Vmm, alloc: &Allocator) -> Self {
        let space = vmm.kernel_context().space();
        let stats = alloc.stats();
        Self {
            mem_total: pmm.total_pages() * PAGE_SIZE,
            mem_free: pmm.free_pages_count() * PAGE_SIZE,
            mem_used: pmm.used_pages() * PAGE_SIZE,
            mem_internal: pmm.internal_bytes(),
            kernel_ranges: space.range_count(),
            kernel_mapped: space.mapped_bytes(),
            range_pages: vmm.range_pool().page_count(),
            slab_bytes: stats.classes.iter().map(|c| c.mem_usage).sum(),
            slab_allocs: stats.classes.iter().map(|c| c.allocs).sum(),
            slab_frees: stats.classes.iter().map(|c| c.frees).sum(),
            slab_cached: stats.classes.iter().map(|c| c.cached_objects).sum(),
            heap_used: stats.bytes_in_use,
            heap_direct: stats.direct_mappings,
        }
    }

    /// 空闲内存少于 5% 时认为内存紧张
    pub fn is_low(&self) -> bool {
        self.mem_total > 0 && self.mem_free * 100 / self.mem_total < 5
    }
}

impl fmt::Display for MemoryInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Memory Info:")?;
        writeln!(f, "  MemTotal:       {:>10} kB", self.mem_total / 1024)?;
        writeln!(f, "  MemFree:        {:>10} kB", self.mem_free / 1024)?;
        writeln!(f, "  MemUsed:        {:>10} kB", self.mem_used / 1024)?;
        writeln!(f, "  MemInternal:    {:>10} kB", self.mem_internal / 1024)?;
        writeln!(f)?;
        writeln!(f, "  KernelRanges:   {:>10}", self.kernel_ranges)?;
        writeln!(f, "  KernelMapped:   {:>10} kB", self.kernel_mapped / 1024)?;
        writeln!(f, "  RangePages:     {:>10}", self.range_pages)?;
        writeln!(f)?;
        writeln!(f, "  Slab:           {:>10} kB", self.slab_bytes / 1024)?;
        writeln!(f, "  SlabAllocs:     {:>10}", self.slab_allocs)?;
        writeln!(f, "  SlabFrees:      {:>10}", self.slab_frees)?;
        writeln!(f, "  SlabCached:     {:>10}", self.slab_cached)?;
        writeln!(f, "  HeapUsed:       {:>10} B", self.heap_used)?;
        write!(f, "  HeapDirect:     {:>10}", self.heap_direct)
    }
}
