//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 架构相关接口
//!
//! 页表操作、TLB 刷新、页目录切换都由体系结构层实现，
//! 内存管理核心只通过 [`Mmu`] 调用它们。

use bitflags::bitflags;

use crate::mm::page::{PhysAddr, VirtAddr};

bitflags! {
    /// 页表项保护标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct MmuFlags: u32 {
        /// 有效
        const PRESENT = 0x01;
        /// 可写
        const WRITE   = 0x02;
        /// 用户态可访问
        const USER    = 0x04;
        /// 不可执行
        const NOEXEC  = 0x08;
        /// 全局（切换地址空间不刷新）
        const GLOBAL  = 0x10;
        /// 写合并
        const WC      = 0x20;
        /// 写通
        const WT      = 0x40;
        /// 不可缓存
        const UC      = 0x80;
    }
}

/// 页目录句柄（例如根页表的物理地址）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DirHandle(pub usize);

/// 物理地址重映射方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemapMode {
    /// 永久映射，直到显式 `unmap_physical`
    Permanent,
    /// 临时映射，使用完毕立即 `unmap_physical`
    Temporary,
}

/// 体系结构 MMU 原语
///
/// 所有地址都按页对齐，`map` / `unmap` 每次只处理一页。
pub trait Mmu: Send + Sync {
    /// 建立一页映射
    fn map(&self, dir: DirHandle, virt: VirtAddr, phys: PhysAddr, flags: MmuFlags);

    /// 移除一页映射
    fn unmap(&self, dir: DirHandle, virt: VirtAddr);

    /// 读取页表项标志，未映射时返回空
    fn read_flags(&self, dir: DirHandle, virt: VirtAddr) -> MmuFlags;

    /// 查询虚拟页对应的物理页
    fn physical(&self, dir: DirHandle, virt: VirtAddr) -> Option<PhysAddr>;

    /// 刷新 `[start, end)` 的 TLB
    fn invalidate_range(&self, start: VirtAddr, end: VirtAddr);

    /// 在当前 CPU 上加载页目录
    fn load(&self, dir: DirHandle);

    /// 当前 CPU 正在使用的页目录
    fn current_directory(&self) -> DirHandle;

    /// 创建新的页目录（内核部分与内核目录共享）
    fn create_directory(&self) -> DirHandle;

    /// 释放页目录
    fn destroy_directory(&self, dir: DirHandle);

    /// 把物理区间映射到内核可访问的虚拟地址
    fn remap_physical(&self, phys: PhysAddr, size: usize, mode: RemapMode) -> VirtAddr;

    /// 撤销 `remap_physical` 建立的映射
    fn unmap_physical(&self, virt: VirtAddr, size: usize);
}
