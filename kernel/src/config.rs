//! kmem 配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 内存配置
// ============================================================

/// 页大小
pub const PAGE_SIZE: usize = 4096;

/// 页大小位移
pub const PAGE_SHIFT: usize = 12;

/// 最大CPU数量
pub const MAX_CPUS: usize = 8;

/// 每个缓存保留的完全空闲 slab 上限
pub const SLAB_MAX_FREE: usize = 2;

// ============================================================
// 地址空间布局
// ============================================================

/// 内核地址空间起始
pub const KERNEL_SPACE_START: usize = 0xffffff0000000000;

/// 内核地址空间结束
pub const KERNEL_SPACE_END: usize = 0xfffffffffffff000;

/// 用户地址空间起始
pub const USER_SPACE_START: usize = 0x1000;

/// 用户地址空间结束
pub const USER_SPACE_END: usize = 0x800000000000;

// ============================================================
// 调试配置
// ============================================================

/// 是否在分配头中记录调用者
pub const ALLOC_TRACKING: bool = true;
