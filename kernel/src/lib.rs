//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! Rux 内核内存管理核心
//!
//! - PMM：按 zone / section 管理物理页
//! - VMM：地址空间、Range 和页目录切换
//! - Slab：固定大小对象缓存
//! - kmalloc：按大小等级分配，超大请求直接映射
//!
//! 体系结构和调度器通过 [`arch::Mmu`] 和 [`sched::Scheduler`] 接入。

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod arch;
pub mod config;
pub mod errno;
pub mod list;
pub mod mm;
pub mod sched;
pub mod sync;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod tests;
