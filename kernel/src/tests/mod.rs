//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 跨模块场景测试
//!
//! 各模块自己的单元测试在模块内的 `mod tests` 中；这里放需要整台
//! 模拟机器的场景：多线程分配、全局初始化、长序列操作后的不变量。

mod global_heap;
mod smp_alloc;
