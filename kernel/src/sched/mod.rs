//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 调度器接口
//!
//! 内存管理核心不实现调度器，只通过 [`Scheduler`] 查询当前 CPU、
//! 当前线程是否处于睡眠状态，以及在锁竞争时让出 CPU。
//!
//! 内核启动时调用 [`install`] 注册真实调度器；注册之前使用单 CPU、
//! 忙等的后备实现。

use spin::Once;

/// 调度器提供给内存管理的原语
pub trait Scheduler: Send + Sync {
    /// 当前 CPU 编号，必须小于 `config::MAX_CPUS`
    fn current_cpu(&self) -> usize;

    /// 当前线程是否已被挂起（正在进入睡眠）
    fn current_thread_sleeping(&self) -> bool;

    /// 让出 CPU
    fn yield_now(&self);
}

/// 启动早期的后备调度器
struct BootScheduler;

impl Scheduler for BootScheduler {
    fn current_cpu(&self) -> usize {
        0
    }

    fn current_thread_sleeping(&self) -> bool {
        false
    }

    fn yield_now(&self) {
        core::hint::spin_loop();
    }
}

static BOOT_SCHEDULER: BootScheduler = BootScheduler;

static SCHEDULER: Once<&'static dyn Scheduler> = Once::new();

/// 注册调度器（只有第一次调用生效）
pub fn install(scheduler: &'static dyn Scheduler) {
    SCHEDULER.call_once(|| scheduler);
}

/// 当前调度器
#[inline]
pub fn current() -> &'static dyn Scheduler {
    match SCHEDULER.get() {
        Some(scheduler) => *scheduler,
        None => &BOOT_SCHEDULER,
    }
}

/// 当前 CPU 编号
#[inline]
pub fn cpu_id() -> usize {
    current().current_cpu()
}
