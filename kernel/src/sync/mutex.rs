//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 睡眠互斥锁
//!
//! 参考 Linux: kernel/locking/mutex.c
//!
//! 获取失败时调用调度器让出 CPU，而不是原地自旋。
//! 锁本身由 `spin::Mutex` 提供，守护对象离开作用域时自动释放。

use core::fmt;

use crate::sched;

pub type MutexGuard<'a, T> = spin::MutexGuard<'a, T>;

/// 睡眠互斥锁
pub struct Mutex<T: ?Sized> {
    /// 锁名称，用于诊断
    name: &'static str,
    inner: spin::Mutex<T>,
}

impl<T> Mutex<T> {
    /// 创建新互斥锁
    pub const fn new(name: &'static str, value: T) -> Self {
        Self {
            name,
            inner: spin::Mutex::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// 获取锁
    ///
    /// 如果锁已被占用，则让出 CPU 后重试
    pub fn lock(&self) -> MutexGuard<'_, T> {
        loop {
            if let Some(guard) = self.inner.try_lock() {
                return guard;
            }
            sched::current().yield_now();
        }
    }

    /// 尝试获取锁（非阻塞）
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.inner.try_lock()
    }

    /// 锁是否被占用
    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T: ?Sized> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.name)
            .field("locked", &self.is_locked())
            .finish()
    }
}
