//! 同步原语 (Synchronization Primitives)
//!
//! 两类锁：
//! - [`SpinLock`]: 忙等锁，用于 Range 池的页位图和页链表，以及 slab 的 per-CPU magazine
//! - [`Mutex`]: 睡眠锁，竞争时让出 CPU，用于 Section、Cache、Space
//!
//! 持有睡眠锁的调用可能发生上下文切换，不能在关中断时调用。

pub mod mutex;

pub use mutex::{Mutex, MutexGuard};

/// 忙等锁
pub type SpinLock<T> = spin::Mutex<T>;
