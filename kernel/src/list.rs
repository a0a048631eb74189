//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 侵入式双向链表
//!
//! 参考 Linux: include/linux/list.h
//!
//! 用途：
//! - 地址空间的有序 Range 链表
//! - slab 缓存的 free / partial / full 链表
//! - Range 池的页链表
//!
//! 设计特点：
//! - 侵入式链表：`Links` 直接嵌入节点结构中，不需要额外分配
//! - 非循环：表头保存 head / tail，节点可以放在任意内存（物理页、slab 页）
//! - 链接字段使用 `Cell`，调用者持有外层锁时通过共享引用修改

use core::cell::Cell;
use core::marker::PhantomData;
use core::ptr::NonNull;

/// 嵌入节点的链接字段
pub struct Links<T> {
    next: Cell<Option<NonNull<T>>>,
    prev: Cell<Option<NonNull<T>>>,
}

impl<T> Links<T> {
    pub const fn new() -> Self {
        Self {
            next: Cell::new(None),
            prev: Cell::new(None),
        }
    }

    pub fn next(&self) -> Option<NonNull<T>> {
        self.next.get()
    }

    pub fn prev(&self) -> Option<NonNull<T>> {
        self.prev.get()
    }

    fn clear(&self) {
        self.next.set(None);
        self.prev.set(None);
    }
}

impl<T> Default for Links<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// 可以挂入 [`List`] 的节点
///
/// # Safety
///
/// `links` 必须总是返回同一个嵌入字段。
pub unsafe trait Linked: Sized {
    fn links(&self) -> &Links<Self>;
}

/// 侵入式双向链表表头
///
/// 链表不拥有节点。插入时调用者保证节点在从链表移除之前一直有效，
/// 且同一时刻只属于一个链表。
pub struct List<T: Linked> {
    head: Option<NonNull<T>>,
    tail: Option<NonNull<T>>,
    len: usize,
}

// 节点只在外层锁保护下访问
unsafe impl<T: Linked> Send for List<T> {}

impl<T: Linked> List<T> {
    pub const fn new() -> Self {
        Self {
            head: None,
            tail: None,
            len: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    #[inline]
    pub fn front(&self) -> Option<NonNull<T>> {
        self.head
    }

    #[inline]
    pub fn back(&self) -> Option<NonNull<T>> {
        self.tail
    }

    /// 在链表头部插入
    ///
    /// # Safety
    ///
    /// `node` 有效且不在任何链表中。
    pub unsafe fn push_front(&mut self, node: NonNull<T>) {
        let links = node.as_ref().links();
        links.prev.set(None);
        links.next.set(self.head);
        match self.head {
            Some(head) => head.as_ref().links().prev.set(Some(node)),
            None => self.tail = Some(node),
        }
        self.head = Some(node);
        self.len += 1;
    }

    /// 在链表尾部插入
    ///
    /// # Safety
    ///
    /// `node` 有效且不在任何链表中。
    pub unsafe fn push_back(&mut self, node: NonNull<T>) {
        let links = node.as_ref().links();
        links.next.set(None);
        links.prev.set(self.tail);
        match self.tail {
            Some(tail) => tail.as_ref().links().next.set(Some(node)),
            None => self.head = Some(node),
        }
        self.tail = Some(node);
        self.len += 1;
    }

    /// 在 `at` 之后插入 `node`
    ///
    /// # Safety
    ///
    /// `at` 在本链表中，`node` 有效且不在任何链表中。
    pub unsafe fn insert_after(&mut self, at: NonNull<T>, node: NonNull<T>) {
        let at_links = at.as_ref().links();
        let links = node.as_ref().links();
        let next = at_links.next.get();

        links.prev.set(Some(at));
        links.next.set(next);
        at_links.next.set(Some(node));
        match next {
            Some(next) => next.as_ref().links().prev.set(Some(node)),
            None => self.tail = Some(node),
        }
        self.len += 1;
    }

    /// 从链表中摘除节点
    ///
    /// # Safety
    ///
    /// `node` 必须在本链表中。
    pub unsafe fn remove(&mut self, node: NonNull<T>) {
        let links = node.as_ref().links();
        let prev = links.prev.get();
        let next = links.next.get();

        match prev {
            Some(prev) => prev.as_ref().links().next.set(next),
            None => {
                debug_assert!(
                    self.head == Some(node),
                    "list: removing a node that is not linked here"
                );
                self.head = next;
            }
        }
        match next {
            Some(next) => next.as_ref().links().prev.set(prev),
            None => self.tail = prev,
        }
        links.clear();
        self.len -= 1;
    }

    pub fn pop_front(&mut self) -> Option<NonNull<T>> {
        let node = self.head?;
        // SAFETY: head 是本链表的节点
        unsafe { self.remove(node) };
        Some(node)
    }

    pub fn pop_back(&mut self) -> Option<NonNull<T>> {
        let node = self.tail?;
        // SAFETY: tail 是本链表的节点
        unsafe { self.remove(node) };
        Some(node)
    }

    /// 按顺序遍历节点
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            next: self.head,
            _marker: PhantomData,
        }
    }

    /// 节点是否在本链表中（线性扫描）
    pub fn contains(&self, node: NonNull<T>) -> bool {
        self.iter().any(|n| NonNull::from(n) == node)
    }
}

impl<T: Linked> Default for List<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Iter<'a, T: Linked> {
    next: Option<NonNull<T>>,
    _marker: PhantomData<&'a T>,
}

impl<'a, T: Linked> Iterator for Iter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        let node = self.next?;
        // SAFETY: 插入时保证节点在链表中期间有效
        let node = unsafe { &*node.as_ptr() };
        self.next = node.links().next();
        Some(node)
    }
}
