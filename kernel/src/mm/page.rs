//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!

//! 地址类型与页对齐工具

use core::fmt;

use crate::config;

pub const PAGE_SIZE: usize = config::PAGE_SIZE;

pub const PAGE_SHIFT: usize = config::PAGE_SHIFT;

pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// 向上对齐到 `align`（必须是 2 的幂）
#[inline]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// 向下对齐到 `align`（必须是 2 的幂）
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

#[inline]
pub const fn page_align_up(value: usize) -> usize {
    align_up(value, PAGE_SIZE)
}

/// 向上按页对齐，溢出时返回 `None`
#[inline]
pub const fn checked_page_align_up(value: usize) -> Option<usize> {
    match value.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

#[inline]
pub const fn page_align_down(value: usize) -> usize {
    align_down(value, PAGE_SIZE)
}

/// 覆盖 `bytes` 字节需要的页数
#[inline]
pub const fn pages_for(bytes: usize) -> usize {
    page_align_up(bytes) >> PAGE_SHIFT
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct PhysAddr(pub usize);

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(pub usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn floor(&self) -> Self {
        Self(page_align_down(self.0))
    }

    #[inline]
    pub const fn ceil(&self) -> Self {
        Self(page_align_up(self.0))
    }

    #[inline]
    pub const fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    pub const fn frame_number(&self) -> usize {
        self.0 >> PAGE_SHIFT
    }
}

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub const fn as_usize(&self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_aligned(&self) -> bool {
        self.0 & PAGE_MASK == 0
    }

    #[inline]
    pub const fn floor(&self) -> Self {
        Self(page_align_down(self.0))
    }

    #[inline]
    pub const fn ceil(&self) -> Self {
        Self(page_align_up(self.0))
    }

    #[inline]
    pub const fn add(&self, offset: usize) -> Self {
        Self(self.0 + offset)
    }

    #[inline]
    pub fn as_ptr<T>(&self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub fn as_mut_ptr<T>(&self) -> *mut T {
        self.0 as *mut T
    }

    pub const fn page_number(&self) -> usize {
        self.0 >> PAGE_SHIFT
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
