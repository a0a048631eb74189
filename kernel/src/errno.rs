//! MIT License
//!
//! Copyright (c) 2026 Fei Wang
//!
//! 标准错误代码定义
//!
//! 只保留内存管理核心会返回给内部调用者的几个错误码，
//! 数值与 include/uapi/asm-generic/errno-base.h 一致。
//!
//! 使用方法：
//! ```rust
//! use kmem::errno::Errno;
//!
//! // 系统调用风格，返回负数
//! let ret = Errno::OutOfMemory.as_neg_i32();
//! assert_eq!(ret, -12);
//! ```

use core::fmt;

/// 标准错误代码
#[repr(i32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Errno {
    /// No such device or address (ENXIO, 6)
    NoSuchDeviceOrAddress = 6,

    /// Out of memory (ENOMEM, 12)
    OutOfMemory = 12,

    /// Bad address (EFAULT, 14)
    BadAddress = 14,

    /// File exists (EEXIST, 17)
    FileExists = 17,

    /// Invalid argument (EINVAL, 22)
    InvalidArgument = 22,

    /// Math result not representable (ERANGE, 34)
    ResultOutOfRange = 34,
}

impl Errno {
    /// 返回正的错误码
    #[inline]
    pub const fn as_i32(self) -> i32 {
        self as i32
    }

    /// 返回负的错误码（内核内部调用约定）
    #[inline]
    pub const fn as_neg_i32(self) -> i32 {
        -(self as i32)
    }

    /// 从正的错误码还原
    pub const fn from_i32(code: i32) -> Option<Self> {
        match code {
            6 => Some(Self::NoSuchDeviceOrAddress),
            12 => Some(Self::OutOfMemory),
            14 => Some(Self::BadAddress),
            17 => Some(Self::FileExists),
            22 => Some(Self::InvalidArgument),
            34 => Some(Self::ResultOutOfRange),
            _ => None,
        }
    }

    /// 符号名
    pub const fn name(self) -> &'static str {
        match self {
            Self::NoSuchDeviceOrAddress => "ENXIO",
            Self::OutOfMemory => "ENOMEM",
            Self::BadAddress => "EFAULT",
            Self::FileExists => "EEXIST",
            Self::InvalidArgument => "EINVAL",
            Self::ResultOutOfRange => "ERANGE",
        }
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_i32())
    }
}

pub const ENXIO: i32 = Errno::NoSuchDeviceOrAddress as i32;
pub const ENOMEM: i32 = Errno::OutOfMemory as i32;
pub const EFAULT: i32 = Errno::BadAddress as i32;
pub const EEXIST: i32 = Errno::FileExists as i32;
pub const EINVAL: i32 = Errno::InvalidArgument as i32;
pub const ERANGE: i32 = Errno::ResultOutOfRange as i32;
