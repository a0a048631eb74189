//! kmem 构建脚本
//!
//! 这个脚本在编译前运行，负责：
//! 1. 解析工作区根目录的 Kernel.toml
//! 2. 生成 src/config.rs 常量
//!
//! Kernel.toml 缺失或缺少某个键时使用默认值。

use std::env;
use std::fs;
use std::path::PathBuf;

/// 默认布局：内核占据高半部分，用户空间在低半部分
const DEFAULT_KERNEL_START: u64 = 0xFFFF_FF00_0000_0000;
const DEFAULT_KERNEL_END: u64 = 0xFFFF_FFFF_FFFF_F000;
const DEFAULT_USER_START: u64 = 0x0000_0000_0000_1000;
const DEFAULT_USER_END: u64 = 0x0000_8000_0000_0000;

fn main() {
    println!("cargo:rerun-if-changed=../Kernel.toml");
    println!("cargo:rerun-if-changed=build.rs");

    let content = fs::read_to_string("../Kernel.toml").unwrap_or_else(|_| {
        println!("cargo:warning=Kernel.toml not found, using default memory configuration");
        String::new()
    });

    let config: toml::Value = toml::from_str(&content).unwrap_or_else(|e| {
        println!("cargo:warning=Kernel.toml parse error ({}), using defaults", e);
        toml::Value::Table(toml::map::Map::new())
    });

    if let Some(general) = config.get("general") {
        if let Some(name) = general.get("name").and_then(|v| v.as_str()) {
            println!("cargo:rustc-env=KMEM_NAME={}", name);
        }
    }

    generate_config_code(&config);
}

fn integer(config: &toml::Value, section: &str, key: &str, default: i64) -> i64 {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
        .unwrap_or(default)
}

fn boolean(config: &toml::Value, section: &str, key: &str, default: bool) -> bool {
    config
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_bool())
        .unwrap_or(default)
}

/// 地址以十六进制字符串给出（TOML 整数只有 i64）
fn address(config: &toml::Value, key: &str, default: u64) -> u64 {
    let Some(value) = config.get("memory").and_then(|m| m.get(key)) else {
        return default;
    };
    match value {
        toml::Value::Integer(v) => *v as u64,
        toml::Value::String(s) => {
            let digits = s
                .trim()
                .trim_start_matches("0x")
                .trim_start_matches("0X")
                .replace('_', "");
            u64::from_str_radix(&digits, 16).unwrap_or_else(|_| {
                println!(
                    "cargo:warning=memory.{} = {:?} is not a hex address, using default",
                    key, s
                );
                default
            })
        }
        _ => default,
    }
}

fn generate_config_code(config: &toml::Value) {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").unwrap());

    let page_size = integer(config, "memory", "page_size", 4096);
    if page_size <= 0 || (page_size & (page_size - 1)) != 0 {
        panic!("memory.page_size must be a power of two, got {}", page_size);
    }

    let config_code = format!(
        r#"//! kmem 配置（自动生成）
//!
//! 此文件由 build.rs 根据 Kernel.toml 自动生成，请勿手动修改

// ============================================================
// 内存配置
// ============================================================

/// 页大小
pub const PAGE_SIZE: usize = {};

/// 页大小位移
pub const PAGE_SHIFT: usize = {};

/// 最大CPU数量
pub const MAX_CPUS: usize = {};

/// 每个缓存保留的完全空闲 slab 上限
pub const SLAB_MAX_FREE: usize = {};

// ============================================================
// 地址空间布局
// ============================================================

/// 内核地址空间起始
pub const KERNEL_SPACE_START: usize = {:#x};

/// 内核地址空间结束
pub const KERNEL_SPACE_END: usize = {:#x};

/// 用户地址空间起始
pub const USER_SPACE_START: usize = {:#x};

/// 用户地址空间结束
pub const USER_SPACE_END: usize = {:#x};

// ============================================================
// 调试配置
// ============================================================

/// 是否在分配头中记录调用者
pub const ALLOC_TRACKING: bool = {};
"#,
        page_size,
        page_size.trailing_zeros(),
        integer(config, "memory", "max_cpus", 8),
        integer(config, "memory", "slab_max_free", 2),
        address(config, "kernel_space_start", DEFAULT_KERNEL_START),
        address(config, "kernel_space_end", DEFAULT_KERNEL_END),
        address(config, "user_space_start", DEFAULT_USER_START),
        address(config, "user_space_end", DEFAULT_USER_END),
        boolean(config, "debug", "alloc_tracking", true),
    );

    let config_file = manifest_dir.join("src").join("config.rs");

    // 只有内容变化时才写入，避免每次编译都更新文件时间戳
    let existing_content = fs::read_to_string(&config_file).unwrap_or_default();
    if existing_content != config_code {
        fs::write(&config_file, &config_code).expect("failed to write src/config.rs");
    }
}
