// 核心数据结构和类型定义

pub mod types;
pub mod clock;
pub mod config;
pub mod error;
pub mod text;

pub use types::*;
pub use clock::*;
pub use config::*;
pub use error::*;
pub use text::*;

/// 日志上下文前缀（进程号 + 线程号）
pub fn log_ctx() -> String {
    format!("[pid:{} tid:{:?}]", std::process::id(), std::thread::current().id())
}
