//! 配置管理
//!
//! 加载顺序: 内置默认值 -> TOML 配置文件 -> 环境变量（前缀 `TASKQ_`，层级分隔符 `__`）。

pub mod models;

pub use models::*;
