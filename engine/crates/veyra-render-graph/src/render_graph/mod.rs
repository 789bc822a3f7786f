//! Render graph 核心
//!
//! 每帧重建：调用方按顺序声明 pass 及其资源访问，
//! graph 在执行时根据声明自动批量插入 barrier / layout 转换。

pub mod graph;
pub mod handle;
pub mod pass;
pub mod registry;
pub mod usage;
