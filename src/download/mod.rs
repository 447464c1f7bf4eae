//! 下载流程模块入口。
//!
//! 子模块：
//! - `models`     — 任务/页面状态机、事件、报告
//! - `pipeline`   — 页面解析 + 内容过滤 + 预探测
//! - `worker`     — 共享的图片下载线程池
//! - `staging`    — 任务暂存目录
//! - `downloader` — 任务调度（重试、限流冷却、取消、归档）
//! - `progress`   — CLI 进度条

pub mod downloader;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod staging;
pub(crate) mod worker;
