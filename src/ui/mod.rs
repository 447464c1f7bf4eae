//! 交互层入口：命令行子命令的实现。

pub mod noui;
