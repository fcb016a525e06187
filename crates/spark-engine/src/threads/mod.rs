//! # threads 模块
//!
//! 资产树共享的事件循环与定时任务。连接的延迟关闭、心跳与远程会话都在这里调度，
//! 不为单个连接创建专用线程。

mod event_loop;

pub use event_loop::{EventLoop, ScheduledTask};
