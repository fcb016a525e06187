//! # 日志订阅器安装
//!
//! ## 核心意图（Why）
//! - 库代码只通过 `tracing` 宏输出结构化事件，从不自行安装订阅器；
//! - 二进制或测试入口可以调用 [`install_fmt_subscriber`] 获得 `fmt + EnvFilter` 的默认组合。
//!
//! ## 契约（What）
//! - `RUST_LOG` 存在时优先生效，否则使用调用方给出的默认指令；
//! - 进程内已存在全局订阅器时返回 [`TelemetryError::SubscriberAlreadySet`]，不会覆盖。

use thiserror::Error;
use tracing::dispatcher;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, fmt};

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("a global tracing subscriber is already installed")]
    SubscriberAlreadySet,
    #[error("failed to set the global tracing subscriber: {0}")]
    SetGlobalSubscriber(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// 安装全局 `fmt` 订阅器。
///
/// # 教案式说明
/// - **契约 (What)**：`default_directive` 形如 `"info"` 或 `"spark_engine=debug"`；
///   指令非法时退回 `info`；
/// - **风险 (Trade-offs)**：全局订阅器只能设置一次，测试中应改用 `tracing-test`。
pub fn install_fmt_subscriber(default_directive: &str) -> Result<(), TelemetryError> {
    if dispatcher::has_been_set() {
        return Err(TelemetryError::SubscriberAlreadySet);
    }
    let subscriber = tracing_subscriber::registry()
        .with(build_env_filter(
            std::env::var(EnvFilter::DEFAULT_ENV).ok().as_deref(),
            default_directive,
        ))
        .with(fmt::layer());
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}

fn build_env_filter(from_env: Option<&str>, default_directive: &str) -> EnvFilter {
    from_env
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_new(default_directive).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}
