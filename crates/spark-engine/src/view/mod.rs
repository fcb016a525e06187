//! # view 模块
//!
//! ## 定位（Why）
//! - 资产上的能力是封闭集合：映射、订阅、引用、发布者、集群注册表、主机标识、事件循环、连接监视器；
//! - 视图通过规则懒创建，规则挂在某个资产上即对整棵子树生效。
//!
//! ## 组成（What）
//! - [`Capability`] / [`View`]：能力键与视图实例；
//! - [`ViewRule`]：叶子规则与包装规则；
//! - [`install_default_rules`]：服务端默认规则集。

mod capability;
mod defaults;
mod rules;

pub use capability::{Capability, View};
pub use defaults::install_default_rules;
pub use rules::{LeafFactory, ViewFactory, ViewRule, WrappingFactory};
