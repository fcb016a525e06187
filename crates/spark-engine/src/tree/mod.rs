//! # tree 模块
//!
//! ## 定位（Why）
//! - 以 `/` 分隔的名字空间组织资产，每个资产按能力挂载视图；
//! - [`AssetTree`] 是对外入口，[`Asset`] 是节点，[`RequestContext`] 描述一次视图请求。

mod asset;
mod asset_tree;
mod context;
pub mod path;
mod request;

pub use asset::Asset;
pub use asset_tree::{AssetTree, AssetTreeStats};
pub use context::TreeContext;
pub use request::RequestContext;
