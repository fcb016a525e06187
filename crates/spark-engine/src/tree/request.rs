use std::collections::BTreeMap;
use std::fmt;

use super::path;
use crate::view::Capability;

/// 一次视图请求的上下文，由 `path?key=value&...` 形式的 URI 解析而来。
///
/// # 教案式说明
/// - **意图 (Why)**：视图工厂与订阅注册都需要路径、引导开关等参数，统一解析避免各处重复切字符串；
/// - **契约 (What)**：
///   - 路径被规范化，根为 `/`；
///   - `bootstrap` 缺省为 `true`，只有显式的 `false`/`0`/`no` 会关闭引导；
///   - `view` 参数按 [`Capability::as_str`] 名称解析，无法识别时忽略；
///   - 其余参数原样保存在 `params` 中；
/// - **风险 (Trade-offs)**：不做百分号解码，参数值中不应出现 `&` 与 `=`。
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RequestContext {
    full_name: String,
    capability: Option<Capability>,
    bootstrap: Option<bool>,
    params: BTreeMap<String, String>,
}

impl RequestContext {
    pub fn parse(uri: &str) -> Self {
        let (raw_path, query) = match uri.split_once('?') {
            Some((raw_path, query)) => (raw_path, Some(query)),
            None => (uri, None),
        };
        let mut context = Self {
            full_name: path::normalize(raw_path),
            ..Self::default()
        };
        for pair in query.into_iter().flat_map(|q| q.split('&')) {
            if pair.is_empty() {
                continue;
            }
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "bootstrap" => context.bootstrap = Some(parse_flag(value)),
                "view" => context.capability = Capability::from_name(value),
                _ => {
                    context.params.insert(key.to_owned(), value.to_owned());
                }
            }
        }
        context
    }

    /// 资产内部解析视图时使用的上下文。
    pub fn for_view(full_name: &str, capability: Capability) -> Self {
        Self {
            full_name: full_name.to_owned(),
            capability: Some(capability),
            ..Self::default()
        }
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    /// 最后一个路径段；根返回空串。
    pub fn name(&self) -> &str {
        path::segments(&self.full_name).last().unwrap_or("")
    }

    pub fn capability(&self) -> Option<Capability> {
        self.capability
    }

    pub fn bootstrap(&self) -> bool {
        self.bootstrap.unwrap_or(true)
    }

    pub fn with_bootstrap(mut self, bootstrap: bool) -> Self {
        self.bootstrap = Some(bootstrap);
        self
    }

    pub fn with_capability(mut self, capability: Capability) -> Self {
        self.capability = Some(capability);
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }
}

fn parse_flag(value: &str) -> bool {
    !matches!(
        value.to_ascii_lowercase().as_str(),
        "false" | "0" | "no" | "off"
    )
}

impl fmt::Display for RequestContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name)?;
        let mut separator = '?';
        if let Some(capability) = self.capability {
            write!(f, "{separator}view={capability}")?;
            separator = '&';
        }
        if let Some(bootstrap) = self.bootstrap {
            write!(f, "{separator}bootstrap={bootstrap}")?;
            separator = '&';
        }
        for (key, value) in &self.params {
            write!(f, "{separator}{key}={value}")?;
            separator = '&';
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_path_and_query() {
        let rc = RequestContext::parse("/group/map?bootstrap=false&view=key_value_store&x=1");
        assert_eq!(rc.full_name(), "/group/map");
        assert_eq!(rc.name(), "map");
        assert!(!rc.bootstrap());
        assert_eq!(rc.capability(), Some(Capability::KeyValueStore));
        assert_eq!(rc.param("x"), Some("1"));
        assert_eq!(
            rc.to_string(),
            "/group/map?view=key_value_store&bootstrap=false&x=1"
        );
    }

    #[test]
    fn bootstrap_defaults_to_true() {
        let rc = RequestContext::parse("a");
        assert!(rc.bootstrap());
        assert_eq!(rc.full_name(), "/a");
        assert!(RequestContext::parse("a?bootstrap").bootstrap());
        assert_eq!(RequestContext::parse("").name(), "");
    }
}
