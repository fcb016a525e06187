//! # 值订阅（SimpleSubscription）
//!
//! ## 核心意图（Why）
//! - 单个值资产（引用、发布者）的变化需要广播给任意数量的订阅者；
//! - 上游既可能送来已解码的值，也可能送来原始字节，后者交给 [`ValueReader`] 解码。
//!
//! ## 契约（What）
//! - 注册时默认投递一次当前值作为引导，`bootstrap=false` 时跳过；
//! - 所有订阅者都计为“键订阅者”，条目与主题订阅者恒为 0；
//! - 读取器产出错误类型时记录一条 `error!` 诊断，提示读取器可能配置错误，并把错误返回给调用方。

use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;
use tracing::error;

use super::set::{Registration, SubscriberSet};
use super::subscriber::{Subscriber, Subscription};
use crate::error::{EngineError, Result};
use crate::tree::RequestContext;
use crate::wire::Value;

/// 读取器失败原因。
#[derive(Clone, Debug, Eq, PartialEq, Error)]
pub enum ReadError {
    /// 字节合法但产出的值类型不是订阅者期望的类型。
    #[error("expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },
    /// 字节本身无法解析。
    #[error("malformed payload: {0}")]
    Malformed(String),
}

/// 把原始字节转换为订阅值。
pub trait ValueReader<E>: Send + Sync {
    fn read(&self, raw: &[u8]) -> std::result::Result<E, ReadError>;

    /// 诊断信息中使用的读取器名称。
    fn name(&self) -> &str;
}

/// 期望的 JSON 值形态。
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum ValueKind {
    #[default]
    Any,
    Null,
    Bool,
    Number,
    Text,
    Array,
    Object,
}

impl ValueKind {
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Number(_) => ValueKind::Number,
            Value::String(_) => ValueKind::Text,
            Value::Array(_) => ValueKind::Array,
            Value::Object(_) => ValueKind::Object,
        }
    }

    pub fn accepts(self, value: &Value) -> bool {
        self == ValueKind::Any || self == ValueKind::of(value)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueKind::Any => "any",
            ValueKind::Null => "null",
            ValueKind::Bool => "bool",
            ValueKind::Number => "number",
            ValueKind::Text => "text",
            ValueKind::Array => "array",
            ValueKind::Object => "object",
        }
    }
}

/// 以 JSON 解析原始字节，并按 [`ValueKind`] 校验形态。
#[derive(Clone, Debug)]
pub struct JsonValueReader {
    name: String,
    expected: ValueKind,
}

impl JsonValueReader {
    /// 接受任意形态。
    pub fn any() -> Self {
        Self::expecting(ValueKind::Any)
    }

    pub fn expecting(expected: ValueKind) -> Self {
        Self {
            name: format!("json<{}>", expected.as_str()),
            expected,
        }
    }
}

impl ValueReader<Value> for JsonValueReader {
    fn read(&self, raw: &[u8]) -> std::result::Result<Value, ReadError> {
        let value: Value =
            serde_json::from_slice(raw).map_err(|err| ReadError::Malformed(err.to_string()))?;
        if self.expected.accepts(&value) {
            Ok(value)
        } else {
            Err(ReadError::TypeMismatch {
                expected: self.expected.as_str().to_owned(),
                found: ValueKind::of(&value).as_str().to_owned(),
            })
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 上游送达的消息：已解码的值或待解码的字节。
#[derive(Clone, Debug, PartialEq)]
pub enum Message<E> {
    Value(E),
    Encoded(Bytes),
}

/// 当前值提供者，用于注册时的引导投递。
pub type CurrentValue<E> = Arc<dyn Fn() -> Option<E> + Send + Sync>;

/// 值订阅。
///
/// # 教案式说明
/// - **意图 (Why)**：替代“每个值一套监听器列表”的散落实现，订阅集合、引导与解码集中在一处；
/// - **契约 (What)**：
///   - `current` 返回 `None` 时引导阶段不投递任何值；
///   - [`SimpleSubscription::notify_message`] 对每个存活订阅者至多投递一次；
///   - `close` 后的注册返回 [`Registration::Closed`]；
/// - **风险 (Trade-offs)**：引导值在注册线程同步计算，`current` 不应执行阻塞 I/O。
pub struct SimpleSubscription<E> {
    subscribers: SubscriberSet<E>,
    current: CurrentValue<E>,
    reader: Arc<dyn ValueReader<E>>,
}

impl<E: Clone + Send + Sync + 'static> SimpleSubscription<E> {
    pub fn new(current: CurrentValue<E>, reader: Arc<dyn ValueReader<E>>) -> Self {
        Self {
            subscribers: SubscriberSet::new("value"),
            current,
            reader,
        }
    }

    /// 注册订阅者；`rc` 中 `bootstrap=false` 时不投递当前值。
    pub fn register_subscriber(
        &self,
        rc: &RequestContext,
        subscriber: Arc<dyn Subscriber<E>>,
    ) -> Registration {
        let current = self.current.clone();
        let bootstrap = rc.bootstrap();
        self.subscribers.register(subscriber, None, move || {
            if bootstrap {
                current().into_iter().collect()
            } else {
                Vec::new()
            }
        })
    }

    pub fn unregister_subscriber(&self, subscriber: &Arc<dyn Subscriber<E>>) -> bool {
        self.subscribers.unregister(subscriber)
    }

    /// 投递已解码的值。
    pub fn notify(&self, value: &E) {
        self.subscribers.notify(value);
    }

    /// 投递上游消息，必要时先经读取器解码。
    pub fn notify_message(&self, message: Message<E>) -> Result<()> {
        let value = match message {
            Message::Value(value) => value,
            Message::Encoded(raw) => match self.reader.read(&raw) {
                Ok(value) => value,
                Err(ReadError::TypeMismatch { expected, found }) => {
                    error!(
                        reader = self.reader.name(),
                        %expected,
                        %found,
                        "is {} the correct value reader?",
                        self.reader.name()
                    );
                    return Err(EngineError::DecodeMismatch {
                        reader: self.reader.name().to_owned(),
                        detail: format!("expected {expected}, found {found}"),
                    });
                }
                Err(ReadError::Malformed(detail)) => {
                    return Err(EngineError::Decode {
                        what: format!("value for reader `{}`", self.reader.name()),
                        detail,
                    });
                }
            },
        };
        self.subscribers.notify(&value);
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.subscribers.is_closed()
    }
}

impl<E: Clone + Send + Sync + 'static> Subscription for SimpleSubscription<E> {
    fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn key_subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn entry_subscriber_count(&self) -> usize {
        0
    }

    fn topic_subscriber_count(&self) -> usize {
        0
    }

    fn close(&self) {
        self.subscribers.close();
    }
}

impl<E> std::fmt::Debug for SimpleSubscription<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimpleSubscription")
            .field("subscribers", &self.subscribers)
            .field("reader", &self.reader.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::json;
    use tracing_test::traced_test;

    use super::*;
    use crate::pubsub::{FnSubscriber, InvalidSubscriber};

    fn subscription_with(current: Option<Value>) -> SimpleSubscription<Value> {
        SimpleSubscription::new(
            Arc::new(move || current.clone()),
            Arc::new(JsonValueReader::expecting(ValueKind::Text)),
        )
    }

    fn recorder() -> (Arc<Mutex<Vec<Value>>>, Arc<dyn Subscriber<Value>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let subscriber: Arc<dyn Subscriber<Value>> =
            Arc::new(FnSubscriber::new(move |v: &Value| -> Result<(), InvalidSubscriber> {
                sink.lock().push(v.clone());
                Ok(())
            }));
        (seen, subscriber)
    }

    #[test]
    fn bootstrap_delivers_current_value_once() {
        let subscription = subscription_with(Some(json!("v1")));
        let (seen, subscriber) = recorder();
        let rc = RequestContext::parse("/a/b");
        assert!(subscription.register_subscriber(&rc, subscriber).is_active());
        subscription.notify(&json!("v2"));
        assert_eq!(*seen.lock(), vec![json!("v1"), json!("v2")]);
        assert_eq!(subscription.key_subscriber_count(), 1);
        assert_eq!(subscription.entry_subscriber_count(), 0);
        assert_eq!(subscription.topic_subscriber_count(), 0);
    }

    #[test]
    fn bootstrap_can_be_disabled() {
        let subscription = subscription_with(Some(json!("v1")));
        let (seen, subscriber) = recorder();
        let rc = RequestContext::parse("/a/b?bootstrap=false");
        subscription.register_subscriber(&rc, subscriber);
        assert!(seen.lock().is_empty(), "关闭引导后不应收到当前值");
    }

    #[test]
    fn encoded_messages_are_decoded() {
        let subscription = subscription_with(None);
        let (seen, subscriber) = recorder();
        subscription.register_subscriber(&RequestContext::parse("x"), subscriber);
        subscription
            .notify_message(Message::Encoded(Bytes::from_static(b"\"hello\"")))
            .expect("文本负载应能解码");
        assert_eq!(*seen.lock(), vec![json!("hello")]);
    }

    #[traced_test]
    #[test]
    fn wrong_reader_reports_diagnostic() {
        let subscription = subscription_with(None);
        let (seen, subscriber) = recorder();
        subscription.register_subscriber(&RequestContext::parse("x"), subscriber);
        let err = subscription
            .notify_message(Message::Encoded(Bytes::from_static(b"42")))
            .expect_err("数字负载与文本读取器不匹配");
        assert!(matches!(err, EngineError::DecodeMismatch { .. }));
        assert!(seen.lock().is_empty());
        assert!(logs_contain("the correct value reader?"));
    }

    #[test]
    fn close_is_idempotent() {
        let subscription = subscription_with(None);
        let ended = Arc::new(Mutex::new(0));

        struct Ending(Arc<Mutex<i32>>);
        impl Subscriber<Value> for Ending {
            fn on_message(&self, _: &Value) -> Result<(), InvalidSubscriber> {
                Ok(())
            }
            fn on_end_of_subscription(&self) {
                *self.0.lock() += 1;
            }
        }

        subscription.register_subscriber(
            &RequestContext::parse("x"),
            Arc::new(Ending(ended.clone())),
        );
        subscription.close();
        subscription.close();
        assert_eq!(*ended.lock(), 1);
        assert!(subscription.is_closed());
    }
}
