//! 过滤表达式语法树与解释执行。
//!
//! 取值规则：
//! - 字段路径在对象上逐级查找，缺失即为 `null`；
//! - 数值比较统一按 `f64`，字符串按字典序，其余类型之间的大小比较为 `false`；
//! - 真值判定：`bool` 取自身，`null` 为假，数值非零为真，字符串、数组、对象非空为真。

use std::cmp::Ordering;

use crate::wire::Value;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum BinaryOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum Method {
    Contains,
    StartsWith,
    EndsWith,
    Len,
}

impl Method {
    pub(crate) fn from_name(name: &str) -> Option<Self> {
        match name {
            "contains" => Some(Method::Contains),
            "starts_with" | "startsWith" => Some(Method::StartsWith),
            "ends_with" | "endsWith" => Some(Method::EndsWith),
            "len" | "length" => Some(Method::Len),
            _ => None,
        }
    }

    pub(crate) fn arity(self) -> usize {
        match self {
            Method::Len => 0,
            _ => 1,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Expr {
    Literal(Value),
    /// 相对被测值的字段路径；空路径表示值本身。
    Field(Vec<String>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Box<Expr>, Method, Vec<Expr>),
}

impl Expr {
    pub(crate) fn evaluate(&self, subject: &Value) -> Value {
        match self {
            Expr::Literal(value) => value.clone(),
            Expr::Field(path) => lookup(subject, path),
            Expr::Not(inner) => Value::Bool(!truthy(&inner.evaluate(subject))),
            Expr::Neg(inner) => match as_f64(&inner.evaluate(subject)) {
                Some(n) => number(-n),
                None => Value::Null,
            },
            Expr::Binary(BinaryOp::And, lhs, rhs) => {
                Value::Bool(truthy(&lhs.evaluate(subject)) && truthy(&rhs.evaluate(subject)))
            }
            Expr::Binary(BinaryOp::Or, lhs, rhs) => {
                Value::Bool(truthy(&lhs.evaluate(subject)) || truthy(&rhs.evaluate(subject)))
            }
            Expr::Binary(op, lhs, rhs) => {
                binary(*op, &lhs.evaluate(subject), &rhs.evaluate(subject))
            }
            Expr::Call(receiver, method, args) => {
                let receiver = receiver.evaluate(subject);
                let args: Vec<Value> = args.iter().map(|arg| arg.evaluate(subject)).collect();
                call(&receiver, *method, &args)
            }
        }
    }

    /// 表达式中出现的顶层字段名，用于按类型声明校验。
    pub(crate) fn collect_fields<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Field(path) => {
                if let Some(first) = path.first() {
                    out.push(first.as_str());
                }
            }
            Expr::Not(inner) | Expr::Neg(inner) => inner.collect_fields(out),
            Expr::Binary(_, lhs, rhs) => {
                lhs.collect_fields(out);
                rhs.collect_fields(out);
            }
            Expr::Call(receiver, _, args) => {
                receiver.collect_fields(out);
                for arg in args {
                    arg.collect_fields(out);
                }
            }
        }
    }
}

pub(crate) fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(fields) => !fields.is_empty(),
    }
}

fn lookup(subject: &Value, path: &[String]) -> Value {
    let mut current = subject;
    for segment in path {
        match current.get(segment.as_str()) {
            Some(next) => current = next,
            None => return Value::Null,
        }
    }
    current.clone()
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn compare(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => as_f64(lhs)?.partial_cmp(&as_f64(rhs)?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn equals(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Number(_), Value::Number(_)) => compare(lhs, rhs) == Some(Ordering::Equal),
        _ => lhs == rhs,
    }
}

fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Value {
    match op {
        BinaryOp::Eq => Value::Bool(equals(lhs, rhs)),
        BinaryOp::Ne => Value::Bool(!equals(lhs, rhs)),
        BinaryOp::Lt => Value::Bool(compare(lhs, rhs) == Some(Ordering::Less)),
        BinaryOp::Le => Value::Bool(matches!(
            compare(lhs, rhs),
            Some(Ordering::Less | Ordering::Equal)
        )),
        BinaryOp::Gt => Value::Bool(compare(lhs, rhs) == Some(Ordering::Greater)),
        BinaryOp::Ge => Value::Bool(matches!(
            compare(lhs, rhs),
            Some(Ordering::Greater | Ordering::Equal)
        )),
        BinaryOp::Add => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Value::String(format!("{a}{b}")),
            _ => arithmetic(lhs, rhs, |a, b| Some(a + b)),
        },
        BinaryOp::Sub => arithmetic(lhs, rhs, |a, b| Some(a - b)),
        BinaryOp::Mul => arithmetic(lhs, rhs, |a, b| Some(a * b)),
        BinaryOp::Div => arithmetic(lhs, rhs, |a, b| (b != 0.0).then(|| a / b)),
        BinaryOp::Rem => arithmetic(lhs, rhs, |a, b| (b != 0.0).then(|| a % b)),
        BinaryOp::And | BinaryOp::Or => {
            let result = if op == BinaryOp::And {
                truthy(lhs) && truthy(rhs)
            } else {
                truthy(lhs) || truthy(rhs)
            };
            Value::Bool(result)
        }
    }
}

fn arithmetic(lhs: &Value, rhs: &Value, f: impl Fn(f64, f64) -> Option<f64>) -> Value {
    match (as_f64(lhs), as_f64(rhs)) {
        (Some(a), Some(b)) => f(a, b).map(number).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn call(receiver: &Value, method: Method, args: &[Value]) -> Value {
    match (method, receiver, args.first()) {
        (Method::Contains, Value::String(s), Some(Value::String(needle))) => {
            Value::Bool(s.contains(needle.as_str()))
        }
        (Method::Contains, Value::Array(items), Some(needle)) => {
            Value::Bool(items.iter().any(|item| equals(item, needle)))
        }
        (Method::Contains, Value::Object(fields), Some(Value::String(key))) => {
            Value::Bool(fields.contains_key(key))
        }
        (Method::StartsWith, Value::String(s), Some(Value::String(prefix))) => {
            Value::Bool(s.starts_with(prefix.as_str()))
        }
        (Method::EndsWith, Value::String(s), Some(Value::String(suffix))) => {
            Value::Bool(s.ends_with(suffix.as_str()))
        }
        (Method::Len, Value::String(s), _) => Value::from(s.chars().count()),
        (Method::Len, Value::Array(items), _) => Value::from(items.len()),
        (Method::Len, Value::Object(fields), _) => Value::from(fields.len()),
        (Method::Contains | Method::StartsWith | Method::EndsWith, _, _) => Value::Bool(false),
        (Method::Len, _, _) => Value::Null,
    }
}
