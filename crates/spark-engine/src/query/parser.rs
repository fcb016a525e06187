//! 递归下降语法分析。
//!
//! ```text
//! expr       := or
//! or         := and ("||" and)*
//! and        := not ("&&" not)*
//! not        := "!" not | comparison
//! comparison := additive (("==" | "!=" | "<" | "<=" | ">" | ">=") additive)?
//! additive   := term (("+" | "-") term)*
//! term       := unary (("*" | "/" | "%") unary)*
//! unary      := "-" unary | postfix
//! postfix    := primary ("." ident ("(" args? ")")?)*
//! primary    := literal | "value" | ident | "(" expr ")"
//! ```
//!
//! 裸标识符 `price` 等价于 `value.price`。
//!
//! 嵌套层数不超过 [`MAX_DEPTH`]：括号、一元运算符、方法参数以及二元/后缀链上的每一环各计一层，
//! 语法树深度因此有界，求值与析构的递归也随之有界。

use super::ast::{BinaryOp, Expr, Method};
use super::lexer::{Token, tokenize};

pub(crate) const MAX_DEPTH: usize = 128;

pub(crate) fn parse(source: &str) -> Result<Expr, String> {
    let tokens = tokenize(source)?;
    if tokens.is_empty() {
        return Err("empty expression".to_owned());
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let expr = parser.or()?;
    match parser.peek() {
        None => Ok(expr),
        Some(token) => Err(format!("unexpected trailing token {token:?}")),
    }
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn descend(&mut self) -> Result<(), String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(format!("expression nests deeper than {MAX_DEPTH} levels"));
        }
        Ok(())
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, expected: &Token) -> Result<(), String> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(format!("expected {expected:?}, found {:?}", self.peek()))
        }
    }

    fn or(&mut self) -> Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.and()?;
        while self.eat(&Token::OrOr) {
            self.descend()?;
            let rhs = self.and()?;
            lhs = Expr::Binary(BinaryOp::Or, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn and(&mut self) -> Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.not()?;
        while self.eat(&Token::AndAnd) {
            self.descend()?;
            let rhs = self.not()?;
            lhs = Expr::Binary(BinaryOp::And, Box::new(lhs), Box::new(rhs));
        }
        self.depth = base;
        Ok(lhs)
    }

    fn not(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Bang) {
            self.descend()?;
            let inner = self.not()?;
            self.depth -= 1;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.comparison()
    }

    fn comparison(&mut self) -> Result<Expr, String> {
        let lhs = self.additive()?;
        let op = match self.peek() {
            Some(Token::EqEq) => BinaryOp::Eq,
            Some(Token::NotEq) => BinaryOp::Ne,
            Some(Token::Lt) => BinaryOp::Lt,
            Some(Token::Le) => BinaryOp::Le,
            Some(Token::Gt) => BinaryOp::Gt,
            Some(Token::Ge) => BinaryOp::Ge,
            _ => return Ok(lhs),
        };
        self.pos += 1;
        let rhs = self.additive()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn additive(&mut self) -> Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend()?;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::Percent) => BinaryOp::Rem,
                _ => {
                    self.depth = base;
                    return Ok(lhs);
                }
            };
            self.pos += 1;
            self.descend()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, String> {
        if self.eat(&Token::Minus) {
            self.descend()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let base = self.depth;
        let mut expr = self.primary()?;
        while self.eat(&Token::Dot) {
            self.descend()?;
            let name = match self.advance() {
                Some(Token::Ident(name)) => name,
                other => return Err(format!("expected field or method name, found {other:?}")),
            };
            if self.eat(&Token::LParen) {
                let method =
                    Method::from_name(&name).ok_or_else(|| format!("unknown method `{name}`"))?;
                let args = self.arguments()?;
                if args.len() != method.arity() {
                    return Err(format!(
                        "method `{name}` takes {} argument(s), got {}",
                        method.arity(),
                        args.len()
                    ));
                }
                expr = Expr::Call(Box::new(expr), method, args);
            } else {
                expr = match expr {
                    Expr::Field(mut path) => {
                        path.push(name);
                        Expr::Field(path)
                    }
                    _ => return Err(format!("field access `.{name}` on a non-field expression")),
                };
            }
        }
        self.depth = base;
        Ok(expr)
    }

    fn arguments(&mut self) -> Result<Vec<Expr>, String> {
        let mut args = Vec::new();
        if self.eat(&Token::RParen) {
            return Ok(args);
        }
        loop {
            args.push(self.or()?);
            if self.eat(&Token::RParen) {
                return Ok(args);
            }
            self.expect(&Token::Comma)?;
        }
    }

    fn primary(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Literal(value)) => Ok(Expr::Literal(value)),
            Some(Token::Ident(name)) if name == "value" => Ok(Expr::Field(Vec::new())),
            Some(Token::Ident(name)) => Ok(Expr::Field(vec![name])),
            Some(Token::LParen) => {
                self.descend()?;
                let inner = self.or()?;
                self.expect(&Token::RParen)?;
                self.depth -= 1;
                Ok(inner)
            }
            Some(other) => Err(format!("unexpected token {other:?}")),
            None => Err("unexpected end of expression".to_owned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn eval(source: &str, subject: serde_json::Value) -> serde_json::Value {
        parse(source).expect("表达式应可解析").evaluate(&subject)
    }

    #[test]
    fn precedence_follows_arithmetic_then_comparison_then_logic() {
        let subject = json!({"price": 10, "qty": 3, "side": "buy"});
        assert_eq!(eval("price * qty + 1", subject.clone()), json!(31));
        assert_eq!(eval("price * qty > 25 && side == 'buy'", subject.clone()), json!(true));
        assert_eq!(eval("!(qty < 2) || false", subject.clone()), json!(true));
        assert_eq!(eval("-price + 4", subject), json!(-6));
    }

    #[test]
    fn paths_methods_and_missing_fields() {
        let subject = json!({"trader": {"name": "alice"}, "tags": ["fx", "spot"]});
        assert_eq!(eval("value.trader.name.starts_with('al')", subject.clone()), json!(true));
        assert_eq!(eval("tags.contains('spot')", subject.clone()), json!(true));
        assert_eq!(eval("tags.len() == 2", subject.clone()), json!(true));
        assert_eq!(eval("missing.field == null", subject.clone()), json!(true));
        assert_eq!(eval("value.trader.name.len()", subject), json!(5));
        assert_eq!(eval("value > 3", json!(4.5)), json!(true));
    }

    #[test]
    fn syntax_errors_are_reported() {
        assert!(parse("").is_err());
        assert!(parse("a ==").is_err());
        assert!(parse("(a").is_err());
        assert!(parse("a.unknown()").is_err());
        assert!(parse("a.len(1)").is_err());
        assert!(parse("a b").is_err());
        assert!(parse("'x'.y").is_err());
    }

    #[test]
    fn nesting_is_bounded() {
        let shallow = format!("{}1{}", "(".repeat(100), ")".repeat(100));
        assert_eq!(eval(&shallow, json!(null)), json!(1));

        let hostile = [
            format!("{}1{}", "(".repeat(200_000), ")".repeat(200_000)),
            format!("{}true", "!".repeat(200_000)),
            format!("{}1", "- ".repeat(200_000)),
            vec!["1"; 200_000].join(" + "),
            vec!["true"; 200_000].join(" && "),
            format!("tags{}", ".len()".repeat(200_000)),
        ];
        for source in &hostile {
            let err = parse(source).expect_err("超深嵌套应被拒绝");
            assert!(err.contains("nests deeper"), "{err}");
        }
    }
}
