//! 过滤表达式词法分析。

use crate::wire::Value;

#[derive(Clone, Debug, PartialEq)]
pub(crate) enum Token {
    Literal(Value),
    Ident(String),
    LParen,
    RParen,
    Dot,
    Comma,
    Bang,
    AndAnd,
    OrOr,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
}

/// 将表达式切分为记号；错误信息包含出错的字节偏移。
pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let (token, width) = match (c, next) {
            ('(', _) => (Token::LParen, 1),
            (')', _) => (Token::RParen, 1),
            ('.', Some(d)) if d.is_ascii_digit() => {
                return Err(format!("number must start with a digit at {offset}"));
            }
            ('.', _) => (Token::Dot, 1),
            (',', _) => (Token::Comma, 1),
            ('&', Some('&')) => (Token::AndAnd, 2),
            ('|', Some('|')) => (Token::OrOr, 2),
            ('=', Some('=')) => (Token::EqEq, 2),
            ('!', Some('=')) => (Token::NotEq, 2),
            ('!', _) => (Token::Bang, 1),
            ('<', Some('=')) => (Token::Le, 2),
            ('<', _) => (Token::Lt, 1),
            ('>', Some('=')) => (Token::Ge, 2),
            ('>', _) => (Token::Gt, 1),
            ('+', _) => (Token::Plus, 1),
            ('-', _) => (Token::Minus, 1),
            ('*', _) => (Token::Star, 1),
            ('/', _) => (Token::Slash, 1),
            ('%', _) => (Token::Percent, 1),
            ('"' | '\'', _) => {
                let (text, consumed) = read_string(&chars, i)?;
                tokens.push(Token::Literal(Value::String(text)));
                i += consumed;
                continue;
            }
            (d, _) if d.is_ascii_digit() => {
                let (number, consumed) = read_number(&chars, i)?;
                tokens.push(Token::Literal(number));
                i += consumed;
                continue;
            }
            (a, _) if a.is_alphabetic() || a == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Literal(Value::Bool(true)),
                    "false" => Token::Literal(Value::Bool(false)),
                    "null" => Token::Literal(Value::Null),
                    _ => Token::Ident(word),
                });
                continue;
            }
            (other, _) => return Err(format!("unexpected character `{other}` at {offset}")),
        };
        tokens.push(token);
        i += width;
    }
    Ok(tokens)
}

fn read_string(chars: &[(usize, char)], start: usize) -> Result<(String, usize), String> {
    let (offset, quote) = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i].1;
        if c == quote {
            return Ok((text, i + 1 - start));
        }
        if c == '\\' {
            let escaped = chars
                .get(i + 1)
                .map(|(_, c)| *c)
                .ok_or_else(|| format!("dangling escape in string at {offset}"))?;
            text.push(match escaped {
                'n' => '\n',
                't' => '\t',
                other => other,
            });
            i += 2;
            continue;
        }
        text.push(c);
        i += 1;
    }
    Err(format!("unterminated string starting at {offset}"))
}

fn read_number(chars: &[(usize, char)], start: usize) -> Result<(Value, usize), String> {
    let mut i = start;
    let mut seen_dot = false;
    while i < chars.len() {
        let c = chars[i].1;
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.' && !seen_dot && chars.get(i + 1).is_some_and(|(_, d)| d.is_ascii_digit())
        {
            seen_dot = true;
            i += 1;
        } else {
            break;
        }
    }
    let text: String = chars[start..i].iter().map(|(_, c)| *c).collect();
    let value = if seen_dot {
        let parsed: f64 = text
            .parse()
            .map_err(|_| format!("invalid number `{text}`"))?;
        Value::from(parsed)
    } else {
        let parsed: i64 = text
            .parse()
            .map_err(|_| format!("integer `{text}` out of range"))?;
        Value::from(parsed)
    };
    Ok((value, i - start))
}
