//! A small subset of Vim script expressions.
//!
//! Numbers, `'single'` and `"double"` quoted strings, lists, dicts with string
//! keys, scoped variables (`g:`, `l:`, `v:`), function calls, unary `-`/`!`,
//! `* / %`, `+ -`, `..` concatenation and `==`/`!=`.

use plugtest_core::Value;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    List(Vec<Expr>),
    Dict(Vec<(Expr, Expr)>),
    Var(String),
    Call(String, Vec<Expr>),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Concat,
    Eq,
    Ne,
}

#[derive(Debug, thiserror::Error)]
#[error("E15: Invalid expression: \"{0}\"")]
pub struct ParseError(pub String);

/// Parse a whole expression; trailing input is an error.
pub fn parse(source: &str) -> Result<Expr, ParseError> {
    let mut parser = Parser {
        chars: source.chars().collect(),
        pos: 0,
        source,
    };
    let expr = parser.expr()?;
    parser.skip_ws();
    if parser.pos != parser.chars.len() {
        return Err(parser.error());
    }
    Ok(expr)
}

/// Parse one or more whitespace-separated expressions, as `:echo` and `:execute` take.
pub fn parse_list(source: &str) -> Result<Vec<Expr>, ParseError> {
    let mut parser = Parser {
        chars: source.chars().collect(),
        pos: 0,
        source,
    };
    let mut exprs = Vec::new();
    loop {
        parser.skip_ws();
        if parser.pos == parser.chars.len() {
            return Ok(exprs);
        }
        exprs.push(parser.expr()?);
    }
}

struct Parser<'a> {
    chars: Vec<char>,
    pos: usize,
    source: &'a str,
}

impl Parser<'_> {
    fn error(&self) -> ParseError {
        ParseError(self.source.to_owned())
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, token: &str) -> bool {
        self.skip_ws();
        let matches = token
            .chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c));
        if matches {
            self.pos += token.chars().count();
        }
        matches
    }

    fn expect(&mut self, token: &str) -> Result<(), ParseError> {
        if self.eat(token) { Ok(()) } else { Err(self.error()) }
    }

    fn expr(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.concat()?;
        let op = if self.eat("==") {
            BinOp::Eq
        } else if self.eat("!=") {
            BinOp::Ne
        } else {
            return Ok(lhs);
        };
        let rhs = self.concat()?;
        Ok(Expr::Binary(op, Box::new(lhs), Box::new(rhs)))
    }

    fn concat(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.additive()?;
        while self.eat("..") {
            let rhs = self.additive()?;
            lhs = Expr::Binary(BinOp::Concat, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn additive(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.multiplicative()?;
        loop {
            let op = if self.eat("+") {
                BinOp::Add
            } else if self.eat("-") {
                BinOp::Sub
            } else {
                return Ok(lhs);
            };
            let rhs = self.multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.unary()?;
        loop {
            let op = if self.eat("*") {
                BinOp::Mul
            } else if self.eat("/") {
                BinOp::Div
            } else if self.eat("%") {
                BinOp::Rem
            } else {
                return Ok(lhs);
            };
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat("-") {
            return Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.unary()?)));
        }
        if self.peek_after_ws() == Some('!') && self.peek_at(1) != Some('=') {
            self.pos += 1;
            return Ok(Expr::Unary(UnaryOp::Not, Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn peek_after_ws(&mut self) -> Option<char> {
        self.skip_ws();
        self.peek()
    }

    fn primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek_after_ws() {
            Some(c) if c.is_ascii_digit() => self.number(),
            Some('\'') => self.single_quoted().map(|s| Expr::Literal(Value::from(s))),
            Some('"') => self.double_quoted().map(|s| Expr::Literal(Value::from(s))),
            Some('[') => {
                self.pos += 1;
                let items = self.items(']', Self::expr)?;
                Ok(Expr::List(items))
            }
            Some('{') => {
                self.pos += 1;
                let entries = self.items('}', |p| {
                    let key = p.expr()?;
                    p.expect(":")?;
                    Ok((key, p.expr()?))
                })?;
                Ok(Expr::Dict(entries))
            }
            Some('(') => {
                self.pos += 1;
                let inner = self.expr()?;
                self.expect(")")?;
                Ok(inner)
            }
            Some(c) if is_name_start(c) => {
                let name = self.name();
                if self.peek() == Some('(') {
                    self.pos += 1;
                    let args = self.items(')', Self::expr)?;
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Var(name))
                }
            }
            _ => Err(self.error()),
        }
    }

    /// Comma-separated items up to `close`, allowing a trailing comma.
    fn items<T>(
        &mut self,
        close: char,
        mut item: impl FnMut(&mut Self) -> Result<T, ParseError>,
    ) -> Result<Vec<T>, ParseError> {
        let mut items = Vec::new();
        loop {
            if self.peek_after_ws() == Some(close) {
                self.pos += 1;
                return Ok(items);
            }
            items.push(item(self)?);
            if !self.eat(",") {
                self.skip_ws();
                return if self.peek() == Some(close) {
                    self.pos += 1;
                    Ok(items)
                } else {
                    Err(self.error())
                };
            }
        }
    }

    fn number(&mut self) -> Result<Expr, ParseError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.pos += 1;
        }
        let digits: String = self.chars[start..self.pos].iter().collect();
        let n: i64 = digits.parse().map_err(|_| self.error())?;
        Ok(Expr::Literal(Value::from(n)))
    }

    fn single_quoted(&mut self) -> Result<String, ParseError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error()),
                Some('\'') if self.peek_at(1) == Some('\'') => {
                    out.push('\'');
                    self.pos += 2;
                }
                Some('\'') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn double_quoted(&mut self) -> Result<String, ParseError> {
        self.pos += 1;
        let mut out = String::new();
        loop {
            match self.peek() {
                None => return Err(self.error()),
                Some('"') => {
                    self.pos += 1;
                    return Ok(out);
                }
                Some('\\') => {
                    let escaped = self.peek_at(1).ok_or_else(|| self.error())?;
                    out.push(match escaped {
                        'n' => '\n',
                        't' => '\t',
                        'r' => '\r',
                        other => other,
                    });
                    self.pos += 2;
                }
                Some(c) => {
                    out.push(c);
                    self.pos += 1;
                }
            }
        }
    }

    fn name(&mut self) -> String {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_name_char(c)) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }
}

fn is_name_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '#' | ':')
}

/// Vim's string-to-number coercion: the leading integer, else 0.
pub fn to_number(value: &Value) -> i64 {
    match value {
        Value::Integer(n) => n.as_i64().unwrap_or(0),
        Value::Boolean(b) => i64::from(*b),
        Value::F64(f) => *f as i64,
        Value::String(s) => {
            let text = s.as_str().unwrap_or("").trim_start();
            let (negative, digits) = match text.strip_prefix('-') {
                Some(rest) => (true, rest),
                None => (false, text),
            };
            let end = digits
                .find(|c: char| !c.is_ascii_digit())
                .unwrap_or(digits.len());
            let n = digits[..end].parse::<i64>().unwrap_or(0);
            if negative { -n } else { n }
        }
        _ => 0,
    }
}

/// What `:echo` prints for `value`.
pub fn to_display(value: &Value) -> String {
    match value {
        Value::String(s) => s.as_str().unwrap_or("").to_owned(),
        Value::Nil => "v:null".to_owned(),
        Value::Boolean(true) => "v:true".to_owned(),
        Value::Boolean(false) => "v:false".to_owned(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_literal).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Map(entries) => {
            let entries: Vec<String> = entries
                .iter()
                .map(|(k, v)| format!("'{}': {}", to_display(k), to_literal(v)))
                .collect();
            format!("{{{}}}", entries.join(", "))
        }
        other => other.to_string(),
    }
}

/// Like [`to_display`], but strings keep their quotes.
fn to_literal(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.as_str().unwrap_or("").replace('\'', "''")),
        other => to_display(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lit(v: impl Into<Value>) -> Expr {
        Expr::Literal(v.into())
    }

    #[test]
    fn literals_and_containers() {
        assert_eq!(parse("42").unwrap(), lit(42));
        assert_eq!(parse("'it''s'").unwrap(), lit("it's"));
        assert_eq!(parse(r#""a\"b""#).unwrap(), lit("a\"b"));
        assert_eq!(
            parse("[1, 'two', ]").unwrap(),
            Expr::List(vec![lit(1), lit("two")])
        );
        assert_eq!(
            parse("{'k': 1}").unwrap(),
            Expr::Dict(vec![(lit("k"), lit(1))])
        );
    }

    #[test]
    fn calls_and_scoped_names() {
        assert_eq!(
            parse("denops#notify('p', 'f', [g:x])").unwrap(),
            Expr::Call(
                "denops#notify".into(),
                vec![lit("p"), lit("f"), Expr::List(vec![Expr::Var("g:x".into())])]
            )
        );
    }

    #[test]
    fn precedence() {
        assert_eq!(
            parse("1 + 2 * 3").unwrap(),
            Expr::Binary(
                BinOp::Add,
                Box::new(lit(1)),
                Box::new(Expr::Binary(BinOp::Mul, Box::new(lit(2)), Box::new(lit(3))))
            )
        );
        assert!(matches!(
            parse("'a' .. 1 == 'a1'").unwrap(),
            Expr::Binary(BinOp::Eq, _, _)
        ));
        assert!(matches!(parse("!1").unwrap(), Expr::Unary(UnaryOp::Not, _)));
    }

    #[test]
    fn trailing_input_is_rejected() {
        let err = parse("1 2").unwrap_err();
        assert_eq!(err.to_string(), "E15: Invalid expression: \"1 2\"");
        assert_eq!(parse_list("'a' 1").unwrap().len(), 2);
    }

    #[test]
    fn number_coercion() {
        assert_eq!(to_number(&Value::from("12abc")), 12);
        assert_eq!(to_number(&Value::from("-3")), -3);
        assert_eq!(to_number(&Value::from("x")), 0);
    }

    #[test]
    fn display() {
        assert_eq!(to_display(&Value::from("foo")), "foo");
        assert_eq!(
            to_display(&Value::Array(vec![Value::from(1), Value::from("a")])),
            "[1, 'a']"
        );
    }
}
