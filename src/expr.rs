//! A total, side-effect-free expression evaluator for `conditional`,
//! `computed_count`, and variant `when` clauses.
//!
//! Grammar: integer literals, dotted field-name identifiers, parens, the
//! arithmetic operators `+ - * / %`, comparisons `== != < <= > >=`, logical
//! `&& ||`, and a prefix `!`. No function calls. Hand-written recursive
//! descent rather than a parser combinator crate: the grammar is a dozen
//! productions and stays fixed by design (see the note against extending it
//! in the schema validator).

use fxhash::FxHashMap;
use std::fmt;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ExprError {
    #[error("parse error in expression '{src}': {message}")]
    Parse { src: String, message: String },
    #[error("unknown identifier '{0}'")]
    UnknownIdentifier(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("integer overflow evaluating expression")]
    Overflow,
}

/// A resolved scope of already-decoded (or caller-supplied) field values,
/// keyed by dotted identifier path.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    values: FxHashMap<String, i64>,
}

impl Scope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: i64) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: i64) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<i64> {
        self.values.get(name).copied()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

/// A parsed expression tree.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Expr {
    IntLiteral(i64),
    Ident(String),
    Unary(UnOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::IntLiteral(n) => write!(f, "{n}"),
            Expr::Ident(name) => write!(f, "{name}"),
            Expr::Unary(UnOp::Neg, e) => write!(f, "-({e})"),
            Expr::Unary(UnOp::Not, e) => write!(f, "!({e})"),
            Expr::Binary(op, l, r) => {
                let sym = match op {
                    BinOp::Add => "+",
                    BinOp::Sub => "-",
                    BinOp::Mul => "*",
                    BinOp::Div => "/",
                    BinOp::Rem => "%",
                    BinOp::Eq => "==",
                    BinOp::Ne => "!=",
                    BinOp::Lt => "<",
                    BinOp::Le => "<=",
                    BinOp::Gt => ">",
                    BinOp::Ge => ">=",
                    BinOp::And => "&&",
                    BinOp::Or => "||",
                };
                write!(f, "({l} {sym} {r})")
            }
        }
    }
}

impl Expr {
    pub fn parse(src: &str) -> Result<Expr, ExprError> {
        let tokens = lex(src)?;
        let mut parser = ExprParser {
            tokens: &tokens,
            pos: 0,
            src,
        };
        let expr = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(ExprError::Parse {
                src: src.to_owned(),
                message: "unexpected trailing tokens".to_owned(),
            });
        }
        Ok(expr)
    }

    /// Evaluate against `scope`, returning the 64-bit result. Truthiness for
    /// `conditional`/`when` is "non-zero", matching C-family convention.
    pub fn eval(&self, scope: &Scope) -> Result<i64, ExprError> {
        match self {
            Expr::IntLiteral(n) => Ok(*n),
            Expr::Ident(name) => scope
                .get(name)
                .ok_or_else(|| ExprError::UnknownIdentifier(name.clone())),
            Expr::Unary(UnOp::Neg, e) => e.eval(scope)?.checked_neg().ok_or(ExprError::Overflow),
            Expr::Unary(UnOp::Not, e) => Ok((e.eval(scope)? == 0) as i64),
            Expr::Binary(op, l, r) => {
                // Short-circuit && and || before evaluating the right side.
                if *op == BinOp::And {
                    let lv = l.eval(scope)?;
                    if lv == 0 {
                        return Ok(0);
                    }
                    return Ok((r.eval(scope)? != 0) as i64);
                }
                if *op == BinOp::Or {
                    let lv = l.eval(scope)?;
                    if lv != 0 {
                        return Ok(1);
                    }
                    return Ok((r.eval(scope)? != 0) as i64);
                }
                let lv = l.eval(scope)?;
                let rv = r.eval(scope)?;
                match op {
                    BinOp::Add => lv.checked_add(rv).ok_or(ExprError::Overflow),
                    BinOp::Sub => lv.checked_sub(rv).ok_or(ExprError::Overflow),
                    BinOp::Mul => lv.checked_mul(rv).ok_or(ExprError::Overflow),
                    BinOp::Div => {
                        if rv == 0 {
                            Err(ExprError::DivisionByZero)
                        } else {
                            lv.checked_div(rv).ok_or(ExprError::Overflow)
                        }
                    }
                    BinOp::Rem => {
                        if rv == 0 {
                            Err(ExprError::DivisionByZero)
                        } else {
                            lv.checked_rem(rv).ok_or(ExprError::Overflow)
                        }
                    }
                    BinOp::Eq => Ok((lv == rv) as i64),
                    BinOp::Ne => Ok((lv != rv) as i64),
                    BinOp::Lt => Ok((lv < rv) as i64),
                    BinOp::Le => Ok((lv <= rv) as i64),
                    BinOp::Gt => Ok((lv > rv) as i64),
                    BinOp::Ge => Ok((lv >= rv) as i64),
                    BinOp::And | BinOp::Or => unreachable!("handled above"),
                }
            }
        }
    }

    pub fn eval_bool(&self, scope: &Scope) -> Result<bool, ExprError> {
        Ok(self.eval(scope)? != 0)
    }

    /// Every dotted identifier referenced by this expression, for schema
    /// validation of `length_field`/`computed_count` references.
    pub fn identifiers(&self, out: &mut Vec<String>) {
        match self {
            Expr::IntLiteral(_) => {}
            Expr::Ident(name) => out.push(name.clone()),
            Expr::Unary(_, e) => e.identifiers(out),
            Expr::Binary(_, l, r) => {
                l.identifiers(out);
                r.identifiers(out);
            }
        }
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
enum Token {
    Int(i64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    LParen,
    RParen,
}

fn lex(src: &str) -> Result<Vec<Token>, ExprError> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |message: &str| ExprError::Parse {
        src: src.to_owned(),
        message: message.to_owned(),
    };
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => {
                i += 1;
            }
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
                i += 1;
            }
            '*' => {
                tokens.push(Token::Star);
                i += 1;
            }
            '/' => {
                tokens.push(Token::Slash);
                i += 1;
            }
            '%' => {
                tokens.push(Token::Percent);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::EqEq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Bang);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::AndAnd);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::OrOr);
                i += 2;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_digit() {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<i64>().map_err(|_| err("integer literal overflows i64"))?;
                tokens.push(Token::Int(value));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                tokens.push(Token::Ident(text));
            }
            other => return Err(err(&format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    src: &'a str,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn err(&self, message: &str) -> ExprError {
        ExprError::Parse {
            src: self.src.to_owned(),
            message: message.to_owned(),
        }
    }

    // or_expr := and_expr ('||' and_expr)*
    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some(Token::OrOr)) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Binary(BinOp::Or, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // and_expr := equality ('&&' equality)*
    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_equality()?;
        while matches!(self.peek(), Some(Token::AndAnd)) {
            self.bump();
            let rhs = self.parse_equality()?;
            lhs = Expr::Binary(BinOp::And, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // equality := comparison (('==' | '!=') comparison)*
    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_comparison()?;
        loop {
            let op = match self.peek() {
                Some(Token::EqEq) => BinOp::Eq,
                Some(Token::Ne) => BinOp::Ne,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_comparison()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // comparison := additive (('<'|'<='|'>'|'>=') additive)*
    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => BinOp::Lt,
                Some(Token::Le) => BinOp::Le,
                Some(Token::Gt) => BinOp::Gt,
                Some(Token::Ge) => BinOp::Ge,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_additive()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // additive := multiplicative (('+'|'-') multiplicative)*
    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_multiplicative()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // multiplicative := unary (('*'|'/'|'%') unary)*
    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => break,
            };
            self.bump();
            let rhs = self.parse_unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    // unary := ('!' | '-') unary | primary
    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        match self.peek() {
            Some(Token::Bang) => {
                self.bump();
                Ok(Expr::Unary(UnOp::Not, Box::new(self.parse_unary()?)))
            }
            Some(Token::Minus) => {
                self.bump();
                Ok(Expr::Unary(UnOp::Neg, Box::new(self.parse_unary()?)))
            }
            _ => self.parse_primary(),
        }
    }

    // primary := INT | IDENT | '(' or_expr ')'
    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.bump() {
            Some(Token::Int(n)) => Ok(Expr::IntLiteral(*n)),
            Some(Token::Ident(name)) => Ok(Expr::Ident(name.clone())),
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(self.err("expected closing ')'")),
                }
            }
            _ => Err(self.err("expected a literal, identifier, or '('")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arithmetic_precedence() {
        let e = Expr::parse("1 + 2 * 3").unwrap();
        assert_eq!(e.eval(&Scope::new()).unwrap(), 7);
    }

    #[test]
    fn field_reference_and_comparison() {
        let e = Expr::parse("count > 0 && flag == 1").unwrap();
        let scope = Scope::new().with("count", 5).with("flag", 1);
        assert!(e.eval_bool(&scope).unwrap());
    }

    #[test]
    fn dotted_identifier() {
        let e = Expr::parse("header.version >= 2").unwrap();
        let scope = Scope::new().with("header.version", 3);
        assert!(e.eval_bool(&scope).unwrap());
    }

    #[test]
    fn division_by_zero_is_an_error() {
        let e = Expr::parse("1 / x").unwrap();
        let scope = Scope::new().with("x", 0);
        assert!(matches!(
            e.eval(&scope),
            Err(ExprError::DivisionByZero)
        ));
    }

    #[test]
    fn unknown_identifier_is_an_error() {
        let e = Expr::parse("missing + 1").unwrap();
        assert!(matches!(
            e.eval(&Scope::new()),
            Err(ExprError::UnknownIdentifier(_))
        ));
    }

    #[test]
    fn unary_not_and_neg() {
        let e = Expr::parse("!(x < 0)").unwrap();
        let scope = Scope::new().with("x", 5);
        assert!(e.eval_bool(&scope).unwrap());
    }

    #[test]
    fn short_circuit_or_skips_unknown_identifier() {
        let e = Expr::parse("1 == 1 || missing == 1").unwrap();
        assert!(e.eval_bool(&Scope::new()).unwrap());
    }
}
