//! Pricing formula language
//!
//! A small arithmetic language evaluated in exact decimal arithmetic.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | power
//! power   := primary ('^' unary)?
//! primary := number | variable | 'ceil' '(' expr ')' | '(' expr ')'
//! ```
//!
//! Variables are `$time_in_seconds`, `$memory_in_mb`, `$storage_in_mb` and
//! `$number_of_nodes`. Anything else is rejected when the formula is parsed.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use dashmap::DashMap;
use paasbill_common::FormulaError;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, MathematicalOps};

type FormulaResult<T> = std::result::Result<T, FormulaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variable {
    TimeInSeconds,
    MemoryInMb,
    StorageInMb,
    NumberOfNodes,
}

impl Variable {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "time_in_seconds" => Some(Variable::TimeInSeconds),
            "memory_in_mb" => Some(Variable::MemoryInMb),
            "storage_in_mb" => Some(Variable::StorageInMb),
            "number_of_nodes" => Some(Variable::NumberOfNodes),
            _ => None,
        }
    }
}

/// Values bound to the formula variables for one slice
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Vars {
    pub time_in_seconds: Decimal,
    pub memory_in_mb: Decimal,
    pub storage_in_mb: Decimal,
    pub number_of_nodes: Decimal,
}

impl Vars {
    fn get(&self, var: Variable) -> Decimal {
        match var {
            Variable::TimeInSeconds => self.time_in_seconds,
            Variable::MemoryInMb => self.memory_in_mb,
            Variable::StorageInMb => self.storage_in_mb,
            Variable::NumberOfNodes => self.number_of_nodes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Number(Decimal),
    Var(Variable),
    Neg(Box<Expr>),
    Ceil(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(Decimal),
    Var(Variable),
    Ceil,
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Caret,
}

fn tokenize(source: &str) -> FormulaResult<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => {
                i += 1;
            }
            '(' | ')' | '+' | '-' | '*' | '/' | '^' => {
                tokens.push(match c {
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    '+' => Token::Plus,
                    '-' => Token::Minus,
                    '*' => Token::Star,
                    '/' => Token::Slash,
                    _ => Token::Caret,
                });
                i += 1;
            }
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                // scientific suffix: e, E, optional sign, digits
                if i < chars.len() && (chars[i] == 'e' || chars[i] == 'E') {
                    let mut j = i + 1;
                    if j < chars.len() && (chars[j] == '+' || chars[j] == '-') {
                        j += 1;
                    }
                    if j < chars.len() && chars[j].is_ascii_digit() {
                        while j < chars.len() && chars[j].is_ascii_digit() {
                            j += 1;
                        }
                        i = j;
                    }
                }
                let literal: String = chars[start..i].iter().collect();
                tokens.push(Token::Number(parse_number(&literal)?));
            }
            '$' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start + 1..i].iter().collect();
                match Variable::from_name(&name) {
                    Some(var) => tokens.push(Token::Var(var)),
                    None => {
                        let token: String = chars[start..i].iter().collect();
                        return Err(FormulaError::IllegalToken(token));
                    }
                }
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if word.eq_ignore_ascii_case("ceil") {
                    tokens.push(Token::Ceil);
                } else {
                    return Err(FormulaError::IllegalToken(word));
                }
            }
            other => return Err(FormulaError::IllegalToken(other.to_string())),
        }
    }
    Ok(tokens)
}

fn parse_number(literal: &str) -> FormulaResult<Decimal> {
    let parsed = if literal.contains(|c: char| c == 'e' || c == 'E') {
        Decimal::from_scientific(literal)
    } else {
        Decimal::from_str(literal)
    };
    parsed.map_err(|_| FormulaError::InvalidNumber(literal.to_string()))
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn expr(&mut self) -> FormulaResult<Expr> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn term(&mut self) -> FormulaResult<Expr> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
    }

    fn unary(&mut self) -> FormulaResult<Expr> {
        if matches!(self.peek(), Some(Token::Minus)) {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.power()
    }

    fn power(&mut self) -> FormulaResult<Expr> {
        let base = self.primary()?;
        if matches!(self.peek(), Some(Token::Caret)) {
            self.pos += 1;
            // right associative: 2^3^2 == 2^(3^2)
            let exponent = self.unary()?;
            return Ok(Expr::Binary(BinaryOp::Pow, Box::new(base), Box::new(exponent)));
        }
        Ok(base)
    }

    fn primary(&mut self) -> FormulaResult<Expr> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Var(v)) => Ok(Expr::Var(v)),
            Some(Token::Ceil) => {
                match self.next() {
                    Some(Token::LParen) => {}
                    Some(other) => return Err(FormulaError::IllegalToken(token_text(&other))),
                    None => return Err(FormulaError::UnexpectedEnd),
                }
                let inner = self.expr()?;
                self.close_paren()?;
                Ok(Expr::Ceil(Box::new(inner)))
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                self.close_paren()?;
                Ok(inner)
            }
            Some(Token::RParen) => Err(FormulaError::UnbalancedParens),
            Some(other) => Err(FormulaError::IllegalToken(token_text(&other))),
            None => Err(FormulaError::UnexpectedEnd),
        }
    }

    fn close_paren(&mut self) -> FormulaResult<()> {
        match self.next() {
            Some(Token::RParen) => Ok(()),
            Some(other) => Err(FormulaError::IllegalToken(token_text(&other))),
            None => Err(FormulaError::UnbalancedParens),
        }
    }
}

fn token_text(token: &Token) -> String {
    match token {
        Token::Number(n) => n.to_string(),
        Token::Var(v) => format!("{v:?}"),
        Token::Ceil => "ceil".to_string(),
        Token::LParen => "(".to_string(),
        Token::RParen => ")".to_string(),
        Token::Plus => "+".to_string(),
        Token::Minus => "-".to_string(),
        Token::Star => "*".to_string(),
        Token::Slash => "/".to_string(),
        Token::Caret => "^".to_string(),
    }
}

/// A parsed pricing formula
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> FormulaResult<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FormulaError::UnexpectedEnd);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        match parser.next() {
            None => Ok(Self {
                source: source.to_string(),
                expr,
            }),
            Some(Token::RParen) => Err(FormulaError::UnbalancedParens),
            Some(other) => Err(FormulaError::IllegalToken(token_text(&other))),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn eval(&self, vars: &Vars) -> FormulaResult<Decimal> {
        eval(&self.expr, vars)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

fn eval(expr: &Expr, vars: &Vars) -> FormulaResult<Decimal> {
    match expr {
        Expr::Number(n) => Ok(*n),
        Expr::Var(v) => Ok(vars.get(*v)),
        Expr::Neg(inner) => Ok(-eval(inner, vars)?),
        Expr::Ceil(inner) => Ok(eval(inner, vars)?.ceil()),
        Expr::Binary(op, lhs, rhs) => {
            let a = eval(lhs, vars)?;
            let b = eval(rhs, vars)?;
            match op {
                BinaryOp::Add => a.checked_add(b).ok_or(FormulaError::Overflow),
                BinaryOp::Sub => a.checked_sub(b).ok_or(FormulaError::Overflow),
                BinaryOp::Mul => a.checked_mul(b).ok_or(FormulaError::Overflow),
                BinaryOp::Div => {
                    if b.is_zero() {
                        return Err(FormulaError::DivisionByZero);
                    }
                    a.checked_div(b).ok_or(FormulaError::Overflow)
                }
                BinaryOp::Pow => power(a, b),
            }
        }
    }
}

fn power(base: Decimal, exponent: Decimal) -> FormulaResult<Decimal> {
    if exponent.fract().is_zero() {
        if let Some(exp) = exponent.to_i64() {
            if base.is_zero() && exp < 0 {
                return Err(FormulaError::DivisionByZero);
            }
            return base.checked_powi(exp).ok_or(FormulaError::Overflow);
        }
    }
    base.checked_powd(exponent).ok_or(FormulaError::Overflow)
}

/// Parsed formulas keyed by their source text
#[derive(Debug, Default)]
pub struct FormulaCache {
    formulas: DashMap<String, Arc<Formula>>,
}

impl FormulaCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_parse(&self, source: &str) -> FormulaResult<Arc<Formula>> {
        if let Some(formula) = self.formulas.get(source) {
            return Ok(formula.clone());
        }
        let formula = Arc::new(Formula::parse(source)?);
        self.formulas.insert(source.to_string(), formula.clone());
        Ok(formula)
    }

    pub fn len(&self) -> usize {
        self.formulas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formulas.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn eval_str(source: &str, vars: &Vars) -> FormulaResult<Decimal> {
        Formula::parse(source)?.eval(vars)
    }

    fn vars(seconds: Decimal) -> Vars {
        Vars {
            time_in_seconds: seconds,
            memory_in_mb: dec!(1024),
            storage_in_mb: dec!(2048),
            number_of_nodes: dec!(2),
        }
    }

    #[test]
    fn test_precedence_and_associativity() {
        let v = Vars::default();
        assert_eq!(eval_str("1 + 2 * 3", &v).unwrap(), dec!(7));
        assert_eq!(eval_str("(1 + 2) * 3", &v).unwrap(), dec!(9));
        assert_eq!(eval_str("10 - 4 - 3", &v).unwrap(), dec!(3));
        assert_eq!(eval_str("2 ^ 3 ^ 2", &v).unwrap(), dec!(512));
        assert_eq!(eval_str("-2 ^ 2", &v).unwrap(), dec!(-4));
        assert_eq!(eval_str("2 ^ -1", &v).unwrap(), dec!(0.5));
    }

    #[test]
    fn test_division_is_exact() {
        let v = Vars::default();
        assert_eq!(eval_str("7 / 2", &v).unwrap(), dec!(3.5));
        assert_eq!(eval_str("1 / 0", &v).unwrap_err(), FormulaError::DivisionByZero);
    }

    #[test]
    fn test_literals() {
        let v = Vars::default();
        assert_eq!(eval_str("1.5e2", &v).unwrap(), dec!(150));
        assert_eq!(eval_str("2E-2", &v).unwrap(), dec!(0.02));
        assert!(matches!(Formula::parse("1.2.3"), Err(FormulaError::InvalidNumber(_))));
    }

    #[test]
    fn test_variables_and_ceil() {
        let v = vars(dec!(3601));
        assert_eq!(eval_str("ceil($time_in_seconds / 3600) * 0.01", &v).unwrap(), dec!(0.02));
        assert_eq!(
            eval_str("$number_of_nodes * $memory_in_mb * $storage_in_mb", &v).unwrap(),
            dec!(4194304)
        );
    }

    #[test]
    fn test_compute_formula_rounds_to_exact_hours() {
        let formula =
            "$number_of_nodes * $time_in_seconds * ($memory_in_mb/1024) * (0.01 / 3600)";
        let v = Vars {
            time_in_seconds: dec!(1209600),
            memory_in_mb: dec!(1024),
            storage_in_mb: dec!(0),
            number_of_nodes: dec!(1),
        };
        let value = eval_str(formula, &v)
            .unwrap()
            .round_dp_with_strategy(16, rust_decimal::RoundingStrategy::MidpointAwayFromZero);
        assert_eq!(value.normalize(), dec!(3.36));
    }

    #[test]
    fn test_rejects_illegal_tokens() {
        assert_eq!(
            Formula::parse("1; drop table events").unwrap_err(),
            FormulaError::IllegalToken(";".to_string())
        );
        assert_eq!(
            Formula::parse("select 1").unwrap_err(),
            FormulaError::IllegalToken("select".to_string())
        );
        assert_eq!(
            Formula::parse("$foo * 2").unwrap_err(),
            FormulaError::IllegalToken("$foo".to_string())
        );
        assert_eq!(
            Formula::parse("$foo * 2").unwrap_err().to_string(),
            "illegal token in formula: $foo"
        );
    }

    #[test]
    fn test_structural_errors() {
        assert_eq!(Formula::parse("").unwrap_err(), FormulaError::UnexpectedEnd);
        assert_eq!(Formula::parse("1 +").unwrap_err(), FormulaError::UnexpectedEnd);
        assert_eq!(Formula::parse("(1 + 2").unwrap_err(), FormulaError::UnbalancedParens);
        assert_eq!(Formula::parse("1 + 2)").unwrap_err(), FormulaError::UnbalancedParens);
        assert!(Formula::parse("1 2").is_err());
    }

    #[test]
    fn test_cache_reuses_parsed_formula() {
        let cache = FormulaCache::new();
        let a = cache.get_or_parse("1 + 1").unwrap();
        let b = cache.get_or_parse("1 + 1").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
        assert!(cache.get_or_parse("bogus").is_err());
        assert_eq!(cache.len(), 1);
    }
}
