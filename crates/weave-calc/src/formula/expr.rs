//! Built-in arithmetic formula language.
//!
//! ```text
//! expr    := term (('+' | '-') term)*
//! term    := unary (('*' | '/') unary)*
//! unary   := '-' unary | primary
//! primary := number | string | true | false | null
//!          | '#' tag                  every bot's value of `tag`, by bot id
//!          | '@' bot ('.' tag)?       a bot's tag, or its id if it exists
//!          | 'this' '.' tag           the evaluating bot's own tag
//!          | name '(' (expr (',' expr)*)? ')'
//!          | '(' expr ')'
//! ```
//!
//! Functions: `sum`, `count`, `min`, `max`, `avg`, `getBots`.

use serde_json::Value;
use weave_aux::value::text_form;

use super::lexer::{Spanned, Token, tokenize};
use super::{FormulaError, FormulaEvaluator, number};
use crate::precalc::CalculationContext;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Literal(Value),
    Tag(String),
    Bot { id: String, tag: Option<String> },
    This(String),
    Call { name: String, args: Vec<Expr> },
    Neg(Box<Expr>),
    Binary { op: BinOp, lhs: Box<Expr>, rhs: Box<Expr> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Parse formula source into an expression tree.
///
/// # Errors
///
/// [`FormulaError::Parse`] or [`FormulaError::UnknownIdentifier`].
pub fn parse(source: &str) -> Result<Expr, FormulaError> {
    let tokens = tokenize(source)?;
    let mut parser = Parser {
        tokens: &tokens,
        pos: 0,
        end: source.chars().count(),
    };
    let expr = parser.expr()?;
    match parser.peek() {
        None => Ok(expr),
        Some(_) => Err(parser.error("unexpected trailing input")),
    }
}

struct Parser<'a> {
    tokens: &'a [Spanned],
    pos: usize,
    end: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|s| &s.token)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).map(|s| s.token.clone());
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> bool {
        if self.peek() == Some(token) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn error(&self, message: &str) -> FormulaError {
        FormulaError::Parse {
            offset: self.tokens.get(self.pos).map_or(self.end, |s| s.offset),
            message: message.to_string(),
        }
    }

    fn expect(&mut self, token: &Token, message: &str) -> Result<(), FormulaError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                _ => return Ok(lhs),
            };
            self.pos += 1;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if self.eat(&Token::Minus) {
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.primary()
    }

    fn name(&mut self, message: &str) -> Result<String, FormulaError> {
        match self.peek() {
            Some(Token::Ident(name)) => {
                let name = name.clone();
                self.pos += 1;
                Ok(name)
            }
            _ => Err(self.error(message)),
        }
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let at = self.pos;
        let Some(token) = self.next() else {
            return Err(self.error("unexpected end of formula"));
        };
        match token {
            Token::Number(n) => Ok(Expr::Literal(number(n))),
            Token::Str(text) => Ok(Expr::Literal(Value::String(text))),
            Token::TagRef(name) => Ok(Expr::Tag(name)),
            Token::BotRef(id) => {
                let tag = if self.eat(&Token::Dot) {
                    Some(self.name("expected a tag name after '.'")?)
                } else {
                    None
                };
                Ok(Expr::Bot { id, tag })
            }
            Token::LParen => {
                let inner = self.expr()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(inner)
            }
            Token::Ident(name) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                "this" => {
                    self.expect(&Token::Dot, "expected '.' after this")?;
                    Ok(Expr::This(self.name("expected a tag name after 'this.'")?))
                }
                _ if self.eat(&Token::LParen) => {
                    let mut args = Vec::new();
                    if !self.eat(&Token::RParen) {
                        loop {
                            args.push(self.expr()?);
                            if self.eat(&Token::RParen) {
                                break;
                            }
                            self.expect(&Token::Comma, "expected ',' or ')'")?;
                        }
                    }
                    Ok(Expr::Call { name, args })
                }
                _ => Err(FormulaError::UnknownIdentifier(name)),
            },
            _ => {
                self.pos = at;
                Err(self.error("expected a value"))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// [`FormulaEvaluator`] for the built-in language.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprEvaluator;

impl FormulaEvaluator for ExprEvaluator {
    fn evaluate(
        &self,
        source: &str,
        bot: &str,
        _tag: &str,
        context: &mut CalculationContext<'_>,
    ) -> Result<Value, FormulaError> {
        let expr = parse(source)?;
        eval(&expr, bot, context)
    }
}

fn eval(expr: &Expr, bot: &str, cx: &mut CalculationContext<'_>) -> Result<Value, FormulaError> {
    match expr {
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Tag(name) => Ok(Value::Array(cx.values_of_tag(name))),
        Expr::Bot { id, tag: None } => Ok(if cx.has_bot(id) {
            Value::String(id.clone())
        } else {
            Value::Null
        }),
        Expr::Bot { id, tag: Some(tag) } => Ok(cx.value_of(id, tag)),
        Expr::This(tag) => Ok(cx.value_of(bot, tag)),
        Expr::Neg(inner) => {
            let value = eval(inner, bot, cx)?;
            Ok(number(-as_number(&value)?))
        }
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, bot, cx)?;
            let rhs = eval(rhs, bot, cx)?;
            binary(*op, &lhs, &rhs)
        }
        Expr::Call { name, args } => {
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval(arg, bot, cx)?);
            }
            call(name, values, cx)
        }
    }
}

fn as_number(value: &Value) -> Result<f64, FormulaError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| FormulaError::Type(format!("{n} is not representable"))),
        Value::Bool(b) => Ok(f64::from(u8::from(*b))),
        other => Err(FormulaError::Type(format!("expected a number, got {other}"))),
    }
}

#[allow(clippy::float_cmp)]
fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, FormulaError> {
    if op == BinOp::Add && (lhs.is_string() || rhs.is_string()) {
        return Ok(Value::String(text_form(lhs) + &text_form(rhs)));
    }
    let (a, b) = (as_number(lhs)?, as_number(rhs)?);
    let n = match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => {
            if b == 0.0 {
                return Err(FormulaError::DivisionByZero);
            }
            a / b
        }
    };
    Ok(number(n))
}

/// Arguments with arrays spliced in and nulls dropped.
fn flatten(values: Vec<Value>) -> Vec<Value> {
    let mut out = Vec::new();
    for value in values {
        match value {
            Value::Array(items) => out.extend(items.into_iter().filter(|v| !v.is_null())),
            Value::Null => {}
            other => out.push(other),
        }
    }
    out
}

fn numbers(values: Vec<Value>) -> Result<Vec<f64>, FormulaError> {
    flatten(values).iter().map(as_number).collect()
}

#[allow(clippy::cast_precision_loss)]
fn call(
    name: &str,
    args: Vec<Value>,
    cx: &CalculationContext<'_>,
) -> Result<Value, FormulaError> {
    match name {
        "sum" => Ok(number(numbers(args)?.iter().sum())),
        "count" => Ok(Value::from(flatten(args).len())),
        "avg" => {
            let ns = numbers(args)?;
            if ns.is_empty() {
                return Ok(Value::Null);
            }
            Ok(number(ns.iter().sum::<f64>() / ns.len() as f64))
        }
        "min" => Ok(numbers(args)?.into_iter().reduce(f64::min).map_or(Value::Null, number)),
        "max" => Ok(numbers(args)?.into_iter().reduce(f64::max).map_or(Value::Null, number)),
        "getBots" => Ok(Value::Array(
            cx.bot_ids().map(|id| Value::String(id.to_string())).collect(),
        )),
        other => Err(FormulaError::UnknownFunction(other.to_string())),
    }
}
