//! Expression evaluation for conditions, loop cardinalities, collections and
//! data associations.
//!
//! The engine talks to the [`ExpressionEvaluator`] trait only. [`DefaultEvaluator`]
//! is a small EL-style language: `${amount > 100 && approved}`, `${size(items)}`,
//! `${'prefix-' + order.id}`. Text without `${…}` or `#{…}` is a string literal.

use crate::error::ExpressionError;
use crate::types::{Value, Variables};
use nom::{
    branch::alt,
    bytes::complete::tag,
    character::complete::{alpha1, alphanumeric1, anychar, char, digit1, multispace0, satisfy},
    combinator::{map, opt, recognize, value},
    error::{convert_error, ErrorKind, ParseError, VerboseError},
    multi::{fold_many0, many0, separated_list0},
    sequence::{delimited, pair, preceded},
    Finish, IResult,
};
use serde_json::Number;

/// Read access to variables as seen from one execution.
pub trait VariableScope {
    fn variable(&self, name: &str) -> Option<Value>;
}

impl VariableScope for Variables {
    fn variable(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &dyn VariableScope)
        -> Result<Value, ExpressionError>;
}

/// JSON type name used in error messages.
pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvaluator;

impl ExpressionEvaluator for DefaultEvaluator {
    fn evaluate(
        &self,
        expression: &str,
        scope: &dyn VariableScope,
    ) -> Result<Value, ExpressionError> {
        let trimmed = expression.trim();
        if !trimmed.contains("${") && !trimmed.contains("#{") {
            return Ok(Value::String(expression.to_string()));
        }
        let ast = parse_expression(trimmed)?;
        ast.eval(scope).map_err(|message| ExpressionError::Evaluation {
            expression: expression.to_string(),
            message,
        })
    }
}

// ─── AST ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Path(Vec<String>),
    List(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
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

impl BinOp {
    fn symbol(self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
        }
    }
}

// ─── Parser ───────────────────────────────────────────────────

type NomParseError<'a> = VerboseError<&'a str>;
type ParseResult<'a, T> = IResult<&'a str, T, NomParseError<'a>>;

fn parse_expression(text: &str) -> Result<Expr, ExpressionError> {
    let syntax = |message: String| ExpressionError::Syntax {
        expression: text.to_string(),
        message,
    };
    let (remaining, ast) = wrapped(text)
        .finish()
        .map_err(|e| syntax(convert_error(text, e)))?;
    if !remaining.trim().is_empty() {
        return Err(syntax(format!(
            "unexpected trailing text '{}' (composite expressions are not supported)",
            remaining.trim()
        )));
    }
    Ok(ast)
}

/// `${ expr }` or `#{ expr }`
fn wrapped(input: &str) -> ParseResult<'_, Expr> {
    delimited(
        alt((tag("${"), tag("#{"))),
        ws(or_expr),
        char('}'),
    )(input)
}

fn ws<'a, O, F>(inner: F) -> impl FnMut(&'a str) -> ParseResult<'a, O>
where
    F: FnMut(&'a str) -> ParseResult<'a, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn fold_binary(first: Expr, rest: Vec<(BinOp, Expr)>) -> Expr {
    rest.into_iter().fold(first, |lhs, (op, rhs)| {
        Expr::Binary(op, Box::new(lhs), Box::new(rhs))
    })
}

fn or_expr(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = and_expr(input)?;
    let (input, rest) = many0(pair(value(BinOp::Or, ws(tag("||"))), and_expr))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn and_expr(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = comparison(input)?;
    let (input, rest) = many0(pair(value(BinOp::And, ws(tag("&&"))), comparison))(input)?;
    Ok((input, fold_binary(first, rest)))
}

/// Comparisons do not chain.
fn comparison(input: &str) -> ParseResult<'_, Expr> {
    let (input, lhs) = additive(input)?;
    let (input, rhs) = opt(pair(
        ws(alt((
            value(BinOp::Eq, tag("==")),
            value(BinOp::Ne, tag("!=")),
            value(BinOp::Le, tag("<=")),
            value(BinOp::Ge, tag(">=")),
            value(BinOp::Lt, tag("<")),
            value(BinOp::Gt, tag(">")),
        ))),
        additive,
    ))(input)?;
    Ok((input, fold_binary(lhs, rhs.into_iter().collect())))
}

fn additive(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = multiplicative(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinOp::Add, char('+')),
            value(BinOp::Sub, char('-')),
        ))),
        multiplicative,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn multiplicative(input: &str) -> ParseResult<'_, Expr> {
    let (input, first) = unary(input)?;
    let (input, rest) = many0(pair(
        ws(alt((
            value(BinOp::Mul, char('*')),
            value(BinOp::Div, char('/')),
            value(BinOp::Rem, char('%')),
        ))),
        unary,
    ))(input)?;
    Ok((input, fold_binary(first, rest)))
}

fn unary(input: &str) -> ParseResult<'_, Expr> {
    alt((
        map(preceded(ws(char('!')), unary), |e| Expr::Not(Box::new(e))),
        map(preceded(ws(char('-')), unary), |e| Expr::Neg(Box::new(e))),
        primary,
    ))(input)
}

fn primary(input: &str) -> ParseResult<'_, Expr> {
    ws(alt((
        delimited(char('('), ws(or_expr), char(')')),
        map(list_items, Expr::List),
        map(number, Expr::Literal),
        map(string_literal, |s| Expr::Literal(Value::String(s))),
        word,
    )))(input)
}

fn list_items(input: &str) -> ParseResult<'_, Vec<Expr>> {
    delimited(
        char('['),
        separated_list0(char(','), ws(or_expr)),
        preceded(multispace0, char(']')),
    )(input)
}

fn number(input: &str) -> ParseResult<'_, Value> {
    let (rest, text) = recognize(pair(digit1, opt(pair(char('.'), digit1))))(input)?;
    let parsed = if text.contains('.') {
        float_value(text)
    } else {
        text.parse::<i64>()
            .ok()
            .map(Value::from)
            .or_else(|| float_value(text))
    };
    match parsed {
        Some(v) => Ok((rest, v)),
        None => Err(nom::Err::Error(VerboseError::from_error_kind(
            input,
            ErrorKind::Float,
        ))),
    }
}

fn float_value(text: &str) -> Option<Value> {
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}

fn string_literal(input: &str) -> ParseResult<'_, String> {
    alt((quoted('"'), quoted('\'')))(input)
}

fn quoted<'a>(quote: char) -> impl FnMut(&'a str) -> ParseResult<'a, String> {
    delimited(
        char(quote),
        fold_many0(
            alt((
                preceded(char('\\'), map(anychar, unescape)),
                satisfy(move |c| c != quote && c != '\\'),
            )),
            String::new,
            |mut s, c| {
                s.push(c);
                s
            },
        ),
        char(quote),
    )
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        other => other,
    }
}

fn identifier(input: &str) -> ParseResult<'_, &str> {
    recognize(pair(
        alt((alpha1, tag("_"))),
        many0(alt((alphanumeric1, tag("_")))),
    ))(input)
}

/// Keyword literal, function call, or dotted variable path.
fn word(input: &str) -> ParseResult<'_, Expr> {
    let (input, name) = identifier(input)?;
    match name {
        "true" => return Ok((input, Expr::Literal(Value::Bool(true)))),
        "false" => return Ok((input, Expr::Literal(Value::Bool(false)))),
        "null" => return Ok((input, Expr::Literal(Value::Null))),
        _ => {}
    }
    if let Ok((input, args)) = call_args(input) {
        return Ok((input, Expr::Call(name.to_string(), args)));
    }
    let (input, rest) = many0(preceded(char('.'), identifier))(input)?;
    let mut path = vec![name.to_string()];
    path.extend(rest.into_iter().map(str::to_string));
    Ok((input, Expr::Path(path)))
}

fn call_args(input: &str) -> ParseResult<'_, Vec<Expr>> {
    delimited(
        pair(multispace0, char('(')),
        separated_list0(char(','), ws(or_expr)),
        preceded(multispace0, char(')')),
    )(input)
}

// ─── Evaluation ───────────────────────────────────────────────

impl Expr {
    fn eval(&self, scope: &dyn VariableScope) -> Result<Value, String> {
        match self {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Path(path) => Ok(resolve_path(scope, path)),
            Expr::List(items) => items
                .iter()
                .map(|e| e.eval(scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Not(inner) => match inner.eval(scope)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(format!("'!' needs a boolean, got {}", type_name(&other))),
            },
            Expr::Neg(inner) => {
                let v = inner.eval(scope)?;
                if let Some(i) = v.as_i64() {
                    return i
                        .checked_neg()
                        .map(Value::from)
                        .ok_or_else(|| "integer overflow".to_string());
                }
                match v.as_f64() {
                    Some(f) => float_result(-f),
                    None => Err(format!("unary '-' needs a number, got {}", type_name(&v))),
                }
            }
            Expr::Binary(BinOp::And, lhs, rhs) => Ok(Value::Bool(
                truth(lhs.eval(scope)?, BinOp::And)? && truth(rhs.eval(scope)?, BinOp::And)?,
            )),
            Expr::Binary(BinOp::Or, lhs, rhs) => Ok(Value::Bool(
                truth(lhs.eval(scope)?, BinOp::Or)? || truth(rhs.eval(scope)?, BinOp::Or)?,
            )),
            Expr::Binary(op, lhs, rhs) => {
                let l = lhs.eval(scope)?;
                let r = rhs.eval(scope)?;
                binary(*op, &l, &r)
            }
            Expr::Call(name, args) => call(name, args, scope),
        }
    }
}

fn truth(v: Value, op: BinOp) -> Result<bool, String> {
    match v {
        Value::Bool(b) => Ok(b),
        other => Err(format!(
            "'{}' needs booleans, got {}",
            op.symbol(),
            type_name(&other)
        )),
    }
}

fn resolve_path(scope: &dyn VariableScope, path: &[String]) -> Value {
    let Some((head, tail)) = path.split_first() else {
        return Value::Null;
    };
    let mut current = scope.variable(head).unwrap_or(Value::Null);
    for segment in tail {
        current = match current {
            Value::Object(mut map) => map.remove(segment).unwrap_or(Value::Null),
            _ => Value::Null,
        };
    }
    current
}

fn float_result(f: f64) -> Result<Value, String> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| "result is not a finite number".to_string())
}

fn text(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn binary(op: BinOp, l: &Value, r: &Value) -> Result<Value, String> {
    match op {
        BinOp::Eq => Ok(Value::Bool(loose_eq(l, r))),
        BinOp::Ne => Ok(Value::Bool(!loose_eq(l, r))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return Err(format!(
                    "cannot compare {} {} {}",
                    type_name(l),
                    op.symbol(),
                    type_name(r)
                ));
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinOp::Add if l.is_string() || r.is_string() => {
            Ok(Value::String(format!("{}{}", text(l), text(r))))
        }
        _ => arithmetic(op, l, r),
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) if l.is_number() && r.is_number() => a == b,
        _ => l == r,
    }
}

fn arithmetic(op: BinOp, l: &Value, r: &Value) -> Result<Value, String> {
    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(format!(
            "'{}' needs numbers, got {} and {}",
            op.symbol(),
            type_name(l),
            type_name(r)
        ));
    };
    if matches!(op, BinOp::Div | BinOp::Rem) && b == 0.0 {
        return Err("division by zero".to_string());
    }

    if let (Some(x), Some(y), false) = (l.as_i64(), r.as_i64(), op == BinOp::Div) {
        let exact = match op {
            BinOp::Add => x.checked_add(y),
            BinOp::Sub => x.checked_sub(y),
            BinOp::Mul => x.checked_mul(y),
            _ => x.checked_rem(y),
        };
        return exact
            .map(Value::from)
            .ok_or_else(|| "integer overflow".to_string());
    }

    float_result(match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        _ => a % b,
    })
}

fn call(name: &str, args: &[Expr], scope: &dyn VariableScope) -> Result<Value, String> {
    match (name, args) {
        ("size", [arg]) => {
            let n = match arg.eval(scope)? {
                Value::Null => 0,
                Value::String(s) => s.chars().count(),
                Value::Array(items) => items.len(),
                Value::Object(map) => map.len(),
                other => return Err(format!("size() of {}", type_name(&other))),
            };
            Ok(Value::from(n as u64))
        }
        ("size", _) => Err(format!("size() takes 1 argument, got {}", args.len())),
        _ => Err(format!("unknown function '{}'", name)),
    }
}
