#![forbid(unsafe_code)]

use std::collections::BTreeSet;

use chrono::Utc;
use rt_frame::{DataFrame, Row, Schema, parse_date_text};
use rt_types::{TypeError, Value};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Aggregation kinds recognized at the top level of a formula.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationKind {
    Argmax,
    Count,
    Max,
    Mean,
    Median,
    Min,
    Newest,
    Pearson,
    Ratio,
    Std,
    Sum,
    Var,
}

pub const AGGREGATION_KINDS: [AggregationKind; 12] = [
    AggregationKind::Argmax,
    AggregationKind::Count,
    AggregationKind::Max,
    AggregationKind::Mean,
    AggregationKind::Median,
    AggregationKind::Min,
    AggregationKind::Newest,
    AggregationKind::Pearson,
    AggregationKind::Ratio,
    AggregationKind::Std,
    AggregationKind::Sum,
    AggregationKind::Var,
];

impl AggregationKind {
    #[must_use]
    pub fn formula_name(self) -> &'static str {
        match self {
            Self::Argmax => "argmax",
            Self::Count => "count",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::Median => "median",
            Self::Min => "min",
            Self::Newest => "newest",
            Self::Pearson => "pearson",
            Self::Ratio => "ratio",
            Self::Std => "std",
            Self::Sum => "sum",
            Self::Var => "var",
        }
    }

    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        AGGREGATION_KINDS
            .into_iter()
            .find(|kind| kind.formula_name().eq_ignore_ascii_case(name))
    }

    /// Valid argument counts: `count` may take none, two-column kinds take a
    /// pair of operand expressions, the rest exactly one.
    #[must_use]
    pub fn accepts_arity(self, arity: usize) -> bool {
        match self {
            Self::Count => arity <= 1,
            Self::Ratio | Self::Newest | Self::Pearson => arity == 2,
            _ => arity == 1,
        }
    }
}

pub const FUNCTION_NAMES: [&str; 3] = ["date", "percentile", "today"];
pub const OPERATOR_NAMES: [&str; 5] = ["and", "or", "not", "in", "case"];
pub const SPECIAL_NAMES: [&str; 1] = ["default"];

/// All words a column slug may not shadow.
#[must_use]
pub fn reserved_words() -> Vec<&'static str> {
    AGGREGATION_KINDS
        .iter()
        .map(|kind| kind.formula_name())
        .chain(FUNCTION_NAMES)
        .chain(OPERATOR_NAMES)
        .chain(SPECIAL_NAMES)
        .collect()
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    #[error("parse failure for formula {formula:?}: {detail}")]
    Malformed { formula: String, detail: String },
    #[error("missing column reference: {0}")]
    MissingColumn(String),
    #[error("no schema for dataset, please add data or wait for it to finish processing")]
    MissingSchema,
    #[error("group {0} not in dataset columns")]
    UnknownGroup(String),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EvalError {
    #[error("unknown column: {0}")]
    UnknownColumn(String),
    #[error(transparent)]
    NonNumeric(#[from] TypeError),
    #[error("cannot parse date literal {0:?}")]
    BadDateLiteral(String),
    #[error("percentile requires a dataset-backed evaluation context")]
    NoFrameContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
    Eq,
}

impl CompareOp {
    fn holds(self, left: f64, right: f64) -> bool {
        match self {
            Self::Lt => left < right,
            Self::Le => left <= right,
            Self::Gt => left > right,
            Self::Ge => left >= right,
            Self::Ne => left != right,
            Self::Eq => left == right,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseBranch {
    pub condition: Expr,
    pub result: Expr,
}

/// Typed formula AST. Each variant evaluates against one row plus a context
/// carrying the dataset schema and, for `percentile`, the full frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Expr {
    Number(f64),
    Str(String),
    Column(String),
    Sign {
        negative: bool,
        operand: Box<Expr>,
    },
    Arith {
        op: ArithOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    /// Chained comparison: every adjacent pair must hold.
    Comparison {
        first: Box<Expr>,
        rest: Vec<(CompareOp, Expr)>,
    },
    Not(Box<Expr>),
    Logical {
        op: LogicalOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },
    In {
        operand: Box<Expr>,
        choices: Vec<String>,
    },
    Case {
        branches: Vec<CaseBranch>,
        default: Option<Box<Expr>>,
    },
    Date(Box<Expr>),
    Today,
    Percentile(Box<Expr>),
}

/// Evaluation context: schema for date-typed column lookups, and optionally
/// the whole frame for column-wide functions.
#[derive(Debug, Clone, Copy)]
pub struct EvalContext<'a> {
    pub schema: &'a Schema,
    pub frame: Option<&'a DataFrame>,
}

impl<'a> EvalContext<'a> {
    #[must_use]
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            frame: None,
        }
    }

    #[must_use]
    pub fn with_frame(schema: &'a Schema, frame: &'a DataFrame) -> Self {
        Self {
            schema,
            frame: Some(frame),
        }
    }
}

impl Expr {
    pub fn evaluate(&self, row: &Row<'_>, context: &EvalContext<'_>) -> Result<Value, EvalError> {
        match self {
            Self::Number(v) => Ok(Value::Number(*v)),
            Self::Str(v) => Ok(Value::Text(v.clone())),
            Self::Column(name) => {
                // An identifier that parses as a number is a literal.
                if let Ok(v) = name.parse::<f64>() {
                    return Ok(Value::Number(v));
                }
                let value = row
                    .get(name)
                    .ok_or_else(|| EvalError::UnknownColumn(name.clone()))?;
                if context.schema.is_date(name) {
                    Ok(Value::Number(value.to_f64()?))
                } else {
                    Ok(value.clone())
                }
            }
            Self::Sign { negative, operand } => {
                let v = operand.evaluate(row, context)?.to_f64()?;
                Ok(Value::Number(if *negative { -v } else { v }))
            }
            Self::Arith { op, left, right } => {
                let lhs = left.evaluate(row, context)?.to_f64()?;
                let rhs = right.evaluate(row, context)?.to_f64()?;
                let out = match op {
                    ArithOp::Add => lhs + rhs,
                    ArithOp::Sub => lhs - rhs,
                    ArithOp::Mul => lhs * rhs,
                    ArithOp::Div => lhs / rhs,
                    ArithOp::Pow => lhs.powf(rhs),
                };
                // Overflow and division by zero surface as NaN, never infinity.
                Ok(Value::Number(if out.is_infinite() { f64::NAN } else { out }))
            }
            Self::Comparison { first, rest } => {
                let mut prev = first.evaluate(row, context)?.to_f64()?;
                for (op, operand) in rest {
                    let next = operand.evaluate(row, context)?.to_f64()?;
                    if !op.holds(prev, next) {
                        return Ok(Value::Bool(false));
                    }
                    prev = next;
                }
                Ok(Value::Bool(true))
            }
            Self::Not(operand) => Ok(Value::Bool(!operand.evaluate(row, context)?.truthy())),
            Self::Logical { op, left, right } => {
                // Both operands are always evaluated; formulas are pure, so
                // skipping the right side would only change error ordering.
                let lhs = left.evaluate(row, context)?.truthy();
                let rhs = right.evaluate(row, context)?.truthy();
                Ok(Value::Bool(match op {
                    LogicalOp::And => lhs && rhs,
                    LogicalOp::Or => lhs || rhs,
                }))
            }
            Self::In { operand, choices } => {
                let needle = operand.evaluate(row, context)?.to_text();
                Ok(Value::Bool(choices.iter().any(|choice| *choice == needle)))
            }
            Self::Case { branches, default } => {
                for branch in branches {
                    if branch.condition.evaluate(row, context)?.truthy() {
                        return branch.result.evaluate(row, context);
                    }
                }
                match default {
                    Some(result) => result.evaluate(row, context),
                    None => Ok(Value::Number(f64::NAN)),
                }
            }
            Self::Date(operand) => {
                let text = operand.evaluate(row, context)?.to_text();
                parse_date_text(&text)
                    .map(|unix| Value::Number(unix as f64))
                    .ok_or(EvalError::BadDateLiteral(text))
            }
            Self::Today => Ok(Value::Number(Utc::now().timestamp() as f64)),
            Self::Percentile(operand) => {
                let frame = context.frame.ok_or(EvalError::NoFrameContext)?;
                let score = operand.evaluate(row, context)?.to_f64()?;
                if score.is_nan() {
                    return Ok(Value::Number(f64::NAN));
                }
                let mut below = 0_usize;
                let mut at_or_below = 0_usize;
                let mut count = 0_usize;
                for other in frame.rows() {
                    let v = operand.evaluate(&other, context)?.to_f64()?;
                    if v.is_nan() {
                        continue;
                    }
                    count += 1;
                    if v < score {
                        below += 1;
                    }
                    if v <= score {
                        at_or_below += 1;
                    }
                }
                if count == 0 {
                    return Ok(Value::Number(f64::NAN));
                }
                // Average-rank percentile of the score within its column.
                let rank = 50.0 * (below + at_or_below) as f64 / count as f64;
                Ok(Value::Number(rank))
            }
        }
    }

    /// Column slugs this expression reads. Numeric-looking identifiers are
    /// literals and contribute nothing.
    pub fn collect_columns(&self, out: &mut BTreeSet<String>) {
        match self {
            Self::Number(_) | Self::Str(_) | Self::Today => {}
            Self::Column(name) => {
                if name.parse::<f64>().is_err() {
                    out.insert(name.clone());
                }
            }
            Self::Sign { operand, .. }
            | Self::Not(operand)
            | Self::Date(operand)
            | Self::Percentile(operand)
            | Self::In { operand, .. } => operand.collect_columns(out),
            Self::Arith { left, right, .. } | Self::Logical { left, right, .. } => {
                left.collect_columns(out);
                right.collect_columns(out);
            }
            Self::Comparison { first, rest } => {
                first.collect_columns(out);
                for (_, operand) in rest {
                    operand.collect_columns(out);
                }
            }
            Self::Case { branches, default } => {
                for branch in branches {
                    branch.condition.collect_columns(out);
                    branch.result.collect_columns(out);
                }
                if let Some(result) = default {
                    result.collect_columns(out);
                }
            }
        }
    }
}

/// Result of parsing one formula string: an optional aggregation prefix plus
/// one expression per aggregation argument (exactly one for bare formulas).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedFormula {
    pub aggregation: Option<AggregationKind>,
    pub expressions: Vec<Expr>,
}

impl ParsedFormula {
    #[must_use]
    pub fn dependent_columns(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        for expr in &self.expressions {
            expr.collect_columns(&mut out);
        }
        out
    }
}

/// Convenience wrapper: parse and extract referenced column slugs.
pub fn dependent_columns(formula: &str) -> Result<BTreeSet<String>, ParseError> {
    Ok(parse_formula(formula)?.dependent_columns())
}

// ── Lexer ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Str(String),
    Caret,
    Star,
    Slash,
    Plus,
    Minus,
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
    EqEq,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
    Colon,
    And,
    Or,
    Not,
    In,
    Case,
    Default,
}

fn malformed(formula: &str, detail: impl Into<String>) -> ParseError {
    ParseError::Malformed {
        formula: formula.to_owned(),
        detail: detail.into(),
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        match c {
            '^' => {
                tokens.push(Token::Caret);
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
            '+' => {
                tokens.push(Token::Plus);
                i += 1;
            }
            '-' => {
                tokens.push(Token::Minus);
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
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            ':' => {
                tokens.push(Token::Colon);
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Le);
                    i += 2;
                } else {
                    tokens.push(Token::Lt);
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ge);
                    i += 2;
                } else {
                    tokens.push(Token::Gt);
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::EqEq);
                    i += 2;
                } else {
                    return Err(malformed(input, "expected '==' but found single '='"));
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push(Token::Ne);
                    i += 2;
                } else {
                    return Err(malformed(input, "expected '!=' but found single '!'"));
                }
            }
            '"' => {
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != '"' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(malformed(input, "unterminated string literal"));
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
                i += 1;
            }
            _ if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| malformed(input, format!("invalid number: {text}")))?;
                tokens.push(Token::Number(number));
            }
            _ if c.is_alphanumeric() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                match word.to_ascii_lowercase().as_str() {
                    "and" => tokens.push(Token::And),
                    "or" => tokens.push(Token::Or),
                    "not" => tokens.push(Token::Not),
                    "in" => tokens.push(Token::In),
                    "case" => tokens.push(Token::Case),
                    "default" => tokens.push(Token::Default),
                    _ => tokens.push(Token::Ident(word)),
                }
            }
            _ => {
                return Err(malformed(input, format!("unexpected character: {c:?}")));
            }
        }
    }
    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────────────
//
// Recursive descent over the token stream, one function per grammar layer:
//
//   top        → AGG_NAME '(' transform (',' transform)* ')' | transform
//   transform  → 'percentile' '(' case ')' | case
//   case       → 'case' entry (',' entry)* (',' 'default' ':' atom)? | logical
//   entry      → logical ':' atom
//   logical    → not_expr (('and' | 'or') not_expr)*
//   not_expr   → 'not' not_expr | membership
//   membership → comparison ('in' '[' STRING (',' STRING)* ']')?
//   comparison → arith (COMPOP arith)*          (chained)
//   arith      → term (('+' | '-') term)*
//   term       → power (('*' | '/') power)*
//   power      → signed ('^' power)?            (right-assoc)
//   signed     → ('+' | '-')? primary
//   primary    → NUMBER | STRING | IDENT | 'date' '(' STRING ')'
//              | 'today' '(' ')' | '(' logical ')'

struct Parser<'a> {
    formula: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(formula: &'a str) -> Result<Self, ParseError> {
        Ok(Self {
            formula,
            tokens: tokenize(formula)?,
            pos: 0,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
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

    fn expect(&mut self, expected: &Token, what: &str) -> Result<(), ParseError> {
        if self.eat(expected) {
            Ok(())
        } else {
            Err(self.error(format!("expected {what}")))
        }
    }

    fn error(&self, detail: impl Into<String>) -> ParseError {
        malformed(self.formula, detail)
    }

    fn parse(mut self) -> Result<ParsedFormula, ParseError> {
        let parsed = self.parse_top()?;
        if self.pos < self.tokens.len() {
            return Err(self.error(format!(
                "unexpected trailing token: {:?}",
                self.tokens[self.pos]
            )));
        }
        if parsed.expressions.is_empty() {
            return Err(self.error("empty formula"));
        }
        Ok(parsed)
    }

    fn parse_top(&mut self) -> Result<ParsedFormula, ParseError> {
        if let Some(Token::Ident(name)) = self.peek()
            && let Some(kind) = AggregationKind::from_name(name)
            && self.tokens.get(self.pos + 1) == Some(&Token::LParen)
        {
            self.pos += 2;
            let mut expressions = Vec::new();
            if !self.eat(&Token::RParen) {
                expressions.push(self.parse_transform()?);
                while self.eat(&Token::Comma) {
                    expressions.push(self.parse_transform()?);
                }
                self.expect(&Token::RParen, "closing ')'")?;
            }
            if !kind.accepts_arity(expressions.len()) {
                return Err(self.error(format!(
                    "{} does not take {} argument(s)",
                    kind.formula_name(),
                    expressions.len()
                )));
            }
            // count() with no criteria still evaluates one expression per row.
            if expressions.is_empty() {
                expressions.push(Expr::Number(1.0));
            }
            return Ok(ParsedFormula {
                aggregation: Some(kind),
                expressions,
            });
        }

        let expr = self.parse_transform()?;
        Ok(ParsedFormula {
            aggregation: None,
            expressions: vec![expr],
        })
    }

    fn parse_transform(&mut self) -> Result<Expr, ParseError> {
        if let Some(Token::Ident(name)) = self.peek()
            && name.eq_ignore_ascii_case("percentile")
        {
            self.pos += 1;
            self.expect(&Token::LParen, "'(' after percentile")?;
            let operand = self.parse_case()?;
            self.expect(&Token::RParen, "closing ')'")?;
            return Ok(Expr::Percentile(Box::new(operand)));
        }
        self.parse_case()
    }

    fn parse_case(&mut self) -> Result<Expr, ParseError> {
        if !self.eat(&Token::Case) {
            return self.parse_logical();
        }

        let mut branches = Vec::new();
        let mut default = None;
        loop {
            if self.eat(&Token::Default) {
                self.expect(&Token::Colon, "':' after default")?;
                default = Some(Box::new(self.parse_atom()?));
                break;
            }
            let condition = self.parse_logical()?;
            self.expect(&Token::Colon, "':' in case entry")?;
            let result = self.parse_atom()?;
            branches.push(CaseBranch { condition, result });
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        if branches.is_empty() {
            return Err(self.error("case requires at least one condition entry"));
        }
        Ok(Expr::Case { branches, default })
    }

    fn parse_logical(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_not()?;
        loop {
            let op = match self.peek() {
                Some(Token::And) => LogicalOp::And,
                Some(Token::Or) => LogicalOp::Or,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_not()?;
            left = Expr::Logical {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_not(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Not) {
            let operand = self.parse_not()?;
            return Ok(Expr::Not(Box::new(operand)));
        }
        self.parse_membership()
    }

    fn parse_membership(&mut self) -> Result<Expr, ParseError> {
        let operand = self.parse_comparison()?;
        if !self.eat(&Token::In) {
            return Ok(operand);
        }
        self.expect(&Token::LBracket, "'[' after in")?;
        let mut choices = Vec::new();
        loop {
            match self.advance() {
                Some(Token::Str(choice)) => choices.push(choice.clone()),
                _ => return Err(self.error("expected string literal in membership list")),
            }
            if !self.eat(&Token::Comma) {
                break;
            }
        }
        self.expect(&Token::RBracket, "closing ']'")?;
        Ok(Expr::In {
            operand: Box::new(operand),
            choices,
        })
    }

    fn parse_comparison(&mut self) -> Result<Expr, ParseError> {
        let first = self.parse_arith()?;
        let mut rest = Vec::new();
        loop {
            let op = match self.peek() {
                Some(Token::Lt) => CompareOp::Lt,
                Some(Token::Le) => CompareOp::Le,
                Some(Token::Gt) => CompareOp::Gt,
                Some(Token::Ge) => CompareOp::Ge,
                Some(Token::Ne) => CompareOp::Ne,
                Some(Token::EqEq) => CompareOp::Eq,
                _ => break,
            };
            self.pos += 1;
            rest.push((op, self.parse_arith()?));
        }
        if rest.is_empty() {
            Ok(first)
        } else {
            Ok(Expr::Comparison {
                first: Box::new(first),
                rest,
            })
        }
    }

    fn parse_arith(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_term()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => ArithOp::Add,
                Some(Token::Minus) => ArithOp::Sub,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_term()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_term(&mut self) -> Result<Expr, ParseError> {
        let mut left = self.parse_power()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => ArithOp::Mul,
                Some(Token::Slash) => ArithOp::Div,
                _ => break,
            };
            self.pos += 1;
            let right = self.parse_power()?;
            left = Expr::Arith {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }
        Ok(left)
    }

    fn parse_power(&mut self) -> Result<Expr, ParseError> {
        let base = self.parse_signed()?;
        if self.eat(&Token::Caret) {
            // Right-associative.
            let exponent = self.parse_power()?;
            return Ok(Expr::Arith {
                op: ArithOp::Pow,
                left: Box::new(base),
                right: Box::new(exponent),
            });
        }
        Ok(base)
    }

    fn parse_signed(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Minus) {
            let operand = self.parse_signed()?;
            return Ok(Expr::Sign {
                negative: true,
                operand: Box::new(operand),
            });
        }
        if self.eat(&Token::Plus) {
            let operand = self.parse_signed()?;
            return Ok(Expr::Sign {
                negative: false,
                operand: Box::new(operand),
            });
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        match self.peek().cloned() {
            Some(Token::Number(v)) => {
                self.pos += 1;
                Ok(Expr::Number(v))
            }
            Some(Token::Str(v)) => {
                self.pos += 1;
                Ok(Expr::Str(v))
            }
            Some(Token::Ident(name)) => {
                self.pos += 1;
                if name.eq_ignore_ascii_case("date") {
                    self.expect(&Token::LParen, "'(' after date")?;
                    let operand = match self.advance() {
                        Some(Token::Str(literal)) => Expr::Str(literal.clone()),
                        _ => return Err(self.error("date takes a quoted literal")),
                    };
                    self.expect(&Token::RParen, "closing ')'")?;
                    return Ok(Expr::Date(Box::new(operand)));
                }
                if name.eq_ignore_ascii_case("today") {
                    self.expect(&Token::LParen, "'(' after today")?;
                    self.expect(&Token::RParen, "closing ')'")?;
                    return Ok(Expr::Today);
                }
                if AggregationKind::from_name(&name).is_some()
                    || FUNCTION_NAMES
                        .iter()
                        .any(|word| word.eq_ignore_ascii_case(&name))
                {
                    return Err(self.error(format!(
                        "reserved word {name:?} cannot be used as an identifier"
                    )));
                }
                Ok(Expr::Column(name))
            }
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_logical()?;
                self.expect(&Token::RParen, "closing ')'")?;
                Ok(inner)
            }
            Some(other) => Err(self.error(format!("unexpected token: {other:?}"))),
            None => Err(self.error("unexpected end of formula")),
        }
    }

    /// Case results are restricted to atoms: numbers, strings, identifiers.
    fn parse_atom(&mut self) -> Result<Expr, ParseError> {
        match self.advance().cloned() {
            Some(Token::Number(v)) => Ok(Expr::Number(v)),
            Some(Token::Str(v)) => Ok(Expr::Str(v)),
            Some(Token::Ident(name)) => {
                if AggregationKind::from_name(&name).is_some()
                    || FUNCTION_NAMES
                        .iter()
                        .any(|word| word.eq_ignore_ascii_case(&name))
                {
                    return Err(self.error(format!(
                        "reserved word {name:?} cannot be used as an identifier"
                    )));
                }
                Ok(Expr::Column(name))
            }
            _ => Err(self.error("expected an atom (number, string, or column)")),
        }
    }
}

/// Parse a formula into its optional aggregation prefix and argument
/// expressions.
pub fn parse_formula(input: &str) -> Result<ParsedFormula, ParseError> {
    Parser::new(input)?.parse()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use rt_frame::{DataFrame, Schema};
    use rt_types::Value;

    use super::{
        AggregationKind, EvalContext, EvalError, Expr, ParseError, parse_formula, reserved_words,
    };

    fn frame_of(pairs: Vec<(&str, Vec<Value>)>) -> (DataFrame, Schema) {
        let mut frame = DataFrame::new();
        for (name, values) in pairs {
            frame.insert_column(name, values).expect("column fits");
        }
        let schema = Schema::from_frame(&frame, None);
        (frame, schema)
    }

    fn eval_one(formula: &str, frame: &DataFrame, schema: &Schema, row: usize) -> Value {
        let parsed = parse_formula(formula).expect("formula parses");
        assert!(parsed.aggregation.is_none());
        let context = EvalContext::with_frame(schema, frame);
        parsed.expressions[0]
            .evaluate(&frame.row(row), &context)
            .expect("evaluates")
    }

    fn eval_column(formula: &str, frame: &DataFrame, schema: &Schema) -> Vec<Value> {
        (0..frame.num_rows())
            .map(|idx| eval_one(formula, frame, schema, idx))
            .collect()
    }

    #[test]
    fn constant_arithmetic() {
        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(0.0)])]);
        assert_eq!(eval_one("2 + 3", &frame, &schema, 0), Value::Number(5.0));
        assert_eq!(eval_one("2 + 3 * 4", &frame, &schema, 0), Value::Number(14.0));
        assert_eq!(
            eval_one("(2 + 3) * 4", &frame, &schema, 0),
            Value::Number(20.0)
        );
        assert_eq!(eval_one("2 ^ 3 ^ 2", &frame, &schema, 0), Value::Number(512.0));
        assert_eq!(eval_one("-2 + 5", &frame, &schema, 0), Value::Number(3.0));
    }

    #[test]
    fn column_arithmetic_over_rows() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(9.0), Value::Number(2.0)],
        )]);
        assert_eq!(
            eval_column("amount + 1", &frame, &schema),
            vec![Value::Number(10.0), Value::Number(3.0)]
        );
    }

    #[test]
    fn division_by_zero_yields_nan_not_infinity() {
        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(1.0)])]);
        let out = eval_one("amount / 0", &frame, &schema, 0);
        assert!(matches!(out, Value::Number(v) if v.is_nan()));
    }

    #[test]
    fn comparison_chains_require_every_pair() {
        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(5.0)])]);
        assert_eq!(
            eval_one("1 < amount < 10", &frame, &schema, 0),
            Value::Bool(true)
        );
        assert_eq!(
            eval_one("1 < amount < 4", &frame, &schema, 0),
            Value::Bool(false)
        );
        assert_eq!(eval_one("amount == 5", &frame, &schema, 0), Value::Bool(true));
    }

    #[test]
    fn logical_operators_never_short_circuit() {
        // The right operand references a missing column; the error proves the
        // operand was evaluated even though the left side already decides.
        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(5.0)])]);
        let parsed = parse_formula("1 == 1 or missing_col == 2").expect("parses");
        let context = EvalContext::with_frame(&schema, &frame);
        let err = parsed.expressions[0]
            .evaluate(&frame.row(0), &context)
            .expect_err("right operand still evaluated");
        assert!(matches!(err, EvalError::UnknownColumn(name) if name == "missing_col"));
    }

    #[test]
    fn membership_stringifies_floats() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(9.0), Value::Number(3.0)],
        )]);
        assert_eq!(
            eval_column("amount in [\"9.0\", \"2.0\", \"20.0\"]", &frame, &schema),
            vec![Value::Bool(true), Value::Bool(false)]
        );
    }

    #[test]
    fn membership_on_text_columns() {
        let (frame, schema) = frame_of(vec![(
            "risk_factor",
            vec![
                Value::Text("low_risk".to_owned()),
                Value::Text("high_risk".to_owned()),
            ],
        )]);
        assert_eq!(
            eval_column("risk_factor in [\"low_risk\"]", &frame, &schema),
            vec![Value::Bool(true), Value::Bool(false)]
        );
    }

    #[test]
    fn case_returns_first_truthy_branch() {
        let (frame, schema) = frame_of(vec![(
            "a",
            vec![Value::Bool(true), Value::Bool(false)],
        )]);
        assert_eq!(
            eval_column("case a: 1, default: 2", &frame, &schema),
            vec![Value::Number(1.0), Value::Number(2.0)]
        );
    }

    #[test]
    fn case_without_default_falls_through_to_nan() {
        let (frame, schema) = frame_of(vec![("a", vec![Value::Bool(false)])]);
        let out = eval_one("case a: 1", &frame, &schema, 0);
        assert!(matches!(out, Value::Number(v) if v.is_nan()));
    }

    #[test]
    fn date_literal_arithmetic_uses_unix_time() {
        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(0.0)])]);
        assert_eq!(
            eval_one("date(\"1970-01-02\") - 86400", &frame, &schema, 0),
            Value::Number(0.0)
        );
    }

    #[test]
    fn datetime_columns_surface_numeric_values() {
        let mut frame = DataFrame::new();
        frame
            .insert_column("submit_date", vec![Value::Datetime(86_400)])
            .expect("column fits");
        let schema = Schema::from_frame(&frame, None);
        assert!(schema.is_date("submit_date"));
        assert_eq!(
            eval_one("submit_date + 1", &frame, &schema, 0),
            Value::Number(86_401.0)
        );
    }

    #[test]
    fn percentile_ranks_within_full_column() {
        let (frame, schema) = frame_of(vec![(
            "amount",
            vec![Value::Number(1.0), Value::Number(2.0), Value::Number(3.0)],
        )]);
        assert_eq!(
            eval_column("percentile(amount)", &frame, &schema),
            vec![
                Value::Number(100.0 / 6.0),
                Value::Number(50.0),
                Value::Number(500.0 / 6.0)
            ]
        );
    }

    #[test]
    fn percentile_requires_frame_context() {
        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(1.0)])]);
        let parsed = parse_formula("percentile(amount)").expect("parses");
        let context = EvalContext::new(&schema);
        let err = parsed.expressions[0]
            .evaluate(&frame.row(0), &context)
            .expect_err("no frame");
        assert!(matches!(err, EvalError::NoFrameContext));
    }

    #[test]
    fn aggregation_prefix_is_recognized_only_at_top_level() {
        let parsed = parse_formula("sum(amount)").expect("parses");
        assert_eq!(parsed.aggregation, Some(AggregationKind::Sum));
        assert_eq!(parsed.expressions.len(), 1);

        let parsed = parse_formula("ratio(amount, amount_2)").expect("parses");
        assert_eq!(parsed.aggregation, Some(AggregationKind::Ratio));
        assert_eq!(parsed.expressions.len(), 2);

        let parsed = parse_formula("pearson(amount, amount_2)").expect("parses");
        assert_eq!(parsed.aggregation, Some(AggregationKind::Pearson));
        assert_eq!(parsed.expressions.len(), 2);

        let parsed = parse_formula("count()").expect("parses");
        assert_eq!(parsed.aggregation, Some(AggregationKind::Count));
        assert_eq!(parsed.expressions.len(), 1);
    }

    #[test]
    fn aggregation_arity_is_checked() {
        let err = parse_formula("ratio(amount)").expect_err("needs two arguments");
        assert!(matches!(err, ParseError::Malformed { .. }));
        let err = parse_formula("sum(a, b)").expect_err("takes one argument");
        assert!(matches!(err, ParseError::Malformed { .. }));
    }

    #[test]
    fn reserved_words_rejected_as_identifiers() {
        assert!(parse_formula("sum").is_err());
        assert!(parse_formula("median + 1").is_err());
        assert!(parse_formula("date").is_err());
        assert!(reserved_words().contains(&"default"));
    }

    #[test]
    fn malformed_formulas_fail_to_parse() {
        assert!(parse_formula("(amount + 1").is_err());
        assert!(parse_formula("amount +").is_err());
        assert!(parse_formula("amount ==").is_err());
        assert!(parse_formula("=amount").is_err());
        assert!(parse_formula("").is_err());
    }

    #[test]
    fn numeric_identifiers_are_literals_for_dependencies() {
        let parsed = parse_formula("amount + gps_alt * 2").expect("parses");
        let deps = parsed.dependent_columns();
        let expected: std::collections::BTreeSet<String> =
            ["amount", "gps_alt"].iter().map(|s| (*s).to_owned()).collect();
        assert_eq!(deps, expected);

        let parsed = parse_formula("percentile(amount)").expect("parses");
        assert!(parsed.dependent_columns().contains("amount"));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let mut row = BTreeMap::new();
        row.insert("amount".to_owned(), Value::Number(7.0));
        let frame = DataFrame::from_rows(&[row]);
        let schema = Schema::from_frame(&frame, None);
        let first = eval_one("amount ^ 2 + 1", &frame, &schema, 0);
        let second = eval_one("amount ^ 2 + 1", &frame, &schema, 0);
        assert_eq!(first, second);
    }

    #[test]
    fn not_and_nested_parens() {
        let (frame, schema) = frame_of(vec![("amount", vec![Value::Number(2.0)])]);
        assert_eq!(
            eval_one("not amount == 2", &frame, &schema, 0),
            Value::Bool(false)
        );
        assert_eq!(
            eval_one("not not amount == 2", &frame, &schema, 0),
            Value::Bool(true)
        );
        assert_eq!(
            eval_one("not (amount == 2 or 10 < amount)", &frame, &schema, 0),
            Value::Bool(false)
        );
    }
}
