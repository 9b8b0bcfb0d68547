//! Condition grammar: lexer, parser and evaluator.
//!
//! ```text
//! expr     := or
//! or       := and (("||" | "or") and)*
//! and      := compare (("&&" | "and") compare)*
//! compare  := unary (("==" | "!=" | ">=" | "<=" | ">" | "<") unary)*
//! unary    := ("!" | "not") unary | primary
//! primary  := "(" expr ")" | "$" ident | number | string | "true" | "false" | "null"
//! ```
//!
//! Lexing and parsing are done with chumsky; the operator table is a pratt
//! parser. Conditions deeper than [`MAX_NESTING`] are rejected before the
//! recursive parser runs, which also bounds evaluation depth.

use std::fmt;

use chumsky::{error::RichReason, pratt::*, prelude::*};
use thiserror::Error;

use crate::value::Value;

/// Maximum of open parentheses plus operators a condition may contain.
pub const MAX_NESTING: usize = 64;

type Span = SimpleSpan;
type Spanned<T> = (T, Span);

/// Faults raised while compiling a condition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConditionError {
    #[error("condition is empty")]
    Empty,

    #[error("unexpected character {ch:?} at position {position}")]
    UnexpectedCharacter { ch: char, position: usize },

    #[error("invalid token {text:?} at position {position}")]
    InvalidToken { text: String, position: usize },

    #[error("unexpected {found} at position {position}")]
    UnexpectedToken { found: String, position: usize },

    #[error("unexpected end of condition")]
    UnexpectedEnd,

    #[error("condition nests deeper than {limit} levels")]
    TooDeep { limit: usize },
}

/// Comparison operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Comparison {
    fn apply(self, left: &Value, right: &Value) -> bool {
        use std::cmp::Ordering;

        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            _ => None,
        };

        match self {
            Comparison::Eq => left == right,
            Comparison::Ne => left != right,
            Comparison::Lt => ordering == Some(Ordering::Less),
            Comparison::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
            Comparison::Gt => ordering == Some(Ordering::Greater),
            Comparison::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
        }
    }
}

/// A compiled condition.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Literal(Value),
    Variable(String),
    Not(Box<Condition>),
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Compare(Comparison, Box<Condition>, Box<Condition>),
}

impl Condition {
    /// Parse condition text.
    pub fn parse(source: &str) -> Result<Self, ConditionError> {
        let tokens = lexer()
            .parse(source)
            .into_result()
            .map_err(|errors| lex_error(&errors))?;
        if tokens.is_empty() {
            return Err(ConditionError::Empty);
        }

        let (tokens, spans): (Vec<Token>, Vec<Span>) = tokens.into_iter().unzip();
        if nesting(&tokens) > MAX_NESTING {
            return Err(ConditionError::TooDeep { limit: MAX_NESTING });
        }

        let result = parser()
            .then_ignore(end())
            .parse(tokens.as_slice())
            .into_result()
            .map_err(|errors| parse_error(&errors, &spans));
        result
    }

    /// Evaluate to a value. Missing variables resolve to `null`.
    pub fn evaluate(&self, resolve: &dyn Fn(&str) -> Option<Value>) -> Value {
        match self {
            Condition::Literal(value) => value.clone(),
            Condition::Variable(name) => resolve(name).unwrap_or(Value::Null),
            Condition::Not(inner) => Value::Bool(!inner.evaluate(resolve).is_truthy()),
            Condition::And(left, right) => {
                Value::Bool(left.evaluate(resolve).is_truthy() && right.evaluate(resolve).is_truthy())
            }
            Condition::Or(left, right) => {
                Value::Bool(left.evaluate(resolve).is_truthy() || right.evaluate(resolve).is_truthy())
            }
            Condition::Compare(op, left, right) => {
                Value::Bool(op.apply(&left.evaluate(resolve), &right.evaluate(resolve)))
            }
        }
    }

    /// Names of all variables referenced by the condition.
    pub fn variables(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_variables(&mut names);
        names
    }

    fn collect_variables<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            Condition::Literal(_) => {}
            Condition::Variable(name) => {
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
            Condition::Not(inner) => inner.collect_variables(names),
            Condition::And(left, right)
            | Condition::Or(left, right)
            | Condition::Compare(_, left, right) => {
                left.collect_variables(names);
                right.collect_variables(names);
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Compare(Comparison),
    Variable(String),
    Number(f64),
    Text(String),
    True,
    False,
    Null,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::And => write!(f, "'&&'"),
            Token::Or => write!(f, "'||'"),
            Token::Not => write!(f, "'!'"),
            Token::Compare(op) => write!(f, "operator {:?}", op),
            Token::Variable(name) => write!(f, "variable ${}", name),
            Token::Number(n) => write!(f, "literal {}", Value::Number(*n)),
            Token::Text(text) => write!(f, "literal {:?}", text),
            Token::True => write!(f, "literal true"),
            Token::False => write!(f, "literal false"),
            Token::Null => write!(f, "literal null"),
        }
    }
}

fn is_ident_char(c: &char) -> bool {
    c.is_alphanumeric() || *c == '_'
}

fn lexer<'src>(
) -> impl Parser<'src, &'src str, Vec<Spanned<Token>>, extra::Err<Rich<'src, char, Span>>> {
    let number = just('-')
        .or_not()
        .then(
            text::digits(10)
                .then(just('.').then(text::digits(10)).or_not())
                .ignored()
                .or(just('.').then(text::digits(10)).ignored()),
        )
        .to_slice()
        .try_map(|literal: &str, span| {
            literal
                .parse()
                .map(Token::Number)
                .map_err(|_| Rich::custom(span, literal))
        });

    let escape = just('\\').ignore_then(any());
    let double_quoted = just('"')
        .ignore_then(escape.clone().or(none_of("\\\"")).repeated().collect::<String>())
        .then_ignore(just('"'));
    let single_quoted = just('\'')
        .ignore_then(escape.or(none_of("\\'")).repeated().collect::<String>())
        .then_ignore(just('\''));
    let text_literal = double_quoted.or(single_quoted).map(Token::Text);

    let variable = just('$')
        .ignore_then(any().filter(is_ident_char).repeated().at_least(1).to_slice())
        .map(|name: &str| Token::Variable(name.to_string()));

    let word = any()
        .filter(|c: &char| c.is_alphabetic())
        .then(any().filter(is_ident_char).repeated())
        .to_slice()
        .try_map(|word: &str, span| match word {
            "true" => Ok(Token::True),
            "false" => Ok(Token::False),
            "null" => Ok(Token::Null),
            "and" => Ok(Token::And),
            "or" => Ok(Token::Or),
            "not" => Ok(Token::Not),
            _ => Err(Rich::custom(span, word)),
        });

    let operator = choice((
        just("&&").to(Token::And),
        just("||").to(Token::Or),
        just("==").to(Token::Compare(Comparison::Eq)),
        just("!=").to(Token::Compare(Comparison::Ne)),
        just("<=").to(Token::Compare(Comparison::Le)),
        just(">=").to(Token::Compare(Comparison::Ge)),
        just('<').to(Token::Compare(Comparison::Lt)),
        just('>').to(Token::Compare(Comparison::Gt)),
        just('!').to(Token::Not),
        just('(').to(Token::LParen),
        just(')').to(Token::RParen),
    ));

    choice((number, text_literal, variable, word, operator))
        .map_with(|token, extra| (token, extra.span()))
        .padded()
        .repeated()
        .collect()
        .padded()
        .then_ignore(end())
}

fn parser<'src>(
) -> impl Parser<'src, &'src [Token], Condition, extra::Err<Rich<'src, Token, Span>>> {
    recursive(|condition| {
        let literal = select! {
            Token::Variable(name) => Condition::Variable(name),
            Token::Number(n) => Condition::Literal(Value::Number(n)),
            Token::Text(text) => Condition::Literal(Value::Text(text)),
            Token::True => Condition::Literal(Value::Bool(true)),
            Token::False => Condition::Literal(Value::Bool(false)),
            Token::Null => Condition::Literal(Value::Null),
        };
        let atom = literal.or(condition.delimited_by(just(Token::LParen), just(Token::RParen)));

        atom.pratt((
            prefix(4, just(Token::Not), |_, operand, _| Condition::Not(Box::new(operand))),
            infix(
                left(3),
                select! { Token::Compare(op) => op },
                |left, op, right, _| Condition::Compare(op, Box::new(left), Box::new(right)),
            ),
            infix(left(2), just(Token::And), |left, _, right, _| {
                Condition::And(Box::new(left), Box::new(right))
            }),
            infix(left(1), just(Token::Or), |left, _, right, _| {
                Condition::Or(Box::new(left), Box::new(right))
            }),
        ))
    })
}

/// Open parentheses plus operators: an upper bound on the depth of the tree.
fn nesting(tokens: &[Token]) -> usize {
    let mut open = 0usize;
    let mut deepest = 0usize;
    let mut operators = 0usize;
    for token in tokens {
        match token {
            Token::LParen => {
                open += 1;
                deepest = deepest.max(open);
            }
            Token::RParen => open = open.saturating_sub(1),
            Token::And | Token::Or | Token::Not | Token::Compare(_) => operators += 1,
            _ => {}
        }
    }
    deepest + operators
}

fn lex_error(errors: &[Rich<'_, char, Span>]) -> ConditionError {
    let Some(error) = errors.first() else {
        return ConditionError::UnexpectedEnd;
    };
    let position = error.span().start;
    match (error.reason(), error.found()) {
        (RichReason::Custom(text), _) => ConditionError::InvalidToken {
            text: text.clone(),
            position,
        },
        (_, Some(ch)) => ConditionError::UnexpectedCharacter { ch: *ch, position },
        (_, None) => ConditionError::UnexpectedEnd,
    }
}

fn parse_error(errors: &[Rich<'_, Token, Span>], spans: &[Span]) -> ConditionError {
    let Some(error) = errors.first() else {
        return ConditionError::UnexpectedEnd;
    };
    match (error.found(), spans.get(error.span().start)) {
        (Some(token), Some(span)) => ConditionError::UnexpectedToken {
            found: token.to_string(),
            position: span.start,
        },
        _ => ConditionError::UnexpectedEnd,
    }
}
