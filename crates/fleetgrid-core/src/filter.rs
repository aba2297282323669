//! Target filter language.
//!
//! A small FIQL-style query language used to select devices:
//!
//! ```text
//! tag==beta;attribute.hw==rev2*
//! (name==edge-*,name==gw-*);tag!=quarantine
//! attribute.site=="berlin; hall 3"
//! ```
//!
//! `;` is AND and binds tighter than `,` (OR). Values may contain `*`
//! wildcards and may be double-quoted to carry reserved characters.
//! Supported fields: `id`, `name`, `tag`, `attribute.<key>`.

use std::fmt;

use regex::Regex;
use thiserror::Error;

/// Errors raised while parsing a filter expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FilterError {
    #[error("filter expression is empty")]
    Empty,

    #[error("unexpected character '{ch}' at position {pos}")]
    UnexpectedChar { pos: usize, ch: char },

    #[error("unexpected '{found}' at position {pos}")]
    UnexpectedToken { pos: usize, found: String },

    #[error("filter expression ends unexpectedly")]
    UnexpectedEnd,

    #[error("unterminated quoted value starting at position {pos}")]
    UnterminatedQuote { pos: usize },

    #[error("unknown field '{0}' (expected id, name, tag or attribute.<key>)")]
    UnknownField(String),

    #[error("invalid wildcard value '{0}'")]
    InvalidPattern(String),
}

/// Anything a filter can be evaluated against.
pub trait Targetable {
    fn target_id(&self) -> &str;
    fn target_name(&self) -> &str;
    fn has_tag(&self, pred: &dyn Fn(&str) -> bool) -> bool;
    fn attribute(&self, key: &str) -> Option<&str>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    Id,
    Name,
    Tag,
    Attribute(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
}

/// A comparison value, compiled to an anchored regex when it holds wildcards.
#[derive(Debug, Clone)]
pub struct Pattern {
    raw: String,
    wildcard: Option<Regex>,
}

impl Pattern {
    fn new(raw: String) -> Result<Self, FilterError> {
        let wildcard = if raw.contains('*') {
            let body = raw
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let re = Regex::new(&format!("^{body}$"))
                .map_err(|_| FilterError::InvalidPattern(raw.clone()))?;
            Some(re)
        } else {
            None
        };
        Ok(Self { raw, wildcard })
    }

    pub fn is_match(&self, value: &str) -> bool {
        match &self.wildcard {
            Some(re) => re.is_match(value),
            None => self.raw == value,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Compare { field: Field, op: Op, value: Pattern },
}

impl FilterExpr {
    pub fn matches<T: Targetable + ?Sized>(&self, target: &T) -> bool {
        match self {
            FilterExpr::And(parts) => parts.iter().all(|p| p.matches(target)),
            FilterExpr::Or(parts) => parts.iter().any(|p| p.matches(target)),
            FilterExpr::Compare { field, op, value } => {
                let hit = match field {
                    Field::Id => value.is_match(target.target_id()),
                    Field::Name => value.is_match(target.target_name()),
                    Field::Tag => target.has_tag(&|tag: &str| value.is_match(tag)),
                    Field::Attribute(key) => target
                        .attribute(key)
                        .is_some_and(|v| value.is_match(v)),
                };
                match op {
                    Op::Eq => hit,
                    Op::Ne => !hit,
                }
            }
        }
    }
}

/// A parsed filter together with its source text.
#[derive(Debug, Clone)]
pub struct FilterQuery {
    source: String,
    expr: FilterExpr,
}

impl FilterQuery {
    pub fn parse(source: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(FilterError::Empty);
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.parse_or()?;
        if let Some((pos, tok)) = parser.peek() {
            return Err(FilterError::UnexpectedToken {
                pos,
                found: tok.to_string(),
            });
        }
        Ok(Self {
            source: source.trim().to_string(),
            expr,
        })
    }

    pub fn matches<T: Targetable + ?Sized>(&self, target: &T) -> bool {
        self.expr.matches(target)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn expr(&self) -> &FilterExpr {
        &self.expr
    }
}

impl fmt::Display for FilterQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

// ── Lexer ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Op(Op),
    Word(String),
    Quoted(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::LParen => f.write_str("("),
            Token::RParen => f.write_str(")"),
            Token::And => f.write_str(";"),
            Token::Or => f.write_str(","),
            Token::Op(Op::Eq) => f.write_str("=="),
            Token::Op(Op::Ne) => f.write_str("!="),
            Token::Word(w) => f.write_str(w),
            Token::Quoted(q) => write!(f, "\"{q}\""),
        }
    }
}

fn is_word_char(c: char) -> bool {
    !c.is_whitespace() && !matches!(c, '(' | ')' | ';' | ',' | '=' | '!' | '"')
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, FilterError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((i, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((i, Token::RParen));
                i += 1;
            }
            ';' => {
                tokens.push((i, Token::And));
                i += 1;
            }
            ',' => {
                tokens.push((i, Token::Or));
                i += 1;
            }
            '=' | '!' => {
                if chars.get(i + 1) != Some(&'=') {
                    return Err(FilterError::UnexpectedChar { pos: i, ch: c });
                }
                let op = if c == '=' { Op::Eq } else { Op::Ne };
                tokens.push((i, Token::Op(op)));
                i += 2;
            }
            '"' => {
                let start = i;
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(FilterError::UnterminatedQuote { pos: start }),
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') if chars.get(i + 1).is_some() => {
                            value.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(&ch) => {
                            value.push(ch);
                            i += 1;
                        }
                    }
                }
                tokens.push((start, Token::Quoted(value)));
            }
            _ => {
                let start = i;
                while i < chars.len() && is_word_char(chars[i]) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push((start, Token::Word(word)));
            }
        }
    }

    Ok(tokens)
}

// ── Parser ─────────────────────────────────────────────────────────

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.pos).map(|(p, t)| (*p, t))
    }

    fn next(&mut self) -> Result<(usize, Token), FilterError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or(FilterError::UnexpectedEnd)?;
        self.pos += 1;
        Ok(tok)
    }

    fn parse_or(&mut self) -> Result<FilterExpr, FilterError> {
        let mut parts = vec![self.parse_and()?];
        while matches!(self.peek(), Some((_, Token::Or))) {
            self.pos += 1;
            parts.push(self.parse_and()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            FilterExpr::Or(parts)
        })
    }

    fn parse_and(&mut self) -> Result<FilterExpr, FilterError> {
        let mut parts = vec![self.parse_primary()?];
        while matches!(self.peek(), Some((_, Token::And))) {
            self.pos += 1;
            parts.push(self.parse_primary()?);
        }
        Ok(if parts.len() == 1 {
            parts.remove(0)
        } else {
            FilterExpr::And(parts)
        })
    }

    fn parse_primary(&mut self) -> Result<FilterExpr, FilterError> {
        match self.next()? {
            (_, Token::LParen) => {
                let inner = self.parse_or()?;
                match self.next()? {
                    (_, Token::RParen) => Ok(inner),
                    (pos, tok) => Err(FilterError::UnexpectedToken {
                        pos,
                        found: tok.to_string(),
                    }),
                }
            }
            (_, Token::Word(name)) => {
                let field = parse_field(&name)?;
                let op = match self.next()? {
                    (_, Token::Op(op)) => op,
                    (pos, tok) => {
                        return Err(FilterError::UnexpectedToken {
                            pos,
                            found: tok.to_string(),
                        });
                    }
                };
                let value = match self.next()? {
                    (_, Token::Word(v)) | (_, Token::Quoted(v)) => v,
                    (pos, tok) => {
                        return Err(FilterError::UnexpectedToken {
                            pos,
                            found: tok.to_string(),
                        });
                    }
                };
                Ok(FilterExpr::Compare {
                    field,
                    op,
                    value: Pattern::new(value)?,
                })
            }
            (pos, tok) => Err(FilterError::UnexpectedToken {
                pos,
                found: tok.to_string(),
            }),
        }
    }
}

fn parse_field(name: &str) -> Result<Field, FilterError> {
    match name {
        "id" | "controllerid" => Ok(Field::Id),
        "name" => Ok(Field::Name),
        "tag" => Ok(Field::Tag),
        _ => match name.strip_prefix("attribute.") {
            Some(key) if !key.is_empty() => Ok(Field::Attribute(key.to_string())),
            _ => Err(FilterError::UnknownField(name.to_string())),
        },
    }
}
