//! Tag predicate engine.
//!
//! Two parsers feed one evaluator: an infix expression grammar
//! (`files AND NOT (beta OR legacy)`) and a structured JSON form
//! (`{"$and": [...]}`). Evaluation is pure; every tag comparison goes
//! through [`normalize_tag`].

use std::collections::HashSet;
use std::fmt;

use serde_json::{json, Value};

use crate::error::{ProxyError, ProxyResult};

/// Lowercase + trim. The single normalization used for every tag comparison.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// Parsed tag predicate.
#[derive(Debug, Clone, PartialEq)]
pub enum TagQuery {
    Tag(String),
    And(Vec<TagQuery>),
    Or(Vec<TagQuery>),
    Not(Box<TagQuery>),
    Group(Box<TagQuery>),
}

impl TagQuery {
    /// Parse an infix expression. Precedence `NOT` > `AND` > `OR`,
    /// left-associative; keywords are case-insensitive.
    pub fn parse(input: &str) -> ProxyResult<TagQuery> {
        let tokens = lex(input)?;
        if tokens.is_empty() {
            return Err(invalid(0, "empty expression"));
        }
        let mut parser = Parser {
            tokens,
            pos: 0,
            input_len: input.len(),
        };
        let query = parser.parse_or()?;
        if let Some((token, offset)) = parser.peek() {
            return Err(invalid(*offset, &format!("unexpected {token}")));
        }
        Ok(query)
    }

    /// Parse the structured JSON form: `{$and|$or|$not|tag}`.
    pub fn from_json(value: &Value) -> ProxyResult<TagQuery> {
        let object = value
            .as_object()
            .ok_or_else(|| invalid(0, "expected an object node"))?;
        if object.len() != 1 {
            return Err(invalid(0, "expected exactly one operator per node"));
        }
        let (key, operand) = object.iter().next().expect("len checked");
        match key.as_str() {
            "tag" => {
                let tag = operand
                    .as_str()
                    .ok_or_else(|| invalid(0, "tag operand must be a string"))?;
                if normalize_tag(tag).is_empty() {
                    return Err(invalid(0, "tag operand must not be empty"));
                }
                Ok(TagQuery::Tag(tag.to_string()))
            }
            "$and" | "$or" => {
                let children = operand
                    .as_array()
                    .ok_or_else(|| invalid(0, &format!("{key} operand must be an array")))?
                    .iter()
                    .map(TagQuery::from_json)
                    .collect::<ProxyResult<Vec<_>>>()?;
                if key == "$and" {
                    Ok(TagQuery::And(children))
                } else {
                    Ok(TagQuery::Or(children))
                }
            }
            "$not" => Ok(TagQuery::Not(Box::new(TagQuery::from_json(operand)?))),
            other => Err(invalid(0, &format!("unknown operator '{other}'"))),
        }
    }

    /// Evaluate against a set of raw server tags.
    pub fn matches(&self, tags: &[String]) -> bool {
        let normalized: HashSet<String> = tags.iter().map(|t| normalize_tag(t)).collect();
        self.eval(&normalized)
    }

    /// Evaluate against an already-normalized tag set.
    pub fn eval(&self, tags: &HashSet<String>) -> bool {
        match self {
            TagQuery::Tag(tag) => tags.contains(&normalize_tag(tag)),
            // Empty conjunction/disjunction both admit nothing.
            TagQuery::And(children) => {
                !children.is_empty() && children.iter().all(|c| c.eval(tags))
            }
            TagQuery::Or(children) => children.iter().any(|c| c.eval(tags)),
            TagQuery::Not(child) => !child.eval(tags),
            TagQuery::Group(child) => child.eval(tags),
        }
    }

    /// Structured JSON form of this query.
    pub fn to_json(&self) -> Value {
        match self {
            TagQuery::Tag(tag) => json!({ "tag": tag }),
            TagQuery::And(children) => {
                json!({ "$and": children.iter().map(TagQuery::to_json).collect::<Vec<_>>() })
            }
            TagQuery::Or(children) => {
                json!({ "$or": children.iter().map(TagQuery::to_json).collect::<Vec<_>>() })
            }
            TagQuery::Not(child) => json!({ "$not": child.to_json() }),
            TagQuery::Group(child) => child.to_json(),
        }
    }

    fn precedence(&self) -> u8 {
        match self {
            TagQuery::Or(_) => 1,
            TagQuery::And(_) => 2,
            TagQuery::Not(_) => 3,
            TagQuery::Tag(_) | TagQuery::Group(_) => 4,
        }
    }

    fn write_expr(&self, f: &mut fmt::Formatter<'_>, parent_precedence: u8) -> fmt::Result {
        let own = self.precedence();
        let parenthesize = own < parent_precedence;
        if parenthesize {
            f.write_str("(")?;
        }
        match self {
            TagQuery::Tag(tag) => f.write_str(&normalize_tag(tag))?,
            TagQuery::And(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" AND ")?;
                    }
                    child.write_expr(f, own)?;
                }
            }
            TagQuery::Or(children) => {
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" OR ")?;
                    }
                    child.write_expr(f, own)?;
                }
            }
            TagQuery::Not(child) => {
                f.write_str("NOT ")?;
                child.write_expr(f, own)?;
            }
            TagQuery::Group(child) => child.write_expr(f, parent_precedence)?,
        }
        if parenthesize {
            f.write_str(")")?;
        }
        Ok(())
    }
}

impl fmt::Display for TagQuery {
    /// Infix rendering that reparses to an equivalent query.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.write_expr(f, 0)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Ident(name) => write!(f, "identifier '{name}'"),
            Token::And => f.write_str("AND"),
            Token::Or => f.write_str("OR"),
            Token::Not => f.write_str("NOT"),
            Token::LParen => f.write_str("'('"),
            Token::RParen => f.write_str("')'"),
        }
    }
}

fn invalid(offset: usize, message: &str) -> ProxyError {
    ProxyError::Validation(format!("invalid expression at offset {offset}: {message}"))
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_'
}

fn lex(input: &str) -> ProxyResult<Vec<(Token, usize)>> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();
    while let Some(&(offset, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '(' {
            chars.next();
            tokens.push((Token::LParen, offset));
        } else if c == ')' {
            chars.next();
            tokens.push((Token::RParen, offset));
        } else if is_ident_char(c) {
            let mut word = String::new();
            while let Some(&(_, c)) = chars.peek() {
                if is_ident_char(c) {
                    word.push(c);
                    chars.next();
                } else {
                    break;
                }
            }
            let token = if word.eq_ignore_ascii_case("and") {
                Token::And
            } else if word.eq_ignore_ascii_case("or") {
                Token::Or
            } else if word.eq_ignore_ascii_case("not") {
                Token::Not
            } else {
                Token::Ident(word)
            };
            tokens.push((token, offset));
        } else {
            return Err(invalid(offset, &format!("unexpected character '{c}'")));
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    input_len: usize,
}

impl Parser {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn end_offset(&self) -> usize {
        self.input_len
    }

    fn parse_or(&mut self) -> ProxyResult<TagQuery> {
        let mut operands = vec![self.parse_and()?];
        while matches!(self.peek(), Some((Token::Or, _))) {
            self.advance();
            operands.push(self.parse_and()?);
        }
        Ok(if operands.len() == 1 {
            operands.pop().expect("one operand")
        } else {
            TagQuery::Or(operands)
        })
    }

    fn parse_and(&mut self) -> ProxyResult<TagQuery> {
        let mut operands = vec![self.parse_unary()?];
        while matches!(self.peek(), Some((Token::And, _))) {
            self.advance();
            operands.push(self.parse_unary()?);
        }
        Ok(if operands.len() == 1 {
            operands.pop().expect("one operand")
        } else {
            TagQuery::And(operands)
        })
    }

    fn parse_unary(&mut self) -> ProxyResult<TagQuery> {
        if matches!(self.peek(), Some((Token::Not, _))) {
            self.advance();
            return Ok(TagQuery::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> ProxyResult<TagQuery> {
        match self.advance() {
            Some((Token::Ident(name), _)) => Ok(TagQuery::Tag(name)),
            Some((Token::LParen, offset)) => {
                let inner = self.parse_or()?;
                match self.advance() {
                    Some((Token::RParen, _)) => Ok(TagQuery::Group(Box::new(inner))),
                    _ => Err(invalid(offset, "unclosed '('")),
                }
            }
            Some((token, offset)) => Err(invalid(offset, &format!("unexpected {token}"))),
            None => Err(invalid(self.end_offset(), "unexpected end of expression")),
        }
    }
}
