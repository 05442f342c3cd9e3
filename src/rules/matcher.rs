//! Match expressions selecting the targets a rule applies to
//!
//! ```text
//! expr    := all ("||" all)*
//! all     := unary ("&&" unary)*
//! unary   := "!" unary | "(" expr ")" | "true" | "false" | field op literal
//! field   := target.alias | target.connectUrl | target.id
//! op      := "==" | "!="
//! literal := '...' | "..."
//! ```

use crate::agent::ServiceRef;
use crate::error::{Error, Result};
use std::iter::Peekable;
use std::str::Chars;
use std::vec::IntoIter;

/// Target attribute a comparison reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Alias,
    ConnectUrl,
    Id,
}

impl Field {
    fn from_path(path: &str) -> Option<Self> {
        match path {
            "target.alias" => Some(Field::Alias),
            "target.connectUrl" => Some(Field::ConnectUrl),
            "target.id" => Some(Field::Id),
            _ => None,
        }
    }
}

/// A parsed match expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchExpression {
    Constant(bool),
    Compare {
        field: Field,
        equal: bool,
        value: String,
    },
    Not(Box<MatchExpression>),
    All(Vec<MatchExpression>),
    Any(Vec<MatchExpression>),
}

impl MatchExpression {
    pub fn parse(source: &str) -> Result<Self> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err(invalid("match expression is empty"));
        }
        let mut parser = Parser {
            tokens: tokens.into_iter().peekable(),
        };
        let expression = parser.any()?;
        match parser.tokens.next() {
            None => Ok(expression),
            Some(token) => Err(invalid(format!("unexpected {} in match expression", token))),
        }
    }

    pub fn matches(&self, service: &ServiceRef) -> bool {
        match self {
            MatchExpression::Constant(value) => *value,
            MatchExpression::Compare {
                field,
                equal,
                value,
            } => {
                let actual = match field {
                    Field::Alias => service.alias.clone(),
                    Field::ConnectUrl => Some(service.service_uri.clone()),
                    Field::Id => Some(service.target_id().as_str().to_string()),
                };
                (actual.as_deref() == Some(value.as_str())) == *equal
            }
            MatchExpression::Not(inner) => !inner.matches(service),
            MatchExpression::All(terms) => terms.iter().all(|t| t.matches(service)),
            MatchExpression::Any(terms) => terms.iter().any(|t| t.matches(service)),
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::InvalidRule(message.into())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Field(Field),
    Literal(String),
    Bool(bool),
    Eq,
    Ne,
    And,
    Or,
    Not,
    Open,
    Close,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Field(field) => write!(f, "field {:?}", field),
            Token::Literal(value) => write!(f, "'{}'", value),
            Token::Bool(value) => write!(f, "{}", value),
            Token::Eq => write!(f, "=="),
            Token::Ne => write!(f, "!="),
            Token::And => write!(f, "&&"),
            Token::Or => write!(f, "||"),
            Token::Not => write!(f, "!"),
            Token::Open => write!(f, "("),
            Token::Close => write!(f, ")"),
        }
    }
}

fn expect_next(chars: &mut Peekable<Chars<'_>>, expected: char, token: Token) -> Result<Token> {
    match chars.next() {
        Some(c) if c == expected => Ok(token),
        _ => Err(invalid(format!("expected {} in match expression", token))),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    while let Some(c) = chars.next() {
        let token = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::Open,
            ')' => Token::Close,
            '&' => expect_next(&mut chars, '&', Token::And)?,
            '|' => expect_next(&mut chars, '|', Token::Or)?,
            '=' => expect_next(&mut chars, '=', Token::Eq)?,
            '!' => {
                if chars.peek() == Some(&'=') {
                    chars.next();
                    Token::Ne
                } else {
                    Token::Not
                }
            }
            '\'' | '"' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some('\\') => match chars.next() {
                            Some(escaped) => value.push(escaped),
                            None => return Err(invalid("unterminated string in match expression")),
                        },
                        Some(q) if q == c => {
                            tokens.push(Token::Literal(value));
                            break;
                        }
                        Some(other) => value.push(other),
                        None => return Err(invalid("unterminated string in match expression")),
                    }
                }
                continue;
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut word = c.to_string();
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' || next == '.' {
                        word.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    path => Token::Field(Field::from_path(path).ok_or_else(|| {
                        invalid(format!("unknown attribute {} in match expression", path))
                    })?),
                }
            }
            other => {
                return Err(invalid(format!(
                    "unexpected character '{}' in match expression",
                    other
                )))
            }
        };
        tokens.push(token);
    }
    Ok(tokens)
}

struct Parser {
    tokens: Peekable<IntoIter<Token>>,
}

impl Parser {
    fn any(&mut self) -> Result<MatchExpression> {
        let mut terms = vec![self.all()?];
        while self.tokens.next_if_eq(&Token::Or).is_some() {
            terms.push(self.all()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            MatchExpression::Any(terms)
        })
    }

    fn all(&mut self) -> Result<MatchExpression> {
        let mut terms = vec![self.unary()?];
        while self.tokens.next_if_eq(&Token::And).is_some() {
            terms.push(self.unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            MatchExpression::All(terms)
        })
    }

    fn unary(&mut self) -> Result<MatchExpression> {
        match self.tokens.next() {
            Some(Token::Not) => Ok(MatchExpression::Not(Box::new(self.unary()?))),
            Some(Token::Open) => {
                let inner = self.any()?;
                match self.tokens.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(invalid("unbalanced parenthesis in match expression")),
                }
            }
            Some(Token::Bool(value)) => Ok(MatchExpression::Constant(value)),
            Some(Token::Field(field)) => {
                let equal = match self.tokens.next() {
                    Some(Token::Eq) => true,
                    Some(Token::Ne) => false,
                    _ => return Err(invalid("expected == or != in match expression")),
                };
                match self.tokens.next() {
                    Some(Token::Literal(value)) => Ok(MatchExpression::Compare {
                        field,
                        equal,
                        value,
                    }),
                    _ => Err(invalid("expected a quoted value in match expression")),
                }
            }
            Some(token) => Err(invalid(format!("unexpected {} in match expression", token))),
            None => Err(invalid("match expression ends unexpectedly")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::TargetId;

    fn service(id: &str, alias: Option<&str>) -> ServiceRef {
        ServiceRef::new(&TargetId::from(id), alias.map(str::to_string))
    }

    fn matches(expression: &str, service: &ServiceRef) -> bool {
        MatchExpression::parse(expression).unwrap().matches(service)
    }

    #[test]
    fn test_constant_expressions() {
        let svc = service("localhost:9091", None);
        assert!(matches("true", &svc));
        assert!(!matches("false", &svc));
        assert!(matches("!false", &svc));
    }

    #[test]
    fn test_field_comparisons() {
        let svc = service("localhost:9091", Some("orders"));
        assert!(matches("target.alias == 'orders'", &svc));
        assert!(matches("target.alias != \"billing\"", &svc));
        assert!(matches("target.id=='localhost:9091'", &svc));
        assert!(matches("target.connectUrl == 'agent://localhost:9091'", &svc));
        assert!(!matches("target.id == 'localhost:9092'", &svc));

        let anonymous = service("localhost:9091", None);
        assert!(!matches("target.alias == ''", &anonymous));
        assert!(matches("target.alias != 'orders'", &anonymous));
    }

    #[test]
    fn test_precedence_and_grouping() {
        let svc = service("localhost:9091", Some("orders"));
        assert!(matches("false && false || true", &svc));
        assert!(!matches("false && (false || true)", &svc));
        assert!(matches(
            "(target.alias == 'billing' || target.alias == 'orders') && target.id != 'x'",
            &svc
        ));
    }

    #[test]
    fn test_escaped_quote_in_literal() {
        let svc = service("localhost:9091", Some("it's"));
        assert!(matches(r"target.alias == 'it\'s'", &svc));
    }

    #[test]
    fn test_malformed_expressions_rejected() {
        for source in [
            "",
            "   ",
            "target.alias",
            "target.alias == orders",
            "target.alias = 'orders'",
            "target.annotations.main == 'x'",
            "(true",
            "true)",
            "true &&",
            "target.alias == 'open",
            "true & false",
        ] {
            assert!(
                matches!(MatchExpression::parse(source), Err(Error::InvalidRule(_))),
                "{:?} should be rejected",
                source
            );
        }
    }
}
