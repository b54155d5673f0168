//! Filter queries.
//!
//! A filter is the XPath selector Windows accepts for `EvtQuery`/`EvtSubscribe`.
//! The crate validates a small, well-defined subset up front so malformed
//! filters are rejected at configuration time, and evaluates that subset for the
//! in-memory source:
//!
//! ```text
//! *
//! *[System[Level=2]]
//! *[System[(Level=1 or Level=2) and Provider[@Name='Service Control Manager']]]
//! *[System[EventID>=7000 and EventID<7100]]
//! ```

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::event::ParsedEvent;

/// Numeric `System` fields a condition can compare.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumericField {
    Level,
    EventId,
    RecordId,
}

#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CompareOp {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "=" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            "<=" => Some(Self::Le),
            ">" => Some(Self::Gt),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    const fn apply(self, lhs: i128, rhs: i128) -> bool {
        match self {
            Self::Eq => lhs == rhs,
            Self::Ne => lhs != rhs,
            Self::Lt => lhs < rhs,
            Self::Le => lhs <= rhs,
            Self::Gt => lhs > rhs,
            Self::Ge => lhs >= rhs,
        }
    }
}

/// Parsed filter condition tree.
#[allow(missing_docs)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    Compare {
        field: NumericField,
        op: CompareOp,
        value: i128,
    },
    Provider(String),
    And(Vec<Condition>),
    Or(Vec<Condition>),
}

impl Condition {
    fn matches(&self, event: &ParsedEvent) -> bool {
        match self {
            Self::Compare { field, op, value } => {
                let lhs = match field {
                    NumericField::Level => match event.level.trim().parse::<i128>() {
                        Ok(v) => v,
                        Err(_) => return false,
                    },
                    NumericField::EventId => i128::from(event.event_id),
                    NumericField::RecordId => i128::from(event.record_id),
                };
                op.apply(lhs, *value)
            }
            Self::Provider(name) => event.provider == *name,
            Self::And(all) => all.iter().all(|c| c.matches(event)),
            Self::Or(any) => any.iter().any(|c| c.matches(event)),
        }
    }
}

/// Error returned for a filter outside the supported grammar.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{reason}")]
pub struct FilterSyntaxError {
    /// What was wrong with the filter.
    pub reason: String,
}

impl FilterSyntaxError {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// A validated filter query.
///
/// The text is kept verbatim because the Windows source hands it to
/// the OS unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FilterQuery {
    text: String,
    condition: Option<Condition>,
}

impl FilterQuery {
    /// The filter that matches every record.
    #[must_use]
    pub fn match_all() -> Self {
        Self {
            text: "*".to_string(),
            condition: None,
        }
    }

    /// Parses and validates a filter. An empty string means "match all".
    pub fn parse(text: &str) -> Result<Self, FilterSyntaxError> {
        let trimmed = text.trim();
        if trimmed.is_empty() || trimmed == "*" {
            return Ok(Self::match_all());
        }

        let inner = trimmed
            .strip_prefix("*[System[")
            .and_then(|rest| rest.strip_suffix("]]"))
            .ok_or_else(|| FilterSyntaxError::new("expected '*' or '*[System[...]]'"))?;

        let tokens = tokenize(inner)?;
        if tokens.is_empty() {
            return Err(FilterSyntaxError::new("empty System condition"));
        }

        let mut parser = ConditionParser { tokens, pos: 0 };
        let condition = parser.parse_or()?;
        if parser.pos != parser.tokens.len() {
            return Err(FilterSyntaxError::new(format!(
                "unexpected {} after condition",
                parser.tokens[parser.pos]
            )));
        }

        Ok(Self {
            text: trimmed.to_string(),
            condition: Some(condition),
        })
    }

    /// The filter text as written.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Returns true if this filter selects every record.
    #[must_use]
    pub const fn is_match_all(&self) -> bool {
        self.condition.is_none()
    }

    /// Evaluates the filter against a decoded record.
    #[must_use]
    pub fn matches(&self, event: &ParsedEvent) -> bool {
        self.condition.as_ref().map_or(true, |c| c.matches(event))
    }
}

impl Default for FilterQuery {
    fn default() -> Self {
        Self::match_all()
    }
}

impl fmt::Display for FilterQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl TryFrom<String> for FilterQuery {
    type Error = FilterSyntaxError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FilterQuery> for String {
    fn from(value: FilterQuery) -> Self {
        value.text
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Open,
    Close,
    And,
    Or,
    Cond(Condition),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("'('"),
            Self::Close => f.write_str("')'"),
            Self::And => f.write_str("'and'"),
            Self::Or => f.write_str("'or'"),
            Self::Cond(_) => f.write_str("condition"),
        }
    }
}

fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"(?x)
            \s*(?:
                (?P<open>\()
              | (?P<close>\))
              | (?P<and>and)\b
              | (?P<or>or)\b
              | (?P<field>Level|EventID|EventRecordID)\s*(?P<op>!=|<=|>=|=|<|>)\s*(?P<num>-?\d+)
              | Provider\[\s*@Name\s*=\s*(?:'(?P<sq>[^']*)'|"(?P<dq>[^"]*)")\s*\]
            )\s*"#,
        )
        .expect("filter token regex is valid")
    })
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterSyntaxError> {
    let re = token_regex();
    let mut tokens = Vec::new();
    let mut pos = 0;

    while pos < input.len() {
        let rest = &input[pos..];
        if rest.trim().is_empty() {
            break;
        }
        let caps = re
            .captures(rest)
            .filter(|c| c.get(0).is_some_and(|m| m.start() == 0 && !m.as_str().is_empty()))
            .ok_or_else(|| FilterSyntaxError::new(format!("unrecognised input at '{}'", rest.trim())))?;

        let token = if caps.name("open").is_some() {
            Token::Open
        } else if caps.name("close").is_some() {
            Token::Close
        } else if caps.name("and").is_some() {
            Token::And
        } else if caps.name("or").is_some() {
            Token::Or
        } else if let Some(field) = caps.name("field") {
            let field = match field.as_str() {
                "Level" => NumericField::Level,
                "EventID" => NumericField::EventId,
                _ => NumericField::RecordId,
            };
            let op = caps
                .name("op")
                .and_then(|m| CompareOp::parse(m.as_str()))
                .ok_or_else(|| FilterSyntaxError::new("missing comparison operator"))?;
            let value = caps
                .name("num")
                .and_then(|m| m.as_str().parse::<i128>().ok())
                .ok_or_else(|| FilterSyntaxError::new("comparison value is not a number"))?;
            Token::Cond(Condition::Compare { field, op, value })
        } else {
            let name = caps
                .name("sq")
                .or_else(|| caps.name("dq"))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            Token::Cond(Condition::Provider(name))
        };

        tokens.push(token);
        pos += caps.get(0).map_or(rest.len(), |m| m.end());
    }

    Ok(tokens)
}

struct ConditionParser {
    tokens: Vec<Token>,
    pos: usize,
}

impl ConditionParser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn parse_or(&mut self) -> Result<Condition, FilterSyntaxError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::Or(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Condition, FilterSyntaxError> {
        let mut factors = vec![self.parse_factor()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            factors.push(self.parse_factor()?);
        }
        Ok(if factors.len() == 1 {
            factors.remove(0)
        } else {
            Condition::And(factors)
        })
    }

    fn parse_factor(&mut self) -> Result<Condition, FilterSyntaxError> {
        let token = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| FilterSyntaxError::new("unexpected end of condition"))?;
        self.pos += 1;
        match token {
            Token::Cond(c) => Ok(c),
            Token::Open => {
                let inner = self.parse_or()?;
                if self.peek() != Some(&Token::Close) {
                    return Err(FilterSyntaxError::new("unbalanced parenthesis"));
                }
                self.pos += 1;
                Ok(inner)
            }
            other => Err(FilterSyntaxError::new(format!("unexpected {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn event(level: &str, event_id: i64, provider: &str) -> ParsedEvent {
        ParsedEvent {
            record_id: 10,
            event_id,
            level: level.to_string(),
            provider: provider.to_string(),
            time_created: Utc::now(),
            event_data: Vec::new(),
            message: None,
            channel: None,
            computer: None,
        }
    }

    #[test]
    fn test_star_and_empty_match_all() {
        assert!(FilterQuery::parse("*").unwrap().is_match_all());
        assert!(FilterQuery::parse("  ").unwrap().is_match_all());
        assert!(FilterQuery::default().matches(&event("4", 1, "x")));
    }

    #[test]
    fn test_level_condition() {
        let f = FilterQuery::parse("*[System[Level=2]]").unwrap();
        assert!(f.matches(&event("2", 1, "x")));
        assert!(!f.matches(&event("4", 1, "x")));
        assert!(!f.matches(&event("Error", 1, "x")));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let f = FilterQuery::parse("*[System[Level=1 or Level=2 and EventID=7]]").unwrap();
        assert!(f.matches(&event("1", 99, "x")));
        assert!(f.matches(&event("2", 7, "x")));
        assert!(!f.matches(&event("2", 8, "x")));
    }

    #[test]
    fn test_parentheses_and_provider() {
        let f = FilterQuery::parse(
            "*[System[(Level=1 or Level=2) and Provider[@Name='Service Control Manager']]]",
        )
        .unwrap();
        assert!(f.matches(&event("2", 7036, "Service Control Manager")));
        assert!(!f.matches(&event("2", 7036, "Other")));
        assert!(!f.matches(&event("4", 7036, "Service Control Manager")));
    }

    #[test]
    fn test_range_comparisons() {
        let f = FilterQuery::parse("*[System[EventID>=7000 and EventID<7100]]").unwrap();
        assert!(f.matches(&event("4", 7000, "x")));
        assert!(f.matches(&event("4", 7099, "x")));
        assert!(!f.matches(&event("4", 7100, "x")));
    }

    #[test]
    fn test_rejects_malformed_filters() {
        for bad in [
            "System",
            "*[System[Level=]]",
            "*[System[(Level=1]]",
            "*[System[Level=1 and]]",
            "*[System[]]",
            "*[System[Keywords=1]]",
            "*[System[Level=1 Level=2]]",
        ] {
            assert!(FilterQuery::parse(bad).is_err(), "expected rejection: {bad}");
        }
    }

    #[test]
    fn test_serde_round_trips_text() {
        let f: FilterQuery = serde_json::from_str("\"*[System[Level=3]]\"").unwrap();
        assert_eq!(f.as_str(), "*[System[Level=3]]");
        assert!(serde_json::from_str::<FilterQuery>("\"nope\"").is_err());
    }
}
