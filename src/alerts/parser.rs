//! Text form of rule conditions
//!
//! Grammar:
//!
//! ```text
//! expr    := and (("or" | "||") and)*
//! and     := unary (("and" | "&&") unary)*
//! unary   := ("not" | "!") unary | primary
//! primary := "(" expr ")" | "true" | "false"
//!          | "recent_alerts" "(" seconds ")" op number
//!          | operand op operand
//! operand := number | "threshold" | metric.path
//! op      := ">" | ">=" | "<" | "<=" | "==" | "!="
//! ```

use serde::{Deserialize, Deserializer};

use super::condition::{CompareOp, Condition, Operand, MAX_DEPTH};

/// Parse a condition expression and check its structural limits
pub fn parse_condition(input: &str) -> Result<Condition, ParseError> {
    let tokens = tokenize(input)?;
    if tokens.is_empty() {
        return Err(ParseError::Empty);
    }

    let mut parser = Parser {
        tokens,
        pos: 0,
        depth: 0,
    };
    let condition = parser.parse_or()?;

    if let Some(tok) = parser.peek() {
        return Err(ParseError::UnexpectedToken(tok.describe()));
    }

    condition
        .validate()
        .map_err(|e| ParseError::Invalid(e.to_string()))?;
    Ok(condition)
}

/// Either the text form or the tagged tree form of a condition
#[derive(Deserialize)]
#[serde(untagged)]
enum ConditionRepr {
    Text(String),
    Tree(Condition),
}

impl ConditionRepr {
    fn into_condition<E: serde::de::Error>(self) -> Result<Condition, E> {
        match self {
            ConditionRepr::Text(text) => parse_condition(&text).map_err(E::custom),
            ConditionRepr::Tree(condition) => Ok(condition),
        }
    }
}

/// Serde helper accepting `"a > 1 and b < 2"` as well as the tree form
pub(crate) fn deserialize_condition<'de, D>(deserializer: D) -> Result<Condition, D::Error>
where
    D: Deserializer<'de>,
{
    ConditionRepr::deserialize(deserializer)?.into_condition()
}

pub(crate) fn deserialize_optional_condition<'de, D>(deserializer: D) -> Result<Option<Condition>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<ConditionRepr>::deserialize(deserializer)?
        .map(ConditionRepr::into_condition::<D::Error>)
        .transpose()
}

/// Condition parse errors
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ParseError {
    #[error("Empty condition")]
    Empty,

    #[error("Unexpected character '{0}' at offset {1}")]
    UnexpectedChar(char, usize),

    #[error("Invalid number: {0}")]
    InvalidNumber(String),

    #[error("Unexpected token: {0}")]
    UnexpectedToken(String),

    #[error("Unexpected end of condition")]
    UnexpectedEnd,

    #[error("Expected comparison operator after {0}")]
    ExpectedOperator(String),

    #[error("Condition nested too deeply")]
    TooDeep,

    #[error("Invalid condition: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Op(CompareOp),
    And,
    Or,
    Not,
    LParen,
    RParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Number(n) => n.to_string(),
            Token::Op(op) => op.symbol().to_string(),
            Token::And => "and".to_string(),
            Token::Or => "or".to_string(),
            Token::Not => "not".to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
        }
    }
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-'
}

fn tokenize(input: &str) -> Result<Vec<Token>, ParseError> {
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);

        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '>' | '<' | '=' | '!' => {
                let (token, width) = match (c, next) {
                    ('>', Some('=')) => (Token::Op(CompareOp::Ge), 2),
                    ('>', _) => (Token::Op(CompareOp::Gt), 1),
                    ('<', Some('=')) => (Token::Op(CompareOp::Le), 2),
                    ('<', _) => (Token::Op(CompareOp::Lt), 1),
                    ('=', Some('=')) => (Token::Op(CompareOp::Eq), 2),
                    ('!', Some('=')) => (Token::Op(CompareOp::Ne), 2),
                    ('!', _) => (Token::Not, 1),
                    _ => return Err(ParseError::UnexpectedChar(c, offset)),
                };
                tokens.push(token);
                i += width;
            }
            '&' | '|' => {
                if next != Some(c) {
                    return Err(ParseError::UnexpectedChar(c, offset));
                }
                tokens.push(if c == '&' { Token::And } else { Token::Or });
                i += 2;
            }
            c if c.is_ascii_digit()
                || (c == '-' && next.map_or(false, |n| n.is_ascii_digit() || n == '.')) =>
            {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.' || chars[i].1 == '_') {
                    i += 1;
                }
                let text: String = chars[start..i]
                    .iter()
                    .map(|(_, c)| *c)
                    .filter(|c| *c != '_')
                    .collect();
                let value = text
                    .parse::<f64>()
                    .map_err(|_| ParseError::InvalidNumber(text.clone()))?;
                tokens.push(Token::Number(value));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i].1) {
                    i += 1;
                }
                let word: String = chars[start..i].iter().map(|(_, c)| *c).collect();
                let token = match word.to_ascii_lowercase().as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    _ => Token::Ident(word),
                };
                tokens.push(token);
            }
            other => return Err(ParseError::UnexpectedChar(other, offset)),
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn expect(&mut self, expected: Token) -> Result<(), ParseError> {
        match self.next() {
            Some(tok) if tok == expected => Ok(()),
            Some(tok) => Err(ParseError::UnexpectedToken(tok.describe())),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn enter(&mut self) -> Result<(), ParseError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(ParseError::TooDeep);
        }
        Ok(())
    }

    fn leave(&mut self) {
        self.depth -= 1;
    }

    fn parse_or(&mut self) -> Result<Condition, ParseError> {
        self.enter()?;
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            terms.push(self.parse_and()?);
        }
        self.leave();
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::any(terms)
        })
    }

    fn parse_and(&mut self) -> Result<Condition, ParseError> {
        let mut terms = vec![self.parse_unary()?];
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            terms.push(self.parse_unary()?);
        }
        Ok(if terms.len() == 1 {
            terms.remove(0)
        } else {
            Condition::all(terms)
        })
    }

    fn parse_unary(&mut self) -> Result<Condition, ParseError> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            self.enter()?;
            let inner = self.parse_unary()?;
            self.leave();
            return Ok(Condition::negate(inner));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Condition, ParseError> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("true") => {
                self.pos += 1;
                Ok(Condition::Literal { value: true })
            }
            Some(Token::Ident(word)) if word.eq_ignore_ascii_case("false") => {
                self.pos += 1;
                Ok(Condition::Literal { value: false })
            }
            Some(Token::Ident(word)) if word == "recent_alerts" => {
                self.pos += 1;
                self.parse_recent_alerts()
            }
            Some(_) => {
                let left = self.parse_operand()?;
                let op = match self.next() {
                    Some(Token::Op(op)) => op,
                    _ => return Err(ParseError::ExpectedOperator(left.to_string())),
                };
                let right = self.parse_operand()?;
                Ok(Condition::compare(left, op, right))
            }
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn parse_recent_alerts(&mut self) -> Result<Condition, ParseError> {
        self.expect(Token::LParen)?;
        let window_secs = self.parse_count()?;
        self.expect(Token::RParen)?;
        let op = match self.next() {
            Some(Token::Op(op)) => op,
            _ => return Err(ParseError::ExpectedOperator("recent_alerts".to_string())),
        };
        let count = self.parse_count()?;
        Ok(Condition::RecentAlerts {
            window_secs,
            op,
            count: count.min(u32::MAX as u64) as u32,
        })
    }

    fn parse_count(&mut self) -> Result<u64, ParseError> {
        match self.next() {
            Some(Token::Number(n)) if n >= 0.0 && n.fract() == 0.0 => Ok(n as u64),
            Some(Token::Number(n)) => Err(ParseError::InvalidNumber(n.to_string())),
            Some(tok) => Err(ParseError::UnexpectedToken(tok.describe())),
            None => Err(ParseError::UnexpectedEnd),
        }
    }

    fn parse_operand(&mut self) -> Result<Operand, ParseError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Operand::Value(n)),
            Some(Token::Ident(word)) if word == "threshold" => Ok(Operand::Threshold),
            Some(Token::Ident(word)) => Ok(Operand::Metric(word)),
            Some(tok) => Err(ParseError::UnexpectedToken(tok.describe())),
            None => Err(ParseError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_comparison() {
        let cond = parse_condition("system.memory_percent > 80").unwrap();
        assert_eq!(cond, Condition::metric_above("system.memory_percent", 80.0));

        let cond = parse_condition("processing.queue_depth >= threshold").unwrap();
        assert_eq!(
            cond,
            Condition::metric_vs_threshold("processing.queue_depth", CompareOp::Ge)
        );
    }

    #[test]
    fn test_parse_precedence() {
        // and binds tighter than or
        let cond = parse_condition("a.x > 1 or a.y > 2 and not a.z < 3").unwrap();
        assert_eq!(
            cond,
            Condition::any(vec![
                Condition::metric_above("a.x", 1.0),
                Condition::all(vec![
                    Condition::metric_above("a.y", 2.0),
                    Condition::negate(Condition::metric_below("a.z", 3.0)),
                ]),
            ])
        );

        let cond = parse_condition("(a.x > 1 || a.y > 2) && a.z != -1.5").unwrap();
        assert_eq!(
            cond,
            Condition::all(vec![
                Condition::any(vec![
                    Condition::metric_above("a.x", 1.0),
                    Condition::metric_above("a.y", 2.0),
                ]),
                Condition::compare(
                    Operand::Metric("a.z".into()),
                    CompareOp::Ne,
                    Operand::Value(-1.5)
                ),
            ])
        );
    }

    #[test]
    fn test_parse_recent_alerts_and_literals() {
        let cond = parse_condition("recent_alerts(600) >= 3 and true").unwrap();
        assert_eq!(
            cond,
            Condition::all(vec![
                Condition::RecentAlerts {
                    window_secs: 600,
                    op: CompareOp::Ge,
                    count: 3
                },
                Condition::Literal { value: true },
            ])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert_eq!(parse_condition("   "), Err(ParseError::Empty));
        assert!(matches!(
            parse_condition("system.cpu_percent 80"),
            Err(ParseError::ExpectedOperator(_))
        ));
        assert!(matches!(
            parse_condition("system.cpu_percent > 80 )"),
            Err(ParseError::UnexpectedToken(_))
        ));
        assert!(matches!(
            parse_condition("system.cpu_percent > 80 & x > 1"),
            Err(ParseError::UnexpectedChar('&', _))
        ));
        assert_eq!(
            parse_condition("(system.cpu_percent > 80"),
            Err(ParseError::UnexpectedEnd)
        );
        // No host calls: anything that is not a comparison is rejected
        assert!(parse_condition("__import__('os').system('ls')").is_err());
    }

    #[test]
    fn test_parse_rejects_unrepresentable_window() {
        assert!(matches!(
            parse_condition("recent_alerts(100000000000000) >= 1"),
            Err(ParseError::Invalid(_))
        ));
        assert!(parse_condition("recent_alerts(31622400) >= 1").is_ok());
    }

    #[test]
    fn test_parse_depth_limit() {
        let input = format!("{}a.x > 1{}", "(".repeat(40), ")".repeat(40));
        assert_eq!(parse_condition(&input), Err(ParseError::TooDeep));
    }

    #[test]
    fn test_display_round_trips() {
        let text = "(system.memory_percent > 80) and (not (api.error_rate < threshold))";
        let cond = parse_condition(text).unwrap();
        assert_eq!(parse_condition(&cond.to_string()).unwrap(), cond);
    }
}
