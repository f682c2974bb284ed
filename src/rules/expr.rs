//! Comparison grammar for `custom_scoring` rules.
//!
//! ```text
//! expr     := and_expr (("||" | "or") and_expr)*
//! and_expr := cmp (("&&" | "and") cmp)*
//! cmp      := field op number
//! op       := ">" | ">=" | "<" | "<=" | "==" | "!="
//! ```
//!
//! Only the numeric fields in [`Field`] can be referenced. There are no
//! parentheses, calls or arithmetic, and an expression holds at most
//! [`MAX_COMPARISONS`] comparisons, so evaluation is a bounded walk.

use crate::models::Event;

pub const MAX_COMPARISONS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    PromptTokens,
    CompletionTokens,
    TotalTokens,
    DurationMs,
    StatusCode,
    PromptLength,
    ResponseLength,
}

impl Field {
    fn parse(name: &str) -> Option<Self> {
        Some(match name {
            "prompt_tokens" => Field::PromptTokens,
            "completion_tokens" => Field::CompletionTokens,
            "total_tokens" | "tokens" => Field::TotalTokens,
            "duration_ms" => Field::DurationMs,
            "status_code" => Field::StatusCode,
            "prompt_length" => Field::PromptLength,
            "response_length" => Field::ResponseLength,
            _ => return None,
        })
    }

    fn read(&self, event: &Event) -> f64 {
        match self {
            Field::PromptTokens => event.prompt_tokens as f64,
            Field::CompletionTokens => event.completion_tokens as f64,
            Field::TotalTokens => event.total_tokens() as f64,
            Field::DurationMs => event.duration_ms as f64,
            Field::StatusCode => event.status_code.map(f64::from).unwrap_or(0.0),
            Field::PromptLength => event.prompt_text.as_deref().map_or(0, |s| s.chars().count()) as f64,
            Field::ResponseLength => event.response_text.as_deref().map_or(0, |s| s.chars().count()) as f64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Comparison {
    pub field: Field,
    pub op: Op,
    pub value: f64,
}

impl Comparison {
    fn holds(&self, event: &Event) -> bool {
        let v = self.field.read(event);
        match self.op {
            Op::Gt => v > self.value,
            Op::Ge => v >= self.value,
            Op::Lt => v < self.value,
            Op::Le => v <= self.value,
            Op::Eq => v == self.value,
            Op::Ne => v != self.value,
        }
    }
}

/// Disjunction of conjunctions.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringExpr {
    clauses: Vec<Vec<Comparison>>,
}

impl ScoringExpr {
    pub fn parse(source: &str) -> Result<Self, String> {
        let tokens = tokenize(source)?;
        if tokens.is_empty() {
            return Err("empty expression".to_string());
        }
        let mut clauses: Vec<Vec<Comparison>> = vec![Vec::new()];
        let mut total = 0usize;
        let mut iter = tokens.into_iter().peekable();
        loop {
            let field = match iter.next() {
                Some(Token::Ident(name)) => {
                    Field::parse(&name).ok_or_else(|| format!("unknown field '{}'", name))?
                }
                Some(other) => return Err(format!("expected field, found {}", other.describe())),
                None => return Err("expression ends after a connective".to_string()),
            };
            let op = match iter.next() {
                Some(Token::Op(op)) => op,
                Some(other) => return Err(format!("expected comparison operator, found {}", other.describe())),
                None => return Err("missing comparison operator".to_string()),
            };
            let value = match iter.next() {
                Some(Token::Number(n)) => n,
                Some(other) => return Err(format!("expected number, found {}", other.describe())),
                None => return Err("missing comparison value".to_string()),
            };
            total += 1;
            if total > MAX_COMPARISONS {
                return Err(format!("more than {} comparisons", MAX_COMPARISONS));
            }
            if let Some(clause) = clauses.last_mut() {
                clause.push(Comparison { field, op, value });
            }
            match iter.next() {
                None => break,
                Some(Token::And) => {}
                Some(Token::Or) => clauses.push(Vec::new()),
                Some(other) => return Err(format!("expected '&&' or '||', found {}", other.describe())),
            }
        }
        Ok(Self { clauses })
    }

    pub fn evaluate(&self, event: &Event) -> bool {
        self.clauses.iter().any(|clause| clause.iter().all(|c| c.holds(event)))
    }

    pub fn comparison_count(&self) -> usize {
        self.clauses.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Number(f64),
    Op(Op),
    And,
    Or,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => format!("'{}'", s),
            Token::Number(n) => format!("number {}", n),
            Token::Op(_) => "operator".to_string(),
            Token::And => "'&&'".to_string(),
            Token::Or => "'||'".to_string(),
        }
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, String> {
    let chars: Vec<char> = source.chars().collect();
    let mut out = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        let next = chars.get(i + 1).copied();
        let two = |a: char, b: char| c == a && next == Some(b);
        if two('&', '&') {
            out.push(Token::And);
            i += 2;
        } else if two('|', '|') {
            out.push(Token::Or);
            i += 2;
        } else if two('>', '=') {
            out.push(Token::Op(Op::Ge));
            i += 2;
        } else if two('<', '=') {
            out.push(Token::Op(Op::Le));
            i += 2;
        } else if two('=', '=') {
            out.push(Token::Op(Op::Eq));
            i += 2;
        } else if two('!', '=') {
            out.push(Token::Op(Op::Ne));
            i += 2;
        } else if c == '>' {
            out.push(Token::Op(Op::Gt));
            i += 1;
        } else if c == '<' {
            out.push(Token::Op(Op::Lt));
            i += 1;
        } else if c.is_ascii_digit() || c == '.' || (c == '-' && next.map_or(false, |n| n.is_ascii_digit() || n == '.')) {
            let start = i;
            i += 1;
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                i += 1;
            }
            let text: String = chars[start..i].iter().filter(|c| **c != '_').collect();
            let n: f64 = text.parse().map_err(|_| format!("invalid number '{}'", text))?;
            out.push(Token::Number(n));
        } else if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            let word: String = chars[start..i].iter().collect::<String>().to_ascii_lowercase();
            match word.as_str() {
                "and" => out.push(Token::And),
                "or" => out.push(Token::Or),
                _ => out.push(Token::Ident(word)),
            }
        } else {
            return Err(format!("unexpected character '{}' at offset {}", c, i));
        }
    }
    Ok(out)
}
