//! A small jq-flavoured path language, enough to pull fields out of an alert.
//!
//! Supported: `.`, `.name`, `."quoted name"`, `.["name"]`, `.[n]` (negative from the
//! end), chained suffixes, string/number/`null`/`true`/`false` literals, array
//! construction `[a, b]`, parentheses, pipes `a | b`, the alternative operator
//! `a // b` and the builtins `keys`, `length`, `tostring`, `tonumber`,
//! `ascii_downcase` and `ascii_upcase`.
//!
//! Unlike jq, looking up a key that does not exist is an error rather than `null`.
//! Use `//` to provide a fallback.

use super::{ExtractionError, QueryEvaluator};
use async_trait::async_trait;
use serde_json::{Number, Value};

/// Evaluates queries with the built-in path language
#[derive(Debug, Clone, Copy, Default)]
pub struct PathEvaluator;

#[async_trait]
impl QueryEvaluator for PathEvaluator {
    async fn evaluate(&self, query: &str, document: &Value) -> Result<Value, ExtractionError> {
        PathQuery::parse(query)?.run(document)
    }
}

/// A parsed query, ready to run against any number of documents
#[derive(Debug, Clone, PartialEq)]
pub struct PathQuery {
    source: String,
    expr: Expr,
}

impl PathQuery {
    pub fn parse(query: &str) -> Result<Self, ExtractionError> {
        let syntax = |reason: String| ExtractionError::Syntax {
            query: query.to_string(),
            reason,
        };

        let tokens = tokenize(query).map_err(syntax)?;
        let expr = Parser::new(tokens).parse().map_err(syntax)?;

        Ok(Self {
            source: query.to_string(),
            expr,
        })
    }

    pub fn run(&self, document: &Value) -> Result<Value, ExtractionError> {
        eval(&self.expr, document).map_err(|e| match e {
            EvalError::MissingPath(path) => ExtractionError::MissingPath {
                query: self.source.clone(),
                path,
            },
            EvalError::Type(reason) => ExtractionError::Evaluation {
                query: self.source.clone(),
                reason,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Dot,
    Ident(String),
    Str(String),
    Num(Number),
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Pipe,
    Alt,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Dot => write!(f, "'.'"),
            Token::Ident(name) => write!(f, "'{name}'"),
            Token::Str(s) => write!(f, "{}", Value::String(s.clone())),
            Token::Num(n) => write!(f, "{n}"),
            Token::LBracket => write!(f, "'['"),
            Token::RBracket => write!(f, "']'"),
            Token::LParen => write!(f, "'('"),
            Token::RParen => write!(f, "')'"),
            Token::Comma => write!(f, "','"),
            Token::Pipe => write!(f, "'|'"),
            Token::Alt => write!(f, "'//'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '.' => {
                chars.next();
                tokens.push(Token::Dot);
            }
            '[' | ']' | '(' | ')' | ',' | '|' => {
                chars.next();
                tokens.push(match c {
                    '[' => Token::LBracket,
                    ']' => Token::RBracket,
                    '(' => Token::LParen,
                    ')' => Token::RParen,
                    ',' => Token::Comma,
                    _ => Token::Pipe,
                });
            }
            '/' => {
                chars.next();
                if chars.next() != Some('/') {
                    return Err("expected '//'".into());
                }
                tokens.push(Token::Alt);
            }
            '"' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        None => return Err("unterminated string".into()),
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some('n') => s.push('\n'),
                            Some('t') => s.push('\t'),
                            Some(c @ ('"' | '\\' | '/')) => s.push(c),
                            Some(c) => return Err(format!("unknown escape '\\{c}'")),
                            None => return Err("unterminated string".into()),
                        },
                        Some(c) => s.push(c),
                    }
                }
                tokens.push(Token::Str(s));
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut text = String::new();
                text.push(c);
                chars.next();
                while let Some(&d) = chars.peek() {
                    if d.is_ascii_digit() || d == '.' {
                        text.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Num(parse_number(&text)?));
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut name = String::new();
                while let Some(&d) = chars.peek() {
                    if d.is_alphanumeric() || d == '_' {
                        name.push(d);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(name));
            }
            other => return Err(format!("unexpected character '{other}'")),
        }
    }

    Ok(tokens)
}

fn parse_number(text: &str) -> Result<Number, String> {
    if let Ok(n) = text.parse::<i64>() {
        return Ok(Number::from(n));
    }

    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .ok_or_else(|| format!("invalid number '{text}'"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Builtin {
    Keys,
    Length,
    ToString,
    ToNumber,
    AsciiDowncase,
    AsciiUpcase,
}

impl Builtin {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "keys" => Some(Self::Keys),
            "length" => Some(Self::Length),
            "tostring" => Some(Self::ToString),
            "tonumber" => Some(Self::ToNumber),
            "ascii_downcase" => Some(Self::AsciiDowncase),
            "ascii_upcase" => Some(Self::AsciiUpcase),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Keys => "keys",
            Self::Length => "length",
            Self::ToString => "tostring",
            Self::ToNumber => "tonumber",
            Self::AsciiDowncase => "ascii_downcase",
            Self::AsciiUpcase => "ascii_upcase",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Identity,
    Literal(Value),
    Field(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Array(Vec<Expr>),
    Pipe(Box<Expr>, Box<Expr>),
    Alternative(Box<Expr>, Box<Expr>),
    Builtin(Builtin),
}

impl std::fmt::Display for Expr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Expr::Identity => write!(f, "."),
            Expr::Literal(value) => write!(f, "{value}"),
            Expr::Field(target, key) => {
                if **target != Expr::Identity {
                    write!(f, "{target}")?;
                }
                if is_identifier(key) {
                    write!(f, ".{key}")
                } else {
                    write!(f, ".{}", Value::String(key.clone()))
                }
            }
            Expr::Index(target, index) => match **target {
                Expr::Identity => write!(f, ".[{index}]"),
                _ => write!(f, "{target}[{index}]"),
            },
            Expr::Array(items) => {
                let items: Vec<_> = items.iter().map(ToString::to_string).collect();
                write!(f, "[{}]", items.join(", "))
            }
            Expr::Pipe(left, right) => write!(f, "{left} | {right}"),
            Expr::Alternative(left, right) => write!(f, "{left} // {right}"),
            Expr::Builtin(builtin) => write!(f, "{}", builtin.name()),
        }
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    matches!(chars.next(), Some(c) if c.is_alphabetic() || c == '_')
        && chars.all(|c| c.is_alphanumeric() || c == '_')
}

/// Deepest bracket or parenthesis nesting a query may use
const MAX_DEPTH: usize = 64;
/// Bounds the length of suffix and pipe chains, which nest the expression tree too
const MAX_TOKENS: usize = 512;

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

impl Parser {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn parse(mut self) -> Result<Expr, String> {
        if self.tokens.is_empty() {
            return Err("empty query".into());
        }
        if self.tokens.len() > MAX_TOKENS {
            return Err(format!("query has more than {MAX_TOKENS} tokens"));
        }

        let expr = self.pipe()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("unexpected {token}")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn peek_at(&self, offset: usize) -> Option<&Token> {
        self.tokens.get(self.pos + offset)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
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

    fn expect(&mut self, token: Token) -> Result<(), String> {
        match self.advance() {
            Some(t) if t == token => Ok(()),
            Some(t) => Err(format!("expected {token}, found {t}")),
            None => Err(format!("expected {token}, found end of query")),
        }
    }

    /// Run `parse` one nesting level deeper
    fn nested<T>(
        &mut self,
        parse: impl FnOnce(&mut Self) -> Result<T, String>,
    ) -> Result<T, String> {
        if self.depth >= MAX_DEPTH {
            return Err("query nests too deeply".into());
        }
        self.depth += 1;
        let result = parse(self);
        self.depth -= 1;
        result
    }

    fn pipe(&mut self) -> Result<Expr, String> {
        let mut left = self.alternative()?;
        while self.eat(&Token::Pipe) {
            let right = self.alternative()?;
            left = Expr::Pipe(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn alternative(&mut self) -> Result<Expr, String> {
        let mut left = self.postfix()?;
        while self.eat(&Token::Alt) {
            let right = self.postfix()?;
            left = Expr::Alternative(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn postfix(&mut self) -> Result<Expr, String> {
        let mut expr = self.term()?;

        loop {
            match (self.peek(), self.peek_at(1)) {
                (Some(Token::Dot), Some(Token::Ident(_) | Token::Str(_) | Token::LBracket)) => {
                    self.pos += 1;
                    expr = self.suffix(expr)?;
                }
                (Some(Token::Dot), _) => {
                    return Err("expected a field name after '.'".into());
                }
                (Some(Token::LBracket), _) => {
                    expr = self.suffix(expr)?;
                }
                _ => return Ok(expr),
            }
        }
    }

    /// Parse `name`, `"name"` or `[index]` applied to `target`
    fn suffix(&mut self, target: Expr) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Ident(name)) | Some(Token::Str(name)) => {
                Ok(Expr::Field(Box::new(target), name))
            }
            Some(Token::LBracket) => {
                if self.peek() == Some(&Token::RBracket) {
                    return Err("iterating with '[]' is not supported".into());
                }
                let index = self.nested(|p| {
                    let index = p.pipe()?;
                    p.expect(Token::RBracket)?;
                    Ok(index)
                })?;
                Ok(Expr::Index(Box::new(target), Box::new(index)))
            }
            Some(token) => Err(format!("unexpected {token}")),
            None => Err("unexpected end of query".into()),
        }
    }

    fn term(&mut self) -> Result<Expr, String> {
        match self.advance() {
            Some(Token::Dot) => match self.peek() {
                Some(Token::Ident(_) | Token::Str(_) | Token::LBracket) => {
                    self.suffix(Expr::Identity)
                }
                _ => Ok(Expr::Identity),
            },
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(Value::Number(n))),
            Some(Token::LBracket) => self.nested(|p| {
                let mut items = Vec::new();
                if p.eat(&Token::RBracket) {
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(p.pipe()?);
                    if p.eat(&Token::RBracket) {
                        return Ok(Expr::Array(items));
                    }
                    p.expect(Token::Comma)?;
                }
            }),
            Some(Token::LParen) => self.nested(|p| {
                let expr = p.pipe()?;
                p.expect(Token::RParen)?;
                Ok(expr)
            }),
            Some(Token::Ident(name)) => match name.as_str() {
                "null" => Ok(Expr::Literal(Value::Null)),
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                _ => Builtin::from_name(&name)
                    .map(Expr::Builtin)
                    .ok_or_else(|| format!("unknown function '{name}'")),
            },
            Some(token) => Err(format!("unexpected {token}")),
            None => Err("unexpected end of query".into()),
        }
    }
}

enum EvalError {
    MissingPath(String),
    Type(String),
}

fn eval(expr: &Expr, input: &Value) -> Result<Value, EvalError> {
    match expr {
        Expr::Identity => Ok(input.clone()),
        Expr::Literal(value) => Ok(value.clone()),
        Expr::Field(target, key) => match eval(target, input)? {
            Value::Object(mut map) => map
                .remove(key)
                .ok_or_else(|| EvalError::MissingPath(expr.to_string())),
            Value::Null => Err(EvalError::MissingPath(expr.to_string())),
            other => Err(EvalError::Type(format!(
                "cannot index {} with \"{key}\"",
                type_name(&other)
            ))),
        },
        Expr::Index(target, index) => {
            let base = eval(target, input)?;
            let index = eval(index, input)?;
            lookup(base, index).ok_or_else(|| EvalError::MissingPath(expr.to_string()))?
        }
        Expr::Array(items) => items
            .iter()
            .map(|item| eval(item, input))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Expr::Pipe(left, right) => eval(right, &eval(left, input)?),
        Expr::Alternative(left, right) => match eval(left, input) {
            Ok(value) if !matches!(value, Value::Null | Value::Bool(false)) => Ok(value),
            _ => eval(right, input),
        },
        Expr::Builtin(builtin) => apply(*builtin, input),
    }
}

/// `None` when the key or position does not exist
fn lookup(base: Value, index: Value) -> Option<Result<Value, EvalError>> {
    match (base, index) {
        (Value::Object(mut map), Value::String(key)) => map.remove(&key).map(Ok),
        (Value::Array(mut items), Value::Number(n)) => {
            let Some(n) = n.as_i64() else {
                return Some(Err(EvalError::Type(format!(
                    "array index must be an integer, got {n}"
                ))));
            };
            let position = if n < 0 { items.len() as i64 + n } else { n };
            if position < 0 || position as usize >= items.len() {
                return None;
            }
            Some(Ok(items.swap_remove(position as usize)))
        }
        (Value::Null, _) => None,
        (base, index) => Some(Err(EvalError::Type(format!(
            "cannot index {} with {}",
            type_name(&base),
            type_name(&index)
        )))),
    }
}

fn apply(builtin: Builtin, input: &Value) -> Result<Value, EvalError> {
    let unsupported = || {
        EvalError::Type(format!(
            "{} is not defined for {}",
            builtin.name(),
            type_name(input)
        ))
    };

    match builtin {
        Builtin::Keys => match input {
            Value::Object(map) => {
                let mut keys: Vec<_> = map.keys().cloned().collect();
                keys.sort();
                Ok(Value::Array(keys.into_iter().map(Value::String).collect()))
            }
            Value::Array(items) => Ok(Value::Array((0..items.len()).map(Value::from).collect())),
            _ => Err(unsupported()),
        },
        Builtin::Length => match input {
            Value::Null => Ok(Value::from(0)),
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Ok(Value::from(i.abs())),
                None => Ok(n
                    .as_f64()
                    .and_then(|f| Number::from_f64(f.abs()))
                    .map(Value::Number)
                    .unwrap_or(Value::Null)),
            },
            Value::Bool(_) => Err(unsupported()),
        },
        Builtin::ToString => match input {
            Value::String(_) => Ok(input.clone()),
            other => Ok(Value::String(other.to_string())),
        },
        Builtin::ToNumber => match input {
            Value::Number(_) => Ok(input.clone()),
            Value::String(s) => parse_number(s.trim())
                .map(Value::Number)
                .map_err(|_| EvalError::Type(format!("cannot parse \"{s}\" as a number"))),
            _ => Err(unsupported()),
        },
        Builtin::AsciiDowncase => match input {
            Value::String(s) => Ok(Value::String(s.to_ascii_lowercase())),
            _ => Err(unsupported()),
        },
        Builtin::AsciiUpcase => match input {
            Value::String(s) => Ok(Value::String(s.to_ascii_uppercase())),
            _ => Err(unsupported()),
        },
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn document() -> Value {
        json!({
            "status": "firing",
            "labels": {
                "alertname": "TargetDown",
                "severity": "critical",
                "priority": "4",
                "app.kubernetes.io/name": "api"
            },
            "annotations": {"summary": "Target is down"},
            "receivers": ["ops", "dev", "sre"],
            "silenced": false,
            "extra": null
        })
    }

    fn run(query: &str) -> Result<Value, ExtractionError> {
        PathQuery::parse(query)?.run(&document())
    }

    #[test]
    fn test_identity() {
        assert_eq!(run(".").unwrap(), document());
    }

    #[test]
    fn test_field_paths() {
        assert_eq!(run(".status").unwrap(), json!("firing"));
        assert_eq!(run(".labels.severity").unwrap(), json!("critical"));
        assert_eq!(run(" .labels . alertname ").unwrap(), json!("TargetDown"));
    }

    #[test]
    fn test_quoted_keys() {
        assert_eq!(run(".labels.\"app.kubernetes.io/name\"").unwrap(), json!("api"));
        assert_eq!(run(".labels[\"app.kubernetes.io/name\"]").unwrap(), json!("api"));
        assert_eq!(run(".[\"status\"]").unwrap(), json!("firing"));
    }

    #[test]
    fn test_array_index() {
        assert_eq!(run(".receivers[0]").unwrap(), json!("ops"));
        assert_eq!(run(".receivers.[1]").unwrap(), json!("dev"));
        assert_eq!(run(".receivers[-1]").unwrap(), json!("sre"));
    }

    #[test]
    fn test_index_out_of_range_is_missing() {
        let err = run(".receivers[3]").unwrap_err();
        assert_eq!(
            err,
            ExtractionError::MissingPath {
                query: ".receivers[3]".into(),
                path: ".receivers[3]".into(),
            }
        );
    }

    #[test]
    fn test_missing_key() {
        let err = run(".labels.team.name").unwrap_err();
        match err {
            ExtractionError::MissingPath { path, .. } => assert_eq!(path, ".labels.team"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_null_is_a_missing_path() {
        assert!(matches!(
            run(".extra.value"),
            Err(ExtractionError::MissingPath { .. })
        ));
    }

    #[test]
    fn test_indexing_a_string_is_a_type_error() {
        let err = run(".status.value").unwrap_err();
        assert_eq!(
            err,
            ExtractionError::Evaluation {
                query: ".status.value".into(),
                reason: "cannot index string with \"value\"".into(),
            }
        );
    }

    #[test]
    fn test_literals() {
        assert_eq!(run("\"ops-alerts\"").unwrap(), json!("ops-alerts"));
        assert_eq!(run("5").unwrap(), json!(5));
        assert_eq!(run("-1.5").unwrap(), json!(-1.5));
        assert_eq!(run("null").unwrap(), Value::Null);
        assert_eq!(run("\"a\\\"b\"").unwrap(), json!("a\"b"));
    }

    #[test]
    fn test_array_construction() {
        assert_eq!(
            run("[.labels.severity, .status, \"prometheus\"]").unwrap(),
            json!(["critical", "firing", "prometheus"])
        );
        assert_eq!(run("[]").unwrap(), json!([]));
    }

    #[test]
    fn test_alternative() {
        assert_eq!(
            run(".annotations.description // .annotations.summary").unwrap(),
            json!("Target is down")
        );
        assert_eq!(run(".extra // \"fallback\"").unwrap(), json!("fallback"));
        assert_eq!(run(".silenced // 1").unwrap(), json!(1));
        assert_eq!(run(".status // \"unused\"").unwrap(), json!("firing"));
        assert!(run(".a // .b").is_err());
    }

    #[test]
    fn test_pipes_and_builtins() {
        assert_eq!(run(".labels.priority | tonumber").unwrap(), json!(4));
        assert_eq!(run(".labels.severity | ascii_upcase").unwrap(), json!("CRITICAL"));
        assert_eq!(run(".receivers | length").unwrap(), json!(3));
        assert_eq!(run(".annotations | keys").unwrap(), json!(["summary"]));
        assert_eq!(run(".silenced | tostring").unwrap(), json!("false"));
        assert_eq!(
            run("(.labels.alertname | ascii_downcase)").unwrap(),
            json!("targetdown")
        );
    }

    #[test]
    fn test_builtin_type_errors() {
        assert!(matches!(
            run(".labels.severity | tonumber"),
            Err(ExtractionError::Evaluation { .. })
        ));
        assert!(matches!(
            run(".receivers | ascii_upcase"),
            Err(ExtractionError::Evaluation { .. })
        ));
    }

    #[test]
    fn test_syntax_errors() {
        let queries = [
            "",
            ".labels.",
            ".[",
            "[.a,",
            "(.a",
            ".a ]",
            "unknown",
            "./",
            ".receivers[]",
            "\"open",
        ];

        for query in queries {
            assert!(
                matches!(PathQuery::parse(query), Err(ExtractionError::Syntax { .. })),
                "expected a syntax error for {query:?}"
            );
        }
    }

    #[test]
    fn test_deep_nesting_is_a_syntax_error() {
        let unbalanced = "(".repeat(100_000);
        assert!(matches!(
            PathQuery::parse(&unbalanced),
            Err(ExtractionError::Syntax { .. })
        ));

        let nested = format!("{}.{}", "[".repeat(100), "]".repeat(100));
        match PathQuery::parse(&nested) {
            Err(ExtractionError::Syntax { reason, .. }) => {
                assert_eq!(reason, "query nests too deeply")
            }
            other => panic!("expected a syntax error, got {other:?}"),
        }

        let shallow = format!("{}.status{}", "(".repeat(MAX_DEPTH), ")".repeat(MAX_DEPTH));
        assert_eq!(run(&shallow).unwrap(), json!("firing"));
    }

    #[test]
    fn test_long_chains_are_rejected() {
        let chain = ".a".repeat(MAX_TOKENS);
        assert!(matches!(
            PathQuery::parse(&chain),
            Err(ExtractionError::Syntax { .. })
        ));
    }

    #[test]
    fn test_display_round_trips_paths() {
        let query = PathQuery::parse(".labels.\"app.kubernetes.io/name\"").unwrap();
        assert_eq!(query.expr.to_string(), ".labels.\"app.kubernetes.io/name\"");
    }

    #[tokio::test]
    async fn test_evaluator() {
        let value = PathEvaluator
            .evaluate(".labels.alertname", &document())
            .await
            .unwrap();
        assert_eq!(value, json!("TargetDown"));
    }
}
