//! Symbolic math tool — evaluates mathematical expressions.
//!
//! Queries go to a [`MathBackend`]. With a Wolfram|Alpha app ID configured
//! the tool uses the hosted engine; otherwise it falls back to a local
//! recursive-descent evaluator that handles arithmetic, powers, a handful
//! of functions and the constants `pi` and `e`.

use async_trait::async_trait;
use gemcord_core::error::ToolError;
use gemcord_core::tool::{ParamKind, Tool, ToolSchema};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const TOOL_NAME: &str = "symbolic_math";

/// Longest expression the local evaluator accepts, in characters.
const MAX_EXPRESSION_LEN: usize = 1000;

/// Deepest nesting of parentheses, unary minus and powers the parser follows.
const MAX_DEPTH: usize = 256;

/// Something that can answer a math query.
#[async_trait]
pub trait MathBackend: Send + Sync {
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, String>;
}

pub struct SymbolicMathTool {
    backend: Arc<dyn MathBackend>,
}

impl SymbolicMathTool {
    pub fn new(backend: Arc<dyn MathBackend>) -> Self {
        Self { backend }
    }

    /// Local evaluation only.
    pub fn local() -> Self {
        Self::new(Arc::new(LocalEvaluator))
    }
}

#[async_trait]
impl Tool for SymbolicMathTool {
    fn name(&self) -> &str {
        TOOL_NAME
    }

    fn description(&self) -> &str {
        "Evaluate a mathematical expression exactly. Use this for any arithmetic or algebra \
         instead of computing it yourself. Supports +, -, *, /, ^, %, parentheses, \
         sqrt, sin, cos, tan, ln, log, abs, pi and e."
    }

    fn schema(&self) -> ToolSchema {
        ToolSchema::new().required(
            "expression",
            ParamKind::String,
            "The expression to evaluate, e.g. '(2 + 3) * 4' or 'sqrt(2)^2'",
        )
    }

    async fn execute(&self, arguments: serde_json::Value) -> Result<serde_json::Value, ToolError> {
        let expression = arguments["expression"].as_str().unwrap_or_default().trim();
        debug!(expression = %expression, "Evaluating expression");

        let result = self
            .backend
            .evaluate(expression)
            .await
            .map_err(|reason| ToolError::Failed {
                tool_name: TOOL_NAME.into(),
                reason,
            })?;

        Ok(serde_json::json!({
            "expression": expression,
            "result": result,
        }))
    }
}

/// In-process evaluator.
pub struct LocalEvaluator;

#[async_trait]
impl MathBackend for LocalEvaluator {
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, String> {
        evaluate(expression).map(number_to_json)
    }
}

/// Integral results become JSON integers so "84" stays "84".
fn number_to_json(value: f64) -> serde_json::Value {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        serde_json::json!(value as i64)
    } else {
        serde_json::json!(value)
    }
}

/// Wolfram|Alpha full-results API backend.
pub struct WolframAlphaBackend {
    client: reqwest::Client,
    app_id: String,
    base_url: String,
}

impl WolframAlphaBackend {
    pub fn new(app_id: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            app_id: app_id.into(),
            base_url: "https://api.wolframalpha.com/v2".into(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct WolframEnvelope {
    queryresult: WolframResult,
}

#[derive(Debug, Deserialize)]
struct WolframResult {
    success: bool,
    #[serde(default)]
    error: serde_json::Value,
    #[serde(default)]
    pods: Vec<WolframPod>,
}

#[derive(Debug, Deserialize)]
struct WolframPod {
    title: String,
    #[serde(default)]
    subpods: Vec<WolframSubpod>,
}

#[derive(Debug, Deserialize)]
struct WolframSubpod {
    #[serde(default)]
    plaintext: Option<String>,
}

/// Flatten pods into `{title: "text | text"}`.
fn summarize_pods(result: WolframResult) -> Result<serde_json::Value, String> {
    if !result.success {
        let detail = result.error["msg"].as_str().unwrap_or("no interpretation found");
        return Err(format!("Wolfram|Alpha could not answer: {detail}"));
    }

    let mut out = serde_json::Map::new();
    for pod in result.pods {
        let texts: Vec<String> = pod
            .subpods
            .into_iter()
            .filter_map(|s| s.plaintext)
            .filter(|t| !t.is_empty())
            .collect();
        if !texts.is_empty() {
            out.insert(pod.title, serde_json::Value::String(texts.join(" | ")));
        }
    }

    if out.is_empty() {
        return Err("Wolfram|Alpha returned no plaintext results".into());
    }
    Ok(serde_json::Value::Object(out))
}

#[async_trait]
impl MathBackend for WolframAlphaBackend {
    async fn evaluate(&self, expression: &str) -> Result<serde_json::Value, String> {
        let response = self
            .client
            .get(format!("{}/query", self.base_url))
            .query(&[
                ("appid", self.app_id.as_str()),
                ("input", expression),
                ("output", "json"),
                ("format", "plaintext"),
            ])
            .send()
            .await
            .map_err(|e| format!("request failed: {e}"))?;

        match response.status().as_u16() {
            200 => {}
            429 => return Err("Wolfram|Alpha rate limit exceeded".into()),
            501 => return Err("Wolfram|Alpha rejected the app ID".into()),
            status => return Err(format!("Wolfram|Alpha returned HTTP {status}")),
        }

        let envelope: WolframEnvelope = response
            .json()
            .await
            .map_err(|e| format!("unreadable response: {e}"))?;
        summarize_pods(envelope.queryresult)
    }
}

// ── Recursive-descent expression evaluator ────────────────────────────────

/// Evaluate a mathematical expression string.
pub fn evaluate(expr: &str) -> Result<f64, String> {
    if expr.chars().count() > MAX_EXPRESSION_LEN {
        return Err(format!("Expression longer than {MAX_EXPRESSION_LEN} characters"));
    }
    let tokens = tokenize(expr)?;
    let mut parser = Parser::new(&tokens);
    let result = parser.parse_expr()?;
    if let Some(tok) = parser.tokens.get(parser.pos) {
        return Err(format!("Unexpected token at position {}: {tok:?}", parser.pos));
    }
    if !result.is_finite() {
        return Err("Result is not a finite number".into());
    }
    Ok(result)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    Caret,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let single = match chars[i] {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' | '×' => Token::Star,
            '/' | '÷' => Token::Slash,
            '%' => Token::Percent,
            '^' => Token::Caret,
            '(' => Token::LParen,
            ')' => Token::RParen,
            c if c.is_ascii_digit() || c == '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let num_str: String = chars[start..i].iter().collect();
                let num: f64 = num_str
                    .parse()
                    .map_err(|_| format!("Invalid number: {num_str}"))?;
                tokens.push(Token::Number(num));
                continue;
            }
            c if c.is_ascii_alphabetic() => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphanumeric() {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect::<String>().to_ascii_lowercase()));
                continue;
            }
            c => return Err(format!("Unexpected character: '{c}'")),
        };
        tokens.push(single);
        i += 1;
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: &'a [Token],
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(tokens: &'a [Token]) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    fn peek(&self) -> Option<&'a Token> {
        self.tokens.get(self.pos)
    }

    fn consume(&mut self) -> Option<&'a Token> {
        let tok = self.tokens.get(self.pos);
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    // expr = term (('+' | '-') term)*
    fn parse_expr(&mut self) -> Result<f64, String> {
        let mut left = self.parse_term()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Plus => {
                    self.consume();
                    left += self.parse_term()?;
                }
                Token::Minus => {
                    self.consume();
                    left -= self.parse_term()?;
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // term = unary (('*' | '/' | '%') unary)*
    fn parse_term(&mut self) -> Result<f64, String> {
        let mut left = self.parse_unary()?;
        while let Some(op) = self.peek() {
            match op {
                Token::Star => {
                    self.consume();
                    left *= self.parse_unary()?;
                }
                Token::Slash | Token::Percent => {
                    self.consume();
                    let right = self.parse_unary()?;
                    if right == 0.0 {
                        return Err("Division by zero".into());
                    }
                    if matches!(op, Token::Slash) {
                        left /= right;
                    } else {
                        left %= right;
                    }
                }
                _ => break,
            }
        }
        Ok(left)
    }

    // Every recursive path passes through here, so this bounds the stack.
    fn parse_unary(&mut self) -> Result<f64, String> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err("Expression nested too deeply".into());
        }
        let value = self.parse_unary_inner();
        self.depth -= 1;
        value
    }

    // unary = '-' unary | power
    fn parse_unary_inner(&mut self) -> Result<f64, String> {
        if let Some(Token::Minus) = self.peek() {
            self.consume();
            let val = self.parse_unary()?;
            return Ok(-val);
        }
        self.parse_power()
    }

    // power = primary ('^' unary)?    (right-associative)
    fn parse_power(&mut self) -> Result<f64, String> {
        let base = self.parse_primary()?;
        if let Some(Token::Caret) = self.peek() {
            self.consume();
            let exponent = self.parse_unary()?;
            return Ok(base.powf(exponent));
        }
        Ok(base)
    }

    // primary = NUMBER | CONST | FUNC '(' expr ')' | '(' expr ')'
    fn parse_primary(&mut self) -> Result<f64, String> {
        match self.consume() {
            Some(Token::Number(n)) => Ok(*n),
            Some(Token::LParen) => {
                let val = self.parse_expr()?;
                self.expect_rparen()?;
                Ok(val)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "pi" => Ok(std::f64::consts::PI),
                "e" => Ok(std::f64::consts::E),
                func => {
                    match self.consume() {
                        Some(Token::LParen) => {}
                        _ => return Err(format!("Unknown name: {func}")),
                    }
                    let arg = self.parse_expr()?;
                    self.expect_rparen()?;
                    apply_function(func, arg)
                }
            },
            Some(tok) => Err(format!("Unexpected token: {tok:?}")),
            None => Err("Unexpected end of expression".into()),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), String> {
        match self.consume() {
            Some(Token::RParen) => Ok(()),
            _ => Err("Expected closing parenthesis".into()),
        }
    }
}

fn apply_function(name: &str, arg: f64) -> Result<f64, String> {
    let value = match name {
        "sqrt" if arg < 0.0 => return Err("Square root of a negative number".into()),
        "sqrt" => arg.sqrt(),
        "sin" => arg.sin(),
        "cos" => arg.cos(),
        "tan" => arg.tan(),
        "abs" => arg.abs(),
        "ln" | "log" if arg <= 0.0 => return Err("Logarithm of a non-positive number".into()),
        "ln" => arg.ln(),
        "log" => arg.log10(),
        other => return Err(format!("Unknown function: {other}")),
    };
    Ok(value)
}

// ── Tests ─────────────────────────────────────────────────────────────────
