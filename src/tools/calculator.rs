//! 计算器工具
//!
//! 本地模式：分词 + 递归下降求值，只接受数字、`+ - * / % ^ ( ) . ,` 与白名单函数；
//! HTTP 模式：委托给远端 `/calc` 服务（见 calculator_http）。两种模式实现同一个 CalculatorBackend。

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::core::ToolError;
use crate::tools::registry::string_arg;
use crate::tools::{Tool, ToolName, ToolOutput};

pub const MAX_EXPRESSION_LENGTH: usize = 200;

const FUNCTIONS: &[&str] = &["sqrt", "abs", "round", "floor", "ceil", "min", "max"];

/// 计算结果：expression 为去首尾空白后的原始表达式
#[derive(Debug, Clone, PartialEq)]
pub struct Calculation {
    pub expression: String,
    pub value: f64,
}

impl Calculation {
    /// 整数结果输出为整数
    pub fn result_json(&self) -> Value {
        if is_integral(self.value) {
            json!(self.value as i64)
        } else {
            json!(self.value)
        }
    }

    pub fn to_json(&self) -> Value {
        json!({ "expression": self.expression, "result": self.result_json() })
    }
}

fn is_integral(v: f64) -> bool {
    v.fract() == 0.0 && v.abs() < 1e15
}

pub fn format_number(v: f64) -> String {
    if is_integral(v) {
        format!("{}", v as i64)
    } else {
        let s = format!("{:.10}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    Op(char),
    LParen,
    RParen,
    Comma,
}

fn tokenize(input: &str) -> Result<Vec<Token>, ToolError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' => i += 1,
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text
                    .parse::<f64>()
                    .map_err(|_| ToolError::Validation(format!("Invalid number '{text}'.")))?;
                tokens.push(Token::Num(n));
            }
            'a'..='z' | 'A'..='Z' => {
                let start = i;
                while i < chars.len() && chars[i].is_ascii_alphabetic() {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect::<String>().to_lowercase();
                if !FUNCTIONS.contains(&name.as_str()) {
                    return Err(ToolError::Validation(format!("Unsupported function '{name}'.")));
                }
                tokens.push(Token::Ident(name));
            }
            '+' | '-' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
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
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            other => {
                return Err(ToolError::Validation(format!(
                    "Unsupported character '{other}' in expression."
                )))
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

fn invalid() -> ToolError {
    ToolError::Validation("Invalid arithmetic expression.".to_string())
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let t = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        t
    }

    fn expect(&mut self, token: Token) -> Result<(), ToolError> {
        match self.next() {
            Some(t) if t == token => Ok(()),
            _ => Err(invalid()),
        }
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<f64, ToolError> {
        let mut value = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.term()?;
            value = if op == '+' { value + rhs } else { value - rhs };
        }
        Ok(value)
    }

    // term := unary (('*' | '/' | '%') unary)*
    fn term(&mut self) -> Result<f64, ToolError> {
        let mut value = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek().cloned() {
            self.pos += 1;
            let rhs = self.unary()?;
            value = match op {
                '*' => value * rhs,
                _ if rhs == 0.0 => {
                    return Err(ToolError::Validation(
                        "Division by zero is not allowed.".to_string(),
                    ))
                }
                '/' => value / rhs,
                // 取模向下取整，结果与除数同号
                _ => value - rhs * (value / rhs).floor(),
            };
        }
        Ok(value)
    }

    // unary := ('+' | '-') unary | power
    fn unary(&mut self) -> Result<f64, ToolError> {
        match self.peek() {
            Some(Token::Op('-')) => {
                self.pos += 1;
                Ok(-self.unary()?)
            }
            Some(Token::Op('+')) => {
                self.pos += 1;
                self.unary()
            }
            _ => self.power(),
        }
    }

    // power := primary ('^' unary)?，右结合
    fn power(&mut self) -> Result<f64, ToolError> {
        let base = self.primary()?;
        if let Some(Token::Op('^')) = self.peek() {
            self.pos += 1;
            let exp = self.unary()?;
            return Ok(base.powf(exp));
        }
        Ok(base)
    }

    fn primary(&mut self) -> Result<f64, ToolError> {
        match self.next() {
            Some(Token::Num(n)) => Ok(n),
            Some(Token::LParen) => {
                let v = self.expr()?;
                self.expect(Token::RParen)?;
                Ok(v)
            }
            Some(Token::Ident(name)) => {
                self.expect(Token::LParen)?;
                let mut args = vec![self.expr()?];
                while let Some(Token::Comma) = self.peek() {
                    self.pos += 1;
                    args.push(self.expr()?);
                }
                self.expect(Token::RParen)?;
                apply_function(&name, &args)
            }
            _ => Err(invalid()),
        }
    }
}

fn apply_function(name: &str, args: &[f64]) -> Result<f64, ToolError> {
    let arity = |n: usize| {
        if args.len() == n {
            Ok(())
        } else {
            Err(ToolError::Validation(format!("{name}() takes {n} argument(s).")))
        }
    };
    match name {
        "sqrt" => {
            arity(1)?;
            if args[0] < 0.0 {
                return Err(ToolError::Validation(
                    "Square root of a negative number is not supported.".to_string(),
                ));
            }
            Ok(args[0].sqrt())
        }
        "abs" => arity(1).map(|_| args[0].abs()),
        "floor" => arity(1).map(|_| args[0].floor()),
        "ceil" => arity(1).map(|_| args[0].ceil()),
        "round" => match args {
            [x] => Ok(x.round()),
            [x, digits] => {
                let factor = 10f64.powi(*digits as i32);
                Ok((x * factor).round() / factor)
            }
            _ => Err(ToolError::Validation("round() takes 1 or 2 arguments.".to_string())),
        },
        "min" => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
        "max" => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
        _ => Err(ToolError::Validation(format!("Unsupported function '{name}'."))),
    }
}

/// 本地求值
pub fn evaluate(expression: &str) -> Result<Calculation, ToolError> {
    let cleaned = expression.trim();
    if cleaned.is_empty() {
        return Err(ToolError::Validation("Expression cannot be empty.".to_string()));
    }
    if cleaned.chars().count() > MAX_EXPRESSION_LENGTH {
        return Err(ToolError::Validation(format!(
            "Expression exceeds {MAX_EXPRESSION_LENGTH} characters."
        )));
    }
    let tokens = tokenize(cleaned)?;
    let mut parser = Parser { tokens, pos: 0 };
    let value = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(invalid());
    }
    if !value.is_finite() {
        return Err(ToolError::Validation("Result is not a finite number.".to_string()));
    }
    Ok(Calculation {
        expression: cleaned.to_string(),
        value,
    })
}

/// 计算后端：本地或 HTTP
#[async_trait]
pub trait CalculatorBackend: Send + Sync {
    async fn evaluate(&self, expression: &str) -> Result<Calculation, ToolError>;

    fn mode(&self) -> &'static str;
}

#[derive(Debug, Default, Clone)]
pub struct LocalCalculator;

#[async_trait]
impl CalculatorBackend for LocalCalculator {
    async fn evaluate(&self, expression: &str) -> Result<Calculation, ToolError> {
        evaluate(expression)
    }

    fn mode(&self) -> &'static str {
        "local"
    }
}

/// 计算器工具：args `{"expression": "..."}`（兼容 `query`）
pub struct CalculatorTool {
    backend: Arc<dyn CalculatorBackend>,
}

impl CalculatorTool {
    pub fn new(backend: Arc<dyn CalculatorBackend>) -> Self {
        Self { backend }
    }

    pub fn local() -> Self {
        Self::new(Arc::new(LocalCalculator))
    }
}

#[async_trait]
impl Tool for CalculatorTool {
    fn name(&self) -> ToolName {
        ToolName::Calc
    }

    fn description(&self) -> &str {
        "Evaluate an arithmetic expression. Args: {\"expression\": \"...\"}"
    }

    async fn execute(&self, args: Value) -> Result<ToolOutput, ToolError> {
        let expression = string_arg(&args, &["expression", "query"])
            .ok_or_else(|| ToolError::Validation("Expression cannot be empty.".to_string()))?;
        let calc = self.backend.evaluate(&expression).await?;
        tracing::debug!(mode = self.backend.mode(), expression = %calc.expression, "calculated");
        let message = format!(
            "The result for `{}` is **{}**.",
            calc.expression,
            format_number(calc.value)
        );
        Ok(ToolOutput::new(calc.to_json(), message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(expr: &str) -> f64 {
        evaluate(expr).unwrap().value
    }

    #[test]
    fn test_valid_expressions() {
        assert_eq!(value("1 + 2"), 3.0);
        assert_eq!(value("3*(4+5)"), 27.0);
        assert_eq!(value("12.5 * (3 + 2) / 4"), 15.625);
        assert_eq!(value("2^3"), 8.0);
        assert_eq!(value("2^3^2"), 512.0);
        assert_eq!(value("-5 + 10"), 5.0);
        assert_eq!(value("-2^2"), -4.0);
        assert_eq!(value("7 % 3"), 1.0);
        assert_eq!(value("-7 % 3"), 2.0);
        assert_eq!(value("sqrt(16) + max(1, 5, 3)"), 9.0);
        assert_eq!(value("round(3.14159, 2)"), 3.14);
    }

    #[test]
    fn test_invalid_expressions() {
        for expr in ["", "   ", "2 +* 2", "abc + 1", "1 / (2 - 2)", "1 / 0", "(1 + 2", "1 2", "5 % 0"] {
            assert!(
                matches!(evaluate(expr), Err(ToolError::Validation(_))),
                "expected validation error for {expr:?}"
            );
        }
    }

    #[test]
    fn test_length_limit() {
        let long = "1+".repeat(150);
        let err = evaluate(&long).unwrap_err();
        assert!(err.to_string().contains("200"));
    }

    #[test]
    fn test_integral_result_is_integer() {
        let calc = evaluate("5+10").unwrap();
        assert_eq!(calc.to_json(), json!({"expression": "5+10", "result": 15}));
        let calc = evaluate("1/4").unwrap();
        assert_eq!(calc.to_json()["result"], json!(0.25));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(15.0), "15");
        assert_eq!(format_number(0.1 + 0.2), "0.3");
        assert_eq!(format_number(-2.5), "-2.5");
    }

    #[tokio::test]
    async fn test_tool_message() {
        let out = CalculatorTool::local()
            .execute(json!({"expression": "5+10"}))
            .await
            .unwrap();
        assert_eq!(out.message, "The result for `5+10` is **15**.");
        assert_eq!(out.data["result"], 15);

        let err = CalculatorTool::local().execute(json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "validation_error");
    }
}
