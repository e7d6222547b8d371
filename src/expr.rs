//! Arithmetic macro expressions: `${threads * 2}`, `${pow(2, order) - 1}`.
//!
//! A deliberately small language — infix arithmetic over context keys and
//! literals with a whitelisted function set — parsed with a shunting-yard
//! pass instead of handing strings to an interpreter.

use crate::error::{Result, SweepError};
use crate::util::fmt_float;
use lazy_static::lazy_static;
use regex_lite::Regex;

lazy_static! {
    static ref RE_IDENT: Regex = Regex::new(r"^[a-zA-Z][a-zA-Z0-9_.]*$").unwrap();
}

/// A value flowing through the evaluator: numbers compute, strings
/// concatenate under `+` and pass through `str`.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Num(f64),
    Str(String),
}

impl ExprValue {
    /// Promote a string that parses as a number, the way context values
    /// enter the evaluator.
    pub fn from_scalar(s: &str) -> ExprValue {
        match s.trim().parse::<f64>() {
            Ok(n) => ExprValue::Num(n),
            Err(_) => ExprValue::Str(s.to_string()),
        }
    }

    pub fn render(&self) -> String {
        match self {
            ExprValue::Num(n) => fmt_float(*n),
            ExprValue::Str(s) => s.clone(),
        }
    }

    fn as_num(&self) -> Result<f64> {
        match self {
            ExprValue::Num(n) => Ok(*n),
            ExprValue::Str(s) => s
                .trim()
                .parse()
                .map_err(|_| SweepError::spec(format!("'{}' is not numeric", s))),
        }
    }
}

/// True when the expression is a bare dotted key rather than arithmetic.
pub fn is_identifier(expr: &str) -> bool {
    RE_IDENT.is_match(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Str(String),
    Ident(String),
    Func(String),
    Op(char),
    Neg,
    LParen,
    RParen,
    Comma,
}

const FUNCTIONS: &[&str] = &["str", "int", "float", "pow", "round"];

fn precedence(token: &Token) -> u8 {
    match token {
        Token::Op('^') => 4,
        Token::Op('*') | Token::Op('/') | Token::Op('%') => 3,
        Token::Op('+') | Token::Op('-') | Token::Neg => 2,
        _ => 0,
    }
}

fn right_assoc(token: &Token) -> bool {
    matches!(token, Token::Op('^') | Token::Neg)
}

fn tokenize(expr: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = expr.chars().collect();
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
                let num = text
                    .parse()
                    .map_err(|_| SweepError::spec(format!("Bad number '{}'", text)))?;
                tokens.push(Token::Num(num));
            }
            '\'' | '"' => {
                let quote = c;
                i += 1;
                let start = i;
                while i < chars.len() && chars[i] != quote {
                    i += 1;
                }
                if i == chars.len() {
                    return Err(SweepError::spec(format!("Unterminated string in '{}'", expr)));
                }
                tokens.push(Token::Str(chars[start..i].iter().collect()));
                i += 1;
            }
            'a'..='z' | 'A'..='Z' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                let mut j = i;
                while j < chars.len() && chars[j] == ' ' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == '(' {
                    if !FUNCTIONS.contains(&name.as_str()) {
                        return Err(SweepError::spec(format!("Unknown function '{}'", name)));
                    }
                    tokens.push(Token::Func(name));
                } else {
                    tokens.push(Token::Ident(name));
                }
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
            '+' | '*' | '/' | '%' | '^' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '-' => {
                // Unary when nothing complete precedes it
                let unary = matches!(
                    tokens.last(),
                    None | Some(Token::Op(_))
                        | Some(Token::Neg)
                        | Some(Token::LParen)
                        | Some(Token::Comma)
                );
                tokens.push(if unary { Token::Neg } else { Token::Op('-') });
                i += 1;
            }
            other => {
                return Err(SweepError::spec(format!(
                    "Unexpected character '{}' in expression '{}'",
                    other, expr
                )));
            }
        }
    }
    Ok(tokens)
}

/// Infix to postfix.
fn to_rpn(tokens: Vec<Token>) -> Result<Vec<Token>> {
    let mut output = Vec::new();
    let mut stack: Vec<Token> = Vec::new();
    for token in tokens {
        match token {
            Token::Num(_) | Token::Str(_) | Token::Ident(_) => output.push(token),
            Token::Func(_) => stack.push(token),
            Token::Comma => {
                while let Some(top) = stack.last() {
                    if matches!(top, Token::LParen) {
                        break;
                    }
                    output.push(stack.pop().unwrap());
                }
                if stack.is_empty() {
                    return Err(SweepError::spec("Misplaced ',' in expression".to_string()));
                }
            }
            Token::Op(_) | Token::Neg => {
                while let Some(top) = stack.last() {
                    let is_op = matches!(top, Token::Op(_) | Token::Neg);
                    if !is_op {
                        break;
                    }
                    let pt = precedence(top);
                    let pc = precedence(&token);
                    if pt > pc || (pt == pc && !right_assoc(&token)) {
                        output.push(stack.pop().unwrap());
                    } else {
                        break;
                    }
                }
                stack.push(token);
            }
            Token::LParen => stack.push(token),
            Token::RParen => {
                loop {
                    match stack.pop() {
                        Some(Token::LParen) => break,
                        Some(other) => output.push(other),
                        None => {
                            return Err(SweepError::spec("Unbalanced ')' in expression".to_string()))
                        }
                    }
                }
                if matches!(stack.last(), Some(Token::Func(_))) {
                    output.push(stack.pop().unwrap());
                }
            }
        }
    }
    while let Some(top) = stack.pop() {
        if matches!(top, Token::LParen) {
            return Err(SweepError::spec("Unbalanced '(' in expression".to_string()));
        }
        output.push(top);
    }
    Ok(output)
}

fn apply_op(op: char, a: ExprValue, b: ExprValue) -> Result<ExprValue> {
    if op == '+' {
        if let (ExprValue::Str(_), _) | (_, ExprValue::Str(_)) = (&a, &b) {
            return Ok(ExprValue::Str(format!("{}{}", a.render(), b.render())));
        }
    }
    let (a, b) = (a.as_num()?, b.as_num()?);
    let v = match op {
        '+' => a + b,
        '-' => a - b,
        '*' => a * b,
        '/' => a / b,
        '%' => a % b,
        '^' => a.powf(b),
        _ => return Err(SweepError::spec(format!("Unknown operator '{}'", op))),
    };
    Ok(ExprValue::Num(v))
}

fn apply_func(name: &str, stack: &mut Vec<ExprValue>) -> Result<ExprValue> {
    let mut pop = || {
        stack
            .pop()
            .ok_or_else(|| SweepError::spec(format!("Missing argument to {}()", name)))
    };
    match name {
        "str" => Ok(ExprValue::Str(pop()?.render())),
        "int" => Ok(ExprValue::Num(pop()?.as_num()?.trunc())),
        "float" => Ok(ExprValue::Num(pop()?.as_num()?)),
        "round" => Ok(ExprValue::Num(pop()?.as_num()?.round())),
        "pow" => {
            let b = pop()?.as_num()?;
            let a = pop()?.as_num()?;
            Ok(ExprValue::Num(a.powf(b)))
        }
        other => Err(SweepError::spec(format!("Unknown function '{}'", other))),
    }
}

/// Evaluate an expression, resolving identifiers through `lookup`. An
/// identifier `lookup` cannot resolve fails the evaluation; the macro
/// engine then leaves the original `${...}` text in place.
pub fn eval(expr: &str, lookup: &dyn Fn(&str) -> Option<ExprValue>) -> Result<ExprValue> {
    let rpn = to_rpn(tokenize(expr)?)?;
    let mut stack: Vec<ExprValue> = Vec::new();
    for token in rpn {
        match token {
            Token::Num(n) => stack.push(ExprValue::Num(n)),
            Token::Str(s) => stack.push(ExprValue::Str(s)),
            Token::Ident(name) => {
                let value = lookup(&name)
                    .ok_or_else(|| SweepError::spec(format!("Unresolved variable '{}'", name)))?;
                stack.push(value);
            }
            Token::Neg => {
                let v = stack
                    .pop()
                    .ok_or_else(|| SweepError::spec("Missing operand".to_string()))?
                    .as_num()?;
                stack.push(ExprValue::Num(-v));
            }
            Token::Op(op) => {
                let b = stack
                    .pop()
                    .ok_or_else(|| SweepError::spec("Missing operand".to_string()))?;
                let a = stack
                    .pop()
                    .ok_or_else(|| SweepError::spec("Missing operand".to_string()))?;
                stack.push(apply_op(op, a, b)?);
            }
            Token::Func(name) => {
                let v = apply_func(&name, &mut stack)?;
                stack.push(v);
            }
            Token::LParen | Token::RParen | Token::Comma => {
                return Err(SweepError::spec(format!("Malformed expression '{}'", expr)))
            }
        }
    }
    if stack.len() != 1 {
        return Err(SweepError::spec(format!("Malformed expression '{}'", expr)));
    }
    Ok(stack.pop().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn ctx(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn eval_with(expr: &str, vars: &HashMap<String, String>) -> Result<ExprValue> {
        eval(expr, &|name| {
            vars.get(name).map(|v| ExprValue::from_scalar(v))
        })
    }

    #[test]
    fn arithmetic() {
        let vars = ctx(&[("n", "4"), ("block", "1024")]);
        assert_eq!(eval_with("n * 2", &vars).unwrap(), ExprValue::Num(8.0));
        assert_eq!(
            eval_with("n * block + 1", &vars).unwrap(),
            ExprValue::Num(4097.0)
        );
        assert_eq!(eval_with("(n + 2) % 5", &vars).unwrap(), ExprValue::Num(1.0));
        assert_eq!(eval_with("2 ^ n", &vars).unwrap(), ExprValue::Num(16.0));
        assert_eq!(eval_with("-n + 6", &vars).unwrap(), ExprValue::Num(2.0));
    }

    #[test]
    fn functions() {
        let vars = ctx(&[("x", "2.7")]);
        assert_eq!(eval_with("round(x)", &vars).unwrap(), ExprValue::Num(3.0));
        assert_eq!(eval_with("int(x)", &vars).unwrap(), ExprValue::Num(2.0));
        assert_eq!(eval_with("pow(2, 10)", &vars).unwrap(), ExprValue::Num(1024.0));
        assert_eq!(
            eval_with("str(x) + 'b'", &vars).unwrap(),
            ExprValue::Str("2.7b".to_string())
        );
    }

    #[test]
    fn rejects_unknown_functions() {
        let vars = ctx(&[]);
        assert!(eval_with("exec('rm -rf /')", &vars).is_err());
        assert!(eval_with("__import__('os')", &vars).is_err());
    }

    #[test]
    fn unresolved_identifier_fails() {
        let vars = ctx(&[]);
        assert!(eval_with("missing + 1", &vars).is_err());
    }

    #[test]
    fn identifier_shape() {
        assert!(is_identifier("node.host"));
        assert!(is_identifier("curr.n"));
        assert!(!is_identifier("n * 2"));
        assert!(!is_identifier("1abc"));
    }
}
