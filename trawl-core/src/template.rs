//! Text templating with `${...}` delimiters.
//!
//! A template body is plain text interleaved with expressions. An
//! expression is a pipeline of stages separated by `|`: the first stage
//! produces a value (a context path such as `.input.asset`, or a literal),
//! each following stage is a function applied with the piped value as its
//! final argument:
//!
//! ```text
//! https://${ .input.asset | trimPrefix "www." }:${ .input.port | default "443" }
//! ```
//!
//! Missing context paths resolve to null and render as the empty string,
//! so templates over absent JSON degrade to empty output instead of
//! failing the whole line.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde_json::Value;
use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unterminated `${{` expression")]
    Unterminated,
    #[error("empty template expression")]
    EmptyExpression,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unknown function `{0}`")]
    UnknownFunction(String),
    #[error("function `{function}` expects {expected} argument(s), got {got}")]
    Arity {
        function: &'static str,
        expected: usize,
        got: usize,
    },
    #[error("function `{function}` expects a numeric argument")]
    BadNumber { function: &'static str },
    #[error("invalid regex `{pattern}`: {source}")]
    Regex {
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid base64 input: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid template expression `{0}`")]
    Syntax(String),
}

/// Renders a template body against a JSON context.
pub fn render(body: &str, ctx: &Value) -> Result<String, TemplateError> {
    let mut out = String::new();
    let mut rest = body;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after.find('}').ok_or(TemplateError::Unterminated)?;
        let value = eval_expr(&after[..end], ctx)?;
        out.push_str(&stringify(&value));
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(out)
}

fn eval_expr(expr: &str, ctx: &Value) -> Result<Value, TemplateError> {
    let mut piped: Option<Value> = None;
    for stage in split_stages(expr) {
        if stage.is_empty() {
            return Err(TemplateError::EmptyExpression);
        }
        let tokens = tokenize(&stage)?;
        piped = Some(eval_stage(&stage, tokens, ctx, piped.take())?);
    }
    piped.ok_or(TemplateError::EmptyExpression)
}

/// Splits a pipeline expression on `|`, ignoring pipes inside string
/// literals.
fn split_stages(expr: &str) -> Vec<String> {
    let mut stages = Vec::new();
    let mut current = String::new();
    let mut in_string = false;
    let mut escaped = false;

    for c in expr.chars() {
        if in_string {
            current.push(c);
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == '"' {
                in_string = false;
            }
        } else if c == '"' {
            in_string = true;
            current.push(c);
        } else if c == '|' {
            stages.push(current.trim().to_string());
            current.clear();
        } else {
            current.push(c);
        }
    }
    stages.push(current.trim().to_string());

    stages
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Path(Vec<String>),
    Str(String),
    Num(f64),
    Ident(String),
}

fn tokenize(stage: &str) -> Result<Vec<Token>, TemplateError> {
    let mut tokens = Vec::new();
    let mut chars = stage.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut s = String::new();
            let mut closed = false;
            while let Some(c) = chars.next() {
                match c {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => {
                        if let Some(escape) = chars.next() {
                            s.push(match escape {
                                'n' => '\n',
                                't' => '\t',
                                other => other,
                            });
                        }
                    }
                    other => s.push(other),
                }
            }
            if !closed {
                return Err(TemplateError::UnterminatedString);
            }
            tokens.push(Token::Str(s));
        } else if c == '.' {
            chars.next();
            let mut segments = Vec::new();
            let mut current = String::new();
            while let Some(&c) = chars.peek() {
                if c == '.' {
                    chars.next();
                    segments.push(std::mem::take(&mut current));
                } else if c.is_whitespace() {
                    break;
                } else {
                    current.push(c);
                    chars.next();
                }
            }
            if !current.is_empty() {
                segments.push(current);
            }
            tokens.push(Token::Path(segments));
        } else {
            let mut word = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                word.push(c);
                chars.next();
            }
            match word.parse::<f64>() {
                Ok(n) => tokens.push(Token::Num(n)),
                Err(_) => tokens.push(Token::Ident(word)),
            }
        }
    }

    Ok(tokens)
}

fn eval_stage(
    stage: &str,
    tokens: Vec<Token>,
    ctx: &Value,
    piped: Option<Value>,
) -> Result<Value, TemplateError> {
    let Some(first) = tokens.first() else {
        return Err(TemplateError::EmptyExpression);
    };

    if let Token::Ident(name) = first {
        let name = name.clone();
        let mut args = tokens
            .into_iter()
            .skip(1)
            .map(|token| eval_operand(stage, token, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(value) = piped {
            args.push(value);
        }
        return call_function(&name, args);
    }

    // a bare value stage: exactly one operand, nothing piped into it
    if tokens.len() != 1 || piped.is_some() {
        return Err(TemplateError::Syntax(stage.to_string()));
    }
    match tokens.into_iter().next() {
        Some(token) => eval_operand(stage, token, ctx),
        None => Err(TemplateError::EmptyExpression),
    }
}

fn eval_operand(stage: &str, token: Token, ctx: &Value) -> Result<Value, TemplateError> {
    match token {
        Token::Path(segments) => Ok(lookup(ctx, &segments)),
        Token::Str(s) => Ok(Value::String(s)),
        Token::Num(n) => Ok(serde_json::json!(n)),
        Token::Ident(_) => Err(TemplateError::Syntax(stage.to_string())),
    }
}

fn lookup(ctx: &Value, segments: &[String]) -> Value {
    let mut current = ctx;
    for segment in segments {
        match current {
            Value::Object(map) => match map.get(segment) {
                Some(value) => current = value,
                None => return Value::Null,
            },
            _ => return Value::Null,
        }
    }
    current.clone()
}

fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

fn call_function(name: &str, args: Vec<Value>) -> Result<Value, TemplateError> {
    match name {
        "upper" => {
            let [s] = take::<1>("upper", args)?;
            Ok(Value::String(stringify(&s).to_uppercase()))
        }
        "lower" => {
            let [s] = take::<1>("lower", args)?;
            Ok(Value::String(stringify(&s).to_lowercase()))
        }
        "trim" => {
            let [s] = take::<1>("trim", args)?;
            Ok(Value::String(stringify(&s).trim().to_string()))
        }
        "trimPrefix" => {
            let [prefix, s] = take::<2>("trimPrefix", args)?;
            let (prefix, s) = (stringify(&prefix), stringify(&s));
            Ok(Value::String(
                s.strip_prefix(&prefix).unwrap_or(&s).to_string(),
            ))
        }
        "trimSuffix" => {
            let [suffix, s] = take::<2>("trimSuffix", args)?;
            let (suffix, s) = (stringify(&suffix), stringify(&s));
            Ok(Value::String(
                s.strip_suffix(&suffix).unwrap_or(&s).to_string(),
            ))
        }
        "replace" => {
            let [old, new, s] = take::<3>("replace", args)?;
            Ok(Value::String(
                stringify(&s).replace(&stringify(&old), &stringify(&new)),
            ))
        }
        "default" => {
            let [fallback, value] = take::<2>("default", args)?;
            let empty = matches!(&value, Value::Null)
                || matches!(&value, Value::String(s) if s.is_empty());
            Ok(if empty { fallback } else { value })
        }
        "trunc" => {
            let [n, s] = take::<2>("trunc", args)?;
            let n = n
                .as_f64()
                .ok_or(TemplateError::BadNumber { function: "trunc" })?
                .max(0.0) as usize;
            Ok(Value::String(stringify(&s).chars().take(n).collect()))
        }
        "b64enc" => {
            let [s] = take::<1>("b64enc", args)?;
            Ok(Value::String(BASE64.encode(stringify(&s))))
        }
        "b64dec" => {
            let [s] = take::<1>("b64dec", args)?;
            let decoded = BASE64.decode(stringify(&s))?;
            Ok(Value::String(
                String::from_utf8_lossy(&decoded).into_owned(),
            ))
        }
        "sha1sum" => {
            let [s] = take::<1>("sha1sum", args)?;
            Ok(Value::String(hex::encode(Sha1::digest(stringify(&s)))))
        }
        "sha256sum" => {
            let [s] = take::<1>("sha256sum", args)?;
            Ok(Value::String(hex::encode(Sha256::digest(stringify(&s)))))
        }
        "regexFind" => {
            let [pattern, s] = take::<2>("regexFind", args)?;
            let pattern = stringify(&pattern);
            let re = compile(&pattern)?;
            let s = stringify(&s);
            Ok(Value::String(
                re.find(&s).map(|m| m.as_str().to_string()).unwrap_or_default(),
            ))
        }
        "regexReplaceAll" => {
            let [pattern, replacement, s] = take::<3>("regexReplaceAll", args)?;
            let pattern = stringify(&pattern);
            let re = compile(&pattern)?;
            Ok(Value::String(
                re.replace_all(&stringify(&s), stringify(&replacement).as_str())
                    .into_owned(),
            ))
        }
        other => Err(TemplateError::UnknownFunction(other.to_string())),
    }
}

fn take<const N: usize>(
    function: &'static str,
    args: Vec<Value>,
) -> Result<[Value; N], TemplateError> {
    let got = args.len();
    args.try_into().map_err(|_| TemplateError::Arity {
        function,
        expected: N,
        got,
    })
}

fn compile(pattern: &str) -> Result<regex::Regex, TemplateError> {
    regex::Regex::new(pattern).map_err(|source| TemplateError::Regex {
        pattern: pattern.to_string(),
        source,
    })
}
