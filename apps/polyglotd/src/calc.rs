//! Integer arithmetic kernel used by the daemon.
//!
//! Each non-blank line is an expression over `+ - * / %` and parentheses.
//! Every line but the last is shown as display output; the last is the
//! return value.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use polyglot_kernel::{KernelCommandHandler, KernelInvocationContext};
use polyglot_protocol::{CommandType, KernelCommand, KernelCommandKind, KernelEventKind, KernelInfo};
use serde_json::json;
use tracing::debug;

pub struct Calculator;

#[async_trait]
impl KernelCommandHandler for Calculator {
    fn supported_commands(&self) -> Vec<CommandType> {
        vec![CommandType::SubmitCode]
    }

    fn describe(&self, info: &mut KernelInfo) {
        info.language_name = Some("Arithmetic".to_owned());
        info.language_version = Some(env!("CARGO_PKG_VERSION").to_owned());
        info.display_name = Some("Calculator".to_owned());
    }

    async fn handle(&self, command: &Arc<KernelCommand>, context: &KernelInvocationContext) -> Result<()> {
        let KernelCommandKind::SubmitCode { code } = command.kind() else {
            bail!("calculator only evaluates code");
        };
        let lines: Vec<&str> = code.lines().map(str::trim).filter(|line| !line.is_empty()).collect();
        let Some((last, rest)) = lines.split_last() else {
            return Ok(());
        };
        for line in rest {
            let value = evaluate(line).with_context(|| format!("in `{line}`"))?;
            context.publish_kind(command, KernelEventKind::display_text(value.to_string()))?;
        }
        let value = evaluate(last).with_context(|| format!("in `{last}`"))?;
        debug!(value, "evaluated");
        context.publish_kind(command, KernelEventKind::return_value(json!(value)))?;
        Ok(())
    }
}

pub fn evaluate(expression: &str) -> Result<i64> {
    let mut parser = Parser {
        tokens: tokenize(expression)?,
        position: 0,
    };
    let value = parser.sum()?;
    if let Some(token) = parser.peek() {
        bail!("unexpected {token:?}");
    }
    Ok(value)
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Token {
    Number(i64),
    Op(char),
    Open,
    Close,
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = expression.char_indices().peekable();
    while let Some((start, ch)) = chars.next() {
        match ch {
            ' ' | '\t' => {}
            '0'..='9' => {
                let mut end = start + 1;
                while let Some(&(index, next)) = chars.peek() {
                    if !next.is_ascii_digit() {
                        break;
                    }
                    end = index + 1;
                    chars.next();
                }
                let number = expression[start..end]
                    .parse()
                    .with_context(|| format!("number too large: {}", &expression[start..end]))?;
                tokens.push(Token::Number(number));
            }
            '+' | '-' | '*' | '/' | '%' => tokens.push(Token::Op(ch)),
            '(' => tokens.push(Token::Open),
            ')' => tokens.push(Token::Close),
            other => bail!("not a number or operator: {other:?}"),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<Token> {
        self.tokens.get(self.position).copied()
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.peek();
        self.position += 1;
        token
    }

    fn sum(&mut self) -> Result<i64> {
        let mut value = self.product()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek() {
            self.position += 1;
            let rhs = self.product()?;
            value = match op {
                '+' => value.checked_add(rhs),
                _ => value.checked_sub(rhs),
            }
            .context("overflow")?;
        }
        Ok(value)
    }

    fn product(&mut self) -> Result<i64> {
        let mut value = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/' | '%'))) = self.peek() {
            self.position += 1;
            let rhs = self.unary()?;
            if op != '*' && rhs == 0 {
                bail!("division by zero");
            }
            value = match op {
                '*' => value.checked_mul(rhs),
                '/' => value.checked_div(rhs),
                _ => value.checked_rem(rhs),
            }
            .context("overflow")?;
        }
        Ok(value)
    }

    fn unary(&mut self) -> Result<i64> {
        match self.next() {
            Some(Token::Op('-')) => self.unary()?.checked_neg().context("overflow"),
            Some(Token::Number(number)) => Ok(number),
            Some(Token::Open) => {
                let value = self.sum()?;
                match self.next() {
                    Some(Token::Close) => Ok(value),
                    _ => bail!("missing `)`"),
                }
            }
            Some(token) => bail!("unexpected {token:?}"),
            None => bail!("unexpected end of expression"),
        }
    }
}

#[cfg(test)]
mod tests {
    use polyglot_kernel::{CompositeKernel, KernelExt, LanguageKernel};

    use super::*;

    #[test]
    fn precedence_and_parentheses() -> Result<()> {
        assert_eq!(evaluate("1+1")?, 2);
        assert_eq!(evaluate("2 + 3 * 4")?, 14);
        assert_eq!(evaluate("(2 + 3) * 4")?, 20);
        assert_eq!(evaluate("-7 % 3")?, -1);
        assert_eq!(evaluate("10 - 4 - 3")?, 3);
        Ok(())
    }

    #[test]
    fn rejects_malformed_input() {
        for bad in ["", "1 +", "(1", "1 2", "x", "4 / 0", "99999999999999999999"] {
            assert!(evaluate(bad).is_err(), "{bad:?} should not evaluate");
        }
    }

    #[tokio::test]
    async fn earlier_lines_display_and_last_line_returns() -> Result<()> {
        let composite = CompositeKernel::builder("local")
            .with_kernel(LanguageKernel::new("calc", Calculator))
            .build()?;
        let result = composite.send(KernelCommand::submit_code("1+1\n\n6*7\n")).await;
        assert_eq!(
            result.event_types(),
            [
                "CodeSubmissionReceived",
                "DisplayedValueProduced",
                "ReturnValueProduced",
                "CommandSucceeded"
            ]
        );
        assert!(matches!(
            result.events()[2].kind(),
            KernelEventKind::ReturnValueProduced { value, .. } if *value == json!(42)
        ));
        Ok(())
    }

    #[tokio::test]
    async fn errors_name_the_failing_line() -> Result<()> {
        let composite = CompositeKernel::builder("local")
            .with_kernel(LanguageKernel::new("calc", Calculator))
            .build()?;
        let result = composite.send(KernelCommand::submit_code("1\n3/0")).await;
        let message = result.failure_message().context("expected failure")?;
        assert_eq!(message, "in `3/0`: division by zero");
        Ok(())
    }
}
