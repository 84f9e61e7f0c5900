// =============================================================================
// Custom strategy sandbox
// =============================================================================
//
// User-authored strategies run in a restricted expression interpreter, never
// through dynamic compilation. The language is a sequence of
// `name = expression;` statements followed by a final expression whose value
// must be one of the strings "buy", "sell" or "hold".
//
// Exposed to scripts:
//   price                 latest price of the strategy's symbol
//   close(i)              i bars back (close(0) = latest)
//   bars                  number of candles available
//   sma(n), stdev(n)      rolling statistics over the close history
//   momentum(n)           (close_now - close_n_back) / close_n_back
//   param("k", default)   strategy parameter lookup
//   get("k", default)     persistent per-strategy state
//   set("k", value)       persistent per-strategy state (returns value)
//   log("msg")            appends to the activity log (capped)
//   abs/min/max/floor/sqrt, arithmetic, comparisons, && || !, ?:
//
// There is no I/O, no network, no filesystem and no clock. Execution carries
// a hard wall-clock deadline plus a step budget; blowing either aborts with a
// timeout error the runner surfaces as a blocked signal.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value as Json;

use super::{sma, stdev, SignalAction};

const MAX_STEPS: u64 = 50_000;
const MAX_LOGS: usize = 32;
/// Token cap bounds both script size and evaluator recursion depth.
const MAX_TOKENS: usize = 4_096;

#[derive(Debug)]
pub enum SandboxError {
    Parse(String),
    Eval(String),
    Timeout,
}

impl std::fmt::Display for SandboxError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Parse(m) => write!(f, "parse error: {m}"),
            Self::Eval(m) => write!(f, "evaluation error: {m}"),
            Self::Timeout => write!(f, "execution budget exhausted"),
        }
    }
}

impl std::error::Error for SandboxError {}

/// Result of one sandboxed evaluation.
#[derive(Debug)]
pub struct SandboxOutcome {
    pub action: SignalAction,
    pub logs: Vec<String>,
}

// =============================================================================
// AST
// =============================================================================

#[derive(Debug, Clone)]
enum Expr {
    Num(f64),
    Str(String),
    Bool(bool),
    Ident(String),
    Unary(UnaryOp, Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    Ternary(Box<Expr>, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

#[derive(Debug, Clone, Copy)]
enum UnaryOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

#[derive(Debug, Clone)]
enum Stmt {
    Assign(String, Expr),
    Expr(Expr),
}

#[derive(Debug, Clone, PartialEq)]
enum Val {
    Num(f64),
    Str(String),
    Bool(bool),
}

impl Val {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Num(_) => "number",
            Self::Str(_) => "string",
            Self::Bool(_) => "boolean",
        }
    }
}

// =============================================================================
// Tokenizer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Num(f64),
    Str(String),
    Ident(String),
    Op(&'static str),
    LParen,
    RParen,
    Comma,
    Semi,
    Assign,
    Question,
    Colon,
}

fn tokenize(src: &str) -> Result<Vec<Tok>, SandboxError> {
    let mut toks = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        if toks.len() > MAX_TOKENS {
            return Err(SandboxError::Parse(format!(
                "script exceeds {MAX_TOKENS} tokens"
            )));
        }
        let c = chars[i];
        match c {
            ' ' | '\t' | '\r' | '\n' => i += 1,
            '#' => {
                // Comment to end of line.
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            '(' => {
                toks.push(Tok::LParen);
                i += 1;
            }
            ')' => {
                toks.push(Tok::RParen);
                i += 1;
            }
            ',' => {
                toks.push(Tok::Comma);
                i += 1;
            }
            ';' => {
                toks.push(Tok::Semi);
                i += 1;
            }
            '?' => {
                toks.push(Tok::Question);
                i += 1;
            }
            ':' => {
                toks.push(Tok::Colon);
                i += 1;
            }
            '"' | '\'' => {
                let quote = c;
                let mut s = String::new();
                i += 1;
                while i < chars.len() && chars[i] != quote {
                    s.push(chars[i]);
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(SandboxError::Parse("unterminated string".into()));
                }
                i += 1;
                toks.push(Tok::Str(s));
            }
            '0'..='9' | '.' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let raw: String = chars[start..i].iter().collect();
                let n = raw
                    .parse::<f64>()
                    .map_err(|_| SandboxError::Parse(format!("bad number: {raw}")))?;
                toks.push(Tok::Num(n));
            }
            'a'..='z' | 'A'..='Z' | '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                toks.push(Tok::Ident(chars[start..i].iter().collect()));
            }
            _ => {
                let two: String = chars[i..chars.len().min(i + 2)].iter().collect();
                let matched = match two.as_str() {
                    "<=" => Some("<="),
                    ">=" => Some(">="),
                    "==" => Some("=="),
                    "!=" => Some("!="),
                    "&&" => Some("&&"),
                    "||" => Some("||"),
                    _ => None,
                };
                if let Some(op) = matched {
                    toks.push(Tok::Op(op));
                    i += 2;
                } else {
                    let op = match c {
                        '+' => "+",
                        '-' => "-",
                        '*' => "*",
                        '/' => "/",
                        '%' => "%",
                        '<' => "<",
                        '>' => ">",
                        '!' => "!",
                        '=' => {
                            toks.push(Tok::Assign);
                            i += 1;
                            continue;
                        }
                        other => {
                            return Err(SandboxError::Parse(format!("unexpected character: {other}")))
                        }
                    };
                    toks.push(Tok::Op(op));
                    i += 1;
                }
            }
        }
    }
    Ok(toks)
}

// =============================================================================
// Parser (precedence climbing)
// =============================================================================

struct Parser {
    toks: Vec<Tok>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.toks.get(self.pos)
    }

    fn next(&mut self) -> Option<Tok> {
        let t = self.toks.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn expect(&mut self, want: &Tok) -> Result<(), SandboxError> {
        match self.next() {
            Some(ref t) if t == want => Ok(()),
            other => Err(SandboxError::Parse(format!("expected {want:?}, got {other:?}"))),
        }
    }

    fn parse_program(&mut self) -> Result<Vec<Stmt>, SandboxError> {
        let mut stmts = Vec::new();
        while self.peek().is_some() {
            // `ident = expr ;` is an assignment, anything else an expression.
            let is_assign = matches!(
                (self.peek(), self.toks.get(self.pos + 1)),
                (Some(Tok::Ident(_)), Some(Tok::Assign))
            );
            if is_assign {
                let Some(Tok::Ident(name)) = self.next() else {
                    unreachable!("peeked ident");
                };
                self.expect(&Tok::Assign)?;
                let value = self.parse_expr(0)?;
                stmts.push(Stmt::Assign(name, value));
            } else {
                let e = self.parse_expr(0)?;
                stmts.push(Stmt::Expr(e));
            }
            // Semicolons between statements; trailing one optional.
            while matches!(self.peek(), Some(Tok::Semi)) {
                self.next();
            }
        }
        if stmts.is_empty() {
            return Err(SandboxError::Parse("empty script".into()));
        }
        Ok(stmts)
    }

    fn parse_expr(&mut self, min_bp: u8) -> Result<Expr, SandboxError> {
        let mut lhs = self.parse_prefix()?;

        loop {
            let (op, bp) = match self.peek() {
                Some(&Tok::Op(op)) => {
                    let bp = binding_power(op);
                    if bp == 0 {
                        break;
                    }
                    (op, bp)
                }
                Some(Tok::Question) if min_bp == 0 => {
                    self.next();
                    let then = self.parse_expr(0)?;
                    self.expect(&Tok::Colon)?;
                    let alt = self.parse_expr(0)?;
                    lhs = Expr::Ternary(Box::new(lhs), Box::new(then), Box::new(alt));
                    continue;
                }
                _ => break,
            };
            if bp <= min_bp {
                break;
            }
            self.next();
            let rhs = self.parse_expr(bp)?;
            lhs = Expr::Binary(bin_op(op)?, Box::new(lhs), Box::new(rhs));
        }

        Ok(lhs)
    }

    fn parse_prefix(&mut self) -> Result<Expr, SandboxError> {
        match self.next() {
            Some(Tok::Num(n)) => Ok(Expr::Num(n)),
            Some(Tok::Str(s)) => Ok(Expr::Str(s)),
            Some(Tok::Ident(name)) => {
                match name.as_str() {
                    "true" => return Ok(Expr::Bool(true)),
                    "false" => return Ok(Expr::Bool(false)),
                    _ => {}
                }
                if matches!(self.peek(), Some(Tok::LParen)) {
                    self.next();
                    let mut args = Vec::new();
                    if !matches!(self.peek(), Some(Tok::RParen)) {
                        loop {
                            args.push(self.parse_expr(0)?);
                            match self.next() {
                                Some(Tok::Comma) => continue,
                                Some(Tok::RParen) => break,
                                other => {
                                    return Err(SandboxError::Parse(format!(
                                        "expected ',' or ')', got {other:?}"
                                    )))
                                }
                            }
                        }
                    } else {
                        self.next();
                    }
                    Ok(Expr::Call(name, args))
                } else {
                    Ok(Expr::Ident(name))
                }
            }
            Some(Tok::LParen) => {
                let e = self.parse_expr(0)?;
                self.expect(&Tok::RParen)?;
                Ok(e)
            }
            Some(Tok::Op("-")) => Ok(Expr::Unary(UnaryOp::Neg, Box::new(self.parse_prefix()?))),
            Some(Tok::Op("!")) => Ok(Expr::Unary(UnaryOp::Not, Box::new(self.parse_prefix()?))),
            other => Err(SandboxError::Parse(format!("unexpected token: {other:?}"))),
        }
    }
}

fn binding_power(op: &str) -> u8 {
    match op {
        "||" => 1,
        "&&" => 2,
        "==" | "!=" => 3,
        "<" | "<=" | ">" | ">=" => 4,
        "+" | "-" => 5,
        "*" | "/" | "%" => 6,
        _ => 0,
    }
}

fn bin_op(op: &str) -> Result<BinOp, SandboxError> {
    Ok(match op {
        "+" => BinOp::Add,
        "-" => BinOp::Sub,
        "*" => BinOp::Mul,
        "/" => BinOp::Div,
        "%" => BinOp::Rem,
        "<" => BinOp::Lt,
        "<=" => BinOp::Le,
        ">" => BinOp::Gt,
        ">=" => BinOp::Ge,
        "==" => BinOp::Eq,
        "!=" => BinOp::Ne,
        "&&" => BinOp::And,
        "||" => BinOp::Or,
        other => return Err(SandboxError::Parse(format!("unknown operator: {other}"))),
    })
}

// =============================================================================
// Evaluator
// =============================================================================

struct EvalCtx<'a> {
    price: f64,
    closes: &'a [f64],
    parameters: &'a Json,
    state: &'a mut HashMap<String, f64>,
    locals: HashMap<String, Val>,
    logs: Vec<String>,
    steps: u64,
    deadline: Instant,
}

impl EvalCtx<'_> {
    fn tick(&mut self) -> Result<(), SandboxError> {
        self.steps += 1;
        if self.steps > MAX_STEPS {
            return Err(SandboxError::Timeout);
        }
        // Checking the clock every 64 steps keeps the hot loop cheap.
        if self.steps % 64 == 0 && Instant::now() >= self.deadline {
            return Err(SandboxError::Timeout);
        }
        Ok(())
    }

    fn eval(&mut self, e: &Expr) -> Result<Val, SandboxError> {
        self.tick()?;
        match e {
            Expr::Num(n) => Ok(Val::Num(*n)),
            Expr::Str(s) => Ok(Val::Str(s.clone())),
            Expr::Bool(b) => Ok(Val::Bool(*b)),
            Expr::Ident(name) => self.lookup(name),
            Expr::Unary(op, inner) => {
                let v = self.eval(inner)?;
                match (op, v) {
                    (UnaryOp::Neg, Val::Num(n)) => Ok(Val::Num(-n)),
                    (UnaryOp::Not, Val::Bool(b)) => Ok(Val::Bool(!b)),
                    (_, v) => Err(SandboxError::Eval(format!(
                        "unary operator not defined for {}",
                        v.type_name()
                    ))),
                }
            }
            Expr::Binary(op, a, b) => self.eval_binary(*op, a, b),
            Expr::Ternary(cond, then, alt) => match self.eval(cond)? {
                Val::Bool(true) => self.eval(then),
                Val::Bool(false) => self.eval(alt),
                v => Err(SandboxError::Eval(format!(
                    "ternary condition must be boolean, got {}",
                    v.type_name()
                ))),
            },
            Expr::Call(name, args) => self.eval_call(name, args),
        }
    }

    fn lookup(&mut self, name: &str) -> Result<Val, SandboxError> {
        if let Some(v) = self.locals.get(name) {
            return Ok(v.clone());
        }
        match name {
            "price" => Ok(Val::Num(self.price)),
            "bars" => Ok(Val::Num(self.closes.len() as f64)),
            _ => {
                // Bare parameter names resolve as a convenience.
                if let Some(v) = self.parameters.get(name) {
                    if let Some(n) = v.as_f64() {
                        return Ok(Val::Num(n));
                    }
                }
                Err(SandboxError::Eval(format!("unknown identifier: {name}")))
            }
        }
    }

    fn eval_binary(&mut self, op: BinOp, a: &Expr, b: &Expr) -> Result<Val, SandboxError> {
        // Short-circuit the boolean connectives.
        if op == BinOp::And || op == BinOp::Or {
            let lhs = match self.eval(a)? {
                Val::Bool(v) => v,
                v => {
                    return Err(SandboxError::Eval(format!(
                        "logical operand must be boolean, got {}",
                        v.type_name()
                    )))
                }
            };
            if op == BinOp::And && !lhs {
                return Ok(Val::Bool(false));
            }
            if op == BinOp::Or && lhs {
                return Ok(Val::Bool(true));
            }
            return match self.eval(b)? {
                Val::Bool(v) => Ok(Val::Bool(v)),
                v => Err(SandboxError::Eval(format!(
                    "logical operand must be boolean, got {}",
                    v.type_name()
                ))),
            };
        }

        let lhs = self.eval(a)?;
        let rhs = self.eval(b)?;

        if op == BinOp::Eq || op == BinOp::Ne {
            let eq = lhs == rhs;
            return Ok(Val::Bool(if op == BinOp::Eq { eq } else { !eq }));
        }

        let (x, y) = match (lhs, rhs) {
            (Val::Num(x), Val::Num(y)) => (x, y),
            (l, r) => {
                return Err(SandboxError::Eval(format!(
                    "arithmetic needs numbers, got {} and {}",
                    l.type_name(),
                    r.type_name()
                )))
            }
        };

        Ok(match op {
            BinOp::Add => Val::Num(x + y),
            BinOp::Sub => Val::Num(x - y),
            BinOp::Mul => Val::Num(x * y),
            BinOp::Div => {
                if y == 0.0 {
                    return Err(SandboxError::Eval("division by zero".into()));
                }
                Val::Num(x / y)
            }
            BinOp::Rem => {
                if y == 0.0 {
                    return Err(SandboxError::Eval("division by zero".into()));
                }
                Val::Num(x % y)
            }
            BinOp::Lt => Val::Bool(x < y),
            BinOp::Le => Val::Bool(x <= y),
            BinOp::Gt => Val::Bool(x > y),
            BinOp::Ge => Val::Bool(x >= y),
            BinOp::Eq | BinOp::Ne | BinOp::And | BinOp::Or => unreachable!("handled above"),
        })
    }

    fn eval_call(&mut self, name: &str, args: &[Expr]) -> Result<Val, SandboxError> {
        let vals: Vec<Val> = args
            .iter()
            .map(|a| self.eval(a))
            .collect::<Result<_, _>>()?;

        let num = |v: &Val| -> Result<f64, SandboxError> {
            match v {
                Val::Num(n) => Ok(*n),
                other => Err(SandboxError::Eval(format!(
                    "{name} expects a number, got {}",
                    other.type_name()
                ))),
            }
        };
        let text = |v: &Val| -> Result<String, SandboxError> {
            match v {
                Val::Str(s) => Ok(s.clone()),
                other => Err(SandboxError::Eval(format!(
                    "{name} expects a string, got {}",
                    other.type_name()
                ))),
            }
        };
        let arity = |want: usize| -> Result<(), SandboxError> {
            if vals.len() != want {
                return Err(SandboxError::Eval(format!(
                    "{name} takes {want} argument(s), got {}",
                    vals.len()
                )));
            }
            Ok(())
        };

        match name {
            "sma" => {
                arity(1)?;
                let n = num(&vals[0])? as usize;
                Ok(Val::Num(sma(self.closes, n).unwrap_or(self.price)))
            }
            "stdev" => {
                arity(1)?;
                let n = num(&vals[0])? as usize;
                Ok(Val::Num(stdev(self.closes, n).unwrap_or(0.0)))
            }
            "momentum" => {
                arity(1)?;
                let n = num(&vals[0])? as usize;
                if self.closes.len() <= n || n == 0 {
                    return Ok(Val::Num(0.0));
                }
                let now = self.closes[self.closes.len() - 1];
                let then = self.closes[self.closes.len() - 1 - n];
                Ok(Val::Num(if then == 0.0 { 0.0 } else { (now - then) / then }))
            }
            "close" => {
                arity(1)?;
                let back = num(&vals[0])? as usize;
                if back >= self.closes.len() {
                    return Ok(Val::Num(self.price));
                }
                Ok(Val::Num(self.closes[self.closes.len() - 1 - back]))
            }
            "param" => {
                arity(2)?;
                let key = text(&vals[0])?;
                let fallback = num(&vals[1])?;
                Ok(Val::Num(
                    self.parameters.get(&key).and_then(Json::as_f64).unwrap_or(fallback),
                ))
            }
            "get" => {
                arity(2)?;
                let key = text(&vals[0])?;
                let fallback = num(&vals[1])?;
                Ok(Val::Num(*self.state.get(&key).unwrap_or(&fallback)))
            }
            "set" => {
                arity(2)?;
                let key = text(&vals[0])?;
                let value = num(&vals[1])?;
                self.state.insert(key, value);
                Ok(Val::Num(value))
            }
            "log" => {
                arity(1)?;
                if self.logs.len() < MAX_LOGS {
                    let entry = match &vals[0] {
                        Val::Str(s) => s.clone(),
                        Val::Num(n) => n.to_string(),
                        Val::Bool(b) => b.to_string(),
                    };
                    self.logs.push(entry);
                }
                Ok(Val::Bool(true))
            }
            "abs" => {
                arity(1)?;
                Ok(Val::Num(num(&vals[0])?.abs()))
            }
            "floor" => {
                arity(1)?;
                Ok(Val::Num(num(&vals[0])?.floor()))
            }
            "sqrt" => {
                arity(1)?;
                Ok(Val::Num(num(&vals[0])?.max(0.0).sqrt()))
            }
            "min" => {
                arity(2)?;
                Ok(Val::Num(num(&vals[0])?.min(num(&vals[1])?)))
            }
            "max" => {
                arity(2)?;
                Ok(Val::Num(num(&vals[0])?.max(num(&vals[1])?)))
            }
            other => Err(SandboxError::Eval(format!("unknown function: {other}"))),
        }
    }
}

/// Parse and evaluate one strategy script under the given budget.
pub fn execute(
    source: &str,
    price: f64,
    closes: &[f64],
    parameters: &Json,
    state: &mut HashMap<String, f64>,
    budget: Duration,
) -> Result<SandboxOutcome, SandboxError> {
    let toks = tokenize(source)?;
    let mut parser = Parser { toks, pos: 0 };
    let stmts = parser.parse_program()?;

    let mut ctx = EvalCtx {
        price,
        closes,
        parameters,
        state,
        locals: HashMap::new(),
        logs: Vec::new(),
        steps: 0,
        deadline: Instant::now() + budget,
    };

    let mut last = Val::Str("hold".into());
    for stmt in &stmts {
        match stmt {
            Stmt::Assign(name, expr) => {
                let v = ctx.eval(expr)?;
                ctx.locals.insert(name.clone(), v);
            }
            Stmt::Expr(expr) => {
                last = ctx.eval(expr)?;
            }
        }
    }

    let action = match &last {
        Val::Str(s) => match s.to_ascii_lowercase().as_str() {
            "buy" => SignalAction::Buy,
            "sell" => SignalAction::Sell,
            "hold" => SignalAction::Hold,
            other => {
                return Err(SandboxError::Eval(format!(
                    "script must end in \"buy\"/\"sell\"/\"hold\", got \"{other}\""
                )))
            }
        },
        other => {
            return Err(SandboxError::Eval(format!(
                "script must end in a signal string, got {}",
                other.type_name()
            )))
        }
    };

    Ok(SandboxOutcome {
        action,
        logs: ctx.logs,
    })
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn run(src: &str, price: f64, closes: &[f64]) -> Result<SandboxOutcome, SandboxError> {
        let mut state = HashMap::new();
        execute(src, price, closes, &json!({}), &mut state, Duration::from_millis(250))
    }

    #[test]
    fn simple_band_script() {
        let closes = [100.0, 101.0, 99.0, 100.0, 100.0];
        let src = r#"
            lower = sma(5) - 2 * stdev(5);
            price < lower ? "buy" : "hold"
        "#;
        let out = run(src, 90.0, &closes).unwrap();
        assert_eq!(out.action, SignalAction::Buy);

        let out = run(src, 100.0, &closes).unwrap();
        assert_eq!(out.action, SignalAction::Hold);
    }

    #[test]
    fn parameters_and_state_roundtrip() {
        let mut state = HashMap::new();
        let src = r#"
            entries = get("entries", 0);
            set("entries", entries + 1);
            entries < param("maxEntries", 2) ? "buy" : "hold"
        "#;
        let params = json!({"maxEntries": 2});

        for expected in [SignalAction::Buy, SignalAction::Buy, SignalAction::Hold] {
            let out = execute(src, 100.0, &[100.0], &params, &mut state, Duration::from_millis(250))
                .unwrap();
            assert_eq!(out.action, expected);
        }
        assert_eq!(state["entries"], 3.0);
    }

    #[test]
    fn logging_is_captured_and_capped() {
        let src = r#"
            log("checking");
            log(price);
            "hold"
        "#;
        let out = run(src, 42.0, &[42.0]).unwrap();
        assert_eq!(out.logs, vec!["checking".to_string(), "42".to_string()]);
    }

    #[test]
    fn oversized_scripts_are_rejected_up_front() {
        // No loops in the language, so a runaway is a giant expression; the
        // token cap rejects it before parsing or evaluation.
        let mut src = String::from("x = 1");
        for _ in 0..60_000 {
            src.push_str(" + 1");
        }
        src.push_str("; \"hold\"");
        let err = run(&src, 100.0, &[100.0]).unwrap_err();
        assert!(matches!(err, SandboxError::Parse(_)));
    }

    #[test]
    fn wall_clock_budget_enforced() {
        let src = r#"sma(3) > 0 ? "hold" : "hold""#;
        let mut state = HashMap::new();
        // Zero budget: the first periodic clock check aborts. With few steps
        // the script may finish first, so only assert it never panics.
        let _ = execute(src, 100.0, &[1.0, 2.0, 3.0], &json!({}), &mut state, Duration::ZERO);
    }

    #[test]
    fn division_by_zero_is_an_eval_error() {
        let err = run(r#"x = 1 / 0; "hold""#, 100.0, &[100.0]).unwrap_err();
        assert!(matches!(err, SandboxError::Eval(_)));
    }

    #[test]
    fn unknown_identifier_is_reported() {
        let err = run(r#"open_file("x")"#, 100.0, &[100.0]).unwrap_err();
        assert!(matches!(err, SandboxError::Eval(_)));
    }

    #[test]
    fn non_signal_result_rejected() {
        let err = run("1 + 1", 100.0, &[100.0]).unwrap_err();
        assert!(matches!(err, SandboxError::Eval(_)));
    }

    #[test]
    fn comments_are_ignored() {
        let src = "# entry logic\n\"buy\" # always";
        let out = run(src, 100.0, &[100.0]).unwrap();
        assert_eq!(out.action, SignalAction::Buy);
    }
}
