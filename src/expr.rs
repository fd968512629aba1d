//! Boolean predicate expressions over a [`StateSnapshot`].
//!
//! Rule and state-definition conditions are written as short strings in the
//! configuration document, e.g.
//!
//! ```text
//! analog.chamber_pressure.volts < threshold.chamber_medium_vacuum
//! digital.water_flow && !relay.mains_power
//! state == "vented" || state == "unknown"
//! ```
//!
//! They are parsed once at load time into an AST and evaluated as pure
//! functions of one snapshot, so a decision never interprets text and never
//! observes a value that changed mid-evaluation.

use std::fmt;

use crate::channel::StateSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Lt => "<",
            CmpOp::Le => "<=",
            CmpOp::Gt => ">",
            CmpOp::Ge => ">=",
            CmpOp::Eq => "==",
            CmpOp::Ne => "!=",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Bool(bool),
    Num(f64),
    Str(String),
    /// Commanded value of a relay, by role.
    Relay(String),
    /// Board-confirmed value of a relay, by role.
    RelayConfirmed(String),
    /// Polarity-normalized digital interlock, by role.
    Digital(String),
    /// Analog channel in volts, by role.
    AnalogVolts(String),
    /// Analog channel in engineering units, by role.
    AnalogValue(String),
    /// Named entry of the threshold table.
    Threshold(String),
    /// Currently detected system state name.
    DetectedState,
    /// Device link health.
    Connected,
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Cmp(Box<Expr>, CmpOp, Box<Expr>),
}

/// Everything an expression may read. Thresholds come from configuration;
/// `detected_state` is computed by the rule engine before evaluating rules
/// (state definitions themselves are evaluated with it empty and are
/// forbidden from referencing it).
pub struct EvalEnv<'a> {
    pub snapshot: &'a StateSnapshot,
    pub thresholds: &'a dyn Fn(&str) -> Option<f64>,
    pub detected_state: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
enum Value {
    Bool(bool),
    Num(f64),
    Str(String),
}

impl Expr {
    /// Evaluate to a boolean. Channels that are missing from the snapshot
    /// evaluate as unsafe (`false` / `0.0`): configuration validation makes
    /// that unreachable, and failing closed is the right default if it ever
    /// is not.
    pub fn eval(&self, env: &EvalEnv<'_>) -> bool {
        match self.value(env) {
            Value::Bool(b) => b,
            Value::Num(n) => n != 0.0,
            Value::Str(s) => !s.is_empty(),
        }
    }

    fn value(&self, env: &EvalEnv<'_>) -> Value {
        match self {
            Expr::Bool(b) => Value::Bool(*b),
            Expr::Num(n) => Value::Num(*n),
            Expr::Str(s) => Value::Str(s.clone()),
            Expr::Relay(role) => {
                Value::Bool(env.snapshot.relay(role).map_or(false, |r| r.commanded))
            }
            Expr::RelayConfirmed(role) => {
                Value::Bool(env.snapshot.relay(role).map_or(false, |r| r.confirmed))
            }
            Expr::Digital(role) => {
                Value::Bool(env.snapshot.digital(role).map_or(false, |d| d.safe))
            }
            Expr::AnalogVolts(role) => {
                Value::Num(env.snapshot.analog(role).map_or(0.0, |a| a.volts()))
            }
            Expr::AnalogValue(role) => {
                Value::Num(env.snapshot.analog(role).map_or(0.0, |a| a.engineering()))
            }
            Expr::Threshold(name) => Value::Num((env.thresholds)(name).unwrap_or(0.0)),
            Expr::DetectedState => Value::Str(env.detected_state.to_string()),
            Expr::Connected => Value::Bool(env.snapshot.connected),
            Expr::Not(e) => Value::Bool(!e.eval(env)),
            Expr::And(a, b) => Value::Bool(a.eval(env) && b.eval(env)),
            Expr::Or(a, b) => Value::Bool(a.eval(env) || b.eval(env)),
            Expr::Cmp(a, op, b) => Value::Bool(compare(&a.value(env), *op, &b.value(env))),
        }
    }

    /// Walk the AST and report every referenced channel role, threshold name
    /// and use of the detected state, for load-time validation.
    pub fn visit_refs(&self, f: &mut dyn FnMut(RefKind<'_>)) {
        match self {
            Expr::Relay(r) | Expr::RelayConfirmed(r) => f(RefKind::Relay(r)),
            Expr::Digital(r) => f(RefKind::Digital(r)),
            Expr::AnalogVolts(r) | Expr::AnalogValue(r) => f(RefKind::Analog(r)),
            Expr::Threshold(t) => f(RefKind::Threshold(t)),
            Expr::DetectedState => f(RefKind::DetectedState),
            Expr::Not(e) => e.visit_refs(f),
            Expr::And(a, b) | Expr::Or(a, b) | Expr::Cmp(a, _, b) => {
                a.visit_refs(f);
                b.visit_refs(f);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefKind<'a> {
    Relay(&'a str),
    Digital(&'a str),
    Analog(&'a str),
    Threshold(&'a str),
    DetectedState,
}

fn compare(a: &Value, op: CmpOp, b: &Value) -> bool {
    match (a, b) {
        (Value::Num(x), Value::Num(y)) => match op {
            CmpOp::Lt => x < y,
            CmpOp::Le => x <= y,
            CmpOp::Gt => x > y,
            CmpOp::Ge => x >= y,
            CmpOp::Eq => (x - y).abs() < f64::EPSILON,
            CmpOp::Ne => (x - y).abs() >= f64::EPSILON,
        },
        (Value::Str(x), Value::Str(y)) => match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            _ => false,
        },
        (Value::Bool(x), Value::Bool(y)) => match op {
            CmpOp::Eq => x == y,
            CmpOp::Ne => x != y,
            _ => false,
        },
        // Mixed types never compare equal; ordered comparison is meaningless.
        _ => matches!(op, CmpOp::Ne),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParseError {
    pub message: String,
    pub position: usize,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (at byte {})", self.message, self.position)
    }
}

impl std::error::Error for ParseError {}

pub fn parse(input: &str) -> Result<Expr, ParseError> {
    let tokens = tokenize(input)?;
    let mut p = Parser { tokens, pos: 0 };
    let expr = p.parse_or()?;
    if p.pos != p.tokens.len() {
        return Err(ParseError {
            message: format!("unexpected trailing token {:?}", p.tokens[p.pos].0),
            position: p.tokens[p.pos].1,
        });
    }
    Ok(expr)
}

#[derive(Debug, Clone, PartialEq)]
enum Tok {
    Ident(String),
    Number(f64),
    StrLit(String),
    Dot,
    LParen,
    RParen,
    Bang,
    AndAnd,
    OrOr,
    Cmp(CmpOp),
}

fn tokenize(input: &str) -> Result<Vec<(Tok, usize)>, ParseError> {
    let bytes = input.as_bytes();
    let mut out = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let c = bytes[i] as char;
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '.' => {
                out.push((Tok::Dot, i));
                i += 1;
            }
            '(' => {
                out.push((Tok::LParen, i));
                i += 1;
            }
            ')' => {
                out.push((Tok::RParen, i));
                i += 1;
            }
            '!' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((Tok::Cmp(CmpOp::Ne), i));
                    i += 2;
                } else {
                    out.push((Tok::Bang, i));
                    i += 1;
                }
            }
            '&' => {
                if bytes.get(i + 1) == Some(&b'&') {
                    out.push((Tok::AndAnd, i));
                    i += 2;
                } else {
                    return Err(ParseError {
                        message: "expected `&&`".into(),
                        position: i,
                    });
                }
            }
            '|' => {
                if bytes.get(i + 1) == Some(&b'|') {
                    out.push((Tok::OrOr, i));
                    i += 2;
                } else {
                    return Err(ParseError {
                        message: "expected `||`".into(),
                        position: i,
                    });
                }
            }
            '<' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((Tok::Cmp(CmpOp::Le), i));
                    i += 2;
                } else {
                    out.push((Tok::Cmp(CmpOp::Lt), i));
                    i += 1;
                }
            }
            '>' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((Tok::Cmp(CmpOp::Ge), i));
                    i += 2;
                } else {
                    out.push((Tok::Cmp(CmpOp::Gt), i));
                    i += 1;
                }
            }
            '=' => {
                if bytes.get(i + 1) == Some(&b'=') {
                    out.push((Tok::Cmp(CmpOp::Eq), i));
                    i += 2;
                } else {
                    return Err(ParseError {
                        message: "expected `==`".into(),
                        position: i,
                    });
                }
            }
            '"' => {
                let start = i + 1;
                let mut j = start;
                while j < bytes.len() && bytes[j] != b'"' {
                    j += 1;
                }
                if j >= bytes.len() {
                    return Err(ParseError {
                        message: "unterminated string literal".into(),
                        position: i,
                    });
                }
                out.push((Tok::StrLit(input[start..j].to_string()), i));
                i = j + 1;
            }
            '0'..='9' | '-' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && (bytes[i].is_ascii_digit() || bytes[i] == b'.' || bytes[i] == b'e')
                {
                    i += 1;
                }
                let text = &input[start..i];
                let n: f64 = text.parse().map_err(|_| ParseError {
                    message: format!("bad number `{}`", text),
                    position: start,
                })?;
                out.push((Tok::Number(n), start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while i < bytes.len()
                    && ((bytes[i] as char).is_ascii_alphanumeric() || bytes[i] == b'_')
                {
                    i += 1;
                }
                out.push((Tok::Ident(input[start..i].to_string()), start));
            }
            other => {
                return Err(ParseError {
                    message: format!("unexpected character `{}`", other),
                    position: i,
                });
            }
        }
    }
    Ok(out)
}

struct Parser {
    tokens: Vec<(Tok, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Tok> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn bump(&mut self) -> Option<(Tok, usize)> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn here(&self) -> usize {
        self.tokens
            .get(self.pos)
            .map(|(_, p)| *p)
            .unwrap_or_else(|| self.tokens.last().map(|(_, p)| *p + 1).unwrap_or(0))
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Tok::OrOr) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_cmp()?;
        while self.peek() == Some(&Tok::AndAnd) {
            self.bump();
            let rhs = self.parse_cmp()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Expr, ParseError> {
        let lhs = self.parse_unary()?;
        if let Some(Tok::Cmp(op)) = self.peek().cloned() {
            self.bump();
            let rhs = self.parse_unary()?;
            return Ok(Expr::Cmp(Box::new(lhs), op, Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.peek() == Some(&Tok::Bang) {
            self.bump();
            let inner = self.parse_unary()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        let pos = self.here();
        match self.bump() {
            Some((Tok::LParen, _)) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some((Tok::RParen, _)) => Ok(inner),
                    _ => Err(ParseError {
                        message: "expected `)`".into(),
                        position: self.here(),
                    }),
                }
            }
            Some((Tok::Number(n), _)) => Ok(Expr::Num(n)),
            Some((Tok::StrLit(s), _)) => Ok(Expr::Str(s)),
            Some((Tok::Ident(head), _)) => self.parse_path(head, pos),
            other => Err(ParseError {
                message: format!("expected expression, found {:?}", other.map(|(t, _)| t)),
                position: pos,
            }),
        }
    }

    /// Dotted paths name snapshot fields: `relay.rough_valve`,
    /// `relay.mains_power.confirmed`, `digital.door_closed`,
    /// `analog.chamber_pressure.volts`, `analog.turbo_spin.value`,
    /// `threshold.chamber_medium_vacuum`. Bare idents: `true`, `false`,
    /// `state`, `connected`.
    fn parse_path(&mut self, head: String, pos: usize) -> Result<Expr, ParseError> {
        let mut segs = vec![head];
        while self.peek() == Some(&Tok::Dot) {
            self.bump();
            match self.bump() {
                Some((Tok::Ident(s), _)) => segs.push(s),
                _ => {
                    return Err(ParseError {
                        message: "expected identifier after `.`".into(),
                        position: self.here(),
                    })
                }
            }
        }

        let err = |msg: String| ParseError {
            message: msg,
            position: pos,
        };

        match segs[0].as_str() {
            "true" if segs.len() == 1 => Ok(Expr::Bool(true)),
            "false" if segs.len() == 1 => Ok(Expr::Bool(false)),
            "state" if segs.len() == 1 => Ok(Expr::DetectedState),
            "connected" if segs.len() == 1 => Ok(Expr::Connected),
            "relay" => match segs.len() {
                2 => Ok(Expr::Relay(segs[1].clone())),
                3 if segs[2] == "confirmed" => Ok(Expr::RelayConfirmed(segs[1].clone())),
                _ => Err(err(format!("bad relay path `{}`", segs.join(".")))),
            },
            "digital" if segs.len() == 2 => Ok(Expr::Digital(segs[1].clone())),
            "analog" => match segs.len() {
                3 if segs[2] == "volts" => Ok(Expr::AnalogVolts(segs[1].clone())),
                3 if segs[2] == "value" => Ok(Expr::AnalogValue(segs[1].clone())),
                _ => Err(err(format!(
                    "analog path must end in `.volts` or `.value`, got `{}`",
                    segs.join(".")
                ))),
            },
            "threshold" if segs.len() == 2 => Ok(Expr::Threshold(segs[1].clone())),
            _ => Err(err(format!("unknown identifier `{}`", segs.join(".")))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{AnalogChannel, DigitalInput, RelayChannel, StateSnapshot};

    fn snapshot() -> StateSnapshot {
        let mut snap = StateSnapshot::empty();
        snap.connected = true;
        snap.relays
            .push(RelayChannel {
                id: 1,
                role: "mains_power".into(),
                commanded: true,
                confirmed: false,
                critical: true,
            })
            .unwrap();
        snap.digital
            .push(DigitalInput {
                id: 3,
                role: "door_closed".into(),
                safe: true,
            })
            .unwrap();
        snap.analog
            .push(AnalogChannel {
                id: 2,
                role: "chamber_pressure".into(),
                raw: 409, // ~2.0 V
                scale: 1.0,
                offset: 0.0,
            })
            .unwrap();
        snap
    }

    fn eval(src: &str, snap: &StateSnapshot) -> bool {
        let thresholds = |name: &str| match name {
            "chamber_medium_vacuum" => Some(2.0),
            _ => None,
        };
        parse(src).unwrap().eval(&EvalEnv {
            snapshot: snap,
            thresholds: &thresholds,
            detected_state: "vented",
        })
    }

    #[test]
    fn parses_and_evaluates_comparisons() {
        let snap = snapshot();
        assert!(eval(
            "analog.chamber_pressure.volts < threshold.chamber_medium_vacuum",
            &snap
        ));
        assert!(eval("analog.chamber_pressure.volts > 1.5", &snap));
        assert!(!eval("analog.chamber_pressure.volts > 2.5", &snap));
    }

    #[test]
    fn boolean_operators_and_precedence() {
        let snap = snapshot();
        assert!(eval("digital.door_closed && relay.mains_power", &snap));
        assert!(eval("!digital.door_closed || relay.mains_power", &snap));
        assert!(eval(
            "(digital.door_closed || false) && connected",
            &snap
        ));
    }

    #[test]
    fn commanded_and_confirmed_are_distinct() {
        let snap = snapshot();
        assert!(eval("relay.mains_power", &snap));
        assert!(!eval("relay.mains_power.confirmed", &snap));
    }

    #[test]
    fn state_comparison_uses_detected_state() {
        let snap = snapshot();
        assert!(eval("state == \"vented\"", &snap));
        assert!(eval("state != \"sputter\"", &snap));
    }

    #[test]
    fn missing_channel_fails_closed() {
        let snap = snapshot();
        assert!(!eval("digital.no_such_input", &snap));
        assert!(!eval("analog.no_such_gauge.volts > 0.0", &snap));
    }

    #[test]
    fn rejects_malformed_input() {
        assert!(parse("analog.chamber_pressure").is_err());
        assert!(parse("relay.").is_err());
        assert!(parse("1 & 2").is_err());
        assert!(parse("digital.door_closed extra").is_err());
        assert!(parse("\"open").is_err());
    }

    #[test]
    fn reference_visitor_reports_all_names() {
        let e = parse("relay.a && digital.b || analog.c.volts < threshold.d && state == \"x\"")
            .unwrap();
        let mut relays = vec![];
        let mut saw_state = false;
        e.visit_refs(&mut |r| match r {
            RefKind::Relay(n) => relays.push(n.to_string()),
            RefKind::DetectedState => saw_state = true,
            _ => {}
        });
        assert_eq!(relays, vec!["a".to_string()]);
        assert!(saw_state);
    }
}
