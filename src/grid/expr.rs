//! Leaf classification for parameter templates.
//!
//! Grid expressions live in string leaves:
//! - `a | b | c`           product axis
//! - `(a | b | c)`         member of the default zip group
//! - `@tag(a | b | c)`     member of zip group `tag`
//! - `start:stop:step`     numeric range, start inclusive, stop exclusive
//!
//! `\|` is a literal pipe. Anything else is a scalar.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Number, Value};

use crate::error::GridError;

/// Group name used by untagged `( .. | .. )` expressions.
pub const DEFAULT_ZIP_GROUP: &str = "";

static ZIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^(?:@([A-Za-z0-9_\-]+))?\((.*)\)$").expect("valid zip regex")
});

static RANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    let num = r"(-?\d+(?:\.\d+)?(?:[eE][-+]?\d+)?)";
    Regex::new(&format!(r"^{num}\s*:\s*{num}\s*:\s*{num}$")).expect("valid range regex")
});

/// Longest range a single expression may describe.
pub const MAX_RANGE_LEN: usize = 1_000_000;

/// Candidate values of one axis member, indexed without materializing
/// ranges.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidates {
    List(Vec<Value>),
    Range(RangeSpec),
}

impl Candidates {
    pub fn len(&self) -> usize {
        match self {
            Candidates::List(values) => values.len(),
            Candidates::Range(range) => range.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index`; `Null` past the end.
    pub fn get(&self, index: usize) -> Value {
        match self {
            Candidates::List(values) => values.get(index).cloned().unwrap_or(Value::Null),
            Candidates::Range(range) => range.value_at(index),
        }
    }
}

/// One classified template leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum Leaf {
    /// Fixed value, copied into every combination.
    Scalar(Value),
    /// Independent axis; one candidate chosen per combination.
    Product(Candidates),
    /// Positionally paired with every other member of `group`.
    Zip { group: String, values: Candidates },
}

impl Leaf {
    /// Classify the leaf found at `key` (dotted path, used in errors).
    pub fn classify(key: &str, raw: &Value) -> Result<Self, GridError> {
        let Value::String(s) = raw else {
            return Ok(Leaf::Scalar(raw.clone()));
        };
        let trimmed = s.trim();

        if let Some(caps) = ZIP_RE.captures(trimmed) {
            let group = caps
                .get(1)
                .map(|m| m.as_str())
                .unwrap_or(DEFAULT_ZIP_GROUP)
                .to_string();
            let inner = caps.get(2).map(|m| m.as_str()).unwrap_or_default();

            let parts = split_unescaped(inner);
            if parts.len() > 1 {
                let values = parse_all(key, &parts)?;
                return Ok(Leaf::Zip {
                    group,
                    values: Candidates::List(values),
                });
            }
            if let Some(range) = RangeSpec::parse(key, inner.trim())? {
                return Ok(Leaf::Zip {
                    group,
                    values: Candidates::Range(range),
                });
            }
            return Ok(Leaf::Scalar(Value::String(unescape(s))));
        }

        if let Some(range) = RangeSpec::parse(key, trimmed)? {
            return Ok(Leaf::Product(Candidates::Range(range)));
        }

        let parts = split_unescaped(trimmed);
        if parts.len() > 1 {
            return Ok(Leaf::Product(Candidates::List(parse_all(key, &parts)?)));
        }

        Ok(Leaf::Scalar(Value::String(unescape(s))))
    }

    /// Candidate count contributed by this leaf (1 for scalars).
    pub fn len(&self) -> usize {
        match self {
            Leaf::Scalar(_) => 1,
            Leaf::Product(values) | Leaf::Zip { values, .. } => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn parse_all(key: &str, parts: &[String]) -> Result<Vec<Value>, GridError> {
    parts.iter().map(|p| parse_literal(key, p)).collect()
}

/// A `start:stop:step` range with a half-open upper bound.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RangeSpec {
    start: f64,
    step: f64,
    len: usize,
    /// All three bounds were written as integers.
    integral: bool,
}

impl RangeSpec {
    /// Parse a range expression; `Ok(None)` if `s` is not range-shaped.
    pub fn parse(key: &str, s: &str) -> Result<Option<Self>, GridError> {
        let Some(caps) = RANGE_RE.captures(s) else {
            return Ok(None);
        };
        let raw: Vec<&str> = (1..=3)
            .map(|i| caps.get(i).map(|m| m.as_str()).unwrap_or_default())
            .collect();
        let integral = raw.iter().all(|p| p.parse::<i64>().is_ok());

        let mut nums = [0.0f64; 3];
        for (slot, part) in nums.iter_mut().zip(&raw) {
            *slot = part.parse::<f64>().map_err(|_| GridError::BadLiteral {
                key: key.to_string(),
                literal: s.to_string(),
            })?;
        }
        let [start, stop, step] = nums;

        if step <= 0.0 {
            return Err(GridError::NonPositiveStep {
                key: key.to_string(),
                expr: s.to_string(),
            });
        }

        // Absorb float noise so 0:0.3:0.1 has 3 values, not 4.
        let span = ((stop - start) / step - 1e-9).ceil();
        if !span.is_finite() || span > MAX_RANGE_LEN as f64 {
            return Err(GridError::RangeTooLong {
                key: key.to_string(),
                expr: s.to_string(),
                limit: MAX_RANGE_LEN,
            });
        }
        if span < 1.0 {
            return Err(GridError::EmptyRange {
                key: key.to_string(),
                expr: s.to_string(),
            });
        }

        Ok(Some(Self {
            start,
            step,
            len: span as usize,
            integral,
        }))
    }

    /// Number of values, known without materializing them.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The `index`-th value as a JSON number; `Null` past the end.
    pub fn value_at(&self, index: usize) -> Value {
        if index >= self.len {
            return Value::Null;
        }
        let v = self.start + self.step * index as f64;
        if self.integral {
            Value::Number(Number::from(v.round() as i64))
        } else {
            let rounded = (v * 1e12).round() / 1e12;
            Number::from_f64(rounded)
                .map(Value::Number)
                .unwrap_or(Value::Null)
        }
    }
}

/// Split on `|` unless escaped as `\|`; the escape is resolved in the parts.
fn split_unescaped(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\\' if chars.peek() == Some(&'|') => {
                chars.next();
                current.push('|');
            }
            '|' => parts.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn unescape(s: &str) -> String {
    s.replace("\\|", "|")
}

/// Parse one candidate into a typed JSON value.
pub fn parse_literal(key: &str, item: &str) -> Result<Value, GridError> {
    let bad = || GridError::BadLiteral {
        key: key.to_string(),
        literal: item.to_string(),
    };
    let s = item.trim();
    if s.is_empty() {
        return Err(bad());
    }

    match s.as_bytes()[0] {
        b'[' | b'{' | b'"' => return serde_json::from_str(s).map_err(|_| bad()),
        b'\'' => {
            if s.len() >= 2 && s.ends_with('\'') {
                return Ok(Value::String(s[1..s.len() - 1].to_string()));
            }
            return Err(bad());
        }
        _ => {}
    }

    match s.to_ascii_lowercase().as_str() {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" | "none" | "~" => return Ok(Value::Null),
        _ => {}
    }

    if let Ok(i) = s.parse::<i64>() {
        return Ok(Value::Number(Number::from(i)));
    }
    if let Ok(f) = s.parse::<f64>()
        && let Some(n) = Number::from_f64(f)
    {
        return Ok(Value::Number(n));
    }

    Ok(Value::String(s.to_string()))
}
