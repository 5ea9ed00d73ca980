use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

// Human-verification placeholder, not a substitute for re-authentication.
const POOL: [(&str, i64); 6] = [
    ("¿Cuánto es 7 + 5?", 12),
    ("¿Cuánto es 9 × 3?", 27),
    ("¿Cuánto es 15 - 8?", 7),
    ("¿Cuánto es 6 × 4?", 24),
    ("¿Cuánto es 18 ÷ 3?", 6),
    ("¿Cuánto es 11 + 13?", 24),
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub question: String,
    pub answer: i64,
}

impl Challenge {
    pub fn random() -> Self {
        Self::from_pool(random_index(POOL.len()))
    }

    /// Wraps around, so any index is valid.
    pub fn from_pool(index: usize) -> Self {
        let (question, answer) = POOL[index % POOL.len()];
        Self {
            question: question.to_string(),
            answer,
        }
    }

    pub fn pool_size() -> usize {
        POOL.len()
    }

    pub fn matches(&self, input: &str) -> bool {
        coerce_number(input).is_some_and(|n| n == self.answer as f64)
    }
}

/// Numeric coercion with the same shape as a browser `Number(input)`:
/// surrounding whitespace is ignored, blank input is zero, unsigned
/// `0x`/`0o`/`0b` literals are read in their radix, and anything else that
/// is not a finite decimal number is rejected.
fn coerce_number(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Some(0.0);
    }
    if let Some(n) = parse_radix_literal(trimmed) {
        return n;
    }
    let first = trimmed.chars().next()?;
    if !(first.is_ascii_digit() || matches!(first, '+' | '-' | '.')) {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|n| n.is_finite())
}

/// `Some(_)` when `s` carries a radix prefix; the inner value is `None` when
/// the digits after it are invalid.
fn parse_radix_literal(s: &str) -> Option<Option<f64>> {
    let (radix, digits) = match s.get(..2)? {
        "0x" | "0X" => (16, &s[2..]),
        "0o" | "0O" => (8, &s[2..]),
        "0b" | "0B" => (2, &s[2..]),
        _ => return None,
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_digit(radix)) {
        return Some(None);
    }
    Some(u128::from_str_radix(digits, radix).ok().map(|n| n as f64))
}

fn random_index(len: usize) -> usize {
    let mut buf = [0u8; 8];
    let seed = match getrandom::getrandom(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf),
        Err(_) => SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or_default(),
    };
    (seed % len as u64) as usize
}
