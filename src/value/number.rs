//! Numeric representation preserving integer identity.

use std::cmp::Ordering;

/// A JSON number, either a 64-bit integer or a double.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Number {
    Int(i64),
    Float(f64),
}

impl Number {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Number::Int(i) => Some(*i),
            Number::Float(f) if f.fract() == 0.0 && f.is_finite() => Some(*f as i64),
            Number::Float(_) => None,
        }
    }

    pub fn as_f64(&self) -> f64 {
        match self {
            Number::Int(i) => *i as f64,
            Number::Float(f) => *f,
        }
    }

    pub fn is_zero(&self) -> bool {
        match self {
            Number::Int(i) => *i == 0,
            Number::Float(f) => *f == 0.0,
        }
    }

    /// Cross-representation equality: 2 == 2.0.
    pub fn same(&self, other: &Number) -> bool {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a == b,
            _ => self.as_f64() == other.as_f64(),
        }
    }

    /// Total ordering; NaN sorts below every other number so collation
    /// stays total.
    pub fn compare(&self, other: &Number) -> Ordering {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => a.cmp(b),
            _ => {
                let (a, b) = (self.as_f64(), other.as_f64());
                match (a.is_nan(), b.is_nan()) {
                    (true, true) => Ordering::Equal,
                    (true, false) => Ordering::Less,
                    (false, true) => Ordering::Greater,
                    (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
                }
            }
        }
    }

    pub fn add(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_add(*b) {
                Some(n) => Number::Int(n),
                None => Number::Float(*a as f64 + *b as f64),
            },
            _ => Number::Float(self.as_f64() + other.as_f64()),
        }
    }

    pub fn sub(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_sub(*b) {
                Some(n) => Number::Int(n),
                None => Number::Float(*a as f64 - *b as f64),
            },
            _ => Number::Float(self.as_f64() - other.as_f64()),
        }
    }

    pub fn mult(&self, other: &Number) -> Number {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => match a.checked_mul(*b) {
                Some(n) => Number::Int(n),
                None => Number::Float(*a as f64 * *b as f64),
            },
            _ => Number::Float(self.as_f64() * other.as_f64()),
        }
    }

    /// Division is always carried out in floating point.
    pub fn div(&self, other: &Number) -> Option<Number> {
        let d = other.as_f64();
        if d == 0.0 {
            return None;
        }
        Some(Number::Float(self.as_f64() / d))
    }

    pub fn modulo(&self, other: &Number) -> Option<Number> {
        match (self, other) {
            (Number::Int(a), Number::Int(b)) => {
                if *b == 0 {
                    None
                } else {
                    Some(Number::Int(a % b))
                }
            }
            _ => {
                let d = other.as_f64();
                if d == 0.0 {
                    None
                } else {
                    Some(Number::Float(self.as_f64() % d))
                }
            }
        }
    }

    pub fn neg(&self) -> Number {
        match self {
            Number::Int(i) => match i.checked_neg() {
                Some(n) => Number::Int(n),
                None => Number::Float(-(*i as f64)),
            },
            Number::Float(f) => Number::Float(-f),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        assert_eq!(Number::Int(2).add(&Number::Int(3)), Number::Int(5));
        assert_eq!(Number::Int(2).mult(&Number::Int(3)), Number::Int(6));
    }

    #[test]
    fn test_overflow_widens_to_float() {
        let r = Number::Int(i64::MAX).add(&Number::Int(1));
        assert!(matches!(r, Number::Float(_)));
    }

    #[test]
    fn test_division_by_zero_is_none() {
        assert!(Number::Int(1).div(&Number::Int(0)).is_none());
        assert!(Number::Int(1).modulo(&Number::Int(0)).is_none());
    }

    #[test]
    fn test_mixed_comparison() {
        assert_eq!(Number::Int(2).compare(&Number::Float(2.0)), Ordering::Equal);
        assert_eq!(Number::Int(2).compare(&Number::Float(2.5)), Ordering::Less);
    }
}
