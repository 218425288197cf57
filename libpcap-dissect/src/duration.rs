use serde::Serialize;
use std::ops::{Add, Sub};
use std::time::{SystemTime, UNIX_EPOCH};

/// Reimplementation of std::time::Duration, but panic-free
/// and partial, only to match our needs:
///   - use micros instead of nanos, avoid casts
///   - expose fields
///
/// Used both for capture timestamps (relative to the epoch) and for
/// timestamps relative to the first packet of a capture.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Debug, Serialize)]
pub struct Duration {
    pub secs: u32,
    pub micros: u32,
}

pub const MICROS_PER_SEC: u32 = 1_000_000;

impl Duration {
    /// Build Duration from secs and micros
    pub fn new(secs: u32, micros: u32) -> Duration {
        Duration { secs, micros }
    }

    /// Test if Duration object is null
    #[inline]
    pub fn is_null(self) -> bool {
        self.secs == 0 && self.micros == 0
    }

    /// Current wall-clock time
    pub fn now() -> Duration {
        match SystemTime::now().duration_since(UNIX_EPOCH) {
            Ok(d) => Duration::new(d.as_secs() as u32, d.subsec_micros()),
            Err(_) => Duration::default(),
        }
    }

    /// Parse a decimal timestamp such as `1371283023.127450000`.
    ///
    /// The fractional part is truncated to microseconds. If the fractional
    /// part cannot be parsed (the decoder sometimes emits a negative one),
    /// it is discarded and only the seconds are kept.
    pub fn parse_secs(s: &str) -> Option<Duration> {
        let s = s.trim();
        let (secs, frac) = match s.split_once('.') {
            Some((secs, frac)) => (secs, Some(frac)),
            None => (s, None),
        };
        let secs = secs.parse::<u32>().ok()?;
        let micros = match frac {
            Some(f) if !f.is_empty() && f.bytes().all(|b| b.is_ascii_digit()) => {
                let digits: String = f.chars().chain("000000".chars()).take(6).collect();
                digits.parse::<u32>().unwrap_or(0)
            }
            _ => 0,
        };
        Some(Duration { secs, micros })
    }
}

impl Add for Duration {
    type Output = Duration;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn add(self, other: Duration) -> Self::Output {
        let secs = self.secs.wrapping_add(other.secs);
        let micros = self.micros.wrapping_add(other.micros);
        let (secs, micros) = if micros >= MICROS_PER_SEC {
            (secs + (micros / MICROS_PER_SEC), micros % MICROS_PER_SEC)
        } else {
            (secs, micros)
        };

        Duration { secs, micros }
    }
}

impl Sub for Duration {
    type Output = Duration;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn sub(self, other: Duration) -> Self::Output {
        let secs = self.secs.wrapping_sub(other.secs);
        let (secs, micros) = if self.micros >= other.micros {
            (secs, self.micros - other.micros)
        } else {
            let diff = other.micros.wrapping_sub(self.micros);
            let secs_less = diff / MICROS_PER_SEC;
            let micros = MICROS_PER_SEC - diff;
            (secs.wrapping_sub(1 + secs_less), micros)
        };

        Duration { secs, micros }
    }
}

#[cfg(test)]
mod tests {
    use super::Duration;
    #[test]
    fn duration_sub() {
        let d1 = Duration::new(1234, 5678);
        let d2 = Duration::new(1234, 6789);
        let d = d2 - d1;
        assert_eq!(d.secs, 0);
        assert_eq!(d.micros, 1111);
        let d = Duration::new(10, 100) - Duration::new(9, 200);
        assert_eq!(d, Duration::new(0, 999_900));
    }

    #[test]
    fn duration_parse() {
        assert_eq!(
            Duration::parse_secs("1371283023.127450000"),
            Some(Duration::new(1371283023, 127450))
        );
        assert_eq!(Duration::parse_secs("12.5"), Some(Duration::new(12, 500_000)));
        assert_eq!(Duration::parse_secs("12"), Some(Duration::new(12, 0)));
        assert_eq!(Duration::parse_secs("12.-3"), Some(Duration::new(12, 0)));
        assert_eq!(Duration::parse_secs("abc"), None);
    }
}
