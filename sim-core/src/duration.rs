//! Duration strings: `10s`, `2m`, `1h`, `3d` or bare seconds.

/// Error type for duration parsing.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationError {
    /// The value is not a number with an optional unit suffix.
    #[error("failed to parse duration '{0}'")]
    Invalid(String),

    /// The value is negative.
    #[error("duration must be a positive number, but was: {0}")]
    Negative(i64),

    /// The value does not fit in seconds as `u64`.
    #[error("duration '{0}' is too large")]
    Overflow(String),
}

/// Parse a duration into seconds.
pub fn parse_duration(value: &str) -> Result<u64, DurationError> {
    let value = value.trim();
    let invalid = || DurationError::Invalid(value.to_string());

    let (number, multiplier) = match value.chars().last() {
        Some('s') => (&value[..value.len() - 1], 1),
        Some('m') => (&value[..value.len() - 1], 60),
        Some('h') => (&value[..value.len() - 1], 60 * 60),
        Some('d') => (&value[..value.len() - 1], 24 * 60 * 60),
        Some(_) => (value, 1),
        None => return Err(invalid()),
    };

    // An explicit '+' sign is not a duration.
    let digits = number.strip_prefix('-').unwrap_or(number);
    if !digits.starts_with(|c: char| c.is_ascii_digit()) {
        return Err(invalid());
    }
    let amount: i64 = number.parse().map_err(|_| invalid())?;
    if amount < 0 {
        return Err(DurationError::Negative(amount));
    }
    (amount as u64)
        .checked_mul(multiplier)
        .ok_or_else(|| DurationError::Overflow(value.to_string()))
}
