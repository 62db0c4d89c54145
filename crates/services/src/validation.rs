//! Input checks applied before any store call.

use domains::{DomainError, DomainResult};

pub const USERNAME_MIN_CHARS: usize = 3;
pub const USERNAME_MAX_CHARS: usize = 30;
pub const PASSWORD_MIN_CHARS: usize = 6;
pub const CONTENT_MAX_CHARS: usize = 500;
pub const REASON_MAX_CHARS: usize = 500;

pub fn username(value: &str) -> DomainResult<()> {
    let len = value.chars().count();
    if !(USERNAME_MIN_CHARS..=USERNAME_MAX_CHARS).contains(&len) {
        return Err(DomainError::Validation(format!(
            "username must be {USERNAME_MIN_CHARS}-{USERNAME_MAX_CHARS} characters"
        )));
    }
    if value.trim() != value {
        return Err(DomainError::Validation(
            "username must not start or end with whitespace".into(),
        ));
    }
    Ok(())
}

pub fn password(value: &str) -> DomainResult<()> {
    if value.chars().count() < PASSWORD_MIN_CHARS {
        return Err(DomainError::Validation(format!(
            "password must be at least {PASSWORD_MIN_CHARS} characters"
        )));
    }
    Ok(())
}

/// Post and comment bodies.
pub fn content(value: &str) -> DomainResult<()> {
    bounded_text("content", value, CONTENT_MAX_CHARS)
}

pub fn reason(value: &str) -> DomainResult<()> {
    bounded_text("reason", value, REASON_MAX_CHARS)
}

pub fn radius(meters: f64) -> DomainResult<()> {
    if !meters.is_finite() || meters <= 0.0 {
        return Err(DomainError::Validation(format!(
            "radius must be a positive number of meters, got {meters}"
        )));
    }
    Ok(())
}

fn bounded_text(field: &str, value: &str, max: usize) -> DomainResult<()> {
    if value.trim().is_empty() {
        return Err(DomainError::Validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > max {
        return Err(DomainError::Validation(format!(
            "{field} must be at most {max} characters"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_bounds() {
        assert!(username("ab").is_err());
        assert!(username("abc").is_ok());
        assert!(username(&"x".repeat(30)).is_ok());
        assert!(username(&"x".repeat(31)).is_err());
        assert!(username(" bob").is_err());
    }

    #[test]
    fn counts_characters_not_bytes() {
        // 500 two-byte characters is still within the limit
        assert!(content(&"é".repeat(500)).is_ok());
        assert!(content(&"é".repeat(501)).is_err());
    }

    #[test]
    fn blank_text_is_rejected() {
        assert!(content("   ").is_err());
        assert!(reason("").is_err());
        assert!(reason("spam").is_ok());
    }

    #[test]
    fn radius_must_be_positive_and_finite() {
        assert!(radius(0.0).is_err());
        assert!(radius(-1.0).is_err());
        assert!(radius(f64::INFINITY).is_err());
        assert!(radius(5000.0).is_ok());
    }

    #[test]
    fn short_passwords_fail() {
        assert!(password("12345").is_err());
        assert!(password("123456").is_ok());
    }
}
