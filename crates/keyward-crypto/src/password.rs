//! Password strength policy for share passwords

use crate::{CryptoError, Result};

/// Characters accepted as symbols
pub const SPECIAL_CHARS: &str = "!@#$%^&*()_+-=[]{}|;:,.<>?/~`'\"\\";

/// Default minimum password length
pub const DEFAULT_MIN_LENGTH: usize = 8;

/// Requirements a password must meet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PasswordPolicy {
    pub min_length: usize,
    pub require_upper: bool,
    pub require_lower: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

impl Default for PasswordPolicy {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_LENGTH,
            require_upper: true,
            require_lower: true,
            require_digit: true,
            require_special: true,
        }
    }
}

impl PasswordPolicy {
    /// Policy with a custom minimum length and all character classes required
    pub fn with_min_length(min_length: usize) -> Self {
        Self {
            min_length,
            ..Self::default()
        }
    }

    /// Check a password, listing every unmet requirement
    pub fn validate(&self, password: &str) -> Result<()> {
        let mut missing = Vec::new();

        if password.chars().count() < self.min_length {
            missing.push(format!("at least {} characters", self.min_length));
        }
        if self.require_upper && !password.chars().any(|c| c.is_uppercase()) {
            missing.push("an uppercase letter".to_string());
        }
        if self.require_lower && !password.chars().any(|c| c.is_lowercase()) {
            missing.push("a lowercase letter".to_string());
        }
        if self.require_digit && !password.chars().any(|c| c.is_ascii_digit()) {
            missing.push("a digit".to_string());
        }
        if self.require_special && !password.chars().any(|c| SPECIAL_CHARS.contains(c)) {
            missing.push("a symbol".to_string());
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(CryptoError::WeakPassword(format!(
                "password must contain {}",
                missing.join(", ")
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("Str0ng!Pass")]
    #[case("Aa1!aaaa")]
    #[case("Ünïcödé9#")]
    fn test_accepts_strong(#[case] password: &str) {
        assert!(PasswordPolicy::default().validate(password).is_ok());
    }

    #[rstest]
    #[case("Aa1!aaa", "at least 8 characters")]
    #[case("str0ng!pass", "an uppercase letter")]
    #[case("STR0NG!PASS", "a lowercase letter")]
    #[case("Strong!Pass", "a digit")]
    #[case("Str0ngPass1", "a symbol")]
    fn test_rejects_weak(#[case] password: &str, #[case] expected: &str) {
        let err = PasswordPolicy::default().validate(password).unwrap_err();
        assert!(matches!(err, CryptoError::WeakPassword(_)));
        assert!(err.to_string().contains(expected), "{}", err);
    }

    #[test]
    fn test_custom_min_length() {
        let policy = PasswordPolicy::with_min_length(12);
        assert!(policy.validate("Str0ng!Pass").is_err());
        assert!(policy.validate("Str0ng!Passwd").is_ok());
    }

    #[test]
    fn test_empty_reports_everything() {
        let err = PasswordPolicy::default().validate("").unwrap_err().to_string();
        for part in ["characters", "uppercase", "lowercase", "digit", "symbol"] {
            assert!(err.contains(part));
        }
    }
}
