//! Login validation and conversation keys.

use crate::error::{CourierError, CourierResult};

/// Upper bound on login length (matches the `users.login` column).
pub const MAX_LOGIN_LEN: usize = 50;

/// A login is non-empty, at most [`MAX_LOGIN_LEN`] characters, ASCII letters
/// and digits only.
pub fn is_valid_login(login: &str) -> bool {
    !login.is_empty()
        && login.len() <= MAX_LOGIN_LEN
        && login.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Like [`is_valid_login`], returning [`CourierError::InvalidLogin`].
pub fn validate_login(login: &str) -> CourierResult<()> {
    if is_valid_login(login) {
        Ok(())
    } else {
        Err(CourierError::InvalidLogin(login.escape_debug().to_string()))
    }
}

/// Order-independent key for the conversation between two logins.
///
/// Used as the bus partition key so that a partitioned bus keeps
/// per-conversation ordering.
pub fn conversation_key(a: &str, b: &str) -> String {
    if a <= b {
        format!("{a}:{b}")
    } else {
        format!("{b}:{a}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_alphanumeric() {
        assert!(is_valid_login("alice"));
        assert!(is_valid_login("Bob42"));
        assert!(is_valid_login("7"));
    }

    #[test]
    fn rejects_other_characters() {
        assert!(!is_valid_login(""));
        assert!(!is_valid_login("al ice"));
        assert!(!is_valid_login("alice!"));
        assert!(!is_valid_login("al:ice"));
        assert!(!is_valid_login("жанна"));
        assert!(!is_valid_login(&"a".repeat(MAX_LOGIN_LEN + 1)));
    }

    #[test]
    fn validate_reports_login() {
        let err = validate_login("a b").unwrap_err();
        assert!(matches!(err, CourierError::InvalidLogin(ref l) if l == "a b"));
    }

    #[test]
    fn conversation_key_is_symmetric() {
        assert_eq!(conversation_key("bob", "alice"), "alice:bob");
        assert_eq!(conversation_key("alice", "bob"), "alice:bob");
    }
}
