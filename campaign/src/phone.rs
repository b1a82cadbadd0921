/// Normalises a phone number to E.164 form by stripping common
/// formatting characters (spaces, dashes, dots and parentheses).
/// Returns the normalised number when it is valid E.164,
/// `None` otherwise.
pub fn normalize_e164(raw: &str) -> Option<String> {
    let stripped: String = raw
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '.' | '(' | ')'))
        .collect();

    if is_valid_e164(&stripped) {
        Some(stripped)
    } else {
        None
    }
}

/// Validates that a string is an E.164 phone number:
/// a leading `+`, a non-zero first digit, and 8 to 15 digits in total.
pub fn is_valid_e164(number: &str) -> bool {
    let Some(digits) = number.strip_prefix('+') else {
        return false;
    };

    if !(8..=15).contains(&digits.len()) {
        return false;
    }

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return false;
    }

    !digits.starts_with('0')
}

#[cfg(test)]
mod tests {
    use coverage_helper::test;
    use super::*;

    #[test]
    fn test_accepts_valid_numbers() {
        assert!(is_valid_e164("+14155552671"));
        assert!(is_valid_e164("+442071838750"));
        assert!(is_valid_e164("+5511987654321"));
        // Minimum of 8 digits.
        assert!(is_valid_e164("+12345678"));
    }

    #[test]
    fn test_rejects_invalid_numbers() {
        // Missing plus prefix.
        assert!(!is_valid_e164("14155552671"));
        // Leading zero country code.
        assert!(!is_valid_e164("+04155552671"));
        // Too short.
        assert!(!is_valid_e164("+1234567"));
        // Too long (16 digits).
        assert!(!is_valid_e164("+1234567890123456"));
        // Non-digit characters.
        assert!(!is_valid_e164("+1415555abcd"));
        assert!(!is_valid_e164(""));
        assert!(!is_valid_e164("+"));
    }

    #[test]
    fn test_normalises_formatted_numbers() {
        assert_eq!(
            normalize_e164("+1 (415) 555-2671"),
            Some("+14155552671".to_string())
        );
        assert_eq!(
            normalize_e164("+44 20.7183.8750"),
            Some("+442071838750".to_string())
        );
        assert_eq!(normalize_e164("not a number"), None);
    }
}
