//! Domain validator (C2): the label-length and total-length rules applied
//! both before macro expansion (where macro tokens are still allowed in the
//! text) and after (where the result must be a plain DNS name).

/// Pre-expansion validation allows `%{...}`, `%%`, `%-`, `%_` tokens mixed
/// with literal label characters; it does not otherwise differ from the
/// post-expansion rules, since macro tokens expand to DNS label text.
pub fn validate_pre_expansion(s: &str) -> Result<(), &'static str> {
    validate_labels(s, true)
}

/// Post-expansion validation requires a plain DNS name: no `%` left in it.
pub fn validate_post_expansion(s: &str) -> Result<(), &'static str> {
    if s.contains('%') {
        return Err("unexpanded macro in domain");
    }
    validate_labels(s, false)
}

fn validate_labels(s: &str, allow_macro_chars: bool) -> Result<(), &'static str> {
    if s.is_empty() {
        return Err("empty domain");
    }
    if s.len() > 253 {
        return Err("domain exceeds 253 characters");
    }

    let mut has_non_digit = false;
    let mut all_dotted_numeric = true;

    for label in s.trim_end_matches('.').split('.') {
        if label.is_empty() {
            return Err("empty label");
        }
        if label.len() > 63 {
            return Err("label exceeds 63 characters");
        }
        for c in label.chars() {
            let ok = c.is_ascii_alphanumeric()
                || c == '-'
                || c == '_'
                || (allow_macro_chars && (c == '%' || c == '{' || c == '}'));
            if !ok {
                return Err("invalid character in label");
            }
            if !c.is_ascii_digit() {
                has_non_digit = true;
            }
        }
        if !label.chars().all(|c| c.is_ascii_digit()) {
            all_dotted_numeric = false;
        }
    }

    if !has_non_digit {
        return Err("domain must contain a non-digit character");
    }
    if all_dotted_numeric {
        return Err("domain must not be purely dotted-numeric");
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accepts_ordinary_domains() {
        assert!(validate_post_expansion("example.com").is_ok());
        assert!(validate_post_expansion("a.b.example.com").is_ok());
    }

    #[test]
    fn rejects_dotted_numeric() {
        assert!(validate_post_expansion("192.0.2.1").is_err());
    }

    #[test]
    fn rejects_long_label() {
        let label = "a".repeat(64);
        let domain = format!("{label}.com");
        assert!(validate_post_expansion(&domain).is_err());
    }

    #[test]
    fn rejects_long_total() {
        let domain = format!("{}.com", vec!["a".repeat(63); 5].join("."));
        assert!(validate_post_expansion(&domain).is_err());
    }

    #[test]
    fn pre_expansion_allows_macro_tokens() {
        assert!(validate_pre_expansion("%{ir}.%{v}._spf.%{d2}").is_ok());
        assert!(validate_post_expansion("%{ir}.%{v}._spf.%{d2}").is_err());
    }

    #[test]
    fn rejects_empty_label() {
        assert!(validate_post_expansion("example..com").is_err());
    }
}
