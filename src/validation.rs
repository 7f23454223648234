use crate::error::{Error, Result};

const MAX_TRACKER_NAME_LEN: usize = 128;
const MAX_LABEL_NAME_LEN: usize = 64;
const MAX_SUBJECT_LEN: usize = 2048;

fn is_valid_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'
}

/// Tracker names match `[A-Za-z0-9._-]+`.
pub fn validate_tracker_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::Invalid("tracker name cannot be empty".into()));
    }
    if name.len() > MAX_TRACKER_NAME_LEN {
        return Err(Error::Invalid(format!(
            "tracker name cannot exceed {MAX_TRACKER_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(is_valid_name_char) {
        return Err(Error::Invalid(
            "tracker name can only contain alphanumeric characters, hyphens, underscores, and periods"
                .into(),
        ));
    }
    if name == "." || name == ".." {
        return Err(Error::Invalid(format!("{name} is not a valid tracker name")));
    }
    Ok(())
}

pub fn validate_label_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(Error::Invalid("label name cannot be empty".into()));
    }
    if trimmed.len() > MAX_LABEL_NAME_LEN {
        return Err(Error::Invalid(format!(
            "label name cannot exceed {MAX_LABEL_NAME_LEN} characters"
        )));
    }
    Ok(())
}

/// Accepts `#rgb` and `#rrggbb`.
pub fn validate_color(color: &str) -> Result<()> {
    let valid = color
        .strip_prefix('#')
        .is_some_and(|hex| (hex.len() == 3 || hex.len() == 6) && hex.chars().all(|c| c.is_ascii_hexdigit()));
    if !valid {
        return Err(Error::Invalid(format!("{color} is not a valid color")));
    }
    Ok(())
}

pub fn validate_subject(subject: &str) -> Result<()> {
    if subject.trim().is_empty() {
        return Err(Error::Invalid("subject cannot be empty".into()));
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return Err(Error::Invalid(format!(
            "subject cannot exceed {MAX_SUBJECT_LEN} characters"
        )));
    }
    Ok(())
}

pub fn validate_webhook_url(url: &str) -> Result<()> {
    let rest = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"));
    match rest {
        Some(host) if !host.is_empty() && !host.starts_with('/') => Ok(()),
        _ => Err(Error::Invalid("webhook URL must be an http(s) URL".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tracker_names() {
        assert!(validate_tracker_name("todo.sr.ht").is_ok());
        assert!(validate_tracker_name("my_project-2").is_ok());
        assert!(validate_tracker_name("").is_err());
        assert!(validate_tracker_name("has space").is_err());
        assert!(validate_tracker_name("slash/name").is_err());
        assert!(validate_tracker_name("..").is_err());
        assert!(validate_tracker_name(&"a".repeat(129)).is_err());
    }

    #[test]
    fn test_colors() {
        assert!(validate_color("#fff").is_ok());
        assert!(validate_color("#A0b1C2").is_ok());
        assert!(validate_color("fff").is_err());
        assert!(validate_color("#ggg").is_err());
        assert!(validate_color("#ffff").is_err());
    }

    #[test]
    fn test_webhook_urls() {
        assert!(validate_webhook_url("https://hooks.example.org/x").is_ok());
        assert!(validate_webhook_url("http://localhost:8080").is_ok());
        assert!(validate_webhook_url("ftp://example.org").is_err());
        assert!(validate_webhook_url("https://").is_err());
    }
}
