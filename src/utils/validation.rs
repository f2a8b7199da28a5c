use crate::utils::error::{EtlError, Result};
use url::Url;

pub trait Validate {
    fn validate(&self) -> Result<()>;
}

fn invalid(field_name: &str, value: impl ToString, reason: impl Into<String>) -> EtlError {
    EtlError::InvalidConfigValueError {
        field: field_name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

pub fn validate_url(field_name: &str, url_str: &str) -> Result<()> {
    if url_str.is_empty() {
        return Err(invalid(field_name, url_str, "URL cannot be empty"));
    }

    match Url::parse(url_str) {
        Ok(url) => match url.scheme() {
            "http" | "https" => {
                if url.host_str().map(|h| h.is_empty()).unwrap_or(true) {
                    return Err(invalid(field_name, url_str, "URL has no host"));
                }
                Ok(())
            }
            scheme => Err(invalid(
                field_name,
                url_str,
                format!("Unsupported URL scheme: {}", scheme),
            )),
        },
        Err(e) => Err(invalid(
            field_name,
            url_str,
            format!("Invalid URL format: {}", e),
        )),
    }
}

pub fn validate_path(field_name: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(invalid(field_name, path, "Path cannot be empty"));
    }

    if path.contains('\0') {
        return Err(invalid(field_name, path, "Path contains null bytes"));
    }

    Ok(())
}

pub fn validate_positive_number(field_name: &str, value: usize, min_value: usize) -> Result<()> {
    if value < min_value {
        return Err(invalid(
            field_name,
            value,
            format!("Value must be at least {}", min_value),
        ));
    }
    Ok(())
}

pub fn validate_required_field<'a, T>(field_name: &str, value: &'a Option<T>) -> Result<&'a T> {
    value.as_ref().ok_or_else(|| EtlError::MissingConfigError {
        field: field_name.to_string(),
    })
}

pub fn validate_non_empty_string(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(invalid(
            field_name,
            value,
            "Value cannot be empty or whitespace-only",
        ));
    }
    Ok(())
}

pub fn validate_range<T: PartialOrd + std::fmt::Display + Copy>(
    field_name: &str,
    value: T,
    min: T,
    max: T,
) -> Result<()> {
    if value < min || value > max {
        return Err(invalid(
            field_name,
            value,
            format!("Value must be between {} and {}", min, max),
        ));
    }
    Ok(())
}

/// 值必須是允許清單之一 (不分大小寫)
pub fn validate_one_of(field_name: &str, value: &str, allowed: &[&str]) -> Result<()> {
    if allowed.iter().any(|a| a.eq_ignore_ascii_case(value)) {
        return Ok(());
    }
    Err(invalid(
        field_name,
        value,
        format!("Valid values: {}", allowed.join(", ")),
    ))
}

/// 表名會被組進 SQL，只允許安全的識別字
pub fn validate_identifier(field_name: &str, value: &str) -> Result<()> {
    let mut chars = value.chars();
    let starts_ok = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if starts_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(invalid(
            field_name,
            value,
            "Only letters, digits and '_' are allowed",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_url() {
        assert!(validate_url("embryoscope.ip", "https://10.250.1.20:4000").is_ok());
        assert!(validate_url("embryoscope.ip", "http://localhost:4000").is_ok());
        assert!(validate_url("embryoscope.ip", "").is_err());
        assert!(validate_url("embryoscope.ip", "invalid-url").is_err());
        assert!(validate_url("embryoscope.ip", "ftp://10.0.0.1").is_err());
    }

    #[test]
    fn test_validate_positive_number() {
        assert!(validate_positive_number("extraction.max_workers", 3, 1).is_ok());
        assert!(validate_positive_number("extraction.max_workers", 0, 1).is_err());
    }

    #[test]
    fn test_validate_range_and_one_of() {
        assert!(validate_range("combine.tolerance_days", 3, 0, 7).is_ok());
        assert!(validate_range("combine.tolerance_days", 8, 0, 7).is_err());
        assert!(validate_one_of("combine.strategy", "BEST", &["exact", "tolerance", "best"]).is_ok());
        assert!(validate_one_of("combine.strategy", "fuzzy", &["exact", "tolerance", "best"]).is_err());
    }

    #[test]
    fn test_validate_identifier() {
        assert!(validate_identifier("table", "view_pacientes").is_ok());
        assert!(validate_identifier("table", "gold_clinisys_embrioes").is_ok());
        assert!(validate_identifier("table", "x; DROP TABLE y").is_err());
        assert!(validate_identifier("table", "1abc").is_err());
    }

    #[test]
    fn test_validate_required_field() {
        let present = Some("root".to_string());
        let missing: Option<String> = None;
        assert_eq!(validate_required_field("clinisys.connection_string", &present).ok(), Some(&"root".to_string()));
        assert!(matches!(
            validate_required_field("clinisys.connection_string", &missing),
            Err(EtlError::MissingConfigError { .. })
        ));
    }
}
