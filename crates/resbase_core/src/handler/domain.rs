//! Domain constraint parsing shared by the built-in handlers.
//!
//! Range domains are written `min..max` with either bound optional; pattern
//! domains are regular expressions matched against the whole value.

use super::{AttributeError, AttributeResult};
use regex::Regex;

/// Splits `min..max` into trimmed optional bounds.
pub(crate) fn split_range(domain: &str) -> AttributeResult<(Option<&str>, Option<&str>)> {
    let (low, high) = domain
        .split_once("..")
        .ok_or_else(|| AttributeError::invalid(format!("domain `{domain}` is not a `min..max` range")))?;
    fn bound(text: &str) -> Option<&str> {
        let trimmed = text.trim();
        (!trimmed.is_empty()).then_some(trimmed)
    }
    Ok((bound(low), bound(high)))
}

/// Parses both bounds of a range domain with `parse`.
pub(crate) fn parse_range<T, F>(domain: &str, parse: F) -> AttributeResult<(Option<T>, Option<T>)>
where
    T: PartialOrd,
    F: Fn(&str) -> Result<T, String>,
{
    let (low, high) = split_range(domain)?;
    let parse_bound = |text: Option<&str>| -> AttributeResult<Option<T>> {
        text.map(|text| {
            parse(text).map_err(|err| {
                AttributeError::invalid(format!("domain `{domain}` has a bad bound: {err}"))
            })
        })
        .transpose()
    };
    let low = parse_bound(low)?;
    let high = parse_bound(high)?;
    if let (Some(low), Some(high)) = (&low, &high) {
        if high < low {
            return Err(AttributeError::invalid(format!(
                "domain `{domain}` has its upper bound below the lower bound"
            )));
        }
    }
    Ok((low, high))
}

/// Checks `value` against bounds parsed by `parse_range`.
pub(crate) fn check_in_range<T: PartialOrd>(
    domain: &str,
    bounds: &(Option<T>, Option<T>),
    value: &T,
    shown: &str,
) -> AttributeResult<()> {
    let below = bounds.0.as_ref().is_some_and(|low| value < low);
    let above = bounds.1.as_ref().is_some_and(|high| value > high);
    if below || above {
        Err(AttributeError::violation(format!(
            "{shown} is outside domain `{domain}`"
        )))
    } else {
        Ok(())
    }
}

/// Compiles a pattern domain anchored at both ends.
pub(crate) fn compile_pattern(domain: &str) -> AttributeResult<Regex> {
    Regex::new(&format!("^(?:{domain})$"))
        .map_err(|err| AttributeError::invalid(format!("domain `{domain}` is not a valid pattern: {err}")))
}

/// Comma separated list of names, blank entries dropped.
pub(crate) fn name_list(domain: &str) -> AttributeResult<Vec<&str>> {
    let names: Vec<&str> = domain
        .split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .collect();
    if names.is_empty() {
        return Err(AttributeError::invalid(format!(
            "domain `{domain}` names no entries"
        )));
    }
    Ok(names)
}

/// Types without a domain accept only the empty spec.
pub(crate) fn require_empty(type_name: &str, domain: &str) -> AttributeResult<()> {
    if domain.trim().is_empty() {
        Ok(())
    } else {
        Err(AttributeError::invalid(format!(
            "{type_name} attributes do not take a domain (got `{domain}`)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::{check_in_range, compile_pattern, name_list, parse_range, split_range};

    fn int(text: &str) -> Result<i64, String> {
        text.parse::<i64>().map_err(|err| err.to_string())
    }

    #[test]
    fn ranges_allow_open_bounds() {
        assert_eq!(split_range("1..5").unwrap(), (Some("1"), Some("5")));
        assert_eq!(split_range("..5").unwrap(), (None, Some("5")));
        assert_eq!(split_range(" 3 .. ").unwrap(), (Some("3"), None));
        assert!(split_range("3").is_err());
    }

    #[test]
    fn range_checks_are_inclusive() {
        let bounds = parse_range("1..5", int).unwrap();
        assert!(check_in_range("1..5", &bounds, &1, "1").is_ok());
        assert!(check_in_range("1..5", &bounds, &5, "5").is_ok());
        assert!(check_in_range("1..5", &bounds, &6, "6").is_err());
        assert!(parse_range("5..1", int).is_err());
        assert!(parse_range("a..1", int).is_err());
    }

    #[test]
    fn patterns_are_anchored() {
        let pattern = compile_pattern("[a-z]+").unwrap();
        assert!(pattern.is_match("abc"));
        assert!(!pattern.is_match("abc1"));
        assert!(compile_pattern("(").is_err());
    }

    #[test]
    fn name_lists_drop_blanks() {
        assert_eq!(name_list("admin, ,editor").unwrap(), vec!["admin", "editor"]);
        assert!(name_list(" , ").is_err());
    }
}
