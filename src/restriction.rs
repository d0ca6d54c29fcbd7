//! Restriction expressions: declarative constraints on node values.
//!
//! A restriction is a comma-separated list of `name='value'` clauses.
//! Commas and quotes inside a clause value must be escaped with `\`;
//! the split is quote-aware. A candidate value is accepted only if every
//! present clause accepts it.

use regex::Regex;

/// Parsed restriction expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Restriction {
    clauses: Vec<(String, String)>,
}

impl Restriction {
    /// Parse a restriction string. An empty string parses to a
    /// restriction that accepts everything.
    pub fn parse(raw: &str) -> Result<Restriction, String> {
        if raw.trim().is_empty() {
            return Ok(Restriction::default());
        }
        let mut clauses = Vec::new();
        for part in split_quote_aware(raw)? {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let eq = part
                .find('=')
                .ok_or_else(|| format!("clause without '=': {}", part))?;
            let name = part[..eq].trim().to_string();
            let quoted = part[eq + 1..].trim();
            if quoted.len() < 2 || !quoted.starts_with('\'') || !quoted.ends_with('\'') {
                return Err(format!("clause value not quoted: {}", part));
            }
            let value = unescape(&quoted[1..quoted.len() - 1]);
            clauses.push((name, value));
        }
        Ok(Restriction { clauses })
    }

    /// Look up a clause value by name.
    pub fn clause(&self, name: &str) -> Option<&str> {
        self.clauses
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Check a candidate value against every value clause.
    ///
    /// An absent candidate always passes: structural writes carry no value
    /// to validate. A non-numeric candidate checked against a numeric
    /// bound is a rejection, never a panic.
    pub fn evaluate(&self, candidate: Option<&str>) -> Result<(), String> {
        let value = match candidate {
            Some(v) => v,
            None => return Ok(()),
        };
        if let Some(min) = self.clause("minimumValue") {
            check_bound(value, min, false)?;
        }
        if let Some(max) = self.clause("maximumValue") {
            check_bound(value, max, true)?;
        }
        if let Some(pattern) = self.clause("regularExpression") {
            let anchored = format!("^(?:{})$", pattern);
            let re = Regex::new(&anchored)
                .map_err(|e| format!("invalid regularExpression clause: {}", e))?;
            if !re.is_match(value) {
                return Err(format!("'{}' does not match pattern '{}'", value, pattern));
            }
        }
        Ok(())
    }

    /// Cardinality bounds for list nodes: (minimumEntries, maximumEntries).
    ///
    /// Enforcement lives in the list-model layer; only the grammar is
    /// shared here.
    pub fn entry_bounds(&self) -> (Option<u64>, Option<u64>) {
        let parse = |name| self.clause(name).and_then(|v| v.parse::<u64>().ok());
        (parse("minimumEntries"), parse("maximumEntries"))
    }

    /// Allowed element types for list nodes; empty when unrestricted.
    pub fn allowed_types(&self) -> Vec<String> {
        self.clause("allowedTypes")
            .map(|v| {
                v.split(',')
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Convenience entry point: parse and evaluate in one step.
///
/// A restriction string that fails to parse rejects every candidate.
pub fn evaluate(candidate: Option<&str>, restriction: &str) -> bool {
    match Restriction::parse(restriction) {
        Ok(r) => r.evaluate(candidate).is_ok(),
        Err(_) => false,
    }
}

fn check_bound(value: &str, bound: &str, upper: bool) -> Result<(), String> {
    let bound_num: i64 = bound
        .trim()
        .parse()
        .map_err(|_| format!("non-numeric bound '{}'", bound))?;
    let value_num: i64 = value
        .trim()
        .parse()
        .map_err(|_| format!("non-numeric value '{}' against numeric bound", value))?;
    let ok = if upper { value_num <= bound_num } else { value_num >= bound_num };
    if ok {
        Ok(())
    } else if upper {
        Err(format!("{} exceeds maximum {}", value_num, bound_num))
    } else {
        Err(format!("{} below minimum {}", value_num, bound_num))
    }
}

/// Split on commas that are outside single quotes; `\` escapes the next
/// character inside a quoted section.
fn split_quote_aware(raw: &str) -> Result<Vec<String>, String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for ch in raw.chars() {
        if escaped {
            current.push('\\');
            current.push(ch);
            escaped = false;
            continue;
        }
        match ch {
            '\\' if in_quotes => escaped = true,
            '\'' => {
                in_quotes = !in_quotes;
                current.push(ch);
            }
            ',' if !in_quotes => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(ch),
        }
    }
    if in_quotes || escaped {
        return Err(format!("unterminated quote in restriction: {}", raw));
    }
    parts.push(current);
    Ok(parts)
}

fn unescape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut escaped = false;
    for ch in raw.chars() {
        if escaped {
            out.push(ch);
            escaped = false;
        } else if ch == '\\' {
            escaped = true;
        } else {
            out.push(ch);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_value_boundary() {
        assert!(evaluate(Some("5"), "minimumValue='5'"));
        assert!(!evaluate(Some("4"), "minimumValue='5'"));
        assert!(evaluate(Some("-3"), "minimumValue='-10'"));
    }

    #[test]
    fn test_maximum_value_boundary() {
        assert!(evaluate(Some("10"), "maximumValue='10'"));
        assert!(!evaluate(Some("11"), "maximumValue='10'"));
    }

    #[test]
    fn test_combined_range() {
        let restriction = "minimumValue='0',maximumValue='100'";
        assert!(evaluate(Some("0"), restriction));
        assert!(evaluate(Some("100"), restriction));
        assert!(!evaluate(Some("-1"), restriction));
        assert!(!evaluate(Some("101"), restriction));
    }

    #[test]
    fn test_empty_restriction_accepts_everything() {
        assert!(evaluate(None, ""));
        assert!(evaluate(Some("anything"), ""));
        assert!(evaluate(Some("x"), "   "));
    }

    #[test]
    fn test_absent_candidate_accepts() {
        assert!(evaluate(None, "minimumValue='5'"));
    }

    #[test]
    fn test_non_numeric_value_rejects_not_panics() {
        assert!(!evaluate(Some("abc"), "minimumValue='5'"));
    }

    #[test]
    fn test_regular_expression_full_match() {
        assert!(evaluate(Some("abc"), "regularExpression='a.c'"));
        assert!(!evaluate(Some("xabc"), "regularExpression='a.c'"));
        assert!(!evaluate(Some("abcd"), "regularExpression='a.c'"));
    }

    #[test]
    fn test_quote_aware_split_keeps_commas_in_values() {
        let r = Restriction::parse("regularExpression='a{1,3}',minimumValue='1'").unwrap();
        assert_eq!(r.clause("regularExpression"), Some("a{1,3}"));
        assert_eq!(r.clause("minimumValue"), Some("1"));
    }

    #[test]
    fn test_escaped_quote_inside_value() {
        let r = Restriction::parse(r"regularExpression='it\'s'").unwrap();
        assert_eq!(r.clause("regularExpression"), Some("it's"));
    }

    #[test]
    fn test_malformed_restriction_rejects() {
        assert!(!evaluate(Some("5"), "minimumValue=5"));
        assert!(!evaluate(Some("5"), "minimumValue='5"));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn prop_evaluate_never_panics(value in ".*", restriction in ".*") {
                let _ = evaluate(Some(&value), &restriction);
            }

            #[test]
            fn prop_numeric_bounds_agree_with_integer_order(
                value in -10_000i64..10_000,
                min in -10_000i64..10_000,
            ) {
                let restriction = format!("minimumValue='{}'", min);
                prop_assert_eq!(evaluate(Some(&value.to_string()), &restriction), value >= min);
            }

            #[test]
            fn prop_parse_round_trips_simple_clauses(
                name in "[a-zA-Z]{1,12}",
                value in "[a-zA-Z0-9/_.-]{0,16}",
            ) {
                let raw = format!("{}='{}'", name, value);
                let parsed = Restriction::parse(&raw).unwrap();
                prop_assert_eq!(parsed.clause(&name), Some(value.as_str()));
            }
        }
    }

    #[test]
    fn test_list_clauses_exposed_not_enforced() {
        let r = Restriction::parse(
            "minimumEntries='1',maximumEntries='4',allowedTypes='/basic/text,/basic/number'",
        )
        .unwrap();
        assert_eq!(r.entry_bounds(), (Some(1), Some(4)));
        assert_eq!(r.allowed_types(), vec!["/basic/text", "/basic/number"]);
        assert!(r.evaluate(Some("whatever")).is_ok());
    }
}
