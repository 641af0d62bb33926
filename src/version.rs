//! Version conditions and comparison
//!
//! Versions are `productVersion[-packageVersion]`. Each half is split on `.`
//! and every dotted part is compared as alternating runs of digits and
//! non-digits. There is no implicit zero padding: `1.0` sorts before `1.0.0`.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FleetpkgError, Result};

/// Comparison operator of a version condition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Operator {
    /// Check an ordering against this operator
    pub fn matches(self, ordering: Ordering) -> bool {
        match self {
            Operator::Eq => ordering == Ordering::Equal,
            Operator::Lt => ordering == Ordering::Less,
            Operator::Le => ordering != Ordering::Greater,
            Operator::Gt => ordering == Ordering::Greater,
            Operator::Ge => ordering != Ordering::Less,
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::Eq => "==",
            Operator::Lt => "<",
            Operator::Le => "<=",
            Operator::Gt => ">",
            Operator::Ge => ">=",
        };
        f.write_str(s)
    }
}

impl FromStr for Operator {
    type Err = FleetpkgError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "==" | "=" => Ok(Operator::Eq),
            "<" => Ok(Operator::Lt),
            "<=" => Ok(Operator::Le),
            ">" => Ok(Operator::Gt),
            ">=" => Ok(Operator::Ge),
            _ => Err(FleetpkgError::InvalidVersion(format!(
                "unknown operator '{}'",
                s
            ))),
        }
    }
}

/// A version condition such as `>= 2.1-3`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub operator: Operator,
    pub version: String,
}

impl Condition {
    /// Check whether `version` satisfies this condition
    pub fn is_satisfied_by(&self, version: &str) -> Result<bool> {
        compare(version, self.operator, &self.version)
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.operator, self.version)
    }
}

impl FromStr for Condition {
    type Err = FleetpkgError;

    /// Parse `>=1.0`, `(>= 1.0-2)` or a bare version (meaning `==`)
    fn from_str(s: &str) -> Result<Self> {
        let s = s
            .trim()
            .trim_start_matches('(')
            .trim_end_matches(')')
            .trim();

        let split = s
            .find(|c: char| !matches!(c, '<' | '>' | '='))
            .unwrap_or(s.len());
        let (op, version) = s.split_at(split);
        let operator = if op.is_empty() {
            Operator::Eq
        } else {
            op.parse()?
        };

        let version = version.trim();
        validate(version)?;

        Ok(Condition {
            operator,
            version: version.to_string(),
        })
    }
}

/// Compare two versions with an operator, e.g. `compare("2.1-3", Gt, "2.1-2")`
pub fn compare(left: &str, operator: Operator, right: &str) -> Result<bool> {
    validate(left)?;
    validate(right)?;
    Ok(operator.matches(compare_versions(left, right)))
}

/// Compare two version strings given the operator as text
pub fn compare_str(left: &str, operator: &str, right: &str) -> Result<bool> {
    compare(left, operator.parse()?, right)
}

/// Total order over version strings
pub fn compare_versions(left: &str, right: &str) -> Ordering {
    let (left_product, left_package) = split_package(left);
    let (right_product, right_package) = split_package(right);

    compare_dotted(left_product, right_product)
        .then_with(|| compare_dotted(left_package, right_package))
}

fn validate(version: &str) -> Result<()> {
    if version.is_empty() || version.chars().any(char::is_whitespace) {
        return Err(FleetpkgError::InvalidVersion(format!(
            "'{}' is not a version",
            version
        )));
    }
    Ok(())
}

fn split_package(version: &str) -> (&str, &str) {
    match version.split_once('-') {
        Some((product, package)) => (product, package),
        None => (version, ""),
    }
}

fn compare_dotted(left: &str, right: &str) -> Ordering {
    let left_parts: Vec<&str> = left.split('.').filter(|p| !p.is_empty()).collect();
    let right_parts: Vec<&str> = right.split('.').filter(|p| !p.is_empty()).collect();

    for (l, r) in left_parts.iter().zip(right_parts.iter()) {
        let ordering = compare_part(l, r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    left_parts.len().cmp(&right_parts.len())
}

/// Compare one dotted component as runs of digits and non-digits
fn compare_part(left: &str, right: &str) -> Ordering {
    let left_runs = runs(left);
    let right_runs = runs(right);

    for (l, r) in left_runs.iter().zip(right_runs.iter()) {
        let l_numeric = l.starts_with(|c: char| c.is_ascii_digit());
        let r_numeric = r.starts_with(|c: char| c.is_ascii_digit());

        let ordering = match (l_numeric, r_numeric) {
            (true, true) => compare_numeric(l, r),
            (false, false) => l.cmp(r),
            (true, false) => Ordering::Greater,
            (false, true) => Ordering::Less,
        };

        if ordering != Ordering::Equal {
            return ordering;
        }
    }

    left_runs.len().cmp(&right_runs.len())
}

fn compare_numeric(left: &str, right: &str) -> Ordering {
    let l = left.trim_start_matches('0');
    let r = right.trim_start_matches('0');
    l.len().cmp(&r.len()).then_with(|| l.cmp(r))
}

fn runs(part: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    let mut prev_digit: Option<bool> = None;

    for (i, c) in part.char_indices() {
        let digit = c.is_ascii_digit();
        if let Some(prev) = prev_digit {
            if prev != digit {
                result.push(&part[start..i]);
                start = i;
            }
        }
        prev_digit = Some(digit);
    }

    if start < part.len() {
        result.push(&part[start..]);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_package_version_ordering() {
        assert!(compare_str("2.1-3", ">", "2.1-2").unwrap());
        assert!(compare_str("2.1-2", "<=", "2.1-2").unwrap());
        assert!(!compare_str("2.1-3", "<", "2.1-2").unwrap());
        assert!(compare_str("2.10", ">", "2.9").unwrap());
    }

    #[test]
    fn test_no_zero_padding() {
        assert!(!compare_str("1.0", "==", "1.0.0").unwrap());
        assert!(compare_str("1.0", "<", "1.0.0").unwrap());
        assert!(compare_str("1.00", "==", "1.0").unwrap());
    }

    #[test]
    fn test_alphanumeric_parts() {
        assert!(compare_str("1.0rc2", ">", "1.0rc1").unwrap());
        assert!(compare_str("1.0a", "<", "1.0a1").unwrap());
        assert!(compare_str("4.4.1", "=", "4.4.1").unwrap());
    }

    #[test]
    fn test_condition_parsing() {
        let cond: Condition = "(>= 2.0-1)".parse().unwrap();
        assert_eq!(cond.operator, Operator::Ge);
        assert_eq!(cond.version, "2.0-1");
        assert!(cond.is_satisfied_by("2.0-3").unwrap());
        assert!(!cond.is_satisfied_by("1.9-9").unwrap());

        let bare: Condition = "3.1".parse().unwrap();
        assert_eq!(bare.operator, Operator::Eq);

        assert!("!= 1.0".parse::<Condition>().is_err());
        assert!(">=".parse::<Condition>().is_err());
    }
}
