//! Version parsing and requirement matching.
//!
//! A [`Version`] is a dotted sequence of non-negative integers. Missing
//! trailing segments count as zero, so `1.2` and `1.2.0` are the same
//! version. A [`Requirement`] is a conjunction of `(operator, version)`
//! clauses such as `>= 1.0, < 2`.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Raised for version or requirement text that cannot be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// The text is not a dot-separated list of integers.
    #[error("Malformed version number string {0:?}")]
    Version(String),

    /// A requirement clause has an unknown operator or a bad version.
    #[error("Illformed requirement {0:?}")]
    Requirement(String),
}

/// A dotted numeric version such as `1.4.6`.
///
/// Equality, ordering and hashing all work on the zero-padded segment list,
/// while [`Display`](fmt::Display) returns the text the version was parsed
/// from. Segments have no upper bound.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    text: String,
    segments: Vec<Segment>,
}

/// One numeric segment as decimal digits without leading zeros.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Segment(String);

impl Segment {
    fn parse(text: &str) -> Option<Self> {
        if text.is_empty() || !text.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits = text.trim_start_matches('0');
        Some(if digits.is_empty() {
            Self::zero()
        } else {
            Self(digits.to_string())
        })
    }

    fn zero() -> Self {
        Self("0".to_string())
    }

    fn is_zero(&self) -> bool {
        self.0 == "0"
    }

    fn increment(&self) -> Self {
        let mut reversed = String::with_capacity(self.0.len() + 1);
        let mut carry = true;
        for c in self.0.chars().rev() {
            let digit = c.to_digit(10).unwrap_or(0) + u32::from(carry);
            carry = digit == 10;
            reversed.push(char::from_digit(digit % 10, 10).unwrap_or('0'));
        }
        if carry {
            reversed.push('1');
        }
        Self(reversed.chars().rev().collect())
    }
}

impl From<u64> for Segment {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

impl Ord for Segment {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .len()
            .cmp(&other.0.len())
            .then_with(|| self.0.cmp(&other.0))
    }
}

impl PartialOrd for Segment {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Version {
    /// Parse a version string. Surrounding whitespace is ignored and the
    /// empty string is read as `0`.
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Version`] if any segment is empty or not a
    /// non-negative integer.
    pub fn new(text: &str) -> Result<Self, FormatError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::from_segments(vec![0]));
        }

        let segments = trimmed
            .split('.')
            .map(Segment::parse)
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| FormatError::Version(text.to_string()))?;

        Ok(Self {
            text: trimmed.to_string(),
            segments,
        })
    }

    /// Build a version directly from its segments.
    pub fn from_segments(segments: Vec<u64>) -> Self {
        Self::from_parts(segments.into_iter().map(Segment::from).collect())
    }

    fn from_parts(segments: Vec<Segment>) -> Self {
        let text = segments
            .iter()
            .map(|s| s.0.as_str())
            .collect::<Vec<_>>()
            .join(".");
        Self { text, segments }
    }

    /// Whether `text` would parse as a version.
    pub fn is_correct(text: &str) -> bool {
        Self::new(text).is_ok()
    }

    /// The original text of the version.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Upper bound used by the `~>` operator: drop the last segment (unless
    /// there is only one) and increment the new last segment.
    ///
    /// `1.2.3` bumps to `1.3`, `1.2` to `2`, and `1` to `2`.
    pub fn bump(&self) -> Self {
        let mut segments = self.segments.clone();
        if segments.len() > 1 {
            segments.pop();
        }
        if let Some(last) = segments.last_mut() {
            *last = last.increment();
        }
        Self::from_parts(segments)
    }

    /// Segments with trailing zeros removed; the canonical form used for
    /// equality and hashing.
    fn canonical(&self) -> &[Segment] {
        let len = self
            .segments
            .iter()
            .rposition(|s| !s.is_zero())
            .map_or(0, |idx| idx + 1);
        &self.segments[..len]
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.canonical().hash(state);
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        let zero = Segment::zero();
        let len = self.segments.len().max(other.segments.len());
        for i in 0..len {
            let left = self.segments.get(i).unwrap_or(&zero);
            let right = other.segments.get(i).unwrap_or(&zero);
            match left.cmp(right) {
                Ordering::Equal => {}
                unequal => return unequal,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl FromStr for Version {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Version {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Version> for String {
    fn from(version: Version) -> Self {
        version.text
    }
}

/// Comparison operator of a single requirement clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `>`
    Gt,
    /// `<`
    Lt,
    /// `>=`
    Ge,
    /// `<=`
    Le,
    /// `~>`, "approximately greater than".
    Pessimistic,
}

impl Op {
    // Longest operators first so `>=` is not read as `>` followed by `=1`.
    const ALL: [Op; 7] = [
        Op::Pessimistic,
        Op::Ge,
        Op::Le,
        Op::Ne,
        Op::Gt,
        Op::Lt,
        Op::Eq,
    ];

    /// Operator text as written in requirements.
    pub fn as_str(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Ne => "!=",
            Op::Gt => ">",
            Op::Lt => "<",
            Op::Ge => ">=",
            Op::Le => "<=",
            Op::Pessimistic => "~>",
        }
    }

    /// Whether `candidate` passes this operator against `target`.
    pub fn matches(self, candidate: &Version, target: &Version) -> bool {
        match self {
            Op::Eq => candidate == target,
            Op::Ne => candidate != target,
            Op::Gt => candidate > target,
            Op::Lt => candidate < target,
            Op::Ge => candidate >= target,
            Op::Le => candidate <= target,
            Op::Pessimistic => candidate >= target && *candidate < target.bump(),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A predicate over versions: every clause must hold.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Requirement {
    clauses: Vec<(Op, Version)>,
}

impl Requirement {
    /// Parse a comma-separated list of clauses such as `>= 1.0, < 2`.
    /// A clause without an operator means `=`. Empty text yields the
    /// default requirement (`> 0.0.0`).
    ///
    /// # Errors
    ///
    /// Returns [`FormatError::Requirement`] if a clause is empty, names an
    /// unknown operator, or carries a malformed version.
    pub fn parse(text: &str) -> Result<Self, FormatError> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let clauses = text
            .split(',')
            .map(|clause| {
                parse_clause(clause).ok_or_else(|| FormatError::Requirement(text.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { clauses })
    }

    /// A requirement matching exactly one version.
    pub fn exact(version: Version) -> Self {
        Self {
            clauses: vec![(Op::Eq, version)],
        }
    }

    /// A requirement built from explicit clauses. An empty list yields the
    /// default requirement.
    pub fn from_clauses(clauses: Vec<(Op, Version)>) -> Self {
        if clauses.is_empty() {
            return Self::default();
        }
        Self { clauses }
    }

    /// The clauses in declaration order.
    pub fn clauses(&self) -> &[(Op, Version)] {
        &self.clauses
    }

    /// Whether `version` satisfies every clause.
    pub fn satisfied_by(&self, version: &Version) -> bool {
        self.clauses
            .iter()
            .all(|(op, target)| op.matches(version, target))
    }
}

fn parse_clause(clause: &str) -> Option<(Op, Version)> {
    let clause = clause.trim();
    if clause.is_empty() {
        return None;
    }

    for op in Op::ALL {
        if let Some(rest) = clause.strip_prefix(op.as_str()) {
            let rest = rest.trim();
            if rest.is_empty() {
                return None;
            }
            return Version::new(rest).ok().map(|v| (op, v));
        }
    }

    Version::new(clause).ok().map(|v| (Op::Eq, v))
}

impl Default for Requirement {
    /// `> 0.0.0`: everything except an explicit zero release.
    fn default() -> Self {
        Self {
            clauses: vec![(Op::Gt, Version::from_segments(vec![0, 0, 0]))],
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered = self
            .clauses
            .iter()
            .map(|(op, version)| format!("{op} {version}"))
            .collect::<Vec<_>>()
            .join(", ");
        f.write_str(&rendered)
    }
}

impl FromStr for Requirement {
    type Err = FormatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Requirement {
    type Error = FormatError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Requirement> for String {
    fn from(requirement: Requirement) -> Self {
        requirement.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::new(s).unwrap()
    }

    fn req(s: &str) -> Requirement {
        Requirement::parse(s).unwrap()
    }

    #[test]
    fn test_zero_padding_is_equal() {
        assert_eq!(v("1.2"), v("1.2.0"));
        assert_eq!(v("1"), v("1.0.0.0"));
        assert_eq!(v(""), v("0"));
        assert_eq!(v("1.2").cmp(&v("1.2.0")), Ordering::Equal);
    }

    #[test]
    fn test_equal_versions_hash_alike() {
        use std::collections::HashSet;
        let set: HashSet<Version> = [v("1.2"), v("1.2.0"), v("1.2.0.0")].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_ordering_is_numeric() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("2") > v("1.99.99"));
        assert!(v("1.2.1") > v("1.2"));
        assert!(v("0.0.1") > v("0.0.0"));
    }

    #[test]
    fn test_display_keeps_original_text() {
        assert_eq!(v(" 1.2 ").to_string(), "1.2");
        assert_eq!(v("").to_string(), "0");
    }

    #[test]
    fn test_malformed_versions() {
        for bad in ["1.a", "1..2", "-1", "1.2-beta", ".1", "1."] {
            assert!(
                matches!(Version::new(bad), Err(FormatError::Version(_))),
                "{bad} should be rejected"
            );
        }
        assert!(!Version::is_correct("junk"));
        assert!(Version::is_correct("10.0.1"));
    }

    #[test]
    fn test_bump() {
        assert_eq!(v("1.2.3").bump(), v("1.3"));
        assert_eq!(v("1.2").bump(), v("2"));
        assert_eq!(v("1").bump(), v("2"));
        assert_eq!(v("1.9.4").bump(), v("1.10"));
        assert_eq!(v("0.99").bump(), v("1"));
    }

    #[test]
    fn test_segments_wider_than_u64() {
        let max = u64::MAX.to_string();
        assert_eq!(v(&format!("{max}.7")).bump(), v("18446744073709551616"));
        assert!(v("99999999999999999999999") > v(&max));
        assert_eq!(v("007.0100"), v("7.100"));
        assert_eq!(v("007.0100").to_string(), "007.0100");

        let r = req(&format!("~> {max}.0"));
        assert!(r.satisfied_by(&v(&format!("{max}.12"))));
        assert!(!r.satisfied_by(&v("18446744073709551616")));
    }

    #[test]
    fn test_default_requirement_excludes_zero() {
        let default = Requirement::default();
        assert_eq!(default.to_string(), "> 0.0.0");
        assert!(!default.satisfied_by(&v("0.0.0")));
        assert!(!default.satisfied_by(&v("0")));
        assert!(default.satisfied_by(&v("0.0.1")));
        assert!(default.satisfied_by(&v("3")));
        assert_eq!(req(""), default);
    }

    #[test]
    fn test_pessimistic_two_segments() {
        let r = req("~> 1.2");
        for ok in ["1.2", "1.2.5", "1.9", "1.99.1"] {
            assert!(r.satisfied_by(&v(ok)), "{ok} should satisfy ~> 1.2");
        }
        for bad in ["2.0", "1.1.9", "2"] {
            assert!(!r.satisfied_by(&v(bad)), "{bad} should not satisfy ~> 1.2");
        }
    }

    #[test]
    fn test_pessimistic_three_segments() {
        let r = req("~> 1.2.0");
        assert!(r.satisfied_by(&v("1.2.0")));
        assert!(r.satisfied_by(&v("1.2.9")));
        assert!(!r.satisfied_by(&v("1.3")));
        assert!(!r.satisfied_by(&v("1.1.9")));
    }

    #[test]
    fn test_operators() {
        let two = v("2");
        assert!(req("= 2.0").satisfied_by(&two));
        assert!(req("2").satisfied_by(&two));
        assert!(!req("!= 2").satisfied_by(&two));
        assert!(req(">= 2").satisfied_by(&two));
        assert!(!req("> 2").satisfied_by(&two));
        assert!(req("<= 2").satisfied_by(&two));
        assert!(!req("< 2").satisfied_by(&two));
    }

    #[test]
    fn test_conjunction() {
        let r = req(">= 1.0, < 2");
        assert_eq!(r.clauses().len(), 2);
        assert!(r.satisfied_by(&v("1.5")));
        assert!(!r.satisfied_by(&v("2.0")));
        assert!(!r.satisfied_by(&v("0.9")));
        assert_eq!(r.to_string(), ">= 1.0, < 2");
    }

    #[test]
    fn test_malformed_requirements() {
        for bad in ["=> 1", ">", "1,,2", "~> x", "<< 1"] {
            assert!(
                matches!(Requirement::parse(bad), Err(FormatError::Requirement(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_serde_as_string() {
        #[derive(Serialize, Deserialize)]
        struct Holder {
            version: Version,
            requirement: Requirement,
        }

        let holder: Holder =
            toml::from_str("version = \"1.4\"\nrequirement = \"~> 1.2\"\n").unwrap();
        assert_eq!(holder.version, v("1.4"));
        assert!(holder.requirement.satisfied_by(&holder.version));

        let text = toml::to_string(&holder).unwrap();
        assert!(text.contains("requirement = \"~> 1.2\""));

        let bad: Result<Holder, _> = toml::from_str("version = \"x\"\nrequirement = \"1\"\n");
        assert!(bad.is_err());
    }
}
