//! Label selector evaluation
//!
//! Custom resources carry `metav1.LabelSelector` values whose meaning depends
//! on presence: an absent selector selects nothing, an empty selector selects
//! everything. [`SelectorCriteria`] makes the three cases explicit and is
//! validated once, so a malformed selector surfaces as an error instead of
//! silently matching.

use crate::error::{OperatorError, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

/// Optional DNS subdomain prefix followed by a qualified name
static LABEL_KEY_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$",
    )
    .unwrap()
});

static LABEL_VALUE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").unwrap()
});

/// Label selector operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operator::In => write!(f, "in"),
            Operator::NotIn => write!(f, "notin"),
            Operator::Exists => write!(f, "exists"),
            Operator::DoesNotExist => write!(f, "!"),
        }
    }
}

/// One `key op values` term of a selector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    pub values: BTreeSet<String>,
}

impl Requirement {
    fn new(key: &str, operator: &str, values: &[String]) -> Result<Self> {
        if !is_valid_label_key(key) {
            return Err(OperatorError::InvalidSelector(format!(
                "invalid label key '{}'",
                key
            )));
        }
        let operator = match operator {
            "In" => Operator::In,
            "NotIn" => Operator::NotIn,
            "Exists" => Operator::Exists,
            "DoesNotExist" => Operator::DoesNotExist,
            other => {
                return Err(OperatorError::InvalidSelector(format!(
                    "'{}' is not a valid label selector operator",
                    other
                )))
            }
        };
        match operator {
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(OperatorError::InvalidSelector(format!(
                    "values for key '{}' must be non-empty for operator {}",
                    key, operator
                )));
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(OperatorError::InvalidSelector(format!(
                    "values for key '{}' must be empty for operator {}",
                    key, operator
                )));
            }
            _ => {}
        }
        if let Some(bad) = values.iter().find(|v| !is_valid_label_value(v)) {
            return Err(OperatorError::InvalidSelector(format!(
                "invalid label value '{}' for key '{}'",
                bad, key
            )));
        }
        Ok(Self {
            key: key.to_string(),
            operator,
            values: values.iter().cloned().collect(),
        })
    }

    fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self.operator {
            Operator::In => labels.get(&self.key).is_some_and(|v| self.values.contains(v)),
            Operator::NotIn => !labels.get(&self.key).is_some_and(|v| self.values.contains(v)),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let values = self.values.iter().cloned().collect::<Vec<_>>().join(",");
        match self.operator {
            Operator::In if self.values.len() == 1 => write!(f, "{}={}", self.key, values),
            Operator::In | Operator::NotIn => {
                write!(f, "{} {} ({})", self.key, self.operator, values)
            }
            Operator::Exists => write!(f, "{}", self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// What a selector selects
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorCriteria {
    /// Every object
    Everything,
    /// No object
    Nothing,
    /// Objects whose labels satisfy all requirements
    Matches(Vec<Requirement>),
}

impl SelectorCriteria {
    /// Convert an optional label selector: `None` selects nothing, an empty
    /// selector selects everything.
    pub fn from_label_selector(selector: Option<&LabelSelector>) -> Result<Self> {
        let Some(selector) = selector else {
            return Ok(SelectorCriteria::Nothing);
        };

        let mut requirements = Vec::new();
        if let Some(match_labels) = &selector.match_labels {
            for (key, value) in match_labels {
                requirements.push(Requirement::new(key, "In", &[value.clone()])?);
            }
        }
        if let Some(expressions) = &selector.match_expressions {
            for expr in expressions {
                let values = expr.values.clone().unwrap_or_default();
                requirements.push(Requirement::new(&expr.key, &expr.operator, &values)?);
            }
        }

        if requirements.is_empty() {
            Ok(SelectorCriteria::Everything)
        } else {
            requirements.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(SelectorCriteria::Matches(requirements))
        }
    }

    /// Selector from exact-match labels, mainly for operator-owned selectors.
    pub fn from_match_labels<'a>(labels: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let requirements: Vec<Requirement> = labels
            .into_iter()
            .map(|(k, v)| Requirement {
                key: k.to_string(),
                operator: Operator::In,
                values: BTreeSet::from([v.to_string()]),
            })
            .collect();
        if requirements.is_empty() {
            SelectorCriteria::Everything
        } else {
            SelectorCriteria::Matches(requirements)
        }
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        match self {
            SelectorCriteria::Everything => true,
            SelectorCriteria::Nothing => false,
            SelectorCriteria::Matches(requirements) => {
                requirements.iter().all(|r| r.matches(labels))
            }
        }
    }

    pub fn is_everything(&self) -> bool {
        matches!(self, SelectorCriteria::Everything)
    }
}

impl fmt::Display for SelectorCriteria {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorCriteria::Everything => Ok(()),
            SelectorCriteria::Nothing => write!(f, "<none>"),
            SelectorCriteria::Matches(requirements) => {
                let terms: Vec<String> = requirements.iter().map(|r| r.to_string()).collect();
                write!(f, "{}", terms.join(","))
            }
        }
    }
}

pub fn is_valid_label_key(key: &str) -> bool {
    let name = key.rsplit_once('/').map_or(key, |(_, name)| name);
    key.len() <= 316 && name.len() <= 63 && LABEL_KEY_REGEX.is_match(key)
}

pub fn is_valid_label_value(value: &str) -> bool {
    value.len() <= 63 && LABEL_VALUE_REGEX.is_match(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn expression(key: &str, op: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: op.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_absent_selector_matches_nothing() {
        let criteria = SelectorCriteria::from_label_selector(None).unwrap();
        assert_eq!(criteria, SelectorCriteria::Nothing);
        assert!(!criteria.matches(&labels(&[])));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        let criteria = SelectorCriteria::from_label_selector(Some(&LabelSelector::default()))
            .unwrap();
        assert!(criteria.is_everything());
        assert!(criteria.matches(&labels(&[("any", "thing")])));
    }

    #[test]
    fn test_match_labels_and_expressions() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("role", "alert-rules")])),
            match_expressions: Some(vec![
                expression("env", "In", &["prod", "staging"]),
                expression("deprecated", "DoesNotExist", &[]),
            ]),
        };
        let criteria = SelectorCriteria::from_label_selector(Some(&selector)).unwrap();

        assert!(criteria.matches(&labels(&[("role", "alert-rules"), ("env", "prod")])));
        assert!(!criteria.matches(&labels(&[("role", "alert-rules"), ("env", "dev")])));
        assert!(!criteria.matches(&labels(&[
            ("role", "alert-rules"),
            ("env", "prod"),
            ("deprecated", "true")
        ])));
        assert!(!criteria.matches(&labels(&[("env", "prod")])));
    }

    #[test]
    fn test_not_in_matches_missing_key() {
        let selector = LabelSelector {
            match_expressions: Some(vec![expression("tier", "NotIn", &["debug"])]),
            ..Default::default()
        };
        let criteria = SelectorCriteria::from_label_selector(Some(&selector)).unwrap();
        assert!(criteria.matches(&labels(&[])));
        assert!(criteria.matches(&labels(&[("tier", "prod")])));
        assert!(!criteria.matches(&labels(&[("tier", "debug")])));
    }

    #[test]
    fn test_malformed_selectors_are_errors() {
        let cases = vec![
            expression("env", "Near", &["x"]),
            expression("env", "In", &[]),
            expression("env", "Exists", &["x"]),
            expression("bad key!", "Exists", &[]),
            expression("env", "In", &["not a value"]),
        ];
        for expr in cases {
            let selector = LabelSelector {
                match_expressions: Some(vec![expr.clone()]),
                ..Default::default()
            };
            let err = SelectorCriteria::from_label_selector(Some(&selector)).unwrap_err();
            assert!(
                matches!(err, OperatorError::InvalidSelector(_)),
                "{:?} should be rejected",
                expr
            );
        }
    }

    #[test]
    fn test_display() {
        let selector = LabelSelector {
            match_labels: Some(labels(&[("app", "x")])),
            match_expressions: Some(vec![
                expression("env", "NotIn", &["dev", "test"]),
                expression("legacy", "DoesNotExist", &[]),
            ]),
        };
        let criteria = SelectorCriteria::from_label_selector(Some(&selector)).unwrap();
        assert_eq!(criteria.to_string(), "app=x,env notin (dev,test),!legacy");
    }

    #[test]
    fn test_label_key_validation() {
        assert!(is_valid_label_key("app.kubernetes.io/name"));
        assert!(is_valid_label_key("team"));
        assert!(!is_valid_label_key("-team"));
        assert!(!is_valid_label_key("Example.com/x"));
        assert!(is_valid_label_value(""));
        assert!(!is_valid_label_value("-x"));
    }
}
