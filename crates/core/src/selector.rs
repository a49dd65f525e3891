//! Label selector evaluation.
//!
//! A selector is the AND of its `matchLabels` pairs and `matchExpressions`
//! requirements. Lists of selectors are OR'd by [`matches_any`]; an empty list
//! matches nothing, while an empty selector `{}` matches every label map.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Labels;

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$").expect("static regex"));
static PREFIX_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").expect("static regex")
});

const MAX_NAME_LEN: usize = 63;
const MAX_PREFIX_LEN: usize = 253;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Operator::In => "in",
            Operator::NotIn => "notin",
            Operator::Exists => "exists",
            Operator::DoesNotExist => "!exists",
        };
        f.write_str(s)
    }
}

/// One set-based term of a selector.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct Requirement {
    pub key: String,
    pub operator: Operator,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<String>,
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: Operator, values: &[&str]) -> Self {
        Self { key: key.into(), operator, values: values.iter().map(|v| v.to_string()).collect() }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        match self.operator {
            Operator::In => labels.get(&self.key).map(|v| self.values.iter().any(|x| x == v)).unwrap_or(false),
            Operator::NotIn => labels.get(&self.key).map(|v| !self.values.iter().any(|x| x == v)).unwrap_or(true),
            Operator::Exists => labels.contains_key(&self.key),
            Operator::DoesNotExist => !labels.contains_key(&self.key),
        }
    }

    fn validate(&self) -> Result<(), SelectorError> {
        validate_key(&self.key)?;
        match self.operator {
            Operator::In | Operator::NotIn => {
                if self.values.is_empty() {
                    return Err(SelectorError::MissingValues { key: self.key.clone(), operator: self.operator });
                }
                for v in &self.values {
                    validate_value(&self.key, v)?;
                }
            }
            Operator::Exists | Operator::DoesNotExist => {
                if !self.values.is_empty() {
                    return Err(SelectorError::UnexpectedValues { key: self.key.clone(), operator: self.operator });
                }
            }
        }
        Ok(())
    }
}

/// Kubernetes-style label selector.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub struct LabelSelector {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub match_labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub match_expressions: Vec<Requirement>,
}

impl LabelSelector {
    /// Selector made only of equality terms.
    pub fn from_labels<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            match_labels: pairs.into_iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
            match_expressions: Vec::new(),
        }
    }

    pub fn with_expression(mut self, req: Requirement) -> Self {
        self.match_expressions.push(req);
        self
    }

    pub fn is_empty(&self) -> bool { self.match_labels.is_empty() && self.match_expressions.is_empty() }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.match_labels.iter().all(|(k, v)| labels.get(k) == Some(v))
            && self.match_expressions.iter().all(|r| r.matches(labels))
    }

    pub fn validate(&self) -> Result<(), SelectorError> {
        for (k, v) in &self.match_labels {
            validate_key(k)?;
            validate_value(k, v)?;
        }
        for r in &self.match_expressions {
            r.validate()?;
        }
        Ok(())
    }
}

/// OR across a selector list. An empty list is false, not "match everything".
pub fn matches_any(selectors: &[LabelSelector], labels: &Labels) -> bool {
    selectors.iter().any(|s| s.matches(labels))
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("<everything>");
        }
        let mut terms: Vec<String> = self.match_labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
        for r in &self.match_expressions {
            match r.operator {
                Operator::Exists => terms.push(r.key.clone()),
                Operator::DoesNotExist => terms.push(format!("!{}", r.key)),
                op => terms.push(format!("{} {} ({})", r.key, op, r.values.join(","))),
            }
        }
        f.write_str(&terms.join(","))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SelectorError {
    #[error("invalid label key {0:?}")]
    InvalidKey(String),
    #[error("invalid value {value:?} for label key {key:?}")]
    InvalidValue { key: String, value: String },
    #[error("operator {operator} on key {key:?} requires at least one value")]
    MissingValues { key: String, operator: Operator },
    #[error("operator {operator} on key {key:?} takes no values")]
    UnexpectedValues { key: String, operator: Operator },
}

fn validate_key(key: &str) -> Result<(), SelectorError> {
    let (prefix, name) = match key.split_once('/') {
        Some((p, n)) => (Some(p), n),
        None => (None, key),
    };
    if let Some(p) = prefix {
        if p.is_empty() || p.len() > MAX_PREFIX_LEN || !PREFIX_RE.is_match(p) {
            return Err(SelectorError::InvalidKey(key.to_string()));
        }
    }
    if name.is_empty() || name.len() > MAX_NAME_LEN || !NAME_RE.is_match(name) {
        return Err(SelectorError::InvalidKey(key.to_string()));
    }
    Ok(())
}

fn validate_value(key: &str, value: &str) -> Result<(), SelectorError> {
    if value.is_empty() { return Ok(()); }
    if value.len() > MAX_NAME_LEN || !NAME_RE.is_match(value) {
        return Err(SelectorError::InvalidValue { key: key.to_string(), value: value.to_string() });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> Labels {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn equality_terms_are_conjunctive() {
        let sel = LabelSelector::from_labels([("label1", "test1"), ("label2", "test2")]);
        assert!(sel.matches(&labels(&[("label1", "test1"), ("label2", "test2"), ("x", "y")])));
        assert!(!sel.matches(&labels(&[("label1", "test1")])));
        assert!(!sel.matches(&labels(&[("label1", "test1"), ("label2", "other")])));
    }

    #[test]
    fn set_operators() {
        let l = labels(&[("name", "cluster2"), ("tier", "edge")]);
        assert!(Requirement::new("name", Operator::In, &["cluster1", "cluster2"]).matches(&l));
        assert!(!Requirement::new("name", Operator::In, &["cluster1"]).matches(&l));
        assert!(Requirement::new("name", Operator::NotIn, &["cluster1"]).matches(&l));
        assert!(Requirement::new("zone", Operator::NotIn, &["a"]).matches(&l), "absent key satisfies NotIn");
        assert!(Requirement::new("tier", Operator::Exists, &[]).matches(&l));
        assert!(!Requirement::new("zone", Operator::Exists, &[]).matches(&l));
        assert!(Requirement::new("zone", Operator::DoesNotExist, &[]).matches(&l));
        assert!(!Requirement::new("tier", Operator::DoesNotExist, &[]).matches(&l));
    }

    #[test]
    fn empty_selector_matches_everything_but_empty_list_matches_nothing() {
        let l = labels(&[("a", "b")]);
        assert!(LabelSelector::default().matches(&l));
        assert!(LabelSelector::default().matches(&Labels::new()));
        assert!(!matches_any(&[], &l));
        assert!(matches_any(&[LabelSelector::default()], &l));
    }

    #[test]
    fn mixed_terms_and_any() {
        let one = LabelSelector::from_labels([("name", "cluster1")]);
        let set = LabelSelector::default()
            .with_expression(Requirement::new("name", Operator::In, &["cluster1", "cluster2", "cluster3"]));
        let list = vec![one, set];
        for n in ["cluster1", "cluster2", "cluster3"] {
            assert!(matches_any(&list, &labels(&[("name", n)])), "{n}");
        }
        assert!(!matches_any(&list, &labels(&[("name", "cluster4")])));
    }

    #[test]
    fn validation_rejects_bad_input() {
        assert!(LabelSelector::from_labels([("app.kubernetes.io/name", "nginx")]).validate().is_ok());
        assert!(matches!(
            LabelSelector::from_labels([("bad key", "x")]).validate(),
            Err(SelectorError::InvalidKey(_))
        ));
        assert!(matches!(
            LabelSelector::from_labels([("k", "bad value!")]).validate(),
            Err(SelectorError::InvalidValue { .. })
        ));
        let no_values = LabelSelector::default().with_expression(Requirement::new("k", Operator::In, &[]));
        assert!(matches!(no_values.validate(), Err(SelectorError::MissingValues { .. })));
        let extra = LabelSelector::default().with_expression(Requirement::new("k", Operator::Exists, &["v"]));
        assert!(matches!(extra.validate(), Err(SelectorError::UnexpectedValues { .. })));
    }

    #[test]
    fn deserializes_kubernetes_shape() {
        let sel: LabelSelector = serde_json::from_value(serde_json::json!({
            "matchLabels": {"location-group": "edge"},
            "matchExpressions": [{"key": "name", "operator": "NotIn", "values": ["x"]}]
        }))
        .unwrap();
        assert_eq!(sel.match_labels.get("location-group").map(String::as_str), Some("edge"));
        assert_eq!(sel.match_expressions[0].operator, Operator::NotIn);
        assert_eq!(sel.to_string(), "location-group=edge,name notin (x)");
    }
}
