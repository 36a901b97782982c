use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

/// A shared, immutable label map.
#[derive(Clone, Debug, Default)]
pub struct Labels(Arc<Map>);

pub type Map = BTreeMap<String, String>;

pub type Expressions = Vec<Expression>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Expression {
    pub key: String,
    pub operator: Operator,
    pub values: Option<BTreeSet<String>>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Operator {
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

/// Selects a set of endpoints by their labels. The results of
/// `match_labels` and `match_expressions` are ANDed. Evaluation is total:
/// a missing label is distinct from a present-but-empty one.
#[derive(Clone, Debug, Eq, PartialEq, Default)]
pub struct Selector {
    match_labels: Option<Map>,
    match_expressions: Option<Expressions>,
}

// === impl Selector ===

impl Selector {
    pub fn new(labels: Map, exprs: Expressions) -> Self {
        Self {
            match_labels: Some(labels),
            match_expressions: Some(exprs),
        }
    }

    pub fn from_expressions(exprs: Expressions) -> Self {
        Self {
            match_labels: None,
            match_expressions: Some(exprs),
        }
    }

    pub fn from_map(map: Map) -> Self {
        Self {
            match_labels: Some(map),
            match_expressions: None,
        }
    }

    /// Indicates whether this selector matches all endpoints.
    pub fn selects_all(&self) -> bool {
        match (self.match_labels.as_ref(), self.match_expressions.as_ref()) {
            (None, None) => true,
            (Some(l), None) => l.is_empty(),
            (None, Some(e)) => e.is_empty(),
            (Some(l), Some(e)) => l.is_empty() && e.is_empty(),
        }
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        for expr in self.match_expressions.iter().flatten() {
            if !expr.matches(labels.as_ref()) {
                return false;
            }
        }

        if let Some(match_labels) = self.match_labels.as_ref() {
            for (k, v) in match_labels {
                if labels.0.get(k) != Some(v) {
                    return false;
                }
            }
        }

        true
    }
}

impl std::iter::FromIterator<(String, String)> for Selector {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self::from_map(iter.into_iter().collect())
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Selector {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        Self::from_map(
            iter.into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }
}

impl std::iter::FromIterator<Expression> for Selector {
    fn from_iter<T: IntoIterator<Item = Expression>>(iter: T) -> Self {
        Self::from_expressions(iter.into_iter().collect())
    }
}

// === impl Labels ===

impl Labels {
    /// Overlays `self` on top of `base`: keys present in both resolve to
    /// `self`'s value.
    pub fn overlaid_on(&self, base: &Labels) -> Labels {
        if base.0.is_empty() {
            return self.clone();
        }
        let mut merged = base.0.as_ref().clone();
        for (k, v) in self.0.iter() {
            merged.insert(k.clone(), v.clone());
        }
        merged.into()
    }
}

impl From<Option<Map>> for Labels {
    #[inline]
    fn from(labels: Option<Map>) -> Self {
        labels.unwrap_or_default().into()
    }
}

impl From<Map> for Labels {
    #[inline]
    fn from(labels: Map) -> Self {
        Self(Arc::new(labels))
    }
}

impl AsRef<Map> for Labels {
    #[inline]
    fn as_ref(&self) -> &Map {
        self.0.as_ref()
    }
}

impl std::cmp::PartialEq<Self> for Labels {
    #[inline]
    fn eq(&self, t: &Self) -> bool {
        self.0.as_ref().eq(t.as_ref())
    }
}

impl std::iter::FromIterator<(String, String)> for Labels {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(Arc::new(iter.into_iter().collect()))
    }
}

impl std::iter::FromIterator<(&'static str, &'static str)> for Labels {
    fn from_iter<T: IntoIterator<Item = (&'static str, &'static str)>>(iter: T) -> Self {
        iter.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

// === impl Expression ===

impl Expression {
    fn matches(&self, labels: &Map) -> bool {
        match (self.operator, &self.key, self.values.as_ref()) {
            (Operator::In, key, Some(values)) => match labels.get(key) {
                Some(v) => values.contains(v),
                None => false,
            },
            (Operator::NotIn, key, Some(values)) => match labels.get(key) {
                Some(v) => !values.contains(v),
                None => true,
            },
            (Operator::Exists, key, None) => labels.contains_key(key),
            (Operator::DoesNotExist, key, None) => !labels.contains_key(key),
            (operator, key, values) => {
                tracing::warn!(?operator, %key, ?values, "illegal match expression");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::iter::FromIterator;

    #[test]
    fn selector_matches() {
        for (selector, labels, matches, msg) in &[
            (Selector::default(), Labels::default(), true, "empty match"),
            (
                Selector::from_iter(Some(("app", "db"))),
                Labels::from_iter(Some(("app", "db"))),
                true,
                "exact label match",
            ),
            (
                Selector::from_iter(Some(("app", "db"))),
                Labels::from_iter(vec![("app", "db"), ("env", "prod")]),
                true,
                "sufficient label match",
            ),
            (
                Selector::from_iter(Some(("app", ""))),
                Labels::default(),
                false,
                "missing is not present-with-empty",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "app".into(),
                    operator: Operator::In,
                    values: Some(Some("db".to_string()).into_iter().collect()),
                })),
                Labels::from_iter(vec![("app", "db"), ("env", "prod")]),
                true,
                "In expression match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "app".into(),
                    operator: Operator::NotIn,
                    values: Some(Some("db".to_string()).into_iter().collect()),
                })),
                Labels::from_iter(vec![("app", "db")]),
                false,
                "NotIn expression non-match",
            ),
            (
                Selector::from_iter(Some(Expression {
                    key: "env".into(),
                    operator: Operator::DoesNotExist,
                    values: None,
                })),
                Labels::from_iter(Some(("app", "db"))),
                true,
                "DoesNotExist match",
            ),
            (
                Selector::new(
                    Map::from([("app".to_string(), "db".to_string())]),
                    vec![Expression {
                        key: "env".into(),
                        operator: Operator::In,
                        values: Some(Some("prod".to_string()).into_iter().collect()),
                    }],
                ),
                Labels::from_iter(vec![("app", "db"), ("env", "test")]),
                false,
                "matches labels but not expressions",
            ),
        ] {
            assert_eq!(selector.matches(labels), *matches, "{}", msg);
        }
    }

    #[test]
    fn labels_overlay() {
        let endpoint = Labels::from_iter(vec![("app", "db"), ("env", "prod")]);
        let profile = Labels::from_iter(vec![("env", "test"), ("team", "infra")]);
        let merged = endpoint.overlaid_on(&profile);
        assert_eq!(merged.as_ref().get("app").unwrap(), "db");
        assert_eq!(merged.as_ref().get("env").unwrap(), "prod");
        assert_eq!(merged.as_ref().get("team").unwrap(), "infra");
    }
}
