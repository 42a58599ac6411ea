use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const WILDCARD: &str = "*";

pub type Labels = BTreeMap<String, String>;

/// Label selector used in role conditions. Keys map to the set of accepted
/// values; both keys and values may be the wildcard.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Debug)]
#[serde(transparent)]
pub struct LabelMatcher(pub BTreeMap<String, Vec<String>>);

impl LabelMatcher {
    pub fn wildcard() -> Self {
        Self(BTreeMap::from([(
            WILDCARD.to_string(),
            vec![WILDCARD.to_string()],
        )]))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// An empty matcher matches nothing; a `*: [*]` entry matches anything.
    pub fn matches(&self, labels: &Labels) -> bool {
        if self.0.is_empty() {
            return false;
        }

        self.0.iter().all(|(key, accepted)| {
            if key == WILDCARD {
                return accepted.iter().any(|v| v == WILDCARD);
            }
            match labels.get(key) {
                Some(value) => accepted.iter().any(|v| v == WILDCARD || v == value),
                None => false,
            }
        })
    }
}

pub fn labels_from<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
