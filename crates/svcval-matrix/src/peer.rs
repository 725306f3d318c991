//! Peer selectors used as keys into a reachability matrix

use std::fmt;

use crate::model::PodKey;

/// A namespace wildcard or a specific pod
///
/// `Peer { namespace: "x", pod: None }` matches every pod in namespace `x`.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Peer {
    /// Namespace the selector applies to
    pub namespace: String,
    /// Specific pod name, or `None` for every pod in the namespace
    pub pod: Option<String>,
}

impl Peer {
    /// Select every pod in a namespace
    pub fn namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: None,
        }
    }

    /// Select a single pod
    pub fn pod(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: Some(pod.into()),
        }
    }

    /// Whether this selector matches a concrete pod
    pub fn matches(&self, key: &PodKey) -> bool {
        self.namespace == key.namespace && self.pod.as_ref().map_or(true, |p| *p == key.name)
    }
}

impl From<&PodKey> for Peer {
    fn from(key: &PodKey) -> Self {
        Peer::pod(&key.namespace, &key.name)
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pod {
            Some(pod) => write!(f, "{}/{}", self.namespace, pod),
            None => write!(f, "{}/*", self.namespace),
        }
    }
}
