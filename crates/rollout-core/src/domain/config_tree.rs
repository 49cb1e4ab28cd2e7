//! Typed configuration tree.
//!
//! Service configuration has an open-ended shape. It is held as a tree of
//! interior maps and scalar leaves and addressed by path, e.g.
//! `["services", "ingest", "lifecycle", "bootstrap"]`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::ConfigError;

/// A leaf value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Scalar {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Scalar>),
}

/// A node in the configuration tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigNode {
    Leaf(Scalar),
    Map(BTreeMap<String, ConfigNode>),
}

impl Default for ConfigNode {
    fn default() -> Self {
        ConfigNode::Map(BTreeMap::new())
    }
}

impl From<&str> for ConfigNode {
    fn from(s: &str) -> Self {
        ConfigNode::Leaf(Scalar::Text(s.to_string()))
    }
}

impl From<String> for ConfigNode {
    fn from(s: String) -> Self {
        ConfigNode::Leaf(Scalar::Text(s))
    }
}

impl From<bool> for ConfigNode {
    fn from(b: bool) -> Self {
        ConfigNode::Leaf(Scalar::Bool(b))
    }
}

impl From<i64> for ConfigNode {
    fn from(n: i64) -> Self {
        ConfigNode::Leaf(Scalar::Int(n))
    }
}

fn render(path: &[&str]) -> String {
    path.join("/")
}

impl ConfigNode {
    /// An empty interior node.
    pub fn map() -> Self {
        Self::default()
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, ConfigNode>> {
        match self {
            ConfigNode::Map(m) => Some(m),
            ConfigNode::Leaf(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ConfigNode::Leaf(Scalar::Text(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ConfigNode::Leaf(Scalar::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Scalar]> {
        match self {
            ConfigNode::Leaf(Scalar::List(items)) => Some(items),
            _ => None,
        }
    }

    /// Child keys of an interior node, sorted.
    pub fn keys(&self) -> Vec<&str> {
        self.as_map()
            .map(|m| m.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Node at `path`, or `None` if any segment is missing or crosses a leaf.
    pub fn lookup(&self, path: &[&str]) -> Option<&ConfigNode> {
        path.iter().try_fold(self, |node, key| node.as_map()?.get(*key))
    }

    /// Text value at `path`.
    pub fn lookup_str(&self, path: &[&str]) -> Option<&str> {
        self.lookup(path).and_then(ConfigNode::as_str)
    }

    pub fn lookup_mut(&mut self, path: &[&str]) -> Option<&mut ConfigNode> {
        let mut node = self;
        for key in path {
            node = match node {
                ConfigNode::Map(m) => m.get_mut(*key)?,
                ConfigNode::Leaf(_) => return None,
            };
        }
        Some(node)
    }

    /// Place `value` at `path`, creating interior maps along the way.
    ///
    /// Fails if a segment of `path` is an existing leaf.
    pub fn insert(&mut self, path: &[&str], value: ConfigNode) -> Result<(), ConfigError> {
        let Some((last, parents)) = path.split_last() else {
            *self = value;
            return Ok(());
        };
        let mut node = self;
        for (depth, key) in parents.iter().enumerate() {
            node = match node {
                ConfigNode::Map(m) => m.entry(key.to_string()).or_default(),
                ConfigNode::Leaf(_) => {
                    return Err(ConfigError::InvalidNode {
                        path: render(&path[..depth]),
                        reason: "expected a map, found a leaf".to_string(),
                    })
                }
            };
        }
        match node {
            ConfigNode::Map(m) => {
                m.insert(last.to_string(), value);
                Ok(())
            }
            ConfigNode::Leaf(_) => Err(ConfigError::InvalidNode {
                path: render(parents),
                reason: "expected a map, found a leaf".to_string(),
            }),
        }
    }

    /// Detach and return the node at `path`.
    pub fn remove(&mut self, path: &[&str]) -> Option<ConfigNode> {
        let (last, parents) = path.split_last()?;
        match self.lookup_mut(parents)? {
            ConfigNode::Map(m) => m.remove(*last),
            ConfigNode::Leaf(_) => None,
        }
    }

    /// Convert from an arbitrary JSON value.
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigError> {
        serde_json::from_value(value).map_err(|e| ConfigError::InvalidNode {
            path: String::new(),
            reason: e.to_string(),
        })
    }

    pub fn to_json(&self) -> Result<serde_json::Value, ConfigError> {
        serde_json::to_value(self).map_err(|e| ConfigError::InvalidNode {
            path: String::new(),
            reason: e.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> ConfigNode {
        ConfigNode::from_json(json!({
            "services": {
                "ingest": {
                    "version": "1.2.0",
                    "dependencies": ["store:HARD"],
                    "lifecycle": {"bootstrap": "./migrate.sh"},
                    "enabled": true,
                    "replicas": 2
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn lookup_walks_interior_maps() {
        let tree = sample();
        assert_eq!(
            tree.lookup_str(&["services", "ingest", "lifecycle", "bootstrap"]),
            Some("./migrate.sh")
        );
        assert_eq!(
            tree.lookup(&["services", "ingest", "enabled"])
                .and_then(ConfigNode::as_bool),
            Some(true)
        );
        assert!(tree.lookup(&["services", "ingest", "version", "x"]).is_none());
        assert!(tree.lookup(&["services", "absent"]).is_none());
    }

    #[test]
    fn leaves_keep_their_scalar_type() {
        let tree = sample();
        assert_eq!(
            tree.lookup(&["services", "ingest", "replicas"]),
            Some(&ConfigNode::Leaf(Scalar::Int(2)))
        );
        assert_eq!(
            tree.lookup(&["services", "ingest", "dependencies"])
                .and_then(ConfigNode::as_list)
                .map(|l| l.len()),
            Some(1)
        );
    }

    #[test]
    fn insert_creates_intermediate_maps() {
        let mut tree = ConfigNode::map();
        tree.insert(&["services", "new", "version"], "0.1.0".into())
            .unwrap();
        assert_eq!(tree.lookup_str(&["services", "new", "version"]), Some("0.1.0"));
    }

    #[test]
    fn insert_through_leaf_is_rejected() {
        let mut tree = sample();
        let err = tree
            .insert(&["services", "ingest", "version", "minor"], "1".into())
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNode { .. }));
    }

    #[test]
    fn remove_detaches_subtree() {
        let mut tree = sample();
        let removed = tree.remove(&["services", "ingest"]).unwrap();
        assert_eq!(removed.lookup_str(&["version"]), Some("1.2.0"));
        assert!(tree.lookup(&["services", "ingest"]).is_none());
        assert!(tree.lookup(&["services"]).is_some());
        assert!(tree.remove(&["services", "ingest"]).is_none());
    }
}
