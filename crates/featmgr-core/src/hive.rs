//! Hierarchical configuration database the boot store lives in.
//!
//! A hive is a tree of keys addressed by backslash-separated paths, each
//! key holding named, typed values. [`MemoryHive`] backs tests and dry runs;
//! persistent backends implement [`Hive`] in their own crates.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::HiveError;

#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct KeyPath {
    segments: Vec<String>,
}

impl KeyPath {
    /// Parse a backslash-separated path. Empty segments are dropped, so
    /// leading, trailing and doubled separators are tolerated.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('\\')
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }

    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    /// Child path; `segment` may itself contain separators.
    #[must_use]
    pub fn join(&self, segment: impl AsRef<str>) -> Self {
        let mut segments = self.segments.clone();
        segments.extend(
            segment
                .as_ref()
                .split('\\')
                .filter(|part| !part.is_empty())
                .map(str::to_string),
        );
        Self { segments }
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.segments.is_empty() {
            return None;
        }
        Some(Self { segments: self.segments[..self.segments.len() - 1].to_vec() })
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.segments.last().map(String::as_str)
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// Whether `self` equals `ancestor` or lies beneath it.
    #[must_use]
    pub fn starts_with(&self, ancestor: &Self) -> bool {
        self.segments.starts_with(&ancestor.segments)
    }
}

impl Display for KeyPath {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.segments.join("\\"))
    }
}

impl From<String> for KeyPath {
    fn from(value: String) -> Self {
        Self::parse(&value)
    }
}

impl From<&str> for KeyPath {
    fn from(value: &str) -> Self {
        Self::parse(value)
    }
}

impl From<KeyPath> for String {
    fn from(value: KeyPath) -> Self {
        value.to_string()
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum HiveValue {
    Dword(u32),
    Qword(u64),
    Binary(Vec<u8>),
    String(String),
}

impl HiveValue {
    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Dword(_) => "dword",
            Self::Qword(_) => "qword",
            Self::Binary(_) => "binary",
            Self::String(_) => "string",
        }
    }

    #[must_use]
    pub fn as_dword(&self) -> Option<u32> {
        match self {
            Self::Dword(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }
}

/// Storage operations a boot-store backend must provide.
///
/// Missing keys are reported through return values where the registry
/// treats them as benign (`key_exists`, `delete_tree`, `value`,
/// `delete_value`) and as [`HiveError::KeyNotFound`] everywhere else.
pub trait Hive {
    /// Create `path` and any missing ancestors. Existing keys are kept.
    ///
    /// # Errors
    /// Returns a backend error when the key cannot be created.
    fn create_key(&mut self, path: &KeyPath) -> Result<(), HiveError>;

    /// # Errors
    /// Returns a backend error when the lookup fails.
    fn key_exists(&self, path: &KeyPath) -> Result<bool, HiveError>;

    /// Delete `path` with every descendant key and value. Returns whether
    /// anything was removed.
    ///
    /// # Errors
    /// Returns a backend error when the delete fails.
    fn delete_tree(&mut self, path: &KeyPath) -> Result<bool, HiveError>;

    /// # Errors
    /// Returns [`HiveError::KeyNotFound`] when `path` does not exist.
    fn subkey_names(&self, path: &KeyPath) -> Result<Vec<String>, HiveError>;

    /// # Errors
    /// Returns [`HiveError::KeyNotFound`] when `path` does not exist.
    fn value_names(&self, path: &KeyPath) -> Result<Vec<String>, HiveError>;

    /// # Errors
    /// Returns [`HiveError::KeyNotFound`] when `path` does not exist.
    fn value(&self, path: &KeyPath, name: &str) -> Result<Option<HiveValue>, HiveError>;

    /// # Errors
    /// Returns [`HiveError::KeyNotFound`] when `path` does not exist.
    fn set_value(&mut self, path: &KeyPath, name: &str, value: HiveValue)
        -> Result<(), HiveError>;

    /// Returns whether the value existed. A missing key counts as a missing
    /// value.
    ///
    /// # Errors
    /// Returns a backend error when the delete fails.
    fn delete_value(&mut self, path: &KeyPath, name: &str) -> Result<bool, HiveError>;

    /// Create `path` if needed and borrow it.
    ///
    /// # Errors
    /// Returns a backend error when the key cannot be created.
    fn create_and_open(&mut self, path: &KeyPath) -> Result<OpenKey<'_, Self>, HiveError> {
        self.create_key(path)?;
        Ok(OpenKey { hive: self, path: path.clone() })
    }
}

/// Handle to one key, scoped to a mutable borrow of its hive.
#[derive(Debug)]
pub struct OpenKey<'h, H: Hive + ?Sized> {
    hive: &'h mut H,
    path: KeyPath,
}

impl<H: Hive + ?Sized> OpenKey<'_, H> {
    /// # Errors
    /// Propagates backend failures.
    pub fn set_value(&mut self, name: &str, value: HiveValue) -> Result<(), HiveError> {
        self.hive.set_value(&self.path, name, value)
    }

    /// # Errors
    /// Propagates backend failures.
    pub fn set_dword(&mut self, name: &str, value: u32) -> Result<(), HiveError> {
        self.set_value(name, HiveValue::Dword(value))
    }
}

#[derive(Debug, Clone, Default, Eq, PartialEq)]
struct Node {
    values: BTreeMap<String, HiveValue>,
    children: BTreeMap<String, Node>,
}

/// In-memory hive. Key and value names compare case-sensitively.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct MemoryHive {
    root: Node,
}

impl MemoryHive {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn node(&self, path: &KeyPath) -> Option<&Node> {
        let mut node = &self.root;
        for segment in path.segments() {
            node = node.children.get(segment)?;
        }
        Some(node)
    }

    fn node_mut(&mut self, path: &KeyPath) -> Option<&mut Node> {
        let mut node = &mut self.root;
        for segment in path.segments() {
            node = node.children.get_mut(segment)?;
        }
        Some(node)
    }

    fn existing(&self, path: &KeyPath) -> Result<&Node, HiveError> {
        self.node(path).ok_or_else(|| HiveError::KeyNotFound(path.to_string()))
    }
}

impl Hive for MemoryHive {
    fn create_key(&mut self, path: &KeyPath) -> Result<(), HiveError> {
        let mut node = &mut self.root;
        for segment in path.segments() {
            node = node.children.entry(segment.clone()).or_default();
        }
        Ok(())
    }

    fn key_exists(&self, path: &KeyPath) -> Result<bool, HiveError> {
        Ok(self.node(path).is_some())
    }

    fn delete_tree(&mut self, path: &KeyPath) -> Result<bool, HiveError> {
        let (Some(parent), Some(name)) = (path.parent(), path.name()) else {
            // Deleting the root clears the hive.
            let had_content = self.root != Node::default();
            self.root = Node::default();
            return Ok(had_content);
        };
        Ok(self
            .node_mut(&parent)
            .and_then(|node| node.children.remove(name))
            .is_some())
    }

    fn subkey_names(&self, path: &KeyPath) -> Result<Vec<String>, HiveError> {
        Ok(self.existing(path)?.children.keys().cloned().collect())
    }

    fn value_names(&self, path: &KeyPath) -> Result<Vec<String>, HiveError> {
        Ok(self.existing(path)?.values.keys().cloned().collect())
    }

    fn value(&self, path: &KeyPath, name: &str) -> Result<Option<HiveValue>, HiveError> {
        Ok(self.existing(path)?.values.get(name).cloned())
    }

    fn set_value(
        &mut self,
        path: &KeyPath,
        name: &str,
        value: HiveValue,
    ) -> Result<(), HiveError> {
        let node =
            self.node_mut(path).ok_or_else(|| HiveError::KeyNotFound(path.to_string()))?;
        node.values.insert(name.to_string(), value);
        Ok(())
    }

    fn delete_value(&mut self, path: &KeyPath, name: &str) -> Result<bool, HiveError> {
        Ok(self.node_mut(path).and_then(|node| node.values.remove(name)).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_path_parses_and_renders_backslash_paths() {
        let path = KeyPath::parse("\\SYSTEM\\\\CurrentControlSet\\Control\\");
        assert_eq!(path.segments(), ["SYSTEM", "CurrentControlSet", "Control"]);
        assert_eq!(path.to_string(), "SYSTEM\\CurrentControlSet\\Control");
        assert_eq!(path.name(), Some("Control"));
        assert_eq!(path.join("A\\B").to_string(), "SYSTEM\\CurrentControlSet\\Control\\A\\B");
        assert_eq!(
            path.parent().map(|parent| parent.to_string()),
            Some("SYSTEM\\CurrentControlSet".to_string())
        );
        assert!(KeyPath::root().parent().is_none());
    }

    #[test]
    fn key_path_serializes_as_string() -> Result<(), serde_json::Error> {
        let path = KeyPath::parse("A\\B");
        assert_eq!(serde_json::to_string(&path)?, "\"A\\\\B\"");
        assert_eq!(serde_json::from_str::<KeyPath>("\"A\\\\B\"")?, path);
        Ok(())
    }

    #[test]
    fn create_key_builds_intermediate_keys() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        hive.create_key(&KeyPath::parse("A\\B\\C"))?;
        assert!(hive.key_exists(&KeyPath::parse("A\\B"))?);
        assert_eq!(hive.subkey_names(&KeyPath::parse("A"))?, vec!["B".to_string()]);
        Ok(())
    }

    #[test]
    fn delete_tree_removes_descendants_and_reports_missing() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        let leaf = KeyPath::parse("A\\B\\C");
        hive.create_and_open(&leaf)?.set_dword("X", 1)?;

        assert!(hive.delete_tree(&KeyPath::parse("A\\B"))?);
        assert!(!hive.key_exists(&leaf)?);
        assert!(hive.key_exists(&KeyPath::parse("A"))?);
        assert!(!hive.delete_tree(&KeyPath::parse("A\\B"))?);
        Ok(())
    }

    #[test]
    fn open_key_writes_land_under_its_path() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        let path = KeyPath::parse("K\\Sub");
        let mut key = hive.create_and_open(&path)?;
        key.set_value("Blob", HiveValue::Binary(vec![1, 2]))?;
        key.set_dword("Count", 3)?;

        assert_eq!(hive.value(&path, "Count")?, Some(HiveValue::Dword(3)));
        assert_eq!(hive.value(&path, "Blob")?, Some(HiveValue::Binary(vec![1, 2])));
        assert_eq!(hive.value(&KeyPath::parse("K"), "Count")?, None);
        Ok(())
    }

    #[test]
    fn names_are_case_sensitive() -> Result<(), HiveError> {
        let mut hive = MemoryHive::new();
        hive.create_key(&KeyPath::parse("Key"))?;
        assert!(!hive.key_exists(&KeyPath::parse("KEY"))?);
        Ok(())
    }
}
