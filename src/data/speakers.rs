//! Speaker list: label `i` is the `i`-th id in a JSON array.

use std::collections::HashSet;
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeakerList {
    names: Vec<String>,
}

impl SpeakerList {
    pub fn new(names: Vec<String>) -> Result<Self> {
        if names.is_empty() {
            return Err(Error::Dataset("speaker list is empty".into()));
        }
        let mut seen = HashSet::new();
        for name in &names {
            if !seen.insert(name.as_str()) {
                return Err(Error::Dataset(format!("duplicate speaker id {name:?}")));
            }
        }
        Ok(Self { names })
    }

    /// Load a JSON array of speaker ids.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(Error::Dataset(format!(
                "speaker list not found: {}",
                path.display()
            )));
        }
        let text = std::fs::read_to_string(path)?;
        let names: Vec<String> = serde_json::from_str(&text)?;
        Self::new(names)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn name(&self, label: u32) -> Option<&str> {
        self.names.get(label as usize).map(String::as_str)
    }

    pub fn label_of(&self, name: &str) -> Option<u32> {
        self.names.iter().position(|n| n == name).map(|i| i as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_labels_follow_order() {
        let list = SpeakerList::new(vec!["p262".into(), "p272".into(), "p229".into()]).unwrap();
        assert_eq!(list.len(), 3);
        assert_eq!(list.label_of("p229"), Some(2));
        assert_eq!(list.name(1), Some("p272"));
        assert_eq!(list.label_of("p000"), None);
    }

    #[test]
    fn test_empty_and_duplicates_rejected() {
        assert!(SpeakerList::new(vec![]).is_err());
        assert!(SpeakerList::new(vec!["a".into(), "b".into(), "a".into()]).is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = SpeakerList::load(dir.path().join("speaker_used.json")).unwrap_err();
        assert!(matches!(err, Error::Dataset(_)));
    }

    #[test]
    fn test_load_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("speaker_used.json");
        std::fs::write(&path, r#"["VCC2SF1", "VCC2SM1"]"#).unwrap();
        let list = SpeakerList::load(&path).unwrap();
        assert_eq!(list.names(), &["VCC2SF1".to_string(), "VCC2SM1".to_string()]);
    }
}
