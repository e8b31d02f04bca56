use std::collections::HashMap;

use anyhow::Result;

use crate::ledger::Ledger;
use crate::model::PageMapping;

/// Bidirectional source/target page id lookup, plus title lookup used when resolving
/// wiki links by name.
#[derive(Debug, Clone, Default)]
pub struct IdMapper {
    source_to_target: HashMap<String, String>,
    target_to_source: HashMap<String, String>,
    target_titles: HashMap<String, String>,
    title_index: HashMap<String, String>,
}

impl IdMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(ledger: &Ledger) -> Result<Self> {
        Ok(Self::from_mappings(&ledger.mappings()?))
    }

    pub fn from_mappings(mappings: &[PageMapping]) -> Self {
        let mut mapper = Self::new();
        for mapping in mappings {
            mapper.insert(
                &mapping.source_page_id,
                &mapping.target_page_id,
                &mapping.target_title,
            );
        }
        mapper
    }

    /// Returns false and leaves the mapper untouched when the source page is already mapped.
    pub fn insert(&mut self, source_id: &str, target_id: &str, target_title: &str) -> bool {
        if self.source_to_target.contains_key(source_id) {
            return false;
        }
        self.source_to_target
            .insert(source_id.to_string(), target_id.to_string());
        self.target_to_source
            .insert(target_id.to_string(), source_id.to_string());
        self.target_titles
            .insert(target_id.to_string(), target_title.to_string());
        self.title_index
            .entry(title_key(target_title))
            .or_insert_with(|| target_id.to_string());
        true
    }

    pub fn target_for(&self, source_id: &str) -> Option<&str> {
        self.source_to_target.get(source_id).map(String::as_str)
    }

    pub fn source_for(&self, target_id: &str) -> Option<&str> {
        self.target_to_source.get(target_id).map(String::as_str)
    }

    pub fn title_of(&self, target_id: &str) -> Option<&str> {
        self.target_titles.get(target_id).map(String::as_str)
    }

    /// Case-insensitive title lookup; the first page published under a title wins.
    pub fn target_by_title(&self, title: &str) -> Option<&str> {
        self.title_index.get(&title_key(title)).map(String::as_str)
    }

    pub fn is_mapped(&self, source_id: &str) -> bool {
        self.source_to_target.contains_key(source_id)
    }

    pub fn len(&self) -> usize {
        self.source_to_target.len()
    }

    pub fn is_empty(&self) -> bool {
        self.source_to_target.is_empty()
    }
}

fn title_key(title: &str) -> String {
    title.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookups_work_in_both_directions() {
        let mut mapper = IdMapper::new();
        assert!(mapper.insert("A", "101", "Home"));
        assert!(mapper.insert("B", "102", "Setup Guide"));

        assert_eq!(mapper.target_for("A"), Some("101"));
        assert_eq!(mapper.source_for("102"), Some("B"));
        assert_eq!(mapper.title_of("102"), Some("Setup Guide"));
        assert_eq!(mapper.target_by_title("setup guide"), Some("102"));
        assert_eq!(mapper.target_for("C"), None);
        assert_eq!(mapper.len(), 2);
    }

    #[test]
    fn second_mapping_for_same_source_is_rejected() {
        let mut mapper = IdMapper::new();
        assert!(mapper.insert("A", "101", "Home"));
        assert!(!mapper.insert("A", "999", "Other"));
        assert_eq!(mapper.target_for("A"), Some("101"));
        assert_eq!(mapper.source_for("999"), None);
    }

    #[test]
    fn from_mappings_keeps_first_title_owner() {
        let mapper = IdMapper::from_mappings(&[
            PageMapping {
                source_page_id: "A".to_string(),
                target_page_id: "101".to_string(),
                target_title: "Notes".to_string(),
                offset_path: "0".to_string(),
            },
            PageMapping {
                source_page_id: "B".to_string(),
                target_page_id: "102".to_string(),
                target_title: "NOTES".to_string(),
                offset_path: "1".to_string(),
            },
        ]);
        assert_eq!(mapper.target_by_title("notes"), Some("101"));
        assert!(mapper.is_mapped("B"));
    }
}
