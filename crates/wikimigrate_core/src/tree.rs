use std::collections::HashMap;

use thiserror::Error;

use crate::model::{Page, display_timestamp};

/// Structural problems in a page export. Any of these aborts the run before mutation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TreeError {
    #[error("duplicate page id '{0}'")]
    DuplicateId(String),

    #[error("duplicate page title '{title}' (ids '{first}' and '{second}')")]
    DuplicateTitle {
        title: String,
        first: String,
        second: String,
    },

    #[error("page '{id}' references missing parent '{parent_id}'")]
    OrphanParent { id: String, parent_id: String },

    #[error("pages unreachable from any root (parent cycle): {}", .0.join(", "))]
    ParentCycle(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct PageNode {
    pub page: Page,
    /// Position of the page in the export, used to break `created_at` ties.
    pub ingest_order: usize,
    /// Indices into the forest's node list, ordered oldest first.
    pub children: Vec<usize>,
}

/// One pre-order visit: the page and its sibling offsets from the root down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub page_id: String,
    pub path: Vec<usize>,
}

impl TreeEntry {
    pub fn depth(&self) -> usize {
        self.path.len().saturating_sub(1)
    }

    pub fn offset_path(&self) -> String {
        self.path
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("-")
    }

    /// Sibling position among the parent's children.
    pub fn position(&self) -> usize {
        self.path.last().copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct PageForest {
    nodes: Vec<PageNode>,
    roots: Vec<usize>,
    index: HashMap<String, usize>,
}

impl PageForest {
    pub fn build(pages: Vec<Page>) -> Result<Self, TreeError> {
        let mut index = HashMap::with_capacity(pages.len());
        let mut titles: HashMap<&str, &str> = HashMap::with_capacity(pages.len());
        for (position, page) in pages.iter().enumerate() {
            if index.insert(page.id.clone(), position).is_some() {
                return Err(TreeError::DuplicateId(page.id.clone()));
            }
            if let Some(first) = titles.insert(page.title.as_str(), page.id.as_str()) {
                return Err(TreeError::DuplicateTitle {
                    title: page.title.clone(),
                    first: first.to_string(),
                    second: page.id.clone(),
                });
            }
        }

        let mut nodes = pages
            .into_iter()
            .enumerate()
            .map(|(ingest_order, page)| PageNode {
                page,
                ingest_order,
                children: Vec::new(),
            })
            .collect::<Vec<_>>();

        let mut roots = Vec::new();
        for position in 0..nodes.len() {
            match nodes[position].page.parent_id.clone() {
                None => roots.push(position),
                Some(parent_id) => {
                    let parent = *index.get(&parent_id).ok_or_else(|| TreeError::OrphanParent {
                        id: nodes[position].page.id.clone(),
                        parent_id: parent_id.clone(),
                    })?;
                    nodes[parent].children.push(position);
                }
            }
        }

        let sort_key = |nodes: &[PageNode], position: usize| {
            (nodes[position].page.created_at, nodes[position].ingest_order)
        };
        roots.sort_by_key(|&position| sort_key(&nodes, position));
        for position in 0..nodes.len() {
            let mut children = std::mem::take(&mut nodes[position].children);
            children.sort_by_key(|&child| sort_key(&nodes, child));
            nodes[position].children = children;
        }

        let forest = Self {
            nodes,
            roots,
            index,
        };
        let visited = forest.pre_order().len();
        if visited < forest.nodes.len() {
            let reachable = forest
                .pre_order()
                .into_iter()
                .map(|entry| entry.page_id)
                .collect::<std::collections::HashSet<_>>();
            let stranded = forest
                .nodes
                .iter()
                .filter(|node| !reachable.contains(&node.page.id))
                .map(|node| node.page.id.clone())
                .collect();
            return Err(TreeError::ParentCycle(stranded));
        }
        Ok(forest)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn page(&self, id: &str) -> Option<&Page> {
        self.index.get(id).map(|&position| &self.nodes[position].page)
    }

    pub fn node(&self, id: &str) -> Option<&PageNode> {
        self.index.get(id).map(|&position| &self.nodes[position])
    }

    pub fn has_children(&self, id: &str) -> bool {
        self.node(id).is_some_and(|node| !node.children.is_empty())
    }

    pub fn children(&self, id: &str) -> Vec<&Page> {
        self.node(id)
            .map(|node| {
                node.children
                    .iter()
                    .map(|&child| &self.nodes[child].page)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn root_pages(&self) -> Vec<&Page> {
        self.roots
            .iter()
            .map(|&position| &self.nodes[position].page)
            .collect()
    }

    /// Every page that has a parent, oldest first.
    pub fn child_pages(&self) -> Vec<&Page> {
        let mut children = self
            .nodes
            .iter()
            .filter(|node| node.page.parent_id.is_some())
            .collect::<Vec<_>>();
        children.sort_by_key(|node| (node.page.created_at, node.ingest_order));
        children.into_iter().map(|node| &node.page).collect()
    }

    /// Depth-first pre-order walk; every parent precedes its descendants.
    pub fn pre_order(&self) -> Vec<TreeEntry> {
        let mut entries = Vec::with_capacity(self.nodes.len());
        let mut stack = self
            .roots
            .iter()
            .enumerate()
            .rev()
            .map(|(offset, &position)| (position, vec![offset]))
            .collect::<Vec<_>>();

        while let Some((position, path)) = stack.pop() {
            let node = &self.nodes[position];
            for (offset, &child) in node.children.iter().enumerate().rev() {
                let mut child_path = path.clone();
                child_path.push(offset);
                stack.push((child, child_path));
            }
            entries.push(TreeEntry {
                page_id: node.page.id.clone(),
                path,
            });
        }
        entries
    }

    /// One line per page in pre-order, prefixed with the dash-joined offset path.
    pub fn render(&self) -> Vec<String> {
        self.pre_order()
            .into_iter()
            .filter_map(|entry| {
                let node = self.node(&entry.page_id)?;
                let parent = node
                    .page
                    .parent_id
                    .as_deref()
                    .map(|parent_id| format!("parent_id='{parent_id}' "))
                    .unwrap_or_default();
                let children = if node.children.is_empty() {
                    "children_ids=0".to_string()
                } else {
                    let ids = node
                        .children
                        .iter()
                        .map(|&child| self.nodes[child].page.id.as_str())
                        .collect::<Vec<_>>();
                    format!("children_ids={} [{}]", ids.len(), ids.join(","))
                };
                Some(format!(
                    "{} id='{}' {}created_at='{}' page_name='{}' {}",
                    entry.offset_path(),
                    node.page.id,
                    parent,
                    display_timestamp(&node.page.created_at),
                    node.page.title,
                    children
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::model::PageFormat;

    fn page(id: &str, parent: Option<&str>, title: &str, minute: u32) -> Page {
        Page {
            id: id.to_string(),
            parent_id: parent.map(str::to_string),
            title: title.to_string(),
            body: String::new(),
            format: PageFormat::Html,
            created_at: Utc
                .with_ymd_and_hms(2020, 1, 1, 0, minute, 0)
                .single()
                .expect("timestamp"),
            author_id: None,
        }
    }

    fn ids(entries: &[TreeEntry]) -> Vec<&str> {
        entries.iter().map(|entry| entry.page_id.as_str()).collect()
    }

    #[test]
    fn pre_order_visits_parents_before_children_sorted_by_creation() {
        let forest = PageForest::build(vec![
            page("c2", Some("root"), "Child two", 5),
            page("root", None, "Home", 1),
            page("c1", Some("root"), "Child one", 2),
            page("g1", Some("c2"), "Grandchild", 6),
            page("other", None, "Other", 0),
        ])
        .expect("forest");

        let entries = forest.pre_order();
        assert_eq!(ids(&entries), vec!["other", "root", "c1", "c2", "g1"]);
        assert_eq!(entries[4].path, vec![1, 1, 0]);
        assert_eq!(entries[4].offset_path(), "1-1-0");
        assert_eq!(entries[4].depth(), 2);
        assert_eq!(entries[3].position(), 1);

        let mut seen = std::collections::HashSet::new();
        for entry in &entries {
            if let Some(parent) = forest.page(&entry.page_id).and_then(|p| p.parent_id.clone()) {
                assert!(seen.contains(&parent), "{} before parent", entry.page_id);
            }
            seen.insert(entry.page_id.clone());
        }
    }

    #[test]
    fn creation_ties_keep_ingestion_order() {
        let forest = PageForest::build(vec![
            page("b", None, "B", 1),
            page("a", None, "A", 1),
        ])
        .expect("forest");
        assert_eq!(ids(&forest.pre_order()), vec!["b", "a"]);
    }

    #[test]
    fn duplicate_id_is_fatal() {
        let error = PageForest::build(vec![page("x", None, "One", 0), page("x", None, "Two", 1)])
            .expect_err("must fail");
        assert_eq!(error, TreeError::DuplicateId("x".to_string()));
    }

    #[test]
    fn duplicate_title_is_fatal() {
        let error = PageForest::build(vec![page("x", None, "Same", 0), page("y", None, "Same", 1)])
            .expect_err("must fail");
        assert!(matches!(error, TreeError::DuplicateTitle { ref title, .. } if title == "Same"));
    }

    #[test]
    fn missing_parent_is_fatal() {
        let error = PageForest::build(vec![page("x", Some("ghost"), "Lost", 0)])
            .expect_err("must fail");
        assert_eq!(
            error,
            TreeError::OrphanParent {
                id: "x".to_string(),
                parent_id: "ghost".to_string()
            }
        );
    }

    #[test]
    fn parent_cycle_is_fatal() {
        let error = PageForest::build(vec![
            page("root", None, "Root", 0),
            page("a", Some("b"), "A", 1),
            page("b", Some("a"), "B", 2),
        ])
        .expect_err("must fail");
        assert_eq!(
            error,
            TreeError::ParentCycle(vec!["a".to_string(), "b".to_string()])
        );
    }

    #[test]
    fn render_lists_offsets_and_children() {
        let forest = PageForest::build(vec![
            page("root", None, "Home", 0),
            page("kid", Some("root"), "Kid", 1),
        ])
        .expect("forest");
        let lines = forest.render();
        assert_eq!(
            lines[0],
            "0 id='root' created_at='2020-01-01 00:00:00' page_name='Home' children_ids=1 [kid]"
        );
        assert!(lines[1].starts_with("0-0 id='kid' parent_id='root' "));
        assert_eq!(forest.root_pages().len(), 1);
        assert_eq!(forest.child_pages().len(), 1);
        assert!(forest.has_children("root"));
    }
}
