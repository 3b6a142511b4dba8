//! Server tag index.
//!
//! Built wholesale from a descriptor map on every generation change, giving
//! O(1) tag lookups and set-wise evaluation of [`TagQuery`] predicates.
//! Callers holding an unbuilt index receive empty sets for every query.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::query::{normalize_tag, TagQuery};
use crate::config::ServerDescriptor;
use crate::error::ProxyResult;

#[derive(Debug, Clone)]
pub struct TagIndexEntry {
    pub descriptor: ServerDescriptor,
    pub normalized_tags: BTreeSet<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TagIndex {
    by_tag: HashMap<String, BTreeSet<String>>,
    popular: Vec<(String, usize)>,
    entries: BTreeMap<String, TagIndexEntry>,
    all: BTreeSet<String>,
}

impl TagIndex {
    /// Index with no servers; every query answers with the empty set.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn build(servers: &BTreeMap<String, ServerDescriptor>) -> Self {
        let mut by_tag: HashMap<String, BTreeSet<String>> = HashMap::new();
        let mut entries = BTreeMap::new();
        let mut all = BTreeSet::new();

        for (name, descriptor) in servers {
            let normalized_tags: BTreeSet<String> = descriptor
                .tags
                .iter()
                .map(|t| normalize_tag(t))
                .filter(|t| !t.is_empty())
                .collect();
            for tag in &normalized_tags {
                by_tag.entry(tag.clone()).or_default().insert(name.clone());
            }
            all.insert(name.clone());
            entries.insert(
                name.clone(),
                TagIndexEntry {
                    descriptor: descriptor.clone(),
                    normalized_tags,
                },
            );
        }

        let mut popular: Vec<(String, usize)> = by_tag
            .iter()
            .map(|(tag, servers)| (tag.clone(), servers.len()))
            .collect();
        popular.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        Self {
            by_tag,
            popular,
            entries,
            all,
        }
    }

    pub fn by_tag(&self, tag: &str) -> BTreeSet<String> {
        self.by_tag
            .get(&normalize_tag(tag))
            .cloned()
            .unwrap_or_default()
    }

    pub fn by_any_tag<T: AsRef<str>>(&self, tags: &[T]) -> BTreeSet<String> {
        let mut result = BTreeSet::new();
        for tag in tags {
            result.extend(self.by_tag(tag.as_ref()));
        }
        result
    }

    pub fn by_all_tags<T: AsRef<str>>(&self, tags: &[T]) -> BTreeSet<String> {
        let mut iter = tags.iter();
        let Some(first) = iter.next() else {
            return BTreeSet::new();
        };
        let mut result = self.by_tag(first.as_ref());
        for tag in iter {
            if result.is_empty() {
                return result;
            }
            let next = self.by_tag(tag.as_ref());
            result.retain(|name| next.contains(name));
        }
        result
    }

    /// Servers admitted by the predicate.
    pub fn evaluate(&self, query: &TagQuery) -> BTreeSet<String> {
        match query {
            TagQuery::Tag(tag) => self.by_tag(tag),
            TagQuery::And(children) => {
                let mut iter = children.iter();
                let Some(first) = iter.next() else {
                    return BTreeSet::new();
                };
                let mut result = self.evaluate(first);
                for child in iter {
                    if result.is_empty() {
                        return result;
                    }
                    let next = self.evaluate(child);
                    result.retain(|name| next.contains(name));
                }
                result
            }
            TagQuery::Or(children) => {
                let mut result = BTreeSet::new();
                for child in children {
                    result.extend(self.evaluate(child));
                }
                result
            }
            TagQuery::Not(child) => {
                let excluded = self.evaluate(child);
                self.all
                    .iter()
                    .filter(|name| !excluded.contains(*name))
                    .cloned()
                    .collect()
            }
            TagQuery::Group(child) => self.evaluate(child),
        }
    }

    /// Parse and evaluate an infix expression in one step.
    pub fn evaluate_expression(&self, expression: &str) -> ProxyResult<BTreeSet<String>> {
        Ok(self.evaluate(&TagQuery::parse(expression)?))
    }

    /// Tags ordered by server count, ties broken alphabetically.
    pub fn popular_tags(&self) -> &[(String, usize)] {
        &self.popular
    }

    pub fn entry(&self, name: &str) -> Option<&TagIndexEntry> {
        self.entries.get(name)
    }

    pub fn server_names(&self) -> &BTreeSet<String> {
        &self.all
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
