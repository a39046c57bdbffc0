//! Query generation for image searches
//!
//! Every label is searched as a quoted term, optionally qualified by any subset
//! of the configured tags. This module builds those query strings and turns
//! them back into compact directory names.

use std::collections::HashSet;

/// One search query, e.g. `"cat" "neko"`
pub type QueryCombination = String;

/// Builds query strings from a base label and an ordered tag set
#[derive(Debug, Clone, Default)]
pub struct QueryBuilder {
    tags: Vec<String>,
}

impl QueryBuilder {
    pub fn new(tags: Vec<String>) -> Self {
        Self { tags }
    }

    /// Generates every combination of `base` with a subset of the tags.
    ///
    /// Combination `i` includes tag `j` when bit `j` of `i` is set, so index 0
    /// is the base alone and the last index carries every tag. Repeated
    /// strings are dropped, keeping the first occurrence.
    pub fn build_queries(&self, base: &str) -> Vec<QueryCombination> {
        let total = 1usize << self.tags.len();
        let mut seen = HashSet::with_capacity(total);
        let mut queries = Vec::with_capacity(total);

        for mask in 0..total {
            let mut query = quote(base);
            for (j, tag) in self.tags.iter().enumerate() {
                if mask & (1 << j) != 0 {
                    query.push(' ');
                    query.push_str(&quote(tag));
                }
            }
            if seen.insert(query.clone()) {
                queries.push(query);
            }
        }

        queries
    }

    /// The combination carrying every tag.
    pub fn full_query(&self, base: &str) -> QueryCombination {
        let mut query = quote(base);
        for tag in &self.tags {
            query.push(' ');
            query.push_str(&quote(tag));
        }
        query
    }

    /// Turns a query into a directory-safe path segment.
    ///
    /// Quotes are dropped and spaces become underscores. Each quoted term after
    /// the first that matches a configured tag is abbreviated to the tag's
    /// lowercased first character followed by its index, so `"cat" "neko"`
    /// becomes `cat_n0`. The base term is never abbreviated.
    pub fn derive_label_path(&self, query: &str) -> String {
        let terms = split_terms(query);
        let Some((base, rest)) = terms.split_first() else {
            return query.replace('"', "").trim().replace(' ', "_");
        };

        let mut segment = base.replace(' ', "_");
        for term in rest {
            segment.push('_');
            match self.tags.iter().position(|tag| tag == term) {
                Some(index) => {
                    if let Some(first) = term.chars().next() {
                        segment.extend(first.to_lowercase());
                    }
                    segment.push_str(&index.to_string());
                }
                None => segment.push_str(&term.replace(' ', "_")),
            }
        }
        segment
    }
}

fn quote(term: &str) -> String {
    format!("\"{}\"", term)
}

/// Splits a query into its terms. Quoted runs form one term; unquoted words
/// are taken one per term.
fn split_terms(query: &str) -> Vec<String> {
    let mut terms = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;

    for c in query.chars() {
        match c {
            '"' => {
                if in_quotes {
                    terms.push(std::mem::take(&mut current));
                } else if !current.trim().is_empty() {
                    terms.push(std::mem::take(&mut current).trim().to_string());
                } else {
                    current.clear();
                }
                in_quotes = !in_quotes;
            }
            ' ' if !in_quotes => {
                if !current.is_empty() {
                    terms.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.trim().is_empty() {
        terms.push(current.trim().to_string());
    }

    terms.retain(|t| !t.is_empty());
    terms
}
