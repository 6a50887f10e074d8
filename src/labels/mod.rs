//! Label replication: taxonomy values written back as provider labels.
//!
//! `replicator` owns the per-account label-id cache; this module holds the
//! pure naming and coloring rules it relies on.

pub mod replicator;

pub use replicator::LabelReplicator;

use crate::pipeline::types::{AnswerRequirement, Classification, Flags, Relevance};

/// Whether a taxonomy value is created as a hidden label.
///
/// Only importance and topic labels show in the provider's label list.
pub fn is_hidden(name: &str) -> bool {
    AnswerRequirement::ALL.iter().any(|a| a.as_str() == name)
        || Relevance::ALL.iter().any(|r| r.as_str() == name)
        || Flags::NAMES.contains(&name)
}

/// Label names to apply for one classification.
///
/// Providers with folders get the topic as a folder instead of a label.
pub fn label_targets(classification: &Classification, folders: bool) -> Vec<String> {
    let mut names = Vec::with_capacity(8);
    if !folders {
        names.push(classification.topic.clone());
    }
    names.extend(classification.label_names());
    names
}

/// First palette color not yet taken; wraps around once all are used.
pub fn pick_color<'a>(palette: &[&'a str], used: &[String]) -> Option<&'a str> {
    if palette.is_empty() {
        return None;
    }
    palette
        .iter()
        .find(|c| !used.iter().any(|u| u.eq_ignore_ascii_case(c)))
        .copied()
        .or_else(|| Some(palette[used.len() % palette.len()]))
}
