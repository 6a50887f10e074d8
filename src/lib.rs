//! Mail Assist: multi-tenant mail ingestion, classification and labelling.

pub mod config;
pub mod error;
pub mod labels;
pub mod llm;
pub mod normalize;
pub mod pipeline;
pub mod providers;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
