//! Fetch engine for the Danbooru post API.
//!
//! Identifiers go through the [`orchestrator`], which expands listings, hands tiered groups to the
//! [`scheduler`], classifies every response and normalizes successful payloads into [`record`]s.
//! Writing media to disk is a separate, optional step in [`materializer`].

pub mod backoff;
pub mod classifier;
pub mod identifier;
pub mod io;
pub mod listing;
pub mod materializer;
pub mod orchestrator;
pub mod record;
pub mod scheduler;
pub mod sender;

#[cfg(test)]
pub(crate) mod test_support;
