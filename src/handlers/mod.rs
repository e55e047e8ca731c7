//! HTTP handlers for the coordination API.
//!
//! Three groups: [`upload`] drives the session state machine and the
//! manifest-adjacent staging endpoint, [`manifest`] serves producers
//! and polling consumers, [`files`] covers grants, deletion, copying
//! and listing.  Handlers validate, gate, delegate to a coordinator,
//! and shape the JSON reply; none of them touch backend paths directly.

pub mod files;
pub mod manifest;
pub mod upload;
