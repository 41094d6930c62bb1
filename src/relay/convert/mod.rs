//! Cross-format request and response converters.
//!
//! The internal lingua franca is the Chat Completions shape: every inbound
//! format lowers to it when the upstream cannot serve the native protocol,
//! and every upstream answer rewrites back into the shape the client asked
//! in.

pub mod claude;
pub mod gemini;
pub mod responses;
