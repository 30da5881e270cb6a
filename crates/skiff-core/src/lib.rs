//! Shared types for the skiff agent server: ids, event envelopes, chat
//! messages, the model stream contract, and the tool contract.

pub mod events;
pub mod ids;
pub mod messages;
pub mod provider;
pub mod stream;
pub mod tools;
