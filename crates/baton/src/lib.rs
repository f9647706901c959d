//! Baton bridges chat conversations to a local coding agent speaking the
//! Agent Client Protocol, one supervised subprocess per conversation.

pub mod acp;
pub mod app;
pub mod domain;
pub mod infra;
pub mod transport;
