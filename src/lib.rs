//! mail-triage: queue-driven email triage for Gmail and Outlook mailboxes.

pub mod config;
pub mod error;
pub mod gateway;
pub mod llm;
pub mod pipeline;
pub mod queue;
