//! mailbot answers whitelisted customer emails with LLM-drafted replies.

pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
