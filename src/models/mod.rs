//! OpenAI wire models for the two request dialects the gateway accepts.

pub mod chat;
pub mod responses;
