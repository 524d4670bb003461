//! Chat orchestration for note-taking assistants: provider adapters, a
//! streaming strategy, a staged request pipeline and a bounded tool loop.

pub mod config;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod tools;
