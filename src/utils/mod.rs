//! Process bootstrap and submission retry policy.

pub mod bootstrap;
pub mod retry;
