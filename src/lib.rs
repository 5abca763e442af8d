//! Mail Assist: email assistant backed by an external agent CLI.

pub mod assistant;
pub mod channels;
pub mod config;
pub mod error;
pub mod pipeline;
