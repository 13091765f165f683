pub mod acquire;
pub mod chunk_plan;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod job;
pub mod notify;
pub mod package;
pub mod pipeline;
pub mod util;
pub mod workspace;
