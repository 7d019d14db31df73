#![deny(unused_variables)]
#![deny(dead_code)]
pub mod aggregate;
pub mod artifact;
pub mod bridge;
pub mod config;
pub mod export;
pub mod graph;
pub mod metrics;
pub mod pipeline;
pub mod samples;
pub mod sources;
pub mod table;
pub mod types;
