#![recursion_limit = "256"]

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod error;
pub mod export;
pub mod inference;
pub mod mask;
pub mod metrics;
pub mod model;
pub mod schedule;
pub mod tokenizer;
pub mod training;
