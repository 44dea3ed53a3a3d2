pub mod asof;
pub mod config;
pub mod error;
pub mod event;
pub mod features;
pub mod grain;
pub mod label;
pub mod pipeline;
pub mod policy;
pub mod rng;
pub mod scoring;
pub mod sources;
pub mod store;
pub mod synth;
pub mod tiering;
pub mod types;
