pub mod acquirer;
pub mod cache;
pub mod catalog;
pub mod fetcher;
pub mod inference;
pub mod network;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod service;
