//! `healer`: clones a repository, runs its test suite in isolation,
//! attributes failures to files and lines, asks an external reasoning
//! model to synthesize patches, applies and reverifies them over a
//! bounded number of iterations, and publishes to a branch once green.

pub mod classifier;
pub mod config;
pub mod credential;
pub mod errors;
pub mod events;
pub mod failure_parser;
pub mod framework_probe;
pub mod git_driver;
pub mod http;
pub mod orchestrator;
pub mod patch_applier;
pub mod reasoner;
pub mod reasoner_client;
pub mod results;
pub mod sandbox;
pub mod types;
