//! Library root for the `feedveil` crate
//! Incremental classification and moderation of a content feed

// Core error handling
pub mod errors;

// Content model
pub mod content_tree;
pub mod decision;

// Pipeline stages
pub mod watcher;
pub mod scanner;
pub mod classifier;
pub mod mutator;
pub mod persistence;
pub mod pipeline;

// Configuration & CLI
pub mod cli;
pub mod config_loader;

// Settings web surface
pub mod settings_web;

// Logging
pub mod logging;


pub use classifier::{Classifier, HttpClassifier};
pub use decision::{Assessment, Decision, Identity, Policy};
pub use errors::{VeilError, VeilResult};
pub use persistence::{ConcealmentRecord, KeyValueStore, MemoryStore, PersistenceBridge, SledStore};
pub use pipeline::{HostEvent, ModerationPipeline};
