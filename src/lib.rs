pub mod cli;
pub mod config;
pub mod db;
pub mod device;
pub mod gossip;
mod metrics;
pub mod node;
pub mod server;
pub mod utils;
pub mod vector;

pub use config::Opts;
pub use db::{EmbeddingStore, FakeStore, Prediction, StoreError};
pub use node::FaceNode;
