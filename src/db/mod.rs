pub mod blob;
pub mod error;
pub mod fake;
pub mod index;
pub mod store;

pub use blob::{BlobStore, Layout};
pub use error::{Result, StoreError};
pub use fake::FakeStore;
pub use store::*;
