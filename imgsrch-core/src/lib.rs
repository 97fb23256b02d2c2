pub mod app_config;
pub mod embedding;
pub mod environment;
pub mod indexing;
pub mod library;
pub mod search;
pub mod store;
pub mod watch;

// Re-export the pieces a transport layer needs
pub use environment::init_ort;
pub use library::{ImageLibrary, LibraryError, LibraryOptions};
