pub mod errors;
pub mod interfaces;
pub mod loader;
pub mod model;
pub mod permissions;
pub mod resolver;
pub mod xattr_store;

pub use errors::{Error, Result};
pub use loader::read_config_files;
pub use model::ConfigDocument;
pub use resolver::{resolve, EffectiveConfig};
