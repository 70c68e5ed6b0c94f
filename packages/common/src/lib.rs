pub mod document;
pub mod error;
pub mod id_generator;
pub mod identity;

pub use document::*;
pub use error::*;
pub use id_generator::*;
pub use identity::*;
