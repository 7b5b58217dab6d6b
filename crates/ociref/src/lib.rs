pub mod digest;
pub mod error;
pub mod manifest;
pub mod reference;

pub use digest::*;
pub use error::*;
pub use manifest::*;
pub use reference::*;
