pub mod frame;
pub mod loader;
pub mod transformer;

pub use frame::*;
pub use loader::*;
pub use transformer::*;
