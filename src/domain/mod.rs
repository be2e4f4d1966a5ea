pub mod models;
pub mod timeline;

pub use models::*;
