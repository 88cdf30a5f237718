pub mod context;
pub mod types;
pub mod models;
pub mod manager;

pub use context::*;
pub use types::*;
pub use models::*;
pub use manager::*;
