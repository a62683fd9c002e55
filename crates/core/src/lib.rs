pub mod events;
pub mod models;

pub use events::*;
pub use models::*;
