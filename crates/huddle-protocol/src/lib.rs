pub mod messages;
pub mod methods;
pub mod types;

pub use messages::*;
pub use types::*;
