pub mod entities;
pub mod errors;
pub mod events;
pub mod ports;
pub mod value_objects;

pub use entities::*;
pub use errors::{OrchestratorError, OrchestratorResult};
pub use events::*;
pub use ports::*;
pub use value_objects::*;
