mod error;
mod events;
mod input;

pub use error::*;
pub use events::*;
pub use input::*;
