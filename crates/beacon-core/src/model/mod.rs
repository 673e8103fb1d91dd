pub mod delivery;
pub mod notification;

pub use delivery::*;
pub use notification::*;
