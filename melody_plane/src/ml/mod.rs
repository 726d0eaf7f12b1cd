pub mod cell;
pub mod melody;
mod network;
mod random;

pub use network::*;
pub use random::*;
