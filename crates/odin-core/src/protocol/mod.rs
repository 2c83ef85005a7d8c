//! Wire protocol: constants and packet framing.

pub mod constants;
pub mod packet;

pub use packet::OdinCommand;
