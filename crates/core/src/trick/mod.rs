//! Trick play over an indexed Transport Stream: fast forward, reverse and
//! seeking.

pub mod filter;
pub mod player;
pub mod remux;

pub use filter::TrickModeFilter;
pub use player::TrickPlayer;
pub use remux::EsToTransportStream;
