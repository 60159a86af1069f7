//! TCP transport adapter for the broker.

pub mod codec;
