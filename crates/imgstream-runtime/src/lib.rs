#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

pub mod decode;
pub mod engine;
pub mod fetch;
pub mod pool;
pub mod sampler;
pub mod sequence;
