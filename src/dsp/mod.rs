//! DSP building blocks for the organ engine.
//!
//! Everything here is real-time safe once constructed: no allocation, no
//! locks. The same code runs natively and in the browser through WASM.

pub mod chiff;
pub mod convolve;
pub mod convolver;
pub mod delay;
pub mod envelope;
pub mod filter;
pub mod interpolator;
pub mod limiter;
pub mod mixer;
pub mod renderer;
pub mod simd;
pub mod spatial;
pub mod worker;
