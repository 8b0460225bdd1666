//! Decoding orchestration: the per-rank [`Decoder`], its shared
//! [`ExecutionContext`], session state and the greedy SPMD driver.

mod context;
mod decoder;
mod driver;
mod error;
mod session;
mod strategy;

pub use context::{ContextShape, ExecutionContext};
pub use decoder::{Decoder, LogitsView, StepDims, StepOutput};
pub use driver::{generate_greedy, GreedyRequest};
pub use error::{DecoderError, Result};
pub use session::{DecodingSession, SessionPhase};
pub use strategy::{AttnFfnMode, ExecutionStrategy, KvDataType};
