use thiserror::Error;

/// Errors surfaced to the scheduler.
///
/// `OutOfMemory` is the only recoverable case: the scheduler reacts by
/// evicting, swapping or delaying the requesting sequence. Invalid block
/// references (double free, fork of an unknown sequence) are caller bugs and
/// panic instead of returning an error.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no free KV cache blocks available")]
    OutOfMemory,
    #[error("input metadata missing `{0}`")]
    InvalidMetadata(&'static str),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
