use thiserror::Error;

/// Errors surfaced by the channel and pool layer.
///
/// Audio-path problems never appear here: a failing track is silenced inside
/// the mixer and a dying listener is torn down locally. These variants are
/// control-plane outcomes returned to the caller.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Every channel is bound and in use
    #[error("No channel available in the pool")]
    NoChannelAvailable,

    /// A theme load is already in flight on this channel
    #[error("Channel {0} already has a theme load in progress")]
    LoadInProgress(usize),

    /// The requested channel id does not exist
    #[error("Unknown channel {0}")]
    UnknownChannel(usize),

    /// The incoming theme mixer could not be built
    #[error(transparent)]
    Engine(#[from] sonaudio::EngineError),

    /// The MP3 encoder could not be initialized
    #[error("MP3 encoder init failed: {0}")]
    EncoderInit(String),
}
