use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("CPU profiler already started")]
    AlreadyStarted,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Signal setup failed: {0}")]
    Signal(String),

    #[error("Profiling timer error: {0}")]
    Timer(String),

    #[error("Refusing to profile: {0}")]
    PermissionDenied(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap the current `errno` for a failed signal call.
    pub(crate) fn last_signal_error(what: &str) -> Self {
        Error::Signal(format!("{what}: {}", std::io::Error::last_os_error()))
    }

    /// Wrap the current `errno` for a failed timer call.
    pub(crate) fn last_timer_error(what: &str) -> Self {
        Error::Timer(format!("{what}: {}", std::io::Error::last_os_error()))
    }
}

impl From<nix::Error> for Error {
    fn from(err: nix::Error) -> Self {
        Error::Io(std::io::Error::from(err))
    }
}
