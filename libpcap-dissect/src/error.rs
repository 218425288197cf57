use std::io;
use std::process::ExitStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0}")]
    Generic(&'static str),

    /// External tool could not be located
    #[error("tool not found in any of the following locations: {}", searched.join(", "))]
    ToolNotFound { searched: Vec<String> },

    /// External tool exited (or could not run) during a session
    #[error("tool seems to have crashed (status: {status:?}, command ran: \"{command}\")")]
    ToolCrashed {
        command: String,
        status: Option<ExitStatus>,
    },

    /// Raw container header or record is not recognized
    #[error("invalid raw container: {0}")]
    InvalidFormat(String),

    /// A single raw record exceeds the container size ceiling
    #[error("could not save whole packet, too big ({0} bytes)")]
    PayloadTooLarge(usize),

    /// Live archive buffer exceeded its bound
    #[error("internal buffering limit reached ({capacity} bytes)")]
    BufferOverrun { capacity: usize },

    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(String),

    /// Decoder output ended in the middle of a record
    #[error("malformed decoder stream: {0}")]
    MalformedStream(String),

    /// A complete record could not be interpreted as a packet
    #[error("invalid decoded record: {0}")]
    Pdml(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for Error {
    /// Errors wrapped into `io::Error` by our own `Read` implementations are
    /// unwrapped back to their original variant.
    fn from(e: io::Error) -> Self {
        if e.get_ref().map_or(false, |inner| inner.is::<Error>()) {
            if let Some(inner) = e.into_inner() {
                if let Ok(err) = inner.downcast::<Error>() {
                    return *err;
                }
            }
            return Error::Generic("unrecoverable wrapped error");
        }
        Error::Io(e)
    }
}

impl From<&'static str> for Error {
    fn from(s: &'static str) -> Self {
        Error::Generic(s)
    }
}
