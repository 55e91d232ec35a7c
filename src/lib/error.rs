use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("unsupported resource identifier '{0}'")]
    Unsupported(String),
    #[error("operation not supported by {0} transport")]
    NotCapable(&'static str),
    #[error("{0} transport has no line settings")]
    NotSerial(&'static str),
    #[error("cannot connect to '{identifier}': {reason}")]
    ConnectFailed { identifier: String, reason: String },
    #[error("write failed: {0}")]
    WriteFailed(String),
    #[error("payload cannot be framed: {0:02X?}")]
    Unframeable(Vec<u8>),
    #[error("corrupted packet")]
    Corrupt,
    #[error("timed out")]
    TimedOut,
    #[error("no display detected")]
    NotFound,
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("{0:?} busy")]
    PortBusy(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Usb(#[from] rusb::Error),
    #[error(transparent)]
    Serial(#[from] serialport::Error),
    #[error(transparent)]
    Sys(#[from] nix::Error),
}

impl Error {
    /// Errors that only mean "nothing arrived in time".
    pub fn is_timeout(&self) -> bool {
        match self {
            Error::TimedOut => true,
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock
            ),
            Error::Usb(rusb::Error::Timeout) => true,
            Error::Sys(nix::errno::Errno::EAGAIN) => true,
            _ => false,
        }
    }

    /// True for every `Unsupported` flavour.
    pub fn is_unsupported(&self) -> bool {
        matches!(
            self,
            Error::Unsupported(_) | Error::NotCapable(_) | Error::NotSerial(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
