//! Responses streamed back from a dispatched command

use tokio::sync::mpsc;

/// Buffer size for a command's response channel.
pub(crate) const RESPONSE_BUFFER: usize = 64;

/// One event in a command's response stream.
///
/// A dispatched command yields zero or more `Stdout`/`Stderr` lines
/// followed by exactly one terminal response (`Exit` or `Error`), after
/// which the channel closes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// One line of the remote command's standard output
    Stdout(String),
    /// One line of the remote command's standard error
    Stderr(String),
    /// The remote command exited with this return code (terminal)
    Exit(i32),
    /// The command failed before producing an exit code (terminal)
    Error(String),
}

impl Response {
    /// Whether this is a standard-output line
    pub fn is_stdout(&self) -> bool {
        matches!(self, Self::Stdout(_))
    }

    /// Whether this is a standard-error line
    pub fn is_stderr(&self) -> bool {
        matches!(self, Self::Stderr(_))
    }

    /// Whether this is a normal exit
    pub fn is_exit(&self) -> bool {
        matches!(self, Self::Exit(_))
    }

    /// Whether this is a failure report
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }

    /// Whether this response ends the stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exit(_) | Self::Error(_))
    }

    /// The text payload, for output lines and errors
    pub fn text(&self) -> Option<&str> {
        match self {
            Self::Stdout(s) | Self::Stderr(s) | Self::Error(s) => Some(s),
            Self::Exit(_) => None,
        }
    }

    /// The return code, for normal exits
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit(code) => Some(*code),
            _ => None,
        }
    }
}

/// A command queued on an agent's mailbox: the opaque payload plus the
/// channel its responses flow back on. The sender half is owned by the
/// session that executes the command; dropping it after the terminal
/// response closes the stream.
pub(crate) struct Message {
    pub payload: Vec<u8>,
    pub responses: mpsc::Sender<Response>,
}
