use std::{error::Error, fmt, sync::Arc};

/// The outcome of a failed operation on a call.
///
/// Values can be created using the `new` function or one of the specialized
/// associated functions.
/// ```rust
/// # use runnel::{Code, Status};
/// let status1 = Status::new(Code::Handler, "name is empty");
/// let status2 = Status::handler("name is empty");
///
/// assert_eq!(status1.code(), Code::Handler);
/// assert_eq!(status1.code(), status2.code());
/// ```
#[derive(Clone)]
pub struct Status {
    /// The status code, carried in `ERROR` frames.
    code: Code,
    /// A relevant error message, carried alongside the code.
    message: String,
    /// Optional underlying error. Never transmitted.
    source: Option<Arc<dyn Error + Send + Sync + 'static>>,
}

/// Status codes used by [`Status`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Code {
    /// An operation was attempted on a direction that is already half-closed
    /// or closed.
    InvalidState = 1,

    /// The connection or the stream underneath the call failed.
    Transport = 2,

    /// A message could not be encoded or decoded.
    Codec = 3,

    /// The service handler reported a failure.
    Handler = 4,

    /// The call was cancelled by its owner or by the peer.
    Cancelled = 5,

    /// The call deadline expired before the operation could complete.
    DeadlineExceeded = 6,

    /// No handler is registered for the requested method.
    Unimplemented = 7,

    /// The peer violated the message protocol of the call shape.
    Internal = 8,
}

impl Code {
    /// Get description of this `Code`.
    pub fn description(&self) -> &'static str {
        match self {
            Code::InvalidState => "Operation attempted on a closed direction",
            Code::Transport => "The transport failed",
            Code::Codec => "Malformed message",
            Code::Handler => "The handler reported an error",
            Code::Cancelled => "The call was cancelled",
            Code::DeadlineExceeded => "Deadline expired before operation could complete",
            Code::Unimplemented => "Method is not implemented",
            Code::Internal => "Internal error",
        }
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.description(), f)
    }
}

impl From<u8> for Code {
    fn from(i: u8) -> Self {
        match i {
            1 => Code::InvalidState,
            2 => Code::Transport,
            3 => Code::Codec,
            4 => Code::Handler,
            5 => Code::Cancelled,
            6 => Code::DeadlineExceeded,
            7 => Code::Unimplemented,
            _ => Code::Internal,
        }
    }
}

impl From<Code> for u8 {
    #[inline]
    fn from(code: Code) -> u8 {
        code as u8
    }
}

// ===== impl Status =====

impl Status {
    /// Create a new `Status` with the associated code and message.
    pub fn new(code: Code, message: impl Into<String>) -> Status {
        Status {
            code,
            message: message.into(),
            source: None,
        }
    }

    /// The direction is no longer open for this operation.
    pub fn invalid_state(message: impl Into<String>) -> Status {
        Status::new(Code::InvalidState, message)
    }

    /// The transport failed, or the peer went away without ending the stream.
    pub fn transport(message: impl Into<String>) -> Status {
        Status::new(Code::Transport, message)
    }

    /// A message could not be encoded or decoded.
    pub fn codec(message: impl Into<String>) -> Status {
        Status::new(Code::Codec, message)
    }

    /// Business-logic failure reported by a handler.
    pub fn handler(message: impl Into<String>) -> Status {
        Status::new(Code::Handler, message)
    }

    /// The call was cancelled (typically by the caller).
    pub fn cancelled(message: impl Into<String>) -> Status {
        Status::new(Code::Cancelled, message)
    }

    /// The call deadline elapsed.
    pub fn deadline_exceeded(message: impl Into<String>) -> Status {
        Status::new(Code::DeadlineExceeded, message)
    }

    /// No handler is registered for the method.
    pub fn unimplemented(message: impl Into<String>) -> Status {
        Status::new(Code::Unimplemented, message)
    }

    /// The peer broke the message protocol of the call shape.
    pub fn internal(message: impl Into<String>) -> Status {
        Status::new(Code::Internal, message)
    }

    /// Get the status code.
    pub fn code(&self) -> Code {
        self.code
    }

    /// Get the text error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Debug for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // A manual impl to reduce the noise of frequently empty fields.
        let mut builder = f.debug_struct("Status");

        builder.field("code", &self.code);

        if !self.message.is_empty() {
            builder.field("message", &self.message);
        }

        builder.field("source", &self.source);

        builder.finish()
    }
}

impl From<std::io::Error> for Status {
    fn from(err: std::io::Error) -> Self {
        let mut status = Status::transport(err.to_string());
        status.source = Some(Arc::new(err));
        status
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "status: {:?}, message: {:?}",
            self.code(),
            self.message()
        )
    }
}

impl Error for Status {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|err| (&**err) as _)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_wire_round_trip() {
        for code in [
            Code::InvalidState,
            Code::Transport,
            Code::Codec,
            Code::Handler,
            Code::Cancelled,
            Code::DeadlineExceeded,
            Code::Unimplemented,
            Code::Internal,
        ] {
            assert_eq!(Code::from(u8::from(code)), code);
        }

        assert_eq!(Code::from(0), Code::Internal);
        assert_eq!(Code::from(200), Code::Internal);
    }

    #[test]
    fn io_error_is_transport() {
        let err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe");
        let status = Status::from(err);

        assert_eq!(status.code(), Code::Transport);
        assert!(status.source().is_some());
    }
}
