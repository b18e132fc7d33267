//! Error and Result module.

use std::error::Error as StdError;
use std::fmt;

/// Result type often returned from methods that can have hearth `Error`s.
pub type Result<T> = std::result::Result<T, Error>;

type Cause = Box<dyn StdError + Send + Sync>;

/// Represents errors that can occur handling HTTP connections and requests.
pub struct Error {
    inner: Box<ErrorImpl>,
}

struct ErrorImpl {
    kind: Kind,
    cause: Option<Cause>,
}

#[derive(Debug)]
pub(crate) enum Kind {
    /// The request head could not be parsed.
    Parse(Parse),
    /// A message reached EOF, but is not complete.
    IncompleteMessage,
    /// An `io::Error` occurred while reading or writing a network stream.
    Io,
    /// Error creating a listener socket.
    Listen,
    /// The connection was closed while an operation was still pending.
    Closed,
    /// The runtime refused to start with the given configuration.
    Config,
    /// The caller misused the gateway or the framework.
    User(User),
}

#[derive(Debug)]
pub(crate) enum Parse {
    Method,
    Version,
    Uri,
    Header,
    /// The header block grew past the configured maximum.
    TooLarge,
    /// Body framing (content-length, chunk size) was invalid.
    Body,
}

#[derive(Debug)]
pub(crate) enum User {
    /// `send_body` was called before `send_start`.
    UnstartedSend,
    /// `send_start` was called twice on the same request.
    DoubleStart,
    /// `send_body` was called after the final body chunk.
    SendAfterEnd,
    /// Bytes written did not match the declared `content-length`.
    BodyLengthMismatch,
    /// A route template failed to compile.
    Route,
    /// A captured argument could not be converted to any requested type.
    Convert,
    /// An endpoint handler (or one of its hooks) returned an error.
    Handler,
}

impl Error {
    fn new(kind: Kind) -> Error {
        Error {
            inner: Box::new(ErrorImpl { kind, cause: None }),
        }
    }

    fn with<C: Into<Cause>>(mut self, cause: C) -> Error {
        self.inner.cause = Some(cause.into());
        self
    }

    /// Returns true if this was an HTTP parse error.
    pub fn is_parse(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(_))
    }

    /// Returns true if this was a parse error caused by an oversized header block.
    pub fn is_parse_too_large(&self) -> bool {
        matches!(self.inner.kind, Kind::Parse(Parse::TooLarge))
    }

    /// Returns true if this error was caused by user code.
    pub fn is_user(&self) -> bool {
        matches!(self.inner.kind, Kind::User(_))
    }

    /// Returns true if the connection was closed under the operation.
    pub fn is_closed(&self) -> bool {
        matches!(self.inner.kind, Kind::Closed)
    }

    /// Returns true if the runtime refused to start with the given
    /// configuration.
    pub fn is_config(&self) -> bool {
        matches!(self.inner.kind, Kind::Config)
    }

    /// Returns true if the connection closed before a message could complete.
    pub fn is_incomplete_message(&self) -> bool {
        matches!(self.inner.kind, Kind::IncompleteMessage)
    }

    /// Returns true if this was an `io::Error` on the network stream.
    pub fn is_io(&self) -> bool {
        matches!(self.inner.kind, Kind::Io)
    }

    /// Returns true if a listener socket could not be created.
    pub fn is_listen(&self) -> bool {
        matches!(self.inner.kind, Kind::Listen)
    }

    /// Returns true if a captured argument failed conversion.
    pub fn is_convert(&self) -> bool {
        matches!(self.inner.kind, Kind::User(User::Convert))
    }

    /// Returns the error's cause, if one was attached.
    pub fn cause(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner.cause.as_ref().map(|c| &**c as _)
    }

    pub(crate) fn new_parse(parse: Parse) -> Error {
        Error::new(Kind::Parse(parse))
    }

    pub(crate) fn new_incomplete() -> Error {
        Error::new(Kind::IncompleteMessage)
    }

    pub(crate) fn new_io(cause: std::io::Error) -> Error {
        Error::new(Kind::Io).with(cause)
    }

    pub(crate) fn new_listen<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Listen).with(cause)
    }

    pub(crate) fn new_closed() -> Error {
        Error::new(Kind::Closed)
    }

    pub(crate) fn new_config<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::Config).with(cause)
    }

    pub(crate) fn new_user(user: User) -> Error {
        Error::new(Kind::User(user))
    }

    pub(crate) fn new_user_route<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Route)).with(cause)
    }

    pub(crate) fn new_user_convert<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Convert)).with(cause)
    }

    /// Wraps an arbitrary application error for the endpoint error pipeline.
    pub fn new_handler<E: Into<Cause>>(cause: E) -> Error {
        Error::new(Kind::User(User::Handler)).with(cause)
    }

    /// Wraps a plain message as a handler error.
    pub fn msg<S: Into<String>>(msg: S) -> Error {
        Error::new(Kind::User(User::Handler)).with(MessageCause(msg.into()))
    }

    fn description(&self) -> &str {
        match self.inner.kind {
            Kind::Parse(Parse::Method) => "invalid HTTP method parsed",
            Kind::Parse(Parse::Version) => "invalid HTTP version parsed",
            Kind::Parse(Parse::Uri) => "invalid URI",
            Kind::Parse(Parse::Header) => "invalid HTTP header parsed",
            Kind::Parse(Parse::TooLarge) => "message head is too large",
            Kind::Parse(Parse::Body) => "invalid HTTP body framing",
            Kind::IncompleteMessage => "connection closed before message completed",
            Kind::Io => "connection error",
            Kind::Listen => "error creating server listener",
            Kind::Closed => "connection closed",
            Kind::Config => "invalid runtime configuration",
            Kind::User(User::UnstartedSend) => "send_body called before send_start",
            Kind::User(User::DoubleStart) => "send_start called more than once",
            Kind::User(User::SendAfterEnd) => "send_body called after the final chunk",
            Kind::User(User::BodyLengthMismatch) => {
                "body does not match the declared content-length"
            }
            Kind::User(User::Route) => "invalid route template",
            Kind::User(User::Convert) => "argument conversion failed",
            Kind::User(User::Handler) => "endpoint handler error",
        }
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut f = f.debug_tuple("hearth::Error");
        f.field(&self.inner.kind);
        if let Some(ref cause) = self.inner.cause {
            f.field(cause);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref cause) = self.inner.cause {
            write!(f, "{}: {}", self.description(), cause)
        } else {
            f.write_str(self.description())
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.inner
            .cause
            .as_ref()
            .map(|cause| &**cause as &(dyn StdError + 'static))
    }
}

struct MessageCause(String);

impl fmt::Debug for MessageCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.0, f)
    }
}

impl fmt::Display for MessageCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl StdError for MessageCause {}
