use core::fmt::{self, Display, Formatter};

/// SMTP reply codes this server can emit (RFC 5321 section 4.2.3, plus the
/// nonstandard 403 used to report a failed STARTTLS handshake).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
pub enum Status {
    ServiceReady = 220,
    GoodBye = 221,
    Ok = 250,
    StartMailInput = 354,
    HandshakeFailed = 403,
    Unavailable = 421,
    ActionAborted = 451,
    TooManyRecipients = 452,
    UnrecognizedCommand = 500,
    InvalidParameter = 501,
    NotImplemented = 502,
    InvalidCommandSequence = 503,
    TlsRequired = 530,
    MailboxUnavailable = 550,
    ExceededStorage = 552,
}

impl Status {
    /// Checks if the status is a permanent rejection
    #[must_use]
    pub fn is_permanent(self) -> bool {
        u16::from(self) >= 500
    }

    /// Checks if the status is a temporary rejection
    #[must_use]
    pub fn is_temporary(self) -> bool {
        u16::from(self) >= 400 && u16::from(self) < 500
    }
}

impl From<Status> for u16 {
    fn from(value: Status) -> Self {
        value as Self
    }
}

impl Display for Status {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> Result<(), fmt::Error> {
        write!(fmt, "{}", u16::from(*self))
    }
}
