use core::fmt::{self, Display};

/// Service extensions advertised in the EHLO capability list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extension {
    /// RFC 1870. A value of 0 indicates no maximum size is in force.
    Size(usize),
    /// RFC 3207. Only advertised while TLS is configured but not yet active.
    Starttls,
    /// RFC 3463 / RFC 2034.
    EnhancedStatusCodes,
}

impl Display for Extension {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> Result<(), fmt::Error> {
        match self {
            Self::Size(max) => write!(fmt, "SIZE {max}"),
            Self::Starttls => fmt.write_str("STARTTLS"),
            Self::EnhancedStatusCodes => fmt.write_str("ENHANCEDSTATUSCODES"),
        }
    }
}
