use core::fmt::{self, Display, Formatter};
use std::sync::LazyLock;

use regex::Regex;

/// Delivery Status Notifications are sent with an empty reverse-path, so the
/// FROM capture may be empty; the TO capture may not.
static MAIL_FROM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)FROM:<(.*)>(\s(.*))?").expect("FROM matcher is well-formed"));

static RCPT_TO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)TO:<(.+)>").expect("TO matcher is well-formed"));

static MAIL_SIZE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)SIZE=(\d+)").expect("SIZE matcher is well-formed"));

/// A single command line, split into an uppercased verb and its raw argument
/// tail. No argument validation happens at this layer; the session validates
/// MAIL and RCPT arguments against the matchers above when it dispatches.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Helo(String),
    Ehlo(String),
    Mail(String),
    Rcpt(String),
    Data,
    Rset,
    Noop,
    Quit,
    StartTls,
    Help,
    Vrfy,
    Expn,
    Unrecognized(String),
}

/// Why a MAIL argument string was rejected. Both map to a 501 reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MailArgError {
    From,
    Size,
}

impl From<&str> for Command {
    fn from(line: &str) -> Self {
        let (verb, args) = match line.split_once(' ') {
            Some((verb, args)) => (verb.to_ascii_uppercase(), args.trim()),
            None => (line.to_ascii_uppercase(), ""),
        };

        match verb.as_str() {
            "HELO" => Self::Helo(args.to_string()),
            "EHLO" => Self::Ehlo(args.to_string()),
            "MAIL" => Self::Mail(args.to_string()),
            "RCPT" => Self::Rcpt(args.to_string()),
            "DATA" => Self::Data,
            "RSET" => Self::Rset,
            "NOOP" => Self::Noop,
            "QUIT" => Self::Quit,
            "STARTTLS" => Self::StartTls,
            "HELP" => Self::Help,
            "VRFY" => Self::Vrfy,
            "EXPN" => Self::Expn,
            _ => Self::Unrecognized(verb),
        }
    }
}

impl Display for Command {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Helo(name) => write!(fmt, "HELO {name}"),
            Self::Ehlo(name) => write!(fmt, "EHLO {name}"),
            Self::Mail(args) => write!(fmt, "MAIL {args}"),
            Self::Rcpt(args) => write!(fmt, "RCPT {args}"),
            Self::Data => fmt.write_str("DATA"),
            Self::Rset => fmt.write_str("RSET"),
            Self::Noop => fmt.write_str("NOOP"),
            Self::Quit => fmt.write_str("QUIT"),
            Self::StartTls => fmt.write_str("STARTTLS"),
            Self::Help => fmt.write_str("HELP"),
            Self::Vrfy => fmt.write_str("VRFY"),
            Self::Expn => fmt.write_str("EXPN"),
            Self::Unrecognized(verb) => fmt.write_str(verb),
        }
    }
}

/// Match a MAIL argument string against `FROM:<reverse-path>` with an
/// optional trailing parameter group. SIZE is the only recognized parameter
/// (RFC 1870); any other parameter text is rejected.
pub(crate) fn parse_mail_args(args: &str) -> Result<(String, Option<usize>), MailArgError> {
    let caps = MAIL_FROM_RE.captures(args).ok_or(MailArgError::From)?;
    let reverse_path = caps.get(1).map_or("", |m| m.as_str()).to_string();

    match caps.get(3) {
        None => Ok((reverse_path, None)),
        Some(params) => {
            let size = MAIL_SIZE_RE
                .captures(params.as_str())
                .ok_or(MailArgError::Size)?;
            let size = size[1].parse::<usize>().map_err(|_| MailArgError::Size)?;
            Ok((reverse_path, Some(size)))
        }
    }
}

/// Match a RCPT argument string against `TO:<forward-path>`.
pub(crate) fn parse_rcpt_args(args: &str) -> Option<String> {
    RCPT_TO_RE
        .captures(args)
        .map(|caps| caps[1].to_string())
}
