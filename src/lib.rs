//! # mailslot
//!
//! An embeddable SMTP/ESMTP receiver.
//!
//! mailslot accepts TCP (optionally TLS) connections, drives each one through
//! the RFC 5321 command/response state machine, assembles the received
//! message, and hands the raw RFC 5322 bytes plus envelope to a handler you
//! provide. It does not relay, queue, store, or authenticate, and it never
//! looks inside the message; all of that belongs to the application.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use mailslot::{Server, Signal};
//!
//! #[tokio::main]
//! async fn main() {
//!     let (_shutdown, signals) = tokio::sync::broadcast::channel::<Signal>(1);
//!
//!     let server = Server::new()
//!         .with_addr("0.0.0.0:2525")
//!         .with_hostname("mail.example.com")
//!         .with_handler(Arc::new(|_peer, from, to, data| {
//!             println!("{} -> {:?}: {} bytes", from, to, data.len());
//!         }));
//!
//!     server.listen_and_serve(signals).await.expect("serve failed");
//! }
//! ```
//!
//! ## Protocol support
//!
//! - `HELO`/`EHLO`, `MAIL FROM` (including the null reverse-path and the
//!   RFC 1870 SIZE parameter), `RCPT TO`, `DATA` with transparent
//!   dot-unstuffing, `RSET`, `NOOP`, `QUIT`
//! - `STARTTLS` (RFC 3207) with an in-place transport upgrade, plus an
//!   optional TLS-only listener mode
//! - Enhanced status codes (RFC 3463) on replies
//! - A Received header is prepended to every delivered message
//!
//! `HELP`, `VRFY`, and `EXPN` answer `502`; there is no AUTH, no pipelining
//! beyond serialized requests, and no BDAT/CHUNKING.

pub mod error;
pub mod logging;
pub mod server;
pub mod smtp;

pub use error::{DataError, ServerError, SessionError, TlsError};
pub use server::{Handler, RcptHandler, Server, Signal, TlsContext};
pub use smtp::session::Session;
