use std::{
    future::Future,
    io,
    net::SocketAddr,
    sync::{Arc, LazyLock},
    time::Duration,
};

use chrono::Local;
use hickory_resolver::{name_server::TokioConnectionProvider, TokioResolver};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, trace, warn};

use crate::{
    error::{DataError, SessionError},
    server::Server,
    smtp::{
        command::{self, Command, MailArgError},
        connection::Connection,
        extensions::Extension,
        status::Status,
    },
};

/// RFC 5321 section 4.5.3.1.8: a server must accept at least 100 recipients
/// per transaction. The 101st accepted attempt is refused with a 452.
pub(crate) const MAX_RECIPIENTS: usize = 100;

static RESOLVER: LazyLock<Option<TokioResolver>> = LazyLock::new(|| {
    TokioResolver::builder(TokioConnectionProvider::default())
        .map(|builder| builder.build())
        .ok()
});

/// The sender and recipients accumulated between reset points.
///
/// `have_sender` distinguishes "no MAIL yet" from an accepted null
/// reverse-path (`MAIL FROM:<>`); an empty string alone cannot.
#[derive(Debug, Default)]
struct Envelope {
    reverse_path: String,
    have_sender: bool,
    forward_paths: Vec<String>,
}

impl Envelope {
    fn reset(&mut self) {
        self.reverse_path.clear();
        self.have_sender = false;
        self.forward_paths.clear();
    }
}

/// One SMTP session, owned by the connection it serves.
///
/// The session is strictly serial: commands are processed one at a time and
/// every command line receives exactly one reply (or one multi-line 250 block)
/// before the next line is read.
pub struct Session<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> {
    server: Arc<Server>,
    connection: Connection<Stream>,
    peer: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    remote_ip: String,
    remote_host: String,
    remote_name: String,
    tls_active: bool,
    envelope: Envelope,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send + Sync> Session<Stream> {
    /// Build a session around a live connection.
    ///
    /// Performs the reverse-DNS lookup of the peer address used by the
    /// Received header. `tls_active` marks transports that are already TLS
    /// (connections accepted by a TLS listener).
    pub async fn create(
        server: Arc<Server>,
        stream: Stream,
        peer: SocketAddr,
        acceptor: Option<TlsAcceptor>,
        tls_active: bool,
    ) -> Self {
        let remote_ip = peer.ip().to_string();
        let remote_host = reverse_lookup(peer).await;

        Self {
            server,
            connection: Connection::plain(stream),
            peer,
            acceptor,
            remote_ip,
            remote_host,
            remote_name: String::new(),
            tls_active,
            envelope: Envelope::default(),
        }
    }

    /// Drive the session until the client quits, goes away, or times out.
    pub async fn serve(mut self) -> Result<(), SessionError> {
        debug!(target: "mailslot::session", peer = %self.peer, "connected");

        self.writef(format!(
            "{} {} {} ESMTP Service ready",
            Status::ServiceReady,
            self.server.hostname,
            self.server.appname
        ))
        .await?;

        loop {
            let line = match self.read_line().await {
                Ok(line) => line,
                Err(SessionError::Timeout(secs)) => {
                    let _ = self.timeout_notice().await;
                    return Err(SessionError::Timeout(secs));
                }
                Err(SessionError::Connection(err))
                    if err.kind() == io::ErrorKind::UnexpectedEof =>
                {
                    debug!(target: "mailslot::session", peer = %self.peer, "connection closed by peer");
                    return Ok(());
                }
                Err(err) => return Err(err),
            };

            let command = Command::from(line.as_str());
            trace!(target: "mailslot::wire", peer = %self.peer, "<< {command}");

            // RFC 3207: when TLS is required but not yet in use, every verb
            // outside this set is refused before it can take effect.
            if self.must_starttls(&command) {
                self.writef(format!(
                    "{} 5.7.0 Must issue a STARTTLS command first",
                    Status::TlsRequired
                ))
                .await?;
                continue;
            }

            match command {
                Command::Helo(name) => {
                    self.remote_name = name;
                    // RFC 2821 section 4.1.4: EHLO has the same effect as
                    // RSET, and HELO is treated alike.
                    self.envelope.reset();
                    self.writef(format!(
                        "{} {} greets {}",
                        Status::Ok,
                        self.server.hostname,
                        self.remote_name
                    ))
                    .await?;
                }
                Command::Ehlo(name) => {
                    self.remote_name = name;
                    self.envelope.reset();
                    for line in self.ehlo_response() {
                        self.writef(line).await?;
                    }
                }
                Command::Mail(args) => {
                    let reply = match command::parse_mail_args(&args) {
                        Err(MailArgError::From) => format!(
                            "{} 5.5.4 Syntax error in parameters or arguments (invalid FROM parameter)",
                            Status::InvalidParameter
                        ),
                        Err(MailArgError::Size) => format!(
                            "{} 5.5.4 Syntax error in parameters or arguments (invalid SIZE parameter)",
                            Status::InvalidParameter
                        ),
                        Ok((_, Some(declared)))
                            if self.server.max_size > 0 && declared > self.server.max_size =>
                        {
                            format!(
                                "{} 5.3.4 Requested mail action aborted: exceeded storage allocation ({})",
                                Status::ExceededStorage,
                                self.server.max_size
                            )
                        }
                        Ok((reverse_path, _)) => {
                            self.envelope.reverse_path = reverse_path;
                            self.envelope.have_sender = true;
                            format!("{} 2.1.0 Ok", Status::Ok)
                        }
                    };

                    // MAIL opens a fresh transaction even when it is refused
                    self.envelope.forward_paths.clear();
                    self.writef(reply).await?;
                }
                Command::Rcpt(args) => {
                    let reply = if !self.envelope.have_sender {
                        format!(
                            "{} 5.5.1 Bad sequence of commands (MAIL required before RCPT)",
                            Status::InvalidCommandSequence
                        )
                    } else {
                        match command::parse_rcpt_args(&args) {
                            None => format!(
                                "{} 5.5.4 Syntax error in parameters or arguments (invalid TO parameter)",
                                Status::InvalidParameter
                            ),
                            Some(_) if self.envelope.forward_paths.len() == MAX_RECIPIENTS => {
                                format!("{} 4.5.3 Too many recipients", Status::TooManyRecipients)
                            }
                            Some(forward_path) => {
                                let accept = self.server.rcpt_handler.as_ref().map_or(
                                    true,
                                    |handler| {
                                        handler(
                                            self.peer,
                                            &self.envelope.reverse_path,
                                            &forward_path,
                                        )
                                    },
                                );

                                if accept {
                                    self.envelope.forward_paths.push(forward_path);
                                    format!("{} 2.1.5 Ok", Status::Ok)
                                } else {
                                    format!(
                                        "{} 5.1.0 Requested action not taken: mailbox unavailable",
                                        Status::MailboxUnavailable
                                    )
                                }
                            }
                        }
                    };

                    self.writef(reply).await?;
                }
                Command::Data => {
                    if !self.envelope.have_sender || self.envelope.forward_paths.is_empty() {
                        self.writef(format!(
                            "{} 5.5.1 Bad sequence of commands (MAIL & RCPT required before DATA)",
                            Status::InvalidCommandSequence
                        ))
                        .await?;
                        continue;
                    }

                    self.writef(format!(
                        "{} Start mail input; end with <CR><LF>.<CR><LF>",
                        Status::StartMailInput
                    ))
                    .await?;

                    match self.read_data().await {
                        Err(DataError::Timeout(secs)) => {
                            let _ = self.timeout_notice().await;
                            return Err(SessionError::Timeout(secs));
                        }
                        Err(DataError::MaxSizeExceeded(limit)) => {
                            self.writef(format!(
                                "{} 5.3.4 Requested mail action aborted: exceeded storage allocation ({limit})",
                                Status::ExceededStorage
                            ))
                            .await?;
                        }
                        Err(DataError::Io(err)) => {
                            warn!(target: "mailslot::session", peer = %self.peer, "error reading message data: {err}");
                            self.writef(format!(
                                "{} 4.3.0 Requested action aborted: local error in processing",
                                Status::ActionAborted
                            ))
                            .await?;
                        }
                        Ok(data) => {
                            let mut message = self.received_header();
                            message.extend_from_slice(&data);

                            self.writef(format!("{} 2.0.0 Ok: queued", Status::Ok)).await?;

                            self.dispatch(message);
                            self.envelope.reset();
                        }
                    }
                }
                Command::Rset => {
                    self.envelope.reset();
                    self.writef(format!("{} 2.0.0 Ok", Status::Ok)).await?;
                }
                Command::Noop => {
                    self.writef(format!("{} 2.0.0 Ok", Status::Ok)).await?;
                }
                Command::Quit => {
                    self.writef(format!(
                        "{} 2.0.0 {} {} ESMTP Service closing transmission channel",
                        Status::GoodBye,
                        self.server.hostname,
                        self.server.appname
                    ))
                    .await?;
                    debug!(target: "mailslot::session", peer = %self.peer, "connection closed");
                    return Ok(());
                }
                Command::Help | Command::Vrfy | Command::Expn => {
                    // RFC 5321 section 4.2.4 for the use of 500 and 502
                    self.writef(format!(
                        "{} 5.5.1 Command not implemented",
                        Status::NotImplemented
                    ))
                    .await?;
                }
                Command::StartTls => {
                    let Some(acceptor) = self.acceptor.clone() else {
                        self.writef(format!(
                            "{} 5.5.1 Command not implemented",
                            Status::NotImplemented
                        ))
                        .await?;
                        continue;
                    };

                    // RFC 3207 forbids a second STARTTLS
                    if self.tls_active {
                        self.writef(format!(
                            "{} 5.5.1 Bad sequence of commands (TLS already in use)",
                            Status::InvalidCommandSequence
                        ))
                        .await?;
                        continue;
                    }

                    self.writef(format!("{} 2.0.0 Ready to start TLS", Status::ServiceReady))
                        .await?;

                    match self.connection.upgrade(&acceptor).await {
                        Ok((connection, info)) => {
                            self.connection = connection;
                            self.tls_active = true;

                            // RFC 3207: discard all knowledge obtained from
                            // the client before the handshake
                            self.remote_name.clear();
                            self.envelope.reset();

                            debug!(
                                target: "mailslot::session",
                                peer = %self.peer,
                                proto = %info.proto(),
                                cipher = %info.cipher(),
                                "connection upgraded"
                            );
                        }
                        Err((err, connection)) => {
                            self.connection = connection;
                            let _ = self
                                .writef(format!(
                                    "{} 4.7.0 TLS handshake failed",
                                    Status::HandshakeFailed
                                ))
                                .await;
                            return Err(SessionError::Handshake(err));
                        }
                    }
                }
                Command::Unrecognized(_) => {
                    self.writef(format!(
                        "{} 5.5.2 Syntax error, command unrecognized",
                        Status::UnrecognizedCommand
                    ))
                    .await?;
                }
            }
        }
    }

    fn must_starttls(&self, command: &Command) -> bool {
        self.server.tls_required
            && self.acceptor.is_some()
            && !self.tls_active
            && !matches!(
                command,
                Command::Noop | Command::Ehlo(_) | Command::StartTls | Command::Quit
            )
    }

    fn capabilities(&self) -> Vec<Extension> {
        let mut extensions = vec![Extension::Size(self.server.max_size)];

        if self.acceptor.is_some() && !self.tls_active {
            extensions.push(Extension::Starttls);
        }

        extensions.push(Extension::EnhancedStatusCodes);
        extensions
    }

    /// The multi-line 250 block sent in response to EHLO. Continuation lines
    /// use `250-`, the final line `250 `.
    fn ehlo_response(&self) -> Vec<String> {
        let extensions = self.capabilities();
        let last = extensions.len() - 1;

        let mut response = vec![format!(
            "{}-{} greets {}",
            Status::Ok,
            self.server.hostname,
            self.remote_name
        )];

        for (idx, extension) in extensions.iter().enumerate() {
            response.push(format!(
                "{}{}{}",
                Status::Ok,
                if idx == last { ' ' } else { '-' },
                extension
            ));
        }

        response
    }

    /// Read the message body following a DATA command, up to the lone `.`
    /// terminator. A leading period on any other line is stripped (RFC 5321
    /// section 4.5.2); the rest of the line, CRLF included, is kept verbatim.
    async fn read_data(&mut self) -> Result<Vec<u8>, DataError> {
        let secs = self.server.timeout_secs;
        let max_size = self.server.max_size;
        let mut data = Vec::new();

        loop {
            let line = with_deadline(secs, self.connection.read_line())
                .await
                .map_err(|err| {
                    if err.kind() == io::ErrorKind::TimedOut {
                        DataError::Timeout(secs)
                    } else {
                        DataError::Io(err)
                    }
                })?;

            if line == b".\r\n" {
                break;
            }

            let line = if line.first() == Some(&b'.') {
                &line[1..]
            } else {
                &line[..]
            };

            if max_size > 0 && data.len() + line.len() > max_size {
                self.connection.discard_buffered();
                return Err(DataError::MaxSizeExceeded(max_size));
            }

            data.extend_from_slice(line);
        }

        Ok(data)
    }

    /// The trace header prepended to every delivered message
    /// (RFC 5321 section 4.4).
    // TODO: decide how to name more than one recipient in the "for" clause
    fn received_header(&self) -> Vec<u8> {
        let date = Local::now().to_rfc2822();

        format!(
            "Received: from {} ({} [{}])\r\n        by {} ({}) with SMTP\r\n        for <{}>; {}\r\n",
            self.remote_name,
            self.remote_host,
            self.remote_ip,
            self.server.hostname,
            self.server.appname,
            self.envelope.forward_paths[0],
            date
        )
        .into_bytes()
    }

    /// Hand the finished message to the application handler on its own task,
    /// so a slow handler cannot stall the session.
    fn dispatch(&self, message: Vec<u8>) {
        if let Some(handler) = self.server.handler.clone() {
            let peer = self.peer;
            let reverse_path = self.envelope.reverse_path.clone();
            let forward_paths = self.envelope.forward_paths.clone();

            tokio::spawn(async move {
                handler(peer, reverse_path, forward_paths, message);
            });
        }
    }

    async fn read_line(&mut self) -> Result<String, SessionError> {
        let secs = self.server.timeout_secs;

        let raw = with_deadline(secs, self.connection.read_line())
            .await
            .map_err(|err| {
                if err.kind() == io::ErrorKind::TimedOut {
                    SessionError::Timeout(secs)
                } else {
                    SessionError::Connection(err)
                }
            })?;

        Ok(String::from_utf8_lossy(&raw).trim().to_string())
    }

    async fn writef(&mut self, line: String) -> Result<(), SessionError> {
        trace!(target: "mailslot::wire", peer = %self.peer, ">> {line}");
        let secs = self.server.timeout_secs;

        with_deadline(secs, self.connection.send(&line))
            .await
            .map_err(|err| {
                if err.kind() == io::ErrorKind::TimedOut {
                    SessionError::Timeout(secs)
                } else {
                    SessionError::Connection(err)
                }
            })
    }

    async fn timeout_notice(&mut self) -> Result<(), SessionError> {
        self.writef(format!(
            "{} 4.4.2 {} {} ESMTP Service closing transmission channel after timeout exceeded",
            Status::Unavailable,
            self.server.hostname,
            self.server.appname
        ))
        .await
    }
}

/// Apply the idle deadline to a single read or write. A timeout surfaces as
/// `ErrorKind::TimedOut` so callers can tell it apart from transport faults.
async fn with_deadline<T>(
    secs: u64,
    fut: impl Future<Output = io::Result<T>>,
) -> io::Result<T> {
    if secs == 0 {
        return fut.await;
    }

    match tokio::time::timeout(Duration::from_secs(secs), fut).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "idle timeout exceeded",
        )),
    }
}

async fn reverse_lookup(peer: SocketAddr) -> String {
    let ip = peer.ip();

    // The loopback address has no PTR record worth querying for
    if ip.is_loopback() {
        return "localhost".to_string();
    }

    let Some(resolver) = RESOLVER.as_ref() else {
        return "unknown".to_string();
    };

    match resolver.reverse_lookup(ip).await {
        Ok(names) => names
            .iter()
            .next()
            .map_or_else(|| "unknown".to_string(), |ptr| ptr.to_string()),
        Err(_) => "unknown".to_string(),
    }
}

#[cfg(test)]
mod test {
    use std::{net::SocketAddr, sync::Arc};

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::Session;
    use crate::server::Server;

    fn peer() -> SocketAddr {
        "127.0.0.1:2525".parse().expect("loopback peer")
    }

    fn test_server() -> Server {
        Server::new().with_hostname("mail.example.com")
    }

    /// Feed a scripted transcript into a session over an in-memory duplex
    /// stream and return everything the session wrote back.
    async fn transcript(server: Server, input: &str) -> String {
        let (mut client, stream) = tokio::io::duplex(64 * 1024);

        let session = Session::create(Arc::new(server), stream, peer(), None, false).await;
        let task = tokio::spawn(session.serve());

        client.write_all(input.as_bytes()).await.unwrap();
        client.shutdown().await.unwrap();

        let mut output = Vec::new();
        client.read_to_end(&mut output).await.unwrap();

        let _ = task.await.unwrap();
        String::from_utf8(output).unwrap()
    }

    fn codes(output: &str) -> Vec<&str> {
        output
            .lines()
            .map(|line| line.get(..4).unwrap_or(line))
            .collect()
    }

    #[tokio::test]
    async fn banner_then_goodbye() {
        let output = transcript(test_server(), "QUIT\r\n").await;

        assert!(output.starts_with("220 mail.example.com smtpd ESMTP Service ready\r\n"));
        assert!(output.contains("221 2.0.0 mail.example.com smtpd ESMTP Service closing"));
    }

    #[tokio::test]
    async fn simple_verbs_need_no_greeting() {
        let output = transcript(
            test_server(),
            "NOOP\r\nRSET\r\nHELP\r\nVRFY\r\nEXPN\r\nTEST\r\n\r\nQUIT\r\n",
        )
        .await;

        assert_eq!(
            codes(&output),
            vec!["220 ", "250 ", "250 ", "502 ", "502 ", "502 ", "500 ", "500 ", "221 "]
        );
    }

    #[tokio::test]
    async fn ehlo_capability_block() {
        let output = transcript(test_server(), "EHLO client.example.net\r\nQUIT\r\n").await;

        assert!(output.contains("250-mail.example.com greets client.example.net\r\n"));
        assert!(output.contains("250-SIZE 0\r\n"));
        assert!(output.contains("250 ENHANCEDSTATUSCODES\r\n"));
        // STARTTLS is only advertised when TLS is configured
        assert!(!output.contains("STARTTLS"));
    }

    #[tokio::test]
    async fn transaction_resets_after_delivery() {
        let output = transcript(
            test_server(),
            "EHLO x\r\nMAIL FROM:<a@b.c>\r\nRCPT TO:<c@d.e>\r\nDATA\r\nTest\r\n.\r\nDATA\r\nQUIT\r\n",
        )
        .await;

        assert!(output.contains("354 "));
        assert!(output.contains("250 2.0.0 Ok: queued\r\n"));
        // The second DATA arrives with an empty envelope
        assert!(output.contains("503 5.5.1 Bad sequence of commands (MAIL & RCPT required before DATA)"));
    }

    #[tokio::test]
    async fn null_reverse_path_accepted() {
        let output = transcript(
            test_server(),
            "MAIL FROM:<>\r\nRCPT TO:<r@d.e>\r\nQUIT\r\n",
        )
        .await;

        assert!(output.contains("250 2.1.0 Ok\r\n"));
        assert!(output.contains("250 2.1.5 Ok\r\n"));
    }

    #[tokio::test]
    async fn delivered_message_carries_received_header() {
        let (sender, mut inbox) = tokio::sync::mpsc::unbounded_channel();

        let server = test_server().with_handler(Arc::new(move |peer, from, to, data| {
            let _ = sender.send((peer, from, to, data));
        }));

        let output = transcript(
            server,
            "EHLO client.example.net\r\nMAIL FROM:<a@b.c>\r\nRCPT TO:<c@d.e>\r\nDATA\r\n\
             .Test message.\r\n..Line 2.\r\nLine 3.\r\n.\r\nQUIT\r\n",
        )
        .await;
        assert!(output.contains("250 2.0.0 Ok: queued\r\n"));

        let (peer, from, to, data) = inbox.recv().await.expect("handler invoked");
        assert_eq!(peer.port(), 2525);
        assert_eq!(from, "a@b.c");
        assert_eq!(to, vec!["c@d.e".to_string()]);

        let message = String::from_utf8(data).unwrap();
        let mut lines = message.split("\r\n");
        assert_eq!(
            lines.next(),
            Some("Received: from client.example.net (localhost [127.0.0.1])")
        );
        assert_eq!(lines.next(), Some("        by mail.example.com (smtpd) with SMTP"));
        assert!(lines.next().is_some_and(|line| line.starts_with("        for <c@d.e>; ")));

        // Leading periods are unstuffed and the terminator line is excluded
        assert!(message.ends_with("Test message.\r\n.Line 2.\r\nLine 3.\r\n"));
    }

    #[tokio::test]
    async fn oversized_message_rejected() {
        let output = transcript(
            test_server().with_max_size(10),
            "MAIL FROM:<a@b.c>\r\nRCPT TO:<c@d.e>\r\nDATA\r\nfar too long for the limit\r\n",
        )
        .await;

        assert!(output.contains(
            "552 5.3.4 Requested mail action aborted: exceeded storage allocation (10)\r\n"
        ));
        assert!(!output.contains("Ok: queued"));
    }

    #[tokio::test]
    async fn declared_size_checked_against_limit() {
        let output = transcript(
            test_server().with_max_size(1000),
            "MAIL FROM:<a@b.c> SIZE=1001\r\nMAIL FROM:<a@b.c> SIZE=1000\r\nQUIT\r\n",
        )
        .await;

        assert!(output.contains(
            "552 5.3.4 Requested mail action aborted: exceeded storage allocation (1000)\r\n"
        ));
        assert!(output.contains("250 2.1.0 Ok\r\n"));
    }
}
