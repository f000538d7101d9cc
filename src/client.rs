use std::io::{BufRead, Read, Write};
use std::ops::{Deref, DerefMut};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bufstream::BufStream;
use imap_proto::{Response, Status};
use log::{debug, log_enabled, trace, Level};

use super::account::Account;
use super::authenticator::{Authenticator, CramMd5};
use super::conflict::ConflictFlag;
use super::error::{Error, ParseError, Result, ValidateError};
use super::parse::{
    parse_authenticate_response, parse_capabilities, parse_expunge, parse_fetches, parse_ids,
    parse_mailbox, parse_names, parse_noop,
};
use super::types::*;

const TAG_PREFIX: &str = "a";
const INITIAL_TAG: u32 = 0;
const CR: u8 = 0x0d;
const LF: u8 = 0x0a;

/// Log target of the protocol conversation.
pub const WIRE_TARGET: &str = "imap_harvest::wire";

macro_rules! quote {
    ($x:expr) => {
        format!("\"{}\"", $x.replace(r"\", r"\\").replace("\"", "\\\""))
    };
}

pub(crate) fn validate_str(value: &str) -> Result<String> {
    let quoted = quote!(value);
    if quoted.contains('\n') {
        return Err(Error::Validate(ValidateError('\n')));
    }
    if quoted.contains('\r') {
        return Err(Error::Validate(ValidateError('\r')));
    }
    Ok(quoted)
}

/// The mechanism a session was authenticated with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthMethod {
    /// `AUTHENTICATE CRAM-MD5`
    CramMd5,
    /// `LOGIN`
    Login,
}

/// An authenticated IMAP session providing the usual IMAP commands. This type is what you get from
/// a successful [`Client::sign_in`].
///
/// Every command that addresses messages uses UIDs. The session also carries the [`ConflictFlag`]
/// of the account it is bound to; once another client has been seen changing messages under us,
/// destructive actions are refused in that folder for the rest of the session.
#[derive(Debug)]
pub struct Session<T: Read + Write> {
    conn: Wire<T>,
    conflict: ConflictFlag,
    capabilities: Capabilities,
    selected: Option<String>,
}

/// An (unauthenticated) handle to talk to an IMAP server. This is what you get when first
/// connecting. A succesfull call to [`Client::sign_in`] will return a [`Session`] instance that
/// provides the usual IMAP methods.
#[derive(Debug)]
pub struct Client<T: Read + Write> {
    conn: Wire<T>,
}

/// The shared command/response machinery of [`Client`] and [`Session`].
#[derive(Debug)]
pub struct Wire<T: Read + Write> {
    pub(crate) stream: BufStream<T>,
    tag: u32,

    /// Mirror the protocol conversation to stderr.
    pub debug: bool,
    command: String,
    greeting_read: bool,
}

// `Deref` instances are so we can make use of the same underlying primitives in Client and
// Session
impl<T: Read + Write> Deref for Client<T> {
    type Target = Wire<T>;

    fn deref(&self) -> &Wire<T> {
        &self.conn
    }
}

impl<T: Read + Write> DerefMut for Client<T> {
    fn deref_mut(&mut self) -> &mut Wire<T> {
        &mut self.conn
    }
}

impl<T: Read + Write> Deref for Session<T> {
    type Target = Wire<T>;

    fn deref(&self) -> &Wire<T> {
        &self.conn
    }
}

impl<T: Read + Write> DerefMut for Session<T> {
    fn deref_mut(&mut self) -> &mut Wire<T> {
        &mut self.conn
    }
}

impl<T: Read + Write> Client<T> {
    /// Creates a new client over the given stream.
    ///
    /// The server greeting has not been read yet; [`read_greeting`](Client::read_greeting) does
    /// that, and the command methods do it implicitly if it was skipped.
    pub fn new(stream: T) -> Client<T> {
        Client {
            conn: Wire {
                stream: BufStream::new(stream),
                tag: INITIAL_TAG,
                debug: false,
                command: String::new(),
                greeting_read: false,
            },
        }
    }

    /// Yield the underlying connection for this Client.
    ///
    /// This consumes `self` since the Client is not much use without
    /// an underlying transport.
    pub fn into_inner(self) -> Result<T> {
        let res = self.conn.stream.into_inner()?;
        Ok(res)
    }

    /// Read the server greeting. Fails if the server says `BYE` right away.
    pub fn read_greeting(&mut self) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        self.readline(&mut v)?;
        self.greeting_read = true;
        if v.starts_with(b"* OK") || v.starts_with(b"* PREAUTH") {
            Ok(v)
        } else {
            Err(Error::Parse(ParseError::Unexpected(
                String::from_utf8_lossy(&v).trim_end().to_string(),
            )))
        }
    }

    /// The server's capabilities before authentication.
    pub fn capabilities(&mut self) -> Result<Capabilities> {
        self.ensure_greeting()?;
        self.run_command_and_read_response("CAPABILITY")
            .and_then(|lines| parse_capabilities(&lines))
    }

    /// Ask the server to upgrade the connection to TLS. On success the stream must be wrapped
    /// in TLS before anything else is sent.
    pub fn starttls(&mut self) -> Result<()> {
        self.ensure_greeting()?;
        self.run_command_and_check_ok("STARTTLS")
    }

    /// Log in to the IMAP server with `LOGIN`.
    pub fn login(&mut self, username: &str, password: &str) -> Result<()> {
        self.ensure_greeting()?;
        let command = format!(
            "LOGIN {} {}",
            validate_str(username)?,
            validate_str(password)?
        );
        self.run_command_and_check_ok(&command)
    }

    /// Authenticate with the server using the given custom `authenticator` to handle the server's
    /// challenge.
    pub fn authenticate<A: Authenticator>(
        &mut self,
        auth_type: &str,
        authenticator: &A,
    ) -> Result<()> {
        self.ensure_greeting()?;
        self.run_command(&format!("AUTHENTICATE {}", auth_type))?;
        self.do_auth_handshake(authenticator)
    }

    /// This func does the handshake process once the authenticate command is made.
    fn do_auth_handshake<A: Authenticator>(&mut self, authenticator: &A) -> Result<()> {
        loop {
            let mut line = Vec::new();
            self.readline(&mut line)?;

            if line.starts_with(b"+") {
                let line_str = String::from_utf8(line.clone())
                    .map_err(|e| Error::Parse(ParseError::DataNotUtf8(line, e)))?;
                let data = parse_authenticate_response(&line_str)?;
                let challenge = BASE64.decode(data.trim()).map_err(|e| {
                    Error::Parse(ParseError::Authentication(format!(
                        "challenge is not base64: {}",
                        e
                    )))
                })?;
                let raw_response = authenticator.process(&challenge);
                let auth_response = BASE64.encode(raw_response);
                self.write_secret_line(auth_response.as_bytes())?;
            } else {
                return self.read_response_onto(&mut line).map(|_| ());
            }
        }
    }

    /// Check the server's capabilities, pick an authentication mechanism allowed by the account's
    /// policy, and authenticate.
    ///
    /// `AUTHENTICATE CRAM-MD5` is preferred whenever the server offers it. `LOGIN` is used only
    /// when the policy allows it, the server has not advertised `LOGINDISABLED`, and either the
    /// connection is encrypted or plain-text passwords are explicitly allowed.
    pub fn sign_in(mut self, account: &Account) -> Result<(Session<T>, AuthMethod)> {
        let capabilities = self.capabilities()?;
        if !capabilities.has_str("IMAP4rev1") {
            return Err(Error::Auth(format!(
                "{} does not speak IMAP4rev1",
                account.host
            )));
        }

        let password = account.password.expose();
        let method = if capabilities.has_auth("CRAM-MD5") {
            let authenticator = CramMd5::new(&account.user, password);
            self.authenticate("CRAM-MD5", &authenticator)
                .map_err(refused)?;
            AuthMethod::CramMd5
        } else if !account.auth.allow_login {
            return Err(Error::Auth(format!(
                "{} does not offer CRAM-MD5 and LOGIN is not allowed",
                account.host
            )));
        } else if capabilities.has_str("LOGINDISABLED") {
            return Err(Error::Auth(format!(
                "{} does not offer CRAM-MD5 and has LOGIN disabled",
                account.host
            )));
        } else if !account.mode.is_encrypted() && !account.auth.allow_plain {
            return Err(Error::Auth(format!(
                "refusing to send the password for {} over an unencrypted connection",
                account.label()
            )));
        } else {
            self.login(&account.user, password).map_err(refused)?;
            AuthMethod::Login
        };
        debug!("authenticated to {} with {:?}", account.label(), method);

        // capabilities may change after authentication
        let mut session = Session::new(self.conn);
        session.capabilities = session.capabilities()?;
        Ok((session, method))
    }

    pub(crate) fn skip_greeting(&mut self) {
        self.greeting_read = true;
    }

    fn ensure_greeting(&mut self) -> Result<()> {
        if !self.greeting_read {
            self.read_greeting()?;
        }
        Ok(())
    }
}

fn refused(err: Error) -> Error {
    match err {
        Error::No { information, .. } | Error::Bad { information, .. } => {
            Error::Auth(format!("authentication failed: {}", information))
        }
        err => err,
    }
}

impl<T: Read + Write> Session<T> {
    fn new(conn: Wire<T>) -> Self {
        Session {
            conn,
            conflict: ConflictFlag::default(),
            capabilities: Capabilities::default(),
            selected: None,
        }
    }

    /// A session over `stream` whose greeting and sign-in already happened.
    #[cfg(test)]
    pub(crate) fn over(stream: T) -> Self {
        let mut client = Client::new(stream);
        client.skip_greeting();
        Session::new(client.conn)
    }

    /// The capabilities the server announced after authentication.
    pub fn server_capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    /// Ask the server for its current capabilities.
    pub fn capabilities(&mut self) -> Result<Capabilities> {
        self.run_command_and_read_response("CAPABILITY")
            .and_then(|lines| parse_capabilities(&lines))
    }

    /// The conflict flag of this session.
    pub fn conflict(&self) -> &ConflictFlag {
        &self.conflict
    }

    /// Record that another client was seen changing messages in the selected folder.
    pub fn raise_conflict(&mut self, reason: impl Into<String>) {
        self.conflict.raise(self.selected.as_deref(), reason);
    }

    /// The folder currently selected, if any.
    pub fn selected(&self) -> Option<&str> {
        self.selected.as_deref()
    }

    /// `LIST reference pattern`. Names the server marks `\Noselect` are included but are not
    /// [`selectable`](Name::selectable).
    pub fn list(&mut self, reference: &str, pattern: &str) -> Result<Vec<Name>> {
        let command = format!("LIST {} {}", quote!(reference), validate_str(pattern)?);
        self.run_command_and_read_response(&command)
            .and_then(|lines| parse_names(&lines))
    }

    /// Selects a mailbox
    ///
    /// The `SELECT` command selects a mailbox so that messages in the mailbox can be accessed.
    /// Only one mailbox can be selected at a time in a connection; simultaneous access to multiple
    /// mailboxes requires multiple connections. The `SELECT` command automatically deselects any
    /// currently selected mailbox before attempting the new selection. Consequently, if a mailbox
    /// is selected and a `SELECT` command that fails is attempted, no mailbox is selected.
    pub fn select(&mut self, mailbox_name: &str) -> Result<Mailbox> {
        self.selected = None;
        let command = format!("SELECT {}", validate_str(mailbox_name)?);
        let mailbox = self
            .run_command_and_read_response(&command)
            .and_then(|lines| parse_mailbox(&lines))?;
        self.selected = Some(mailbox_name.to_string());
        Ok(mailbox)
    }

    /// `UID SEARCH criteria`; the matching UIDs in ascending order.
    pub fn uid_search(&mut self, query: &str) -> Result<Vec<Uid>> {
        self.run_command_and_read_response(&format!("UID SEARCH {}", query))
            .and_then(|lines| parse_ids(&lines))
    }

    /// `UID FETCH uid_set query`.
    pub fn uid_fetch(&mut self, uid_set: &str, query: &str) -> Result<Vec<Fetch>> {
        self.run_command_and_read_response(&format!("UID FETCH {} {}", uid_set, query))
            .and_then(|lines| parse_fetches(&lines))
    }

    /// `UID STORE uid_set query`, returning whatever `FETCH` responses the server volunteers.
    pub fn uid_store(&mut self, uid_set: &str, query: &str) -> Result<Vec<Fetch>> {
        self.run_command_and_read_response(&format!("UID STORE {} {}", uid_set, query))
            .and_then(|lines| parse_fetches(&lines))
    }

    /// Permanently remove all messages that have the `\Deleted` flag set from the currently
    /// selected mailbox. The message sequence number of each message that is removed is returned.
    pub fn expunge(&mut self) -> Result<Vec<Seq>> {
        self.run_command_and_read_response("EXPUNGE")
            .and_then(|lines| parse_expunge(&lines))
    }

    /// The `CLOSE` command permanently removes all messages that have the `\Deleted` flag set
    /// from the currently selected mailbox, and returns to the authenticated state from the
    /// selected state.
    pub fn close(&mut self) -> Result<()> {
        self.selected = None;
        self.run_command_and_check_ok("CLOSE")
    }

    /// `NOOP`, letting the server flush pending unilateral updates.
    pub fn noop(&mut self) -> Result<()> {
        self.run_command_and_read_response("NOOP")
            .and_then(|lines| parse_noop(&lines))
    }

    /// Logout informs the server that the client is done with the connection.
    pub fn logout(&mut self) -> Result<()> {
        self.run_command_and_check_ok("LOGOUT")
    }
}

impl<T: Read + Write> Wire<T> {
    /// Runs a command and checks if it returns OK.
    pub fn run_command_and_check_ok(&mut self, command: &str) -> Result<()> {
        self.run_command_and_read_response(command).map(|_| ())
    }

    /// Runs any command passed to it.
    pub fn run_command(&mut self, untagged_command: &str) -> Result<()> {
        self.command = command_name(untagged_command);
        let command = self.create_command(untagged_command);
        self.write_line(command.as_bytes())
    }

    /// Run a raw IMAP command and read back its response.
    ///
    /// Note that the server *is* allowed to unilaterally send things to the client for messages in
    /// a selected mailbox whose status has changed. The raw untagged lines are returned with the
    /// tagged completion line stripped.
    pub fn run_command_and_read_response(&mut self, untagged_command: &str) -> Result<Vec<u8>> {
        self.run_command(untagged_command)?;
        self.read_response()
    }

    pub(crate) fn read_response(&mut self) -> Result<Vec<u8>> {
        let mut v = Vec::new();
        self.read_response_onto(&mut v)?;
        Ok(v)
    }

    pub(crate) fn read_response_onto(&mut self, data: &mut Vec<u8>) -> Result<()> {
        let mut continue_from = None;
        let mut try_first = !data.is_empty();
        let match_tag = format!("{}{}", TAG_PREFIX, self.tag);
        loop {
            let line_start = if try_first {
                try_first = false;
                0
            } else {
                let start_new = data.len();
                self.readline(data)?;
                let line_start = continue_from.take().unwrap_or(start_new);

                // read literals in one go instead of re-parsing after every line of them
                if let Some(len) = literal_len(&data[start_new..]) {
                    self.read_literal(data, len)?;
                    continue_from = Some(line_start);
                    continue;
                }
                line_start
            };

            let break_with = {
                let line = &data[line_start..];

                match imap_proto::parser::parse_response(line) {
                    Ok((
                        _,
                        Response::Done {
                            tag,
                            status,
                            information,
                            ..
                        },
                    )) => {
                        if tag.0 != match_tag {
                            Some(Err(Error::Parse(ParseError::Unexpected(format!(
                                "tagged response {} while waiting for {}",
                                tag.0, match_tag
                            )))))
                        } else {
                            let information = information
                                .map(|s| s.to_string())
                                .unwrap_or_else(|| "no explanation given".to_string());
                            Some(match status {
                                Status::Ok => Ok(()),
                                Status::Bad => Err(Error::Bad {
                                    command: self.command.clone(),
                                    information,
                                }),
                                Status::No => Err(Error::No {
                                    command: self.command.clone(),
                                    information,
                                }),
                                _ => Err(Error::Parse(ParseError::Invalid(line.to_vec()))),
                            })
                        }
                    }
                    Ok(..) => None,
                    Err(nom::Err::Incomplete(..)) => {
                        continue_from = Some(line_start);
                        None
                    }
                    Err(_) => Some(Err(Error::Parse(ParseError::Invalid(line.to_vec())))),
                }
            };

            match break_with {
                Some(Ok(_)) => {
                    data.truncate(line_start);
                    break Ok(());
                }
                Some(Err(e)) => break Err(e),
                None => {}
            }
        }
    }

    pub(crate) fn readline(&mut self, into: &mut Vec<u8>) -> Result<usize> {
        let read = self.stream.read_until(LF, into)?;
        if read == 0 {
            return Err(Error::ConnectionLost);
        }

        if self.wire_logged() {
            let len = into.len();
            let line = &into[(len - read)..len];
            let line = line.strip_suffix(b"\r\n").unwrap_or(line);
            self.log_wire("S", &String::from_utf8_lossy(line));
        }

        Ok(read)
    }

    fn read_literal(&mut self, into: &mut Vec<u8>, len: usize) -> Result<()> {
        let start = into.len();
        into.resize(start + len, 0);
        if let Err(e) = self.stream.read_exact(&mut into[start..]) {
            into.truncate(start);
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => Error::ConnectionLost,
                _ => e.into(),
            });
        }
        self.log_wire("S", &format!("<{} bytes of literal data>", len));
        Ok(())
    }

    fn create_command(&mut self, command: &str) -> String {
        self.tag += 1;
        format!("{}{} {}", TAG_PREFIX, self.tag, command)
    }

    pub(crate) fn write_line(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        self.stream.write_all(&[CR, LF])?;
        self.stream.flush()?;
        if self.wire_logged() {
            let line = String::from_utf8_lossy(buf);
            self.log_wire("C", &redact(&line));
        }
        Ok(())
    }

    fn write_secret_line(&mut self, buf: &[u8]) -> Result<()> {
        self.stream.write_all(buf)?;
        self.stream.write_all(&[CR, LF])?;
        self.stream.flush()?;
        self.log_wire("C", "<redacted>");
        Ok(())
    }

    fn wire_logged(&self) -> bool {
        self.debug || log_enabled!(target: WIRE_TARGET, Level::Trace)
    }

    fn log_wire(&self, side: &str, line: &str) {
        trace!(target: WIRE_TARGET, "{}: {}", side, line);
        if self.debug {
            eprintln!("{}: {}", side, line);
        }
    }
}

/// The verb of a command, for error messages: `FETCH` or `UID FETCH`.
fn command_name(command: &str) -> String {
    let mut words = command.split_whitespace();
    match words.next() {
        Some(uid) if uid.eq_ignore_ascii_case("UID") => match words.next() {
            Some(verb) => format!("UID {}", verb.to_ascii_uppercase()),
            None => "UID".to_string(),
        },
        Some(verb) => verb.to_ascii_uppercase(),
        None => String::new(),
    }
}

/// Hide the arguments of `LOGIN` lines.
fn redact(line: &str) -> std::borrow::Cow<'_, str> {
    let mut words = line.splitn(3, ' ');
    if let (Some(tag), Some(verb)) = (words.next(), words.next()) {
        if verb.eq_ignore_ascii_case("LOGIN") {
            return format!("{} {} <redacted>", tag, verb).into();
        }
    }
    line.into()
}

/// The length of the literal announced at the end of a line, as in `* 1 FETCH (BODY[] {42}\r\n`.
fn literal_len(line: &[u8]) -> Option<usize> {
    let line = line.strip_suffix(b"\r\n").or_else(|| line.strip_suffix(b"\n"))?;
    let line = line.strip_suffix(b"}")?;
    let open = line.iter().rposition(|&b| b == b'{')?;
    let digits = &line[open + 1..];
    if digits.is_empty() || !digits.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(digits).ok()?.parse().ok()
}
