use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::debug;
#[cfg(feature = "native-tls")]
use native_tls::TlsConnector;
#[cfg(all(feature = "rustls-tls", not(feature = "native-tls")))]
use rustls_connector::RustlsConnector;

use crate::account::{Account, ConnectionMode};
use crate::conn::Connection;
use crate::{Client, Error, Result};

/// A convenience builder for [`Client`] structs over various encrypted transports.
///
/// Creating a [`Client`] over implicit TLS is straightforward:
/// ```no_run
/// # use imap_harvest::ClientBuilder;
/// # fn main() -> Result<(), imap_harvest::Error> {
/// let client = ClientBuilder::new("imap.example.com", 993).connect()?;
/// # Ok(())
/// # }
/// ```
///
/// To use `STARTTLS`, pick the mode before connecting:
/// ```no_run
/// # use imap_harvest::{ClientBuilder, ConnectionMode};
/// # fn main() -> Result<(), imap_harvest::Error> {
/// let client = ClientBuilder::new("imap.example.com", 143)
///     .mode(ConnectionMode::StartTls)
///     .connect()?;
/// # Ok(())
/// # }
/// ```
///
/// With `native-tls` enabled (the default) TLS goes through the platform library; with only
/// `rustls-tls` enabled it goes through `rustls` with the native certificate store.
pub struct ClientBuilder<D>
where
    D: AsRef<str>,
{
    domain: D,
    port: u16,
    mode: ConnectionMode,
    timeout: Option<Duration>,
    skip_tls_verify: bool,
    debug: bool,
}

impl<D> ClientBuilder<D>
where
    D: AsRef<str>,
{
    /// Make a new `ClientBuilder` using the given domain and port.
    pub fn new(domain: D, port: u16) -> Self {
        ClientBuilder {
            domain,
            port,
            mode: ConnectionMode::Ssl,
            timeout: None,
            skip_tls_verify: false,
            debug: false,
        }
    }

    /// Sets the connection mode.
    pub fn mode(&mut self, mode: ConnectionMode) -> &mut Self {
        self.mode = mode;
        self
    }

    /// Limit connecting, and every later read and write, to `timeout`.
    pub fn timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = Some(timeout);
        self
    }

    /// Mirror the protocol conversation to stderr.
    pub fn debug(&mut self, debug: bool) -> &mut Self {
        self.debug = debug;
        self
    }

    /// Controls the use of certificate validation.
    ///
    /// Defaults to `false`. Only honoured by the `native-tls` backend.
    ///
    /// # Warning
    ///
    /// You should only use this as a last resort as it allows another server to impersonate the
    /// server you think you're talking to, which would include being able to receive your
    /// credentials.
    pub fn danger_skip_tls_verify(&mut self, skip_tls_verify: bool) -> &mut Self {
        self.skip_tls_verify = skip_tls_verify;
        self
    }

    /// Make a [`Client`] using the configuration.
    ///
    /// In `STARTTLS` mode the greeting is read and `STARTTLS` issued over the plain socket before
    /// the TLS handshake; the returned client then starts afresh on the encrypted stream.
    pub fn connect(&mut self) -> Result<Client<Connection>> {
        let domain = self.domain.as_ref();
        let tcp = self.connect_tcp()?;
        debug!("connected to {}:{} in {:?} mode", domain, self.port, self.mode);

        let mut client = match self.mode {
            ConnectionMode::Plain => Client::new(Box::new(tcp) as Connection),
            ConnectionMode::Ssl => Client::new(self.handshake(domain, tcp)?),
            ConnectionMode::StartTls => {
                let mut client = Client::new(tcp);
                client.debug = self.debug;
                client.read_greeting()?;
                client.starttls()?;
                let tcp = client.into_inner()?;
                let mut client = Client::new(self.handshake(domain, tcp)?);
                // servers send no second greeting after the handshake
                client.skip_greeting();
                client
            }
        };
        client.debug = self.debug;
        Ok(client)
    }

    fn connect_tcp(&self) -> Result<TcpStream> {
        let domain = self.domain.as_ref();
        let fail = |source| Error::Connect {
            host: domain.to_string(),
            port: self.port,
            source,
        };

        let tcp = match self.timeout {
            None => TcpStream::connect((domain, self.port)).map_err(fail)?,
            Some(timeout) => {
                let mut last = None;
                let mut stream = None;
                for addr in (domain, self.port).to_socket_addrs().map_err(fail)? {
                    match TcpStream::connect_timeout(&addr, timeout) {
                        Ok(s) => {
                            stream = Some(s);
                            break;
                        }
                        Err(e) => last = Some(e),
                    }
                }
                match (stream, last) {
                    (Some(s), _) => s,
                    (None, Some(e)) => return Err(fail(e)),
                    (None, None) => {
                        return Err(fail(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "host name did not resolve to any address",
                        )))
                    }
                }
            }
        };
        tcp.set_read_timeout(self.timeout)?;
        tcp.set_write_timeout(self.timeout)?;
        Ok(tcp)
    }

    #[cfg(feature = "native-tls")]
    fn handshake(&self, domain: &str, tcp: TcpStream) -> Result<Connection> {
        let connector = TlsConnector::builder()
            .danger_accept_invalid_certs(self.skip_tls_verify)
            .danger_accept_invalid_hostnames(self.skip_tls_verify)
            .build()
            .map_err(|e| Error::Tls(e.to_string()))?;
        let tls = connector
            .connect(domain, tcp)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Box::new(tls))
    }

    #[cfg(all(feature = "rustls-tls", not(feature = "native-tls")))]
    fn handshake(&self, domain: &str, tcp: TcpStream) -> Result<Connection> {
        if self.skip_tls_verify {
            return Err(Error::Tls(
                "skipping certificate verification needs the native-tls backend".to_string(),
            ));
        }
        let connector =
            RustlsConnector::new_with_native_certs().map_err(|e| Error::Tls(e.to_string()))?;
        let tls = connector
            .connect(domain, tcp)
            .map_err(|e| Error::Tls(e.to_string()))?;
        Ok(Box::new(tls))
    }

    #[cfg(not(any(feature = "native-tls", feature = "rustls-tls")))]
    fn handshake(&self, _domain: &str, _tcp: TcpStream) -> Result<Connection> {
        Err(Error::Tls(
            "built without a TLS backend; only plain connections are available".to_string(),
        ))
    }
}

/// Opens unauthenticated clients for accounts. The orchestrator goes through this seam so the
/// transport can be replaced.
pub trait Connector {
    /// The stream clients are built on.
    type Stream: Read + Write;

    /// Connect to the account's server, securing the socket as the account's mode demands.
    fn connect(&self, account: &Account) -> Result<Client<Self::Stream>>;
}

/// The [`Connector`] for real servers.
#[derive(Clone, Debug, Default)]
pub struct TcpConnector {
    /// Mirror every conversation to stderr.
    pub debug: bool,
    /// See [`ClientBuilder::danger_skip_tls_verify`].
    pub danger_skip_tls_verify: bool,
}

impl Connector for TcpConnector {
    type Stream = Connection;

    fn connect(&self, account: &Account) -> Result<Client<Connection>> {
        ClientBuilder::new(account.host.as_str(), account.port)
            .mode(account.mode)
            .timeout(account.timeout)
            .debug(self.debug)
            .danger_skip_tls_verify(self.danger_skip_tls_verify)
            .connect()
    }
}
