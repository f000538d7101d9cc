//! Pluggable `AUTHENTICATE` mechanisms.

use hmac::{Hmac, Mac};
use md5::Md5;

/// This will allow plugable authentication mechanisms.
///
/// The client base64-decodes each server challenge before handing it to [`process`], and
/// base64-encodes whatever comes back.
///
/// [`process`]: Authenticator::process
pub trait Authenticator {
    /// The type of the response to the challenge. This will usually be a `Vec<u8>` or `String`.
    type Response: AsRef<[u8]>;

    /// Each base64-decoded server challenge is passed to `process`.
    /// The returned byte-string is base64-encoded and then sent back to the server.
    fn process(&self, challenge: &[u8]) -> Self::Response;
}

/// `CRAM-MD5` as described in [RFC 2195](https://tools.ietf.org/html/rfc2195).
///
/// The response is the user name, a space, and the lowercase hex HMAC-MD5 digest of the
/// challenge keyed with the password.
pub struct CramMd5<'a> {
    pub(crate) user: &'a str,
    pub(crate) password: &'a str,
}

impl<'a> CramMd5<'a> {
    /// Answer challenges for `user` authenticating with `password`.
    pub fn new(user: &'a str, password: &'a str) -> Self {
        CramMd5 { user, password }
    }
}

impl Authenticator for CramMd5<'_> {
    type Response = String;

    fn process(&self, challenge: &[u8]) -> String {
        // HMAC accepts keys of any length, so this cannot fail
        let mut mac = match Hmac::<Md5>::new_from_slice(self.password.as_bytes()) {
            Ok(mac) => mac,
            Err(_) => return String::new(),
        };
        mac.update(challenge);
        let digest = mac.finalize().into_bytes();
        let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
        format!("{} {}", self.user, hex)
    }
}

impl std::fmt::Debug for CramMd5<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CramMd5")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}
