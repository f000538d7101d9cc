use imap_proto::{self, AttributeValue, MailboxDatum, NameAttribute, Response, ResponseCode};
use lazy_static::lazy_static;
use log::debug;
use regex::Regex;

use super::error::{Error, ParseError, Result};
use super::types::*;

lazy_static! {
    static ref AUTH_RESP_REGEX: Regex = Regex::new("^\\+ ?(.*)\r\n").expect("static regex");
}

pub fn parse_authenticate_response(line: &str) -> Result<&str> {
    if let Some(cap) = AUTH_RESP_REGEX.captures_iter(line).next() {
        let data = cap.get(1).map(|x| x.as_str()).unwrap_or("");
        return Ok(data);
    }
    Err(Error::Parse(ParseError::Authentication(line.to_string())))
}

enum MapOrNot<'a, T> {
    Map(T),
    Not(Response<'a>),
}

fn parse_many<'a, T, F>(mut lines: &'a [u8], mut map: F) -> Result<Vec<T>>
where
    F: FnMut(Response<'a>) -> MapOrNot<'a, T>,
{
    let mut things = Vec::new();
    loop {
        if lines.is_empty() {
            break Ok(things);
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, resp)) => {
                lines = rest;

                match map(resp) {
                    MapOrNot::Map(t) => things.push(t),
                    MapOrNot::Not(resp) => {
                        if let Some(resp) = handle_unilateral(resp) {
                            break Err(unexpected(&resp));
                        }
                    }
                }
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

fn unexpected(resp: &Response<'_>) -> Error {
    Error::Parse(ParseError::Unexpected(format!("{:?}", resp)))
}

pub fn parse_names(lines: &[u8]) -> Result<Vec<Name>> {
    parse_many(lines, |resp| match resp {
        Response::MailboxData(MailboxDatum::List {
            name_attributes,
            delimiter,
            name,
        }) => MapOrNot::Map(Name {
            selectable: !name_attributes
                .iter()
                .any(|a| matches!(a, NameAttribute::NoSelect)),
            delimiter: delimiter.map(|d| d.into_owned()),
            name: name.into_owned(),
        }),
        resp => MapOrNot::Not(resp),
    })
}

pub fn parse_fetches(lines: &[u8]) -> Result<Vec<Fetch>> {
    parse_many(lines, |resp| match resp {
        Response::Fetch(num, attrs) => {
            let mut fetch = Fetch {
                message: num,
                uid: None,
                size: None,
                flags: None,
                body: None,
            };

            for attr in attrs {
                match attr {
                    AttributeValue::Flags(flags) => {
                        fetch.flags = Some(flags.into_iter().map(|f| Flag::from(&*f)).collect());
                    }
                    AttributeValue::Uid(uid) => fetch.uid = Some(uid),
                    AttributeValue::Rfc822Size(sz) => fetch.size = Some(sz),
                    AttributeValue::BodySection {
                        section: None,
                        data,
                        ..
                    }
                    | AttributeValue::Rfc822(data) => {
                        fetch.body = data.map(|d| d.into_owned());
                    }
                    _ => {}
                }
            }

            MapOrNot::Map(fetch)
        }
        resp => MapOrNot::Not(resp),
    })
}

pub fn parse_expunge(lines: &[u8]) -> Result<Vec<Seq>> {
    let mut lines = lines;
    let mut expunged = Vec::new();
    loop {
        if lines.is_empty() {
            break Ok(expunged);
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, Response::Expunge(n))) => {
                lines = rest;
                expunged.push(n);
            }
            Ok((rest, data)) => {
                lines = rest;
                if let Some(resp) = handle_unilateral(data) {
                    break Err(unexpected(&resp));
                }
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

pub fn parse_capabilities(lines: &[u8]) -> Result<Capabilities> {
    let mut lines = lines;
    let mut caps = Vec::new();
    loop {
        if lines.is_empty() {
            break Ok(caps.into_iter().collect());
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, Response::Capabilities(c))) => {
                lines = rest;
                caps.extend(c.into_iter().map(|cap| match cap {
                    imap_proto::Capability::Imap4rev1 => "IMAP4rev1".to_string(),
                    imap_proto::Capability::Auth(mech) => format!("AUTH={}", mech),
                    imap_proto::Capability::Atom(atom) => atom.into_owned(),
                }));
            }
            Ok((rest, Response::Data { .. })) => {
                // greetings and STARTTLS replies may carry [CAPABILITY ...] codes; we always ask
                lines = rest;
            }
            Ok((rest, data)) => {
                lines = rest;
                if let Some(resp) = handle_unilateral(data) {
                    break Err(unexpected(&resp));
                }
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

pub fn parse_noop(lines: &[u8]) -> Result<()> {
    let mut lines = lines;
    loop {
        if lines.is_empty() {
            break Ok(());
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, data)) => {
                lines = rest;
                if let Some(resp) = handle_unilateral(data) {
                    break Err(unexpected(&resp));
                }
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

pub fn parse_mailbox(mut lines: &[u8]) -> Result<Mailbox> {
    let mut mailbox = Mailbox::default();

    loop {
        if lines.is_empty() {
            break Ok(mailbox);
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, Response::Data { code, .. })) => {
                lines = rest;

                match code {
                    Some(ResponseCode::UidValidity(uid)) => {
                        mailbox.uid_validity = Some(uid);
                    }
                    Some(ResponseCode::UidNext(unext)) => {
                        mailbox.uid_next = Some(unext);
                    }
                    Some(ResponseCode::ReadOnly) => {
                        mailbox.read_only = true;
                    }
                    _ => {}
                }
            }
            Ok((rest, Response::MailboxData(m))) => {
                lines = rest;

                match m {
                    MailboxDatum::Exists(e) => {
                        mailbox.exists = e;
                    }
                    MailboxDatum::Recent(r) => {
                        mailbox.recent = r;
                    }
                    MailboxDatum::Flags(flags) => {
                        mailbox.flags.extend(flags.iter().map(|f| Flag::from(&**f)));
                    }
                    _ => {}
                }
            }
            Ok((rest, Response::Expunge(_))) => {
                lines = rest;
            }
            Ok((_, resp)) => {
                break Err(unexpected(&resp));
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

/// Collect the UIDs of one or more `* SEARCH` responses, ascending and without duplicates.
pub fn parse_ids(lines: &[u8]) -> Result<Vec<Uid>> {
    let mut lines = lines;
    let mut ids = Vec::new();
    loop {
        if lines.is_empty() {
            ids.sort_unstable();
            ids.dedup();
            break Ok(ids);
        }

        match imap_proto::parser::parse_response(lines) {
            Ok((rest, Response::MailboxData(MailboxDatum::Search(c)))) => {
                lines = rest;
                ids.extend(c);
            }
            Ok((rest, data)) => {
                lines = rest;
                if let Some(resp) = handle_unilateral(data) {
                    break Err(unexpected(&resp));
                }
            }
            _ => {
                break Err(Error::Parse(ParseError::Invalid(lines.to_vec())));
            }
        }
    }
}

// check if this is simply a unilateral server response
// (see Section 7 of RFC 3501):
fn handle_unilateral(res: Response<'_>) -> Option<Response<'_>> {
    match res {
        Response::MailboxData(MailboxDatum::Status { .. })
        | Response::MailboxData(MailboxDatum::Recent(_))
        | Response::MailboxData(MailboxDatum::Exists(_))
        | Response::MailboxData(MailboxDatum::Flags(_))
        | Response::Expunge(_)
        | Response::Data { .. } => {
            debug!("ignoring unilateral response: {:?}", res);
            None
        }
        res => Some(res),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_capability_test() {
        let expected_capabilities = vec!["IMAP4rev1", "STARTTLS", "AUTH=CRAM-MD5", "LOGINDISABLED"];
        let lines = b"* CAPABILITY IMAP4rev1 STARTTLS AUTH=CRAM-MD5 LOGINDISABLED\r\n";
        let capabilities = parse_capabilities(lines).unwrap();
        assert_eq!(capabilities.len(), 4);
        for e in expected_capabilities {
            assert!(capabilities.has_str(e));
        }
        assert!(capabilities.has_auth("CRAM-MD5"));
    }

    #[test]
    fn parse_capability_invalid_test() {
        let lines = b"* JUNK IMAP4rev1 STARTTLS AUTH=GSSAPI LOGINDISABLED\r\n";
        assert!(parse_capabilities(lines).is_err());
    }

    #[test]
    fn parse_authenticate_challenge() {
        assert_eq!(
            parse_authenticate_response("+ PDE4OTYuNjk3MTcwOTUyQHBvc3RvZmZpY2U+\r\n").unwrap(),
            "PDE4OTYuNjk3MTcwOTUyQHBvc3RvZmZpY2U+"
        );
        assert!(parse_authenticate_response("a1 NO nope\r\n").is_err());
    }

    #[test]
    fn parse_names_test() {
        let lines = b"\
            * LIST (\\HasNoChildren) \".\" \"INBOX\"\r\n\
            * LIST (\\Noselect \\HasChildren) \"/\" \"[Gmail]\"\r\n";
        let names = parse_names(lines).unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0].delimiter(), Some("."));
        assert_eq!(names[0].name(), "INBOX");
        assert!(names[0].selectable());
        assert_eq!(names[1].name(), "[Gmail]");
        assert!(!names[1].selectable());
    }

    #[test]
    fn parse_fetches_empty() {
        let fetches = parse_fetches(b"").unwrap();
        assert!(fetches.is_empty());
    }

    #[test]
    fn parse_fetches_test() {
        let lines = b"\
                    * 24 FETCH (FLAGS (\\Seen) UID 4827943 RFC822.SIZE 1024)\r\n\
                    * 25 FETCH (FLAGS ())\r\n";
        let fetches = parse_fetches(lines).unwrap();
        assert_eq!(fetches.len(), 2);
        assert_eq!(fetches[0].message, 24);
        assert_eq!(fetches[0].flags(), Some(&[Flag::Seen][..]));
        assert_eq!(fetches[0].uid, Some(4827943));
        assert_eq!(fetches[0].size, Some(1024));
        assert_eq!(fetches[0].body(), None);
        assert_eq!(fetches[1].message, 25);
        assert_eq!(fetches[1].has_flag(&Flag::Seen), Some(false));
        assert_eq!(fetches[1].uid, None);
    }

    #[test]
    fn parse_fetch_body() {
        let lines = b"* 2 FETCH (UID 7 BODY[] {5}\r\nhello)\r\n";
        let fetches = parse_fetches(lines).unwrap();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].uid, Some(7));
        assert_eq!(fetches[0].body(), Some(&b"hello"[..]));
    }

    #[test]
    fn parse_fetches_w_unilateral() {
        let lines = b"\
            * 37 FETCH (UID 74)\r\n\
            * 1 RECENT\r\n";
        let fetches = parse_fetches(lines).unwrap();
        assert_eq!(fetches.len(), 1);
        assert_eq!(fetches[0].message, 37);
        assert_eq!(fetches[0].uid, Some(74));
    }

    #[test]
    fn parse_mailbox_test() {
        let lines = b"\
            * FLAGS (\\Answered \\Flagged \\Deleted \\Seen \\Draft)\r\n\
            * 3 EXISTS\r\n\
            * 0 RECENT\r\n\
            * OK [UIDVALIDITY 1257842737] UIDs valid\r\n\
            * OK [UIDNEXT 4] Predicted next UID\r\n";
        let mailbox = parse_mailbox(lines).unwrap();
        assert_eq!(mailbox.exists, 3);
        assert_eq!(mailbox.uid_validity, Some(1257842737));
        assert_eq!(mailbox.uid_next, Some(4));
        assert_eq!(mailbox.flags.len(), 5);
        assert!(!mailbox.read_only);
    }

    #[test]
    fn parse_ids_w_unilateral() {
        let lines = b"\
            * SEARCH 4711 23 42\r\n\
            * 1 RECENT\r\n\
            * STATUS INBOX (MESSAGES 10 UIDNEXT 11 UIDVALIDITY 1408806928 UNSEEN 0)\r\n";
        let ids = parse_ids(lines).unwrap();
        assert_eq!(ids, vec![23, 42, 4711]);
    }

    #[test]
    fn parse_ids_empty() {
        assert_eq!(parse_ids(b"* SEARCH\r\n").unwrap(), Vec::<Uid>::new());
    }

    #[test]
    fn parse_expunge_test() {
        let lines = b"* 3 EXPUNGE\r\n* 3 EXPUNGE\r\n* 5 EXISTS\r\n";
        assert_eq!(parse_expunge(lines).unwrap(), vec![3, 3]);
    }
}
