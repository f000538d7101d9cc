//! A scripted in-memory IMAP server for end-to-end tests.
//!
//! It understands exactly the commands this crate sends, with just enough of `SEARCH` (`ALL`,
//! `SEEN`, `UNSEEN`, `FLAGGED`, `UNFLAGGED`) to drive the actions.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::io::{Read, Result as IoResult, Write};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::account::Account;
use crate::cancel::CancelToken;
use crate::client::Client;
use crate::client_builder::Connector;
use crate::error::Result;
use crate::types::Uid;

#[derive(Clone, Debug)]
pub struct Message {
    pub uid: Uid,
    pub flags: BTreeSet<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct Folder {
    pub messages: Vec<Message>,
    next_uid: Uid,
}

#[derive(Debug, Default)]
pub struct State {
    pub folders: BTreeMap<String, Folder>,
    /// Every command received, without tags.
    pub commands: Vec<String>,
    /// Folders in which another client sets `\Seen` right before our metadata fetches.
    pub meddle_in: HashSet<String>,
    /// Folders whose `SELECT` is refused.
    pub refuse_select: HashSet<String>,
    /// Whether `LIST` is refused.
    pub refuse_list: bool,
    /// Interrupted this many times when the first body fetch arrives.
    pub interrupt_on_body: Option<(CancelToken, usize)>,
}

impl State {
    pub fn add(&mut self, folder: &str, body: &str, flags: &[&str]) -> Uid {
        let f = self.folders.entry(folder.to_string()).or_default();
        f.next_uid += 1;
        let uid = f.next_uid;
        f.messages.push(Message {
            uid,
            flags: flags.iter().map(|s| s.to_string()).collect(),
            body: body.replace('\n', "\r\n").into_bytes(),
        });
        uid
    }

    pub fn count(&self, folder: &str, flag: &str, set: bool) -> usize {
        self.folders
            .get(folder)
            .map(|f| {
                f.messages
                    .iter()
                    .filter(|m| m.flags.contains(flag) == set)
                    .count()
            })
            .unwrap_or(0)
    }

    pub fn sent(&self, prefix: &str) -> Vec<&str> {
        self.commands
            .iter()
            .filter(|c| c.starts_with(prefix))
            .map(String::as_str)
            .collect()
    }
}

#[derive(Clone, Debug, Default)]
pub struct MockServer {
    state: Arc<Mutex<State>>,
}

impl MockServer {
    pub fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn connect(&self) -> MockConn {
        MockConn {
            state: self.state.clone(),
            input: Vec::new(),
            output: b"* OK mock ready\r\n".iter().copied().collect(),
            selected: None,
        }
    }
}

impl Connector for MockServer {
    type Stream = MockConn;

    fn connect(&self, _account: &Account) -> Result<Client<MockConn>> {
        Ok(Client::new(MockServer::connect(self)))
    }
}

#[derive(Debug)]
pub struct MockConn {
    state: Arc<Mutex<State>>,
    input: Vec<u8>,
    output: VecDeque<u8>,
    selected: Option<String>,
}

fn uid_set(set: &str) -> Vec<Uid> {
    let mut uids = Vec::new();
    for part in set.split(',') {
        match part.split_once(':') {
            Some((a, b)) => uids.extend(a.parse::<Uid>().unwrap()..=b.parse::<Uid>().unwrap()),
            None => uids.push(part.parse().unwrap()),
        }
    }
    uids
}

fn unquote(s: &str) -> String {
    s.trim_matches('"').replace("\\\"", "\"").replace("\\\\", "\\")
}

fn flags(flags: &BTreeSet<String>) -> String {
    flags.iter().cloned().collect::<Vec<_>>().join(" ")
}

impl MockConn {
    fn reply(&mut self, line: &str) {
        self.output.extend(line.as_bytes());
        self.output.extend(b"\r\n");
    }

    fn handle(&mut self, line: &str) {
        let (tag, command) = line.split_once(' ').unwrap();
        self.state.lock().unwrap().commands.push(command.to_string());
        let upper = command.to_ascii_uppercase();

        if upper == "CAPABILITY" {
            self.reply("* CAPABILITY IMAP4rev1 IDLE");
        } else if upper.starts_with("LOGIN ") || upper == "NOOP" {
        } else if upper.starts_with("LIST ") {
            if self.state.lock().unwrap().refuse_list {
                self.reply(&format!("{} NO listing not allowed", tag));
                return;
            }
            let names: Vec<String> = self.state.lock().unwrap().folders.keys().cloned().collect();
            for name in names {
                self.reply(&format!("* LIST (\\HasNoChildren) \"/\" \"{}\"", name));
            }
        } else if let Some(name) = command.strip_prefix("SELECT ") {
            let name = unquote(name);
            let exists = {
                let state = self.state.lock().unwrap();
                if state.refuse_select.contains(&name) {
                    None
                } else {
                    state.folders.get(&name).map(|f| f.messages.len())
                }
            };
            let exists = match exists {
                Some(n) => n,
                None => {
                    self.reply(&format!("{} NO no such folder", tag));
                    return;
                }
            };
            self.reply(&format!("* {} EXISTS", exists));
            self.reply("* FLAGS (\\Seen \\Flagged \\Deleted)");
            self.reply("* OK [UIDVALIDITY 7] ok");
            self.selected = Some(name);
            self.reply(&format!("{} OK [READ-WRITE] selected", tag));
            return;
        } else if let Some(criteria) = command.strip_prefix("UID SEARCH ") {
            let criteria = criteria.trim_matches(|c| c == '(' || c == ')').to_string();
            let uids = self.with_folder(|f| {
                f.messages
                    .iter()
                    .filter(|m| {
                        criteria.split(' ').all(|term| match term {
                            "SEEN" => m.flags.contains("\\Seen"),
                            "UNSEEN" => !m.flags.contains("\\Seen"),
                            "FLAGGED" => m.flags.contains("\\Flagged"),
                            "UNFLAGGED" => !m.flags.contains("\\Flagged"),
                            _ => true,
                        })
                    })
                    .map(|m| m.uid.to_string())
                    .collect::<Vec<_>>()
            });
            if uids.is_empty() {
                self.reply("* SEARCH");
            } else {
                self.reply(&format!("* SEARCH {}", uids.join(" ")));
            }
        } else if let Some(rest) = command.strip_prefix("UID FETCH ") {
            let (set, query) = rest.split_once(' ').unwrap();
            let wanted = uid_set(set);
            let meddle = {
                let state = self.state.lock().unwrap();
                self.selected
                    .as_ref()
                    .map_or(false, |f| state.meddle_in.contains(f))
            };
            let body = query.contains("BODY.PEEK[]");
            if body {
                let interrupt = self.state.lock().unwrap().interrupt_on_body.take();
                if let Some((token, times)) = interrupt {
                    for _ in 0..times {
                        token.interrupt();
                    }
                }
            }
            let lines = self.with_folder(|f| {
                let mut out = Vec::new();
                for (i, m) in f.messages.iter_mut().enumerate() {
                    if !wanted.contains(&m.uid) {
                        continue;
                    }
                    if body {
                        let mut line = format!("* {} FETCH (UID {} BODY[] {{{}}}\r\n", i + 1, m.uid, m.body.len())
                            .into_bytes();
                        line.extend(&m.body);
                        line.extend(b")");
                        out.push(line);
                    } else {
                        if meddle {
                            m.flags.insert("\\Seen".to_string());
                        }
                        out.push(
                            format!(
                                "* {} FETCH (UID {} RFC822.SIZE {} FLAGS ({}))",
                                i + 1,
                                m.uid,
                                m.body.len(),
                                flags(&m.flags)
                            )
                            .into_bytes(),
                        );
                    }
                }
                out
            });
            for line in lines {
                self.output.extend(line);
                self.output.extend(b"\r\n");
            }
        } else if let Some(rest) = command.strip_prefix("UID STORE ") {
            let (set, query) = rest.split_once(' ').unwrap();
            let wanted = uid_set(set);
            let flag = query[query.find('(').unwrap() + 1..query.len() - 1].to_string();
            if query.starts_with("+X-GM-LABELS") {
                let moved: Vec<Message> = self.with_folder(|f| {
                    let (moved, kept): (Vec<Message>, Vec<Message>) =
                        f.messages.drain(..).partition(|m| wanted.contains(&m.uid));
                    f.messages = kept;
                    moved
                });
                let mut state = self.state.lock().unwrap();
                for m in moved {
                    let body = String::from_utf8(m.body).unwrap().replace("\r\n", "\n");
                    let flags: Vec<&str> = m.flags.iter().map(String::as_str).collect();
                    state.add(crate::account::GMAIL_TRASH, &body, &flags);
                }
            } else {
                let add = query.starts_with('+');
                self.with_folder(|f| {
                    for m in f.messages.iter_mut().filter(|m| wanted.contains(&m.uid)) {
                        if add {
                            m.flags.insert(flag.clone());
                        } else {
                            m.flags.remove(&flag);
                        }
                    }
                });
            }
        } else if upper == "EXPUNGE" || upper == "CLOSE" {
            let gone = self.with_folder(|f| {
                let mut gone = Vec::new();
                let mut i = 0;
                while i < f.messages.len() {
                    if f.messages[i].flags.contains("\\Deleted") {
                        f.messages.remove(i);
                        gone.push(i + 1);
                    } else {
                        i += 1;
                    }
                }
                gone
            });
            if upper == "EXPUNGE" {
                for seq in gone {
                    self.reply(&format!("* {} EXPUNGE", seq));
                }
            } else {
                self.selected = None;
            }
        } else if upper == "LOGOUT" {
            self.reply("* BYE see you");
        } else {
            self.reply(&format!("{} BAD unknown command", tag));
            return;
        }
        self.reply(&format!("{} OK done", tag));
    }

    fn with_folder<R: Default>(&mut self, f: impl FnOnce(&mut Folder) -> R) -> R {
        let mut state = self.state.lock().unwrap();
        match self.selected.as_ref().and_then(|n| state.folders.get_mut(n)) {
            Some(folder) => f(folder),
            None => R::default(),
        }
    }
}

impl Read for MockConn {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let n = buf.len().min(self.output.len());
        for (i, b) in self.output.drain(..n).enumerate() {
            buf[i] = b;
        }
        Ok(n)
    }
}

impl Write for MockConn {
    fn write(&mut self, buf: &[u8]) -> IoResult<usize> {
        self.input.extend_from_slice(buf);
        while let Some(end) = self.input.windows(2).position(|w| w == b"\r\n") {
            let line: Vec<u8> = self.input.drain(..end + 2).collect();
            let line = String::from_utf8(line[..end].to_vec()).unwrap();
            self.handle(&line);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> IoResult<()> {
        Ok(())
    }
}
