// https://www.rfc-editor.org/rfc/rfc3501 - IMAP4rev1
// https://www.rfc-editor.org/rfc/rfc2342 - [...] NAMESPACE extension
// https://www.rfc-editor.org/rfc/rfc4315 - [...] UIDPLUS extension
// https://www.rfc-editor.org/rfc/rfc7888 - [...] LITERAL+ / LITERAL-

use crate::driver::{
  Caps, CloseResult, Driver, DriverError, ExpungeMode, FailState, Flags, ListMode, LoadResult,
  Message, MsgData, MsgStatus, OpenOptions, StoreConf, Tuid,
};
use anyhow::Context as _;
use base64::Engine as _;
use std::{mem, path, process, str, time};
use zeroize::Zeroize as _;

pub mod msgs;
pub mod parser;
pub mod stream;
pub mod utf7;

use msgs::ImapMessages;
use parser::{Cond, FetchAtt, RespCode, Untagged};
use stream::{Stream, Wire};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TlsMode {
  Off,
  StartTls,
  Implicit,
}

#[derive(Clone, Debug)]
pub struct ImapConf {
  pub store: StoreConf,
  pub host: String,
  pub port: u16,
  pub tls: TlsMode,
  pub tunnel: Option<String>,
  pub user: String,
  pub password: Option<String>,
  pub password_command: Option<Vec<String>>,
  pub timeout: Option<time::Duration>,
  pub use_namespace: bool,
  pub path: Option<String>,
  pub path_delimiter: Option<char>,
}

pub fn plain(user: &str, password: &str) -> String {
  let engine = base64::engine::GeneralPurpose::new(
    &base64::alphabet::STANDARD,
    base64::engine::general_purpose::PAD,
  );
  // https://www.rfc-editor.org/rfc/rfc2595#section-6
  // Non-US-ASCII characters are permitted as long as they are represented in UTF-8.
  engine.encode(format!("\0{user}\0{password}"))
}

fn password_from_command(command_line: &[String]) -> anyhow::Result<String> {
  let mut program = process::Command::new(&command_line[0]);
  let command = program.args(&command_line[1..]);
  log::info!("getting password from {command:?}");
  let output = command.output()?;
  let mut stdout = output.stdout;
  anyhow::ensure!(output.status.success(), "couldn't get password: {command:?} failed");
  let password = str::from_utf8(
    stdout
      .split(|byte| *byte == b'\n')
      .next()
      .with_context(|| format!("{command:?} didn't output anything"))?,
  )
  .with_context(|| format!("{command:?} didn't output UTF-8"))?
  .to_string();
  stdout.zeroize();
  Ok(password)
}

// Owned mirrors of the parser's response types, so buffer borrows never
// outlive a single dispatch step.

#[derive(Debug, PartialEq)]
enum DoneCond {
  Ok,
  No,
  Bad,
}

#[derive(Debug, PartialEq)]
enum Code {
  None,
  TryCreate,
  ReadOnly,
  AppendUid(u32, u32),
  Other,
}

#[derive(Debug)]
struct Done {
  cond: DoneCond,
  code: Code,
  text: String,
}

#[derive(Debug, Default)]
struct FetchInfo {
  seq: u32,
  uid: Option<u32>,
  flags: Option<(Flags, bool)>,
  size: Option<u32>,
  date: Option<Vec<u8>>,
  body: Option<Vec<u8>>,
  header: Option<Vec<u8>>,
}

#[derive(Debug)]
enum Resp {
  Caps(Vec<String>),
  List { noselect: bool, delimiter: Option<u8>, inbox: bool, name: Vec<u8> },
  Flags,
  Namespace(Option<(String, Option<char>)>),
  Exists(u32),
  Recent(u32),
  ExpungeSeq(u32),
  Fetch(FetchInfo),
  CondInfo { cond: Cond, info: CondExtra, text: String },
}

#[derive(Debug)]
enum CondExtra {
  None,
  Caps(Vec<String>),
  UidValidity(u32),
  UidNext(u32),
  PermanentFlags { flags: Flags, wildcard: bool },
  Alert,
}

enum Piece<'a> {
  Text(&'a [u8]),
  /// Sent as an IMAP literal.
  Literal(&'a [u8]),
  /// Like Text, but never logged.
  Secret(&'a [u8]),
}

fn flag_from_atom(atom: &[u8]) -> Option<Flags> {
  // The order follows the alphabetical maildir flag sort.
  match atom {
    b"\\Draft" => Some(Flags::DRAFT),
    b"\\Flagged" => Some(Flags::FLAGGED),
    b"$Forwarded" | b"Passed" => Some(Flags::FORWARDED),
    b"\\Answered" => Some(Flags::ANSWERED),
    b"\\Seen" => Some(Flags::SEEN),
    b"\\Deleted" => Some(Flags::DELETED),
    _ => None,
  }
}

fn flags_to_atoms(flags: Flags) -> String {
  let mut atoms = Vec::new();
  if flags.contains(Flags::DRAFT) {
    atoms.push("\\Draft");
  }
  if flags.contains(Flags::FLAGGED) {
    atoms.push("\\Flagged");
  }
  if flags.contains(Flags::FORWARDED) {
    atoms.push("$Forwarded");
  }
  if flags.contains(Flags::ANSWERED) {
    atoms.push("\\Answered");
  }
  if flags.contains(Flags::SEEN) {
    atoms.push("\\Seen");
  }
  if flags.contains(Flags::DELETED) {
    atoms.push("\\Deleted");
  }
  atoms.join(" ")
}

/// Extracts a header's unfolded value from a header blob.
fn header_value(blob: &[u8], name: &str) -> Option<Vec<u8>> {
  let mut value: Option<Vec<u8>> = None;
  for line in blob.split(|&byte| byte == b'\n') {
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    if let Some(ref mut value) = value {
      // https://www.rfc-editor.org/rfc/rfc5322#section-2.2.3 - folding
      if line.starts_with(b" ") || line.starts_with(b"\t") {
        value.push(b' ');
        value.extend_from_slice(line.trim_ascii());
        continue;
      }
      break;
    }
    if line.len() > name.len()
      && line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
      && line[name.len()] == b':'
    {
      value = Some(line[name.len() + 1..].trim_ascii().to_vec());
    }
  }
  value
}

// https://www.rfc-editor.org/rfc/rfc3501#section-9
// date-time = DQUOTE date-day-fixed "-" date-month "-" date-year SP time SP zone DQUOTE
const INTERNAL_DATE_FORMAT: &str = "%d-%b-%Y %H:%M:%S %z";

fn format_internal_date(date: time::SystemTime) -> String {
  chrono::DateTime::<chrono::Utc>::from(date)
    .format(INTERNAL_DATE_FORMAT)
    .to_string()
}

fn parse_internal_date(text: &[u8]) -> Option<time::SystemTime> {
  // "17-Jul-1996 02:44:25 -0700"; the day may be space-padded.
  let text = str::from_utf8(text).ok()?;
  let parsed = chrono::DateTime::parse_from_str(text.trim_start(), INTERNAL_DATE_FORMAT).ok()?;
  Some(parsed.into())
}

#[derive(Debug, Default)]
struct OpenState {
  uidvalidity: u32,
  uidnext: u32,
  exists: u32,
  recent: u32,
  perm_flags: Flags,
  all_keywords: bool,
}

pub struct ImapStore {
  conf: ImapConf,
  label: String,
  stream: Option<Stream>,
  caps: Vec<String>,
  broken: bool,
  fail: FailState,
  tag: u32,

  ns_prefix: String,
  ns_delim: Option<char>,
  delimiter: Option<char>,

  encoded_selected: Option<Vec<u8>>,
  open: Option<OpenState>,
  msgs: ImapMessages,
  expunged: Vec<u32>,
  listing: Vec<String>,
  deferred: Vec<(u32, Flags, Flags)>,
  want_body_uid: Option<u32>,
  fetched: Option<FetchInfo>,
  trash_known: bool,
  load_opts: OpenOptions,
}

impl ImapStore {
  pub fn new(conf: ImapConf, label: &str) -> Self {
    Self {
      conf,
      label: label.to_string(),
      stream: None,
      caps: Vec::new(),
      broken: false,
      fail: FailState::Temp,
      tag: 0,
      ns_prefix: String::new(),
      ns_delim: None,
      delimiter: None,
      encoded_selected: None,
      open: None,
      msgs: ImapMessages::default(),
      expunged: Vec::new(),
      listing: Vec::new(),
      deferred: Vec::new(),
      want_body_uid: None,
      fetched: None,
      trash_known: false,
      load_opts: OpenOptions::NONE,
    }
  }

  fn has_cap(&self, cap: &str) -> bool {
    self.caps.iter().any(|c| c == cap)
  }

  fn stream_mut(&mut self) -> anyhow::Result<&mut Stream> {
    self.stream.as_mut().context("store is not connected")
  }

  fn store_err(&mut self, error: anyhow::Error) -> DriverError {
    self.broken = true;
    if self.fail == FailState::Temp {
      self.fail = FailState::Wait;
    }
    DriverError::store(error)
  }

  fn effective_delim(&self) -> char {
    self.conf.path_delimiter.or(self.ns_delim).or(self.delimiter).unwrap_or('/')
  }

  /// Maps a canonical ('/'-delimited, UTF-8) name onto the wire form.
  fn encode_box_name(&self, name: &str) -> anyhow::Result<Vec<u8>> {
    if name.eq_ignore_ascii_case("INBOX") {
      // INBOX bypasses the namespace prefix, whatever its case. A non-INBOX
      // mailbox that would canonicalize to it is ambiguous.
      anyhow::ensure!(name == "INBOX", "mailbox {name} is ambiguous with INBOX");
      return Ok(b"INBOX".to_vec());
    }
    let delim = self.effective_delim();
    let mut full = self.prefix().to_string();
    full += name;
    if delim != '/' {
      anyhow::ensure!(
        !name.contains(delim),
        "canonical mailbox name {name:?} contains flattened hierarchy delimiter"
      );
      full = full.replace('/', &delim.to_string());
    }
    Ok(utf7::utf8_to_utf7(&full).into_bytes())
  }

  fn prefix(&self) -> &str {
    match &self.conf.path {
      Some(path) => path,
      None => &self.ns_prefix,
    }
  }

  fn next_tag(&mut self) -> String {
    self.tag += 1;
    format!("t{}", self.tag)
  }

  /// Waits for the next response and returns its leading token: b"*", b"+",
  /// or a command tag.
  fn read_start(&mut self) -> anyhow::Result<Vec<u8>> {
    self.stream_mut()?.ensure_response()?;
    let stream = self.stream.as_ref().unwrap();
    match stream.parse(parser::response::start)? {
      Some(start) => Ok(start.to_vec()),
      None => {
        // A bare "+\r\n" continuation carries no text.
        stream.expect(parser::response::bare_continuation)?;
        Ok(b"+".to_vec())
      }
    }
  }

  /// Issues one command and runs the response loop until its tagged result.
  /// Untagged responses update the store state on the way.
  fn exec(&mut self, pieces: &[Piece]) -> anyhow::Result<Done> {
    let tag = self.next_tag();
    let literal_plus = self.has_cap("LITERAL+");
    let literal_minus = self.has_cap("LITERAL-");

    // Chunks after the first are held back until the server sends a
    // continuation request for the preceding literal announcement.
    let mut chunks: Vec<Vec<u8>> = Vec::new();
    let mut current = tag.clone().into_bytes();
    current.push(b' ');
    let mut loggable = tag.clone();
    loggable.push(' ');
    for piece in pieces {
      match piece {
        Piece::Text(text) => {
          current.extend_from_slice(text);
          loggable += &String::from_utf8_lossy(text);
        }
        Piece::Secret(text) => {
          current.extend_from_slice(text);
          loggable += "<secret>";
        }
        Piece::Literal(data) => {
          loggable += &format!("{{{}}}", data.len());
          // https://www.rfc-editor.org/rfc/rfc7888
          if literal_plus || (literal_minus && data.len() <= 4096) {
            current.extend(format!("{{{}+}}\r\n", data.len()).into_bytes());
            current.extend_from_slice(data);
          } else {
            current.extend(format!("{{{}}}\r\n", data.len()).into_bytes());
            chunks.push(mem::take(&mut current));
            current.extend_from_slice(data);
          }
        }
      }
    }
    current.extend_from_slice(b"\r\n");
    chunks.push(current);

    log::debug!("{} > {}", self.label, loggable);
    let mut chunks = chunks.into_iter();
    let first = chunks.next().unwrap();
    self.stream_mut()?.input(&[&first], 0)?;
    for chunk in chunks {
      // Await the continuation request; the server may interject untagged
      // responses, or refuse the command outright.
      loop {
        match self.read_start()?.as_slice() {
          b"*" => self.handle_untagged()?,
          b"+" => {
            self.stream.as_ref().unwrap().expect(parser::response::skip)?;
            break;
          }
          got if got == tag.as_bytes() => return self.finish_tagged(),
          got => anyhow::bail!("unexpected tag {:?}", String::from_utf8_lossy(got)),
        }
      }
      self.stream_mut()?.input(&[&chunk], 0)?;
    }

    loop {
      match self.read_start()?.as_slice() {
        b"*" => self.handle_untagged()?,
        b"+" => {
          self.stream.as_ref().unwrap().expect(parser::response::skip)?;
          anyhow::bail!("unexpected continuation request");
        }
        got if got == tag.as_bytes() => return self.finish_tagged(),
        got => anyhow::bail!("unexpected tag {:?}", String::from_utf8_lossy(got)),
      }
    }
  }

  fn finish_tagged(&mut self) -> anyhow::Result<Done> {
    let state = self.stream.as_ref().unwrap().expect(parser::response::tagged_result)?;
    let cond = match state.cond {
      Cond::Ok => DoneCond::Ok,
      Cond::No => DoneCond::No,
      Cond::Bad => DoneCond::Bad,
      other => anyhow::bail!("unexpected tagged {other:?}"),
    };
    let code = match state.code {
      Some(RespCode::TryCreate) => Code::TryCreate,
      Some(RespCode::ReadOnly) => Code::ReadOnly,
      Some(RespCode::AppendUid(validity, uid)) => Code::AppendUid(validity, uid),
      Some(RespCode::Capability(caps)) => {
        let caps = caps.iter().map(|c| String::from_utf8_lossy(c).into_owned()).collect();
        let done = Done {
          cond,
          code: Code::Other,
          text: String::from_utf8_lossy(state.text).into_owned(),
        };
        self.caps = caps;
        return Ok(done);
      }
      Some(_) => Code::Other,
      None => Code::None,
    };
    Ok(Done { cond, code, text: String::from_utf8_lossy(state.text).into_owned() })
  }

  fn handle_untagged(&mut self) -> anyhow::Result<()> {
    let resp = {
      let stream = self.stream.as_ref().unwrap();
      match stream.parse(parser::response::untagged)? {
        Some(untagged) => Some(Self::to_owned_resp(untagged)),
        None => None,
      }
    };
    match resp {
      Some(resp) => self.apply(resp),
      None => {
        self.stream.as_ref().unwrap().expect(parser::response::skip)?;
        Ok(())
      }
    }
  }

  fn to_owned_resp(untagged: Untagged<'_>) -> Resp {
    match untagged {
      Untagged::Capability(caps) => {
        Resp::Caps(caps.iter().map(|c| String::from_utf8_lossy(c).into_owned()).collect())
      }
      Untagged::List { flags, delimiter, mailbox } => Resp::List {
        noselect: flags.contains(&&b"\\Noselect"[..]),
        delimiter,
        inbox: matches!(mailbox, parser::Mailbox::Inbox),
        name: match mailbox {
          parser::Mailbox::Inbox => b"INBOX".to_vec(),
          parser::Mailbox::Other(name) => name.into_owned(),
        },
      },
      Untagged::Flags(_) => Resp::Flags,
      Untagged::Namespace(ns) => Resp::Namespace(ns.map(|(prefix, delim)| {
        (String::from_utf8_lossy(&prefix).into_owned(), delim.map(|d| d as char))
      })),
      Untagged::Exists(n) => Resp::Exists(n),
      Untagged::Recent(n) => Resp::Recent(n),
      Untagged::ExpungeSeq(n) => Resp::ExpungeSeq(n),
      Untagged::Fetch(seq, atts) => {
        let mut info = FetchInfo { seq, ..FetchInfo::default() };
        for att in atts {
          match att {
            FetchAtt::Uid(uid) => info.uid = Some(uid),
            FetchAtt::Flags(atoms) => {
              let mut flags = Flags::NONE;
              let mut recent = false;
              for atom in atoms {
                if atom == b"\\Recent" {
                  recent = true;
                } else if let Some(flag) = flag_from_atom(atom) {
                  flags |= flag;
                }
              }
              info.flags = Some((flags, recent));
            }
            FetchAtt::InternalDate(date) => info.date = Some(date),
            FetchAtt::Rfc822Size(size) => info.size = Some(size),
            FetchAtt::Body(body) => info.body = Some(body.map(|b| b.into_owned()).unwrap_or_default()),
            FetchAtt::Header(header) => {
              info.header = Some(header.map(|h| h.into_owned()).unwrap_or_default())
            }
          }
        }
        Resp::Fetch(info)
      }
      Untagged::Cond(state) => {
        let info = match state.code {
          Some(RespCode::Capability(caps)) => {
            CondExtra::Caps(caps.iter().map(|c| String::from_utf8_lossy(c).into_owned()).collect())
          }
          Some(RespCode::UidValidity(v)) => CondExtra::UidValidity(v),
          Some(RespCode::UidNext(n)) => CondExtra::UidNext(n),
          Some(RespCode::PermanentFlags(atoms)) => {
            let mut flags = Flags::NONE;
            let mut wildcard = false;
            for atom in &atoms {
              if *atom == b"\\*" {
                wildcard = true;
              } else if let Some(flag) = flag_from_atom(atom) {
                flags |= flag;
              }
            }
            CondExtra::PermanentFlags { flags, wildcard }
          }
          Some(RespCode::Alert) => CondExtra::Alert,
          _ => CondExtra::None,
        };
        Resp::CondInfo {
          cond: state.cond,
          info,
          text: String::from_utf8_lossy(state.text).into_owned(),
        }
      }
    }
  }

  fn apply(&mut self, resp: Resp) -> anyhow::Result<()> {
    match resp {
      Resp::Caps(caps) => self.caps = caps,
      Resp::List { noselect, delimiter, inbox, name } => {
        if self.delimiter.is_none() {
          self.delimiter = delimiter.map(|d| d as char);
        }
        if noselect {
          return Ok(());
        }
        let name = if inbox {
          "INBOX".to_string()
        } else {
          let decoded = utf7::utf7_to_utf8(&name)
            .with_context(|| format!("mailbox {name:?} isn't proper modified UTF-7"))?;
          let prefix = self.prefix().to_string();
          let delim = self.effective_delim();
          let stripped = match decoded.strip_prefix(&prefix) {
            Some(stripped) if !prefix.is_empty() => stripped.to_string(),
            _ if prefix.is_empty() => decoded,
            _ => return Ok(()), // Outside our namespace.
          };
          if delim != '/' {
            if stripped.contains('/') {
              log::warn!("skipping mailbox {stripped:?}: name contains the internal delimiter");
              return Ok(());
            }
            stripped.replace(delim, "/")
          } else {
            stripped
          }
        };
        if !self.listing.contains(&name) {
          self.listing.push(name);
        }
      }
      Resp::Flags => (),
      Resp::Namespace(ns) => {
        if let Some((prefix, delim)) = ns {
          self.ns_prefix = prefix;
          self.ns_delim = delim;
        }
      }
      Resp::Exists(n) => {
        if let Some(open) = &mut self.open {
          open.exists = n;
        }
      }
      Resp::Recent(n) => {
        if let Some(open) = &mut self.open {
          open.recent = n;
        }
      }
      Resp::ExpungeSeq(seq) => {
        if let Some(index) = self.msgs.expunge(seq) {
          let uid = self.msgs.get(index).uid;
          log::debug!("{}: message {uid} vanished", self.label);
          self.expunged.push(uid);
        }
        if let Some(open) = &mut self.open {
          open.exists = open.exists.saturating_sub(1);
        }
      }
      Resp::Fetch(info) => {
        let Some(uid) = info.uid else {
          // Unsolicited flag update; without a UID there is nothing to match
          // it against.
          log::debug!("{}: ignoring unsolicited FETCH response", self.label);
          return Ok(());
        };
        if self.want_body_uid == Some(uid) {
          self.fetched = Some(info);
          return Ok(());
        }
        self.msgs.ensure_absolute();
        let index = match self.msgs.find_uid(uid) {
          Some(index) => index,
          None => self.msgs.append(info.seq, uid),
        };
        let msg = self.msgs.get_mut(index);
        if let Some((flags, recent)) = info.flags {
          msg.flags = flags;
          msg.status |= MsgStatus::FLAGS;
          if recent {
            msg.status |= MsgStatus::RECENT;
          }
        }
        if let Some(size) = info.size {
          msg.size = size;
        }
        if let Some(header) = info.header {
          if let Some(tuid) = header_value(&header, "X-TUID") {
            if tuid.len() == crate::driver::TUID_LEN {
              let mut bytes = [0; crate::driver::TUID_LEN];
              bytes.copy_from_slice(&tuid);
              msg.tuid = Some(Tuid(bytes));
            }
          }
          if let Some(msgid) = header_value(&header, "Message-ID") {
            msg.msgid = Some(String::from_utf8_lossy(&msgid).into_owned());
          }
        }
      }
      Resp::CondInfo { cond, info, text } => {
        match cond {
          Cond::Bye => {
            self.broken = true;
            anyhow::bail!("server said BYE: {text}");
          }
          Cond::No | Cond::Bad => log::warn!("{}: server complains: {text}", self.label),
          _ => (),
        }
        match info {
          CondExtra::Caps(caps) => self.caps = caps,
          CondExtra::UidValidity(v) => {
            if let Some(open) = &mut self.open {
              open.uidvalidity = v;
            }
          }
          CondExtra::UidNext(n) => {
            if let Some(open) = &mut self.open {
              open.uidnext = n;
            }
          }
          CondExtra::PermanentFlags { flags, wildcard } => {
            if let Some(open) = &mut self.open {
              open.perm_flags = flags;
              open.all_keywords = wildcard;
            }
          }
          CondExtra::Alert => log::warn!("{}: ALERT: {text}", self.label),
          CondExtra::None => (),
        }
      }
    }
    Ok(())
  }

  fn greeting(&mut self) -> anyhow::Result<bool> {
    // The greeting is a lone untagged status line, but some servers send
    // notices around it.
    loop {
      let start = self.read_start()?;
      anyhow::ensure!(start == b"*", "unexpected greeting tag {:?}", String::from_utf8_lossy(&start));
      let resp = {
        let stream = self.stream.as_ref().unwrap();
        stream.parse(parser::response::untagged)?.map(Self::to_owned_resp)
      };
      match resp {
        Some(Resp::CondInfo { cond: Cond::Preauth, info, .. }) => {
          if let CondExtra::Caps(caps) = info {
            self.caps = caps;
          }
          return Ok(true);
        }
        Some(resp @ Resp::CondInfo { .. }) => {
          self.apply(resp)?;
          return Ok(false);
        }
        Some(resp) => self.apply(resp)?,
        None => self.stream.as_ref().unwrap().expect(parser::response::skip)?,
      }
    }
  }

  fn authenticate(&mut self) -> anyhow::Result<()> {
    let mut password = match (&self.conf.password, &self.conf.password_command) {
      (Some(password), _) => password.clone(),
      (None, Some(command)) => password_from_command(command)?,
      (None, None) => anyhow::bail!("no password configured for store {}", self.conf.store.name),
    };
    let done = if self.has_cap("AUTH=PLAIN") {
      let mut credentials = plain(&self.conf.user, &password);
      let done = if self.has_cap("SASL-IR") {
        // https://www.rfc-editor.org/rfc/rfc4959
        self.exec(&[Piece::Text(b"AUTHENTICATE PLAIN "), Piece::Secret(credentials.as_bytes())])
      } else {
        self.exec_continued(b"AUTHENTICATE PLAIN", credentials.as_bytes())
      };
      credentials.zeroize();
      done
    } else if !self.has_cap("LOGINDISABLED") {
      let user = self.conf.user.clone();
      let secret = password.clone();
      let done = self.exec(&[
        Piece::Text(b"LOGIN "),
        Piece::Literal(user.as_bytes()),
        Piece::Text(b" "),
        Piece::Literal(secret.as_bytes()),
      ]);
      done
    } else {
      password.zeroize();
      anyhow::bail!("server supports neither AUTHENTICATE PLAIN nor LOGIN");
    };
    password.zeroize();
    let done = done?;
    if done.cond != DoneCond::Ok {
      self.fail = FailState::Final;
      anyhow::bail!("authentication failed: {}", done.text);
    }
    Ok(())
  }

  /// Sends a command whose payload goes out only after a continuation
  /// request, as in AUTHENTICATE without SASL-IR.
  fn exec_continued(&mut self, command: &[u8], payload: &[u8]) -> anyhow::Result<Done> {
    let tag = self.next_tag();
    log::debug!("{} > {} {}", self.label, tag, String::from_utf8_lossy(command));
    let first = [tag.as_bytes(), b" ", command, b"\r\n"].concat();
    self.stream_mut()?.input(&[&first], 0)?;
    loop {
      match self.read_start()?.as_slice() {
        b"*" => self.handle_untagged()?,
        b"+" => {
          self.stream.as_ref().unwrap().expect(parser::response::skip)?;
          break;
        }
        got if got == tag.as_bytes() => return self.finish_tagged(),
        got => anyhow::bail!("unexpected tag {:?}", String::from_utf8_lossy(got)),
      }
    }
    let line = [payload, b"\r\n"].concat();
    self.stream_mut()?.input(&[&line], 0)?;
    loop {
      match self.read_start()?.as_slice() {
        b"*" => self.handle_untagged()?,
        got if got == tag.as_bytes() => return self.finish_tagged(),
        got => anyhow::bail!("unexpected tag {:?}", String::from_utf8_lossy(got)),
      }
    }
  }

  fn connect_inner(&mut self) -> anyhow::Result<()> {
    let wire = match &self.conf.tunnel {
      Some(command) => Wire::Tunnel(stream::spawn_tunnel(command)?),
      None => {
        let tcp = stream::connect_tcp(&self.conf.host, self.conf.port, self.conf.timeout)?;
        match self.conf.tls {
          TlsMode::Implicit => Wire::Tls(Box::new(stream::wrap_tls(tcp, &self.conf.host)?)),
          _ => Wire::Plain(tcp),
        }
      }
    };
    self.stream = Some(Stream::new(wire));
    let preauth = self.greeting()?;

    if self.caps.is_empty() {
      self.exec(&[Piece::Text(b"CAPABILITY")])?;
    }
    anyhow::ensure!(self.has_cap("IMAP4rev1"), "IMAP4rev1 is missing from CAPABILITY list");

    if self.conf.tls == TlsMode::StartTls {
      anyhow::ensure!(self.has_cap("STARTTLS"), "server does not announce STARTTLS");
      let done = self.exec(&[Piece::Text(b"STARTTLS")])?;
      anyhow::ensure!(done.cond == DoneCond::Ok, "STARTTLS refused: {}", done.text);
      let host = self.conf.host.clone();
      self.stream_mut()?.upgrade(|wire| match wire {
        Wire::Plain(tcp) => Ok(Wire::Tls(Box::new(stream::wrap_tls(tcp, &host)?))),
        _ => anyhow::bail!("STARTTLS over a non-TCP transport"),
      })?;
      // The pre-TLS capabilities are untrusted.
      self.caps.clear();
      self.exec(&[Piece::Text(b"CAPABILITY")])?;
    }

    if !preauth {
      self.authenticate()?;
      // In-stream capability rewriting (by some proxies) is defeated by
      // re-asking after authentication when the login response did not
      // already update the list.
      self.exec(&[Piece::Text(b"CAPABILITY")])?;
    }

    if self.conf.use_namespace && self.conf.path.is_none() && self.has_cap("NAMESPACE") {
      // https://www.rfc-editor.org/rfc/rfc2342
      self.exec(&[Piece::Text(b"NAMESPACE")])?;
    }
    self.fail = FailState::Temp;
    Ok(())
  }

  fn check_trash(&mut self) -> crate::driver::Result<Vec<u8>> {
    let trash = self
      .conf
      .store
      .trash
      .clone()
      .ok_or_else(|| DriverError::mailbox(anyhow::anyhow!("store has no trash configured")))?;
    self.encode_box_name(&trash).map_err(DriverError::mailbox)
  }

  /// Retries `build`'s command once after creating the trash mailbox if the
  /// server asks for it via TRYCREATE.
  fn exec_to_trash(&mut self, encoded: &[u8], pieces: &[Piece]) -> anyhow::Result<Done> {
    let done = self.exec(pieces)?;
    if done.cond == DoneCond::No && done.code == Code::TryCreate && !self.trash_known {
      let done = self.exec(&[Piece::Text(b"CREATE "), Piece::Literal(encoded)])?;
      anyhow::ensure!(done.cond == DoneCond::Ok, "cannot create trash mailbox: {}", done.text);
      self.trash_known = true;
      return self.exec(pieces);
    }
    Ok(done)
  }

  fn uid_set(uids: &[u32]) -> String {
    // Compress runs into ranges; servers limit command line lengths.
    let mut out = String::new();
    let mut i = 0;
    while i < uids.len() {
      let start = uids[i];
      let mut end = start;
      while i + 1 < uids.len() && uids[i + 1] == end + 1 {
        i += 1;
        end = uids[i];
      }
      if !out.is_empty() {
        out.push(',');
      }
      if start == end {
        out += &start.to_string();
      } else {
        out += &format!("{start}:{end}");
      }
      i += 1;
    }
    out
  }

  fn fetch_uids(&mut self, set: &str, atts: &str) -> anyhow::Result<()> {
    let command = format!("UID FETCH {set} ({atts})");
    let done = self.exec(&[Piece::Text(command.as_bytes())])?;
    anyhow::ensure!(done.cond == DoneCond::Ok, "FETCH failed: {}", done.text);
    Ok(())
  }
}

impl Driver for ImapStore {
  fn caps(&self) -> Caps {
    Caps::CRLF
  }

  fn conf(&self) -> &StoreConf {
    &self.conf.store
  }

  fn fail_state(&self) -> FailState {
    self.fail
  }

  fn connect(&mut self) -> crate::driver::Result<()> {
    if self.stream.is_some() && !self.broken {
      return Ok(());
    }
    self.broken = false;
    self.caps.clear();
    match self.connect_inner() {
      Ok(()) => Ok(()),
      Err(error) => Err(self.store_err(error)),
    }
  }

  fn list(&mut self, mode: ListMode) -> crate::driver::Result<Vec<String>> {
    self.listing.clear();
    let result = (|| {
      if matches!(mode, ListMode::Inbox | ListMode::Both) {
        let done = self.exec(&[Piece::Text(b"LIST \"\" INBOX")])?;
        anyhow::ensure!(done.cond == DoneCond::Ok, "LIST failed: {}", done.text);
      }
      if matches!(mode, ListMode::Path | ListMode::Both) {
        let prefix = self.prefix().to_string();
        let pattern = utf7::utf8_to_utf7(&format!("{prefix}*"));
        let done = self.exec(&[
          Piece::Text(b"LIST \"\" "),
          Piece::Literal(pattern.as_bytes()),
        ])?;
        anyhow::ensure!(done.cond == DoneCond::Ok, "LIST failed: {}", done.text);
      }
      Ok(())
    })();
    match result {
      Ok(()) => Ok(mem::take(&mut self.listing)),
      Err(error) => Err(self.store_err(error)),
    }
  }

  fn select(&mut self, name: &str) -> crate::driver::Result<()> {
    let encoded = self.encode_box_name(name).map_err(DriverError::mailbox)?;
    self.encoded_selected = Some(encoded);
    self.open = None;
    Ok(())
  }

  fn box_path(&self) -> Option<path::PathBuf> {
    None
  }

  fn create_box(&mut self) -> crate::driver::Result<()> {
    let encoded = self.encoded_selected.clone().expect("no box selected");
    let done = self
      .exec(&[Piece::Text(b"CREATE "), Piece::Literal(&encoded)])
      .map_err(|e| self.store_err(e))?;
    match done.cond {
      DoneCond::Ok => Ok(()),
      _ => Err(DriverError::mailbox(anyhow::anyhow!("cannot create mailbox: {}", done.text))),
    }
  }

  fn open_box(&mut self) -> crate::driver::Result<Option<u32>> {
    let encoded = self.encoded_selected.clone().expect("no box selected");
    self.open = Some(OpenState { perm_flags: Flags::ALL, ..OpenState::default() });
    self.msgs.reset();
    let done = self
      .exec(&[Piece::Text(b"SELECT "), Piece::Literal(&encoded)])
      .map_err(|e| self.store_err(e))?;
    match done.cond {
      DoneCond::Ok => {
        let open = self.open.as_ref().unwrap();
        if open.uidvalidity == 0 {
          return Err(DriverError::mailbox(anyhow::anyhow!("SELECT reported no UIDVALIDITY")));
        }
        Ok(Some(open.uidvalidity))
      }
      DoneCond::No => {
        self.open = None;
        Ok(None)
      }
      DoneCond::Bad => {
        self.open = None;
        Err(DriverError::mailbox(anyhow::anyhow!("SELECT failed: {}", done.text)))
      }
    }
  }

  fn confirm_box_empty(&mut self) -> crate::driver::Result<bool> {
    Ok(self.open.as_ref().map(|open| open.exists == 0).unwrap_or(false))
  }

  fn delete_box(&mut self) -> crate::driver::Result<()> {
    let encoded = self.encoded_selected.clone().expect("no box selected");
    let result = (|| {
      // Deselect first; deleting the selected mailbox is undefined.
      self.exec(&[Piece::Text(b"CLOSE")])?;
      self.exec(&[Piece::Text(b"DELETE "), Piece::Literal(&encoded)])
    })();
    self.open = None;
    match result.map_err(|e| self.store_err(e))? {
      Done { cond: DoneCond::Ok, .. } => Ok(()),
      done => Err(DriverError::mailbox(anyhow::anyhow!("cannot delete mailbox: {}", done.text))),
    }
  }

  fn finish_delete_box(&mut self) -> crate::driver::Result<()> {
    Ok(())
  }

  fn prepare_load(&mut self, opts: OpenOptions) -> OpenOptions {
    let mut granted = opts;
    if !self.has_cap("UIDPLUS") {
      granted = granted - OpenOptions::UID_EXPUNGE;
    }
    self.load_opts = granted;
    granted
  }

  fn load_box(
    &mut self,
    minuid: u32,
    maxuid: u32,
    finduid: u32,
    pairuid: u32,
    newuid: u32,
    excs: &[u32],
  ) -> crate::driver::Result<LoadResult> {
    let open = self.open.as_ref().expect("no box open");
    let (total, recent) = (open.exists, open.recent);
    let opts = self.load_opts;
    let result = (|| {
      self.msgs.reset();
      let mut atts = "UID".to_string();
      if opts.contains(OpenOptions::FLAGS) {
        atts += " FLAGS";
      }
      if !excs.is_empty() {
        let mut atts = atts.clone();
        if opts.contains(OpenOptions::OLD_SIZE) {
          atts += " RFC822.SIZE";
        }
        self.fetch_uids(&Self::uid_set(excs), &atts)?;
      }
      if minuid <= maxuid && total > 0 {
        let max = |uid: u32| if uid == u32::MAX { "*".to_string() } else { uid.to_string() };
        let old_size = opts.contains(OpenOptions::OLD_SIZE);
        let new_size = opts.contains(OpenOptions::NEW_SIZE);
        if (old_size == new_size) || maxuid <= newuid || minuid > newuid {
          let mut atts = atts.clone();
          let wants = if minuid > newuid { new_size } else { old_size };
          if wants || (old_size && new_size) {
            atts += " RFC822.SIZE";
          }
          self.fetch_uids(&format!("{}:{}", minuid, max(maxuid)), &atts)?;
        } else {
          // The size matters only on one side of the newuid boundary.
          let mut lo = atts.clone();
          if old_size {
            lo += " RFC822.SIZE";
          }
          self.fetch_uids(&format!("{}:{}", minuid, newuid), &lo)?;
          let mut hi = atts.clone();
          if new_size {
            hi += " RFC822.SIZE";
          }
          self.fetch_uids(&format!("{}:{}", newuid + 1, max(maxuid)), &hi)?;
        }
      }
      if opts.contains(OpenOptions::FIND) && finduid > 0 {
        self.fetch_uids(
          &format!("{finduid}:*"),
          "UID BODY.PEEK[HEADER.FIELDS (X-TUID)]",
        )?;
      }
      if opts.contains(OpenOptions::PAIRED_IDS) && pairuid > 0 {
        self.fetch_uids(
          &format!("1:{pairuid}"),
          "UID BODY.PEEK[HEADER.FIELDS (MESSAGE-ID)]",
        )?;
      }
      Ok(())
    })();
    if let Err(error) = result {
      return Err(self.store_err(error));
    }
    self.msgs.ensure_absolute();
    let mut msgs = Vec::with_capacity(self.msgs.len());
    for imsg in self.msgs.iter() {
      if imsg.status.contains(MsgStatus::DEAD) {
        continue;
      }
      msgs.push(Message {
        uid: imsg.uid,
        size: imsg.size,
        flags: imsg.flags,
        status: imsg.status,
        tuid: imsg.tuid,
        msgid: imsg.msgid.clone(),
        srec: None,
      });
    }
    msgs.sort_by_key(|msg| msg.uid);
    Ok(LoadResult { msgs, total, recent })
  }

  fn uid_next(&self) -> u32 {
    match self.open.as_ref() {
      Some(open) if open.uidnext > 0 => open.uidnext,
      // Some servers omit UIDNEXT from SELECT; the highest known UID bounds it.
      Some(_) => self.msgs.iter().map(|msg| msg.uid).max().unwrap_or(0) + 1,
      None => 0,
    }
  }

  fn supported_flags(&self) -> Flags {
    match self.open.as_ref() {
      Some(open) if !open.all_keywords => open.perm_flags | Flags::DELETED,
      _ => Flags::ALL,
    }
  }

  fn fetch_msg(&mut self, uid: u32, wants_date: bool, minimal: bool) -> crate::driver::Result<MsgData> {
    self.want_body_uid = Some(uid);
    self.fetched = None;
    let mut atts = "UID FLAGS".to_string();
    if wants_date {
      atts += " INTERNALDATE";
    }
    atts += if minimal { " BODY.PEEK[HEADER]" } else { " BODY.PEEK[]" };
    let result = self.fetch_uids(&uid.to_string(), &atts);
    self.want_body_uid = None;
    if let Err(error) = result {
      return Err(self.store_err(error));
    }
    let info = match self.fetched.take() {
      Some(info) => info,
      None => {
        return Err(DriverError::message(anyhow::anyhow!(
          "message {uid} went missing during FETCH"
        )))
      }
    };
    let body = match (info.body, info.header) {
      (Some(body), _) => body,
      (None, Some(header)) => header,
      (None, None) => {
        return Err(DriverError::message(anyhow::anyhow!("FETCH returned no body for {uid}")))
      }
    };
    Ok(MsgData {
      bytes: body,
      flags: info.flags.map(|(flags, _)| flags).unwrap_or(Flags::NONE),
      date: info.date.as_deref().and_then(parse_internal_date),
    })
  }

  fn store_msg(&mut self, data: &MsgData, to_trash: bool) -> crate::driver::Result<u32> {
    let encoded = if to_trash {
      self.check_trash()?
    } else {
      self.encoded_selected.clone().expect("no box selected")
    };
    let mut middle = String::new();
    let flags = flags_to_atoms(data.flags);
    middle += &format!(" ({flags})");
    if let Some(date) = data.date {
      middle += &format!(" \"{}\"", format_internal_date(date));
    }
    middle.push(' ');
    let pieces = [
      Piece::Text(b"APPEND "),
      Piece::Literal(&encoded),
      Piece::Text(middle.as_bytes()),
      Piece::Literal(&data.bytes),
    ];
    let done = if to_trash {
      self.exec_to_trash(&encoded, &pieces)
    } else {
      self.exec(&pieces)
    };
    match done.map_err(|e| self.store_err(e))? {
      Done { cond: DoneCond::Ok, code: Code::AppendUid(validity, uid), .. } => {
        if !to_trash {
          if let Some(open) = &mut self.open {
            if open.uidvalidity != validity {
              log::warn!("{}: UIDVALIDITY changed under APPEND", self.label);
              return Ok(0);
            }
            if open.uidnext <= uid {
              open.uidnext = uid + 1;
            }
          }
        }
        Ok(uid)
      }
      Done { cond: DoneCond::Ok, .. } => Ok(0),
      done => Err(DriverError::message(anyhow::anyhow!("cannot store message: {}", done.text))),
    }
  }

  fn find_new_msgs(&mut self, newuid: u32) -> crate::driver::Result<Vec<Message>> {
    let newuid = newuid.max(1);
    let result = self.fetch_uids(
      &format!("{newuid}:*"),
      "UID BODY.PEEK[HEADER.FIELDS (X-TUID)]",
    );
    if let Err(error) = result {
      return Err(self.store_err(error));
    }
    self.msgs.ensure_absolute();
    let mut found = Vec::new();
    for imsg in self.msgs.iter() {
      if imsg.status.contains(MsgStatus::DEAD) || imsg.uid < newuid {
        continue;
      }
      found.push(Message {
        uid: imsg.uid,
        size: imsg.size,
        flags: imsg.flags,
        status: imsg.status,
        tuid: imsg.tuid,
        msgid: imsg.msgid.clone(),
        srec: None,
      });
    }
    found.sort_by_key(|msg| msg.uid);
    Ok(found)
  }

  fn set_msg_flags(&mut self, uid: u32, add: Flags, del: Flags) -> crate::driver::Result<()> {
    self.deferred.push((uid, add, del));
    Ok(())
  }

  fn trash_msg(&mut self, uid: u32) -> crate::driver::Result<()> {
    let encoded = self.check_trash()?;
    let command = format!("UID COPY {uid} ");
    let pieces = [Piece::Text(command.as_bytes()), Piece::Literal(&encoded)];
    match self.exec_to_trash(&encoded, &pieces).map_err(|e| self.store_err(e))? {
      Done { cond: DoneCond::Ok, .. } => Ok(()),
      done => Err(DriverError::message(anyhow::anyhow!("cannot trash message {uid}: {}", done.text))),
    }
  }

  fn commit_cmds(&mut self) -> crate::driver::Result<Vec<u32>> {
    let deferred = mem::take(&mut self.deferred);
    if deferred.is_empty() {
      return Ok(Vec::new());
    }
    let mut failed = Vec::new();
    for (uid, add, del) in deferred {
      for (operator, flags) in [("+", add), ("-", del)] {
        if flags.is_empty() {
          continue;
        }
        let command = format!("UID STORE {uid} {operator}FLAGS.SILENT ({})", flags_to_atoms(flags));
        let done = self
          .exec(&[Piece::Text(command.as_bytes())])
          .map_err(|e| self.store_err(e))?;
        if done.cond != DoneCond::Ok {
          log::error!("{}: flag update for {uid} failed: {}", self.label, done.text);
          if !failed.contains(&uid) {
            failed.push(uid);
          }
        }
      }
    }
    // Success is reported only once a CHECK goes through; a server that
    // accepted the STOREs but loses them on a crash would otherwise fool us.
    let done = self.exec(&[Piece::Text(b"CHECK")]).map_err(|e| self.store_err(e))?;
    match done.cond {
      DoneCond::Ok => Ok(failed),
      _ => Err(DriverError::mailbox(anyhow::anyhow!("CHECK failed: {}", done.text))),
    }
  }

  fn cancel_cmds(&mut self) {
    self.deferred.clear();
  }

  fn close_box(&mut self, mode: ExpungeMode) -> crate::driver::Result<CloseResult> {
    let result = (|| match mode {
      ExpungeMode::None => {
        self.exec(&[Piece::Text(b"CLOSE")])?;
        Ok(CloseResult { reported: false, expunged: Vec::new() })
      }
      ExpungeMode::Sweep => {
        // CLOSE expunges silently; the engine falls back to assuming its
        // own deletion marks took effect.
        let done = self.exec(&[Piece::Text(b"CLOSE")])?;
        anyhow::ensure!(done.cond == DoneCond::Ok, "CLOSE failed: {}", done.text);
        Ok(CloseResult { reported: false, expunged: Vec::new() })
      }
      ExpungeMode::Uids(uids) => {
        let before = self.expunged.len();
        if !uids.is_empty() {
          let command = format!("UID EXPUNGE {}", Self::uid_set(&uids));
          let done = self.exec(&[Piece::Text(command.as_bytes())])?;
          anyhow::ensure!(done.cond == DoneCond::Ok, "UID EXPUNGE failed: {}", done.text);
        }
        let expunged = self.expunged.split_off(before);
        self.exec(&[Piece::Text(b"CLOSE")])?;
        Ok(CloseResult { reported: true, expunged })
      }
    })();
    self.open = None;
    self.encoded_selected = None;
    match result {
      Ok(close) => Ok(close),
      Err(error) => Err(self.store_err(error)),
    }
  }

  fn drain_expunged(&mut self) -> Vec<u32> {
    mem::take(&mut self.expunged)
  }

  fn cleanup(&mut self) {
    if self.stream.is_some() && !self.broken {
      let _ = self.exec(&[Piece::Text(b"LOGOUT")]);
    }
    self.stream = None;
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn header_values() {
    let blob = b"X-TUID: AbCdEfGhIjKl\r\nMessage-ID: <a@b>\r\n\r\n";
    assert_eq!(Some(b"AbCdEfGhIjKl".to_vec()), header_value(blob, "X-TUID"));
    assert_eq!(Some(b"<a@b>".to_vec()), header_value(blob, "Message-ID"));
    assert_eq!(None, header_value(blob, "Subject"));

    // Folded headers are unfolded, case doesn't matter.
    let folded = b"message-id:\r\n <folded@example>\r\nOther: x\r\n";
    assert_eq!(Some(b"<folded@example>".to_vec()), header_value(folded, "Message-ID"));
  }

  #[test]
  fn uid_sets() {
    assert_eq!("", ImapStore::uid_set(&[]));
    assert_eq!("3", ImapStore::uid_set(&[3]));
    assert_eq!("1:3,7,9:10", ImapStore::uid_set(&[1, 2, 3, 7, 9, 10]));
  }

  #[test]
  fn internal_dates() {
    let date = parse_internal_date(b"17-Jul-1996 02:44:25 -0700").unwrap();
    let secs = date.duration_since(time::UNIX_EPOCH).unwrap().as_secs();
    assert_eq!(837596665, secs);
    assert_eq!("17-Jul-1996 09:44:25 +0000", format_internal_date(date));

    let epoch = time::UNIX_EPOCH;
    assert_eq!("01-Jan-1970 00:00:00 +0000", format_internal_date(epoch));
    assert_eq!(Some(epoch), parse_internal_date(b"01-Jan-1970 00:00:00 +0000"));

    // The day of a date-time is space-padded on the wire.
    let padded = parse_internal_date(b" 7-Jul-1996 02:44:25 +0000").unwrap();
    assert_eq!("07-Jul-1996 02:44:25 +0000", format_internal_date(padded));

    assert_eq!(None, parse_internal_date(b"bogus"));
  }

  #[test]
  fn flag_atoms() {
    assert_eq!("\\Flagged \\Seen", flags_to_atoms(Flags::FLAGGED | Flags::SEEN));
    assert_eq!(Some(Flags::FORWARDED), flag_from_atom(b"$Forwarded"));
    assert_eq!(None, flag_from_atom(b"\\Recent"));
  }
}
