// Configuration file parsing. The format is line-oriented: a section opener
// (IMAPAccount, IMAPStore, MaildirStore, Channel, Group) followed by the
// section's options, one per line; '#' starts a comment. Values with spaces
// are double-quoted. Unknown keywords are fatal, with file:line context.

use crate::driver::StoreConf;
use crate::imap::{ImapConf, TlsMode};
use crate::maildir::MaildirConf;
use crate::sync::{ChannelConf, OpsMask, F, N};
use anyhow::Context as _;
use std::{fs, path, time};

pub const OP_DFLT_TYPE: OpsMask = OpsMask(
  OpsMask::NEW.0 | OpsMask::UPGRADE.0 | OpsMask::GONE.0 | OpsMask::FLAGS.0,
);
pub const OP_MASK_TYPE: OpsMask = OpsMask(OP_DFLT_TYPE.0 | OpsMask::OLD.0);

#[derive(Debug)]
pub enum StoreDef {
  Imap(ImapConf),
  Maildir(MaildirConf),
}

impl StoreDef {
  pub fn name(&self) -> &str {
    match self {
      StoreDef::Imap(conf) => &conf.store.name,
      StoreDef::Maildir(conf) => &conf.store.name,
    }
  }

  pub fn conf_mut(&mut self) -> &mut StoreConf {
    match self {
      StoreDef::Imap(conf) => &mut conf.store,
      StoreDef::Maildir(conf) => &mut conf.store,
    }
  }
}

#[derive(Debug)]
pub struct Group {
  pub name: String,
  pub channels: Vec<String>,
}

#[derive(Debug)]
pub struct GlobalConf {
  pub sync_state: Option<String>,
  pub fsync: bool,
  pub buffer_limit: u32,
  pub ops: [OpsMask; 2],
  pub have_type: bool,
  pub have_create: bool,
  pub have_remove: bool,
  pub have_expunge: bool,
}

impl Default for GlobalConf {
  fn default() -> Self {
    Self {
      sync_state: None,
      fsync: true,
      buffer_limit: 10 * 1024 * 1024,
      ops: [OpsMask::NONE; 2],
      have_type: false,
      have_create: false,
      have_remove: false,
      have_expunge: false,
    }
  }
}

#[derive(Debug, Default)]
pub struct Config {
  pub global: GlobalConf,
  pub stores: Vec<StoreDef>,
  pub channels: Vec<ChannelConf>,
  pub groups: Vec<Group>,
}

impl Config {
  pub fn store(&self, name: &str) -> Option<&StoreDef> {
    self.stores.iter().find(|store| store.name() == name)
  }

  pub fn channel(&self, name: &str) -> Option<&ChannelConf> {
    self.channels.iter().find(|chan| chan.name == name)
  }

  pub fn group(&self, name: &str) -> Option<&Group> {
    self.groups.iter().find(|group| group.name == name)
  }
}

/// Per-channel op selections with "was it given at all" tracking, used both
/// by the Sync/Create/Remove/Expunge options and by the command line.
#[derive(Clone, Copy, Debug, Default)]
pub struct OpsSpec {
  pub ops: [OpsMask; 2],
  pub have_type: bool,
  pub have_create: bool,
  pub have_remove: bool,
  pub have_expunge: bool,
}

impl OpsSpec {
  /// Folds the channel's own settings, the global defaults, and the built-in
  /// defaults, in that order of preference.
  pub fn merge(cli: &OpsSpec, chan: &mut ChannelConf, chan_spec: &OpsSpec, global: &GlobalConf) {
    let merge_one = |ops: &mut [OpsMask; 2],
                     cli_have: bool,
                     chan_have: bool,
                     global_have: bool,
                     mask: OpsMask,
                     dflt: OpsMask| {
      if cli_have {
        for t in 0..2 {
          ops[t] = (ops[t] - mask) | (cli.ops[t] & mask);
        }
      } else if !chan_have {
        if global_have {
          for t in 0..2 {
            ops[t] |= global.ops[t] & mask;
          }
        } else {
          for t in 0..2 {
            ops[t] |= dflt;
          }
        }
      }
    };
    merge_one(
      &mut chan.ops,
      cli.have_type,
      chan_spec.have_type,
      global.have_type,
      OP_MASK_TYPE,
      OP_DFLT_TYPE,
    );
    merge_one(
      &mut chan.ops,
      cli.have_create,
      chan_spec.have_create,
      global.have_create,
      OpsMask::CREATE,
      OpsMask::NONE,
    );
    merge_one(
      &mut chan.ops,
      cli.have_remove,
      chan_spec.have_remove,
      global.have_remove,
      OpsMask::REMOVE,
      OpsMask::NONE,
    );
    merge_one(
      &mut chan.ops,
      cli.have_expunge,
      chan_spec.have_expunge,
      global.have_expunge,
      OpsMask::EXPUNGE,
      OpsMask::NONE,
    );
  }
}

fn tokenize(line: &str) -> anyhow::Result<Vec<String>> {
  let mut tokens = Vec::new();
  let mut chars = line.chars().peekable();
  loop {
    while matches!(chars.peek(), Some(c) if c.is_whitespace()) {
      chars.next();
    }
    match chars.peek() {
      None | Some('#') => break,
      Some('"') => {
        chars.next();
        let mut token = String::new();
        loop {
          match chars.next() {
            Some('"') => break,
            Some('\\') => match chars.next() {
              Some(c) => token.push(c),
              None => anyhow::bail!("unterminated quoted string"),
            },
            Some(c) => token.push(c),
            None => anyhow::bail!("unterminated quoted string"),
          }
        }
        tokens.push(token);
      }
      Some(_) => {
        let mut token = String::new();
        while matches!(chars.peek(), Some(c) if !c.is_whitespace()) {
          token.push(chars.next().unwrap());
        }
        tokens.push(token);
      }
    }
  }
  Ok(tokens)
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
  match value.to_ascii_lowercase().as_str() {
    "yes" | "true" | "on" | "1" => Ok(true),
    "no" | "false" | "off" | "0" => Ok(false),
    _ => anyhow::bail!("invalid boolean value {value:?}"),
  }
}

fn parse_size(value: &str) -> anyhow::Result<u32> {
  let (digits, shift) = match value.chars().last() {
    Some('k') | Some('K') => (&value[..value.len() - 1], 10),
    Some('m') | Some('M') => (&value[..value.len() - 1], 20),
    _ => (value, 0),
  };
  let number: u64 = digits.parse().with_context(|| format!("invalid size {value:?}"))?;
  let scaled = number << shift;
  anyhow::ensure!(scaled <= u32::MAX as u64, "size {value:?} is out of range");
  Ok(scaled as u32)
}

/// Parses a side selector as used by Create/Remove/Expunge.
fn parse_sides(value: &str) -> anyhow::Result<[bool; 2]> {
  match value.to_ascii_lowercase().as_str() {
    "both" => Ok([true, true]),
    "far" => Ok([true, false]),
    "near" => Ok([false, true]),
    "master" => {
      log::warn!("Notice: keyword 'Master' is deprecated; use 'Far' instead.");
      Ok([true, false])
    }
    "slave" => {
      log::warn!("Notice: keyword 'Slave' is deprecated; use 'Near' instead.");
      Ok([false, true])
    }
    "none" => Ok([false, false]),
    other => parse_bool(other).map(|yes| [yes, yes]),
  }
}

/// Parses the Sync option's vocabulary into per-side type masks.
pub fn parse_sync_ops(words: &[String]) -> anyhow::Result<[OpsMask; 2]> {
  let mut ops = [OpsMask::NONE; 2];
  let mut dirs = [false; 2];
  let mut types = OpsMask::NONE;
  for word in words {
    let (dir, word) = match word.to_ascii_lowercase() {
      w if w.starts_with("pull") && w.len() > 4 => (Some(N), w[4..].to_string()),
      w if w.starts_with("push") && w.len() > 4 => (Some(F), w[4..].to_string()),
      w => (None, w),
    };
    let mask = match word.as_str() {
      "pull" => {
        dirs[N] = true;
        continue;
      }
      "push" => {
        dirs[F] = true;
        continue;
      }
      "all" => {
        dirs = [true, true];
        types |= OP_MASK_TYPE;
        continue;
      }
      "none" => continue,
      "new" => OpsMask::NEW,
      "old" => OpsMask::OLD,
      "upgrade" => OpsMask::UPGRADE,
      "gone" => OpsMask::GONE,
      "delete" => {
        log::warn!("Notice: sync operation 'Delete' is deprecated; use 'Gone' instead.");
        OpsMask::GONE
      }
      "flags" => OpsMask::FLAGS,
      other => anyhow::bail!("invalid Sync operation {other:?}"),
    };
    match dir {
      Some(t) => ops[t] |= mask,
      None => types |= mask,
    }
  }
  if !types.is_empty() || dirs[F] || dirs[N] {
    if types.is_empty() {
      types = OP_DFLT_TYPE;
    }
    if !dirs[F] && !dirs[N] {
      dirs = [true, true];
    }
    for t in 0..2 {
      if dirs[t] {
        ops[t] |= types;
      }
    }
  }
  Ok(ops)
}

/// One side of a Channel: ":store:box" (box may be empty).
fn parse_endpoint(value: &str) -> anyhow::Result<(String, Option<String>)> {
  let rest = value.strip_prefix(':').context("endpoint must start with ':'")?;
  let (store, mailbox) = rest.split_once(':').context("endpoint must name a store")?;
  anyhow::ensure!(!store.is_empty(), "endpoint must name a store");
  Ok((
    store.to_string(),
    if mailbox.is_empty() { None } else { Some(mailbox.to_string()) },
  ))
}

#[derive(Debug, Default)]
struct ImapAccount {
  host: String,
  port: Option<u16>,
  tls: Option<TlsMode>,
  tunnel: Option<String>,
  user: String,
  password: Option<String>,
  password_command: Option<Vec<String>>,
  timeout: Option<time::Duration>,
}

enum Section {
  None,
  Account(String, ImapAccount),
  Store(StoreDef),
  Channel(ChannelConf, OpsSpec),
  Group(Group),
}

pub struct Parser {
  accounts: Vec<(String, ImapAccount)>,
  config: Config,
  section: Section,
  pub channel_specs: Vec<OpsSpec>,
}

pub fn parse_config(path: &path::Path) -> anyhow::Result<(Config, Vec<OpsSpec>)> {
  let contents =
    fs::read_to_string(path).with_context(|| format!("cannot read config file {path:?}"))?;
  let mut parser = Parser {
    accounts: Vec::new(),
    config: Config::default(),
    section: Section::None,
    channel_specs: Vec::new(),
  };
  for (index, line) in contents.lines().enumerate() {
    parser
      .line(line)
      .with_context(|| format!("at {}:{}", path.display(), index + 1))?;
  }
  parser.finish_section()?;
  Ok((parser.config, parser.channel_specs))
}

impl Parser {
  fn finish_section(&mut self) -> anyhow::Result<()> {
    match std::mem::replace(&mut self.section, Section::None) {
      Section::None => (),
      Section::Account(name, account) => {
        anyhow::ensure!(
          !account.host.is_empty() || account.tunnel.is_some(),
          "account {name} has neither Host nor Tunnel"
        );
        self.accounts.push((name, account));
      }
      Section::Store(store) => self.config.stores.push(store),
      Section::Channel(chan, spec) => {
        anyhow::ensure!(
          !chan.stores[F].is_empty() && !chan.stores[N].is_empty(),
          "channel {} lacks a Far or Near store",
          chan.name
        );
        self.config.channels.push(chan);
        self.channel_specs.push(spec);
      }
      Section::Group(group) => self.config.groups.push(group),
    }
    Ok(())
  }

  fn line(&mut self, line: &str) -> anyhow::Result<()> {
    let tokens = tokenize(line)?;
    let Some(keyword) = tokens.first() else {
      return self.finish_section();
    };
    let args = &tokens[1..];
    let arg = || -> anyhow::Result<&str> {
      anyhow::ensure!(args.len() == 1, "keyword {keyword} wants exactly one argument");
      Ok(args[0].as_str())
    };

    // Section openers.
    match keyword.as_str() {
      "IMAPAccount" => {
        self.finish_section()?;
        self.section = Section::Account(arg()?.to_string(), ImapAccount::default());
        return Ok(());
      }
      "IMAPStore" => {
        self.finish_section()?;
        self.section = Section::Store(StoreDef::Imap(ImapConf {
          store: StoreConf::new(arg()?),
          host: String::new(),
          port: 0,
          tls: TlsMode::Implicit,
          tunnel: None,
          user: String::new(),
          password: None,
          password_command: None,
          timeout: None,
          use_namespace: true,
          path: None,
          path_delimiter: None,
        }));
        return Ok(());
      }
      "MaildirStore" => {
        self.finish_section()?;
        self.section = Section::Store(StoreDef::Maildir(MaildirConf {
          store: StoreConf::new(arg()?),
          path: path::PathBuf::new(),
        }));
        return Ok(());
      }
      // Inside a Group section, "Channel" names a member instead.
      "Channel" if !matches!(self.section, Section::Group(_)) => {
        self.finish_section()?;
        self.section =
          Section::Channel(ChannelConf::new(arg()?, "", ""), OpsSpec::default());
        return Ok(());
      }
      "Group" => {
        self.finish_section()?;
        self.section =
          Section::Group(Group { name: arg()?.to_string(), channels: Vec::new() });
        return Ok(());
      }
      _ => (),
    }

    if matches!(self.section, Section::None) {
      return self.global_option(keyword, args);
    }
    match &mut self.section {
      Section::None => unreachable!(),
      Section::Account(_, account) => Self::account_option(account, keyword, args),
      Section::Store(store) => {
        let accounts = &self.accounts;
        Self::store_option(accounts, store, keyword, args)
      }
      Section::Channel(chan, spec) => Self::channel_option(chan, spec, keyword, args),
      Section::Group(group) => match keyword.as_str() {
        "Channel" | "Channels" => {
          group.channels.extend(args.iter().cloned());
          Ok(())
        }
        _ => anyhow::bail!("unrecognized Group keyword {keyword:?}"),
      },
    }
  }

  fn global_option(&mut self, keyword: &str, args: &[String]) -> anyhow::Result<()> {
    let arg = || -> anyhow::Result<&str> {
      anyhow::ensure!(args.len() == 1, "keyword {keyword} wants exactly one argument");
      Ok(args[0].as_str())
    };
    match keyword {
      "SyncState" => self.config.global.sync_state = Some(arg()?.to_string()),
      "FSync" => self.config.global.fsync = parse_bool(arg()?)?,
      "BufferLimit" => self.config.global.buffer_limit = parse_size(arg()?)?,
      "Sync" => {
        self.config.global.ops = parse_sync_ops(args)?;
        self.config.global.have_type = true;
      }
      "Create" => {
        let sides = parse_sides(arg()?)?;
        for t in 0..2 {
          if sides[t] {
            self.config.global.ops[t] |= OpsMask::CREATE;
          }
        }
        self.config.global.have_create = true;
      }
      "Remove" => {
        let sides = parse_sides(arg()?)?;
        for t in 0..2 {
          if sides[t] {
            self.config.global.ops[t] |= OpsMask::REMOVE;
          }
        }
        self.config.global.have_remove = true;
      }
      "Expunge" => {
        let sides = parse_sides(arg()?)?;
        for t in 0..2 {
          if sides[t] {
            self.config.global.ops[t] |= OpsMask::EXPUNGE;
          }
        }
        self.config.global.have_expunge = true;
      }
      _ => anyhow::bail!("unrecognized global keyword {keyword:?}"),
    }
    Ok(())
  }

  fn account_option(
    account: &mut ImapAccount,
    keyword: &str,
    args: &[String],
  ) -> anyhow::Result<()> {
    let arg = || -> anyhow::Result<&str> {
      anyhow::ensure!(args.len() == 1, "keyword {keyword} wants exactly one argument");
      Ok(args[0].as_str())
    };
    match keyword {
      "Host" => account.host = arg()?.to_string(),
      "Port" => account.port = Some(arg()?.parse().context("invalid Port")?),
      "User" => account.user = arg()?.to_string(),
      "Pass" => account.password = Some(arg()?.to_string()),
      "PassCmd" => {
        account.password_command =
          Some(vec!["sh".to_string(), "-c".to_string(), arg()?.to_string()])
      }
      "Tunnel" => account.tunnel = Some(arg()?.to_string()),
      "Timeout" => {
        account.timeout =
          Some(time::Duration::from_secs(arg()?.parse().context("invalid Timeout")?))
      }
      "TLSType" | "SSLType" => {
        account.tls = Some(match arg()?.to_ascii_lowercase().as_str() {
          "none" => TlsMode::Off,
          "starttls" => TlsMode::StartTls,
          "imaps" => TlsMode::Implicit,
          other => anyhow::bail!("invalid TLSType {other:?}"),
        })
      }
      _ => anyhow::bail!("unrecognized IMAPAccount keyword {keyword:?}"),
    }
    Ok(())
  }

  fn store_option(
    accounts: &[(String, ImapAccount)],
    store: &mut StoreDef,
    keyword: &str,
    args: &[String],
  ) -> anyhow::Result<()> {
    let arg = || -> anyhow::Result<&str> {
      anyhow::ensure!(args.len() == 1, "keyword {keyword} wants exactly one argument");
      Ok(args[0].as_str())
    };
    // Driver-independent options first.
    match keyword {
      "Trash" => {
        store.conf_mut().trash = Some(arg()?.to_string());
        return Ok(());
      }
      "TrashNewOnly" => {
        store.conf_mut().trash_only_new = parse_bool(arg()?)?;
        return Ok(());
      }
      "TrashRemoteNew" => {
        store.conf_mut().trash_remote_new = parse_bool(arg()?)?;
        return Ok(());
      }
      "MaxSize" => {
        store.conf_mut().max_size = parse_size(arg()?)?;
        return Ok(());
      }
      "MapInbox" => {
        store.conf_mut().map_inbox = Some(arg()?.to_string());
        return Ok(());
      }
      "Flatten" => {
        let value = arg()?;
        anyhow::ensure!(value.chars().count() == 1, "Flatten wants a single character");
        store.conf_mut().flat_delim = value.chars().next();
        return Ok(());
      }
      _ => (),
    }
    match store {
      StoreDef::Imap(conf) => match keyword {
        "Account" => {
          let name = arg()?;
          let (_, account) = accounts
            .iter()
            .find(|(n, _)| n == name)
            .with_context(|| format!("unknown account {name:?}"))?;
          conf.host = account.host.clone();
          conf.tls = account.tls.unwrap_or(TlsMode::Implicit);
          conf.port =
            account.port.unwrap_or(if conf.tls == TlsMode::Implicit { 993 } else { 143 });
          conf.tunnel = account.tunnel.clone();
          conf.user = account.user.clone();
          conf.password = account.password.clone();
          conf.password_command = account.password_command.clone();
          conf.timeout = account.timeout;
        }
        "UseNamespace" => conf.use_namespace = parse_bool(arg()?)?,
        "PathPrefix" => conf.path = Some(arg()?.to_string()),
        "PathDelimiter" => {
          let value = arg()?;
          anyhow::ensure!(value.chars().count() == 1, "PathDelimiter wants a single character");
          conf.path_delimiter = value.chars().next();
        }
        _ => anyhow::bail!("unrecognized IMAPStore keyword {keyword:?}"),
      },
      StoreDef::Maildir(conf) => match keyword {
        "Path" => conf.path = path::PathBuf::from(arg()?),
        _ => anyhow::bail!("unrecognized MaildirStore keyword {keyword:?}"),
      },
    }
    Ok(())
  }

  fn channel_option(
    chan: &mut ChannelConf,
    spec: &mut OpsSpec,
    keyword: &str,
    args: &[String],
  ) -> anyhow::Result<()> {
    let arg = || -> anyhow::Result<&str> {
      anyhow::ensure!(args.len() == 1, "keyword {keyword} wants exactly one argument");
      Ok(args[0].as_str())
    };
    match keyword {
      "Far" | "Master" => {
        if keyword == "Master" {
          log::warn!("Notice: keyword 'Master' is deprecated; use 'Far' instead.");
        }
        let (store, mailbox) = parse_endpoint(arg()?)?;
        chan.stores[F] = store;
        chan.boxes[F] = mailbox;
      }
      "Near" | "Slave" => {
        if keyword == "Slave" {
          log::warn!("Notice: keyword 'Slave' is deprecated; use 'Near' instead.");
        }
        let (store, mailbox) = parse_endpoint(arg()?)?;
        chan.stores[N] = store;
        chan.boxes[N] = mailbox;
      }
      "Pattern" | "Patterns" => chan.patterns.extend(args.iter().cloned()),
      "Sync" => {
        let ops = parse_sync_ops(args)?;
        chan.ops[F] |= ops[F];
        chan.ops[N] |= ops[N];
        spec.have_type = true;
      }
      "Create" | "Remove" | "Expunge" => {
        let sides = parse_sides(arg()?)?;
        let mask = match keyword {
          "Create" => OpsMask::CREATE,
          "Remove" => OpsMask::REMOVE,
          _ => OpsMask::EXPUNGE,
        };
        for t in 0..2 {
          if sides[t] {
            chan.ops[t] |= mask;
          }
        }
        match keyword {
          "Create" => spec.have_create = true,
          "Remove" => spec.have_remove = true,
          _ => spec.have_expunge = true,
        }
      }
      "MaxMessages" => chan.max_messages = arg()?.parse().context("invalid MaxMessages")?,
      "ExpireUnread" => chan.expire_unread = if parse_bool(arg()?)? { 1 } else { 0 },
      "ExpireSide" => {
        chan.expire_side = match arg()?.to_ascii_lowercase().as_str() {
          "far" => F,
          "near" => N,
          other => anyhow::bail!("invalid ExpireSide {other:?}"),
        }
      }
      "CopyArrivalDate" => chan.use_internal_date = parse_bool(arg()?)?,
      "SyncState" => chan.sync_state = Some(arg()?.to_string()),
      _ => anyhow::bail!("unrecognized Channel keyword {keyword:?}"),
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write as _;

  fn parse(contents: &str) -> anyhow::Result<(Config, Vec<OpsSpec>)> {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    parse_config(file.path())
  }

  const SAMPLE: &str = r#"
# A typical two-store setup.
SyncState ~/.state/
BufferLimit 20M

IMAPAccount work
Host imap.example.com
Port 143
User me
PassCmd "pass show work"
TLSType STARTTLS
Timeout 20

IMAPStore work-remote
Account work
Trash Trash
MaxSize 1k

MaildirStore work-local
Path /tmp/mail
Flatten .

Channel work
Far :work-remote:
Near :work-local:
Patterns * !Trash
Sync All
Create Near
Expunge Both
MaxMessages 100
ExpireUnread no

Group everything
Channel work
"#;

  #[test]
  fn sample() {
    let (config, specs) = parse(SAMPLE).unwrap();
    assert_eq!(Some("~/.state/".to_string()), config.global.sync_state);
    assert_eq!(20 << 20, config.global.buffer_limit);

    let StoreDef::Imap(imap) = config.store("work-remote").unwrap() else { panic!() };
    assert_eq!("imap.example.com", imap.host);
    assert_eq!(143, imap.port);
    assert_eq!(TlsMode::StartTls, imap.tls);
    assert_eq!(Some(time::Duration::from_secs(20)), imap.timeout);
    assert_eq!(Some("Trash".to_string()), imap.store.trash);
    assert_eq!(1024, imap.store.max_size);

    let StoreDef::Maildir(maildir) = config.store("work-local").unwrap() else { panic!() };
    assert_eq!(path::Path::new("/tmp/mail"), maildir.path);

    let chan = config.channel("work").unwrap();
    assert_eq!(["work-remote", "work-local"], [chan.stores[F].as_str(), chan.stores[N].as_str()]);
    assert_eq!(vec!["*", "!Trash"], chan.patterns);
    assert!(chan.ops[F].contains(OpsMask::NEW | OpsMask::GONE | OpsMask::FLAGS));
    assert!(chan.ops[N].contains(OpsMask::CREATE));
    assert!(!chan.ops[F].contains(OpsMask::CREATE));
    assert!(chan.ops[F].contains(OpsMask::EXPUNGE));
    assert_eq!(100, chan.max_messages);
    assert_eq!(0, chan.expire_unread);
    assert!(specs[0].have_type && specs[0].have_create && specs[0].have_expunge);
    assert!(!specs[0].have_remove);

    assert_eq!(vec!["work"], config.group("everything").unwrap().channels);
  }

  #[test]
  fn legacy_keywords_still_parse() {
    let (config, _) = parse(
      "IMAPAccount a\nHost h\nUser u\nPass p\n\n\
       IMAPStore s\nAccount a\n\n\
       MaildirStore l\nPath /tmp/m\n\n\
       Channel c\nMaster :s:\nSlave :l:\nExpunge Slave\n",
    )
    .unwrap();
    let chan = config.channel("c").unwrap();
    assert_eq!("s", chan.stores[F]);
    assert_eq!("l", chan.stores[N]);
    assert!(chan.ops[N].contains(OpsMask::EXPUNGE));
    assert!(!chan.ops[F].contains(OpsMask::EXPUNGE));
  }

  #[test]
  fn unknown_keyword_is_fatal() {
    assert!(parse("Bogus x\n").is_err());
    assert!(parse("Channel c\nBogus x\n").is_err());
  }

  #[test]
  fn sync_op_vocabulary() {
    let ops = parse_sync_ops(&["Pull".to_string()]).unwrap();
    assert_eq!(OP_DFLT_TYPE, ops[N]);
    assert_eq!(OpsMask::NONE, ops[F]);

    let ops = parse_sync_ops(&["Flags".to_string()]).unwrap();
    assert_eq!(OpsMask::FLAGS, ops[F]);
    assert_eq!(OpsMask::FLAGS, ops[N]);

    let ops = parse_sync_ops(&["PullNew".to_string(), "PushFlags".to_string()]).unwrap();
    assert_eq!(OpsMask::NEW, ops[N]);
    assert_eq!(OpsMask::FLAGS, ops[F]);

    let ops = parse_sync_ops(&["All".to_string()]).unwrap();
    assert_eq!(OP_MASK_TYPE, ops[F]);
    assert_eq!(OP_MASK_TYPE, ops[N]);
  }

  #[test]
  fn sizes() {
    assert_eq!(512, parse_size("512").unwrap());
    assert_eq!(1024, parse_size("1k").unwrap());
    assert_eq!(2 << 20, parse_size("2M").unwrap());
    assert!(parse_size("x").is_err());
  }
}
