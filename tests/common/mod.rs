// Shared fixture for the integration tests: two Maildir stores in a temp
// directory wired into one channel, synchronized fully in-process.

use std::{fs, path};
use tandem::channel;
use tandem::driver::{Flags, StoreConf};
use tandem::maildir::{MaildirConf, MaildirStore};
use tandem::sync::{ChannelConf, OpsMask, Settings, Stats, F, N};

pub const DEFAULT_OPS: OpsMask = OpsMask(
  OpsMask::NEW.0 | OpsMask::UPGRADE.0 | OpsMask::GONE.0 | OpsMask::FLAGS.0,
);

pub struct Runner {
  pub dir: tempfile::TempDir,
  pub far_conf: StoreConf,
  pub near_conf: StoreConf,
  pub chan: ChannelConf,
  pub settings: Settings,
  pub stats: Stats,
}

pub fn email(id: &str) -> String {
  format!(
    "From: from@example.com\n\
     To: to@example.com\n\
     Message-ID: <{id}@test>\n\
     Subject: {id}\n\
     \n\
     body of {id}\n"
  )
}

pub fn email_sized(id: &str, size: usize) -> String {
  let mut message = email(id);
  while message.len() < size {
    message += "padding padding padding padding padding padding padding\n";
  }
  message
}

impl Runner {
  pub fn new() -> Self {
    let dir = tempfile::tempdir().unwrap();
    for side in ["far", "near"] {
      for sub in ["cur", "new", "tmp"] {
        fs::create_dir_all(dir.path().join(side).join(sub)).unwrap();
      }
    }
    let mut chan = ChannelConf::new("test", "far", "near");
    chan.ops = [DEFAULT_OPS; 2];
    let settings = Settings {
      state_dir: dir.path().join("state"),
      use_fsync: false,
      ..Settings::default()
    };
    Self {
      dir,
      far_conf: StoreConf::new("far"),
      near_conf: StoreConf::new("near"),
      chan,
      settings,
      stats: Stats::default(),
    }
  }

  pub fn root(&self, t: usize) -> path::PathBuf {
    self.dir.path().join(["far", "near"][t])
  }

  fn store(&self, t: usize) -> MaildirStore {
    let conf = MaildirConf {
      store: if t == F { self.far_conf.clone() } else { self.near_conf.clone() },
      path: self.root(t),
    };
    MaildirStore::new(conf, ["far", "near"][t])
  }

  /// Runs one full synchronization; returns the engine's result mask.
  pub fn sync(&mut self) -> u32 {
    self.try_sync().expect("sync failed fatally")
  }

  pub fn try_sync(&mut self) -> anyhow::Result<u32> {
    let mut far = self.store(F);
    let mut near = self.store(N);
    channel::sync_channel(
      [&mut far, &mut near],
      &self.chan,
      None,
      &self.settings,
      &mut self.stats,
    )
  }

  /// Drops a message file directly into the store, the way an MDA would.
  pub fn deliver(&self, t: usize, name: &str, contents: &str, flags: Flags) {
    let (sub, name) = if flags.is_empty() {
      ("new", name.to_string())
    } else {
      ("cur", format!("{name}:2,{flags}"))
    };
    fs::write(self.root(t).join(sub).join(name), contents).unwrap();
  }

  fn scan(&self, root: &path::Path) -> Vec<(u32, Flags, String)> {
    let mut messages = Vec::new();
    for sub in ["cur", "new"] {
      let dir = root.join(sub);
      let Ok(entries) = fs::read_dir(&dir) else { continue };
      for entry in entries {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') {
          continue;
        }
        let (rest, flags) = match name.rsplit_once(":2,") {
          Some((rest, flags)) => (rest.to_string(), Flags::parse(flags).0),
          None => (name, Flags::NONE),
        };
        let uid = match rest.rsplit_once(",U=") {
          Some((_, uid)) => uid.parse().unwrap_or(0),
          None => 0,
        };
        // X-TUID is a transport artifact; comparisons ignore it.
        let contents = fs::read_to_string(entry.path()).unwrap();
        let contents: String = contents
          .lines()
          .filter(|line| !line.starts_with("X-TUID: "))
          .map(|line| format!("{line}\n"))
          .collect();
        messages.push((uid, flags, contents));
      }
    }
    messages.sort_by(|a, b| (a.0, &a.2).cmp(&(b.0, &b.2)));
    messages
  }

  /// The mailbox contents as (uid, flags, contents-sans-X-TUID), UID-sorted.
  pub fn messages(&self, t: usize) -> Vec<(u32, Flags, String)> {
    self.scan(&self.root(t))
  }

  pub fn trash_messages(&self, t: usize, trash: &str) -> Vec<(u32, Flags, String)> {
    self.scan(&self.root(t).join(format!(".{trash}")))
  }

  pub fn subjects(&self, t: usize) -> Vec<(u32, String)> {
    self
      .messages(t)
      .into_iter()
      .map(|(uid, _, contents)| {
        let subject = contents
          .lines()
          .find_map(|line| line.strip_prefix("Subject: "))
          .unwrap_or("")
          .to_string();
        (uid, subject)
      })
      .collect()
  }

  /// Rewrites a message's maildir flags, like a mail client would.
  pub fn set_flags(&self, t: usize, uid: u32, flags: Flags) {
    let marker = format!(",U={uid}");
    for sub in ["cur", "new"] {
      let dir = self.root(t).join(sub);
      let Ok(entries) = fs::read_dir(&dir) else { continue };
      for entry in entries {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        let base = name.split(":2,").next().unwrap().to_string();
        if !base.ends_with(&marker) {
          continue;
        }
        let new_name =
          if flags.is_empty() { base } else { format!("{base}:2,{flags}") };
        let target_sub = if flags.is_empty() { "new" } else { "cur" };
        fs::rename(entry.path(), self.root(t).join(target_sub).join(new_name)).unwrap();
        return;
      }
    }
    panic!("no message with uid {uid}");
  }

  pub fn delete_message(&self, t: usize, uid: u32) {
    let marker = format!(",U={uid}");
    for sub in ["cur", "new"] {
      let dir = self.root(t).join(sub);
      let Ok(entries) = fs::read_dir(&dir) else { continue };
      for entry in entries {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        let base = name.split(":2,").next().unwrap();
        if base.ends_with(&marker) {
          fs::remove_file(entry.path()).unwrap();
          return;
        }
      }
    }
    panic!("no message with uid {uid}");
  }

  pub fn state_path(&self) -> path::PathBuf {
    self.settings.state_dir.join("far_INBOX-near_INBOX")
  }

  pub fn state(&self) -> String {
    fs::read_to_string(self.state_path()).unwrap_or_default()
  }

  /// The state with the (run-dependent) UIDVALIDITY header values elided.
  pub fn state_records(&self) -> String {
    self
      .state()
      .lines()
      .filter(|line| !line.contains("UidValidity "))
      .map(|line| format!("{line}\n"))
      .collect()
  }

  pub fn has_journal(&self) -> bool {
    self.state_path().with_extension("journal").exists()
  }
}
