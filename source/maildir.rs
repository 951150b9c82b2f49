// https://cr.yp.to/proto/maildir.html - Maildir
// https://www.courier-mta.org/imap/README.maildirquota.html - Maildir++
// https://doc.dovecot.org/admin_manual/mailbox_formats/maildir/ - Maildir Mailbox Format
//
// The on-disk store: a Maildir++ tree whose INBOX is the root and whose
// folders are dot-prefixed subdirectories. UIDs are native: every synced
// message carries a ",U=<uid>" marker in its file name, and a .uidvalidity
// file in each mailbox holds "<uidvalidity> <uidnext>". Flags live in the
// standard ":2," info suffix.

use crate::driver::{
  Caps, CloseResult, Driver, DriverError, ExpungeMode, FailState, Flags, ListMode, LoadResult,
  Message, MsgData, MsgStatus, OpenOptions, StoreConf, Tuid,
};
use anyhow::Context as _;
use std::{
  collections, fs,
  io::{self, Read as _, Write as _},
  path, time,
};

#[derive(Clone, Debug)]
pub struct MaildirConf {
  pub store: StoreConf,
  pub path: path::PathBuf,
}

fn folder_directory(root: &path::Path, name: &str) -> (path::PathBuf, bool) {
  if name == "INBOX" {
    // ~/Maildir/{cur,new,tmp} hold the INBOX itself.
    (root.to_path_buf(), true)
  } else {
    // folder/subfolder flattens to .folder.subfolder.
    (root.join(format!(".{}", name.replace('/', "."))), false)
  }
}

#[derive(Debug, PartialEq)]
struct FileName<'a> {
  base: &'a str,
  uid: u32,
  flags: Flags,
}

fn parse_file_name(name: &str) -> FileName<'_> {
  let (rest, flags) = match name.rsplit_once(":2,") {
    Some((rest, suffix)) => (rest, Flags::parse(suffix).0),
    None => (name, Flags::NONE),
  };
  let (base, uid) = match rest.rsplit_once(",U=") {
    Some((base, uid)) => match uid.parse() {
      Ok(uid) => (base, uid),
      Err(_) => (rest, 0),
    },
    None => (rest, 0),
  };
  FileName { base, uid, flags }
}

fn build_file_name(base: &str, uid: u32, flags: Flags) -> String {
  let mut name = base.to_string();
  if uid > 0 {
    name += &format!(",U={uid}");
  }
  if !flags.is_empty() {
    name += &format!(":2,{flags}");
  }
  name
}

/// Returns the header section (up to and including the line before the first
/// empty line) of a message.
fn read_headers(bytes: &[u8]) -> &[u8] {
  match memchr::memmem::find(bytes, b"\n\n") {
    Some(index) => &bytes[..index + 1],
    None => match memchr::memmem::find(bytes, b"\n\r\n") {
      Some(index) => &bytes[..index + 1],
      None => bytes,
    },
  }
}

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

pub struct MaildirStore {
  conf: MaildirConf,
  label: String,
  selected: Option<String>,
  dir: Option<path::PathBuf>,
  uidvalidity: u32,
  uidnext: u32,
  paths: collections::HashMap<u32, path::PathBuf>,
  flags: collections::HashMap<u32, Flags>,
  expunged: Vec<u32>,
  load_opts: OpenOptions,
}

impl MaildirStore {
  pub fn new(conf: MaildirConf, label: &str) -> Self {
    Self {
      conf,
      label: label.to_string(),
      selected: None,
      dir: None,
      uidvalidity: 0,
      uidnext: 0,
      paths: collections::HashMap::new(),
      flags: collections::HashMap::new(),
      expunged: Vec::new(),
      load_opts: OpenOptions::NONE,
    }
  }

  fn dir(&self) -> &path::Path {
    self.dir.as_deref().expect("no box open")
  }

  fn validity_path(dir: &path::Path) -> path::PathBuf {
    dir.join(".uidvalidity")
  }

  fn read_validity(dir: &path::Path) -> anyhow::Result<Option<(u32, u32)>> {
    let path = Self::validity_path(dir);
    let contents = match fs::read_to_string(&path) {
      Ok(contents) => contents,
      Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
      Err(error) => Err(error).with_context(|| format!("cannot read {path:?}"))?,
    };
    let mut parts = contents.split_whitespace();
    let uidvalidity = parts.next().and_then(|p| p.parse().ok());
    let uidnext = parts.next().and_then(|p| p.parse().ok());
    match (uidvalidity, uidnext) {
      (Some(uidvalidity), Some(uidnext)) => Ok(Some((uidvalidity, uidnext))),
      _ => anyhow::bail!("malformed UID validity file {path:?}"),
    }
  }

  fn write_validity(dir: &path::Path, uidvalidity: u32, uidnext: u32) -> anyhow::Result<()> {
    let path = Self::validity_path(dir);
    let mut file = fs::File::create(&path).with_context(|| format!("cannot write {path:?}"))?;
    file.write_all(format!("{uidvalidity} {uidnext}\n").as_bytes())?;
    file.sync_all()?;
    Ok(())
  }

  fn bump_uidnext(&mut self) -> anyhow::Result<u32> {
    let uid = self.uidnext;
    self.uidnext += 1;
    let dir = self.dir().to_path_buf();
    Self::write_validity(&dir, self.uidvalidity, self.uidnext)?;
    Ok(uid)
  }

  fn make_maildir(dir: &path::Path, root: bool) -> anyhow::Result<()> {
    for sub in ["cur", "new", "tmp"] {
      fs::create_dir_all(dir.join(sub))?;
    }
    if !root {
      // The marker tells delivery agents this is a folder of a Maildir++.
      fs::File::create(dir.join("maildirfolder"))?;
    }
    Ok(())
  }

  fn scan_files(dir: &path::Path) -> anyhow::Result<Vec<(path::PathBuf, bool)>> {
    let mut files = Vec::new();
    for (sub, recent) in [("cur", false), ("new", true)] {
      let sub = dir.join(sub);
      for entry in fs::read_dir(&sub).with_context(|| format!("cannot list {sub:?}"))? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
          continue;
        }
        if entry.file_name().to_string_lossy().starts_with('.') {
          continue;
        }
        files.push((entry.path(), recent));
      }
    }
    Ok(files)
  }

  /// Gives every unnumbered message a fresh UID, renaming it in place.
  fn assign_uids(&mut self, files: &mut [(path::PathBuf, bool)]) -> anyhow::Result<()> {
    let mut unnumbered: Vec<usize> = Vec::new();
    for (index, (path, _)) in files.iter().enumerate() {
      let name = path.file_name().unwrap().to_string_lossy().into_owned();
      if parse_file_name(&name).uid == 0 {
        unnumbered.push(index);
      }
    }
    // Oldest first, name as the tie breaker, so repeated runs agree.
    unnumbered.sort_by_key(|&index| {
      let (path, _) = &files[index];
      let mtime = fs::metadata(path).and_then(|m| m.modified()).ok();
      (mtime, path.clone())
    });
    for index in unnumbered {
      let uid = self.bump_uidnext()?;
      let (path, _) = &files[index];
      let name = path.file_name().unwrap().to_string_lossy().into_owned();
      let parsed = parse_file_name(&name);
      let renamed = path.with_file_name(build_file_name(parsed.base, uid, parsed.flags));
      fs::rename(path, &renamed).with_context(|| format!("cannot rename {path:?}"))?;
      files[index].0 = renamed;
    }
    Ok(())
  }

  fn trash_dir(&mut self) -> crate::driver::Result<path::PathBuf> {
    let trash = self
      .conf
      .store
      .trash
      .clone()
      .ok_or_else(|| DriverError::mailbox(anyhow::anyhow!("store has no trash configured")))?;
    let (dir, root) = folder_directory(&self.conf.path, &trash);
    Self::make_maildir(&dir, root).map_err(DriverError::mailbox)?;
    Ok(dir)
  }

  fn message_path(&mut self, uid: u32) -> crate::driver::Result<path::PathBuf> {
    match self.paths.get(&uid) {
      Some(path) if path.exists() => Ok(path.clone()),
      Some(path) => {
        log::debug!("{}: message {uid} vanished from {path:?}", self.label);
        self.paths.remove(&uid);
        self.expunged.push(uid);
        Err(DriverError::message(anyhow::anyhow!("message {uid} is gone")))
      }
      None => Err(DriverError::message(anyhow::anyhow!("unknown message {uid}"))),
    }
  }

  fn write_tmp(&self, dir: &path::Path, bytes: &[u8]) -> anyhow::Result<path::PathBuf> {
    // A unique name that doesn't need parsing later; IDs are never data.
    let name = uuid::Uuid::new_v4().hyphenated().to_string();
    let path = dir.join("tmp").join(name);
    let mut file = fs::File::create(&path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(path)
  }
}

impl Driver for MaildirStore {
  fn caps(&self) -> Caps {
    // Messages are stored with bare LF line endings.
    Caps::NONE
  }

  fn conf(&self) -> &StoreConf {
    &self.conf.store
  }

  fn fail_state(&self) -> FailState {
    FailState::Temp
  }

  fn connect(&mut self) -> crate::driver::Result<()> {
    fs::create_dir_all(&self.conf.path)
      .with_context(|| format!("cannot create maildir root {:?}", self.conf.path))
      .map_err(DriverError::store)
  }

  fn list(&mut self, mode: ListMode) -> crate::driver::Result<Vec<String>> {
    let mut boxes = Vec::new();
    if matches!(mode, ListMode::Inbox | ListMode::Both) {
      boxes.push("INBOX".to_string());
    }
    if matches!(mode, ListMode::Path | ListMode::Both) {
      let entries = fs::read_dir(&self.conf.path)
        .with_context(|| format!("cannot list {:?}", self.conf.path))
        .map_err(DriverError::store)?;
      for entry in entries {
        let entry = entry.map_err(|e| DriverError::store(anyhow::Error::from(e)))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(folder) = name.strip_prefix('.') else { continue };
        if folder.is_empty() || !entry.path().is_dir() {
          continue;
        }
        boxes.push(folder.replace('.', "/"));
      }
    }
    boxes.sort();
    boxes.dedup();
    Ok(boxes)
  }

  fn select(&mut self, name: &str) -> crate::driver::Result<()> {
    if name.eq_ignore_ascii_case("INBOX") && name != "INBOX" {
      return Err(DriverError::mailbox(anyhow::anyhow!("mailbox {name} is ambiguous with INBOX")));
    }
    self.selected = Some(name.to_string());
    self.dir = None;
    Ok(())
  }

  fn box_path(&self) -> Option<path::PathBuf> {
    self
      .selected
      .as_ref()
      .map(|name| folder_directory(&self.conf.path, name).0)
  }

  fn create_box(&mut self) -> crate::driver::Result<()> {
    let name = self.selected.clone().expect("no box selected");
    let (dir, root) = folder_directory(&self.conf.path, &name);
    Self::make_maildir(&dir, root).map_err(DriverError::mailbox)
  }

  fn open_box(&mut self) -> crate::driver::Result<Option<u32>> {
    let name = self.selected.clone().expect("no box selected");
    let (dir, _) = folder_directory(&self.conf.path, &name);
    if !dir.join("cur").is_dir() {
      return Ok(None);
    }
    for sub in ["new", "tmp"] {
      fs::create_dir_all(dir.join(sub)).map_err(|e| DriverError::mailbox(anyhow::Error::from(e)))?;
    }
    let (uidvalidity, uidnext) = match Self::read_validity(&dir).map_err(DriverError::mailbox)? {
      Some(pair) => pair,
      None => {
        let uidvalidity = time::SystemTime::now()
          .duration_since(time::UNIX_EPOCH)
          .map(|d| d.as_secs() as u32)
          .unwrap_or(1);
        Self::write_validity(&dir, uidvalidity, 1).map_err(DriverError::mailbox)?;
        (uidvalidity, 1)
      }
    };
    self.dir = Some(dir);
    self.uidvalidity = uidvalidity;
    self.uidnext = uidnext;
    self.paths.clear();
    self.flags.clear();
    Ok(Some(uidvalidity))
  }

  fn confirm_box_empty(&mut self) -> crate::driver::Result<bool> {
    let dir = self.dir().to_path_buf();
    let files = Self::scan_files(&dir).map_err(DriverError::mailbox)?;
    Ok(files.is_empty())
  }

  fn delete_box(&mut self) -> crate::driver::Result<()> {
    let dir = self.dir().to_path_buf();
    for sub in ["cur", "new", "tmp"] {
      match fs::remove_dir_all(dir.join(sub)) {
        Ok(()) => (),
        Err(error) if error.kind() == io::ErrorKind::NotFound => (),
        Err(error) => return Err(DriverError::mailbox(anyhow::Error::from(error))),
      }
    }
    for file in [".uidvalidity", "maildirfolder"] {
      match fs::remove_file(dir.join(file)) {
        Ok(()) => (),
        Err(error) if error.kind() == io::ErrorKind::NotFound => (),
        Err(error) => return Err(DriverError::mailbox(anyhow::Error::from(error))),
      }
    }
    self.dir = None;
    Ok(())
  }

  fn finish_delete_box(&mut self) -> crate::driver::Result<()> {
    let name = self.selected.clone().expect("no box selected");
    let (dir, root) = folder_directory(&self.conf.path, &name);
    if !root {
      // Leftovers (e.g. subfolders) keep the directory alive; that's fine.
      let _ = fs::remove_dir(dir);
    }
    Ok(())
  }

  fn prepare_load(&mut self, opts: OpenOptions) -> OpenOptions {
    // Flags ride along in the file names, so they are always known.
    let granted = opts | OpenOptions::FLAGS;
    self.load_opts = granted;
    granted
  }

  fn load_box(
    &mut self,
    minuid: u32,
    maxuid: u32,
    finduid: u32,
    pairuid: u32,
    _newuid: u32,
    excs: &[u32],
  ) -> crate::driver::Result<LoadResult> {
    let dir = self.dir().to_path_buf();
    let mut files = Self::scan_files(&dir).map_err(DriverError::mailbox)?;
    self.assign_uids(&mut files).map_err(DriverError::mailbox)?;
    self.paths.clear();
    self.flags.clear();
    let mut result = LoadResult::default();
    for (path, recent) in files {
      let name = path.file_name().unwrap().to_string_lossy().into_owned();
      let parsed = parse_file_name(&name);
      let (uid, flags) = (parsed.uid, parsed.flags);
      self.paths.insert(uid, path.clone());
      self.flags.insert(uid, flags);
      result.total += 1;
      if recent {
        result.recent += 1;
      }
      if !((uid >= minuid && uid <= maxuid) || excs.contains(&uid)) {
        continue;
      }
      let mut msg = Message::new(uid);
      msg.flags = flags;
      msg.status |= MsgStatus::FLAGS;
      if recent {
        msg.status |= MsgStatus::RECENT;
      }
      let wants_tuid = self.load_opts.contains(OpenOptions::FIND) && finduid > 0 && uid >= finduid;
      let wants_msgid = self.load_opts.contains(OpenOptions::PAIRED_IDS) && uid <= pairuid;
      if self.load_opts.intersects(OpenOptions::OLD_SIZE | OpenOptions::NEW_SIZE) {
        match fs::metadata(&path) {
          Ok(metadata) => msg.size = metadata.len().min(u32::MAX as u64) as u32,
          Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
          Err(error) => return Err(DriverError::mailbox(anyhow::Error::from(error))),
        }
      }
      if wants_tuid || wants_msgid {
        let mut bytes = Vec::new();
        match fs::File::open(&path).and_then(|mut file| file.read_to_end(&mut bytes)) {
          Ok(_) => (),
          Err(error) if error.kind() == io::ErrorKind::NotFound => continue,
          Err(error) => return Err(DriverError::mailbox(anyhow::Error::from(error))),
        }
        let headers = read_headers(&bytes);
        if wants_tuid {
          if let Some(tuid) = header_value(headers, "X-TUID") {
            if tuid.len() == crate::driver::TUID_LEN {
              let mut raw = [0; crate::driver::TUID_LEN];
              raw.copy_from_slice(&tuid);
              msg.tuid = Some(Tuid(raw));
            }
          }
        }
        if wants_msgid {
          if let Some(msgid) = header_value(headers, "Message-ID") {
            msg.msgid = Some(String::from_utf8_lossy(&msgid).into_owned());
          }
        }
      }
      result.msgs.push(msg);
    }
    result.msgs.sort_by_key(|msg| msg.uid);
    Ok(result)
  }

  fn uid_next(&self) -> u32 {
    self.uidnext
  }

  fn supported_flags(&self) -> Flags {
    Flags::ALL
  }

  fn fetch_msg(&mut self, uid: u32, wants_date: bool, minimal: bool) -> crate::driver::Result<MsgData> {
    let path = self.message_path(uid)?;
    let bytes = match fs::read(&path) {
      Ok(bytes) => bytes,
      Err(error) if error.kind() == io::ErrorKind::NotFound => {
        self.paths.remove(&uid);
        self.expunged.push(uid);
        return Err(DriverError::message(anyhow::anyhow!("message {uid} is gone")));
      }
      Err(error) => return Err(DriverError::mailbox(anyhow::Error::from(error))),
    };
    let bytes = if minimal { read_headers(&bytes).to_vec() } else { bytes };
    let date = if wants_date {
      fs::metadata(&path).and_then(|m| m.modified()).ok()
    } else {
      None
    };
    Ok(MsgData {
      bytes,
      flags: self.flags.get(&uid).copied().unwrap_or(Flags::NONE),
      date,
    })
  }

  fn store_msg(&mut self, data: &MsgData, to_trash: bool) -> crate::driver::Result<u32> {
    let dir = if to_trash { self.trash_dir()? } else { self.dir().to_path_buf() };
    let tmp = self.write_tmp(&dir, &data.bytes).map_err(DriverError::mailbox)?;
    if let Some(date) = data.date {
      if let Ok(file) = fs::File::options().write(true).open(&tmp) {
        let _ = file.set_modified(date);
      }
    }
    let base = tmp.file_name().unwrap().to_string_lossy().into_owned();
    let uid = if to_trash { 0 } else { self.bump_uidnext().map_err(DriverError::mailbox)? };
    let sub = if data.flags.is_empty() { "new" } else { "cur" };
    let target = dir.join(sub).join(build_file_name(&base, uid, data.flags));
    fs::rename(&tmp, &target).map_err(|e| DriverError::mailbox(anyhow::Error::from(e)))?;
    if !to_trash {
      self.paths.insert(uid, target);
      self.flags.insert(uid, data.flags);
    }
    Ok(uid)
  }

  fn find_new_msgs(&mut self, newuid: u32) -> crate::driver::Result<Vec<Message>> {
    let dir = self.dir().to_path_buf();
    let mut files = Self::scan_files(&dir).map_err(DriverError::mailbox)?;
    self.assign_uids(&mut files).map_err(DriverError::mailbox)?;
    let mut found = Vec::new();
    for (path, _) in files {
      let name = path.file_name().unwrap().to_string_lossy().into_owned();
      let parsed = parse_file_name(&name);
      if parsed.uid < newuid {
        continue;
      }
      let mut msg = Message::new(parsed.uid);
      msg.flags = parsed.flags;
      msg.status |= MsgStatus::FLAGS;
      if let Ok(bytes) = fs::read(&path) {
        if let Some(tuid) = header_value(read_headers(&bytes), "X-TUID") {
          if tuid.len() == crate::driver::TUID_LEN {
            let mut raw = [0; crate::driver::TUID_LEN];
            raw.copy_from_slice(&tuid);
            msg.tuid = Some(Tuid(raw));
          }
        }
      }
      found.push(msg);
    }
    found.sort_by_key(|msg| msg.uid);
    Ok(found)
  }

  fn set_msg_flags(&mut self, uid: u32, add: Flags, del: Flags) -> crate::driver::Result<()> {
    let path = self.message_path(uid)?;
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    let parsed = parse_file_name(&name);
    let flags = (parsed.flags | add) - del;
    let base = parsed.base.to_string();
    // The info suffix encodes the flags; flagged messages live in cur.
    let sub = if flags.is_empty() { "new" } else { "cur" };
    let target = path
      .parent()
      .unwrap()
      .parent()
      .unwrap()
      .join(sub)
      .join(build_file_name(&base, uid, flags));
    match fs::rename(&path, &target) {
      Ok(()) => {
        self.paths.insert(uid, target);
        self.flags.insert(uid, flags);
        Ok(())
      }
      Err(error) if error.kind() == io::ErrorKind::NotFound => {
        self.paths.remove(&uid);
        self.expunged.push(uid);
        Err(DriverError::message(anyhow::anyhow!("message {uid} is gone")))
      }
      Err(error) => Err(DriverError::mailbox(anyhow::Error::from(error))),
    }
  }

  fn trash_msg(&mut self, uid: u32) -> crate::driver::Result<()> {
    let trash = self.trash_dir()?;
    let path = self.message_path(uid)?;
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    let parsed = parse_file_name(&name);
    // The trash has its own UID space; drop ours.
    let target = trash.join("cur").join(build_file_name(parsed.base, 0, parsed.flags));
    match fs::rename(&path, &target) {
      Ok(()) => Ok(()),
      Err(error) if error.kind() == io::ErrorKind::NotFound => {
        self.paths.remove(&uid);
        self.expunged.push(uid);
        Err(DriverError::message(anyhow::anyhow!("message {uid} is gone")))
      }
      Err(error) => Err(DriverError::mailbox(anyhow::Error::from(error))),
    }
  }

  fn commit_cmds(&mut self) -> crate::driver::Result<Vec<u32>> {
    Ok(Vec::new())
  }

  fn cancel_cmds(&mut self) {}

  fn close_box(&mut self, mode: ExpungeMode) -> crate::driver::Result<CloseResult> {
    let result = match mode {
      ExpungeMode::None => CloseResult { reported: false, expunged: Vec::new() },
      ExpungeMode::Sweep => {
        let uids: Vec<u32> = self
          .flags
          .iter()
          .filter(|(_, flags)| flags.contains(Flags::DELETED))
          .map(|(&uid, _)| uid)
          .collect();
        let mut expunged = Vec::new();
        for uid in uids {
          if let Some(path) = self.paths.remove(&uid) {
            match fs::remove_file(&path) {
              Ok(()) => expunged.push(uid),
              Err(error) if error.kind() == io::ErrorKind::NotFound => expunged.push(uid),
              Err(error) => return Err(DriverError::mailbox(anyhow::Error::from(error))),
            }
          }
        }
        CloseResult { reported: true, expunged }
      }
      ExpungeMode::Uids(uids) => {
        let mut expunged = Vec::new();
        for uid in uids {
          if let Some(path) = self.paths.remove(&uid) {
            match fs::remove_file(&path) {
              Ok(()) => expunged.push(uid),
              Err(error) if error.kind() == io::ErrorKind::NotFound => expunged.push(uid),
              Err(error) => return Err(DriverError::mailbox(anyhow::Error::from(error))),
            }
          }
        }
        CloseResult { reported: true, expunged }
      }
    };
    self.dir = None;
    self.selected = None;
    Ok(result)
  }

  fn drain_expunged(&mut self) -> Vec<u32> {
    std::mem::take(&mut self.expunged)
  }

  fn cleanup(&mut self) {}
}

#[cfg(test)]
mod tests {
  use super::*;
  use pretty_assertions::assert_eq;

  #[test]
  fn file_names() {
    assert_eq!(
      FileName { base: "1678901234.abc", uid: 0, flags: Flags::NONE },
      parse_file_name("1678901234.abc")
    );
    assert_eq!(
      FileName { base: "1678901234.abc", uid: 17, flags: Flags::FLAGGED | Flags::SEEN },
      parse_file_name("1678901234.abc,U=17:2,FS")
    );
    assert_eq!(FileName { base: "x", uid: 3, flags: Flags::NONE }, parse_file_name("x,U=3:2,"));
    assert_eq!("x,U=3:2,FS", build_file_name("x", 3, Flags::FLAGGED | Flags::SEEN));
    assert_eq!("x", build_file_name("x", 0, Flags::NONE));
  }

  #[test]
  fn folder_directories() {
    let root = path::Path::new("/mail");
    assert_eq!((path::PathBuf::from("/mail"), true), folder_directory(root, "INBOX"));
    assert_eq!((path::PathBuf::from("/mail/.folder"), false), folder_directory(root, "folder"));
    assert_eq!(
      (path::PathBuf::from("/mail/.folder.sub"), false),
      folder_directory(root, "folder/sub")
    );
  }

  #[test]
  fn headers() {
    let bytes = b"Subject: x\nX-TUID: AbCdEfGhIjKl\n\nbody\n";
    assert_eq!(&b"Subject: x\nX-TUID: AbCdEfGhIjKl\n"[..], read_headers(bytes));
    assert_eq!(Some(b"AbCdEfGhIjKl".to_vec()), header_value(read_headers(bytes), "X-TUID"));
  }

  fn test_store(directory: &path::Path) -> MaildirStore {
    let conf = MaildirConf { store: StoreConf::new("test"), path: directory.to_path_buf() };
    let mut store = MaildirStore::new(conf, "near");
    store.connect().unwrap();
    store.select("INBOX").unwrap();
    store.create_box().unwrap();
    assert!(store.open_box().unwrap().is_some());
    store
  }

  #[test]
  fn store_load_round_trip() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut store = test_store(directory.path());
    store.prepare_load(OpenOptions::NEW | OpenOptions::NEW_SIZE);

    let data = MsgData { bytes: b"Subject: hi\n\nbody\n".to_vec(), flags: Flags::SEEN, date: None };
    let uid = store.store_msg(&data, false).unwrap();
    assert_eq!(1, uid);
    assert_eq!(2, store.uid_next());

    let loaded = store.load_box(1, u32::MAX, 0, 0, 0, &[]).unwrap();
    assert_eq!(1, loaded.msgs.len());
    assert_eq!(1, loaded.msgs[0].uid);
    assert_eq!(Flags::SEEN, loaded.msgs[0].flags);
    assert_eq!(data.bytes.len() as u32, loaded.msgs[0].size);

    store.set_msg_flags(1, Flags::FLAGGED, Flags::NONE).unwrap();
    let fetched = store.fetch_msg(1, false, false).unwrap();
    assert_eq!(data.bytes, fetched.bytes);
    assert_eq!(Flags::FLAGGED | Flags::SEEN, fetched.flags);

    Ok(())
  }

  #[test]
  fn adopts_unnumbered_messages() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut store = test_store(directory.path());
    store.prepare_load(OpenOptions::NEW);

    // A message delivered by an MDA, with no UID marker yet.
    fs::write(directory.path().join("new").join("delivered"), b"Subject: x\n\nbody\n")?;

    let loaded = store.load_box(1, u32::MAX, 0, 0, 0, &[]).unwrap();
    assert_eq!(1, loaded.msgs.len());
    assert_eq!(1, loaded.msgs[0].uid);
    assert!(loaded.msgs[0].status.contains(MsgStatus::RECENT));
    assert_eq!(2, store.uid_next());

    // The marker is durable.
    let loaded = store.load_box(1, u32::MAX, 0, 0, 0, &[]).unwrap();
    assert_eq!(1, loaded.msgs.len());
    assert_eq!(1, loaded.msgs[0].uid);
    Ok(())
  }

  #[test]
  fn expunges_exact_uid_sets() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut store = test_store(directory.path());
    store.prepare_load(OpenOptions::NEW);
    for i in 0..3 {
      let data = MsgData {
        bytes: format!("Subject: {i}\n\nbody\n").into_bytes(),
        flags: Flags::DELETED,
        date: None,
      };
      store.store_msg(&data, false).unwrap();
    }
    store.load_box(1, u32::MAX, 0, 0, 0, &[]).unwrap();
    let close = store.close_box(ExpungeMode::Uids(vec![2])).unwrap();
    assert!(close.reported);
    assert_eq!(vec![2], close.expunged);

    let mut store = test_store(directory.path());
    store.prepare_load(OpenOptions::NEW);
    let loaded = store.load_box(1, u32::MAX, 0, 0, 0, &[]).unwrap();
    assert_eq!(vec![1, 3], loaded.msgs.iter().map(|m| m.uid).collect::<Vec<_>>());
    Ok(())
  }
}
