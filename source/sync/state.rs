// Persistence for one mailbox pair: the committed state file, the write-ahead
// journal, the lock file, and TUID assignment/matching.
//
// The state file is the source of truth; the journal records uncommitted
// intent. Every entry is flushed before the operation it describes is
// dispatched, so replaying the journal over the previous state reconstructs
// the in-memory state at any interruption point.

use super::*;
use anyhow::Context as _;
use std::io::{BufRead as _, Write as _};

pub const JOURNAL_VERSION: &str = "5";

/// An ARC4-style keystream for TUID generation, seeded from the system's
/// random source at construction.
pub struct Arc4 {
  s: [u8; 256],
  i: u8,
  j: u8,
}

impl Arc4 {
  pub fn new() -> Self {
    let mut key = [0u8; 32];
    key[..16].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    key[16..].copy_from_slice(uuid::Uuid::new_v4().as_bytes());
    let mut s = [0u8; 256];
    for (i, slot) in s.iter_mut().enumerate() {
      *slot = i as u8;
    }
    let mut j = 0u8;
    for i in 0..256 {
      j = j.wrapping_add(s[i]).wrapping_add(key[i % key.len()]);
      s.swap(i, j as usize);
    }
    let mut this = Self { s, i: 0, j: 0 };
    // Drop the head of the stream, which is biased.
    for _ in 0..768 {
      this.byte();
    }
    this
  }

  pub fn byte(&mut self) -> u8 {
    self.i = self.i.wrapping_add(1);
    self.j = self.j.wrapping_add(self.s[self.i as usize]);
    self.s.swap(self.i as usize, self.j as usize);
    self.s[(self.s[self.i as usize].wrapping_add(self.s[self.j as usize])) as usize]
  }
}

/// Raised when the developer journal step limit is reached; surfaces as a
/// distinguished process exit so the replay test harness can interrupt runs
/// at every possible point.
#[derive(Debug)]
pub struct StepLimit;

impl fmt::Display for StepLimit {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "journaled step limit reached")
  }
}

impl std::error::Error for StepLimit {}

fn clean_name(name: &str) -> String {
  name.replace('/', "!")
}

fn parse_state_flags(line: &str, text: &str) -> anyhow::Result<(Status, Flags)> {
  let mut status = Status::NONE;
  let mut rest = text;
  if let Some(r) = rest.strip_prefix('<') {
    status |= Status::DUMMY_F;
    rest = r;
  } else if let Some(r) = rest.strip_prefix('>') {
    status |= Status::DUMMY_N;
    rest = r;
  }
  if let Some(r) = rest.strip_prefix('^') {
    status |= Status::SKIPPED;
    rest = r;
  } else if let Some(r) = rest.strip_prefix('~') {
    status |= Status::EXPIRE | Status::EXPIRED;
    rest = r;
  }
  let (flags, bad) = Flags::parse(rest);
  if let Some(bad) = bad {
    anyhow::bail!("unrecognized flag {bad:?} in sync state entry {line:?}");
  }
  Ok((status, flags))
}

impl<'a> SyncVars<'a> {
  pub(super) fn prepare_state(
    &mut self,
    near_box_path: Option<path::PathBuf>,
    store_names: [&str; 2],
  ) -> anyhow::Result<()> {
    let sync_state = self.chan.sync_state.as_deref();
    let dname = if sync_state == Some("*") {
      let path = near_box_path.with_context(|| {
        format!("store {} does not support in-box sync state", store_names[N])
      })?;
      path.join(".tandemstate")
    } else {
      let dir = match sync_state {
        Some(prefix) => path::PathBuf::from(prefix),
        None => self.settings.state_dir.clone(),
      };
      let file = format!(
        "{}_{}-{}_{}",
        store_names[F],
        clean_name(&self.box_name[F]),
        store_names[N],
        clean_name(&self.box_name[N]),
      );
      dir.join(file)
    };
    if let Some(parent) = dname.parent() {
      fs::create_dir_all(parent)
        .with_context(|| format!("cannot create sync state directory {parent:?}"))?;
    }
    self.jname = dname.with_extension("journal");
    self.nname = dname.with_extension("new");
    self.lname = dname.with_extension("lock");
    self.dname = dname;
    Ok(())
  }

  pub(super) fn lock_state(&mut self) -> anyhow::Result<()> {
    if self.lock.is_some() {
      return Ok(());
    }
    match fs::OpenOptions::new().write(true).create_new(true).open(&self.lname) {
      Ok(file) => {
        self.lock = Some(file);
        Ok(())
      }
      Err(error) if error.kind() == io::ErrorKind::AlreadyExists => anyhow::bail!(
        "channel {} (box {}) is locked; remove {:?} if no other sync is running",
        self.chan.name,
        self.box_name[N],
        self.lname
      ),
      Err(error) => {
        Err(error).with_context(|| format!("cannot create lock file {:?}", self.lname))
      }
    }
  }

  pub(super) fn unlock_state(&mut self) {
    if self.lock.take().is_some() {
      let _ = fs::remove_file(&self.lname);
    }
  }

  pub(super) fn load_state(&mut self) -> anyhow::Result<()> {
    let contents = match fs::File::open(&self.dname) {
      Ok(file) => {
        self.lock_state()?;
        Some(io::BufReader::new(file))
      }
      Err(error) if error.kind() == io::ErrorKind::NotFound => None,
      Err(error) => {
        Err(error).with_context(|| format!("cannot read sync state {:?}", self.dname))?
      }
    };
    if let Some(reader) = contents {
      log::debug!("reading sync state {:?}", self.dname);
      let dname = self.dname.clone();
      let mut in_header = true;
      for (index, line) in reader.lines().enumerate() {
        let line = line?;
        let context = format!("at {:?}:{}", dname, index + 1);
        if in_header {
          if line.is_empty() {
            in_header = false;
            continue;
          }
          let (key, value) = line
            .split_once(' ')
            .with_context(|| format!("malformed sync state header entry {context}"))?;
          let value: u32 = value
            .parse()
            .with_context(|| format!("malformed sync state header entry {context}"))?;
          match key {
            "FarUidValidity" | "MasterUidValidity" => self.uidval[F] = value,
            "NearUidValidity" | "SlaveUidValidity" => self.uidval[N] = value,
            "MaxPulledUid" => self.maxuid[F] = value,
            "MaxPushedUid" => self.maxuid[N] = value,
            "MaxExpiredFarUid" | "MaxExpiredMasterUid" => self.maxxfuid = value,
            _ => anyhow::bail!("unrecognized sync state header entry {context}"),
          }
        } else {
          let mut parts = line.splitn(3, ' ');
          let (uf, un, text) = (parts.next(), parts.next(), parts.next().unwrap_or(""));
          let (Some(uf), Some(un)) = (uf, un) else {
            anyhow::bail!("invalid sync state entry {context}");
          };
          let uid = [
            uf.parse().with_context(|| format!("invalid sync state entry {context}"))?,
            un.parse().with_context(|| format!("invalid sync state entry {context}"))?,
          ];
          let (status, flags) =
            parse_state_flags(&line, text).with_context(|| context.clone())?;
          log::debug!("  entry ({},{},{},{})", uid[F], uid[N], flags, status);
          self.srecs.push(SyncRec {
            uid,
            flags,
            pflags: Flags::NONE,
            aflags: [Flags::NONE; 2],
            dflags: [Flags::NONE; 2],
            status,
            tuid: None,
            msg: [None; 2],
          });
        }
      }
      anyhow::ensure!(!in_header, "unterminated sync state header in {:?}", self.dname);
      self.existing = true;
    }

    self.newmaxuid = self.maxuid;
    self.replay_journal()?;
    Ok(())
  }

  fn find_rec(&mut self, uf: u32, un: u32) -> Option<usize> {
    // Journal entries mostly refer to the record touched last, or one nearby.
    let n = self.srecs.len();
    for offset in 0..n {
      let index = (self.last_rec + offset) % n;
      if self.srecs[index].uid[F] == uf && self.srecs[index].uid[N] == un {
        self.last_rec = index;
        return Some(index);
      }
    }
    None
  }

  fn replay_journal(&mut self) -> anyhow::Result<()> {
    let file = match fs::File::open(&self.jname) {
      Ok(file) => file,
      Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
      Err(error) => Err(error).with_context(|| format!("cannot read journal {:?}", self.jname))?,
    };
    self.lock_state()?;
    // Only a journal accompanied by the placeholder for the new state file is
    // valid; its absence means the previous run never got to write anything.
    if !self.nname.exists() {
      return Ok(());
    }
    log::debug!("recovering journal {:?}", self.jname);
    let mut lines = io::BufReader::new(file).lines();
    match lines.next() {
      Some(version) => {
        let version = version?;
        anyhow::ensure!(
          version == JOURNAL_VERSION,
          "incompatible journal version (got {version}, expected {JOURNAL_VERSION}); \
           delete {:?} and resynchronize",
          self.jname
        );
      }
      None => return Ok(()),
    }
    let mut line_no = 1;
    for line in lines {
      let line = line?;
      line_no += 1;
      self
        .replay_entry(&line)
        .with_context(|| format!("invalid journal entry at {:?}:{line_no}", self.jname))?;
    }
    self.replayed = true;
    self.trashed[F].sort_unstable();
    self.trashed[N].sort_unstable();
    Ok(())
  }

  fn replay_entry(&mut self, line: &str) -> anyhow::Result<()> {
    anyhow::ensure!(line.len() >= 2 && line.as_bytes()[1] == b' ', "truncated entry");
    let op = line.as_bytes()[0];
    let fields: Vec<&str> = line[2..].split(' ').collect();
    let mut nums = fields.iter();
    let mut num = || -> anyhow::Result<u32> {
      nums.next().context("missing field")?.parse().context("malformed field")
    };
    match op {
      b'|' => {
        self.uidval[F] = num()?;
        self.uidval[N] = num()?;
        log::debug!("  UIDVALIDITYs now {}/{}", self.uidval[F], self.uidval[N]);
      }
      b'N' => {
        let t = num()? as usize;
        let uid = num()?;
        anyhow::ensure!(t < 2, "bad side");
        self.maxuid[t] = uid;
        self.newmaxuid[t] = uid;
      }
      b'F' => {
        let t = num()? as usize;
        anyhow::ensure!(t < 2, "bad side");
        self.finduid[t] = num()?;
      }
      b'T' => {
        let t = num()? as usize;
        anyhow::ensure!(t < 2, "bad side");
        let uid = num()?;
        self.trashed[t].push(uid);
      }
      b'+' => {
        let uid = [num()?, num()?];
        self.newmaxuid[F] = self.newmaxuid[F].max(uid[F]);
        self.newmaxuid[N] = self.newmaxuid[N].max(uid[N]);
        log::debug!("  new entry({},{})", uid[F], uid[N]);
        self.srecs.push(SyncRec {
          uid,
          flags: Flags::NONE,
          pflags: Flags::NONE,
          aflags: [Flags::NONE; 2],
          dflags: [Flags::NONE; 2],
          status: Status::PENDING,
          tuid: None,
          msg: [None; 2],
        });
        self.last_rec = self.srecs.len() - 1;
      }
      _ => {
        let uf = num()?;
        let un = num()?;
        let index = self
          .find_rec(uf, un)
          .context("entry refers to non-existing sync state entry")?;
        match op {
          b'-' => self.srecs[index].status = Status::DEAD,
          b'#' => {
            let tuid = fields.get(2).context("missing TUID")?;
            self.srecs[index].tuid = Some(tuid.parse().ok().context("malformed TUID")?);
          }
          b'&' => {
            // The TUID was lost; the record stays pending.
            self.srecs[index].tuid = None;
          }
          b'<' => {
            let uid = num()?;
            self.assign_uid(index, F, uid);
          }
          b'>' => {
            let uid = num()?;
            self.assign_uid(index, N, uid);
          }
          b'*' => self.srecs[index].flags = Flags(num()? as u8),
          b'%' => self.srecs[index].pflags = Flags(num()? as u8),
          b'$' => {
            let t = if self.srecs[index].uid[F] == 0 { F } else { N };
            self.srecs[index].aflags[t] = Flags(num()? as u8);
            self.srecs[index].dflags[t] = Flags(num()? as u8);
          }
          b'~' => {
            let status = Status(num()? as u16);
            let rec = &mut self.srecs[index];
            rec.status = (rec.status - Status::LOGGED) | status;
            if rec.status.contains(Status::EXPIRED) && self.maxxfuid < rec.uid[F] {
              self.maxxfuid = rec.uid[F];
            }
          }
          b'_' => {
            let rec = &mut self.srecs[index];
            rec.status = Status::PENDING
              | if rec.uid[F] == 0 { Status::DUMMY_F } else { Status::DUMMY_N };
          }
          b'^' => {
            let pflags = Flags(num()? as u8);
            let t = if self.srecs[index].status.contains(Status::DUMMY_F) { F } else { N };
            self.srecs[index].pflags = pflags;
            self.upgrade_rec(index, t);
          }
          b'P' => {
            let rec = &mut self.srecs[index];
            rec.aflags = [Flags::NONE; 2];
            rec.status = (rec.status - Status::PURGE) | Status::PURGED;
          }
          _ => anyhow::bail!("unrecognized journal entry {op:?}"),
        }
      }
    }
    Ok(())
  }

  fn create_state(&mut self) -> anyhow::Result<()> {
    // The mere existence of this file marks the journal as valid.
    fs::File::create(&self.nname)
      .with_context(|| format!("cannot create new sync state {:?}", self.nname))?;
    Ok(())
  }

  fn open_journal(&mut self) -> anyhow::Result<()> {
    if self.jfp.is_some() {
      return Ok(());
    }
    self.create_state()?;
    let mut options = fs::OpenOptions::new();
    options.write(true);
    if self.replayed {
      options.append(true);
    } else {
      options.create(true).truncate(true);
    }
    let mut jfp = options
      .open(&self.jname)
      .with_context(|| format!("cannot create journal {:?}", self.jname))?;
    if !self.replayed {
      jfp.write_all(JOURNAL_VERSION.as_bytes())?;
      jfp.write_all(b"\n")?;
    }
    self.jfp = Some(jfp);
    Ok(())
  }

  fn count_step(&mut self) -> anyhow::Result<()> {
    self.jcount += 1;
    if let Some(limit) = self.settings.max_journal_steps {
      if self.jcount > limit {
        return Err(anyhow::Error::new(StepLimit));
      }
    }
    Ok(())
  }

  /// Writes one journal entry; the write hits the disk before the operation
  /// it describes may be dispatched.
  pub(super) fn jlog(&mut self, entry: String, dbg: &str) -> anyhow::Result<()> {
    log::debug!("-> log: {entry} ({dbg})");
    self.open_journal()?;
    let jfp = self.jfp.as_mut().unwrap();
    jfp.write_all(entry.as_bytes())?;
    jfp.write_all(b"\n")?;
    jfp.flush()?;
    if self.settings.use_fsync {
      jfp.sync_data()?;
    }
    self.count_step()
  }

  /// Like jlog, but for operations that are only about to be committed
  /// anyway; these are journaled only when the replay test harness asks.
  pub(super) fn jlog_pc(&mut self, entry: String, dbg: &str) -> anyhow::Result<()> {
    if !self.settings.force_journal {
      log::debug!("-> (log: {entry}) ({dbg})");
      return Ok(());
    }
    self.jlog(entry, dbg)
  }

  pub(super) fn fsync_journal(&mut self) -> anyhow::Result<()> {
    if let Some(jfp) = self.jfp.as_mut() {
      if self.settings.use_fsync {
        jfp.sync_data()?;
      }
    }
    Ok(())
  }

  pub(super) fn save_state(&mut self) -> anyhow::Result<()> {
    // If no change was made, the state is also unmodified.
    if self.jfp.is_none() && !self.replayed {
      return Ok(());
    }
    if self.jfp.is_none() {
      self.create_state()?;
    }
    let mut contents = format!(
      "FarUidValidity {}\nNearUidValidity {}\nMaxPulledUid {}\nMaxPushedUid {}\n",
      self.uidval[F], self.uidval[N], self.maxuid[F], self.maxuid[N]
    );
    if self.maxxfuid != 0 {
      contents += &format!("MaxExpiredFarUid {}\n", self.maxxfuid);
    }
    contents.push('\n');
    for rec in &self.srecs {
      if rec.status.contains(Status::DEAD) {
        continue;
      }
      let dummy = if rec.status.contains(Status::DUMMY_F) {
        "<"
      } else if rec.status.contains(Status::DUMMY_N) {
        ">"
      } else {
        ""
      };
      let marker = if rec.status.contains(Status::SKIPPED) {
        "^"
      } else if rec.status.contains(Status::EXPIRED) {
        "~"
      } else {
        ""
      };
      contents += &format!("{} {} {}{}{}\n", rec.uid[F], rec.uid[N], dummy, marker, rec.flags);
    }
    let mut nfp = fs::File::create(&self.nname)
      .with_context(|| format!("cannot write new sync state {:?}", self.nname))?;
    nfp.write_all(contents.as_bytes())?;
    if self.settings.use_fsync {
      nfp.sync_all()?;
    }
    drop(nfp);
    self.jfp = None;
    if !self.settings.keep_journal {
      // Order is important!
      fs::rename(&self.nname, &self.dname)
        .with_context(|| format!("cannot commit sync state {:?}", self.dname))?;
      match fs::remove_file(&self.jname) {
        Ok(()) => (),
        Err(error) if error.kind() == io::ErrorKind::NotFound => (),
        Err(error) => log::warn!("cannot delete journal {:?}: {error}", self.jname),
      }
    }
    Ok(())
  }

  pub(super) fn delete_state(&mut self) -> anyhow::Result<()> {
    for name in [&self.nname, &self.jname, &self.dname] {
      match fs::remove_file(name) {
        Ok(()) => (),
        Err(error) if error.kind() == io::ErrorKind::NotFound => (),
        Err(error) => {
          self.ret |= SYNC_FAIL;
          return Err(error)
            .with_context(|| format!("channel {}: sync state cannot be deleted", self.chan.name));
        }
      }
    }
    Ok(())
  }

  pub(super) fn assign_uid(&mut self, index: usize, t: usize, uid: u32) {
    let rec = &mut self.srecs[index];
    rec.uid[t] = uid;
    if uid == self.newmaxuid[t] + 1 {
      self.newmaxuid[t] = uid;
    }
    if uid != 0 {
      if rec.status.contains(Status::UPGRADE) {
        rec.flags = (rec.flags | rec.aflags[t]) - rec.dflags[t];
        rec.aflags[t] = Flags::NONE;
        rec.dflags[t] = Flags::NONE;
      } else {
        rec.flags = rec.pflags;
      }
    }
    rec.status = rec.status - (Status::PENDING | Status::UPGRADE);
    rec.tuid = None;
  }

  pub(super) fn log_assign_uid(
    &mut self,
    index: usize,
    t: usize,
    uid: u32,
    dbg: &str,
  ) -> anyhow::Result<()> {
    let rec = &self.srecs[index];
    self.jlog(
      format!("{} {} {} {}", ['<', '>'][t], rec.uid[F], rec.uid[N], uid),
      dbg,
    )?;
    self.assign_uid(index, t, uid);
    Ok(())
  }

  pub(super) fn assign_tuid(&mut self, index: usize) -> anyhow::Result<()> {
    let mut tuid = [0u8; TUID_LEN];
    for slot in tuid.iter_mut() {
      let c = self.arc4.byte() & 0x3f;
      *slot = match c {
        0..=25 => c + b'A',
        26..=51 => c - 26 + b'a',
        52..=61 => c - 52 + b'0',
        62 => b'+',
        _ => b'/',
      };
    }
    let tuid = Tuid(tuid);
    self.srecs[index].tuid = Some(tuid);
    let rec = &self.srecs[index];
    self.jlog(format!("# {} {} {}", rec.uid[F], rec.uid[N], tuid), "new TUID")
  }

  /// Pairs pending records with just-stored messages recognized by their
  /// X-TUID header. Returns the number of records whose TUID went nowhere.
  pub(super) fn match_tuids(&mut self, t: usize, from: usize) -> anyhow::Result<u32> {
    let mut num_lost = 0;
    let mut next_candidate = from;
    for index in 0..self.srecs.len() {
      let rec = &self.srecs[index];
      if rec.status.contains(Status::DEAD) {
        continue;
      }
      let Some(tuid) = rec.tuid else { continue };
      if rec.uid[t] != 0 {
        continue;
      }
      log::debug!("pair({},{}) TUID {}", rec.uid[F], rec.uid[N], tuid);
      let mut found = None;
      for mi in next_candidate..self.msgs[t].len() {
        let msg = &self.msgs[t][mi];
        if msg.status.contains(MsgStatus::DEAD) {
          continue;
        }
        if msg.tuid == Some(tuid) {
          found = Some((mi, if mi == next_candidate { "adjacently" } else { "after gap" }));
          break;
        }
      }
      if found.is_none() {
        for mi in from..next_candidate {
          let msg = &self.msgs[t][mi];
          if msg.status.contains(MsgStatus::DEAD) {
            continue;
          }
          if msg.tuid == Some(tuid) {
            found = Some((mi, "after reset"));
            break;
          }
        }
      }
      match found {
        Some((mi, diag)) => {
          let uid = self.msgs[t][mi].uid;
          self.msgs[t][mi].srec = Some(index);
          self.srecs[index].msg[t] = Some(mi);
          next_candidate = mi + 1;
          self.log_assign_uid(index, t, uid, &format!("TUID matched {diag}"))?;
        }
        None => {
          let rec = &self.srecs[index];
          self.jlog(format!("& {} {}", rec.uid[F], rec.uid[N]), "TUID lost")?;
          // Note: the record remains pending.
          self.srecs[index].tuid = None;
          num_lost += 1;
        }
      }
    }
    Ok(num_lost)
  }

  /// Splits a placeholder record in two: the original becomes the pending
  /// upgrade towards the real message, and a new sibling record marks the
  /// placeholder itself for deletion.
  pub(super) fn upgrade_rec(&mut self, index: usize, t: usize) -> usize {
    let new_index = self.srecs.len();
    let rec = &mut self.srecs[index];
    let mut sibling = SyncRec {
      uid: [0; 2],
      flags: Flags::NONE,
      pflags: Flags::NONE,
      aflags: [Flags::NONE; 2],
      dflags: [Flags::NONE; 2],
      status: Status::NONE,
      tuid: None,
      msg: [None; 2],
    };
    // The placeholder moves to the sibling entry.
    sibling.uid[t] = rec.uid[t];
    rec.uid[t] = 0;
    sibling.msg[t] = rec.msg[t].take();
    // The original entry is upgraded, the placeholder marked for nuking.
    rec.status = (rec.status - (Status::DUMMY_F | Status::DUMMY_N))
      | Status::PENDING
      | Status::UPGRADE;
    sibling.status = Status::PURGE | (rec.status & (Status::DEL_F | Status::DEL_N));
    sibling.aflags[t] = Flags::DELETED;
    if let Some(mi) = sibling.msg[t] {
      self.msgs[t][mi].srec = Some(new_index);
    }
    self.srecs.push(sibling);
    new_index
  }
}
