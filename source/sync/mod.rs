// The synchronization engine: pairs up the messages of one mailbox on each
// side of a channel, plans per-record actions, and drives the drivers through
// flag propagation, new-message propagation, trashing and expunging, with
// every state change journaled before the operation that realizes it.
//
// Operation dependencies, which the step order below implements:
//   select(x); load(x): select(x)
//   new(F), new(N), flags(F), flags(N): load(F) & load(N)
//   find_new(x): new(x); trash(x): flags(x)
//   close(x): trash(x) & flags(!x) & find_new(x) & new(!x)
//   commit: close(F) & close(N)

use crate::driver::{
  bit_set, Driver, DriverError, ErrorKind, ExpungeMode, Flags, Message, MsgStatus, OpenOptions,
  Tuid, TUID_LEN,
};
use std::{collections, fmt, fs, io, path};

pub mod convert;
pub mod state;

use state::Arc4;

pub const F: usize = 0; // far side
pub const N: usize = 1; // near side

pub const SYNC_OK: u32 = 0;
pub const SYNC_FAIL: u32 = 1;

pub fn sync_bad(t: usize) -> u32 {
  4 << t
}

pub const UIDVAL_BAD: u32 = u32::MAX;

pub fn side_name(t: usize) -> &'static str {
  ["far side", "near side"][t]
}

pub fn dir_name(t: usize) -> &'static str {
  ["push", "pull"][t]
}

// Per-channel, per-side operation switches.
bit_set!(OpsMask, u16,
  (NEW, 'n'),
  (OLD, 'o'),
  (UPGRADE, 'u'),
  (GONE, 'g'),
  (FLAGS, 'f'),
  (EXPUNGE, 'x'),
  (CREATE, 'c'),
  (REMOVE, 'r'),
);

// Sync record status. The low bits are the persistent subset written to the
// journal; their order is load-bearing for the journal format.
bit_set!(Status, u16,
  (DEAD, 'D'),
  (EXPIRE, 'e'),
  (EXPIRED, 'E'),
  (NEXPIRE, 'x'),
  (PENDING, 'P'),
  (DUMMY_F, '<'),
  (DUMMY_N, '>'),
  (SKIPPED, '^'),
  (GONE_F, 'f'),
  (GONE_N, 'n'),
  (DEL_F, 'd'),
  (DEL_N, 'b'),
  (DELETE, 'T'),
  (UPGRADE, 'U'),
  (PURGE, 'p'),
  (PURGED, 'q'),
);

impl Status {
  pub const LOGGED: Status = Status(
    Status::EXPIRE.0
      | Status::EXPIRED.0
      | Status::PENDING.0
      | Status::DUMMY_F.0
      | Status::DUMMY_N.0
      | Status::SKIPPED.0,
  );

  pub fn dummy(t: usize) -> Status {
    [Status::DUMMY_F, Status::DUMMY_N][t]
  }

  pub fn gone(t: usize) -> Status {
    [Status::GONE_F, Status::GONE_N][t]
  }

  pub fn del(t: usize) -> Status {
    [Status::DEL_F, Status::DEL_N][t]
  }
}

/// The persistent pairing entity; one per (ever-known) message pair.
#[derive(Debug)]
pub struct SyncRec {
  pub uid: [u32; 2],
  /// Last-agreed flag state.
  pub flags: Flags,
  /// Flags with which the about-to-be-copied message will be stored.
  pub pflags: Flags,
  /// In-flight flag additions/removals per side.
  pub aflags: [Flags; 2],
  pub dflags: [Flags; 2],
  pub status: Status,
  pub tuid: Option<Tuid>,
  pub msg: [Option<usize>; 2],
}

#[derive(Clone, Debug)]
pub struct ChannelConf {
  pub name: String,
  pub stores: [String; 2],
  pub boxes: [Option<String>; 2],
  pub patterns: Vec<String>,
  pub ops: [OpsMask; 2],
  /// 0 means unlimited.
  pub max_messages: u32,
  /// Negative: undecided (error out when it matters); 0: keep unread
  /// messages; positive: expire them too.
  pub expire_unread: i8,
  pub expire_side: usize,
  pub use_internal_date: bool,
  pub sync_state: Option<String>,
}

impl ChannelConf {
  pub fn new(name: &str, far_store: &str, near_store: &str) -> Self {
    Self {
      name: name.to_string(),
      stores: [far_store.to_string(), near_store.to_string()],
      boxes: [None, None],
      patterns: Vec::new(),
      ops: [OpsMask::NONE; 2],
      max_messages: 0,
      expire_unread: -1,
      expire_side: N,
      use_internal_date: false,
      sync_state: None,
    }
  }
}

/// Process-wide knobs, threaded through explicitly.
#[derive(Clone, Debug)]
pub struct Settings {
  pub state_dir: path::PathBuf,
  pub use_fsync: bool,
  /// Aggregate in-flight payload budget per channel.
  pub buffer_limit: u32,
  // Developer test switches.
  pub keep_journal: bool,
  pub force_journal: bool,
  pub fake_expunge: bool,
  pub max_journal_steps: Option<u32>,
}

impl Default for Settings {
  fn default() -> Self {
    Self {
      state_dir: path::PathBuf::from("."),
      use_fsync: true,
      buffer_limit: 10 * 1024 * 1024,
      keep_journal: false,
      force_journal: false,
      fake_expunge: false,
      max_journal_steps: None,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BoxPresence {
  Possible,
  Absent,
  Present,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Stats {
  pub new: [u32; 2],
  pub flags: [u32; 2],
  pub trash: [u32; 2],
  pub expunge: [u32; 2],
}

impl Stats {
  pub fn add(&mut self, other: &Stats) {
    for t in 0..2 {
      self.new[t] += other.new[t];
      self.flags[t] += other.flags[t];
      self.trash[t] += other.trash[t];
      self.expunge[t] += other.expunge[t];
    }
  }
}

pub(crate) struct SyncVars<'a> {
  pub chan: &'a ChannelConf,
  pub settings: &'a Settings,
  pub box_name: [String; 2],
  pub dname: path::PathBuf,
  pub jname: path::PathBuf,
  pub nname: path::PathBuf,
  pub lname: path::PathBuf,
  pub lock: Option<fs::File>,
  pub jfp: Option<fs::File>,
  pub srecs: Vec<SyncRec>,
  pub last_rec: usize,
  pub msgs: [Vec<Message>; 2],
  pub by_uid: [collections::HashMap<u32, usize>; 2],
  pub trashed: [Vec<u32>; 2],
  pub existing: bool,
  pub replayed: bool,
  pub jcount: u32,
  pub maxuid: [u32; 2],
  pub oldmaxuid: [u32; 2],
  pub newmaxuid: [u32; 2],
  pub uidval: [u32; 2],
  pub newuidval: [u32; 2],
  pub finduid: [u32; 2],
  pub maxxfuid: u32,
  pub good_flags: [Flags; 2],
  pub bad_flags: [Flags; 2],
  pub opts: [OpenOptions; 2],
  pub any_expiring: bool,
  pub ret: u32,
  pub arc4: Arc4,
}

enum Interrupt {
  /// A clean early exit (e.g. deletion propagation); not a failure.
  Done,
  /// The channel failed; the journal is left behind for the next run.
  Aborted,
  /// A fatal condition (journal I/O failure or the step-limit harness).
  Fatal(anyhow::Error),
}

impl From<anyhow::Error> for Interrupt {
  fn from(error: anyhow::Error) -> Self {
    Interrupt::Fatal(error)
  }
}

type Flow<T> = Result<T, Interrupt>;

struct Engine<'a> {
  vars: SyncVars<'a>,
  drv: [&'a mut dyn Driver; 2],
  stats: Stats,
  ops: [OpsMask; 2],
  find_old: [bool; 2],
  need_find: [bool; 2],
  any_new: [bool; 2],
  trash_bad: [bool; 2],
}

/// Synchronizes one mailbox pair. The returned mask accumulates SYNC_FAIL and
/// per-side store failures; an Err is only produced by journal I/O failures
/// and by the developer step-limit harness.
pub fn sync_boxes<'a>(
  drv: [&'a mut dyn Driver; 2],
  names: [Option<&str>; 2],
  present: [BoxPresence; 2],
  chan: &'a ChannelConf,
  settings: &'a Settings,
  stats: &mut Stats,
) -> anyhow::Result<u32> {
  let box_name = [F, N].map(|t| {
    match names[t] {
      Some(name) if Some(name) != drv[t].conf().map_inbox.as_deref() => name.to_string(),
      _ => "INBOX".to_string(),
    }
  });
  let vars = SyncVars {
    chan,
    settings,
    box_name,
    dname: path::PathBuf::new(),
    jname: path::PathBuf::new(),
    nname: path::PathBuf::new(),
    lname: path::PathBuf::new(),
    lock: None,
    jfp: None,
    srecs: Vec::new(),
    last_rec: 0,
    msgs: [Vec::new(), Vec::new()],
    by_uid: [collections::HashMap::new(), collections::HashMap::new()],
    trashed: [Vec::new(), Vec::new()],
    existing: false,
    replayed: false,
    jcount: 0,
    maxuid: [0; 2],
    oldmaxuid: [0; 2],
    newmaxuid: [0; 2],
    uidval: [UIDVAL_BAD; 2],
    newuidval: [UIDVAL_BAD; 2],
    finduid: [0; 2],
    maxxfuid: 0,
    good_flags: [Flags::ALL; 2],
    bad_flags: [Flags::NONE; 2],
    opts: [OpenOptions::NONE; 2],
    any_expiring: false,
    ret: SYNC_OK,
    arc4: Arc4::new(),
  };
  let mut engine = Engine {
    vars,
    drv,
    stats: Stats::default(),
    ops: chan.ops,
    find_old: [false; 2],
    need_find: [false; 2],
    any_new: [false; 2],
    trash_bad: [false; 2],
  };
  let result = engine.run(present);
  engine.vars.unlock_state();
  stats.add(&engine.stats);
  match result {
    Ok(()) | Err(Interrupt::Done) => Ok(engine.vars.ret),
    Err(Interrupt::Aborted) => {
      for t in 0..2 {
        engine.drv[t].cancel_cmds();
      }
      Ok(engine.vars.ret | SYNC_FAIL)
    }
    Err(Interrupt::Fatal(error)) => Err(error),
  }
}

impl<'a> Engine<'a> {
  /// Maps a driver failure onto the error taxonomy: message failures are
  /// recorded and skipped, anything else aborts the pair.
  fn check<T>(&mut self, t: usize, result: crate::driver::Result<T>, what: &str) -> Flow<T> {
    match result {
      Ok(value) => Ok(value),
      Err(error) => {
        self.fail(t, &error, what);
        Err(Interrupt::Aborted)
      }
    }
  }

  fn fail(&mut self, t: usize, error: &DriverError, what: &str) {
    log::error!(
      "channel {}, {} box {}: {what}: {:#}",
      self.vars.chan.name,
      side_name(t),
      self.vars.box_name[t],
      error.cause
    );
    match error.kind {
      ErrorKind::Store => self.vars.ret |= sync_bad(t),
      ErrorKind::Canceled => (),
      _ => self.vars.ret |= SYNC_FAIL,
    }
  }

  fn sanitize_flags(&mut self, tflags: Flags, t: usize) -> Flags {
    // Complain only once per flag per store.
    let bflags = tflags - self.vars.good_flags[t] - self.vars.bad_flags[t];
    if !bflags.is_empty() {
      log::info!(
        "Notice: {} store does not support flag(s) '{bflags}'; not propagating.",
        side_name(t)
      );
      self.vars.bad_flags[t] |= bflags;
    }
    tflags & self.vars.good_flags[t]
  }

  /// Marks messages the driver reports as externally expunged.
  fn absorb_expunges(&mut self, t: usize) {
    for uid in self.drv[t].drain_expunged() {
      if let Some(&mi) = self.vars.by_uid[t].get(&uid) {
        let msg = &mut self.vars.msgs[t][mi];
        if msg.status.contains(MsgStatus::DEAD) {
          continue;
        }
        msg.status |= MsgStatus::DEAD;
        if msg.status.contains(MsgStatus::EXPUNGE) {
          self.stats.expunge[t] += 1;
        }
        if let Some(ri) = msg.srec.take() {
          self.vars.srecs[ri].status |= Status::gone(t);
          self.vars.srecs[ri].msg[t] = None;
        }
      }
    }
  }

  fn run(&mut self, present: [BoxPresence; 2]) -> Flow<()> {
    for t in 0..2 {
      let name = self.vars.box_name[t].clone();
      let result = self.drv[t].select(&name);
      self.check(t, result, "cannot select mailbox")?;
    }

    {
      let store_names =
        [self.vars.chan.stores[F].as_str(), self.vars.chan.stores[N].as_str()];
      // In-box state lives beside the near mailbox, which must be opened to
      // know its path; prepare_state falls back gracefully before that.
      let near_path = self.drv[N].box_path();
      self.vars.prepare_state(near_path, store_names)?;
    }
    self.vars.load_state()?;

    self.open_boxes(present)?;
    self.vars.lock_state()?;
    self.compute_load_opts();
    self.load_boxes()?;
    self.validate_uidval()?;

    self.vars.oldmaxuid = self.vars.newmaxuid;
    for t in 0..2 {
      self.vars.good_flags[t] = self.drv[t].supported_flags();
    }

    log::info!("Synchronizing {}...", self.vars.box_name[N]);
    self.sync_old_entries()?;
    self.sync_new_entries()?;
    self.expire()?;
    self.propagate_flags()?;
    self.propagate_new()?;
    self.find_new()?;
    self.trash()?;
    self.expunge()?;
    self.finish()?;
    Ok(())
  }

  fn open_boxes(&mut self, present: [BoxPresence; 2]) -> Flow<()> {
    let mut opened = [false; 2];
    for t in 0..2 {
      if present[t] == BoxPresence::Absent {
        continue;
      }
      log::info!("Opening {} box {}...", side_name(t), self.vars.box_name[t]);
      let result = self.drv[t].open_box();
      match self.check(t, result, "cannot open mailbox")? {
        Some(uidvalidity) => {
          opened[t] = true;
          self.vars.newuidval[t] = uidvalidity;
        }
        None => (),
      }
    }

    if !opened[F] && !opened[N] {
      if !self.vars.existing {
        log::error!(
          "Error: channel {}: both far side {} and near side {} cannot be opened.",
          self.vars.chan.name,
          self.vars.box_name[F],
          self.vars.box_name[N]
        );
        self.vars.ret |= SYNC_FAIL;
        return Err(Interrupt::Aborted);
      }
      // This can legitimately happen if a deletion propagation was
      // interrupted; there is no place to record that transaction, so it
      // is assumed.
      self.vars.delete_state()?;
      return Err(Interrupt::Done);
    }

    for t in 0..2 {
      if opened[t] {
        continue;
      }
      let u = t ^ 1;
      if self.vars.existing {
        if !self.ops[u].contains(OpsMask::REMOVE) {
          log::error!(
            "Error: channel {}: {} box {} cannot be opened.",
            self.vars.chan.name,
            side_name(t),
            self.vars.box_name[t]
          );
          self.vars.ret |= SYNC_FAIL;
          return Err(Interrupt::Aborted);
        }
        let result = self.drv[u].confirm_box_empty();
        if !self.check(u, result, "cannot inspect mailbox")? {
          log::warn!(
            "Warning: channel {}: {} box {} cannot be opened and {} box {} is not empty.",
            self.vars.chan.name,
            side_name(t),
            self.vars.box_name[t],
            side_name(u),
            self.vars.box_name[u]
          );
          return Err(Interrupt::Done);
        }
        log::info!("Deleting {} box {}...", side_name(u), self.vars.box_name[u]);
        let result = self.drv[u].delete_box();
        self.check(u, result, "cannot delete mailbox")?;
        self.vars.delete_state()?;
        let result = self.drv[u].finish_delete_box();
        self.check(u, result, "cannot delete mailbox")?;
        return Err(Interrupt::Done);
      }
      if !self.ops[t].contains(OpsMask::CREATE) {
        log::error!(
          "Error: channel {}: {} box {} cannot be opened.",
          self.vars.chan.name,
          side_name(t),
          self.vars.box_name[t]
        );
        self.vars.ret |= SYNC_FAIL;
        return Err(Interrupt::Aborted);
      }
      log::info!("Creating {} box {}...", side_name(t), self.vars.box_name[t]);
      let result = self.drv[t].create_box();
      self.check(t, result, "cannot create mailbox")?;
      let result = self.drv[t].open_box();
      match self.check(t, result, "cannot open mailbox")? {
        Some(uidvalidity) => self.vars.newuidval[t] = uidvalidity,
        None => {
          self.vars.ret |= SYNC_FAIL;
          return Err(Interrupt::Aborted);
        }
      }
    }
    Ok(())
  }

  fn uidval_fails(&self) -> usize {
    (0..2)
      .filter(|&t| {
        self.vars.uidval[t] != UIDVAL_BAD && self.vars.uidval[t] != self.vars.newuidval[t]
      })
      .count()
  }

  fn compute_load_opts(&mut self) {
    let vars = &mut self.vars;
    let chan = vars.chan;

    let mut any_dummies = [0u32; 2];
    let mut any_purges = [0u32; 2];
    let mut any_upgrades = [0u32; 2];
    let mut any_old = [0u32; 2];
    let mut any_new = [0u32; 2];
    let mut any_tuids = [0u32; 2];
    if vars.replayed || (self.ops[F] | self.ops[N]).contains(OpsMask::UPGRADE) {
      for rec in &vars.srecs {
        if rec.status.contains(Status::DEAD) {
          continue;
        }
        if rec.status.contains(Status::DUMMY_F) {
          any_dummies[F] += 1;
        } else if rec.status.contains(Status::DUMMY_N) {
          any_dummies[N] += 1;
        } else if rec.status.contains(Status::SKIPPED) {
          any_dummies[if rec.uid[F] == 0 { F } else { N }] += 1;
        }
        if !vars.replayed {
          continue;
        }
        let expire = rec.status.contains(Status::EXPIRE);
        let expired = rec.status.contains(Status::EXPIRED);
        if expire != expired {
          vars.any_expiring = true;
        }
        if rec.status.contains(Status::PURGE) {
          any_purges[if rec.uid[F] != 0 { F } else { N }] += 1;
        } else if rec.status.contains(Status::PENDING) {
          let t = if rec.uid[F] == 0 { F } else { N };
          if rec.status.contains(Status::UPGRADE) {
            any_upgrades[t] += 1;
          } else if rec.uid[t ^ 1] <= vars.maxuid[t ^ 1] {
            any_old[t] += 1;
          } else {
            any_new[t] += 1;
          }
          if rec.tuid.is_some() {
            any_tuids[t] += 1;
          }
        }
      }
    }

    let uidval_fails = (0..2)
      .filter(|&t| vars.uidval[t] != UIDVAL_BAD && vars.uidval[t] != vars.newuidval[t])
      .count();
    let mut opts = [OpenOptions::NONE; 2];
    if uidval_fails != 0 {
      opts = [OpenOptions::PAIRED | OpenOptions::PAIRED_IDS; 2];
    }
    for t in 0..2 {
      let u = t ^ 1;
      if any_purges[t] != 0 {
        log::debug!("resuming {} {} purge(s)", any_purges[t], side_name(t));
        opts[t] |= OpenOptions::SETFLAGS;
      }
      if any_tuids[t] != 0 {
        log::debug!("finding {} {}ed message(s)", any_tuids[t], dir_name(t));
        opts[t] |= OpenOptions::NEW | OpenOptions::FIND;
        self.find_old[t] = true;
      }
      if self.ops[t].intersects(OpsMask::GONE | OpsMask::FLAGS) {
        opts[t] |= OpenOptions::SETFLAGS;
        opts[u] |= OpenOptions::PAIRED;
        if self.ops[t].contains(OpsMask::FLAGS) {
          opts[u] |= OpenOptions::FLAGS;
        }
      }
      if any_dummies[t] == 0 && self.ops[t].contains(OpsMask::UPGRADE) {
        self.ops[t] = self.ops[t] - OpsMask::UPGRADE;
        log::debug!("no {} dummies; masking Upgrade", side_name(t));
      }
      if self.ops[t].intersects(OpsMask::OLD | OpsMask::NEW | OpsMask::UPGRADE)
        || any_old[t] != 0
        || any_new[t] != 0
        || any_upgrades[t] != 0
      {
        opts[t] |= OpenOptions::APPEND;
        let capped = self.drv[t].conf().max_size != u32::MAX;
        if self.ops[t].contains(OpsMask::OLD) || any_old[t] != 0 {
          log::debug!("resuming {} of {} old message(s)", dir_name(t), any_old[t]);
          opts[u] |= OpenOptions::OLD;
          if capped {
            opts[u] |= OpenOptions::OLD_SIZE;
          }
        }
        if self.ops[t].contains(OpsMask::NEW) || any_new[t] != 0 {
          log::debug!("resuming {} of {} new message(s)", dir_name(t), any_new[t]);
          opts[u] |= OpenOptions::NEW;
          if capped {
            opts[u] |= OpenOptions::NEW_SIZE;
          }
        }
        if self.ops[t].contains(OpsMask::UPGRADE) || any_upgrades[t] != 0 {
          log::debug!("resuming {} of {} upgrade(s)", dir_name(t), any_upgrades[t]);
          if self.ops[t].contains(OpsMask::UPGRADE) {
            opts[t] |= OpenOptions::PAIRED | OpenOptions::FLAGS | OpenOptions::SETFLAGS;
          }
          opts[u] |= OpenOptions::PAIRED;
        }
        // Don't propagate doomed messages.
        if (self.ops[t] | self.ops[u]).contains(OpsMask::EXPUNGE) {
          opts[u] |= OpenOptions::FLAGS;
        }
      }
      if self.ops[t].contains(OpsMask::EXPUNGE) {
        opts[t] |= OpenOptions::EXPUNGE;
        let conf = self.drv[t].conf();
        let other = self.drv[u].conf();
        if conf.trash.is_some() {
          if !conf.trash_only_new {
            opts[t] |= OpenOptions::OLD;
          }
          opts[t] |= OpenOptions::NEW | OpenOptions::FLAGS | OpenOptions::UID_EXPUNGE;
        } else if other.trash.is_some() && other.trash_remote_new {
          opts[t] |= OpenOptions::NEW | OpenOptions::FLAGS | OpenOptions::UID_EXPUNGE;
        }
      }
    }
    // While only new messages can cause expiration due to displacement,
    // updating flags can cause expiration of already overdue messages.
    let xt = vars.chan.expire_side;
    if self.ops[xt].intersects(OpsMask::OLD | OpsMask::NEW | OpsMask::UPGRADE | OpsMask::FLAGS)
      && chan.max_messages != 0
    {
      vars.any_expiring = true;
    }
    if vars.any_expiring {
      opts[xt] |= OpenOptions::PAIRED | OpenOptions::FLAGS;
      if any_dummies[xt] != 0 {
        opts[xt ^ 1] |= OpenOptions::PAIRED | OpenOptions::FLAGS;
      } else if self.ops[xt].intersects(OpsMask::OLD | OpsMask::NEW | OpsMask::UPGRADE) {
        opts[xt ^ 1] |= OpenOptions::FLAGS;
      }
    }
    for t in 0..2 {
      self.vars.opts[t] = self.drv[t].prepare_load(opts[t]);
      if opts[t].contains(OpenOptions::UID_EXPUNGE)
        && !self.vars.opts[t].contains(OpenOptions::UID_EXPUNGE)
      {
        log::info!(
          "Notice: Trashing in store {} is prone to race conditions.",
          self.vars.chan.stores[t]
        );
      }
    }
  }

  fn seen_uid(&self, t: usize) -> u32 {
    self
      .vars
      .srecs
      .iter()
      .filter(|rec| !rec.status.contains(Status::DEAD))
      .map(|rec| rec.uid[t])
      .max()
      .unwrap_or(0)
  }

  fn load_boxes(&mut self) -> Flow<()> {
    let xt = self.vars.chan.expire_side;
    let mut mexcs = Vec::new();
    let minwuid;
    if self.vars.opts[xt ^ 1].contains(OpenOptions::PAIRED)
      && !self.vars.opts[xt ^ 1].contains(OpenOptions::OLD)
      && self.vars.chan.max_messages != 0
    {
      // When messages have been expired on one side, the other side's fetch
      // is split into the bulk range of the most recent messages plus an
      // exception list of messages which escaped expiration.
      minwuid = self.vars.maxxfuid + 1;
      for rec in &self.vars.srecs {
        if rec.status.contains(Status::DEAD) {
          continue;
        }
        if rec.uid[xt ^ 1] == 0 || rec.uid[xt ^ 1] >= minwuid {
          continue;
        }
        if self.vars.opts[xt ^ 1].contains(OpenOptions::NEW)
          && rec.uid[xt ^ 1] > self.vars.maxuid[xt ^ 1]
        {
          continue; // In the expired range, but the new range overlaps it.
        }
        if rec.uid[xt] == 0 && !rec.status.contains(Status::PENDING) {
          continue; // Only actually paired up messages matter.
        }
        mexcs.push(rec.uid[xt ^ 1]);
      }
      mexcs.sort_unstable();
    } else {
      minwuid = 1;
    }
    self.load_box(xt ^ 1, minwuid, &mexcs)?;
    self.load_box(xt, 1, &[])?;

    for t in 0..2 {
      if self.find_old[t] {
        log::debug!("matching previously copied messages on {}", side_name(t));
        let from = self.vars.msgs[t].partition_point(|msg| msg.uid < self.vars.finduid[t]);
        self.vars.match_tuids(t, from)?;
      }
    }

    // Pair up the remaining messages with the sync records by UID.
    for t in 0..2 {
      let mut by_uid = collections::HashMap::new();
      for (ri, rec) in self.vars.srecs.iter().enumerate() {
        if rec.status.contains(Status::DEAD) || rec.uid[t] == 0 {
          continue;
        }
        by_uid.insert(rec.uid[t], ri);
      }
      for mi in 0..self.vars.msgs[t].len() {
        if self.vars.msgs[t][mi].srec.is_some() {
          continue; // Found by TUID.
        }
        if let Some(&ri) = by_uid.get(&self.vars.msgs[t][mi].uid) {
          self.vars.msgs[t][mi].srec = Some(ri);
          self.vars.srecs[ri].msg[t] = Some(mi);
        }
      }
    }
    Ok(())
  }

  fn load_box(&mut self, t: usize, mut minwuid: u32, excs: &[u32]) -> Flow<()> {
    let mut maxwuid = 0;
    let mut pairuid = u32::MAX;
    if self.vars.opts[t].contains(OpenOptions::NEW) {
      if self.vars.opts[t].contains(OpenOptions::OLD) {
        self.vars.opts[t] |= OpenOptions::PAIRED;
        minwuid = 1;
      } else if !self.vars.opts[t].contains(OpenOptions::PAIRED)
        || minwuid > self.vars.maxuid[t] + 1
      {
        minwuid = self.vars.maxuid[t] + 1;
      }
      maxwuid = u32::MAX;
      if self.vars.opts[t].contains(OpenOptions::PAIRED_IDS) {
        // With a UIDVALIDITY change on this side the known messages may
        // carry arbitrary new UIDs, so all of them need their IDs.
        pairuid = if self.vars.uidval[t] != UIDVAL_BAD
          && self.vars.uidval[t] != self.vars.newuidval[t]
        {
          u32::MAX
        } else {
          self.seen_uid(t)
        };
      }
    } else if self.vars.opts[t].intersects(OpenOptions::PAIRED | OpenOptions::OLD) {
      let seenuid = self.seen_uid(t);
      if self.vars.opts[t].contains(OpenOptions::OLD) {
        minwuid = 1;
        maxwuid = self.vars.maxuid[t];
        if maxwuid < seenuid {
          if self.vars.opts[t].contains(OpenOptions::PAIRED) {
            maxwuid = seenuid;
          }
        } else {
          self.vars.opts[t] |= OpenOptions::PAIRED;
        }
      } else {
        maxwuid = seenuid;
      }
    } else {
      minwuid = u32::MAX;
    }
    log::info!("Loading {} box...", side_name(t));
    let finduid = if self.vars.opts[t].contains(OpenOptions::FIND) {
      self.vars.finduid[t]
    } else {
      0
    };
    let newuid = self.vars.maxuid[t];
    let result = self.drv[t].load_box(minwuid, maxwuid, finduid, pairuid, newuid, excs);
    let loaded = self.check(t, result, "cannot load mailbox")?;
    log::info!("{}: {} messages, {} recent", side_name(t), loaded.total, loaded.recent);
    self.vars.msgs[t] = loaded.msgs;
    self.vars.by_uid[t] =
      self.vars.msgs[t].iter().enumerate().map(|(mi, msg)| (msg.uid, mi)).collect();
    Ok(())
  }

  fn validate_uidval(&mut self) -> Flow<()> {
    for t in 0..2 {
      if self.vars.uidval[t] == UIDVAL_BAD || self.vars.uidval[t] == self.vars.newuidval[t] {
        continue;
      }
      if self.uidval_fails() == 2 {
        log::error!(
          "Error: channel {}: UIDVALIDITY of both far side and near side changed.",
          self.vars.chan.name
        );
        self.vars.ret |= SYNC_FAIL;
        return Err(Interrupt::Aborted);
      }
      // Check whether the messages with known UIDs are actually the same
      // messages, as recognized by their Message-IDs; where the UIDs changed
      // too, re-pair through the other side's Message-IDs.
      log::debug!("trying to re-approve uid validity of {}", side_name(t));
      let mut by_msgid: collections::HashMap<String, usize> = collections::HashMap::new();
      for (mi, msg) in self.vars.msgs[t].iter().enumerate() {
        if let Some(msgid) = &msg.msgid {
          by_msgid.insert(msgid.clone(), mi);
        }
      }
      let mut need = 0u32;
      let mut got = 0u32;
      let mut rewrites: Vec<(usize, usize)> = Vec::new();
      for (ri, rec) in self.vars.srecs.iter().enumerate() {
        if rec.status.contains(Status::DEAD) {
          continue;
        }
        need += 1;
        let Some(omi) = rec.msg[t ^ 1] else { continue };
        let Some(other_id) = self.vars.msgs[t ^ 1][omi].msgid.clone() else { continue };
        match rec.msg[t] {
          Some(mi) => {
            // The pairing by UID held; verify it.
            match &self.vars.msgs[t][mi].msgid {
              Some(msgid) if *msgid == other_id => got += 1,
              Some(_) => {
                log::error!(
                  "Error: channel {}, {} box {}: UIDVALIDITY genuinely changed (at UID {}).",
                  self.vars.chan.name,
                  side_name(t),
                  self.vars.box_name[t],
                  rec.uid[t]
                );
                self.vars.ret |= SYNC_FAIL;
                return Err(Interrupt::Aborted);
              }
              None => continue,
            }
          }
          None => {
            // The UID went nowhere; the message may live on under a new UID.
            if rec.uid[t] == 0 {
              continue;
            }
            if let Some(&mi) = by_msgid.get(&other_id) {
              if self.vars.msgs[t][mi].srec.is_none() {
                rewrites.push((ri, mi));
                got += 1;
              }
            }
          }
        }
      }
      // Accept the hypothesis of a spurious change if enough messages
      // confirm it: at least 20 of them, or at least 80% of those
      // previously present (which also covers an already empty box).
      if got < 20 && got * 5 < need * 4 {
        log::error!(
          "Error: channel {}, {} box {}: Unable to recover from UIDVALIDITY change.",
          self.vars.chan.name,
          side_name(t),
          self.vars.box_name[t]
        );
        self.vars.ret |= SYNC_FAIL;
        return Err(Interrupt::Aborted);
      }
      for (ri, mi) in rewrites {
        let new_uid = self.vars.msgs[t][mi].uid;
        let rec = &self.vars.srecs[ri];
        let (old_f, old_n) = (rec.uid[F], rec.uid[N]);
        let mut new = [old_f, old_n];
        new[t] = new_uid;
        let flags = rec.flags;
        let status = rec.status & Status::LOGGED;
        // Expressed through the ordinary journal vocabulary so a replay
        // reconstructs the rewritten pairing exactly.
        self.vars.jlog(format!("- {old_f} {old_n}"), "rewriting UID - old pair")?;
        self.vars.jlog(format!("+ {} {}", new[F], new[N]), "rewriting UID - new pair")?;
        self.vars.jlog(
          format!("~ {} {} {}", new[F], new[N], (status - Status::PENDING).0),
          "rewriting UID - status",
        )?;
        self.vars.jlog(format!("* {} {} {}", new[F], new[N], flags.0), "rewriting UID - flags")?;
        let rec = &mut self.vars.srecs[ri];
        rec.uid[t] = new_uid;
        rec.msg[t] = Some(mi);
        self.vars.msgs[t][mi].srec = Some(ri);
        if self.vars.newmaxuid[t] < new_uid {
          self.vars.newmaxuid[t] = new_uid;
        }
      }
      log::info!(
        "Notice: channel {}, {} box {}: Recovered from change of UIDVALIDITY.",
        self.vars.chan.name,
        side_name(t),
        self.vars.box_name[t]
      );
      self.vars.uidval[t] = UIDVAL_BAD;
    }
    if self.vars.uidval[F] == UIDVAL_BAD || self.vars.uidval[N] == UIDVAL_BAD {
      self.vars.uidval = self.vars.newuidval;
      self.vars.jlog(
        format!("| {} {}", self.vars.uidval[F], self.vars.uidval[N]),
        "new UIDVALIDITYs",
      )?;
    }
    Ok(())
  }

  fn sync_old_entries(&mut self) -> Flow<()> {
    log::debug!("synchronizing old entries");
    let xt = self.vars.chan.expire_side;
    let known = self.vars.srecs.len();
    for ri in 0..known {
      if self.vars.srecs[ri].status.contains(Status::DEAD) {
        continue;
      }
      let rec = &self.vars.srecs[ri];
      log::debug!("pair ({},{})", rec.uid[F], rec.uid[N]);
      debug_assert!(rec.tuid.is_none());
      // no[] means that a message is known to be not there.
      let no = [F, N].map(|t| {
        self.vars.srecs[ri].msg[t].is_none() && self.vars.opts[t].contains(OpenOptions::PAIRED)
      });
      if no[F] && no[N] {
        // Now both are missing, so the entry is superfluous.
        let rec = &mut self.vars.srecs[ri];
        rec.status = Status::DEAD;
        let (uf, un) = (rec.uid[F], rec.uid[N]);
        self.vars.jlog(format!("- {uf} {un}"), "both missing")?;
        continue;
      }
      // del[] means that a message becomes known to have been expunged.
      let del = [F, N].map(|t| no[t] && self.vars.srecs[ri].uid[t] != 0);

      for t in 0..2 {
        let rec = &mut self.vars.srecs[ri];
        // Do this before possibly upgrading that side.
        if let Some(mi) = rec.msg[t] {
          if self.vars.msgs[t][mi].flags.contains(Flags::DELETED) {
            rec.status |= Status::del(t);
          }
        }
        // Flagging the message on the target side causes an upgrade of the
        // dummy. This happens first, so flag propagation sees the upgraded
        // state for both sides, as it would after a journal replay.
        if self.ops[t].contains(OpsMask::UPGRADE)
          && rec.status.contains(Status::dummy(t))
          && rec.uid[t ^ 1] != 0
        {
          if let Some(mi) = rec.msg[t] {
            let sflags = self.vars.msgs[t][mi].flags;
            if sflags.contains(Flags::FLAGGED) {
              let sflags =
                (sflags - (Flags::SEEN | Flags::FLAGGED)) | (rec.flags & Flags::SEEN);
              // The dummy's flags are saved away, because after an
              // interruption it may be already gone.
              rec.pflags = sflags;
              let (uf, un, pflags) = (rec.uid[F], rec.uid[N], rec.pflags);
              self.vars.jlog(
                format!("^ {uf} {un} {}", pflags.0),
                &format!("upgrading {} placeholder", side_name(t)),
              )?;
              self.vars.upgrade_rec(ri, t);
            }
          }
        }
      }
      for t in 0..2 {
        let rec = &self.vars.srecs[ri];
        let sflags;
        if rec.status.contains(Status::UPGRADE) {
          // Such records hold orphans by definition, so the del[] cases are
          // irrelevant.
          if rec.uid[t] != 0 {
            // Direction towards the source message; the placeholder was
            // already detached, so its saved flags are used instead.
            sflags = rec.pflags;
          } else if let Some(omi) = rec.msg[t ^ 1] {
            // Direction towards the copy.
            sflags = self.vars.msgs[t ^ 1][omi].flags;
          } else {
            log::debug!("  no {}", side_name(t ^ 1));
            continue;
          }
        } else if del[t] {
          // The target was newly expunged; the deletion is propagated in the
          // opposite iteration.
          self.vars.srecs[ri].status |= Status::gone(t);
          continue;
        } else if rec.uid[t] == 0 {
          // The target was never stored, or was previously expunged.
          continue;
        } else if del[t ^ 1] {
          // The source was newly expunged, so possibly propagate the
          // deletion. The target may be in an unknown state.
          if t != xt && rec.status.intersects(Status::EXPIRE | Status::EXPIRED) {
            // Don't propagate deletion resulting from expiration.
            if rec.status.contains(Status::EXPIRE) != rec.status.contains(Status::EXPIRED) {
              // An expiration was interrupted, but the message was expunged
              // since; override failed unexpiration attempts.
              let rec = &mut self.vars.srecs[ri];
              rec.status |= Status::EXPIRE | Status::EXPIRED;
              let (uf, un, st) = (rec.uid[F], rec.uid[N], rec.status & Status::LOGGED);
              self.vars.jlog(format!("~ {uf} {un} {}", st.0), "forced expiration commit")?;
            }
            let rec = &self.vars.srecs[ri];
            let (uf, un) = (rec.uid[F], rec.uid[N]);
            self.vars.jlog(
              format!("{} {uf} {un} 0", ['<', '>'][xt]),
              &format!("{} expired, orphaning {}", side_name(xt), side_name(xt ^ 1)),
            )?;
            self.vars.srecs[ri].uid[xt] = 0;
          } else {
            let rec = &self.vars.srecs[ri];
            if let Some(mi) = rec.msg[t] {
              let msg = &self.vars.msgs[t][mi];
              if msg.status.contains(MsgStatus::FLAGS)
                // Ignore the deleted flag, as that's what we'll change
                // ourselves - except for undeletion, as that's the opposite.
                && (((msg.flags - Flags::DELETED) != (rec.flags - Flags::DELETED))
                  || (!msg.flags.contains(Flags::DELETED) && rec.flags.contains(Flags::DELETED)))
              {
                log::info!("Notice: conflicting changes in ({},{})", rec.uid[F], rec.uid[N]);
              }
            }
            if self.ops[t].contains(OpsMask::GONE) {
              log::debug!("  {}ing delete", dir_name(t));
              let rec = &mut self.vars.srecs[ri];
              rec.aflags[t] = Flags::DELETED;
              rec.status |= Status::DELETE;
            } else {
              log::debug!("  not {}ing delete", dir_name(t));
            }
          }
          continue;
        } else if rec.msg[t ^ 1].is_none() {
          // There is no source to work with, because it was never stored,
          // was previously expunged, or was not fetched.
          log::debug!("  no {}", side_name(t ^ 1));
          continue;
        } else {
          // There is a source. The target may be in an unknown state.
          sflags = self.vars.msgs[t ^ 1][rec.msg[t ^ 1].unwrap()].flags;
        }

        if self.ops[t].contains(OpsMask::FLAGS) {
          let mut sflags = self.sanitize_flags(sflags, t);
          let rec = &self.vars.srecs[ri];
          if t != xt && rec.status.intersects(Status::EXPIRE | Status::EXPIRED) {
            // Don't propagate deletion resulting from expiration.
            log::debug!("  {} expiring", side_name(xt));
            sflags = sflags - Flags::DELETED;
          }
          if rec.status.contains(Status::dummy(t ^ 1)) {
            // From placeholders, don't propagate:
            // - Seen, because the real contents were obviously not seen yet;
            //   un-seeing is propagated, though.
            // - Flagged, because it's just a request to upgrade.
            sflags = (sflags - (Flags::SEEN | Flags::FLAGGED)) | (rec.flags & Flags::SEEN);
          } else if rec.status.contains(Status::dummy(t)) {
            // Don't propagate Flagged to placeholders, as that would be
            // misunderstood as a request to upgrade next time around. The
            // flag won't be seen until the placeholder is upgraded.
            sflags = sflags - Flags::FLAGGED;
          }
          let rec = &mut self.vars.srecs[ri];
          rec.aflags[t] = sflags - rec.flags;
          rec.dflags[t] = rec.flags - sflags;
          if !rec.aflags[t].is_empty() || !rec.dflags[t].is_empty() {
            log::debug!(
              "  {}ing flags: +{} -{}",
              dir_name(t),
              rec.aflags[t],
              rec.dflags[t]
            );
          }
        }
      }
    }
    Ok(())
  }

  fn sync_new_entries(&mut self) -> Flow<()> {
    let xt = self.vars.chan.expire_side;
    for t in 0..2 {
      log::debug!("synchronizing new messages on {}", side_name(t ^ 1));
      let mut topping = true;
      for mi in 0..self.vars.msgs[t ^ 1].len() {
        let msg = &self.vars.msgs[t ^ 1][mi];
        if msg.status.contains(MsgStatus::DEAD) {
          continue;
        }
        let uid = msg.uid;
        let flags = msg.flags;
        let size = msg.size;
        let ri = match msg.srec {
          Some(ri) => {
            // This covers legacy (or somehow corrupted) state files which
            // failed to track maxuid properly.
            if topping && self.vars.newmaxuid[t ^ 1] < uid {
              self.vars.newmaxuid[t ^ 1] = uid;
            }
            let rec = &self.vars.srecs[ri];
            if rec.status.contains(Status::SKIPPED) {
              // Legacy only: the message was skipped due to being too big.
              if !self.ops[t].contains(OpsMask::UPGRADE) {
                continue;
              }
              let rec = &mut self.vars.srecs[ri];
              rec.status = Status::PENDING | Status::dummy(t);
              let (uf, un) = (rec.uid[F], rec.uid[N]);
              self
                .vars
                .jlog(format!("_ {uf} {un}"), "placeholder only - was previously skipped")?;
            } else if !rec.status.contains(Status::PENDING) {
              if rec.uid[t] != 0 {
                continue; // Nothing to do - the message is paired.
              }
              if !self.ops[t].contains(OpsMask::OLD) {
                continue;
              }
              if t != xt || !rec.status.contains(Status::EXPIRED) {
                // Orphans are deletion propagation transactions which were
                // interrupted midway; they are not re-propagated.
                log::debug!("ignoring orphaned message {uid}");
                continue;
              }
              if !flags.contains(Flags::FLAGGED)
                && (flags.contains(Flags::SEEN) || self.vars.chan.expire_unread > 0)
              {
                log::debug!("not re-propagating tracked expired message {uid}");
                continue;
              }
              let rec = &mut self.vars.srecs[ri];
              rec.status |= Status::PENDING;
              let (uf, un) = (rec.uid[F], rec.uid[N]);
              let logged = (rec.status & Status::LOGGED).0;
              self.vars.jlog(
                format!("~ {uf} {un} {logged}"),
                "re-propagate tracked expired message",
              )?;
            } else {
              // Propagation was scheduled, but an interruption intervened.
              log::debug!("unpropagated old message {uid}");
              if rec.status.contains(Status::UPGRADE) {
                let doomed_here = self.ops[t].contains(OpsMask::EXPUNGE)
                  && ((rec.pflags | rec.aflags[t]) - rec.dflags[t]).contains(Flags::DELETED);
                let doomed_there = self.ops[t ^ 1].contains(OpsMask::EXPUNGE)
                  && rec.msg[t ^ 1].map_or(false, |omi| {
                    ((self.vars.msgs[t ^ 1][omi].flags | rec.aflags[t ^ 1]) - rec.dflags[t ^ 1])
                      .contains(Flags::DELETED)
                  });
                if doomed_here || doomed_there {
                  // The entry can't be just killed, as flags may be
                  // propagating towards the real message. No dummy is
                  // actually present, but pretending there is makes the real
                  // message count as new when trashing.
                  let rec = &mut self.vars.srecs[ri];
                  rec.status =
                    (rec.status - (Status::PENDING | Status::UPGRADE)) | Status::dummy(t);
                  let (uf, un) = (rec.uid[F], rec.uid[N]);
                  let logged = (rec.status & Status::LOGGED).0;
                  self.vars.jlog(
                    format!("~ {uf} {un} {logged}"),
                    "canceling placeholder upgrade - would be expunged anyway",
                  )?;
                  continue;
                }
                self.any_new[t] = true;
                continue;
              }
            }
            ri
          }
          None => {
            // The first unknown message which should be known marks the end
            // of the synced range; more known messages may follow (from a
            // unidirectional sync in the opposite direction).
            if t != xt || uid > self.vars.maxxfuid {
              topping = false;
            }
            let what;
            if uid <= self.vars.maxuid[t ^ 1] {
              // The message should be already paired. It's not, so it was
              // attempted but failed, ignored as doomed, or expired & pruned.
              if !self.ops[t].contains(OpsMask::OLD) {
                log::debug!("not propagating old message {uid}");
                continue;
              }
              if topping {
                // The message is below the boundary of the bulk range; it is
                // synced only if it has become important meanwhile.
                if !flags.contains(Flags::FLAGGED)
                  && (flags.contains(Flags::SEEN) || self.vars.chan.expire_unread > 0)
                {
                  log::debug!("not re-propagating untracked expired message {uid}");
                  continue;
                }
                what = "untracked expired message";
              } else {
                what = "old message";
              }
            } else {
              if !self.ops[t].contains(OpsMask::NEW) {
                log::debug!("not propagating new message {uid}");
                continue;
              }
              what = "new message";
            }
            let ri = self.vars.srecs.len();
            let mut rec = SyncRec {
              uid: [0; 2],
              flags: Flags::NONE,
              pflags: Flags::NONE,
              aflags: [Flags::NONE; 2],
              dflags: [Flags::NONE; 2],
              status: Status::PENDING,
              tuid: None,
              msg: [None; 2],
            };
            rec.uid[t ^ 1] = uid;
            rec.msg[t ^ 1] = Some(mi);
            self.vars.srecs.push(rec);
            self.vars.msgs[t ^ 1][mi].srec = Some(ri);
            if self.vars.newmaxuid[t ^ 1] < uid {
              self.vars.newmaxuid[t ^ 1] = uid;
            }
            let rec = &self.vars.srecs[ri];
            let (uf, un) = (rec.uid[F], rec.uid[N]);
            self.vars.jlog(format!("+ {uf} {un}"), what)?;
            ri
          }
        };
        if (self.ops[t] | self.ops[t ^ 1]).contains(OpsMask::EXPUNGE)
          && flags.contains(Flags::DELETED)
        {
          // Yes, this may nuke fresh entries, created only for newmaxuid
          // tracking.
          let rec = &mut self.vars.srecs[ri];
          let (uf, un) = (rec.uid[F], rec.uid[N]);
          rec.status = Status::DEAD;
          self.vars.msgs[t ^ 1][mi].srec = None;
          self.vars.jlog(format!("- {uf} {un}"), "killing - would be expunged anyway")?;
          continue;
        }
        if size > self.drv[t].conf().max_size
          && !self.vars.srecs[ri].status.intersects(Status::DUMMY_F | Status::DUMMY_N)
        {
          let rec = &mut self.vars.srecs[ri];
          rec.status |= Status::dummy(t);
          let (uf, un) = (rec.uid[F], rec.uid[N]);
          self.vars.jlog(format!("_ {uf} {un}"), "placeholder only - too big")?;
        }
        self.any_new[t] = true;
      }
    }
    Ok(())
  }

  fn expire(&mut self) -> Flow<()> {
    if !self.vars.any_expiring {
      return Ok(());
    }
    // Expire excess messages. Important (flagged, unread, or unpropagated)
    // messages older than the first non-expired message do not count towards
    // the total.
    log::debug!("preparing message expiration");
    let xt = self.vars.chan.expire_side;
    let mut alive: Vec<(usize, Flags)> = Vec::new();
    for (ri, rec) in self.vars.srecs.iter().enumerate() {
      if rec.status.contains(Status::DEAD) {
        continue;
      }
      // Unpaired expire-side messages cannot be expired without data loss,
      // so they are ignored and not counted. The same goes for messages
      // still being propagated, which delays their expiration by one cycle.
      if rec.uid[xt ^ 1] == 0 {
        continue;
      }
      let nflags;
      if !rec.status.contains(Status::PENDING) {
        let Some(mi) = rec.msg[xt] else { continue };
        let mut flags = self.vars.msgs[xt][mi].flags;
        if rec.status.contains(Status::dummy(xt)) {
          let Some(omi) = rec.msg[xt ^ 1] else { continue };
          // The real Flagged and Seen are pulled in even if flag propagation
          // was not requested, as the placeholder's are useless (except for
          // un-seeing).
          let sflags = self.vars.msgs[xt ^ 1][omi].flags;
          let aflags = (sflags - rec.flags) & (Flags::SEEN | Flags::FLAGGED);
          let dflags = (rec.flags - sflags) & Flags::SEEN;
          flags = (((flags - (Flags::SEEN | Flags::FLAGGED))
            | (flags & rec.flags & Flags::SEEN))
            - dflags)
            | aflags;
        }
        nflags = (flags | rec.aflags[xt]) - rec.dflags[xt];
      } else if rec.status.contains(Status::UPGRADE) {
        nflags = (rec.pflags | rec.aflags[xt]) - rec.dflags[xt];
      } else {
        let Some(omi) = rec.msg[xt ^ 1] else { continue };
        nflags = self.vars.msgs[xt ^ 1][omi].flags;
      }
      if !nflags.contains(Flags::DELETED)
        || rec.status.intersects(Status::EXPIRE | Status::EXPIRED)
      {
        // The message is not deleted, or it is, but only due to expiration.
        alive.push((ri, nflags));
      }
    }
    // The messages which have been in the complete store longest expire
    // first.
    alive.sort_by_key(|&(ri, _)| self.vars.srecs[ri].uid[xt ^ 1]);
    let mut todel = alive.len() as i64 - self.vars.chan.max_messages as i64;
    log::debug!("{} alive messages, {todel} excess - expiring", alive.len());
    let mut unseen = 0u32;
    for &(ri, nflags) in &alive {
      let important = if nflags.contains(Flags::FLAGGED) {
        true
      } else if nflags.contains(Flags::SEEN) {
        false
      } else {
        if todel > 0 {
          unseen += 1;
        }
        self.vars.chan.expire_unread <= 0
      };
      let rec = &self.vars.srecs[ri];
      let (uf, un) = (rec.uid[F], rec.uid[N]);
      let expiring =
        rec.status.contains(Status::EXPIRE) && rec.status.contains(Status::EXPIRED);
      let expunge_pending = rec.status.intersects(Status::EXPIRE | Status::EXPIRED)
        && rec.msg[xt].map_or(false, |mi| {
          self.vars.msgs[xt][mi].flags.contains(Flags::DELETED)
        });
      if important {
        log::debug!("  pair({uf},{un}) is important");
        todel -= 1;
      } else if todel > 0 || expiring || expunge_pending {
        // The message is excess or was already (being) expired.
        self.vars.srecs[ri].status |= Status::NEXPIRE;
        log::debug!("  expiring pair({uf},{un})");
        todel -= 1;
      }
    }
    log::debug!("{todel} excess messages remain");
    if self.vars.chan.expire_unread < 0 && unseen * 2 > self.vars.chan.max_messages {
      log::error!(
        "{}: {unseen} unread messages in excess of MaxMessages ({}).\n\
         Please set ExpireUnread to decide outcome. Skipping mailbox.",
        self.vars.box_name[xt],
        self.vars.chan.max_messages
      );
      self.vars.ret |= SYNC_FAIL;
      return Err(Interrupt::Aborted);
    }
    for &(ri, _) in &alive {
      let rec = &self.vars.srecs[ri];
      let nex = rec.status.contains(Status::NEXPIRE);
      if !rec.status.contains(Status::PENDING) {
        if nex != rec.status.contains(Status::EXPIRED) {
          // The record needs a state change ...
          if nex != rec.status.contains(Status::EXPIRE) {
            // ... and a transaction needs to start.
            let rec = &mut self.vars.srecs[ri];
            rec.status = if nex {
              rec.status | Status::EXPIRE
            } else {
              rec.status - Status::EXPIRE
            };
            let (uf, un, st) = (rec.uid[F], rec.uid[N], rec.status & Status::LOGGED);
            self
              .vars
              .jlog(format!("~ {uf} {un} {}", st.0), &format!("expire {} - begin", nex as u32))?;
          } else {
            // ... but the "right" transaction is already pending.
            log::debug!(
              "-> pair({},{}): expire {} (pending)",
              rec.uid[F],
              rec.uid[N],
              nex as u32
            );
          }
        }
        // Note: the "wrong" transaction may be pending here.
      } else if nex {
        let rec = &mut self.vars.srecs[ri];
        rec.status = Status::EXPIRE | Status::EXPIRED;
        let (uf, un, st) = (rec.uid[F], rec.uid[N], rec.status);
        self.vars.jlog(format!("~ {uf} {un} {}", st.0), "expire unborn")?;
        // If some of the new messages are instantly expired while others are
        // still propagated because they are important, the bulk fetch limit
        // must be upped explicitly.
        let src_uid = self.vars.srecs[ri].uid[xt ^ 1];
        if self.vars.maxxfuid < src_uid {
          self.vars.maxxfuid = src_uid;
        }
        if let Some(omi) = self.vars.srecs[ri].msg[xt ^ 1] {
          self.vars.msgs[xt ^ 1][omi].srec = None;
        }
      }
    }
    Ok(())
  }

  fn propagate_flags(&mut self) -> Flow<()> {
    log::debug!("synchronizing flags");
    let xt = self.vars.chan.expire_side;
    // (record, side, additions, removals) actually sent to the driver.
    let mut planned: Vec<(usize, usize, Flags, Flags)> = Vec::new();
    for ri in 0..self.vars.srecs.len() {
      if self.vars.srecs[ri].status.contains(Status::DEAD) {
        continue;
      }
      for t in 0..2 {
        let rec = &self.vars.srecs[ri];
        if rec.uid[t] == 0 {
          continue;
        }
        if rec.status.contains(Status::gone(t)) {
          // The message was expunged; the entry is pruned or completed later.
          continue;
        }
        let mut aflags = rec.aflags[t];
        let mut dflags = rec.dflags[t];
        if rec.status.intersects(Status::DELETE | Status::PURGE) {
          if aflags.is_empty() {
            // This deletion propagation goes the other way round, or this
            // deletion of a dummy happens on the other side.
            continue;
          }
        } else if t == xt
          && (rec.status.contains(Status::EXPIRE) != rec.status.contains(Status::EXPIRED))
        {
          // The trigger is an ongoing expiration transaction, but the actual
          // action derives from the wanted state, so that canceled
          // transactions are rolled back as well.
          if rec.status.contains(Status::NEXPIRE) {
            aflags |= Flags::DELETED;
          } else {
            dflags |= Flags::DELETED;
          }
        }
        let msg_flags = rec.msg[t].map(|mi| self.vars.msgs[t][mi].flags).unwrap_or(Flags::NONE);
        let conf = self.drv[t].conf();
        if self.ops[t].contains(OpsMask::EXPUNGE)
          && ((msg_flags | aflags) - dflags).contains(Flags::DELETED)
          && (conf.trash.is_none() || conf.trash_only_new)
        {
          // The message is going to be expunged; don't propagate anything
          // but the deletion.
          let rec = &mut self.vars.srecs[ri];
          rec.aflags[t] = rec.aflags[t] & Flags::DELETED;
          aflags = aflags & Flags::DELETED;
          rec.dflags[t] = Flags::NONE;
          dflags = Flags::NONE;
        }
        let rec = &self.vars.srecs[ri];
        if let Some(mi) = rec.msg[t] {
          if self.vars.msgs[t][mi].status.contains(MsgStatus::FLAGS) {
            // The target message's state is known, so non-changes can be
            // optimized away.
            aflags = aflags - self.vars.msgs[t][mi].flags;
            dflags = dflags & self.vars.msgs[t][mi].flags;
          }
        }
        if !aflags.is_empty() || !dflags.is_empty() {
          self.stats.flags[t] += 1;
          let uid = rec.uid[t];
          match self.drv[t].set_msg_flags(uid, aflags, dflags) {
            Ok(()) => planned.push((ri, t, aflags, dflags)),
            Err(error) if error.kind == ErrorKind::Message => {
              self.fail(t, &error, "cannot update message flags");
            }
            Err(error) => {
              self.fail(t, &error, "cannot update message flags");
              return Err(Interrupt::Aborted);
            }
          }
        } else {
          self.flags_set_p2(ri, t)?;
        }
      }
    }
    for t in 0..2 {
      let result = self.drv[t].commit_cmds();
      let failed = self.check(t, result, "cannot commit flag updates")?;
      for &(ri, pt, aflags, dflags) in planned.iter().filter(|&&(_, pt, ..)| pt == t) {
        if failed.contains(&self.vars.srecs[ri].uid[t]) {
          self.vars.ret |= SYNC_FAIL;
          continue;
        }
        let rec = &mut self.vars.srecs[ri];
        if aflags.contains(Flags::DELETED) {
          rec.status |= Status::del(t);
        } else if dflags.contains(Flags::DELETED) {
          rec.status = rec.status - Status::del(t);
        }
        // Mirror the store's new state in the loaded message.
        if let Some(mi) = self.vars.srecs[ri].msg[t] {
          let msg = &mut self.vars.msgs[t][mi];
          msg.flags = (msg.flags | aflags) - dflags;
        }
        self.flags_set_p2(ri, pt)?;
      }
      self.absorb_expunges(t);
    }
    Ok(())
  }

  fn flags_set_p2(&mut self, ri: usize, t: usize) -> Flow<()> {
    let xt = self.vars.chan.expire_side;
    let rec = &mut self.vars.srecs[ri];
    if rec.status.contains(Status::PURGE) {
      let (uf, un) = (rec.uid[F], rec.uid[N]);
      rec.status = (rec.status - Status::PURGE) | Status::PURGED;
      self.vars.jlog(format!("P {uf} {un}"), "deleted dummy")?;
    } else if !rec.status.contains(Status::DELETE) {
      let nflags = (rec.flags | rec.aflags[t]) - rec.dflags[t];
      if rec.flags != nflags {
        let (uf, un, old) = (rec.uid[F], rec.uid[N], rec.flags);
        rec.flags = nflags;
        self.vars.jlog(
          format!("* {uf} {un} {}", nflags.0),
          &format!("{}ed flags {nflags}; were {old}", dir_name(t)),
        )?;
      }
      if t == xt {
        let rec = &self.vars.srecs[ri];
        let ex = rec.status.contains(Status::EXPIRE);
        let exd = rec.status.contains(Status::EXPIRED);
        if ex != exd {
          let nex = rec.status.contains(Status::NEXPIRE);
          if nex == ex {
            if nex && self.vars.maxxfuid < rec.uid[t ^ 1] {
              self.vars.maxxfuid = rec.uid[t ^ 1];
            }
            let rec = &mut self.vars.srecs[ri];
            rec.status =
              if nex { rec.status | Status::EXPIRED } else { rec.status - Status::EXPIRED };
            let (uf, un, st) = (rec.uid[F], rec.uid[N], rec.status & Status::LOGGED);
            self.vars.jlog(
              format!("~ {uf} {un} {}", st.0),
              &format!("expired {} - commit", nex as u32),
            )?;
          } else {
            let rec = &mut self.vars.srecs[ri];
            rec.status =
              if nex { rec.status | Status::EXPIRE } else { rec.status - Status::EXPIRE };
            let (uf, un, st) = (rec.uid[F], rec.uid[N], rec.status & Status::LOGGED);
            self.vars.jlog(
              format!("~ {uf} {un} {}", st.0),
              &format!("expire {} - cancel", nex as u32),
            )?;
          }
        }
      }
    }
    Ok(())
  }

  fn propagate_new(&mut self) -> Flow<()> {
    log::debug!("propagating new messages");
    for t in 0..2 {
      if self.any_new[t] {
        self.vars.finduid[t] = self.drv[t].uid_next();
        let finduid = self.vars.finduid[t];
        self.vars.jlog(format!("F {t} {finduid}"), &format!("save UIDNEXT of {}", side_name(t)))?;
      }
    }
    if self.any_new[F] || self.any_new[N] {
      // TUID assignment is fsynced en bloc; a crash could otherwise lead to
      // the newly propagated messages becoming duplicated.
      for ri in 0..self.vars.srecs.len() {
        if self.vars.srecs[ri].status.contains(Status::PENDING)
          && !self.vars.srecs[ri].status.contains(Status::DEAD)
          && self.vars.srecs[ri].tuid.is_none()
        {
          self.vars.assign_tuid(ri)?;
        }
      }
      self.vars.fsync_journal()?;
    }
    for t in 0..2 {
      if !self.any_new[t] {
        continue;
      }
      for mi in 0..self.vars.msgs[t ^ 1].len() {
        let msg = &self.vars.msgs[t ^ 1][mi];
        if msg.status.contains(MsgStatus::DEAD) {
          continue;
        }
        let Some(ri) = msg.srec else { continue };
        if !self.vars.srecs[ri].status.contains(Status::PENDING) {
          continue;
        }
        self.stats.new[t] += 1;
        self.copy_msg(ri, mi, t)?;
        self.absorb_expunges(t ^ 1);
      }
    }
    Ok(())
  }

  /// Copies one pending message from side t^1 to side t.
  fn copy_msg(&mut self, ri: usize, mi: usize, t: usize) -> Flow<()> {
    let u = t ^ 1;
    let src_uid = self.vars.msgs[u][mi].uid;
    let src_size = self.vars.msgs[u][mi].size;
    let minimal = self.vars.srecs[ri].status.contains(Status::dummy(t));
    if src_size > self.vars.settings.buffer_limit {
      log::debug!("message {src_uid} exceeds the buffer limit; copying anyway");
    }
    let wants_date = self.vars.chan.use_internal_date;
    let mut data = match self.drv[u].fetch_msg(src_uid, wants_date, minimal) {
      Ok(data) => data,
      Err(error) if error.kind == ErrorKind::Message => {
        self.absorb_expunges(u);
        if self.vars.msgs[u][mi].status.contains(MsgStatus::DEAD) {
          // The message was expunged under our feet; this is no error.
        } else {
          self.fail(u, &error, "cannot fetch message");
        }
        let rec = &mut self.vars.srecs[ri];
        rec.status = Status::DEAD;
        let (uf, un) = (rec.uid[F], rec.uid[N]);
        self.vars.jlog(format!("- {uf} {un}"), &format!("{} failed", dir_name(t)))?;
        return Ok(());
      }
      Err(error) => {
        self.fail(u, &error, "cannot fetch message");
        return Err(Interrupt::Aborted);
      }
    };

    let rec = &self.vars.srecs[ri];
    if rec.status.contains(Status::UPGRADE) {
      data.flags = (rec.pflags | rec.aflags[t]) - rec.dflags[t];
      if !rec.aflags[t].is_empty() || !rec.dflags[t].is_empty() {
        let (uf, un, af, df) = (rec.uid[F], rec.uid[N], rec.aflags[t], rec.dflags[t]);
        self.vars.jlog(
          format!("$ {uf} {un} {} {}", af.0, df.0),
          &format!("{}ing upgrade with flags: +{af} -{df}", dir_name(t)),
        )?;
      }
    } else {
      data.flags = self.sanitize_flags(self.vars.msgs[u][mi].flags, t);
      if self.vars.srecs[ri].status.contains(Status::dummy(t)) {
        data.flags = data.flags - Flags::FLAGGED;
      }
      if !data.flags.is_empty() {
        let rec = &mut self.vars.srecs[ri];
        rec.pflags = data.flags;
        let (uf, un, pf) = (rec.uid[F], rec.uid[N], rec.pflags);
        self.vars.jlog(
          format!("% {uf} {un} {}", pf.0),
          &format!("{}ing with flags {pf}", dir_name(t)),
        )?;
      }
    }

    let in_cr = self.drv[u].caps().contains(crate::driver::Caps::CRLF);
    let out_cr = self.drv[t].caps().contains(crate::driver::Caps::CRLF);
    let tuid = self.vars.srecs[ri].tuid;
    match convert::convert_msg(&data.bytes, in_cr, out_cr, tuid, minimal, src_size, &mut data.flags)
    {
      Ok(bytes) => data.bytes = bytes,
      Err(reason) => {
        log::error!(
          "Error: message {src_uid} from {} {reason}; skipping.",
          side_name(u)
        );
        self.vars.ret |= SYNC_FAIL;
        let rec = &mut self.vars.srecs[ri];
        rec.status = Status::DEAD;
        let (uf, un) = (rec.uid[F], rec.uid[N]);
        self.vars.jlog(format!("- {uf} {un}"), &format!("{} failed", dir_name(t)))?;
        return Ok(());
      }
    }

    match self.drv[t].store_msg(&data, false) {
      Ok(0) => {
        self.need_find[t] = true;
        Ok(())
      }
      Ok(uid) => {
        self.vars.log_assign_uid(ri, t, uid, &format!("{}ed message", dir_name(t)))?;
        Ok(())
      }
      Err(error) if error.kind == ErrorKind::Message => {
        log::error!(
          "Error: {} refuses to store message {src_uid} from {}.",
          side_name(t),
          side_name(u)
        );
        self.fail(t, &error, "cannot store message");
        let rec = &mut self.vars.srecs[ri];
        rec.status = Status::DEAD;
        let (uf, un) = (rec.uid[F], rec.uid[N]);
        self.vars.jlog(format!("- {uf} {un}"), &format!("{} failed", dir_name(t)))?;
        Ok(())
      }
      Err(error) => {
        self.fail(t, &error, "cannot store message");
        Err(Interrupt::Aborted)
      }
    }
  }

  fn find_new(&mut self) -> Flow<()> {
    for t in 0..2 {
      if !self.need_find[t] {
        continue;
      }
      log::debug!("finding just copied messages on {}", side_name(t));
      let finduid = self.vars.finduid[t];
      let result = self.drv[t].find_new_msgs(finduid);
      let found = self.check(t, result, "cannot find new messages")?;
      let from = self.vars.msgs[t].len();
      for msg in found {
        if self.vars.by_uid[t].contains_key(&msg.uid) {
          continue;
        }
        self.vars.by_uid[t].insert(msg.uid, self.vars.msgs[t].len());
        self.vars.msgs[t].push(msg);
      }
      log::debug!("matching just copied messages on {}", side_name(t));
      let num_lost = self.vars.match_tuids(t, from)?;
      if num_lost > 0 {
        log::warn!("Warning: lost track of {num_lost} {}ed message(s)", dir_name(t));
      }
    }
    Ok(())
  }

  fn trash(&mut self) -> Flow<()> {
    let xt = self.vars.chan.expire_side;
    for t in 0..2 {
      if self.ops[t].contains(OpsMask::EXPUNGE) {
        for msg in self.vars.msgs[t].iter_mut() {
          if !msg.status.contains(MsgStatus::DEAD) && msg.flags.contains(Flags::DELETED) {
            msg.status |= MsgStatus::EXPUNGE;
          }
        }
      }
      let conf = self.drv[t].conf();
      let other = self.drv[t ^ 1].conf();
      let (remote, only_new) = if conf.trash.is_some() {
        log::debug!(
          "trashing {} on {} locally",
          if conf.trash_only_new { "new" } else { "all" },
          side_name(t)
        );
        (false, conf.trash_only_new)
      } else if other.trash.is_some() && other.trash_remote_new {
        log::debug!("trashing new on {} remotely", side_name(t));
        (true, true)
      } else {
        continue;
      };
      for mi in 0..self.vars.msgs[t].len() {
        let msg = &self.vars.msgs[t][mi];
        if msg.status.contains(MsgStatus::DEAD) || !msg.status.contains(MsgStatus::EXPUNGE) {
          continue;
        }
        let uid = msg.uid;
        if let Some(ri) = msg.srec {
          let rec = &self.vars.srecs[ri];
          if t == xt && rec.status.intersects(Status::EXPIRE | Status::EXPIRED) {
            // Don't trash messages that are deleted only due to expiring.
            log::debug!("  message {uid} is expired");
            continue;
          }
          if rec.status.contains(Status::dummy(t)) {
            log::debug!("  message {uid} is a dummy");
            continue;
          }
          if rec.status.contains(Status::PURGED) {
            log::debug!("  message {uid} is a deleted dummy");
            continue;
          }
          if only_new
            && !rec.status.intersects(Status::dummy(t ^ 1) | Status::SKIPPED)
          {
            log::debug!("  message {uid} is not new");
            continue;
          }
        }
        if self.vars.trashed[t].binary_search(&uid).is_ok() {
          log::debug!("  message {uid} was already trashed");
          continue;
        }
        log::debug!("  trashing message {uid}");
        self.stats.trash[t] += 1;
        let ok = if !remote {
          match self.drv[t].trash_msg(uid) {
            Ok(()) => true,
            Err(error) if error.kind == ErrorKind::Message => {
              self.absorb_expunges(t);
              if !self.vars.msgs[t][mi].status.contains(MsgStatus::DEAD) {
                self.fail(t, &error, "cannot trash message");
                if self.vars.opts[t].contains(OpenOptions::UID_EXPUNGE) {
                  self.vars.msgs[t][mi].status = self.vars.msgs[t][mi].status - MsgStatus::EXPUNGE;
                } else {
                  self.trash_bad[t] = true;
                }
              }
              false
            }
            Err(error) => {
              self.fail(t, &error, "cannot trash message");
              return Err(Interrupt::Aborted);
            }
          }
        } else {
          self.remote_trash_msg(t, mi)?
        };
        if ok {
          self.vars.jlog(format!("T {t} {uid}"), &format!("trashed on {}", side_name(t)))?;
          // Keep the replay lookup list usable.
          let pos = self.vars.trashed[t].partition_point(|&u| u < uid);
          self.vars.trashed[t].insert(pos, uid);
        }
      }
    }
    Ok(())
  }

  /// Copies a message into the other side's trash folder.
  fn remote_trash_msg(&mut self, t: usize, mi: usize) -> Flow<bool> {
    let u = t ^ 1;
    let uid = self.vars.msgs[t][mi].uid;
    let mut data = match self.drv[t].fetch_msg(uid, false, false) {
      Ok(data) => data,
      Err(error) if error.kind == ErrorKind::Message => {
        self.absorb_expunges(t);
        if !self.vars.msgs[t][mi].status.contains(MsgStatus::DEAD) {
          self.fail(t, &error, "cannot fetch message for trashing");
        }
        return Ok(false);
      }
      Err(error) => {
        self.fail(t, &error, "cannot fetch message for trashing");
        return Err(Interrupt::Aborted);
      }
    };
    let in_cr = self.drv[t].caps().contains(crate::driver::Caps::CRLF);
    let out_cr = self.drv[u].caps().contains(crate::driver::Caps::CRLF);
    if in_cr != out_cr {
      match convert::convert_msg(&data.bytes, in_cr, out_cr, None, false, 0, &mut data.flags) {
        Ok(bytes) => data.bytes = bytes,
        Err(reason) => {
          log::error!("Error: message {uid} from {} {reason}; skipping.", side_name(t));
          self.vars.ret |= SYNC_FAIL;
          return Ok(false);
        }
      }
    }
    match self.drv[u].store_msg(&data, true) {
      Ok(_) => Ok(true),
      Err(error) if error.kind == ErrorKind::Message => {
        self.fail(u, &error, "cannot store message to trash");
        if self.vars.opts[t].contains(OpenOptions::UID_EXPUNGE) {
          self.vars.msgs[t][mi].status = self.vars.msgs[t][mi].status - MsgStatus::EXPUNGE;
        } else {
          self.trash_bad[t] = true;
        }
        Ok(false)
      }
      Err(error) => {
        self.fail(u, &error, "cannot store message to trash");
        Err(Interrupt::Aborted)
      }
    }
  }

  fn expunge(&mut self) -> Flow<()> {
    for t in 0..2 {
      if !self.ops[t].contains(OpsMask::EXPUNGE)
        || self.vars.settings.fake_expunge
        || self.trash_bad[t]
      {
        continue;
      }
      log::debug!("expunging {}", side_name(t));
      let mode = if self.vars.opts[t].contains(OpenOptions::UID_EXPUNGE) {
        let uids: Vec<u32> = self
          .vars
          .msgs[t]
          .iter()
          .filter(|msg| {
            !msg.status.contains(MsgStatus::DEAD) && msg.status.contains(MsgStatus::EXPUNGE)
          })
          .map(|msg| msg.uid)
          .collect();
        ExpungeMode::Uids(uids)
      } else {
        ExpungeMode::Sweep
      };
      let result = self.drv[t].close_box(mode);
      let closed = self.check(t, result, "cannot expunge mailbox")?;
      if closed.reported {
        for uid in closed.expunged {
          self.stats.expunge[t] += 1;
          if let Some(&mi) = self.vars.by_uid[t].get(&uid) {
            let msg = &mut self.vars.msgs[t][mi];
            msg.status |= MsgStatus::DEAD;
            if let Some(ri) = msg.srec.take() {
              self.vars.srecs[ri].status |= Status::gone(t);
              self.vars.srecs[ri].msg[t] = None;
            }
          }
        }
      } else {
        // It is theoretically possible that a message was concurrently
        // undeleted before the expunge; such a message would be subsequently
        // re-propagated by a refresh, so this is only a fallback.
        for rec in self.vars.srecs.iter_mut() {
          if rec.status.contains(Status::DEAD) {
            continue;
          }
          if rec.status.contains(Status::del(t)) {
            rec.status |= Status::gone(t);
            self.stats.expunge[t] += 1;
          }
        }
      }
      self.absorb_expunges(t);
    }
    Ok(())
  }

  fn finish(&mut self) -> Flow<()> {
    // All logging done here is merely for the journal replay autotest: the
    // operations are idempotent, and the new state is committed right
    // afterwards anyway.
    for t in 0..2 {
      // Committing maxuid is delayed until all messages were propagated, so
      // that all pending messages are still loaded next time in case of
      // interruption.
      self.vars.maxuid[t] = self.vars.newmaxuid[t];
      if self.vars.maxuid[t] != self.vars.oldmaxuid[t] {
        let maxuid = self.vars.maxuid[t];
        self
          .vars
          .jlog_pc(format!("N {t} {maxuid}"), &format!("up maxuid of {}", side_name(t)))?;
      }
    }

    log::debug!("purging obsolete entries");
    let xt = self.vars.chan.expire_side;
    for ri in 0..self.vars.srecs.len() {
      let rec = &self.vars.srecs[ri];
      if rec.status.contains(Status::DEAD) {
        continue;
      }
      let status = rec.status;
      let uid = rec.uid;
      let (uf, un) = (uid[F], uid[N]);
      let gone = |t: usize| uid[t] == 0 || status.contains(Status::gone(t));
      if status.contains(Status::EXPIRED)
        && gone(xt)
        && self.vars.maxuid[xt ^ 1] >= uid[xt ^ 1]
        && self.vars.maxxfuid >= uid[xt ^ 1]
      {
        self.vars.srecs[ri].status = Status::DEAD;
        self.vars.jlog_pc(format!("- {uf} {un}"), "killing expired")?;
      } else if gone(N) {
        if gone(F) {
          self.vars.srecs[ri].status = Status::DEAD;
          self.vars.jlog_pc(format!("- {uf} {un}"), "killing")?;
        } else if uid[N] != 0 && status.contains(Status::DEL_F) {
          self.vars.srecs[ri].uid[N] = 0;
          self.vars.jlog_pc(format!("> {uf} {un} 0"), "orphaning")?;
        }
      } else if uid[F] != 0
        && status.contains(Status::GONE_F)
        && status.contains(Status::DEL_N)
      {
        self.vars.srecs[ri].uid[F] = 0;
        self.vars.jlog_pc(format!("< {uf} {un} 0"), "orphaning")?;
      }
    }

    self.vars.save_state()?;
    Ok(())
  }
}
