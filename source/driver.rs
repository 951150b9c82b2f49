// The uniform store abstraction both the IMAP and the Maildir drivers
// implement. The sync engine only ever talks to `dyn Driver`.

use std::{error, fmt, path, result, time};

pub const TUID_LEN: usize = 12;

/// Transient UID: a random token injected as an X-TUID header so a just-stored
/// message can be recognized even when the driver cannot report its new UID.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Tuid(pub [u8; TUID_LEN]);

impl fmt::Display for Tuid {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    // The alphabet is pure ASCII.
    write!(formatter, "{}", std::str::from_utf8(&self.0).unwrap())
  }
}

impl fmt::Debug for Tuid {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "Tuid({self})")
  }
}

impl std::str::FromStr for Tuid {
  type Err = anyhow::Error;

  fn from_str(s: &str) -> anyhow::Result<Self> {
    anyhow::ensure!(s.len() == TUID_LEN, "TUID {s:?} is not {TUID_LEN} characters");
    let mut tuid = [0; TUID_LEN];
    tuid.copy_from_slice(s.as_bytes());
    Ok(Tuid(tuid))
  }
}

macro_rules! bit_set {
  ($name:ident, $repr:ty, $(($constant:ident, $char:literal)),+ $(,)?) => {
    #[derive(Clone, Copy, Default, PartialEq, Eq)]
    pub struct $name(pub $repr);

    impl $name {
      bit_set!(@constants 0, $(($constant, $char)),+);

      pub const NONE: Self = Self(0);

      pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
      }

      pub fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
      }

      pub fn is_empty(self) -> bool {
        self.0 == 0
      }
    }

    impl ::std::ops::BitOr for $name {
      type Output = Self;
      fn bitor(self, other: Self) -> Self {
        Self(self.0 | other.0)
      }
    }

    impl ::std::ops::BitOrAssign for $name {
      fn bitor_assign(&mut self, other: Self) {
        self.0 |= other.0;
      }
    }

    impl ::std::ops::BitAnd for $name {
      type Output = Self;
      fn bitand(self, other: Self) -> Self {
        Self(self.0 & other.0)
      }
    }

    impl ::std::ops::BitAndAssign for $name {
      fn bitand_assign(&mut self, other: Self) {
        self.0 &= other.0;
      }
    }

    impl ::std::ops::Not for $name {
      type Output = Self;
      fn not(self) -> Self {
        Self(!self.0)
      }
    }

    impl ::std::ops::Sub for $name {
      type Output = Self;
      fn sub(self, other: Self) -> Self {
        Self(self.0 & !other.0)
      }
    }

    impl fmt::Display for $name {
      fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        $(
          if self.contains(Self::$constant) {
            write!(formatter, "{}", $char)?;
          }
        )+
        Ok(())
      }
    }

    impl fmt::Debug for $name {
      fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "{}({})", stringify!($name), self)
      }
    }
  };
  (@constants $shift:expr, ($constant:ident, $char:literal)) => {
    pub const $constant: Self = Self(1 << ($shift));
  };
  (@constants $shift:expr, ($constant:ident, $char:literal), $(($rest:ident, $rest_char:literal)),+) => {
    pub const $constant: Self = Self(1 << ($shift));
    bit_set!(@constants ($shift) + 1, $(($rest, $rest_char)),+);
  };
}

pub(crate) use bit_set;

// Message flags, ordered like the alphabetical maildir info suffix.
bit_set!(Flags, u8,
  (DRAFT, 'D'),
  (FLAGGED, 'F'),
  (FORWARDED, 'P'),
  (ANSWERED, 'R'),
  (SEEN, 'S'),
  (DELETED, 'T'),
);

impl Flags {
  pub const ALL: Self = Self(0x3f);

  /// Parses a (subset of a) "DFPRST" suffix; unknown characters are reported
  /// back so the caller can decide whether they are fatal.
  pub fn parse(s: &str) -> (Self, Option<char>) {
    let mut flags = Self::NONE;
    for c in s.chars() {
      match c {
        'D' => flags |= Self::DRAFT,
        'F' => flags |= Self::FLAGGED,
        'P' => flags |= Self::FORWARDED,
        'R' => flags |= Self::ANSWERED,
        'S' => flags |= Self::SEEN,
        'T' => flags |= Self::DELETED,
        other => return (flags, Some(other)),
      }
    }
    (flags, None)
  }
}

// Per-message driver status.
bit_set!(MsgStatus, u8,
  (RECENT, 'r'),
  (DEAD, 'd'),
  (FLAGS, 'f'),
  (EXPUNGE, 'x'),
);

// The engine requests these before load; the driver returns the subset it
// honors, possibly widened by implicitly needed ranges.
bit_set!(OpenOptions, u16,
  (OLD, 'o'),
  (NEW, 'n'),
  (PAIRED, 'p'),
  (PAIRED_IDS, 'i'),
  (FIND, 't'),
  (FLAGS, 'f'),
  (OLD_SIZE, 'z'),
  (NEW_SIZE, 's'),
  (APPEND, 'a'),
  (SETFLAGS, 'w'),
  (EXPUNGE, 'x'),
  (UID_EXPUNGE, 'u'),
);

bit_set!(Caps, u8,
  (CRLF, 'c'),
);

/// How badly a store failed, and thus whether retrying makes sense.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailState {
  Temp,
  Wait,
  Final,
}

/// Failure scope, driving the engine's reaction per the error taxonomy:
/// message failures are skipped, mailbox failures abort the pair, store
/// failures abort the channel, cancellations are silent.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
  Message,
  Mailbox,
  Store,
  Canceled,
}

#[derive(Debug)]
pub struct DriverError {
  pub kind: ErrorKind,
  pub cause: anyhow::Error,
}

impl DriverError {
  pub fn message(cause: impl Into<anyhow::Error>) -> Self {
    Self { kind: ErrorKind::Message, cause: cause.into() }
  }

  pub fn mailbox(cause: impl Into<anyhow::Error>) -> Self {
    Self { kind: ErrorKind::Mailbox, cause: cause.into() }
  }

  pub fn store(cause: impl Into<anyhow::Error>) -> Self {
    Self { kind: ErrorKind::Store, cause: cause.into() }
  }
}

impl fmt::Display for DriverError {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "{:?} failure: {:#}", self.kind, self.cause)
  }
}

impl error::Error for DriverError {}

pub type Result<T> = result::Result<T, DriverError>;

#[derive(Debug)]
pub struct Message {
  pub uid: u32,
  /// Zero implies "not fetched".
  pub size: u32,
  pub flags: Flags,
  pub status: MsgStatus,
  pub tuid: Option<Tuid>,
  pub msgid: Option<String>,
  /// Index into the engine's sync record arena; maintained by the engine.
  pub srec: Option<usize>,
}

impl Message {
  pub fn new(uid: u32) -> Self {
    Self { uid, size: 0, flags: Flags::NONE, status: MsgStatus::NONE, tuid: None, msgid: None, srec: None }
  }
}

#[derive(Debug, Default)]
pub struct LoadResult {
  pub msgs: Vec<Message>,
  pub total: u32,
  pub recent: u32,
}

/// A message payload in transit between stores.
pub struct MsgData {
  pub bytes: Vec<u8>,
  pub flags: Flags,
  pub date: Option<time::SystemTime>,
}

impl fmt::Debug for MsgData {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    formatter
      .debug_struct("MsgData")
      .field("len", &self.bytes.len())
      .field("flags", &self.flags)
      .field("date", &self.date)
      .finish()
  }
}

/// The driver-independent part of a store's configuration.
#[derive(Clone, Debug)]
pub struct StoreConf {
  pub name: String,
  pub trash: Option<String>,
  pub trash_only_new: bool,
  pub trash_remote_new: bool,
  /// u32::MAX means unlimited.
  pub max_size: u32,
  pub map_inbox: Option<String>,
  pub flat_delim: Option<char>,
}

impl StoreConf {
  pub fn new(name: &str) -> Self {
    Self {
      name: name.to_string(),
      trash: None,
      trash_only_new: false,
      trash_remote_new: false,
      max_size: u32::MAX,
      map_inbox: None,
      flat_delim: None,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListMode {
  Inbox,
  Path,
  Both,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ExpungeMode {
  /// Close without expunging.
  None,
  /// Expunge everything marked \Deleted.
  Sweep,
  /// Expunge exactly these UIDs.
  Uids(Vec<u32>),
}

#[derive(Debug)]
pub struct CloseResult {
  /// Whether `expunged` is authoritative per message. When false, the engine
  /// falls back to assuming its own deletion marks took effect.
  pub reported: bool,
  pub expunged: Vec<u32>,
}

pub trait Driver {
  fn caps(&self) -> Caps;

  fn conf(&self) -> &StoreConf;

  fn fail_state(&self) -> FailState;

  /// Opens (or reuses) the underlying connection.
  fn connect(&mut self) -> Result<()>;

  fn list(&mut self, mode: ListMode) -> Result<Vec<String>>;

  /// Records which mailbox subsequent operations target. Does no I/O beyond
  /// name validation.
  fn select(&mut self, name: &str) -> Result<()>;

  /// The selected box' on-disk path, for stores that have one.
  fn box_path(&self) -> Option<path::PathBuf>;

  fn create_box(&mut self) -> Result<()>;

  /// Opens the selected mailbox. Ok(None) means the box does not exist.
  fn open_box(&mut self) -> Result<Option<u32>>;

  fn confirm_box_empty(&mut self) -> Result<bool>;

  /// Deletes the open mailbox, which is expected to be empty.
  fn delete_box(&mut self) -> Result<()>;

  /// Removes remaining artifacts of a deleted mailbox, as far as possible.
  fn finish_delete_box(&mut self) -> Result<()>;

  /// Negotiates the load option set; the returned value is authoritative.
  fn prepare_load(&mut self, opts: OpenOptions) -> OpenOptions;

  /// Loads messages with UIDs in [minuid, maxuid] plus the exceptions.
  /// TUIDs are populated from finduid on, Message-IDs up to pairuid;
  /// sizes according to OLD_SIZE/NEW_SIZE relative to newuid.
  fn load_box(
    &mut self,
    minuid: u32,
    maxuid: u32,
    finduid: u32,
    pairuid: u32,
    newuid: u32,
    excs: &[u32],
  ) -> Result<LoadResult>;

  /// The minimal UID the next stored message will get.
  fn uid_next(&self) -> u32;

  fn supported_flags(&self) -> Flags;

  /// Fetches a message body; minimal means "just enough for a placeholder".
  fn fetch_msg(&mut self, uid: u32, wants_date: bool, minimal: bool) -> Result<MsgData>;

  /// Stores a message; returns the new UID, or 0 when it cannot be known yet.
  fn store_msg(&mut self, data: &MsgData, to_trash: bool) -> Result<u32>;

  /// Lists messages at or above newuid, with their TUID headers populated.
  fn find_new_msgs(&mut self, newuid: u32) -> Result<Vec<Message>>;

  /// May be deferred until commit_cmds().
  fn set_msg_flags(&mut self, uid: u32, add: Flags, del: Flags) -> Result<()>;

  fn trash_msg(&mut self, uid: u32) -> Result<()>;

  /// Flushes deferred flag updates and confirms them durably. Returns the
  /// UIDs whose updates the store rejected; those are not retried.
  fn commit_cmds(&mut self) -> Result<Vec<u32>>;

  /// Drops deferred commands without issuing them.
  fn cancel_cmds(&mut self);

  fn close_box(&mut self, mode: ExpungeMode) -> Result<CloseResult>;

  /// UIDs the driver has learned were expunged behind the engine's back
  /// since the last call.
  fn drain_expunged(&mut self) -> Vec<u32>;

  /// Says goodbye to the remote end; the store is unusable afterwards.
  fn cleanup(&mut self);
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn flags_format() {
    assert_eq!("", Flags::NONE.to_string());
    assert_eq!("FS", (Flags::FLAGGED | Flags::SEEN).to_string());
    assert_eq!("DFPRST", Flags::ALL.to_string());
  }

  #[test]
  fn flags_parse() {
    assert_eq!((Flags::NONE, None), Flags::parse(""));
    assert_eq!((Flags::FLAGGED | Flags::SEEN, None), Flags::parse("FS"));
    assert_eq!((Flags::ALL, None), Flags::parse("DFPRST"));
    assert_eq!((Flags::DRAFT, Some('a')), Flags::parse("Da"));
  }

  #[test]
  fn flags_ops() {
    let flags = Flags::SEEN | Flags::DELETED;
    assert!(flags.contains(Flags::SEEN));
    assert!(!flags.contains(Flags::DRAFT));
    assert_eq!(Flags::SEEN, flags - Flags::DELETED);
    assert_eq!(Flags::DELETED, flags & Flags::DELETED);
  }

  #[test]
  fn tuid_round_trip() {
    let tuid: Tuid = "AbCd01234+/z".parse().unwrap();
    assert_eq!("AbCd01234+/z", tuid.to_string());
    assert!("short".parse::<Tuid>().is_err());
  }
}
