// Mailbox sequence-number bookkeeping.
//
// IMAP identifies messages in EXPUNGE responses by 1-based sequence numbers,
// and sequence numbers renumber after every expunge. The list of known
// messages is kept sorted by UID, with each entry's seq stored *relative* to
// its predecessor; dead entries contribute to the jump but carry no sequence
// of their own. An expunge walks a cursor along the relative offsets, so a
// burst of expunges near the same position costs O(|delta seq|) rather than
// O(messages). Before FETCH responses are interpreted the list is switched to
// absolute form, and back to relative afterwards.

use crate::driver::{Flags, MsgStatus, Tuid};
use std::collections;

#[derive(Debug)]
pub struct ImapMessage {
  pub uid: u32,
  pub seq: u32,
  pub flags: Flags,
  pub status: MsgStatus,
  pub size: u32,
  pub tuid: Option<Tuid>,
  pub msgid: Option<String>,
}

impl ImapMessage {
  fn new(seq: u32, uid: u32) -> Self {
    Self {
      uid,
      seq,
      flags: Flags::NONE,
      status: MsgStatus::NONE,
      size: 0,
      tuid: None,
      msgid: None,
    }
  }
}

#[derive(Debug, Default)]
pub struct ImapMessages {
  msgs: Vec<ImapMessage>,
  by_uid: collections::HashMap<u32, usize>,
  // (index, absolute seq at that index); Some iff in relative representation.
  cursor: Option<(usize, u32)>,
}

impl ImapMessages {
  pub fn reset(&mut self) {
    self.msgs.clear();
    self.by_uid.clear();
    self.cursor = None;
  }

  pub fn len(&self) -> usize {
    self.msgs.len()
  }

  pub fn iter(&self) -> impl Iterator<Item = &ImapMessage> {
    self.msgs.iter()
  }

  pub fn get(&self, index: usize) -> &ImapMessage {
    &self.msgs[index]
  }

  pub fn get_mut(&mut self, index: usize) -> &mut ImapMessage {
    &mut self.msgs[index]
  }

  pub fn find_uid(&self, uid: u32) -> Option<usize> {
    self.by_uid.get(&uid).copied()
  }

  /// Appends a message with an absolute sequence number. Only valid in
  /// absolute representation (i.e. during a load).
  pub fn append(&mut self, seq: u32, uid: u32) -> usize {
    debug_assert!(self.cursor.is_none());
    let index = self.msgs.len();
    self.msgs.push(ImapMessage::new(seq, uid));
    self.by_uid.insert(uid, index);
    index
  }

  pub fn ensure_relative(&mut self) {
    if self.cursor.is_some() {
      return;
    }
    if self.msgs.is_empty() {
      return;
    }
    self.msgs.sort_by_key(|msg| msg.uid);
    self.by_uid = self.msgs.iter().enumerate().map(|(i, msg)| (msg.uid, i)).collect();
    let mut previous = 0;
    for msg in self.msgs.iter_mut() {
      let absolute = msg.seq;
      msg.seq = absolute - previous;
      previous = absolute;
    }
    self.cursor = Some((0, self.msgs[0].seq));
  }

  pub fn ensure_absolute(&mut self) {
    if self.cursor.is_none() {
      return;
    }
    let mut seq = 0;
    for msg in self.msgs.iter_mut() {
      seq += msg.seq;
      msg.seq = seq;
    }
    self.cursor = None;
  }

  /// Processes an EXPUNGE response for the given (1-based) sequence number.
  /// Returns the index of the newly dead message, if it was known.
  pub fn expunge(&mut self, fseq: u32) -> Option<usize> {
    self.ensure_relative();
    let (mut index, mut seq) = self.cursor?;
    let mut ret = None;
    loop {
      let msg = &self.msgs[index];
      if seq == fseq && !msg.status.contains(MsgStatus::DEAD) {
        self.msgs[index].status |= MsgStatus::DEAD;
        ret = Some(index);
        break;
      }
      if seq < fseq {
        if index + 1 == self.msgs.len() {
          // Expunge of a message beyond the known range; nothing renumbers.
          self.cursor = Some((index, seq));
          return None;
        }
        index += 1;
        seq += self.msgs[index].seq;
      } else {
        if index == 0 {
          break;
        }
        let pseq = seq - msg.seq;
        if pseq < fseq {
          break;
        }
        seq = pseq;
        index -= 1;
      }
    }
    // All subsequent messages renumber: shrink the jump at the stop position.
    assert!(self.msgs[index].seq > 0);
    self.msgs[index].seq -= 1;
    seq -= 1;
    self.cursor = Some((index, seq));
    ret
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn init(input: &[u32]) -> ImapMessages {
    let mut msgs = ImapMessages::default();
    for &seq in input {
      // The initial sequence number doubles as the UID; not exactly
      // realistic, but valid, and it keeps the tables readable.
      msgs.append(seq, seq);
    }
    msgs
  }

  fn check(msgs: &mut ImapMessages, expunges: &[u32], alive: &[u32], name: &str) {
    for &seq in expunges {
      msgs.expunge(seq);
    }
    let actual: Vec<u32> = msgs
      .iter()
      .filter(|msg| !msg.status.contains(MsgStatus::DEAD))
      .map(|msg| msg.uid)
      .collect();
    assert_eq!(alive, actual, "{name}");
    // The relative offsets must stay consistent: every live message keeps a
    // positive jump, and converting to absolute and back is lossless.
    let relative: Vec<u32> = msgs.iter().map(|msg| msg.seq).collect();
    msgs.ensure_absolute();
    msgs.ensure_relative();
    let again: Vec<u32> = msgs.iter().map(|msg| msg.seq).collect();
    assert_eq!(relative, again, "{name}: relative representation not stable");
  }

  #[test]
  fn full_forward() {
    let mut msgs = init(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17]);
    check(
      &mut msgs,
      &[18, 13, 13, 13, 1, 1, 1],
      &[4, 5, 6, 7, 8, 9, 10, 11, 12, 16, 17],
      "full, forward 1",
    );
    check(&mut msgs, &[10, 10], &[4, 5, 6, 7, 8, 9, 10, 11, 12], "full, forward 2");
  }

  #[test]
  fn full_backward() {
    let mut msgs = init(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17]);
    check(
      &mut msgs,
      &[18, 17, 16, 15, 14, 13, 5, 4, 3],
      &[1, 2, 6, 7, 8, 9, 10, 11, 12],
      "full, backward 1",
    );
    check(&mut msgs, &[2, 1], &[6, 7, 8, 9, 10, 11, 12], "full, backward 2");
  }

  #[test]
  fn hole_without_one() {
    let input = [10, 11, 12, 20, 21, 31, 32, 33, 34, 35, 36, 37];
    let alive = [10, 12, 20, 32, 33, 34, 35, 36, 37];

    let mut msgs = init(&input);
    check(&mut msgs, &[31, 30, 29, 28, 22, 21, 11, 2, 1], &alive, "hole w/o 1, backward");

    let mut msgs = init(&input);
    check(&mut msgs, &[1, 1, 9, 18, 18, 23, 23, 23, 23], &alive, "hole w/o 1, forward");
    check(&mut msgs, &[1], &alive, "hole w/o 1, forward 2");
    check(&mut msgs, &[1; 26], &[37], "hole w/o 1, forward 3");
    check(&mut msgs, &[1], &[], "hole w/o 1, forward 4");
    check(&mut msgs, &[1], &[], "hole w/o 1, forward 5");
  }

  #[test]
  fn hole_with_one() {
    let input = [1, 10, 11, 12];

    let mut msgs = init(&input);
    check(&mut msgs, &[11, 10, 2, 1], &[12], "hole w/ 1, backward");
    check(&mut msgs, &[1], &[12], "hole w/ 1, backward 2");

    let mut msgs = init(&input);
    check(&mut msgs, &[1, 1, 8, 8], &[12], "hole w/ 1, forward");
    let mut msgs = init(&input);
    check(&mut msgs, &[1; 7], &[12], "hole w/ 1, forward 2");
    check(&mut msgs, &[1], &[], "hole w/ 1, forward 3");
    check(&mut msgs, &[1], &[], "hole w/ 1, forward 4");
  }
}
