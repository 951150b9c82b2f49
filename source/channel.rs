// The channel orchestrator: expands mailbox patterns against both stores'
// listings, pairs the boxes up, and runs one sync per pair, aggregating the
// results.

use crate::driver::{Driver, ListMode};
use crate::sync::{self, BoxPresence, ChannelConf, Settings, Stats, F, N};
use std::cmp;

/// Glob match with IMAP-style wildcards: `*` matches anything, `%` anything
/// except the hierarchy delimiter.
fn matches(text: &str, pattern: &str) -> bool {
  let t = text.as_bytes();
  let p = pattern.as_bytes();
  fn inner(t: &[u8], p: &[u8]) -> bool {
    match p.first() {
      None => t.is_empty(),
      Some(b'*') => {
        for skip in 0..=t.len() {
          if inner(&t[skip..], &p[1..]) {
            return true;
          }
        }
        false
      }
      Some(b'%') => {
        let mut skip = 0;
        loop {
          // The hierarchy delimiter is a hard stop for %.
          if t.get(skip) == Some(&b'/') {
            return false;
          }
          if inner(&t[skip..], &p[1..]) {
            return true;
          }
          if skip == t.len() {
            return false;
          }
          skip += 1;
        }
      }
      Some(&c) => t.first() == Some(&c) && inner(&t[1..], &p[1..]),
    }
  }
  inner(t, p)
}

fn is_inbox(name: &str) -> bool {
  name == "INBOX" || name.starts_with("INBOX/")
}

fn cmp_box_names(a: &String, b: &String) -> cmp::Ordering {
  // INBOX sorts first.
  is_inbox(b).cmp(&is_inbox(a)).then_with(|| a.cmp(b))
}

/// Applies the channel's patterns to a store listing. The first matching
/// pattern wins; a `!` prefix negates.
pub fn filter_boxes(boxes: &[String], patterns: &[String]) -> Vec<String> {
  let mut result = Vec::new();
  for name in boxes {
    let mut selected = false;
    for pattern in patterns {
      let (negated, pattern) = match pattern.strip_prefix('!') {
        Some(rest) => (true, rest),
        None => (false, pattern.as_str()),
      };
      if matches(name, pattern) {
        selected = !negated;
        break;
      }
    }
    if selected {
      result.push(name.clone());
    }
  }
  result.sort_by(cmp_box_names);
  result
}

fn wanted_list_mode(patterns: &[String]) -> ListMode {
  let mut inbox = false;
  let mut path = false;
  for pattern in patterns {
    let pattern = pattern.strip_prefix('!').unwrap_or(pattern);
    if matches("INBOX", pattern) || pattern.bytes().any(|c| c == b'*' || c == b'%') {
      inbox = true;
    }
    if !pattern.starts_with("INBOX") || pattern.bytes().any(|c| c == b'*' || c == b'%') {
      path = true;
    }
  }
  match (inbox, path) {
    (true, false) => ListMode::Inbox,
    (false, true) => ListMode::Path,
    _ => ListMode::Both,
  }
}

/// Synchronizes all mailbox pairs of one channel. `box_list` optionally
/// restricts a patterned channel to specific boxes (the `channel:box1,box2`
/// command line form).
pub fn sync_channel(
  mut drv: [&mut dyn Driver; 2],
  chan: &ChannelConf,
  box_list: Option<&[String]>,
  settings: &Settings,
  stats: &mut Stats,
) -> anyhow::Result<u32> {
  let mut ret = 0;
  for t in 0..2 {
    if let Err(error) = drv[t].connect() {
      log::error!("channel {}: cannot connect {} store: {:#}", chan.name, sync::side_name(t), error.cause);
      return Ok(sync::sync_bad(t));
    }
  }

  let mut pairs: Vec<(Option<String>, [BoxPresence; 2])> = Vec::new();
  if let Some(list) = box_list {
    for name in list {
      pairs.push((Some(name.clone()), [BoxPresence::Possible; 2]));
    }
  } else if chan.patterns.is_empty() {
    // A fixed pair of boxes; their existence is probed by opening.
    pairs.push((None, [BoxPresence::Possible; 2]));
  } else {
    let mode = wanted_list_mode(&chan.patterns);
    let mut listed = [Vec::new(), Vec::new()];
    for t in 0..2 {
      match drv[t].list(mode) {
        Ok(boxes) => listed[t] = filter_boxes(&boxes, &chan.patterns),
        Err(error) => {
          log::error!(
            "channel {}: cannot list {} store: {:#}",
            chan.name,
            sync::side_name(t),
            error.cause
          );
          return Ok(sync::sync_bad(t));
        }
      }
    }
    let mut names: Vec<String> = listed[F].iter().chain(listed[N].iter()).cloned().collect();
    names.sort_by(cmp_box_names);
    names.dedup();
    for name in names {
      let present = [F, N].map(|t| {
        if listed[t].contains(&name) { BoxPresence::Present } else { BoxPresence::Absent }
      });
      pairs.push((Some(name), present));
    }
  }

  for (name, present) in pairs {
    let names = [F, N].map(|t| match &name {
      Some(name) => Some(name.as_str()),
      None => chan.boxes[t].as_deref(),
    });
    log::info!(
      "Channel {}, box {}...",
      chan.name,
      names[N].unwrap_or("INBOX")
    );
    let (far, near) = drv.split_at_mut(1);
    let pair_ret = sync::sync_boxes(
      [&mut *far[0], &mut *near[0]],
      names,
      present,
      chan,
      settings,
      stats,
    )?;
    ret |= pair_ret;
    if pair_ret & (sync::sync_bad(F) | sync::sync_bad(N)) != 0 {
      // The store connection is gone; further pairs would fail the same way.
      break;
    }
  }
  Ok(ret)
}

/// Lists the boxes a channel would synchronize, without syncing.
pub fn list_channel_boxes(
  drv: [&mut dyn Driver; 2],
  chan: &ChannelConf,
) -> anyhow::Result<Vec<String>> {
  if chan.patterns.is_empty() {
    return Ok(vec![chan.boxes[N].clone().unwrap_or_else(|| "INBOX".to_string())]);
  }
  let mut listed = Vec::new();
  for (t, drv) in drv.into_iter().enumerate() {
    drv
      .connect()
      .map_err(|e| anyhow::anyhow!("cannot connect {} store: {:#}", sync::side_name(t), e.cause))?;
    let boxes = drv
      .list(wanted_list_mode(&chan.patterns))
      .map_err(|e| anyhow::anyhow!("cannot list {} store: {:#}", sync::side_name(t), e.cause))?;
    listed.extend(filter_boxes(&boxes, &chan.patterns));
  }
  listed.sort_by(cmp_box_names);
  listed.dedup();
  Ok(listed)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn wildcards() {
    assert!(matches("INBOX", "INBOX"));
    assert!(!matches("INBOX", "inbox"));
    assert!(matches("anything", "*"));
    assert!(matches("a/b/c", "a/*"));
    // % does not cross the hierarchy delimiter.
    assert!(matches("ab", "%"));
    assert!(!matches("a/b", "%"));
    assert!(matches("INBOX/sub", "INBOX/%"));
    assert!(!matches("INBOX/a/b", "INBOX/%"));
  }

  #[test]
  fn pattern_filtering() {
    let boxes: Vec<String> =
      ["INBOX", "Sent", "Trash", "work", "work/reports"].map(String::from).to_vec();
    assert_eq!(
      vec!["INBOX", "Sent", "Trash", "work", "work/reports"],
      filter_boxes(&boxes, &["*".to_string()])
    );
    // Negations win when they match first.
    assert_eq!(
      vec!["INBOX", "Sent", "work", "work/reports"],
      filter_boxes(&boxes, &["!Trash".to_string(), "*".to_string()])
    );
    // % selects only one hierarchy level.
    assert_eq!(
      vec!["INBOX", "Sent", "Trash", "work"],
      filter_boxes(&boxes, &["%".to_string()])
    );
    // First match wins, so a later broader pattern does not resurrect.
    assert_eq!(
      Vec::<String>::new(),
      filter_boxes(&boxes, &["!*".to_string(), "*".to_string()])
    );
  }

  #[test]
  fn inbox_sorts_first() {
    let boxes: Vec<String> = ["Zoo", "INBOX", "Abc"].map(String::from).to_vec();
    assert_eq!(vec!["INBOX", "Abc", "Zoo"], filter_boxes(&boxes, &["*".to_string()]));
  }
}
