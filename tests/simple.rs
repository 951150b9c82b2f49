use pretty_assertions::assert_eq;
use tandem::driver::Flags;
use tandem::sync::{OpsMask, F, N};
use test_log::test;

mod common;

#[test]
fn propagates_new_messages_both_ways() {
  let mut runner = common::Runner::new();
  runner.deliver(F, "a", &common::email("a"), Flags::NONE);
  runner.deliver(N, "b", &common::email("b"), Flags::SEEN);

  assert_eq!(0, runner.sync());

  // Both sides now hold both messages, with the source's flags.
  let far = runner.messages(F);
  assert_eq!(2, far.len());
  assert_eq!((1, Flags::NONE), (far[0].0, far[0].1));
  assert!(far[0].2.contains("body of a"));
  assert_eq!((2, Flags::SEEN), (far[1].0, far[1].1));
  assert!(far[1].2.contains("body of b"));

  let near = runner.messages(N);
  assert_eq!(2, near.len());
  assert_eq!((1, Flags::SEEN), (near[0].0, near[0].1));
  assert!(near[0].2.contains("body of b"));
  assert_eq!((2, Flags::NONE), (near[1].0, near[1].1));
  assert!(near[1].2.contains("body of a"));

  assert_eq!(
    "MaxPulledUid 2\nMaxPushedUid 2\n\n2 1 S\n1 2 \n",
    runner.state_records()
  );
  assert!(!runner.has_journal());
}

#[test]
fn second_run_is_idempotent() {
  let mut runner = common::Runner::new();
  runner.deliver(F, "a", &common::email("a"), Flags::NONE);
  runner.deliver(N, "b", &common::email("b"), Flags::SEEN);

  assert_eq!(0, runner.sync());
  let state = runner.state();
  let far = runner.messages(F);
  let near = runner.messages(N);

  assert_eq!(0, runner.sync());
  assert_eq!(state, runner.state());
  assert_eq!(far, runner.messages(F));
  assert_eq!(near, runner.messages(N));
  assert!(!runner.has_journal());
}

#[test]
fn propagates_flag_changes() {
  let mut runner = common::Runner::new();
  runner.deliver(F, "a", &common::email("a"), Flags::NONE);
  assert_eq!(0, runner.sync());

  runner.set_flags(N, 1, Flags::SEEN | Flags::FLAGGED);
  assert_eq!(0, runner.sync());

  let far = runner.messages(F);
  assert_eq!(Flags::FLAGGED | Flags::SEEN, far[0].1);
  assert_eq!(
    "MaxPulledUid 1\nMaxPushedUid 1\n\n1 1 FS\n",
    runner.state_records()
  );

  // Removal propagates too.
  runner.set_flags(F, 1, Flags::SEEN);
  assert_eq!(0, runner.sync());
  assert_eq!(Flags::SEEN, runner.messages(N)[0].1);
}

#[test]
fn propagates_deletions() {
  let mut runner = common::Runner::new();
  runner.deliver(F, "a", &common::email("a"), Flags::NONE);
  runner.deliver(F, "b", &common::email("b"), Flags::NONE);
  assert_eq!(0, runner.sync());

  runner.chan.ops[F] |= OpsMask::EXPUNGE;
  runner.chan.ops[N] |= OpsMask::EXPUNGE;
  runner.delete_message(N, 1);
  assert_eq!(0, runner.sync());

  // The far-side counterpart was deleted and expunged; the other message
  // is untouched.
  let far = runner.messages(F);
  assert_eq!(1, far.len());
  assert!(far[0].2.contains("body of b"));

  // The run made no journaled state change, so the tombstone is only
  // dropped from the committed state by the next one.
  assert_eq!(0, runner.sync());
  assert_eq!(
    "MaxPulledUid 2\nMaxPushedUid 2\n\n2 2 \n",
    runner.state_records()
  );
}

#[test]
fn masked_gone_does_not_delete() {
  let mut runner = common::Runner::new();
  runner.deliver(F, "a", &common::email("a"), Flags::NONE);
  assert_eq!(0, runner.sync());

  runner.chan.ops[F] = runner.chan.ops[F] - OpsMask::GONE;
  runner.chan.ops[N] = runner.chan.ops[N] - OpsMask::GONE;
  runner.delete_message(N, 1);
  assert_eq!(0, runner.sync());

  // The far message survives, and the pairing stays on the books.
  assert_eq!(1, runner.messages(F).len());
  assert!(!runner.messages(F)[0].1.contains(Flags::DELETED));
  assert_eq!(
    "MaxPulledUid 1\nMaxPushedUid 1\n\n1 1 \n",
    runner.state_records()
  );
}

#[test]
fn placeholder_then_upgrade() {
  let mut runner = common::Runner::new();
  runner.near_conf.max_size = 1024;
  runner.chan.ops[N] |= OpsMask::EXPUNGE;
  let message = common::email_sized("big", 4096);
  runner.deliver(F, "big", &message, Flags::NONE);

  assert_eq!(0, runner.sync());

  // The near side got a placeholder instead of the real message.
  let near = runner.messages(N);
  assert_eq!(1, near.len());
  assert_eq!(vec![(1, "[placeholder] big".to_string())], runner.subjects(N));
  assert!(near[0].2.contains("over the MaxSize limit"));
  assert!(near[0].2.contains("4KiB"));
  assert_eq!(
    "MaxPulledUid 1\nMaxPushedUid 1\n\n1 1 >\n",
    runner.state_records()
  );

  // Flagging the placeholder requests the real message.
  runner.set_flags(N, 1, Flags::FLAGGED);
  assert_eq!(0, runner.sync());

  let near = runner.messages(N);
  assert_eq!(1, near.len());
  assert_eq!(2, near[0].0);
  assert_eq!(vec![(2, "big".to_string())], runner.subjects(N));
  assert!(near[0].2.contains("body of big"));
  assert_eq!(
    "MaxPulledUid 1\nMaxPushedUid 2\n\n1 2 \n",
    runner.state_records()
  );

  // And the result is stable.
  let state = runner.state();
  assert_eq!(0, runner.sync());
  assert_eq!(state, runner.state());
}

#[test]
fn expiration_keeps_the_newest() {
  let mut runner = common::Runner::new();
  for id in ["m1", "m2", "m3", "m4", "m5"] {
    runner.deliver(F, id, &common::email(id), Flags::SEEN);
  }

  assert_eq!(0, runner.sync());
  assert_eq!(5, runner.messages(N).len());
  runner.chan.max_messages = 2;

  // The second run expires the three oldest; they are only marked deleted
  // (no Expunge was requested), and the state remembers them as expired.
  assert_eq!(0, runner.sync());
  let near = runner.messages(N);
  assert_eq!(5, near.len());
  for (uid, flags, _) in &near[..3] {
    assert!(flags.contains(Flags::DELETED), "uid {uid} should be expired");
  }
  for (uid, flags, _) in &near[3..] {
    assert!(!flags.contains(Flags::DELETED), "uid {uid} should be kept");
  }
  assert_eq!(
    "MaxPulledUid 5\nMaxPushedUid 5\nMaxExpiredFarUid 3\n\n\
     1 1 ~S\n2 2 ~S\n3 3 ~S\n4 4 S\n5 5 S\n",
    runner.state_records()
  );

  // Flagged messages are immune: flag one expired message and unexpire it.
  runner.set_flags(F, 2, Flags::FLAGGED | Flags::SEEN);
  assert_eq!(0, runner.sync());
  let near = runner.messages(N);
  assert!(!near[1].1.contains(Flags::DELETED));
  assert!(near[1].1.contains(Flags::FLAGGED));
}

#[test]
fn expired_messages_are_pruned_after_expunge() {
  let mut runner = common::Runner::new();
  for id in ["m1", "m2", "m3"] {
    runner.deliver(F, id, &common::email(id), Flags::SEEN);
  }
  assert_eq!(0, runner.sync());
  runner.chan.max_messages = 1;
  assert_eq!(0, runner.sync());

  runner.chan.ops[N] |= OpsMask::EXPUNGE;
  assert_eq!(0, runner.sync());
  assert_eq!(1, runner.messages(N).len());
  // The far copies stay put.
  assert_eq!(3, runner.messages(F).len());

  // The next run notices the expunged copies and prunes the tombstones,
  // without re-propagating or deleting the far originals.
  assert_eq!(0, runner.sync());
  assert_eq!(3, runner.messages(F).len());
  assert_eq!(
    "MaxPulledUid 3\nMaxPushedUid 3\nMaxExpiredFarUid 2\n\n3 3 S\n",
    runner.state_records()
  );
}

#[test]
fn trashes_before_expunging() {
  let mut runner = common::Runner::new();
  runner.near_conf.trash = Some("Trash".to_string());
  runner.chan.ops[N] |= OpsMask::EXPUNGE;
  runner.deliver(F, "a", &common::email("a"), Flags::NONE);
  runner.deliver(F, "b", &common::email("b"), Flags::NONE);
  assert_eq!(0, runner.sync());

  runner.set_flags(N, 1, Flags::DELETED);
  assert_eq!(0, runner.sync());

  // The deleted message went to the near trash, then was expunged.
  assert_eq!(1, runner.messages(N).len());
  let trash = runner.trash_messages(N, "Trash");
  assert_eq!(1, trash.len());
  assert!(trash[0].2.contains("body of a"));
}

#[test]
fn remote_trash_collects_from_the_far_side() {
  let mut runner = common::Runner::new();
  runner.near_conf.trash = Some("Trash".to_string());
  runner.near_conf.trash_remote_new = true;
  runner.chan.ops[F] |= OpsMask::EXPUNGE;
  runner.deliver(F, "a", &common::email("a"), Flags::DELETED);

  assert_eq!(0, runner.sync());

  // The far message was never propagated (doomed), but it was rescued into
  // the near-side trash before the far expunge.
  assert_eq!(0, runner.messages(F).len());
  assert_eq!(0, runner.messages(N).len());
  let trash = runner.trash_messages(N, "Trash");
  assert_eq!(1, trash.len());
  assert!(trash[0].2.contains("body of a"));
}

#[test]
fn uidvalidity_recovery_with_stable_uids() {
  let mut runner = common::Runner::new();
  runner.deliver(F, "a", &common::email("a"), Flags::NONE);
  runner.deliver(F, "b", &common::email("b"), Flags::SEEN);
  assert_eq!(0, runner.sync());
  let near_before = runner.messages(N);

  // The near store's UIDVALIDITY changes, but the messages keep their UIDs.
  let validity = runner.root(N).join(".uidvalidity");
  let contents = std::fs::read_to_string(&validity).unwrap();
  let uidnext = contents.split_whitespace().nth(1).unwrap();
  std::fs::write(&validity, format!("12345 {uidnext}\n")).unwrap();

  assert_eq!(0, runner.sync());
  assert_eq!(near_before, runner.messages(N));
  assert!(runner.state().contains("NearUidValidity 12345\n"));
}

#[test]
fn uidvalidity_recovery_by_message_id() {
  let mut runner = common::Runner::new();
  runner.deliver(F, "a", &common::email("a"), Flags::NONE);
  runner.deliver(F, "b", &common::email("b"), Flags::SEEN);
  assert_eq!(0, runner.sync());

  // The near store is rebuilt: same messages, new UIDs, new UIDVALIDITY.
  for (old, new) in [(1u32, 11u32), (2, 12)] {
    let marker = format!(",U={old}");
    for sub in ["cur", "new"] {
      let dir = runner.root(N).join(sub);
      let Ok(entries) = std::fs::read_dir(&dir) else { continue };
      for entry in entries {
        let entry = entry.unwrap();
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.contains(&marker) {
          let renamed = name.replace(&marker, &format!(",U={new}"));
          std::fs::rename(entry.path(), dir.join(renamed)).unwrap();
        }
      }
    }
  }
  std::fs::write(runner.root(N).join(".uidvalidity"), "54321 13\n").unwrap();

  assert_eq!(0, runner.sync());
  // No duplication; the near-side UIDs in the state were rewritten.
  assert_eq!(2, runner.messages(N).len());
  assert_eq!(2, runner.messages(F).len());
  assert!(runner.state().contains("NearUidValidity 54321\n"));
  let records = runner.state_records();
  assert!(records.contains("1 11 \n"), "state was: {records}");
  assert!(records.contains("2 12 S\n"), "state was: {records}");

  let state = runner.state();
  assert_eq!(0, runner.sync());
  assert_eq!(state, runner.state());
}

#[test]
fn creates_missing_boxes_on_demand() {
  let mut runner = common::Runner::new();
  runner.chan.ops[N] |= OpsMask::CREATE;
  runner.chan.patterns = vec!["*".to_string()];
  std::fs::create_dir_all(runner.root(F).join(".lists/cur")).unwrap();
  std::fs::create_dir_all(runner.root(F).join(".lists/new")).unwrap();
  std::fs::create_dir_all(runner.root(F).join(".lists/tmp")).unwrap();
  std::fs::write(
    runner.root(F).join(".lists/new/x"),
    common::email("x"),
  )
  .unwrap();

  assert_eq!(0, runner.sync());
  assert!(runner.root(N).join(".lists/cur").is_dir());
  let lists = runner.trash_messages(N, "lists");
  assert_eq!(1, lists.len());
  assert!(lists[0].2.contains("body of x"));
}
