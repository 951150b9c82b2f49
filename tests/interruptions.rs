// Replay equivalence: for every interruption point P during a run,
// run-to-P + replay-journal + complete must produce the same committed state
// as running to completion without interruption. The journal step limit
// turns every journaled operation into an interruption point.

use pretty_assertions::assert_eq;
use tandem::driver::Flags;
use tandem::sync::{OpsMask, F, N};
use test_log::test;

mod common;

type Snapshot = (String, Vec<(u32, Flags, String)>, Vec<(u32, Flags, String)>);

/// A channel with some history, about to perform a run that exercises new
/// messages in both directions, flag updates, a deletion, and an expunge.
fn build() -> common::Runner {
  let mut runner = common::Runner::new();
  runner.deliver(F, "m1", &common::email("m1"), Flags::SEEN);
  runner.deliver(F, "m2", &common::email("m2"), Flags::NONE);
  runner.deliver(N, "n1", &common::email("n1"), Flags::NONE);
  assert_eq!(0, runner.sync());

  runner.deliver(F, "m3", &common::email("m3"), Flags::NONE);
  runner.deliver(N, "n2", &common::email("n2"), Flags::SEEN);
  runner.set_flags(N, 1, Flags::FLAGGED | Flags::SEEN); // m1's copy
  runner.delete_message(F, 2); // m2 disappears
  runner.chan.ops[F] |= OpsMask::EXPUNGE;
  runner.chan.ops[N] |= OpsMask::EXPUNGE;
  runner
}

fn snapshot(runner: &common::Runner) -> Snapshot {
  let state = runner.state_records();
  check_invariants(&state);
  (state, runner.messages(F), runner.messages(N))
}

/// Well-formedness and the no-duplication invariant, straight off the
/// committed state file.
fn check_invariants(state: &str) {
  let record = regex::Regex::new(r"^(\d+) (\d+) ([<>]?[\^~]?)([DFPRST]*)$").unwrap();
  let mut far_uids = Vec::new();
  let mut near_uids = Vec::new();
  let mut in_header = true;
  for line in state.lines() {
    if in_header {
      if line.is_empty() {
        in_header = false;
      }
      continue;
    }
    let captures = record.captures(line).unwrap_or_else(|| {
      panic!("malformed sync state record {line:?} in:\n{state}");
    });
    let uf: u32 = captures[1].parse().unwrap();
    let un: u32 = captures[2].parse().unwrap();
    if uf != 0 {
      assert!(!far_uids.contains(&uf), "duplicate far uid {uf} in:\n{state}");
      far_uids.push(uf);
    }
    if un != 0 {
      assert!(!near_uids.contains(&un), "duplicate near uid {un} in:\n{state}");
      near_uids.push(un);
    }
    assert!(uf != 0 || un != 0, "fully orphaned record in:\n{state}");
  }
}

#[test]
fn journal_replay_reaches_the_same_state() {
  let baseline = {
    let mut runner = build();
    assert_eq!(0, runner.sync());
    assert!(!runner.has_journal());
    snapshot(&runner)
  };

  for limit in 1..200 {
    let mut runner = build();
    runner.settings.max_journal_steps = Some(limit);
    match runner.try_sync() {
      Err(error) => {
        assert!(
          error.is::<tandem::sync::state::StepLimit>(),
          "unexpected failure at limit {limit}: {error:#}"
        );
        // The interrupted run left its journal behind.
        assert!(runner.has_journal(), "no journal after interruption at step {limit}");
        runner.settings.max_journal_steps = None;
        assert_eq!(0, runner.sync(), "resumed run failed at limit {limit}");
        assert!(!runner.has_journal());
        assert_eq!(baseline, snapshot(&runner), "divergence after interruption at step {limit}");
      }
      Ok(mask) => {
        // The limit exceeded the run's journal length; the sweep is done.
        assert_eq!(0, mask);
        assert_eq!(baseline, snapshot(&runner));
        return;
      }
    }
  }
  panic!("the run never completed within the step budget");
}

#[test]
fn tuid_lost_between_assignment_and_store() {
  // Interruptions right after the TUID is journaled, but before the body is
  // stored: the resumed run drops the TUID and re-propagates, once.
  let baseline = {
    let mut runner = common::Runner::new();
    runner.deliver(F, "m1", &common::email("m1"), Flags::NONE);
    assert_eq!(0, runner.sync());
    snapshot(&runner)
  };

  for limit in 1..20 {
    let mut runner = common::Runner::new();
    runner.deliver(F, "m1", &common::email("m1"), Flags::NONE);
    runner.settings.max_journal_steps = Some(limit);
    match runner.try_sync() {
      Err(_) => {
        runner.settings.max_journal_steps = None;
        assert_eq!(0, runner.sync());
        assert_eq!(baseline, snapshot(&runner), "divergence at step {limit}");
        // Exactly one copy made it across.
        assert_eq!(1, runner.messages(N).len());
      }
      Ok(_) => return,
    }
  }
  panic!("the run never completed within the step budget");
}

#[test]
fn tuid_matches_a_stored_but_unrecorded_message() {
  // The narrowest crash window: the TUID was journaled and the message
  // stored, but its new UID never recorded. The next run must recognize the
  // stored copy by its X-TUID header instead of appending a duplicate.
  let mut runner = common::Runner::new();
  runner.deliver(F, "m1", &common::email("m1"), Flags::NONE);
  assert_eq!(0, runner.sync());

  // Rewind the bookkeeping to just after the interruption: no committed
  // state, but a journal claiming the propagation is in flight.
  let near = runner.messages(N);
  assert_eq!(1, near.len());
  let stored = std::fs::read_dir(runner.root(N).join("new"))
    .unwrap()
    .chain(std::fs::read_dir(runner.root(N).join("cur")).unwrap())
    .map(|e| e.unwrap().path())
    .find(|p| !p.file_name().unwrap().to_string_lossy().starts_with('.'))
    .unwrap();
  let contents = std::fs::read_to_string(&stored).unwrap();
  let tuid = contents
    .lines()
    .find_map(|line| line.strip_prefix("X-TUID: "))
    .expect("the stored copy carries an X-TUID header");
  let validity = |t: usize| {
    std::fs::read_to_string(runner.root(t).join(".uidvalidity"))
      .unwrap()
      .split_whitespace()
      .next()
      .unwrap()
      .to_string()
  };
  std::fs::remove_file(runner.state_path()).unwrap();
  std::fs::write(runner.state_path().with_extension("new"), "").unwrap();
  std::fs::write(
    runner.state_path().with_extension("journal"),
    format!("5\n| {} {}\n+ 1 0\nF 1 1\n# 1 0 {tuid}\n", validity(F), validity(N)),
  )
  .unwrap();

  assert_eq!(0, runner.sync());
  // Still exactly one copy, re-adopted via the TUID.
  assert_eq!(1, runner.messages(N).len());
  assert_eq!(
    "MaxPulledUid 1\nMaxPushedUid 1\n\n1 1 \n",
    runner.state_records()
  );
}

#[test]
fn forced_journal_replays_the_final_steps() {
  // With the pre-commit entries journaled too, a run interrupted between
  // the last network operation and the state commit still converges.
  let mut runner = common::Runner::new();
  runner.settings.force_journal = true;
  runner.deliver(F, "m1", &common::email("m1"), Flags::SEEN);
  assert_eq!(0, runner.sync());
  let baseline = snapshot(&runner);

  let full = {
    let mut probe = common::Runner::new();
    probe.settings.force_journal = true;
    probe.deliver(F, "m1", &common::email("m1"), Flags::SEEN);
    assert_eq!(0, probe.sync());
    probe.deliver(F, "m2", &common::email("m2"), Flags::NONE);
    assert_eq!(0, probe.sync());
    snapshot(&probe)
  };
  assert_ne!(baseline, full);

  for limit in 1..50 {
    let mut probe = common::Runner::new();
    probe.settings.force_journal = true;
    probe.deliver(F, "m1", &common::email("m1"), Flags::SEEN);
    assert_eq!(0, probe.sync());
    probe.deliver(F, "m2", &common::email("m2"), Flags::NONE);
    probe.settings.max_journal_steps = Some(limit);
    match probe.try_sync() {
      Err(_) => {
        probe.settings.max_journal_steps = None;
        assert_eq!(0, probe.sync());
        assert_eq!(full, snapshot(&probe), "divergence at step {limit}");
      }
      Ok(_) => return,
    }
  }
  panic!("the run never completed within the step budget");
}
