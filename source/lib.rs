// A bidirectional mail store synchronizer: every recognized message in one
// store gets a counterpart in the other, and flag changes, deletions, and
// mailbox lifecycle events propagate according to a per-channel policy.
//
// The two concrete stores are an IMAP4rev1 server and a local Maildir++
// tree, both behind the same driver interface; the sync core treats the
// "far" and "near" sides symmetrically.

use anyhow::Context as _;
use std::{env, path};

pub mod channel;
pub mod config;
pub mod driver;
pub mod imap;
pub mod maildir;
pub mod sync;

use config::{OpsSpec, StoreDef};
use driver::Driver;
use sync::{OpsMask, Settings, Stats, F, N};

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(help = "Channels or groups to synchronize; a 'channel:box1,box2' \
                selector restricts a patterned channel to those boxes")]
  pub selectors: Vec<String>,
  #[arg(short = 'a', long = "all", help = "Synchronize all configured channels")]
  pub all: bool,
  #[arg(short = 'c', long = "config", help = "Configuration file")]
  pub config: Option<path::PathBuf>,
  #[arg(short = 'l', long = "list", help = "List the mailboxes instead of syncing them")]
  pub list: bool,
  #[arg(long = "list-stores", help = "List the raw store mailboxes")]
  pub list_stores: bool,

  #[arg(short = 'L', long = "pull", help = "Propagate from far to near only")]
  pub pull: bool,
  #[arg(short = 'H', long = "push", help = "Propagate from near to far only")]
  pub push: bool,
  #[arg(long = "new", help = "Propagate new messages")]
  pub new: bool,
  #[arg(long = "old", help = "Propagate unpropagated old messages")]
  pub old: bool,
  #[arg(long = "gone", alias = "delete", help = "Propagate deletions")]
  pub gone: bool,
  #[arg(long = "flags", help = "Propagate flag changes")]
  pub flags: bool,
  #[arg(long = "upgrade", help = "Upgrade placeholders to full messages")]
  pub upgrade: bool,
  #[arg(long = "pull-new", hide = true)]
  pub pull_new: bool,
  #[arg(long = "pull-old", hide = true)]
  pub pull_old: bool,
  #[arg(long = "pull-gone", hide = true)]
  pub pull_gone: bool,
  #[arg(long = "pull-flags", hide = true)]
  pub pull_flags: bool,
  #[arg(long = "pull-upgrade", hide = true)]
  pub pull_upgrade: bool,
  #[arg(long = "push-new", hide = true)]
  pub push_new: bool,
  #[arg(long = "push-old", hide = true)]
  pub push_old: bool,
  #[arg(long = "push-gone", hide = true)]
  pub push_gone: bool,
  #[arg(long = "push-flags", hide = true)]
  pub push_flags: bool,
  #[arg(long = "push-upgrade", hide = true)]
  pub push_upgrade: bool,

  #[arg(short = 'C', long = "create", help = "Create missing mailboxes on both sides")]
  pub create: bool,
  #[arg(long = "create-far")]
  pub create_far: bool,
  #[arg(long = "create-near")]
  pub create_near: bool,
  #[arg(long = "no-create")]
  pub no_create: bool,
  #[arg(short = 'R', long = "remove", help = "Propagate mailbox deletions")]
  pub remove: bool,
  #[arg(long = "remove-far")]
  pub remove_far: bool,
  #[arg(long = "remove-near")]
  pub remove_near: bool,
  #[arg(long = "no-remove")]
  pub no_remove: bool,
  #[arg(short = 'X', long = "expunge", help = "Expunge deleted messages")]
  pub expunge: bool,
  #[arg(long = "expunge-far")]
  pub expunge_far: bool,
  #[arg(long = "expunge-near")]
  pub expunge_near: bool,
  #[arg(long = "no-expunge")]
  pub no_expunge: bool,

  #[arg(long = "keep-journal", hide = true, help = "Keep the journal instead of committing")]
  pub keep_journal: bool,
  #[arg(long = "force-journal", hide = true, help = "Journal even pre-commit operations")]
  pub force_journal: bool,
  #[arg(long = "fake-expunge", hide = true, help = "Skip the expunge step")]
  pub fake_expunge: bool,
  #[arg(long = "max-journal-steps", hide = true, help = "Abort after this many journaled steps")]
  pub max_journal_steps: Option<u32>,
}

/// Exit code of the step-limit developer harness.
pub const EXIT_STEP_LIMIT: u8 = 100;

fn expand_home(value: &str, home: &str) -> String {
  match value.strip_prefix("~/") {
    Some(rest) => format!("{home}/{rest}"),
    None => value.to_string(),
  }
}

fn locate_config(arguments: &Arguments, home: &str) -> anyhow::Result<path::PathBuf> {
  if let Some(path) = &arguments.config {
    return Ok(path.clone());
  }
  let xdg = env::var("XDG_CONFIG_HOME").unwrap_or_else(|_| format!("{home}/.config"));
  let new_style = path::PathBuf::from(format!("{xdg}/tandemrc"));
  let legacy = path::PathBuf::from(format!("{home}/.tandemrc"));
  match (new_style.exists(), legacy.exists()) {
    (true, true) => {
      log::warn!(
        "Warning: both {new_style:?} and {legacy:?} exist; using the latter. \
         Delete it to use the former."
      );
      Ok(legacy)
    }
    (_, true) => Ok(legacy),
    (true, _) => Ok(new_style),
    (false, false) => {
      anyhow::bail!("no configuration file found (tried {new_style:?} and {legacy:?})")
    }
  }
}

fn default_state_dir(home: &str) -> path::PathBuf {
  let xdg = env::var("XDG_STATE_HOME").unwrap_or_else(|_| format!("{home}/.local/state"));
  path::PathBuf::from(xdg).join("tandem")
}

fn cli_ops(arguments: &Arguments) -> OpsSpec {
  let mut spec = OpsSpec::default();
  let mut types = OpsMask::NONE;
  for (on, mask) in [
    (arguments.new, OpsMask::NEW),
    (arguments.old, OpsMask::OLD),
    (arguments.gone, OpsMask::GONE),
    (arguments.flags, OpsMask::FLAGS),
    (arguments.upgrade, OpsMask::UPGRADE),
  ] {
    if on {
      types |= mask;
    }
  }
  // --push affects what is stored on the far side, --pull the near side.
  let compounds: [(bool, usize, OpsMask); 10] = [
    (arguments.pull_new, N, OpsMask::NEW),
    (arguments.pull_old, N, OpsMask::OLD),
    (arguments.pull_gone, N, OpsMask::GONE),
    (arguments.pull_flags, N, OpsMask::FLAGS),
    (arguments.pull_upgrade, N, OpsMask::UPGRADE),
    (arguments.push_new, F, OpsMask::NEW),
    (arguments.push_old, F, OpsMask::OLD),
    (arguments.push_gone, F, OpsMask::GONE),
    (arguments.push_flags, F, OpsMask::FLAGS),
    (arguments.push_upgrade, F, OpsMask::UPGRADE),
  ];
  let any_compound = compounds.iter().any(|&(on, ..)| on);
  if arguments.pull || arguments.push || !types.is_empty() || any_compound {
    spec.have_type = true;
    let mut dirs = [arguments.push, arguments.pull];
    if !dirs[F] && !dirs[N] {
      dirs = [true, true];
    }
    let types = if !types.is_empty() {
      types
    } else if any_compound {
      // Only the compound selections apply.
      OpsMask::NONE
    } else {
      config::OP_DFLT_TYPE
    };
    for t in 0..2 {
      if dirs[t] {
        spec.ops[t] |= types;
      }
    }
    for (on, t, mask) in compounds {
      if on {
        spec.ops[t] |= mask;
      }
    }
  }
  for (all, far, near, none, mask, have) in [
    (
      arguments.create,
      arguments.create_far,
      arguments.create_near,
      arguments.no_create,
      OpsMask::CREATE,
      &mut spec.have_create,
    ),
    (
      arguments.remove,
      arguments.remove_far,
      arguments.remove_near,
      arguments.no_remove,
      OpsMask::REMOVE,
      &mut spec.have_remove,
    ),
    (
      arguments.expunge,
      arguments.expunge_far,
      arguments.expunge_near,
      arguments.no_expunge,
      OpsMask::EXPUNGE,
      &mut spec.have_expunge,
    ),
  ] {
    if all || far || near || none {
      *have = true;
      if all || far {
        spec.ops[F] |= mask;
      }
      if all || near {
        spec.ops[N] |= mask;
      }
      if none {
        spec.ops[F] = spec.ops[F] - mask;
        spec.ops[N] = spec.ops[N] - mask;
      }
    }
  }
  spec
}

/// A channel selected for this run, possibly restricted to specific boxes.
struct Selected {
  channel: String,
  boxes: Option<Vec<String>>,
}

fn select_channels(
  arguments: &Arguments,
  config: &config::Config,
) -> anyhow::Result<Vec<Selected>> {
  if arguments.all {
    anyhow::ensure!(arguments.selectors.is_empty(), "--all conflicts with naming channels");
    return Ok(
      config
        .channels
        .iter()
        .map(|chan| Selected { channel: chan.name.clone(), boxes: None })
        .collect(),
    );
  }
  anyhow::ensure!(
    !arguments.selectors.is_empty(),
    "no channels selected; name some or pass --all"
  );
  let mut selected = Vec::new();
  for selector in &arguments.selectors {
    let (name, boxes) = match selector.split_once(':') {
      Some((name, boxes)) => {
        let boxes: Vec<String> = boxes
          .split(',')
          .map(|b| if b.is_empty() { "INBOX".to_string() } else { b.to_string() })
          .collect();
        (name, Some(boxes))
      }
      None => (selector.as_str(), None),
    };
    if let Some(group) = config.group(name) {
      anyhow::ensure!(boxes.is_none(), "cannot restrict boxes of a group");
      for channel in &group.channels {
        anyhow::ensure!(
          config.channel(channel).is_some(),
          "group {name} names unknown channel {channel}"
        );
        selected.push(Selected { channel: channel.clone(), boxes: None });
      }
      continue;
    }
    let chan = config
      .channel(name)
      .with_context(|| format!("no channel or group named {name:?} defined"))?;
    if boxes.is_some() {
      anyhow::ensure!(
        !chan.patterns.is_empty(),
        "cannot override mailboxes in channel {name} - no Patterns"
      );
    }
    selected.push(Selected { channel: name.to_string(), boxes });
  }
  Ok(selected)
}

fn make_driver(def: &StoreDef) -> Box<dyn Driver> {
  match def {
    StoreDef::Imap(conf) => Box::new(imap::ImapStore::new(conf.clone(), &conf.store.name)),
    StoreDef::Maildir(conf) => {
      Box::new(maildir::MaildirStore::new(conf.clone(), &conf.store.name))
    }
  }
}

/// Connection pool: one driver per store, reused across channels; a channel
/// whose both ends live in the same store gets a second instance.
struct Pool {
  drivers: Vec<(String, Box<dyn Driver>)>,
}

impl Pool {
  fn index(
    &mut self,
    config: &config::Config,
    name: &str,
    avoid: Option<usize>,
  ) -> anyhow::Result<usize> {
    for (index, (n, _)) in self.drivers.iter().enumerate() {
      if n == name && Some(index) != avoid {
        return Ok(index);
      }
    }
    let def = config.store(name).with_context(|| format!("unknown store {name:?}"))?;
    self.drivers.push((name.to_string(), make_driver(def)));
    Ok(self.drivers.len() - 1)
  }

  fn pair(&mut self, fi: usize, ni: usize) -> [&mut dyn Driver; 2] {
    assert!(fi != ni);
    if fi < ni {
      let (a, b) = self.drivers.split_at_mut(ni);
      [a[fi].1.as_mut(), b[0].1.as_mut()]
    } else {
      let (a, b) = self.drivers.split_at_mut(fi);
      [b[0].1.as_mut(), a[ni].1.as_mut()]
    }
  }
}

pub fn run(arguments: &Arguments) -> anyhow::Result<u8> {
  let home = env::var("HOME").context("HOME is required")?;
  let config_path = locate_config(arguments, &home)?;
  let (mut config, channel_specs) = config::parse_config(&config_path)?;

  // Home-relative paths from the configuration.
  if let Some(sync_state) = &config.global.sync_state {
    config.global.sync_state = Some(expand_home(sync_state, &home));
  }
  for store in &mut config.stores {
    if let StoreDef::Maildir(conf) = store {
      if let Some(s) = conf.path.to_str() {
        conf.path = path::PathBuf::from(expand_home(s, &home));
      }
    }
  }
  for chan in &mut config.channels {
    match &chan.sync_state {
      Some(sync_state) if sync_state != "*" => {
        chan.sync_state = Some(expand_home(sync_state, &home));
      }
      Some(_) => (),
      None => chan.sync_state = config.global.sync_state.clone(),
    }
  }

  let settings = Settings {
    state_dir: default_state_dir(&home),
    use_fsync: config.global.fsync,
    buffer_limit: config.global.buffer_limit,
    keep_journal: arguments.keep_journal,
    force_journal: arguments.keep_journal || arguments.force_journal,
    fake_expunge: arguments.fake_expunge,
    max_journal_steps: arguments.max_journal_steps,
  };

  let cli = cli_ops(arguments);
  for (chan, spec) in config.channels.iter_mut().zip(channel_specs.iter()) {
    OpsSpec::merge(&cli, chan, spec, &config.global);
  }

  if arguments.list_stores {
    let mut pool = Pool { drivers: Vec::new() };
    for def in &config.stores {
      let index = pool.index(&config, def.name(), None)?;
      let driver = pool.drivers[index].1.as_mut();
      driver.connect().map_err(|e| anyhow::anyhow!("store {}: {:#}", def.name(), e.cause))?;
      let boxes = driver
        .list(driver::ListMode::Both)
        .map_err(|e| anyhow::anyhow!("store {}: {:#}", def.name(), e.cause))?;
      println!("{}:", def.name());
      for name in boxes {
        println!("  {name}");
      }
    }
    return Ok(0);
  }

  let selected = select_channels(arguments, &config)?;
  let mut pool = Pool { drivers: Vec::new() };
  let mut ret = 0u32;
  let mut stats = Stats::default();
  let mut chans_done = 0u32;
  let mut step_limit = false;

  for Selected { channel, boxes } in &selected {
    let chan = config.channel(channel).unwrap().clone();
    let fi = pool.index(&config, &chan.stores[F], None)?;
    let ni = pool.index(&config, &chan.stores[N], Some(fi))?;
    if arguments.list {
      println!("{}:", chan.name);
      match boxes {
        Some(boxes) => {
          for name in boxes {
            println!("  {name}");
          }
        }
        None => {
          for name in channel::list_channel_boxes(pool.pair(fi, ni), &chan)? {
            println!("  {name}");
          }
        }
      }
      continue;
    }
    let result =
      channel::sync_channel(pool.pair(fi, ni), &chan, boxes.as_deref(), &settings, &mut stats);
    match result {
      Ok(mask) => ret |= mask,
      Err(error) => {
        if error.is::<sync::state::StepLimit>() {
          step_limit = true;
          break;
        }
        return Err(error);
      }
    }
    chans_done += 1;
  }

  for (_, driver) in pool.drivers.iter_mut() {
    driver.cleanup();
  }

  if step_limit {
    return Ok(EXIT_STEP_LIMIT);
  }
  if !arguments.list && chans_done > 0 {
    let mut summary = format!("Processed {chans_done} channel(s)");
    for t in [N, F] {
      if stats.new[t] != 0 || stats.flags[t] != 0 {
        summary += &format!(
          ",\n{}ed {} new message(s) and {} flag update(s)",
          sync::dir_name(t),
          stats.new[t],
          stats.flags[t]
        );
      }
      if stats.trash[t] != 0 {
        summary +=
          &format!(",\nmoved {} {} message(s) to trash", stats.trash[t], sync::side_name(t));
      }
    }
    log::info!("{summary}.");
  }
  Ok(if ret != 0 { 1 } else { 0 })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn home_expansion() {
    assert_eq!("/home/u/mail", expand_home("~/mail", "/home/u"));
    assert_eq!("/abs/mail", expand_home("/abs/mail", "/home/u"));
  }

  #[test]
  fn cli_ops_defaults() {
    use clap::Parser as _;
    #[derive(clap::Parser)]
    struct Cli {
      #[clap(flatten)]
      arguments: Arguments,
    }

    let cli = Cli::parse_from(["tandem", "-a"]);
    let spec = cli_ops(&cli.arguments);
    assert!(!spec.have_type && !spec.have_expunge);

    let cli = Cli::parse_from(["tandem", "-a", "--pull"]);
    let spec = cli_ops(&cli.arguments);
    assert!(spec.have_type);
    assert_eq!(config::OP_DFLT_TYPE, spec.ops[N]);
    assert_eq!(OpsMask::NONE, spec.ops[F]);

    let cli = Cli::parse_from(["tandem", "-a", "--push-flags"]);
    let spec = cli_ops(&cli.arguments);
    assert_eq!(OpsMask::FLAGS, spec.ops[F]);
    assert_eq!(OpsMask::NONE, spec.ops[N]);

    let cli = Cli::parse_from(["tandem", "-a", "-X"]);
    let spec = cli_ops(&cli.arguments);
    assert!(spec.have_expunge);
    assert!(spec.ops[F].contains(OpsMask::EXPUNGE));
    assert!(spec.ops[N].contains(OpsMask::EXPUNGE));

    let cli = Cli::parse_from(["tandem", "-a", "--no-expunge"]);
    let spec = cli_ops(&cli.arguments);
    assert!(spec.have_expunge);
    assert!(!spec.ops[F].contains(OpsMask::EXPUNGE));
  }
}
