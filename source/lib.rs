// A Bayesian mail classifier in the Graham/Robinson/Fisher family: trains
// per-token good/spam counts into a transactional on-disk store and scores
// messages into SPAM, HAM or UNSURE.
//
// http://www.paulgraham.com/spam.html - A Plan For Spam
// https://www.linuxjournal.com/article/6467 - Robinson, A Statistical
// Approach to the Spam Problem

use anyhow::Context as _;
use std::{
  collections, error, fmt,
  io::{self, Write as _},
  path, result, str,
  sync::atomic,
  thread,
};

pub mod config;
pub mod datastore;
pub mod lexer;
pub mod passthrough;
pub mod reader;
pub mod register;
pub mod rstats;
pub mod score;
pub mod token;
pub mod word;
pub mod wordhash;
pub mod wordlists;

use datastore::DbMode;
use register::Direction;
use score::Verdict;

/// Exit code for any failure, after SPAM=0, HAM=1, UNSURE=2.
pub const EXIT_ERROR: i32 = 3;

/// Error kinds that cross subsystem boundaries; recovered via
/// `anyhow::Error::downcast_ref` at the retry and isolation points.
#[derive(Debug)]
pub enum Fault {
  /// A store key is absent; handled locally as zero counts.
  NotFound,
  /// Retryable store contention; resolved by abort-and-retry.
  TempFail(String),
  /// Failed verification or unrecoverable store damage.
  Corrupt(String),
  /// The file-size resource limit guard tripped.
  LimitExceeded(String),
  /// Undecodable input that can't even be skipped.
  MalformedInput(String),
  /// Invalid configuration; fatal at startup.
  Config(String),
}

impl Fault {
  pub fn fatal(&self) -> bool {
    matches!(
      self,
      Self::Corrupt(_) | Self::LimitExceeded(_) | Self::Config(_)
    )
  }
}

impl fmt::Display for Fault {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    match self {
      Self::NotFound => write!(formatter, "not found"),
      Self::TempFail(detail) => write!(formatter, "temporary failure: {detail}"),
      Self::Corrupt(detail) => write!(formatter, "corruption: {detail}"),
      Self::LimitExceeded(detail) => write!(formatter, "limit exceeded: {detail}"),
      Self::MalformedInput(detail) => write!(formatter, "malformed input: {detail}"),
      Self::Config(detail) => write!(formatter, "configuration: {detail}"),
    }
  }
}

impl error::Error for Fault {}

/// The one cross-subsystem mutable: set on fatal errors, after which the
/// message loop finishes the current message (resolving its transaction)
/// and stops.
static DIE: atomic::AtomicBool = atomic::AtomicBool::new(false);

pub fn die() {
  DIE.store(true, atomic::Ordering::Relaxed);
}

fn dying() -> bool {
  DIE.load(atomic::Ordering::Relaxed)
}

#[derive(Clone, Copy, Debug, PartialEq, clap::ValueEnum)]
pub enum Mode {
  /// Score the message and exit 0 (spam), 1 (ham) or 2 (unsure).
  Classify,
  /// Classify, then train confident verdicts back into the store.
  ClassifyUpdate,
  RegisterSpam,
  RegisterHam,
  UnregisterSpam,
  UnregisterHam,
  /// Write `token good spam` lines for every record, in key order.
  Dump,
  /// Read `dump` output back into the store.
  Restore,
  /// Check the wordlist file's integrity.
  Verify,
  /// Run store recovery (normal, or catastrophic with --catastrophic).
  Recover,
  /// Remove transaction log segments already folded into the snapshots.
  PurgeLogs,
}

impl Mode {
  fn direction(self) -> Option<Direction> {
    match self {
      Self::RegisterSpam => Some(Direction::RegisterSpam),
      Self::RegisterHam => Some(Direction::RegisterHam),
      Self::UnregisterSpam => Some(Direction::UnregisterSpam),
      Self::UnregisterHam => Some(Direction::UnregisterHam),
      _ => None,
    }
  }
}

#[derive(clap::Args)]
#[group(skip)]
pub struct Arguments {
  #[arg(help = "What to do with the input", hide_possible_values(true))]
  pub mode: Mode,

  #[arg(long = "directory", help = "Wordlist directory")]
  pub directory: Option<path::PathBuf>,
  #[arg(long = "config", help = "Configuration file")]
  pub config: Option<path::PathBuf>,
  #[arg(
    long = "input",
    help = "Message source: file, mbox or maildir (stdin when absent)"
  )]
  pub input: Option<path::PathBuf>,
  #[arg(long = "output", help = "Output file (stdout when absent)")]
  pub output: Option<path::PathBuf>,

  #[arg(long = "passthrough", help = "Re-emit the message with a verdict header")]
  pub passthrough: bool,
  #[arg(long = "algorithm", help = "Scoring algorithm")]
  pub algorithm: Option<score::Algorithm>,
  #[arg(long = "spam-cutoff", help = "Spamicity at or above which it's spam")]
  pub spam_cutoff: Option<f64>,
  #[arg(long = "ham-cutoff", help = "Spamicity at or below which it's ham")]
  pub ham_cutoff: Option<f64>,
  #[arg(long = "terse", help = "One-line verdict output")]
  pub terse: bool,
  #[arg(long = "rtable", help = "Print the per-token R table")]
  pub rtable: bool,
  #[arg(
    long = "nonspam-exits-zero",
    help = "Exit 0 for any verdict (procmail integration)"
  )]
  pub nonspam_exits_zero: bool,
  #[arg(
    long = "unlearn-from-other",
    help = "Also unregister the message from the opposite category"
  )]
  pub unlearn_from_other: bool,
  #[arg(long = "catastrophic", help = "Recover from all available logs")]
  pub catastrophic: bool,

  #[arg(long = "interruption", help = "Internal testing facility", hide = true)]
  pub interruption: Option<Interruption>,
}

#[derive(Copy, Clone, Debug, PartialEq, clap::ValueEnum)]
pub enum Interruption {
  /// Fail a registration after the token rows, before `.MSG_COUNT`.
  PutsBeforeMsgCount,
  /// Fail a commit after the log append, before the in-memory fold.
  CommitAfterAppend,
}

impl fmt::Display for Interruption {
  fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
    write!(formatter, "{self:?}")
  }
}

impl error::Error for Interruption {}

static INTERRUPTIONS: once_cell::sync::Lazy<
  std::sync::Mutex<collections::HashMap<thread::ThreadId, Interruption>>,
> = once_cell::sync::Lazy::new(|| std::sync::Mutex::new(collections::HashMap::new()));

pub fn interruption(name: &Option<Interruption>) {
  match (
    name,
    INTERRUPTIONS.lock().unwrap().entry(thread::current().id()),
  ) {
    (Some(interruption), collections::hash_map::Entry::Occupied(mut occupied)) => {
      occupied.insert(*interruption);
    }
    (Some(interruption), collections::hash_map::Entry::Vacant(vacant)) => {
      vacant.insert(*interruption);
    }
    (None, collections::hash_map::Entry::Occupied(occupied)) => {
      occupied.remove();
    }
    (None, collections::hash_map::Entry::Vacant(_)) => (),
  }
}

fn interrupt(interruption: Interruption) -> result::Result<(), Interruption> {
  match INTERRUPTIONS.lock().unwrap().get(&thread::current().id()) {
    Some(interruption_) if *interruption_ == interruption => Err(interruption),
    _ => Ok(()),
  }
}

fn validate(arguments: &Arguments, config: &config::Config) -> anyhow::Result<()> {
  if arguments.rtable && config.algorithm == score::Algorithm::Graham {
    return Err(Fault::Config("the R table needs robinson or fisher".to_string()).into());
  }
  if arguments.unlearn_from_other && arguments.mode.direction().is_none() {
    return Err(
      Fault::Config("--unlearn-from-other only applies when registering".to_string()).into(),
    );
  }
  if arguments.output.is_some()
    && !arguments.passthrough
    && !matches!(arguments.mode, Mode::Dump | Mode::Restore)
  {
    log::warn!("--output has no effect without --passthrough");
  }
  Ok(())
}

fn output_writer(output: &Option<path::PathBuf>) -> anyhow::Result<Box<dyn io::Write>> {
  Ok(match output {
    Some(path) => Box::new(
      std::fs::File::create(path).with_context(|| format!("couldn't create {path:?}"))?,
    ),
    None => Box::new(io::stdout()),
  })
}

pub fn run(arguments: &Arguments) -> anyhow::Result<i32> {
  DIE.store(false, atomic::Ordering::Relaxed);
  interruption(&arguments.interruption);

  let mut config = config::Config::load(arguments.config.as_deref(), arguments.algorithm)?;
  if let Some(directory) = &arguments.directory {
    config.directory = directory.clone();
  }
  if let Some(cutoff) = arguments.spam_cutoff {
    config.spam_cutoff = cutoff;
  }
  if let Some(cutoff) = arguments.ham_cutoff {
    config.ham_cutoff = cutoff;
  }
  validate(arguments, &config)?;

  match arguments.mode {
    Mode::Verify => {
      let path = config
        .directory
        .join(format!("{}.db", config.wordlists[0].name));
      datastore::verify(&path)?;
      Ok(0)
    }
    Mode::Recover => {
      datastore::recover(&config.directory, arguments.catastrophic)?;
      Ok(0)
    }
    Mode::PurgeLogs => {
      let mut env = datastore::Env::open(&config.directory, config.db_cachesize, false)?;
      let removed = env.purge_logs()?;
      log::info!("purged {removed} log segment(s)");
      env.close()?;
      Ok(0)
    }
    Mode::Dump => dump(arguments, &config),
    Mode::Restore => restore(arguments, &config),
    _ => filter(arguments, &config),
  }
}

fn dump(arguments: &Arguments, config: &config::Config) -> anyhow::Result<i32> {
  let env = datastore::Env::open(&config.directory, config.db_cachesize, false)?;
  let mut db = datastore::Db::open(&env, &config.wordlists[0].name, DbMode::Read)?;
  let mut writer = io::BufWriter::new(output_writer(&arguments.output)?);
  let mut failure = None;
  db.scan(|key, value| {
    let result = writer
      .write_all(key)
      .and_then(|()| writeln!(writer, " {} {}", value.good, value.spam));
    match result {
      Ok(()) => true,
      Err(error) => {
        failure = Some(error);
        false
      }
    }
  })?;
  if let Some(error) = failure {
    return Err(error.into());
  }
  writer.flush()?;
  drop(db);
  env.close()?;
  Ok(0)
}

fn restore(arguments: &Arguments, config: &config::Config) -> anyhow::Result<i32> {
  let contents = match &arguments.input {
    Some(path) => std::fs::read(path).with_context(|| format!("couldn't read {path:?}"))?,
    None => {
      let mut buffer = Vec::new();
      io::Read::read_to_end(&mut io::stdin(), &mut buffer)?;
      buffer
    }
  };

  let env = datastore::Env::open(&config.directory, config.db_cachesize, true)?;
  let mut db = datastore::Db::open(&env, &config.wordlists[0].name, DbMode::Write)?;
  db.transaction(|db| {
    for (number, line) in contents.split(|byte| *byte == b'\n').enumerate() {
      if line.is_empty() {
        continue;
      }
      // token good spam -- the token itself never contains blanks.
      let mut fields = line.rsplitn(3, |byte| *byte == b' ');
      let parse =
        |field: Option<&[u8]>| -> Option<u32> { str::from_utf8(field?).ok()?.parse().ok() };
      let spam = parse(fields.next());
      let good = parse(fields.next());
      let token = fields.next();
      match (token, good, spam) {
        (Some(token), Some(good), Some(spam)) if !token.is_empty() => {
          db.put(token, datastore::TokenRecord { good, spam })?
        }
        _ => {
          return Err(
            Fault::MalformedInput(format!("unparsable restore line {}", number + 1)).into(),
          )
        }
      }
    }
    Ok(())
  })?;
  db.close()?;
  env.close()?;
  Ok(0)
}

fn filter(arguments: &Arguments, config: &config::Config) -> anyhow::Result<i32> {
  let direction = arguments.mode.direction();
  let passthrough = arguments.passthrough;
  let register_before = direction.is_some() && passthrough;
  let register_after = direction.is_some() && !passthrough;
  let update = arguments.mode == Mode::ClassifyUpdate;
  let classify = passthrough
    || arguments.rtable
    || matches!(arguments.mode, Mode::Classify | Mode::ClassifyUpdate);

  let writes = direction.is_some() || update;
  let mode = if writes { DbMode::Write } else { DbMode::Read };
  let env = datastore::Env::open(&config.directory, config.db_cachesize, writes)?;
  let mut lists = wordlists::Wordlists::open(&env, config, mode)?;

  // Classification constants resolve once: the stored Robinson x and the
  // training imbalance stay read-only for the rest of the run.
  let scorer = if classify {
    let stored_robx = lists.stored_robx()?;
    let (msgs_good, msgs_bad) = lists.message_counts();
    Some(score::Scorer::new(config, stored_robx, msgs_bad, msgs_good)?)
  } else {
    None
  };

  let mut reader = reader::Reader::open(arguments.input.as_deref())?;
  let mut writer = output_writer(&arguments.output)?;
  let mut merged: Option<wordhash::WordHash<score::WordProp>> =
    register_after.then(wordhash::WordHash::new);
  let mut message_count: u32 = 0;
  let mut status = 0;
  let mut fatal = None;

  while let Some(message) = reader.next_message()? {
    if dying() {
      break;
    }
    message_count += 1;
    let result = process_message(
      arguments,
      config,
      &mut lists,
      scorer.as_ref(),
      &message,
      direction,
      register_before,
      update,
      &mut merged,
      &mut writer,
    );
    match result {
      Ok(Some(code)) => status = code,
      Ok(None) => (),
      Err(error) => {
        // Per-message isolation: the retry layer already aborted whatever
        // transaction was in flight; diagnose and continue unless fatal.
        let is_fatal = error
          .downcast_ref::<Fault>()
          .map(Fault::fatal)
          .unwrap_or(false);
        log::error!(
          "message {message_count}{}: {error:#}",
          message
            .name
            .as_ref()
            .map(|name| format!(" ({name})"))
            .unwrap_or_default()
        );
        status = EXIT_ERROR;
        if is_fatal {
          die();
          fatal = Some(error);
        }
      }
    }
  }

  // Bulk registration: everything merged lands in one transaction.
  if let (Some(direction), Some(merged)) = (direction, &merged) {
    if fatal.is_none() && !merged.is_empty() {
      register::register_words(lists.default_list(), direction, merged, message_count)?;
      if arguments.unlearn_from_other {
        let mut mirrored = wordhash::WordHash::new();
        token::merge(&mut mirrored, merged);
        register::set_register_counts_merged(&mut mirrored, direction.opposite());
        register::register_words(
          lists.default_list(),
          direction.opposite(),
          &mirrored,
          message_count,
        )?;
      }
    }
  }

  lists.close()?;
  env.close()?;
  match fatal {
    Some(error) => Err(error),
    None => Ok(status),
  }
}

#[allow(clippy::too_many_arguments)]
fn process_message(
  arguments: &Arguments,
  config: &config::Config,
  lists: &mut wordlists::Wordlists,
  scorer: Option<&score::Scorer>,
  message: &reader::Message,
  direction: Option<Direction>,
  register_before: bool,
  update: bool,
  merged: &mut Option<wordhash::WordHash<score::WordProp>>,
  writer: &mut Box<dyn io::Write>,
) -> anyhow::Result<Option<i32>> {
  let mut collected = token::collect(config, &message.bytes);

  if let Some(direction) = direction {
    register::set_register_counts(&mut collected.words, direction, config.max_repeats);
    if register_before {
      register::register_words(lists.default_list(), direction, &collected.words, 1)?;
      if arguments.unlearn_from_other {
        let opposite = direction.opposite();
        register::set_register_counts(&mut collected.words, opposite, config.max_repeats);
        register::register_words(lists.default_list(), opposite, &collected.words, 1)?;
      }
    }
    if let Some(merged) = merged {
      token::merge(merged, &collected.words);
    }
  }

  let scorer = match scorer {
    Some(scorer) => scorer,
    None => return Ok(None),
  };

  // Pick up registrations committed by other processes since the last
  // message, then resolve this message's counts.
  lists.refresh()?;
  if let Some((msgs_good, msgs_bad)) = collected.msg_counts {
    // Token-count input carries its own counts; only the totals are filled.
    collected.words.for_each_mut(|_, prop| {
      prop.cnts.msgs_good = msgs_good;
      prop.cnts.msgs_bad = msgs_bad;
    });
  } else {
    lists.lookup_words(&mut collected.words)?;
  }

  let mut rstats = rstats::Rstats::new();
  let score = scorer.score(&collected.words, Some(&mut rstats));
  let verdict = scorer.status(&score);

  if update {
    let trainable = match verdict {
      Verdict::Spam if score.spamicity <= 1.0 - config.thresh_update => {
        Some(Direction::RegisterSpam)
      }
      Verdict::Ham if score.spamicity >= config.thresh_update => Some(Direction::RegisterHam),
      _ => None, // never on UNSURE
    };
    if let Some(direction) = trainable {
      register::set_register_counts(&mut collected.words, direction, config.max_repeats);
      register::register_words(lists.default_list(), direction, &collected.words, 1)?;
    }
  }

  if arguments.passthrough {
    let stats = if arguments.rtable {
      let mut block = Vec::new();
      rstats.print_rtable(&mut block, scorer)?;
      Some(block)
    } else if config.thresh_stats > 0.0 && score.spamicity >= config.thresh_stats {
      let mut block = Vec::new();
      rstats.print_histogram(&mut block, scorer.min_dev)?;
      Some(block)
    } else {
      None
    };
    passthrough::write_message(
      writer,
      &message.bytes,
      &config.spam_header_name,
      verdict,
      score.spamicity,
      stats.as_deref(),
    )?;
    writer.flush()?;
  } else if arguments.terse {
    writeln!(writer, "{} {:.6}", &verdict.label()[..1], score.spamicity)?;
  } else if arguments.rtable {
    rstats.print_rtable(writer, scorer)?;
  }

  log::info!(
    "{}, spamicity={:.6}, algorithm={}, tokens={}",
    verdict.label(),
    score.spamicity,
    scorer.algorithm.name(),
    collected.token_count
  );
  Ok(Some(verdict.exit_code(arguments.nonspam_exits_zero)))
}
