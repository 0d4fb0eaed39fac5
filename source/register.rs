// Training: one transaction per registration covering every token row plus
// `.MSG_COUNT`, with counts clamped at zero and rows deleted once both sides
// reach zero, so registering and unregistering the same message cancel out
// exactly.

use crate::{
  datastore::{self, TokenRecord},
  score::WordProp,
  wordhash::WordHash,
  wordlists::Wordlist,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Direction {
  RegisterSpam,
  RegisterHam,
  UnregisterSpam,
  UnregisterHam,
}

impl Direction {
  pub fn registers(self) -> bool {
    matches!(self, Self::RegisterSpam | Self::RegisterHam)
  }

  pub fn spam(self) -> bool {
    matches!(self, Self::RegisterSpam | Self::UnregisterSpam)
  }

  /// The mirror image, for `--unlearn-from-other`.
  pub fn opposite(self) -> Self {
    match self {
      Self::RegisterSpam => Self::UnregisterHam,
      Self::RegisterHam => Self::UnregisterSpam,
      Self::UnregisterSpam => Self::RegisterHam,
      Self::UnregisterHam => Self::RegisterSpam,
    }
  }

  pub fn label(self) -> &'static str {
    match self {
      Self::RegisterSpam => "register-spam",
      Self::RegisterHam => "register-ham",
      Self::UnregisterSpam => "unregister-spam",
      Self::UnregisterHam => "unregister-ham",
    }
  }
}

fn clamped(current: u32, delta: i64) -> u32 {
  (current as i64 + delta).clamp(0, u32::MAX as i64) as u32
}

/// Bakes each token's registration contribution into its counts: the
/// occurrence count capped at `max_repeats`, on the side `direction` trains.
/// Overwrites whatever the counts held (store counts, after an update-mode
/// classification). Must run before `token::merge` accumulates messages.
pub fn set_register_counts(
  words: &mut WordHash<WordProp>,
  direction: Direction,
  max_repeats: u32,
) {
  words.for_each_mut(|_, prop| {
    let capped = prop.freq.min(max_repeats);
    if direction.spam() {
      prop.cnts.good = 0;
      prop.cnts.bad = capped;
    } else {
      prop.cnts.good = capped;
      prop.cnts.bad = 0;
    }
  });
}

/// Re-bakes an already-merged hash for the opposite direction: the same
/// magnitudes, moved to the side that direction trains.
pub fn set_register_counts_merged(words: &mut WordHash<WordProp>, direction: Direction) {
  words.for_each_mut(|_, prop| {
    let magnitude = prop.cnts.good.max(prop.cnts.bad);
    if direction.spam() {
      prop.cnts.good = 0;
      prop.cnts.bad = magnitude;
    } else {
      prop.cnts.good = magnitude;
      prop.cnts.bad = 0;
    }
  });
}

/// Applies one registration as a single transaction: every token row, then
/// `.MSG_COUNT` by `msg_count` messages. The transaction layer retries the
/// whole closure on `TempFail`.
pub fn register_words(
  list: &mut Wordlist,
  direction: Direction,
  words: &WordHash<WordProp>,
  msg_count: u32,
) -> anyhow::Result<()> {
  let sign: i64 = if direction.registers() { 1 } else { -1 };
  list.db.transaction(|db| {
    for (key, prop) in words.iter() {
      let current = db.get(key)?.unwrap_or_default();
      let good = clamped(current.good, sign * prop.cnts.good as i64);
      let spam = clamped(current.spam, sign * prop.cnts.bad as i64);
      if good == 0 && spam == 0 {
        db.del(key)?;
      } else {
        db.put(key, TokenRecord { good, spam })?;
      }
    }
    crate::interrupt(crate::Interruption::PutsBeforeMsgCount)?;
    let current = db.get(datastore::MSG_COUNT_KEY)?.unwrap_or_default();
    let (delta_good, delta_spam) = if direction.spam() {
      (0, sign * msg_count as i64)
    } else {
      (sign * msg_count as i64, 0)
    };
    let good = clamped(current.good, delta_good);
    let spam = clamped(current.spam, delta_spam);
    if good == 0 && spam == 0 {
      db.del(datastore::MSG_COUNT_KEY)?;
    } else {
      db.put(datastore::MSG_COUNT_KEY, TokenRecord { good, spam })?;
    }
    Ok(())
  })?;
  list.reload_message_counts()?;
  log::info!(
    "{} {} token(s), {} message(s) into {}",
    direction.label(),
    words.len(),
    msg_count,
    list.name
  );
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    config::Config,
    datastore::{Db, DbMode, Env, DEFAULT_CACHE_MIB},
    token,
    wordlists::Wordlists,
  };

  fn scan_all(db: &mut Db) -> anyhow::Result<Vec<(Vec<u8>, TokenRecord)>> {
    let mut records = Vec::new();
    db.scan(|key, value| {
      records.push((key.to_vec(), *value));
      true
    })?;
    Ok(records)
  }

  fn collect_for(direction: Direction, text: &[u8], cap: u32) -> WordHash<WordProp> {
    let config = Config::default();
    let mut collected = token::collect(&config, text);
    set_register_counts(&mut collected.words, direction, cap);
    collected.words
  }

  #[test]
  fn register_then_unregister_is_identity() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    let config = Config::default();
    let mut lists = Wordlists::open(&env, &config, DbMode::Write)?;
    let list = lists.default_list();

    let before = scan_all(&mut list.db)?;
    let words = collect_for(Direction::RegisterSpam, b"\nbuy buy now\n", 4);
    register_words(list, Direction::RegisterSpam, &words, 1)?;
    assert_ne!(before, scan_all(&mut list.db)?);

    let words = collect_for(Direction::UnregisterSpam, b"\nbuy buy now\n", 4);
    register_words(list, Direction::UnregisterSpam, &words, 1)?;
    assert_eq!(before, scan_all(&mut list.db)?);
    assert_eq!((0, 0), (list.msgs_good, list.msgs_bad));

    lists.close()?;
    env.close()
  }

  #[test]
  fn frequency_cap_applies() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    let config = Config::default();
    let mut lists = Wordlists::open(&env, &config, DbMode::Write)?;
    let list = lists.default_list();

    // "buy" appears six times; a cap of 4 limits its contribution.
    let words = collect_for(Direction::RegisterSpam, b"\nbuy buy buy buy buy buy\n", 4);
    register_words(list, Direction::RegisterSpam, &words, 1)?;
    assert_eq!(
      Some(TokenRecord { good: 0, spam: 4 }),
      list.db.get(b"buy")?
    );

    lists.close()?;
    env.close()
  }

  #[test]
  fn counts_clamp_at_zero() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    let config = Config::default();
    let mut lists = Wordlists::open(&env, &config, DbMode::Write)?;
    let list = lists.default_list();

    let words = collect_for(Direction::UnregisterSpam, b"\nnever registered\n", 1);
    register_words(list, Direction::UnregisterSpam, &words, 1)?;
    assert_eq!(None, list.db.get(b"never")?);
    assert_eq!((0, 0), (list.msgs_good, list.msgs_bad));

    lists.close()?;
    env.close()
  }

  #[test]
  fn msg_count_tracks_directions() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    let config = Config::default();
    let mut lists = Wordlists::open(&env, &config, DbMode::Write)?;
    let list = lists.default_list();

    let words = collect_for(Direction::RegisterSpam, b"\nbuy now\n", 1);
    register_words(list, Direction::RegisterSpam, &words, 3)?;
    let words = collect_for(Direction::RegisterHam, b"\nmeeting report\n", 1);
    register_words(list, Direction::RegisterHam, &words, 2)?;
    assert_eq!((2, 3), (list.msgs_good, list.msgs_bad));

    lists.close()?;
    env.close()
  }

  #[test]
  fn bulk_merge_registers_per_message_capped_counts() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    let config = Config::default();
    let mut lists = Wordlists::open(&env, &config, DbMode::Write)?;
    let list = lists.default_list();

    let mut merged = WordHash::new();
    for _ in 0..3 {
      let words = collect_for(Direction::RegisterSpam, b"\nbuy buy buy buy buy buy\n", 4);
      token::merge(&mut merged, &words);
    }
    register_words(list, Direction::RegisterSpam, &merged, 3)?;
    // Three messages, each capped at 4.
    assert_eq!(
      Some(TokenRecord { good: 0, spam: 12 }),
      list.db.get(b"buy")?
    );
    assert_eq!((0, 3), (list.msgs_good, list.msgs_bad));

    lists.close()?;
    env.close()
  }

  #[test]
  fn monotone_training() -> anyhow::Result<()> {
    use crate::score::{Algorithm, Scorer};

    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    let mut config = Config::default();
    config.algorithm = Algorithm::Fisher;
    let mut lists = Wordlists::open(&env, &config, DbMode::Write)?;

    let mut previous = 0.0;
    for round in 1..=5 {
      let words = collect_for(Direction::RegisterSpam, b"\nviagra pills\n", 1);
      register_words(lists.default_list(), Direction::RegisterSpam, &words, 1)?;
      let scorer = Scorer::new(&config, None, round, 0)?;
      let probability = scorer.probability(&lists.lookup(b"viagra")?);
      assert!(
        probability >= previous,
        "round {round}: {probability} < {previous}"
      );
      previous = probability;
    }
    assert!(previous > 0.9);

    lists.close()?;
    env.close()
  }
}
