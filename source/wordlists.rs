// The wordlist facade: an ordered chain of token databases consulted by
// precedence, with ignore lists that zero a token's contribution. One
// combined list named "wordlist" is the default; more come from `wordlist`
// lines in the configuration.

use crate::{
  config::{Config, WordlistSpec},
  datastore::{self, Db, DbMode, Env, TokenRecord},
  score::{Counts, WordProp, ROBX_SCALE},
  wordhash::WordHash,
};

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ListKind {
  Normal,
  /// Hits zero the token's contribution and end the walk.
  Ignore,
}

#[derive(Debug)]
pub struct Wordlist<'env> {
  pub name: String,
  pub db: Db<'env>,
  pub kind: ListKind,
  /// Override precedence: higher lists dominate lower ones.
  pub precedence: u8,
  pub msgs_good: u32,
  pub msgs_bad: u32,
}

impl<'env> Wordlist<'env> {
  fn open(
    env: &'env Env,
    name: &str,
    kind: ListKind,
    precedence: u8,
    mode: DbMode,
  ) -> anyhow::Result<Self> {
    let mut db = Db::open(env, name, mode)?;
    let counts = db.get(datastore::MSG_COUNT_KEY)?.unwrap_or_default();
    Ok(Self {
      name: name.to_string(),
      db,
      kind,
      precedence,
      msgs_good: counts.good,
      msgs_bad: counts.spam,
    })
  }

  /// Re-reads `.MSG_COUNT` after a registration changed it.
  pub fn reload_message_counts(&mut self) -> anyhow::Result<()> {
    let counts = self.db.get(datastore::MSG_COUNT_KEY)?.unwrap_or_default();
    self.msgs_good = counts.good;
    self.msgs_bad = counts.spam;
    Ok(())
  }
}

#[derive(Debug)]
pub struct Wordlists<'env> {
  lists: Vec<Wordlist<'env>>,
}

impl<'env> Wordlists<'env> {
  pub fn open(env: &'env Env, config: &Config, mode: DbMode) -> anyhow::Result<Self> {
    let mut lists = Vec::new();
    for spec in &config.wordlists {
      let WordlistSpec {
        name,
        ignore,
        precedence,
      } = spec;
      let kind = if *ignore {
        ListKind::Ignore
      } else {
        ListKind::Normal
      };
      // Ignore lists are consulted, never written.
      let mode = if *ignore { DbMode::Read } else { mode };
      match Wordlist::open(env, name, kind, *precedence, mode) {
        Ok(list) => lists.push(list),
        Err(error)
          if matches!(error.downcast_ref::<crate::Fault>(), Some(crate::Fault::NotFound)) =>
        {
          if *ignore {
            // A missing ignore list simply doesn't participate.
            log::debug!("ignore list {name} is absent, skipping");
            continue;
          }
          // First use: an empty wordlist classifies everything as unknown.
          drop(Db::open(env, name, DbMode::Write)?);
          lists.push(Wordlist::open(env, name, kind, *precedence, mode)?);
        }
        Err(error) => return Err(error),
      }
    }
    Ok(Self { lists })
  }

  /// The first list: owner of `.ROBX` and target of registrations.
  pub fn default_list(&mut self) -> &mut Wordlist<'env> {
    &mut self.lists[0] // non-empty by construction
  }

  /// Catches up with other processes' commits; once per message.
  pub fn refresh(&mut self) -> anyhow::Result<()> {
    for list in &mut self.lists {
      list.db.refresh()?;
      list.reload_message_counts()?;
    }
    Ok(())
  }

  /// Trained message totals (good, spam) across the chain.
  pub fn message_counts(&self) -> (u32, u32) {
    let mut totals = (0, 0);
    for list in &self.lists {
      totals.0 += list.msgs_good;
      totals.1 += list.msgs_bad;
    }
    totals
  }

  /// The stored Robinson x, unscaled, from the default list's `.ROBX` spam
  /// slot; absent or zero means "use the configured or built-in value".
  pub fn stored_robx(&mut self) -> anyhow::Result<Option<f64>> {
    let value = self.default_list().db.get(datastore::ROBX_KEY)?;
    Ok(match value {
      Some(TokenRecord { spam, .. }) if spam != 0 => Some(spam as f64 / ROBX_SCALE),
      _ => None,
    })
  }

  /// One token's counts, walking the chain in order: lists below the best
  /// override seen so far are skipped, ignore-list hits zero everything.
  pub fn lookup(&mut self, token: &[u8]) -> anyhow::Result<Counts> {
    let mut counts = Counts::default();
    let mut effective = 0u8;
    for list in &mut self.lists {
      if list.precedence < effective {
        break;
      }
      let value = list.db.get(token)?;
      if value.is_some() && list.kind == ListKind::Ignore {
        counts.good = 0;
        counts.bad = 0;
        break;
      }
      effective = list.precedence;
      let value = value.unwrap_or_default();
      counts.good += value.good;
      counts.bad += value.spam;
      counts.msgs_good += list.msgs_good;
      counts.msgs_bad += list.msgs_bad;
    }
    Ok(counts)
  }

  /// Fills every hash entry's counts from the store.
  pub fn lookup_words(&mut self, words: &mut WordHash<WordProp>) -> anyhow::Result<()> {
    let mut failure = None;
    words.for_each_mut(|token, prop| {
      if failure.is_some() {
        return;
      }
      match self.lookup(token) {
        Ok(counts) => prop.cnts = counts,
        Err(error) => failure = Some(error),
      }
    });
    match failure {
      Some(error) => Err(error),
      None => Ok(()),
    }
  }

  pub fn close(self) -> anyhow::Result<()> {
    for list in self.lists {
      list.db.close()?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::datastore::DEFAULT_CACHE_MIB;

  fn put(db: &mut Db, token: &[u8], good: u32, spam: u32) -> anyhow::Result<()> {
    db.transaction(|db| db.put(token, TokenRecord { good, spam }))
  }

  #[test]
  fn single_list_lookup() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    let config = Config::default();
    let mut lists = Wordlists::open(&env, &config, DbMode::Write)?;
    {
      let db = &mut lists.default_list().db;
      put(db, b"deal", 1, 9)?;
      put(db, datastore::MSG_COUNT_KEY, 10, 20)?;
    }
    lists.refresh()?;
    assert_eq!((10, 20), lists.message_counts());
    assert_eq!(
      Counts {
        good: 1,
        bad: 9,
        msgs_good: 10,
        msgs_bad: 20,
      },
      lists.lookup(b"deal")?
    );
    // Absent tokens still carry the message totals.
    assert_eq!(
      Counts {
        good: 0,
        bad: 0,
        msgs_good: 10,
        msgs_bad: 20,
      },
      lists.lookup(b"unseen")?
    );
    lists.close()?;
    env.close()
  }

  #[test]
  fn ignore_list_zeroes_and_stops() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;

    // Seed both databases first so read-only opening succeeds.
    {
      let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
      db.transaction(|db| db.put(b"the", TokenRecord { good: 5, spam: 5 }))?;
      drop(db);
      let mut ignore = Db::open(&env, "ignorelist", DbMode::Write)?;
      ignore.transaction(|db| db.put(b"the", TokenRecord { good: 1, spam: 0 }))?;
      drop(ignore);
    }

    let mut config = Config::default();
    config.wordlists.insert(
      0,
      WordlistSpec {
        name: "ignorelist".to_string(),
        ignore: true,
        precedence: 2,
      },
    );
    let mut lists = Wordlists::open(&env, &config, DbMode::Read)?;
    let counts = lists.lookup(b"the")?;
    assert_eq!((0, 0), (counts.good, counts.bad));
    // Tokens absent from the ignore list read through to the wordlist.
    let counts = lists.lookup(b"unlisted")?;
    assert_eq!((0, 0), (counts.good, counts.bad));
    lists.close()?;
    env.close()
  }

  #[test]
  fn override_precedence_stops_the_walk() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    {
      let mut primary = Db::open(&env, "primary", DbMode::Write)?;
      primary.transaction(|db| db.put(b"deal", TokenRecord { good: 0, spam: 7 }))?;
      drop(primary);
      let mut secondary = Db::open(&env, "secondary", DbMode::Write)?;
      secondary.transaction(|db| db.put(b"deal", TokenRecord { good: 9, spam: 0 }))?;
      drop(secondary);
    }
    let mut config = Config::default();
    config.wordlists = vec![
      WordlistSpec {
        name: "primary".to_string(),
        ignore: false,
        precedence: 2,
      },
      WordlistSpec {
        name: "secondary".to_string(),
        ignore: false,
        precedence: 1,
      },
    ];
    let mut lists = Wordlists::open(&env, &config, DbMode::Read)?;
    // The hit on the override-2 list shuts out the override-1 list.
    let counts = lists.lookup(b"deal")?;
    assert_eq!((0, 7), (counts.good, counts.bad));
    lists.close()?;
    env.close()
  }

  #[test]
  fn stored_robx_is_unscaled() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, true)?;
    let config = Config::default();
    let mut lists = Wordlists::open(&env, &config, DbMode::Write)?;
    assert_eq!(None, lists.stored_robx()?);
    lists
      .default_list()
      .db
      .transaction(|db| db.put(datastore::ROBX_KEY, TokenRecord { good: 0, spam: 520_000 }))?;
    assert_eq!(Some(0.52), lists.stored_robx()?);
    lists.close()?;
    env.close()
  }
}
