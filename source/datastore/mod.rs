// The transactional token store. An environment is a directory holding one
// snapshot file per wordlist plus a shared transaction log; committed
// transactions append to the log and fold into an in-memory delta, and
// checkpoints rewrite the snapshot and let the log be purged.
//
// Multi-process safety: `lockfile-d` is held shared by every running process
// and exclusive during recovery; writers additionally serialize commits
// through `lockfile-w` and re-read the log at transaction begin, so each
// write transaction starts from the latest committed state. A sentinel file,
// share-locked by live writers, marks unclean shutdown: when it exists but
// nobody holds it, the next opener runs recovery.

use crate::Fault;
use anyhow::Context as _;
use std::{cell, collections, fs, path, time};

pub mod journal;
pub mod lock;
pub mod snapshot;

pub const MSG_COUNT_KEY: &[u8] = b".MSG_COUNT";
pub const ROBX_KEY: &[u8] = b".ROBX";

pub const DEFAULT_CACHE_MIB: usize = 4;
/// Checkpoint on close once this much log has accumulated.
const CHECKPOINT_LOG_BYTES: u64 = 64 * 1024;
/// ... or once the snapshot is this stale.
const CHECKPOINT_AGE: time::Duration = time::Duration::from_secs(120 * 60);

const TRANSACTION_ATTEMPTS: u32 = 3;

/// The persisted value: per-token (good, spam) counts.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct TokenRecord {
  pub good: u32,
  pub spam: u32,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum DbMode {
  Read,
  Write,
}

fn is_tempfail(error: &anyhow::Error) -> bool {
  matches!(error.downcast_ref::<Fault>(), Some(Fault::TempFail(_)))
}

fn is_corrupt(error: &anyhow::Error) -> bool {
  matches!(error.downcast_ref::<Fault>(), Some(Fault::Corrupt(_)))
}

/// Refuse to run into the process file-size resource limit: hard error with
/// less than 16 pages of headroom, warning under 2 MiB.
fn check_file_size_limit(path: &path::Path, len: u64) -> anyhow::Result<()> {
  let mut limit = libc::rlimit {
    rlim_cur: 0,
    rlim_max: 0,
  };
  // SAFETY: getrlimit only writes into the struct handed to it.
  if unsafe { libc::getrlimit(libc::RLIMIT_FSIZE, &mut limit) } != 0 {
    return Ok(());
  }
  if limit.rlim_cur == libc::RLIM_INFINITY {
    return Ok(());
  }
  let current = limit.rlim_cur as u64;
  let page = snapshot::PAGE_SIZE as u64;
  if current / page < len / page + 16 {
    return Err(
      Fault::LimitExceeded(format!(
        "{} is within 16 pages of the file-size resource limit",
        path.display()
      ))
      .into(),
    );
  }
  if (current >> 20) < (len >> 20) + 2 {
    log::warn!(
      "{} approaches the file-size resource limit, write errors may corrupt it",
      path.display()
    );
  }
  Ok(())
}

#[derive(Debug)]
pub struct Env {
  directory: path::PathBuf,
  lock: lock::EnvLock,
  cache: cell::RefCell<snapshot::PageCache>,
  /// Share-locked while this process may write; see the module comment.
  sentinel_guard: Option<fs::File>,
  /// Highest log sequence this process has observed.
  last_seq: cell::Cell<u64>,
  next_db_id: cell::Cell<u32>,
}

impl Env {
  pub fn open(directory: &path::Path, cache_mib: usize, write: bool) -> anyhow::Result<Self> {
    fs::create_dir_all(directory)?;
    let mut lock = lock::EnvLock::shared(directory)?;

    if lock::sentinel_present(directory) && Self::sentinel_abandoned(directory)? {
      log::warn!("unclean shutdown detected in {}, recovering", directory.display());
      lock.upgrade()?;
      // Re-check: someone else may have recovered while we waited.
      if lock::sentinel_present(directory) && Self::sentinel_abandoned(directory)? {
        if let Err(error) = recover_locked(directory, false) {
          if !is_corrupt(&error) {
            return Err(error);
          }
          log::warn!("normal recovery failed ({error}), running catastrophic recovery");
          recover_locked(directory, true)?;
        }
        lock::clear_sentinel(directory)?;
      }
      lock.downgrade()?;
    }

    let sentinel_guard = if write {
      lock::set_sentinel(directory)?;
      let guard = fs::File::open(directory.join(lock::RECOVERY_SENTINEL))?;
      fs2::FileExt::lock_shared(&guard)?;
      Some(guard)
    } else {
      None
    };

    Ok(Self {
      directory: directory.to_path_buf(),
      lock,
      cache: cell::RefCell::new(snapshot::PageCache::new(cache_mib * 1024 * 1024)),
      sentinel_guard,
      last_seq: cell::Cell::new(0),
      next_db_id: cell::Cell::new(0),
    })
  }

  /// True when the sentinel exists but no live writer share-locks it.
  fn sentinel_abandoned(directory: &path::Path) -> anyhow::Result<bool> {
    let sentinel = match fs::File::open(directory.join(lock::RECOVERY_SENTINEL)) {
      Ok(sentinel) => sentinel,
      Err(_) => return Ok(false),
    };
    match fs2::FileExt::try_lock_exclusive(&sentinel) {
      Ok(()) => {
        fs2::FileExt::unlock(&sentinel)?;
        Ok(true)
      }
      Err(_) => Ok(false),
    }
  }

  pub fn directory(&self) -> &path::Path {
    &self.directory
  }

  /// Clean shutdown: the last live writer takes the sentinel down.
  pub fn close(mut self) -> anyhow::Result<()> {
    if let Some(guard) = self.sentinel_guard.take() {
      fs2::FileExt::unlock(&guard)?;
      if fs2::FileExt::try_lock_exclusive(&guard).is_ok() {
        lock::clear_sentinel(&self.directory)?;
      }
    }
    Ok(())
  }

  /// Folds the whole log into every snapshot, under the exclusive lock.
  pub fn checkpoint(&mut self) -> anyhow::Result<()> {
    self.lock.upgrade()?;
    let result = recover_locked(&self.directory, false);
    self.lock.downgrade()?;
    result
  }

  /// Removes log segments below every snapshot's fold watermark.
  pub fn purge_logs(&mut self) -> anyhow::Result<usize> {
    self.lock.upgrade()?;
    let result = (|| {
      let mut watermark = u64::MAX;
      let mut any = false;
      for path in database_files(&self.directory)? {
        watermark = watermark.min(snapshot::Snapshot::open(&path)?.last_seq);
        any = true;
      }
      if !any {
        watermark = 0;
      }
      journal::purge(&self.directory, watermark)
    })();
    self.lock.downgrade()?;
    result
  }
}

fn database_files(directory: &path::Path) -> anyhow::Result<Vec<path::PathBuf>> {
  let mut files = Vec::new();
  for entry in fs::read_dir(directory)? {
    let path = entry?.path();
    if path.extension().and_then(|extension| extension.to_str()) == Some("db") {
      files.push(path);
    }
  }
  files.sort();
  Ok(files)
}

/// Rebuilds every snapshot from its last checkpoint plus the log (normal) or
/// from the log alone (catastrophic, when a snapshot no longer opens).
fn recover_locked(directory: &path::Path, catastrophic: bool) -> anyhow::Result<()> {
  journal::truncate_torn_tail(directory)?;
  for path in database_files(directory)? {
    let name = path
      .file_stem()
      .and_then(|stem| stem.to_str())
      .with_context(|| format!("unusable database file name {path:?}"))?
      .to_string();
    let (mut records, watermark): (collections::BTreeMap<Vec<u8>, TokenRecord>, u64) =
      if catastrophic {
        (collections::BTreeMap::new(), 0)
      } else {
        let snapshot = snapshot::Snapshot::open(&path)?;
        let mut cache = snapshot::PageCache::new(DEFAULT_CACHE_MIB * 1024 * 1024);
        (
          snapshot.records(0, &mut cache)?.into_iter().collect(),
          snapshot.last_seq,
        )
      };
    let last = journal::replay(directory, watermark, |record| {
      if record.db != name {
        return;
      }
      for op in record.ops {
        match op {
          journal::Op::Put(key, value) => records.insert(key, value),
          journal::Op::Del(key) => records.remove(&key),
        };
      }
    })?;
    snapshot::Snapshot::write(
      &path,
      records.iter().map(|(key, value)| (key.as_slice(), *value)),
      last,
    )?;
    log::info!("recovered {} ({} records)", path.display(), records.len());
  }
  Ok(())
}

/// Standalone recovery entry point (the `recover` command).
pub fn recover(directory: &path::Path, catastrophic: bool) -> anyhow::Result<()> {
  fs::create_dir_all(directory)?;
  let _lock = lock::EnvLock::exclusive(directory)?;
  match recover_locked(directory, catastrophic) {
    Err(error) if is_corrupt(&error) && !catastrophic => {
      log::warn!("normal recovery failed ({error}), running catastrophic recovery");
      recover_locked(directory, true)?;
    }
    result => result?,
  }
  lock::clear_sentinel(directory)?;
  Ok(())
}

/// Standalone integrity check (the `verify` command).
pub fn verify(path: &path::Path) -> anyhow::Result<()> {
  snapshot::verify(path)
}

#[derive(Debug)]
struct Txn {
  writes: collections::BTreeMap<Vec<u8>, Option<TokenRecord>>,
  _write_lock: Option<lock::WriteLock>,
}

#[derive(Debug)]
pub struct Db<'env> {
  env: &'env Env,
  id: u32,
  name: String,
  path: path::PathBuf,
  mode: DbMode,
  snapshot: snapshot::Snapshot,
  /// Committed-but-not-checkpointed state; `None` marks a deletion.
  delta: collections::BTreeMap<Vec<u8>, Option<TokenRecord>>,
  /// Log sequence up to which `delta` is current.
  applied_seq: u64,
  txn: Option<Txn>,
}

impl<'env> Db<'env> {
  pub fn open(env: &'env Env, name: &str, mode: DbMode) -> anyhow::Result<Self> {
    let path = env.directory.join(format!("{name}.db"));
    if !path.exists() {
      match mode {
        DbMode::Read => {
          return Err(Fault::NotFound).with_context(|| format!("no wordlist at {path:?}"))
        }
        // Creation races resolve themselves: both writers produce an empty
        // snapshot via atomic rename.
        DbMode::Write => snapshot::Snapshot::write(&path, std::iter::empty(), 0)?,
      }
    }
    let snapshot = snapshot::Snapshot::open(&path)?;
    check_file_size_limit(&path, snapshot.file_len())?;
    if snapshot.swapped {
      log::debug!("{} was written on a swapped-endian host", path.display());
    }
    let id = env.next_db_id.get();
    env.next_db_id.set(id + 1);
    let mut db = Self {
      env,
      id,
      name: name.to_string(),
      path,
      mode,
      applied_seq: snapshot.last_seq,
      snapshot,
      delta: collections::BTreeMap::new(),
      txn: None,
    };
    db.refresh()?;
    Ok(db)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Catches up on transactions other processes committed since the last
  /// look at the log.
  pub fn refresh(&mut self) -> anyhow::Result<()> {
    let name = self.name.clone();
    let mut delta = std::mem::take(&mut self.delta);
    let last = journal::replay(&self.env.directory, self.applied_seq, |record| {
      if record.db != name {
        return;
      }
      for op in record.ops {
        match op {
          journal::Op::Put(key, value) => delta.insert(key, Some(value)),
          journal::Op::Del(key) => delta.insert(key, None),
        };
      }
    })?;
    self.delta = delta;
    self.applied_seq = last;
    self.env.last_seq.set(self.env.last_seq.get().max(last));
    Ok(())
  }

  pub fn txn_begin(&mut self) -> anyhow::Result<()> {
    anyhow::ensure!(self.txn.is_none(), "transaction already active on {}", self.name);
    let write_lock = match self.mode {
      DbMode::Write => Some(lock::WriteLock::acquire(&self.env.directory)?),
      DbMode::Read => None,
    };
    self.refresh()?;
    self.txn = Some(Txn {
      writes: collections::BTreeMap::new(),
      _write_lock: write_lock,
    });
    Ok(())
  }

  pub fn get(&mut self, key: &[u8]) -> anyhow::Result<Option<TokenRecord>> {
    if let Some(txn) = &self.txn {
      if let Some(value) = txn.writes.get(key) {
        return Ok(*value);
      }
    }
    if let Some(value) = self.delta.get(key) {
      return Ok(*value);
    }
    self
      .snapshot
      .lookup(key, self.id, &mut self.env.cache.borrow_mut())
  }

  pub fn put(&mut self, key: &[u8], value: TokenRecord) -> anyhow::Result<()> {
    anyhow::ensure!(self.mode == DbMode::Write, "{} is read-only", self.name);
    let txn = self
      .txn
      .as_mut()
      .with_context(|| format!("put on {} outside a transaction", self.name))?;
    txn.writes.insert(key.to_vec(), Some(value));
    Ok(())
  }

  /// Removing an absent key is not an error.
  pub fn del(&mut self, key: &[u8]) -> anyhow::Result<()> {
    anyhow::ensure!(self.mode == DbMode::Write, "{} is read-only", self.name);
    let txn = self
      .txn
      .as_mut()
      .with_context(|| format!("del on {} outside a transaction", self.name))?;
    txn.writes.insert(key.to_vec(), None);
    Ok(())
  }

  pub fn txn_commit(&mut self) -> anyhow::Result<()> {
    let txn = self
      .txn
      .take()
      .with_context(|| format!("commit on {} without a transaction", self.name))?;
    if txn.writes.is_empty() {
      return Ok(());
    }
    let seq = self.env.last_seq.get() + 1;
    let ops = txn
      .writes
      .iter()
      .map(|(key, value)| match value {
        Some(value) => journal::Op::Put(key.clone(), *value),
        None => journal::Op::Del(key.clone()),
      })
      .collect();
    journal::append(
      &self.env.directory,
      &journal::Record {
        seq,
        db: self.name.clone(),
        ops,
      },
    )?;
    crate::interrupt(crate::Interruption::CommitAfterAppend)?;
    for (key, value) in txn.writes {
      self.delta.insert(key, value);
    }
    self.env.last_seq.set(seq);
    self.applied_seq = seq;
    Ok(())
  }

  pub fn txn_abort(&mut self) {
    self.txn = None;
  }

  /// Runs `f` inside a transaction with internal retry: a `TempFail` from
  /// the lock layer aborts, backs off and starts over; the fault only
  /// reaches the caller once the retry budget is spent. The aborted
  /// transaction is never reused.
  pub fn transaction<T, F>(&mut self, mut f: F) -> anyhow::Result<T>
  where
    F: FnMut(&mut Self) -> anyhow::Result<T>,
  {
    let mut attempt = 0;
    loop {
      attempt += 1;
      let result = match self.txn_begin() {
        Ok(()) => match f(self) {
          Ok(value) => self.txn_commit().map(|()| value),
          Err(error) => Err(error),
        },
        Err(error) => Err(error),
      };
      match result {
        Ok(value) => return Ok(value),
        Err(error) => {
          self.txn_abort();
          if is_tempfail(&error) && attempt < TRANSACTION_ATTEMPTS {
            log::debug!("transaction on {} hit {error}, retrying", self.name);
            lock::jittered_sleep();
            continue;
          }
          return Err(error);
        }
      }
    }
  }

  /// Visits all records in raw-byte key order; the visitor returns false to
  /// stop. Sees the transaction's own writes when one is active.
  pub fn scan<F>(&mut self, mut visitor: F) -> anyhow::Result<()>
  where
    F: FnMut(&[u8], &TokenRecord) -> bool,
  {
    let mut overlay: collections::BTreeMap<&[u8], Option<TokenRecord>> = self
      .delta
      .iter()
      .map(|(key, value)| (key.as_slice(), *value))
      .collect();
    if let Some(txn) = &self.txn {
      for (key, value) in &txn.writes {
        overlay.insert(key.as_slice(), *value);
      }
    }
    let mut overlay = overlay.into_iter().peekable();
    let mut stopped = false;

    'pages: for number in 0..self.snapshot.page_count {
      let page = self
        .snapshot
        .page(number, self.id, &mut self.env.cache.borrow_mut())?;
      for (key, value) in page.iter() {
        // Overlay entries sorting before this snapshot key come first.
        while let Some((overlay_key, _)) = overlay.peek() {
          if *overlay_key >= key.as_slice() {
            break;
          }
          let (overlay_key, overlay_value) = overlay.next().unwrap();
          if let Some(overlay_value) = overlay_value {
            if !visitor(overlay_key, &overlay_value) {
              stopped = true;
              break 'pages;
            }
          }
        }
        let emitted = match overlay.peek() {
          Some((overlay_key, _)) if *overlay_key == key.as_slice() => {
            let (overlay_key, overlay_value) = overlay.next().unwrap();
            match overlay_value {
              Some(overlay_value) => visitor(overlay_key, &overlay_value),
              None => true, // deleted
            }
          }
          _ => visitor(key, value),
        };
        if !emitted {
          stopped = true;
          break 'pages;
        }
      }
    }

    if !stopped {
      for (key, value) in overlay {
        if let Some(value) = value {
          if !visitor(key, &value) {
            break;
          }
        }
      }
    }
    Ok(())
  }

  /// Folds the delta into a fresh snapshot and drops the folded log span.
  pub fn checkpoint(&mut self) -> anyhow::Result<()> {
    anyhow::ensure!(
      self.txn.is_none(),
      "checkpoint on {} with a transaction active",
      self.name
    );
    let _write_lock = lock::WriteLock::acquire(&self.env.directory)?;
    self.refresh()?;
    let base = {
      let mut cache = self.env.cache.borrow_mut();
      self.snapshot.records(self.id, &mut cache)?
    };
    let mut merged: collections::BTreeMap<Vec<u8>, TokenRecord> = base.into_iter().collect();
    for (key, value) in &self.delta {
      match value {
        Some(value) => merged.insert(key.clone(), *value),
        None => merged.remove(key),
      };
    }
    snapshot::Snapshot::write(
      &self.path,
      merged.iter().map(|(key, value)| (key.as_slice(), *value)),
      self.applied_seq,
    )?;
    self.snapshot = snapshot::Snapshot::open(&self.path)?;
    self.delta.clear();
    self.env.cache.borrow_mut().invalidate(self.id);
    log::debug!("checkpointed {} ({} records)", self.name, merged.len());
    Ok(())
  }

  /// Close with the bounded checkpoint: fold when enough log accumulated or
  /// the snapshot got old enough.
  pub fn close(mut self) -> anyhow::Result<()> {
    if self.mode == DbMode::Read {
      return Ok(());
    }
    let log_bytes = journal::log_bytes(&self.env.directory);
    let stale = fs::metadata(&self.path)
      .and_then(|metadata| metadata.modified())
      .ok()
      .and_then(|modified| time::SystemTime::now().duration_since(modified).ok())
      .is_some_and(|age| age >= CHECKPOINT_AGE);
    if log_bytes >= CHECKPOINT_LOG_BYTES || stale {
      self.checkpoint()?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn open_env(directory: &path::Path) -> anyhow::Result<Env> {
    Env::open(directory, DEFAULT_CACHE_MIB, true)
  }

  fn record(good: u32, spam: u32) -> TokenRecord {
    TokenRecord { good, spam }
  }

  #[test]
  fn put_get_del() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = open_env(directory.path())?;
    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;

    db.transaction(|db| {
      db.put(b"token", record(1, 2))?;
      db.put(b"other", record(3, 0))?;
      db.del(b"missing") // not an error
    })?;
    assert_eq!(Some(record(1, 2)), db.get(b"token")?);
    assert_eq!(None, db.get(b"missing")?);

    db.transaction(|db| db.del(b"token"))?;
    assert_eq!(None, db.get(b"token")?);
    drop(db);
    env.close()
  }

  #[test]
  fn abort_discards() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = open_env(directory.path())?;
    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    db.txn_begin()?;
    db.put(b"token", record(1, 0))?;
    assert_eq!(Some(record(1, 0)), db.get(b"token")?);
    db.txn_abort();
    assert_eq!(None, db.get(b"token")?);
    drop(db);
    env.close()
  }

  #[test]
  fn commit_survives_reopen() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    {
      let env = open_env(directory.path())?;
      let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
      db.transaction(|db| db.put(b"token", record(4, 5)))?;
      db.close()?;
      env.close()?;
    }
    let env = open_env(directory.path())?;
    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    assert_eq!(Some(record(4, 5)), db.get(b"token")?);
    drop(db);
    env.close()
  }

  #[test]
  fn scan_is_key_ordered_and_merged() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = open_env(directory.path())?;
    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    db.transaction(|db| {
      db.put(b"zebra", record(1, 0))?;
      db.put(b"apple", record(2, 0))?;
      db.put(b"mango", record(3, 0))
    })?;
    // Push part of the state into the snapshot, leave the rest in the delta.
    db.checkpoint()?;
    db.transaction(|db| {
      db.put(b"banana", record(4, 0))?;
      db.del(b"zebra")
    })?;

    let mut keys = Vec::new();
    db.scan(|key, _| {
      keys.push(key.to_vec());
      true
    })?;
    assert_eq!(
      vec![b"apple".to_vec(), b"banana".to_vec(), b"mango".to_vec()],
      keys
    );
    drop(db);
    env.close()
  }

  #[test]
  fn scan_sees_active_transaction() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = open_env(directory.path())?;
    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    db.txn_begin()?;
    db.put(b"pending", record(1, 0))?;
    let mut seen = Vec::new();
    db.scan(|key, _| {
      seen.push(key.to_vec());
      true
    })?;
    assert_eq!(vec![b"pending".to_vec()], seen);
    db.txn_abort();
    drop(db);
    env.close()
  }

  #[test]
  fn missing_db_in_read_mode() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env = Env::open(directory.path(), DEFAULT_CACHE_MIB, false)?;
    let error = Db::open(&env, "wordlist", DbMode::Read).unwrap_err();
    assert!(matches!(
      error.downcast_ref::<Fault>(),
      Some(Fault::NotFound)
    ));
    env.close()
  }

  #[test]
  fn another_environment_sees_commits() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let env1 = open_env(directory.path())?;
    let mut db1 = Db::open(&env1, "wordlist", DbMode::Write)?;
    let env2 = open_env(directory.path())?;
    let mut db2 = Db::open(&env2, "wordlist", DbMode::Write)?;

    db1.transaction(|db| db.put(b"shared", record(1, 1)))?;
    // The other handle catches up at its next transaction boundary.
    db2.transaction(|db| {
      let current = db.get(b"shared")?.unwrap_or_default();
      db.put(
        b"shared",
        record(current.good + 1, current.spam),
      )
    })?;
    db1.refresh()?;
    assert_eq!(Some(record(2, 1)), db1.get(b"shared")?);

    drop(db1);
    drop(db2);
    env1.close()?;
    env2.close()
  }

  #[test]
  fn env_checkpoint_folds_every_database() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut env = open_env(directory.path())?;
    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    db.transaction(|db| db.put(b"token", record(1, 2)))?;
    drop(db);

    env.checkpoint()?;
    let folded = snapshot::Snapshot::open(&directory.path().join("wordlist.db"))?;
    assert!(folded.last_seq >= 1);

    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    assert_eq!(Some(record(1, 2)), db.get(b"token")?);
    drop(db);
    env.close()
  }

  #[test]
  fn checkpoint_then_purge_leaves_state_intact() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    let mut env = open_env(directory.path())?;
    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    for i in 0..10 {
      db.transaction(|db| db.put(format!("token-{i}").as_bytes(), record(i, 0)))?;
    }
    db.checkpoint()?;
    drop(db);
    env.purge_logs()?;

    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    assert_eq!(Some(record(7, 0)), db.get(b"token-7")?);
    drop(db);
    env.close()
  }

  #[test]
  fn sentinel_triggers_recovery() -> anyhow::Result<()> {
    let directory = tempfile::tempdir()?;
    {
      let env = open_env(directory.path())?;
      let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
      db.transaction(|db| db.put(b"kept", record(1, 0)))?;
      drop(db);
      drop(env); // crash: close() never ran, sentinel stays behind
    }
    assert!(lock::sentinel_present(directory.path()));
    let env = open_env(directory.path())?;
    assert!(lock::sentinel_present(directory.path())); // ours now
    let mut db = Db::open(&env, "wordlist", DbMode::Write)?;
    assert_eq!(Some(record(1, 0)), db.get(b"kept")?);
    drop(db);
    env.close()?;
    assert!(!lock::sentinel_present(directory.path()));
    Ok(())
  }
}
