// Environment-level concurrency control: a whole-file lock held shared for
// normal operation and exclusive for recovery, a second lock serializing
// writers, and the sentinel that marks an unclean shutdown.

use crate::Fault;
use fs2::FileExt as _;
use std::{fs, io, path, thread, time};

pub const LOCK_FILE: &str = "lockfile-d";
pub const WRITE_LOCK_FILE: &str = "lockfile-w";
pub const RECOVERY_SENTINEL: &str = "recovery-needed";

/// Bounds on the jittered back-off between lock attempts.
const SLEEP_MIN_MS: u64 = 4;
const SLEEP_MAX_MS: u64 = 100;
const WRITE_LOCK_ATTEMPTS: u32 = 50;

/// A pseudo-random sleep between 4 and 100 ms, seeded from the clock; enough
/// to break the lockstep of two processes retrying the same lock.
pub fn jittered_sleep() {
  let nanos = time::SystemTime::now()
    .duration_since(time::UNIX_EPOCH)
    .map(|duration| duration.subsec_nanos() as u64)
    .unwrap_or(0);
  let millis = SLEEP_MIN_MS + nanos % (SLEEP_MAX_MS - SLEEP_MIN_MS);
  thread::sleep(time::Duration::from_millis(millis));
}

fn lock_file(directory: &path::Path, name: &str) -> io::Result<fs::File> {
  fs::OpenOptions::new()
    .create(true)
    .read(true)
    .write(true)
    .open(directory.join(name))
}

/// The `lockfile-d` sentinel: shared while operating, exclusive to recover.
#[derive(Debug)]
pub struct EnvLock {
  file: fs::File,
  exclusive: bool,
}

impl EnvLock {
  pub fn shared(directory: &path::Path) -> io::Result<Self> {
    let file = lock_file(directory, LOCK_FILE)?;
    file.lock_shared()?;
    Ok(Self {
      file,
      exclusive: false,
    })
  }

  pub fn exclusive(directory: &path::Path) -> io::Result<Self> {
    let file = lock_file(directory, LOCK_FILE)?;
    file.lock_exclusive()?;
    Ok(Self {
      file,
      exclusive: true,
    })
  }

  /// Release-then-acquire; the state in the environment must be re-checked
  /// afterwards since another process may have slipped in between.
  pub fn upgrade(&mut self) -> io::Result<()> {
    if !self.exclusive {
      self.file.unlock()?;
      self.file.lock_exclusive()?;
      self.exclusive = true;
    }
    Ok(())
  }

  pub fn downgrade(&mut self) -> io::Result<()> {
    if self.exclusive {
      self.file.unlock()?;
      self.file.lock_shared()?;
      self.exclusive = false;
    }
    Ok(())
  }
}

impl Drop for EnvLock {
  fn drop(&mut self) {
    let _ = self.file.unlock();
  }
}

/// Serializes writers across processes for the span of one transaction.
/// Acquisition is try-lock with bounded jittered retries; exhausting them is
/// the moral equivalent of a deadlock and surfaces as `TempFail` so the
/// caller aborts and retries from its outer boundary.
#[derive(Debug)]
pub struct WriteLock {
  file: fs::File,
}

impl WriteLock {
  pub fn acquire(directory: &path::Path) -> anyhow::Result<Self> {
    let file = lock_file(directory, WRITE_LOCK_FILE)?;
    for attempt in 0..WRITE_LOCK_ATTEMPTS {
      match file.try_lock_exclusive() {
        Ok(()) => {
          if attempt > 0 {
            log::debug!("write lock acquired after {attempt} retries");
          }
          return Ok(Self { file });
        }
        Err(_) => jittered_sleep(),
      }
    }
    Err(Fault::TempFail("write lock busy, retries exhausted".to_string()).into())
  }
}

impl Drop for WriteLock {
  fn drop(&mut self) {
    let _ = self.file.unlock();
  }
}

pub fn sentinel_present(directory: &path::Path) -> bool {
  directory.join(RECOVERY_SENTINEL).exists()
}

pub fn set_sentinel(directory: &path::Path) -> io::Result<()> {
  fs::File::create(directory.join(RECOVERY_SENTINEL)).map(|_| ())
}

pub fn clear_sentinel(directory: &path::Path) -> io::Result<()> {
  match fs::remove_file(directory.join(RECOVERY_SENTINEL)) {
    Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
    _ => Ok(()),
  }
}
