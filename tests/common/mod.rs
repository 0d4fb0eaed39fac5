use anyhow::Context as _;
use std::{fs, path};

/// Drives the classifier library against a scratch wordlist directory the
/// way the binary would, one `run` per invocation.
#[derive(Clone)]
pub struct Runner {
  directory: path::PathBuf,
  algorithm: Option<chaff::score::Algorithm>,
  interruption: Option<chaff::Interruption>,
  counter: std::cell::Cell<u32>,
}

pub fn setup<F>(test: F)
where
  F: FnOnce(Runner) -> anyhow::Result<()>,
{
  let directory = tempfile::tempdir().unwrap();
  test(Runner::new(directory.path())).unwrap()
}

/// A minimal but well-formed message.
pub fn email(subject: &str, body: &str) -> String {
  format!(
    "From sender@example.com  Mon Jan  1 00:00:00 2024\n\
     From: sender@example.com\n\
     To: recipient@example.com\n\
     Subject: {subject}\n\
     \n\
     {body}\n"
  )
}

impl Runner {
  pub fn new(directory: &path::Path) -> Self {
    // An explicit empty configuration so a developer's ~/.chaffrc can't
    // leak into the tests.
    let config = directory.join("chaffrc");
    fs::write(&config, "").unwrap();
    Self {
      directory: directory.to_path_buf(),
      algorithm: None,
      interruption: None,
      counter: std::cell::Cell::new(0),
    }
  }

  pub fn with_algorithm(&self, algorithm: chaff::score::Algorithm) -> Self {
    Self {
      algorithm: Some(algorithm),
      ..self.clone()
    }
  }

  pub fn with_interruption(&self, interruption: chaff::Interruption) -> Self {
    Self {
      interruption: Some(interruption),
      ..self.clone()
    }
  }

  pub fn wordlist_directory(&self) -> path::PathBuf {
    self.directory.join("wordlists")
  }

  fn scratch(&self, name: &str, contents: &str) -> anyhow::Result<path::PathBuf> {
    let count = self.counter.get();
    self.counter.set(count + 1);
    let path = self.directory.join(format!("{name}-{count}"));
    fs::write(&path, contents)?;
    Ok(path)
  }

  pub fn arguments(&self, mode: chaff::Mode) -> chaff::Arguments {
    chaff::Arguments {
      mode,
      directory: Some(self.wordlist_directory()),
      config: Some(self.directory.join("chaffrc")),
      input: None,
      output: None,
      passthrough: false,
      algorithm: self.algorithm,
      spam_cutoff: None,
      ham_cutoff: None,
      terse: false,
      rtable: false,
      nonspam_exits_zero: false,
      unlearn_from_other: false,
      catastrophic: false,
      interruption: self.interruption,
    }
  }

  /// Runs one mode over a message (or mbox) given as a string.
  pub fn run_on(&self, mode: chaff::Mode, input: &str) -> anyhow::Result<i32> {
    let mut arguments = self.arguments(mode);
    arguments.input = Some(self.scratch("message", input)?);
    chaff::run(&arguments)
  }

  pub fn register(&self, mode: chaff::Mode, input: &str) -> anyhow::Result<()> {
    let code = self.run_on(mode, input)?;
    anyhow::ensure!(code == 0, "registration exited {code}");
    Ok(())
  }

  /// Classifies and returns (exit code, spamicity) via terse output.
  pub fn classify(&self, input: &str) -> anyhow::Result<(i32, f64)> {
    let mut arguments = self.arguments(chaff::Mode::Classify);
    arguments.input = Some(self.scratch("message", input)?);
    let output = self.directory.join("terse");
    arguments.output = Some(output.clone());
    arguments.terse = true;
    let code = chaff::run(&arguments)?;
    let terse = fs::read_to_string(&output)?;
    let spamicity = terse
      .split_whitespace()
      .nth(1)
      .with_context(|| format!("unexpected terse output {terse:?}"))?
      .parse()?;
    Ok((code, spamicity))
  }

  /// Classifies with pass-through and returns (exit code, emitted message).
  pub fn passthrough(&self, input: &str) -> anyhow::Result<(i32, String)> {
    let mut arguments = self.arguments(chaff::Mode::Classify);
    arguments.input = Some(self.scratch("message", input)?);
    let output = self.directory.join("passthrough");
    arguments.output = Some(output.clone());
    arguments.passthrough = true;
    let code = chaff::run(&arguments)?;
    Ok((code, fs::read_to_string(&output)?))
  }

  /// The whole store as `token good spam` lines, in key order.
  pub fn dump(&self) -> anyhow::Result<String> {
    let mut arguments = self.arguments(chaff::Mode::Dump);
    let output = self.directory.join("dump");
    arguments.output = Some(output.clone());
    let code = chaff::run(&arguments)?;
    anyhow::ensure!(code == 0, "dump exited {code}");
    Ok(fs::read_to_string(&output)?)
  }

  pub fn restore(&self, dump: &str) -> anyhow::Result<()> {
    let mut arguments = self.arguments(chaff::Mode::Restore);
    arguments.input = Some(self.scratch("restore", dump)?);
    let code = chaff::run(&arguments)?;
    anyhow::ensure!(code == 0, "restore exited {code}");
    Ok(())
  }
}
