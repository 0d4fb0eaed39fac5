// Startup configuration: built-in defaults for the selected algorithm, then
// the `key = value` configuration file, then command-line overrides, frozen
// into one immutable value threaded through every subsystem.

use crate::{score::Algorithm, Fault};
use anyhow::Context as _;
use std::{env, fs, path};

pub const CONFIG_FILE_NAME: &str = ".chaffrc";
pub const DIRECTORY_ENV: &str = "BOGOFILTER_DIR";
pub const DEFAULT_DIRECTORY: &str = ".chaff";

#[derive(Clone, Debug, PartialEq)]
pub struct WordlistSpec {
  pub name: String,
  pub ignore: bool,
  pub precedence: u8,
}

#[derive(Clone, Debug)]
pub struct Config {
  pub directory: path::PathBuf,
  pub algorithm: Algorithm,
  pub spam_cutoff: f64,
  pub ham_cutoff: f64,
  pub min_dev: f64,
  pub robs: f64,
  /// None: use the wordlist's stored `.ROBX`, or the built-in default.
  pub robx: Option<f64>,
  pub sp_esf: f64,
  pub ns_esf: f64,
  /// Print per-token statistics once spamicity exceeds this.
  pub thresh_stats: f64,
  /// Update-mode registration needs at least this much certainty.
  pub thresh_update: f64,
  pub max_repeats: u32,
  pub block_on_subnets: bool,
  pub charset_default: String,
  pub kill_html_comments: bool,
  pub count_html_comments: u32,
  pub score_html_comments: bool,
  pub replace_nonascii_characters: bool,
  pub tag_header_lines: bool,
  /// Page-cache budget in MiB, shared by all wordlists of the environment.
  pub db_cachesize: usize,
  pub spam_header_name: String,
  pub wordlists: Vec<WordlistSpec>,
}

impl Default for Config {
  fn default() -> Self {
    Self::with_algorithm(Algorithm::Fisher)
  }
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
  match value {
    "yes" | "true" | "on" | "1" => Ok(true),
    "no" | "false" | "off" | "0" => Ok(false),
    _ => Err(Fault::Config(format!("not a boolean: {value}")).into()),
  }
}

fn parse_float(key: &str, value: &str) -> anyhow::Result<f64> {
  value
    .parse()
    .map_err(|_| Fault::Config(format!("{key}: not a number: {value}")).into())
}

fn parse_int<T: std::str::FromStr>(key: &str, value: &str) -> anyhow::Result<T> {
  value
    .parse()
    .map_err(|_| Fault::Config(format!("{key}: not an integer: {value}")).into())
}

/// `wordlist = n,name,1` or `wordlist = i,name,2`.
fn parse_wordlist(value: &str) -> anyhow::Result<WordlistSpec> {
  let mut fields = value.split(',').map(str::trim);
  let kind = fields.next().unwrap_or("");
  let name = fields.next().unwrap_or("");
  let precedence = fields.next().unwrap_or("");
  let ignore = match kind {
    "n" | "normal" => false,
    "i" | "ignore" => true,
    _ => return Err(Fault::Config(format!("unknown wordlist type {kind}")).into()),
  };
  if name.is_empty() || fields.next().is_some() {
    return Err(Fault::Config(format!("malformed wordlist entry: {value}")).into());
  }
  Ok(WordlistSpec {
    name: name.to_string(),
    ignore,
    precedence: parse_int("wordlist", precedence)?,
  })
}

impl Config {
  pub fn with_algorithm(algorithm: Algorithm) -> Self {
    Self {
      directory: Self::default_directory(),
      algorithm,
      spam_cutoff: algorithm.default_spam_cutoff(),
      ham_cutoff: algorithm.default_ham_cutoff(),
      min_dev: algorithm.default_min_dev(),
      robs: crate::score::ROBS_DEFAULT,
      robx: None,
      sp_esf: 1.0,
      ns_esf: 1.0,
      thresh_stats: 0.0,
      thresh_update: 0.0,
      max_repeats: algorithm.default_max_repeats(),
      block_on_subnets: false,
      charset_default: "us-ascii".to_string(),
      kill_html_comments: true,
      count_html_comments: 5,
      score_html_comments: false,
      replace_nonascii_characters: false,
      tag_header_lines: true,
      db_cachesize: crate::datastore::DEFAULT_CACHE_MIB,
      spam_header_name: "X-Bogosity".to_string(),
      wordlists: vec![WordlistSpec {
        name: "wordlist".to_string(),
        ignore: false,
        precedence: 1,
      }],
    }
  }

  /// `$BOGOFILTER_DIR`, else `$HOME/.chaff`.
  pub fn default_directory() -> path::PathBuf {
    if let Ok(directory) = env::var(DIRECTORY_ENV) {
      return path::PathBuf::from(directory);
    }
    match env::var("HOME") {
      Ok(home) => path::Path::new(&home).join(DEFAULT_DIRECTORY),
      Err(_) => path::PathBuf::from(DEFAULT_DIRECTORY),
    }
  }

  fn user_config_file() -> Option<path::PathBuf> {
    let home = env::var("HOME").ok()?;
    let file = path::Path::new(&home).join(CONFIG_FILE_NAME);
    file.exists().then_some(file)
  }

  /// Builds the configuration from defaults and the configuration file.
  /// A command-line algorithm takes precedence over the file's and decides
  /// the dependent defaults (cutoffs, min_dev, max_repeats).
  pub fn load(
    file: Option<&path::Path>,
    command_line_algorithm: Option<Algorithm>,
  ) -> anyhow::Result<Self> {
    let file = file.map(path::Path::to_path_buf).or_else(Self::user_config_file);
    let contents = match &file {
      Some(file) => fs::read_to_string(file)
        .with_context(|| format!("couldn't read configuration {file:?}"))?,
      None => String::new(),
    };

    let entries: Vec<(String, String)> = contents
      .lines()
      .map(str::trim)
      .filter(|line| !line.is_empty() && !line.starts_with('#'))
      .filter_map(|line| {
        let (key, value) = line.split_once('=')?;
        Some((key.trim().to_string(), value.trim().to_string()))
      })
      .collect();

    // The algorithm first: the other defaults hang off it.
    let mut algorithm = command_line_algorithm.unwrap_or(Algorithm::Fisher);
    if command_line_algorithm.is_none() {
      for (key, value) in &entries {
        if key == "algorithm" {
          algorithm = Algorithm::parse(value)?;
        }
      }
    }

    let mut config = Self::with_algorithm(algorithm);
    let mut default_wordlists = true;
    for (key, value) in &entries {
      match key.as_str() {
        "algorithm" => (), // handled above
        "bogofilter_dir" => config.directory = path::PathBuf::from(value),
        "spam_cutoff" => config.spam_cutoff = parse_float(key, value)?,
        "ham_cutoff" => config.ham_cutoff = parse_float(key, value)?,
        "min_dev" => config.min_dev = parse_float(key, value)?,
        "robs" => config.robs = parse_float(key, value)?,
        "robx" => config.robx = Some(parse_float(key, value)?),
        "sp_esf" => config.sp_esf = parse_float(key, value)?,
        "ns_esf" => config.ns_esf = parse_float(key, value)?,
        "thresh_stats" => config.thresh_stats = parse_float(key, value)?,
        "thresh_update" => config.thresh_update = parse_float(key, value)?,
        "max_repeats" => config.max_repeats = parse_int(key, value)?,
        "block_on_subnets" => config.block_on_subnets = parse_bool(value)?,
        "charset_default" => config.charset_default = value.to_lowercase(),
        "kill_html_comments" => config.kill_html_comments = parse_bool(value)?,
        "count_html_comments" => config.count_html_comments = parse_int(key, value)?,
        "score_html_comments" => config.score_html_comments = parse_bool(value)?,
        "replace_nonascii_characters" => {
          config.replace_nonascii_characters = parse_bool(value)?
        }
        "tag_header_lines" => config.tag_header_lines = parse_bool(value)?,
        "db_cachesize" => config.db_cachesize = parse_int(key, value)?,
        "spam_header_name" => config.spam_header_name = value.to_string(),
        "wordlist" => {
          // The first explicit list replaces the built-in default.
          if default_wordlists {
            config.wordlists.clear();
            default_wordlists = false;
          }
          config.wordlists.push(parse_wordlist(value)?);
        }
        _ => log::warn!("unknown configuration option {key}"),
      }
    }
    if config.wordlists.is_empty() {
      return Err(Fault::Config("no wordlists configured".to_string()).into());
    }
    if env::var(DIRECTORY_ENV).is_ok() {
      // The environment outranks the file.
      config.directory = Self::default_directory();
    }
    Ok(config)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write as _;

  #[test]
  fn algorithm_defaults() {
    let fisher = Config::default();
    assert_eq!(0.95, fisher.spam_cutoff);
    assert_eq!(0.10, fisher.ham_cutoff);
    assert_eq!(1, fisher.max_repeats);

    let graham = Config::with_algorithm(Algorithm::Graham);
    assert_eq!(0.9, graham.spam_cutoff);
    assert_eq!(0.0, graham.ham_cutoff);
    assert_eq!(4, graham.max_repeats);
  }

  #[test]
  fn file_overrides_defaults() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
      file,
      "# a comment\n\
       algorithm = robinson\n\
       spam_cutoff = 0.6\n\
       block_on_subnets = yes\n\
       db_cachesize = 16\n\
       spam_header_name = X-Spam-Status"
    )?;
    let config = Config::load(Some(file.path()), None)?;
    assert_eq!(Algorithm::Robinson, config.algorithm);
    assert_eq!(0.6, config.spam_cutoff);
    // Untouched values keep the robinson defaults.
    assert_eq!(0.1, config.min_dev);
    assert!(config.block_on_subnets);
    assert_eq!(16, config.db_cachesize);
    assert_eq!("X-Spam-Status", config.spam_header_name);
    Ok(())
  }

  #[test]
  fn command_line_algorithm_wins() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "algorithm = robinson")?;
    let config = Config::load(Some(file.path()), Some(Algorithm::Graham))?;
    assert_eq!(Algorithm::Graham, config.algorithm);
    assert_eq!(0.9, config.spam_cutoff);
    Ok(())
  }

  #[test]
  fn bad_values_are_config_faults() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(file, "spam_cutoff = lots")?;
    let error = Config::load(Some(file.path()), None).unwrap_err();
    assert!(matches!(
      error.downcast_ref::<Fault>(),
      Some(Fault::Config(_))
    ));
    Ok(())
  }

  #[test]
  fn wordlist_entries() -> anyhow::Result<()> {
    let mut file = tempfile::NamedTempFile::new()?;
    writeln!(
      file,
      "wordlist = i,ignorelist,2\n\
       wordlist = n,wordlist,1"
    )?;
    let config = Config::load(Some(file.path()), None)?;
    assert_eq!(
      vec![
        WordlistSpec {
          name: "ignorelist".to_string(),
          ignore: true,
          precedence: 2,
        },
        WordlistSpec {
          name: "wordlist".to_string(),
          ignore: false,
          precedence: 1,
        },
      ],
      config.wordlists
    );
    Ok(())
  }
}
