// The three spamicity computations: Graham's original formula from 'A Plan
// For Spam', Robinson's geometric-mean variant, and the Robinson-Fisher
// chi-squared combination. One scorer is selected at startup and drives the
// per-token probability, the combination step, and the verdict cutoffs.

use crate::{config, rstats, score::chi2::chisq_q, wordhash, Fault};

pub mod chi2;

pub const EPS: f64 = 100.0 * f64::EPSILON;
const EVEN_ODDS: f64 = 0.5;
const LN_2: f64 = std::f64::consts::LN_2;

pub const ROBS_DEFAULT: f64 = 0.001;
pub const ROBX_DEFAULT: f64 = 0.415;
/// `.ROBX` is persisted in the spam count slot, scaled by this.
pub const ROBX_SCALE: f64 = 1_000_000.0;

const GRAHAM_KEEPERS: usize = 15;
const GRAHAM_MIN_FREQ: f64 = 5.0;
const GRAHAM_UNKNOWN: f64 = 0.4;
const GRAHAM_HAM_BIAS: f64 = 2.0;

/// Renormalization threshold for the mantissa/exponent accumulators.
const MANT_MIN: f64 = 1.0e-200;

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Counts {
  pub good: u32,
  pub bad: u32,
  pub msgs_good: u32,
  pub msgs_bad: u32,
}

/// Per-token payload of the per-message hash.
#[derive(Clone, Copy, Debug, Default)]
pub struct WordProp {
  pub cnts: Counts,
  pub prob: f64,
  pub freq: u32,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Score {
  pub robn: u32,
  pub p_ln: f64,
  pub q_ln: f64,
  pub p_pr: f64,
  pub q_pr: f64,
  pub spamicity: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Verdict {
  Spam,
  Ham,
  Unsure,
}

impl Verdict {
  /// The value carried by the verdict header.
  pub fn label(self) -> &'static str {
    match self {
      Self::Spam => "Yes",
      Self::Ham => "No",
      Self::Unsure => "Unsure",
    }
  }

  pub fn exit_code(self, nonspam_exits_zero: bool) -> i32 {
    if nonspam_exits_zero {
      // procmail integration: anything that isn't an error exits 0.
      return 0;
    }
    match self {
      Self::Spam => 0,
      Self::Ham => 1,
      Self::Unsure => 2,
    }
  }
}

#[derive(Clone, Copy, Debug, PartialEq, clap::ValueEnum)]
pub enum Algorithm {
  Graham,
  Robinson,
  Fisher,
}

impl Algorithm {
  pub fn name(self) -> &'static str {
    match self {
      Self::Graham => "graham",
      Self::Robinson => "robinson",
      Self::Fisher => "fisher",
    }
  }

  pub fn parse(name: &str) -> anyhow::Result<Self> {
    match name {
      "graham" => Ok(Self::Graham),
      "robinson" => Ok(Self::Robinson),
      "fisher" => Ok(Self::Fisher),
      _ => Err(Fault::Config(format!("unknown algorithm {name}")).into()),
    }
  }

  pub fn default_spam_cutoff(self) -> f64 {
    match self {
      Self::Graham => 0.9,
      Self::Robinson => 0.582,
      Self::Fisher => 0.95,
    }
  }

  pub fn default_ham_cutoff(self) -> f64 {
    match self {
      // Zero: below the spam cutoff everything is ham, UNSURE never happens.
      Self::Graham => 0.0,
      Self::Robinson | Self::Fisher => 0.10,
    }
  }

  pub fn default_min_dev(self) -> f64 {
    match self {
      Self::Graham => 0.0,
      Self::Robinson | Self::Fisher => 0.1,
    }
  }

  /// Cap on one token's contribution per message at registration time.
  pub fn default_max_repeats(self) -> u32 {
    match self {
      Self::Graham => 4,
      Self::Robinson | Self::Fisher => 1,
    }
  }
}

/// Splits a finite nonzero double into mantissa in [0.5, 1) and power of two.
fn frexp(value: f64) -> (f64, i32) {
  if value == 0.0 || !value.is_finite() {
    return (value, 0);
  }
  let bits = value.to_bits();
  let exponent = ((bits >> 52) & 0x7ff) as i32;
  if exponent == 0 {
    // Subnormal: scale into the normal range first.
    let (mantissa, exponent) = frexp(value * 2f64.powi(64));
    return (mantissa, exponent - 64);
  }
  let mantissa = f64::from_bits((bits & 0x800f_ffff_ffff_ffff) | (1022u64 << 52));
  (mantissa, exponent - 1022)
}

/// Running product kept as mantissa and base-two exponent so thousands of
/// factors below one don't underflow to zero before the logarithm is taken.
struct Product {
  mant: f64,
  exp: i32,
}

impl Product {
  fn new() -> Self {
    Self { mant: 1.0, exp: 0 }
  }

  fn multiply(&mut self, factor: f64) {
    self.mant *= factor;
    if self.mant < MANT_MIN {
      let (mant, exp) = frexp(self.mant);
      self.mant = mant;
      self.exp += exp;
    }
  }

  fn ln(&self) -> f64 {
    self.mant.ln() + self.exp as f64 * LN_2
  }
}

pub struct Scorer {
  pub algorithm: Algorithm,
  pub min_dev: f64,
  pub robs: f64,
  pub robx: f64,
  pub spam_cutoff: f64,
  pub ham_cutoff: f64,
  pub sp_esf: f64,
  pub ns_esf: f64,
  /// Ratio of spam to ham messages seen in training; scales good counts.
  pub scalefactor: f64,
}

impl Scorer {
  /// `stored_robx` is the unscaled `.ROBX` value from the default wordlist,
  /// if present; `msgs_bad`/`msgs_good` are the trained message totals.
  pub fn new(
    config: &config::Config,
    stored_robx: Option<f64>,
    msgs_bad: u32,
    msgs_good: u32,
  ) -> anyhow::Result<Self> {
    let robx = match (config.robx, stored_robx) {
      (Some(robx), _) => robx,
      (None, Some(robx)) => robx,
      (None, None) => ROBX_DEFAULT,
    };
    if !(0.0..=1.0).contains(&robx) {
      return Err(
        Fault::Config(format!(
          "invalid robx value {robx}, must be between 0.0 and 1.0"
        ))
        .into(),
      );
    }
    let scalefactor = if msgs_good == 0 {
      1.0
    } else {
      msgs_bad as f64 / msgs_good as f64
    };
    Ok(Self {
      algorithm: config.algorithm,
      min_dev: config.min_dev,
      robs: config.robs,
      robx,
      spam_cutoff: config.spam_cutoff,
      ham_cutoff: config.ham_cutoff,
      sp_esf: config.sp_esf,
      ns_esf: config.ns_esf,
      scalefactor,
    })
  }

  /// Probability that a token with the given counts indicates spam.
  pub fn probability(&self, cnts: &Counts) -> f64 {
    match self.algorithm {
      Algorithm::Graham => {
        let hamness = cnts.good as f64 * GRAHAM_HAM_BIAS;
        let spamness = cnts.bad as f64;
        if hamness + spamness < GRAHAM_MIN_FREQ {
          return GRAHAM_UNKNOWN;
        }
        let pb = (spamness / cnts.msgs_bad.max(1) as f64).min(1.0);
        let pg = (hamness / cnts.msgs_good.max(1) as f64).min(1.0);
        (pb / (pg + pb)).clamp(0.01, 0.99)
      }
      Algorithm::Robinson | Algorithm::Fisher => {
        // f(w) = (s·x + b) / (s + b + g·scalefactor), Robinson's smoothed
        // spam fraction with good counts scaled to the training imbalance.
        let count = cnts.bad as f64 + cnts.good as f64 * self.scalefactor;
        (self.robs * self.robx + cnts.bad as f64) / (self.robs + count)
      }
    }
  }

  pub fn score(
    &self,
    words: &wordhash::WordHash<WordProp>,
    mut rstats: Option<&mut rstats::Rstats>,
  ) -> Score {
    let score = match self.algorithm {
      Algorithm::Graham => self.graham(words, rstats.as_deref_mut()),
      Algorithm::Robinson | Algorithm::Fisher => self.robinson_fisher(words, rstats.as_deref_mut()),
    };
    if let Some(rstats) = rstats {
      rstats.finish(&score);
    }
    score
  }

  fn graham(
    &self,
    words: &wordhash::WordHash<WordProp>,
    mut rstats: Option<&mut rstats::Rstats>,
  ) -> Score {
    let mut indicators: Vec<(f64, &[u8])> = Vec::with_capacity(words.len());
    for (key, prop) in words.iter() {
      let prob = self.probability(&prop.cnts);
      if let Some(rstats) = rstats.as_deref_mut() {
        rstats.add(key, &prop.cnts, prob);
      }
      indicators.push((prob, key));
    }
    // The most deviant tokens decide; equal deviations break on key order.
    indicators.sort_by(|(p1, k1), (p2, k2)| {
      let (d1, d2) = ((EVEN_ODDS - p1).abs(), (EVEN_ODDS - p2).abs());
      d2.partial_cmp(&d1).unwrap().then_with(|| k1.cmp(k2))
    });
    indicators.truncate(GRAHAM_KEEPERS);

    let (mut product, mut invproduct) = (1.0, 1.0);
    let mut robn = 0;
    for (prob, _) in &indicators {
      if *prob != 0.0 {
        product *= prob;
        invproduct *= 1.0 - prob;
        robn += 1;
      }
    }
    let spamicity = if robn == 0 {
      EVEN_ODDS
    } else {
      product / (product + invproduct)
    };
    Score {
      robn,
      spamicity,
      ..Score::default()
    }
  }

  fn robinson_fisher(
    &self,
    words: &wordhash::WordHash<WordProp>,
    mut rstats: Option<&mut rstats::Rstats>,
  ) -> Score {
    let mut p = Product::new(); // spamminess, accumulates 1 - prob
    let mut q = Product::new(); // non-spamminess, accumulates prob
    let mut robn: u32 = 0;

    for (key, prop) in words.iter() {
      let prob = self.probability(&prop.cnts);
      if let Some(rstats) = rstats.as_deref_mut() {
        rstats.add(key, &prop.cnts, prob);
      }
      if (EVEN_ODDS - prob).abs() - self.min_dev >= EPS {
        p.multiply(1.0 - prob);
        q.multiply(prob);
        robn += 1;
      }
    }

    if robn == 0 {
      return Score {
        spamicity: self.robx,
        ..Score::default()
      };
    }

    match self.algorithm {
      Algorithm::Fisher => {
        let sp_df = 2.0 * robn as f64 * self.sp_esf;
        let ns_df = 2.0 * robn as f64 * self.ns_esf;
        let p_ln = p.ln() * self.sp_esf;
        let q_ln = q.ln() * self.ns_esf;
        let p_pr = chisq_q(-2.0 * p_ln, sp_df);
        let q_pr = chisq_q(-2.0 * q_ln, ns_df);
        let spamicity = if self.sp_esf >= 1.0 && self.ns_esf >= 1.0 {
          (1.0 + q_pr - p_pr) / 2.0
        } else if p_pr < f64::EPSILON && q_pr < f64::EPSILON {
          EVEN_ODDS
        } else {
          q_pr / (q_pr + p_pr)
        };
        Score {
          robn,
          p_ln,
          q_ln,
          p_pr,
          q_pr,
          spamicity,
        }
      }
      Algorithm::Robinson => {
        let n = robn as f64;
        let invproduct = 1.0 - (p.ln() / n).exp();
        let product = 1.0 - (q.ln() / n).exp();
        let spamicity = (1.0 + (invproduct - product) / (invproduct + product)) / 2.0;
        Score {
          robn,
          p_ln: p.ln(),
          q_ln: q.ln(),
          p_pr: invproduct,
          q_pr: product,
          spamicity,
        }
      }
      Algorithm::Graham => unreachable!(),
    }
  }

  pub fn status(&self, score: &Score) -> Verdict {
    if score.spamicity >= self.spam_cutoff {
      return Verdict::Spam;
    }
    if self.ham_cutoff < EPS || score.spamicity <= self.ham_cutoff {
      return Verdict::Ham;
    }
    Verdict::Unsure
  }
}
