// Per-token contribution reporting: the histogram shown at higher verbosity
// and the R-table emitted for offline analysis of a classification.

use crate::{
  score::{Counts, Score, Scorer, EPS},
  word::{Word, MAX_TOKEN_LEN},
};
use std::io;

const INTERVALS: usize = 10;
const EVEN_ODDS: f64 = 0.5;

#[derive(Debug)]
struct Entry {
  token: Word,
  good: f64,
  bad: f64,
  prob: f64,
}

#[derive(Debug, Default)]
pub struct Rstats {
  entries: Vec<Entry>,
  score: Score,
}

impl Rstats {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, token: &[u8], cnts: &Counts, prob: f64) {
    self.entries.push(Entry {
      token: Word::new(token),
      good: cnts.good as f64,
      bad: cnts.bad as f64,
      prob,
    });
  }

  pub fn finish(&mut self, score: &Score) {
    self.score = *score;
  }

  fn sorted(&self) -> Vec<&Entry> {
    let mut entries: Vec<&Entry> = self.entries.iter().collect();
    entries.sort_by(|e1, e2| {
      e1.prob
        .partial_cmp(&e2.prob)
        .unwrap()
        .then_with(|| e1.token.bytes().cmp(e2.token.bytes()))
    });
    entries
  }

  pub fn print_histogram<W: io::Write>(&self, writer: &mut W, min_dev: f64) -> io::Result<()> {
    let entries = self.sorted();
    let robn = entries.len().max(1) as f64;

    struct Interval {
      count: usize,
      prob: f64,
      spamicity: f64,
    }

    let mut intervals = Vec::with_capacity(INTERVALS);
    let (mut invlogsum, mut logsum) = (0.0f64, 0.0f64);
    let mut rest = entries.as_slice();
    let mut maxcnt = 0;
    for i in 0..INTERVALS {
      let fin = (i + 1) as f64 / INTERVALS as f64;
      let mut interval = Interval {
        count: 0,
        prob: 0.0,
        spamicity: 0.0,
      };
      while let Some((entry, tail)) = rest.split_first() {
        if entry.prob >= fin {
          break;
        }
        rest = tail;
        interval.count += 1;
        interval.prob += entry.prob;
        if (EVEN_ODDS - entry.prob).abs() >= min_dev {
          invlogsum += (1.0 - entry.prob).ln();
          logsum += entry.prob.ln();
        }
        let invproduct = 1.0 - (invlogsum / robn).exp();
        let product = 1.0 - (logsum / robn).exp();
        interval.spamicity = if invproduct + product < EPS {
          0.0
        } else {
          (1.0 + (invproduct - product) / (invproduct + product)) / 2.0
        };
      }
      maxcnt = maxcnt.max(interval.count);
      intervals.push(interval);
    }

    writeln!(writer, "{:>5} {:>4} {:>8} {:>10}  histogram", "int", "cnt", "prob", "spamicity")?;
    for (i, interval) in intervals.iter().enumerate() {
      let beg = i as f64 / INTERVALS as f64;
      let prob = if interval.count > 0 {
        interval.prob / interval.count as f64
      } else {
        0.0
      };
      write!(
        writer,
        "{beg:5.2} {:4} {prob:8.6} {:10.6}  ",
        interval.count, interval.spamicity
      )?;
      // Scale to 50 columns.
      let mut count = interval.count;
      if maxcnt > 50 {
        count = (count * 50 + maxcnt - 1) / maxcnt;
      }
      for _ in 0..count {
        write!(writer, "#")?;
      }
      writeln!(writer)?;
    }
    Ok(())
  }

  pub fn print_rtable<W: io::Write>(&self, writer: &mut W, scorer: &Scorer) -> io::Result<()> {
    writeln!(
      writer,
      "     {:<20}{:>10}{:>10}{:>10}{:>10}{:>10}",
      "Token", "pgood", "pbad", "fw", "invfwlog", "fwlog"
    )?;
    for (index, entry) in self.sorted().iter().enumerate() {
      let flag = if (entry.prob - EVEN_ODDS).abs() < scorer.min_dev {
        '-'
      } else {
        '+'
      };
      writeln!(
        writer,
        "{:3}  {:<20}  {:8.2}  {:8.0}  {:8.6}  {:8.5}  {:8.5} {}",
        index + 1,
        entry.token,
        entry.good,
        entry.bad,
        entry.prob,
        (1.0 - entry.prob).ln(),
        entry.prob.ln(),
        flag
      )?;
    }
    self.print_summary(writer, scorer)
  }

  pub fn print_summary<W: io::Write>(&self, writer: &mut W, scorer: &Scorer) -> io::Result<()> {
    let score = &self.score;
    writeln!(
      writer,
      "{:<width$} {:6} {:9.6} {:9.6} {:9.6}",
      "N_P_Q_S_s_x_md",
      score.robn,
      score.p_pr,
      score.q_pr,
      score.spamicity,
      width = MAX_TOKEN_LEN + 2
    )?;
    writeln!(
      writer,
      "{:<width$}  {:9.6} {:9.6} {:9.6}",
      " ",
      scorer.robs,
      scorer.robx,
      scorer.min_dev,
      width = MAX_TOKEN_LEN + 2 + 6
    )
  }
}
