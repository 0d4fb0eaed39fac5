// Post-lexer token processing: header-field tagging, MIME-type filtering,
// IP collapsing for block_on_subnets, the length cap, and the casefold pass.
// The output of `collect` is the per-message hash the scorer and the
// registration path both consume.

use crate::{
  config::Config,
  lexer::{self, mime, Class, Lexer},
  score::WordProp,
  word::{Word, MAX_TOKEN_LEN},
  wordhash::WordHash,
};

const URL_PREFIX: &[u8] = b"url:";

#[derive(Debug, PartialEq)]
pub enum Processed {
  Word(Word),
  /// A `.MSG_COUNT` line: trained (good, spam) message totals.
  MsgCounts(u32, u32),
  /// A pre-counted token line: (token, good, spam).
  Counted(Word, u32, u32),
}

pub struct Tokens<'a> {
  lexer: Lexer<'a>,
  casefold: [u8; 256],
  tag_header_lines: bool,
  block_on_subnets: bool,
  /// The last emitted `url:` token, still owing its shorter prefixes.
  ip_save: Option<Vec<u8>>,
}

impl<'a> Tokens<'a> {
  pub fn new(config: &'a Config, input: &'a [u8]) -> Self {
    Self {
      lexer: Lexer::new(config, input),
      casefold: lexer::casefold_table(config.replace_nonascii_characters),
      tag_header_lines: config.tag_header_lines,
      block_on_subnets: config.block_on_subnets,
      ip_save: None,
    }
  }

  /// Emits `url:a.b.c`, `url:a.b` after `url:a.b.c.d`, never a bare octet.
  fn next_ip_prefix(&mut self) -> Option<Word> {
    let saved = self.ip_save.take()?;
    let dot = memchr::memrchr(b'.', &saved)?;
    let truncated = saved[..dot].to_vec();
    if memchr::memrchr(b'.', &truncated[URL_PREFIX.len()..]).is_none() {
      return None;
    }
    self.ip_save = Some(truncated.clone());
    Some(Word::from_vec(truncated))
  }

  /// Masks each quad to its low octet, undoing the accumulate-and-shift
  /// obfuscation HTML clients tolerate, and prefixes the result with `url:`.
  fn collapse_ip(&mut self, word: &Word) -> Word {
    let mut masked = URL_PREFIX.to_vec();
    for (i, quad) in word.bytes().split(|byte| *byte == b'.').enumerate() {
      if i > 0 {
        masked.push(b'.');
      }
      let value = std::str::from_utf8(quad)
        .ok()
        .and_then(|quad| quad.parse::<u64>().ok())
        .unwrap_or(0);
      masked.extend_from_slice((value & 0xff).to_string().as_bytes());
    }
    self.ip_save = Some(masked.clone());
    Word::from_vec(masked)
  }

  fn finish(&self, word: Word) -> Word {
    let mut bytes = word.bytes().to_vec();
    while bytes.last() == Some(&b' ') {
      bytes.pop();
    }
    if bytes.len() > 1 && bytes.last() == Some(&b':') {
      bytes.pop();
    }
    for byte in &mut bytes {
      *byte = self.casefold[*byte as usize];
    }
    Word::from_vec(bytes)
  }

  pub fn next(&mut self) -> Option<Processed> {
    if let Some(prefix) = self.next_ip_prefix() {
      return Some(Processed::Word(prefix));
    }
    loop {
      let (class, word) = self.lexer.next_token();
      let word = match class {
        Class::None => return None,
        Class::Empty => {
          if word.is_empty() {
            continue;
          }
          word // spc:invalid_end_of_header
        }
        Class::Boundary if self.lexer.consume_boundary(&word) => continue,
        Class::Token | Class::Boundary => {
          if self.lexer.in_header() {
            match (self.tag_header_lines, self.lexer.tag()) {
              (true, Some(tag)) => word.prefixed(tag),
              _ => word,
            }
          } else {
            match self.lexer.mime_type() {
              mime::MimeType::Top
              | mime::MimeType::TextPlain
              | mime::MimeType::TextHtml
              | mime::MimeType::Multipart
              | mime::MimeType::Message => word,
              mime::MimeType::Other => continue,
            }
          }
        }
        Class::IpAddr => {
          if self.block_on_subnets {
            let masked = self.collapse_ip(&word);
            return Some(Processed::Word(self.finish(masked)));
          }
          word
        }
        Class::MsgCountLine => {
          let (_, good, spam) = parse_counted_line(&word)?;
          return Some(Processed::MsgCounts(good, spam));
        }
        Class::BogoLexLine => {
          let (token, good, spam) = parse_counted_line(&word)?;
          return Some(Processed::Counted(self.finish(token), good, spam));
        }
      };
      if word.len() > MAX_TOKEN_LEN {
        continue; // eat all long words
      }
      return Some(Processed::Word(self.finish(word)));
    }
  }
}

/// Splits `"token" good spam`; the lexer guarantees the shape.
fn parse_counted_line(word: &Word) -> Option<(Word, u32, u32)> {
  let line = word.bytes();
  let quote = memchr::memrchr(b'"', &line[1..])? + 1;
  let token = Word::new(&line[1..quote]);
  let mut fields = line[quote + 1..]
    .split(|byte| *byte == b' ')
    .filter(|field| !field.is_empty())
    .map(|field| std::str::from_utf8(field).ok()?.parse::<u32>().ok());
  let good = fields.next()??;
  let spam = fields.next()??;
  Some((token, good, spam))
}

#[derive(Debug)]
pub struct Collected {
  pub words: WordHash<WordProp>,
  /// Every emission, repeats included.
  pub token_count: usize,
  /// Message totals when the input was a token-count stream.
  pub msg_counts: Option<(u32, u32)>,
}

/// Runs the lexer and post-processor over one message and builds its hash.
pub fn collect(config: &Config, message: &[u8]) -> Collected {
  let mut tokens = Tokens::new(config, message);
  let mut words = WordHash::new();
  let mut token_count = 0;
  let mut msg_counts = None;
  while let Some(processed) = tokens.next() {
    match processed {
      Processed::Word(word) => {
        let prop = words.insert(word.bytes(), WordProp::default());
        prop.freq += 1;
        token_count += 1;
      }
      Processed::MsgCounts(good, spam) => msg_counts = Some((good, spam)),
      Processed::Counted(word, good, spam) => {
        let prop = words.insert(word.bytes(), WordProp::default());
        prop.freq += 1;
        prop.cnts.good = good;
        prop.cnts.bad = spam;
        token_count += 1;
      }
    }
  }
  Collected {
    words,
    token_count,
    msg_counts,
  }
}

/// Folds one message's hash into the accumulated bulk-registration hash:
/// counts add up, `freq` counts contributing messages.
pub fn merge(accumulated: &mut WordHash<WordProp>, message: &WordHash<WordProp>) {
  for (key, prop) in message.iter() {
    let merged = accumulated.insert(key, WordProp::default());
    merged.cnts.good += prop.cnts.good;
    merged.cnts.bad += prop.cnts.bad;
    merged.freq += 1;
  }
}
