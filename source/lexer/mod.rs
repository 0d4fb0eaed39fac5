// The mail tokenizer: splits a message into typed tokens, tracking the
// header/body switch, the MIME part stack, transfer encodings, charsets, and
// HTML comments. Byte-identical input and configuration produce a
// byte-identical token stream; nothing in here can fail.

use crate::{config::Config, word::Word};
use base64::Engine as _;
use std::collections;

pub mod mime;

/// Tokens shorter than this are noise and never emitted.
pub const MIN_TOKEN_LEN: usize = 3;

/// Tolerates both padded and unpadded base64, which mailers mix freely.
const BASE64: base64::engine::GeneralPurpose = base64::engine::GeneralPurpose::new(
  &base64::alphabet::STANDARD,
  base64::engine::GeneralPurposeConfig::new()
    .with_decode_padding_mode(base64::engine::DecodePaddingMode::Indifferent),
);

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Class {
  Token,
  IpAddr,
  Empty,
  Boundary,
  None,
  MsgCountLine,
  BogoLexLine,
}

/// Builds the per-byte fold table applied to every token before emission:
/// lowercase folding, plus `?` for non-ASCII bytes when configured.
pub fn casefold_table(replace_nonascii: bool) -> [u8; 256] {
  let mut table = [0u8; 256];
  for (byte, slot) in table.iter_mut().enumerate() {
    let byte = byte as u8;
    *slot = if byte.is_ascii_uppercase() {
      byte.to_ascii_lowercase()
    } else if byte >= 0x80 && replace_nonascii {
      b'?'
    } else {
      byte
    };
  }
  table
}

/// `us-ascii` (the historical default) means raw bytes, no transcoding.
fn default_charset(label: &str) -> Option<&'static encoding_rs::Encoding> {
  match label {
    "" | "ascii" | "us-ascii" => None,
    label => encoding_rs::Encoding::for_label(label.as_bytes()),
  }
}

fn is_token_start(byte: u8) -> bool {
  byte.is_ascii_alphabetic() || byte >= 0x80
}

fn is_token_char(byte: u8) -> bool {
  byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'\'' | b'$') || byte >= 0x80
}

type Tag = Option<&'static [u8]>;

pub struct Lexer<'a> {
  config: &'a Config,
  input: &'a [u8],
  position: usize,
  header: bool,
  /// Tag of the header field being scanned; sticks across continuation lines.
  field_tag: Tag,
  /// Tag the most recently returned token was scanned under.
  current_tag: Tag,
  mime: mime::Stack,
  pending: collections::VecDeque<(Class, Word, Tag)>,
  /// Cleaned base64 characters carried across lines of an encoded part.
  base64: Vec<u8>,
  /// Decoded base64 text waiting for a complete line.
  base64_text: Vec<u8>,
  in_html_comment: bool,
  html_comments_seen: u32,
  finished: bool,
}

impl<'a> Lexer<'a> {
  pub fn new(config: &'a Config, input: &'a [u8]) -> Self {
    Self {
      config,
      input,
      position: 0,
      header: true,
      field_tag: None,
      current_tag: None,
      mime: mime::Stack::new(),
      pending: collections::VecDeque::new(),
      base64: Vec::new(),
      base64_text: Vec::new(),
      in_html_comment: false,
      html_comments_seen: 0,
      finished: false,
    }
  }

  pub fn in_header(&self) -> bool {
    self.header
  }

  /// The `to:`/`from:`/`rtrn:`/`subj:` prefix the last token was scanned
  /// under; the field name itself carries none.
  pub fn tag(&self) -> Tag {
    self.current_tag
  }

  pub fn mime_type(&self) -> mime::MimeType {
    self.mime.current().mime_type
  }

  /// Consumes a BOUNDARY token that matches the active stack; returns false
  /// when the line belongs to no open part and should score as text.
  pub fn consume_boundary(&mut self, word: &Word) -> bool {
    match self.mime.on_boundary(word.bytes()) {
      mime::BoundaryAction::NotOurs => false,
      mime::BoundaryAction::Opened => {
        self.header = true;
        self.field_tag = None;
        self.in_html_comment = false;
        true
      }
      mime::BoundaryAction::Closed => {
        self.in_html_comment = false;
        true
      }
    }
  }

  pub fn next_token(&mut self) -> (Class, Word) {
    loop {
      if let Some((class, word, tag)) = self.pending.pop_front() {
        self.current_tag = tag;
        return (class, word);
      }
      if self.position >= self.input.len() {
        if !self.finished {
          self.finished = true;
          self.flush_base64(true);
          continue;
        }
        return (Class::None, Word::new(b""));
      }
      self.line();
    }
  }

  fn line(&mut self) {
    let rest = &self.input[self.position..];
    let end = memchr::memchr(b'\n', rest).unwrap_or(rest.len());
    let mut line = &rest[..end];
    self.position += end + 1;
    if let Some(stripped) = line.strip_suffix(b"\r") {
      line = stripped;
    }

    // Token-stream input (wordlist dumps fed back for scoring).
    if line.first() == Some(&b'"') {
      if let Some(class) = counted_line_class(line) {
        self.pending.push_back((class, Word::new(line), None));
        return;
      }
    }

    if self.header {
      self.header_line(line);
    } else {
      self.body_line(line);
    }
  }

  fn header_line(&mut self, line: &[u8]) {
    if line.is_empty() || line.iter().all(|byte| byte.is_ascii_whitespace()) {
      // End of headers. An embedded message/* opens its own header block.
      let word = if line.is_empty() {
        Word::new(b"")
      } else {
        Word::from("spc:invalid_end_of_header")
      };
      if self.mime_type() == mime::MimeType::Message {
        self.mime.add_child();
        self.header = true;
      } else {
        self.header = false;
      }
      self.field_tag = None;
      self.pending.push_back((Class::Empty, word, None));
      return;
    }

    if matches!(line.first(), Some(b' ') | Some(b'\t')) {
      // Continuation lines keep the previous field's tag.
      let line = line.to_vec();
      self.scan_tokens(&line, self.field_tag);
      return;
    }

    self.field_tag = None;
    match memchr::memchr(b':', line) {
      Some(colon) => {
        let name: Vec<u8> = line[..colon].to_ascii_lowercase();
        let value = line[colon + 1..].to_vec();
        match name.as_slice() {
          b"content-type" => self.mime.content_type(&value),
          b"content-transfer-encoding" => self.mime.transfer_encoding(&value),
          b"to" | b"cc" => self.field_tag = Some(b"to:"),
          b"from" => self.field_tag = Some(b"from:"),
          b"return-path" => self.field_tag = Some(b"rtrn:"),
          b"subject" => self.field_tag = Some(b"subj:"),
          _ => (),
        }
        // The field name scores untagged, its value under the tag.
        let name = line[..colon].to_vec();
        self.scan_tokens(&name, None);
        self.scan_tokens(&value, self.field_tag);
      }
      None => {
        let line = line.to_vec();
        self.scan_tokens(&line, None);
      }
    }
  }

  fn body_line(&mut self, line: &[u8]) {
    if line.starts_with(b"--") {
      // Candidate MIME boundary; flush any in-flight base64 first so the
      // terminated part's tail tokens come out ahead of the boundary.
      self.flush_base64(true);
      self.pending.push_back((Class::Boundary, Word::new(line), None));
      return;
    }
    match self.mime.current().encoding {
      mime::Encoding::Base64 => {
        self.base64.extend(
          line
            .iter()
            .filter(|byte| byte.is_ascii_alphanumeric() || matches!(byte, b'+' | b'/' | b'=')),
        );
        self.flush_base64(false);
      }
      mime::Encoding::QuotedPrintable => {
        let decoded = decode_quoted_printable(line);
        self.text(&decoded);
      }
      mime::Encoding::SevenBit => {
        let line = line.to_vec();
        self.text(&line);
      }
    }
  }

  /// Decodes what the base64 buffer holds and tokenizes every complete
  /// decoded line; `all` forces the tail out at part or message end.
  /// Undecodable chunks are dropped, never an error.
  fn flush_base64(&mut self, all: bool) {
    let take = if all || self.base64.contains(&b'=') {
      std::mem::take(&mut self.base64)
    } else {
      let whole = self.base64.len() / 4 * 4;
      let tail = self.base64.split_off(whole);
      std::mem::replace(&mut self.base64, tail)
    };
    if !take.is_empty() {
      match BASE64.decode(&take) {
        Ok(decoded) => self.base64_text.extend(decoded),
        Err(error) => log::debug!("undecodable base64 chunk: {error}"),
      }
    }
    // Tokenize only whole lines so tokens spanning encoded chunks survive.
    while let Some(newline) = memchr::memchr(b'\n', &self.base64_text) {
      let mut line: Vec<u8> = self.base64_text.drain(..=newline).collect();
      line.pop();
      self.text(&line);
    }
    if all && !self.base64_text.is_empty() {
      let line = std::mem::take(&mut self.base64_text);
      self.text(&line);
    }
  }

  /// Charset transcoding, HTML comment policy, then token scanning.
  fn text(&mut self, bytes: &[u8]) {
    let charset = self
      .mime
      .current()
      .charset
      .or_else(|| default_charset(&self.config.charset_default));
    let decoded: Vec<u8> = match charset {
      Some(charset) => {
        let (text, _, had_errors) = charset.decode(bytes);
        if had_errors {
          // The replacement character scores as '?'.
          text.replace('\u{FFFD}', "?").into_bytes()
        } else {
          text.into_owned().into_bytes()
        }
      }
      None => bytes.to_vec(),
    };
    if self.mime_type() == mime::MimeType::TextHtml {
      self.scan_html(&decoded);
    } else {
      self.scan_tokens(&decoded, None);
    }
  }

  /// HTML bodies: text outside comments always scans; comment contents scan
  /// only when they're configured to score, and each comment emits one `!--`
  /// marker token up to the configured count.
  fn scan_html(&mut self, bytes: &[u8]) {
    let keep_contents = self.config.score_html_comments || !self.config.kill_html_comments;
    let mut rest = bytes;
    loop {
      if self.in_html_comment {
        match memchr::memmem::find(rest, b"-->") {
          Some(end) => {
            if keep_contents {
              self.scan_tokens(&rest[..end], None);
            }
            rest = &rest[end + 3..];
            self.in_html_comment = false;
          }
          None => {
            if keep_contents {
              self.scan_tokens(rest, None);
            }
            return;
          }
        }
      } else {
        match memchr::memmem::find(rest, b"<!--") {
          Some(start) => {
            self.scan_tokens(&rest[..start], None);
            rest = &rest[start + 4..];
            self.in_html_comment = true;
            self.html_comments_seen += 1;
            if self.html_comments_seen <= self.config.count_html_comments {
              self
                .pending
                .push_back((Class::Token, Word::from("!--"), None));
            }
          }
          None => {
            self.scan_tokens(rest, None);
            return;
          }
        }
      }
    }
  }

  fn scan_tokens(&mut self, bytes: &[u8], tag: Tag) {
    let mut i = 0;
    while i < bytes.len() {
      let byte = bytes[i];
      if byte.is_ascii_digit() {
        // A run of digits and dots is either a dotted quad or noise.
        let mut j = i;
        while j < bytes.len() && (bytes[j].is_ascii_digit() || bytes[j] == b'.') {
          j += 1;
        }
        let run = &bytes[i..j];
        if is_dotted_quad(run) && bytes.get(j).map_or(true, |byte| !is_token_char(*byte)) {
          self.pending.push_back((Class::IpAddr, Word::new(run), tag));
        }
        i = j;
      } else if is_token_start(byte) {
        let mut j = i;
        while j < bytes.len() && is_token_char(bytes[j]) {
          j += 1;
        }
        let mut token = &bytes[i..j];
        while let Some((byte, rest)) = token.split_last() {
          if matches!(byte, b'.' | b'\'' | b'-') {
            token = rest;
          } else {
            break;
          }
        }
        if token.len() >= MIN_TOKEN_LEN {
          self.pending.push_back((Class::Token, Word::new(token), tag));
        }
        i = j;
      } else {
        i += 1;
      }
    }
  }
}

fn decode_quoted_printable(line: &[u8]) -> Vec<u8> {
  let mut decoded = Vec::with_capacity(line.len());
  let mut i = 0;
  while i < line.len() {
    match line[i] {
      b'=' if i + 2 < line.len() => {
        let hex = &line[i + 1..i + 3];
        match u8::from_str_radix(std::str::from_utf8(hex).unwrap_or(""), 16) {
          Ok(byte) => {
            decoded.push(byte);
            i += 3;
          }
          Err(_) => {
            decoded.push(b'=');
            i += 1;
          }
        }
      }
      // A lone '=' at end of line is a soft break.
      b'=' if i + 1 >= line.len() => break,
      byte => {
        decoded.push(byte);
        i += 1;
      }
    }
  }
  decoded
}

/// Four nonempty decimal runs separated by exactly three dots.
fn is_dotted_quad(run: &[u8]) -> bool {
  let mut quads = 0;
  for quad in run.split(|byte| *byte == b'.') {
    if quad.is_empty() || !quad.iter().all(|byte| byte.is_ascii_digit()) {
      return false;
    }
    quads += 1;
  }
  quads == 4
}

/// `".MSG_COUNT" n n` and `"token" n n` lines from wordlist dumps.
fn counted_line_class(line: &[u8]) -> Option<Class> {
  let rest = &line[1..];
  let quote = memchr::memchr(b'"', rest)?;
  let token = &rest[..quote];
  let mut fields = rest[quote + 1..]
    .split(|byte| *byte == b' ')
    .filter(|field| !field.is_empty());
  for _ in 0..2 {
    let field = fields.next()?;
    if !field.iter().all(|byte| byte.is_ascii_digit()) {
      return None;
    }
  }
  if fields.next().is_some() {
    return None;
  }
  if token == b".MSG_COUNT" {
    Some(Class::MsgCountLine)
  } else {
    Some(Class::BogoLexLine)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::config::Config;

  fn tokens(input: &[u8]) -> Vec<(Class, Word)> {
    let config = Config::default();
    tokens_with(&config, input)
  }

  fn tokens_with(config: &Config, input: &[u8]) -> Vec<(Class, Word)> {
    let mut lexer = Lexer::new(config, input);
    let mut tokens = Vec::new();
    loop {
      let (class, word) = lexer.next_token();
      if class == Class::None {
        break;
      }
      if class == Class::Boundary && lexer.consume_boundary(&word) {
        continue;
      }
      tokens.push((class, word));
    }
    tokens
  }

  fn words(tokens: &[(Class, Word)]) -> Vec<String> {
    tokens.iter().map(|(_, word)| word.to_string()).collect()
  }

  #[test]
  fn header_and_body() {
    let collected = tokens(b"Subject: hello world\n\nbody text\n");
    assert_eq!(
      vec!["Subject", "hello", "world", "", "body", "text"],
      words(&collected)
    );
    assert_eq!(Class::Empty, collected[3].0);
  }

  #[test]
  fn short_tokens_are_dropped() {
    let collected = tokens(b"\nan ox and you too\n");
    assert_eq!(vec!["", "and", "you", "too"], words(&collected));
  }

  #[test]
  fn dotted_quad() {
    let collected = tokens(b"\nsee 127.0.0.1 now\n");
    let expected = [
      (Class::Token, Word::from("see")),
      (Class::IpAddr, Word::from("127.0.0.1")),
      (Class::Token, Word::from("now")),
    ];
    assert_eq!(expected.as_slice(), &collected[1..]);
  }

  #[test]
  fn version_numbers_are_not_addresses() {
    let collected = tokens(b"\n1.2.3.4.5 or 1.2.3\n");
    assert_eq!(vec!["", "or"], words(&collected));
  }

  #[test]
  fn whitespace_only_header_end() {
    let collected = tokens(b"Subject: x\n  \nbody\n");
    assert!(collected
      .iter()
      .any(|(class, word)| *class == Class::Empty
        && word.bytes() == b"spc:invalid_end_of_header"));
  }

  #[test]
  fn mime_other_parts_still_lex() {
    // The lexer emits body tokens of non-text parts; the post-processor
    // filters on the MIME type.
    let input: &[u8] = b"Content-Type: multipart/mixed; boundary=sep\n\
      \n\
      --sep\n\
      Content-Type: text/plain\n\
      \n\
      visible words\n\
      --sep\n\
      Content-Type: application/octet-stream\n\
      \n\
      hidden words\n\
      --sep--\n";
    let config = Config::default();
    let mut lexer = Lexer::new(&config, input);
    let mut kept = Vec::new();
    loop {
      let (class, word) = lexer.next_token();
      match class {
        Class::None => break,
        Class::Boundary if lexer.consume_boundary(&word) => continue,
        Class::Token if !lexer.in_header() && lexer.mime_type() == mime::MimeType::Other => {
          continue
        }
        Class::Token => kept.push(word.to_string()),
        _ => continue,
      }
    }
    assert!(kept.contains(&"visible".to_string()));
    assert!(!kept.contains(&"hidden".to_string()));
  }

  #[test]
  fn base64_body_is_decoded() {
    // "buy viagra now" base64-encoded, split mid-word across two lines.
    let input = b"Content-Transfer-Encoding: base64\n\nYnV5IHZpYWdy\nYSBub3c=\n";
    let collected = tokens(input);
    assert_eq!(vec!["", "buy", "viagra", "now"], words(&collected));
  }

  #[test]
  fn quoted_printable_body_is_decoded() {
    let input = b"Content-Transfer-Encoding: quoted-printable\n\nfr=65e money\n";
    let collected = tokens(input);
    assert_eq!(vec!["", "free", "money"], words(&collected));
  }

  #[test]
  fn quoted_printable_soft_break() {
    assert_eq!(b"trailing".to_vec(), decode_quoted_printable(b"trailing="));
    assert_eq!(b"=zz".to_vec(), decode_quoted_printable(b"=zz"));
  }

  #[test]
  fn html_comments_killed_by_default() {
    let input = b"Content-Type: text/html\n\nbuy <!-- hidden -->viagra\n";
    let collected = tokens(input);
    assert_eq!(vec!["", "buy", "!--", "viagra"], words(&collected));
  }

  #[test]
  fn html_comments_scored_when_configured() {
    let mut config = Config::default();
    config.kill_html_comments = false;
    config.score_html_comments = true;
    config.count_html_comments = 0;
    let input = b"Content-Type: text/html\n\nbuy <!-- hidden -->viagra\n";
    let collected = tokens_with(&config, input);
    assert_eq!(vec!["", "buy", "hidden", "viagra"], words(&collected));
  }

  #[test]
  fn html_comment_spanning_lines() {
    let input = b"Content-Type: text/html\n\nbuy <!-- hid\nden --> viagra\n";
    let collected = tokens(input);
    assert_eq!(vec!["", "buy", "!--", "viagra"], words(&collected));
  }

  #[test]
  fn html_comment_count_is_bounded() {
    let mut config = Config::default();
    config.count_html_comments = 2;
    let input = b"Content-Type: text/html\n\n<!--a--> <!--b--> <!--c--> end\n";
    let collected = tokens_with(&config, input);
    assert_eq!(vec!["", "!--", "!--", "end"], words(&collected));
  }

  #[test]
  fn message_rfc822_opens_child_headers() {
    let input: &[u8] = b"Content-Type: message/rfc822\n\
      \n\
      Subject: inner subject\n\
      \n\
      inner body\n";
    let collected = tokens(input);
    assert_eq!(
      vec![
        "Content-Type",
        "message",
        "rfc822",
        "",
        "Subject",
        "inner",
        "subject",
        "",
        "inner",
        "body"
      ],
      words(&collected)
    );
  }

  #[test]
  fn latin1_charset_is_transcoded() {
    let input: &[u8] = b"Content-Type: text/plain; charset=iso-8859-1\n\n caf\xe9 deal\n";
    let collected = tokens(input);
    // 0xe9 becomes UTF-8 C3 A9, which still lexes as token bytes.
    let body = words(&collected);
    assert!(body.contains(&"caf\u{e9}".to_string()), "{body:?}");
    assert!(body.contains(&"deal".to_string()), "{body:?}");
  }

  #[test]
  fn header_tags() {
    let config = Config::default();
    let input = b"From: alice@example.com\nSubject: hello\n\n";
    let mut lexer = Lexer::new(&config, input);
    let mut tagged = Vec::new();
    loop {
      let (class, word) = lexer.next_token();
      if class == Class::None {
        break;
      }
      tagged.push((
        word.to_string(),
        lexer.tag().map(|tag| String::from_utf8_lossy(tag).to_string()),
      ));
    }
    assert!(tagged.contains(&("From".to_string(), None)), "{tagged:?}");
    assert!(
      tagged.contains(&("alice".to_string(), Some("from:".to_string()))),
      "{tagged:?}"
    );
    assert!(
      tagged.contains(&("hello".to_string(), Some("subj:".to_string()))),
      "{tagged:?}"
    );
  }

  #[test]
  fn counted_lines() {
    let collected = tokens(b"\".MSG_COUNT\" 10 20\n\"deal\" 1 2\n");
    assert_eq!(
      vec![
        (Class::MsgCountLine, Word::from("\".MSG_COUNT\" 10 20")),
        (Class::BogoLexLine, Word::from("\"deal\" 1 2")),
      ],
      collected
    );
  }

  #[test]
  fn determinism() {
    let input = b"Subject: hello\n\nsome body 1.2.3.4 text\n";
    assert_eq!(tokens(input), tokens(input));
  }
}
