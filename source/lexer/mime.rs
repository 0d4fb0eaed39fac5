// MIME structure tracking: one Part per nesting level, transitioned by
// Content-Type / Content-Transfer-Encoding headers and boundary lines.
// https://www.rfc-editor.org/rfc/rfc2045 - MIME part one: message bodies
// https://www.rfc-editor.org/rfc/rfc2046 - MIME part two: media types

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MimeType {
  /// Message headers not yet read; body tokens are kept.
  Top,
  TextPlain,
  TextHtml,
  Multipart,
  Message,
  /// Anything else (images, applications); body tokens are dropped.
  Other,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Encoding {
  SevenBit,
  QuotedPrintable,
  Base64,
}

#[derive(Debug)]
pub struct Part {
  pub mime_type: MimeType,
  pub encoding: Encoding,
  pub boundary: Option<Vec<u8>>,
  pub charset: Option<&'static encoding_rs::Encoding>,
}

impl Part {
  fn new(mime_type: MimeType) -> Self {
    Self {
      mime_type,
      encoding: Encoding::SevenBit,
      boundary: None,
      charset: None,
    }
  }
}

#[derive(Debug)]
pub struct ContentType {
  kind: Vec<u8>,
  subtype: Vec<u8>,
  parameters: Vec<(Vec<u8>, Vec<u8>)>,
}

fn lowercased(bytes: &[u8]) -> Vec<u8> {
  bytes.iter().map(|byte| byte.to_ascii_lowercase()).collect()
}

peg::parser! {
  // https://www.rfc-editor.org/rfc/rfc2045#section-5.1
  grammar headers() for [u8] {
    rule ws() = quiet!{[b' ' | b'\t' | b'\r' | b'\n']*}
    // token := 1*<any (US-ASCII) CHAR except SPACE, CTLs, or tspecials>
    rule tchar() = [^ b'\x00'..=b' ' | b'(' | b')' | b'<' | b'>' | b'@' | b',' | b';' | b':'
                     | b'\\' | b'"' | b'/' | b'[' | b']' | b'?' | b'=' | b'\x7f'..=b'\xff']
    rule token() -> &'input [u8] = $(tchar()+)
    // quoted-string, with backslash escapes.
    rule quoted_string() -> Vec<u8>
      = "\"" q:(("\\" c:[_] { c }) / c:[^ b'"'] { c })* "\""
      { q }
    rule value() -> Vec<u8>
      = q:quoted_string() { q } / t:token() { t.to_vec() }
    rule parameter() -> (Vec<u8>, Vec<u8>)
      = ws() ";" ws() k:token() ws() "=" ws() v:value()
      { (lowercased(k), v) }

    // content := "Content-Type" ":" type "/" subtype *(";" parameter)
    pub rule content_type() -> ContentType
      = ws() t:token() "/" s:token() ps:parameter()* ws() ";"? ws()
      { ContentType { kind: lowercased(t), subtype: lowercased(s), parameters: ps } }

    // encoding := "Content-Transfer-Encoding" ":" mechanism
    pub rule transfer_encoding() -> Vec<u8>
      = ws() t:token() ws()
      { lowercased(t) }
  }
}

/// What a boundary line did to the part stack.
#[derive(Debug, PartialEq)]
pub enum BoundaryAction {
  /// Not one of ours; hand the line back as an ordinary token.
  NotOurs,
  /// A new sibling part opened; its headers follow.
  Opened,
  /// A multipart closed; back in the enclosing part's body.
  Closed,
}

#[derive(Debug)]
pub struct Stack {
  parts: Vec<Part>,
}

impl Stack {
  pub fn new() -> Self {
    Self {
      parts: vec![Part::new(MimeType::Top)],
    }
  }

  pub fn current(&self) -> &Part {
    self.parts.last().unwrap() // never empty
  }

  fn current_mut(&mut self) -> &mut Part {
    self.parts.last_mut().unwrap()
  }

  /// Applies a Content-Type header value to the current part. Anything
  /// unparsable falls back to `Other` rather than failing the lexer.
  pub fn content_type(&mut self, value: &[u8]) {
    let content_type = match headers::content_type(value) {
      Ok(content_type) => content_type,
      Err(_) => {
        log::debug!("malformed content-type {:?}", String::from_utf8_lossy(value));
        self.current_mut().mime_type = MimeType::Other;
        return;
      }
    };
    let part = self.current_mut();
    part.mime_type = match (content_type.kind.as_slice(), content_type.subtype.as_slice()) {
      (b"text", b"html") => MimeType::TextHtml,
      (b"text", _) => MimeType::TextPlain,
      (b"multipart", _) => MimeType::Multipart,
      (b"message", _) => MimeType::Message,
      _ => MimeType::Other,
    };
    for (key, value) in &content_type.parameters {
      match key.as_slice() {
        b"boundary" => part.boundary = Some(value.clone()),
        b"charset" => part.charset = encoding_rs::Encoding::for_label(value),
        _ => (),
      }
    }
  }

  pub fn transfer_encoding(&mut self, value: &[u8]) {
    let encoding = match headers::transfer_encoding(value) {
      Ok(encoding) => encoding,
      Err(_) => return, // unknown encodings tokenize as-is
    };
    self.current_mut().encoding = match encoding.as_slice() {
      b"base64" => Encoding::Base64,
      b"quoted-printable" => Encoding::QuotedPrintable,
      _ => Encoding::SevenBit,
    };
  }

  /// Pushes the embedded message of a `message/*` part; its headers follow.
  pub fn add_child(&mut self) {
    self.parts.push(Part::new(MimeType::Top));
  }

  /// Matches `line` against the boundary stack, innermost first, and updates
  /// the stack on a hit. Boundaries of an outer multipart terminate every
  /// part nested under it.
  pub fn on_boundary(&mut self, line: &[u8]) -> BoundaryAction {
    let line = match line.strip_prefix(b"--") {
      Some(line) => line,
      None => return BoundaryAction::NotOurs,
    };
    let (line, closing) = match line.strip_suffix(b"--") {
      Some(line) => (line, true),
      None => (line, false),
    };
    let index = self
      .parts
      .iter()
      .rposition(|part| part.boundary.as_deref() == Some(line));
    match index {
      None => BoundaryAction::NotOurs,
      Some(index) if closing => {
        self.parts.truncate(index + 1);
        BoundaryAction::Closed
      }
      Some(index) => {
        self.parts.truncate(index + 1);
        // Parts without their own Content-Type default to text/plain.
        self.parts.push(Part::new(MimeType::TextPlain));
        BoundaryAction::Opened
      }
    }
  }
}
