// Pass-through output: the original message re-emitted with exactly one
// verdict header, replacing any the message already carried. An optional
// statistics block rides along as header continuation lines.

use crate::score::Verdict;
use std::io;

/// Case-insensitive check for `name:` at the start of a header line.
fn is_header(line: &[u8], name: &str) -> bool {
  line.len() > name.len()
    && line[name.len()] == b':'
    && line[..name.len()].eq_ignore_ascii_case(name.as_bytes())
}

pub fn write_message<W: io::Write>(
  writer: &mut W,
  message: &[u8],
  header_name: &str,
  verdict: Verdict,
  spamicity: f64,
  stats: Option<&[u8]>,
) -> io::Result<()> {
  // Split into the header block and everything after it.
  let mut end_of_headers = message.len();
  let mut position = 0;
  while position < message.len() {
    let line_end = memchr::memchr(b'\n', &message[position..])
      .map(|found| position + found + 1)
      .unwrap_or(message.len());
    let line = &message[position..line_end];
    if line == b"\n" || line == b"\r\n" {
      end_of_headers = position;
      break;
    }
    position = line_end;
  }

  let crlf = message[..end_of_headers].windows(2).any(|pair| pair == b"\r\n");
  let eol: &[u8] = if crlf { b"\r\n" } else { b"\n" };

  // Copy the headers, dropping any previous verdict header (with its
  // continuation lines).
  let mut position = 0;
  let mut skipping = false;
  while position < end_of_headers {
    let line_end = memchr::memchr(b'\n', &message[position..end_of_headers])
      .map(|found| position + found + 1)
      .unwrap_or(end_of_headers);
    let line = &message[position..line_end];
    if is_header(line, header_name) {
      skipping = true;
    } else if skipping && matches!(line.first(), Some(b' ') | Some(b'\t')) {
      // continuation of the dropped header
    } else {
      skipping = false;
      writer.write_all(line)?;
    }
    position = line_end;
  }

  // The verdict header, then the statistics continuation lines.
  writer.write_all(header_name.as_bytes())?;
  writer.write_all(b": ")?;
  writer.write_all(verdict.label().as_bytes())?;
  writer.write_all(format!(", tests=bogofilter, spamicity={spamicity:.6}").as_bytes())?;
  writer.write_all(eol)?;
  if let Some(stats) = stats {
    for line in stats.split(|byte| *byte == b'\n') {
      if line.is_empty() {
        continue;
      }
      writer.write_all(b"\t")?;
      writer.write_all(line)?;
      writer.write_all(eol)?;
    }
  }

  writer.write_all(&message[end_of_headers..])
}
