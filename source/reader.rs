// Message sources: a single message on stdin or in a file, an mbox with
// `From ` separators at column 0, or a maildir (messages in new/ and cur/).
// https://cr.yp.to/proto/maildir.html - Maildir

use anyhow::Context as _;
use std::{
  fs,
  io::{self, Read as _},
  path, vec,
};

const MBOX_SEPARATOR: &[u8] = b"From ";

#[derive(Debug)]
pub struct Message {
  pub bytes: Vec<u8>,
  /// Source file, when there is one worth reporting.
  pub name: Option<String>,
}

#[derive(Debug)]
pub enum Reader {
  Single(Option<Message>),
  Mbox {
    buffer: Vec<u8>,
    position: usize,
    name: String,
  },
  Maildir(vec::IntoIter<path::PathBuf>),
}

impl Reader {
  /// Stdin when `input` is absent; otherwise figures out what the path is:
  /// a maildir (has cur/ or new/), an mbox (starts with `From `), or one
  /// plain message.
  pub fn open(input: Option<&path::Path>) -> anyhow::Result<Self> {
    let path = match input {
      None => {
        let mut buffer = Vec::new();
        io::stdin().read_to_end(&mut buffer)?;
        return Ok(if buffer.starts_with(MBOX_SEPARATOR) {
          Self::Mbox {
            buffer,
            position: 0,
            name: "-".to_string(),
          }
        } else {
          Self::Single(Some(Message {
            bytes: buffer,
            name: None,
          }))
        });
      }
      Some(path) => path,
    };

    if path.is_dir() {
      let mut files = Vec::new();
      for subdirectory in ["new", "cur"] {
        let subdirectory = path.join(subdirectory);
        if !subdirectory.is_dir() {
          continue;
        }
        for entry in fs::read_dir(&subdirectory)? {
          files.push(entry?.path());
        }
      }
      anyhow::ensure!(
        !files.is_empty() || path.join("new").is_dir() || path.join("cur").is_dir(),
        "{path:?} is neither a maildir nor a message"
      );
      files.sort();
      return Ok(Self::Maildir(files.into_iter()));
    }

    let buffer =
      fs::read(path).with_context(|| format!("couldn't read message from {path:?}"))?;
    let name = path.to_string_lossy().to_string();
    Ok(if buffer.starts_with(MBOX_SEPARATOR) {
      Self::Mbox {
        buffer,
        position: 0,
        name,
      }
    } else {
      Self::Single(Some(Message {
        bytes: buffer,
        name: Some(name),
      }))
    })
  }

  pub fn next_message(&mut self) -> anyhow::Result<Option<Message>> {
    match self {
      Self::Single(message) => Ok(message.take()),
      Self::Mbox {
        buffer,
        position,
        name,
      } => {
        if *position >= buffer.len() {
          return Ok(None);
        }
        // The next `\nFrom ` at column 0 ends this message; the separator
        // line stays part of its message, like any other header noise.
        let rest = &buffer[*position..];
        let end = memchr::memmem::find_iter(rest, b"\nFrom ")
          .next()
          .map(|found| found + 1)
          .unwrap_or(rest.len());
        let bytes = rest[..end].to_vec();
        *position += end;
        Ok(Some(Message {
          bytes,
          name: Some(name.clone()),
        }))
      }
      Self::Maildir(files) => match files.next() {
        None => Ok(None),
        Some(path) => {
          let bytes =
            fs::read(&path).with_context(|| format!("couldn't read message {path:?}"))?;
          Ok(Some(Message {
            bytes,
            name: Some(path.to_string_lossy().to_string()),
          }))
        }
      },
    }
  }
}
