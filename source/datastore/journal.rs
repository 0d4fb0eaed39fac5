// The transaction log: CRC-protected records appended to `log.<seq>` segment
// files, one record per committed transaction. Replay applies records in
// sequence order and stops at the first torn or corrupt record, which is how
// an interrupted writer's tail is discarded.
//
// Record layout, all integers little-endian:
//   LEN      u32   length of the payload that follows (CRC excluded)
//   PAYLOAD        SEQ u64 | NAME_LEN u16 | NAME | OP_COUNT u32 | OPS
//   CRC32    u32   crc32fast over PAYLOAD
// One op: KIND u8 (0 put, 1 del) | KEY_LEN u16 | KEY | [GOOD u32 | SPAM u32]

use super::TokenRecord;
use anyhow::Context as _;
use std::{
  fs,
  io::{self, Read as _, Seek as _, Write as _},
  path,
};

const SEGMENT_PREFIX: &str = "log.";
/// Rotate to a fresh segment once the current one exceeds this.
const SEGMENT_BYTES: u64 = 1024 * 1024;

#[derive(Clone, Debug, PartialEq)]
pub enum Op {
  Put(Vec<u8>, TokenRecord),
  Del(Vec<u8>),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Record {
  pub seq: u64,
  pub db: String,
  pub ops: Vec<Op>,
}

impl Record {
  fn encode(&self) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&self.seq.to_le_bytes());
    payload.extend_from_slice(&(self.db.len() as u16).to_le_bytes());
    payload.extend_from_slice(self.db.as_bytes());
    payload.extend_from_slice(&(self.ops.len() as u32).to_le_bytes());
    for op in &self.ops {
      match op {
        Op::Put(key, value) => {
          payload.push(0);
          payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
          payload.extend_from_slice(key);
          payload.extend_from_slice(&value.good.to_le_bytes());
          payload.extend_from_slice(&value.spam.to_le_bytes());
        }
        Op::Del(key) => {
          payload.push(1);
          payload.extend_from_slice(&(key.len() as u16).to_le_bytes());
          payload.extend_from_slice(key);
        }
      }
    }
    let mut encoded = Vec::with_capacity(payload.len() + 8);
    encoded.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    let crc = crc32fast::hash(&payload);
    encoded.extend_from_slice(&payload);
    encoded.extend_from_slice(&crc.to_le_bytes());
    encoded
  }
}

struct Decoder<'a> {
  bytes: &'a [u8],
  position: usize,
}

impl<'a> Decoder<'a> {
  fn take(&mut self, n: usize) -> Option<&'a [u8]> {
    let taken = self.bytes.get(self.position..self.position + n)?;
    self.position += n;
    Some(taken)
  }

  fn u16(&mut self) -> Option<u16> {
    Some(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
  }

  fn u32(&mut self) -> Option<u32> {
    Some(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
  }

  fn u64(&mut self) -> Option<u64> {
    Some(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
  }
}

fn decode(payload: &[u8]) -> Option<Record> {
  let mut decoder = Decoder {
    bytes: payload,
    position: 0,
  };
  let seq = decoder.u64()?;
  let name_len = decoder.u16()? as usize;
  let db = String::from_utf8(decoder.take(name_len)?.to_vec()).ok()?;
  let op_count = decoder.u32()?;
  let mut ops = Vec::with_capacity(op_count as usize);
  for _ in 0..op_count {
    let kind = *decoder.take(1)?.first()?;
    let key_len = decoder.u16()? as usize;
    let key = decoder.take(key_len)?.to_vec();
    ops.push(match kind {
      0 => Op::Put(
        key,
        TokenRecord {
          good: decoder.u32()?,
          spam: decoder.u32()?,
        },
      ),
      1 => Op::Del(key),
      _ => return None,
    });
  }
  Some(Record { seq, db, ops })
}

/// Segment paths in ascending first-sequence order.
fn segments(directory: &path::Path) -> io::Result<Vec<(u64, path::PathBuf)>> {
  let mut segments = Vec::new();
  for entry in fs::read_dir(directory)? {
    let entry = entry?;
    let name = entry.file_name();
    let name = match name.to_str() {
      Some(name) => name,
      None => continue,
    };
    if let Some(seq) = name.strip_prefix(SEGMENT_PREFIX) {
      if let Ok(seq) = seq.parse::<u64>() {
        segments.push((seq, entry.path()));
      }
    }
  }
  segments.sort();
  Ok(segments)
}

/// Appends one committed transaction; the record is on disk when this
/// returns. Rotates to `log.<seq>` when the current segment is full.
pub fn append(directory: &path::Path, record: &Record) -> anyhow::Result<()> {
  let last = segments(directory)?.pop().filter(|(_, path)| {
    fs::metadata(path)
      .map(|metadata| metadata.len() < SEGMENT_BYTES)
      .unwrap_or(false)
  });
  let segment = match last {
    Some((_, path)) => path,
    None => directory.join(format!("{SEGMENT_PREFIX}{:010}", record.seq)),
  };
  let mut file = fs::OpenOptions::new()
    .create(true)
    .append(true)
    .open(&segment)
    .with_context(|| format!("couldn't open log segment {segment:?}"))?;
  file.write_all(&record.encode())?;
  file.sync_data()?;
  Ok(())
}

/// Replays every record with `seq > after` in order, stopping at the first
/// torn or corrupt record. Returns the highest sequence seen anywhere in the
/// log (applied or not), or `after` when the log holds nothing newer.
pub fn replay<F>(directory: &path::Path, after: u64, mut apply: F) -> anyhow::Result<u64>
where
  F: FnMut(Record),
{
  let mut last = after;
  for (_, segment) in segments(directory)? {
    let mut file = fs::File::open(&segment)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let mut position = 0;
    loop {
      let Some(header) = bytes.get(position..position + 4) else {
        break;
      };
      let length = u32::from_le_bytes(header.try_into().unwrap()) as usize;
      let Some(payload) = bytes.get(position + 4..position + 4 + length) else {
        log::warn!("torn record at {segment:?}:{position}, discarding log tail");
        return Ok(last);
      };
      let Some(stored) = bytes.get(position + 4 + length..position + 8 + length) else {
        log::warn!("torn record at {segment:?}:{position}, discarding log tail");
        return Ok(last);
      };
      if crc32fast::hash(payload) != u32::from_le_bytes(stored.try_into().unwrap()) {
        log::warn!("checksum mismatch at {segment:?}:{position}, discarding log tail");
        return Ok(last);
      }
      match decode(payload) {
        Some(record) => {
          last = last.max(record.seq);
          if record.seq > after {
            apply(record);
          }
        }
        None => {
          log::warn!("undecodable record at {segment:?}:{position}, discarding log tail");
          return Ok(last);
        }
      }
      position += 8 + length;
    }
  }
  Ok(last)
}

/// Total bytes of log on disk; drives the bounded checkpoint-on-close.
pub fn log_bytes(directory: &path::Path) -> u64 {
  segments(directory)
    .map(|segments| {
      segments
        .iter()
        .filter_map(|(_, path)| fs::metadata(path).ok())
        .map(|metadata| metadata.len())
        .sum()
    })
    .unwrap_or(0)
}

/// Removes segments made redundant by checkpoints: a segment is removable
/// when the next one starts at or below the fold watermark (so everything in
/// it is folded) and it isn't the active tail.
pub fn purge(directory: &path::Path, up_to: u64) -> anyhow::Result<usize> {
  let segments = segments(directory)?;
  let mut removed = 0;
  for pair in segments.windows(2) {
    let [(_, path), (next_first, _)] = pair else {
      unreachable!()
    };
    if *next_first <= up_to + 1 {
      log::info!("purging log segment {path:?}");
      fs::remove_file(path)?;
      removed += 1;
    }
  }
  Ok(removed)
}

/// Truncates a trailing half-written record so later appends start clean.
/// Only called under the exclusive environment lock during recovery.
pub fn truncate_torn_tail(directory: &path::Path) -> anyhow::Result<()> {
  for (_, segment) in segments(directory)? {
    let mut file = fs::OpenOptions::new().read(true).write(true).open(&segment)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let mut position = 0;
    loop {
      let Some(header) = bytes.get(position..position + 4) else {
        break;
      };
      let length = u32::from_le_bytes(header.try_into().unwrap()) as usize;
      let whole = bytes
        .get(position + 4..position + 8 + length)
        .filter(|rest| {
          crc32fast::hash(&rest[..length]) == u32::from_le_bytes(rest[length..].try_into().unwrap())
        })
        .is_some();
      if !whole {
        log::warn!("truncating torn tail of {segment:?} at {position}");
        file.set_len(position as u64)?;
        file.seek(io::SeekFrom::Start(position as u64))?;
        file.sync_data()?;
        break;
      }
      position += 8 + length;
    }
  }
  Ok(())
}
