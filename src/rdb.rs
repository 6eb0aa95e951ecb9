//! Point-in-time snapshots (MRDB2 format).
//!
//! The layout is textual with length-prefixed payload fields and LF line
//! terminators:
//!
//! ```text
//! MRDB2\n
//! STR <n>\n
//!   <klen> <key> <vlen> <value> <expire_at_ms>\n
//! HASH <m>\n
//!   <klen> <key> <expire_at_ms> <nfields>\n
//!     <flen> <field> <vlen> <value>\n
//! ZSET <p>\n
//!   <klen> <key> <expire_at_ms> <nitems>\n
//!     <score> <mlen> <member>\n
//! ```
//!
//! Lengths and timestamps are decimal ASCII; payload bytes are embedded
//! raw, so the loader navigates by the length prefixes rather than line
//! splitting. `MRDB1` files (legacy, strings only) are still accepted.

use crate::config::RdbOptions;
use crate::error::{KvError, Result};
use crate::store::{KeyValueStore, format_score};
use bytes::Bytes;
use std::fs::{self, OpenOptions};
use std::io::{BufWriter, Write};

const MAGIC: &[u8] = b"MRDB2";
const MAGIC_V1: &[u8] = b"MRDB1";

/// Snapshot reader/writer bound to one on-disk location.
#[derive(Debug, Clone)]
pub struct Rdb {
    opts: RdbOptions,
}

impl Rdb {
    pub fn new(opts: RdbOptions) -> Self {
        Self { opts }
    }

    pub fn is_enabled(&self) -> bool {
        self.opts.enabled
    }

    pub fn path(&self) -> std::path::PathBuf {
        self.opts.path()
    }

    /// Write a full snapshot to the final location, truncating whatever
    /// was there, then fsync.
    pub fn save(&self, store: &KeyValueStore) -> Result<()> {
        if !self.opts.enabled {
            return Ok(());
        }
        fs::create_dir_all(&self.opts.dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(self.path())?;
        let mut out = BufWriter::new(file);

        let strings = store.snapshot();
        let hashes = store.snapshot_hash();
        let zsets = store.snapshot_zset();

        out.write_all(MAGIC)?;
        out.write_all(b"\n")?;

        writeln!(out, "STR {}", strings.len())?;
        for (key, record) in &strings {
            write!(out, "{} ", key.len())?;
            out.write_all(key)?;
            write!(out, " {} ", record.value.len())?;
            out.write_all(&record.value)?;
            writeln!(out, " {}", record.expire_at_ms)?;
        }

        writeln!(out, "HASH {}", hashes.len())?;
        for (key, record) in &hashes {
            write!(out, "{} ", key.len())?;
            out.write_all(key)?;
            writeln!(out, " {} {}", record.expire_at_ms, record.fields.len())?;
            for (field, value) in &record.fields {
                write!(out, "{} ", field.len())?;
                out.write_all(field)?;
                write!(out, " {} ", value.len())?;
                out.write_all(value)?;
                out.write_all(b"\n")?;
            }
        }

        writeln!(out, "ZSET {}", zsets.len())?;
        for flat in &zsets {
            write!(out, "{} ", flat.key.len())?;
            out.write_all(&flat.key)?;
            writeln!(out, " {} {}", flat.expire_at_ms, flat.items.len())?;
            for (score, member) in &flat.items {
                write!(out, "{} {} ", format_score(*score), member.len())?;
                out.write_all(member)?;
                out.write_all(b"\n")?;
            }
        }

        out.flush()?;
        out.get_ref().sync_all()?;
        Ok(())
    }

    /// Load a snapshot into the store. A missing file is success with an
    /// empty state; any malformed content is an error — snapshot
    /// truncation is never tolerated.
    pub fn load(&self, store: &KeyValueStore) -> Result<()> {
        if !self.opts.enabled {
            return Ok(());
        }
        let data = match fs::read(self.path()) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let mut cur = Cursor::new(&data);

        let magic = cur.read_until(b'\n')?;
        if magic == MAGIC_V1 {
            // legacy layout: bare count line, strings only
            let count = cur.read_usize_line()?;
            for _ in 0..count {
                self.load_string_record(store, &mut cur)?;
            }
            return Ok(());
        }
        if magic != MAGIC {
            return Err(KvError::Corrupt("bad magic".to_string()));
        }

        let count = cur.read_section(b"STR ")?;
        for _ in 0..count {
            self.load_string_record(store, &mut cur)?;
        }

        let count = cur.read_section(b"HASH ")?;
        for _ in 0..count {
            let key = cur.read_sized_field()?;
            let expire_at_ms = cur.read_i64_tok()?;
            let nfields = cur.read_usize_tok_nl()?;
            for _ in 0..nfields {
                let field = cur.read_sized_field()?;
                let value = cur.read_sized_field_nl()?;
                store.hset(key.clone(), field, value);
            }
            if nfields > 0 && expire_at_ms >= 0 {
                store.set_hash_expire_at_ms(&key, expire_at_ms);
            }
        }

        let count = cur.read_section(b"ZSET ")?;
        for _ in 0..count {
            let key = cur.read_sized_field()?;
            let expire_at_ms = cur.read_i64_tok()?;
            let nitems = cur.read_usize_tok_nl()?;
            for _ in 0..nitems {
                let score_tok = cur.read_until(b' ')?;
                let score: f64 = std::str::from_utf8(&score_tok)
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .ok_or_else(|| KvError::Corrupt("bad zset score".to_string()))?;
                let member = cur.read_sized_field_nl()?;
                store.zadd(key.clone(), score, member);
            }
            if nitems > 0 && expire_at_ms >= 0 {
                store.set_zset_expire_at_ms(&key, expire_at_ms);
            }
        }
        Ok(())
    }

    fn load_string_record(&self, store: &KeyValueStore, cur: &mut Cursor<'_>) -> Result<()> {
        let key = cur.read_sized_field()?;
        let value = cur.read_sized_field()?;
        let expire_at_ms = cur.read_i64_tok_nl()?;
        store.set_with_expire_at_ms(key, value, expire_at_ms);
        Ok(())
    }
}

/// Byte cursor over the snapshot contents.
struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn corrupt(what: &str) -> KvError {
        KvError::Corrupt(what.to_string())
    }

    fn read_until(&mut self, delim: u8) -> Result<&'a [u8]> {
        let start = self.pos;
        while self.pos < self.data.len() {
            if self.data[self.pos] == delim {
                let tok = &self.data[start..self.pos];
                self.pos += 1;
                return Ok(tok);
            }
            self.pos += 1;
        }
        Err(Self::corrupt("unexpected end of snapshot"))
    }

    fn read_exact(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.data.len() {
            return Err(Self::corrupt("truncated payload"));
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn expect(&mut self, byte: u8) -> Result<()> {
        if self.pos < self.data.len() && self.data[self.pos] == byte {
            self.pos += 1;
            Ok(())
        } else {
            Err(Self::corrupt("framing byte missing"))
        }
    }

    fn parse_usize(tok: &[u8]) -> Result<usize> {
        std::str::from_utf8(tok)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Self::corrupt("bad decimal length"))
    }

    fn parse_i64(tok: &[u8]) -> Result<i64> {
        std::str::from_utf8(tok)
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| Self::corrupt("bad decimal value"))
    }

    /// `"<tag><count>\n"` section header.
    fn read_section(&mut self, tag: &[u8]) -> Result<usize> {
        let line = self.read_until(b'\n')?;
        let Some(rest) = line.strip_prefix(tag) else {
            return Err(Self::corrupt("missing section tag"));
        };
        Self::parse_usize(rest)
    }

    fn read_usize_line(&mut self) -> Result<usize> {
        let line = self.read_until(b'\n')?;
        Self::parse_usize(line)
    }

    /// `"<len> <bytes> "` — a space-terminated length-prefixed field.
    fn read_sized_field(&mut self) -> Result<Bytes> {
        let len = Self::parse_usize(self.read_until(b' ')?)?;
        let payload = self.read_exact(len)?;
        self.expect(b' ')?;
        Ok(Bytes::copy_from_slice(payload))
    }

    /// `"<len> <bytes>\n"` — a newline-terminated length-prefixed field.
    fn read_sized_field_nl(&mut self) -> Result<Bytes> {
        let len = Self::parse_usize(self.read_until(b' ')?)?;
        let payload = self.read_exact(len)?;
        self.expect(b'\n')?;
        Ok(Bytes::copy_from_slice(payload))
    }

    fn read_i64_tok(&mut self) -> Result<i64> {
        Self::parse_i64(self.read_until(b' ')?)
    }

    fn read_i64_tok_nl(&mut self) -> Result<i64> {
        Self::parse_i64(self.read_until(b'\n')?)
    }

    fn read_usize_tok_nl(&mut self) -> Result<usize> {
        Self::parse_usize(self.read_until(b'\n')?)
    }
}
