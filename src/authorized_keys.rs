//! Line oriented model of an `authorized_keys` file.
//!
//! Lines are kept as raw bytes together with their terminators and written
//! back unchanged unless an operation touched them, so comments, blank lines,
//! CRLF endings, stray non UTF-8 bytes and entries we cannot parse survive an
//! edit untouched.

use anyhow::{Context, Result};
use ssh_key::PublicKey;

const LF: &[u8] = b"\n";
const CRLF: &[u8] = b"\r\n";

/// One line of an authorized keys file, terminator included
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Blank(Vec<u8>),
    Comment(Vec<u8>),
    Key(KeyRecord),
    /// Anything that is neither a comment nor a parseable key
    Unparsed(Vec<u8>),
}

/// A key entry, `[options] <algorithm> <base64> [comment]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyRecord {
    options: Option<Vec<u8>>,
    key: PublicKey,
    line: Vec<u8>,
}

impl KeyRecord {
    fn new(options: Option<Vec<u8>>, key: PublicKey, ending: &[u8]) -> Result<Self> {
        let encoded = key.to_openssh().context("failed to encode public key")?;
        let mut line = Vec::new();
        if let Some(options) = &options {
            line.extend_from_slice(options);
            line.push(b' ');
        }
        line.extend_from_slice(encoded.as_bytes());
        line.extend_from_slice(ending);
        Ok(Self { options, key, line })
    }

    pub fn options(&self) -> Option<&[u8]> {
        self.options.as_deref()
    }

    pub fn key(&self) -> &PublicKey {
        &self.key
    }

    /// Same algorithm and key material, comments are ignored
    pub fn matches(&self, key: &PublicKey) -> bool {
        self.key.key_data() == key.key_data()
    }
}

/// Splits a line into its content and its `\n` or `\r\n` terminator
fn split_ending(line: &[u8]) -> (&[u8], &[u8]) {
    let content = line
        .strip_suffix(CRLF)
        .or_else(|| line.strip_suffix(LF))
        .unwrap_or(line);
    line.split_at(content.len())
}

fn trim(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map_or(start, |idx| idx + 1);
    &bytes[start..end]
}

/// Byte offset of the first whitespace outside of double quotes
fn end_of_options(line: &[u8]) -> Option<usize> {
    let mut quoted = false;
    let mut escaped = false;
    for (idx, &b) in line.iter().enumerate() {
        match b {
            _ if escaped => escaped = false,
            b'\\' if quoted => escaped = true,
            b'"' => quoted = !quoted,
            b if b.is_ascii_whitespace() && !quoted => return Some(idx),
            _ => {}
        }
    }
    None
}

// Key material is plain ascii, invalid UTF-8 can only sit in the comment.
fn parse_key(text: &[u8]) -> Option<PublicKey> {
    PublicKey::from_openssh(&String::from_utf8_lossy(text)).ok()
}

impl Record {
    pub fn parse(line: &[u8]) -> Record {
        let raw = line.to_vec();
        let (content, _) = split_ending(line);
        let content = trim(content);
        if content.is_empty() {
            return Record::Blank(raw);
        }
        if content.starts_with(b"#") {
            return Record::Comment(raw);
        }
        if let Some(key) = parse_key(content) {
            return Record::Key(KeyRecord {
                options: None,
                key,
                line: raw,
            });
        }
        if let Some(idx) = end_of_options(content) {
            let (options, rest) = content.split_at(idx);
            if let Some(key) = parse_key(trim(rest)) {
                return Record::Key(KeyRecord {
                    options: Some(options.to_vec()),
                    key,
                    line: raw,
                });
            }
        }
        Record::Unparsed(raw)
    }

    pub fn line(&self) -> &[u8] {
        match self {
            Record::Blank(line) | Record::Comment(line) | Record::Unparsed(line) => line,
            Record::Key(record) => &record.line,
        }
    }

    fn line_mut(&mut self) -> &mut Vec<u8> {
        match self {
            Record::Blank(line) | Record::Comment(line) | Record::Unparsed(line) => line,
            Record::Key(record) => &mut record.line,
        }
    }

    fn matches(&self, key: &PublicKey) -> bool {
        matches!(self, Record::Key(record) if record.matches(key))
    }
}

/// Parsed content of a remote `~/.ssh/authorized_keys`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthorizedKeys {
    records: Vec<Record>,
}

impl AuthorizedKeys {
    pub fn parse(content: &[u8]) -> Self {
        Self {
            records: content
                .split_inclusive(|b| *b == b'\n')
                .map(Record::parse)
                .collect(),
        }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn keys(&self) -> impl Iterator<Item = &KeyRecord> {
        self.records.iter().filter_map(|record| match record {
            Record::Key(key) => Some(key),
            _ => None,
        })
    }

    /// Number of entries carrying `key`
    pub fn count(&self, key: &PublicKey) -> usize {
        self.records.iter().filter(|r| r.matches(key)).count()
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.count(key) > 0
    }

    /// Line terminator of the file, `\n` unless it already uses `\r\n`
    fn line_ending(&self) -> &'static [u8] {
        let crlf = self.records.iter().any(|r| r.line().ends_with(CRLF));
        if crlf { CRLF } else { LF }
    }

    /// Add `key` as the last line, whether or not it is already present
    pub fn append(&mut self, key: &PublicKey) -> Result<()> {
        let ending = self.line_ending();
        if let Some(last) = self.records.last_mut() {
            let line = last.line_mut();
            if !line.ends_with(LF) {
                line.extend_from_slice(ending);
            }
        }
        let record = KeyRecord::new(None, key.clone(), ending)?;
        self.records.push(Record::Key(record));
        Ok(())
    }

    /// Swap every entry of `old` for `new`, keeping each entry's options and line ending.
    /// Returns the number of replaced entries.
    pub fn replace(&mut self, old: &PublicKey, new: &PublicKey) -> Result<usize> {
        let mut replaced = 0;
        for record in self.records.iter_mut() {
            if let Record::Key(entry) = record {
                if entry.matches(old) {
                    let (_, ending) = split_ending(&entry.line);
                    *entry = KeyRecord::new(entry.options.clone(), new.clone(), ending)?;
                    replaced += 1;
                }
            }
        }
        Ok(replaced)
    }

    /// Delete every entry of `key`, returns the number of deleted entries
    pub fn remove(&mut self, key: &PublicKey) -> usize {
        let before = self.records.len();
        self.records.retain(|record| !record.matches(key));
        before - self.records.len()
    }

    /// File content, byte for byte as parsed apart from the edited lines
    pub fn render(&self) -> Vec<u8> {
        self.records.iter().flat_map(Record::line).copied().collect()
    }
}
