//! Symbol table: bulk upload codec, name lookup and handle bookkeeping.
//!
//! Upload entry layout:
//!
//! ```text
//! entry_length u32 | index_group u32 | index_offset u32 | size u32
//! data_type u32    | flags u32       | name_len u16     | type_len u16 | comment_len u16
//! name \0 | type \0 | comment \0 | padding up to entry_length
//! ```

use crate::codec::ByteReader;
use crate::command::Payload;
use catio_common::ads_types::AdsDataType;
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// Fixed part of an upload entry.
pub const SYMBOL_ENTRY_HEADER_SIZE: usize = 30;

/// One symbol as described by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolEntry {
    /// Fully qualified symbol name.
    pub name: String,
    /// Index group of the value.
    pub index_group: u32,
    /// Index offset of the value.
    pub index_offset: u32,
    /// Size in bytes; zero for bit-addressed types.
    pub size: u32,
    /// Raw ADS type code.
    pub data_type: u32,
    /// Symbol flags.
    pub flags: u32,
    /// Type name.
    pub type_name: String,
    /// Free-text comment.
    pub comment: String,
}

impl SymbolEntry {
    /// Typed data type, if the code is known.
    #[must_use]
    pub fn ads_type(&self) -> Option<AdsDataType> {
        AdsDataType::from_code(self.data_type)
    }

    /// Number of elements of the base type this symbol holds.
    #[must_use]
    pub fn element_count(&self) -> usize {
        match self.ads_type().map(AdsDataType::size) {
            Some(element) if element > 0 => (self.size as usize / element).max(1),
            _ => 1,
        }
    }

    fn encoded_len(&self) -> usize {
        SYMBOL_ENTRY_HEADER_SIZE + self.name.len() + self.type_name.len() + self.comment.len() + 3
    }
}

fn string_field(raw: &[u8], what: &str) -> AdsResult<String> {
    match raw.split_last() {
        Some((&0, text)) => Ok(String::from_utf8_lossy(text).into_owned()),
        _ => Err(AdsError::InvalidPayload(format!(
            "symbol {what} is not null-terminated"
        ))),
    }
}

/// Split a bulk upload into entries.
pub fn parse_symbol_upload(bytes: &[u8]) -> AdsResult<Vec<SymbolEntry>> {
    let mut entries = Vec::new();
    let mut r = ByteReader::new(bytes);

    while r.remaining() > 0 {
        let start = r.position();
        let entry_length = r.u32()? as usize;
        if entry_length < SYMBOL_ENTRY_HEADER_SIZE || entry_length - 4 > r.remaining() {
            return Err(AdsError::InvalidPayload(format!(
                "symbol entry at {start} has bad length {entry_length}"
            )));
        }
        let mut e = ByteReader::new(r.bytes(entry_length - 4)?);

        let index_group = e.u32()?;
        let index_offset = e.u32()?;
        let size = e.u32()?;
        let data_type = e.u32()?;
        let flags = e.u32()?;
        let name_len = e.u16()? as usize;
        let type_len = e.u16()? as usize;
        let comment_len = e.u16()? as usize;

        entries.push(SymbolEntry {
            name: string_field(e.bytes(name_len + 1)?, "name")?,
            type_name: string_field(e.bytes(type_len + 1)?, "type")?,
            comment: string_field(e.bytes(comment_len + 1)?, "comment")?,
            index_group,
            index_offset,
            size,
            data_type,
            flags,
        });
    }

    Ok(entries)
}

/// Encode entries in upload form.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn encode_symbol_upload(entries: &[SymbolEntry]) -> Vec<u8> {
    let mut out = Vec::with_capacity(entries.iter().map(SymbolEntry::encoded_len).sum());
    for entry in entries {
        out.extend_from_slice(&(entry.encoded_len() as u32).to_le_bytes());
        out.extend_from_slice(&entry.index_group.to_le_bytes());
        out.extend_from_slice(&entry.index_offset.to_le_bytes());
        out.extend_from_slice(&entry.size.to_le_bytes());
        out.extend_from_slice(&entry.data_type.to_le_bytes());
        out.extend_from_slice(&entry.flags.to_le_bytes());
        out.extend_from_slice(&(entry.name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(entry.type_name.len() as u16).to_le_bytes());
        out.extend_from_slice(&(entry.comment.len() as u16).to_le_bytes());
        for text in [&entry.name, &entry.type_name, &entry.comment] {
            out.extend_from_slice(text.as_bytes());
            out.push(0);
        }
    }
    out
}

/// Answer of `SYM_UPLOADINFO`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadInfo {
    /// Number of symbols.
    pub symbol_count: u32,
    /// Byte length of the full upload.
    pub symbol_length: u32,
}

impl Payload for UploadInfo {
    fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8);
        out.extend_from_slice(&self.symbol_count.to_le_bytes());
        out.extend_from_slice(&self.symbol_length.to_le_bytes());
        out
    }

    fn decode(bytes: &[u8]) -> AdsResult<Self> {
        let mut r = ByteReader::new(bytes);
        Ok(Self {
            symbol_count: r.u32()?,
            symbol_length: r.u32()?,
        })
    }
}

/// Extended upload info (`SYM_UPLOADINFO2`). Data type uploads are not
/// served, so their fields are always zero.
#[must_use]
pub fn encode_upload_info2(info: UploadInfo) -> Vec<u8> {
    let mut out = info.encode();
    out.extend_from_slice(&[0u8; 16]);
    out
}

/// Client-side symbol table with the per-session handle cache.
#[derive(Debug, Default)]
pub struct SymbolTable {
    entries: BTreeMap<String, SymbolEntry>,
    handles: HashMap<String, u32>,
}

impl SymbolTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all entries.
    pub fn build(&mut self, entries: Vec<SymbolEntry>) {
        self.entries = entries
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect();
    }

    /// Look up an entry by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&SymbolEntry> {
        self.entries.get(name)
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no entries are loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries in name order.
    pub fn iter(&self) -> impl Iterator<Item = &SymbolEntry> {
        self.entries.values()
    }

    /// Previously resolved handle for `name`.
    #[must_use]
    pub fn cached_handle(&self, name: &str) -> Option<u32> {
        self.handles.get(name).copied()
    }

    /// Remember a resolved handle.
    pub fn cache_handle(&mut self, name: &str, handle: u32) {
        self.handles.insert(name.to_string(), handle);
    }

    /// Forget one handle, returning it.
    pub fn remove_handle(&mut self, name: &str) -> Option<u32> {
        self.handles.remove(name)
    }

    /// Drain every cached handle, for release before closing.
    pub fn take_handles(&mut self) -> Vec<(String, u32)> {
        self.handles.drain().collect()
    }

    /// Drop every cached handle without releasing; used after the
    /// connection is gone.
    pub fn invalidate(&mut self) {
        self.handles.clear();
    }
}

/// Server-side symbol handles owned by one connection.
#[derive(Debug, Default)]
pub struct SymbolHandles {
    next: u32,
    handles: HashMap<u32, SymbolEntry>,
}

impl SymbolHandles {
    /// Create an empty allocator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a new handle to `entry`.
    pub fn allocate(&mut self, entry: SymbolEntry) -> AdsResult<u32> {
        if self.handles.len() >= u32::MAX as usize - 1 {
            return Err(AdsError::Protocol(AdsErrorCode::NoMoreHandles));
        }
        loop {
            self.next = self.next.wrapping_add(1);
            if self.next != 0 && !self.handles.contains_key(&self.next) {
                break;
            }
        }
        self.handles.insert(self.next, entry);
        Ok(self.next)
    }

    /// Entry bound to `handle`.
    pub fn resolve(&self, handle: u32) -> AdsResult<&SymbolEntry> {
        self.handles
            .get(&handle)
            .ok_or(AdsError::Protocol(AdsErrorCode::NotFound))
    }

    /// Release a handle.
    pub fn release(&mut self, handle: u32) -> AdsResult<()> {
        self.handles
            .remove(&handle)
            .map(|_| ())
            .ok_or(AdsError::Protocol(AdsErrorCode::NotFound))
    }

    /// Number of live handles.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    /// Returns true if no handles are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}
