//! Cluster-size extraction from raw pattern data.
//!
//! Downstream selection cuts need the pixel count of every cluster. Known
//! non-grouped shapes come straight out of the [`PatternDictionary`];
//! grouped or invalid pattern ids fall back to decoding the raw
//! bit-pattern stream: one byte of row span, one byte of column span,
//! then `ceil(rows·cols / 8)` bitmask bytes whose set bits are the fired
//! pixels.

use crate::error::PatternError;
use serde::{Deserialize, Serialize};

/// Pattern id marking a shape that is not in the dictionary.
pub const INVALID_PATTERN_ID: u16 = u16::MAX;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
struct PatternEntry {
    npixels: u32,
    grouped: bool,
}

/// Dictionary of frequent cluster shapes, indexed by pattern id.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PatternDictionary {
    entries: Vec<PatternEntry>,
}

impl PatternDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a shape; returns its pattern id.
    pub fn push(&mut self, npixels: u32, grouped: bool) -> u16 {
        self.entries.push(PatternEntry { npixels, grouped });
        (self.entries.len() - 1) as u16
    }

    /// True when the id stands for a group of coarse shapes whose exact
    /// pixel count must be read from the raw stream.
    pub fn is_group(&self, id: u16) -> bool {
        self.entries
            .get(id as usize)
            .map(|e| e.grouped)
            .unwrap_or(true)
    }

    pub fn npixels(&self, id: u16) -> Result<u32, PatternError> {
        self.entries
            .get(id as usize)
            .map(|e| e.npixels)
            .ok_or(PatternError::UnknownPattern(id))
    }
}

/// Decode one raw pattern at the cursor, returning its pixel count and
/// advancing past it.
fn decode_raw(stream: &[u8], cursor: &mut usize, cluster: usize) -> Result<u32, PatternError> {
    let header_end = *cursor + 2;
    if stream.len() < header_end {
        return Err(PatternError::TruncatedStream { cluster });
    }
    let rows = stream[*cursor] as usize;
    let cols = stream[*cursor + 1] as usize;
    let nbytes = (rows * cols).div_ceil(8);
    let end = header_end + nbytes;
    if stream.len() < end {
        return Err(PatternError::TruncatedStream { cluster });
    }
    let npix = stream[header_end..end]
        .iter()
        .map(|b| b.count_ones())
        .sum();
    *cursor = end;
    Ok(npix)
}

/// Pixel count per cluster, in input order. `pattern_ids` carries one id
/// per cluster; ids that are invalid or grouped consume the next raw
/// pattern from `raw_stream`.
pub fn cluster_sizes(
    pattern_ids: &[u16],
    raw_stream: &[u8],
    dict: &PatternDictionary,
) -> Result<Vec<u32>, PatternError> {
    let mut cursor = 0usize;
    let mut sizes = Vec::with_capacity(pattern_ids.len());
    for (i, &id) in pattern_ids.iter().enumerate() {
        let npix = if id == INVALID_PATTERN_ID || dict.is_group(id) {
            decode_raw(raw_stream, &mut cursor, i)?
        } else {
            dict.npixels(id)?
        };
        sizes.push(npix);
    }
    Ok(sizes)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
