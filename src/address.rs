//! A1-style cell references and rectangular ranges.
//!
//! Rows and columns are stored 0-based (the way calamine addresses cells) and
//! rendered 1-based with column letters ("B2").

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

/// Last column Excel can address (XFD).
pub const MAX_COL: u32 = 16_383;
/// Last row Excel can address (0-based).
pub const MAX_ROW: u32 = 1_048_575;

/// Column index to Excel letter (0→A, 1→B, 25→Z, 26→AA).
pub fn col_index_to_letter(index: u32) -> String {
    let mut n = index;
    let mut s = String::new();
    loop {
        let r = (n % 26) as u8;
        s.insert(0, (b'A' + r) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    s
}

/// Excel letters to column index (A→0, Z→25, AA→26). Uppercase only.
pub fn letter_to_col_index(letters: &str) -> Option<u32> {
    let mut n: u32 = 0;
    for b in letters.bytes() {
        if !b.is_ascii_uppercase() {
            return None;
        }
        n = n.checked_mul(26)?.checked_add((b - b'A') as u32 + 1)?;
    }
    n.checked_sub(1)
}

fn a1_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\$?([A-Z]{1,3})\$?([1-9][0-9]{0,6})$").expect("a1 regex"))
}

/// Split "'Vendor Form'!B2" into the unquoted sheet name and the local
/// reference.
pub fn split_sheet_prefix(raw: &str) -> (Option<&str>, &str) {
    let trimmed = raw.trim();
    match trimmed.rfind('!') {
        Some(pos) => {
            let sheet = trimmed[..pos].trim();
            let sheet = sheet
                .strip_prefix('\'')
                .and_then(|s| s.strip_suffix('\''))
                .unwrap_or(sheet);
            (Some(sheet), trimmed[pos + 1..].trim())
        }
        None => (None, trimmed),
    }
}

/// One cell of a worksheet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellAddress {
    pub row: u32,
    pub col: u32,
}

impl CellAddress {
    pub fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }

    /// Parse "B2", "$B$2", "b2" or "Sheet1!B2". The sheet prefix is not
    /// checked here; see [`split_sheet_prefix`].
    pub fn parse(raw: &str) -> Option<Self> {
        let (_, local) = split_sheet_prefix(raw);
        let upper = local.to_ascii_uppercase();
        let caps = a1_regex().captures(&upper)?;
        let col = letter_to_col_index(&caps[1])?;
        let row: u32 = caps[2].parse().ok()?;
        let row = row.checked_sub(1)?;
        if col > MAX_COL || row > MAX_ROW {
            return None;
        }
        Some(Self { row, col })
    }
}

impl fmt::Display for CellAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", col_index_to_letter(self.col), self.row + 1)
    }
}

impl FromStr for CellAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("'{}' is not a cell reference", s.trim()))
    }
}

impl Serialize for CellAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for CellAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Inclusive rectangle of cells, `start` top-left and `end` bottom-right.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CellRange {
    pub start: CellAddress,
    pub end: CellAddress,
}

impl CellRange {
    pub fn new(a: CellAddress, b: CellAddress) -> Self {
        Self {
            start: CellAddress::new(a.row.min(b.row), a.col.min(b.col)),
            end: CellAddress::new(a.row.max(b.row), a.col.max(b.col)),
        }
    }

    /// Parse "A1:C4" or a single "A1".
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.split_once(':') {
            Some((a, b)) => Some(Self::new(CellAddress::parse(a)?, CellAddress::parse(b)?)),
            None => CellAddress::parse(raw).map(|a| Self::new(a, a)),
        }
    }

    pub fn contains(&self, addr: CellAddress) -> bool {
        (self.start.row..=self.end.row).contains(&addr.row)
            && (self.start.col..=self.end.col).contains(&addr.col)
    }

    /// Smallest range covering both.
    pub fn union(&self, other: &CellRange) -> CellRange {
        CellRange {
            start: CellAddress::new(
                self.start.row.min(other.start.row),
                self.start.col.min(other.start.col),
            ),
            end: CellAddress::new(
                self.end.row.max(other.end.row),
                self.end.col.max(other.end.col),
            ),
        }
    }

    pub fn is_single_cell(&self) -> bool {
        self.start == self.end
    }

    pub fn cell_count(&self) -> u64 {
        (self.end.row - self.start.row + 1) as u64 * (self.end.col - self.start.col + 1) as u64
    }

    /// Cells in row-major order.
    pub fn cells(&self) -> impl Iterator<Item = CellAddress> + '_ {
        (self.start.row..=self.end.row)
            .flat_map(move |row| (self.start.col..=self.end.col).map(move |col| CellAddress::new(row, col)))
    }
}

impl fmt::Display for CellRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_single_cell() {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}:{}", self.start, self.end)
        }
    }
}
