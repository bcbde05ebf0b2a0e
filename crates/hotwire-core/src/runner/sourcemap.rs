//! Source map lookups for remapping evaluation stack traces.

use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::Deserialize;

const INLINE_MAP_PREFIX: &str = "//# sourceMappingURL=data:application/json;";

const VLQ_BASE_SHIFT: u32 = 5;
const VLQ_BASE_MASK: i64 = (1 << VLQ_BASE_SHIFT) - 1;
const VLQ_CONTINUATION_BIT: i64 = 1 << VLQ_BASE_SHIFT;

/// One frame of an evaluation stack trace. Lines and columns are 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub name: Option<String>,
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl StackFrame {
    pub fn new(file: impl Into<String>, line: u32, column: u32) -> Self {
        Self {
            name: None,
            file: file.into(),
            line,
            column,
        }
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

impl fmt::Display for StackFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{name} ({}:{}:{})", self.file, self.line, self.column),
            None => write!(f, "{}:{}:{}", self.file, self.line, self.column),
        }
    }
}

fn base64_digit(c: u8) -> Option<i64> {
    match c {
        b'A'..=b'Z' => Some(i64::from(c - b'A')),
        b'a'..=b'z' => Some(i64::from(c - b'a' + 26)),
        b'0'..=b'9' => Some(i64::from(c - b'0' + 52)),
        b'+' => Some(62),
        b'/' => Some(63),
        _ => None,
    }
}

/// Decode one Base64 VLQ segment into its fields.
#[must_use]
pub fn vlq_decode(input: &str) -> Vec<i64> {
    let mut values = Vec::new();
    let mut value: i64 = 0;
    let mut shift: u32 = 0;

    for digit in input.bytes().filter_map(base64_digit) {
        value += (digit & VLQ_BASE_MASK) << shift;
        if digit & VLQ_CONTINUATION_BIT == 0 {
            let negative = value & 1 == 1;
            value >>= 1;
            values.push(if negative { -value } else { value });
            value = 0;
            shift = 0;
        } else {
            shift += VLQ_BASE_SHIFT;
        }
    }
    values
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSourceMap {
    version: u32,
    #[serde(default)]
    source_root: Option<String>,
    #[serde(default)]
    sources: Vec<Option<String>>,
    #[serde(default)]
    names: Vec<String>,
    mappings: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Mapping {
    generated_line: u32,
    generated_column: u32,
    source: u32,
    original_line: u32,
    original_column: u32,
    name: Option<u32>,
}

/// Original location of a generated position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginalPosition {
    pub source: String,
    /// 1-based.
    pub line: u32,
    /// 1-based.
    pub column: u32,
    pub name: Option<String>,
}

/// A parsed V3 source map, ready for lookups.
#[derive(Debug, Clone)]
pub struct SourceMapConsumer {
    sources: Vec<String>,
    names: Vec<String>,
    /// Sorted by (generated line, generated column).
    mappings: Vec<Mapping>,
}

impl SourceMapConsumer {
    /// Parse a source map JSON document. Returns `None` for anything that is
    /// not a usable V3 map.
    #[must_use]
    pub fn parse(json: &str) -> Option<Self> {
        let raw: RawSourceMap = serde_json::from_str(json).ok()?;
        if raw.version != 3 {
            return None;
        }
        let root = raw.source_root.unwrap_or_default();
        let sources = raw
            .sources
            .into_iter()
            .map(|s| {
                let s = s.unwrap_or_default();
                if root.is_empty() {
                    s
                } else {
                    format!("{}/{s}", root.trim_end_matches('/'))
                }
            })
            .collect();
        let mut mappings = decode_mappings(&raw.mappings);
        mappings.sort_by_key(|m| (m.generated_line, m.generated_column));
        Some(Self {
            sources,
            names: raw.names,
            mappings,
        })
    }

    /// Parse the inline `data:` map at the end of `code`, if any.
    #[must_use]
    pub fn from_inline(code: &str) -> Option<Self> {
        let start = code.rfind(INLINE_MAP_PREFIX)? + INLINE_MAP_PREFIX.len();
        let rest = code[start..].lines().next()?.trim();
        let (_, data) = rest.split_once("base64,")?;
        let bytes = STANDARD.decode(data).ok()?;
        Self::parse(std::str::from_utf8(&bytes).ok()?)
    }

    /// Original position for a 1-based generated position: the closest
    /// mapping on the same line at or before the column.
    #[must_use]
    pub fn original_position_for(&self, line: u32, column: u32) -> Option<OriginalPosition> {
        let line = line.checked_sub(1)?;
        let column = column.saturating_sub(1);
        let end = self
            .mappings
            .partition_point(|m| (m.generated_line, m.generated_column) <= (line, column));
        let mapping = self.mappings[..end]
            .last()
            .filter(|m| m.generated_line == line)?;
        Some(OriginalPosition {
            source: self.sources.get(mapping.source as usize)?.clone(),
            line: mapping.original_line + 1,
            column: mapping.original_column + 1,
            name: mapping
                .name
                .and_then(|n| self.names.get(n as usize).cloned()),
        })
    }

    /// Remap the frames that belong to `file`. Other frames pass through.
    #[must_use]
    pub fn remap_frames(&self, file: &str, frames: &[StackFrame]) -> Vec<StackFrame> {
        frames
            .iter()
            .map(|frame| {
                if frame.file != file {
                    return frame.clone();
                }
                match self.original_position_for(frame.line, frame.column) {
                    Some(pos) => StackFrame {
                        name: pos.name.or_else(|| frame.name.clone()),
                        file: pos.source,
                        line: pos.line,
                        column: pos.column,
                    },
                    None => frame.clone(),
                }
            })
            .collect()
    }
}

fn decode_mappings(mappings: &str) -> Vec<Mapping> {
    let mut result = Vec::new();
    let (mut source, mut original_line, mut original_column, mut name) = (0i64, 0i64, 0i64, 0i64);

    for (generated_line, line) in mappings.split(';').enumerate() {
        let mut generated_column = 0i64;
        for segment in line.split(',').filter(|s| !s.is_empty()) {
            let fields = vlq_decode(segment);
            let Some(first) = fields.first() else {
                continue;
            };
            generated_column += first;
            if fields.len() < 4 {
                continue;
            }
            source += fields[1];
            original_line += fields[2];
            original_column += fields[3];
            let name_index = fields.get(4).map(|delta| {
                name += delta;
                name
            });

            let (Ok(generated_line), Ok(generated_column), Ok(source), Ok(original_line), Ok(original_column)) = (
                u32::try_from(generated_line),
                u32::try_from(generated_column),
                u32::try_from(source),
                u32::try_from(original_line),
                u32::try_from(original_column),
            ) else {
                continue;
            };
            result.push(Mapping {
                generated_line,
                generated_column,
                source,
                original_line,
                original_column,
                name: name_index.and_then(|n| u32::try_from(n).ok()),
            });
        }
    }
    result
}
