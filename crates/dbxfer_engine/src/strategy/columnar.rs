//! Sectioned text format used for columnar dumps.
//!
//! ```text
//! file    := header NL section*
//! header  := "# dbxfer-columnar v1"
//! section := marker NL body
//! marker  := "-- dbxfer:" kind SP "table=" name SP "lines=" count
//! kind    := "schema" | "data"
//! body    := exactly <count> lines
//! ```
//!
//! Every section announces its length, so a data row that happens to start with
//! `-- dbxfer:` is read as body, never as a marker. A table's schema section must
//! come before its data section.

use std::collections::BTreeMap;

use crate::error::EngineError;
use crate::identifier::validate_name;

pub const COLUMNAR_HEADER: &str = "# dbxfer-columnar v1";
pub const MARKER_PREFIX: &str = "-- dbxfer:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    Schema,
    Data,
}

impl SectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SectionKind::Schema => "schema",
            SectionKind::Data => "data",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub kind: SectionKind,
    pub table: String,
    pub lines: usize,
}

impl Marker {
    pub fn parse(text: &str) -> Result<Self, EngineError> {
        let malformed = || EngineError::Format(format!("malformed section marker {text:?}"));
        let rest = text.strip_prefix(MARKER_PREFIX).ok_or_else(malformed)?;
        let mut fields = rest.split(' ');
        let kind = match fields.next() {
            Some("schema") => SectionKind::Schema,
            Some("data") => SectionKind::Data,
            _ => return Err(malformed()),
        };
        let table = fields
            .next()
            .and_then(|field| field.strip_prefix("table="))
            .ok_or_else(malformed)?;
        let lines = fields
            .next()
            .and_then(|field| field.strip_prefix("lines="))
            .and_then(|count| count.parse::<usize>().ok())
            .ok_or_else(malformed)?;
        if fields.next().is_some() {
            return Err(malformed());
        }
        validate_name("table", table)?;
        Ok(Self {
            kind,
            table: table.to_string(),
            lines,
        })
    }
}

/// 1-based inclusive line span inside the dump file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineRange {
    pub first: usize,
    pub count: usize,
}

impl LineRange {
    pub fn last(&self) -> usize {
        self.first + self.count.saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `sed -n` address for the span.
    pub fn sed_address(&self) -> String {
        format!("{},{}p", self.first, self.last())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSections {
    pub table: String,
    pub schema: LineRange,
    pub data: Option<LineRange>,
}

/// Walks the marker index of a dump and returns its tables in file order.
///
/// `index` is `grep -n '^-- dbxfer:'` output (`<line>:<marker>` per line) and
/// `total_lines` the file's line count. Index entries that fall inside a section
/// body are ignored.
pub fn plan_restore(index: &str, total_lines: usize) -> Result<Vec<TableSections>, EngineError> {
    let mut markers = BTreeMap::new();
    for entry in index.lines().filter(|entry| !entry.trim().is_empty()) {
        let (line, text) = entry
            .split_once(':')
            .ok_or_else(|| EngineError::Format(format!("malformed index entry {entry:?}")))?;
        let line = line
            .trim()
            .parse::<usize>()
            .map_err(|_| EngineError::Format(format!("malformed index entry {entry:?}")))?;
        markers.insert(line, text);
    }

    let mut tables: Vec<TableSections> = Vec::new();
    let mut cursor = 2;
    while cursor <= total_lines {
        let text = markers.get(&cursor).ok_or_else(|| {
            EngineError::Format(format!("expected a section marker at line {cursor}"))
        })?;
        let marker = Marker::parse(text)?;
        let body = LineRange {
            first: cursor + 1,
            count: marker.lines,
        };
        cursor = body.first + body.count;
        if cursor - 1 > total_lines {
            return Err(EngineError::Format(format!(
                "{} section of {} runs past the end of the file",
                marker.kind.as_str(),
                marker.table
            )));
        }

        let existing = tables.iter_mut().find(|entry| entry.table == marker.table);
        match (marker.kind, existing) {
            (SectionKind::Schema, Some(_)) => {
                return Err(EngineError::Format(format!(
                    "table {} has more than one schema section",
                    marker.table
                )))
            }
            (SectionKind::Schema, None) => {
                if body.is_empty() {
                    return Err(EngineError::Format(format!(
                        "table {} has an empty schema section",
                        marker.table
                    )));
                }
                tables.push(TableSections {
                    table: marker.table,
                    schema: body,
                    data: None,
                });
            }
            (SectionKind::Data, None) => {
                return Err(EngineError::Format(format!(
                    "data section of {} comes before its schema",
                    marker.table
                )))
            }
            (SectionKind::Data, Some(entry)) => {
                if entry.data.is_some() {
                    return Err(EngineError::Format(format!(
                        "table {} has more than one data section",
                        marker.table
                    )));
                }
                entry.data = Some(body);
            }
        }
    }
    Ok(tables)
}
