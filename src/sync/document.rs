//! Document version tracking and the line/column text model.
//!
//! `Document` is the client's view of the shared document: its id and the
//! version counter that advances by exactly one per applied change.
//! `TextBuffer` holds text addressed by [`Position`] and is used for the
//! relay's authoritative copy and the in-memory editor surface.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::change::{Change, Position, Range};
use super::DocumentId;

/// Errors raised when a change does not map onto the current text
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("Position {line}:{column} is outside the document ({lines} lines)")]
    OutOfBounds { line: u32, column: u32, lines: usize },

    #[error("Range ends before it starts")]
    InvertedRange,
}

/// Identity and version of the shared document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    id: DocumentId,
    version: u64,
}

impl Document {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: 0,
        }
    }

    pub fn with_version(id: impl Into<String>, version: u64) -> Self {
        Self {
            id: id.into(),
            version,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Record one applied change
    pub fn advance(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Adopt a version reported by the relay without ever going backwards
    pub fn adopt(&mut self, version: u64) -> u64 {
        self.version = self.version.max(version);
        self.version
    }
}

/// Plain text addressed by line and column
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn line_count(&self) -> usize {
        self.text.split('\n').count()
    }

    /// Position just past the last character
    pub fn end_position(&self) -> Position {
        Position::default().advanced_by(&self.text)
    }

    /// Range covering the whole text
    pub fn full_range(&self) -> Range {
        Range::new(Position::default(), self.end_position())
    }

    /// Byte offset of a position, if it exists in the text
    pub fn offset_of(&self, at: Position) -> Result<usize, ApplyError> {
        let out_of_bounds = || ApplyError::OutOfBounds {
            line: at.line,
            column: at.column,
            lines: self.line_count(),
        };

        let mut line_start = 0usize;
        for (index, line) in self.text.split('\n').enumerate() {
            if index as u32 == at.line {
                let column = at.column as usize;
                if column == 0 {
                    return Ok(line_start);
                }
                return match line.char_indices().nth(column) {
                    Some((byte, _)) => Ok(line_start + byte),
                    None if line.chars().count() == column => Ok(line_start + line.len()),
                    None => Err(out_of_bounds()),
                };
            }
            line_start += line.len() + 1;
        }
        Err(out_of_bounds())
    }

    /// Replace `range` with `text`
    pub fn apply(&mut self, range: Range, text: &str) -> Result<(), ApplyError> {
        if range.is_inverted() {
            return Err(ApplyError::InvertedRange);
        }
        let start = self.offset_of(range.from)?;
        let end = self.offset_of(range.to)?;
        self.text.replace_range(start..end, text);
        Ok(())
    }

    pub fn apply_change(&mut self, change: &Change) -> Result<(), ApplyError> {
        self.apply(change.range(), change.text())
    }

    /// Text inside a range
    pub fn slice(&self, range: Range) -> Result<&str, ApplyError> {
        if range.is_inverted() {
            return Err(ApplyError::InvertedRange);
        }
        let start = self.offset_of(range.from)?;
        let end = self.offset_of(range.to)?;
        Ok(&self.text[start..end])
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
    }
}
