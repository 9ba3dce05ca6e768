//! Change model: positions, ranges, the edit sum type and immutable changes.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::CollaboratorId;

/// A location in the document (0-based line, column in characters)
///
/// Field order gives the derived ordering: line first, then column.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Position {
    pub line: u32,
    pub column: u32,
}

impl Position {
    pub fn new(line: u32, column: u32) -> Self {
        Self { line, column }
    }

    /// Position reached after writing `text` starting here
    pub fn advanced_by(self, text: &str) -> Position {
        let mut line = self.line;
        let mut column = self.column;
        for ch in text.chars() {
            if ch == '\n' {
                line += 1;
                column = 0;
            } else {
                column += 1;
            }
        }
        Position { line, column }
    }
}

/// A span between two positions, `from <= to`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Range {
    pub from: Position,
    pub to: Position,
}

impl Range {
    pub fn new(from: Position, to: Position) -> Self {
        Self { from, to }
    }

    /// Zero-width range at a single position
    pub fn point(at: Position) -> Self {
        Self { from: at, to: at }
    }

    /// Convenience constructor for `(line, col)` pairs
    pub fn between(from: (u32, u32), to: (u32, u32)) -> Self {
        Self {
            from: Position::new(from.0, from.1),
            to: Position::new(to.0, to.1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.from == self.to
    }

    pub fn is_inverted(&self) -> bool {
        self.from > self.to
    }
}

/// Kind tag mirrored from [`Edit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Delete,
    Replace,
}

/// One edit against the document text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Edit {
    /// Insert text at a position
    Insert { at: Position, text: String },
    /// Remove a range
    Delete { range: Range },
    /// Replace a range with new text
    Replace { range: Range, text: String },
}

impl Edit {
    pub fn insert(at: Position, text: impl Into<String>) -> Self {
        Edit::Insert {
            at,
            text: text.into(),
        }
    }

    pub fn delete(range: Range) -> Self {
        Edit::Delete { range }
    }

    pub fn replace(range: Range, text: impl Into<String>) -> Self {
        Edit::Replace {
            range,
            text: text.into(),
        }
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Edit::Insert { .. } => ChangeKind::Insert,
            Edit::Delete { .. } => ChangeKind::Delete,
            Edit::Replace { .. } => ChangeKind::Replace,
        }
    }

    /// Range replaced by this edit (zero-width for inserts)
    pub fn range(&self) -> Range {
        match self {
            Edit::Insert { at, .. } => Range::point(*at),
            Edit::Delete { range } => *range,
            Edit::Replace { range, .. } => *range,
        }
    }

    /// Text written by this edit (empty for deletes)
    pub fn text(&self) -> &str {
        match self {
            Edit::Insert { text, .. } => text,
            Edit::Delete { .. } => "",
            Edit::Replace { text, .. } => text,
        }
    }

    /// Neither removes nor writes anything, e.g. a cursor move reported as an edit
    pub fn is_noop(&self) -> bool {
        self.range().is_empty() && self.text().is_empty()
    }

    /// Same kind and text over a different range
    pub fn with_range(&self, range: Range) -> Edit {
        match self {
            Edit::Insert { text, .. } => Edit::Insert {
                at: range.from,
                text: text.clone(),
            },
            Edit::Delete { .. } => Edit::Delete { range },
            Edit::Replace { text, .. } => Edit::Replace {
                range,
                text: text.clone(),
            },
        }
    }

    /// Rebuild an edit from its wire parts, validating the combination
    pub fn from_parts(kind: ChangeKind, range: Range, text: String) -> Result<Edit, String> {
        if range.is_inverted() {
            return Err(format!("range {:?} ends before it starts", range));
        }
        match kind {
            ChangeKind::Insert if !range.is_empty() => {
                Err("insert must have an empty range".to_string())
            }
            ChangeKind::Insert => Ok(Edit::Insert {
                at: range.from,
                text,
            }),
            ChangeKind::Delete if !text.is_empty() => {
                Err("delete must not carry text".to_string())
            }
            ChangeKind::Delete => Ok(Edit::Delete { range }),
            ChangeKind::Replace => Ok(Edit::Replace { range, text }),
        }
    }
}

/// An edit tagged with its author and the version it was computed against
///
/// Immutable once created; transforms go through [`Change::rebased`], which
/// keeps the identity fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    id: Uuid,
    edit: Edit,
    origin: CollaboratorId,
    timestamp: i64,
    base_version: u64,
}

impl Change {
    pub fn new(edit: Edit, origin: impl Into<String>, base_version: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            edit,
            origin: origin.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            base_version,
        }
    }

    /// Reassemble a change received from elsewhere
    pub fn from_parts(
        id: Uuid,
        edit: Edit,
        origin: impl Into<String>,
        timestamp: i64,
        base_version: u64,
    ) -> Self {
        Self {
            id,
            edit,
            origin: origin.into(),
            timestamp,
            base_version,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn edit(&self) -> &Edit {
        &self.edit
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn base_version(&self) -> u64 {
        self.base_version
    }

    pub fn kind(&self) -> ChangeKind {
        self.edit.kind()
    }

    pub fn range(&self) -> Range {
        self.edit.range()
    }

    pub fn text(&self) -> &str {
        self.edit.text()
    }

    pub fn is_noop(&self) -> bool {
        self.edit.is_noop()
    }

    /// Where the written text ends once this change is applied
    pub fn end_after_apply(&self) -> Position {
        self.range().from.advanced_by(self.text())
    }

    /// The same change moved to another range
    pub fn rebased(&self, range: Range) -> Change {
        Change {
            id: self.id,
            edit: self.edit.with_range(range),
            origin: self.origin.clone(),
            timestamp: self.timestamp,
            base_version: self.base_version,
        }
    }

    /// Whether two changes perform the same edit
    pub fn same_edit(&self, other: &Change) -> bool {
        self.edit == other.edit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_ordering() {
        assert!(Position::new(1, 9) < Position::new(2, 0));
        assert!(Position::new(2, 3) < Position::new(2, 4));
        assert_eq!(Position::new(2, 4), Position::new(2, 4));
    }

    #[test]
    fn test_advanced_by_multiline() {
        let start = Position::new(3, 5);
        assert_eq!(start.advanced_by("abc"), Position::new(3, 8));
        assert_eq!(start.advanced_by("ab\ncd"), Position::new(4, 2));
        assert_eq!(start.advanced_by("\n"), Position::new(4, 0));
        assert_eq!(start.advanced_by(""), start);
    }

    #[test]
    fn test_edit_accessors() {
        let insert = Edit::insert(Position::new(0, 11), "!");
        assert_eq!(insert.kind(), ChangeKind::Insert);
        assert!(insert.range().is_empty());
        assert_eq!(insert.text(), "!");

        let delete = Edit::delete(Range::between((0, 6), (0, 11)));
        assert_eq!(delete.kind(), ChangeKind::Delete);
        assert_eq!(delete.text(), "");
        assert!(!delete.is_noop());
    }

    #[test]
    fn test_noop_detection() {
        assert!(Edit::insert(Position::new(2, 2), "").is_noop());
        assert!(Edit::delete(Range::point(Position::new(1, 1))).is_noop());
        assert!(Edit::replace(Range::point(Position::new(0, 0)), "").is_noop());
        assert!(!Edit::replace(Range::point(Position::new(0, 0)), "x").is_noop());
    }

    #[test]
    fn test_from_parts_validation() {
        let range = Range::between((0, 1), (0, 4));
        assert!(Edit::from_parts(ChangeKind::Insert, range, "x".into()).is_err());
        assert!(Edit::from_parts(ChangeKind::Delete, range, "x".into()).is_err());
        assert!(Edit::from_parts(ChangeKind::Replace, Range::between((1, 0), (0, 0)), "".into()).is_err());

        let edit = Edit::from_parts(ChangeKind::Delete, range, String::new()).unwrap();
        assert_eq!(edit, Edit::delete(range));
    }

    #[test]
    fn test_rebased_keeps_identity() {
        let change = Change::new(Edit::insert(Position::new(0, 3), "hi"), "alice", 4);
        let moved = change.rebased(Range::point(Position::new(2, 0)));

        assert_eq!(moved.id(), change.id());
        assert_eq!(moved.origin(), "alice");
        assert_eq!(moved.base_version(), 4);
        assert_eq!(moved.range().from, Position::new(2, 0));
        assert_eq!(moved.text(), "hi");
    }

    #[test]
    fn test_end_after_apply() {
        let change = Change::new(
            Edit::replace(Range::between((1, 2), (3, 0)), "x\nyz"),
            "bob",
            0,
        );
        assert_eq!(change.end_after_apply(), Position::new(2, 2));
    }
}
