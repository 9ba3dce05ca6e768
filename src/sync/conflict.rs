//! Conflict resolution between a local and a remote change.
//!
//! The policy is deliberately simple: identical edits collapse, overlapping
//! ranges go to the user, everything else is merged by shifting the later
//! change past the earlier one. There is no character-level interleaving.

use std::cmp::Ordering;

use tracing::debug;
use uuid::Uuid;

use super::change::{Change, Position, Range};

/// Outcome of comparing two concurrent changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Both sides made the same edit; the remote one is already reflected locally
    AcceptRemote,
    /// Non-overlapping; apply both in document order
    Merge(MergePlan),
    /// Overlapping; a human has to decide
    UserChoice,
}

impl Resolution {
    pub fn name(&self) -> &'static str {
        match self {
            Resolution::AcceptRemote => "accept-remote",
            Resolution::Merge(_) => "merge",
            Resolution::UserChoice => "user-choice",
        }
    }
}

/// Two changes ordered by position, the second already shifted past the first
///
/// Applying `first` then `second` to the common base text yields the merged
/// text on every replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePlan {
    first: Change,
    second: Change,
}

impl MergePlan {
    pub fn first(&self) -> &Change {
        &self.first
    }

    pub fn second(&self) -> &Change {
        &self.second
    }

    /// Both changes in application order
    pub fn ordered(&self) -> [&Change; 2] {
        [&self.first, &self.second]
    }

    /// The plan's version of change `id`, as it applies after the other one
    pub fn member(&self, id: Uuid) -> Option<&Change> {
        [&self.first, &self.second].into_iter().find(|c| c.id() == id)
    }

    /// What a replica that already applied change `id` still has to apply
    pub fn counterpart(&self, id: Uuid) -> Option<&Change> {
        if self.first.id() == id {
            Some(&self.second)
        } else if self.second.id() == id {
            Some(&self.first)
        } else {
            None
        }
    }
}

/// A detected conflict between a pending local change and a remote one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    pub local: Change,
    pub remote: Change,
    pub outcome: Resolution,
}

impl Conflict {
    pub fn detect(local: Change, remote: Change) -> Self {
        let outcome = resolve(&local, &remote);
        Self {
            local,
            remote,
            outcome,
        }
    }
}

/// Whether two ranges overlap.
///
/// Line spans are compared first; ranges on disjoint lines never overlap.
/// When the line spans meet, the character spans decide with half-open
/// semantics, so a range ending where another starts does not overlap it and
/// an insertion point only overlaps a range strictly containing it.
pub fn ranges_overlap(a: &Range, b: &Range) -> bool {
    if a.to.line < b.from.line || b.to.line < a.from.line {
        return false;
    }
    a.from < b.to && b.from < a.to
}

/// Decide how a remote change combines with a concurrent local one
pub fn resolve(local: &Change, remote: &Change) -> Resolution {
    if local.same_edit(remote) {
        debug!(local = %local.id(), remote = %remote.id(), "identical concurrent edits");
        return Resolution::AcceptRemote;
    }

    if ranges_overlap(&local.range(), &remote.range()) {
        debug!(local = %local.id(), remote = %remote.id(), "overlapping edits need a decision");
        return Resolution::UserChoice;
    }

    let (first, second) = match order(local, remote) {
        Ordering::Greater => (remote, local),
        _ => (local, remote),
    };

    let range = second.range();
    let shifted = Range::new(shift_past(first, range.from), shift_past(first, range.to));

    Resolution::Merge(MergePlan {
        first: first.clone(),
        second: second.rebased(shifted),
    })
}

/// Deterministic document order: by range, then origin, then id
fn order(a: &Change, b: &Change) -> Ordering {
    let (ra, rb) = (a.range(), b.range());
    (ra.from, ra.to)
        .cmp(&(rb.from, rb.to))
        .then_with(|| a.origin().cmp(b.origin()))
        .then_with(|| a.id().cmp(&b.id()))
}

/// Map a position at or after `earlier`'s range into the text after `earlier` is applied.
///
/// Positions on the earlier change's end line move by its column delta;
/// positions on later lines move by its line delta only.
pub fn shift_past(earlier: &Change, at: Position) -> Position {
    let end = earlier.range().to;
    if at < end {
        return at;
    }
    let written_end = earlier.end_after_apply();
    if at.line == end.line {
        Position::new(written_end.line, written_end.column + (at.column - end.column))
    } else {
        let line = at.line as i64 + written_end.line as i64 - end.line as i64;
        Position::new(line.max(0) as u32, at.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::change::Edit;
    use crate::sync::document::{Document, TextBuffer};

    fn change(edit: Edit, origin: &str) -> Change {
        Change::new(edit, origin, 5)
    }

    /// Apply `own` then whatever the plan says the other side still needs
    fn replica(base: &str, own: &Change, plan: &MergePlan) -> String {
        let mut buffer = TextBuffer::new(base);
        buffer.apply_change(own).unwrap();
        buffer.apply_change(plan.counterpart(own.id()).unwrap()).unwrap();
        buffer.text().to_string()
    }

    #[test]
    fn test_line_overlap() {
        let a = Range::between((2, 0), (5, 0));
        let b = Range::between((4, 0), (7, 0));
        assert!(ranges_overlap(&a, &b));
        assert!(ranges_overlap(&b, &a));

        let a = Range::between((2, 0), (3, 0));
        let b = Range::between((5, 0), (7, 0));
        assert!(!ranges_overlap(&a, &b));
        assert!(!ranges_overlap(&b, &a));
    }

    #[test]
    fn test_boundary_is_not_overlap() {
        let delete = Range::between((0, 6), (0, 11));
        let insert = Range::point(Position::new(0, 11));
        assert!(!ranges_overlap(&delete, &insert));
        assert!(!ranges_overlap(&insert, &delete));

        let inside = Range::point(Position::new(0, 8));
        assert!(ranges_overlap(&delete, &inside));
    }

    #[test]
    fn test_hello_world_merge() {
        let base = "Hello World";
        let mut doc = Document::with_version("doc", 5);

        let a = change(Edit::insert(Position::new(0, 11), "!"), "client-a");
        let b = change(Edit::delete(Range::between((0, 6), (0, 11))), "client-b");

        let plan = match resolve(&a, &b) {
            Resolution::Merge(plan) => plan,
            other => panic!("expected merge, got {}", other.name()),
        };

        // delete sorts first; the insert moves to where "World" used to start
        assert_eq!(plan.first().id(), b.id());
        assert_eq!(plan.second().range(), Range::point(Position::new(0, 6)));

        let mut buffer = TextBuffer::new(base);
        for c in plan.ordered() {
            buffer.apply_change(c).unwrap();
            doc.advance();
        }
        assert_eq!(buffer.text(), "Hello !");
        assert_eq!(doc.version(), 7);

        assert_eq!(replica(base, &a, &plan), "Hello !");
        assert_eq!(replica(base, &b, &plan), "Hello !");
    }

    #[test]
    fn test_hello_world_user_choice() {
        let a = change(Edit::replace(Range::between((0, 0), (0, 5)), "Hi"), "client-a");
        let b = change(Edit::replace(Range::between((0, 0), (0, 11)), "Greetings"), "client-b");

        assert_eq!(resolve(&a, &b), Resolution::UserChoice);
        assert_eq!(resolve(&b, &a), Resolution::UserChoice);

        let conflict = Conflict::detect(a.clone(), b);
        assert_eq!(conflict.outcome, Resolution::UserChoice);
        assert_eq!(conflict.local, a);
    }

    #[test]
    fn test_identical_edits_accept_remote() {
        let a = change(Edit::insert(Position::new(0, 0), "x"), "client-a");
        let b = change(Edit::insert(Position::new(0, 0), "x"), "client-b");
        assert_eq!(resolve(&a, &b), Resolution::AcceptRemote);
    }

    #[test]
    fn test_merge_is_symmetric() {
        let a = change(Edit::insert(Position::new(0, 0), "A"), "client-a");
        let b = change(Edit::insert(Position::new(0, 0), "B"), "client-b");

        let left = resolve(&a, &b);
        let right = resolve(&b, &a);
        assert_eq!(left, right);
    }

    #[test]
    fn test_convergence_table() {
        let base = "alpha\nbeta gamma\ndelta";
        let cases = vec![
            // same line, disjoint
            (
                Edit::insert(Position::new(1, 0), ">> "),
                Edit::delete(Range::between((1, 5), (1, 10))),
            ),
            // earlier change adds lines
            (
                Edit::insert(Position::new(0, 5), "\nnew line"),
                Edit::replace(Range::between((2, 0), (2, 5)), "DELTA"),
            ),
            // earlier change removes a line break, later sits on its end line
            (
                Edit::delete(Range::between((0, 3), (1, 2))),
                Edit::insert(Position::new(1, 4), "!"),
            ),
            // later change on a following line after a multi-line replace
            (
                Edit::replace(Range::between((0, 0), (1, 4)), "x\ny\nz"),
                Edit::delete(Range::between((2, 1), (2, 3))),
            ),
            // concurrent inserts at the same point
            (
                Edit::insert(Position::new(2, 5), " end"),
                Edit::insert(Position::new(2, 5), " fin"),
            ),
        ];

        for (edit_a, edit_b) in cases {
            let a = change(edit_a, "client-a");
            let b = change(edit_b, "client-b");
            let plan = match resolve(&a, &b) {
                Resolution::Merge(plan) => plan,
                other => panic!("expected merge, got {}", other.name()),
            };

            let mut in_order = TextBuffer::new(base);
            for c in plan.ordered() {
                in_order.apply_change(c).unwrap();
            }

            assert_eq!(replica(base, &a, &plan), in_order.text());
            assert_eq!(replica(base, &b, &plan), in_order.text());
        }
    }

    #[test]
    fn test_shift_past_positions() {
        let earlier = change(Edit::replace(Range::between((1, 2), (2, 4)), "ab\ncdef"), "x");

        // before the earlier change's end: untouched
        assert_eq!(shift_past(&earlier, Position::new(1, 0)), Position::new(1, 0));
        // same line as the end
        assert_eq!(shift_past(&earlier, Position::new(2, 6)), Position::new(2, 6));
        // later lines keep their column
        assert_eq!(shift_past(&earlier, Position::new(5, 3)), Position::new(5, 3));

        let joined = change(Edit::delete(Range::between((0, 3), (2, 1))), "y");
        assert_eq!(shift_past(&joined, Position::new(2, 4)), Position::new(0, 6));
        assert_eq!(shift_past(&joined, Position::new(4, 2)), Position::new(2, 2));
    }
}
