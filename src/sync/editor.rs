//! Seam between the coordinator and whatever renders the text.
//!
//! Real editors emit change events for every modification, including the ones
//! the coordinator makes while applying remote changes. Those must not be sent
//! back to the relay, so remote applications run inside an [`ApplyScope`] and
//! the [`EditReporter`] drops anything reported while a scope is open.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

use super::change::{Change, Edit};
use super::document::{ApplyError, TextBuffer};

/// What the coordinator needs from an editor
pub trait EditorSurface: Send {
    /// Apply a change that did not originate in this editor
    fn apply_change(&mut self, change: &Change) -> Result<(), ApplyError>;

    /// Current full text
    fn text(&self) -> String;

    /// Replace the whole text (resync)
    fn load(&mut self, text: &str);

    /// Hook the editor's change events up to the coordinator
    fn attach_reporter(&mut self, _reporter: EditReporter) {}
}

/// Re-entrancy flag shared between the coordinator and the reporter
#[derive(Debug, Clone, Default)]
pub struct ApplyGuard {
    held: Arc<AtomicBool>,
}

impl ApplyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold the guard until the returned scope is dropped
    pub fn enter(&self) -> ApplyScope {
        self.held.store(true, Ordering::SeqCst);
        ApplyScope {
            held: self.held.clone(),
        }
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::SeqCst)
    }
}

/// Releases the guard on drop, including on early return or unwind
#[must_use = "the guard is released as soon as the scope is dropped"]
pub struct ApplyScope {
    held: Arc<AtomicBool>,
}

impl Drop for ApplyScope {
    fn drop(&mut self) {
        self.held.store(false, Ordering::SeqCst);
    }
}

/// Forwards user edits to the coordinator
#[derive(Debug, Clone)]
pub struct EditReporter {
    guard: ApplyGuard,
    tx: mpsc::UnboundedSender<Edit>,
}

impl EditReporter {
    pub fn new(guard: ApplyGuard) -> (Self, mpsc::UnboundedReceiver<Edit>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { guard, tx }, rx)
    }

    /// Returns false if the edit was dropped
    pub fn report(&self, edit: Edit) -> bool {
        if self.guard.is_held() {
            trace!(?edit, "edit produced by a remote apply, not reported");
            return false;
        }
        self.tx.send(edit).is_ok()
    }
}

#[derive(Debug, Default)]
struct SurfaceInner {
    buffer: TextBuffer,
    reporter: Option<EditReporter>,
}

/// In-memory editor backed by a [`TextBuffer`].
///
/// Clones share the same text, so a UI (or a test) can keep one clone to type
/// into while the coordinator owns another. Every modification is reported,
/// like a real editor's change listener would.
#[derive(Debug, Clone, Default)]
pub struct BufferSurface {
    inner: Arc<Mutex<SurfaceInner>>,
}

impl BufferSurface {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SurfaceInner {
                buffer: TextBuffer::new(text),
                reporter: None,
            })),
        }
    }

    /// A user typed something
    pub fn user_edit(&self, edit: Edit) -> Result<(), ApplyError> {
        let reporter = {
            let mut inner = self.inner.lock();
            inner.buffer.apply(edit.range(), edit.text())?;
            inner.reporter.clone()
        };
        if let Some(reporter) = reporter {
            reporter.report(edit);
        }
        Ok(())
    }

    pub fn snapshot(&self) -> TextBuffer {
        self.inner.lock().buffer.clone()
    }
}

impl EditorSurface for BufferSurface {
    fn apply_change(&mut self, change: &Change) -> Result<(), ApplyError> {
        let reporter = {
            let mut inner = self.inner.lock();
            inner.buffer.apply_change(change)?;
            inner.reporter.clone()
        };
        if let Some(reporter) = reporter {
            reporter.report(change.edit().clone());
        }
        Ok(())
    }

    fn text(&self) -> String {
        self.inner.lock().buffer.text().to_string()
    }

    fn load(&mut self, text: &str) {
        let reporter = {
            let mut inner = self.inner.lock();
            let range = inner.buffer.full_range();
            inner.buffer.set_text(text);
            inner.reporter.clone().map(|r| (r, range))
        };
        if let Some((reporter, range)) = reporter {
            reporter.report(Edit::replace(range, text));
        }
    }

    fn attach_reporter(&mut self, reporter: EditReporter) {
        self.inner.lock().reporter = Some(reporter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::change::{Position, Range};

    #[test]
    fn test_scope_releases_guard() {
        let guard = ApplyGuard::new();
        {
            let _scope = guard.enter();
            assert!(guard.is_held());
        }
        assert!(!guard.is_held());
    }

    #[test]
    fn test_scope_releases_on_early_return() {
        fn failing_apply(guard: &ApplyGuard) -> Result<(), ApplyError> {
            let _scope = guard.enter();
            let mut buffer = TextBuffer::new("x");
            buffer.apply(Range::between((0, 1), (0, 0)), "")?;
            Ok(())
        }

        let guard = ApplyGuard::new();
        assert!(failing_apply(&guard).is_err());
        assert!(!guard.is_held());
    }

    #[test]
    fn test_reporter_drops_edits_under_guard() {
        let guard = ApplyGuard::new();
        let (reporter, mut rx) = EditReporter::new(guard.clone());

        assert!(reporter.report(Edit::insert(Position::new(0, 0), "a")));
        {
            let _scope = guard.enter();
            assert!(!reporter.report(Edit::insert(Position::new(0, 0), "b")));
        }

        assert_eq!(rx.try_recv().unwrap().text(), "a");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_buffer_surface_reports_user_edits() {
        let guard = ApplyGuard::new();
        let (reporter, mut rx) = EditReporter::new(guard.clone());
        let mut surface = BufferSurface::new("Hello");
        surface.attach_reporter(reporter);

        let typing = surface.clone();
        typing
            .user_edit(Edit::insert(Position::new(0, 5), " World"))
            .unwrap();
        assert_eq!(surface.text(), "Hello World");
        assert!(rx.try_recv().is_ok());

        let remote = Change::new(Edit::insert(Position::new(0, 0), ">"), "bob", 1);
        {
            let _scope = guard.enter();
            surface.apply_change(&remote).unwrap();
            surface.load("reloaded");
        }
        assert_eq!(typing.text(), "reloaded");
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_user_edit_is_not_reported() {
        let guard = ApplyGuard::new();
        let (reporter, mut rx) = EditReporter::new(guard);
        let mut surface = BufferSurface::new("abc");
        surface.attach_reporter(reporter);

        assert!(surface
            .user_edit(Edit::insert(Position::new(3, 0), "x"))
            .is_err());
        assert!(rx.try_recv().is_err());
    }
}
