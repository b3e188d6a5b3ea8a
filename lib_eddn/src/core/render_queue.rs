//! # Render Queue
//!
//! Frame-paced batcher between the router and a display surface. Arrivals
//! are queued, bounded by `list_length · cull_factor` with oldest-first
//! culling, and flushed to the owning [`RowContainer`] at most once per
//! frame. Rows are prepended newest-first and the container is trimmed back
//! to `list_length` after every flush. While paused nothing touches the
//! container; resuming schedules a flush if anything is waiting.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::event::NormalizedEvent;
use crate::core::frame_clock::FrameClock;
use crate::core::router::{Handler, Router};

/// Lazy cell descriptors may nest this deep before the entry is dropped.
const MAX_CELL_DEPTH: usize = 10;

/// One cell of a row, before resolution. `Lazy` defers the work to flush
/// time and may itself yield another descriptor.
#[derive(Clone)]
pub enum CellSpec {
    Text(String),
    Styled { text: String, class: String },
    Lazy(Arc<dyn Fn() -> CellSpec + Send + Sync>),
}

impl CellSpec {
    pub fn text(text: impl Into<String>) -> Self {
        CellSpec::Text(text.into())
    }

    pub fn styled(text: impl Into<String>, class: impl Into<String>) -> Self {
        CellSpec::Styled {
            text: text.into(),
            class: class.into(),
        }
    }
}

/// The cells of one queued entry: either already listed, or produced on
/// demand when the entry is actually rendered.
pub enum CellSource {
    Cells(Vec<CellSpec>),
    Lazy(Box<dyn FnOnce() -> Vec<CellSpec> + Send>),
}

/// A queued arrival: the shared event plus how to render it.
pub struct RenderEntry {
    pub event: Arc<NormalizedEvent>,
    pub cells: CellSource,
}

/// A fully resolved cell as handed to the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowCell {
    pub text: String,
    pub class: Option<String>,
}

/// A resolved row. `id` keys the payload index while the row lives in the
/// container; `classes` carry the row predicates (`data`, the game type,
/// `taxi`/`multicrew`/`old`/`new`).
#[derive(Debug, Clone)]
pub struct Row {
    pub id: u64,
    pub classes: Vec<String>,
    pub cells: Vec<RowCell>,
}

/// The display surface a queue owns. Exactly one queue mutates a container.
/// `prepend` inserts the given rows at the head, preserving their order;
/// `clear` and `trim_tail` report the ids of the rows they removed so the
/// payload index can forget them.
pub trait RowContainer: Send {
    fn child_count(&self) -> usize;
    fn clear(&mut self) -> Vec<u64>;
    fn prepend(&mut self, rows: Vec<Row>);
    fn trim_tail(&mut self, n: usize) -> Vec<u64>;
}

#[derive(Debug, Clone, Copy)]
pub struct RenderQueueOptions {
    /// Maximum rows kept in the container.
    pub list_length: usize,
    /// Queue capacity as a multiple of `list_length`.
    pub cull_factor: usize,
    /// Events older than this (ms) get the `old` row class.
    pub old_threshold_ms: i64,
    /// Events from further in the future than this (ms) get `new`.
    pub new_threshold_ms: i64,
}

impl Default for RenderQueueOptions {
    fn default() -> Self {
        Self {
            list_length: 20,
            cull_factor: 2,
            old_threshold_ms: 3_600_000,
            new_threshold_ms: -180_000,
        }
    }
}

#[derive(Debug, Error)]
enum RenderError {
    #[error("cell descriptor nested deeper than {MAX_CELL_DEPTH}")]
    RecursionExceeded,
    #[error("cell callback panicked")]
    CellPanic,
}

struct QueueInner {
    opts: RenderQueueOptions,
    clock: Arc<dyn FrameClock>,
    container: Mutex<Box<dyn RowContainer>>,
    queue: Mutex<Vec<RenderEntry>>,
    payloads: Mutex<HashMap<u64, Arc<NormalizedEvent>>>,
    paused: AtomicBool,
    scheduled: AtomicBool,
    next_row_id: AtomicU64,
}

pub struct RenderQueue {
    inner: Arc<QueueInner>,
}

impl Clone for RenderQueue {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl RenderQueue {
    pub fn new(
        opts: RenderQueueOptions,
        clock: Arc<dyn FrameClock>,
        container: Box<dyn RowContainer>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                opts,
                clock,
                container: Mutex::new(container),
                queue: Mutex::new(Vec::new()),
                payloads: Mutex::new(HashMap::new()),
                paused: AtomicBool::new(false),
                scheduled: AtomicBool::new(false),
                next_row_id: AtomicU64::new(1),
            }),
        }
    }

    /// Queues an entry and schedules a flush unless paused. When the queue
    /// overflows `list_length · cull_factor` the oldest entries are culled
    /// down to `list_length`; the return value is how many were dropped.
    pub fn add_row(&self, entry: RenderEntry) -> usize {
        let dropped = {
            let mut queue = self.inner.queue.lock().expect("RenderQueue lock poisoned");
            queue.push(entry);
            // A cull factor below 1 would make the queue smaller than the
            // list it feeds; treat it as 1.
            let capacity = self.inner.opts.list_length * self.inner.opts.cull_factor.max(1);
            if queue.len() > capacity {
                let excess = queue.len().saturating_sub(self.inner.opts.list_length);
                queue.drain(..excess);
                excess
            } else {
                0
            }
        };

        if !self.inner.paused.load(Ordering::SeqCst) {
            self.schedule();
        }
        dropped
    }

    pub fn is_paused(&self) -> bool {
        self.inner.paused.load(Ordering::SeqCst)
    }

    /// Pausing stops container writes; queued and newly added entries keep
    /// accumulating (and culling). Resuming schedules a flush if the queue
    /// is non-empty.
    pub fn set_paused(&self, paused: bool) {
        self.inner.paused.store(paused, Ordering::SeqCst);
        if !paused {
            let pending = !self
                .inner
                .queue
                .lock()
                .expect("RenderQueue lock poisoned")
                .is_empty();
            if pending {
                self.schedule();
            }
        }
    }

    /// Subscribes this queue to the router: each matching event is formatted
    /// and queued. The returned handler is the unregistration key.
    pub fn subscribe<F>(&self, router: &Router, topics: &[&str], formatter: F) -> Handler
    where
        F: Fn(&Arc<NormalizedEvent>) -> CellSource + Send + Sync + 'static,
    {
        let queue = self.clone();
        let handler: Handler = Arc::new(move |event: &Arc<NormalizedEvent>| {
            queue.add_row(RenderEntry {
                event: Arc::clone(event),
                cells: formatter(event),
            });
        });
        router.register(topics.iter().copied(), &handler);
        handler
    }

    /// The event behind a rendered row, while the row is in the container.
    pub fn payload_for(&self, row_id: u64) -> Option<Arc<NormalizedEvent>> {
        self.inner
            .payloads
            .lock()
            .expect("RenderQueue lock poisoned")
            .get(&row_id)
            .cloned()
    }

    /// At most one flush is in flight per frame: the flag is set here and
    /// cleared at the top of the frame callback.
    fn schedule(&self) {
        if self.inner.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        let queue = self.clone();
        self.inner.clock.request_frame(Box::new(move || {
            queue.inner.scheduled.store(false, Ordering::SeqCst);
            queue.flush();
        }));
    }

    fn flush(&self) {
        if self.inner.paused.load(Ordering::SeqCst) {
            return;
        }

        let list_length = self.inner.opts.list_length;
        let mut entries = {
            let mut queue = self.inner.queue.lock().expect("RenderQueue lock poisoned");
            std::mem::take(&mut *queue)
        };
        if entries.is_empty() {
            return;
        }

        let mut container = self
            .inner
            .container
            .lock()
            .expect("RenderQueue lock poisoned");
        let mut payloads = self
            .inner
            .payloads
            .lock()
            .expect("RenderQueue lock poisoned");

        // The batch alone would replace the whole list: start from an empty
        // container and only render the newest list_length entries.
        if entries.len() >= list_length {
            for id in container.clear() {
                payloads.remove(&id);
            }
            let excess = entries.len() - list_length;
            entries.drain(..excess);
        }

        let mut drop_count = container.child_count() as isize + entries.len() as isize
            - list_length as isize;

        // Newest first.
        let mut rows = Vec::with_capacity(entries.len());
        for entry in entries.into_iter().rev() {
            match resolve_cells(entry.cells) {
                Ok(cells) => {
                    let id = self.inner.next_row_id.fetch_add(1, Ordering::Relaxed);
                    rows.push(Row {
                        id,
                        classes: self.row_classes(&entry.event),
                        cells,
                    });
                    payloads.insert(id, entry.event);
                }
                Err(err) => {
                    drop_count -= 1;
                    log::warn!(
                        "Dropping {} row from the render batch: {err}",
                        entry.event.event_type()
                    );
                }
            }
        }

        container.prepend(rows);
        if drop_count > 0 {
            for id in container.trim_tail(drop_count as usize) {
                payloads.remove(&id);
            }
        }
    }

    fn row_classes(&self, event: &NormalizedEvent) -> Vec<String> {
        let mut classes = vec![
            "data".to_string(),
            event.game_type().as_str().to_lowercase(),
        ];
        if event.is_taxi() {
            classes.push("taxi".to_string());
        }
        if event.is_multicrew() {
            classes.push("multicrew".to_string());
        }
        if let Some(age) = event.age() {
            if age > self.inner.opts.old_threshold_ms {
                classes.push("old".to_string());
            }
            if age < self.inner.opts.new_threshold_ms {
                classes.push("new".to_string());
            }
        }
        classes
    }
}

fn resolve_cells(source: CellSource) -> Result<Vec<RowCell>, RenderError> {
    let specs = match source {
        CellSource::Cells(specs) => specs,
        CellSource::Lazy(f) => {
            catch_unwind(AssertUnwindSafe(f)).map_err(|_| RenderError::CellPanic)?
        }
    };
    specs.into_iter().map(|s| resolve_cell(s, 0)).collect()
}

fn resolve_cell(spec: CellSpec, depth: usize) -> Result<RowCell, RenderError> {
    if depth > MAX_CELL_DEPTH {
        return Err(RenderError::RecursionExceeded);
    }
    match spec {
        CellSpec::Text(text) => Ok(RowCell { text, class: None }),
        CellSpec::Styled { text, class } => Ok(RowCell {
            text,
            class: Some(class),
        }),
        CellSpec::Lazy(f) => {
            let next =
                catch_unwind(AssertUnwindSafe(|| f())).map_err(|_| RenderError::CellPanic)?;
            resolve_cell(next, depth + 1)
        }
    }
}
