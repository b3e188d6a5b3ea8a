//! Terminal display panels: a scrolling journal panel and an all-events
//! panel, each owning one line-printing container fed by a render queue.

use std::sync::Arc;

use colored::Colorize;
use serde_json::Value;

use lib_eddn::{
    CellSource, CellSpec, FrameClock, NormalizedEvent, RenderQueue, RenderQueueOptions, Router,
    Row, RowContainer,
};

/// A terminal cannot literally prepend, so the container prints every new
/// row as it arrives and keeps the row list only to honour the length
/// accounting of its queue.
pub struct TerminalContainer {
    tag: &'static str,
    rows: Vec<Row>,
}

impl TerminalContainer {
    pub fn new(tag: &'static str) -> Self {
        Self {
            tag,
            rows: Vec::new(),
        }
    }

    fn print_row(&self, row: &Row) {
        let line = row
            .cells
            .iter()
            .map(|c| match c.class.as_deref() {
                Some("time") => format!("{:<8}", c.text),
                Some("game") => format!("[{}]", c.text),
                _ => format!("{:<24}", c.text),
            })
            .collect::<Vec<_>>()
            .join(" ");
        println!("{:>8} {}", self.tag.bold(), paint(&row.classes, &line));
    }
}

fn paint(classes: &[String], line: &str) -> String {
    let has = |c: &str| classes.iter().any(|x| x == c);
    let painted = if has("legacy") {
        line.yellow()
    } else if has("odyssey") {
        line.cyan()
    } else if has("horizons") {
        line.blue()
    } else {
        line.normal()
    };
    let painted = if has("old") {
        painted.dimmed()
    } else if has("new") {
        painted.bold()
    } else {
        painted
    };
    painted.to_string()
}

impl RowContainer for TerminalContainer {
    fn child_count(&self) -> usize {
        self.rows.len()
    }

    fn clear(&mut self) -> Vec<u64> {
        self.rows.drain(..).map(|r| r.id).collect()
    }

    fn prepend(&mut self, rows: Vec<Row>) {
        // Rows arrive newest-first; print oldest-first so the terminal
        // scrolls in event order.
        for row in rows.iter().rev() {
            self.print_row(row);
        }
        let tail = std::mem::take(&mut self.rows);
        self.rows = rows;
        self.rows.extend(tail);
    }

    fn trim_tail(&mut self, n: usize) -> Vec<u64> {
        let keep = self.rows.len().saturating_sub(n);
        self.rows.split_off(keep).into_iter().map(|r| r.id).collect()
    }
}

/// Journal panel: named journal topics only, with system and region columns.
pub fn journal_panel(
    router: &Router,
    clock: Arc<dyn FrameClock>,
    opts: RenderQueueOptions,
    topics: &[String],
) -> RenderQueue {
    let queue = RenderQueue::new(opts, clock, Box::new(TerminalContainer::new("journal")));
    let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
    queue.subscribe(router, &topic_refs, journal_cells);
    queue
}

/// All-events panel: every event type, one line each.
pub fn all_events_panel(
    router: &Router,
    clock: Arc<dyn FrameClock>,
    opts: RenderQueueOptions,
) -> RenderQueue {
    let queue = RenderQueue::new(opts, clock, Box::new(TerminalContainer::new("events")));
    queue.subscribe(router, &["*"], all_events_cells);
    queue
}

fn local_time(event: &NormalizedEvent) -> String {
    event
        .received_at()
        .with_timezone(&chrono::Local)
        .format("%H:%M:%S")
        .to_string()
}

fn journal_cells(event: &Arc<NormalizedEvent>) -> CellSource {
    let event = Arc::clone(event);
    CellSource::Lazy(Box::new(move || {
        vec![
            CellSpec::styled(local_time(&event), "time"),
            CellSpec::text(event.event_name()),
            CellSpec::text(event.star_system()),
            CellSpec::text(event.region().name.unwrap_or("-")),
            CellSpec::styled(event.game_type().as_str(), "game"),
        ]
    }))
}

fn all_events_cells(event: &Arc<NormalizedEvent>) -> CellSource {
    let event = Arc::clone(event);
    CellSource::Lazy(Box::new(move || {
        let uploader = event
            .header()
            .get("uploaderID")
            .and_then(Value::as_str)
            .unwrap_or("-")
            .to_string();
        let age = event
            .age()
            .map(|ms| format!("{:+.1}s", ms as f64 / 1000.0))
            .unwrap_or_else(|| "-".to_string());
        vec![
            CellSpec::styled(local_time(&event), "time"),
            CellSpec::text(event.event_type()),
            CellSpec::text(uploader),
            CellSpec::text(age),
            CellSpec::styled(event.game_type().as_str(), "game"),
        ]
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_eddn::RegionMap;
    use serde_json::json;

    fn event() -> Arc<NormalizedEvent> {
        Arc::new(NormalizedEvent::new(
            json!({
                "$schemaRef": "https://eddn.edcd.io/schemas/journal/1",
                "header": { "uploaderID": "cmdr" },
                "message": { "event": "FSDJump", "StarSystem": "Sol" }
            }),
            Arc::new(RegionMap::new()),
        ))
    }

    fn resolve(source: CellSource) -> Vec<CellSpec> {
        match source {
            CellSource::Cells(cells) => cells,
            CellSource::Lazy(f) => f(),
        }
    }

    fn text_of(spec: &CellSpec) -> String {
        match spec {
            CellSpec::Text(t) => t.clone(),
            CellSpec::Styled { text, .. } => text.clone(),
            CellSpec::Lazy(_) => panic!("unexpected lazy cell"),
        }
    }

    #[test]
    fn journal_cells_show_event_and_system() {
        let cells = resolve(journal_cells(&event()));
        assert_eq!(cells.len(), 5);
        assert_eq!(text_of(&cells[1]), "FSDJump");
        assert_eq!(text_of(&cells[2]), "Sol");
        assert_eq!(text_of(&cells[3]), "-", "no region before the map loads");
    }

    #[test]
    fn all_events_cells_show_type_and_uploader() {
        let cells = resolve(all_events_cells(&event()));
        assert_eq!(text_of(&cells[1]), "journal:fsdjump");
        assert_eq!(text_of(&cells[2]), "cmdr");
        assert_eq!(text_of(&cells[3]), "-", "no timestamp, no age");
    }

    #[test]
    fn container_accounting_matches_prints() {
        let mut container = TerminalContainer::new("test");
        colored::control::set_override(false);

        let row = |id| Row {
            id,
            classes: vec!["data".to_string()],
            cells: Vec::new(),
        };
        container.prepend(vec![row(2), row(1)]);
        assert_eq!(container.child_count(), 2);
        assert_eq!(container.trim_tail(1), vec![1]);
        assert_eq!(container.clear(), vec![2]);
        assert_eq!(container.child_count(), 0);
    }
}
