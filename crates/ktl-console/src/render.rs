use std::io::Write;

use colored::Colorize;

use ktl_stack::bus::Observer;
use ktl_stack::types::{RunEvent, RunEventKind};

use crate::frame::{Frame, Redraw, diff_frames, fit_to_width, trim_to_width};
use crate::view::RunView;

const MIN_NODE_COL: usize = 10;
const STATUS_COL: usize = 9;
const ATTEMPT_COL: usize = 3;
const PHASE_COL: usize = 10;

/// Cursor-addressable console renderer.
///
/// The renderer folds run events into a [`RunView`], rebuilds the frame,
/// and repaints only the lines below the first change: cursor up, clear
/// to end of screen, rewrite the suffix. On non-interactive outputs it
/// degrades to plain line-oriented logging. It is purely a consumer of
/// events and never reaches back into the scheduler.
pub struct ConsoleRenderer {
    view: RunView,
    out: Box<dyn Write + Send>,
    previous: Frame,
    width: usize,
    color: bool,
    interactive: bool,
}

impl ConsoleRenderer {
    pub fn new(out: Box<dyn Write + Send>, width: usize, color: bool, interactive: bool) -> Self {
        Self {
            view: RunView::new(),
            out,
            previous: Frame::default(),
            width: width.max(40),
            color,
            interactive,
        }
    }

    /// Build the current frame from the view state.
    pub fn build_frame(&self) -> Frame {
        build_frame(&self.view, self.width, self.color)
    }

    fn repaint(&mut self) {
        let next = self.build_frame();
        match diff_frames(&self.previous, &next) {
            Redraw::Unchanged => {}
            Redraw::Suffix {
                lines_below_changed,
                suffix,
            } => {
                if lines_below_changed > 0 {
                    let _ = write!(self.out, "\x1b[{lines_below_changed}A");
                }
                let _ = write!(self.out, "\x1b[0J");
                for line in &suffix {
                    let _ = writeln!(self.out, "{line}");
                }
                let _ = self.out.flush();
            }
        }
        self.previous = next;
    }

    fn log_line(&mut self, event: &RunEvent) {
        let node = event
            .node_id
            .as_ref()
            .map(|id| format!("{id}: "))
            .unwrap_or_default();
        let line = match event.kind {
            RunEventKind::RunStarted => Some(format!(
                "starting {}",
                event.message.as_deref().unwrap_or("run")
            )),
            RunEventKind::NodeRunning => Some(format!(
                "{node}running (attempt {})",
                event.attempt.unwrap_or(1)
            )),
            RunEventKind::RetryScheduled => Some(format!(
                "{node}retry scheduled: {}",
                event.message.as_deref().unwrap_or("")
            )),
            RunEventKind::NodeSucceeded => Some(format!("{node}succeeded")),
            RunEventKind::NodeFailed => Some(format!(
                "{node}failed: {}",
                event.message.as_deref().unwrap_or("")
            )),
            RunEventKind::NodeBlocked => Some(format!("{node}blocked")),
            RunEventKind::HookFailed => Some(format!(
                "{node}hook failed: {}",
                event.message.as_deref().unwrap_or("")
            )),
            RunEventKind::RunCompleted => Some(format!(
                "run completed: {}",
                event.message.as_deref().unwrap_or("")
            )),
            _ => None,
        };
        if let Some(line) = line {
            let _ = writeln!(self.out, "{line}");
            let _ = self.out.flush();
        }
    }
}

impl Observer for ConsoleRenderer {
    fn observe_run_event(&mut self, event: &RunEvent) {
        self.view.apply(event);
        if self.interactive {
            self.repaint();
        } else {
            self.log_line(event);
        }
    }
}

/// Assemble the section-indexed frame for a view.
pub fn build_frame(view: &RunView, width: usize, color: bool) -> Frame {
    let mut frame = Frame::default();

    let mut header = format!(
        "run {} · {} {} · concurrency {}",
        view.run_id, view.command, view.stack, view.concurrency
    );
    if let Some(status) = &view.completed {
        header.push_str(&format!(" · {status}"));
    }
    frame.push("header", vec![trim_to_width(&header, width)]);

    if !view.nodes.is_empty() {
        let mut counts: std::collections::BTreeMap<&str, usize> = std::collections::BTreeMap::new();
        for row in view.nodes.values() {
            *counts.entry(row.status.as_str()).or_insert(0) += 1;
        }
        let rail = counts
            .iter()
            .map(|(status, count)| format!("{count} {status}"))
            .collect::<Vec<_>>()
            .join(" · ");
        frame.push("stack-rail", vec![trim_to_width(&rail, width)]);
    }

    if !view.failures.is_empty() {
        let mut lines = vec!["FAILURES".to_string()];
        for failure in &view.failures {
            let count = if failure.count > 1 {
                format!(" ×{}", failure.count)
            } else {
                String::new()
            };
            let line = format!(
                "  {} [{}]{} {}",
                failure.class, failure.digest, count, failure.message
            );
            let line = trim_to_width(&line, width);
            lines.push(if color {
                line.red().to_string()
            } else {
                line
            });
        }
        frame.push("failures", lines);
    }

    if !view.nodes.is_empty() {
        let node_col = view
            .nodes
            .keys()
            .map(|id| id.as_str().len())
            .max()
            .unwrap_or(0)
            .max(MIN_NODE_COL);
        let note_col = width
            .saturating_sub(node_col + STATUS_COL + ATTEMPT_COL + PHASE_COL + 4)
            .max(8);

        let mut lines = vec![format!(
            "{} {} {} {} {}",
            fit_to_width("NODE", node_col),
            fit_to_width("STATUS", STATUS_COL),
            fit_to_width("ATT", ATTEMPT_COL),
            fit_to_width("PHASE", PHASE_COL),
            fit_to_width("NOTE", note_col),
        )];
        for (id, row) in &view.nodes {
            let status_cell = fit_to_width(&row.status, STATUS_COL);
            let status_cell = if color {
                paint_status(&row.status, status_cell)
            } else {
                status_cell
            };
            let attempt = if row.attempt > 0 {
                row.attempt.to_string()
            } else {
                "-".to_string()
            };
            lines.push(format!(
                "{} {} {} {} {}",
                fit_to_width(id.as_str(), node_col),
                status_cell,
                fit_to_width(&attempt, ATTEMPT_COL),
                fit_to_width(&row.phase, PHASE_COL),
                fit_to_width(&row.note, note_col),
            ));
        }
        frame.push("nodes", lines);
    }

    if !view.hooks.is_empty() {
        let mut lines = vec!["hooks".to_string()];
        lines.extend(view.hooks.iter().map(|h| trim_to_width(h, width)));
        frame.push("hooks", lines);
    }

    if !view.details.is_empty() {
        frame.push(
            "details",
            view.details
                .iter()
                .map(|d| trim_to_width(d, width))
                .collect(),
        );
    }

    if !view.helm_logs.is_empty() {
        let mut lines = vec!["helm".to_string()];
        lines.extend(
            view.helm_logs
                .iter()
                .map(|l| trim_to_width(&format!("  {l}"), width)),
        );
        frame.push("helm-logs", lines);
    }

    frame
}

fn paint_status(status: &str, cell: String) -> String {
    match status {
        "succeeded" => cell.green().to_string(),
        "failed" | "blocked" => cell.red().to_string(),
        "running" => cell.cyan().to_string(),
        "retrying" => cell.yellow().to_string(),
        _ => cell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ktl_stack::types::{ErrorClass, NodeId, RunError};

    fn view_with_two_nodes() -> RunView {
        let mut view = RunView::new();
        view.apply(
            &RunEvent::new(RunEventKind::RunStarted)
                .field("command", "apply")
                .field("stack", "demo"),
        );
        view.run_id = "run-1".to_string();
        view.apply(&RunEvent::new(RunEventKind::RunConcurrency).field("to", 2u64));
        let a = NodeId::from("eu/api");
        let b = NodeId::from("eu/db");
        view.apply(&RunEvent::new(RunEventKind::NodeMeta).node(&a));
        view.apply(&RunEvent::new(RunEventKind::NodeMeta).node(&b));
        view.apply(&RunEvent::new(RunEventKind::NodeRunning).node(&b).attempt(1));
        view
    }

    #[test]
    fn header_line_summarizes_the_run() {
        let view = view_with_two_nodes();
        let frame = build_frame(&view, 80, false);
        insta::assert_snapshot!(
            frame.sections[0].lines[0],
            @"run run-1 · apply demo · concurrency 2"
        );
    }

    #[test]
    fn frame_has_expected_sections_in_order() {
        let mut view = view_with_two_nodes();
        view.apply(
            &RunEvent::new(RunEventKind::NodeFailed)
                .node(&NodeId::from("eu/api"))
                .message("boom")
                .error(RunError::new(ErrorClass::HelmError, "boom")),
        );
        view.apply(&RunEvent::new(RunEventKind::HelmLog).message("deployed"));

        let frame = build_frame(&view, 80, false);
        let names: Vec<&str> = frame.sections.iter().map(|s| s.name).collect();
        assert_eq!(
            names,
            vec!["header", "stack-rail", "failures", "nodes", "helm-logs"]
        );
    }

    #[test]
    fn node_rows_align_to_columns() {
        let view = view_with_two_nodes();
        let frame = build_frame(&view, 80, false);
        let nodes = frame
            .sections
            .iter()
            .find(|s| s.name == "nodes")
            .expect("nodes section");
        assert_eq!(nodes.lines.len(), 3);
        assert!(nodes.lines[0].starts_with("NODE"));
        // All rows share the same display width.
        let widths: Vec<usize> = nodes
            .lines
            .iter()
            .map(|l| crate::frame::display_width(l))
            .collect();
        assert!(widths.windows(2).all(|w| w[0] == w[1]));
    }

    #[test]
    fn interactive_renderer_repaints_only_changed_suffix() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().expect("lock").extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let captured = buffer.0.clone();
        let mut renderer = ConsoleRenderer::new(Box::new(buffer), 80, false, true);

        let id = NodeId::from("eu/api");
        renderer.observe_run_event(&RunEvent::new(RunEventKind::NodeMeta).node(&id));
        captured.lock().expect("lock").clear();

        // A second event repaints with a cursor-up prefix.
        renderer.observe_run_event(&RunEvent::new(RunEventKind::NodeRunning).node(&id).attempt(1));
        let output = String::from_utf8(captured.lock().expect("lock").clone()).expect("utf8");
        assert!(output.contains("\x1b["));
        assert!(output.contains("\x1b[0J"));
        assert!(output.contains("running"));
    }

    #[test]
    fn non_interactive_renderer_prints_lines() {
        use std::sync::{Arc, Mutex};

        #[derive(Clone)]
        struct SharedBuf(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for SharedBuf {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().expect("lock").extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let buffer = SharedBuf(Arc::new(Mutex::new(Vec::new())));
        let captured = buffer.0.clone();
        let mut renderer = ConsoleRenderer::new(Box::new(buffer), 80, false, false);

        let id = NodeId::from("eu/api");
        renderer.observe_run_event(
            &RunEvent::new(RunEventKind::NodeFailed)
                .node(&id)
                .message("helm exploded"),
        );
        let output = String::from_utf8(captured.lock().expect("lock").clone()).expect("utf8");
        assert_eq!(output, "eu/api: failed: helm exploded\n");
        // No cursor addressing in plain mode.
        assert!(!output.contains("\x1b["));
    }
}
