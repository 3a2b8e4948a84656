//! Cursor-addressable TTY renderer for ktl stack runs.
//!
//! The console subscribes to the run event stream as a plain observer,
//! folds events into a [`view::RunView`], and renders a framebuffer of
//! named sections (`header`, `stack-rail`, `failures`, `nodes`, `hooks`,
//! `details`, `helm-logs`). After each event the frame is rebuilt and
//! diffed against the previous one line by line; only the suffix below
//! the first changed line is repainted (cursor up, clear to end of
//! screen, rewrite).
//!
//! Column widths adapt to the output width with per-column minimums, and
//! trimming accounts for double-width (CJK) characters. ANSI color is
//! optional; non-interactive outputs degrade to plain line logging.

mod frame;
mod render;
mod view;

pub use frame::{Frame, Redraw, Section, diff_frames, display_width, fit_to_width, trim_to_width};
pub use render::{ConsoleRenderer, build_frame};
pub use view::{FailureRow, NodeRow, RunView};
