use unicode_width::UnicodeWidthChar;

/// A named block of lines within a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Section {
    pub name: &'static str,
    pub lines: Vec<String>,
}

/// One complete rendering of the view: sections in display order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Frame {
    pub sections: Vec<Section>,
}

impl Frame {
    pub fn push(&mut self, name: &'static str, lines: Vec<String>) {
        self.sections.push(Section { name, lines });
    }

    /// All lines, top to bottom.
    pub fn lines(&self) -> Vec<&str> {
        self.sections
            .iter()
            .flat_map(|s| s.lines.iter().map(String::as_str))
            .collect()
    }

    pub fn line_count(&self) -> usize {
        self.sections.iter().map(|s| s.lines.len()).sum()
    }
}

/// What the terminal must do to turn the previous frame into this one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redraw {
    /// Nothing changed.
    Unchanged,
    /// Move the cursor up `lines_below_changed` lines, clear to the end
    /// of the screen, and write `suffix`.
    Suffix {
        lines_below_changed: usize,
        suffix: Vec<String>,
    },
}

/// Diff two frames by flattened line equality.
///
/// The first differing line marks the repaint point; everything from
/// there down is rewritten. Trailing growth repaints only the new lines,
/// and shrinkage repaints from the first removed line.
pub fn diff_frames(previous: &Frame, next: &Frame) -> Redraw {
    let old_lines = previous.lines();
    let new_lines = next.lines();

    let common = old_lines
        .iter()
        .zip(new_lines.iter())
        .take_while(|(a, b)| a == b)
        .count();

    if common == old_lines.len() && common == new_lines.len() {
        return Redraw::Unchanged;
    }

    Redraw::Suffix {
        lines_below_changed: old_lines.len() - common,
        suffix: new_lines[common..].iter().map(|s| s.to_string()).collect(),
    }
}

/// Display width of a string, counting wide (CJK) characters as two
/// columns.
pub fn display_width(text: &str) -> usize {
    text.chars().map(|c| c.width().unwrap_or(0)).sum()
}

/// Trim to at most `max` display columns, appending `…` when truncated.
pub fn trim_to_width(text: &str, max: usize) -> String {
    if display_width(text) <= max {
        return text.to_string();
    }
    if max == 0 {
        return String::new();
    }

    let budget = max - 1;
    let mut used = 0;
    let mut out = String::new();
    for c in text.chars() {
        let w = c.width().unwrap_or(0);
        if used + w > budget {
            break;
        }
        used += w;
        out.push(c);
    }
    out.push('…');
    out
}

/// Pad (or trim) to exactly `width` display columns.
pub fn fit_to_width(text: &str, width: usize) -> String {
    let trimmed = trim_to_width(text, width);
    let padding = width.saturating_sub(display_width(&trimmed));
    format!("{trimmed}{}", " ".repeat(padding))
}
