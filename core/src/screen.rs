//! Screen snapshot model: an in-process terminal emulator that turns a PTY
//! byte stream into a deterministic grid (spec.md §3, §4.3). Built on the
//! `vte` crate (the same VT parser the pack's `maestro` backend uses),
//! generalized from cursor-only tracking to a full cell grid with colors
//! and attributes so it can feed the binary buffer wire format (spec.md §6).

use vte::{Params, Parser, Perform};

/// A terminal color: default, a palette index, or 24-bit RGB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Color {
    #[default]
    Default,
    Indexed(u8),
    Rgb(u8, u8, u8),
}

/// Text attributes carried by one cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Attrs {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub inverse: bool,
}

/// One cell of the grid: a character plus its rendering attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Cell {
    pub ch: char,
    pub fg: Color,
    pub bg: Color,
    pub attrs: Attrs,
    /// Set on the leading cell of a wide (double-width) character; the
    /// following cell is a blank placeholder (spec.md §6 "extended data for
    /// wide characters").
    pub wide: bool,
}

impl Default for Cell {
    fn default() -> Self {
        Self {
            ch: ' ',
            fg: Color::Default,
            bg: Color::Default,
            attrs: Attrs::default(),
            wide: false,
        }
    }
}

/// A deterministic rendering of the current terminal grid (spec.md §3).
#[derive(Debug, Clone)]
pub struct ScreenSnapshot {
    pub cols: u32,
    pub rows: u32,
    pub viewport_y: u32,
    pub cursor_x: u32,
    pub cursor_y: u32,
    pub grid: Vec<Vec<Cell>>,
}

struct EmulatorState {
    cols: u16,
    rows: u16,
    cursor_row: u16,
    cursor_col: u16,
    cur_fg: Color,
    cur_bg: Color,
    cur_attrs: Attrs,
    grid: Vec<Vec<Cell>>,
}

impl EmulatorState {
    fn new(cols: u16, rows: u16) -> Self {
        Self {
            cols,
            rows,
            cursor_row: 0,
            cursor_col: 0,
            cur_fg: Color::Default,
            cur_bg: Color::Default,
            cur_attrs: Attrs::default(),
            grid: vec![vec![Cell::default(); cols.max(1) as usize]; rows.max(1) as usize],
        }
    }

    fn resize(&mut self, cols: u16, rows: u16) {
        let mut grid = vec![vec![Cell::default(); cols.max(1) as usize]; rows.max(1) as usize];
        for (r, row) in self.grid.iter().enumerate().take(rows as usize) {
            for (c, cell) in row.iter().enumerate().take(cols as usize) {
                grid[r][c] = cell.clone();
            }
        }
        self.grid = grid;
        self.cols = cols;
        self.rows = rows;
        self.cursor_row = self.cursor_row.min(rows.saturating_sub(1));
        self.cursor_col = self.cursor_col.min(cols.saturating_sub(1));
    }

    fn scroll_up_one(&mut self) {
        if self.grid.is_empty() {
            return;
        }
        self.grid.remove(0);
        self.grid.push(vec![Cell::default(); self.cols.max(1) as usize]);
    }

    fn newline(&mut self) {
        if self.cursor_row + 1 >= self.rows {
            self.scroll_up_one();
        } else {
            self.cursor_row += 1;
        }
    }

    fn put_char(&mut self, c: char) {
        if self.cursor_col >= self.cols {
            self.cursor_col = 0;
            self.newline();
        }
        let cell = Cell {
            ch: c,
            fg: self.cur_fg,
            bg: self.cur_bg,
            attrs: self.cur_attrs,
            wide: false,
        };
        if let Some(row) = self.grid.get_mut(self.cursor_row as usize) {
            if let Some(slot) = row.get_mut(self.cursor_col as usize) {
                *slot = cell;
            }
        }
        self.cursor_col = self.cursor_col.saturating_add(1);
    }

    fn snapshot(&self) -> ScreenSnapshot {
        ScreenSnapshot {
            cols: self.cols as u32,
            rows: self.rows as u32,
            viewport_y: 0,
            cursor_x: self.cursor_col as u32,
            cursor_y: self.cursor_row as u32,
            grid: self.grid.clone(),
        }
    }
}

impl Perform for EmulatorState {
    fn print(&mut self, c: char) {
        self.put_char(c);
    }

    fn execute(&mut self, byte: u8) {
        match byte {
            0x0D => self.cursor_col = 0,
            0x0A => self.newline(),
            0x08 => self.cursor_col = self.cursor_col.saturating_sub(1),
            0x09 => {
                self.cursor_col = ((self.cursor_col / 8) + 1) * 8;
                if self.cursor_col >= self.cols {
                    self.cursor_col = self.cols.saturating_sub(1);
                }
            }
            _ => {}
        }
    }

    fn hook(&mut self, _params: &Params, _intermediates: &[u8], _ignore: bool, _action: char) {}
    fn put(&mut self, _byte: u8) {}
    fn unhook(&mut self) {}
    fn osc_dispatch(&mut self, _params: &[&[u8]], _bell_terminated: bool) {}

    fn csi_dispatch(&mut self, params: &Params, _intermediates: &[u8], _ignore: bool, action: char) {
        let values: Vec<u16> = params.iter().map(|p| p.first().copied().unwrap_or(0)).collect();
        let param = |idx: usize, default: u16| -> u16 {
            values.get(idx).copied().filter(|v| *v != 0).unwrap_or(default)
        };

        match action {
            'A' => self.cursor_row = self.cursor_row.saturating_sub(param(0, 1)),
            'B' => self.cursor_row = self.cursor_row.saturating_add(param(0, 1)).min(self.rows.saturating_sub(1)),
            'C' => self.cursor_col = self.cursor_col.saturating_add(param(0, 1)).min(self.cols.saturating_sub(1)),
            'D' => self.cursor_col = self.cursor_col.saturating_sub(param(0, 1)),
            'H' | 'f' => {
                let row = param(0, 1).saturating_sub(1);
                let col = param(1, 1).saturating_sub(1);
                self.cursor_row = row.min(self.rows.saturating_sub(1));
                self.cursor_col = col.min(self.cols.saturating_sub(1));
            }
            'K' => {
                let mode = values.first().copied().unwrap_or(0);
                if let Some(row) = self.grid.get_mut(self.cursor_row as usize) {
                    match mode {
                        0 => {
                            for cell in row.iter_mut().skip(self.cursor_col as usize) {
                                *cell = Cell::default();
                            }
                        }
                        1 => {
                            for cell in row.iter_mut().take(self.cursor_col as usize + 1) {
                                *cell = Cell::default();
                            }
                        }
                        2 => {
                            for cell in row.iter_mut() {
                                *cell = Cell::default();
                            }
                        }
                        _ => {}
                    }
                }
            }
            'J' => {
                let mode = values.first().copied().unwrap_or(0);
                match mode {
                    2 | 3 => {
                        for row in self.grid.iter_mut() {
                            for cell in row.iter_mut() {
                                *cell = Cell::default();
                            }
                        }
                    }
                    _ => {}
                }
            }
            'm' => self.apply_sgr(&values),
            _ => {}
        }
    }

    fn esc_dispatch(&mut self, _intermediates: &[u8], _ignore: bool, _byte: u8) {}
}

impl EmulatorState {
    fn apply_sgr(&mut self, values: &[u16]) {
        if values.is_empty() {
            self.cur_fg = Color::Default;
            self.cur_bg = Color::Default;
            self.cur_attrs = Attrs::default();
            return;
        }
        let mut i = 0;
        while i < values.len() {
            match values[i] {
                0 => {
                    self.cur_fg = Color::Default;
                    self.cur_bg = Color::Default;
                    self.cur_attrs = Attrs::default();
                }
                1 => self.cur_attrs.bold = true,
                3 => self.cur_attrs.italic = true,
                4 => self.cur_attrs.underline = true,
                7 => self.cur_attrs.inverse = true,
                22 => self.cur_attrs.bold = false,
                23 => self.cur_attrs.italic = false,
                24 => self.cur_attrs.underline = false,
                27 => self.cur_attrs.inverse = false,
                30..=37 => self.cur_fg = Color::Indexed((values[i] - 30) as u8),
                39 => self.cur_fg = Color::Default,
                40..=47 => self.cur_bg = Color::Indexed((values[i] - 40) as u8),
                49 => self.cur_bg = Color::Default,
                90..=97 => self.cur_fg = Color::Indexed((values[i] - 90 + 8) as u8),
                100..=107 => self.cur_bg = Color::Indexed((values[i] - 100 + 8) as u8),
                38 | 48 => {
                    let is_fg = values[i] == 38;
                    if values.get(i + 1) == Some(&2) {
                        let (r, g, b) = (
                            values.get(i + 2).copied().unwrap_or(0) as u8,
                            values.get(i + 3).copied().unwrap_or(0) as u8,
                            values.get(i + 4).copied().unwrap_or(0) as u8,
                        );
                        let color = Color::Rgb(r, g, b);
                        if is_fg {
                            self.cur_fg = color;
                        } else {
                            self.cur_bg = color;
                        }
                        i += 4;
                    } else if values.get(i + 1) == Some(&5) {
                        let idx = values.get(i + 2).copied().unwrap_or(0) as u8;
                        let color = Color::Indexed(idx);
                        if is_fg {
                            self.cur_fg = color;
                        } else {
                            self.cur_bg = color;
                        }
                        i += 2;
                    }
                }
                _ => {}
            }
            i += 1;
        }
    }
}

/// A `ScreenModel` consumes PTY bytes and renders deterministic snapshots.
/// No per-client state lives here (spec.md §4.3): one model per session.
pub struct ScreenModel {
    parser: Parser,
    state: EmulatorState,
}

impl ScreenModel {
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            parser: Parser::new(),
            state: EmulatorState::new(cols, rows),
        }
    }

    /// Feed PTY output bytes into the emulator.
    pub fn feed(&mut self, bytes: &[u8]) {
        for byte in bytes {
            self.parser.advance(&mut self.state, *byte);
        }
    }

    pub fn resize(&mut self, cols: u16, rows: u16) {
        self.state.resize(cols, rows);
    }

    /// Render the current grid. Deterministic: the same byte stream always
    /// yields the same snapshot (spec.md §3 invariant).
    pub fn snapshot(&self) -> ScreenSnapshot {
        self.state.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_lands_at_origin() {
        let mut model = ScreenModel::new(10, 3);
        model.feed(b"hi");
        let snap = model.snapshot();
        assert_eq!(snap.grid[0][0].ch, 'h');
        assert_eq!(snap.grid[0][1].ch, 'i');
        assert_eq!(snap.cursor_x, 2);
        assert_eq!(snap.cursor_y, 0);
    }

    #[test]
    fn newline_advances_row() {
        let mut model = ScreenModel::new(10, 3);
        model.feed(b"a\r\nb");
        let snap = model.snapshot();
        assert_eq!(snap.grid[0][0].ch, 'a');
        assert_eq!(snap.grid[1][0].ch, 'b');
        assert_eq!(snap.cursor_y, 1);
    }

    #[test]
    fn sgr_sets_colors_and_resets() {
        let mut model = ScreenModel::new(10, 3);
        model.feed(b"\x1b[31mred\x1b[0m");
        let snap = model.snapshot();
        assert_eq!(snap.grid[0][0].fg, Color::Indexed(1));
        model.feed(b"x");
        let snap = model.snapshot();
        assert_eq!(snap.grid[0][3].fg, Color::Default);
    }

    #[test]
    fn resize_preserves_overlapping_cells() {
        let mut model = ScreenModel::new(10, 3);
        model.feed(b"hello");
        model.resize(5, 2);
        let snap = model.snapshot();
        assert_eq!(snap.cols, 5);
        assert_eq!(snap.rows, 2);
        assert_eq!(snap.grid[0][0].ch, 'h');
    }

    #[test]
    fn cursor_forward_motion_is_clamped() {
        let mut model = ScreenModel::new(4, 2);
        model.feed(b"\x1b[20C");
        let snap = model.snapshot();
        assert_eq!(snap.cursor_x, 3);
    }
}
