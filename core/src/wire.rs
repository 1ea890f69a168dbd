//! Wire formats for the two real-time transports (spec.md §6): the
//! asciinema-v2-shaped text stream (JSON lines) and the compact binary
//! screen-buffer protocol. Kept in `termcast-core` so both the fan-out and
//! the control plane encode/decode the same way.

use crate::error::{CoreError, Result};
use crate::screen::{Cell, Color, ScreenSnapshot};
use serde_json::Value;

/// One record of the text-streaming wire format (spec.md §6).
#[derive(Debug, Clone, PartialEq)]
pub enum TextRecord {
    Output { t: f64, data: Vec<u8> },
    Input { t: f64, data: Vec<u8> },
    Resize { t: f64, cols: u16, rows: u16 },
    Exit { code: i32, session_id: String },
    /// Marker telling a subscriber that the fan-out dropped one or more
    /// output records before it could deliver them (spec.md §4.3).
    Dropped { total_drops: u64 },
}

fn bytes_to_json_string(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Encode a named key (e.g. `"Enter"`, `"ArrowUp"`) as input bytes: spec.md
/// §6 wire form `NUL key-name NUL`.
pub fn encode_key_name(name: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(name.len() + 2);
    bytes.push(0u8);
    bytes.extend_from_slice(name.as_bytes());
    bytes.push(0u8);
    bytes
}

/// Decode a `NUL key-name NUL` input record back into the key name, if
/// `data` is shaped that way.
pub fn decode_key_name(data: &[u8]) -> Option<&str> {
    if data.len() < 2 || data[0] != 0 || data[data.len() - 1] != 0 {
        return None;
    }
    std::str::from_utf8(&data[1..data.len() - 1]).ok()
}

/// Encode one record as a single JSON line (including the trailing `\n`).
pub fn encode_text_record(record: &TextRecord) -> String {
    let value = match record {
        TextRecord::Output { t, data } => {
            serde_json::json!([t, "o", bytes_to_json_string(data)])
        }
        TextRecord::Input { t, data } => {
            serde_json::json!([t, "i", bytes_to_json_string(data)])
        }
        TextRecord::Resize { t, cols, rows } => {
            serde_json::json!([t, "r", format!("{}x{}", cols, rows)])
        }
        TextRecord::Exit { code, session_id } => {
            serde_json::json!(["exit", code, session_id])
        }
        TextRecord::Dropped { total_drops } => {
            serde_json::json!(["drop", total_drops])
        }
    };
    format!("{}\n", value)
}

/// Decode one JSON line back into a `TextRecord`.
pub fn decode_text_record(line: &str) -> Result<TextRecord> {
    let value: Value = serde_json::from_str(line.trim_end())
        .map_err(|e| CoreError::ConfigError(format!("invalid text record: {e}")))?;
    let arr = value
        .as_array()
        .ok_or_else(|| CoreError::ConfigError("text record must be a JSON array".into()))?;
    if arr[0].as_str() == Some("drop") {
        let total_drops = arr
            .get(1)
            .and_then(Value::as_u64)
            .ok_or_else(|| CoreError::ConfigError("drop marker must carry a count".into()))?;
        return Ok(TextRecord::Dropped { total_drops });
    }
    if arr.len() < 3 {
        return Err(CoreError::ConfigError("text record must have 3 fields".into()));
    }
    if arr[0].as_str() == Some("exit") {
        let code = arr[1]
            .as_i64()
            .ok_or_else(|| CoreError::ConfigError("exit code must be an integer".into()))? as i32;
        let session_id = arr[2]
            .as_str()
            .ok_or_else(|| CoreError::ConfigError("exit session id must be a string".into()))?
            .to_string();
        return Ok(TextRecord::Exit { code, session_id });
    }
    let t = arr[0]
        .as_f64()
        .ok_or_else(|| CoreError::ConfigError("record timestamp must be numeric".into()))?;
    let kind = arr[1]
        .as_str()
        .ok_or_else(|| CoreError::ConfigError("record kind must be a string".into()))?;
    let payload = arr[2]
        .as_str()
        .ok_or_else(|| CoreError::ConfigError("record payload must be a string".into()))?;
    match kind {
        "o" => Ok(TextRecord::Output {
            t,
            data: payload.as_bytes().to_vec(),
        }),
        "i" => Ok(TextRecord::Input {
            t,
            data: payload.as_bytes().to_vec(),
        }),
        "r" => {
            let (cols, rows) = payload
                .split_once('x')
                .ok_or_else(|| CoreError::ConfigError("resize record must be COLSxROWS".into()))?;
            let cols: u16 = cols
                .parse()
                .map_err(|_| CoreError::ConfigError("invalid cols in resize record".into()))?;
            let rows: u16 = rows
                .parse()
                .map_err(|_| CoreError::ConfigError("invalid rows in resize record".into()))?;
            Ok(TextRecord::Resize { t, cols, rows })
        }
        other => Err(CoreError::ConfigError(format!("unknown record kind: {other}"))),
    }
}

// --- Binary buffer protocol (spec.md §6) -----------------------------------

const FRAME_MARKER: u8 = 0xBF;
const PAYLOAD_MAGIC: [u8; 2] = [0x56, 0x54]; // "VT"
const PAYLOAD_VERSION: u8 = 0x01;
const ROW_OP_EMPTY: u8 = 0xFE;
const ROW_OP_CONTENT: u8 = 0xFD;

const ATTR_EXTENDED: u8 = 0b1000_0000;
const ATTR_UNICODE: u8 = 0b0100_0000;
const ATTR_FG_PRESENT: u8 = 0b0010_0000;
const ATTR_BG_PRESENT: u8 = 0b0001_0000;
/// bit3: fg color is RGB (vs. palette-indexed).
const ATTR_FG_RGB: u8 = 0b0000_1000;
/// bit2: bg color is RGB (vs. palette-indexed).
const ATTR_BG_RGB: u8 = 0b0000_0100;
const ATTR_CLASS_MASK: u8 = 0b0000_0011;
const CLASS_SPACE: u8 = 0b00;
const CLASS_ASCII: u8 = 0b01;
const CLASS_UNICODE: u8 = 0b10;

fn write_color(buf: &mut Vec<u8>, color: Color) {
    match color {
        Color::Rgb(r, g, b) => buf.extend_from_slice(&[r, g, b]),
        Color::Indexed(i) => buf.push(i),
        Color::Default => {}
    }
}

fn encode_cell(buf: &mut Vec<u8>, cell: &Cell) {
    let mut attr = 0u8;
    let class = if cell.ch == ' ' && cell.fg == Color::Default && cell.bg == Color::Default {
        CLASS_SPACE
    } else if cell.ch.is_ascii() {
        CLASS_ASCII
    } else {
        CLASS_UNICODE
    };
    attr |= class;
    if class == CLASS_UNICODE {
        attr |= ATTR_UNICODE;
    }
    let fg_present = cell.fg != Color::Default;
    let bg_present = cell.bg != Color::Default;
    if fg_present {
        attr |= ATTR_FG_PRESENT;
    }
    if bg_present {
        attr |= ATTR_BG_PRESENT;
    }
    if matches!(cell.fg, Color::Rgb(..)) {
        attr |= ATTR_FG_RGB;
    }
    if matches!(cell.bg, Color::Rgb(..)) {
        attr |= ATTR_BG_RGB;
    }
    if cell.wide {
        attr |= ATTR_EXTENDED;
    }

    buf.push(attr);
    if fg_present {
        write_color(buf, cell.fg);
    }
    if bg_present {
        write_color(buf, cell.bg);
    }
    match class {
        CLASS_SPACE => {}
        CLASS_ASCII => buf.push(cell.ch as u8),
        CLASS_UNICODE => buf.extend_from_slice(&(cell.ch as u32).to_le_bytes()),
        _ => unreachable!(),
    }
    if cell.wide {
        buf.push(1); // extended-data flag byte: 1 = wide character
    }
}

fn decode_cell(buf: &[u8], pos: &mut usize) -> Result<Cell> {
    let attr = *buf
        .get(*pos)
        .ok_or_else(|| CoreError::ConfigError("truncated cell attribute byte".into()))?;
    *pos += 1;
    let class = attr & ATTR_CLASS_MASK;

    let mut fg = Color::Default;
    if attr & ATTR_FG_PRESENT != 0 {
        fg = read_color(buf, pos, attr & ATTR_FG_RGB != 0)?;
    }
    let mut bg = Color::Default;
    if attr & ATTR_BG_PRESENT != 0 {
        bg = read_color(buf, pos, attr & ATTR_BG_RGB != 0)?;
    }
    let ch = match class {
        CLASS_SPACE => ' ',
        CLASS_ASCII => {
            let b = *buf
                .get(*pos)
                .ok_or_else(|| CoreError::ConfigError("truncated ascii cell".into()))?;
            *pos += 1;
            b as char
        }
        CLASS_UNICODE => {
            let bytes: [u8; 4] = buf
                .get(*pos..*pos + 4)
                .ok_or_else(|| CoreError::ConfigError("truncated unicode cell".into()))?
                .try_into()
                .unwrap();
            *pos += 4;
            char::from_u32(u32::from_le_bytes(bytes)).unwrap_or('\u{FFFD}')
        }
        _ => return Err(CoreError::ConfigError("invalid cell char class".into())),
    };
    let wide = attr & ATTR_EXTENDED != 0;
    if wide {
        *pos += 1; // consume extended-data flag byte
    }
    Ok(Cell {
        ch,
        fg,
        bg,
        attrs: Default::default(),
        wide,
    })
}

fn read_color(buf: &[u8], pos: &mut usize, rgb: bool) -> Result<Color> {
    if rgb {
        let bytes = buf
            .get(*pos..*pos + 3)
            .ok_or_else(|| CoreError::ConfigError("truncated rgb color".into()))?;
        *pos += 3;
        Ok(Color::Rgb(bytes[0], bytes[1], bytes[2]))
    } else {
        let b = *buf
            .get(*pos)
            .ok_or_else(|| CoreError::ConfigError("truncated palette color".into()))?;
        *pos += 1;
        Ok(Color::Indexed(b))
    }
}

fn row_is_empty(row: &[Cell]) -> bool {
    row.iter().all(|c| *c == Cell::default())
}

/// Encode a full screen-buffer frame for one session: outer envelope (marker
/// + session id) wrapping the payload header + row data.
pub fn encode_snapshot_frame(session_id: &str, snapshot: &ScreenSnapshot) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&PAYLOAD_MAGIC);
    payload.push(PAYLOAD_VERSION);
    payload.push(0x00); // flags
    payload.extend_from_slice(&snapshot.cols.to_le_bytes());
    payload.extend_from_slice(&snapshot.rows.to_le_bytes());
    payload.extend_from_slice(&snapshot.viewport_y.to_le_bytes());
    payload.extend_from_slice(&snapshot.cursor_x.to_le_bytes());
    payload.extend_from_slice(&snapshot.cursor_y.to_le_bytes());
    payload.extend_from_slice(&0u64.to_le_bytes()); // reserved, pads header to 32 bytes
    debug_assert_eq!(payload.len(), 32);

    let mut row_idx = 0usize;
    while row_idx < snapshot.grid.len() {
        if row_is_empty(&snapshot.grid[row_idx]) {
            let start = row_idx;
            while row_idx < snapshot.grid.len() && row_is_empty(&snapshot.grid[row_idx]) {
                row_idx += 1;
            }
            let mut count = row_idx - start;
            while count > 0 {
                let chunk = count.min(255);
                payload.push(ROW_OP_EMPTY);
                payload.push(chunk as u8);
                count -= chunk;
            }
        } else {
            let row = &snapshot.grid[row_idx];
            let mut cell_buf = Vec::new();
            for cell in row {
                encode_cell(&mut cell_buf, cell);
            }
            payload.push(ROW_OP_CONTENT);
            payload.extend_from_slice(&(row.len() as u16).to_le_bytes());
            payload.extend_from_slice(&cell_buf);
            row_idx += 1;
        }
    }

    let mut frame = Vec::with_capacity(1 + 4 + session_id.len() + payload.len());
    frame.push(FRAME_MARKER);
    frame.extend_from_slice(&(session_id.len() as u32).to_le_bytes());
    frame.extend_from_slice(session_id.as_bytes());
    frame.extend_from_slice(&payload);
    frame
}

/// Decode a full screen-buffer frame back into (session id, snapshot).
pub fn decode_snapshot_frame(frame: &[u8]) -> Result<(String, ScreenSnapshot)> {
    if frame.first() != Some(&FRAME_MARKER) {
        return Err(CoreError::ConfigError("missing 0xBF frame marker".into()));
    }
    let id_len = u32::from_le_bytes(
        frame
            .get(1..5)
            .ok_or_else(|| CoreError::ConfigError("truncated frame id-length".into()))?
            .try_into()
            .unwrap(),
    ) as usize;
    let id_start = 5;
    let id_end = id_start + id_len;
    let session_id = std::str::from_utf8(
        frame
            .get(id_start..id_end)
            .ok_or_else(|| CoreError::ConfigError("truncated session id".into()))?,
    )
    .map_err(|_| CoreError::ConfigError("session id is not valid utf-8".into()))?
    .to_string();

    let payload = &frame[id_end..];
    if payload.len() < 32 {
        return Err(CoreError::ConfigError("truncated payload header".into()));
    }
    if payload[0..2] != PAYLOAD_MAGIC {
        return Err(CoreError::ConfigError("bad payload magic".into()));
    }
    let cols = u32::from_le_bytes(payload[4..8].try_into().unwrap());
    let rows = u32::from_le_bytes(payload[8..12].try_into().unwrap());
    let viewport_y = u32::from_le_bytes(payload[12..16].try_into().unwrap());
    let cursor_x = u32::from_le_bytes(payload[16..20].try_into().unwrap());
    let cursor_y = u32::from_le_bytes(payload[20..24].try_into().unwrap());

    let mut grid: Vec<Vec<Cell>> = Vec::new();
    let mut pos = 32usize;
    while grid.len() < rows as usize {
        let op = *payload
            .get(pos)
            .ok_or_else(|| CoreError::ConfigError("truncated row stream".into()))?;
        pos += 1;
        match op {
            ROW_OP_EMPTY => {
                let count = *payload
                    .get(pos)
                    .ok_or_else(|| CoreError::ConfigError("truncated empty-row count".into()))?;
                pos += 1;
                for _ in 0..count {
                    grid.push(vec![Cell::default(); cols as usize]);
                }
            }
            ROW_OP_CONTENT => {
                let cell_count = u16::from_le_bytes(
                    payload
                        .get(pos..pos + 2)
                        .ok_or_else(|| CoreError::ConfigError("truncated cell count".into()))?
                        .try_into()
                        .unwrap(),
                ) as usize;
                pos += 2;
                let mut row = Vec::with_capacity(cell_count);
                for _ in 0..cell_count {
                    row.push(decode_cell(payload, &mut pos)?);
                }
                grid.push(row);
            }
            other => {
                return Err(CoreError::ConfigError(format!("unknown row opcode: {other:#x}")));
            }
        }
    }

    Ok((
        session_id,
        ScreenSnapshot {
            cols,
            rows,
            viewport_y,
            cursor_x,
            cursor_y,
            grid,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::screen::ScreenModel;

    #[test]
    fn text_record_output_round_trips() {
        let record = TextRecord::Output {
            t: 1.5,
            data: b"hello\n".to_vec(),
        };
        let line = encode_text_record(&record);
        assert!(line.ends_with('\n'));
        let decoded = decode_text_record(&line).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn text_record_resize_round_trips() {
        let record = TextRecord::Resize { t: 0.0, cols: 80, rows: 24 };
        let line = encode_text_record(&record);
        assert_eq!(decode_text_record(&line).unwrap(), record);
    }

    #[test]
    fn text_record_exit_round_trips() {
        let record = TextRecord::Exit { code: 0, session_id: "abc".to_string() };
        let line = encode_text_record(&record);
        assert_eq!(decode_text_record(&line).unwrap(), record);
    }

    #[test]
    fn snapshot_frame_round_trips_exactly() {
        let mut model = ScreenModel::new(6, 2);
        model.feed(b"\x1b[31mhi\x1b[0m");
        let snapshot = model.snapshot();
        let frame = encode_snapshot_frame("sess-1", &snapshot);
        let (id, decoded) = decode_snapshot_frame(&frame).unwrap();
        assert_eq!(id, "sess-1");
        assert_eq!(decoded.cols, snapshot.cols);
        assert_eq!(decoded.rows, snapshot.rows);
        assert_eq!(decoded.cursor_x, snapshot.cursor_x);
        assert_eq!(decoded.cursor_y, snapshot.cursor_y);
        for (a, b) in decoded.grid.iter().zip(snapshot.grid.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn text_record_dropped_round_trips() {
        let record = TextRecord::Dropped { total_drops: 7 };
        let line = encode_text_record(&record);
        assert_eq!(decode_text_record(&line).unwrap(), record);
    }

    #[test]
    fn key_name_round_trips() {
        let encoded = encode_key_name("ArrowUp");
        assert_eq!(encoded, b"\x00ArrowUp\x00");
        assert_eq!(decode_key_name(&encoded), Some("ArrowUp"));
    }

    #[test]
    fn decode_key_name_rejects_plain_bytes() {
        assert_eq!(decode_key_name(b"hello"), None);
    }

    #[test]
    fn snapshot_frame_round_trips_mixed_palette_and_rgb_colors() {
        let mut model = ScreenModel::new(6, 2);
        // Palette fg (1 byte), RGB bg (3 bytes) on the same cell: exercises
        // the per-channel RGB flag, not just a uniform-color row.
        model.feed(b"\x1b[33m\x1b[48;2;10;20;30mhi\x1b[0m");
        let snapshot = model.snapshot();
        let frame = encode_snapshot_frame("sess-1", &snapshot);
        let (_, decoded) = decode_snapshot_frame(&frame).unwrap();
        for (a, b) in decoded.grid.iter().zip(snapshot.grid.iter()) {
            assert_eq!(a, b);
        }
        assert_eq!(decoded.grid[0][0].fg, Color::Indexed(3));
        assert_eq!(decoded.grid[0][0].bg, Color::Rgb(10, 20, 30));
    }

    #[test]
    fn all_empty_rows_encode_compactly() {
        let model = ScreenModel::new(10, 4);
        let snapshot = model.snapshot();
        let frame = encode_snapshot_frame("s", &snapshot);
        // header(32) + envelope(1+4+1) + 2 empty-row ops = small
        assert!(frame.len() < 50);
        let (_, decoded) = decode_snapshot_frame(&frame).unwrap();
        assert_eq!(decoded.grid.len(), 4);
    }
}
