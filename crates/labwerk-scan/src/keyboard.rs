// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Keyboard-wedge decoding: HID boot-protocol reports to characters, and
// characters to newline-terminated codes.

use labwerk_core::types::ScanEvent;

/// Turns one raw input report into the characters it types.
pub trait ScancodeDecoder: Send {
    fn decode(&mut self, report: &[u8]) -> String;
}

const LEFT_SHIFT: u8 = 0x02;
const RIGHT_SHIFT: u8 = 0x20;
const ERROR_ROLL_OVER: u8 = 0x01;

/// Decoder for 8-byte HID boot keyboard reports.
///
/// Byte 0 holds the modifier bits and bytes 2..8 the usage ids of every key
/// currently held. A character is typed only when its key first appears, so
/// a held key or a release report produces nothing.
#[derive(Debug, Default, Clone)]
pub struct HidKeyboardDecoder {
    held: Vec<u8>,
}

impl HidKeyboardDecoder {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ScancodeDecoder for HidKeyboardDecoder {
    fn decode(&mut self, report: &[u8]) -> String {
        if report.len() < 3 {
            return String::new();
        }
        let shift = report[0] & (LEFT_SHIFT | RIGHT_SHIFT) != 0;
        let keys: Vec<u8> = report[2..].iter().copied().filter(|&k| k != 0).collect();
        if keys.contains(&ERROR_ROLL_OVER) {
            // Too many keys down; the report carries no usable state.
            return String::new();
        }

        let typed = keys
            .iter()
            .filter(|k| !self.held.contains(k))
            .filter_map(|&k| usage_to_char(k, shift))
            .collect();
        self.held = keys;
        typed
    }
}

/// Map a keyboard-page usage id to the character a US layout types.
pub fn usage_to_char(usage: u8, shift: bool) -> Option<char> {
    let pick = |plain: char, shifted: char| Some(if shift { shifted } else { plain });
    match usage {
        0x04..=0x1d => {
            let c = char::from(b'a' + (usage - 0x04));
            Some(if shift { c.to_ascii_uppercase() } else { c })
        }
        0x1e..=0x26 => {
            let digit = char::from(b'1' + (usage - 0x1e));
            if shift {
                "!@#$%^&*(".chars().nth(usize::from(usage - 0x1e))
            } else {
                Some(digit)
            }
        }
        0x27 => pick('0', ')'),
        0x28 | 0x58 => Some('\n'),
        0x2b => Some('\t'),
        0x2c => Some(' '),
        0x2d => pick('-', '_'),
        0x2e => pick('=', '+'),
        0x2f => pick('[', '{'),
        0x30 => pick(']', '}'),
        0x31 => pick('\\', '|'),
        0x33 => pick(';', ':'),
        0x34 => pick('\'', '"'),
        0x35 => pick('`', '~'),
        0x36 => pick(',', '<'),
        0x37 => pick('.', '>'),
        0x38 => pick('/', '?'),
        // Keypad
        0x54 => Some('/'),
        0x55 => Some('*'),
        0x56 => Some('-'),
        0x57 => Some('+'),
        0x59..=0x61 => Some(char::from(b'1' + (usage - 0x59))),
        0x62 => Some('0'),
        0x63 => Some('.'),
        _ => None,
    }
}

/// Accumulates typed characters until a newline completes a code.
#[derive(Debug, Default, Clone)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one character. A newline yields the buffered code, trimmed;
    /// blank lines yield nothing. The buffer is empty after every newline.
    pub fn push(&mut self, c: char) -> Option<ScanEvent> {
        if c != '\n' {
            self.pending.push(c);
            return None;
        }
        let line = std::mem::take(&mut self.pending);
        ScanEvent::new(&line)
    }

    pub fn extend(&mut self, text: &str) -> Vec<ScanEvent> {
        text.chars().filter_map(|c| self.push(c)).collect()
    }

    /// Characters received since the last newline.
    pub fn pending(&self) -> &str {
        &self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}
