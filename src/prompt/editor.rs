// Single-line editor with a prefilled, editable default.
//
// Shared by the terminal prompter (fed from key events) and the scripted prompter (fed
// from raw control characters), so both see identical editing semantics.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditKey {
    Char(char),
    Backspace,
    Delete,
    Left,
    Right,
    Home,
    End,
    /// Ctrl-U: clear everything before the cursor.
    KillLine,
    Enter,
    /// Ctrl-C
    Interrupt,
    /// Ctrl-D
    Eof,
}

impl EditKey {
    /// Map a raw input character the way a terminal line discipline would.
    pub fn from_raw(c: char) -> EditKey {
        match c {
            '\x7f' | '\x08' => EditKey::Backspace,
            '\r' | '\n' => EditKey::Enter,
            '\x03' => EditKey::Interrupt,
            '\x04' => EditKey::Eof,
            '\x15' => EditKey::KillLine,
            '\x01' => EditKey::Home,
            '\x05' => EditKey::End,
            other => EditKey::Char(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOutcome {
    Continue,
    Submit(String),
    Cancelled,
    Interrupted,
}

#[derive(Debug, Clone)]
pub struct LineEditor {
    chars: Vec<char>,
    cursor: usize,
}

impl LineEditor {
    pub fn new(prefill: impl Into<String>) -> Self {
        let chars: Vec<char> = prefill.into().chars().collect();
        Self {
            cursor: chars.len(),
            chars,
        }
    }

    pub fn value(&self) -> String {
        self.chars.iter().collect()
    }

    /// Cursor position in characters from the start of the value.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn handle_key(&mut self, key: EditKey) -> EditOutcome {
        match key {
            EditKey::Char(c) if !c.is_control() => {
                self.chars.insert(self.cursor, c);
                self.cursor += 1;
            }
            EditKey::Char(_) => {}
            EditKey::Backspace => {
                if self.cursor > 0 {
                    self.cursor -= 1;
                    self.chars.remove(self.cursor);
                }
            }
            EditKey::Delete => {
                if self.cursor < self.chars.len() {
                    self.chars.remove(self.cursor);
                }
            }
            EditKey::Left => self.cursor = self.cursor.saturating_sub(1),
            EditKey::Right => self.cursor = (self.cursor + 1).min(self.chars.len()),
            EditKey::Home => self.cursor = 0,
            EditKey::End => self.cursor = self.chars.len(),
            EditKey::KillLine => {
                self.chars.drain(..self.cursor);
                self.cursor = 0;
            }
            EditKey::Enter => return EditOutcome::Submit(self.value()),
            EditKey::Interrupt => return EditOutcome::Interrupted,
            // Readline semantics: EOF only on an empty line, delete otherwise.
            EditKey::Eof => {
                if self.chars.is_empty() {
                    return EditOutcome::Cancelled;
                }
                if self.cursor < self.chars.len() {
                    self.chars.remove(self.cursor);
                }
            }
        }
        EditOutcome::Continue
    }
}
