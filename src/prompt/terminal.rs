// Terminal prompter
//
// On a tty the answer line is edited in raw mode (crossterm key events) so the default
// is shown prefilled and editable. Without a tty, one line is read from stdin and an
// empty line accepts the default.

use anyhow::{Context, Result};
use async_trait::async_trait;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::style::Stylize;
use crossterm::terminal::{self, disable_raw_mode, enable_raw_mode, ClearType};
use crossterm::{cursor, QueueableCommand};
use std::io::{BufRead, IsTerminal, Write};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::editor::{EditKey, EditOutcome, LineEditor};
use super::{Prompt, Prompter, Reply};

pub struct TerminalPrompter {
    cancel: CancellationToken,
}

impl TerminalPrompter {
    /// `cancel` lets a pending key read give up when the session is torn down by a signal.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }
}

struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> Result<Self> {
        enable_raw_mode().context("Failed to enable raw terminal mode")?;
        Ok(RawModeGuard)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        let _ = disable_raw_mode();
    }
}

fn map_key(key: KeyEvent) -> Option<EditKey> {
    if key.kind == KeyEventKind::Release {
        return None;
    }
    let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);
    Some(match key.code {
        KeyCode::Char('c') if ctrl => EditKey::Interrupt,
        KeyCode::Char('d') if ctrl => EditKey::Eof,
        KeyCode::Char('u') if ctrl => EditKey::KillLine,
        KeyCode::Char('a') if ctrl => EditKey::Home,
        KeyCode::Char('e') if ctrl => EditKey::End,
        KeyCode::Char(_) if ctrl => return None,
        KeyCode::Char(c) => EditKey::Char(c),
        KeyCode::Backspace => EditKey::Backspace,
        KeyCode::Delete => EditKey::Delete,
        KeyCode::Left => EditKey::Left,
        KeyCode::Right => EditKey::Right,
        KeyCode::Home => EditKey::Home,
        KeyCode::End => EditKey::End,
        KeyCode::Enter => EditKey::Enter,
        _ => return None,
    })
}

fn redraw(out: &mut impl Write, lead: &str, editor: &LineEditor) -> Result<()> {
    let value = editor.value();
    let tail_chars = value.chars().count().saturating_sub(editor.cursor());
    out.queue(cursor::MoveToColumn(0))?;
    out.queue(terminal::Clear(ClearType::CurrentLine))?;
    write!(out, "{}{}", lead, value)?;
    if tail_chars > 0 {
        out.queue(cursor::MoveLeft(tail_chars as u16))?;
    }
    out.flush()?;
    Ok(())
}

/// Raw-mode edit loop. Polls so a cancelled session releases the terminal promptly.
fn edit_line_raw(prompt: &Prompt, cancel: &CancellationToken) -> Result<Reply> {
    let mut stdout = std::io::stdout();

    // Everything but the last line of the question is printed once, normally.
    let (head, lead) = match prompt.text.rsplit_once('\n') {
        Some((head, lead)) => (Some(head), lead),
        None => (None, prompt.text.as_str()),
    };
    if let Some(head) = head {
        writeln!(stdout, "{}", head)?;
    }

    let mut editor = LineEditor::new(prompt.prefill.clone());
    let _raw = RawModeGuard::enable()?;
    redraw(&mut stdout, lead, &editor)?;

    loop {
        if cancel.is_cancelled() {
            write!(stdout, "\r\n")?;
            return Ok(Reply::Interrupted);
        }
        if !event::poll(Duration::from_millis(100))? {
            continue;
        }
        let Event::Key(key) = event::read()? else {
            continue;
        };
        let Some(edit) = map_key(key) else {
            continue;
        };
        match editor.handle_key(edit) {
            EditOutcome::Continue => redraw(&mut stdout, lead, &editor)?,
            EditOutcome::Submit(v) => {
                write!(stdout, "\r\n")?;
                stdout.flush()?;
                return Ok(Reply::Answer(v));
            }
            EditOutcome::Cancelled => {
                write!(stdout, "\r\n")?;
                return Ok(Reply::Cancelled);
            }
            EditOutcome::Interrupted => {
                write!(stdout, "^C\r\n")?;
                return Ok(Reply::Interrupted);
            }
        }
    }
}

fn read_line_plain(prompt: &Prompt) -> Result<Reply> {
    let mut stdout = std::io::stdout();
    write!(stdout, "{}", prompt.display())?;
    stdout.flush()?;

    let mut line = String::new();
    let n = std::io::stdin()
        .lock()
        .read_line(&mut line)
        .context("Failed to read answer from stdin")?;
    if n == 0 {
        writeln!(stdout)?;
        return Ok(Reply::Cancelled);
    }

    let answer = line.trim_end_matches(['\n', '\r']);
    if answer.is_empty() {
        Ok(Reply::Answer(prompt.prefill.clone()))
    } else {
        Ok(Reply::Answer(answer.to_string()))
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn ask(&self, prompt: &Prompt) -> Result<Reply> {
        let prompt = prompt.clone();
        let cancel = self.cancel.clone();
        tokio::task::spawn_blocking(move || {
            if std::io::stdin().is_terminal() && std::io::stdout().is_terminal() {
                edit_line_raw(&prompt, &cancel)
            } else {
                read_line_plain(&prompt)
            }
        })
        .await
        .context("Prompt task failed")?
    }

    fn say(&self, message: &str) {
        println!("{}", message);
    }

    fn warn(&self, message: &str) {
        eprintln!("{}", message.yellow());
    }
}
