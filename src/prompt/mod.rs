//! Request/response interface for every question the installer asks.
//!
//! The orchestrator never touches the terminal directly: it builds a [`Prompt`] and
//! awaits a [`Reply`] from a [`Prompter`]. The terminal implementation drives a real
//! tty; the scripted implementation replays expected prompts and keystrokes in tests.

pub mod editor;
pub mod scripted;
pub mod terminal;

use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;

pub use scripted::ScriptedPrompter;
pub use terminal::TerminalPrompter;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    InstallPath,
    License,
    NonEmptyDirectory,
    Reinstall,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub kind: PromptKind,
    /// Question text, shown before the editable area. May span several lines.
    pub text: String,
    /// Editable default placed in the input line.
    pub prefill: String,
}

impl Prompt {
    pub fn install_path(default: &Path) -> Self {
        Prompt {
            kind: PromptKind::InstallPath,
            text: "Choose installation path: ".to_string(),
            prefill: default.to_string_lossy().into_owned(),
        }
    }

    pub fn license(license_text: &str) -> Self {
        Prompt {
            kind: PromptKind::License,
            text: format!(
                "{}\n[I Accept (a)/I don't accept (N)] ",
                license_text.trim_end()
            ),
            prefill: String::new(),
        }
    }

    pub fn non_empty_directory(path: &Path) -> Self {
        Prompt {
            kind: PromptKind::NonEmptyDirectory,
            text: format!(
                "{} isn't an empty directory, do you want to remove its content and install there? [Install (i)/No (N)] ",
                path.display()
            ),
            prefill: String::new(),
        }
    }

    pub fn reinstall(framework_name: &str) -> Self {
        Prompt {
            kind: PromptKind::Reinstall,
            text: format!(
                "{} is already installed on your system, do you want to reinstall it anyway? [Yes (y)/No (N)] ",
                framework_name
            ),
            prefill: String::new(),
        }
    }

    /// What the user sees when the prompt is first drawn.
    pub fn display(&self) -> String {
        format!("{}{}", self.text, self.prefill)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Answer(String),
    /// End of input (Ctrl-D on an empty line, closed stdin).
    Cancelled,
    /// Ctrl-C while the prompt was active.
    Interrupted,
}

#[async_trait]
pub trait Prompter: Send + Sync {
    async fn ask(&self, prompt: &Prompt) -> Result<Reply>;

    /// Informational line for the user.
    fn say(&self, message: &str);

    /// Warning line for the user (invalid input, failed step).
    fn warn(&self, message: &str);
}

/// Case-insensitive match of a trimmed answer against accepted tokens.
pub fn answer_is(answer: &str, tokens: &[&str]) -> bool {
    let a = answer.trim();
    tokens.iter().any(|t| a.eq_ignore_ascii_case(t))
}
