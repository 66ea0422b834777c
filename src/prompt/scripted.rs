// Scripted prompter: replays an expected conversation.
//
// Each step pairs a regex the displayed prompt must match with the raw keystrokes to
// type (control characters included, e.g. "\x7f" for backspace). Keystrokes run through
// the same LineEditor as the terminal, starting from the prompt's prefilled default.

use anyhow::Result;
use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Mutex;

use super::editor::{EditKey, EditOutcome, LineEditor};
use super::{Prompt, Prompter, Reply};

#[derive(Debug, Clone)]
enum Input {
    Keys(String),
    Interrupt,
    Eof,
}

#[derive(Debug, Clone)]
struct Step {
    expect: String,
    input: Input,
}

#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    steps: Mutex<VecDeque<Step>>,
    transcript: Mutex<Vec<String>>,
}

impl ScriptedPrompter {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(self, expect: &str, input: Input) -> Self {
        if let Ok(mut steps) = self.steps.lock() {
            steps.push_back(Step {
                expect: expect.to_string(),
                input,
            });
        }
        self
    }

    /// Expect a prompt matching `expect`, then type `keys`. A missing trailing newline
    /// is implied.
    pub fn answer(self, expect: &str, keys: &str) -> Self {
        self.push(expect, Input::Keys(keys.to_string()))
    }

    /// Expect a prompt matching `expect`, then press Ctrl-C.
    pub fn interrupt(self, expect: &str) -> Self {
        self.push(expect, Input::Interrupt)
    }

    /// Expect a prompt matching `expect`, then close the input.
    pub fn eof(self, expect: &str) -> Self {
        self.push(expect, Input::Eof)
    }

    /// Steps not consumed yet.
    pub fn remaining(&self) -> usize {
        self.steps.lock().map(|s| s.len()).unwrap_or(0)
    }

    /// Everything shown so far: prompts, messages (`say:`) and warnings (`warn:`).
    pub fn transcript(&self) -> Vec<String> {
        self.transcript.lock().map(|t| t.clone()).unwrap_or_default()
    }

    /// Transcript joined into one string, for substring assertions.
    pub fn output(&self) -> String {
        self.transcript().join("\n")
    }

    fn record(&self, line: String) {
        if let Ok(mut t) = self.transcript.lock() {
            t.push(line);
        }
    }
}

fn type_keys(prefill: &str, keys: &str) -> Reply {
    let mut editor = LineEditor::new(prefill);
    for c in keys.chars() {
        match editor.handle_key(EditKey::from_raw(c)) {
            EditOutcome::Continue => {}
            EditOutcome::Submit(v) => return Reply::Answer(v),
            EditOutcome::Cancelled => return Reply::Cancelled,
            EditOutcome::Interrupted => return Reply::Interrupted,
        }
    }
    Reply::Answer(editor.value())
}

#[async_trait]
impl Prompter for ScriptedPrompter {
    async fn ask(&self, prompt: &Prompt) -> Result<Reply> {
        let shown = prompt.display();
        self.record(shown.clone());

        let step = self
            .steps
            .lock()
            .map_err(|_| anyhow::anyhow!("Script state poisoned"))?
            .pop_front()
            .ok_or_else(|| anyhow::anyhow!("Unexpected prompt, script exhausted: {:?}", shown))?;

        let re = Regex::new(&step.expect)
            .map_err(|e| anyhow::anyhow!("Invalid expectation {:?}: {}", step.expect, e))?;
        if !re.is_match(&shown) {
            return Err(anyhow::anyhow!(
                "Prompt {:?} doesn't match expectation {:?}",
                shown,
                step.expect
            ));
        }

        Ok(match step.input {
            Input::Keys(keys) => type_keys(&prompt.prefill, &keys),
            Input::Interrupt => Reply::Interrupted,
            Input::Eof => Reply::Cancelled,
        })
    }

    fn say(&self, message: &str) {
        self.record(format!("say: {}", message));
    }

    fn warn(&self, message: &str) {
        self.record(format!("warn: {}", message));
    }
}
