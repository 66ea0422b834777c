// License consent gate
//
// FAIL-CLOSED: only an explicit accept token counts as consent. Empty input, any other
// text, EOF and Ctrl-C are all refusals of some kind.

use anyhow::Result;
use log::{info, warn};

use crate::prompt::{answer_is, Prompt, Prompter, Reply};

const ACCEPT_TOKENS: &[&str] = &["a", "accept"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consent {
    Accepted,
    Declined,
    Interrupted,
}

pub struct LicenseGate;

impl LicenseGate {
    /// Show `license_text` and wait for the user's decision.
    pub async fn present(prompter: &dyn Prompter, license_text: &str) -> Result<Consent> {
        let reply = prompter.ask(&Prompt::license(license_text)).await?;
        let consent = match reply {
            Reply::Answer(a) if answer_is(&a, ACCEPT_TOKENS) => Consent::Accepted,
            Reply::Answer(_) | Reply::Cancelled => Consent::Declined,
            Reply::Interrupted => Consent::Interrupted,
        };

        match consent {
            Consent::Accepted => info!("[PHASE: license] [STEP: consent] License accepted"),
            Consent::Declined => warn!("[PHASE: license] [STEP: consent] License not accepted"),
            Consent::Interrupted => warn!("[PHASE: license] [STEP: consent] Interrupted at license prompt"),
        }
        Ok(consent)
    }
}
