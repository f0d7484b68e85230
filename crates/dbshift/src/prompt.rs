//! Interactive confirmation.

use std::io::{self, BufRead, Write};

use crate::error::Result;

/// Asks the operator to confirm a plan.
pub trait Prompter: Send + Sync {
    /// Returns `true` when the operator accepts.
    fn confirm(&self, message: &str) -> Result<bool>;
}

/// Prompts on stdout and reads the answer from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdinPrompter;

impl Prompter for StdinPrompter {
    fn confirm(&self, message: &str) -> Result<bool> {
        confirm_with(&mut io::stdin().lock(), &mut io::stdout().lock(), message)
    }
}

/// Answers every prompt the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedPrompter(pub bool);

impl Prompter for FixedPrompter {
    fn confirm(&self, _message: &str) -> Result<bool> {
        Ok(self.0)
    }
}

/// Writes `message [y/N]: ` and reads one line. Only `y`/`yes` accept;
/// EOF declines.
pub fn confirm_with<R: BufRead, W: Write>(input: &mut R, output: &mut W, message: &str) -> Result<bool> {
    write!(output, "{message} [y/N]: ")?;
    output.flush()?;
    let mut answer = String::new();
    input.read_line(&mut answer)?;
    let answer = answer.trim().to_ascii_lowercase();
    Ok(matches!(answer.as_str(), "y" | "yes"))
}
