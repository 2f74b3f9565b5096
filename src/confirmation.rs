//! Confirmation gate: the only transitions that change `Highlight::is_user_confirmed`.
//!
//! Every function is pure. It takes the current [`SynthesisResult`] by reference and
//! returns the next one, so a rejected transition leaves the caller's value untouched.
//! The confirmed subset and the pending flag are derived from the flags on read.

use crate::error::{InsightError, Result};
use crate::schema::SynthesisResult;

/// Flips exactly one highlight's confirmation flag.
pub fn toggle(result: &SynthesisResult, highlight_id: &str) -> Result<SynthesisResult> {
    set_flag(result, highlight_id, |confirmed| !confirmed)
}

/// Marks one highlight confirmed, leaving it confirmed if it already was.
pub fn confirm(result: &SynthesisResult, highlight_id: &str) -> Result<SynthesisResult> {
    set_flag(result, highlight_id, |_| true)
}

pub fn confirm_all(result: &SynthesisResult) -> SynthesisResult {
    let mut next = result.clone();
    for highlight in next.highlights_mut() {
        highlight.is_user_confirmed = true;
    }
    next
}

fn set_flag(
    result: &SynthesisResult,
    highlight_id: &str,
    update: impl FnOnce(bool) -> bool,
) -> Result<SynthesisResult> {
    let mut next = result.clone();
    let highlight = next
        .highlights_mut()
        .iter_mut()
        .find(|h| h.id == highlight_id)
        .ok_or_else(|| InsightError::UnknownHighlight(highlight_id.to_string()))?;
    highlight.is_user_confirmed = update(highlight.is_user_confirmed);
    Ok(next)
}
