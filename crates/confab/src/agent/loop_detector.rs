//! Detection of repetitive tool-call loops.
//!
//! Agents occasionally get stuck re-issuing the same call with identical
//! arguments, burning iterations without progress. The detector keeps a
//! bounded window of recent single calls; when the window fills with
//! identical entries it clears, counts a strike, and queues a corrective
//! instruction for the next user-turn slot. Enough strikes end the session.
//!
//! Parallel batches (two or more simultaneous calls) clear the window:
//! a model fanning out over several calls is making progress even when an
//! individual call repeats.

use crate::ToolCall;
use std::collections::VecDeque;
use tracing::{debug, warn};

/// Number of consecutive identical single calls that count as one strike.
pub const LOOP_WINDOW: usize = 5;

/// Number of strikes that terminate the session.
pub const LOOP_RETRY_CAP: u32 = 5;

/// Verdict for one observed batch of tool calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopVerdict {
    /// No repetition detected.
    Clean,
    /// The window filled with identical calls. A corrective hint has been
    /// queued; the session continues.
    Warned { name: String, strikes: u32 },
    /// The strike cap was reached. The session must end with a
    /// loop-exhaustion error.
    Exhausted { name: String },
}

/// Tracks repetitive tool calls across iterations.
#[derive(Debug)]
pub struct LoopDetector {
    window: VecDeque<(String, String)>,
    strikes: u32,
    pending_hint: Option<String>,
}

impl LoopDetector {
    pub fn new() -> Self {
        Self {
            window: VecDeque::with_capacity(LOOP_WINDOW),
            strikes: 0,
            pending_hint: None,
        }
    }

    /// Observe the tool calls of one assistant turn.
    pub fn observe(&mut self, calls: &[ToolCall]) -> LoopVerdict {
        if calls.len() >= 2 {
            // Parallel batch: the model is branching, not spinning.
            self.window.clear();
            return LoopVerdict::Clean;
        }
        let Some(call) = calls.first() else {
            return LoopVerdict::Clean;
        };

        let entry = (
            call.function.name.clone(),
            call.function.arguments.clone(),
        );
        self.window.push_back(entry);
        if self.window.len() < LOOP_WINDOW {
            return LoopVerdict::Clean;
        }

        let all_identical = {
            let first = &self.window[0];
            self.window.iter().all(|e| e == first)
        };
        if !all_identical {
            self.window.pop_front();
            return LoopVerdict::Clean;
        }

        let name = call.function.name.clone();
        self.window.clear();
        self.strikes += 1;
        debug!("Identical call window for {name}, strike {}", self.strikes);

        if self.strikes >= LOOP_RETRY_CAP {
            warn!("Loop retry cap reached for {name}");
            return LoopVerdict::Exhausted { name };
        }

        self.pending_hint = Some(format!(
            "You have called the tool '{name}' {LOOP_WINDOW} times in a row \
             with identical arguments. Repeating the same call will not \
             produce a different result. Re-read the previous tool results, \
             then either change the arguments, use a different tool, or \
             explain to the user why you are stuck."
        ));
        LoopVerdict::Warned {
            name,
            strikes: self.strikes,
        }
    }

    /// Take the queued corrective instruction, if any. The runner injects
    /// it into the next user-turn slot.
    pub fn take_hint(&mut self) -> Option<String> {
        self.pending_hint.take()
    }

    /// Current strike count.
    pub fn strikes(&self) -> u32 {
        self.strikes
    }
}

impl Default for LoopDetector {
    fn default() -> Self {
        Self::new()
    }
}
