//! Edit steps over plain text documents, with position rebasing.
//!
//! A step is a single insert or delete addressed by character offsets.
//! Rebasing maps a step's positions through a step that was committed
//! ahead of it, so a client can replay its local edits on top of newer
//! authoritative state. A step whose target was entirely deleted by the
//! committed step rebases to nothing.

use serde::{Deserialize, Serialize};

/// One edit step. Offsets are character positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Step {
    Insert { pos: usize, text: String },
    Delete { from: usize, to: usize },
}

impl Step {
    /// Apply this step to a document, rejecting out-of-range positions.
    pub fn apply(&self, doc: &str) -> Result<String, StepError> {
        let chars: Vec<char> = doc.chars().collect();
        match self {
            Step::Insert { pos, text } => {
                if *pos > chars.len() {
                    return Err(StepError::OutOfBounds {
                        pos: *pos,
                        len: chars.len(),
                    });
                }
                let mut out: String = chars[..*pos].iter().collect();
                out.push_str(text);
                out.extend(&chars[*pos..]);
                Ok(out)
            }
            Step::Delete { from, to } => {
                if from > to || *to > chars.len() {
                    return Err(StepError::OutOfBounds {
                        pos: *to,
                        len: chars.len(),
                    });
                }
                let mut out: String = chars[..*from].iter().collect();
                out.extend(&chars[*to..]);
                Ok(out)
            }
        }
    }

    /// Map a position through a committed step.
    fn map_pos(pos: usize, committed: &Step) -> usize {
        match committed {
            Step::Insert { pos: at, text } => {
                if pos < *at {
                    pos
                } else {
                    pos + text.chars().count()
                }
            }
            Step::Delete { from, to } => {
                if pos <= *from {
                    pos
                } else if pos >= *to {
                    pos - (to - from)
                } else {
                    *from
                }
            }
        }
    }

    /// Rebase this step over a step committed before it. `None` means the
    /// step no longer has anything to do (its whole range was deleted).
    pub fn rebase(&self, committed: &Step) -> Option<Step> {
        match self {
            Step::Insert { pos, text } => Some(Step::Insert {
                pos: Self::map_pos(*pos, committed),
                text: text.clone(),
            }),
            Step::Delete { from, to } => {
                let from = Self::map_pos(*from, committed);
                let to = Self::map_pos(*to, committed);
                if from >= to {
                    None
                } else {
                    Some(Step::Delete { from, to })
                }
            }
        }
    }
}

/// Rebase a queue of steps over a sequence of committed steps, in commit
/// order. Steps that map to nothing fall out of the queue.
pub fn rebase_steps(mine: &[Step], committed: &[Step]) -> Vec<Step> {
    let mut result: Vec<Step> = mine.to_vec();
    for c in committed {
        result = result.iter().filter_map(|s| s.rebase(c)).collect();
    }
    result
}

/// Step application errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    OutOfBounds { pos: usize, len: usize },
}

impl std::fmt::Display for StepError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepError::OutOfBounds { pos, len } => {
                write!(f, "step position {pos} out of bounds for document of length {len}")
            }
        }
    }
}

impl std::error::Error for StepError {}
