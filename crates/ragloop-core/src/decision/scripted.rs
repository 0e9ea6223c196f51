use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::anyhow;
use async_trait::async_trait;

use super::{DecisionInput, DecisionProvider, render_reply};
use crate::action::EvaluationAction;
use crate::context::MemoryUpdate;

/// One scripted provider reply.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Raw reply text, passed through the validator untouched.
    Raw(String),
    /// A provider-side failure such as a transport error.
    Error(String),
}

impl ScriptedReply {
    pub fn action(action: EvaluationAction) -> Self {
        Self::Raw(render_reply(&action, None))
    }

    pub fn with_memory(action: EvaluationAction, memory: MemoryUpdate) -> Self {
        Self::Raw(render_reply(&action, Some(&memory)))
    }
}

/// Deterministic decision provider that replays a script.
///
/// Once the script runs out the last reply repeats, so a single
/// `QueryMoreDocs` reply drives the loop until a budget stops it. Every
/// snapshot received is kept for later inspection.
#[derive(Debug)]
pub struct ScriptedDecisionProvider {
    replies: Vec<ScriptedReply>,
    cursor: AtomicUsize,
    inputs: Mutex<Vec<DecisionInput>>,
}

impl ScriptedDecisionProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies,
            cursor: AtomicUsize::new(0),
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn from_actions(actions: Vec<EvaluationAction>) -> Self {
        Self::new(actions.into_iter().map(ScriptedReply::action).collect())
    }

    /// Number of `decide` calls served so far.
    pub fn calls(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    pub fn inputs(&self) -> Vec<DecisionInput> {
        self.inputs
            .lock()
            .map(|inputs| inputs.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DecisionProvider for ScriptedDecisionProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn decide(&self, input: &DecisionInput) -> anyhow::Result<String> {
        if let Ok(mut inputs) = self.inputs.lock() {
            inputs.push(input.clone());
        }
        let index = self.cursor.fetch_add(1, Ordering::SeqCst);
        let reply = self
            .replies
            .get(index)
            .or_else(|| self.replies.last())
            .cloned()
            .unwrap_or_else(|| {
                ScriptedReply::action(EvaluationAction::return_answer("script is empty"))
            });

        match reply {
            ScriptedReply::Raw(text) => Ok(text),
            ScriptedReply::Error(message) => Err(anyhow!(message)),
        }
    }
}
