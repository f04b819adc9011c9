use serde::{Deserialize, Serialize};

use crate::types::ChatMessage;

/// One completed exchange with the agent under test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextTurn {
    pub input: String,
    pub response: String,
}

/// Prior turns handed to the agent with each new input, oldest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationContext {
    turns: Vec<ContextTurn>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self { turns: Vec::new() }
    }

    pub fn push(&mut self, input: impl Into<String>, response: impl Into<String>) {
        self.turns.push(ContextTurn {
            input: input.into(),
            response: response.into(),
        });
    }

    pub fn turns(&self) -> &[ContextTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn clear(&mut self) {
        self.turns.clear();
    }

    /// Alternating user/assistant messages, for chat-model agents.
    pub fn to_messages(&self) -> Vec<ChatMessage> {
        self.turns
            .iter()
            .flat_map(|turn| [ChatMessage::user(&turn.input), ChatMessage::assistant(&turn.response)])
            .collect()
    }
}
