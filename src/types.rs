use serde::{Deserialize, Serialize};

use crate::policy::ToolPolicy;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Per-run caller identity and effective policy. Built once before a run and
/// passed by reference into every tool call; the executor never mutates it.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub project_id: String,
    pub branch: String,
    pub user_id: String,
    pub conversation_id: String,
    pub policy: ToolPolicy,
}

impl CallContext {
    pub fn new(
        project_id: impl Into<String>,
        branch: impl Into<String>,
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        policy: ToolPolicy,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            branch: branch.into(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            policy,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerMode {
    OpenText,
    SingleChoice,
}

/// A paused-run question awaiting a human answer. Single-choice questions
/// need at least two distinct options; otherwise they demote to open text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingUserQuestion {
    pub id: String,
    pub question: String,
    pub answer_mode: AnswerMode,
    #[serde(default)]
    pub options: Vec<String>,
}

impl PendingUserQuestion {
    pub fn normalized(
        id: impl Into<String>,
        question: impl Into<String>,
        answer_mode: AnswerMode,
        raw_options: Vec<String>,
    ) -> Self {
        let mut options = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for raw in raw_options {
            let s = raw.trim().to_string();
            if s.is_empty() {
                continue;
            }
            if !seen.insert(s.to_lowercase()) {
                continue;
            }
            options.push(s);
            if options.len() >= 12 {
                break;
            }
        }
        let answer_mode = if answer_mode == AnswerMode::SingleChoice && options.len() < 2 {
            options.clear();
            AnswerMode::OpenText
        } else {
            answer_mode
        };
        Self {
            id: id.into(),
            question: question.into(),
            answer_mode,
            options,
        }
    }
}
