//! Actions the decision provider may choose between loop iterations.
//!
//! The set of actions offered at a step is an [`ActionVocabulary`], derived
//! fresh from the remaining budgets. A capability that is switched off never
//! enters the vocabulary, so the decision provider cannot be shown it and the
//! parser rejects it if it is named anyway.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One corrective step chosen by the decision provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EvaluationAction {
    ReturnAnswer {
        reason: String,
    },
    QueryMoreDocs {
        queries: Vec<String>,
        reason: String,
    },
    SearchWeb {
        queries: Vec<String>,
        reason: String,
    },
    RefineAnswer {
        focus_areas: Vec<String>,
        reason: String,
    },
}

impl EvaluationAction {
    pub fn return_answer(reason: impl Into<String>) -> Self {
        Self::ReturnAnswer {
            reason: reason.into(),
        }
    }

    pub fn kind(&self) -> ActionKind {
        match self {
            Self::ReturnAnswer { .. } => ActionKind::ReturnAnswer,
            Self::QueryMoreDocs { .. } => ActionKind::QueryMoreDocs,
            Self::SearchWeb { .. } => ActionKind::SearchWeb,
            Self::RefineAnswer { .. } => ActionKind::RefineAnswer,
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            Self::ReturnAnswer { reason }
            | Self::QueryMoreDocs { reason, .. }
            | Self::SearchWeb { reason, .. }
            | Self::RefineAnswer { reason, .. } => reason,
        }
    }
}

/// Discriminant of [`EvaluationAction`], used for vocabularies and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    ReturnAnswer,
    QueryMoreDocs,
    SearchWeb,
    RefineAnswer,
}

impl ActionKind {
    pub const ALL: [ActionKind; 4] = [
        ActionKind::ReturnAnswer,
        ActionKind::QueryMoreDocs,
        ActionKind::SearchWeb,
        ActionKind::RefineAnswer,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::ReturnAnswer => "return_answer",
            ActionKind::QueryMoreDocs => "query_more_docs",
            ActionKind::SearchWeb => "search_web",
            ActionKind::RefineAnswer => "refine_answer",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
    }

    /// Short description used when the action menu is rendered for a model.
    pub fn describe(&self) -> &'static str {
        match self {
            ActionKind::ReturnAnswer => "the answer is good enough; return it as is",
            ActionKind::QueryMoreDocs => "run up to 2 additional queries against the indexed docs",
            ActionKind::SearchWeb => "run up to 2 web searches for material the docs lack",
            ActionKind::RefineAnswer => "rewrite the answer using everything gathered so far",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Remaining per-run budgets for the bounded actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budgets {
    pub doc_queries_remaining: usize,
    pub web_searches_remaining: usize,
}

/// Actions available at a given step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionVocabulary {
    kinds: Vec<ActionKind>,
}

impl ActionVocabulary {
    /// Derive the vocabulary from the remaining budgets.
    ///
    /// `web_available` must already fold in both the capability switch and
    /// whether a web collaborator is configured.
    pub fn derive(budgets: Budgets, web_available: bool, has_answer: bool) -> Self {
        let mut kinds = vec![ActionKind::ReturnAnswer];
        if budgets.doc_queries_remaining > 0 {
            kinds.push(ActionKind::QueryMoreDocs);
        }
        if web_available && budgets.web_searches_remaining > 0 {
            kinds.push(ActionKind::SearchWeb);
        }
        if has_answer {
            kinds.push(ActionKind::RefineAnswer);
        }
        Self { kinds }
    }

    pub fn contains(&self, kind: ActionKind) -> bool {
        self.kinds.contains(&kind)
    }

    pub fn kinds(&self) -> &[ActionKind] {
        &self.kinds
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budgets(docs: usize, web: usize) -> Budgets {
        Budgets {
            doc_queries_remaining: docs,
            web_searches_remaining: web,
        }
    }

    #[test]
    fn return_answer_is_always_offered() {
        let vocabulary = ActionVocabulary::derive(budgets(0, 0), false, false);
        assert_eq!(vocabulary.kinds(), &[ActionKind::ReturnAnswer]);
    }

    #[test]
    fn web_search_requires_capability_and_budget() {
        assert!(!ActionVocabulary::derive(budgets(2, 2), false, true).contains(ActionKind::SearchWeb));
        assert!(!ActionVocabulary::derive(budgets(2, 0), true, true).contains(ActionKind::SearchWeb));
        assert!(ActionVocabulary::derive(budgets(0, 1), true, true).contains(ActionKind::SearchWeb));
    }

    #[test]
    fn doc_queries_drop_out_when_exhausted() {
        let vocabulary = ActionVocabulary::derive(budgets(0, 0), false, true);
        assert!(!vocabulary.contains(ActionKind::QueryMoreDocs));
        assert!(vocabulary.contains(ActionKind::RefineAnswer));
    }

    #[test]
    fn action_kind_parse_is_lenient_about_separators() {
        assert_eq!(ActionKind::parse("Query-More-Docs"), Some(ActionKind::QueryMoreDocs));
        assert_eq!(ActionKind::parse("search web"), Some(ActionKind::SearchWeb));
        assert_eq!(ActionKind::parse("delete_everything"), None);
    }

    #[test]
    fn actions_serialize_with_type_tag() {
        let action = EvaluationAction::QueryMoreDocs {
            queries: vec!["x".into()],
            reason: "gap".into(),
        };
        let value = serde_json::to_value(&action).unwrap();
        assert_eq!(value["type"], "query_more_docs");
        assert_eq!(action.kind(), ActionKind::QueryMoreDocs);
        assert_eq!(action.reason(), "gap");
    }
}
