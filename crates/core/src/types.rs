use chrono::{DateTime, Utc};
use serde::Serialize;

/// Registered account. The password hash never leaves the storage layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// A quiz owned by the user that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Quiz {
    pub id: i64,
    pub title: String,
    pub creator_id: i64,
    pub created_at: DateTime<Utc>,
}

impl Quiz {
    /// Returns `true` when the given user may add questions to this quiz.
    pub fn is_owned_by(&self, user_id: i64) -> bool {
        self.creator_id == user_id
    }
}

/// Quiz listing row used on the index page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuizSummary {
    pub id: i64,
    pub title: String,
    pub creator_username: String,
    pub question_count: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Question {
    pub id: i64,
    pub quiz_id: i64,
    pub question_text: String,
    pub pub_date: DateTime<Utc>,
}

/// One answer option of a question together with its running vote count.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Choice {
    pub id: i64,
    pub question_id: i64,
    pub choice_text: String,
    pub votes: u32,
}

/// Result of attempting to record a vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum VoteOutcome {
    /// The vote was stored; `votes` is the choice's counter after the increment.
    Recorded { votes: u32 },
    AlreadyVoted,
}

impl VoteOutcome {
    pub fn is_recorded(self) -> bool {
        matches!(self, Self::Recorded { .. })
    }

    /// Label used for the `votes_total` metric.
    pub fn metric_label(self) -> &'static str {
        match self {
            Self::Recorded { .. } => "recorded",
            Self::AlreadyVoted => "already_voted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn vote_outcome_serializes_with_tag() {
        let value = serde_json::to_value(VoteOutcome::Recorded { votes: 3 }).unwrap();
        assert_eq!(value, json!({ "outcome": "recorded", "votes": 3 }));

        let value = serde_json::to_value(VoteOutcome::AlreadyVoted).unwrap();
        assert_eq!(value, json!({ "outcome": "already_voted" }));
    }

    #[test]
    fn quiz_ownership_checks_creator() {
        let quiz = Quiz {
            id: 1,
            title: "Capitals".into(),
            creator_id: 7,
            created_at: Utc::now(),
        };
        assert!(quiz.is_owned_by(7));
        assert!(!quiz.is_owned_by(8));
    }
}
