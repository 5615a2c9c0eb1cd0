use serde::Serialize;

/// One-shot notice shown on the page following a redirect.
///
/// Only the short [`Flash::code`] travels in the cookie; the text is
/// produced at render time so the cookie never carries user input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flash {
    LoggedIn,
    LoggedOut,
    Registered,
    QuizCreated,
    QuestionAdded,
    VoteRecorded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlashLevel {
    Success,
    Info,
}

/// Rendered flash ready for templates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FlashMessage {
    pub level: FlashLevel,
    pub text: String,
}

impl Flash {
    pub fn code(self) -> &'static str {
        match self {
            Self::LoggedIn => "logged_in",
            Self::LoggedOut => "logged_out",
            Self::Registered => "registered",
            Self::QuizCreated => "quiz_created",
            Self::QuestionAdded => "question_added",
            Self::VoteRecorded => "vote_recorded",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "logged_in" => Some(Self::LoggedIn),
            "logged_out" => Some(Self::LoggedOut),
            "registered" => Some(Self::Registered),
            "quiz_created" => Some(Self::QuizCreated),
            "question_added" => Some(Self::QuestionAdded),
            "vote_recorded" => Some(Self::VoteRecorded),
            _ => None,
        }
    }

    pub fn level(self) -> FlashLevel {
        match self {
            Self::LoggedOut => FlashLevel::Info,
            _ => FlashLevel::Success,
        }
    }

    /// Renders the message for the user viewing the next page.
    pub fn render(self, username: Option<&str>) -> FlashMessage {
        let text = match (self, username) {
            (Self::LoggedIn, Some(name)) => {
                format!("Welcome, {name}! You have been logged in.")
            }
            (Self::LoggedIn, None) => "You have been logged in.".to_string(),
            (Self::LoggedOut, _) => "You have successfully logged out.".to_string(),
            (Self::Registered, Some(name)) => {
                format!("Welcome, {name}! Your account has been created.")
            }
            (Self::Registered, None) => "Your account has been created.".to_string(),
            (Self::QuizCreated, _) => "Quiz created. Now add some questions.".to_string(),
            (Self::QuestionAdded, _) => "Question added.".to_string(),
            (Self::VoteRecorded, _) => "Thanks, your vote has been counted.".to_string(),
        };
        FlashMessage {
            level: self.level(),
            text,
        }
    }
}
