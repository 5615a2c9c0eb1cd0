//! Form payloads submitted by the HTML pages and their validation rules.
//!
//! Every form deserializes leniently (missing fields become empty strings) and
//! exposes a `clean` method returning either the normalized values or a list
//! of human readable messages suitable for re-rendering the page.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError, ValidationErrors};

pub const MAX_TEXT_LEN: u64 = 200;
pub const CHOICE_SLOTS: usize = 4;

const USERNAME_SYMBOLS: &str = "@.+-_";

/// Validation messages collected from a rejected form, in field order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FormErrors {
    messages: Vec<String>,
}

impl FormErrors {
    pub fn single(message: impl Into<String>) -> Self {
        Self {
            messages: vec![message.into()],
        }
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[String] {
        &self.messages
    }

    fn into_result<T>(self, value: T) -> Result<T, Self> {
        if self.is_empty() {
            Ok(value)
        } else {
            Err(self)
        }
    }
}

impl From<ValidationErrors> for FormErrors {
    fn from(errors: ValidationErrors) -> Self {
        let by_field: BTreeMap<String, Vec<String>> = errors
            .field_errors()
            .into_iter()
            .map(|(field, errs)| {
                let messages = errs
                    .iter()
                    .map(|err| match &err.message {
                        Some(message) => message.to_string(),
                        None => format!("{field}: {}", err.code),
                    })
                    .collect();
                (field.to_string(), messages)
            })
            .collect();

        Self {
            messages: by_field.into_values().flatten().collect(),
        }
    }
}

fn collect(form: &impl Validate) -> FormErrors {
    match form.validate() {
        Ok(()) => FormErrors::default(),
        Err(errors) => errors.into(),
    }
}

fn username_characters(value: &str) -> Result<(), ValidationError> {
    if value
        .chars()
        .all(|c| c.is_alphanumeric() || USERNAME_SYMBOLS.contains(c))
    {
        Ok(())
    } else {
        Err(ValidationError::new("username_characters"))
    }
}

fn not_entirely_numeric(value: &str) -> Result<(), ValidationError> {
    if !value.is_empty() && value.chars().all(|c| c.is_ascii_digit()) {
        return Err(ValidationError::new("password_numeric"));
    }
    Ok(())
}

/// Sign-up form with password confirmation.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct RegisterForm {
    #[serde(default)]
    #[validate(length(
        min = 1,
        max = 150,
        message = "Username must be between 1 and 150 characters."
    ))]
    #[validate(custom(
        function = "username_characters",
        message = "Username may contain only letters, digits and @/./+/-/_ characters."
    ))]
    pub username: String,
    #[serde(default)]
    #[validate(length(
        min = 8,
        message = "This password is too short. It must contain at least 8 characters."
    ))]
    #[validate(custom(
        function = "not_entirely_numeric",
        message = "This password is entirely numeric."
    ))]
    pub password1: String,
    #[serde(default)]
    pub password2: String,
}

/// Validated sign-up request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewAccount {
    pub username: String,
    pub password: String,
}

impl RegisterForm {
    pub fn clean(mut self) -> Result<NewAccount, FormErrors> {
        self.username = self.username.trim().to_string();
        let mut errors = collect(&self);
        if self.password1 != self.password2 {
            errors.push("The two password fields didn't match.");
        }
        if !self.username.is_empty() && self.password1.eq_ignore_ascii_case(&self.username) {
            errors.push("The password is too similar to the username.");
        }
        errors.into_result(NewAccount {
            username: self.username,
            password: self.password1,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct LoginForm {
    #[serde(default)]
    #[validate(length(min = 1, message = "Username is required."))]
    pub username: String,
    #[serde(default)]
    #[validate(length(min = 1, message = "Password is required."))]
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl LoginForm {
    pub fn clean(mut self) -> Result<Credentials, FormErrors> {
        self.username = self.username.trim().to_string();
        collect(&self).into_result(Credentials {
            username: self.username,
            password: self.password,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct QuizForm {
    #[serde(default)]
    #[validate(length(
        min = 1,
        max = 200,
        message = "Title must be between 1 and 200 characters."
    ))]
    pub title: String,
}

impl QuizForm {
    /// Returns the trimmed title.
    pub fn clean(mut self) -> Result<String, FormErrors> {
        self.title = self.title.trim().to_string();
        collect(&self).into_result(self.title)
    }
}

/// A question with up to [`CHOICE_SLOTS`] answer fields. Blank answers are ignored.
#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct QuestionForm {
    #[serde(default)]
    #[validate(length(
        min = 1,
        max = 200,
        message = "Question text must be between 1 and 200 characters."
    ))]
    pub question_text: String,
    #[serde(default)]
    pub choice_1: String,
    #[serde(default)]
    pub choice_2: String,
    #[serde(default)]
    pub choice_3: String,
    #[serde(default)]
    pub choice_4: String,
    #[serde(default)]
    pub add_more: Option<String>,
}

/// Validated question ready to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuestionDraft {
    pub question_text: String,
    pub choices: Vec<String>,
    /// The author asked to keep adding questions to the same quiz.
    pub add_more: bool,
}

impl QuestionForm {
    /// Raw choice inputs in form order, for redisplaying the form.
    pub fn choice_values(&self) -> [&str; CHOICE_SLOTS] {
        [
            self.choice_1.as_str(),
            self.choice_2.as_str(),
            self.choice_3.as_str(),
            self.choice_4.as_str(),
        ]
    }

    pub fn clean(mut self) -> Result<QuestionDraft, FormErrors> {
        self.question_text = self.question_text.trim().to_string();
        let mut errors = collect(&self);

        let choices: Vec<String> = self
            .choice_values()
            .into_iter()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
            .collect();

        if choices.is_empty() {
            errors.push("Add at least one choice.");
        }
        if choices
            .iter()
            .any(|choice| choice.chars().count() as u64 > MAX_TEXT_LEN)
        {
            errors.push("Choices must be at most 200 characters.");
        }

        errors.into_result(QuestionDraft {
            question_text: self.question_text,
            choices,
            add_more: self.add_more.is_some(),
        })
    }
}

/// Ballot submitted from the question page.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VoteForm {
    #[serde(default)]
    pub choice: Option<String>,
}

impl VoteForm {
    /// Returns the selected choice id, or `None` when nothing usable was submitted.
    pub fn selected(&self) -> Option<i64> {
        self.choice
            .as_deref()
            .and_then(|raw| raw.trim().parse::<i64>().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register(username: &str, password1: &str, password2: &str) -> RegisterForm {
        RegisterForm {
            username: username.into(),
            password1: password1.into(),
            password2: password2.into(),
        }
    }

    #[test]
    fn register_accepts_valid_input_and_trims_username() {
        let account = register("  alice ", "correct-horse", "correct-horse")
            .clean()
            .expect("valid form");
        assert_eq!(account.username, "alice");
        assert_eq!(account.password, "correct-horse");
    }

    #[test]
    fn register_reports_mismatched_passwords() {
        let errors = register("alice", "correct-horse", "battery-staple")
            .clean()
            .unwrap_err();
        assert_eq!(
            errors.messages(),
            ["The two password fields didn't match.".to_string()]
        );
    }

    #[test]
    fn register_rejects_short_and_numeric_passwords() {
        let errors = register("alice", "1234", "1234").clean().unwrap_err();
        assert!(errors
            .messages()
            .iter()
            .any(|m| m.contains("too short")));
        assert!(errors
            .messages()
            .iter()
            .any(|m| m.contains("entirely numeric")));
    }

    #[test]
    fn register_rejects_invalid_username_characters() {
        let errors = register("bad name!", "correct-horse", "correct-horse")
            .clean()
            .unwrap_err();
        assert!(errors.messages()[0].starts_with("Username may contain only"));
    }

    #[test]
    fn register_rejects_password_equal_to_username() {
        let errors = register("Longusername", "longUSERNAME", "longUSERNAME")
            .clean()
            .unwrap_err();
        assert!(errors
            .messages()
            .iter()
            .any(|m| m.contains("too similar")));
    }

    #[test]
    fn register_bounds_username_length() {
        let errors = register(&"a".repeat(151), "correct-horse", "correct-horse")
            .clean()
            .unwrap_err();
        assert_eq!(
            errors.messages(),
            ["Username must be between 1 and 150 characters.".to_string()]
        );

        let account = register(&"a".repeat(150), "correct-horse", "correct-horse")
            .clean()
            .expect("150 characters is allowed");
        assert_eq!(account.username.len(), 150);
    }

    #[test]
    fn login_requires_both_fields() {
        let errors = LoginForm::default().clean().unwrap_err();
        assert_eq!(errors.messages().len(), 2);
    }

    #[test]
    fn quiz_title_is_trimmed_and_bounded() {
        let title = QuizForm {
            title: "  Capitals  ".into(),
        }
        .clean()
        .expect("valid title");
        assert_eq!(title, "Capitals");

        assert!(QuizForm { title: "   ".into() }.clean().is_err());
        assert!(QuizForm {
            title: "x".repeat(201)
        }
        .clean()
        .is_err());
    }

    #[test]
    fn question_drops_blank_choices() {
        let draft = QuestionForm {
            question_text: "Capital of France?".into(),
            choice_1: "Paris".into(),
            choice_2: "   ".into(),
            choice_3: "".into(),
            choice_4: " Lyon ".into(),
            add_more: Some("1".into()),
        }
        .clean()
        .expect("valid question");

        assert_eq!(draft.choices, vec!["Paris".to_string(), "Lyon".to_string()]);
        assert!(draft.add_more);
    }

    #[test]
    fn question_requires_a_choice() {
        let errors = QuestionForm {
            question_text: "Empty?".into(),
            ..QuestionForm::default()
        }
        .clean()
        .unwrap_err();
        assert_eq!(errors.messages(), ["Add at least one choice.".to_string()]);
    }

    #[test]
    fn question_rejects_overlong_choices() {
        let errors = QuestionForm {
            question_text: "Longest word?".into(),
            choice_1: "short".into(),
            choice_2: "x".repeat(201),
            ..QuestionForm::default()
        }
        .clean()
        .unwrap_err();
        assert_eq!(
            errors.messages(),
            ["Choices must be at most 200 characters.".to_string()]
        );

        let draft = QuestionForm {
            question_text: "Longest word?".into(),
            choice_1: "é".repeat(200),
            ..QuestionForm::default()
        }
        .clean()
        .expect("200 characters is allowed");
        assert_eq!(draft.choices[0].chars().count(), 200);
    }

    #[test]
    fn vote_form_parses_choice_ids() {
        let form = VoteForm {
            choice: Some(" 12 ".into()),
        };
        assert_eq!(form.selected(), Some(12));
        assert_eq!(VoteForm { choice: None }.selected(), None);
        assert_eq!(
            VoteForm {
                choice: Some("abc".into())
            }
            .selected(),
            None
        );
    }
}
