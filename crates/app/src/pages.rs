use std::{fmt::Display, sync::Arc};

use axum::{
    http::StatusCode,
    response::{Html, IntoResponse, Redirect, Response},
};
use tera::{Context, Tera};
use thiserror::Error;
use tracing::error;

use funquiz_storage::{
    ChoiceError, QuestionError, QuizError, SessionError, UserError, VoteError,
};

use crate::auth::PasswordError;

const TEMPLATES: &[(&str, &str)] = &[
    ("base.html", include_str!("../templates/base.html")),
    ("index.html", include_str!("../templates/index.html")),
    ("login.html", include_str!("../templates/login.html")),
    ("register.html", include_str!("../templates/register.html")),
    ("create_quiz.html", include_str!("../templates/create_quiz.html")),
    ("add_question.html", include_str!("../templates/add_question.html")),
    ("quiz_detail.html", include_str!("../templates/quiz_detail.html")),
    ("detail.html", include_str!("../templates/detail.html")),
    ("results.html", include_str!("../templates/results.html")),
];

/// Compiled HTML templates, embedded in the binary at build time.
#[derive(Clone)]
pub struct Pages {
    tera: Arc<Tera>,
}

impl Pages {
    pub fn new() -> Result<Self, tera::Error> {
        let mut tera = Tera::default();
        tera.add_raw_templates(TEMPLATES.iter().copied())?;
        Ok(Self {
            tera: Arc::new(tera),
        })
    }

    pub fn render(&self, template: &str, context: &Context) -> Result<String, PageError> {
        Ok(self.tera.render(template, context)?)
    }
}

/// Failure while producing an HTML page.
#[derive(Debug, Error)]
pub enum PageError {
    #[error("page not found")]
    NotFound,
    #[error("failed to render template: {0}")]
    Template(#[from] tera::Error),
    #[error("{0}")]
    Internal(String),
}

impl PageError {
    pub fn internal(err: impl Display) -> Self {
        Self::Internal(err.to_string())
    }

    fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Template(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for PageError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(stage = "app", error = %self, "request failed");
        }
        let title = status.canonical_reason().unwrap_or("Error");
        let body = format!(
            "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>{title}</title></head>\n\
             <body><h1>{code} {title}</h1><p><a href=\"/\">Back to quizzes</a></p></body>\n</html>\n",
            code = status.as_u16(),
        );
        (status, Html(body)).into_response()
    }
}

macro_rules! internal_from {
    ($($source:ty),+ $(,)?) => {
        $(
            impl From<$source> for PageError {
                fn from(err: $source) -> Self {
                    Self::internal(err)
                }
            }
        )+
    };
}

internal_from!(
    UserError,
    SessionError,
    QuizError,
    QuestionError,
    ChoiceError,
    VoteError,
    PasswordError,
    tokio::task::JoinError,
);

/// Parses a numeric path segment; anything else is a 404 like an unknown id.
pub fn parse_id(raw: &str) -> Result<i64, PageError> {
    raw.parse::<i64>().map_err(|_| PageError::NotFound)
}

/// `302 Found`, matching what browsers expect after a form POST.
pub fn redirect_found(location: &str) -> Response {
    let mut response = Redirect::temporary(location).into_response();
    *response.status_mut() = StatusCode::FOUND;
    response
}
