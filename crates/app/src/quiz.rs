use axum::{
    extract::{Path, State},
    response::Response,
    Form,
};
use metrics::counter;
use serde_json::json;
use tera::Context;
use tracing::info;

use funquiz_core::{Flash, QuestionForm, Quiz, QuizForm};
use funquiz_storage::NewQuestion;

use crate::pages::{parse_id, PageError};
use crate::router::AppState;
use crate::session::{SignedIn, Viewer};
use crate::tap::{StageEvent, StageKind};

const LATEST_QUIZZES: i64 = 5;

pub async fn index(State(state): State<AppState>, viewer: Viewer) -> Result<Response, PageError> {
    let latest = state.storage().quizzes().latest(LATEST_QUIZZES).await?;
    let mut context = Context::new();
    context.insert("latest_quiz_list", &latest);
    viewer.render(&state, "index.html", context)
}

pub async fn quiz_detail(
    State(state): State<AppState>,
    viewer: Viewer,
    Path(raw_id): Path<String>,
) -> Result<Response, PageError> {
    let quiz_id = parse_id(&raw_id)?;
    let quizzes = state.storage().quizzes();
    let summary = quizzes.summary(quiz_id).await?.ok_or(PageError::NotFound)?;
    let is_owner = match viewer.user() {
        Some(user) => quizzes.find_owned(quiz_id, user.id).await?.is_some(),
        None => false,
    };
    let questions = state.storage().questions().list_for_quiz(quiz_id).await?;

    let mut context = Context::new();
    context.insert("quiz", &summary);
    context.insert("questions", &questions);
    context.insert("is_owner", &is_owner);
    viewer.render(&state, "quiz_detail.html", context)
}

fn render_create(
    state: &AppState,
    viewer: Viewer,
    title: &str,
    errors: &[String],
) -> Result<Response, PageError> {
    let mut context = Context::new();
    context.insert("title", title);
    context.insert("errors", errors);
    viewer.render(state, "create_quiz.html", context)
}

pub async fn create_quiz_page(
    State(state): State<AppState>,
    signed_in: SignedIn,
) -> Result<Response, PageError> {
    render_create(&state, signed_in.viewer, "", &[])
}

pub async fn create_quiz(
    State(state): State<AppState>,
    signed_in: SignedIn,
    Form(form): Form<QuizForm>,
) -> Result<Response, PageError> {
    let SignedIn { user, viewer } = signed_in;
    let submitted = form.title.clone();
    let title = match form.clean() {
        Ok(title) => title,
        Err(errors) => return render_create(&state, viewer, &submitted, errors.messages()),
    };

    let quiz = state
        .storage()
        .quizzes()
        .create(&title, user.id, state.now())
        .await?;

    counter!("quizzes_created_total").increment(1);
    info!(stage = "quiz", quiz_id = quiz.id, user_id = user.id, "quiz created");
    state.tap().publish(
        StageEvent::new(state.now(), StageKind::Quiz, "quiz.created")
            .with_user(user.id)
            .with_payload(json!({ "quiz_id": quiz.id, "title": quiz.title })),
    );

    let location = format!("/quiz/{}/add_question/", quiz.id);
    Ok(viewer.redirect(&state, &location, Some(Flash::QuizCreated)))
}

/// Loads a quiz the signed-in user created. Other users get the same 404 as a missing id.
async fn owned_quiz(state: &AppState, raw_id: &str, user_id: i64) -> Result<Quiz, PageError> {
    let quiz_id = parse_id(raw_id)?;
    state
        .storage()
        .quizzes()
        .find_owned(quiz_id, user_id)
        .await?
        .ok_or(PageError::NotFound)
}

fn render_add_question(
    state: &AppState,
    viewer: Viewer,
    quiz: &Quiz,
    form: &QuestionForm,
    errors: &[String],
) -> Result<Response, PageError> {
    let mut context = Context::new();
    context.insert("quiz", quiz);
    context.insert("question_text", &form.question_text);
    context.insert("choice_values", &form.choice_values());
    context.insert("errors", errors);
    viewer.render(state, "add_question.html", context)
}

pub async fn add_question_page(
    State(state): State<AppState>,
    signed_in: SignedIn,
    Path(raw_id): Path<String>,
) -> Result<Response, PageError> {
    let quiz = owned_quiz(&state, &raw_id, signed_in.user.id).await?;
    render_add_question(
        &state,
        signed_in.viewer,
        &quiz,
        &QuestionForm::default(),
        &[],
    )
}

pub async fn add_question(
    State(state): State<AppState>,
    signed_in: SignedIn,
    Path(raw_id): Path<String>,
    Form(form): Form<QuestionForm>,
) -> Result<Response, PageError> {
    let SignedIn { user, viewer } = signed_in;
    let quiz = owned_quiz(&state, &raw_id, user.id).await?;

    let draft = match form.clone().clean() {
        Ok(draft) => draft,
        Err(errors) => {
            return render_add_question(&state, viewer, &quiz, &form, errors.messages());
        }
    };

    let (question, choices) = state
        .storage()
        .questions()
        .create_with_choices(&NewQuestion {
            quiz_id: quiz.id,
            question_text: &draft.question_text,
            choices: &draft.choices,
            pub_date: state.now(),
        })
        .await?;

    counter!("questions_created_total").increment(1);
    info!(
        stage = "quiz",
        quiz_id = quiz.id,
        question_id = question.id,
        choices = choices.len(),
        "question added"
    );
    state.tap().publish(
        StageEvent::new(state.now(), StageKind::Quiz, "question.created")
            .with_user(user.id)
            .with_payload(json!({
                "quiz_id": quiz.id,
                "question_id": question.id,
                "choices": choices.len(),
            })),
    );

    let location = if draft.add_more {
        format!("/quiz/{}/add_question/", quiz.id)
    } else {
        format!("/quiz/{}/", quiz.id)
    };
    Ok(viewer.redirect(&state, &location, Some(Flash::QuestionAdded)))
}
