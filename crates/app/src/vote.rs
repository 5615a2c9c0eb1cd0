use axum::{
    extract::{Path, State},
    response::Response,
    Form, Json,
};
use metrics::counter;
use serde_json::json;
use tera::Context;
use tracing::{debug, error, info, warn};

use funquiz_core::{Choice, Flash, Question, Tally, User, VoteForm, VoteOutcome};
use funquiz_storage::VoteError;

use crate::pages::{parse_id, redirect_found, PageError};
use crate::problem::ProblemResponse;
use crate::router::AppState;
use crate::session::{SignedIn, Viewer};
use crate::tap::{StageEvent, StageKind};

const NO_CHOICE: &str = "You didn't select a choice.";
const ALREADY_VOTED: &str = "You have already voted for this question.";

async fn load_question(state: &AppState, raw_id: &str) -> Result<Question, PageError> {
    let question_id = parse_id(raw_id)?;
    state
        .storage()
        .questions()
        .find(question_id)
        .await?
        .ok_or(PageError::NotFound)
}

async fn render_detail(
    state: &AppState,
    viewer: Viewer,
    question: &Question,
    user_choice: Option<&Choice>,
    error_message: Option<&str>,
) -> Result<Response, PageError> {
    let choices = state
        .storage()
        .choices()
        .list_for_question(question.id)
        .await?;

    let mut context = Context::new();
    context.insert("question", question);
    context.insert("choices", &choices);
    context.insert("user_choice", &user_choice);
    context.insert("error_message", &error_message);
    viewer.render(state, "detail.html", context)
}

/// Outcome of one ballot submission, before it is turned into a page.
enum Ballot {
    Cast(VoteOutcome),
    NoChoice,
}

impl Ballot {
    fn label(&self) -> &'static str {
        match self {
            Ballot::Cast(outcome) => outcome.metric_label(),
            Ballot::NoChoice => "no_choice",
        }
    }
}

/// Records `user`'s vote on `question`. A choice id that does not belong to the
/// question is reported as [`VoteError::ChoiceNotFound`] so callers can decide.
async fn submit(
    state: &AppState,
    question: &Question,
    user: &User,
    form: &VoteForm,
) -> Result<Ballot, VoteError> {
    let votes = state.storage().votes();
    if votes.user_choice(question.id, user.id).await?.is_some() {
        return Ok(Ballot::Cast(VoteOutcome::AlreadyVoted));
    }
    let Some(choice_id) = form.selected() else {
        return Ok(Ballot::NoChoice);
    };

    let outcome = votes
        .cast(question.id, choice_id, user.id, state.now())
        .await?;
    match outcome {
        VoteOutcome::Recorded { votes } => {
            info!(
                stage = "vote",
                question_id = question.id,
                choice_id,
                user_id = user.id,
                votes,
                "vote recorded"
            );
            state.tap().publish(
                StageEvent::new(state.now(), StageKind::Vote, "vote.recorded")
                    .with_user(user.id)
                    .with_payload(json!({
                        "question_id": question.id,
                        "choice_id": choice_id,
                        "votes": votes,
                    })),
            );
        }
        VoteOutcome::AlreadyVoted => {
            debug!(stage = "vote", question_id = question.id, user_id = user.id, "lost vote race");
        }
    }
    Ok(Ballot::Cast(outcome))
}

fn count(ballot: &Ballot) {
    counter!("votes_total", "result" => ballot.label()).increment(1);
}

pub async fn detail(
    State(state): State<AppState>,
    signed_in: SignedIn,
    Path(raw_id): Path<String>,
) -> Result<Response, PageError> {
    let SignedIn { user, viewer } = signed_in;
    let question = load_question(&state, &raw_id).await?;
    let user_choice = state
        .storage()
        .votes()
        .user_choice(question.id, user.id)
        .await?;
    render_detail(&state, viewer, &question, user_choice.as_ref(), None).await
}

/// Inline ballot on the question page. Once the user has voted the page only
/// shows their choice, so a repeated submission just re-renders it.
pub async fn detail_vote(
    State(state): State<AppState>,
    signed_in: SignedIn,
    Path(raw_id): Path<String>,
    Form(form): Form<VoteForm>,
) -> Result<Response, PageError> {
    let SignedIn { user, viewer } = signed_in;
    let question = load_question(&state, &raw_id).await?;

    let ballot = match submit(&state, &question, &user, &form).await {
        Ok(ballot) => ballot,
        Err(VoteError::ChoiceNotFound) => {
            counter!("votes_total", "result" => "invalid_choice").increment(1);
            return Err(PageError::NotFound);
        }
        Err(err) => return Err(err.into()),
    };
    count(&ballot);

    match ballot {
        Ballot::Cast(VoteOutcome::Recorded { .. }) => {
            let location = format!("/{}/", question.id);
            Ok(viewer.redirect(&state, &location, Some(Flash::VoteRecorded)))
        }
        Ballot::Cast(VoteOutcome::AlreadyVoted) => {
            let user_choice = state
                .storage()
                .votes()
                .user_choice(question.id, user.id)
                .await?;
            render_detail(&state, viewer, &question, user_choice.as_ref(), None).await
        }
        Ballot::NoChoice => render_detail(&state, viewer, &question, None, Some(NO_CHOICE)).await,
    }
}

pub async fn vote(
    State(state): State<AppState>,
    signed_in: SignedIn,
    Path(raw_id): Path<String>,
    Form(form): Form<VoteForm>,
) -> Result<Response, PageError> {
    let SignedIn { user, viewer } = signed_in;
    let question = load_question(&state, &raw_id).await?;

    let ballot = match submit(&state, &question, &user, &form).await {
        Ok(ballot) => ballot,
        Err(VoteError::ChoiceNotFound) => {
            warn!(stage = "vote", question_id = question.id, user_id = user.id, "choice not on question");
            Ballot::NoChoice
        }
        Err(err) => return Err(err.into()),
    };
    count(&ballot);

    match ballot {
        Ballot::Cast(VoteOutcome::Recorded { .. }) => {
            let location = format!("/{}/results/", question.id);
            Ok(viewer.redirect(&state, &location, Some(Flash::VoteRecorded)))
        }
        Ballot::Cast(VoteOutcome::AlreadyVoted) => {
            render_detail(&state, viewer, &question, None, Some(ALREADY_VOTED)).await
        }
        Ballot::NoChoice => render_detail(&state, viewer, &question, None, Some(NO_CHOICE)).await,
    }
}

/// Ballots are only accepted by POST; a stray GET goes back to the question.
pub async fn vote_page(Path(raw_id): Path<String>) -> Result<Response, PageError> {
    let question_id = parse_id(&raw_id)?;
    Ok(redirect_found(&format!("/{question_id}/")))
}

async fn tally_for(state: &AppState, question_id: i64) -> Result<Tally, PageError> {
    let choices = state
        .storage()
        .choices()
        .list_for_question(question_id)
        .await?;
    Ok(Tally::from_choices(question_id, &choices))
}

pub async fn results(
    State(state): State<AppState>,
    viewer: Viewer,
    Path(raw_id): Path<String>,
) -> Result<Response, PageError> {
    let question = load_question(&state, &raw_id).await?;
    let tally = tally_for(&state, question.id).await?;
    let leaders: Vec<&str> = tally
        .leaders()
        .map(|row| row.choice_text.as_str())
        .collect();

    let mut context = Context::new();
    context.insert("question", &question);
    context.insert("tally", &tally);
    context.insert("leaders", &leaders);
    viewer.render(&state, "results.html", context)
}

/// JSON counterpart of the results page.
pub async fn api_results(
    State(state): State<AppState>,
    Path(raw_id): Path<String>,
) -> Result<Json<Tally>, ProblemResponse> {
    let lookup = async {
        let question = load_question(&state, &raw_id).await?;
        tally_for(&state, question.id).await
    };
    lookup.await.map(Json).map_err(|err| match err {
        PageError::NotFound => {
            ProblemResponse::not_found(format!("question {raw_id} does not exist"))
        }
        err => {
            error!(stage = "vote", error = %err, "failed to load results");
            ProblemResponse::internal("failed to load results")
        }
    })
}
