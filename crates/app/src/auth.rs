use std::{sync::OnceLock, time::Instant};

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use axum::{
    extract::{Query, State},
    response::Response,
    Form,
};
use metrics::{counter, histogram};
use rand::{rngs::OsRng, RngCore};
use serde::Deserialize;
use serde_json::json;
use tera::Context;
use thiserror::Error;
use tracing::{info, warn};

use funquiz_core::{Flash, LoginForm, RegisterForm};
use funquiz_storage::UserError;

use crate::pages::PageError;
use crate::router::AppState;
use crate::session::{is_safe_next, Viewer};
use crate::tap::{StageEvent, StageKind};

const INVALID_LOGIN: &str = "Invalid username or password.";
const DUPLICATE_USERNAME: &str = "A user with that username already exists.";
const SALT_LEN: usize = 16;

/// Hash checked when the username is unknown, so both login paths pay for Argon2.
static DUMMY_HASH: OnceLock<String> = OnceLock::new();

#[derive(Debug, Error)]
#[error("password hashing failed: {0}")]
pub struct PasswordError(argon2::password_hash::Error);

fn hash_blocking(password: &str) -> Result<String, PasswordError> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let salt = SaltString::encode_b64(&salt).map_err(PasswordError)?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(PasswordError)?;
    Ok(hash.to_string())
}

fn verify_blocking(password: &str, hash: &str) -> Result<bool, PasswordError> {
    let parsed = PasswordHash::new(hash).map_err(PasswordError)?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(argon2::password_hash::Error::Password) => Ok(false),
        Err(err) => Err(PasswordError(err)),
    }
}

fn dummy_hash() -> Result<&'static str, PasswordError> {
    if let Some(hash) = DUMMY_HASH.get() {
        return Ok(hash);
    }
    let hash = hash_blocking("funquiz-unknown-user")?;
    Ok(DUMMY_HASH.get_or_init(|| hash))
}

/// Argon2 is CPU bound; keep it off the async workers.
async fn hash_password(password: String) -> Result<String, PageError> {
    let start = Instant::now();
    let hash = tokio::task::spawn_blocking(move || hash_blocking(&password)).await??;
    histogram!("password_hash_seconds").record(start.elapsed().as_secs_f64());
    Ok(hash)
}

async fn verify_password(password: String, hash: String) -> Result<bool, PageError> {
    let start = Instant::now();
    let verified = tokio::task::spawn_blocking(move || verify_blocking(&password, &hash)).await??;
    histogram!("password_hash_seconds").record(start.elapsed().as_secs_f64());
    Ok(verified)
}

/// Spends the same verification work as a real login, then fails.
async fn reject_unknown_user(password: String) -> Result<bool, PageError> {
    let start = Instant::now();
    tokio::task::spawn_blocking(move || verify_blocking(&password, dummy_hash()?)).await??;
    histogram!("password_hash_seconds").record(start.elapsed().as_secs_f64());
    Ok(false)
}

#[derive(Debug, Default, Deserialize)]
pub struct NextQuery {
    #[serde(default)]
    next: Option<String>,
}

impl NextQuery {
    fn safe(&self) -> Option<&str> {
        self.next.as_deref().filter(|value| is_safe_next(value))
    }
}

fn render_login(
    state: &AppState,
    viewer: Viewer,
    next: Option<&str>,
    username: &str,
    error_message: Option<&str>,
) -> Result<Response, PageError> {
    let mut context = Context::new();
    context.insert("next", &next);
    context.insert("username", username);
    context.insert("error_message", &error_message);
    viewer.render(state, "login.html", context)
}

fn render_register(
    state: &AppState,
    viewer: Viewer,
    username: &str,
    errors: &[String],
) -> Result<Response, PageError> {
    let mut context = Context::new();
    context.insert("username", username);
    context.insert("errors", errors);
    viewer.render(state, "register.html", context)
}

pub async fn login_page(
    State(state): State<AppState>,
    viewer: Viewer,
    Query(query): Query<NextQuery>,
) -> Result<Response, PageError> {
    render_login(&state, viewer, query.safe(), "", None)
}

pub async fn login(
    State(state): State<AppState>,
    viewer: Viewer,
    Query(query): Query<NextQuery>,
    Form(form): Form<LoginForm>,
) -> Result<Response, PageError> {
    let next = query.safe();
    let credentials = match form.clean() {
        Ok(credentials) => credentials,
        Err(_) => {
            counter!("auth_logins_total", "result" => "invalid_form").increment(1);
            return render_login(&state, viewer, next, "", Some(INVALID_LOGIN));
        }
    };

    let record = state
        .storage()
        .users()
        .find_by_username(&credentials.username)
        .await?;
    let user = match record {
        Some(record) => {
            let verified =
                verify_password(credentials.password.clone(), record.password_hash).await?;
            verified.then_some(record.user)
        }
        None => {
            reject_unknown_user(credentials.password.clone()).await?;
            None
        }
    };

    let Some(user) = user else {
        counter!("auth_logins_total", "result" => "failure").increment(1);
        warn!(stage = "auth", username = %credentials.username, "login rejected");
        state.tap().publish(
            StageEvent::new(state.now(), StageKind::Auth, "login.rejected")
                .with_payload(json!({ "username": credentials.username })),
        );
        return render_login(&state, viewer, next, &credentials.username, Some(INVALID_LOGIN));
    };

    counter!("auth_logins_total", "result" => "success").increment(1);
    info!(stage = "auth", user_id = user.id, "login accepted");
    let location = next.unwrap_or("/").to_string();
    Ok(viewer
        .sign_in(&state, &user)
        .await?
        .redirect(&state, &location, Some(Flash::LoggedIn)))
}

pub async fn register_page(
    State(state): State<AppState>,
    viewer: Viewer,
) -> Result<Response, PageError> {
    render_register(&state, viewer, "", &[])
}

pub async fn register(
    State(state): State<AppState>,
    viewer: Viewer,
    Form(form): Form<RegisterForm>,
) -> Result<Response, PageError> {
    let submitted_username = form.username.trim().to_string();
    let account = match form.clean() {
        Ok(account) => account,
        Err(errors) => {
            return render_register(&state, viewer, &submitted_username, errors.messages());
        }
    };

    let password_hash = hash_password(account.password).await?;
    let user = match state
        .storage()
        .users()
        .create(&account.username, &password_hash, state.now())
        .await
    {
        Ok(user) => user,
        Err(UserError::DuplicateUsername) => {
            return render_register(
                &state,
                viewer,
                &submitted_username,
                &[DUPLICATE_USERNAME.to_string()],
            );
        }
        Err(err) => return Err(err.into()),
    };

    counter!("auth_registrations_total").increment(1);
    info!(stage = "auth", user_id = user.id, username = %user.username, "account created");
    state.tap().publish(
        StageEvent::new(state.now(), StageKind::Auth, "account.created")
            .with_user(user.id)
            .with_payload(json!({ "username": user.username })),
    );

    Ok(viewer
        .sign_in(&state, &user)
        .await?
        .redirect(&state, "/", Some(Flash::Registered)))
}

pub async fn logout(State(state): State<AppState>, viewer: Viewer) -> Result<Response, PageError> {
    Ok(viewer
        .sign_out(&state)
        .await?
        .redirect(&state, "/", Some(Flash::LoggedOut)))
}
