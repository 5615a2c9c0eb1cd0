//! Cookie backed login sessions and one-shot flash messages.
//!
//! The browser holds a random token; the database only ever sees its SHA-256
//! digest. Handlers receive the caller through the [`Viewer`] extractor, or
//! [`SignedIn`] for pages that require an account.

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
    response::{Html, IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::{rngs::OsRng, RngCore};
use serde_json::json;
use sha2::{Digest, Sha256};
use tera::Context;
use tracing::info;
use url::form_urlencoded;

use funquiz_core::{Flash, User};
use funquiz_storage::NewSession;

use crate::pages::{redirect_found, PageError};
use crate::router::AppState;
use crate::tap::{StageEvent, StageKind};

pub const SESSION_COOKIE: &str = "funquiz_session";
pub const FLASH_COOKIE: &str = "funquiz_flash";
const TOKEN_BYTES: usize = 32;

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Accepts only local absolute paths so `next` cannot bounce users off-site.
pub fn is_safe_next(value: &str) -> bool {
    if !value.starts_with('/') || value.starts_with("//") || value.contains("://") {
        return false;
    }
    if value.contains('\\') || value.chars().any(char::is_control) {
        return false;
    }
    let path = value.split('?').next().unwrap_or(value);
    !path.split('/').any(|segment| segment == "..")
}

/// Redirect to the login page remembering where the user wanted to go.
pub fn login_redirect(next: &str) -> Response {
    let query = form_urlencoded::Serializer::new(String::new())
        .append_pair("next", next)
        .finish();
    redirect_found(&format!("/login/?{query}"))
}

fn removal(name: &'static str) -> Cookie<'static> {
    Cookie::build(name).path("/").build()
}

/// The caller of the current request: their account (if signed in) and cookies.
pub struct Viewer {
    user: Option<User>,
    jar: CookieJar,
    flash: Option<Flash>,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for Viewer {
    type Rejection = PageError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let jar = CookieJar::from_headers(&parts.headers);
        let user = match jar.get(SESSION_COOKIE) {
            Some(cookie) => {
                state
                    .storage()
                    .sessions()
                    .find_user(&hash_token(cookie.value()), state.now())
                    .await?
            }
            None => None,
        };
        let flash = jar
            .get(FLASH_COOKIE)
            .and_then(|cookie| Flash::from_code(cookie.value()));

        Ok(Self { user, jar, flash })
    }
}

impl Viewer {
    pub fn user(&self) -> Option<&User> {
        self.user.as_ref()
    }

    /// Renders a template with the viewer and any pending flash added to the context.
    /// A displayed flash is cleared from the browser.
    pub fn render(
        self,
        state: &AppState,
        template: &str,
        mut context: Context,
    ) -> Result<Response, PageError> {
        let mut jar = self.jar;
        let mut messages = Vec::new();
        if let Some(flash) = self.flash {
            messages.push(flash.render(self.user.as_ref().map(|user| user.username.as_str())));
            jar = jar.remove(removal(FLASH_COOKIE));
        }

        context.insert("user", &self.user);
        context.insert("messages", &messages);
        let body = state.pages().render(template, &context)?;
        Ok((jar, Html(body)).into_response())
    }

    /// `302 Found` to `location`, optionally queueing a flash for the next page.
    pub fn redirect(self, state: &AppState, location: &str, flash: Option<Flash>) -> Response {
        let jar = match flash {
            Some(flash) => self.jar.add(
                Cookie::build((FLASH_COOKIE, flash.code()))
                    .path("/")
                    .http_only(true)
                    .same_site(SameSite::Lax)
                    .secure(state.http().secure_cookies)
                    .build(),
            ),
            None => self.jar,
        };
        (jar, redirect_found(location)).into_response()
    }

    /// Starts a new session for `user`, replacing any session the browser held.
    pub async fn sign_in(self, state: &AppState, user: &User) -> Result<Self, PageError> {
        let viewer = self.drop_session(state).await?;
        let now = state.now();
        let out_of_range = || PageError::internal("session lifetime is out of range");
        let expires_at = state.http().session_expires_at(now).ok_or_else(out_of_range)?;
        let max_age = state.http().session_max_age().ok_or_else(out_of_range)?;
        let token = generate_token();
        let token_hash = hash_token(&token);

        state
            .storage()
            .sessions()
            .insert(&NewSession {
                token_hash: &token_hash,
                user_id: user.id,
                created_at: now,
                expires_at,
            })
            .await?;

        info!(stage = "auth", user_id = user.id, "session started");
        state.tap().publish(
            StageEvent::new(now, StageKind::Auth, "session.start")
                .with_user(user.id)
                .with_payload(json!({ "username": user.username })),
        );

        let jar = viewer.jar.add(
            Cookie::build((SESSION_COOKIE, token))
                .path("/")
                .http_only(true)
                .same_site(SameSite::Lax)
                .secure(state.http().secure_cookies)
                .max_age(max_age)
                .build(),
        );

        Ok(Self {
            user: Some(user.clone()),
            jar,
            flash: viewer.flash,
        })
    }

    /// Ends the current session, if any.
    pub async fn sign_out(self, state: &AppState) -> Result<Self, PageError> {
        if let Some(user) = &self.user {
            info!(stage = "auth", user_id = user.id, "session ended");
            state.tap().publish(
                StageEvent::new(state.now(), StageKind::Auth, "session.end").with_user(user.id),
            );
        }
        self.drop_session(state).await
    }

    async fn drop_session(self, state: &AppState) -> Result<Self, PageError> {
        let Some(cookie) = self.jar.get(SESSION_COOKIE) else {
            return Ok(self);
        };
        state
            .storage()
            .sessions()
            .delete(&hash_token(cookie.value()))
            .await?;

        Ok(Self {
            user: None,
            jar: self.jar.remove(removal(SESSION_COOKIE)),
            flash: self.flash,
        })
    }
}

/// A [`Viewer`] that is known to be signed in.
///
/// Anonymous requests are redirected to `/login/?next=<requested path>`.
pub struct SignedIn {
    pub user: User,
    pub viewer: Viewer,
}

#[axum::async_trait]
impl FromRequestParts<AppState> for SignedIn {
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let viewer = Viewer::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;

        match viewer.user.clone() {
            Some(user) => Ok(Self { user, viewer }),
            None => {
                let next = parts
                    .uri
                    .path_and_query()
                    .map(|value| value.as_str())
                    .unwrap_or("/");
                Err(login_redirect(next))
            }
        }
    }
}
