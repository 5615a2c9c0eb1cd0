use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Query, State},
    http::{header, StatusCode},
    response::{sse::Sse, IntoResponse},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;

use funquiz_storage::Database;
use funquiz_util::AppConfig;

use crate::pages::Pages;
use crate::tap::{
    parse_stage_list, tap_keep_alive, tap_stream, StageEvent, StageKind, TapFilter, TapHub,
};
use crate::{auth, quiz, telemetry, vote};

/// Cookie and debug settings derived from the runtime configuration.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub session_ttl: Duration,
    pub secure_cookies: bool,
    pub debug_tap: bool,
}

impl HttpSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            session_ttl: config.session_ttl,
            secure_cookies: config.environment.secure_cookies(),
            debug_tap: config.environment.is_development(),
        }
    }

    /// When a session started at `now` expires, or `None` if the TTL does not fit a timestamp.
    pub fn session_expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.session_ttl).ok()?;
        now.checked_add_signed(ttl)
    }

    /// Cookie `Max-Age` matching [`Self::session_expires_at`].
    pub fn session_max_age(&self) -> Option<time::Duration> {
        i64::try_from(self.session_ttl.as_secs())
            .ok()
            .map(time::Duration::seconds)
    }
}

#[derive(Clone)]
pub struct AppState {
    metrics: PrometheusHandle,
    tap: TapHub,
    storage: Database,
    pages: Pages,
    clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>,
    http: HttpSettings,
}

impl AppState {
    pub fn new(
        metrics: PrometheusHandle,
        tap: TapHub,
        storage: Database,
        pages: Pages,
        http: HttpSettings,
    ) -> Self {
        Self {
            metrics,
            tap,
            storage,
            pages,
            clock: Arc::new(Utc::now),
            http,
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>) -> Self {
        self.clock = clock;
        self
    }

    pub fn metrics(&self) -> &PrometheusHandle {
        &self.metrics
    }

    pub fn tap(&self) -> &TapHub {
        &self.tap
    }

    pub fn storage(&self) -> &Database {
        &self.storage
    }

    pub fn pages(&self) -> &Pages {
        &self.pages
    }

    pub fn http(&self) -> &HttpSettings {
        &self.http
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }
}

pub fn app_router(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/", get(quiz::index))
        .route("/login/", get(auth::login_page).post(auth::login))
        .route("/logout/", get(auth::logout).post(auth::logout))
        .route("/register/", get(auth::register_page).post(auth::register))
        .route(
            "/quiz/create/",
            get(quiz::create_quiz_page).post(quiz::create_quiz),
        )
        .route("/quiz/:quiz_id/", get(quiz::quiz_detail))
        .route(
            "/quiz/:quiz_id/add_question/",
            get(quiz::add_question_page).post(quiz::add_question),
        )
        .route("/:question_id/", get(vote::detail).post(vote::detail_vote))
        .route("/:question_id/vote/", get(vote::vote_page).post(vote::vote))
        .route("/:question_id/results/", get(vote::results))
        .route(
            "/api/questions/:question_id/results",
            get(vote::api_results),
        )
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics));

    if state.http().debug_tap {
        router = router.route("/_debug/tap", get(debug_tap));
    }

    router.with_state(state)
}

async fn healthz() -> StatusCode {
    StatusCode::OK
}

async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    let body = telemetry::render_metrics(state.metrics());
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    )
}

#[derive(Debug, Deserialize)]
struct TapQuery {
    #[serde(default)]
    s: Option<String>,
}

async fn debug_tap(
    State(state): State<AppState>,
    Query(query): Query<TapQuery>,
) -> Result<
    Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, serde_json::Error>>>,
    (StatusCode, String),
> {
    let stages = parse_stage_list(query.s).map_err(|err| (StatusCode::BAD_REQUEST, err))?;
    let filter = TapFilter::from_stages(stages);
    let stream = tap_stream(state.tap().clone(), filter.clone());
    state.tap().publish(
        StageEvent::new(state.now(), StageKind::App, "tap.subscribed")
            .with_payload(serde_json::json!({ "stages": filter.stage_names() })),
    );

    Ok(Sse::new(stream).keep_alive(tap_keep_alive()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use axum::{
        body::Body,
        http::{Request, Response},
    };
    use http_body_util::BodyExt;
    use tempfile::TempDir;
    use tokio::time;
    use tower::ServiceExt;

    use crate::session::{FLASH_COOKIE, SESSION_COOKIE};

    const PASSWORD: &str = "correct-horse-42";

    struct TestContext {
        state: AppState,
        _dir: TempDir,
    }

    async fn setup() -> TestContext {
        let metrics = telemetry::init_metrics().expect("metrics init");
        let dir = tempfile::tempdir().expect("tempdir");
        let url = format!("sqlite://{}", dir.path().join("app.db").display());
        let database = Database::connect(&url).await.expect("connect");
        database.run_migrations().await.expect("migrations");

        let state = AppState::new(
            metrics,
            TapHub::new(),
            database,
            Pages::new().expect("templates"),
            HttpSettings {
                session_ttl: Duration::from_secs(3600),
                secure_cookies: false,
                debug_tap: true,
            },
        );
        TestContext { state, _dir: dir }
    }

    /// Minimal cookie-keeping client over the router.
    struct Browser {
        app: Router,
        state: AppState,
        cookies: HashMap<String, String>,
    }

    impl Browser {
        fn new(ctx: &TestContext) -> Self {
            Self {
                app: app_router(ctx.state.clone()),
                state: ctx.state.clone(),
                cookies: HashMap::new(),
            }
        }

        async fn send(
            &mut self,
            mut builder: axum::http::request::Builder,
            body: Body,
        ) -> Response<Body> {
            if !self.cookies.is_empty() {
                let header_value = self
                    .cookies
                    .iter()
                    .map(|(name, value)| format!("{name}={value}"))
                    .collect::<Vec<_>>()
                    .join("; ");
                builder = builder.header(header::COOKIE, header_value);
            }
            let response = self
                .app
                .clone()
                .oneshot(builder.body(body).unwrap())
                .await
                .expect("router responds");

            for value in response.headers().get_all(header::SET_COOKIE) {
                let raw = value.to_str().unwrap();
                let pair = raw.split(';').next().unwrap();
                let (name, value) = pair.split_once('=').unwrap();
                if value.is_empty() {
                    self.cookies.remove(name);
                } else {
                    self.cookies.insert(name.to_string(), value.to_string());
                }
            }
            response
        }

        async fn get(&mut self, uri: &str) -> Response<Body> {
            self.send(Request::builder().uri(uri), Body::empty()).await
        }

        async fn post(&mut self, uri: &str, fields: &[(&str, &str)]) -> Response<Body> {
            let body = serde_urlencoded::to_string(fields).unwrap();
            self.send(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded"),
                Body::from(body),
            )
            .await
        }

        async fn register(&mut self, username: &str) -> Response<Body> {
            self.post(
                "/register/",
                &[
                    ("username", username),
                    ("password1", PASSWORD),
                    ("password2", PASSWORD),
                ],
            )
            .await
        }

        /// Creates a quiz with one two-choice question; returns (quiz_id, question_id).
        async fn seed_quiz(&mut self) -> (i64, i64) {
            let response = self.post("/quiz/create/", &[("title", "Capitals")]).await;
            assert_eq!(response.status(), StatusCode::FOUND);
            let add_uri = location(&response);
            let quiz_id: i64 = add_uri
                .trim_start_matches("/quiz/")
                .trim_end_matches("/add_question/")
                .parse()
                .unwrap();

            let response = self
                .post(
                    &add_uri,
                    &[
                        ("question_text", "Capital of France?"),
                        ("choice_1", "Paris"),
                        ("choice_2", "Lyon"),
                        ("choice_3", ""),
                        ("choice_4", ""),
                    ],
                )
                .await;
            assert_eq!(response.status(), StatusCode::FOUND);
            assert_eq!(location(&response), format!("/quiz/{quiz_id}/"));

            let questions = self
                .state
                .storage()
                .questions()
                .list_for_quiz(quiz_id)
                .await
                .unwrap();
            (quiz_id, questions[0].id)
        }
    }

    fn location(response: &Response<Body>) -> String {
        response
            .headers()
            .get(header::LOCATION)
            .expect("location header")
            .to_str()
            .unwrap()
            .to_string()
    }

    async fn body_text(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).expect("utf-8")
    }

    #[tokio::test]
    async fn healthz_returns_ok() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        assert_eq!(browser.get("/healthz").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_exports_build_info() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);

        let response = browser.get("/metrics").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("app_build_info"));
        assert!(body.contains("app_uptime_seconds"));
    }

    #[tokio::test]
    async fn index_lists_nothing_on_empty_database() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);

        let response = browser.get("/").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("No quizzes are available."));
        assert!(body.contains("href=\"/login/\""));
    }

    #[tokio::test]
    async fn login_required_pages_redirect_with_next() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);

        let response = browser.get("/quiz/create/").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/login/?next=%2Fquiz%2Fcreate%2F");

        let response = browser.post("/1/vote/", &[("choice", "1")]).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/login/?next=%2F1%2Fvote%2F");
    }

    #[tokio::test]
    async fn register_create_vote_and_see_results() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);

        let response = browser.register("alice").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/");
        assert!(browser.cookies.contains_key(SESSION_COOKIE));

        let body = body_text(browser.get("/").await).await;
        assert!(body.contains("Welcome, alice! Your account has been created."));
        assert!(!browser.cookies.contains_key(FLASH_COOKIE));

        let (quiz_id, question_id) = browser.seed_quiz().await;

        let body = body_text(browser.get(&format!("/quiz/{quiz_id}/")).await).await;
        assert!(body.contains("Capital of France?"));
        assert!(body.contains("Add a question"));

        let body = body_text(browser.get("/").await).await;
        assert!(body.contains("Capitals"));
        assert!(body.contains("1 question,"));

        let response = browser
            .post(&format!("/{question_id}/vote/"), &[("choice", "1")])
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), format!("/{question_id}/results/"));

        let body = body_text(browser.get(&format!("/{question_id}/results/")).await).await;
        assert!(body.contains("Thanks, your vote has been counted."));
        assert!(body.contains("1 vote so far."));
        assert!(body.contains("Leading: Paris"));
        assert!(body.contains("100%"));

        let response = browser
            .post(&format!("/{question_id}/vote/"), &[("choice", "2")])
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("You have already voted for this question."));

        let body = body_text(browser.get(&format!("/{question_id}/")).await).await;
        assert!(body.contains("You voted for <strong>Paris</strong>."));

        let response = browser
            .get(&format!("/api/questions/{question_id}/results"))
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let tally: serde_json::Value =
            serde_json::from_str(&body_text(response).await).expect("json");
        assert_eq!(tally["total_votes"], 1);
        assert_eq!(tally["rows"][0]["choice_text"], "Paris");
        assert_eq!(tally["rows"][0]["percent"], 100);
        assert_eq!(tally["rows"][1]["votes"], 0);
    }

    #[tokio::test]
    async fn inline_vote_on_question_page_redirects_back() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("carol").await;
        let (_, question_id) = browser.seed_quiz().await;

        let response = browser
            .post(&format!("/{question_id}/"), &[("choice", "2")])
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), format!("/{question_id}/"));

        let body = body_text(browser.get(&format!("/{question_id}/")).await).await;
        assert!(body.contains("You voted for <strong>Lyon</strong>."));

        let response = browser
            .post(&format!("/{question_id}/"), &[("choice", "1")])
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let choices = ctx
            .state
            .storage()
            .choices()
            .list_for_question(question_id)
            .await
            .unwrap();
        assert_eq!(choices[0].votes, 0);
        assert_eq!(choices[1].votes, 1);
    }

    #[tokio::test]
    async fn inline_vote_with_choice_from_another_question_is_not_found() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("chuck").await;
        let (_, first_question) = browser.seed_quiz().await;
        let (_, second_question) = browser.seed_quiz().await;

        let foreign = ctx
            .state
            .storage()
            .choices()
            .list_for_question(second_question)
            .await
            .unwrap();
        let foreign_id = foreign[0].id.to_string();

        let response = browser
            .post(&format!("/{first_question}/"), &[("choice", foreign_id.as_str())])
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let storage = ctx.state.storage();
        for question_id in [first_question, second_question] {
            let choices = storage.choices().list_for_question(question_id).await.unwrap();
            assert!(choices.iter().all(|choice| choice.votes == 0));
        }
    }

    #[tokio::test]
    async fn vote_without_choice_re_renders_with_error() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("dave").await;
        let (_, question_id) = browser.seed_quiz().await;

        let response = browser.post(&format!("/{question_id}/vote/"), &[]).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("You didn&#x27;t select a choice."));

        let response = browser
            .post(&format!("/{question_id}/vote/"), &[("choice", "999")])
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(body_text(response)
            .await
            .contains("You didn&#x27;t select a choice."));

        let response = browser.get(&format!("/{question_id}/vote/")).await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), format!("/{question_id}/"));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("erin").await;
        browser.post("/logout/", &[]).await;
        assert!(!browser.cookies.contains_key(SESSION_COOKIE));

        let response = browser
            .post("/login/", &[("username", "erin"), ("password", "not-the-password")])
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("Invalid username or password."));
        assert!(!browser.cookies.contains_key(SESSION_COOKIE));

        let response = browser
            .post(
                "/login/?next=%2Fquiz%2Fcreate%2F",
                &[("username", "erin"), ("password", PASSWORD)],
            )
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/quiz/create/");

        let body = body_text(browser.get("/quiz/create/").await).await;
        assert!(body.contains("Welcome, erin! You have been logged in."));
    }

    #[tokio::test]
    async fn unknown_username_gets_the_same_rejection() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);

        let response = browser
            .post("/login/", &[("username", "nobody"), ("password", PASSWORD)])
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("Invalid username or password."));
        assert!(!browser.cookies.contains_key(SESSION_COOKIE));
    }

    #[tokio::test]
    async fn offsite_next_falls_back_to_index() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("frank").await;
        browser.post("/logout/", &[]).await;

        let response = browser
            .post(
                "/login/?next=https%3A%2F%2Fevil.example%2F",
                &[("username", "frank"), ("password", PASSWORD)],
            )
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/");
    }

    #[tokio::test]
    async fn duplicate_registration_shows_error() {
        let ctx = setup().await;
        let mut first = Browser::new(&ctx);
        first.register("grace").await;

        let mut second = Browser::new(&ctx);
        let response = second.register("GRACE").await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("A user with that username already exists."));
        assert!(!second.cookies.contains_key(SESSION_COOKIE));
    }

    #[tokio::test]
    async fn only_the_creator_can_add_questions() {
        let ctx = setup().await;
        let mut owner = Browser::new(&ctx);
        owner.register("heidi").await;
        let (quiz_id, _) = owner.seed_quiz().await;

        let mut other = Browser::new(&ctx);
        other.register("ivan").await;
        let uri = format!("/quiz/{quiz_id}/add_question/");
        assert_eq!(other.get(&uri).await.status(), StatusCode::NOT_FOUND);
        let response = other
            .post(&uri, &[("question_text", "Hijack?"), ("choice_1", "yes")])
            .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_text(other.get(&format!("/quiz/{quiz_id}/")).await).await;
        assert!(!body.contains("Add a question"));
    }

    #[tokio::test]
    async fn add_more_returns_to_the_form_and_keeps_input_on_error() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("judy").await;
        let response = browser.post("/quiz/create/", &[("title", "Rivers")]).await;
        let uri = location(&response);

        let response = browser
            .post(
                &uri,
                &[
                    ("question_text", "Longest river?"),
                    ("choice_1", "Nile"),
                    ("add_more", "1"),
                ],
            )
            .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), uri);

        let response = browser
            .post(&uri, &[("question_text", "No answers?"), ("choice_1", "  ")])
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("Add at least one choice."));
        assert!(body.contains("value=\"No answers?\""));
    }

    #[tokio::test]
    async fn rejected_question_writes_nothing() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("rupert").await;
        let response = browser.post("/quiz/create/", &[("title", "Words")]).await;
        let uri = location(&response);
        let quiz_id: i64 = uri
            .trim_start_matches("/quiz/")
            .trim_end_matches("/add_question/")
            .parse()
            .unwrap();

        let long_choice = "x".repeat(201);
        let response = browser
            .post(
                &uri,
                &[
                    ("question_text", "Longest word?"),
                    ("choice_1", "short"),
                    ("choice_2", long_choice.as_str()),
                ],
            )
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_text(response).await;
        assert!(body.contains("Choices must be at most 200 characters."));

        let questions = ctx
            .state
            .storage()
            .questions()
            .list_for_quiz(quiz_id)
            .await
            .unwrap();
        assert!(questions.is_empty());
    }

    #[tokio::test]
    async fn logout_flashes_message() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("mallory").await;

        let response = browser.get("/logout/").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(location(&response), "/");

        let body = body_text(browser.get("/").await).await;
        assert!(body.contains("You have successfully logged out."));
        assert!(body.contains("href=\"/register/\""));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("niaj").await;

        assert_eq!(browser.get("/42/").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(browser.get("/abc/").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(browser.get("/42/results/").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(browser.get("/quiz/42/").await.status(), StatusCode::NOT_FOUND);

        let response = browser.get("/api/questions/42/results").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/problem+json"
        );
    }

    #[tokio::test]
    async fn expired_session_is_treated_as_anonymous() {
        let ctx = setup().await;
        let mut browser = Browser::new(&ctx);
        browser.register("olivia").await;

        let later = Utc::now() + chrono::Duration::hours(2);
        browser.app = app_router(ctx.state.clone().with_clock(Arc::new(move || later)));

        let response = browser.get("/quiz/create/").await;
        assert_eq!(response.status(), StatusCode::FOUND);
        assert!(location(&response).starts_with("/login/"));
    }

    #[test]
    fn session_lifetime_is_bounded_by_the_ttl() {
        let now = Utc::now();
        let settings = HttpSettings {
            session_ttl: Duration::from_secs(3600),
            secure_cookies: false,
            debug_tap: false,
        };
        assert_eq!(
            settings.session_expires_at(now),
            Some(now + chrono::Duration::hours(1))
        );
        assert_eq!(settings.session_max_age(), Some(::time::Duration::hours(1)));

        let huge = HttpSettings {
            session_ttl: Duration::from_secs(9_000_000_000_000_000),
            ..settings
        };
        assert_eq!(huge.session_expires_at(now), None);
    }

    #[tokio::test]
    async fn out_of_range_session_ttl_fails_the_request() {
        let mut ctx = setup().await;
        ctx.state.http.session_ttl = Duration::from_secs(u64::MAX);
        let mut browser = Browser::new(&ctx);

        let response = browser.register("peggy").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!browser.cookies.contains_key(SESSION_COOKIE));
    }

    #[tokio::test]
    async fn tap_subscription_is_announced_on_the_app_stage() {
        let ctx = setup().await;
        let app = app_router(ctx.state.clone());

        let request = Request::builder()
            .uri("/_debug/tap?s=app,vote")
            .body(Body::empty())
            .unwrap();
        let mut response = app.oneshot(request).await.expect("handler should respond");

        let frame = time::timeout(time::Duration::from_secs(1), response.body_mut().frame())
            .await
            .expect("stream produced chunk")
            .expect("chunk ok")
            .expect("chunk available");
        let data = match frame.into_data() {
            Ok(data) => data,
            Err(_) => panic!("expected data frame"),
        };
        let text = String::from_utf8(data.to_vec()).expect("utf-8");
        assert!(text.contains("\"stage\":\"app\""));
        assert!(text.contains("\"message\":\"tap.subscribed\""));
        assert!(text.contains("\"stages\":[\"app\",\"vote\"]"));
    }

    #[tokio::test]
    async fn tap_stream_emits_events() {
        let ctx = setup().await;
        let tap = ctx.state.tap().clone();
        let app = app_router(ctx.state.clone());

        let request = Request::builder()
            .uri("/_debug/tap?s=vote")
            .body(Body::empty())
            .unwrap();

        let publish = tokio::spawn(async move {
            time::sleep(time::Duration::from_millis(25)).await;
            tap.publish(StageEvent::new(Utc::now(), StageKind::Auth, "ignored"));
            tap.publish(StageEvent::new(Utc::now(), StageKind::Vote, "vote.recorded"));
        });

        let mut response = app.oneshot(request).await.expect("handler should respond");

        let frame = time::timeout(time::Duration::from_secs(1), response.body_mut().frame())
            .await
            .expect("stream produced chunk")
            .expect("chunk ok")
            .expect("chunk available");

        let data = match frame.into_data() {
            Ok(data) => data,
            Err(_) => panic!("expected data frame"),
        };
        let text = String::from_utf8(data.to_vec()).expect("utf-8");
        assert!(text.contains("data:"));
        assert!(text.contains("\"stage\":\"vote\""));

        publish.await.expect("publish task");
    }
}
