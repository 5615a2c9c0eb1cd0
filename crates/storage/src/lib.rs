use std::{borrow::Cow, str::FromStr, time::Duration};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
    Row, SqlitePool,
};
use thiserror::Error;

use funquiz_core::types::{Choice, Question, Quiz, QuizSummary, User, VoteOutcome};

const SQLITE_CONSTRAINT_FOREIGNKEY: &str = "787";
const SQLITE_CONSTRAINT_PRIMARYKEY: &str = "1555";
const SQLITE_CONSTRAINT_UNIQUE: &str = "2067";
const SQLITE_BUSY: &str = "5";
const SQLITE_LOCKED: &str = "6";

/// Top-level database handle that owns the SQLite connection pool.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Establishes a new SQLite connection pool for the provided connection string.
    ///
    /// The database file is created when missing. Every pooled connection runs
    /// with foreign keys enforced, WAL journaling and a 5 second busy timeout.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(StorageError::Connect)?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(StorageError::Connect)?;

        Ok(Self { pool })
    }

    /// Applies migrations located under `migrations/`.
    pub async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .map_err(StorageError::Migration)?;
        Ok(())
    }

    /// Returns a handle for reading and creating user accounts.
    pub fn users(&self) -> UserRepository {
        UserRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for login sessions.
    pub fn sessions(&self) -> SessionRepository {
        SessionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for quizzes.
    pub fn quizzes(&self) -> QuizRepository {
        QuizRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for questions.
    pub fn questions(&self) -> QuestionRepository {
        QuestionRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for choices.
    pub fn choices(&self) -> ChoiceRepository {
        ChoiceRepository {
            pool: self.pool.clone(),
        }
    }

    /// Returns a handle for recording and reading votes.
    pub fn votes(&self) -> VoteRepository {
        VoteRepository {
            pool: self.pool.clone(),
        }
    }

    /// Folds the WAL back into the main database file and truncates it.
    pub async fn wal_checkpoint_truncate(&self) -> Result<CheckpointStats, StorageError> {
        let row = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .fetch_one(&self.pool)
            .await?;
        Ok(CheckpointStats {
            busy: row.try_get::<i64, _>(0)? != 0,
            log_frames: row.try_get(1)?,
            checkpointed_frames: row.try_get(2)?,
        })
    }

    /// Exposes the inner pool when lower level access is required.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Outcome of a WAL checkpoint as reported by SQLite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Another connection prevented the checkpoint from completing.
    pub busy: bool,
    pub log_frames: i64,
    pub checkpointed_frames: i64,
}

/// General storage level errors.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to connect to sqlite: {0}")]
    Connect(sqlx::Error),
    #[error("failed to run database migrations: {0}")]
    Migration(MigrateError),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn constraint_code(err: &sqlx::Error) -> Option<Cow<'_, str>> {
    match err {
        sqlx::Error::Database(db_err) => db_err.code(),
        _ => None,
    }
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        constraint_code(err).as_deref(),
        Some(SQLITE_CONSTRAINT_UNIQUE) | Some(SQLITE_CONSTRAINT_PRIMARYKEY)
    )
}

/// `SQLITE_BUSY` / `SQLITE_LOCKED`: the busy timeout elapsed without getting the lock.
pub fn is_busy(err: &sqlx::Error) -> bool {
    matches!(
        constraint_code(err).as_deref(),
        Some(SQLITE_BUSY) | Some(SQLITE_LOCKED)
    )
}

fn is_foreign_key_violation(err: &sqlx::Error) -> bool {
    constraint_code(err).as_deref() == Some(SQLITE_CONSTRAINT_FOREIGNKEY)
}

#[derive(Debug, sqlx::FromRow)]
struct UserRow {
    id: i64,
    username: String,
    password_hash: String,
    created_at: DateTime<Utc>,
}

impl UserRow {
    fn into_record(self) -> UserRecord {
        UserRecord {
            user: User {
                id: self.id,
                username: self.username,
                created_at: self.created_at,
            },
            password_hash: self.password_hash,
        }
    }
}

/// A user together with the stored password hash, used for authentication.
#[derive(Debug, Clone)]
pub struct UserRecord {
    pub user: User,
    pub password_hash: String,
}

/// Repository for the `users` table.
#[derive(Clone)]
pub struct UserRepository {
    pool: SqlitePool,
}

impl UserRepository {
    /// Creates a user. Usernames are unique ignoring ASCII case.
    pub async fn create(
        &self,
        username: &str,
        password_hash: &str,
        created_at: DateTime<Utc>,
    ) -> Result<User, UserError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, UserRow>(
            "INSERT INTO users (username, password_hash, created_at) VALUES (?, ?, ?) \
             RETURNING id, username, password_hash, created_at",
        )
        .bind(username)
        .bind(password_hash)
        .bind(to_rfc3339(created_at))
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                UserError::DuplicateUsername
            } else {
                UserError::Database(err)
            }
        })?;
        tx.commit().await?;

        Ok(row.into_record().user)
    }

    pub async fn find_by_username(&self, username: &str) -> Result<Option<UserRecord>, UserError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, created_at FROM users WHERE username = ?",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(UserRow::into_record))
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<User>, UserError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT id, username, password_hash, created_at FROM users WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.into_record().user))
    }
}

#[derive(Debug, Error)]
pub enum UserError {
    #[error("a user with that username already exists")]
    DuplicateUsername,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Payload required to persist a login session.
pub struct NewSession<'a> {
    /// Hex encoded SHA-256 of the cookie token. The raw token is never stored.
    pub token_hash: &'a str,
    pub user_id: i64,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Repository for the `sessions` table.
#[derive(Clone)]
pub struct SessionRepository {
    pool: SqlitePool,
}

impl SessionRepository {
    pub async fn insert(&self, session: &NewSession<'_>) -> Result<(), SessionError> {
        sqlx::query(
            "INSERT INTO sessions (token_hash, user_id, created_at, expires_at) VALUES (?, ?, ?, ?)",
        )
        .bind(session.token_hash)
        .bind(session.user_id)
        .bind(to_rfc3339(session.created_at))
        .bind(to_rfc3339(session.expires_at))
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                SessionError::MissingUser
            } else {
                SessionError::Database(err)
            }
        })?;
        Ok(())
    }

    /// Resolves the user owning an unexpired session.
    pub async fn find_user(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<User>, SessionError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT u.id, u.username, u.password_hash, u.created_at \
               FROM sessions AS s \
               JOIN users AS u ON u.id = s.user_id \
              WHERE s.token_hash = ? AND s.expires_at > ?",
        )
        .bind(token_hash)
        .bind(to_rfc3339(now))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| row.into_record().user))
    }

    /// Deletes a session, returning `true` when a row was removed.
    pub async fn delete(&self, token_hash: &str) -> Result<bool, SessionError> {
        let result = sqlx::query("DELETE FROM sessions WHERE token_hash = ?")
            .bind(token_hash)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes up to `limit` sessions that expired at or before `now`.
    pub async fn delete_expired_batch(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<u64, SessionError> {
        let result = sqlx::query(
            "DELETE FROM sessions WHERE id IN \
             (SELECT id FROM sessions WHERE expires_at <= ? ORDER BY expires_at LIMIT ?)",
        )
        .bind(to_rfc3339(now))
        .bind(limit)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session refers to a user that does not exist")]
    MissingUser,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct QuizRow {
    id: i64,
    title: String,
    creator_id: i64,
    created_at: DateTime<Utc>,
}

impl From<QuizRow> for Quiz {
    fn from(row: QuizRow) -> Self {
        Quiz {
            id: row.id,
            title: row.title,
            creator_id: row.creator_id,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct QuizSummaryRow {
    id: i64,
    title: String,
    creator_username: String,
    question_count: i64,
    created_at: DateTime<Utc>,
}

impl From<QuizSummaryRow> for QuizSummary {
    fn from(row: QuizSummaryRow) -> Self {
        QuizSummary {
            id: row.id,
            title: row.title,
            creator_username: row.creator_username,
            question_count: row.question_count as u32,
            created_at: row.created_at,
        }
    }
}

const QUIZ_SUMMARY_SELECT: &str = "\
SELECT q.id,
       q.title,
       u.username AS creator_username,
       (SELECT COUNT(*) FROM questions AS qs WHERE qs.quiz_id = q.id) AS question_count,
       q.created_at
  FROM quizzes AS q
  JOIN users AS u ON u.id = q.creator_id";

/// Repository for the `quizzes` table.
#[derive(Clone)]
pub struct QuizRepository {
    pool: SqlitePool,
}

impl QuizRepository {
    pub async fn create(
        &self,
        title: &str,
        creator_id: i64,
        created_at: DateTime<Utc>,
    ) -> Result<Quiz, QuizError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, QuizRow>(
            "INSERT INTO quizzes (title, creator_id, created_at) VALUES (?, ?, ?) \
             RETURNING id, title, creator_id, created_at",
        )
        .bind(title)
        .bind(creator_id)
        .bind(to_rfc3339(created_at))
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                QuizError::MissingCreator
            } else {
                QuizError::Database(err)
            }
        })?;
        tx.commit().await?;

        Ok(row.into())
    }

    /// Lists the most recently created quizzes, newest first.
    pub async fn latest(&self, limit: i64) -> Result<Vec<QuizSummary>, QuizError> {
        let sql = format!("{QUIZ_SUMMARY_SELECT} ORDER BY q.created_at DESC, q.id DESC LIMIT ?");
        let rows = sqlx::query_as::<_, QuizSummaryRow>(&sql)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Loads a quiz with its creator name and question count.
    pub async fn summary(&self, id: i64) -> Result<Option<QuizSummary>, QuizError> {
        let sql = format!("{QUIZ_SUMMARY_SELECT} WHERE q.id = ?");
        let row = sqlx::query_as::<_, QuizSummaryRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(Into::into))
    }

    pub async fn find(&self, id: i64) -> Result<Option<Quiz>, QuizError> {
        let row = sqlx::query_as::<_, QuizRow>(
            "SELECT id, title, creator_id, created_at FROM quizzes WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Loads a quiz only when it was created by `user_id`.
    pub async fn find_owned(&self, id: i64, user_id: i64) -> Result<Option<Quiz>, QuizError> {
        Ok(self
            .find(id)
            .await?
            .filter(|quiz| quiz.is_owned_by(user_id)))
    }
}

#[derive(Debug, Error)]
pub enum QuizError {
    #[error("quiz creator does not exist")]
    MissingCreator,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct QuestionRow {
    id: i64,
    quiz_id: i64,
    question_text: String,
    pub_date: DateTime<Utc>,
}

impl From<QuestionRow> for Question {
    fn from(row: QuestionRow) -> Self {
        Question {
            id: row.id,
            quiz_id: row.quiz_id,
            question_text: row.question_text,
            pub_date: row.pub_date,
        }
    }
}

/// Question plus its answer options, inserted together.
pub struct NewQuestion<'a> {
    pub quiz_id: i64,
    pub question_text: &'a str,
    pub choices: &'a [String],
    pub pub_date: DateTime<Utc>,
}

/// Repository for the `questions` table.
#[derive(Clone)]
pub struct QuestionRepository {
    pool: SqlitePool,
}

impl QuestionRepository {
    /// Inserts the question and its choices in a single transaction.
    pub async fn create_with_choices(
        &self,
        new_question: &NewQuestion<'_>,
    ) -> Result<(Question, Vec<Choice>), QuestionError> {
        let mut tx = self.pool.begin().await?;

        let question: Question = sqlx::query_as::<_, QuestionRow>(
            "INSERT INTO questions (quiz_id, question_text, pub_date) VALUES (?, ?, ?) \
             RETURNING id, quiz_id, question_text, pub_date",
        )
        .bind(new_question.quiz_id)
        .bind(new_question.question_text)
        .bind(to_rfc3339(new_question.pub_date))
        .fetch_one(&mut *tx)
        .await
        .map_err(|err| {
            if is_foreign_key_violation(&err) {
                QuestionError::MissingQuiz
            } else {
                QuestionError::Database(err)
            }
        })?
        .into();

        let mut choices = Vec::with_capacity(new_question.choices.len());
        for text in new_question.choices {
            let row = sqlx::query_as::<_, ChoiceRow>(
                "INSERT INTO choices (question_id, choice_text, votes) VALUES (?, ?, 0) \
                 RETURNING id, question_id, choice_text, votes",
            )
            .bind(question.id)
            .bind(text)
            .fetch_one(&mut *tx)
            .await?;
            choices.push(row.into());
        }

        tx.commit().await?;
        Ok((question, choices))
    }

    pub async fn find(&self, id: i64) -> Result<Option<Question>, QuestionError> {
        let row = sqlx::query_as::<_, QuestionRow>(
            "SELECT id, quiz_id, question_text, pub_date FROM questions WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Lists a quiz's questions in the order they were added.
    pub async fn list_for_quiz(&self, quiz_id: i64) -> Result<Vec<Question>, QuestionError> {
        let rows = sqlx::query_as::<_, QuestionRow>(
            "SELECT id, quiz_id, question_text, pub_date FROM questions \
             WHERE quiz_id = ? ORDER BY pub_date ASC, id ASC",
        )
        .bind(quiz_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Error)]
pub enum QuestionError {
    #[error("quiz does not exist")]
    MissingQuiz,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

#[derive(Debug, sqlx::FromRow)]
struct ChoiceRow {
    id: i64,
    question_id: i64,
    choice_text: String,
    votes: i64,
}

impl From<ChoiceRow> for Choice {
    fn from(row: ChoiceRow) -> Self {
        Choice {
            id: row.id,
            question_id: row.question_id,
            choice_text: row.choice_text,
            votes: row.votes as u32,
        }
    }
}

/// Repository for the `choices` table.
#[derive(Clone)]
pub struct ChoiceRepository {
    pool: SqlitePool,
}

impl ChoiceRepository {
    pub async fn list_for_question(&self, question_id: i64) -> Result<Vec<Choice>, ChoiceError> {
        let rows = sqlx::query_as::<_, ChoiceRow>(
            "SELECT id, question_id, choice_text, votes FROM choices \
             WHERE question_id = ? ORDER BY id ASC",
        )
        .bind(question_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(Debug, Error)]
pub enum ChoiceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Repository for the `votes` relation and the per-choice counters.
#[derive(Clone)]
pub struct VoteRepository {
    pool: SqlitePool,
}

impl VoteRepository {
    /// Records a vote by `user_id` for `choice_id` on `question_id`.
    ///
    /// The counter increment and the voter row are written in one transaction.
    /// The `(question_id, user_id)` primary key rejects a second vote, in which
    /// case the increment is rolled back and [`VoteOutcome::AlreadyVoted`] is
    /// returned.
    pub async fn cast(
        &self,
        question_id: i64,
        choice_id: i64,
        user_id: i64,
        voted_at: DateTime<Utc>,
    ) -> Result<VoteOutcome, VoteError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "UPDATE choices SET votes = votes + 1 \
             WHERE id = ? AND question_id = ? \
             RETURNING votes",
        )
        .bind(choice_id)
        .bind(question_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Err(VoteError::ChoiceNotFound);
        };
        let votes: i64 = row.get("votes");

        let inserted = sqlx::query(
            "INSERT INTO votes (question_id, choice_id, user_id, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(question_id)
        .bind(choice_id)
        .bind(user_id)
        .bind(to_rfc3339(voted_at))
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(err) if is_unique_violation(&err) => {
                tx.rollback().await?;
                return Ok(VoteOutcome::AlreadyVoted);
            }
            Err(err) if is_foreign_key_violation(&err) => {
                tx.rollback().await?;
                return Err(VoteError::MissingUser);
            }
            Err(err) => return Err(VoteError::Database(err)),
        }

        tx.commit().await?;
        Ok(VoteOutcome::Recorded {
            votes: votes as u32,
        })
    }

    /// Returns the choice the user picked for the question, if any.
    pub async fn user_choice(
        &self,
        question_id: i64,
        user_id: i64,
    ) -> Result<Option<Choice>, VoteError> {
        let row = sqlx::query_as::<_, ChoiceRow>(
            "SELECT c.id, c.question_id, c.choice_text, c.votes \
               FROM votes AS v \
               JOIN choices AS c ON c.id = v.choice_id \
              WHERE v.question_id = ? AND v.user_id = ?",
        )
        .bind(question_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }
}

#[derive(Debug, Error)]
pub enum VoteError {
    #[error("choice does not belong to the question")]
    ChoiceNotFound,
    #[error("voter does not exist")]
    MissingUser,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

fn to_rfc3339(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}
