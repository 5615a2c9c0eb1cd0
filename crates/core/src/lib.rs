//! Domain layer shared by the storage and HTTP crates: entity types, form
//! validation, flash messages and result tallying.

pub mod flash;
pub mod forms;
pub mod tally;
pub mod types;

pub use flash::{Flash, FlashLevel, FlashMessage};
pub use forms::{
    Credentials, FormErrors, LoginForm, NewAccount, QuestionDraft, QuestionForm, QuizForm,
    RegisterForm, VoteForm, CHOICE_SLOTS,
};
pub use tally::{Tally, TallyRow};
pub use types::{Choice, Question, Quiz, QuizSummary, User, VoteOutcome};
