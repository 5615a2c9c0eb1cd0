use serde::Serialize;

use crate::types::Choice;

/// Aggregated results for a single question.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub question_id: i64,
    pub total_votes: u32,
    pub rows: Vec<TallyRow>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TallyRow {
    pub choice_id: i64,
    pub choice_text: String,
    pub votes: u32,
    /// Share of all votes, rounded to the nearest whole percent.
    pub percent: u32,
    /// Holds the highest count. Several rows lead on a tie; none lead without votes.
    pub leading: bool,
}

impl Tally {
    /// Builds the tally from the question's choices, keeping their order.
    pub fn from_choices(question_id: i64, choices: &[Choice]) -> Self {
        let total: u64 = choices.iter().map(|c| u64::from(c.votes)).sum();
        let max = choices.iter().map(|c| c.votes).max().unwrap_or(0);

        let rows = choices
            .iter()
            .map(|choice| TallyRow {
                choice_id: choice.id,
                choice_text: choice.choice_text.clone(),
                votes: choice.votes,
                percent: percent_of(u64::from(choice.votes), total),
                leading: max > 0 && choice.votes == max,
            })
            .collect();

        Self {
            question_id,
            total_votes: u32::try_from(total).unwrap_or(u32::MAX),
            rows,
        }
    }

    pub fn leaders(&self) -> impl Iterator<Item = &TallyRow> {
        self.rows.iter().filter(|row| row.leading)
    }
}

fn percent_of(part: u64, total: u64) -> u32 {
    if total == 0 {
        return 0;
    }
    ((part * 200 + total) / (total * 2)) as u32
}
