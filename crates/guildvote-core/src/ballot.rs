use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use guildvote_models::Vote;
use thiserror::Error;

/// Why a ballot was refused. The messages are shown to the voter.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BallotRejection {
    #[error("This poll has already ended.")]
    Ended,
    #[error("You already voted and can't change your answer.")]
    AnswerLocked,
    #[error("You didn't select any answer.")]
    NothingSelected,
    #[error("You selected too many answers. This poll allows at most {0}.")]
    TooManyAnswers(u8),
    #[error("Option {0} doesn't exist in this poll.")]
    UnknownOption(i64),
}

/// Structural checks every stored ballot must pass: each option exists and
/// the answer cap is respected. An empty selection is allowed.
pub fn check_selection(vote: &Vote, chosen: &BTreeSet<i64>) -> Result<(), BallotRejection> {
    if let Some(unknown) = chosen.iter().find(|id| vote.option(**id).is_none()) {
        return Err(BallotRejection::UnknownOption(*unknown));
    }
    let cap = vote.settings.answers_per_user();
    if chosen.len() > usize::from(cap) {
        return Err(BallotRejection::TooManyAnswers(cap));
    }
    Ok(())
}

/// Full check of a ballot submitted by a voter at `now`.
pub fn check_ballot(
    vote: &Vote,
    voter_id: i64,
    chosen: &BTreeSet<i64>,
    now: DateTime<Utc>,
) -> Result<(), BallotRejection> {
    if vote.has_ended(now) {
        return Err(BallotRejection::Ended);
    }
    if !vote.settings.can_change_answers() && !vote.answers_of(voter_id).is_empty() {
        return Err(BallotRejection::AnswerLocked);
    }
    if chosen.is_empty() {
        return Err(BallotRejection::NothingSelected);
    }
    check_selection(vote, chosen)
}
