pub mod settings;
pub mod vote;

pub use settings::VoteSettings;
pub use vote::{Vote, VoteEdit, VoteOption};

use thiserror::Error;

/// Upper bound for both the number of options on a poll and the number of
/// answers a single user may give.
pub const MAX_VOTE_OPTIONS: usize = 25;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ModelError {
    #[error("answers per user must be between 1 and 25, got {0}")]
    AnswersPerUser(u8),
    #[error("duration must be between 1 second and 2147483647 seconds, got {0} seconds")]
    Duration(u64),
    #[error("unknown timezone: {0}")]
    Timezone(String),
    #[error("channel id must not be 0")]
    MissingChannel,
    #[error("title must not be blank")]
    BlankTitle,
    #[error("description must not be blank")]
    BlankDescription,
    #[error("a poll needs between 1 and 25 options, got {0}")]
    OptionCount(usize),
    #[error("option names must not be blank")]
    BlankOptionName,
    #[error("option id {0} is used more than once")]
    DuplicateOptionId(i64),
    #[error("poll start must have whole-second precision")]
    SubsecondStart,
}
