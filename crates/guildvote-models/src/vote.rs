use std::collections::{BTreeSet, HashSet};

use chrono::{DateTime, Duration, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::{ModelError, VoteSettings, MAX_VOTE_OPTIONS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteOption {
    /// Unique within the poll, assigned on creation.
    pub id: i64,
    pub name: String,
    pub voters: BTreeSet<i64>,
}

impl VoteOption {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            voters: BTreeSet::new(),
        }
    }

    pub fn has_voter(&self, user_id: i64) -> bool {
        self.voters.contains(&user_id)
    }
}

/// A poll. `id` is the id of the message displaying it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    pub id: i64,
    pub guild_id: i64,
    pub channel_id: i64,
    pub title: String,
    pub description: String,
    pub start: DateTime<Utc>,
    pub options: Vec<VoteOption>,
    pub settings: VoteSettings,
}

/// Partial update for the mutable parts of a poll. Options and answers are
/// never touched by an edit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoteEdit {
    pub title: Option<String>,
    pub description: Option<String>,
    pub settings: Option<VoteSettings>,
}

impl Vote {
    /// Create a poll without answers. Option ids are assigned `1..=n` in the
    /// given order and `start` is truncated to whole seconds.
    #[allow(clippy::too_many_arguments)]
    pub fn new<I, S>(
        id: i64,
        guild_id: i64,
        channel_id: i64,
        title: impl Into<String>,
        description: impl Into<String>,
        start: DateTime<Utc>,
        option_names: I,
        settings: VoteSettings,
    ) -> Result<Self, ModelError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let options = option_names
            .into_iter()
            .zip(1_i64..)
            .map(|(name, id)| VoteOption::new(id, name))
            .collect();
        let vote = Self {
            id,
            guild_id,
            channel_id,
            title: title.into(),
            description: description.into(),
            start: start.trunc_subsecs(0),
            options,
            settings,
        };
        vote.validate()?;
        Ok(vote)
    }

    /// Check the structural invariants of a poll.
    ///
    /// Per-voter answer limits are not checked here; they are enforced when
    /// answers are cast.
    pub fn validate(&self) -> Result<(), ModelError> {
        if self.channel_id == 0 {
            return Err(ModelError::MissingChannel);
        }
        if self.title.trim().is_empty() {
            return Err(ModelError::BlankTitle);
        }
        if self.description.trim().is_empty() {
            return Err(ModelError::BlankDescription);
        }
        if self.options.is_empty() || self.options.len() > MAX_VOTE_OPTIONS {
            return Err(ModelError::OptionCount(self.options.len()));
        }
        if self.start.timestamp_subsec_nanos() != 0 {
            return Err(ModelError::SubsecondStart);
        }
        let mut seen = HashSet::with_capacity(self.options.len());
        for option in &self.options {
            if option.name.trim().is_empty() {
                return Err(ModelError::BlankOptionName);
            }
            if !seen.insert(option.id) {
                return Err(ModelError::DuplicateOptionId(option.id));
            }
        }
        Ok(())
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.start + Duration::seconds(self.settings.duration_seconds())
    }

    pub fn has_ended(&self, now: DateTime<Utc>) -> bool {
        now > self.ends_at()
    }

    pub fn option(&self, option_id: i64) -> Option<&VoteOption> {
        self.options.iter().find(|option| option.id == option_id)
    }

    /// Option ids the user currently has an answer on, in display order.
    pub fn answers_of(&self, user_id: i64) -> Vec<i64> {
        self.options
            .iter()
            .filter(|option| option.has_voter(user_id))
            .map(|option| option.id)
            .collect()
    }

    /// Number of distinct users with at least one answer.
    pub fn voter_count(&self) -> usize {
        self.options
            .iter()
            .flat_map(|option| option.voters.iter())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Number of answers over all options.
    pub fn answer_count(&self) -> usize {
        self.options.iter().map(|option| option.voters.len()).sum()
    }

    /// Apply an edit, returning the edited poll.
    pub fn apply(&self, edit: VoteEdit) -> Result<Self, ModelError> {
        let vote = Self {
            title: edit.title.unwrap_or_else(|| self.title.clone()),
            description: edit.description.unwrap_or_else(|| self.description.clone()),
            settings: edit.settings.unwrap_or_else(|| self.settings.clone()),
            ..self.clone()
        };
        vote.validate()?;
        Ok(vote)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn poll(options: &[&str]) -> Result<Vote, ModelError> {
        Vote::new(
            10,
            1,
            2,
            "Lunch",
            "Where do we eat?",
            start(),
            options.iter().copied(),
            VoteSettings::system_default(),
        )
    }

    #[test]
    fn new_assigns_sequential_option_ids() {
        let vote = poll(&["Pizza", "Sushi", "Tacos"]).unwrap();
        let ids: Vec<i64> = vote.options.iter().map(|o| o.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert!(vote.options.iter().all(|o| o.voters.is_empty()));
    }

    #[test]
    fn new_truncates_subseconds() {
        let with_millis = start() + Duration::milliseconds(750);
        let vote = Vote::new(
            1,
            1,
            1,
            "t",
            "d",
            with_millis,
            ["a"],
            VoteSettings::system_default(),
        )
        .unwrap();
        assert_eq!(vote.start, start());
    }

    #[test]
    fn rejects_bad_option_counts() {
        assert_eq!(poll(&[]).unwrap_err(), ModelError::OptionCount(0));
        let many: Vec<String> = (0..26).map(|i| format!("o{i}")).collect();
        let err = Vote::new(
            1,
            1,
            1,
            "t",
            "d",
            start(),
            many,
            VoteSettings::system_default(),
        )
        .unwrap_err();
        assert_eq!(err, ModelError::OptionCount(26));
    }

    #[test]
    fn rejects_blank_text_and_missing_channel() {
        let settings = VoteSettings::system_default();
        assert_eq!(
            Vote::new(1, 1, 1, "  ", "d", start(), ["a"], settings.clone()).unwrap_err(),
            ModelError::BlankTitle
        );
        assert_eq!(
            Vote::new(1, 1, 1, "t", "", start(), ["a"], settings.clone()).unwrap_err(),
            ModelError::BlankDescription
        );
        assert_eq!(
            Vote::new(1, 1, 0, "t", "d", start(), ["a"], settings.clone()).unwrap_err(),
            ModelError::MissingChannel
        );
        assert_eq!(
            Vote::new(1, 1, 1, "t", "d", start(), ["a", " "], settings).unwrap_err(),
            ModelError::BlankOptionName
        );
    }

    #[test]
    fn validate_catches_duplicate_option_ids() {
        let mut vote = poll(&["a", "b"]).unwrap();
        vote.options[1].id = vote.options[0].id;
        assert_eq!(vote.validate(), Err(ModelError::DuplicateOptionId(1)));
    }

    #[test]
    fn end_time_follows_settings_duration() {
        let vote = poll(&["a"]).unwrap();
        assert_eq!(vote.ends_at(), start() + Duration::hours(24));
        assert!(!vote.has_ended(vote.ends_at()));
        assert!(vote.has_ended(vote.ends_at() + Duration::seconds(1)));
    }

    #[test]
    fn counts_distinct_voters_and_answers() {
        let mut vote = poll(&["a", "b", "c"]).unwrap();
        vote.options[0].voters.extend([1, 2]);
        vote.options[1].voters.extend([2, 3]);
        assert_eq!(vote.voter_count(), 3);
        assert_eq!(vote.answer_count(), 4);
        assert_eq!(vote.answers_of(2), vec![1, 2]);
        assert!(vote.answers_of(9).is_empty());
    }

    #[test]
    fn apply_edit_keeps_options_and_answers() {
        let mut vote = poll(&["a", "b"]).unwrap();
        vote.options[0].voters.insert(7);
        let edited = vote
            .apply(VoteEdit {
                title: Some("Dinner".into()),
                ..VoteEdit::default()
            })
            .unwrap();
        assert_eq!(edited.title, "Dinner");
        assert_eq!(edited.description, vote.description);
        assert_eq!(edited.options, vote.options);

        let blank = vote.apply(VoteEdit {
            description: Some(" ".into()),
            ..VoteEdit::default()
        });
        assert_eq!(blank.unwrap_err(), ModelError::BlankDescription);
    }
}
