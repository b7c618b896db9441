use std::str::FromStr;
use std::time::Duration;

use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::{ModelError, MAX_VOTE_OPTIONS};

const MAX_DURATION_SECONDS: u64 = i32::MAX as u64;
const DEFAULT_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Poll behaviour settings. Also used as the per-guild default record.
///
/// Values are validated on construction and never change afterwards; derive a
/// new value with [`VoteSettings::with_overrides`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "VoteSettingsRecord", into = "VoteSettingsRecord")]
pub struct VoteSettings {
    answers_per_user: u8,
    duration: Duration,
    can_change_answers: bool,
    timezone: String,
}

#[derive(Serialize, Deserialize)]
struct VoteSettingsRecord {
    answers_per_user: u8,
    duration_seconds: u64,
    can_change_answers: bool,
    timezone: String,
}

impl VoteSettings {
    pub fn new(
        answers_per_user: u8,
        duration: Duration,
        can_change_answers: bool,
        timezone: impl Into<String>,
    ) -> Result<Self, ModelError> {
        if answers_per_user == 0 || usize::from(answers_per_user) > MAX_VOTE_OPTIONS {
            return Err(ModelError::AnswersPerUser(answers_per_user));
        }
        let seconds = duration.as_secs();
        if seconds == 0 || seconds > MAX_DURATION_SECONDS {
            return Err(ModelError::Duration(seconds));
        }
        let timezone = timezone.into();
        if Tz::from_str(&timezone).is_err() {
            return Err(ModelError::Timezone(timezone));
        }
        Ok(Self {
            answers_per_user,
            duration: Duration::from_secs(seconds),
            can_change_answers,
            timezone,
        })
    }

    /// One answer per user, 24 hours, answers may be changed, UTC.
    pub fn system_default() -> Self {
        Self {
            answers_per_user: 1,
            duration: DEFAULT_DURATION,
            can_change_answers: true,
            timezone: "UTC".to_string(),
        }
    }

    /// Build settings from `self`, replacing every field that is given.
    /// The timezone always comes from `self`.
    pub fn with_overrides(
        &self,
        duration: Option<Duration>,
        answers_per_user: Option<u8>,
        can_change_answers: Option<bool>,
    ) -> Result<Self, ModelError> {
        Self::new(
            answers_per_user.unwrap_or(self.answers_per_user),
            duration.unwrap_or(self.duration),
            can_change_answers.unwrap_or(self.can_change_answers),
            self.timezone.clone(),
        )
    }

    pub fn answers_per_user(&self) -> u8 {
        self.answers_per_user
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn duration_seconds(&self) -> i64 {
        // Bounded by MAX_DURATION_SECONDS on construction.
        self.duration.as_secs() as i64
    }

    pub fn can_change_answers(&self) -> bool {
        self.can_change_answers
    }

    pub fn timezone(&self) -> &str {
        &self.timezone
    }

    pub fn tz(&self) -> Tz {
        Tz::from_str(&self.timezone).unwrap_or(Tz::UTC)
    }
}

impl Default for VoteSettings {
    fn default() -> Self {
        Self::system_default()
    }
}

impl TryFrom<VoteSettingsRecord> for VoteSettings {
    type Error = ModelError;

    fn try_from(record: VoteSettingsRecord) -> Result<Self, Self::Error> {
        Self::new(
            record.answers_per_user,
            Duration::from_secs(record.duration_seconds),
            record.can_change_answers,
            record.timezone,
        )
    }
}

impl From<VoteSettings> for VoteSettingsRecord {
    fn from(settings: VoteSettings) -> Self {
        Self {
            answers_per_user: settings.answers_per_user,
            duration_seconds: settings.duration.as_secs(),
            can_change_answers: settings.can_change_answers,
            timezone: settings.timezone,
        }
    }
}
