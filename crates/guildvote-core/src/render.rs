use std::fmt::Write;

use guildvote_models::Vote;

/// Turns a poll into the text of its chat message.
pub trait Renderer: Send + Sync {
    fn render_vote_message(&self, vote: &Vote) -> String;
}

const DATE_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Markdown rendering with a results table in a code block.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextRenderer;

impl Renderer for TextRenderer {
    fn render_vote_message(&self, vote: &Vote) -> String {
        let tz = vote.settings.tz();
        let from = vote.start.with_timezone(&tz).format(DATE_FORMAT);
        let until = vote.ends_at().with_timezone(&tz).format(DATE_FORMAT);

        let mut text = String::new();
        let _ = write!(text, "**{}**\n\n{}\n\n", vote.title, vote.description);
        let _ = writeln!(text, "• From {from} until {until}");
        let per_user = vote.settings.answers_per_user();
        let noun = if per_user > 1 { "Answers" } else { "Answer" };
        let _ = writeln!(text, "• {per_user:2} {noun} per User");
        let negation = if vote.settings.can_change_answers() {
            ""
        } else {
            "*not* "
        };
        let _ = writeln!(text, "• You can {negation}change your answer");
        let _ = write!(text, "• {:4} Users\n\n", vote.voter_count());

        let total = vote.answer_count();
        let rows: Vec<String> = vote
            .options
            .iter()
            .enumerate()
            .map(|(index, option)| {
                let count = option.voters.len();
                let percent = if count == 0 || total == 0 {
                    0
                } else {
                    (count as f64 * 100.0 / total as f64).round() as u64
                };
                format!("{:2}. {} → {count:3} / {percent:3}%", index + 1, option.name)
            })
            .collect();
        let _ = write!(text, "```\n{}\n```", rows.join("\n"));
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use guildvote_models::VoteSettings;
    use std::time::Duration;

    fn vote(can_change: bool, timezone: &str) -> Vote {
        vote_with_answers(2, can_change, timezone)
    }

    fn vote_with_answers(answers_per_user: u8, can_change: bool, timezone: &str) -> Vote {
        let settings = VoteSettings::new(
            answers_per_user,
            Duration::from_secs(90 * 60),
            can_change,
            timezone,
        )
        .unwrap();
        Vote::new(
            1,
            10,
            20,
            "Lunch",
            "Where do we eat?",
            Utc.with_ymd_and_hms(2024, 1, 15, 11, 0, 0).unwrap(),
            ["Pizza", "Sushi", "Tacos"],
            settings,
        )
        .unwrap()
    }

    #[test]
    fn renders_header_settings_and_results() {
        let mut vote = vote(true, "UTC");
        vote.options[0].voters.extend([1, 2]);
        vote.options[1].voters.insert(1);

        let text = TextRenderer.render_vote_message(&vote);
        let expected = "**Lunch**\n\nWhere do we eat?\n\n\
            • From 2024-01-15 11:00 until 2024-01-15 12:30\n\
            •  2 Answers per User\n\
            • You can change your answer\n\
            •    2 Users\n\n\
            ```\n \
            1. Pizza →   2 /  67%\n \
            2. Sushi →   1 /  33%\n \
            3. Tacos →   0 /   0%\n\
            ```";
        assert_eq!(text, expected);
    }

    #[test]
    fn uses_poll_timezone_and_locked_answers() {
        let vote = vote(false, "Europe/Berlin");
        let text = TextRenderer.render_vote_message(&vote);
        assert!(text.contains("• From 2024-01-15 12:00 until 2024-01-15 13:30\n"));
        assert!(text.contains("• You can *not* change your answer\n"));
        assert!(text.contains("•    0 Users"));
        assert!(text.contains(" 1. Pizza →   0 /   0%"));
    }

    #[test]
    fn single_answer_is_singular() {
        let text = TextRenderer.render_vote_message(&vote_with_answers(1, true, "UTC"));
        assert!(text.contains("•  1 Answer per User\n"));
        assert!(!text.contains("Answers"));
    }
}
