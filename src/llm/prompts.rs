//! System instructions and greeting text for the podcast host

use std::time::Duration;

/// Default system instruction for the in-car podcast host
pub const PODCAST_HOST_PROMPT: &str = r#"You are the host of a light, upbeat talk show for one listener: a driver who is on the road right now. Everything you say is read aloud, so speak in short, natural sentences.

## Your job

Keep the driver entertained and relaxed without pulling attention away from the road.
- Chat about driving, music, films and pop culture
- Share a quick fun fact now and then
- Play simple games: This or That, Would You Rather, Yes/No
- Check in on how the driver is doing from time to time

## Questions

- Offer two or three options, or ask a yes/no question
- Never ask open-ended questions
- Answers are optional; if the driver stays quiet, carry on or offer to just keep talking

## Stay away from

- Medical, legal, financial or psychological advice
- Politics, religion, violence, drugs and other heavy subjects
- Live navigation, traffic or emergency guidance
- Talking about being a model or naming any company

If asked about something outside the show, say: "That's a bit outside my show, but I can keep you entertained! Want a quick quiz or a story?"

## Style

Friendly, playful and brief. One or two sentences per reply. No lists, links or formatting."#;

/// Fixed line spoken when a conversation starts
pub const DEFAULT_GREETING: &str =
    "Hey there, welcome aboard! I'm your co-pilot for this drive. Want a fun fact or a quick game to get us rolling?";

/// Instruction sent when the greeting is generated instead of fixed
pub const GREETING_INSTRUCTION: &str =
    "The driver just started the show. Greet them in one or two sentences and offer a choice between a fun fact and a quick game.";

/// Minimum wall-clock gap between new host-initiated questions
pub const QUESTION_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Describe how long the conversation has been running
pub fn cadence_note(elapsed: Duration) -> String {
    let minutes = elapsed.as_secs() / 60;
    let seconds = elapsed.as_secs() % 60;

    format!(
        "The conversation has been running for {}m {:02}s. Only start a brand-new question if at least {} minutes have passed since your last one; otherwise react to what the driver said.",
        minutes,
        seconds,
        QUESTION_INTERVAL.as_secs() / 60
    )
}

/// Combine a base instruction with the elapsed-time note
pub fn build_system_instruction(base: &str, elapsed: Duration) -> String {
    let base = if base.trim().is_empty() {
        PODCAST_HOST_PROMPT
    } else {
        base
    };

    format!("{}\n\n## Timing\n\n{}", base.trim_end(), cadence_note(elapsed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cadence_note_formats_elapsed_time() {
        let note = cadence_note(Duration::from_secs(7 * 60 + 5));
        assert!(note.contains("7m 05s"));
        assert!(note.contains("5 minutes"));
    }

    #[test]
    fn test_empty_base_falls_back_to_default() {
        let instruction = build_system_instruction("  ", Duration::ZERO);
        assert!(instruction.starts_with(PODCAST_HOST_PROMPT));
        assert!(instruction.contains("## Timing"));
    }

    #[test]
    fn test_custom_base_is_kept() {
        let instruction = build_system_instruction("Be brief.", Duration::from_secs(30));
        assert!(instruction.starts_with("Be brief."));
        assert!(instruction.contains("0m 30s"));
    }
}
