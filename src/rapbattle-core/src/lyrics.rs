//! Verse planning, prompt assembly and lyric generation.

use std::time::Duration;

use tracing::{debug, info};

use crate::battle::{BattleRequest, BeatStyle, Verse};
use crate::config::PromptsConfig;
use crate::error::{ProviderError, StageFailure};
use crate::participant::Speaker;
use crate::provider::TextGenerator;

/// Position of one verse in the battle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerseSlot {
    pub speaker: Speaker,
    /// 1-based position in the battle.
    pub sequence: usize,
    pub finale: bool,
}

/// Alternate A, B, A, B... for `verses_per_participant` rounds.
pub fn plan_verses(verses_per_participant: usize) -> Vec<VerseSlot> {
    let total = verses_per_participant * 2;
    (0..total)
        .map(|i| VerseSlot {
            speaker: if i % 2 == 0 { Speaker::A } else { Speaker::B },
            sequence: i + 1,
            finale: i + 2 >= total,
        })
        .collect()
}

/// Split pre-written lyrics into verses on blank lines.
pub fn split_verses(text: &str) -> Vec<String> {
    let mut verses = Vec::new();
    let mut current: Vec<&str> = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            if !current.is_empty() {
                verses.push(current.join("\n"));
                current.clear();
            }
        } else {
            current.push(line);
        }
    }
    if !current.is_empty() {
        verses.push(current.join("\n"));
    }
    verses
}

/// Exactly `count` verses from pre-written lyrics. Extra blocks are folded
/// into the last verse.
pub fn provided_verses(text: &str, count: usize) -> Vec<String> {
    let mut verses = split_verses(text);
    if count > 0 && verses.len() > count {
        let tail = verses.split_off(count - 1);
        verses.push(tail.join("\n"));
    }
    verses
}

/// One request to the text generator.
#[derive(Debug, Clone, PartialEq)]
pub struct VersePrompt {
    pub speaker: Speaker,
    pub sequence: usize,
    pub system: String,
    pub user: String,
}

fn verse_instruction(slot: &VerseSlot, total: usize) -> &'static str {
    if slot.sequence == 1 {
        "This is the OPENING verse - establish dominance, introduce yourself, and set the tone"
    } else if slot.sequence == total {
        "This is the CLOSING verse - deliver your most devastating bars, end with a knockout punchline"
    } else if slot.sequence == 2 {
        "This is a RESPONSE verse - directly respond to the previous verse, counter their points, and attack"
    } else {
        "This is a COMEBACK verse - escalate the battle, reference earlier disses, and hit harder"
    }
}

fn verse_context(slot: &VerseSlot, total: usize) -> &'static str {
    if slot.sequence == 1 {
        "You're opening the battle. No previous verses yet."
    } else if slot.sequence == total {
        "This is the final verse. Time to close out and win the battle."
    } else if slot.sequence == 2 {
        "You're responding to your opponent's opening verse."
    } else {
        "The battle is heating up. Go harder than your last verse."
    }
}

/// Flow guidance for the beat the verse will be performed on.
pub fn beat_flow_guidance(style: BeatStyle, bpm: u32) -> String {
    let flow = match style {
        BeatStyle::Trap => format!(
            "Rolling hi-hats at {} BPM. Use triplet flows and ad-libs. Leave room for 808 drops.",
            bpm
        ),
        BeatStyle::BoomBap => format!(
            "Classic {} BPM groove. Head-nodding pocket flow, emphasize beats 2 and 4.",
            bpm
        ),
        BeatStyle::WestCoast => format!(
            "Bouncy g-funk at {} BPM. Smooth, laid-back delivery with syncopated phrases.",
            bpm
        ),
        BeatStyle::Drill => format!(
            "Aggressive {} BPM. Sliding 808s, menacing tone, staccato delivery.",
            bpm
        ),
    };
    format!(
        "BEAT: {} at {} BPM\nFLOW GUIDANCE: {}",
        style.display_name(),
        bpm,
        flow
    )
}

fn previous_verses_section(request: &BattleRequest, previous: &[Verse]) -> String {
    if previous.is_empty() {
        return String::new();
    }
    let mut section = String::from("PREVIOUS VERSES IN THIS BATTLE:");
    for verse in previous {
        section.push_str(&format!(
            "\n\n[Verse {} - {}]\n{}",
            verse.sequence,
            request.participant(verse.speaker).name,
            verse.text
        ));
    }
    section
}

/// Assemble the prompt for `slot`, carrying every earlier verse as context.
pub fn build_prompt(
    request: &BattleRequest,
    prompts: &PromptsConfig,
    slot: &VerseSlot,
    total: usize,
    previous: &[Verse],
) -> VersePrompt {
    let rapper = request.participant(slot.speaker);
    let opponent = request.participant(slot.speaker.opponent());
    let bpm = request
        .bpm_hint
        .unwrap_or_else(|| request.beat_style.default_bpm());

    let description = rapper
        .description
        .as_deref()
        .map(|d| format!("ABOUT {}: {}", rapper.name, d))
        .unwrap_or_default();

    let user = prompts
        .verse_template
        .replace("{topic}", &request.topic)
        .replace("{description}", &description)
        .replace("{beat_context}", &beat_flow_guidance(request.beat_style, bpm))
        .replace("{rapper_name}", &rapper.name)
        .replace("{rapper_style}", rapper.style.display_name())
        .replace("{opponent_name}", &opponent.name)
        .replace(
            "{scene}",
            request
                .scene
                .as_deref()
                .unwrap_or("A packed venue with an electric crowd"),
        )
        .replace("{verse_number}", &slot.sequence.to_string())
        .replace("{verse_total}", &total.to_string())
        .replace("{verse_context}", verse_context(slot, total))
        .replace("{previous_verses}", &previous_verses_section(request, previous))
        .replace("{verse_instruction}", verse_instruction(slot, total));

    VersePrompt {
        speaker: slot.speaker,
        sequence: slot.sequence,
        system: prompts.system_prompt.clone(),
        user,
    }
}

/// Clean generated text into one bar per line.
///
/// Strips reasoning blocks, leftover tags, code fences, markdown emphasis and
/// any "Verse N:" style label the model adds despite instructions.
pub fn sanitize_verse(response: &str) -> String {
    let tags_to_strip = [
        "thinking",
        "think",
        "reflection",
        "reasoning",
        "thought",
        "scratchpad",
        "plan",
        "analysis",
    ];

    let mut result = response.to_string();

    for tag in &tags_to_strip {
        let pattern = format!(r"(?is)<{tag}[^>]*>.*?</{tag}>", tag = tag);
        if let Ok(re) = regex::Regex::new(&pattern) {
            result = re.replace_all(&result, "").to_string();
        }
    }

    if let Ok(orphan_re) = regex::Regex::new(r"</?[\w]+[^>]*>") {
        result = orphan_re.replace_all(&result, "").to_string();
    }

    result = result.replace("```", "").replace('*', "");

    let label_re = regex::Regex::new(r"(?i)^\[?verse\s*\d+(\s*[-:(][^\]]{0,40})?\]?:?$").ok();

    result
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .filter(|line| !label_re.as_ref().is_some_and(|re| re.is_match(line)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Produce every verse of the battle in order.
///
/// Participants with pre-written lyrics use them; the others are generated
/// one verse at a time, each prompt seeing all earlier verses.
pub async fn write_verses(
    generator: Option<&dyn TextGenerator>,
    request: &BattleRequest,
    prompts: &PromptsConfig,
    timeout: Duration,
) -> Result<Vec<Verse>, StageFailure> {
    let per_participant = request.effective_verse_count();
    let slots = plan_verses(per_participant);
    let total = slots.len();

    let provided: Vec<Option<Vec<String>>> = Speaker::BOTH
        .iter()
        .map(|speaker| {
            request
                .participant(*speaker)
                .lyrics
                .as_deref()
                .filter(|l| !l.trim().is_empty())
                .map(|l| provided_verses(l, per_participant))
        })
        .collect();

    let mut verses: Vec<Verse> = Vec::with_capacity(total);
    for slot in &slots {
        let round = (slot.sequence - 1) / 2;
        let own = provided[speaker_index(slot.speaker)]
            .as_ref()
            .and_then(|v| v.get(round));

        let text = match own {
            Some(text) => text.clone(),
            None => {
                let generator = generator.ok_or_else(|| {
                    StageFailure::Provider(ProviderError::Unavailable {
                        provider: "text".to_string(),
                        reason: "no text generator configured".to_string(),
                    })
                })?;
                let prompt = build_prompt(request, prompts, slot, total, &verses);
                debug!(sequence = slot.sequence, speaker = %slot.speaker, "generating verse");
                generate_verse(generator, &prompt, timeout).await?
            }
        };

        verses.push(Verse {
            speaker: slot.speaker,
            sequence: slot.sequence,
            text,
            finale: slot.finale,
        });
    }

    info!(verses = verses.len(), "lyrics ready");
    Ok(verses)
}

fn speaker_index(speaker: Speaker) -> usize {
    match speaker {
        Speaker::A => 0,
        Speaker::B => 1,
    }
}

async fn generate_verse(
    generator: &dyn TextGenerator,
    prompt: &VersePrompt,
    timeout: Duration,
) -> Result<String, StageFailure> {
    let raw = tokio::time::timeout(timeout, generator.generate(prompt))
        .await
        .map_err(|_| StageFailure::Timeout {
            operation: "lyric generation",
            after: timeout,
        })??;

    let text = sanitize_verse(&raw);
    if text.is_empty() {
        return Err(ProviderError::EmptyResponse {
            provider: generator.name().to_string(),
        }
        .into());
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_config;
    use crate::participant::{DeliveryStyle, ParticipantInput};
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct EchoGenerator {
        prompts: Mutex<Vec<VersePrompt>>,
    }

    #[async_trait]
    impl TextGenerator for EchoGenerator {
        fn name(&self) -> &str {
            "echo"
        }

        async fn generate(&self, prompt: &VersePrompt) -> Result<String, ProviderError> {
            self.prompts.lock().unwrap().push(prompt.clone());
            Ok(format!("<think>hmm</think>**bar one {}**\nbar two", prompt.sequence))
        }
    }

    fn request() -> BattleRequest {
        BattleRequest::new(
            ParticipantInput::new("Nova", DeliveryStyle::Grime),
            ParticipantInput::new("Orbit", DeliveryStyle::WestCoast),
            "who rules the galaxy",
            BeatStyle::BoomBap,
        )
    }

    #[test]
    fn test_plan_alternates_and_marks_finales() {
        let plan = plan_verses(2);
        let speakers: Vec<Speaker> = plan.iter().map(|s| s.speaker).collect();
        assert_eq!(speakers, vec![Speaker::A, Speaker::B, Speaker::A, Speaker::B]);
        let finales: Vec<bool> = plan.iter().map(|s| s.finale).collect();
        assert_eq!(finales, vec![false, false, true, true]);
    }

    #[test]
    fn test_split_verses_on_blank_lines() {
        let verses = split_verses("line one\n  line two \n\n\n line three\n");
        assert_eq!(verses, vec!["line one\nline two", "line three"]);
    }

    #[test]
    fn test_extra_blocks_merge_into_finale() {
        let verses = provided_verses("a\n\nb\n\nc", 2);
        assert_eq!(verses, vec!["a", "b\nc"]);
    }

    #[test]
    fn test_instructions_by_position() {
        let plan = plan_verses(2);
        assert!(verse_instruction(&plan[0], 4).contains("OPENING"));
        assert!(verse_instruction(&plan[1], 4).contains("RESPONSE"));
        assert!(verse_instruction(&plan[2], 4).contains("COMEBACK"));
        assert!(verse_instruction(&plan[3], 4).contains("CLOSING"));
    }

    #[test]
    fn test_prompt_carries_previous_verses_and_guidance() {
        let config = default_config();
        let req = request();
        let plan = plan_verses(2);
        let previous = vec![Verse {
            speaker: Speaker::A,
            sequence: 1,
            text: "first bars".to_string(),
            finale: false,
        }];
        let prompt = build_prompt(&req, &config.prompts, &plan[1], 4, &previous);
        assert_eq!(prompt.speaker, Speaker::B);
        assert!(prompt.user.contains("CURRENT RAPPER: Orbit (West Coast)"));
        assert!(prompt.user.contains("OPPONENT: Nova"));
        assert!(prompt.user.contains("[Verse 1 - Nova]\nfirst bars"));
        assert!(prompt.user.contains("BEAT: boom bap at 90 BPM"));
        assert!(!prompt.user.contains("{"));
    }

    #[test]
    fn test_sanitize_verse_keeps_bars_on_lines() {
        let input = "<thinking>plan it</thinking>Verse 1:\n**I came  to win**\n\n```\nyou came to lose\n```";
        assert_eq!(sanitize_verse(input), "I came to win\nyou came to lose");
    }

    #[test]
    fn test_sanitize_verse_strips_orphan_tags() {
        let output = sanitize_verse("Start <think>nested <inner>tags</inner> content</think> end");
        assert!(!output.contains('<'));
        assert!(!output.contains('>'));
    }

    #[tokio::test]
    async fn test_generates_only_missing_participant() {
        let config = default_config();
        let mut req = request();
        req.fighter_a.lyrics = Some("nova one\n\nnova two".to_string());
        let generator = EchoGenerator {
            prompts: Mutex::new(Vec::new()),
        };

        let verses = write_verses(Some(&generator), &req, &config.prompts, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(verses.len(), 4);
        assert_eq!(verses[0].text, "nova one");
        assert_eq!(verses[2].text, "nova two");
        assert_eq!(verses[1].text, "bar one 2\nbar two");
        let prompts = generator.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 2);
        assert!(prompts.iter().all(|p| p.speaker == Speaker::B));
        // The last prompt saw all three earlier verses.
        assert!(prompts[1].user.contains("[Verse 3 - Nova]\nnova two"));
    }

    #[tokio::test]
    async fn test_missing_generator_is_a_provider_failure() {
        let config = default_config();
        let err = write_verses(None, &request(), &config.prompts, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StageFailure::Provider(ProviderError::Unavailable { .. })));
    }
}
