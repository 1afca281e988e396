//! Prompt templates.
//!
//! - **Agent action**: role instructions, task, team history, learned
//!   behaviors and policy exemplars, ending in an `Action:` request.
//! - **Behavior extraction**: a sample of a top episode's turns per role and
//!   a request for a JSON object of behavioral patterns.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::agent::policy::Exemplar;
use crate::agent::AgentRole;
use crate::behavior::SuccessDimension;
use crate::trajectory::Turn;

/// Actions from earlier turns are clipped to this many characters in history.
const HISTORY_ACTION_CHARS: usize = 800;

/// Inputs for [`agent_action_prompt`].
#[derive(Debug, Clone, Copy)]
pub struct ActionPromptInput<'a> {
    pub role: AgentRole,
    pub task: &'a str,
    pub observation: &'a str,
    pub history: &'a [Turn],
    pub behaviors: &'a BTreeMap<SuccessDimension, Vec<String>>,
    pub exemplars: &'a [Exemplar],
}

// ---------------------------------------------------------------------------
// Agent action prompt
// ---------------------------------------------------------------------------

/// Build the prompt an agent sends for its next turn.
///
/// The model is asked to reason first and finish with a single
/// `Action: <contribution>` line.
pub fn agent_action_prompt(input: &ActionPromptInput<'_>) -> String {
    let mut prompt = format!(
        "# Role: {title}\n{instructions}\n\n## Research Task\n{task}\n\n## Team History\n{history}\n",
        title = input.role.title(),
        instructions = input.role.instructions(),
        task = input.task,
        history = format_history(input.history),
    );

    let behavior_lines: Vec<String> = input
        .behaviors
        .iter()
        .filter(|(_, list)| !list.is_empty())
        .flat_map(|(dim, list)| list.iter().map(move |b| format!("- ({dim}) {b}")))
        .collect();
    if !behavior_lines.is_empty() {
        let _ = write!(
            prompt,
            "\n## Behaviors That Worked Before\n{}\n",
            behavior_lines.join("\n")
        );
    }

    if !input.exemplars.is_empty() {
        prompt.push_str("\n## Strong Past Contributions From Your Role\n");
        for (i, ex) in input.exemplars.iter().enumerate() {
            let _ = writeln!(prompt, "{}. {}", i + 1, truncate_chars(&ex.action, HISTORY_ACTION_CHARS));
        }
    }

    let _ = write!(
        prompt,
        r#"
## Current Observation
{observation}

## Instructions
1. Build on what your teammates have already contributed; refer to them by role where relevant.
2. Think step by step about what your role should add next.
3. End with exactly one line in the format:

   Action: <your contribution>"#,
        observation = input.observation,
    );

    prompt
}

/// Render prior turns for inclusion in a prompt.
pub fn format_history(turns: &[Turn]) -> String {
    if turns.is_empty() {
        return "(no contributions yet)".to_string();
    }
    turns
        .iter()
        .map(|t| {
            format!(
                "Turn {} [{}]: {}",
                t.turn_index,
                t.agent_role.title(),
                truncate_chars(&t.action, HISTORY_ACTION_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Behavior extraction prompt
// ---------------------------------------------------------------------------

/// Build the prompt asking for behavioral patterns from one top episode.
///
/// `sampled` holds already-truncated actions per role.
pub fn behavior_extraction_prompt(
    episode_id: &str,
    total_reward: f64,
    sampled: &BTreeMap<AgentRole, Vec<String>>,
) -> String {
    let mut prompt = format!(
        "You are analyzing a successful multi-agent research lab episode to extract behavioral patterns.\n\n\
         Episode {episode_id} (reward: {total_reward:.2}). Sampled contributions by role:\n"
    );
    for (role, actions) in sampled {
        for action in actions {
            let _ = write!(prompt, "\n[{role}]: {action}\n");
        }
    }

    let roles: Vec<&str> = sampled.keys().map(AgentRole::as_str).collect();
    let example_role = roles.first().copied().unwrap_or("literature_synthesizer");
    let _ = write!(
        prompt,
        r#"
Your task: identify what made this episode successful. For each role above ({roles}), extract 1-3 specific, reusable behavioral patterns per success dimension.

Return your analysis as a JSON object with this exact structure:
{{
  "{example_role}": {{
    "collaboration": ["pattern 1", "pattern 2"],
    "scientific_rigor": ["pattern 1"],
    "novelty": ["pattern 1"]
  }}
}}

Use the role names exactly as written. Return ONLY the JSON object, no other text."#,
        roles = roles.join(", "),
    );
    prompt
}

/// Clip `text` to at most `max_chars` characters, appending `...` when cut.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}
