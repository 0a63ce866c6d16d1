//! Turns raw backend progress logs into short status lines.

use std::sync::LazyLock;

use regex::Regex;

const MAX_STEP_CHARS: usize = 50;
const TRUNCATED_CHARS: usize = 47;
const EMPTY_STEP: &str = "Processing...";

static DECORATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"[\x{1F600}-\x{1F64F}\x{1F300}-\x{1F5FF}\x{1F680}-\x{1F6FF}\x{1F1E0}-\x{1F1FF}\x{2600}-\x{26FF}\x{2700}-\x{27BF}\x{FE0F}]",
    )
    .expect("decoration pattern is valid")
});

/// Well-known backend phrases and their friendlier equivalents. Every
/// fragment of an entry must appear in the line for it to match.
const PHRASES: &[(&[&str], &str)] = &[
    (&["Received analysis request"], "Processing your request..."),
    (&["Analyzing prompt to determine analysis type"], "Understanding your query..."),
    (&["Detected general analysis"], "Routing to analysis engine..."),
    (&["Routing", "Real AI Engine"], "Connecting to AI engine..."),
    (&["Starting Real AI Analysis"], "Initializing AI analysis..."),
    (&["Prompt Analysis", "complexity"], "Evaluating complexity..."),
    (&["Connecting to AI processing engine"], "Establishing AI connection..."),
    (&["AI analysis complete"], "Finalizing response..."),
];

/// Strip decorative symbols, map known phrases, otherwise pass the cleaned
/// text through truncated to the step budget.
pub fn shorten_log_line(raw: &str) -> String {
    let cleaned = DECORATION.replace_all(raw, "");
    let cleaned = cleaned.trim();

    if let Some((_, friendly)) = PHRASES
        .iter()
        .find(|(fragments, _)| fragments.iter().all(|f| cleaned.contains(f)))
    {
        return (*friendly).to_string();
    }

    if cleaned.is_empty() {
        return EMPTY_STEP.to_string();
    }
    if cleaned.chars().count() > MAX_STEP_CHARS {
        let head: String = cleaned.chars().take(TRUNCATED_CHARS).collect();
        return format!("{head}...");
    }
    cleaned.to_string()
}
