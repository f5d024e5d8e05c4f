use std::sync::LazyLock;

use regex::Regex;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a software engineer working autonomously on a \
user's request inside a dedicated development environment. Investigate the repository with the \
tools available, make the changes needed, verify them, and explain what you did. The user only \
sees your final answer and the messages you send with reportProgressToUser, so keep them \
informed on long tasks. Put internal deliberation inside <thinking></thinking> tags; it is \
removed before your answer is delivered.";

const PROGRESS_NUDGE: &str = "Long time has passed since you sent the last message. \
Please use reportProgressToUser tool to send a response asap.";

/// Wrap a text tool result. With `force_report`, the command section asks the
/// model to report progress to the user.
pub fn render_tool_result(result: &str, force_report: bool) -> String {
    let command = if force_report { PROGRESS_NUDGE } else { "" };
    format!("<result>\n{result}\n</result>\n<command>\n{command}\n</command>")
        .trim()
        .to_string()
}

/// Remove `<thinking>` spans from text meant for the user.
pub fn strip_thinking(text: &str) -> String {
    static THINKING: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?s)<thinking>.*?</thinking>").expect("thinking regex should compile")
    });
    THINKING.replace_all(text, "").trim().to_string()
}
