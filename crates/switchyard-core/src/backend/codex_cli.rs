// ABOUTME: Codex CLI command template - codex exec --json
// ABOUTME: Replies arrive as item.completed agent_message records

use super::CommandTemplate;

/// Codex uses `codex exec --json` for non-interactive JSONL output.
/// Sandboxing is left to codex itself via `--sandbox`; `-C` points it at the
/// request workspace and the message is always the last positional argument.
pub(super) fn default_template() -> CommandTemplate {
    CommandTemplate::new(
        "codex",
        &[
            "exec",
            "--json",
            "--skip-git-repo-check",
            "--sandbox",
            "workspace-write",
            "-C",
            "{workspace}",
            "{prompt}",
        ],
    )
}
