// ABOUTME: Claude CLI command template - claude --print with stream-json output
// ABOUTME: Partial messages make text arrive as stream_event deltas the line parser picks up

use super::CommandTemplate;

/// `claude --print --output-format stream-json --verbose --include-partial-messages
/// --dangerously-skip-permissions <prompt>`
///
/// `--verbose` is required by the CLI for stream-json in print mode.
/// `--include-partial-messages` emits `stream_event` records carrying
/// `content_block_delta` text as it is generated; the complete `assistant` and
/// `result` records that follow carry no top-level content field, so the text
/// is not delivered twice. The prompt is the last positional argument.
pub(super) fn default_template() -> CommandTemplate {
    CommandTemplate::new(
        "claude",
        &[
            "--print",
            "--output-format",
            "stream-json",
            "--verbose",
            "--include-partial-messages",
            "--dangerously-skip-permissions",
            "{prompt}",
        ],
    )
}
