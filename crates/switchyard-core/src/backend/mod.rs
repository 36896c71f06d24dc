// ABOUTME: Backend trait defining how switchyard invokes a command-line AI tool
// ABOUTME: CliBackend renders a command template, runs it, and parses stdout into fragments

mod claude_cli;
mod codex_cli;

use crate::error::BackendInvocationError;
use crate::parser::parse_line;
use crate::runner::{ProcessStreamRunner, RunEvent, RunSpec};
use crate::types::{BackendInvokeRequest, BackendName, StreamSource};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One item of a backend attempt's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Text(String),
    /// The attempt completed successfully. Always the last item.
    Finished,
}

impl Fragment {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }
}

/// Output of one backend attempt. Ends with `Fragment::Finished` on success
/// or a single error on failure.
pub type FragmentStream = BoxStream<'static, Result<Fragment, BackendInvocationError>>;

/// A backend is an AI command-line tool that turns a prompt into streamed text.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Which backend this adapter drives
    fn name(&self) -> BackendName;

    /// Start one attempt for `request` and stream its text fragments.
    ///
    /// Spawn failures, timeouts, overflow and non-zero exits all arrive as the
    /// final `Err` item. Cancellation ends the stream with neither `Err` nor
    /// `Fragment::Finished`.
    async fn invoke(&self, request: &BackendInvokeRequest) -> FragmentStream;
}

/// Command line for a backend. Arguments may contain `{prompt}`,
/// `{workspace}` and `{session_id}`, substituted per request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub binary: String,
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl CommandTemplate {
    pub fn new(binary: impl Into<String>, args: &[&str]) -> Self {
        Self {
            binary: binary.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    /// The stock command line for each backend.
    pub fn default_for(name: BackendName) -> Self {
        match name {
            BackendName::Claude => claude_cli::default_template(),
            BackendName::Codex => codex_cli::default_template(),
        }
    }

    pub fn render(&self, request: &BackendInvokeRequest) -> RunSpec {
        let workspace = request.workspace_dir.display().to_string();
        let args = self
            .args
            .iter()
            .map(|arg| {
                // Prompt last so prompt text is never itself rewritten
                arg.replace("{workspace}", &workspace)
                    .replace("{session_id}", &request.session_id)
                    .replace("{prompt}", &request.prompt)
            })
            .collect();

        RunSpec {
            program: self.binary.clone(),
            args,
            working_dir: request.workspace_dir.clone(),
            env: self
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            timeout: request.timeout,
            max_output_bytes: request.max_output_bytes,
            cancellation: request.cancellation.clone(),
        }
    }
}

/// Drives a backend through its command template. Stdout lines go through the
/// line parser; stderr is kept for diagnostics only.
#[derive(Debug, Clone)]
pub struct CliBackend {
    name: BackendName,
    template: CommandTemplate,
}

impl CliBackend {
    pub fn new(name: BackendName, template: CommandTemplate) -> Self {
        Self { name, template }
    }

    pub fn claude(template: CommandTemplate) -> Self {
        Self::new(BackendName::Claude, template)
    }

    pub fn codex(template: CommandTemplate) -> Self {
        Self::new(BackendName::Codex, template)
    }

    pub fn template(&self) -> &CommandTemplate {
        &self.template
    }
}

#[async_trait]
impl Backend for CliBackend {
    fn name(&self) -> BackendName {
        self.name
    }

    async fn invoke(&self, request: &BackendInvokeRequest) -> FragmentStream {
        let name = self.name;
        let spec = self.template.render(request);

        tracing::debug!(backend = %name, session_id = %request.session_id, "Invoking backend");

        let fragments = ProcessStreamRunner::run(spec).flat_map(move |item| {
            let items: Vec<Result<Fragment, BackendInvocationError>> = match item {
                Ok(RunEvent::Line(line)) if line.source == StreamSource::Stdout => {
                    parse_line(&line.line)
                        .into_iter()
                        .map(|text| Ok(Fragment::Text(text)))
                        .collect()
                }
                Ok(RunEvent::Line(_)) => Vec::new(),
                Ok(RunEvent::Exited) => vec![Ok(Fragment::Finished)],
                Err(e) => vec![Err(e.into_invocation_error(name))],
            };
            stream::iter(items)
        });

        Box::pin(fragments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use std::time::Duration;

    fn request() -> BackendInvokeRequest {
        BackendInvokeRequest::new("say {workspace}", "sess-1", "/tmp/work")
            .with_timeout(Duration::from_secs(7))
            .with_max_output_bytes(1234)
    }

    #[test]
    fn render_substitutes_placeholders() {
        let mut template = CommandTemplate::new(
            "tool",
            &["--cwd", "{workspace}", "--session={session_id}", "{prompt}"],
        );
        template.env.insert("FOO".to_string(), "bar".to_string());

        let spec = template.render(&request());
        assert_eq!(spec.program, "tool");
        assert_eq!(
            spec.args,
            vec!["--cwd", "/tmp/work", "--session=sess-1", "say {workspace}"]
        );
        assert_eq!(spec.working_dir, std::path::PathBuf::from("/tmp/work"));
        assert_eq!(spec.env, vec![("FOO".to_string(), "bar".to_string())]);
        assert_eq!(spec.timeout, Duration::from_secs(7));
        assert_eq!(spec.max_output_bytes, 1234);
    }

    #[test]
    fn every_backend_has_a_default_template_ending_in_the_prompt() {
        for name in BackendName::ALL {
            let template = CommandTemplate::default_for(name);
            assert_eq!(template.binary, name.as_str());
            assert_eq!(template.args.last().map(String::as_str), Some("{prompt}"));
        }
    }

    #[cfg(unix)]
    fn scripted(script: &str) -> CliBackend {
        CliBackend::codex(CommandTemplate::new("sh", &["-c", script]))
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_is_parsed_and_stderr_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let backend = scripted(
            r#"echo '{"type":"thread.started","thread_id":"t"}'
echo '{"type":"delta","delta":"Hel"}'
echo 'noise' >&2
echo '{"type":"delta","delta":"lo"}'
echo plain"#,
        );
        let request = BackendInvokeRequest::new("hi", "s", dir.path());

        let items: Vec<_> = backend.invoke(&request).await.collect().await;
        let fragments: Vec<Fragment> = items.into_iter().map(|i| i.unwrap()).collect();
        assert_eq!(
            fragments,
            vec![
                Fragment::text("Hel"),
                Fragment::text("lo"),
                Fragment::text("plain\n"),
                Fragment::Finished,
            ]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_errors_are_attributed_to_the_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = scripted("echo oops >&2; exit 9");
        let request = BackendInvokeRequest::new("hi", "s", dir.path());

        let items: Vec<_> = backend.invoke(&request).await.collect().await;
        assert_eq!(items.len(), 1);
        let err = items[0].clone().unwrap_err();
        assert_eq!(err.backend, BackendName::Codex);
        assert_eq!(err.code, ErrorCode::ExitNonzero);
        assert!(err.transient);
        assert!(err.details.unwrap().contains("oops"));
    }
}
