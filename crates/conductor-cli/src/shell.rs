use async_trait::async_trait;
use conductor_scheduler::{BackgroundJob, JobResult, TaskContext};
use tracing::info;

const MAX_STDOUT: usize = 50_000;
const MAX_STDERR: usize = 10_000;

/// Runs one external command as a background job.
///
/// The child is killed if the task is cancelled or times out.
pub struct ShellJob {
    program: String,
    args: Vec<String>,
}

impl ShellJob {
    /// A command line interpreted by `sh -c`.
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), command.into()],
        }
    }

    /// A program and its arguments, passed to the OS as-is with no shell
    /// word splitting.
    pub fn from_argv(program: impl Into<String>, args: impl IntoIterator<Item = String>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
        }
    }

    fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[async_trait]
impl BackgroundJob for ShellJob {
    async fn execute(&self, ctx: TaskContext) -> JobResult {
        info!(task_id = %ctx.task_id(), command = %self.display(), "Executing shell command");
        ctx.report_progress(0.0, "spawning");
        let child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            output = child => output?,
            _ = ctx.cancelled() => return Err("command cancelled".into()),
        };
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let exit_code = output.status.code().unwrap_or(-1);

        if !output.status.success() {
            return Err(format!(
                "command exited with code {exit_code}: {}",
                truncate_output(stderr.trim(), MAX_STDERR)
            )
            .into());
        }
        Ok(serde_json::json!({
            "exit_code": exit_code,
            "stdout": truncate_output(&stdout, MAX_STDOUT),
            "stderr": truncate_output(&stderr, MAX_STDERR),
        }))
    }
}

fn truncate_output(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated, {} total bytes]", &s[..end], s.len())
}
