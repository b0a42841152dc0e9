use async_trait::async_trait;
use error_stack::Report;
use error_stack::ResultExt;
use tokio::process::Command;
use tracing::debug;

use super::DriverError;

/// Runs commands on behalf of the driver layer. Output is stdout and stderr
/// concatenated.
#[async_trait]
pub trait Shell: Send + Sync + 'static {
    /// `bash -c` inside the host mount namespace.
    async fn host(&self, script: &str) -> Result<String, Report<DriverError>>;

    /// `bash -c` inside the agent container.
    async fn container(&self, script: &str) -> Result<String, Report<DriverError>>;

    async fn command(&self, program: &str, args: &[&str]) -> Result<String, Report<DriverError>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemShell;

async fn combined_output(program: &str, args: &[&str]) -> Result<String, Report<DriverError>> {
    let command_line = || format!("{program} {}", args.join(" "));
    debug!(command = %command_line(), "exec");
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .change_context_lazy(|| DriverError::Exec {
            command: command_line(),
        })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if !output.status.success() {
        return Err(Report::new(DriverError::Exec {
            command: command_line(),
        })
        .attach_printable(format!("status: {}", output.status))
        .attach_printable(format!("output: {text}")));
    }
    Ok(text)
}

#[async_trait]
impl Shell for SystemShell {
    async fn host(&self, script: &str) -> Result<String, Report<DriverError>> {
        combined_output("nsenter", &["-t", "1", "-m", "--", "bash", "-c", script]).await
    }

    async fn container(&self, script: &str) -> Result<String, Report<DriverError>> {
        combined_output("bash", &["-c", script]).await
    }

    async fn command(&self, program: &str, args: &[&str]) -> Result<String, Report<DriverError>> {
        combined_output(program, args).await
    }
}
