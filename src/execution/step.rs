//! Shell Command Executor
//!
//! Runs a step as a bash script in the pipeline's run directory:
//! - Placeholder substitution from inputs, parameters and `{workdir}`
//! - Script generation
//! - Output directory creation
//! - Cooperative cancellation: the script's process group gets SIGTERM and
//!   is only killed if it is still alive after the grace period
//!
//! Step parameters:
//!
//! ```yaml
//! parameters:
//!   command: "bwa mem -t {threads} {genome} {reads} > {workdir}/aln.sam"
//!   threads: 8
//!   outputs:
//!     sam_directory: "{workdir}"
//!     sam_file: aln.sam
//! ```
//!
//! Each `outputs` entry becomes a result field. Relative paths are taken
//! relative to the run directory.

use std::error::Error;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, error, warn};

use crate::pipeline::{Value, ValueMap};

use super::executor::{StepContext, StepExecutor, StepFailure, StepOutput};

/// Parameter holding the command template.
pub const COMMAND_PARAM: &str = "command";

/// Parameter mapping result fields to output path templates.
pub const OUTPUTS_PARAM: &str = "outputs";

/// How often a running child is checked for exit and cancellation.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How often a signalled child is checked for exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Executes steps as bash scripts.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    script_dir: PathBuf,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self {
            script_dir: std::env::temp_dir().join("circrunner_scripts"),
        }
    }

    /// Writes generated scripts to `dir` instead of the system temp dir.
    pub fn with_script_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            script_dir: dir.into(),
        }
    }
}

impl Default for CommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl StepExecutor for CommandExecutor {
    fn execute(
        &self,
        parameters: &ValueMap,
        inputs: &ValueMap,
        ctx: &StepContext,
    ) -> Result<StepOutput, StepFailure> {
        let template = parameters
            .get(COMMAND_PARAM)
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StepFailure::new(format!(
                    "Step '{}' has no '{}' parameter",
                    ctx.step_name, COMMAND_PARAM
                ))
            })?;

        let command_text = substitute(template, parameters, inputs, &ctx.working_dir);
        let outputs = resolve_outputs(parameters, inputs, &ctx.working_dir)?;

        ensure_output_directories(&outputs)
            .map_err(|e| StepFailure::new(format!("Failed to create output directories: {}", e)))?;

        let script_path = create_execution_script(&self.script_dir, &ctx.step_id.to_string(), &command_text)
            .map_err(|e| StepFailure::new(format!("Failed to write step script: {}", e)))?;

        let outcome = run_script(&script_path, ctx);

        if let Err(e) = fs::remove_file(&script_path) {
            warn!("Failed to clean up script {}: {}", script_path.display(), e);
        }

        let run = outcome.map_err(|e| StepFailure::new(format!("Failed to run step: {}", e)))?;
        let log_text = run.log_text();

        if run.cancelled {
            return Err(StepFailure::aborted(format!(
                "Step '{}' was cancelled",
                ctx.step_name
            ))
            .with_log(log_text));
        }

        if run.status.success() {
            debug!("Step '{}' completed successfully", ctx.step_name);
            Ok(StepOutput::new(outputs).with_log(log_text))
        } else {
            error!(
                "Step '{}' failed with exit code: {:?}",
                ctx.step_name,
                run.status.code()
            );
            let message = match run.status.code() {
                Some(code) => format!("Step '{}' failed with exit code {}", ctx.step_name, code),
                None => format!("Step '{}' was terminated by a signal", ctx.step_name),
            };
            Err(StepFailure::new(message).with_log(log_text))
        }
    }
}

/// Replaces `{name}` placeholders: inputs first, then scalar parameters,
/// then `{workdir}`. Unknown placeholders are left untouched.
fn substitute(template: &str, parameters: &ValueMap, inputs: &ValueMap, working_dir: &Path) -> String {
    let mut text = template.to_string();

    for (key, value) in inputs {
        text = text.replace(&format!("{{{}}}", key), &value.to_template_string());
    }

    for (key, value) in parameters {
        if key == COMMAND_PARAM || key == OUTPUTS_PARAM || value.as_map().is_some() {
            continue;
        }
        text = text.replace(&format!("{{{}}}", key), &value.to_template_string());
    }

    text.replace("{workdir}", &working_dir.display().to_string())
}

/// Expands the `outputs` parameter into result fields with absolute paths.
fn resolve_outputs(
    parameters: &ValueMap,
    inputs: &ValueMap,
    working_dir: &Path,
) -> Result<ValueMap, StepFailure> {
    let Some(outputs) = parameters.get(OUTPUTS_PARAM) else {
        return Ok(ValueMap::new());
    };
    let outputs = outputs.as_map().ok_or_else(|| {
        StepFailure::new(format!("'{}' must map result fields to paths", OUTPUTS_PARAM))
    })?;

    let mut results = ValueMap::new();
    for (field, template) in outputs {
        let template = template.as_str().ok_or_else(|| {
            StepFailure::new(format!("Output '{}' must be a path string", field))
        })?;
        let path = PathBuf::from(substitute(template, parameters, inputs, working_dir));
        let path = if path.is_absolute() {
            path
        } else {
            working_dir.join(path)
        };
        results.insert(field.clone(), Value::from(path.display().to_string()));
    }
    Ok(results)
}

/// Creates parent directories for output files.
fn ensure_output_directories(outputs: &ValueMap) -> Result<(), Box<dyn Error + Send + Sync>> {
    for path in outputs.values().filter_map(Value::as_str) {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("Created directory: {}", parent.display());
            }
        }
    }
    Ok(())
}

/// Creates a bash script for step execution.
fn create_execution_script(
    script_dir: &Path,
    step_id: &str,
    command_text: &str,
) -> Result<PathBuf, Box<dyn Error + Send + Sync>> {
    fs::create_dir_all(script_dir)?;

    let script_path = script_dir.join(format!("step_{}.sh", step_id));
    let mut file = File::create(&script_path)?;

    writeln!(file, "#!/bin/bash")?;
    writeln!(file, "set -e")?;
    writeln!(file, "{}", command_text)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&script_path, fs::Permissions::from_mode(0o755))?;
    }

    Ok(script_path)
}

/// Exit status and captured output of a finished script.
struct ScriptRun {
    status: ExitStatus,
    stdout: String,
    stderr: String,
    cancelled: bool,
}

impl ScriptRun {
    fn log_text(&self) -> String {
        let mut sections = Vec::new();
        if !self.stdout.trim().is_empty() {
            sections.push(format!("stdout:\n{}", self.stdout.trim_end()));
        }
        if !self.stderr.trim().is_empty() {
            sections.push(format!("stderr:\n{}", self.stderr.trim_end()));
        }
        sections.join("\n")
    }
}

/// Runs the script with bash in the step's working directory, polling for
/// exit and cancellation.
fn run_script(script_path: &Path, ctx: &StepContext) -> Result<ScriptRun, Box<dyn Error + Send + Sync>> {
    let mut cmd = Command::new("bash");
    cmd.arg(script_path)
        .current_dir(&ctx.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group, so cancellation also reaches the tools the script
    // started.
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("Executing in directory: {}", ctx.working_dir.display());
    let mut child = cmd.spawn()?;

    let stdout = capture(child.stdout.take());
    let stderr = capture(child.stderr.take());

    let mut cancelled = false;
    let status = loop {
        if let Some(status) = child.try_wait()? {
            break status;
        }
        if ctx.cancel.is_cancelled() {
            warn!("Step '{}' cancelled; stopping child process", ctx.step_name);
            cancelled = true;
            break stop(&mut child, ctx.cancel_grace)?;
        }
        thread::sleep(POLL_INTERVAL);
    };

    Ok(ScriptRun {
        status,
        stdout: join_capture(stdout),
        stderr: join_capture(stderr),
        cancelled,
    })
}

/// Asks the script's process group to terminate, giving it `grace` to finish
/// writes in progress before it is killed.
fn stop(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    #[cfg(unix)]
    {
        let group = format!("-{}", child.id());
        if signal_group("-TERM", &group) {
            let deadline = Instant::now() + grace;
            loop {
                if let Some(status) = child.try_wait()? {
                    return Ok(status);
                }
                if Instant::now() >= deadline {
                    break;
                }
                thread::sleep(STOP_POLL_INTERVAL);
            }
            warn!(
                "Process group {} still running {:?} after SIGTERM; killing it",
                group, grace
            );
            if signal_group("-KILL", &group) {
                return child.wait();
            }
        }
    }
    #[cfg(not(unix))]
    let _ = grace;

    // The child may exit on its own between the poll and the kill.
    if let Err(e) = child.kill() {
        debug!("Kill failed (process may have exited): {}", e);
    }
    child.wait()
}

#[cfg(unix)]
fn signal_group(signal: &str, group: &str) -> bool {
    match Command::new("kill").args([signal, "--", group]).status() {
        Ok(status) if status.success() => true,
        Ok(_) | Err(_) => {
            debug!("Could not send {} to process group {}", signal, group);
            false
        }
    }
}

/// Drains a child pipe on its own thread so a chatty process cannot fill
/// the pipe buffer and stall.
fn capture<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut bytes = Vec::new();
            if let Err(e) = pipe.read_to_end(&mut bytes) {
                warn!("Failed to read step output: {}", e);
            }
            String::from_utf8_lossy(&bytes).into_owned()
        })
    })
}

fn join_capture(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
