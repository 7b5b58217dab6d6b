use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::logs::JobLog;
use crate::types_jobs::ExportFormat;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("failed to start converter {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("converter exited with {0}")]
    Exit(std::process::ExitStatus),

    #[error("converter produced no output at {}", .0.display())]
    MissingOutput(PathBuf),

    #[error("conversion failed: {0}")]
    Other(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct ConvertRequest<'a> {
    /// Image to convert, as pushed by the source build.
    pub image_reference: &'a str,
    pub format: ExportFormat,
    /// Empty scratch directory owned by this conversion.
    pub output_dir: &'a Path,
}

/// Turns a pushed image into a disk artifact. Dropping the future must stop
/// the conversion.
#[async_trait]
pub trait ImageConverter: Send + Sync {
    /// Returns the path of the produced artifact inside `output_dir`.
    async fn convert(&self, req: ConvertRequest<'_>, log: Arc<JobLog>) -> Result<PathBuf, ConvertError>;
}

/// Runs an external bootc-image-builder style program:
/// `<program> [args..] --type <type> --output <dir> <image>`.
pub struct CommandConverter {
    program: String,
    args: Vec<String>,
}

impl CommandConverter {
    pub fn new(program: impl Into<String>) -> Self {
        Self { program: program.into(), args: Vec::new() }
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.args.extend(args);
        self
    }
}

fn pipe_lines<R>(reader: R, log: Arc<JobLog>, prefix: &'static str) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.append(format!("{prefix}{line}"));
        }
    })
}

#[async_trait]
impl ImageConverter for CommandConverter {
    async fn convert(&self, req: ConvertRequest<'_>, log: Arc<JobLog>) -> Result<PathBuf, ConvertError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--type")
            .arg(req.format.converter_type())
            .arg("--output")
            .arg(req.output_dir)
            .arg(req.image_reference)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        info!(program = %self.program, image = %req.image_reference, format = req.format.as_str(), "converter: starting");
        let mut child = cmd.spawn().map_err(|source| ConvertError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        let mut pipes = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pipes.push(pipe_lines(stdout, log.clone(), ""));
        }
        if let Some(stderr) = child.stderr.take() {
            pipes.push(pipe_lines(stderr, log.clone(), "stderr: "));
        }

        let status = child.wait().await?;
        for p in pipes {
            let _ = p.await;
        }
        if !status.success() {
            warn!(program = %self.program, %status, "converter: failed");
            return Err(ConvertError::Exit(status));
        }

        let output = req.output_dir.join(req.format.output_path());
        if !tokio::fs::try_exists(&output).await.unwrap_or(false) {
            return Err(ConvertError::MissingOutput(output));
        }
        Ok(output)
    }
}
