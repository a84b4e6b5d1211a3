//! In-guest command execution.
//!
//! The guest agent reports an exit code but not output, and a non-zero
//! exit does not always mean failure for the tooling that runs inside
//! these guests. Commands therefore redirect their output to a file in
//! the guest, and on non-zero exit the file is fetched over HTTP and
//! matched against the command's accepted outputs.

use crate::backend::{GuestBackend, GuestCredentials};
use crate::error::{GuestError, InventoryError};
use crate::handle::ManagedObjectHandle;
use crate::session::{Session, WaitPolicy};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// One command to run inside a guest.
#[derive(Debug, Clone)]
pub struct GuestCommand {
    pub program_path: String,
    pub arguments: String,
    /// Human label used in logs and errors instead of the raw invocation.
    pub description: Option<String>,
    /// In-guest file the command's output is redirected to; required for
    /// judging non-zero exits.
    pub output_file: Option<String>,
    /// Outputs that count as success despite a non-zero exit. An empty
    /// string accepts any output, but empty output stays ambiguous.
    pub success_outputs: Vec<String>,
    pub timeout: Duration,
}

impl GuestCommand {
    pub fn new(program_path: impl Into<String>) -> Self {
        GuestCommand {
            program_path: program_path.into(),
            arguments: String::new(),
            description: None,
            output_file: None,
            success_outputs: Vec::new(),
            timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_arguments(mut self, arguments: impl Into<String>) -> Self {
        self.arguments = arguments.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_output_file(mut self, path: impl Into<String>) -> Self {
        self.output_file = Some(path.into());
        self
    }

    pub fn with_success_outputs(mut self, outputs: Vec<String>) -> Self {
        self.success_outputs = outputs;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl fmt::Display for GuestCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.description {
            Some(description) => write!(f, "{}", description),
            None if self.arguments.is_empty() => write!(f, "{}", self.program_path),
            None => write!(f, "{} {}", self.program_path, self.arguments),
        }
    }
}

/// An output file fetched from the guest.
#[derive(Debug, Clone)]
pub struct FetchedOutput {
    pub status: u16,
    pub body: String,
}

/// Transport seam for fetching guest files, so tests can serve them from
/// memory.
#[async_trait]
pub trait FileFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedOutput, GuestError>;
}

/// The production fetcher: plain HTTP GET through reqwest, honoring the
/// session's TLS verification setting.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(verify_tls: bool) -> Result<Self, GuestError> {
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!verify_tls)
            .build()
            .map_err(|err| GuestError::Transport(err.to_string()))?;
        Ok(HttpFetcher { client })
    }
}

#[async_trait]
impl FileFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedOutput, GuestError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| GuestError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|err| GuestError::Transport(err.to_string()))?;
        Ok(FetchedOutput { status, body })
    }
}

/// Command runner bound to one resolved VM and one set of guest
/// credentials.
pub struct GuestInterface {
    vm: ManagedObjectHandle,
    credentials: GuestCredentials,
    backend: Arc<dyn GuestBackend>,
    fetcher: Arc<dyn FileFetcher>,
    waits: WaitPolicy,
}

impl GuestInterface {
    pub fn new(
        session: &Session,
        vm: ManagedObjectHandle,
        credentials: GuestCredentials,
    ) -> Result<Self, InventoryError> {
        let fetcher = HttpFetcher::new(session.settings().verify_tls)?;
        Ok(GuestInterface {
            vm,
            credentials,
            backend: session.guest().clone(),
            fetcher: Arc::new(fetcher),
            waits: session.waits().clone(),
        })
    }

    /// Swap the output-file transport.
    pub fn with_fetcher(mut self, fetcher: Arc<dyn FileFetcher>) -> Self {
        self.fetcher = fetcher;
        self
    }

    pub fn vm(&self) -> &ManagedObjectHandle {
        &self.vm
    }

    /// Start the program without waiting for it. Output redirection is
    /// appended when the command has an output file.
    pub async fn start(&self, command: &GuestCommand) -> Result<i64, GuestError> {
        let invocation = match &command.output_file {
            Some(path) => format!("{} > {}", command.arguments, path),
            None => command.arguments.clone(),
        };
        debug!(vm = self.vm.name(), command = %command, "Starting guest program");
        let pid = self
            .backend
            .start_program(
                self.vm.moref(),
                &self.credentials,
                &command.program_path,
                &invocation,
            )
            .await?;
        if pid == 0 {
            return Err(GuestError::Failed(format!("{} did not start", command)));
        }
        Ok(pid)
    }

    /// Start the program and follow it to a verdict: exit 0 succeeds, no
    /// exit within the command timeout fails, and a non-zero exit is
    /// judged by the output file.
    pub async fn run(&self, command: &GuestCommand) -> Result<i64, GuestError> {
        let pid = self.start(command).await?;
        let deadline = Instant::now() + command.timeout;
        loop {
            let processes = self
                .backend
                .list_processes(self.vm.moref(), &self.credentials, &[pid])
                .await?;
            let info = match processes.into_iter().find(|p| p.pid == pid) {
                Some(info) => info,
                None => {
                    return Err(GuestError::Failed(format!(
                        "no process information for {} (pid {})",
                        command, pid
                    )))
                }
            };
            match info.exit_code {
                Some(0) => {
                    debug!(vm = self.vm.name(), command = %command, pid, "Guest command succeeded");
                    return Ok(pid);
                }
                Some(code) => {
                    debug!(
                        vm = self.vm.name(),
                        command = %command,
                        pid,
                        exit_code = code,
                        "Guest command exited non-zero; judging by output"
                    );
                    return self.judge_output(command, pid, code).await;
                }
                None => {
                    if Instant::now() >= deadline {
                        return Err(GuestError::Timeout(format!(
                            "{} still running after {:?}",
                            command, command.timeout
                        )));
                    }
                    tokio::time::sleep(self.waits.guest_poll()).await;
                }
            }
        }
    }

    async fn judge_output(
        &self,
        command: &GuestCommand,
        pid: i64,
        exit_code: i64,
    ) -> Result<i64, GuestError> {
        let output_file = match &command.output_file {
            Some(path) => path,
            None => {
                return Err(GuestError::UnknownResult(format!(
                    "{} exited {} and no output file is configured",
                    command, exit_code
                )))
            }
        };
        let url = self
            .backend
            .output_file_url(self.vm.moref(), &self.credentials, output_file)
            .await?;
        let fetched = self.fetcher.fetch(&url).await?;
        if fetched.status != 200 {
            return Err(GuestError::Transport(format!(
                "fetching {} returned HTTP {}",
                output_file, fetched.status
            )));
        }
        let contents = fetched
            .body
            .replace('\r', "")
            .replace('\n', "")
            .trim()
            .to_string();
        if contents.is_empty() && command.success_outputs.iter().any(String::is_empty) {
            return Err(GuestError::AmbiguousResult(format!(
                "{} produced no output; a silent failure cannot be ruled out",
                command
            )));
        }
        for accepted in &command.success_outputs {
            // An empty accepted output matches anything, per the protocol.
            if contents.contains(accepted.as_str()) {
                debug!(vm = self.vm.name(), command = %command, pid, "Output accepted");
                return Ok(pid);
            }
        }
        Err(GuestError::UnexpectedOutput(contents))
    }
}
