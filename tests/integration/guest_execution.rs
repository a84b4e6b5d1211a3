//! Integration tests for in-guest command execution through the client

use async_trait::async_trait;
use parking_lot::Mutex;
use purser::backend::memory::{MemoryBackend, ProcessScript};
use purser::backend::GuestCredentials;
use purser::error::GuestError;
use purser::guest::{FetchedOutput, FileFetcher, GuestCommand, GuestInterface};
use std::collections::HashMap;
use std::sync::Arc;

use crate::integration::test_utils::{client_world, VM_A};

/// Serves guest output files from memory, keyed by the URL the backend
/// hands out for them.
struct ServedFiles {
    files: Mutex<HashMap<String, String>>,
}

impl ServedFiles {
    fn new() -> Arc<Self> {
        Arc::new(ServedFiles {
            files: Mutex::new(HashMap::new()),
        })
    }

    fn serve(&self, path: &str, body: &str) {
        self.files
            .lock()
            .insert(MemoryBackend::output_url(path), body.to_string());
    }
}

#[async_trait]
impl FileFetcher for ServedFiles {
    async fn fetch(&self, url: &str) -> Result<FetchedOutput, GuestError> {
        match self.files.lock().get(url) {
            Some(body) => Ok(FetchedOutput {
                status: 200,
                body: body.clone(),
            }),
            None => Ok(FetchedOutput {
                status: 404,
                body: String::new(),
            }),
        }
    }
}

async fn guest_world() -> (Arc<MemoryBackend>, GuestInterface, Arc<ServedFiles>) {
    let (backend, client) = client_world();
    backend.add_vm("web-01", VM_A);
    let fetcher = ServedFiles::new();
    let interface = client
        .guest_interface("web-01", GuestCredentials::new("admin", "hunter2"))
        .await
        .unwrap()
        .with_fetcher(fetcher.clone());
    (backend, interface, fetcher)
}

#[tokio::test]
async fn test_accepted_output_rescues_a_nonzero_exit() {
    let (backend, interface, fetcher) = guest_world().await;
    backend.script_process(ProcessScript {
        polls_until_exit: 1,
        exit_code: 5,
    });
    fetcher.serve("/tmp/patch.log", "PATCH ALREADY APPLIED");

    let command = GuestCommand::new("/usr/bin/patch-runner")
        .with_arguments("--apply kb-2042")
        .with_output_file("/tmp/patch.log")
        .with_success_outputs(vec!["ALREADY APPLIED".to_string()]);

    let pid = interface.run(&command).await.unwrap();
    assert!(pid > 1000);

    let started = backend.started_programs();
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].arguments, "--apply kb-2042 > /tmp/patch.log");
}

#[tokio::test]
async fn test_unmatched_output_fails_with_the_text() {
    let (backend, interface, fetcher) = guest_world().await;
    backend.script_process(ProcessScript {
        polls_until_exit: 0,
        exit_code: 3,
    });
    fetcher.serve("/tmp/patch.log", "ERROR CODE 7");

    let command = GuestCommand::new("/usr/bin/patch-runner")
        .with_output_file("/tmp/patch.log")
        .with_success_outputs(vec!["APPLIED".to_string()]);

    let err = interface.run(&command).await.unwrap_err();
    match err {
        GuestError::UnexpectedOutput(text) => assert_eq!(text, "ERROR CODE 7"),
        other => panic!("expected UnexpectedOutput, got {:?}", other),
    }
}

#[tokio::test]
async fn test_line_endings_are_normalized_before_judging() {
    let (backend, interface, fetcher) = guest_world().await;
    backend.script_process(ProcessScript {
        polls_until_exit: 0,
        exit_code: 1,
    });
    fetcher.serve("/tmp/agent.log", "AGENT INSTALLED\r\n");

    let command = GuestCommand::new("/opt/agent/install.sh")
        .with_output_file("/tmp/agent.log")
        .with_success_outputs(vec!["AGENT INSTALLED".to_string()]);

    interface.run(&command).await.unwrap();
}

#[tokio::test]
async fn test_start_returns_without_following_the_process() {
    let (backend, interface, _fetcher) = guest_world().await;

    let command = GuestCommand::new("/usr/bin/backup")
        .with_arguments("--full")
        .with_output_file("/var/log/backup.log");
    let pid = interface.start(&command).await.unwrap();
    assert!(pid > 1000);

    let started = backend.started_programs();
    assert_eq!(started[0].program_path, "/usr/bin/backup");
    assert_eq!(started[0].arguments, "--full > /var/log/backup.log");
}

#[tokio::test]
async fn test_interface_resolution_goes_through_the_cache() {
    let (backend, client) = client_world();
    backend.add_vm("web-01", VM_A);

    let first = client
        .guest_interface("web-01", GuestCredentials::new("admin", "hunter2"))
        .await
        .unwrap();
    assert_eq!(first.vm().name(), "web-01");
    assert_eq!(backend.scan_calls(), 1);

    // A second interface for the same VM costs no backend traffic.
    client
        .guest_interface("web-01", GuestCredentials::new("admin", "hunter2"))
        .await
        .unwrap();
    assert_eq!(backend.scan_calls(), 1);
    assert_eq!(backend.fetch_calls(), 0);
}
