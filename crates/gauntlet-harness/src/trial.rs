//! Trial orchestration: endpoints, payload, fault scope, concurrent role
//! drivers, and output verification.

use std::time::Duration;

use bytes::Bytes;
use rand::Rng;
use rand::RngExt as _;
use tokio::task::JoinHandle;

use crate::capture::{self, CaptureSession};
use crate::error::HarnessError;
use crate::netem::FaultProfile;
use crate::ports::{Endpoint, PortAllocator};
use crate::process::{self, ProcessResult, Role};
use crate::subject::Subject;

/// Fixed wait between starting the server and the client, standing in for
/// the readiness handshake the CLI contract does not have.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

/// Parameters of a single trial. Read-only once launched.
#[derive(Debug, Clone)]
pub struct TrialSpec {
    pub iterations: u32,
    pub message_size: usize,
    pub timeout: Duration,
    pub fault: Option<FaultProfile>,
}

impl TrialSpec {
    pub fn new(iterations: u32, message_size: usize, timeout: Duration) -> Self {
        Self {
            iterations,
            message_size,
            timeout,
            fault: None,
        }
    }

    pub fn with_fault(mut self, fault: FaultProfile) -> Self {
        self.fault = Some(fault);
        self
    }
}

/// Outcome of a verified trial.
#[derive(Debug)]
pub struct TrialReport {
    pub payload: Bytes,
    pub server: Endpoint,
    pub client: Endpoint,
    pub server_stdout: Vec<u8>,
    pub client_stdout: Vec<u8>,
}

/// Outcome of a confidentiality-verification run.
#[derive(Debug)]
pub struct CaptureReport {
    pub trial: TrialReport,
    pub datagrams_scanned: usize,
}

/// Drives trials against one subject, with its own port registry.
///
/// Trials are one-shot: any process failure or verification mismatch fails
/// the whole trial and nothing is retried. Fault-injected trials must not
/// run concurrently with each other — the loopback shaping rule is a single
/// host-global resource.
pub struct Harness {
    subject: Subject,
    ports: PortAllocator,
}

impl Harness {
    pub fn new(subject: Subject) -> Self {
        Self {
            subject,
            ports: PortAllocator::new(),
        }
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Run one client+server trial with a fresh pseudorandom payload.
    pub async fn run_trial(&self, spec: &TrialSpec) -> Result<TrialReport, HarnessError> {
        let payload = random_payload(spec.message_size);
        let (server, client) = self.allocate_endpoints()?;
        self.run_on_endpoints(spec, payload, server, client).await
    }

    /// Run one trial under a live capture and fail on any plaintext leak.
    ///
    /// The payload is ASCII letters so the leak check looks for a printable
    /// pattern, as a real credential or message body would be. `window`
    /// bounds the capture on its own clock, independent of the trial
    /// timeout; the capture is always stopped, even when the trial fails.
    pub async fn verify_confidentiality(
        &self,
        spec: &TrialSpec,
        window: Duration,
    ) -> Result<CaptureReport, HarnessError> {
        let payload = random_ascii_payload(spec.message_size);
        let (server, client) = self.allocate_endpoints()?;
        let artifact = std::env::temp_dir().join(format!(
            "gauntlet-{}-{}.pcap",
            std::process::id(),
            server.port
        ));
        let session = CaptureSession::start(artifact, (server.port, client.port), window).await?;

        let trial = self
            .run_on_endpoints(spec, payload.clone(), server, client)
            .await;
        let datagrams = session.finish().await;
        let trial = trial?;
        let datagrams = datagrams?;

        if datagrams.is_empty() {
            return Err(HarnessError::Capture(
                "capture window produced no datagrams".into(),
            ));
        }
        for datagram in &datagrams {
            if capture::contains_pattern(&datagram.payload, &payload) {
                return Err(HarnessError::Verification(format!(
                    "plaintext payload leaked in a datagram {} -> {}",
                    datagram.src_port, datagram.dst_port
                )));
            }
        }
        tracing::info!(
            datagrams = datagrams.len(),
            "no plaintext observed on the wire"
        );
        Ok(CaptureReport {
            trial,
            datagrams_scanned: datagrams.len(),
        })
    }

    fn allocate_endpoints(&self) -> Result<(Endpoint, Endpoint), HarnessError> {
        let (a, b) = self.ports.allocate_pair()?;
        Ok((Endpoint::loopback(a), Endpoint::loopback(b)))
    }

    async fn run_on_endpoints(
        &self,
        spec: &TrialSpec,
        payload: Bytes,
        server: Endpoint,
        client: Endpoint,
    ) -> Result<TrialReport, HarnessError> {
        debug_assert_ne!(server.port, client.port);

        // Guard scope is the whole trial body: dropping it reverts the
        // qdisc on every path out of this function.
        let _shaping = match &spec.fault {
            Some(profile) => Some(profile.apply()?),
            None => None,
        };

        tracing::info!(
            %server,
            %client,
            iterations = spec.iterations,
            message_size = spec.message_size,
            fault = spec.fault.is_some(),
            "starting trial"
        );

        let server_task = self.spawn_role(Role::Server, server, payload.clone(), client, spec);
        tokio::time::sleep(SETTLE_DELAY).await;
        let client_task = self.spawn_role(Role::Client, client, payload.clone(), server, spec);

        let (server_res, client_res) = tokio::join!(server_task, client_task);
        let results = [flatten(server_res)?, flatten(client_res)?];
        let [first, second] = results;
        let (server_result, client_result) = match (first.role, second.role) {
            (Role::Server, Role::Client) => (first, second),
            (Role::Client, Role::Server) => (second, first),
            _ => {
                return Err(HarnessError::Verification(
                    "trial produced duplicate role results".into(),
                ))
            }
        };

        verify_client_echo(&client_result.stdout, &payload)?;
        verify_server_count(&server_result.stdout, spec.message_size)?;

        tracing::info!(%server, %client, "trial verified");
        Ok(TrialReport {
            payload,
            server,
            client,
            server_stdout: server_result.stdout,
            client_stdout: client_result.stdout,
        })
    }

    fn spawn_role(
        &self,
        role: Role,
        local: Endpoint,
        payload: Bytes,
        remote: Endpoint,
        spec: &TrialSpec,
    ) -> JoinHandle<Result<ProcessResult, HarnessError>> {
        let subject = self.subject.clone();
        let iterations = spec.iterations;
        let timeout = spec.timeout;
        tokio::spawn(async move {
            process::run(&subject, role, local, payload, remote, iterations, timeout).await
        })
    }
}

fn flatten(
    res: Result<Result<ProcessResult, HarnessError>, tokio::task::JoinError>,
) -> Result<ProcessResult, HarnessError> {
    match res {
        Ok(inner) => inner,
        Err(e) => Err(HarnessError::Io(std::io::Error::other(e))),
    }
}

/// The client's final record must be the payload, byte for byte.
///
/// Records are newline-terminated and the payload may itself contain
/// newlines, so this checks the payload-sized window at the tail rather
/// than splitting the output on `\n`.
fn verify_client_echo(stdout: &[u8], payload: &[u8]) -> Result<(), HarnessError> {
    let want = payload.len() + 1;
    let ok = stdout.len() >= want
        && stdout.ends_with(b"\n")
        && &stdout[stdout.len() - want..stdout.len() - 1] == payload;
    if ok {
        Ok(())
    } else {
        Err(HarnessError::Verification(format!(
            "client echo mismatch: expected the {}-byte payload as the final record, got {} bytes of stdout",
            payload.len(),
            stdout.len()
        )))
    }
}

/// The server's final record must be the payload length in decimal.
fn verify_server_count(stdout: &[u8], message_size: usize) -> Result<(), HarnessError> {
    let text = String::from_utf8_lossy(stdout);
    let last = text.lines().last().map(str::trim);
    match last.and_then(|l| l.parse::<usize>().ok()) {
        Some(n) if n == message_size => Ok(()),
        _ => Err(HarnessError::Verification(format!(
            "server count mismatch: expected {message_size}, final record was {last:?}"
        ))),
    }
}

fn random_payload(len: usize) -> Bytes {
    let mut buf = vec![0u8; len];
    rand::rng().fill_bytes(&mut buf);
    Bytes::from(buf)
}

/// ASCII-letters payload for capture runs.
fn random_ascii_payload(len: usize) -> Bytes {
    const LETTERS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
    let mut rng = rand::rng();
    Bytes::from(
        (0..len)
            .map(|_| LETTERS[rng.random_range(0..LETTERS.len())])
            .collect::<Vec<u8>>(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_echo_accepts_exact_final_record() {
        let payload = b"hello world";
        let stdout = b"hello world\nhello world\n";
        verify_client_echo(stdout, payload).expect("exact echo");
    }

    #[test]
    fn client_echo_handles_newlines_inside_the_payload() {
        let payload = b"bin\nary\npayload";
        let mut stdout = Vec::new();
        for _ in 0..3 {
            stdout.extend_from_slice(payload);
            stdout.push(b'\n');
        }
        verify_client_echo(&stdout, payload).expect("payload with newlines");
    }

    #[test]
    fn client_echo_rejects_corrupted_tail() {
        let payload = b"hello world";
        assert!(verify_client_echo(b"hello worlt\n", payload).is_err());
        assert!(verify_client_echo(b"hello world", payload).is_err()); // no newline
        assert!(verify_client_echo(b"", payload).is_err());
    }

    #[test]
    fn server_count_takes_the_final_record() {
        verify_server_count(b"11\n11\n11\n", 11).expect("repeated counts");
        assert!(verify_server_count(b"11\n12\n", 11).is_err());
        assert!(verify_server_count(b"eleven\n", 11).is_err());
        assert!(verify_server_count(b"", 11).is_err());
    }

    #[test]
    fn ascii_payload_is_printable_letters() {
        let payload = random_ascii_payload(256);
        assert_eq!(payload.len(), 256);
        assert!(payload.iter().all(|b| b.is_ascii_alphabetic()));
    }

    #[test]
    fn random_payloads_differ() {
        assert_ne!(random_payload(64), random_payload(64));
    }
}
