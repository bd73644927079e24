// src/io/serial/negotiator.rs
//
// Link speed negotiation.
// Controllers ship with one of a handful of common speeds. Starting from the
// preferred speed, each candidate is opened in turn under a timeout and the
// first one that opens is committed.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::transport::{BoxedPort, SerialTransport};
use crate::error::SerialError;

// ============================================================================
// Constants
// ============================================================================

/// Speeds tried after the preferred one, in priority order
pub const COMMON_BAUD_RATES: [u32; 8] = [115_200, 921_600, 460_800, 230_400, 57_600, 38_400, 19_200, 9_600];

/// Speed used when nothing is configured
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Upper bound for a single open attempt
pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(3);

/// Pause before retrying at the next speed
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// How long a timed-out open may still finish so its handle is closed before the next speed
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

// ============================================================================
// Types
// ============================================================================

/// One speed to try, with its position in the priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BaudCandidate {
    pub baud_rate: u32,
    pub ordinal: usize,
}

/// How a single attempt ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "reason", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Opened,
    Failed(String),
    TimedOut,
}

/// Record of one attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionAttempt {
    pub candidate: BaudCandidate,
    pub outcome: AttemptOutcome,
    pub elapsed_ms: u64,
}

/// Timing knobs for negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NegotiatorConfig {
    pub attempt_timeout: Duration,
    pub retry_delay: Duration,
    pub settle_timeout: Duration,
}

impl Default for NegotiatorConfig {
    fn default() -> Self {
        NegotiatorConfig {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            retry_delay: DEFAULT_RETRY_DELAY,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
        }
    }
}

/// A device opened at its committed speed
pub struct Negotiated {
    pub port: BoxedPort,
    pub baud_rate: u32,
    pub attempts: Vec<ConnectionAttempt>,
}

/// Every candidate failed or timed out
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("Failed to connect to {path} with any common baud rate. Tried: {}", join_speeds(.attempts))]
pub struct NegotiationFailure {
    pub path: String,
    pub attempts: Vec<ConnectionAttempt>,
}

impl NegotiationFailure {
    /// Speeds tried, in the order they were tried
    pub fn attempted_speeds(&self) -> Vec<u32> {
        self.attempts.iter().map(|a| a.candidate.baud_rate).collect()
    }
}

fn join_speeds(attempts: &[ConnectionAttempt]) -> String {
    attempts
        .iter()
        .map(|a| a.candidate.baud_rate.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

// ============================================================================
// Candidate Lists
// ============================================================================

/// Preferred speed first, then the common speeds without duplicates
pub fn candidate_list(preferred: u32) -> Vec<BaudCandidate> {
    let mut rates = vec![preferred];
    for &rate in COMMON_BAUD_RATES.iter() {
        if !rates.contains(&rate) {
            rates.push(rate);
        }
    }

    rates
        .into_iter()
        .enumerate()
        .map(|(ordinal, baud_rate)| BaudCandidate { baud_rate, ordinal })
        .collect()
}

/// A single-candidate list for connecting at one known speed
pub fn fixed_candidate(baud_rate: u32) -> Vec<BaudCandidate> {
    vec![BaudCandidate {
        baud_rate,
        ordinal: 0,
    }]
}

// ============================================================================
// Negotiator
// ============================================================================

pub struct LinkNegotiator {
    transport: Arc<dyn SerialTransport>,
    config: NegotiatorConfig,
}

impl LinkNegotiator {
    pub fn new(transport: Arc<dyn SerialTransport>, config: NegotiatorConfig) -> Self {
        LinkNegotiator { transport, config }
    }

    pub fn config(&self) -> &NegotiatorConfig {
        &self.config
    }

    /// Try the preferred speed, then the common speeds, committing to the first that opens.
    pub async fn negotiate(
        &self,
        path: &str,
        preferred: u32,
    ) -> Result<Negotiated, NegotiationFailure> {
        self.negotiate_candidates(path, candidate_list(preferred)).await
    }

    /// Try `candidates` in order. An attempt that errors or outlives the
    /// attempt timeout is abandoned; a handle it opens late is closed before
    /// the next candidate is tried.
    pub async fn negotiate_candidates(
        &self,
        path: &str,
        candidates: Vec<BaudCandidate>,
    ) -> Result<Negotiated, NegotiationFailure> {
        tlog!(
            "[negotiator] Attempting to connect to {} with baud rates: {:?}",
            path,
            candidates.iter().map(|c| c.baud_rate).collect::<Vec<_>>()
        );

        let mut attempts = Vec::with_capacity(candidates.len());

        for candidate in candidates {
            if !attempts.is_empty() && !self.config.retry_delay.is_zero() {
                tokio::time::sleep(self.config.retry_delay).await;
            }

            let started = Instant::now();
            let mut open_task = self.spawn_open(path, candidate.baud_rate);
            let result = tokio::time::timeout(self.config.attempt_timeout, &mut open_task).await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let outcome = match result {
                Ok(Ok(Ok(port))) => {
                    attempts.push(ConnectionAttempt {
                        candidate,
                        outcome: AttemptOutcome::Opened,
                        elapsed_ms,
                    });
                    tlog!(
                        "[negotiator] {} opened at {} baud after {} attempt(s)",
                        path,
                        candidate.baud_rate,
                        attempts.len()
                    );
                    return Ok(Negotiated {
                        port,
                        baud_rate: candidate.baud_rate,
                        attempts,
                    });
                }
                Ok(Ok(Err(e))) => {
                    tlog!(
                        "[negotiator] Failed with baud rate {}: {}",
                        candidate.baud_rate,
                        e
                    );
                    AttemptOutcome::Failed(e.to_string())
                }
                Ok(Err(e)) => {
                    tlog!(
                        "[negotiator] Open task for baud rate {} failed: {}",
                        candidate.baud_rate,
                        e
                    );
                    AttemptOutcome::Failed(format!("open task failed: {}", e))
                }
                Err(_) => {
                    tlog!("[negotiator] Timeout for baud rate {}", candidate.baud_rate);
                    self.settle_late_open(open_task, candidate.baud_rate).await;
                    AttemptOutcome::TimedOut
                }
            };

            attempts.push(ConnectionAttempt {
                candidate,
                outcome,
                elapsed_ms,
            });
        }

        let failure = NegotiationFailure {
            path: path.to_string(),
            attempts,
        };
        tlog!("[negotiator] {}", failure);
        Err(failure)
    }

    fn spawn_open(&self, path: &str, baud_rate: u32) -> JoinHandle<Result<BoxedPort, SerialError>> {
        let transport = self.transport.clone();
        let path = path.to_string();
        tokio::spawn(async move { transport.open(&path, baud_rate).await })
    }

    /// Give a timed-out open up to the settle timeout to finish, and close
    /// whatever it opened. Past that the open is abandoned.
    async fn settle_late_open(
        &self,
        mut open_task: JoinHandle<Result<BoxedPort, SerialError>>,
        baud_rate: u32,
    ) {
        match tokio::time::timeout(self.config.settle_timeout, &mut open_task).await {
            Ok(Ok(Ok(port))) => {
                drop(port);
                tlog!("[negotiator] Closed late handle opened at {} baud", baud_rate);
            }
            Ok(_) => {}
            Err(_) => {
                open_task.abort();
                tlog!(
                    "[negotiator] Open at {} baud still pending after {:?}, abandoning it",
                    baud_rate,
                    self.config.settle_timeout
                );
            }
        }
    }
}
