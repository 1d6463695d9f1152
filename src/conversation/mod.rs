//! Multi-turn exchanges with the language-model collaborator.
//!
//! A conversation is opened, every message is posted in caller order, one run
//! is started, and the run is polled with exponential backoff until it
//! settles, the retry cap is hit, or the wall-clock deadline passes.

mod openai;

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub use openai::AssistantsClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    RequiresAction,
    Completed,
    Failed,
    TimedOut,
}

impl RunStatus {
    /// Map a service status string. Cancellation and other dead ends count as failed.
    pub fn from_api(status: &str) -> Self {
        match status {
            "queued" => RunStatus::Queued,
            "in_progress" | "cancelling" => RunStatus::Running,
            "requires_action" => RunStatus::RequiresAction,
            "completed" => RunStatus::Completed,
            "expired" => RunStatus::TimedOut,
            _ => RunStatus::Failed,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::TimedOut
        )
    }

    /// Terminal, or waiting on us: either way polling stops.
    pub fn is_settled(self) -> bool {
        self.is_terminal() || self == RunStatus::RequiresAction
    }

    fn rank(self) -> u8 {
        match self {
            RunStatus::Queued => 0,
            RunStatus::Running => 1,
            RunStatus::RequiresAction => 2,
            RunStatus::Completed | RunStatus::Failed | RunStatus::TimedOut => 3,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
            RunStatus::RequiresAction => "requires_action",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::TimedOut => "timed_out",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn user(content: &str) -> Self {
        Self {
            role: Role::User,
            content: content.to_string(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: Role::Assistant,
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutReason {
    RetryCap(u32),
    Deadline(Duration),
}

impl fmt::Display for TimeoutReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutReason::RetryCap(n) => write!(f, "no result after {n} retries"),
            TimeoutReason::Deadline(d) => write!(f, "no result within {}s", d.as_secs()),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error("conversation service unreachable: {0}")]
    Network(String),

    #[error("conversation timed out: {0}")]
    TimeoutExceeded(TimeoutReason),

    #[error("run ended as {status}{}", .detail.as_deref().map(|d| format!(": {d}")).unwrap_or_default())]
    RunFailed {
        status: RunStatus,
        detail: Option<String>,
    },

    #[error("invalid status transition {from} -> {to}")]
    InvalidTransition { from: RunStatus, to: RunStatus },

    #[error("cannot post to a conversation that is already {0}")]
    Closed(RunStatus),

    #[error("run settled without a reply")]
    EmptyReply,
}

/// One judgment or synthesis exchange. Never reused across steps.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub id: String,
    pub participant: String,
    pub messages: Vec<Message>,
    pub status: RunStatus,
    pub transcript: Vec<Message>,
}

impl Conversation {
    pub fn new(id: &str, participant: &str) -> Self {
        Self {
            id: id.to_string(),
            participant: participant.to_string(),
            messages: Vec::new(),
            status: RunStatus::Queued,
            transcript: Vec::new(),
        }
    }

    /// Messages may only be added before the run starts.
    pub fn push_message(&mut self, message: Message) -> Result<(), ConversationError> {
        if self.status != RunStatus::Queued {
            return Err(ConversationError::Closed(self.status));
        }
        self.messages.push(message);
        Ok(())
    }

    /// Move to `next`. Status never moves backwards or out of a terminal state.
    pub fn advance(&mut self, next: RunStatus) -> Result<(), ConversationError> {
        if next == self.status {
            return Ok(());
        }
        if self.status.is_terminal() || next.rank() < self.status.rank() {
            return Err(ConversationError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        debug!(conversation = %self.id, from = %self.status, to = %next, "status changed");
        self.status = next;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Passed,
    Failed,
}

/// How a conversation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Text(String),
    Decision(Decision),
    /// The collaborator asked for a follow-up action we do not recognize.
    Action(String),
}

impl Outcome {
    pub fn decision(&self) -> Option<Decision> {
        match self {
            Outcome::Decision(d) => Some(*d),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Outcome::Text(_) => "text",
            Outcome::Decision(_) => "decision",
            Outcome::Action(_) => "action",
        }
    }
}

/// Recognize a decision token, either as a whole reply or as a
/// `functions.passed_test` style mention.
pub fn parse_decision(text: &str) -> Option<Decision> {
    if text.contains("functions.passed_test") {
        return Some(Decision::Passed);
    }
    if text.contains("functions.failed_test") {
        return Some(Decision::Failed);
    }

    let token = text
        .trim()
        .trim_matches(|c: char| c == '`' || c == '"' || c == '\'' || c == '.')
        .to_ascii_lowercase();
    match token.as_str() {
        "passed" | "passed_test" => Some(Decision::Passed),
        "failed" | "failed_test" => Some(Decision::Failed),
        _ => None,
    }
}

/// Snapshot of a run as reported by the service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunState {
    pub status: RunStatus,
    pub required_actions: Vec<String>,
    pub last_error: Option<String>,
}

impl RunState {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            required_actions: Vec::new(),
            last_error: None,
        }
    }
}

/// The remote conversation API.
pub trait ConversationService {
    fn create_session(&self, participant: &str) -> Result<String, ConversationError>;
    fn post_message(&self, session: &str, message: &Message) -> Result<(), ConversationError>;
    fn create_run(&self, session: &str, participant: &str) -> Result<String, ConversationError>;
    fn run_status(&self, session: &str, run: &str) -> Result<RunState, ConversationError>;
    /// Full transcript, oldest first.
    fn list_messages(&self, session: &str) -> Result<Vec<Message>, ConversationError>;
}

pub trait Clock {
    fn now(&self) -> Instant;
    fn sleep(&self, duration: Duration);
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub initial_delay: Duration,
    pub max_retries: u32,
    pub timeout: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_retries: 12,
            timeout: Duration::from_secs(60),
        }
    }
}

/// A finished exchange: the outcome plus the conversation record.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub outcome: Outcome,
    pub conversation: Conversation,
    pub polls: u32,
}

pub struct ConversationDriver<'a> {
    service: &'a dyn ConversationService,
    clock: &'a dyn Clock,
    policy: PollPolicy,
}

impl<'a> ConversationDriver<'a> {
    pub fn new(service: &'a dyn ConversationService, clock: &'a dyn Clock, policy: PollPolicy) -> Self {
        Self {
            service,
            clock,
            policy,
        }
    }

    pub fn run_session(&self, participant: &str, messages: &[String]) -> Result<Outcome, ConversationError> {
        self.run_session_report(participant, messages)
            .map(|report| report.outcome)
    }

    /// Like [`run_session`](Self::run_session) but also returns the conversation.
    pub fn run_session_report(
        &self,
        participant: &str,
        messages: &[String],
    ) -> Result<SessionReport, ConversationError> {
        let session = self.service.create_session(participant)?;
        let mut conversation = Conversation::new(&session, participant);
        info!(
            conversation = %session,
            participant,
            messages = messages.len(),
            "conversation opened"
        );

        for content in messages {
            let message = Message::user(content);
            self.service.post_message(&session, &message)?;
            conversation.push_message(message)?;
        }

        let run = self.service.create_run(&session, participant)?;
        let (state, polls) = self.poll(&mut conversation, &run)?;

        let outcome = match state.status {
            RunStatus::Completed => {
                let transcript = self.service.list_messages(&session)?;
                let reply = transcript
                    .last()
                    .filter(|m| m.role == Role::Assistant)
                    .map(|m| m.content.clone())
                    .ok_or(ConversationError::EmptyReply)?;
                conversation.transcript = transcript;
                match parse_decision(&reply) {
                    Some(decision) => Outcome::Decision(decision),
                    None => Outcome::Text(reply),
                }
            }
            RunStatus::RequiresAction => {
                let action = state
                    .required_actions
                    .first()
                    .cloned()
                    .ok_or(ConversationError::EmptyReply)?;
                match parse_decision(&action) {
                    Some(decision) => Outcome::Decision(decision),
                    None => Outcome::Action(action),
                }
            }
            status => {
                return Err(ConversationError::RunFailed {
                    status,
                    detail: state.last_error,
                });
            }
        };

        info!(conversation = %session, polls, outcome = outcome.kind(), "conversation finished");
        Ok(SessionReport {
            outcome,
            conversation,
            polls,
        })
    }

    fn poll(&self, conversation: &mut Conversation, run: &str) -> Result<(RunState, u32), ConversationError> {
        let deadline = self.clock.now() + self.policy.timeout;
        let mut delay = self.policy.initial_delay;
        let mut retries = 0u32;
        let mut polls = 0u32;

        loop {
            let state = self.service.run_status(&conversation.id, run)?;
            polls += 1;
            conversation.advance(state.status)?;
            if state.status.is_settled() {
                return Ok((state, polls));
            }

            let now = self.clock.now();
            let reason = if now >= deadline {
                Some(TimeoutReason::Deadline(self.policy.timeout))
            } else if retries >= self.policy.max_retries {
                Some(TimeoutReason::RetryCap(self.policy.max_retries))
            } else {
                None
            };
            if let Some(reason) = reason {
                warn!(conversation = %conversation.id, polls, %reason, "giving up on run");
                conversation.advance(RunStatus::TimedOut)?;
                return Err(ConversationError::TimeoutExceeded(reason));
            }

            let pause = delay.min(deadline - now);
            debug!(conversation = %conversation.id, status = %state.status, ?pause, "run pending");
            self.clock.sleep(pause);
            delay = delay.saturating_mul(2);
            retries += 1;
        }
    }
}
