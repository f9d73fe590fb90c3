use tokio::task::JoinHandle;
use tracing::debug;

use crate::{classify::LogClass, forwarding::PodSpec, kubectl::TunnelHandle};

/// Position of a session in the running set
pub type SessionId = usize;

/// Lifecycle of one forwarding session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Looking up the running instance
    Resolving,
    /// Tunnel spawned, waiting for kubectl to report the listener
    Initializing,
    /// Tunnel is forwarding
    Active,
    /// Tunnel was torn down and the pod is being polled
    Restarting,
    /// Local port owned by someone else; the session is dropped for good
    Excluded,
    /// The session hit an unrecoverable error
    Terminated,
}

impl Phase {
    /// Whether a tunnel process is expected to be alive in this phase
    pub fn is_forwarding(self) -> bool {
        matches!(self, Phase::Initializing | Phase::Active)
    }

    /// Whether the phase can never be left
    pub fn is_final(self) -> bool {
        matches!(self, Phase::Excluded | Phase::Terminated)
    }

    /// Transition function over every (phase, event) pair
    pub fn on(self, event: SessionEvent) -> (Phase, Action) {
        use Phase::*;

        if self.is_final() {
            return (self, Action::None);
        }

        match (self, event) {
            (Resolving | Restarting, SessionEvent::Spawned) => (Initializing, Action::None),
            (_, SessionEvent::Spawned) => (self, Action::None),

            (Initializing, SessionEvent::Output(LogClass::Established)) => {
                (Active, Action::Established)
            }
            (Initializing | Active, SessionEvent::Output(LogClass::ForwardError))
            | (Initializing | Active, SessionEvent::ProcessExited)
            | (Initializing | Active, SessionEvent::HealthMismatch) => (Restarting, Action::Restart),
            (Initializing, SessionEvent::Output(LogClass::PortInUse)) => (Excluded, Action::Exclude),
            (Initializing | Active, SessionEvent::Output(LogClass::PermissionDenied)) => {
                (Terminated, Action::Fatal(Fatal::PermissionDenied))
            }
            (Initializing, SessionEvent::Output(LogClass::Unclassified)) => {
                (Terminated, Action::Fatal(Fatal::UnclassifiedStartup))
            }
            (Restarting, SessionEvent::RetriesExhausted) => {
                (Terminated, Action::Fatal(Fatal::RetriesExhausted))
            }
            (Initializing | Active, SessionEvent::Output(LogClass::ConnectionHandled)) => {
                (self, Action::LogDebug)
            }
            (Active, SessionEvent::Output(LogClass::Unclassified | LogClass::PortInUse)) => {
                (self, Action::LogInfo)
            }
            (_, SessionEvent::Output(LogClass::Unclassified)) => (self, Action::LogInfo),
            _ => (self, Action::None),
        }
    }
}

/// Something that happened to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A tunnel process was started for the resolved instance
    Spawned,
    /// The tunnel printed a line
    Output(LogClass),
    /// The tunnel's output streams closed
    ProcessExited,
    /// The reconciliation tick found the pod or the tunnel unhealthy
    HealthMismatch,
    /// The pod did not come back within the retry budget
    RetriesExhausted,
}

/// Side effect the supervisor carries out after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    /// Log the line at info level
    LogInfo,
    /// Log the line at debug level
    LogDebug,
    /// Forwarding is up
    Established,
    /// Kill the tunnel and start the reconnection protocol
    Restart,
    /// Kill the tunnel and drop the session
    Exclude,
    /// End the whole run
    Fatal(Fatal),
}

/// Reasons a session takes the whole run down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fatal {
    PermissionDenied,
    UnclassifiedStartup,
    RetriesExhausted,
}

/// One pod being kept forwarded
pub struct ForwardingSession {
    pub spec: PodSpec,
    /// Last resolved pod name, refreshed on every reconnection
    pub instance_id: String,
    phase: Phase,
    process: Option<Box<dyn TunnelHandle>>,
    pending_retry: Option<JoinHandle<()>>,
    retry_count: u32,
    generation: u64,
}

impl ForwardingSession {
    pub fn new(spec: PodSpec) -> Self {
        Self {
            spec,
            instance_id: String::new(),
            phase: Phase::Resolving,
            process: None,
            pending_retry: None,
            retry_count: 0,
            generation: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Attempts made in the current restart cycle
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Identifies the current tunnel process; bumps on every spawn
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Generation the next spawned tunnel will carry
    pub fn next_generation(&self) -> u64 {
        self.generation + 1
    }

    pub fn has_process(&self) -> bool {
        self.process.is_some()
    }

    /// Apply an event and return the side effect to perform
    pub fn apply(&mut self, event: SessionEvent) -> Action {
        let (next, action) = self.phase.on(event);
        if next != self.phase {
            debug!(pod = %self.spec.name, "{:?} -> {:?} on {:?}", self.phase, next, event);
            if next == Phase::Active {
                self.retry_count = 0;
            }
            if next != Phase::Restarting {
                self.cancel_retry();
            }
        }
        self.phase = next;
        action
    }

    /// Install a freshly spawned tunnel for `instance`
    pub fn attach(&mut self, instance: String, process: Box<dyn TunnelHandle>) {
        self.instance_id = instance;
        self.process = Some(process);
        self.generation = self.next_generation();
        self.apply(SessionEvent::Spawned);
    }

    /// Kill the tunnel process, if any
    pub fn kill(&mut self) -> std::io::Result<()> {
        match self.process.take() {
            Some(mut process) => process.kill(),
            None => Ok(()),
        }
    }

    /// Count one failed reconnection attempt
    pub fn record_failed_attempt(&mut self) -> u32 {
        self.retry_count += 1;
        self.retry_count
    }

    /// Replace the pending retry; the previous one never fires
    pub fn schedule_retry(&mut self, task: JoinHandle<()>) {
        self.cancel_retry();
        self.pending_retry = Some(task);
    }

    pub fn has_pending_retry(&self) -> bool {
        self.pending_retry.is_some()
    }

    pub fn cancel_retry(&mut self) {
        if let Some(task) = self.pending_retry.take() {
            task.abort();
        }
    }
}

impl Drop for ForwardingSession {
    fn drop(&mut self) {
        self.cancel_retry();
    }
}
