use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{MissedTickBehavior, interval, sleep},
};
use tracing::{debug, info, warn};

use crate::{
    classify::classify_line,
    config::RunConfig,
    error::{PodkeeperError, PodkeeperResult},
    forwarding::PodSpec,
    health::{ClusterSnapshot, dead_sessions},
    kubectl::{ClusterQuery, OutputSink, QueryOutcome, TunnelSpawner},
    matcher::match_instance,
    session::{Action, Fatal, ForwardingSession, Phase, SessionEvent, SessionId},
};

/// Inputs of the supervisor's event loop
#[derive(Debug)]
pub enum Event {
    /// A tunnel printed a line
    Output {
        session: SessionId,
        generation: u64,
        line: String,
    },
    /// A tunnel's output streams closed
    Exited { session: SessionId, generation: u64 },
    /// The listing of a reconnection attempt came back
    RetryListed {
        session: SessionId,
        generation: u64,
        outcome: PodkeeperResult<QueryOutcome>,
    },
    /// The listings of a health check came back; `None` while unreachable
    Checked(PodkeeperResult<Option<ClusterSnapshot>>),
}

/// Signals that end the run cleanly
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Hangup,
    Interrupt,
    Terminate,
}

impl ShutdownSignal {
    pub fn exit_code(self) -> i32 {
        match self {
            ShutdownSignal::Hangup => 129,
            ShutdownSignal::Interrupt => 130,
            ShutdownSignal::Terminate => 143,
        }
    }
}

/// Why a run ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Stopped by a signal
    Signal(ShutdownSignal),
    /// Every session was excluded; nothing left to forward
    AllExcluded,
}

impl Exit {
    pub fn exit_code(self) -> i32 {
        match self {
            Exit::Signal(signal) => signal.exit_code(),
            Exit::AllExcluded => 0,
        }
    }
}

/// A health check whose listings are still running
struct PendingCheck {
    /// Tunnel generation of every session when the check started
    generations: BTreeMap<SessionId, u64>,
    task: JoinHandle<()>,
}

/// Keeps every requested pod forwarded until the run ends
pub struct Supervisor<C, S> {
    config: RunConfig,
    cluster: Arc<C>,
    spawner: S,
    sessions: BTreeMap<SessionId, ForwardingSession>,
    pending_check: Option<PendingCheck>,
    events_tx: mpsc::UnboundedSender<Event>,
    events_rx: mpsc::UnboundedReceiver<Event>,
}

impl<C, S> Supervisor<C, S>
where
    C: ClusterQuery + Send + Sync + 'static,
    S: TunnelSpawner,
{
    pub fn new(config: RunConfig, cluster: C, spawner: S, specs: Vec<PodSpec>) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let sessions = specs
            .into_iter()
            .map(ForwardingSession::new)
            .enumerate()
            .collect();

        Self {
            config,
            cluster: Arc::new(cluster),
            spawner,
            sessions,
            pending_check: None,
            events_tx,
            events_rx,
        }
    }

    pub fn session(&self, id: SessionId) -> Option<&ForwardingSession> {
        self.sessions.get(&id)
    }

    /// Number of sessions still in the running set
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Run until a signal arrives or a fatal error occurs. Every tunnel is
    /// killed before this returns.
    pub async fn run(
        &mut self,
        shutdown: mpsc::Receiver<ShutdownSignal>,
    ) -> PodkeeperResult<Exit> {
        let result = self.supervise(shutdown).await;
        self.cleanup();
        result
    }

    async fn supervise(
        &mut self,
        mut shutdown: mpsc::Receiver<ShutdownSignal>,
    ) -> PodkeeperResult<Exit> {
        tokio::select! {
            biased;
            Some(signal) = shutdown.recv() => {
                info!("Received {:?} during startup, shutting down", signal);
                return Ok(Exit::Signal(signal));
            }
            result = self.bring_up() => result?,
        }

        let mut ticker = interval(self.config.health_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await; // Skip first tick

        // Cluster queries run in their own tasks, so no arm below ever waits on kubectl
        loop {
            tokio::select! {
                biased;
                Some(signal) = shutdown.recv() => {
                    info!("Received {:?}, shutting down", signal);
                    return Ok(Exit::Signal(signal));
                }
                Some(event) = self.events_rx.recv() => {
                    if let Some(exit) = self.handle_event(event)? {
                        return Ok(exit);
                    }
                }
                _ = ticker.tick() => self.health_tick(),
            }
        }
    }

    /// Resolve every pod, then start every tunnel.
    ///
    /// Nothing is spawned unless all pods resolve to a running instance.
    pub async fn bring_up(&mut self) -> PodkeeperResult<()> {
        let namespaces = self.namespaces(|_| true);

        let snapshot = loop {
            if let Some(snapshot) = list_namespaces(self.cluster.as_ref(), &namespaces).await? {
                break snapshot;
            }
            warn!(
                "Cluster unreachable, retrying in {:?}",
                self.config.retry.attempt_delay
            );
            sleep(self.config.retry.attempt_delay).await;
        };

        let mut resolved = Vec::with_capacity(self.sessions.len());
        for (&id, session) in &self.sessions {
            let table = snapshot
                .table_for(&session.spec.namespace)
                .ok_or_else(|| PodkeeperError::InstanceUnknown(session.spec.name.clone()))?;
            let instance = match_instance(table, &session.spec.name, false)?
                .ok_or_else(|| PodkeeperError::InstanceUnknown(session.spec.name.clone()))?;
            resolved.push((id, instance));
        }

        for (id, instance) in resolved {
            self.start_tunnel(id, instance)?;
        }

        info!("Started {} tunnels", self.sessions.len());
        Ok(())
    }

    /// Process one event. Returns an exit reason when the run is over.
    pub fn handle_event(&mut self, event: Event) -> PodkeeperResult<Option<Exit>> {
        match event {
            Event::Output {
                session,
                generation,
                line,
            } => {
                if !self.is_current(session, generation) {
                    return Ok(None);
                }
                let class = classify_line(&line);
                self.dispatch(session, SessionEvent::Output(class), &line)
            }
            Event::Exited {
                session,
                generation,
            } => {
                if !self.is_current(session, generation) {
                    return Ok(None);
                }
                self.dispatch(session, SessionEvent::ProcessExited, "tunnel process exited")
            }
            Event::RetryListed {
                session,
                generation,
                outcome,
            } => {
                if !self.is_current(session, generation) {
                    return Ok(None);
                }
                self.reconnect(session, outcome)
            }
            Event::Checked(result) => self.reconcile(result),
        }
    }

    /// Start one reconciliation tick. The listings run in the background and
    /// come back as [`Event::Checked`]; a tick is skipped while one is running.
    pub fn health_tick(&mut self) {
        if self.pending_check.is_some() {
            debug!("Previous health check still running, skipping tick");
            return;
        }

        let namespaces = self.namespaces(|session| session.phase().is_forwarding());
        if namespaces.is_empty() {
            return;
        }

        let generations = self
            .sessions
            .iter()
            .map(|(&id, session)| (id, session.generation()))
            .collect();
        let cluster = Arc::clone(&self.cluster);
        let tx = self.events_tx.clone();

        let task = tokio::spawn(async move {
            let result = list_namespaces(cluster.as_ref(), &namespaces).await;
            let _ = tx.send(Event::Checked(result));
        });

        self.pending_check = Some(PendingCheck { generations, task });
    }

    /// Kill every tunnel. Failures are counted and reported, never fatal.
    pub fn cleanup(&mut self) -> usize {
        if let Some(check) = self.pending_check.take() {
            check.task.abort();
        }

        let total = self.sessions.len();
        let mut failures = 0;

        for session in self.sessions.values_mut() {
            session.cancel_retry();
            if let Err(e) = session.kill() {
                failures += 1;
                warn!(pod = %session.spec.name, "Failed to stop tunnel: {}", e);
            }
        }

        if failures > 0 {
            warn!("{} of {} tunnels could not be stopped", failures, total);
        } else {
            debug!("Stopped {} tunnels", total);
        }

        failures
    }

    fn is_current(&self, id: SessionId, generation: u64) -> bool {
        self.sessions
            .get(&id)
            .is_some_and(|session| session.generation() == generation)
    }

    /// Distinct namespace overrides of the selected sessions
    fn namespaces(&self, filter: impl Fn(&ForwardingSession) -> bool) -> Vec<Option<String>> {
        self.sessions
            .values()
            .filter(|session| filter(session))
            .map(|session| session.spec.namespace.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Restart every session the finished health check found dead
    fn reconcile(
        &mut self,
        result: PodkeeperResult<Option<ClusterSnapshot>>,
    ) -> PodkeeperResult<Option<Exit>> {
        let Some(check) = self.pending_check.take() else {
            return Ok(None);
        };

        let Some(snapshot) = result? else {
            debug!("Skipping health check while the cluster is unreachable");
            return Ok(None);
        };

        // Tunnels respawned while the listings ran are newer than the snapshot
        let checked = self
            .sessions
            .iter()
            .filter(|(id, session)| check.generations.get(*id) == Some(&session.generation()));

        for id in dead_sessions(&snapshot, checked) {
            if let Some(exit) =
                self.dispatch(id, SessionEvent::HealthMismatch, "health check failed")?
            {
                return Ok(Some(exit));
            }
        }

        Ok(None)
    }

    fn start_tunnel(&mut self, id: SessionId, instance: String) -> PodkeeperResult<()> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(());
        };

        let sink = OutputSink::new(self.events_tx.clone(), id, session.next_generation());
        let process = self.spawner.spawn(&instance, &session.spec, sink)?;
        session.attach(instance, process);
        Ok(())
    }

    /// Apply a session event and carry out the resulting side effect
    fn dispatch(
        &mut self,
        id: SessionId,
        event: SessionEvent,
        line: &str,
    ) -> PodkeeperResult<Option<Exit>> {
        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        let pod = session.spec.name.clone();

        match session.apply(event) {
            Action::None => {}
            Action::LogInfo => info!(pod = %pod, "{}", line),
            Action::LogDebug => debug!(pod = %pod, "{}", line),
            Action::Established => {
                info!(
                    pod = %pod,
                    "Forwarding localhost:{} -> {}:{}",
                    session.spec.source_port, session.instance_id, session.spec.destination_port
                );
            }
            Action::Restart => {
                warn!(pod = %pod, "Tunnel to {} died ({}), reconnecting", session.instance_id, line);
                if let Err(e) = session.kill() {
                    warn!(pod = %pod, "Failed to stop tunnel: {}", e);
                }
                self.schedule_retry(id);
            }
            Action::Exclude => {
                let port = session.spec.source_port;
                if let Err(e) = session.kill() {
                    warn!(pod = %pod, "Failed to stop tunnel: {}", e);
                }
                self.sessions.remove(&id);
                warn!("{}", PodkeeperError::PortConflict { pod, port });

                if self.sessions.is_empty() {
                    info!("No tunnels left to forward");
                    return Ok(Some(Exit::AllExcluded));
                }
            }
            Action::Fatal(reason) => {
                if let Err(e) = session.kill() {
                    warn!(pod = %pod, "Failed to stop tunnel: {}", e);
                }
                let err = match reason {
                    Fatal::PermissionDenied => PodkeeperError::PermissionDenied {
                        pod,
                        line: line.to_string(),
                    },
                    Fatal::UnclassifiedStartup => PodkeeperError::UnclassifiedStartupFailure {
                        pod,
                        line: line.to_string(),
                    },
                    Fatal::RetriesExhausted => PodkeeperError::RetryExhausted {
                        pod,
                        attempts: session.retry_count(),
                    },
                };
                return Err(err);
            }
        }

        Ok(None)
    }

    /// Schedule the next reconnection attempt, replacing any pending one.
    ///
    /// The attempt waits out the retry delay, lists the session's namespace
    /// and reports back as [`Event::RetryListed`].
    fn schedule_retry(&mut self, id: SessionId) {
        let Some(session) = self.sessions.get_mut(&id) else {
            return;
        };

        let tx = self.events_tx.clone();
        let cluster = Arc::clone(&self.cluster);
        let namespace = session.spec.namespace.clone();
        let generation = session.generation();
        let delay = self.config.retry.attempt_delay;

        session.schedule_retry(tokio::spawn(async move {
            sleep(delay).await;
            let outcome = cluster.list_workloads(namespace.as_deref()).await;
            let _ = tx.send(Event::RetryListed {
                session: id,
                generation,
                outcome,
            });
        }));
    }

    /// Finish one attempt of the reconnection protocol
    fn reconnect(
        &mut self,
        id: SessionId,
        outcome: PodkeeperResult<QueryOutcome>,
    ) -> PodkeeperResult<Option<Exit>> {
        let name = match self.sessions.get(&id) {
            Some(session) if session.phase() == Phase::Restarting => session.spec.name.clone(),
            _ => return Ok(None),
        };

        let table = match outcome? {
            QueryOutcome::NetworkDown(reason) => {
                debug!(pod = %name, "Cluster unreachable, retrying: {}", reason);
                self.schedule_retry(id);
                return Ok(None);
            }
            QueryOutcome::Table { table, recovered } => {
                if recovered {
                    info!("Connection to the cluster restored");
                }
                table
            }
        };

        if let Some(instance) = match_instance(&table, &name, true)? {
            info!(pod = %name, "Pod is running again as {}", instance);
            self.start_tunnel(id, instance)?;
            return Ok(None);
        }

        let Some(session) = self.sessions.get_mut(&id) else {
            return Ok(None);
        };
        let failed = session.record_failed_attempt();
        if self.config.retry.should_retry(failed) {
            debug!(
                pod = %name,
                "Pod not running yet (attempt {}/{})",
                failed,
                self.config.retry.max_attempts
            );
            self.schedule_retry(id);
            return Ok(None);
        }

        self.dispatch(id, SessionEvent::RetriesExhausted, "")
    }
}

/// List pods in each namespace. `None` when the cluster is unreachable.
async fn list_namespaces<C: ClusterQuery>(
    cluster: &C,
    namespaces: &[Option<String>],
) -> PodkeeperResult<Option<ClusterSnapshot>> {
    let mut snapshot = ClusterSnapshot::default();

    for namespace in namespaces {
        if snapshot.contains(namespace) {
            continue;
        }
        match cluster.list_workloads(namespace.as_deref()).await? {
            QueryOutcome::NetworkDown(reason) => {
                debug!("Cluster unreachable: {}", reason);
                return Ok(None);
            }
            QueryOutcome::Table { table, recovered } => {
                if recovered {
                    info!("Connection to the cluster restored");
                }
                snapshot.insert(namespace.clone(), table);
            }
        }
    }

    Ok(Some(snapshot))
}
