use std::{
    future::Future,
    io,
    process::Stdio,
    sync::atomic::{AtomicBool, Ordering},
};

use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, BufReader, Lines},
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::mpsc,
};
use tracing::{debug, info, warn};

use crate::{
    config::RunConfig,
    error::{PodkeeperError, PodkeeperResult},
    forwarding::PodSpec,
    matcher::RawTable,
    session::SessionId,
    supervisor::Event,
};

/// stderr fragments that mean the cluster is unreachable rather than broken
pub const NETWORK_ERROR_SIGNATURES: [&str; 4] = [
    "network is unreachable",
    "handshake timeout",
    "network is down",
    "i/o timeout",
];

/// Whether kubectl's error text points at a connectivity problem
pub fn is_network_error(stderr: &str) -> bool {
    NETWORK_ERROR_SIGNATURES
        .iter()
        .any(|signature| stderr.contains(signature))
}

/// Result of listing the cluster's pods
#[derive(Debug, Clone, PartialEq)]
pub enum QueryOutcome {
    /// The listing, and whether it ended a network outage
    Table { table: RawTable, recovered: bool },
    /// The cluster could not be reached; try again later
    NetworkDown(String),
}

/// Lists the pods of a namespace
pub trait ClusterQuery {
    fn list_workloads(
        &self,
        namespace: Option<&str>,
    ) -> impl Future<Output = PodkeeperResult<QueryOutcome>> + Send;
}

/// A running tunnel process owned by one session
pub trait TunnelHandle: Send {
    /// Best-effort, non-blocking termination
    fn kill(&mut self) -> io::Result<()>;
}

/// Starts tunnel processes
pub trait TunnelSpawner {
    fn spawn(
        &self,
        instance: &str,
        spec: &PodSpec,
        sink: OutputSink,
    ) -> PodkeeperResult<Box<dyn TunnelHandle>>;
}

/// Delivers a tunnel's output to the supervisor, tagged with its origin
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: mpsc::UnboundedSender<Event>,
    session: SessionId,
    generation: u64,
}

impl OutputSink {
    pub fn new(tx: mpsc::UnboundedSender<Event>, session: SessionId, generation: u64) -> Self {
        Self {
            tx,
            session,
            generation,
        }
    }

    pub fn line(&self, line: String) {
        let _ = self.tx.send(Event::Output {
            session: self.session,
            generation: self.generation,
            line,
        });
    }

    pub fn exited(&self) {
        let _ = self.tx.send(Event::Exited {
            session: self.session,
            generation: self.generation,
        });
    }
}

/// kubectl wrapper for listing pods and forwarding ports
pub struct Kubectl {
    config: RunConfig,
    network_down: AtomicBool,
}

impl Kubectl {
    pub fn new(config: RunConfig) -> Self {
        Self {
            config,
            network_down: AtomicBool::new(false),
        }
    }

    /// `--kubeconfig` and `--namespace` qualifiers; a pod namespace wins over the global one
    fn qualifiers(&self, namespace: Option<&str>) -> Vec<String> {
        let mut args = Vec::new();

        if let Some(path) = &self.config.kubeconfig {
            args.push("--kubeconfig".to_string());
            args.push(path.display().to_string());
        }

        if let Some(namespace) = namespace.or(self.config.namespace.as_deref()) {
            args.push("--namespace".to_string());
            args.push(namespace.to_string());
        }

        args
    }

    /// Arguments for listing pods
    pub fn list_args(&self, namespace: Option<&str>) -> Vec<String> {
        let mut args = vec!["get".to_string(), "pods".to_string()];
        args.extend(self.qualifiers(namespace));
        args
    }

    /// Arguments for forwarding one pod
    pub fn port_forward_args(&self, instance: &str, spec: &PodSpec) -> Vec<String> {
        let mut args = vec![
            "port-forward".to_string(),
            instance.to_string(),
            spec.port_arg(),
        ];
        args.extend(self.qualifiers(spec.namespace.as_deref()));
        args
    }

    /// Build the port-forward command line for logging
    pub fn build_command_string(&self, instance: &str, spec: &PodSpec) -> String {
        let mut parts = vec![self.config.kubectl.display().to_string()];
        parts.extend(self.port_forward_args(instance, spec));
        parts.join(" ")
    }
}

impl ClusterQuery for Kubectl {
    async fn list_workloads(&self, namespace: Option<&str>) -> PodkeeperResult<QueryOutcome> {
        let mut cmd = Command::new(&self.config.kubectl);
        cmd.args(self.list_args(namespace))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        debug!("Querying pods: {:?}", cmd);

        let output = cmd
            .output()
            .await
            .map_err(|e| PodkeeperError::Query(format!("Failed to run kubectl: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if is_network_error(&stderr) {
                if !self.network_down.swap(true, Ordering::SeqCst) {
                    warn!("Lost connection to the cluster: {}", stderr);
                }
                return Ok(QueryOutcome::NetworkDown(stderr));
            }
            return Err(PodkeeperError::Query(stderr));
        }

        let recovered = self.network_down.swap(false, Ordering::SeqCst);
        Ok(QueryOutcome::Table {
            table: RawTable::new(String::from_utf8_lossy(&output.stdout)),
            recovered,
        })
    }
}

impl TunnelSpawner for Kubectl {
    fn spawn(
        &self,
        instance: &str,
        spec: &PodSpec,
        sink: OutputSink,
    ) -> PodkeeperResult<Box<dyn TunnelHandle>> {
        let mut cmd = Command::new(&self.config.kubectl);
        cmd.args(self.port_forward_args(instance, spec))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Starting tunnel: {}", self.build_command_string(instance, spec));

        let mut child = cmd
            .spawn()
            .map_err(|e| PodkeeperError::Spawn(format!("Failed to start kubectl: {e}")))?;

        tokio::spawn(forward_output(
            child.stdout.take(),
            child.stderr.take(),
            sink,
        ));

        info!(pod = %spec.name, "Forwarding {} via {}", spec, instance);

        Ok(Box::new(KubectlTunnel { child }))
    }
}

/// A `kubectl port-forward` child process
struct KubectlTunnel {
    child: Child,
}

impl TunnelHandle for KubectlTunnel {
    fn kill(&mut self) -> io::Result<()> {
        if self.child.try_wait()?.is_some() {
            return Ok(());
        }
        self.child.start_kill()
    }
}

/// Relay stdout and stderr lines in arrival order, then report the exit
async fn forward_output(stdout: Option<ChildStdout>, stderr: Option<ChildStderr>, sink: OutputSink) {
    let mut out = stdout.map(|s| BufReader::new(s).lines());
    let mut err = stderr.map(|s| BufReader::new(s).lines());

    loop {
        let line = tokio::select! {
            Some(line) = next_line(&mut out) => line,
            Some(line) = next_line(&mut err) => line,
            else => break,
        };
        sink.line(line);
    }

    sink.exited();
}

async fn next_line<R: AsyncBufRead + Unpin>(lines: &mut Option<Lines<R>>) -> Option<String> {
    let reader = lines.as_mut()?;
    match reader.next_line().await {
        Ok(Some(line)) => Some(line),
        Ok(None) | Err(_) => {
            *lines = None;
            None
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::{
        collections::VecDeque,
        path::PathBuf,
        sync::{
            Arc, Mutex,
            atomic::{AtomicBool, AtomicUsize},
        },
    };

    use super::*;

    #[derive(Debug, Default)]
    pub(crate) struct FakeHandle {
        pub killed: Arc<AtomicBool>,
        pub fail_kill: bool,
    }

    impl TunnelHandle for FakeHandle {
        fn kill(&mut self) -> io::Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            if self.fail_kill {
                return Err(io::Error::other("kill failed"));
            }
            Ok(())
        }
    }

    /// Serves scripted listings; the last one repeats forever
    #[derive(Default)]
    pub(crate) struct FakeCluster {
        outcomes: Mutex<VecDeque<QueryOutcome>>,
        hang_after: Mutex<Option<usize>>,
        pub calls: AtomicUsize,
    }

    impl FakeCluster {
        pub fn with_table(text: &str) -> Self {
            let cluster = Self::default();
            cluster.push_table(text);
            cluster
        }

        pub fn push_table(&self, text: &str) {
            self.outcomes.lock().unwrap().push_back(QueryOutcome::Table {
                table: RawTable::new(text),
                recovered: false,
            });
        }

        /// Replace every queued listing
        pub fn set_table(&self, text: &str) {
            self.script(vec![QueryOutcome::Table {
                table: RawTable::new(text),
                recovered: false,
            }]);
        }

        /// Replace every queued outcome
        pub fn script(&self, outcomes: Vec<QueryOutcome>) {
            *self.outcomes.lock().unwrap() = outcomes.into();
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        /// Listings after the first `calls` never finish, like an API server
        /// that stopped answering
        pub fn hang_after(&self, calls: usize) {
            *self.hang_after.lock().unwrap() = Some(calls);
        }
    }

    impl ClusterQuery for FakeCluster {
        async fn list_workloads(&self, _namespace: Option<&str>) -> PodkeeperResult<QueryOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let hang = self.hang_after.lock().unwrap().is_some_and(|after| call >= after);
            if hang {
                std::future::pending::<()>().await;
            }

            let mut outcomes = self.outcomes.lock().unwrap();
            let outcome = if outcomes.len() > 1 {
                outcomes.pop_front()
            } else {
                outcomes.front().cloned()
            };
            Ok(outcome.unwrap_or(QueryOutcome::Table {
                table: RawTable::default(),
                recovered: false,
            }))
        }
    }

    pub(crate) struct Spawned {
        pub instance: String,
        pub spec: PodSpec,
        pub sink: OutputSink,
        pub killed: Arc<AtomicBool>,
    }

    /// Records spawns so tests can feed tunnel output by hand
    #[derive(Default)]
    pub(crate) struct FakeSpawner {
        pub spawned: Mutex<Vec<Spawned>>,
        pub fail_kill: bool,
    }

    impl FakeSpawner {
        pub fn count(&self) -> usize {
            self.spawned.lock().unwrap().len()
        }

        /// Emit a line from the most recent tunnel of `instance`
        pub fn emit(&self, instance: &str, line: &str) {
            let spawned = self.spawned.lock().unwrap();
            let tunnel = spawned
                .iter()
                .rev()
                .find(|s| s.instance == instance)
                .expect("no tunnel for instance");
            tunnel.sink.line(line.to_string());
        }

        pub fn killed(&self, index: usize) -> bool {
            self.spawned.lock().unwrap()[index].killed.load(Ordering::SeqCst)
        }
    }

    impl TunnelSpawner for FakeSpawner {
        fn spawn(
            &self,
            instance: &str,
            spec: &PodSpec,
            sink: OutputSink,
        ) -> PodkeeperResult<Box<dyn TunnelHandle>> {
            let handle = FakeHandle {
                fail_kill: self.fail_kill,
                ..FakeHandle::default()
            };
            self.spawned.lock().unwrap().push(Spawned {
                instance: instance.to_string(),
                spec: spec.clone(),
                sink,
                killed: handle.killed.clone(),
            });
            Ok(Box::new(handle))
        }
    }

    fn kubectl(namespace: Option<&str>) -> Kubectl {
        Kubectl::new(RunConfig {
            kubeconfig: Some(PathBuf::from("/tmp/kube.yaml")),
            namespace: namespace.map(str::to_string),
            ..RunConfig::default()
        })
    }

    #[test]
    fn test_network_error_signatures() {
        assert!(is_network_error(
            "Unable to connect to the server: dial tcp 10.0.0.1:443: i/o timeout"
        ));
        assert!(is_network_error(
            "Unable to connect to the server: net/http: TLS handshake timeout"
        ));
        assert!(is_network_error("connect: network is unreachable"));
        assert!(!is_network_error(
            "error: You must be logged in to the server (Unauthorized)"
        ));
    }

    #[test]
    fn test_list_args() {
        let client = kubectl(Some("default"));
        assert_eq!(
            client.list_args(None),
            vec!["get", "pods", "--kubeconfig", "/tmp/kube.yaml", "--namespace", "default"]
        );
        assert_eq!(
            client.list_args(Some("staging")),
            vec!["get", "pods", "--kubeconfig", "/tmp/kube.yaml", "--namespace", "staging"]
        );
    }

    #[test]
    fn test_build_command_string() {
        let client = kubectl(None);
        let spec = PodSpec::parse("db:5432:5433").unwrap();

        let cmd = client.build_command_string("db-0", &spec);

        assert_eq!(
            cmd,
            "kubectl port-forward db-0 5432:5433 --kubeconfig /tmp/kube.yaml"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_workloads_returns_stdout() {
        let client = Kubectl::new(RunConfig {
            kubectl: PathBuf::from("echo"),
            ..RunConfig::default()
        });

        let outcome = client.list_workloads(None).await.unwrap();

        assert_eq!(
            outcome,
            QueryOutcome::Table {
                table: RawTable::new("get pods\n"),
                recovered: false,
            }
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_list_workloads_failure_is_fatal() {
        let client = Kubectl::new(RunConfig {
            kubectl: PathBuf::from("false"),
            ..RunConfig::default()
        });

        let result = client.list_workloads(None).await;
        assert!(matches!(result, Err(PodkeeperError::Query(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_network_outage_and_recovery() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("kubectl");
        let marker = dir.path().join("reachable");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\n\
                 if [ ! -e '{}' ]; then\n\
                 touch '{}'\n\
                 echo 'Unable to connect to the server: dial tcp 10.0.0.1:443: i/o timeout' >&2\n\
                 exit 1\n\
                 fi\n\
                 echo 'web-1 1/1 Running 0 1m'\n",
                marker.display(),
                marker.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let client = Kubectl::new(RunConfig {
            kubectl: script,
            ..RunConfig::default()
        });

        assert_eq!(
            client.list_workloads(None).await.unwrap(),
            QueryOutcome::NetworkDown(
                "Unable to connect to the server: dial tcp 10.0.0.1:443: i/o timeout".to_string()
            )
        );

        // Only the first listing after the outage reports the recovery
        for recovered in [true, false] {
            assert_eq!(
                client.list_workloads(None).await.unwrap(),
                QueryOutcome::Table {
                    table: RawTable::new("web-1 1/1 Running 0 1m\n"),
                    recovered,
                }
            );
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_tunnel_relays_output_then_exit() {
        let client = Kubectl::new(RunConfig {
            kubectl: PathBuf::from("echo"),
            ..RunConfig::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        let spec = PodSpec::parse("web:8080").unwrap();

        let _handle = client
            .spawn("web-1", &spec, OutputSink::new(tx, 3, 7))
            .unwrap();

        match rx.recv().await {
            Some(Event::Output {
                session,
                generation,
                line,
            }) => {
                assert_eq!((session, generation), (3, 7));
                assert_eq!(line, "port-forward web-1 8080");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(matches!(
            rx.recv().await,
            Some(Event::Exited {
                session: 3,
                generation: 7
            })
        ));
    }
}
