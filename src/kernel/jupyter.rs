//! Jupyter kernels over ZeroMQ.
//!
//! [`JupyterLauncher`] resolves a kernel spec, writes a connection file into a private runtime directory and
//! spawns the kernel with the notebook's directory as its working directory. [`JupyterSession`] then speaks
//! the messaging protocol on three channels:
//!
//! | channel | socket | used for |
//! |---------|--------|----------|
//! | shell   | DEALER | `kernel_info_request`, `execute_request` and their replies |
//! | iopub   | SUB    | outputs and `status` broadcasts |
//! | control | DEALER | `shutdown_request` |
//!
//! stdin and heartbeat are allocated in the connection file but never used.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use tempfile::TempDir;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use zeromq::{DealerSocket, Socket, SocketRecv, SocketSend, SubSocket, ZmqMessage};

use super::connection::ConnectionInfo;
use super::wire::{self, Message, Signer};
use super::{ExecutionResult, KernelError, KernelException, KernelLauncher, KernelSession, ReplyStatus};
use crate::config::DEFAULT_STARTUP_TIMEOUT;
use crate::kernelspec::KernelSpecManager;
use nbgolden_core::Output;

const LOCALHOST: &str = "127.0.0.1";
const CONNECT_RETRY: Duration = Duration::from_millis(100);
const KERNEL_INFO_RETRY: Duration = Duration::from_secs(2);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Launches kernels described by installed kernel specs.
#[derive(Debug, Clone)]
pub struct JupyterLauncher {
    manager: KernelSpecManager,
    ip: String,
    startup_timeout: Duration,
}

impl JupyterLauncher {
    pub fn new(manager: KernelSpecManager) -> Self {
        Self {
            manager,
            ip: LOCALHOST.to_string(),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
        }
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }
}

#[async_trait]
impl KernelLauncher for JupyterLauncher {
    #[tracing::instrument(skip(self))]
    async fn launch(&self, kernel_name: &str, working_dir: &Path) -> Result<Box<dyn KernelSession>, KernelError> {
        let resolved = self.manager.find(kernel_name)?;
        let runtime_dir = tempfile::Builder::new().prefix("nbgolden-runtime-").tempdir()?;
        let info = ConnectionInfo::allocate(&self.ip, &resolved.name)?;
        let connection_file = runtime_dir
            .path()
            .join(format!("kernel-{}.json", uuid::Uuid::new_v4()));
        info.write_to(&connection_file)?;

        let argv = resolved.spec.command_line(&connection_file);
        let launch_error = |source| KernelError::Launch {
            name: resolved.name.clone(),
            source,
        };
        let Some((program, args)) = argv.split_first() else {
            return Err(launch_error(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "kernel spec has an empty argv",
            )));
        };
        let child = Command::new(program)
            .args(args)
            .envs(&resolved.spec.env)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(launch_error)?;
        tracing::info!(kernel = %resolved.name, pid = ?child.id(), "kernel process started");

        let session = JupyterSession::connect(child, info, runtime_dir, self.startup_timeout).await?;
        Ok(Box::new(session))
    }
}

/// A running kernel process and its sockets.
pub struct JupyterSession {
    child: Child,
    shell: DealerSocket,
    control: DealerSocket,
    iopub: SubSocket,
    signer: Signer,
    session_id: String,
    shutdown_grace: Duration,
    // Holds the connection file until the session ends.
    _runtime_dir: TempDir,
}

impl JupyterSession {
    async fn connect(
        mut child: Child,
        info: ConnectionInfo,
        runtime_dir: TempDir,
        startup_timeout: Duration,
    ) -> Result<Self, KernelError> {
        let deadline = Instant::now() + startup_timeout;
        let mut shell = DealerSocket::new();
        let mut control = DealerSocket::new();
        let mut iopub = SubSocket::new();

        let shell_endpoint = info.endpoint(info.shell_port);
        let control_endpoint = info.endpoint(info.control_port);
        let iopub_endpoint = info.endpoint(info.iopub_port);
        connect_until(&mut shell, &shell_endpoint, &mut child, deadline, startup_timeout).await?;
        connect_until(&mut control, &control_endpoint, &mut child, deadline, startup_timeout).await?;
        connect_until(&mut iopub, &iopub_endpoint, &mut child, deadline, startup_timeout).await?;
        iopub.subscribe("").await?;

        let mut session = Self {
            child,
            shell,
            control,
            iopub,
            signer: Signer::new(&info.key),
            session_id: uuid::Uuid::new_v4().to_string(),
            shutdown_grace: SHUTDOWN_GRACE,
            _runtime_dir: runtime_dir,
        };
        session.wait_for_ready(deadline, startup_timeout).await?;
        Ok(session)
    }

    /// Repeat `kernel_info_request` until the kernel answers one on shell and iopub has delivered a `status`
    /// for one of them.
    ///
    /// The iopub check makes sure the SUB subscription is live before the first cell runs; otherwise its
    /// `idle` could be dropped.
    async fn wait_for_ready(&mut self, deadline: Instant, limit: Duration) -> Result<(), KernelError> {
        let mut requests: Vec<String> = Vec::new();
        let mut shell_ready = false;
        let mut iopub_ready = false;
        loop {
            let request = Message::new("kernel_info_request", &self.session_id, json!({}));
            requests.push(request.msg_id().to_string());
            let frames = wire::encode(&request, &self.signer)?;
            self.shell.send(to_zmq(frames)?).await?;
            let attempt_deadline = (Instant::now() + KERNEL_INFO_RETRY).min(deadline);

            loop {
                tokio::select! {
                    received = self.shell.recv() => {
                        let reply = wire::decode(received?.into_vec(), &self.signer)?;
                        shell_ready |= reply.msg_type() == "kernel_info_reply";
                    }
                    received = self.iopub.recv() => {
                        let msg = wire::decode(received?.into_vec(), &self.signer)?;
                        iopub_ready |= msg.msg_type() == "status"
                            && msg.parent_msg_id().is_some_and(|parent| requests.iter().any(|id| id == parent));
                    }
                    status = self.child.wait() => {
                        return Err(KernelError::Died(format!("exited with {} during startup", status?)));
                    }
                    () = tokio::time::sleep_until(attempt_deadline) => break,
                }
                if shell_ready && iopub_ready {
                    tracing::debug!(attempts = requests.len(), "kernel is ready");
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(KernelError::StartupTimeout(limit));
            }
            tracing::debug!(shell_ready, iopub_ready, "kernel not ready yet, retrying kernel_info_request");
        }
    }

    async fn collect(&mut self, msg_id: &str) -> Result<ExecutionResult, KernelError> {
        let mut collector = OutputCollector::default();
        let mut reply: Option<Value> = None;
        let mut idle = false;

        loop {
            if idle {
                if let Some(content) = reply.take() {
                    return Ok(finish(content, collector.outputs));
                }
            }
            tokio::select! {
                received = self.shell.recv() => {
                    let msg = wire::decode(received?.into_vec(), &self.signer)?;
                    if msg.is_reply_to(msg_id) && msg.msg_type() == "execute_reply" {
                        reply = Some(msg.content);
                    }
                }
                received = self.iopub.recv() => {
                    let msg = wire::decode(received?.into_vec(), &self.signer)?;
                    if msg.is_reply_to(msg_id) {
                        let msg_type = msg.header.msg_type;
                        idle |= collector.handle(&msg_type, msg.content);
                    }
                }
                status = self.child.wait() => {
                    return Err(KernelError::Died(format!("exited with {}", status?)));
                }
            }
        }
    }
}

#[async_trait]
impl KernelSession for JupyterSession {
    async fn execute(&mut self, code: &str, timeout: Duration) -> Result<ExecutionResult, KernelError> {
        let request = Message::new(
            "execute_request",
            &self.session_id,
            json!({
                "code": code,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            }),
        );
        let frames = wire::encode(&request, &self.signer)?;
        self.shell.send(to_zmq(frames)?).await?;

        match tokio::time::timeout(timeout, self.collect(request.msg_id())).await {
            Ok(result) => result,
            Err(_) => Err(KernelError::Timeout(timeout)),
        }
    }

    async fn shutdown(mut self: Box<Self>) -> Result<(), KernelError> {
        let request = Message::new("shutdown_request", &self.session_id, json!({ "restart": false }));
        let frames = wire::encode(&request, &self.signer)?;
        if let Err(e) = self.control.send(to_zmq(frames)?).await {
            tracing::warn!(error = %e, "failed to send shutdown_request");
        }

        match tokio::time::timeout(self.shutdown_grace, self.child.wait()).await {
            Ok(status) => {
                let status = status?;
                tracing::info!(%status, "kernel exited");
            }
            Err(_) => {
                tracing::warn!("kernel ignored shutdown_request, killing it");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

/// Connect `socket`, retrying until the kernel is listening.
async fn connect_until<S: Socket>(
    socket: &mut S,
    endpoint: &str,
    child: &mut Child,
    deadline: Instant,
    limit: Duration,
) -> Result<(), KernelError> {
    loop {
        tokio::select! {
            connected = socket.connect(endpoint) => match connected {
                Ok(()) => return Ok(()),
                Err(e) => tracing::debug!(endpoint, error = %e, "connect failed, retrying"),
            },
            status = child.wait() => {
                return Err(KernelError::Died(format!("exited with {} during startup", status?)));
            }
            () = tokio::time::sleep_until(deadline) => return Err(KernelError::StartupTimeout(limit)),
        }
        tokio::time::sleep(CONNECT_RETRY).await;
    }
}

fn to_zmq(frames: Vec<bytes::Bytes>) -> Result<ZmqMessage, KernelError> {
    ZmqMessage::try_from(frames).map_err(|_| wire::WireError::Empty.into())
}

/// Accumulates outputs from iopub, honoring `clear_output`.
#[derive(Debug, Default)]
struct OutputCollector {
    outputs: Vec<Output>,
    clear_pending: bool,
}

impl OutputCollector {
    /// Apply one iopub message. Returns `true` when it reports the kernel idle.
    fn handle(&mut self, msg_type: &str, content: Value) -> bool {
        match msg_type {
            "status" => return content.get("execution_state").and_then(Value::as_str) == Some("idle"),
            "clear_output" => {
                if content.get("wait").and_then(Value::as_bool).unwrap_or(false) {
                    self.clear_pending = true;
                } else {
                    self.outputs.clear();
                    self.clear_pending = false;
                }
            }
            "stream" | "display_data" | "execute_result" | "error" => {
                if std::mem::take(&mut self.clear_pending) {
                    self.outputs.clear();
                }
                self.outputs.push(output_from_content(msg_type, content));
            }
            _ => {}
        }
        false
    }
}

/// nbformat output for an iopub message.
fn output_from_content(msg_type: &str, content: Value) -> Output {
    let keys: &[&str] = match msg_type {
        "stream" => &["name", "text"],
        "display_data" => &["data", "metadata"],
        "execute_result" => &["data", "execution_count", "metadata"],
        "error" => &["ename", "evalue", "traceback"],
        _ => &[],
    };
    let mut content = match content {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    let mut fields = Map::new();
    for key in keys {
        if let Some(value) = content.remove(*key) {
            fields.insert((*key).to_string(), value);
        }
    }
    fields.insert("output_type".to_string(), Value::String(msg_type.to_string()));
    Output::from(fields)
}

fn finish(reply: Value, outputs: Vec<Output>) -> ExecutionResult {
    let execution_count = reply
        .get("execution_count")
        .and_then(Value::as_u64)
        .and_then(|n| u32::try_from(n).ok());
    let text = |key: &str| reply.get(key).and_then(Value::as_str).unwrap_or_default().to_string();
    let status = match reply.get("status").and_then(Value::as_str) {
        Some("error") => ReplyStatus::Error(KernelException {
            ename: text("ename"),
            evalue: text("evalue"),
            traceback: reply
                .get("traceback")
                .and_then(Value::as_array)
                .map(|lines| lines.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default(),
        }),
        Some("aborted") => ReplyStatus::Aborted,
        _ => ReplyStatus::Ok,
    };
    ExecutionResult {
        outputs,
        execution_count,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collects_outputs_until_idle() {
        let mut collector = OutputCollector::default();
        assert!(!collector.handle("status", json!({"execution_state": "busy"})));
        assert!(!collector.handle("execute_input", json!({"code": "1"})));
        collector.handle("stream", json!({"name": "stdout", "text": "hi\n"}));
        collector.handle(
            "execute_result",
            json!({"data": {"text/plain": "1"}, "metadata": {}, "execution_count": 3}),
        );
        assert!(collector.handle("status", json!({"execution_state": "idle"})));

        assert_eq!(collector.outputs.len(), 2);
        assert_eq!(collector.outputs[0], Output::stream("stdout", "hi\n"));
        assert_eq!(collector.outputs[1].output_type(), Some("execute_result"));
        assert_eq!(collector.outputs[1].get("execution_count"), Some(&json!(3)));
    }

    #[test]
    fn test_clear_output_immediate() {
        let mut collector = OutputCollector::default();
        collector.handle("stream", json!({"name": "stdout", "text": "a"}));
        collector.handle("clear_output", json!({"wait": false}));
        assert!(collector.outputs.is_empty());
    }

    #[test]
    fn test_clear_output_wait_defers_until_next_output() {
        let mut collector = OutputCollector::default();
        collector.handle("stream", json!({"name": "stdout", "text": "a"}));
        collector.handle("clear_output", json!({"wait": true}));
        assert_eq!(collector.outputs.len(), 1);
        collector.handle("stream", json!({"name": "stdout", "text": "b"}));
        assert_eq!(collector.outputs, vec![Output::stream("stdout", "b")]);
    }

    #[test]
    fn test_error_output_fields() {
        let output = output_from_content(
            "error",
            json!({"ename": "NameError", "evalue": "x", "traceback": ["t"], "engine_info": {}}),
        );
        assert_eq!(output.len(), 4);
        assert_eq!(output.get("ename"), Some(&json!("NameError")));
        assert!(output.get("engine_info").is_none());
    }

    #[test]
    fn test_finish_error_reply() {
        let result = finish(
            json!({"status": "error", "execution_count": 2, "ename": "ZeroDivisionError", "evalue": "division by zero", "traceback": ["a", "b"]}),
            vec![],
        );
        assert_eq!(result.execution_count, Some(2));
        assert_eq!(
            result.status,
            ReplyStatus::Error(KernelException {
                ename: "ZeroDivisionError".into(),
                evalue: "division by zero".into(),
                traceback: vec!["a".into(), "b".into()],
            })
        );
    }

    #[test]
    fn test_finish_ok_and_aborted() {
        assert_eq!(finish(json!({"status": "ok"}), vec![]).status, ReplyStatus::Ok);
        assert_eq!(finish(json!({"status": "aborted"}), vec![]).status, ReplyStatus::Aborted);
    }

    #[cfg(unix)]
    mod session {
        use super::*;
        use tokio::sync::mpsc;
        use zeromq::{PubSocket, RouterSocket};

        /// In-process stand-in for a kernel, bound on the ports of a connection file.
        struct FakeKernel {
            shell: RouterSocket,
            control: RouterSocket,
            iopub: PubSocket,
            signer: Signer,
            /// Whether iopub carries `status` messages for `kernel_info_request`.
            publishes_status: bool,
        }

        impl FakeKernel {
            async fn bind(info: &ConnectionInfo, publishes_status: bool) -> Self {
                let mut shell = RouterSocket::new();
                shell.bind(&info.endpoint(info.shell_port)).await.unwrap();
                let mut control = RouterSocket::new();
                control.bind(&info.endpoint(info.control_port)).await.unwrap();
                let mut iopub = PubSocket::new();
                iopub.bind(&info.endpoint(info.iopub_port)).await.unwrap();
                Self {
                    shell,
                    control,
                    iopub,
                    signer: Signer::new(&info.key),
                    publishes_status,
                }
            }

            fn frames(&self, msg: &Message) -> ZmqMessage {
                to_zmq(wire::encode(msg, &self.signer).unwrap()).unwrap()
            }

            async fn reply(&mut self, msg: &Message) {
                let frames = self.frames(msg);
                self.shell.send(frames).await.unwrap();
            }

            async fn publish(&mut self, msg: &Message) {
                let frames = self.frames(msg);
                self.iopub.send(frames).await.unwrap();
            }

            /// Answer shell and control requests; control message types are forwarded to `seen`.
            async fn serve(mut self, seen: mpsc::UnboundedSender<String>) {
                loop {
                    tokio::select! {
                        received = self.shell.recv() => {
                            let Ok(received) = received else { return };
                            let request = wire::decode(received.into_vec(), &self.signer).unwrap();
                            self.handle_shell(&request).await;
                        }
                        received = self.control.recv() => {
                            let Ok(received) = received else { return };
                            let request = wire::decode(received.into_vec(), &self.signer).unwrap();
                            let _ = seen.send(request.msg_type().to_string());
                            let reply = answer(&request, "shutdown_reply", json!({"status": "ok", "restart": false}));
                            let frames = self.frames(&reply);
                            self.control.send(frames).await.unwrap();
                        }
                    }
                }
            }

            async fn handle_shell(&mut self, request: &Message) {
                let busy = broadcast(request, "status", json!({"execution_state": "busy"}));
                let idle = broadcast(request, "status", json!({"execution_state": "idle"}));
                match request.msg_type() {
                    "kernel_info_request" => {
                        if self.publishes_status {
                            self.publish(&busy).await;
                        }
                        self.reply(&answer(request, "kernel_info_reply", json!({"status": "ok"}))).await;
                        if self.publishes_status {
                            self.publish(&idle).await;
                        }
                    }
                    "execute_request" => {
                        self.publish(&busy).await;
                        let mut foreign = broadcast(request, "stream", json!({"name": "stdout", "text": "noise\n"}));
                        foreign.parent_header = json!({"msg_id": "another-client"});
                        self.publish(&foreign).await;
                        self.publish(&broadcast(request, "stream", json!({"name": "stdout", "text": "42\n"})))
                            .await;
                        self.reply(&answer(request, "execute_reply", json!({"status": "ok", "execution_count": 1})))
                            .await;
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        self.publish(&broadcast(request, "stream", json!({"name": "stdout", "text": "late\n"})))
                            .await;
                        self.publish(&idle).await;
                    }
                    _ => {}
                }
            }
        }

        fn answer(request: &Message, msg_type: &str, content: Value) -> Message {
            let mut msg = Message::new(msg_type, &request.header.session, content);
            msg.identities = request.identities.clone();
            msg.parent_header = serde_json::to_value(&request.header).unwrap();
            msg
        }

        fn broadcast(request: &Message, msg_type: &str, content: Value) -> Message {
            let mut msg = answer(request, msg_type, content);
            msg.identities.clear();
            msg
        }

        fn idle_process() -> Child {
            Command::new("sleep").arg("30").kill_on_drop(true).spawn().unwrap()
        }

        async fn start_kernel(publishes_status: bool) -> (ConnectionInfo, mpsc::UnboundedReceiver<String>) {
            let info = ConnectionInfo::allocate(LOCALHOST, "fake").unwrap();
            let kernel = FakeKernel::bind(&info, publishes_status).await;
            let (seen_tx, seen_rx) = mpsc::unbounded_channel();
            tokio::spawn(kernel.serve(seen_tx));
            (info, seen_rx)
        }

        #[tokio::test]
        async fn test_execute_waits_for_reply_and_idle() {
            let (info, mut seen) = start_kernel(true).await;
            let runtime_dir = tempfile::tempdir().unwrap();
            let mut session = JupyterSession::connect(idle_process(), info, runtime_dir, Duration::from_secs(20))
                .await
                .unwrap();
            session.shutdown_grace = Duration::from_millis(100);

            let result = session.execute("print(42)", Duration::from_secs(10)).await.unwrap();
            assert_eq!(result.status, ReplyStatus::Ok);
            assert_eq!(result.execution_count, Some(1));
            // "noise" belongs to another request; "late" arrives after the reply but before idle.
            assert_eq!(
                result.outputs,
                vec![Output::stream("stdout", "42\n"), Output::stream("stdout", "late\n")]
            );

            Box::new(session).shutdown().await.unwrap();
            assert_eq!(seen.recv().await.as_deref(), Some("shutdown_request"));
        }

        #[tokio::test]
        async fn test_ready_requires_iopub_status() {
            let (info, _seen) = start_kernel(false).await;
            let runtime_dir = tempfile::tempdir().unwrap();
            let err = JupyterSession::connect(idle_process(), info, runtime_dir, Duration::from_secs(1))
                .await
                .err()
                .unwrap();
            assert!(matches!(err, KernelError::StartupTimeout(limit) if limit == Duration::from_secs(1)));
        }

        #[tokio::test]
        async fn test_kernel_exit_during_startup() {
            let info = ConnectionInfo::allocate(LOCALHOST, "fake").unwrap();
            let child = Command::new("true").kill_on_drop(true).spawn().unwrap();
            let runtime_dir = tempfile::tempdir().unwrap();
            let err = JupyterSession::connect(child, info, runtime_dir, Duration::from_secs(10))
                .await
                .err()
                .unwrap();
            assert!(matches!(err, KernelError::Died(_)));
        }
    }
}
