//! Interactive exec sessions over a message-framed client transport.
//!
//! The client exchanges JSON frames of the form
//! `{"type": "stdin"|"resize"|"stdout"|"toast", "data": "...", "rows": 0, "cols": 0}`.
//! `stdin` and `resize` flow from the client, `stdout` and `toast` flow to it. The bridge
//! turns that into the byte streams and terminal size events of a `pods/exec` session.

use std::fmt::Display;
use std::time::Duration;

use futures::channel::mpsc;
use futures::Sink;
use futures::SinkExt;
use futures::Stream;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::api::TerminalSize;
use kube::Api;
use kube::Client;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;

use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::error::Result;

pub const STDIN: &str = "stdin";
pub const RESIZE: &str = "resize";
pub const STDOUT: &str = "stdout";
pub const TOAST: &str = "toast";

const READ_BUFFER_SIZE: usize = 4096;

/// One frame on the client transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub rows: u16,
    #[serde(default)]
    pub cols: u16,
}

impl TerminalMessage {
    pub fn stdout(data: impl Into<String>) -> Self {
        Self {
            kind: STDOUT.to_owned(),
            data: data.into(),
            ..Default::default()
        }
    }

    /// Out-of-band notice shown to the user.
    pub fn toast(data: impl Into<String>) -> Self {
        Self {
            kind: TOAST.to_owned(),
            data: data.into(),
            ..Default::default()
        }
    }
}

/// Terminal size as sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub rows: u16,
    pub cols: u16,
}

impl From<Dimensions> for TerminalSize {
    fn from(dimensions: Dimensions) -> Self {
        TerminalSize {
            width: dimensions.cols,
            height: dimensions.rows,
        }
    }
}

/// A decoded client frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Stdin(Vec<u8>),
    Resize(Dimensions),
}

impl Inbound {
    pub fn decode(frame: &str) -> std::result::Result<Self, BridgeError> {
        let message: TerminalMessage = serde_json::from_str(frame)?;
        match message.kind.as_str() {
            STDIN => Ok(Inbound::Stdin(message.data.into_bytes())),
            RESIZE => Ok(Inbound::Resize(Dimensions {
                rows: message.rows,
                cols: message.cols,
            })),
            _ => Err(BridgeError::UnknownMessageType(message.kind)),
        }
    }
}

/// Target container of an exec or log session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTarget {
    pub namespace: String,
    pub pod: String,
    /// `None` selects the pod's only (or default) container.
    pub container: Option<String>,
}

impl PodTarget {
    pub fn new(namespace: impl Into<String>, pod: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            pod: pod.into(),
            container: None,
        }
    }

    pub fn container(mut self, container: impl Into<String>) -> Self {
        self.container = Some(container.into());
        self
    }
}

/// Latest-wins channel of terminal sizes. A newer size overwrites one not yet taken, and
/// the receiving side ends once every [TerminalSizeSender] is gone.
pub fn terminal_sizes() -> (TerminalSizeSender, TerminalSizes) {
    let (sender, receiver) = watch::channel(None);
    (TerminalSizeSender(sender), TerminalSizes(receiver))
}

pub struct TerminalSizeSender(watch::Sender<Option<Dimensions>>);

impl TerminalSizeSender {
    pub fn push(&self, size: Dimensions) {
        self.0.send_replace(Some(size));
    }
}

pub struct TerminalSizes(watch::Receiver<Option<Dimensions>>);

impl TerminalSizes {
    /// Waits for the next size. Returns `None` once the sender is dropped and drained.
    pub async fn next(&mut self) -> Option<Dimensions> {
        loop {
            self.0.changed().await.ok()?;
            if let Some(size) = *self.0.borrow_and_update() {
                return Some(size);
            }
        }
    }
}

/// Decodes client frames, one per call, routing resize frames into a [TerminalSizeSender].
pub struct FrameReader<S> {
    inbound: S,
    sizes: TerminalSizeSender,
}

impl<S, E> FrameReader<S>
where
    S: Stream<Item = std::result::Result<String, E>> + Unpin,
    E: Display,
{
    pub fn new(inbound: S, sizes: TerminalSizeSender) -> Self {
        Self { inbound, sizes }
    }

    /// Reads exactly one frame. `None` means the client closed the transport.
    pub async fn read(&mut self) -> std::result::Result<Option<Inbound>, BridgeError> {
        let Some(frame) = self.inbound.next().await else {
            return Ok(None);
        };
        let frame = frame.map_err(|error| BridgeError::Transport(error.to_string()))?;

        let inbound = Inbound::decode(&frame)?;
        if let Inbound::Resize(size) = inbound {
            self.sizes.push(size);
        }
        Ok(Some(inbound))
    }
}

/// Encodes process output into `stdout` frames, each bounded by a write deadline.
///
/// Multi-byte UTF-8 sequences split across reads are held back until complete.
pub struct FrameWriter<K> {
    outbound: K,
    deadline: Duration,
    carry: Vec<u8>,
}

impl<K> FrameWriter<K>
where
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    pub fn new(outbound: K, deadline: Duration) -> Self {
        Self {
            outbound,
            deadline,
            carry: Vec::new(),
        }
    }

    pub async fn write_stdout(&mut self, bytes: &[u8]) -> std::result::Result<(), BridgeError> {
        self.carry.extend_from_slice(bytes);
        let text = take_complete_utf8(&mut self.carry);
        if text.is_empty() {
            return Ok(());
        }
        self.send(&TerminalMessage::stdout(text)).await
    }

    pub async fn toast(&mut self, message: impl Into<String>) -> std::result::Result<(), BridgeError> {
        self.send(&TerminalMessage::toast(message)).await
    }

    /// Flushes held back bytes, replacing an incomplete trailing sequence.
    pub async fn finish(&mut self) -> std::result::Result<(), BridgeError> {
        if self.carry.is_empty() {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&self.carry).into_owned();
        self.carry.clear();
        self.send(&TerminalMessage::stdout(text)).await
    }

    async fn send(&mut self, message: &TerminalMessage) -> std::result::Result<(), BridgeError> {
        let frame = serde_json::to_string(message)?;
        match tokio::time::timeout(self.deadline, self.outbound.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(error)) => Err(BridgeError::Transport(error.to_string())),
            Err(_) => Err(BridgeError::WriteTimeout(self.deadline)),
        }
    }
}

/// Drains the longest prefix of `buf` that does not end inside a UTF-8 sequence.
/// Invalid bytes elsewhere are replaced.
fn take_complete_utf8(buf: &mut Vec<u8>) -> String {
    let complete = match std::str::from_utf8(buf) {
        Err(error) if error.error_len().is_none() => error.valid_up_to(),
        _ => buf.len(),
    };
    let rest = buf.split_off(complete);
    let text = String::from_utf8_lossy(buf).into_owned();
    *buf = rest;
    text
}

async fn pump_stdin<S, E, I>(reader: &mut FrameReader<S>, mut stdin: I) -> std::result::Result<(), BridgeError>
where
    S: Stream<Item = std::result::Result<String, E>> + Unpin,
    E: Display,
    I: AsyncWrite + Unpin,
{
    while let Some(inbound) = reader.read().await? {
        if let Inbound::Stdin(bytes) = inbound {
            stdin
                .write_all(&bytes)
                .await
                .map_err(|error| BridgeError::Transport(error.to_string()))?;
            stdin
                .flush()
                .await
                .map_err(|error| BridgeError::Transport(error.to_string()))?;
        }
    }
    tracing::debug!("Client closed the session");
    Ok(())
}

async fn pump_stdout<O, K>(mut stdout: O, writer: &mut FrameWriter<K>) -> std::result::Result<(), BridgeError>
where
    O: AsyncRead + Unpin,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = stdout
            .read(&mut buf)
            .await
            .map_err(|error| BridgeError::Transport(error.to_string()))?;
        if n == 0 {
            tracing::debug!("Remote process closed stdout");
            return writer.finish().await;
        }
        writer.write_stdout(&buf[..n]).await?;
    }
}

async fn pump_resize(mut sizes: TerminalSizes, mut resize: mpsc::Sender<TerminalSize>) {
    while let Some(size) = sizes.next().await {
        if resize.send(size.into()).await.is_err() {
            tracing::debug!("Remote process stopped accepting terminal sizes");
            break;
        }
    }
}

/// Connects a client transport to a running process until either side finishes.
///
/// Ends with `Ok` when the client closes the transport or the process closes stdout, and
/// with an error on a malformed or unknown frame, a failed write or an expired deadline.
pub async fn bridge<S, E, K, I, O>(
    inbound: S,
    outbound: K,
    stdin: I,
    stdout: O,
    resize: Option<mpsc::Sender<TerminalSize>>,
    write_deadline: Duration,
) -> std::result::Result<(), BridgeError>
where
    S: Stream<Item = std::result::Result<String, E>> + Unpin,
    E: Display,
    K: Sink<String> + Unpin,
    K::Error: Display,
    I: AsyncWrite + Unpin,
    O: AsyncRead + Unpin,
{
    let (sizes, resized) = terminal_sizes();
    let mut reader = FrameReader::new(inbound, sizes);
    let mut writer = FrameWriter::new(outbound, write_deadline);

    let resize_pump = async {
        if let Some(resize) = resize {
            pump_resize(resized, resize).await;
        }
        futures::future::pending::<()>().await
    };

    let result = tokio::select! {
        result = pump_stdin(&mut reader, stdin) => result,
        result = pump_stdout(stdout, &mut writer) => result,
        _ = resize_pump => Ok(()),
    };

    result
}

/// Opens an interactive shell in `target` and bridges it to the client transport.
#[tracing::instrument(skip_all, fields(namespace = %target.namespace, pod = %target.pod))]
pub async fn exec<S, E, K>(client: Client, target: &PodTarget, inbound: S, outbound: K, config: &BridgeConfig) -> Result<()>
where
    S: Stream<Item = std::result::Result<String, E>> + Unpin,
    E: Display,
    K: Sink<String> + Unpin,
    K::Error: Display,
{
    let pods: Api<Pod> = Api::namespaced(client, &target.namespace);
    let mut params = AttachParams::interactive_tty();
    if let Some(container) = &target.container {
        params = params.container(container.as_str());
    }

    let mut attached = pods.exec(&target.pod, config.shell.clone(), &params).await?;
    let stdin = attached.stdin().ok_or(BridgeError::MissingStream("stdin"))?;
    let stdout = attached.stdout().ok_or(BridgeError::MissingStream("stdout"))?;
    let resize = attached.terminal_size();

    tracing::info!("Exec session started");
    let result = bridge(inbound, outbound, stdin, stdout, resize, config.write_deadline()).await;
    attached.abort();

    match &result {
        Ok(()) => tracing::info!("Exec session ended"),
        Err(error) => tracing::warn!(error = %error, "Exec session failed"),
    }
    Ok(result?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    use tokio::io::DuplexStream;
    use tokio::task::JoinHandle;

    type Inbox = mpsc::UnboundedSender<String>;

    struct Session {
        client: Inbox,
        frames: mpsc::Receiver<String>,
        process_stdin: DuplexStream,
        process_stdout: DuplexStream,
        sizes: mpsc::Receiver<TerminalSize>,
        handle: JoinHandle<std::result::Result<(), BridgeError>>,
    }

    fn session() -> Session {
        let (client, inbound) = mpsc::unbounded::<String>();
        let (outbound, frames) = mpsc::channel::<String>(16);
        let (stdin, process_stdin) = tokio::io::duplex(1024);
        let (process_stdout, stdout) = tokio::io::duplex(1024);
        let (resize, sizes) = mpsc::channel::<TerminalSize>(1);

        let handle = tokio::spawn(bridge(
            inbound.map(Ok::<_, Infallible>),
            outbound,
            stdin,
            stdout,
            Some(resize),
            Duration::from_secs(10),
        ));

        Session {
            client,
            frames,
            process_stdin,
            process_stdout,
            sizes,
            handle,
        }
    }

    #[test]
    fn test_decode_frames() {
        assert_eq!(
            Inbound::decode(r#"{"type":"stdin","data":"ls\n"}"#).unwrap(),
            Inbound::Stdin(b"ls\n".to_vec())
        );
        assert_eq!(
            Inbound::decode(r#"{"type":"resize","rows":40,"cols":120}"#).unwrap(),
            Inbound::Resize(Dimensions { rows: 40, cols: 120 })
        );
        assert!(matches!(
            Inbound::decode(r#"{"type":"stdout","data":"x"}"#),
            Err(BridgeError::UnknownMessageType(kind)) if kind == "stdout"
        ));
        assert!(matches!(Inbound::decode("not json"), Err(BridgeError::Decode(_))));
    }

    #[test]
    fn test_outbound_frame_shape() {
        let json: serde_json::Value = serde_json::to_value(TerminalMessage::toast("session closed")).unwrap();

        assert_eq!(json["type"], "toast");
        assert_eq!(json["data"], "session closed");
        assert_eq!(json["rows"], 0);
    }

    #[test]
    fn test_utf8_sequences_are_not_split() {
        // Given: "é" (0xC3 0xA9) cut after its first byte
        let mut buf = b"caf\xC3".to_vec();

        // When/Then: Only the complete prefix is released
        assert_eq!(take_complete_utf8(&mut buf), "caf");
        assert_eq!(buf, vec![0xC3]);

        buf.extend_from_slice(b"\xA9!");
        assert_eq!(take_complete_utf8(&mut buf), "é!");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_bytes_are_replaced() {
        let mut buf = b"a\xFFb".to_vec();

        assert_eq!(take_complete_utf8(&mut buf), "a\u{FFFD}b");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_terminal_sizes_keep_latest() {
        let (sizes, mut resized) = terminal_sizes();

        sizes.push(Dimensions { rows: 24, cols: 80 });
        sizes.push(Dimensions { rows: 40, cols: 120 });
        drop(sizes);

        assert_eq!(resized.next().await, Some(Dimensions { rows: 40, cols: 120 }));
        assert_eq!(resized.next().await, None);
    }

    #[tokio::test]
    async fn test_terminal_sizes_wait_for_next_push() {
        let (sizes, mut resized) = terminal_sizes();
        sizes.push(Dimensions { rows: 24, cols: 80 });
        assert_eq!(resized.next().await, Some(Dimensions { rows: 24, cols: 80 }));

        let waiting = tokio::spawn(async move { resized.next().await });
        tokio::task::yield_now().await;
        assert!(!waiting.is_finished());
        sizes.push(Dimensions { rows: 50, cols: 200 });

        assert_eq!(waiting.await.unwrap(), Some(Dimensions { rows: 50, cols: 200 }));
    }

    #[tokio::test]
    async fn test_resize_reaches_exec_protocol() {
        // Given: A running session
        let mut session = session();

        // When: The client resizes its terminal mid-session
        session
            .client
            .unbounded_send(r#"{"type":"resize","rows":40,"cols":120}"#.to_owned())
            .unwrap();

        // Then: The next terminal size requested by the exec protocol carries it
        let size = session.sizes.next().await.unwrap();
        assert_eq!((size.width, size.height), (120, 40));
    }

    #[tokio::test]
    async fn test_stdin_is_forwarded_byte_for_byte() {
        let mut session = session();

        session
            .client
            .unbounded_send(r#"{"type":"stdin","data":"ls\n"}"#.to_owned())
            .unwrap();

        let mut received = [0u8; 3];
        session.process_stdin.read_exact(&mut received).await.unwrap();
        assert_eq!(&received, b"ls\n");
    }

    #[tokio::test]
    async fn test_process_output_becomes_stdout_frames() {
        // Given: A session whose process writes a multi-byte character in two pieces
        let mut session = session();
        session.process_stdout.write_all(b"h\xC3").await.unwrap();
        session.process_stdout.flush().await.unwrap();
        tokio::task::yield_now().await;
        session.process_stdout.write_all(b"\xA9llo").await.unwrap();

        // When: The process exits
        drop(session.process_stdout);
        let result = session.handle.await.unwrap();

        // Then: Every frame is a stdout frame and the text arrives intact
        assert!(result.is_ok());
        let mut text = String::new();
        while let Some(frame) = session.frames.next().await {
            let message: TerminalMessage = serde_json::from_str(&frame).unwrap();
            assert_eq!(message.kind, STDOUT);
            text.push_str(&message.data);
        }
        assert_eq!(text, "h\u{e9}llo");
    }

    #[tokio::test]
    async fn test_unknown_frame_ends_session() {
        let session = session();

        session
            .client
            .unbounded_send(r#"{"type":"paste","data":"x"}"#.to_owned())
            .unwrap();

        let result = session.handle.await.unwrap();
        assert_eq!(result.unwrap_err().to_string(), "unknown message type 'paste'");
    }

    #[tokio::test]
    async fn test_client_close_ends_session() {
        let session = session();

        drop(session.client);

        assert!(session.handle.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_client_hits_write_deadline() {
        // Given: A client that never reads its frames
        let (outbound, _frames) = mpsc::channel::<String>(0);
        let mut writer = FrameWriter::new(outbound, Duration::from_secs(10));

        // When: Output keeps coming
        writer.write_stdout(b"first").await.unwrap();
        let result = writer.write_stdout(b"second").await;

        // Then: The write gives up after the deadline
        assert!(matches!(result, Err(BridgeError::WriteTimeout(deadline)) if deadline == Duration::from_secs(10)));
    }
}
