//! Pod log streaming for managed clusters.

use std::io::ErrorKind;

use futures::AsyncBufRead;
use futures::AsyncRead;
use futures::AsyncWrite;
use k8s_openapi::api::core::v1::Pod;
use kube::api::LogParams;
use kube::Api;
use kube::Client;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogOptions {
    pub container: Option<String>,
    /// Keep the stream open and deliver new lines as they are written.
    pub follow: bool,
    /// Only the last `n` lines; all lines when `None`.
    pub tail_lines: Option<i64>,
}

impl From<&LogOptions> for LogParams {
    fn from(options: &LogOptions) -> Self {
        LogParams {
            container: options.container.clone(),
            follow: options.follow,
            tail_lines: options.tail_lines,
            ..Default::default()
        }
    }
}

/// Opens the log stream of `pod` in `namespace`.
pub async fn stream_logs(
    client: Client,
    namespace: &str,
    pod: &str,
    options: &LogOptions,
) -> Result<impl AsyncBufRead> {
    let pods: Api<Pod> = Api::namespaced(client, namespace);
    Ok(pods.log_stream(pod, &LogParams::from(options)).await?)
}

/// Copies `logs` into `writer` until the stream ends.
///
/// A client that goes away (broken pipe) and `cancel` firing both end the copy without
/// error; any other I/O failure is returned.
pub async fn copy_logs<R, W>(logs: R, writer: &mut W, cancel: &CancellationToken) -> Result<()>
where
    R: AsyncRead,
    W: AsyncWrite + Unpin + ?Sized,
{
    tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("Log stream cancelled");
            Ok(())
        }
        copied = futures::io::copy(logs, writer) => match copied {
            Ok(bytes) => {
                tracing::debug!(bytes, "Log stream finished");
                Ok(())
            }
            Err(error) if matches!(error.kind(), ErrorKind::BrokenPipe | ErrorKind::ConnectionReset) => {
                tracing::debug!(error = %error, "Log client went away");
                Ok(())
            }
            Err(error) => Err(error.into()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::io;
    use std::pin::Pin;
    use std::task::Context;
    use std::task::Poll;
    use std::time::Duration;

    use futures::io::Cursor;

    /// Writer failing every write with `kind`.
    struct FailingWriter(ErrorKind);

    impl AsyncWrite for FailingWriter {
        fn poll_write(self: Pin<&mut Self>, _: &mut Context<'_>, _: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(self.0)))
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Reader that never produces data, like a followed log of an idle container.
    struct IdleReader;

    impl AsyncRead for IdleReader {
        fn poll_read(self: Pin<&mut Self>, _: &mut Context<'_>, _: &mut [u8]) -> Poll<io::Result<usize>> {
            Poll::Pending
        }
    }

    #[test]
    fn test_options_become_log_params() {
        let options = LogOptions {
            container: Some("app".to_owned()),
            follow: true,
            tail_lines: Some(100),
        };

        let params = LogParams::from(&options);

        assert_eq!(params.container.as_deref(), Some("app"));
        assert!(params.follow);
        assert_eq!(params.tail_lines, Some(100));
        assert!(!params.timestamps);
    }

    #[tokio::test]
    async fn test_copy_delivers_all_bytes() {
        let logs = Cursor::new(b"line 1\nline 2\n".to_vec());
        let mut out = Vec::new();

        copy_logs(logs, &mut out, &CancellationToken::new()).await.unwrap();

        assert_eq!(out, b"line 1\nline 2\n");
    }

    #[tokio::test]
    async fn test_broken_pipe_is_clean_termination() {
        // Given: A client that disconnected
        let logs = Cursor::new(b"line 1\n".to_vec());
        let mut out = FailingWriter(ErrorKind::BrokenPipe);

        // When: Copying logs to it
        let result = copy_logs(logs, &mut out, &CancellationToken::new()).await;

        // Then: The copy ends without error
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_other_write_errors_are_reported() {
        let logs = Cursor::new(b"line 1\n".to_vec());
        let mut out = FailingWriter(ErrorKind::PermissionDenied);

        let result = copy_logs(logs, &mut out, &CancellationToken::new()).await;

        assert!(matches!(result, Err(Error::Io(error)) if error.kind() == ErrorKind::PermissionDenied));
    }

    #[tokio::test]
    async fn test_cancellation_ends_followed_stream() {
        // Given: A followed stream that stays idle
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let mut out = Vec::new();

        // When: The request is cancelled
        let result = tokio::time::timeout(Duration::from_secs(5), copy_logs(IdleReader, &mut out, &cancel))
            .await
            .expect("copy should stop on cancellation");

        // Then: It ends cleanly
        assert!(result.is_ok());
        assert!(out.is_empty());
    }
}
