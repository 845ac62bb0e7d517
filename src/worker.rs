//! Worker-process side of the job protocol.
//!
//! A worker handles exactly one job: it reads one framed [`ProcessInput`]
//! from stdin, runs the handler, writes one framed [`ProcessOutput`] to stdout
//! and returns so the process can exit. Errors and panics inside the handler
//! become [`Outcome::Error`]; only a broken pipe to the coordinator is fatal.

use std::future::Future;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error};

use crate::transport::{read_frame, write_frame, Outcome, ProcessInput, ProcessOutput};

/// Serve one job over the process's stdin/stdout.
pub async fn serve_stdio<J, T, F, Fut>(handler: F) -> Result<()>
where
    J: DeserializeOwned,
    T: Serialize + Send + 'static,
    F: FnOnce(J) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();
    serve_one(&mut stdin, &mut stdout, handler).await
}

/// Serve one job over arbitrary streams.
pub async fn serve_one<R, W, J, T, F, Fut>(reader: &mut R, writer: &mut W, handler: F) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    J: DeserializeOwned,
    T: Serialize + Send + 'static,
    F: FnOnce(J) -> Fut,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    let input: ProcessInput<J> = read_frame(reader)
        .await
        .context("Failed to read job from coordinator")?;
    let job_id = input.job_id;

    debug!(job_id, "Worker running job");

    // Run on its own task so a panic is observed as a JoinError.
    let outcome = match tokio::spawn(handler(input.job)).await {
        Ok(Ok(value)) => Outcome::Ok { value },
        Ok(Err(e)) => {
            error!(job_id, error = %format!("{e:#}"), "Job failed");
            Outcome::Error {
                message: format!("{e:#}"),
            }
        }
        Err(e) => {
            let message = panic_message(e);
            error!(job_id, %message, "Job panicked");
            Outcome::Error { message }
        }
    };

    write_frame(writer, &ProcessOutput { job_id, outcome })
        .await
        .context("Failed to send job result to coordinator")
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .map_or_else(|| "job panicked".to_string(), |s| format!("job panicked: {s}")),
        Err(err) => format!("job aborted: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_job<F, Fut>(job: u32, handler: F) -> ProcessOutput<u32>
    where
        F: FnOnce(u32) -> Fut,
        Fut: Future<Output = anyhow::Result<u32>> + Send + 'static,
    {
        let mut request = Vec::new();
        write_frame(&mut request, &ProcessInput { job_id: 42, job })
            .await
            .unwrap();

        let mut reader = std::io::Cursor::new(request);
        let mut reply = Vec::new();
        serve_one(&mut reader, &mut reply, handler).await.unwrap();

        let mut cursor = std::io::Cursor::new(reply);
        read_frame(&mut cursor).await.unwrap()
    }

    #[tokio::test]
    async fn value_is_reported() {
        let output = run_job(20, |n| async move { Ok::<_, anyhow::Error>(n + 1) }).await;
        assert_eq!(output.job_id, 42);
        assert!(matches!(output.outcome, Outcome::Ok { value: 21 }));
    }

    #[tokio::test]
    async fn error_is_reported_as_data() {
        let output = run_job(0, |_| async { Err::<u32, _>(anyhow::anyhow!("no such result")) }).await;
        match output.outcome {
            Outcome::Error { message } => assert_eq!(message, "no such result"),
            Outcome::Ok { .. } => panic!("expected an error outcome"),
        }
    }

    #[tokio::test]
    async fn panic_is_reported_as_data() {
        let output = run_job(0, |n| async move {
            assert!(n > 0, "worker bug");
            Ok::<_, anyhow::Error>(n)
        }).await;
        match output.outcome {
            Outcome::Error { message } => assert!(message.contains("worker bug")),
            Outcome::Ok { .. } => panic!("expected an error outcome"),
        }
    }
}
