// this_file: src/tasks.rs

//! Fire-and-forget task helper.
//!
//! Broadcast dispatches and lifecycle callbacks are launched without being
//! awaited; their failures are funneled through one logging hook so no
//! error is silently dropped. The runtime keeps detached tasks alive until
//! they finish.

use crate::error::Result;
use std::future::Future;
use tokio::task::JoinHandle;

/// Spawn `future`, logging its error (if any) under `label`.
pub(crate) fn spawn_logged<F>(label: &'static str, future: F) -> JoinHandle<()>
where
    F: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(error) = future.await {
            log::error!("{}: {}", label, error);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn completes_ok_and_err_futures() {
        spawn_logged("ok task", async { Ok(()) }).await.unwrap();
        spawn_logged("failing task", async {
            Err(Error::Backend("boom".to_string()))
        })
        .await
        .unwrap();
    }
}
