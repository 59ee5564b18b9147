// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::error;

use crate::error::BoxError;

pub type TaskSet = JoinSet<Result<(), BoxError>>;

pub async fn wait_for_any_task(tasks: &mut TaskSet) -> Result<(), BoxError> {
    match tasks.join_next().await {
        None => Ok(()),
        Some(res) => res?,
    }
}

pub async fn wait_for_tasks_with_timeout(
    tasks: &mut TaskSet,
    timeout: Duration,
) -> Result<(), BoxError> {
    wait_for_tasks_with_deadline(tasks, Instant::now() + timeout).await
}

pub async fn wait_for_tasks_with_deadline(
    tasks: &mut TaskSet,
    stop_at: Instant,
) -> Result<(), BoxError> {
    let mut result = Ok(());
    loop {
        match timeout_at(stop_at, tasks.join_next()).await {
            Err(_) => {
                result = Err("timed out waiting for tasks to complete".into());
                break;
            }
            Ok(None) => break,
            Ok(Some(v)) => match v {
                Ok(Ok(())) => {}
                Ok(Err(e)) => result = Err(e),
                Err(e) => error!("Failed to join with task: {:?}", e),
            },
        }
    }

    result
}
