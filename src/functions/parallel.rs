use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::structures::Error;

/// Runs `execute` for each element of `inputs`, processing at most
/// `num_workers` at a time. Outputs keep the position of their inputs.
///
/// When a worker errors, the token passed to the other workers is cancelled
/// and the in-flight ones are awaited (not dropped) before the error is
/// returned. The first real error wins; workers that merely reported the
/// triggered cancellation don't mask it. Workers should return
/// `Error::Cancelled` when they stop because of the token.
pub async fn do_in_parallel_with_result<T, U, F, Fut>(
  cancel: &CancellationToken,
  num_workers: usize,
  inputs: Vec<T>,
  execute: F,
) -> Result<Vec<U>, Error>
where
  U: Send + 'static,
  F: Fn(CancellationToken, T) -> Fut,
  Fut: Future<Output = Result<U, Error>> + Send + 'static,
{
  let child = cancel.child_token();
  let semaphore = Arc::new(Semaphore::new(num_workers.max(1)));
  let total = inputs.len();
  let mut set: JoinSet<(usize, Result<U, Error>)> = JoinSet::new();
  for (idx, input) in inputs.into_iter().enumerate() {
    let semaphore = semaphore.clone();
    let future = execute(child.clone(), input);
    set.spawn(async move {
      let _permit = semaphore
        .acquire_owned()
        .await
        .expect("semaphore is never closed");
      (idx, future.await)
    });
  }

  let mut outputs: Vec<Option<U>> = Vec::with_capacity(total);
  outputs.resize_with(total, || None);
  let mut first_error: Option<Error> = None;
  let mut cancelled = false;
  while let Some(joined) = set.join_next().await {
    match joined {
      Ok((idx, Ok(output))) => outputs[idx] = Some(output),
      Ok((_, Err(e))) => {
        child.cancel();
        if e.is_cancellation() {
          cancelled = true;
        } else if first_error.is_none() {
          first_error = Some(e);
        }
      }
      Err(join_error) => {
        child.cancel();
        if first_error.is_none() {
          first_error = Some(Error::io(
            "parallel worker panicked",
            std::io::Error::other(join_error),
          ));
        }
      }
    }
  }
  if let Some(e) = first_error {
    return Err(e);
  }
  if cancelled {
    return Err(Error::Cancelled);
  }
  Ok(
    outputs
      .into_iter()
      .map(|o| o.expect("every successful worker produced an output"))
      .collect(),
  )
}

/// Like `do_in_parallel_with_result` but without collecting results.
pub async fn do_in_parallel<T, F, Fut>(
  cancel: &CancellationToken,
  num_workers: usize,
  inputs: Vec<T>,
  execute: F,
) -> Result<(), Error>
where
  F: Fn(CancellationToken, T) -> Fut,
  Fut: Future<Output = Result<(), Error>> + Send + 'static,
{
  do_in_parallel_with_result(cancel, num_workers, inputs, execute)
    .await
    .map(|_| ())
}
