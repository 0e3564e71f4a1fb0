use std::{future::Future, time::Duration};

#[cfg(not(any(feature = "tokio", feature = "smol")))]
compile_error!("trammel needs an async runtime: enable the `tokio` or `smol` feature");

#[cfg(feature = "tokio")]
pub(crate) async fn sleep(d: Duration) {
    tokio::time::sleep(d).await;
}

#[cfg(all(feature = "smol", not(feature = "tokio")))]
pub(crate) async fn sleep(d: Duration) {
    smol::Timer::after(d).await;
}

/// Spawn a detached task. Returns `false` when there is no runtime to run it on.
#[cfg(feature = "tokio")]
pub(crate) fn spawn_task<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(fut);
            true
        }
        Err(_) => false,
    }
}

#[cfg(all(feature = "smol", not(feature = "tokio")))]
pub(crate) fn spawn_task<F>(fut: F) -> bool
where
    F: Future<Output = ()> + Send + 'static,
{
    smol::spawn(fut).detach();
    true
}
