//! Once an execution has finished, the process-wide hub leaves signals to
//! whoever else handles them in the host process.
//!
//! Own test binary: the hub's handlers are process-global.

use std::time::Duration;

use fgexec::{ExecRequest, ParentEvents};
use nix::sys::signal::{Signal, raise};
use tokio::signal::unix::{SignalKind, signal};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn host_handler_survives_an_idle_hub() {
    let mut host_usr2 = signal(SignalKind::user_defined2()).unwrap();

    let result = fgexec::exec(&ExecRequest::new("true", Vec::<String>::new()))
        .await
        .unwrap();
    assert_eq!(result.status, Some(0));
    assert_eq!(ParentEvents::process().listener_count(), 0);

    raise(Signal::SIGUSR2).unwrap();
    tokio::time::timeout(Duration::from_secs(5), host_usr2.recv())
        .await
        .expect("host handler saw the signal");

    // Give the hub's own handler time to run; the process must still be here.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(ParentEvents::process().listener_count(), 0);
}
