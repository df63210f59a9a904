use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Notify;

use crate::config::Config;
use crate::discovery::DiscoveredClass;
use crate::reporter::Reporter;
use crate::router;
use crate::scheduler::Scheduler;
use crate::time::SystemTime;

/// Drive a whole dispatch run: enqueue the discovered classes, serve
/// runners until the scheduler stops the loop, then collect the reporters'
/// verdict.
///
/// When discovery fails nothing is served, but reporters still get their
/// final say; the run passes only if every reporter does.
pub async fn run<D>(
    config: Config,
    discover: D,
    reporters: Vec<Arc<dyn Reporter>>,
    listener: TcpListener,
) -> bool
where
    D: FnOnce() -> anyhow::Result<Vec<DiscoveredClass>>,
{
    let stopper = Arc::new(Notify::new());
    let scheduler = Arc::new(Scheduler::new(
        &config,
        reporters,
        Box::new(SystemTime {}),
        stopper.clone(),
    ));

    match discover() {
        Ok(classes) => {
            scheduler.enqueue_discovered(classes);
            scheduler.clone().start_inactivity_timer();

            let app = router::router(scheduler.clone());
            tracing::info!(
                "listening on {:?}",
                listener.local_addr().expect("listener has no local addr")
            );
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stopper.notified().await })
                .await
                .expect("server error");
        }
        Err(err) => {
            tracing::error!("test discovery blew up: {err:#}");
        }
    }

    scheduler.final_report()
}
