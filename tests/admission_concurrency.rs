use std::convert::Infallible;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use gitshard::{AdmissionController, AdmissionLayer};
use http_body_util::{BodyExt, Full};
use tower::{service_fn, Layer, ServiceExt};

/// Tracks how many calls are inside their body at once.
#[derive(Default)]
struct Occupancy {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl Occupancy {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn unary_calls_never_exceed_capacity() -> anyhow::Result<()> {
    let controller = Arc::new(AdmissionController::new(1));
    let occupancy = Arc::new(Occupancy::default());

    let mut tasks = Vec::new();
    for i in 0..4000u32 {
        let controller = Arc::clone(&controller);
        let occupancy = Arc::clone(&occupancy);
        tasks.push(tokio::spawn(async move {
            controller
                .unary(async {
                    occupancy.enter();
                    if i % 16 == 0 {
                        tokio::task::yield_now().await;
                    }
                    occupancy.exit();
                })
                .await
        }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(occupancy.peak.load(Ordering::SeqCst), 1);
    assert_eq!(controller.in_flight(), 0);
    assert_eq!(controller.available(), 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn layered_calls_respect_capacity_until_bodies_finish() -> anyhow::Result<()> {
    let controller = Arc::new(AdmissionController::new(2));
    let occupancy = Arc::new(Occupancy::default());

    let service = {
        let occupancy = Arc::clone(&occupancy);
        service_fn(move |req: http::Request<String>| {
            let occupancy = Arc::clone(&occupancy);
            async move {
                occupancy.enter();
                tokio::time::sleep(Duration::from_millis(1)).await;
                occupancy.exit();
                Ok::<_, Infallible>(http::Response::new(Full::new(Bytes::from(req.into_body()))))
            }
        })
    };
    let admitted = AdmissionLayer::new(Arc::clone(&controller)).layer(service);

    let mut tasks = Vec::new();
    for i in 0..200 {
        let svc = admitted.clone();
        tasks.push(tokio::spawn(async move {
            let response = svc.oneshot(http::Request::new(format!("call-{i}"))).await?;
            let body = response.into_body().collect().await?.to_bytes();
            Ok::<_, gitshard::admission::BoxError>(body)
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        let body = task.await?.map_err(|e| anyhow::anyhow!(e))?;
        assert_eq!(body, Bytes::from(format!("call-{i}")));
    }

    assert!(occupancy.peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(controller.in_flight(), 0);
    Ok(())
}

#[tokio::test]
async fn waiting_callers_are_admitted_as_slots_free_up() -> anyhow::Result<()> {
    let controller = Arc::new(AdmissionController::new(1));
    let slot = controller.stream_slot().await?;

    let waiter = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.unary(async { 7 }).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    // Both stream-side release paths fire; only one slot comes back.
    let on_send_error = slot.clone();
    assert!(slot.release());
    assert!(!on_send_error.release());

    assert_eq!(waiter.await??, 7);
    assert_eq!(controller.available(), 1);
    assert_eq!(controller.in_flight(), 0);
    Ok(())
}
