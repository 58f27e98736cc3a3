//! End-to-end service tests against a scripted stub engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;

use vtrace_engine::{StubBehavior, StubScript};
use vtrace_models::{
    ConversionConfig, ConversionError, CriticalFault, ImagePayload, JobPriority,
};
use vtrace_pool::PoolConfig;
use vtrace_service::{ServiceConfig, SubmitOptions, VectorizerService};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn test_config(max_workers: usize) -> ServiceConfig {
    ServiceConfig {
        pool: PoolConfig {
            max_workers,
            init_timeout: Duration::from_secs(2),
            wait_ceiling: Duration::from_millis(800),
            health_interval: Duration::from_secs(60),
            ping_timeout: Duration::from_millis(500),
        },
        cache_capacity: 16,
        base_timeout: Duration::from_millis(500),
        per_megapixel: Duration::from_millis(50),
        max_deadline: Duration::from_secs(5),
        high_pass_threshold: 7,
        large_image_mp: 16.0,
        abort_grace: Duration::from_millis(400),
        ..Default::default()
    }
}

fn quick_success() -> StubBehavior {
    StubBehavior::Succeed {
        progress_events: 2,
        duration: Duration::from_millis(20),
    }
}

fn image(fill: u8) -> ImagePayload {
    ImagePayload::new(4, 4, vec![fill; 64]).unwrap()
}

#[tokio::test]
async fn submit_completes_and_reports_progress() {
    init_tracing();
    let script = StubScript::always(StubBehavior::Succeed {
        progress_events: 3,
        duration: Duration::from_millis(30),
    });
    let service = VectorizerService::start(test_config(2), script.factory())
        .await
        .unwrap();

    let updates = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&updates);
    let job = service
        .submit(
            image(1),
            ConversionConfig::default(),
            SubmitOptions::default().with_progress(move |update| {
                assert!(update.percent <= 100);
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .unwrap();

    let result = job.await_result().await.unwrap();
    assert!(result.svg.contains("<svg"));
    assert_eq!(updates.load(Ordering::SeqCst), 3);

    let stats = service.stats();
    assert_eq!(stats.total_workers, 2);
    assert_eq!(stats.total_processed, 1);
    assert!(stats.avg_processing_time_ms > 0);
    service.shutdown().await;
}

#[tokio::test]
async fn identical_submissions_share_one_computation() {
    init_tracing();
    let script = StubScript::always(StubBehavior::Succeed {
        progress_events: 1,
        duration: Duration::from_millis(80),
    });
    let service = VectorizerService::start(test_config(2), script.factory())
        .await
        .unwrap();

    // Two callers, two streams, identical bytes and config.
    let a = service
        .submit(
            image(7),
            ConversionConfig::default(),
            SubmitOptions::default().with_stream("caller-a"),
        )
        .unwrap();
    let b = service
        .submit(
            image(7),
            ConversionConfig::default(),
            SubmitOptions::default().with_stream("caller-b"),
        )
        .unwrap();

    let result_a = a.await_result().await.unwrap();
    let result_b = b.await_result().await.unwrap();

    // Exactly one engine invocation; both callers share the result object.
    assert_eq!(script.process_calls(), 1);
    assert!(Arc::ptr_eq(&result_a, &result_b));

    // A later identical submission is a pure cache hit.
    let c = service
        .submit(image(7), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();
    assert!(Arc::ptr_eq(&c.await_result().await.unwrap(), &result_a));
    assert_eq!(script.process_calls(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn critical_fault_is_retried_once_with_degraded_config() {
    init_tracing();
    let script = StubScript::sequence(
        [StubBehavior::Fault(CriticalFault::MemoryViolation)],
        quick_success(),
    );
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    // pass_count 3 is below the high-intensity threshold; the stub
    // reports path_count = pass_count, so the degraded retry (single
    // pass) is observable in the result.
    let job = service
        .submit(
            image(2),
            ConversionConfig::default().with_pass_count(3),
            SubmitOptions::default(),
        )
        .unwrap();

    let result = job.await_result().await.unwrap();
    assert_eq!(script.process_calls(), 2);
    assert_eq!(result.path_count, 1);
    service.shutdown().await;
}

#[tokio::test]
async fn second_critical_fault_surfaces_with_guidance() {
    init_tracing();
    let script = StubScript::sequence(
        [
            StubBehavior::Fault(CriticalFault::MemoryViolation),
            StubBehavior::Fault(CriticalFault::MemoryViolation),
        ],
        quick_success(),
    );
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let job = service
        .submit(image(3), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();

    match job.await_result().await {
        Err(ConversionError::Critical { fault, message }) => {
            assert_eq!(fault, CriticalFault::MemoryViolation);
            assert!(message.contains("reduce input size or settings"));
        }
        other => panic!("expected critical failure, got {other:?}"),
    }
    // Exactly one retry, never an infinite loop.
    assert_eq!(script.process_calls(), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn engine_panic_is_contained_and_retried() {
    init_tracing();
    let script = StubScript::sequence(
        [StubBehavior::Panic("simulated crash".into())],
        quick_success(),
    );
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let job = service
        .submit(image(4), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();

    assert!(job.await_result().await.is_ok());
    assert_eq!(script.process_calls(), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn validation_error_is_not_retried() {
    init_tracing();
    let script = StubScript::always(StubBehavior::Invalid("unsupported palette".into()));
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let job = service
        .submit(image(5), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();

    match job.await_result().await {
        Err(ConversionError::Validation(message)) => {
            assert!(message.contains("unsupported palette"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(script.process_calls(), 1);

    // The worker stayed healthy; the next job reuses it.
    script.push(quick_success());
    let job = service
        .submit(image(6), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();
    assert!(job.await_result().await.is_ok());
    assert_eq!(script.init_calls(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn invalid_config_is_rejected_before_queueing() {
    init_tracing();
    let script = StubScript::always(quick_success());
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let bad = ConversionConfig::default().with_detail(2.0);
    match service.submit(image(7), bad, SubmitOptions::default()) {
        Err(ConversionError::Validation(_)) => {}
        other => panic!("expected validation error, got {other:?}"),
    }
    assert_eq!(script.process_calls(), 0);
    service.shutdown().await;
}

#[tokio::test]
async fn high_intensity_job_bypasses_the_shared_pool() {
    init_tracing();
    let script = StubScript::always(StubBehavior::Succeed {
        progress_events: 1,
        duration: Duration::from_millis(150),
    });
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    // pass_count 7 crosses the escalation threshold.
    let job = service
        .submit(
            image(8),
            ConversionConfig::default().with_pass_count(7),
            SubmitOptions::default(),
        )
        .unwrap();

    // While the job runs, the pool's only worker stays idle.
    tokio::time::sleep(Duration::from_millis(60)).await;
    let stats = service.stats();
    assert_eq!(stats.busy, 0);
    assert_eq!(stats.idle, 1);

    assert!(job.await_result().await.is_ok());
    // The isolated worker never counts toward pool throughput.
    assert_eq!(service.stats().total_processed, 0);
    // Pool worker init plus one isolated worker init.
    assert_eq!(script.init_calls(), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn caller_priority_forces_escalation() {
    init_tracing();
    let script = StubScript::always(quick_success());
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let job = service
        .submit(
            image(9),
            ConversionConfig::default(),
            SubmitOptions::default().with_priority(JobPriority::High),
        )
        .unwrap();

    assert!(job.await_result().await.is_ok());
    assert_eq!(service.stats().total_processed, 0);
    assert_eq!(script.init_calls(), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn aborting_a_queued_job_never_dispatches_it() {
    init_tracing();
    let script = StubScript::always(StubBehavior::Succeed {
        progress_events: 1,
        duration: Duration::from_millis(200),
    });
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let first = service
        .submit(
            image(10),
            ConversionConfig::default(),
            SubmitOptions::default().with_stream("s"),
        )
        .unwrap();
    let second = service
        .submit(
            image(11),
            ConversionConfig::default(),
            SubmitOptions::default().with_stream("s"),
        )
        .unwrap();

    // The first job is running; the second is still queued behind it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.abort(&second.job_id);

    assert!(matches!(
        second.await_result().await,
        Err(ConversionError::Aborted)
    ));
    assert!(first.await_result().await.is_ok());
    // The aborted job never reached an engine.
    assert_eq!(script.process_calls(), 1);
    service.shutdown().await;
}

#[tokio::test]
async fn aborting_a_running_job_settles_immediately_and_reclaims_the_worker() {
    init_tracing();
    let script = StubScript::sequence([StubBehavior::Hang], quick_success());
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let job = service
        .submit(image(12), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();
    tokio::time::sleep(Duration::from_millis(80)).await;

    let job_id = job.job_id.clone();
    service.abort(&job_id);
    assert!(matches!(
        job.await_result().await,
        Err(ConversionError::Aborted)
    ));

    // The worker honored the abort and is usable for the next job.
    let next = service
        .submit(image(13), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();
    assert!(next.await_result().await.is_ok());
    service.shutdown().await;
}

#[tokio::test]
async fn deadline_scales_with_input_size() {
    init_tracing();
    // 0.5 MP of input at 2s/MP on a 300ms base: the scaled deadline
    // (1300ms) comfortably covers a 700ms conversion that the base
    // alone would have killed.
    let mut config = test_config(1);
    config.base_timeout = Duration::from_millis(300);
    config.per_megapixel = Duration::from_secs(2);

    let script = StubScript::always(StubBehavior::Succeed {
        progress_events: 2,
        duration: Duration::from_millis(700),
    });
    let service = VectorizerService::start(config, script.factory())
        .await
        .unwrap();

    let wide = ImagePayload::new(1000, 500, vec![0u8; 1000 * 500 * 4]).unwrap();
    let job = service
        .submit(wide, ConversionConfig::default(), SubmitOptions::default())
        .unwrap();
    assert!(job.await_result().await.is_ok());
    service.shutdown().await;
}

#[tokio::test]
async fn deadline_without_scaling_times_out() {
    init_tracing();
    let mut config = test_config(1);
    config.base_timeout = Duration::from_millis(150);
    config.per_megapixel = Duration::ZERO;
    // Keep the degraded-retry extension from rescuing the job.
    config.degrade.deadline_factor = 1.0;

    let script = StubScript::always(StubBehavior::Succeed {
        progress_events: 2,
        duration: Duration::from_millis(700),
    });
    let service = VectorizerService::start(config, script.factory())
        .await
        .unwrap();

    let job = service
        .submit(image(14), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();
    match job.await_result().await {
        Err(ConversionError::WorkerLost(message)) => {
            assert!(message.contains("timed out"));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    // One transient retry before giving up.
    assert_eq!(script.process_calls(), 2);
    service.shutdown().await;
}

#[tokio::test]
async fn panicking_progress_callback_does_not_abort_the_job() {
    init_tracing();
    let script = StubScript::always(StubBehavior::Succeed {
        progress_events: 3,
        duration: Duration::from_millis(30),
    });
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let job = service
        .submit(
            image(15),
            ConversionConfig::default(),
            SubmitOptions::default().with_progress(|_| panic!("observer bug")),
        )
        .unwrap();

    assert!(job.await_result().await.is_ok());
    service.shutdown().await;
}

#[tokio::test]
async fn shutdown_rejects_unstarted_and_new_jobs() {
    init_tracing();
    let script = StubScript::always(StubBehavior::Succeed {
        progress_events: 1,
        duration: Duration::from_millis(300),
    });
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let running = service
        .submit(
            image(16),
            ConversionConfig::default(),
            SubmitOptions::default().with_stream("s"),
        )
        .unwrap();
    let queued = service
        .submit(
            image(17),
            ConversionConfig::default(),
            SubmitOptions::default().with_stream("s"),
        )
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    service.shutdown().await;

    assert!(matches!(
        queued.await_result().await,
        Err(ConversionError::ShuttingDown)
    ));
    assert!(matches!(
        running.await_result().await,
        Err(ConversionError::ShuttingDown)
    ));
    assert!(matches!(
        service.submit(image(18), ConversionConfig::default(), SubmitOptions::default()),
        Err(ConversionError::ShuttingDown)
    ));
    assert_eq!(service.stats().total_workers, 0);
}

#[tokio::test]
async fn clear_cache_forces_recomputation() {
    init_tracing();
    let script = StubScript::always(quick_success());
    let service = VectorizerService::start(test_config(1), script.factory())
        .await
        .unwrap();

    let job = service
        .submit(image(19), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();
    job.await_result().await.unwrap();
    assert_eq!(service.cache_len(), 1);

    service.clear_cache();
    assert_eq!(service.cache_len(), 0);

    let job = service
        .submit(image(19), ConversionConfig::default(), SubmitOptions::default())
        .unwrap();
    job.await_result().await.unwrap();
    assert_eq!(script.process_calls(), 2);
    service.shutdown().await;
}
