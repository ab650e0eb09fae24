use speechd_gate::admission::SystemMetrics;
use speechd_gate::backends::{BackendFailure, GenerateRequest, InferenceBackend};
use speechd_gate::circuit_breaker::CircuitState;
use speechd_gate::config_loader::Settings;
use speechd_gate::router::{Intent, Route, NO_CLOUD_FLAG};
use speechd_gate::{ControlPlane, GateError, GateRequest, Handled};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

mockall::mock! {
    pub Backend {}
    #[async_trait::async_trait]
    impl InferenceBackend for Backend {
        async fn generate(&self, request: &GenerateRequest) -> Result<String, BackendFailure>;
        fn id(&self) -> &'static str;
    }
}

fn mock_backend() -> MockBackend {
    let mut backend = MockBackend::new();
    backend.expect_id().return_const("mock");
    backend
}

fn idle() -> SystemMetrics {
    SystemMetrics::default()
}

#[tokio::test]
async fn test_private_request_reaches_backend() {
    let mut backend = mock_backend();
    backend
        .expect_generate()
        .withf(|req: &GenerateRequest| {
            req.prompt == "vad står i min kalender imorgon" && req.model == "llama3" && !req.stream
        })
        .times(1)
        .returning(|_| Ok("Du har två möten.".to_string()));

    let plane = ControlPlane::with_backend(&Settings::default(), Arc::new(backend));
    let handled = tokio_test::assert_ok!(
        plane
            .handle(&GateRequest::new("vad står i min kalender imorgon"), &idle())
            .await
    );

    match handled {
        Handled::Local {
            decision, response, ..
        } => {
            assert_eq!(decision.intent, Intent::CalendarQuery);
            assert!(decision.no_cloud);
            assert_eq!(response, "Du har två möten.");
        }
        other => panic!("expected local lane, got {:?}", other),
    }
    assert!(plane.metrics().admission.last_success_at.is_some());
}

#[tokio::test]
async fn test_public_request_never_touches_backend() {
    let mut backend = mock_backend();
    backend.expect_generate().never();

    let plane = ControlPlane::with_backend(&Settings::default(), Arc::new(backend));
    let handled = plane
        .handle(&GateRequest::new("what time is it").with_budget(200), &idle())
        .await
        .unwrap();
    assert_eq!(handled.decision().route, Route::Realtime);
    assert_eq!(handled.decision().intent, Intent::TimeQuery);
}

#[tokio::test]
async fn test_no_cloud_flag_forces_local_lane() {
    let mut backend = mock_backend();
    backend
        .expect_generate()
        .times(1)
        .returning(|_| Ok("Soligt.".to_string()));

    let plane = ControlPlane::with_backend(&Settings::default(), Arc::new(backend));
    let request = GateRequest::new("what's the weather like").with_flag(NO_CLOUD_FLAG, true);
    let handled = plane.handle(&request, &idle()).await.unwrap();
    assert_eq!(handled.decision().route, Route::Local);
    assert!(handled.decision().no_cloud);
}

#[tokio::test]
async fn test_guardian_block_stops_dispatch() {
    let mut guardian = mockito::Server::new_async().await;
    let _health = guardian
        .mock("GET", "/health")
        .with_status(200)
        .with_body(r#"{"intake_blocked":true}"#)
        .create_async()
        .await;

    let mut backend = mock_backend();
    backend.expect_generate().never();

    let settings = Settings {
        guardian_url: guardian.url(),
        ..Settings::default()
    };
    let plane = ControlPlane::with_backend(&settings, Arc::new(backend));
    let err = tokio_test::assert_err!(
        plane
            .handle(&GateRequest::new("läs mitt senaste mejl"), &idle())
            .await
    );

    assert!(matches!(err, GateError::GuardianBlocked));
    assert!(err.suggests_alternate_lane());
    // A guardian block says nothing about backend health.
    let metrics = plane.metrics();
    assert_eq!(metrics.admission.consecutive_failures, 0);
    assert_eq!(metrics.circuit.failure_count, 0);
    assert_eq!(metrics.dispatch.guardian_blocked, 1);
}

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_and_recovers() {
    let failing = Arc::new(AtomicBool::new(true));
    let mut backend = mock_backend();
    let flag = failing.clone();
    backend.expect_generate().returning(move |_| {
        if flag.load(Ordering::SeqCst) {
            Err(BackendFailure::Status {
                status: 500,
                body: "model crashed".to_string(),
            })
        } else {
            Ok("ok".to_string())
        }
    });

    let settings = Settings {
        breaker_failure_threshold: 2,
        breaker_success_threshold: 2,
        breaker_recovery_timeout_secs: 30,
        admission_failure_threshold: 10,
        ..Settings::default()
    };
    let plane = ControlPlane::with_backend(&settings, Arc::new(backend));
    let request = GateRequest::new("sök kontakten Anna");

    for _ in 0..2 {
        let err = plane.handle(&request, &idle()).await.unwrap_err();
        assert!(err.is_retryable());
    }
    assert_eq!(plane.dispatcher().breaker().state(), CircuitState::Open);

    let err = plane.handle(&request, &idle()).await.unwrap_err();
    assert!(matches!(err, GateError::CircuitOpen { .. }));
    // Rejections by the breaker are not backend attempts.
    assert_eq!(plane.admission().status().consecutive_failures, 2);

    failing.store(false, Ordering::SeqCst);
    tokio::time::advance(Duration::from_secs(31)).await;

    plane.handle(&request, &idle()).await.unwrap();
    assert_eq!(plane.dispatcher().breaker().state(), CircuitState::HalfOpen);
    plane.handle(&request, &idle()).await.unwrap();
    assert_eq!(plane.dispatcher().breaker().state(), CircuitState::Closed);
    assert_eq!(plane.admission().status().consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_sustained_overload_denies_after_min_duration() {
    let mut backend = mock_backend();
    backend.expect_generate().never();

    let plane = ControlPlane::with_backend(&Settings::default(), Arc::new(backend));
    let hot = SystemMetrics {
        cpu_usage_percent: 97.0,
        memory_usage_percent: 40.0,
        voice_queue_length: 0,
    };

    // A short spike is tolerated.
    plane.handle(&GateRequest::new("hej"), &hot).await.unwrap();
    tokio::time::advance(Duration::from_secs(31)).await;

    let err = plane
        .handle(&GateRequest::new("hej"), &hot)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "sustained_overload");

    // Cooling down clears the timer.
    plane.handle(&GateRequest::new("hej"), &idle()).await.unwrap();
    plane.handle(&GateRequest::new("hej"), &hot).await.unwrap();
}

#[tokio::test]
async fn test_ollama_end_to_end() {
    let mut ollama = mockito::Server::new_async().await;
    let generate = ollama
        .mock("POST", "/api/generate")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({
            "model": "llama3",
            "stream": false,
            "keep_alive": "5m"
        })))
        .with_status(200)
        .with_body(r#"{"response":"Mötet är klockan tio.","done":true}"#)
        .create_async()
        .await;

    let settings = Settings {
        ollama_url: ollama.url(),
        ..Settings::default()
    };
    let plane = ControlPlane::from_settings(&settings);
    let handled = plane
        .handle(&GateRequest::new("när är mötet med chefen"), &idle())
        .await
        .unwrap();

    match handled {
        Handled::Local { response, .. } => assert_eq!(response, "Mötet är klockan tio."),
        other => panic!("expected local lane, got {:?}", other),
    }
    generate.assert_async().await;
}
