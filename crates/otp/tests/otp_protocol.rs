//! End-to-end protocol behavior over the in-process stores.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use lendo_core::service::OtpType;
use lendo_otp::audit::MemoryAuditStore;
use lendo_otp::rate_limiter::{AttemptsLimits, RateLimiterConfig, SendRateLimits};
use lendo_otp::session::MemorySessionStore;
use lendo_otp::windows::MemoryWindowStore;
use lendo_otp::{CreateError, OtpConfig, OtpService, RateLimiter, SendScope, VerifyOutcome};

const TTL: Duration = Duration::from_secs(600);
const HOUR_MS: i64 = 3_600_000;

fn service_with(config: RateLimiterConfig) -> (Arc<OtpService>, Arc<MemoryAuditStore>) {
    let audit = Arc::new(MemoryAuditStore::new());
    let service = OtpService::new(
        Arc::new(MemorySessionStore::new()),
        RateLimiter::new(Arc::new(MemoryWindowStore::new()), config),
        audit.clone(),
        OtpConfig {
            hash_secret: "test-hmac-secret".into(),
            max_attempts: 3,
        },
    );
    (Arc::new(service), audit)
}

fn roomy_limits() -> RateLimiterConfig {
    RateLimiterConfig {
        send: SendRateLimits {
            per_minute: 100,
            per_hour: 1_000,
        },
        attempts: AttemptsLimits {
            window_ms: HOUR_MS,
            limit: 100,
        },
    }
}

#[tokio::test]
async fn resend_reuses_session_and_resets_audit_counters() {
    let (service, audit) = service_with(roomy_limits());

    let first = service
        .create_session_at("user@example.com", OtpType::Email, "111111", TTL, 1_000)
        .await
        .unwrap();
    assert!(!first.resent);

    // Two wrong codes before the resend.
    for _ in 0..2 {
        let outcome = service
            .verify_session_at(&first.session_id, "000000", 2_000)
            .await
            .unwrap();
        assert_matches!(outcome, VerifyOutcome::Invalid { .. });
    }

    let second = service
        .create_session_at("user@example.com", OtpType::Email, "222222", TTL, 3_000)
        .await
        .unwrap();
    assert!(second.resent);
    assert_eq!(second.session_id, first.session_id);

    let record = audit.get(&first.session_id).expect("audit row exists");
    assert_eq!(record.resend_count, 1);
    assert_eq!(record.attempts, 0);
    assert!(!record.is_verified);

    // Fresh 0-attempt budget on the new code.
    let outcome = service
        .verify_session_at(&first.session_id, "000000", 4_000)
        .await
        .unwrap();
    assert_matches!(outcome, VerifyOutcome::Invalid { attempts: 1 });
}

#[tokio::test]
async fn concurrent_verifies_yield_exactly_one_verified() {
    for n in [2usize, 5, 20] {
        let (service, _) = service_with(roomy_limits());
        let created = service
            .create_session_at("user@example.com", OtpType::Email, "482913", TTL, 0)
            .await
            .unwrap();

        let mut handles = Vec::with_capacity(n);
        for _ in 0..n {
            let service = service.clone();
            let sid = created.session_id.clone();
            handles.push(tokio::spawn(async move {
                service.verify_session_at(&sid, "482913", 100).await.unwrap()
            }));
        }

        let mut verified = 0;
        let mut already_used = 0;
        for handle in handles {
            match handle.await.unwrap() {
                VerifyOutcome::Verified => verified += 1,
                VerifyOutcome::AlreadyUsed => already_used += 1,
                other => panic!("unexpected outcome under contention: {other:?}"),
            }
        }
        assert_eq!(verified, 1, "n={n}");
        assert_eq!(already_used, n - 1, "n={n}");
    }
}

#[tokio::test]
async fn per_session_attempts_cap_holds() {
    let (service, _) = service_with(roomy_limits());
    let created = service
        .create_session_at("user@example.com", OtpType::Email, "482913", TTL, 0)
        .await
        .unwrap();

    for expected in [1u32, 2, 3] {
        let outcome = service
            .verify_session_at(&created.session_id, "000000", 100)
            .await
            .unwrap();
        assert_matches!(outcome, VerifyOutcome::Invalid { attempts } if attempts == expected);
    }
    // Beyond the cap the counter stays pinned.
    let outcome = service
        .verify_session_at(&created.session_id, "000000", 200)
        .await
        .unwrap();
    assert_matches!(outcome, VerifyOutcome::Invalid { attempts: 3 });
}

#[tokio::test]
async fn create_denies_fourth_send_within_minute() {
    let mut config = roomy_limits();
    config.send = SendRateLimits {
        per_minute: 3,
        per_hour: 10,
    };
    let (service, _) = service_with(config);

    for now in [0, 1_000, 2_000] {
        service
            .create_session_at("user@example.com", OtpType::Email, "111111", TTL, now)
            .await
            .unwrap();
    }

    // The denial reaches the caller directly with its retry hint.
    let err = service
        .create_session_at("user@example.com", OtpType::Email, "111111", TTL, 3_000)
        .await
        .unwrap_err();
    match err {
        CreateError::SendRateExceeded {
            scope,
            retry_after_ms,
        } => {
            assert_eq!(scope, SendScope::Minute);
            assert!(retry_after_ms > 0);
        }
        other => panic!("expected SendRateExceeded, got {other:?}"),
    }

    // Once the minute window slides, sends resume.
    service
        .create_session_at("user@example.com", OtpType::Email, "111111", TTL, 62_001)
        .await
        .unwrap();
}

#[tokio::test]
async fn fresh_session_supersedes_outstanding_episode() {
    let (service, audit) = service_with(roomy_limits());

    let first = service
        .create_session_at(
            "user@example.com",
            OtpType::Email,
            "111111",
            Duration::from_millis(500),
            0,
        )
        .await
        .unwrap();

    // The first session expired unverified; the new one starts a fresh
    // episode and invalidates the old code.
    let second = service
        .create_session_at("user@example.com", OtpType::Email, "222222", TTL, 1_000)
        .await
        .unwrap();
    assert!(!second.resent);
    assert_ne!(second.session_id, first.session_id);

    let old = audit.get(&first.session_id).expect("old audit row kept");
    assert!(old.is_used);
    assert!(!old.is_verified);
    let fresh = audit.get(&second.session_id).expect("new audit row");
    assert!(!fresh.is_used);
}

#[tokio::test]
async fn sends_and_failed_verifies_share_one_budget() {
    let mut config = roomy_limits();
    config.attempts = AttemptsLimits {
        window_ms: HOUR_MS,
        limit: 5,
    };
    let (service, _) = service_with(config);

    // Three sends (one fresh + two resends)...
    let created = service
        .create_session_at("user@example.com", OtpType::Email, "111111", TTL, 0)
        .await
        .unwrap();
    for now in [1_000, 2_000] {
        service
            .create_session_at("user@example.com", OtpType::Email, "111111", TTL, now)
            .await
            .unwrap();
    }
    // ...and two failed verifies exhaust the budget of five.
    for now in [3_000, 4_000] {
        let outcome = service
            .verify_session_at(&created.session_id, "000000", now)
            .await
            .unwrap();
        assert_matches!(outcome, VerifyOutcome::Invalid { .. });
    }

    // The sixth action of either kind is denied.
    let err = service
        .create_session_at("user@example.com", OtpType::Email, "111111", TTL, 5_000)
        .await
        .unwrap_err();
    let first_retry = match err {
        CreateError::TooManyAttempts { retry_after_ms } => retry_after_ms,
        other => panic!("expected TooManyAttempts, got {other:?}"),
    };
    assert!(first_retry > 0);

    // retryAfter shrinks as the window slides toward expiry.
    let err = service
        .create_session_at("user@example.com", OtpType::Email, "111111", TTL, 60_000)
        .await
        .unwrap_err();
    match err {
        CreateError::TooManyAttempts { retry_after_ms } => {
            assert!(retry_after_ms < first_retry);
            assert!(retry_after_ms > 0);
        }
        other => panic!("expected TooManyAttempts, got {other:?}"),
    }

    // A wrong code is likewise reported against the exhausted budget.
    let outcome = service
        .verify_session_at(&created.session_id, "000000", 61_000)
        .await
        .unwrap();
    assert_matches!(outcome, VerifyOutcome::TooManyAttempts { retry_after_ms, .. } if retry_after_ms > 0);
}

#[tokio::test]
async fn expired_session_reports_expired_without_counting() {
    let (service, _) = service_with(roomy_limits());
    let created = service
        .create_session_at(
            "user@example.com",
            OtpType::Email,
            "482913",
            Duration::from_millis(500),
            0,
        )
        .await
        .unwrap();

    let outcome = service
        .verify_session_at(&created.session_id, "000000", 1_000)
        .await
        .unwrap();
    assert_eq!(outcome, VerifyOutcome::Expired);
}

#[tokio::test]
async fn end_to_end_email_verification_flow() {
    let (service, _) = service_with(roomy_limits());
    let now = 1_700_000_000_000;

    let created = service
        .create_session_at("user@example.com", OtpType::Email, "482913", TTL, now)
        .await
        .unwrap();
    assert_eq!(
        created.expires_at.timestamp_millis(),
        now + TTL.as_millis() as i64
    );

    let outcome = service
        .verify_session_at(&created.session_id, "111111", now + 1_000)
        .await
        .unwrap();
    assert_eq!(outcome, VerifyOutcome::Invalid { attempts: 1 });

    let outcome = service
        .verify_session_at(&created.session_id, "482913", now + 2_000)
        .await
        .unwrap();
    assert_eq!(outcome, VerifyOutcome::Verified);

    let outcome = service
        .verify_session_at(&created.session_id, "482913", now + 3_000)
        .await
        .unwrap();
    assert_eq!(outcome, VerifyOutcome::AlreadyUsed);
}
