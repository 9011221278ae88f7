//! End-to-end provisioning lifecycle tests over SQLite with a scripted toolchain.

mod test_utils;

use std::ffi::OsString;
use std::time::Duration;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use provisioner::crypto::SecretString;
use provisioner::error::ProvisioningError;
use provisioner::models::{ProvisionJobStatus, TenantStatus};
use provisioner::provisioning::{
    Actor, ProvisionWorker, ProvisioningConfig, ValidationError, WorkerConfig,
};
use provisioner::repositories::JobQueue;
use provisioner::repositories::{TenantField, TenantStore};

use test_utils::{
    Harness, Script, acme, find_job, jobs_for_tenant, new_tenant, tenant_count,
    test_provisioning_config,
};

#[tokio::test]
async fn scenario_a_successful_provisioning() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;

    let created = harness.service.create_tenant(acme()).await?;
    assert_eq!(created.status, TenantStatus::Draft);

    let queued = harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;
    assert_eq!(queued.status, TenantStatus::Queued);

    let handled = harness
        .worker()
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    assert_eq!(handled, 1);

    let status = harness.service.tenant_status(created.tenant_id).await?;
    assert_eq!(status.status, TenantStatus::Active);
    assert_eq!(status.site_name.as_deref(), Some("acme.local"));
    assert_eq!(status.site_url.as_deref(), Some("https://acme.local"));
    assert_eq!(status.last_error, None);

    let job = find_job(&harness.db, queued.job_id).await?;
    assert_eq!(job.status, ProvisionJobStatus::Succeeded);
    assert_eq!(job.attempts, 1);

    assert_eq!(harness.runner.calls().len(), 1);
    Ok(())
}

#[tokio::test]
async fn scenario_b_toolchain_failure_is_recorded() -> Result<()> {
    let harness = Harness::new(Script::Exit {
        code: 1,
        stdout: "Creating site".to_string(),
        stderr: "db connection refused".to_string(),
    })
    .await?;

    let created = harness.service.create_tenant(acme()).await?;
    let queued = harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;

    harness
        .worker()
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;

    let status = harness.service.tenant_status(created.tenant_id).await?;
    assert_eq!(status.status, TenantStatus::Failed);
    let last_error = status.last_error.unwrap();
    assert!(last_error.contains("db connection refused"));
    assert!(last_error.starts_with("CMD: bench new-site"));
    assert!(last_error.contains("\n\nSTDOUT:\nCreating site\n\nSTDERR:\n"));
    assert!(!last_error.contains("--admin-password=secret"));
    assert!(!last_error.contains("root-pw"));
    assert_eq!(status.site_url, None);

    let job = find_job(&harness.db, queued.job_id).await?;
    assert_eq!(job.status, ProvisionJobStatus::Failed);
    assert!(job.error.is_some());
    Ok(())
}

#[tokio::test]
async fn scenario_c_invalid_subdomain_persists_nothing() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;

    let err = harness
        .service
        .create_tenant(new_tenant("Acme", "a@acme.com", "-bad-", "secret"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisioningError::Validation(ValidationError::InvalidSubdomain { .. })
    ));
    assert_eq!(tenant_count(&harness.db).await?, 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_creates_with_same_subdomain_admit_exactly_one() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;

    let (first, second) = tokio::join!(
        harness
            .service
            .create_tenant(new_tenant("One", "one@race.test", "race", "pw-one")),
        harness
            .service
            .create_tenant(new_tenant("Two", "two@race.test", "race", "pw-two")),
    );

    let outcomes = [first, second];
    let successes = outcomes.iter().filter(|outcome| outcome.is_ok()).count();
    assert_eq!(successes, 1);
    assert!(outcomes.iter().any(|outcome| matches!(
        outcome,
        Err(ProvisioningError::Validation(ValidationError::DuplicateSubdomain(subdomain)))
            if subdomain == "race"
    )));
    assert_eq!(tenant_count(&harness.db).await?, 1);
    Ok(())
}

#[tokio::test]
async fn duplicate_detection_uses_normalized_subdomain() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;

    harness.service.create_tenant(acme()).await?;
    let err = harness
        .service
        .create_tenant(new_tenant("Other", "o@acme.com", "  ACME ", "pw"))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisioningError::Validation(ValidationError::DuplicateSubdomain(ref s)) if s == "acme"
    ));
    Ok(())
}

#[tokio::test]
async fn retry_after_failure_clears_last_error() -> Result<()> {
    let harness = Harness::new(Script::Exit {
        code: 1,
        stdout: String::new(),
        stderr: "db connection refused".to_string(),
    })
    .await?;
    let worker = harness.worker();
    let cancel = CancellationToken::new();

    let created = harness.service.create_tenant(acme()).await?;
    harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;
    worker.claim_and_run_jobs(&cancel).await?;
    assert_eq!(
        harness.service.tenant_status(created.tenant_id).await?.status,
        TenantStatus::Failed
    );

    let requeued = harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;
    assert_eq!(requeued.status, TenantStatus::Queued);
    let status = harness.service.tenant_status(created.tenant_id).await?;
    assert_eq!(status.status, TenantStatus::Queued);
    assert_eq!(status.last_error, None);

    harness.runner.set_script(Script::Succeed);
    worker.claim_and_run_jobs(&cancel).await?;

    let status = harness.service.tenant_status(created.tenant_id).await?;
    assert_eq!(status.status, TenantStatus::Active);
    assert_eq!(status.last_error, None);
    assert_eq!(jobs_for_tenant(&harness.db, created.tenant_id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn enqueue_rejected_outside_draft_and_failed() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;

    for (index, status) in [
        TenantStatus::Queued,
        TenantStatus::Provisioning,
        TenantStatus::Active,
    ]
    .into_iter()
    .enumerate()
    {
        let created = harness
            .service
            .create_tenant(new_tenant(
                "Acme",
                "a@acme.com",
                &format!("acme{}", index),
                "secret",
            ))
            .await?;
        harness
            .tenants
            .update_field(created.tenant_id, TenantField::Status(status))
            .await?;

        let err = harness
            .service
            .enqueue_provision(Actor::Operator, created.tenant_id)
            .await
            .unwrap_err();

        match err {
            ProvisioningError::Validation(ValidationError::InvalidStateTransition {
                current,
                ..
            }) => assert_eq!(current, status),
            other => panic!("expected InvalidStateTransition, got {other:?}"),
        }

        let tenant = harness.tenants.get(created.tenant_id).await?.unwrap();
        assert_eq!(tenant.status, status);
        assert!(jobs_for_tenant(&harness.db, created.tenant_id).await?.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn public_actor_cannot_enqueue() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;
    let created = harness.service.create_tenant(acme()).await?;

    let err = harness
        .service
        .enqueue_provision(Actor::Public, created.tenant_id)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::Forbidden { .. }));
    assert_eq!(
        harness.service.tenant_status(created.tenant_id).await?.status,
        TenantStatus::Draft
    );
    Ok(())
}

#[tokio::test]
async fn enqueue_unknown_tenant_is_not_found() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;
    let missing = Uuid::new_v4();

    let err = harness
        .service
        .enqueue_provision(Actor::Operator, missing)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::TenantNotFound(id) if id == missing));
    Ok(())
}

#[tokio::test]
async fn run_requires_queued_tenant() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;
    let created = harness.service.create_tenant(acme()).await?;

    let err = harness
        .orchestrator
        .run(created.tenant_id, &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        ProvisioningError::Validation(ValidationError::InvalidStateTransition {
            current: TenantStatus::Draft,
            ..
        })
    ));
    assert!(harness.runner.calls().is_empty());
    assert_eq!(
        harness.service.tenant_status(created.tenant_id).await?.status,
        TenantStatus::Draft
    );
    Ok(())
}

#[tokio::test]
async fn interrupted_attempt_can_resume() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;
    let created = harness.service.create_tenant(acme()).await?;
    harness
        .tenants
        .update_field(
            created.tenant_id,
            TenantField::Status(TenantStatus::Provisioning),
        )
        .await?;

    let outcome = harness
        .orchestrator
        .run(created.tenant_id, &CancellationToken::new())
        .await?;

    assert_eq!(outcome.site_url, "https://acme.local");
    assert_eq!(
        harness.service.tenant_status(created.tenant_id).await?.status,
        TenantStatus::Active
    );
    Ok(())
}

#[tokio::test]
async fn missing_toolchain_fails_with_description() -> Result<()> {
    let harness = Harness::new(Script::NotFound).await?;
    let created = harness.service.create_tenant(acme()).await?;
    harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;

    let err = harness
        .orchestrator
        .run(created.tenant_id, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "toolchain_not_found");

    let status = harness.service.tenant_status(created.tenant_id).await?;
    assert_eq!(status.status, TenantStatus::Failed);
    let last_error = status.last_error.unwrap();
    assert!(last_error.contains("'bench' not found"));
    assert!(last_error.contains("/opt/bench/bin"));
    Ok(())
}

#[tokio::test]
async fn oversized_diagnostic_is_truncated_to_bound() -> Result<()> {
    let harness = Harness::new(Script::Exit {
        code: 1,
        stdout: String::new(),
        stderr: "x".repeat(20_000),
    })
    .await?;
    let created = harness.service.create_tenant(acme()).await?;
    harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;

    harness
        .worker()
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;

    let last_error = harness
        .service
        .tenant_status(created.tenant_id)
        .await?
        .last_error
        .unwrap();
    assert_eq!(last_error.chars().count(), 14_000);
    assert!(last_error.starts_with("CMD: "));
    Ok(())
}

#[tokio::test]
async fn cancelled_attempt_ends_failed() -> Result<()> {
    let harness = Harness::new(Script::HangUntilCancelled).await?;
    let created = harness.service.create_tenant(acme()).await?;
    harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;

    let cancel = CancellationToken::new();
    let orchestrator = harness.orchestrator.clone();
    let tenant_id = created.tenant_id;
    let run_cancel = cancel.clone();
    let attempt = tokio::spawn(async move { orchestrator.run(tenant_id, &run_cancel).await });

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), attempt).await??;
    assert!(result.is_err());

    let status = harness.service.tenant_status(created.tenant_id).await?;
    assert_eq!(status.status, TenantStatus::Failed);
    assert!(status.last_error.unwrap().contains("cancelled"));
    Ok(())
}

#[tokio::test]
async fn toolchain_receives_exact_argv() -> Result<()> {
    let config = ProvisioningConfig {
        toolchain_home: Some("/home/frappe/frappe-bench".into()),
        install_apps: vec!["erpnext".to_string(), "hrms".to_string()],
        ..test_provisioning_config()
    };
    let harness = Harness::with_config(Script::Succeed, config).await?;

    let mut input = acme();
    input.base_domain = Some("example.com".to_string());
    let created = harness.service.create_tenant(input).await?;
    harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;
    harness
        .worker()
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;

    let calls = harness.runner.calls();
    assert_eq!(calls.len(), 1);
    let spec = &calls[0];

    let expected: Vec<OsString> = [
        "new-site",
        "--mariadb-user-host-login-scope=%",
        "--admin-password=secret",
        "--db-root-username=root",
        "--db-root-password=root-pw",
        "--install-app",
        "erpnext",
        "--install-app",
        "hrms",
        "acme.example.com",
    ]
    .into_iter()
    .map(OsString::from)
    .collect();

    assert_eq!(spec.program, "bench");
    assert_eq!(spec.args_os(), expected);
    assert_eq!(
        spec.working_dir.as_deref(),
        Some(std::path::Path::new("/home/frappe/frappe-bench"))
    );
    assert!(spec.prepend_program_dir_to_path);

    let rendered = spec.render("bench");
    assert!(rendered.contains("--admin-password=********"));
    assert!(!rendered.contains("secret"));

    let status = harness.service.tenant_status(created.tenant_id).await?;
    assert_eq!(status.site_url.as_deref(), Some("https://acme.example.com"));
    Ok(())
}

#[tokio::test]
async fn admin_password_is_stored_encrypted() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;
    let created = harness.service.create_tenant(acme()).await?;

    let tenant = harness.tenants.get(created.tenant_id).await?.unwrap();
    assert_ne!(tenant.admin_password_ciphertext, b"secret".to_vec());

    let decrypted = provisioner::crypto::decrypt_admin_password(
        &test_utils::test_crypto_key(),
        created.tenant_id,
        &tenant.admin_password_ciphertext,
    )?;
    assert_eq!(decrypted.expose(), SecretString::from("secret").expose());
    Ok(())
}

#[tokio::test]
async fn worker_loop_drains_queue_and_stops_on_shutdown() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;
    let created = harness.service.create_tenant(acme()).await?;
    harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;

    let shutdown = CancellationToken::new();
    let worker = harness.worker();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = harness.service.tenant_status(created.tenant_id).await?;
        if status.status == TenantStatus::Active {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "tenant never became active"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await???;
    Ok(())
}

#[tokio::test]
async fn panicking_attempt_ends_failed_and_can_be_retried() -> Result<()> {
    let harness = Harness::new(Script::Panic).await?;
    let created = harness.service.create_tenant(acme()).await?;
    let queued = harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;

    let handled = harness
        .worker()
        .claim_and_run_jobs(&CancellationToken::new())
        .await?;
    assert_eq!(handled, 1);

    let status = harness.service.tenant_status(created.tenant_id).await?;
    assert_eq!(status.status, TenantStatus::Failed);
    let last_error = status.last_error.unwrap();
    assert!(last_error.contains("panicked"), "{last_error}");
    assert!(last_error.contains("toolchain runner blew up"));

    let job = find_job(&harness.db, queued.job_id).await?;
    assert_eq!(job.status, ProvisionJobStatus::Failed);

    harness.runner.set_script(Script::Succeed);
    let retried = harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;
    assert_eq!(retried.status, TenantStatus::Queued);
    Ok(())
}

#[tokio::test]
async fn starting_a_second_worker_leaves_live_jobs_alone() -> Result<()> {
    let harness = Harness::new(Script::HangUntilCancelled).await?;
    let created = harness.service.create_tenant(acme()).await?;
    let queued = harness
        .service
        .enqueue_provision(Actor::Operator, created.tenant_id)
        .await?;

    let first_cancel = CancellationToken::new();
    let first = harness.worker();
    let first_token = first_cancel.clone();
    let first_run =
        tokio::spawn(async move { first.claim_and_run_jobs(&first_token).await });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while harness.runner.calls().is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "first attempt never started");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let second_shutdown = CancellationToken::new();
    let second = tokio::spawn(harness.worker().run(second_shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(harness.runner.calls().len(), 1);
    let job = find_job(&harness.db, queued.job_id).await?;
    assert_eq!(job.status, ProvisionJobStatus::Running);
    assert_eq!(job.attempts, 1);

    second_shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), second).await???;
    first_cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), first_run).await???;
    Ok(())
}

#[tokio::test]
async fn abandoned_job_is_recovered_after_stale_period() -> Result<()> {
    let harness = Harness::new(Script::Succeed).await?;
    let created = harness.service.create_tenant(acme()).await?;
    harness
        .tenants
        .update_field(created.tenant_id, TenantField::Status(TenantStatus::Provisioning))
        .await?;

    // A worker claimed this job and died without recording an outcome.
    let job_id = harness
        .jobs
        .submit(provisioner::repositories::ProvisionJobRequest {
            tenant_id: created.tenant_id,
        })
        .await?;
    assert_eq!(harness.jobs.claim_due(1).await?.len(), 1);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let worker = ProvisionWorker::new(
        harness.jobs.clone(),
        harness.orchestrator.clone(),
        WorkerConfig {
            tick_ms: 100,
            concurrency: 1,
            stale_after: Duration::ZERO,
        },
    );
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(worker.run(shutdown.clone()));

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let status = harness.service.tenant_status(created.tenant_id).await?;
        if status.status == TenantStatus::Active {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "abandoned job was never recovered"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(5), handle).await???;

    let job = find_job(&harness.db, job_id).await?;
    assert_eq!(job.status, ProvisionJobStatus::Succeeded);
    assert_eq!(job.attempts, 2);
    Ok(())
}
