//! Pipeline Integration Tests
//!
//! Tests for pipeline loading, validation, timeouts and retry policies.

use std::time::Duration;

use ferry::core::{Pipeline, RetryPolicy, SafetyLimits};
use ferry::domain::StepKind;
use tempfile::TempDir;

const FULL_PIPELINE: &str = r#"
name: release
description: Provision, build, sign, package and publish

limits:
  step_timeout_seconds: 120
  run_timeout_seconds: 1800

steps:
  - name: toolchain
    kind: provision
    options:
      channel: "1.75"
      target: ${run.target}

  - name: build
    kind: build
    timeout_seconds: 600
    options:
      binary: app
      mode: release
      features: tls,cli
      toolchain: ${toolchain.toolchain}

  - name: sign
    kind: sign

  - name: package
    kind: package
    options:
      package_id: app-${run.channel}

  - name: publish
    kind: publish
    options:
      package: package
    retry_policy:
      max_attempts: 3
      initial_delay_ms: 500
      max_delay_ms: 5000
      backoff_multiplier: 1.5
"#;

#[test]
fn test_full_pipeline_parses_and_validates() {
    let pipeline = Pipeline::from_yaml(FULL_PIPELINE).unwrap();
    pipeline.validate().unwrap();

    let kinds: Vec<StepKind> = pipeline.steps.iter().map(|s| s.kind).collect();
    assert_eq!(
        kinds,
        vec![
            StepKind::Provision,
            StepKind::Build,
            StepKind::Sign,
            StepKind::Package,
            StepKind::Publish,
        ]
    );

    let declared = pipeline.declared_steps();
    assert_eq!(declared[2].name, "sign");
    assert_eq!(pipeline.step_index("publish"), Some(4));
    assert_eq!(pipeline.package_step_for(4), Some(3));
}

#[test]
fn test_step_timeouts() {
    let pipeline = Pipeline::from_yaml(FULL_PIPELINE).unwrap();

    assert_eq!(pipeline.limits.step_timeout_seconds, 120);
    assert_eq!(pipeline.limits.run_timeout_seconds, 1800);

    // Per-step override, then fallback to the pipeline limit
    let build = pipeline.get_step("build").unwrap();
    assert_eq!(build.timeout(&pipeline.limits), Duration::from_secs(600));
    let sign = pipeline.get_step("sign").unwrap();
    assert_eq!(sign.timeout(&pipeline.limits), Duration::from_secs(120));
}

#[test]
fn test_retry_policy_parsing() {
    let pipeline = Pipeline::from_yaml(FULL_PIPELINE).unwrap();

    let publish = pipeline.get_step("publish").unwrap();
    assert_eq!(publish.retry_policy.max_attempts, 3);
    assert_eq!(publish.retry_policy.initial_delay_ms, 500);
    assert_eq!(publish.retry_policy.max_delay_ms, 5000);
    assert_eq!(publish.retry_policy.backoff_multiplier, 1.5);

    // No retry unless asked for
    let build = pipeline.get_step("build").unwrap();
    assert_eq!(build.retry_policy, RetryPolicy::default());
    assert!(!build.retry_policy.should_retry(1));
}

#[test]
fn test_retry_should_retry() {
    let policy = RetryPolicy {
        max_attempts: 3,
        ..Default::default()
    };

    assert!(policy.should_retry(1));
    assert!(policy.should_retry(2));
    assert!(!policy.should_retry(3));
}

#[test]
fn test_defaults_apply_only_without_limits() {
    let temp = TempDir::new().unwrap();
    let defaults = SafetyLimits {
        step_timeout_seconds: 42,
        ..Default::default()
    };

    let with_limits = temp.path().join("with.yaml");
    std::fs::write(&with_limits, FULL_PIPELINE).unwrap();
    let pipeline = Pipeline::from_file_with_defaults(&with_limits, &defaults).unwrap();
    assert_eq!(pipeline.limits.step_timeout_seconds, 120);

    let without_limits = temp.path().join("without.yaml");
    std::fs::write(
        &without_limits,
        "name: bare\nsteps:\n  - name: toolchain\n    kind: provision\n",
    )
    .unwrap();
    let pipeline = Pipeline::from_file_with_defaults(&without_limits, &defaults).unwrap();
    assert_eq!(pipeline.limits.step_timeout_seconds, 42);
}

#[test]
fn test_missing_file_is_an_error() {
    let temp = TempDir::new().unwrap();
    let err = Pipeline::from_file(&temp.path().join("nope.yaml")).unwrap_err();
    assert!(err.to_string().contains("Failed to read pipeline file"));
}

#[test]
fn test_unknown_step_kind_is_a_parse_error() {
    let yaml = "name: x\nsteps:\n  - name: deploy\n    kind: deploy\n";
    assert!(Pipeline::from_yaml(yaml).is_err());
}

#[test]
fn test_validation_failures() {
    let cases = [
        ("empty name", "name: ''\nsteps:\n  - name: a\n    kind: provision\n"),
        ("no steps", "name: x\nsteps: []\n"),
        (
            "reserved name",
            "name: x\nsteps:\n  - name: run\n    kind: provision\n",
        ),
        (
            "publish names a non-package step",
            "name: x\nsteps:\n  - name: tc\n    kind: provision\n  - name: sign\n    kind: sign\n  - name: publish\n    kind: publish\n    options: { package: tc }\n",
        ),
        (
            "unterminated reference",
            "name: x\nsteps:\n  - name: b\n    kind: build\n    options: { binary: \"${run.version\" }\n",
        ),
        (
            "too many steps",
            "name: x\nlimits: { max_steps: 1 }\nsteps:\n  - name: a\n    kind: provision\n  - name: b\n    kind: provision\n",
        ),
    ];

    for (label, yaml) in cases {
        let pipeline = Pipeline::from_yaml(yaml).unwrap();
        assert!(pipeline.validate().is_err(), "expected rejection: {}", label);
    }
}
