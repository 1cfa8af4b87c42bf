//! Deployment failure diagnosis.
//!
//! Classifies raw deployer output into actionable categories and extracts
//! the deployed route on success. Pure text analysis; the quality-gate
//! evaluator applies the resulting retry or terminal effects.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Category of a diagnosed deployment failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiagnosisCategory {
    BuildFailure,
    StagingFailure,
    AppCrashed,
    HealthCheckTimeout,
    ServiceBindingFailure,
    Unknown,
}

impl fmt::Display for DiagnosisCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::BuildFailure => "BUILD_FAILURE",
            Self::StagingFailure => "STAGING_FAILURE",
            Self::AppCrashed => "APP_CRASHED",
            Self::HealthCheckTimeout => "HEALTH_CHECK_TIMEOUT",
            Self::ServiceBindingFailure => "SERVICE_BINDING_FAILURE",
            Self::Unknown => "UNKNOWN",
        };
        f.write_str(s)
    }
}

/// A classified deployment failure with an actionable hint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentDiagnosis {
    pub category: DiagnosisCategory,
    /// One-line remediation hint surfaced to the operator and the retry.
    pub hint: String,
    /// Context block prepended to the deployer task's input on retry.
    pub enriched_context: String,
    /// Service name extracted for binding failures, when the output names one.
    pub service_name: Option<String>,
}

/// Outcome of analyzing one deployer attempt's output.
#[derive(Debug, Clone, PartialEq)]
pub enum DeployOutcome {
    /// The platform reported the app running.
    Success {
        /// First route-shaped token found in the output, if any.
        deployment_url: Option<String>,
    },
    Failure(DeploymentDiagnosis),
}

static SERVICE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)services?\s+['"]?([a-z0-9-]+)['"]?"#).expect("service-name regex")
});

static ROUTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b[a-z0-9-]+(?:\.[a-z0-9-]+){2,}\b").expect("route regex")
});

const SUCCESS_MARKERS: &[&str] = &["status: running", "instances: 1/1", "app started"];

const FAILURE_MARKERS: &[&str] = &[
    "crashed",
    "start unsuccessful",
    "failed\n",
    "staging error",
    "build failure",
    "error staging",
];

/// Analyze raw deployer output (possibly absent).
pub fn analyze(output: Option<&str>) -> DeployOutcome {
    let raw = match output {
        Some(s) if !s.trim().is_empty() => s,
        _ => return DeployOutcome::Failure(diagnose_unknown()),
    };
    let lower = raw.to_lowercase();

    if has_success_marker(&lower) && !has_failure_marker(&lower) {
        return DeployOutcome::Success {
            deployment_url: extract_route(raw),
        };
    }

    DeployOutcome::Failure(diagnose(&lower))
}

fn has_success_marker(lower: &str) -> bool {
    if SUCCESS_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    // "OK" counts only as a standalone status line.
    lower.lines().any(|line| line.trim() == "ok")
}

fn has_failure_marker(lower: &str) -> bool {
    if FAILURE_MARKERS.iter().any(|m| lower.contains(m)) {
        return true;
    }
    health_check_failed(lower)
}

fn health_check_failed(lower: &str) -> bool {
    (lower.contains("health check") && (lower.contains("fail") || lower.contains("did not pass")))
        || (lower.contains("timed out") && lower.contains("health"))
        || lower.contains("start app timeout")
}

/// Classify a failing output. Categories are checked in priority order and
/// the first match wins.
fn diagnose(lower: &str) -> DeploymentDiagnosis {
    if lower.contains("build failure") || lower.contains("failed to execute goal") {
        return make(
            DiagnosisCategory::BuildFailure,
            "fix pom.xml / dependencies",
            "The build failed before the application could be packaged. Inspect \
             the build output, fix pom.xml / dependencies, and rebuild.",
            None,
        );
    }

    if lower.contains("staging error")
        || lower.contains("stagingerror")
        || lower.contains("unable to detect buildpack")
    {
        return make(
            DiagnosisCategory::StagingFailure,
            "buildpack selection / manifest",
            "Staging failed on the platform. Check buildpack selection / manifest \
             (explicit `buildpacks:` entry, correct artifact path).",
            None,
        );
    }

    if lower.contains("crashed") && !has_success_marker(lower) {
        let hint = if lower.contains("memory") || lower.contains("out of memory") {
            "increase the memory allocation in the manifest"
        } else {
            "check crash logs"
        };
        return make(
            DiagnosisCategory::AppCrashed,
            hint,
            "The application started and then crashed. Review the crash output \
             below and address the root cause before pushing again.",
            None,
        );
    }

    if health_check_failed(lower) {
        return make(
            DiagnosisCategory::HealthCheckTimeout,
            "increase `health-check-timeout` in manifest",
            "The platform gave up waiting for the app to become healthy. Increase \
             `health-check-timeout` in manifest, or make startup faster.",
            None,
        );
    }

    if (lower.contains("binding service") && lower.contains("failed"))
        || lower.contains("could not find service")
        || lower.contains("service binding failed")
    {
        let service_name = extract_service_name(lower);
        let hint = match &service_name {
            Some(name) => format!("run `cf create-service {name}` before redeploying"),
            None => "create the missing service instance before redeploying".to_owned(),
        };
        return DeploymentDiagnosis {
            category: DiagnosisCategory::ServiceBindingFailure,
            enriched_context: format!(
                "A required service binding failed. {hint}, then bind it in the \
                 manifest's services block."
            ),
            hint,
            service_name,
        };
    }

    diagnose_unknown()
}

fn diagnose_unknown() -> DeploymentDiagnosis {
    make(
        DiagnosisCategory::Unknown,
        "inspect raw output",
        "The deployer output did not match any known failure pattern. Inspect \
         the raw output below and address whatever the platform reported.",
        None,
    )
}

fn make(
    category: DiagnosisCategory,
    hint: &str,
    enriched_context: &str,
    service_name: Option<String>,
) -> DeploymentDiagnosis {
    DeploymentDiagnosis {
        category,
        hint: hint.to_owned(),
        enriched_context: enriched_context.to_owned(),
        service_name,
    }
}

/// Extract the service name from a binding-failure line.
///
/// Filters out the generic words that follow "service" in prose so a miss
/// never interpolates a junk token (and the caller never prints "null").
fn extract_service_name(lower: &str) -> Option<String> {
    for cap in SERVICE_NAME_RE.captures_iter(lower) {
        let name = cap[1].to_owned();
        if matches!(name.as_str(), "binding" | "bindings" | "instance" | "failed") {
            continue;
        }
        return Some(name);
    }
    None
}

/// Extract the first route-shaped token (`host.domain.tld`) from raw output.
fn extract_route(raw: &str) -> Option<String> {
    ROUTE_RE
        .find_iter(raw)
        .map(|m| m.as_str().to_owned())
        .find(|candidate| candidate.chars().any(|c| c.is_ascii_alphabetic()))
}

impl DeploymentDiagnosis {
    /// Render the terminal error recorded when the retry budget is spent.
    pub fn terminal_message(&self, task_id: &str) -> String {
        match &self.service_name {
            Some(name) => format!(
                "Deployment failed for {task_id}: {} (service {name}) -- {}",
                self.category, self.hint
            ),
            None => format!(
                "Deployment failed for {task_id}: {} -- {}",
                self.category, self.hint
            ),
        }
    }

    /// Render the retry context stored in state when another attempt remains.
    pub fn retry_context(&self, task_id: &str) -> String {
        format!(
            "{task_id} deployment attempt failed with {}.\nHint: {}\n{}",
            self.category, self.hint, self.enriched_context
        )
    }
}
