use std::str::FromStr;

use waterflow_core::config::EngineConfig;
use waterflow_store::SqliteStore;

struct CheckResult {
    label: String,
    ok: bool,
    detail: String,
}

pub fn run_doctor(config: &EngineConfig) {
    let checks = vec![
        check_database(config),
        check_retry_schedule(config),
        check_backoff(config),
        check_relay(config),
    ];

    let mut ok_count = 0;
    let mut fail_count = 0;

    for check in &checks {
        let icon = if check.ok { "[OK]" } else { "[!!]" };
        println!("  {} {}: {}", icon, check.label, check.detail);
        if check.ok {
            ok_count += 1;
        } else {
            fail_count += 1;
        }
    }

    println!();
    println!("  {} passed, {} issues found", ok_count, fail_count);
}

fn check_database(config: &EngineConfig) -> CheckResult {
    let path = config.store_path();
    match SqliteStore::open(&path) {
        Ok(_) => CheckResult {
            label: "Database".into(),
            ok: true,
            detail: format!("{} accessible", path.display()),
        },
        Err(e) => CheckResult {
            label: "Database".into(),
            ok: false,
            detail: format!("{}: {}", path.display(), e),
        },
    }
}

fn check_retry_schedule(config: &EngineConfig) -> CheckResult {
    let Some(expr) = config.retry.schedule.as_deref() else {
        return CheckResult {
            label: "Retry schedule".into(),
            ok: true,
            detail: format!("every {}s", config.retry.scan_interval_secs),
        };
    };
    match cron::Schedule::from_str(expr) {
        Ok(_) => CheckResult {
            label: "Retry schedule".into(),
            ok: true,
            detail: format!("cron '{}'", expr),
        },
        Err(e) => CheckResult {
            label: "Retry schedule".into(),
            ok: false,
            detail: format!("invalid cron '{}': {}", expr, e),
        },
    }
}

fn check_backoff(config: &EngineConfig) -> CheckResult {
    let retry = &config.retry;
    let ok = retry.initial_backoff_ms <= retry.max_backoff_ms;
    CheckResult {
        label: "Retry backoff".into(),
        ok,
        detail: if ok {
            format!(
                "{}ms up to {}ms, {} attempts",
                retry.initial_backoff_ms, retry.max_backoff_ms, retry.max_retry
            )
        } else {
            "initial_backoff_ms is larger than max_backoff_ms".into()
        },
    }
}

fn check_relay(config: &EngineConfig) -> CheckResult {
    let url = &config.jober.http_relay_url;
    let ok = url.starts_with("http://") || url.starts_with("https://");
    CheckResult {
        label: "HTTP relay".into(),
        ok,
        detail: if ok {
            url.clone()
        } else {
            format!("'{}' is not an http(s) URL", url)
        },
    }
}
