use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use tickchat_transport::TcpTransport;

use crate::cmd::DoctorArgs;
use crate::exit::{CliResult, HEALTH_CHECK_FAILED, SUCCESS};
use crate::output::OutputFormat;

/// Descriptors a default-sized server needs: two full pools plus listener,
/// wakers and a few channel workers.
const RECOMMENDED_FD_LIMIT: u64 = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum CheckStatus {
    Pass,
    Fail,
    Warn,
    Info,
}

#[derive(Debug, Serialize)]
struct CheckResult {
    name: String,
    status: CheckStatus,
    detail: String,
}

impl CheckResult {
    fn new(name: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Serialize)]
struct DoctorOutput {
    checks: Vec<CheckResult>,
    overall: &'static str,
}

pub fn run(args: DoctorArgs, format: OutputFormat) -> CliResult<i32> {
    let checks = vec![
        multiplexer_check(),
        waker_check(),
        fd_limit_check(),
        port_check(&args.host, args.port),
        compiled_features_check(),
    ];

    let has_fail = checks.iter().any(|c| c.status == CheckStatus::Fail);
    let output = DoctorOutput {
        checks,
        overall: if has_fail { "fail" } else { "pass" },
    };

    print_doctor(&output, format);

    if has_fail {
        Ok(HEALTH_CHECK_FAILED)
    } else {
        Ok(SUCCESS)
    }
}

fn print_doctor(output: &DoctorOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(output).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CHECK", "STATUS", "DETAIL"]);
            for c in &output.checks {
                table.add_row(vec![
                    c.name.clone(),
                    status_text(c.status).to_string(),
                    c.detail.clone(),
                ]);
            }
            println!("{table}");
            println!("overall: {}", output.overall);
        }
        OutputFormat::Pretty => {
            println!("tickchat doctor\n");
            for c in &output.checks {
                println!(
                    "  [{:>4}] {:<18} {}",
                    status_text(c.status),
                    c.name,
                    c.detail
                );
            }
            if output.overall == "pass" {
                println!("\n  Result: all checks passed");
            } else {
                println!("\n  Result: one or more checks failed");
            }
        }
        OutputFormat::Raw => {
            println!("{}", output.overall);
        }
    }
}

fn status_text(status: CheckStatus) -> &'static str {
    match status {
        CheckStatus::Pass => "PASS",
        CheckStatus::Fail => "FAIL",
        CheckStatus::Warn => "WARN",
        CheckStatus::Info => "INFO",
    }
}

fn multiplexer_check() -> CheckResult {
    #[cfg(target_os = "linux")]
    {
        match tickchat_transport::Multiplexer::<std::net::TcpStream>::new(1) {
            Ok(_) => CheckResult::new("multiplexer", CheckStatus::Pass, "epoll available"),
            Err(err) => CheckResult::new("multiplexer", CheckStatus::Fail, err.to_string()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        CheckResult::new(
            "multiplexer",
            CheckStatus::Fail,
            "epoll is only available on Linux",
        )
    }
}

fn waker_check() -> CheckResult {
    #[cfg(target_os = "linux")]
    {
        match tickchat_transport::Waker::new() {
            Ok(_) => CheckResult::new("waker", CheckStatus::Pass, "eventfd available"),
            Err(err) => CheckResult::new("waker", CheckStatus::Fail, err.to_string()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        CheckResult::new("waker", CheckStatus::Fail, "eventfd is only available on Linux")
    }
}

fn fd_limit_check() -> CheckResult {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a valid, writable rlimit for the duration of the call.
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc != 0 {
        return CheckResult::new(
            "fd_limit",
            CheckStatus::Warn,
            format!("getrlimit failed: {}", std::io::Error::last_os_error()),
        );
    }
    classify_fd_limit(u64::from(limit.rlim_cur), u64::from(limit.rlim_max))
}

fn classify_fd_limit(soft: u64, hard: u64) -> CheckResult {
    let detail = format!("soft={soft} hard={hard}");
    if soft >= RECOMMENDED_FD_LIMIT {
        CheckResult::new("fd_limit", CheckStatus::Pass, detail)
    } else {
        CheckResult::new(
            "fd_limit",
            CheckStatus::Warn,
            format!("{detail} (below {RECOMMENDED_FD_LIMIT}; raise with ulimit -n)"),
        )
    }
}

fn port_check(host: &str, port: u16) -> CheckResult {
    let addr = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    };
    match TcpTransport::bind(addr.as_str()) {
        Ok(_) => CheckResult::new("port", CheckStatus::Pass, format!("{addr} is free")),
        Err(err) => CheckResult::new("port", CheckStatus::Warn, err.to_string()),
    }
}

fn compiled_features_check() -> CheckResult {
    let mut features = Vec::new();
    if cfg!(feature = "server") {
        features.push("server");
    }
    if cfg!(feature = "async") {
        features.push("async");
    }
    if cfg!(feature = "cli") {
        features.push("cli");
    }

    CheckResult::new("compiled_features", CheckStatus::Info, features.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doctor_output_has_overall_status() {
        let output = DoctorOutput {
            checks: vec![CheckResult::new("x", CheckStatus::Pass, "ok")],
            overall: "pass",
        };
        let json = serde_json::to_string(&output).expect("doctor output should serialize");
        assert!(json.contains("\"overall\":\"pass\""));
        assert!(json.contains("\"status\":\"pass\""));
    }

    #[test]
    fn low_fd_limit_warns() {
        assert_eq!(classify_fd_limit(256, 4096).status, CheckStatus::Warn);
        assert_eq!(classify_fd_limit(1024, 4096).status, CheckStatus::Pass);
    }

    #[test]
    fn occupied_port_warns() {
        let taken = TcpTransport::bind("127.0.0.1:0").expect("ephemeral bind should work");
        let port = taken.local_addr().port();
        assert_eq!(port_check("127.0.0.1", port).status, CheckStatus::Warn);
    }
}
