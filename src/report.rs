use crate::aggregator::LatencySummary;
use crate::error::Error;
use crate::orchestrator::RunReport;
use crate::sampler::ResourceSample;
use serde_json::json;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use time::macros::format_description;

const RULE_WIDTH: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Excellent,
    Good,
    Acceptable,
    NeedsImprovement,
    Inconclusive,
}

impl Verdict {
    /// Grades a run on its success rate (percent) and mean latency (ms).
    pub fn grade(success_rate: Option<f64>, mean_latency_ms: Option<f64>) -> Self {
        let (Some(rate), Some(latency)) = (success_rate, mean_latency_ms) else {
            return Verdict::Inconclusive;
        };

        if rate >= 99.0 && latency < 100.0 {
            Verdict::Excellent
        } else if rate >= 95.0 && latency < 200.0 {
            Verdict::Good
        } else if rate >= 90.0 && latency < 500.0 {
            Verdict::Acceptable
        } else {
            Verdict::NeedsImprovement
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Verdict::Excellent => "EXCELLENT: high success rate and low latency",
            Verdict::Good => "GOOD: high success rate and acceptable latency",
            Verdict::Acceptable => "ACCEPTABLE: usable, but there is room for improvement",
            Verdict::NeedsImprovement => "NEEDS IMPROVEMENT: poor performance, investigate",
            Verdict::Inconclusive => "INCONCLUSIVE: not enough data to grade the run",
        }
    }
}

pub fn verdict(report: &RunReport) -> Verdict {
    let latency = &report.snapshot.latency;
    let mean = (latency.count > 0).then_some(latency.mean_ms);
    Verdict::grade(report.snapshot.success_rate(), mean)
}

/// Files written for one run.
#[derive(Debug, Clone, PartialEq)]
pub struct ReportFiles {
    pub text: PathBuf,
    pub summary: PathBuf,
    pub resources_csv: PathBuf,
    pub latency_csv: PathBuf,
}

pub fn print_summary(report: &RunReport) {
    let snapshot = &report.snapshot;
    let duration = report.duration.as_secs_f64();

    println!("\n=== TEST RESULTS ===");
    if report.forced {
        println!("Run stopped by the global timeout");
    }
    println!("Test duration: {:.2} seconds", duration);
    println!(
        "Clients: {} spawned, {} connected, {} joined",
        report.clients_spawned, snapshot.clients_connected, snapshot.clients_joined
    );
    println!("Total messages sent: {}", snapshot.sent);
    println!("Total messages received: {}", snapshot.received);
    if let Some(rate) = snapshot.success_rate() {
        println!("Success rate: {:.2}%", rate);
    }
    println!(
        "Total errors: {} (timeouts: {})",
        snapshot.errors, snapshot.timeouts
    );
    for (kind, count) in &snapshot.errors_by_kind {
        println!("  - {}: {}", kind, count);
    }

    if snapshot.latency.count > 0 {
        let latency = &snapshot.latency;
        println!(
            "Latency: avg {:.2}ms, min {:.2}ms, max {:.2}ms, p95 {:.2}ms",
            latency.mean_ms, latency.min_ms, latency.max_ms, latency.p95_ms
        );
    } else {
        println!("No latency data available");
    }

    if let Some((cpu, memory)) = resource_averages(&report.samples) {
        println!("Average CPU usage: {:.1}%", cpu);
        println!("Average memory usage: {:.1}%", memory);
    }
    println!("{}", verdict(report).describe());
}

/// Writes the text report, the JSON summary and both CSV series under `dir`.
pub fn write_reports(report: &RunReport, dir: &Path) -> Result<ReportFiles, Error> {
    fs::create_dir_all(dir)
        .map_err(|e| Error::ReportError(format!("can't create {}: {}", dir.display(), e)))?;

    let stamp = report
        .started_at
        .format(format_description!("[year][month][day]_[hour][minute][second]"))?;

    let files = ReportFiles {
        text: dir.join(format!("stress_test_report_{}.txt", stamp)),
        summary: dir.join(format!("stress_test_summary_{}.json", stamp)),
        resources_csv: dir.join(format!("resources_{}.csv", stamp)),
        latency_csv: dir.join(format!("latency_over_time_{}.csv", stamp)),
    };

    fs::write(&files.text, render_text_report(report)?)?;
    fs::write(&files.summary, render_summary_json(report)?)?;
    fs::write(&files.resources_csv, render_resources_csv(&report.samples))?;
    fs::write(&files.latency_csv, render_latency_csv(report))?;

    Ok(files)
}

pub fn render_text_report(report: &RunReport) -> Result<String, Error> {
    let config = &report.config;
    let snapshot = &report.snapshot;
    let duration = report.duration.as_secs_f64();
    let started = report
        .started_at
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))?;

    let mut out = String::new();
    let rule = "=".repeat(RULE_WIDTH);
    // Writing to a String can't fail
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "WEBSOCKET STRESS TEST REPORT - {} UTC", started);
    let _ = writeln!(out, "Run id: {}", report.run_id);
    let _ = writeln!(out, "{}\n", rule);

    section(&mut out, "CONFIGURATION");
    let _ = writeln!(out, "Server URL: {}", config.server_url);
    let _ = writeln!(out, "Conversation ID: {}", config.conversation_id);
    let _ = writeln!(out, "Number of clients: {}", report.clients_spawned);
    let _ = writeln!(out, "Messages per client: {}", config.messages_per_client);
    let _ = writeln!(out, "Delay between messages: {} ms", config.message_delay_ms);
    let _ = writeln!(out, "Inactivity timeout: {} seconds", config.inactivity_timeout_secs);
    let _ = writeln!(out, "Global timeout: {} seconds", config.global_timeout_secs);
    if let Some(max_forwards) = config.max_forwards {
        let _ = writeln!(out, "Max forwards per client: {}", max_forwards);
    }
    out.push('\n');

    section(&mut out, "SUMMARY RESULTS");
    let _ = writeln!(out, "Test duration: {:.2} seconds", duration);
    if report.forced {
        let _ = writeln!(out, "Stopped by the global timeout");
    }
    let _ = writeln!(out, "Clients connected: {}", snapshot.clients_connected);
    let _ = writeln!(out, "Clients joined: {}", snapshot.clients_joined);
    let _ = writeln!(out, "Total messages sent: {}", snapshot.sent);
    let _ = writeln!(out, "Total messages received: {}", snapshot.received);
    if let Some(rate) = snapshot.success_rate() {
        let _ = writeln!(out, "Success rate: {:.2}%", rate);
    }
    let _ = writeln!(out, "Unanswered messages: {}", snapshot.unresolved);
    let _ = writeln!(out, "Total errors: {}", snapshot.errors);
    let _ = writeln!(out, "Timeouts: {}", snapshot.timeouts);
    for (state, count) in report.outcome_counts() {
        let _ = writeln!(out, "Clients ended {}: {}", state, count);
    }
    out.push('\n');

    section(&mut out, "LATENCY STATISTICS");
    if snapshot.latency.count > 0 {
        write_latency(&mut out, &snapshot.latency);
    } else {
        let _ = writeln!(out, "No latency data available");
    }
    out.push('\n');

    section(&mut out, "SYSTEM RESOURCE USAGE");
    write_resources(&mut out, &report.samples);
    out.push('\n');

    section(&mut out, "ERROR DETAILS");
    if snapshot.errors > 0 {
        let _ = writeln!(out, "Total errors: {}", snapshot.errors);
        let _ = writeln!(out, "Error breakdown:");
        for (kind, count) in &snapshot.errors_by_kind {
            let _ = writeln!(out, "  - {}: {}", kind, count);
        }
        let _ = writeln!(out, "Details:");
        for (detail, count) in &snapshot.error_details {
            let _ = writeln!(out, "  - {}: {}", detail, count);
        }
    } else {
        let _ = writeln!(out, "No errors recorded");
    }
    out.push('\n');

    section(&mut out, "CONVERSATION SIZE STATISTICS");
    if snapshot.latency_by_size.is_empty() {
        let _ = writeln!(out, "No conversation size data available");
    } else {
        let _ = writeln!(out, "Latency by number of participants:");
        for (size, summary) in &snapshot.latency_by_size {
            let _ = writeln!(out, "  - Size: {}, Samples: {}", size, summary.count);
            let _ = writeln!(
                out,
                "    Average: {:.2} ms, Min: {:.2} ms, Max: {:.2} ms, Median: {:.2} ms",
                summary.mean_ms, summary.min_ms, summary.max_ms, summary.median_ms
            );
        }
    }
    out.push('\n');

    section(&mut out, "PERFORMANCE METRICS");
    if duration > 0.0 {
        let _ = writeln!(
            out,
            "Messages sent per second: {:.2}",
            snapshot.sent as f64 / duration
        );
        if snapshot.received > 0 {
            let _ = writeln!(
                out,
                "Message throughput (received/second): {:.2}",
                snapshot.received as f64 / duration
            );
        }
    }
    out.push('\n');

    section(&mut out, "CONCLUSION");
    let verdict = verdict(report);
    let _ = writeln!(out, "{}", verdict.describe());
    if verdict != Verdict::Inconclusive {
        let _ = writeln!(
            out,
            "Success rate: {:.2}%, Average latency: {:.2} ms",
            snapshot.success_rate().unwrap_or_default(),
            snapshot.latency.mean_ms
        );
    }

    Ok(out)
}

pub fn render_summary_json(report: &RunReport) -> Result<String, Error> {
    let summary = json!({
        "run_id": report.run_id.to_string(),
        "duration_secs": report.duration.as_secs_f64(),
        "forced": report.forced,
        "clients_spawned": report.clients_spawned,
        "config": report.config,
        "statistics": report.snapshot,
        "outcomes": report.outcomes,
        "samples": report.samples,
    });
    Ok(serde_json::to_string_pretty(&summary)?)
}

pub fn render_resources_csv(samples: &[ResourceSample]) -> String {
    let mut out = String::from(
        "elapsed_secs,cpu_percent,memory_percent,sent_total,received_total,sent_delta,received_delta\n",
    );
    for sample in samples {
        let _ = writeln!(
            out,
            "{:.3},{:.2},{:.2},{},{},{},{}",
            sample.elapsed_secs,
            sample.cpu_percent,
            sample.memory_percent,
            sample.sent_total,
            sample.received_total,
            sample.sent_delta,
            sample.received_delta
        );
    }
    out
}

pub fn render_latency_csv(report: &RunReport) -> String {
    let mut out = String::from("elapsed_secs,latency_ms\n");
    for point in &report.snapshot.latency_timeline {
        let _ = writeln!(out, "{:.3},{:.3}", point.elapsed_secs, point.latency_ms);
    }
    out
}

/// Mean CPU and memory usage over the samples.
pub fn resource_averages(samples: &[ResourceSample]) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let count = samples.len() as f64;
    let cpu = samples.iter().map(|s| s.cpu_percent).sum::<f64>() / count;
    let memory = samples.iter().map(|s| s.memory_percent).sum::<f64>() / count;
    Some((cpu, memory))
}

fn section(out: &mut String, title: &str) {
    let _ = writeln!(out, "{}", title);
    let _ = writeln!(out, "{}", "-".repeat(RULE_WIDTH));
}

fn write_latency(out: &mut String, latency: &LatencySummary) {
    let _ = writeln!(out, "Average latency: {:.2} ms", latency.mean_ms);
    let _ = writeln!(out, "Minimum latency: {:.2} ms", latency.min_ms);
    let _ = writeln!(out, "Maximum latency: {:.2} ms", latency.max_ms);
    let _ = writeln!(out, "Median latency: {:.2} ms", latency.median_ms);
    let _ = writeln!(out, "90th percentile: {:.2} ms", latency.p90_ms);
    let _ = writeln!(out, "95th percentile: {:.2} ms", latency.p95_ms);
    let _ = writeln!(out, "99th percentile: {:.2} ms", latency.p99_ms);
    let _ = writeln!(out, "Standard deviation: {:.2} ms", latency.std_dev_ms);
    let _ = writeln!(out, "Total samples: {}", latency.count);
}

fn write_resources(out: &mut String, samples: &[ResourceSample]) {
    if samples.is_empty() {
        let _ = writeln!(out, "No resource usage data available");
        return;
    }

    let stats = |values: Vec<f64>| {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        (mean, max, min)
    };

    let (avg_cpu, max_cpu, min_cpu) = stats(samples.iter().map(|s| s.cpu_percent).collect());
    let (avg_mem, max_mem, min_mem) = stats(samples.iter().map(|s| s.memory_percent).collect());

    let _ = writeln!(out, "Average CPU usage: {:.2}%", avg_cpu);
    let _ = writeln!(out, "Maximum CPU usage: {:.2}%", max_cpu);
    let _ = writeln!(out, "Minimum CPU usage: {:.2}%", min_cpu);
    let _ = writeln!(out, "Average memory usage: {:.2}%", avg_mem);
    let _ = writeln!(out, "Maximum memory usage: {:.2}%", max_mem);
    let _ = writeln!(out, "Minimum memory usage: {:.2}%", min_mem);
}
