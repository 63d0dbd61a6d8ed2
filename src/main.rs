use std::process::ExitCode;

use tracing_subscriber::EnvFilter;

use rmeter::prelude::*;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: rmeter <plan.rmeter>");
        return ExitCode::FAILURE;
    };

    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(e) => {
            eprintln!("failed to read {path}: {e}");
            return ExitCode::FAILURE;
        }
    };
    let plan = match TestPlan::from_json(&text) {
        Ok(plan) => plan,
        Err(e) => {
            eprintln!("invalid plan: {e}");
            return ExitCode::FAILURE;
        }
    };
    let plan_id = plan.id;
    println!("running plan {:?} ({plan_id})", plan.name);

    let runner = Runner::new();
    let mut events = runner.subscribe();
    if let Err(e) = runner.register_plan(plan).and_then(|()| runner.start_test(plan_id)) {
        eprintln!("failed to start: {e}");
        return ExitCode::FAILURE;
    }

    // Ctrl-C asks for a cooperative stop; a second Ctrl-C force-stops.
    let control = runner;
    let summary = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::Progress(p)) => {
                    println!(
                        "{:>8} done  {:>3} errors  {:>4} vus  {:>8.1} rps  p95 {} ms",
                        p.completed_requests, p.total_errors, p.active_vus, p.current_rps, p.p95_ms
                    );
                }
                Ok(EngineEvent::Status { status }) => println!("status: {status}"),
                Ok(EngineEvent::Complete(summary)) => break *summary,
                Ok(EngineEvent::Result(_)) => {}
                Err(_) => continue,
            },
            _ = tokio::signal::ctrl_c() => {
                if control.stop_test().is_err() {
                    let _ = control.force_stop_test();
                }
            }
        }
    };

    println!();
    println!("plan:       {}", summary.plan_name);
    println!("requests:   {} ({} failed)", summary.total_requests, summary.failed_requests);
    println!(
        "latency ms: min {} / mean {:.1} / p50 {} / p95 {} / p99 {} / max {}",
        summary.min_response_ms,
        summary.mean_response_ms,
        summary.p50_response_ms,
        summary.p95_response_ms,
        summary.p99_response_ms,
        summary.max_response_ms
    );
    println!("throughput: {:.1} req/s", summary.requests_per_second);
    println!("received:   {} bytes", summary.total_bytes_received);

    if control.last_error().is_some() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
