//! scriptflow-sim — 启动配置模拟器：在内存宿主中运行编排队列并打印注入顺序
//!
//! Usage:
//!   scriptflow-sim run [<boot-file>]     Simulate a boot file (default: $SCRIPTFLOW_CONFIG)
//!   scriptflow-sim check [<boot-file>]   Validate a boot file without running it
//!   scriptflow-sim --demo                Simulate the built-in demo page

use anyhow::{bail, Context};
use scriptflow::ad::RecordingRenderer;
use scriptflow::host::{
    ActivityKind, Clock, Host, IdleFrame, ReadyState, RecordingInjector, SimulatedIdleScheduler,
    TokioClock,
};
use scriptflow::{BootConfig, ScriptQueue, ServiceRegistry};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const DEMO: &str = r#"
idle:
  overall_timeout_ms: 3000
services:
  - kind: consent
    config: { name: consent, url: "https://cmp.example/cmp.js" }
    after: interactive
  - kind: gpt
    config: { name: gpt, url: "https://ads.example/gpt.js", debug: true }
    after: { service: consent }
  - kind: tagmanager
    config: { name: Tag Manager, url: "https://tags.example/gtm.js" }
    after: complete
  - kind: analytics
    config: { name: analytics, url: "https://stats.example/a.js" }
    after: idle
  - kind: chat
    config: { name: chat, url: "https://chat.example/widget.js" }
    after: user_activity
ad_library: gpt
slots:
  - id: top
    config: { retry_delay: 5, retry_count: 3 }
"#;

const LOAD_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("scriptflow=info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let Some(command) = args.get(1) else {
        print_usage();
        std::process::exit(1);
    };

    match command.as_str() {
        "run" => {
            let config = load(args.get(2)).await?;
            simulate(config).await
        }
        "check" => cmd_check(args.get(2)).await,
        "--demo" | "demo" => simulate(BootConfig::from_yaml_str(DEMO)?).await,
        "version" | "--version" | "-V" => {
            println!("scriptflow-sim {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"scriptflow-sim — 脚本编排模拟器

USAGE:
    scriptflow-sim <COMMAND> [OPTIONS]

COMMANDS:
    run [<boot-file>]       Simulate a boot file and print the injection order
    check [<boot-file>]     Validate a boot file
    --demo                  Simulate the built-in demo page
    version                 Show version information
    help                    Show this help message

ENVIRONMENT:
    SCRIPTFLOW_CONFIG       Boot file used when none is given
    RUST_LOG                Log filter (default: scriptflow=info)"#
    );
}

async fn load(path: Option<&String>) -> anyhow::Result<BootConfig> {
    match path {
        Some(path) => BootConfig::from_path(path)
            .await
            .with_context(|| format!("failed to load boot file {path}")),
        None => BootConfig::from_env()
            .await
            .context("no boot file given and SCRIPTFLOW_CONFIG is not usable"),
    }
}

async fn cmd_check(path: Option<&String>) -> anyhow::Result<()> {
    let config = load(path).await?;
    config.validate()?;
    println!(
        "✅ {} services, {} slots",
        config.services.len(),
        config.slots.len()
    );
    for entry in &config.services {
        match &entry.after {
            Some(after) => println!("  {} after {:?}", entry.kind, after),
            None => println!("  {} after queue start", entry.kind),
        }
    }
    Ok(())
}

async fn simulate(config: BootConfig) -> anyhow::Result<()> {
    if config.services.is_empty() {
        bail!("boot file declares no services");
    }

    let clock: Arc<dyn Clock> = Arc::new(TokioClock);
    let mut injector = RecordingInjector::new().with_clock(clock.clone());
    for entry in &config.services {
        if let Some(url) = &entry.config.url {
            injector = injector.with_latency(url.clone(), Duration::from_millis(40));
        }
    }
    let injector = Arc::new(injector);
    let idle = SimulatedIdleScheduler::new(clock.clone())
        .with_frames([IdleFrame::from_millis(30, 6); 20])
        .then_repeat(IdleFrame::from_millis(1, 49));
    let host = Host::builder()
        .with_clock(clock.clone())
        .with_injector(injector.clone())
        .with_idle(Arc::new(idle))
        .build()?;

    let registry = ServiceRegistry::new(host.clone());
    let queue = ScriptQueue::new(host.clone());
    let renderer = Arc::new(RecordingRenderer::new());
    let ads = config.ad_slots(&registry, renderer.clone())?;
    let queued = config.apply(&registry, &queue)?;

    let t0 = clock.now();
    queue.start();

    // Page timeline: parse, load, then the visitor starts interacting.
    let page = host.clone();
    tokio::spawn(async move {
        page.clock.sleep(Duration::from_millis(50)).await;
        page.document.advance(ReadyState::Interactive);
        page.clock.sleep(Duration::from_millis(200)).await;
        page.document.advance(ReadyState::Complete);
        page.clock.sleep(Duration::from_millis(1500)).await;
        page.activity.emit(ActivityKind::PointerMove);
    });

    if let Some((ads, slots)) = &ads {
        for slot in slots {
            ads.activate(slot).await;
            ads.feed().publish_raw(slot.id(), "filled");
        }
    }

    let loads = futures::future::join_all(queued.iter().map(|s| s.load()));
    if tokio::time::timeout(LOAD_TIMEOUT, loads).await.is_err() {
        eprintln!("⚠️  some services did not settle within {LOAD_TIMEOUT:?}");
    }

    println!("=== Injection Order ===");
    for record in injector.records() {
        let started = record.started_at.saturating_duration_since(t0);
        let finished = record
            .finished_at
            .map(|at| format!("{:>6}ms", at.saturating_duration_since(t0).as_millis()))
            .unwrap_or_else(|| "     -  ".to_string());
        println!(
            "  {:>6}ms → {}  {} {} ({})",
            started.as_millis(),
            finished,
            if record.succeeded { "✅" } else { "❌" },
            record.element_id,
            record.url
        );
    }

    for service in &queued {
        if !service.loaded() {
            println!(
                "  not loaded: {}",
                service.config().name.as_deref().unwrap_or("<unnamed>")
            );
        }
    }

    if let Some((_, slots)) = &ads {
        println!("\n=== Ad Slots ===");
        for slot in slots {
            println!(
                "  {}: {} (activations: {})",
                slot.id(),
                slot.status(),
                renderer.activations(slot.id())
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptflow::config::GateSpec;

    #[test]
    fn test_demo_page_is_valid() {
        let config = BootConfig::from_yaml_str(DEMO).unwrap();
        config.validate().unwrap();
        assert_eq!(
            config.services[1].after,
            Some(GateSpec::Service("consent".to_string()))
        );
        assert_eq!(config.services[4].after, Some(GateSpec::UserActivity));
        assert_eq!(config.ad_library.as_deref(), Some("gpt"));
    }
}
