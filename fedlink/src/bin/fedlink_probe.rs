use fedlink::core::config::JobConfig;
use fedlink::job::JobOutcome;
use fedlink::FedClient;

fn usage() -> ! {
    eprintln!("Usage: fedlink_probe <endpoint> <model> <version> [auth_token]");
    eprintln!();
    eprintln!("Runs one cycle negotiation and prints the outcome.");
    eprintln!();
    eprintln!("Example:");
    eprintln!("  RUST_LOG=fedlink=debug fedlink_probe ws://127.0.0.1:5000 mnist 1.0.0");
    std::process::exit(2);
}

#[tokio::main]
async fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("fedlink=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if !(3..=4).contains(&args.len()) {
        usage();
    }

    let mut builder = JobConfig::builder(args[0].as_str(), args[1].as_str(), args[2].as_str());
    if let Some(token) = args.get(3) {
        builder = builder.auth_token(token.as_str());
    }
    let config = match builder.build() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(2);
        }
    };

    let client = FedClient::builder().build();
    let job = match client.new_job(config) {
        Ok(job) => job,
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    };

    match job.start(false, false).outcome().await {
        JobOutcome::Ready(cycle) => {
            println!("ready");
            println!("  worker_id:   {}", cycle.worker_id);
            println!("  request_key: {}", cycle.request_key);
            println!("  plan:        {} (sha256 {})", cycle.plan.id, cycle.plan.sha256);
            println!("  model:       {} ({} tensors)", cycle.model_id, cycle.model.len());
            println!(
                "  config:      batch_size={} lr={} max_updates={:?}",
                cycle.client_config.batch_size, cycle.client_config.learning_rate, cycle.client_config.max_updates
            );
        }
        JobOutcome::Rejected { timeout } => {
            println!("rejected, retry after {timeout:?}");
        }
        JobOutcome::Failed(e) => {
            eprintln!("error: {e}");
            std::process::exit(1);
        }
    }
}
