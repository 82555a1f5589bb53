use clap::{Parser, Subcommand};
use std::time::Duration;

// linking the task library is what populates the task registry
use workflows as _;

#[derive(Parser, Debug)]
#[command(name = "Tasker", author, version, about = "Durable task execution fabric")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run in server mode
    Server,
}

/// 1. start DB, run migrations
/// 2. start web ingress
/// 3. kick the queue so anything left pending across the restart drains
#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Server) => {
            println!("Starting in Server Mode");
        }
        None => {
            println!("Defaulting to Starting in Server Mode");
        }
    }

    let subscriber = tracing_subscriber::fmt::fmt().pretty();

    let subscriber = subscriber.with_max_level(config::settings().logging.max_level);

    if let Some(output_file) = config::settings().logging.log_file.clone() {
        let file = std::fs::File::create(&output_file).expect("couldn't open log file");
        let file = std::sync::Mutex::new(file);

        let subscriber = subscriber.with_writer(file).finish();

        tracing::subscriber::set_global_default(subscriber).expect("couldn't set up tracing");
    } else {
        let subscriber = subscriber.finish();

        tracing::subscriber::set_global_default(subscriber).expect("couldn't set up tracing");
    };

    tracing::info!("tracing has been started");

    // Run migrations
    let ih = tokio::spawn(async {
        match dal::initialize().await {
            Ok(_) => {}
            Err(e) => {
                for error in e {
                    tracing::error!("Init Error: {}, check logs for panic", error.to_string())
                }
            }
        }
    });

    let _ = ih.await;

    let registered = stacker::task_trait::collect_tasks().len();
    tracing::info!("{registered} tasks registered");

    let wh = tokio::spawn(async {
        tracing::info!("starting web ingress");
        gateway::entry().await;
        tracing::info!("web ingress exited");
    });

    // give the listener a moment, then kick the queue once; from here on
    // the cascade and inbound triggers keep things moving
    tokio::time::sleep(Duration::from_secs(1)).await;
    stacker::trigger::fire_process_next();

    let _ = wh.await;

    tracing::info!("Clean exit from web entry");
}
