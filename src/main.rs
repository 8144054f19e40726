use clap::{CommandFactory, Parser};
use clap_complete::aot::generate;
use workspaced::cli::{Cli, Commands};
use workspaced::commands;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.global.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();

    let config_file = cli.global.config_file.as_deref();
    let result = match cli.command {
        Commands::Serve => commands::serve::run(config_file).await,
        Commands::Validate => commands::validate::run(config_file),
        Commands::ParseLog { ref file } => commands::parse_log::run(file),
        Commands::Completions { shell } => {
            generate(shell, &mut Cli::command(), "workspaced", &mut std::io::stdout());
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
