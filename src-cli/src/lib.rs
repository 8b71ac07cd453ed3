pub mod cli;

use anyhow::Context;
use convertbox_core::{Config, Settings, Toolbox};

use cli::Command;

pub fn init_logging(directives: &[&str]) {
    let mut filter = tracing_subscriber::EnvFilter::from_default_env();
    for directive in directives {
        match directive.parse() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(e) => eprintln!("Ignoring log directive {:?}: {}", directive, e),
        }
    }
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

pub fn run(command: Command, verbose: bool) -> anyhow::Result<()> {
    if verbose {
        init_logging(&["convertbox=debug", "convertbox_core=debug"]);
    } else {
        init_logging(&["convertbox=info", "convertbox_core=info"]);
    }

    let rt = tokio::runtime::Runtime::new().context("Failed to create tokio runtime")?;
    rt.block_on(async {
        let config = Config::load_or_default();
        let settings = Settings::load(&config.settings_file);
        tracing::debug!(data_dir = ?config.data_dir, ?settings, "Loaded configuration");

        match command {
            Command::Inspect { files } => {
                let toolbox = Toolbox::native(&config, settings);
                cli::inspect(&toolbox, &files).await
            }
            Command::Hash { file } => {
                let toolbox = Toolbox::native(&config, settings);
                cli::hash(&toolbox, &file).await
            }
            Command::Convert { tool, file, job, out } => {
                let config = match out {
                    Some(out) => config.with_output_dir(out),
                    None => config,
                };
                config
                    .ensure_dirs()
                    .context("Failed to create data directories")?;
                let toolbox = Toolbox::native(&config, job.apply_overrides(settings));
                let saved = cli::convert(&toolbox, tool, &file, &job, &config.output_dir).await?;
                println!("{}", saved.display());
                Ok(())
            }
            Command::Engines { warm } => {
                let toolbox = Toolbox::native(&config, settings);
                cli::engines(&toolbox, warm).await
            }
        }
    })
}
