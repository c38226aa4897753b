use clap::Parser;
use import_cli::{Args, run, setup_logging};
use miette::IntoDiagnostic;

fn main() -> miette::Result<()> {
    let args = Args::parse();
    setup_logging(&args)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .into_diagnostic()?;

    let error_count = runtime.block_on(run(args))?;

    if error_count > 0 {
        std::process::exit(1);
    }

    Ok(())
}
