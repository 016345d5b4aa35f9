mod handlers;

use clap::{CommandFactory, Parser};
use sandcore::{
    cli::{SandcoreArgs, SandcoreSubcommand},
    SandcoreResult,
};

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

#[tokio::main]
async fn main() -> SandcoreResult<()> {
    dotenvy::dotenv().ok();

    let args = SandcoreArgs::parse();
    let log_dir = match &args.subcommand {
        Some(SandcoreSubcommand::Serve { log_dir, .. }) => log_dir.clone(),
        _ => None,
    };
    let _guard = handlers::init_tracing(args.verbose, log_dir.as_deref())?;

    match args.subcommand {
        Some(SandcoreSubcommand::Serve {
            host, port, config, ..
        }) => {
            handlers::serve_subcommand(host, port, config).await?;
        }
        Some(SandcoreSubcommand::Fallback { config, action }) => {
            handlers::fallback_subcommand(config, action).await?;
        }
        Some(SandcoreSubcommand::StaticServe { port, bind, root }) => {
            handlers::static_serve_subcommand(port, bind, root).await?;
        }
        None => {
            SandcoreArgs::command().print_help()?;
        }
    }

    Ok(())
}
