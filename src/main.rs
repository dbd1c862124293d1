use clap::Parser;
use std::process::ExitCode;

use slash::Context;

mod cli;
mod commands;
mod doctor;

use cli::{Cli, Command};

fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Some(mode) = cli.color {
        slash::set_color_mode(mode);
    }
    slash::logging::init(cli.verbose, slash::color_enabled_stderr());

    let ctx = match Context::from_env() {
        Ok(ctx) => ctx,
        Err(e) => {
            slash::log_error_stderr(slash::color_enabled_stderr(), &format!("slash: {e}"));
            return ExitCode::from(slash::exit_code_for_error(&e));
        }
    };

    let result = match &cli.command {
        Command::Launch { env, job } => commands::run_launch(&ctx, env, job.clone()),
        Command::Stop { env, job } => commands::run_stop(&ctx, env, job),
        Command::Status { json } => commands::run_status(&ctx, *json),
        Command::Run { env, cmd } => commands::run_run(&ctx, env, cmd),
        Command::Env { cmd } => commands::run_env(&ctx, cmd),
        Command::Reaper { cmd } => commands::run_reaper(&ctx, cmd),
        Command::Doctor => {
            doctor::run_doctor(&ctx, cli.verbose);
            Ok(ExitCode::SUCCESS)
        }
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            slash::log_error_stderr(slash::color_enabled_stderr(), &format!("slash: {e}"));
            ExitCode::from(slash::exit_code_for_error(&e))
        }
    }
}
