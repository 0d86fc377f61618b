mod cli;

use std::{
    io::{self, Read, Write},
    process::ExitCode,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use codebox::{
    config::Config,
    execution::{ExecutionManager, ExecutionRequest, OutputSinks, StderrPolicy},
    runtime::{python::PythonProvider, RuntimeLoader},
};
use is_terminal::IsTerminal;
use owo_colors::OwoColorize;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = cli::Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    let mut cfg = Config::load();
    log::debug!("config file: {}", cfg.config_path.display());
    if let Some(program) = &args.interpreter {
        cfg.set("CODEBOX_INTERPRETER", program.as_str());
    }
    if let Some(prelude) = &args.prelude {
        cfg.set("CODEBOX_PRELUDE", prelude.as_str());
    }

    let source = read_source(&args)?;

    let loader = Arc::new(RuntimeLoader::new(Arc::new(PythonProvider::from_config(&cfg))));
    let mut manager = ExecutionManager::from_config(Arc::clone(&loader), &cfg);
    if args.allow_stderr {
        manager = manager.with_stderr_policy(StderrPolicy::Ignore);
    }

    let mut request = ExecutionRequest::new(source);
    if let Some(timeout) = args.timeout() {
        request = request.with_timeout(timeout);
    }
    if !args.json {
        // Stream chunks as they arrive; the final result only decides the exit code.
        request = request.with_sinks(
            OutputSinks::new()
                .on_stdout(|chunk| {
                    print!("{}", chunk);
                    let _ = io::stdout().flush();
                })
                .on_stderr(|chunk| eprint!("{}", chunk.red())),
        );
    }

    let result = manager.run(request).await;
    loader.shutdown().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(err) = &result.error {
        // Interpreter errors were already streamed to stderr.
        if err.kind != codebox::ErrorKind::InterpreterError {
            eprintln!("{} {}", "error:".red().bold(), err);
        }
    }

    Ok(if result.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn read_source(args: &cli::Cli) -> Result<String> {
    if let Some(code) = &args.code {
        return Ok(code.clone());
    }
    if let Some(path) = &args.file {
        return std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path));
    }
    if io::stdin().is_terminal() {
        bail!("Provide a FILE, --code, or pipe source via stdin");
    }
    let mut buf = String::new();
    io::stdin().read_to_string(&mut buf)?;
    Ok(buf)
}
