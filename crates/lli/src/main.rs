use anyhow::Context;
use clap::Parser;
use rtdyld::{
    EngineBuilder, EngineKind, EngineRegistry, ObjectBuffer, report_fatal_error,
    engine::{FileObjectCache, OptLevel},
    ir::parse_module,
};
use std::{path::PathBuf, sync::Arc};

/// Runs a program written in textual IR.
#[derive(Parser, Debug)]
#[command(name = "lli", version)]
struct Cli {
    /// IR file to execute.
    input: PathBuf,

    /// Arguments passed to the program.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Function to run instead of `main`.
    #[arg(long, default_value = "main")]
    entry_function: String,

    /// Interpret the IR even when a code generator is available.
    #[arg(long)]
    force_interpreter: bool,

    /// Optimization level.
    #[arg(short = 'O', default_value_t = 2, value_parser = clap::value_parser!(u8).range(0..=3))]
    opt_level: u8,

    /// Run JIT code from a separate copy of every section.
    #[arg(long)]
    remote_mapping: bool,

    /// Directory to cache compiled objects in.
    #[arg(long, value_name = "DIR")]
    object_cache: Option<PathBuf>,

    /// Precompiled object to load next to the program.
    #[arg(long = "extra-object", value_name = "PATH")]
    extra_objects: Vec<PathBuf>,

    /// Value passed as `argv[0]`.
    #[arg(long, value_name = "NAME")]
    fake_argv0: Option<String>,
}

fn run(cli: &Cli) -> anyhow::Result<i32> {
    let source = std::fs::read_to_string(&cli.input)
        .with_context(|| format!("cannot read {}", cli.input.display()))?;
    let id = cli
        .input
        .file_stem()
        .map_or_else(|| "module".into(), |stem| stem.to_string_lossy().into_owned());
    let module = parse_module(&source, &id)?;

    let mut builder = EngineBuilder::new(module)
        .with_opt_level(OptLevel::from_level(cli.opt_level).unwrap_or_default())
        .with_remote_mapping(cli.remote_mapping);
    if cli.force_interpreter {
        builder = builder.with_kind(EngineKind::Interpreter);
    }
    if let Some(dir) = &cli.object_cache {
        builder = builder.with_object_cache(Arc::new(FileObjectCache::new(dir)?));
    }
    let mut engine = builder.build(&EngineRegistry::with_defaults())?;
    if cli.remote_mapping && engine.kind() == EngineKind::Interpreter {
        log::warn!("--remote-mapping has no effect on the interpreter");
    }
    for path in &cli.extra_objects {
        let buffer = ObjectBuffer::from_path(path)
            .with_context(|| format!("cannot read {}", path.display()))?;
        engine.add_object_file(buffer)?;
    }

    let argv0 = cli
        .fake_argv0
        .clone()
        .unwrap_or_else(|| cli.input.display().to_string());
    let argv: Vec<&str> = std::iter::once(argv0.as_str())
        .chain(cli.args.iter().map(String::as_str))
        .collect();
    let env: Vec<String> = std::env::vars().map(|(k, v)| format!("{k}={v}")).collect();
    let envp: Vec<&str> = env.iter().map(String::as_str).collect();
    Ok(engine.run_function_as_main(&cli.entry_function, &argv, &envp)?)
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            if let Some(err) = err.downcast_ref::<rtdyld::Error>()
                && err.is_fatal()
            {
                report_fatal_error(err);
            }
            eprintln!("lli: {err:#}");
            std::process::exit(1);
        }
    }
}
