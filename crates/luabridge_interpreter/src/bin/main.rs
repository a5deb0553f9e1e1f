use std::env;
use std::fs;

use luabridge::{LuaArgs, LuaMachine, LuaNativeFunction, MachineOptions, args, blon};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!("lbr ", env!("CARGO_PKG_VERSION"));

fn print_usage() {
    eprintln!("usage: lbr [options] chunk [args]");
    eprintln!("Available options are:");
    eprintln!("  --memory BYTES     total memory budget");
    eprintln!("  --no-timeout       disable the instruction limits");
    eprintln!("  --allow-bytecode   accept binary chunks");
    eprintln!("  --config FILE      read machine options from a JSON file");
    eprintln!("  --save FILE        write the results to FILE as BLON");
    eprintln!("  -v                 show version information");
    eprintln!("  --                 stop handling options");
}

#[derive(Default)]
struct Options {
    memory: Option<usize>,
    no_timeout: bool,
    allow_bytecode: bool,
    config: Option<String>,
    save: Option<String>,
    show_version: bool,
    chunk: Option<String>,
    chunk_args: Vec<String>,
}

fn parse_args() -> Result<Options, String> {
    let args: Vec<String> = env::args().collect();
    let mut opts = Options::default();
    let mut i = 1;
    let mut stop_options = false;

    let value_of = |i: usize, flag: &str| -> Result<String, String> {
        args.get(i)
            .cloned()
            .ok_or_else(|| format!("'{}' needs argument", flag))
    };

    while i < args.len() {
        let arg = &args[i];
        if !stop_options && arg.starts_with('-') {
            match arg.as_str() {
                "--memory" => {
                    i += 1;
                    let bytes = value_of(i, arg)?;
                    let bytes = bytes
                        .parse()
                        .map_err(|_| format!("bad memory budget '{}'", bytes))?;
                    opts.memory = Some(bytes);
                }
                "--no-timeout" => opts.no_timeout = true,
                "--allow-bytecode" => opts.allow_bytecode = true,
                "--config" => {
                    i += 1;
                    opts.config = Some(value_of(i, arg)?);
                }
                "--save" => {
                    i += 1;
                    opts.save = Some(value_of(i, arg)?);
                }
                "-v" => opts.show_version = true,
                "--" => stop_options = true,
                _ => return Err(format!("unrecognized option '{}'", arg)),
            }
        } else {
            opts.chunk = Some(arg.clone());
            opts.chunk_args = args[i + 1..].to_vec();
            break;
        }
        i += 1;
    }
    Ok(opts)
}

fn machine_options(opts: &Options) -> Result<MachineOptions, String> {
    let mut options = match &opts.config {
        Some(path) => {
            let text = fs::read_to_string(path).map_err(|e| format!("cannot open {}: {}", path, e))?;
            serde_json::from_str(&text).map_err(|e| format!("{}: {}", path, e))?
        }
        None => MachineOptions::default(),
    };
    if let Some(bytes) = opts.memory {
        options = options.with_memory_budget(bytes);
    }
    if opts.no_timeout {
        options = options.with_time_limits(false);
    }
    if opts.allow_bytecode {
        options = options.with_bytecode_loading(true);
    }
    Ok(options)
}

fn print_function() -> LuaNativeFunction {
    LuaNativeFunction::wrap(|args: LuaArgs| {
        let line: Vec<String> = args.iter().map(|v| v.to_string()).collect();
        println!("{}", line.join("\t"));
        Ok(args![])
    })
}

fn run(opts: &Options, filename: &str) -> Result<(), String> {
    let options = machine_options(opts)?;
    debug!(
        budget = options.total_memory_budget,
        time_limits = options.enforce_time_limits,
        "machine options"
    );
    let mut machine = LuaMachine::new(options).map_err(|e| e.to_string())?;
    machine
        .register_function("print", print_function())
        .map_err(|e| e.to_string())?;

    let source = fs::read(filename).map_err(|e| format!("cannot open {}: {}", filename, e))?;
    let chunk = machine
        .load(&source, &format!("@{}", filename))
        .map_err(|e| e.to_string())?;
    let chunk_args: LuaArgs = opts.chunk_args.iter().map(|a| a.as_str().into()).collect();
    let results = machine.call(chunk, chunk_args).map_err(|e| e.to_string())?;

    for value in &results {
        println!("{}", value);
    }
    if let Some(path) = &opts.save {
        let bytes = blon::encode_args(&results).map_err(|e| e.to_string())?;
        fs::write(path, &bytes).map_err(|e| format!("cannot write {}: {}", path, e))?;
        info!(path = path.as_str(), bytes = bytes.len(), "saved results");
    }
    info!(
        memory = machine.memory_used(),
        instructions = machine.governor().timeout().total_instructions(),
        "finished"
    );
    machine.close().map_err(|e| e.to_string())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let opts = match parse_args() {
        Ok(opts) => opts,
        Err(e) => {
            eprintln!("lbr: {}", e);
            print_usage();
            std::process::exit(1);
        }
    };
    if opts.show_version {
        println!("{}", VERSION);
        if opts.chunk.is_none() {
            return;
        }
    }
    let Some(filename) = opts.chunk.as_deref() else {
        print_usage();
        std::process::exit(1);
    };
    if let Err(e) = run(&opts, filename) {
        eprintln!("lbr: {}", e);
        std::process::exit(1);
    }
}
