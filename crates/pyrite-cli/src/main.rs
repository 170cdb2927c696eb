use std::io::Read as _;
use std::process::ExitCode;
use std::{env, fs, io};

use pyrite::{dump_tokens, NoopTracer, Runner, StdPrint, StderrTracer};

const USAGE: &str = "usage: pyrite [--dump-tokens] [--dump-ast] [--sema-only] [--trace] [file]";

struct Options {
    dump_tokens: bool,
    dump_ast: bool,
    sema_only: bool,
    trace: bool,
    file: Option<String>,
}

fn parse_args() -> Result<Options, String> {
    let mut options = Options {
        dump_tokens: false,
        dump_ast: false,
        sema_only: false,
        trace: false,
        file: None,
    };
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--dump-tokens" => options.dump_tokens = true,
            "--dump-ast" => options.dump_ast = true,
            "--sema-only" => options.sema_only = true,
            "--trace" => options.trace = true,
            "--help" | "-h" => return Err(USAGE.to_owned()),
            other if other.starts_with('-') => {
                return Err(format!("unknown flag '{other}'\n{USAGE}"));
            }
            other => {
                if options.file.is_some() {
                    return Err(format!("more than one input file\n{USAGE}"));
                }
                options.file = Some(other.to_owned());
            }
        }
    }
    Ok(options)
}

fn read_source(file: Option<&str>) -> Result<(String, String), String> {
    match file {
        Some(path) => {
            let code = fs::read_to_string(path).map_err(|err| format!("error reading {path}: {err}"))?;
            Ok((code, path.to_owned()))
        }
        None => {
            let mut code = String::new();
            io::stdin()
                .read_to_string(&mut code)
                .map_err(|err| format!("error reading stdin: {err}"))?;
            Ok((code, "<stdin>".to_owned()))
        }
    }
}

fn main() -> ExitCode {
    let options = match parse_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    let (code, path) = match read_source(options.file.as_deref()) {
        Ok(pair) => pair,
        Err(message) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
    };

    if options.dump_tokens {
        return match dump_tokens(&code, &path) {
            Ok(text) => {
                print!("{text}");
                ExitCode::SUCCESS
            }
            Err(diagnostics) => {
                eprintln!("{diagnostics}");
                ExitCode::FAILURE
            }
        };
    }

    if options.sema_only {
        let diagnostics = Runner::check(&code, &path);
        if diagnostics.is_empty() {
            return ExitCode::SUCCESS;
        }
        eprintln!("{diagnostics}");
        return ExitCode::FAILURE;
    }

    let runner = match Runner::new(code, &path) {
        Ok(runner) => runner,
        Err(diagnostics) => {
            eprintln!("{diagnostics}");
            return ExitCode::FAILURE;
        }
    };

    if options.dump_ast {
        print!("{}", runner.dump_ast());
        return ExitCode::SUCCESS;
    }

    let result = if options.trace {
        runner.run(&mut StdPrint, &mut StderrTracer::default())
    } else {
        runner.run(&mut StdPrint, &mut NoopTracer)
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(diagnostics) => {
            eprintln!("{diagnostics}");
            ExitCode::FAILURE
        }
    }
}
