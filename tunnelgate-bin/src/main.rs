use std::path::{Path, PathBuf};

use clap::Parser;
use tunnelgate::{TokioRuntime, print_and_exit};

#[derive(Parser)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser, value_name = "DIRECTORY")]
    directory: Option<PathBuf>,

    #[clap(
        short,
        long,
        value_parser,
        value_name = "FILE",
        default_value = "config.yaml"
    )]
    config: PathBuf,

    /// Also write logs to this file, relative to the directory unless absolute
    #[clap(short, long, value_parser, value_name = "FILE")]
    log_file: Option<String>,

    /// Only check the config file and exit
    #[clap(short, long, action)]
    test: bool,
}

fn main() {
    let cli = Cli::parse();
    let cwd = match &cli.directory {
        Some(dir) => dir.clone(),
        None => std::env::current_dir()
            .unwrap_or_else(|e| print_and_exit!("cannot read cwd: {}", e)),
    };
    let file = cwd.join(&cli.config).to_string_lossy().to_string();

    if !Path::new(&file).exists() {
        print_and_exit!("config file not found: {}", file);
    }

    if cli.test {
        match tunnelgate::Config::File(file.clone()).try_parse() {
            Ok(_) => {
                println!("configuration file {file} test is successful");
                return;
            }
            Err(e) => print_and_exit!("configuration file {} test failed: {}", file, e),
        }
    }

    if let Err(e) = tunnelgate::start_scaffold(tunnelgate::Options {
        config: tunnelgate::Config::File(file),
        cwd: Some(cwd.to_string_lossy().to_string()),
        rt: Some(TokioRuntime::MultiThread),
        log_file: cli.log_file,
    }) {
        print_and_exit!("tunnelgate exited with error: {}", e);
    }
}
