mod cli;
mod commands;
mod config;
mod env_loader;
mod error;
mod external;
mod ingest;
mod logging;
mod paths;

fn main() {
    env_loader::load_dotenv();

    match cli::run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}
