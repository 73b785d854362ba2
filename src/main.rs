use clap::Parser;
use log::{error, info};
use std::path::Path;
use std::process::ExitCode;

use autococo::{run, Args};

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    if !Path::new(&args.img_folder).exists() {
        error!("The specified img_folder does not exist: {}", args.img_folder);
        return ExitCode::FAILURE;
    }

    info!("Starting the annotation process...");

    match run(&args) {
        Ok(summary) => {
            if let Some(path) = summary.coco_path {
                info!("Annotations ready for import: {}", path.display());
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Failed to annotate images: {}", e);
            ExitCode::FAILURE
        }
    }
}
