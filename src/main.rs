use anyhow::Context;
use headless_capture::{
    capture_page, ArtifactWriter, CaptureConfig, CaptureError, CaptureOptions,
    DEFAULT_OUTPUT_DIR, USAGE,
};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match CaptureConfig::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(CaptureError::Usage(missing)) => {
            eprintln!("Error: missing {}", missing);
            eprintln!("{}", USAGE);
            std::process::exit(1);
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&config).await {
        log::error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

async fn run(config: &CaptureConfig) -> anyhow::Result<()> {
    log::info!("Capturing {}", config.target_url);

    let result = capture_page(config, &CaptureOptions::default())
        .await
        .with_context(|| format!("Failed to capture {}", config.target_url))?;

    let writer = ArtifactWriter::new(DEFAULT_OUTPUT_DIR);
    writer
        .write(&result, &config.file_prefix)
        .await
        .context("Failed to save artifacts")?;

    println!("Completed! Files saved to: {}", writer.dir().display());
    Ok(())
}
